//! Resilience utilities: bounded exponential backoff with jitter and predicate-driven retry.
use std::time::{Duration, Instant};

use futures::Future;
use once_cell::sync::Lazy;
use opentelemetry::{global, metrics::Counter};
use rand::{thread_rng, Rng};
use tracing::debug;

static RETRY_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("arca-resilience")
        .u64_counter("arca_resilience_retry_attempts_total")
        .with_description("Total retry attempts executed after a failed call")
        .build()
});

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_retries: 3, base_delay: Duration::from_millis(50), max_delay: Duration::from_secs(1), jitter: 0.25 } }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff { Backoff::new(self.base_delay, self.max_delay, self.jitter) }
}

/// Capped exponential delay sequence. Each call to [`Backoff::next_delay`] doubles the
/// nominal delay up to `cap` and perturbs it by `±jitter` of its own size.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self { base, cap: cap.max(base), jitter: jitter.clamp(0.0, 1.0), attempt: 0 }
    }

    pub fn attempt(&self) -> u32 { self.attempt }

    pub fn reset(&mut self) { self.attempt = 0; }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.mul_f64(2f64.powi(self.attempt.min(30) as i32));
        self.attempt = self.attempt.saturating_add(1);
        let delay = exp.min(self.cap);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        let ms = (delay.as_millis() as i64 + offset).max(0) as u64;
        Duration::from_millis(ms).min(self.cap)
    }

    /// Next delay clipped so that sleeping it never passes `deadline`.
    /// `None` once the deadline has been reached.
    pub fn next_delay_until(&mut self, deadline: Instant) -> Option<Duration> {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() { return None; }
        Some(self.next_delay().min(remaining))
    }
}

/// Retries every failure up to `cfg.max_retries` times.
pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(cfg, op, |_| true).await
}

/// Retries only the failures accepted by `should_retry`; everything else returns at once.
pub async fn retry_if<F, Fut, T, E, P>(cfg: &RetryConfig, mut op: F, should_retry: P) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut backoff = cfg.backoff();
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries || !should_retry(&e) => return Err(e),
            Err(_) => {
                let delay = backoff.next_delay();
                RETRY_ATTEMPTS.add(1, &[]);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
