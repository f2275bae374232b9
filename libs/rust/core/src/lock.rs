//! Leased, fenced mutual exclusion on an object name, built on a backend's conditional writes.
//!
//! Per name: `UNLOCKED -> ACQUIRING -> HELD -> (RENEWING -> HELD)* -> RELEASING -> UNLOCKED`,
//! with `HELD -> EXPIRED` once the lease passes unrenewed. An expired token is stolen with
//! `put_if_version_matches` against the tag it was read with, so at most one contender wins
//! and the worst-case wait after a crashed holder is one lease.
//!
//! Fencing tokens grow by one on every acquisition. Release rewrites the token as expired
//! instead of deleting it, which keeps the counter alive for the next holder. The token also
//! carries the highest object version ever assigned under the name, which outlives a removed
//! catalog.
//!
//! A conditional write whose reply was lost and then retried reports a mismatch against our
//! own token; every such mismatch is confirmed by re-reading the token before giving up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arca_resilience::Backoff;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, PutOutcome, VersionTag};
use crate::error::{BackendError, LockError};
use crate::metrics::LOCK_METRICS;

#[derive(Debug, Clone, PartialEq)]
pub struct LockConfig {
    pub lease: Duration,
    pub max_wait: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub jitter: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            max_wait: Duration::from_secs(60),
            backoff_base: Duration::from_millis(25),
            backoff_cap: Duration::from_secs(2),
            jitter: 0.25,
        }
    }
}

/// Persisted lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockToken {
    pub owner_id: String,
    /// Unique per acquisition; lets a holder recognise its own write after a retried create.
    pub acquisition_id: String,
    pub fencing_token: u64,
    pub lease_expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub high_water_version: u64,
}

impl LockToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool { self.lease_expires_at <= now }

    fn encode(&self) -> Result<Bytes, BackendError> {
        serde_json::to_vec(self).map(Bytes::from).map_err(|e| BackendError::unavailable("lock", e))
    }
}

/// Proof of holding a name's lock. Carries the backend tag of the token last written so
/// renewals and release are conditional on nobody having touched it since.
#[derive(Debug, Clone)]
pub struct LockHandle {
    name: String,
    key: String,
    token: LockToken,
    tag: VersionTag,
}

impl LockHandle {
    pub fn name(&self) -> &str { &self.name }
    pub fn fencing_token(&self) -> u64 { self.token.fencing_token }
    pub fn expires_at(&self) -> DateTime<Utc> { self.token.lease_expires_at }
    pub fn token(&self) -> &LockToken { &self.token }
    /// Highest version recorded under this name by earlier holders.
    pub fn high_water_version(&self) -> u64 { self.token.high_water_version }
}

/// Result of a single acquisition attempt.
#[derive(Debug)]
enum Attempt {
    Acquired(LockHandle),
    /// A live lease is held by someone else.
    Held { holder: String, expires_at: DateTime<Utc> },
    /// Another contender changed the token between our read and our write.
    LostRace,
    /// The token disappeared between the failed create and the read; try again at once.
    Vanished,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    backend: Arc<dyn Backend>,
    owner_id: String,
    config: LockConfig,
}

impl LockManager {
    pub fn new(backend: Arc<dyn Backend>, config: LockConfig) -> Self {
        let owner_id = format!("{}-{}", std::process::id(), Uuid::new_v4().simple());
        Self { backend, owner_id, config }
    }

    pub fn owner_id(&self) -> &str { &self.owner_id }

    pub fn config(&self) -> &LockConfig { &self.config }

    fn key(&self, name: &str) -> String { self.backend.layout().lock_key(name) }

    fn lease_from_now(lease: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// Acquires `name` with the configured lease and wait budget.
    pub async fn acquire(&self, name: &str) -> Result<LockHandle, LockError> {
        self.acquire_with(name, self.config.lease, self.config.max_wait).await
    }

    pub async fn acquire_with(&self, name: &str, lease: Duration, max_wait: Duration) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_cap, self.config.jitter);
        loop {
            match self.attempt(name, lease).await? {
                Attempt::Acquired(handle) => {
                    LOCK_METRICS.acquired_total.add(1, &[]);
                    debug!(name, fencing = handle.fencing_token(), waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                    return Ok(handle);
                }
                Attempt::Vanished => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Timeout { name: name.to_string(), waited: started.elapsed() });
                    }
                    continue;
                }
                Attempt::Held { holder, expires_at } => {
                    LOCK_METRICS.contended_total.add(1, &[]);
                    debug!(name, %holder, %expires_at, "lock held elsewhere");
                }
                Attempt::LostRace => {
                    LOCK_METRICS.contended_total.add(1, &[]);
                    debug!(name, "lost race for lock");
                }
            }
            let Some(delay) = backoff.next_delay_until(deadline) else {
                return Err(LockError::Timeout { name: name.to_string(), waited: started.elapsed() });
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, name: &str, lease: Duration) -> Result<Attempt, LockError> {
        let key = self.key(name);
        let mut token = LockToken {
            owner_id: self.owner_id.clone(),
            acquisition_id: Uuid::new_v4().to_string(),
            fencing_token: 1,
            lease_expires_at: Self::lease_from_now(lease),
            released_at: None,
            high_water_version: 0,
        };
        match self.backend.put_if_absent(&key, token.encode()?).await? {
            PutOutcome::Written(tag) => return Ok(Attempt::Acquired(LockHandle { name: name.to_string(), key, token, tag })),
            PutOutcome::AlreadyExists | PutOutcome::VersionMismatch => {}
        }

        let stored = match self.backend.get(&key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return Ok(Attempt::Vanished),
            Err(e) => return Err(e.into()),
        };
        let current: LockToken = serde_json::from_slice(&stored.bytes)
            .map_err(|e| LockError::CorruptToken { key: key.clone(), message: e.to_string() })?;

        if current.acquisition_id == token.acquisition_id {
            // our own create landed on an earlier, retried request
            return Ok(Attempt::Acquired(LockHandle { name: name.to_string(), key, token: current, tag: stored.tag }));
        }
        if !current.is_expired(Utc::now()) {
            return Ok(Attempt::Held { holder: current.owner_id, expires_at: current.lease_expires_at });
        }

        token.fencing_token = current.fencing_token + 1;
        token.high_water_version = current.high_water_version;
        token.lease_expires_at = Self::lease_from_now(lease);
        let tag = match self.backend.put_if_version_matches(&key, token.encode()?, &stored.tag).await? {
            PutOutcome::Written(tag) => tag,
            PutOutcome::AlreadyExists | PutOutcome::VersionMismatch => match self.confirm(&key, &token).await? {
                Some(tag) => tag,
                None => return Ok(Attempt::LostRace),
            },
        };
        if current.released_at.is_none() {
            LOCK_METRICS.stolen_total.add(1, &[]);
            warn!(name, previous_owner = %current.owner_id, previous_fencing = current.fencing_token, fencing = token.fencing_token, "stole expired lease");
        }
        Ok(Attempt::Acquired(LockHandle { name: name.to_string(), key, token, tag }))
    }

    /// Tag of the stored token if it is exactly `expected`, i.e. our own write landed.
    async fn confirm(&self, key: &str, expected: &LockToken) -> Result<Option<VersionTag>, LockError> {
        let stored = match self.backend.get(key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let current: LockToken = serde_json::from_slice(&stored.bytes)
            .map_err(|e| LockError::CorruptToken { key: key.to_string(), message: e.to_string() })?;
        Ok((current == *expected).then_some(stored.tag))
    }

    /// Conditionally replaces the handle's token with `token`.
    async fn rewrite(&self, handle: &mut LockHandle, token: LockToken) -> Result<(), LockError> {
        let tag = match self.backend.put_if_version_matches(&handle.key, token.encode()?, &handle.tag).await? {
            PutOutcome::Written(tag) => tag,
            PutOutcome::AlreadyExists | PutOutcome::VersionMismatch => match self.confirm(&handle.key, &token).await? {
                Some(tag) => tag,
                None => {
                    warn!(name = %handle.name, fencing = handle.token.fencing_token, "lock lost before rewrite");
                    return Err(LockError::Lost { name: handle.name.clone(), fencing: handle.token.fencing_token });
                }
            },
        };
        handle.token = token;
        handle.tag = tag;
        Ok(())
    }

    /// Extends the lease. Fails with [`LockError::Lost`] if the token changed underneath, in
    /// which case the caller must abandon its write.
    pub async fn renew(&self, handle: &mut LockHandle) -> Result<(), LockError> {
        self.renew_for(handle, self.config.lease).await
    }

    pub async fn renew_for(&self, handle: &mut LockHandle, lease: Duration) -> Result<(), LockError> {
        let mut token = handle.token.clone();
        token.lease_expires_at = Self::lease_from_now(lease);
        self.rewrite(handle, token).await?;
        debug!(name = %handle.name, fencing = handle.token.fencing_token, "lease renewed");
        Ok(())
    }

    /// Raises the token's high-water version to at least `version` and renews the lease.
    pub async fn record_high_water(&self, handle: &mut LockHandle, version: u64) -> Result<(), LockError> {
        let mut token = handle.token.clone();
        token.high_water_version = token.high_water_version.max(version);
        token.lease_expires_at = Self::lease_from_now(self.config.lease);
        self.rewrite(handle, token).await?;
        debug!(name = %handle.name, high_water = handle.token.high_water_version, "high-water version recorded");
        Ok(())
    }

    /// Best-effort release: marks the lease expired if this handle still owns it. Never fails;
    /// a missed release costs at most one lease of waiting.
    pub async fn release(&self, handle: LockHandle) {
        let now = Utc::now();
        let token = LockToken { lease_expires_at: now, released_at: Some(now), ..handle.token.clone() };
        let bytes = match token.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(name = %handle.name, error = %e, "could not encode released lock token");
                return;
            }
        };
        match self.backend.put_if_version_matches(&handle.key, bytes, &handle.tag).await {
            Ok(PutOutcome::Written(_)) => debug!(name = %handle.name, fencing = handle.token.fencing_token, "lock released"),
            Ok(_) => info!(name = %handle.name, fencing = handle.token.fencing_token, "lock already taken over; nothing to release"),
            Err(e) => warn!(name = %handle.name, error = %e, "lock release failed; lease will expire"),
        }
    }

    /// Reads the current token for `name`, if any.
    pub async fn inspect(&self, name: &str) -> Result<Option<LockToken>, LockError> {
        let key = self.key(name);
        match self.backend.get(&key).await {
            Ok(obj) => serde_json::from_slice(&obj.bytes)
                .map(Some)
                .map_err(|e| LockError::CorruptToken { key, message: e.to_string() }),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ObjectStoreBackend;
    use object_store::memory::InMemory;

    fn backend() -> Arc<dyn Backend> { Arc::new(ObjectStoreBackend::new(Arc::new(InMemory::new()), "memory")) }

    fn fast() -> LockConfig {
        LockConfig { lease: Duration::from_secs(5), max_wait: Duration::from_millis(200), backoff_base: Duration::from_millis(5), backoff_cap: Duration::from_millis(20), jitter: 0.0 }
    }

    #[tokio::test]
    async fn second_acquirer_times_out_while_held() {
        let b = backend();
        let a = LockManager::new(b.clone(), fast());
        let c = LockManager::new(b, fast());
        let h = a.acquire("m").await.unwrap();
        assert_eq!(h.fencing_token(), 1);
        let err = c.acquire("m").await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn release_then_reacquire_bumps_fencing() {
        let b = backend();
        let a = LockManager::new(b.clone(), fast());
        let c = LockManager::new(b, fast());
        let h = a.acquire("m").await.unwrap();
        a.release(h).await;
        let h2 = c.acquire("m").await.unwrap();
        assert_eq!(h2.fencing_token(), 2);
    }

    #[tokio::test]
    async fn expired_lease_is_stolen() {
        let b = backend();
        let a = LockManager::new(b.clone(), fast());
        let c = LockManager::new(b, fast());
        let crashed = a.acquire_with("m", Duration::from_millis(50), Duration::from_millis(100)).await.unwrap();
        let started = Instant::now();
        let stolen = c.acquire_with("m", Duration::from_secs(5), Duration::from_secs(2)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50) + Duration::from_millis(500));
        assert!(stolen.fencing_token() > crashed.fencing_token());
    }

    #[tokio::test]
    async fn renew_detects_theft() {
        let b = backend();
        let a = LockManager::new(b.clone(), fast());
        let c = LockManager::new(b, fast());
        let mut stale = a.acquire_with("m", Duration::from_millis(20), Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _thief = c.acquire("m").await.unwrap();
        assert!(matches!(a.renew(&mut stale).await, Err(LockError::Lost { fencing: 1, .. })));
    }

    #[tokio::test]
    async fn renew_extends_lease() {
        let b = backend();
        let a = LockManager::new(b, fast());
        let mut h = a.acquire_with("m", Duration::from_millis(100), Duration::from_millis(100)).await.unwrap();
        let before = h.expires_at();
        a.renew(&mut h).await.unwrap();
        assert!(h.expires_at() > before);
        assert_eq!(h.fencing_token(), 1);
        a.renew(&mut h).await.unwrap();
    }

    #[tokio::test]
    async fn stale_release_does_not_free_new_holder() {
        let b = backend();
        let a = LockManager::new(b.clone(), fast());
        let c = LockManager::new(b, fast());
        let stale = a.acquire_with("m", Duration::from_millis(20), Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let current = c.acquire("m").await.unwrap();
        a.release(stale).await;
        let token = c.inspect("m").await.unwrap().unwrap();
        assert_eq!(token.fencing_token, current.fencing_token());
        assert!(token.released_at.is_none());
    }

    /// Reports every create as taken while the token can never be read back.
    #[derive(Debug)]
    struct Phantom;

    #[async_trait::async_trait]
    impl Backend for Phantom {
        fn kind(&self) -> &'static str { "phantom" }
        fn layout(&self) -> crate::backend::KeyLayout { crate::backend::KeyLayout::ObjectStore }
        async fn put(&self, key: &str, _b: Bytes, _c: crate::backend::ContentMetadata) -> Result<VersionTag, BackendError> {
            Err(BackendError::unavailable(key, "read-only"))
        }
        async fn put_if_absent(&self, _k: &str, _b: Bytes) -> Result<PutOutcome, BackendError> { Ok(PutOutcome::AlreadyExists) }
        async fn put_if_version_matches(&self, _k: &str, _b: Bytes, _e: &VersionTag) -> Result<PutOutcome, BackendError> {
            Ok(PutOutcome::VersionMismatch)
        }
        async fn get(&self, key: &str) -> Result<crate::backend::StoredObject, BackendError> { Err(BackendError::not_found(key)) }
        async fn delete(&self, key: &str) -> Result<(), BackendError> { Err(BackendError::not_found(key)) }
        fn list_keys<'a>(&'a self, _p: &'a str) -> futures::stream::BoxStream<'a, Result<String, BackendError>> {
            Box::pin(futures::stream::empty())
        }
    }

    #[tokio::test]
    async fn vanishing_token_still_honours_the_wait_budget() {
        let m = LockManager::new(Arc::new(Phantom), fast());
        let started = Instant::now();
        let err = m.acquire_with("m", Duration::from_secs(5), Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn high_water_version_survives_release_and_theft() {
        let b = backend();
        let a = LockManager::new(b.clone(), fast());
        let c = LockManager::new(b, fast());
        let mut h = a.acquire("m").await.unwrap();
        assert_eq!(h.high_water_version(), 0);
        a.record_high_water(&mut h, 7).await.unwrap();
        a.record_high_water(&mut h, 3).await.unwrap();
        assert_eq!(h.high_water_version(), 7);
        a.release(h).await;

        let h2 = c.acquire_with("m", Duration::from_millis(20), Duration::from_millis(100)).await.unwrap();
        assert_eq!(h2.high_water_version(), 7);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stolen = a.acquire("m").await.unwrap();
        assert_eq!(stolen.fencing_token(), 3);
        assert_eq!(stolen.high_water_version(), 7);
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let b = backend();
        let a = LockManager::new(b, fast());
        let _h1 = a.acquire("m1").await.unwrap();
        let _h2 = a.acquire("m2").await.unwrap();
        assert!(a.inspect("m3").await.unwrap().is_none());
    }
}
