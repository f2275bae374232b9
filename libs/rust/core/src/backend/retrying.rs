//! Retries transient backend failures with bounded backoff before surfacing them.

use std::sync::Arc;

use arca_resilience::{retry_if, RetryConfig};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::warn;

use super::{Backend, ContentMetadata, KeyLayout, PutOutcome, StoredObject, VersionTag};
use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    policy: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, policy: RetryConfig) -> Self { Self { inner, policy } }

    pub fn inner(&self) -> &Arc<dyn Backend> { &self.inner }
}

fn transient(e: &BackendError) -> bool {
    if e.is_transient() { warn!(key = e.key(), error = %e, "transient backend failure"); }
    e.is_transient()
}

#[async_trait]
impl Backend for RetryingBackend {
    fn kind(&self) -> &'static str { self.inner.kind() }

    fn layout(&self) -> KeyLayout { self.inner.layout() }

    async fn put(&self, key: &str, bytes: Bytes, content: ContentMetadata) -> Result<VersionTag, BackendError> {
        retry_if(&self.policy, |_| self.inner.put(key, bytes.clone(), content.clone()), transient).await
    }

    // A retried conditional write whose first attempt actually landed reports
    // AlreadyExists/VersionMismatch; callers compare what is stored to recognise their own write.
    async fn put_if_absent(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, BackendError> {
        retry_if(&self.policy, |_| self.inner.put_if_absent(key, bytes.clone()), transient).await
    }

    async fn put_if_version_matches(&self, key: &str, bytes: Bytes, expected: &VersionTag) -> Result<PutOutcome, BackendError> {
        retry_if(&self.policy, |_| self.inner.put_if_version_matches(key, bytes.clone(), expected), transient).await
    }

    async fn get(&self, key: &str) -> Result<StoredObject, BackendError> {
        retry_if(&self.policy, |_| self.inner.get(key), transient).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        retry_if(&self.policy, |_| self.inner.exists(key), transient).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        retry_if(&self.policy, |_| self.inner.delete(key), transient).await
    }

    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, BackendError>> {
        // Pages are fetched lazily by the inner stream; a failed page ends the listing and the
        // caller restarts it.
        self.inner.list_keys(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::stream;

    #[derive(Debug, Default)]
    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl Backend for Flaky {
        fn kind(&self) -> &'static str { "flaky" }
        fn layout(&self) -> KeyLayout { KeyLayout::ObjectStore }
        async fn put(&self, key: &str, _b: Bytes, _c: ContentMetadata) -> Result<VersionTag, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first { Err(BackendError::unavailable(key, "503")) } else { Ok(VersionTag::etag("e")) }
        }
        async fn put_if_absent(&self, _k: &str, _b: Bytes) -> Result<PutOutcome, BackendError> { Ok(PutOutcome::AlreadyExists) }
        async fn put_if_version_matches(&self, _k: &str, _b: Bytes, _e: &VersionTag) -> Result<PutOutcome, BackendError> { Ok(PutOutcome::VersionMismatch) }
        async fn get(&self, key: &str) -> Result<StoredObject, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::not_found(key))
        }
        async fn delete(&self, _k: &str) -> Result<(), BackendError> { Ok(()) }
        fn list_keys<'a>(&'a self, _p: &'a str) -> BoxStream<'a, Result<String, BackendError>> { Box::pin(stream::empty()) }
    }

    fn policy() -> RetryConfig { RetryConfig { max_retries: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), jitter: 0.0 } }

    #[tokio::test]
    async fn retries_unavailable_until_success() {
        let flaky = Arc::new(Flaky { fail_first: 2, ..Default::default() });
        let b = RetryingBackend::new(flaky.clone(), policy());
        b.put("k", Bytes::new(), ContentMetadata::default()).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_after_retry_budget() {
        let flaky = Arc::new(Flaky { fail_first: 10, ..Default::default() });
        let b = RetryingBackend::new(flaky.clone(), policy());
        assert!(b.put("k", Bytes::new(), ContentMetadata::default()).await.unwrap_err().is_transient());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let flaky = Arc::new(Flaky::default());
        let b = RetryingBackend::new(flaky.clone(), policy());
        assert!(b.get("k").await.unwrap_err().is_not_found());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }
}
