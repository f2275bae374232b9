//! Google Cloud Storage blobs. Conditional writes use generation preconditions
//! (`ifGenerationMatch=0` for create, the stored generation for update).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::{ClientOptions, ObjectStore};
use tracing::debug;

use super::{Backend, ContentMetadata, KeyLayout, ObjectStoreBackend, PutOutcome, StoredObject, VersionTag};
use crate::config::CloudBlobConfig;
use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct CloudBlobBackend {
    project_id: Option<String>,
    bucket: String,
    inner: ObjectStoreBackend,
}

impl CloudBlobBackend {
    pub fn new(cfg: &CloudBlobConfig) -> Result<Self, BackendError> {
        if cfg.bucket.trim().is_empty() {
            return Err(BackendError::InvalidKey { key: String::new(), reason: "cloud blob backend requires a bucket name".into() });
        }
        let mut builder = GoogleCloudStorageBuilder::new()
            .with_bucket_name(&cfg.bucket)
            .with_client_options(ClientOptions::new().with_timeout(cfg.request_timeout()));
        if let Some(path) = &cfg.credentials_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }
        let store = builder.build().map_err(|e| BackendError::unavailable(&cfg.bucket, format!("GCS: {e}")))?;
        debug!(bucket = %cfg.bucket, project = ?cfg.project_id, "cloud blob backend configured");
        Ok(Self::with_store(Arc::new(store), cfg.project_id.clone(), cfg.bucket.clone()))
    }

    pub(crate) fn with_store(store: Arc<dyn ObjectStore>, project_id: Option<String>, bucket: String) -> Self {
        Self { project_id, bucket, inner: ObjectStoreBackend::new(store, "cloud_blob") }
    }

    pub fn bucket(&self) -> &str { &self.bucket }

    pub fn project_id(&self) -> Option<&str> { self.project_id.as_deref() }
}

#[async_trait]
impl Backend for CloudBlobBackend {
    fn kind(&self) -> &'static str { "cloud_blob" }
    fn layout(&self) -> KeyLayout { KeyLayout::ObjectStore }
    async fn put(&self, key: &str, bytes: Bytes, content: ContentMetadata) -> Result<VersionTag, BackendError> { self.inner.put(key, bytes, content).await }
    async fn put_if_absent(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, BackendError> { self.inner.put_if_absent(key, bytes).await }
    async fn put_if_version_matches(&self, key: &str, bytes: Bytes, expected: &VersionTag) -> Result<PutOutcome, BackendError> {
        // GCS preconditions are generation-based; an etag alone cannot be enforced.
        if expected.generation.is_none() {
            return Ok(PutOutcome::VersionMismatch);
        }
        self.inner.put_if_version_matches(key, bytes, expected).await
    }
    async fn get(&self, key: &str) -> Result<StoredObject, BackendError> { self.inner.get(key).await }
    async fn exists(&self, key: &str) -> Result<bool, BackendError> { self.inner.exists(key).await }
    async fn delete(&self, key: &str) -> Result<(), BackendError> { self.inner.delete(key).await }
    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, BackendError>> { self.inner.list_keys(prefix) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[test]
    fn requires_bucket() {
        let cfg = CloudBlobConfig { project_id: Some("p".into()), bucket: String::new(), credentials_path: None, request_timeout_secs: 5 };
        assert!(CloudBlobBackend::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn etag_only_update_is_a_mismatch() {
        let b = CloudBlobBackend::with_store(Arc::new(InMemory::new()), Some("p".into()), "b".into());
        assert_eq!(b.project_id(), Some("p"));
        assert_eq!(b.bucket(), "b");
        let tag = b.put_if_absent("m/.lock", Bytes::from_static(b"1")).await.unwrap().tag().unwrap();
        assert!(tag.generation.is_none());
        // the store itself would accept this etag; the generation requirement refuses it
        let out = b.put_if_version_matches("m/.lock", Bytes::from_static(b"2"), &tag).await.unwrap();
        assert_eq!(out, PutOutcome::VersionMismatch);
        assert_eq!(&b.get("m/.lock").await.unwrap().bytes[..], b"1");
        let direct = b.inner.put_if_version_matches("m/.lock", Bytes::from_static(b"3"), &tag).await.unwrap();
        assert!(matches!(direct, PutOutcome::Written(_)));
    }
}
