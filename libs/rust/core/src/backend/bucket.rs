//! S3-compatible bucket storage. Conditional writes use ETag preconditions
//! (`If-None-Match: *` for create, `If-Match` for update).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::ClientOptions;
use tracing::debug;

use super::{Backend, ContentMetadata, KeyLayout, ObjectStoreBackend, PutOutcome, StoredObject, VersionTag};
use crate::config::BucketConfig;
use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct BucketBackend {
    bucket: String,
    inner: ObjectStoreBackend,
}

impl BucketBackend {
    pub fn new(cfg: &BucketConfig) -> Result<Self, BackendError> {
        if cfg.bucket.trim().is_empty() {
            return Err(BackendError::InvalidKey { key: String::new(), reason: "bucket backend requires a bucket name".into() });
        }
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&cfg.bucket)
            .with_region(cfg.region.as_deref().unwrap_or("us-east-1"))
            .with_conditional_put(S3ConditionalPut::ETagMatch)
            .with_client_options(ClientOptions::new().with_timeout(cfg.request_timeout()));

        if let Some(endpoint) = &cfg.endpoint {
            builder = builder
                .with_endpoint(endpoint_url(endpoint, cfg.use_tls))
                // path-style requests for MinIO and friends
                .with_virtual_hosted_style_request(false);
        }
        if !cfg.use_tls {
            builder = builder.with_allow_http(true);
        }
        if let Some(ak) = &cfg.access_key {
            builder = builder.with_access_key_id(ak);
        }
        if let Some(sk) = &cfg.secret_key {
            builder = builder.with_secret_access_key(sk);
        }

        let store = builder.build().map_err(|e| BackendError::unavailable(&cfg.bucket, format!("S3: {e}")))?;
        debug!(bucket = %cfg.bucket, endpoint = ?cfg.endpoint, "bucket backend configured");
        Ok(Self { bucket: cfg.bucket.clone(), inner: ObjectStoreBackend::new(Arc::new(store), "bucket") })
    }

    pub fn bucket(&self) -> &str { &self.bucket }
}

/// Adds a scheme to bare `host:port` endpoints.
fn endpoint_url(endpoint: &str, use_tls: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("{}://{}", if use_tls { "https" } else { "http" }, endpoint)
    }
}

#[async_trait]
impl Backend for BucketBackend {
    fn kind(&self) -> &'static str { "bucket" }
    fn layout(&self) -> KeyLayout { KeyLayout::ObjectStore }
    async fn put(&self, key: &str, bytes: Bytes, content: ContentMetadata) -> Result<VersionTag, BackendError> { self.inner.put(key, bytes, content).await }
    async fn put_if_absent(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, BackendError> { self.inner.put_if_absent(key, bytes).await }
    async fn put_if_version_matches(&self, key: &str, bytes: Bytes, expected: &VersionTag) -> Result<PutOutcome, BackendError> {
        // S3 preconditions are ETag-only.
        let expected = VersionTag { etag: expected.etag.clone(), generation: None };
        self.inner.put_if_version_matches(key, bytes, &expected).await
    }
    async fn get(&self, key: &str) -> Result<StoredObject, BackendError> { self.inner.get(key).await }
    async fn exists(&self, key: &str) -> Result<bool, BackendError> { self.inner.exists(key).await }
    async fn delete(&self, key: &str) -> Result<(), BackendError> { self.inner.delete(key).await }
    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, BackendError>> { self.inner.list_keys(prefix) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BucketConfig {
        BucketConfig {
            endpoint: Some("localhost:9000".into()),
            access_key: Some("minio".into()),
            secret_key: Some("minio123".into()),
            bucket: "artifacts".into(),
            use_tls: false,
            region: None,
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn endpoint_gets_scheme() {
        assert_eq!(endpoint_url("localhost:9000", false), "http://localhost:9000");
        assert_eq!(endpoint_url("s3.example.com", true), "https://s3.example.com");
        assert_eq!(endpoint_url("https://x", false), "https://x");
    }

    #[test]
    fn builds_without_network() {
        let b = BucketBackend::new(&cfg()).unwrap();
        assert_eq!(b.bucket(), "artifacts");
        assert_eq!(b.layout(), KeyLayout::ObjectStore);
    }

    #[test]
    fn requires_bucket() {
        let mut c = cfg();
        c.bucket = " ".into();
        assert!(BucketBackend::new(&c).is_err());
    }
}
