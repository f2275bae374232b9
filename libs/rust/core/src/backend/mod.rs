//! Storage backend contract and the concrete media behind it.
//!
//! A backend only knows opaque string keys and raw bytes. Names, versions and catalogs are
//! the registry's business; the backend's job is to make `put_if_absent` and
//! `put_if_version_matches` indivisible at the storage layer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::catalog::Version;
use crate::config::BackendConfig;
use crate::error::BackendError;

pub mod bucket;
pub mod cloud_blob;
pub mod local;
pub mod object;
pub mod retrying;

pub use bucket::BucketBackend;
pub use cloud_blob::CloudBlobBackend;
pub use local::LocalBackend;
pub use object::ObjectStoreBackend;
pub use retrying::RetryingBackend;

/// Descriptive metadata persisted next to an object's bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentMetadata {
    pub content_type: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl ContentMetadata {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self { content_type: Some(content_type.into()), attributes: BTreeMap::new() }
    }

    pub fn attribute(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.attributes.insert(k.into(), v.into());
        self
    }
}

/// Native concurrency token of a stored object: an entity tag, a generation number, or the
/// local backend's stored counter. Opaque to everything above the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionTag {
    pub etag: Option<String>,
    pub generation: Option<String>,
}

impl VersionTag {
    pub fn etag(etag: impl Into<String>) -> Self { Self { etag: Some(etag.into()), generation: None } }
    pub fn generation(generation: impl ToString) -> Self { Self { etag: None, generation: Some(generation.to_string()) } }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.etag, &self.generation) {
            (Some(e), Some(g)) => write!(f, "{e}#{g}"),
            (Some(e), None) => f.write_str(e),
            (None, Some(g)) => write!(f, "#{g}"),
            (None, None) => f.write_str("<untagged>"),
        }
    }
}

/// Result of a conditional write. Losing a race is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Written(VersionTag),
    AlreadyExists,
    VersionMismatch,
}

impl PutOutcome {
    pub fn tag(self) -> Option<VersionTag> {
        match self {
            PutOutcome::Written(tag) => Some(tag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content: ContentMetadata,
    pub tag: VersionTag,
}

/// Where an object's keys live inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// `<name>/<version>.payload`
    Filesystem,
    /// `<name>/v<version>/payload`
    ObjectStore,
}

pub const CATALOG_FILE: &str = "catalog.json";
pub const LOCK_FILE: &str = ".lock";

impl KeyLayout {
    pub fn payload_key(self, name: &str, version: Version) -> String {
        match self {
            KeyLayout::Filesystem => format!("{name}/{version}.payload"),
            KeyLayout::ObjectStore => format!("{name}/v{version}/payload"),
        }
    }

    pub fn catalog_key(self, name: &str) -> String { format!("{name}/{CATALOG_FILE}") }

    pub fn lock_key(self, name: &str) -> String { format!("{name}/{LOCK_FILE}") }

    /// Object name owning a catalog key, if `key` is one.
    pub fn name_from_catalog_key(self, key: &str) -> Option<&str> {
        let name = key.strip_suffix(CATALOG_FILE)?.strip_suffix('/')?;
        (!name.is_empty() && !name.contains('/')).then_some(name)
    }

    /// Version encoded in a payload key belonging to `name`.
    pub fn version_from_payload_key(self, name: &str, key: &str) -> Option<Version> {
        let rest = key.strip_prefix(name)?.strip_prefix('/')?;
        let digits = match self {
            KeyLayout::Filesystem => rest.strip_suffix(".payload")?,
            KeyLayout::ObjectStore => rest.strip_prefix('v')?.strip_suffix("/payload")?,
        };
        digits.parse().ok().map(Version)
    }
}

#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Short label for logs (`local`, `bucket`, `cloud_blob`, ...).
    fn kind(&self) -> &'static str;

    fn layout(&self) -> KeyLayout;

    /// Unconditional overwrite.
    async fn put(&self, key: &str, bytes: Bytes, content: ContentMetadata) -> Result<VersionTag, BackendError>;

    /// Creates `key` only if nothing is stored there. Indivisible at the storage layer.
    async fn put_if_absent(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, BackendError>;

    /// Replaces `key` only if its current tag equals `expected`. A missing key is a mismatch.
    async fn put_if_version_matches(&self, key: &str, bytes: Bytes, expected: &VersionTag) -> Result<PutOutcome, BackendError>;

    async fn get(&self, key: &str) -> Result<StoredObject, BackendError>;

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Finite, restartable listing of keys starting with `prefix`. Nothing is fetched until polled.
    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, BackendError>>;
}

/// Builds the backend named by `config`.
pub fn build(config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
    let backend: Arc<dyn Backend> = match config {
        BackendConfig::Local { root_path } => Arc::new(LocalBackend::open(root_path)?),
        BackendConfig::Bucket(cfg) => Arc::new(BucketBackend::new(cfg)?),
        BackendConfig::CloudBlob(cfg) => Arc::new(CloudBlobBackend::new(cfg)?),
    };
    tracing::info!(kind = backend.kind(), "storage backend ready");
    Ok(backend)
}

/// Rejects keys that could escape a backend root or collide with backend bookkeeping.
pub(crate) fn validate_key(key: &str) -> Result<(), BackendError> {
    let invalid = |reason: &str| Err(BackendError::InvalidKey { key: key.to_string(), reason: reason.to_string() });
    if key.is_empty() { return invalid("empty key"); }
    if key.starts_with('/') || key.ends_with('/') { return invalid("leading or trailing '/'"); }
    if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") { return invalid("empty or relative path segment"); }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_persisted_formats() {
        assert_eq!(KeyLayout::Filesystem.payload_key("model-a", Version(3)), "model-a/3.payload");
        assert_eq!(KeyLayout::ObjectStore.payload_key("model-a", Version(3)), "model-a/v3/payload");
        assert_eq!(KeyLayout::ObjectStore.catalog_key("model-a"), "model-a/catalog.json");
        assert_eq!(KeyLayout::Filesystem.lock_key("model-a"), "model-a/.lock");
    }

    #[test]
    fn payload_keys_parse_back() {
        assert_eq!(KeyLayout::Filesystem.version_from_payload_key("m", "m/12.payload"), Some(Version(12)));
        assert_eq!(KeyLayout::ObjectStore.version_from_payload_key("m", "m/v7/payload"), Some(Version(7)));
        assert_eq!(KeyLayout::ObjectStore.version_from_payload_key("m", "m/catalog.json"), None);
        assert_eq!(KeyLayout::Filesystem.version_from_payload_key("m", "mm/1.payload"), None);
    }

    #[test]
    fn catalog_keys_name_their_object() {
        assert_eq!(KeyLayout::Filesystem.name_from_catalog_key("model-a/catalog.json"), Some("model-a"));
        assert_eq!(KeyLayout::Filesystem.name_from_catalog_key("a/b/catalog.json"), None);
        assert_eq!(KeyLayout::Filesystem.name_from_catalog_key("catalog.json"), None);
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("a/b.payload").is_ok());
        assert!(validate_key("../etc").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("/abs").is_err());
    }
}
