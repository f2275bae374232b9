//! Backend over any `object_store::ObjectStore`.
//!
//! `put_if_absent` maps to `PutMode::Create` and `put_if_version_matches` to
//! `PutMode::Update`, so atomicity is whatever precondition the store enforces natively
//! (`If-None-Match`/`If-Match` on S3, `ifGenerationMatch` on GCS).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, AttributeValue, Attributes, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};

use super::{validate_key, Backend, ContentMetadata, KeyLayout, PutOutcome, StoredObject, VersionTag};
use crate::error::BackendError;

#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    kind: &'static str,
}

impl fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend").field("kind", &self.kind).field("store", &self.store.to_string()).finish()
    }
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, kind: &'static str) -> Self { Self { store, kind } }

    fn path(key: &str) -> Result<ObjectPath, BackendError> {
        validate_key(key)?;
        ObjectPath::parse(key).map_err(|e| BackendError::InvalidKey { key: key.to_string(), reason: e.to_string() })
    }

    async fn put_with(&self, key: &str, bytes: Bytes, mode: PutMode, content: &ContentMetadata) -> Result<PutOutcome, BackendError> {
        let path = Self::path(key)?;
        let opts = PutOptions { mode, attributes: to_attributes(content), ..Default::default() };
        match self.store.put_opts(&path, PutPayload::from(bytes), opts).await {
            Ok(res) => Ok(PutOutcome::Written(VersionTag { etag: res.e_tag, generation: res.version })),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(PutOutcome::AlreadyExists),
            Err(object_store::Error::Precondition { .. }) => Ok(PutOutcome::VersionMismatch),
            // An update against a key that vanished is a lost race as well.
            Err(object_store::Error::NotFound { .. }) => Ok(PutOutcome::VersionMismatch),
            Err(e) => Err(map_err(key, e)),
        }
    }
}

fn to_attributes(content: &ContentMetadata) -> Attributes {
    let mut attrs = Attributes::new();
    if let Some(ct) = &content.content_type {
        attrs.insert(Attribute::ContentType, AttributeValue::from(ct.clone()));
    }
    for (k, v) in &content.attributes {
        attrs.insert(Attribute::Metadata(k.clone().into()), AttributeValue::from(v.clone()));
    }
    attrs
}

fn from_attributes(attrs: &Attributes) -> ContentMetadata {
    let mut content = ContentMetadata::default();
    for (attr, value) in attrs.iter() {
        match attr {
            Attribute::ContentType => content.content_type = Some(value.to_string()),
            Attribute::Metadata(k) => { content.attributes.insert(k.to_string(), value.to_string()); }
            _ => {}
        }
    }
    content
}

pub(crate) fn map_err(key: &str, e: object_store::Error) -> BackendError {
    match e {
        object_store::Error::NotFound { .. } => BackendError::not_found(key),
        object_store::Error::PermissionDenied { source, .. } | object_store::Error::Unauthenticated { source, .. } => {
            BackendError::PermissionDenied { key: key.to_string(), message: source.to_string() }
        }
        object_store::Error::InvalidPath { source } => BackendError::InvalidKey { key: key.to_string(), reason: source.to_string() },
        other => BackendError::unavailable(key, other),
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    fn kind(&self) -> &'static str { self.kind }

    fn layout(&self) -> KeyLayout { KeyLayout::ObjectStore }

    async fn put(&self, key: &str, bytes: Bytes, content: ContentMetadata) -> Result<VersionTag, BackendError> {
        match self.put_with(key, bytes, PutMode::Overwrite, &content).await? {
            PutOutcome::Written(tag) => Ok(tag),
            other => Err(BackendError::unavailable(key, format!("overwrite reported {other:?}"))),
        }
    }

    async fn put_if_absent(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, BackendError> {
        self.put_with(key, bytes, PutMode::Create, &ContentMetadata::default()).await
    }

    async fn put_if_version_matches(&self, key: &str, bytes: Bytes, expected: &VersionTag) -> Result<PutOutcome, BackendError> {
        if expected.etag.is_none() && expected.generation.is_none() {
            return Ok(PutOutcome::VersionMismatch);
        }
        let mode = PutMode::Update(UpdateVersion { e_tag: expected.etag.clone(), version: expected.generation.clone() });
        self.put_with(key, bytes, mode, &ContentMetadata::default()).await
    }

    async fn get(&self, key: &str) -> Result<StoredObject, BackendError> {
        let path = Self::path(key)?;
        let res = self.store.get(&path).await.map_err(|e| map_err(key, e))?;
        let tag = VersionTag { etag: res.meta.e_tag.clone(), generation: res.meta.version.clone() };
        let content = from_attributes(&res.attributes);
        let bytes = res.bytes().await.map_err(|e| map_err(key, e))?;
        Ok(StoredObject { bytes, content, tag })
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let path = Self::path(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_err(key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = Self::path(key)?;
        // Most object stores treat deleting a missing key as success; surface NotFound uniformly.
        self.store.head(&path).await.map_err(|e| map_err(key, e))?;
        self.store.delete(&path).await.map_err(|e| map_err(key, e))
    }

    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, BackendError>> {
        // Object stores list by path segment; list the enclosing directory and filter the rest.
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let dir_path = if dir.is_empty() { None } else { Some(ObjectPath::from(dir)) };
        self.store
            .list(dir_path.as_ref())
            .filter_map(move |res| async move {
                match res {
                    Ok(meta) => {
                        let key = meta.location.to_string();
                        key.starts_with(prefix).then_some(Ok(key))
                    }
                    Err(e) => Some(Err(map_err(prefix, e))),
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use object_store::memory::InMemory;

    fn backend() -> ObjectStoreBackend { ObjectStoreBackend::new(Arc::new(InMemory::new()), "memory") }

    #[tokio::test]
    async fn create_is_exclusive() {
        let b = backend();
        assert!(matches!(b.put_if_absent("m/.lock", Bytes::from_static(b"a")).await.unwrap(), PutOutcome::Written(_)));
        assert_eq!(b.put_if_absent("m/.lock", Bytes::from_static(b"b")).await.unwrap(), PutOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn update_requires_matching_etag() {
        let b = backend();
        let tag = b.put_if_absent("m/catalog.json", Bytes::from_static(b"1")).await.unwrap().tag().unwrap();
        let next = b.put_if_version_matches("m/catalog.json", Bytes::from_static(b"2"), &tag).await.unwrap();
        assert!(matches!(next, PutOutcome::Written(_)));
        let stale = b.put_if_version_matches("m/catalog.json", Bytes::from_static(b"3"), &tag).await.unwrap();
        assert_eq!(stale, PutOutcome::VersionMismatch);
        let got = b.get("m/catalog.json").await.unwrap();
        assert_eq!(&got.bytes[..], b"2");
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let b = backend();
        assert!(!b.exists("nope/v1/payload").await.unwrap());
        assert!(b.delete("nope/v1/payload").await.unwrap_err().is_not_found());
        assert!(b.get("nope/v1/payload").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn listing_filters_by_prefix() {
        let b = backend();
        for key in ["model-a/catalog.json", "model-a/v1/payload", "model-b/catalog.json"] {
            b.put(key, Bytes::from_static(b"x"), ContentMetadata::default()).await.unwrap();
        }
        let mut keys: Vec<String> = b.list_keys("model-a/").try_collect().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["model-a/catalog.json", "model-a/v1/payload"]);
        let all: Vec<String> = b.list_keys("model-").try_collect().await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
