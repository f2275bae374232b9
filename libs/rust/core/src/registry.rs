//! Registry core: push, pull, delete and discovery of named, versioned objects.
//!
//! Writers hold the name's lease for the whole read-modify-write of the catalog and commit the
//! catalog last, with a conditional write stamped with their fencing token. Readers never
//! lock: a catalog is replaced atomically, so a pull sees either the old or the new document.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::backend::{self, Backend, ContentMetadata, PutOutcome, RetryingBackend, VersionTag};
use crate::catalog::{CatalogEntry, Metadata, Version, VersionEntry};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::lock::{LockConfig, LockHandle, LockManager};
use crate::materializer::{Artifact, Materializer, MaterializerRegistry};
use crate::metrics::REGISTRY_METRICS;

const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Fail with `ConcurrentModification` unless this is still the latest live version.
    pub expected_parent_version: Option<Version>,
    /// Use this version number instead of the next one. Must exceed every assigned version.
    pub pinned_version: Option<Version>,
    /// Lease to hold for this push; defaults to the configured lease.
    pub lease: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PulledObject {
    pub name: String,
    pub version: Version,
    pub artifact: Artifact,
    pub metadata: Metadata,
    pub materializer_type: String,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Registry {
    backend: Arc<dyn Backend>,
    materializers: Arc<MaterializerRegistry>,
    locks: LockManager,
    purge_payloads: bool,
    verify_checksums: bool,
}

pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| Err(RegistryError::InvalidName { name: name.to_string(), reason });
    if name.is_empty() { return invalid("empty"); }
    if name.len() > MAX_NAME_LEN { return invalid("longer than 128 characters"); }
    if name.starts_with('.') { return invalid("starts with '.'"); }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return invalid("only ASCII letters, digits, '.', '_' and '-' are allowed");
    }
    Ok(())
}

fn checksum(bytes: &[u8]) -> String { hex::encode(Sha256::digest(bytes)) }

impl Registry {
    pub fn new(backend: Arc<dyn Backend>, materializers: Arc<MaterializerRegistry>, config: &RegistryConfig) -> Self {
        let locks = LockManager::new(backend.clone(), LockConfig::from(&config.lock));
        Self { backend, materializers, locks, purge_payloads: config.purge_payloads, verify_checksums: config.verify_checksums }
    }

    /// Builds the configured backend behind transient-failure retries, with the built-in materializers.
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let raw = backend::build(&config.backend).map_err(|e| RegistryError::backend("", e))?;
        let retrying: Arc<dyn Backend> = Arc::new(RetryingBackend::new(raw, (&config.retry).into()));
        Ok(Self::new(retrying, Arc::new(MaterializerRegistry::with_builtins()), config))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> { &self.backend }

    pub fn materializers(&self) -> &MaterializerRegistry { &self.materializers }

    pub fn locks(&self) -> &LockManager { &self.locks }

    pub fn register_materializer(&self, type_tag: &str, materializer: Materializer) -> Result<()> {
        self.materializers.register(type_tag, materializer).map_err(RegistryError::from)
    }

    pub async fn push(&self, name: &str, artifact: &Artifact, metadata: Metadata, materializer_type: &str) -> Result<Version> {
        self.push_with(name, artifact, metadata, materializer_type, PushOptions::default()).await
    }

    pub async fn push_with(&self, name: &str, artifact: &Artifact, metadata: Metadata, materializer_type: &str, opts: PushOptions) -> Result<Version> {
        validate_name(name)?;
        let started = Instant::now();
        // Configuration errors fail before any lock is taken.
        let materializer = self.materializers.resolve(materializer_type).map_err(|e| RegistryError::materialize(name, e))?;

        let lease = opts.lease.unwrap_or(self.locks.config().lease);
        let mut handle = self.locks.acquire_with(name, lease, self.locks.config().max_wait).await.map_err(|e| RegistryError::lock(name, e))?;
        let result = self.push_locked(&mut handle, artifact, metadata, materializer_type, materializer, &opts).await;
        self.locks.release(handle).await;

        let version = result?;
        REGISTRY_METRICS.push_total.add(1, &[]);
        REGISTRY_METRICS.push_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        info!(name, %version, materializer = materializer_type, "push committed");
        Ok(version)
    }

    async fn push_locked(
        &self,
        handle: &mut LockHandle,
        artifact: &Artifact,
        metadata: Metadata,
        materializer_type: &str,
        materializer: Materializer,
        opts: &PushOptions,
    ) -> Result<Version> {
        let name = handle.name().to_string();
        let (mut catalog, prior_tag) = match self.read_catalog(&name).await? {
            Some((catalog, tag)) => (catalog, Some(tag)),
            None => (CatalogEntry::new(&name), None),
        };

        let latest = catalog.latest();
        if let Some(expected) = opts.expected_parent_version {
            if Some(expected) != latest {
                return Err(RegistryError::ConcurrentModification { name, expected: Some(expected), actual: latest });
            }
        }

        // The lock token remembers versions assigned before the catalog was last removed.
        let highest = catalog.highest_assigned().unwrap_or(Version(0)).max(Version(handle.high_water_version()));
        let version = match opts.pinned_version {
            Some(pinned) if pinned <= highest => {
                return Err(RegistryError::InvalidVersion { name, requested: pinned, highest });
            }
            Some(pinned) => pinned,
            None => highest.next(),
        };

        let bytes = (materializer.serialize)(artifact).map_err(|e| RegistryError::materialize(&name, e))?;
        let payload_key = self.backend.layout().payload_key(&name, version);
        let content = ContentMetadata::with_content_type(materializer.content_type)
            .attribute("object", name.clone())
            .attribute("version", version.to_string())
            .attribute("materializer", materializer_type);
        let size = bytes.len() as u64;
        let digest = checksum(&bytes);
        // From here until the catalog commit, a failure leaves an inert orphan payload.
        self.backend.put(&payload_key, bytes, content).await.map_err(|e| RegistryError::backend(&name, e))?;
        debug!(name = %name, %version, key = %payload_key, size, "payload written");

        catalog.push_version(VersionEntry {
            version,
            payload_key,
            materializer_type: materializer_type.to_string(),
            metadata,
            created_at: Utc::now(),
            tombstoned: false,
            checksum: Some(digest),
            size,
        });
        self.commit_catalog(handle, &mut catalog, prior_tag.as_ref()).await?;
        Ok(version)
    }

    /// Writes `catalog` iff this handle still holds the lease and nobody committed in between.
    async fn commit_catalog(&self, handle: &mut LockHandle, catalog: &mut CatalogEntry, prior: Option<&VersionTag>) -> Result<()> {
        let name = handle.name().to_string();
        self.check_fencing(handle, catalog).await?;
        catalog.fencing_token = handle.fencing_token();
        let key = self.backend.layout().catalog_key(&name);
        let bytes = catalog.to_json().map_err(|e| RegistryError::CorruptCatalog { name: name.clone(), key: key.clone(), message: e.to_string() })?;
        let outcome = match prior {
            Some(tag) => self.backend.put_if_version_matches(&key, bytes.into(), tag).await,
            None => self.backend.put_if_absent(&key, bytes.into()).await,
        }
        .map_err(|e| RegistryError::backend(&name, e))?;
        match outcome {
            PutOutcome::Written(_) => Ok(()),
            PutOutcome::AlreadyExists | PutOutcome::VersionMismatch => {
                // A retried write whose first attempt landed finds exactly our document.
                if let Some((stored, _)) = self.read_catalog(&name).await? {
                    if stored == *catalog {
                        debug!(name = %name, fencing = handle.fencing_token(), "catalog commit confirmed after retry");
                        return Ok(());
                    }
                }
                warn!(name = %name, fencing = handle.fencing_token(), "catalog changed under a held lock");
                Err(RegistryError::LockLost { name, fencing: handle.fencing_token() })
            }
        }
    }

    /// Renews the lease (failing if it was taken over) and refuses to commit over a catalog
    /// stamped by a newer holder.
    async fn check_fencing(&self, handle: &mut LockHandle, catalog: &CatalogEntry) -> Result<()> {
        let name = handle.name().to_string();
        self.locks.renew(handle).await.map_err(|e| RegistryError::lock(&name, e))?;
        if catalog.fencing_token > handle.fencing_token() {
            warn!(name = %name, catalog_fencing = catalog.fencing_token, fencing = handle.fencing_token(), "stale writer rejected");
            return Err(RegistryError::LockLost { name, fencing: handle.fencing_token() });
        }
        Ok(())
    }

    async fn read_catalog(&self, name: &str) -> Result<Option<(CatalogEntry, VersionTag)>> {
        let key = self.backend.layout().catalog_key(name);
        let stored = match self.backend.get(&key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(RegistryError::backend(name, e)),
        };
        let catalog = CatalogEntry::from_json(&stored.bytes)
            .map_err(|e| RegistryError::CorruptCatalog { name: name.to_string(), key: key.clone(), message: e.to_string() })?;
        if catalog.name != name {
            return Err(RegistryError::CorruptCatalog { name: name.to_string(), key, message: format!("catalog names '{}'", catalog.name) });
        }
        Ok(Some((catalog, stored.tag)))
    }

    /// Lock-free read of `version`, or of the latest live version when `None`.
    pub async fn pull(&self, name: &str, version: Option<Version>) -> Result<PulledObject> {
        validate_name(name)?;
        let not_found = || RegistryError::NotFound { name: name.to_string(), version };
        let (catalog, _) = self.read_catalog(name).await?.ok_or_else(not_found)?;
        let entry = catalog.resolve(version).ok_or_else(not_found)?;
        let materializer = self.materializers.resolve(&entry.materializer_type).map_err(|e| RegistryError::materialize(name, e))?;

        let stored = self.backend.get(&entry.payload_key).await.map_err(|e| match e {
            e if e.is_not_found() => RegistryError::NotFound { name: name.to_string(), version: Some(entry.version) },
            e => RegistryError::backend(name, e),
        })?;
        if self.verify_checksums {
            if let Some(expected) = &entry.checksum {
                if checksum(&stored.bytes) != *expected {
                    return Err(RegistryError::CorruptPayload { name: name.to_string(), version: entry.version, key: entry.payload_key.clone() });
                }
            }
        }
        let artifact = (materializer.deserialize)(&stored.bytes).map_err(|e| RegistryError::materialize(name, e))?;
        REGISTRY_METRICS.pull_total.add(1, &[]);
        debug!(name, version = %entry.version, "pulled");
        Ok(PulledObject {
            name: name.to_string(),
            version: entry.version,
            artifact,
            metadata: entry.metadata.clone(),
            materializer_type: entry.materializer_type.clone(),
            created_at: entry.created_at,
        })
    }

    /// Catalog record of a version, without fetching its payload.
    pub async fn metadata(&self, name: &str, version: Option<Version>) -> Result<VersionEntry> {
        validate_name(name)?;
        let not_found = || RegistryError::NotFound { name: name.to_string(), version };
        let (catalog, _) = self.read_catalog(name).await?.ok_or_else(not_found)?;
        catalog.resolve(version).cloned().ok_or_else(not_found)
    }

    /// Tombstones `version`. The catalog entry disappears with its last live version.
    pub async fn delete(&self, name: &str, version: Version) -> Result<()> {
        validate_name(name)?;
        let mut handle = self.locks.acquire(name).await.map_err(|e| RegistryError::lock(name, e))?;
        let result = self.delete_locked(&mut handle, version).await;
        self.locks.release(handle).await;
        result?;
        REGISTRY_METRICS.delete_total.add(1, &[]);
        Ok(())
    }

    async fn delete_locked(&self, handle: &mut LockHandle, version: Version) -> Result<()> {
        let name = handle.name().to_string();
        let not_found = || RegistryError::NotFound { name: name.clone(), version: Some(version) };
        let (mut catalog, tag) = self.read_catalog(&name).await?.ok_or_else(not_found)?;
        let payload_key = catalog.tombstone(version).map(|e| e.payload_key.clone()).ok_or_else(not_found)?;

        if catalog.has_live_versions() {
            self.commit_catalog(handle, &mut catalog, Some(&tag)).await?;
            info!(name = %name, %version, "version tombstoned");
        } else {
            self.check_fencing(handle, &catalog).await?;
            let highest = catalog.highest_assigned().unwrap_or(version);
            self.locks.record_high_water(handle, highest.0).await.map_err(|e| RegistryError::lock(&name, e))?;
            let key = self.backend.layout().catalog_key(&name);
            match self.backend.delete(&key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(RegistryError::backend(&name, e)),
            }
            info!(name = %name, %version, "last version deleted; catalog removed");
        }

        if self.purge_payloads {
            // still under the lock and after the catalog commit
            match self.backend.delete(&payload_key).await {
                Ok(()) => debug!(name = %name, %version, key = %payload_key, "payload purged"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(name = %name, %version, key = %payload_key, error = %e, "payload purge failed; left as orphan"),
            }
        }
        Ok(())
    }

    /// Live versions in ascending order; empty for unknown names.
    pub async fn list_versions(&self, name: &str) -> Result<Vec<Version>> {
        validate_name(name)?;
        Ok(self.read_catalog(name).await?.map(|(c, _)| c.live_versions()).unwrap_or_default())
    }

    /// Names of objects starting with `prefix`, produced lazily as backend pages arrive.
    pub fn list_objects<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String>> {
        let layout = self.backend.layout();
        self.backend
            .list_keys(prefix)
            .filter_map(move |res| async move {
                match res {
                    Ok(key) => layout.name_from_catalog_key(&key).filter(|n| n.starts_with(prefix)).map(|n| Ok(n.to_string())),
                    Err(e) => Some(Err(RegistryError::backend(prefix, e))),
                }
            })
            .boxed()
    }

    /// Deletes payloads under `name` that no live catalog entry references: leftovers of
    /// interrupted pushes and of deletions made without purging. Holds the name's lock so an
    /// in-flight push's payload is never mistaken for an orphan.
    pub async fn collect_orphans(&self, name: &str) -> Result<Vec<String>> {
        validate_name(name)?;
        let handle = self.locks.acquire(name).await.map_err(|e| RegistryError::lock(name, e))?;
        let result = self.collect_orphans_locked(name).await;
        self.locks.release(handle).await;
        result
    }

    async fn collect_orphans_locked(&self, name: &str) -> Result<Vec<String>> {
        let layout = self.backend.layout();
        let referenced: HashSet<String> = match self.read_catalog(name).await? {
            Some((catalog, _)) => catalog.live().map(|e| e.payload_key.clone()).collect(),
            None => HashSet::new(),
        };
        let prefix = format!("{name}/");
        let keys: Vec<String> = self.backend.list_keys(&prefix).try_collect().await.map_err(|e| RegistryError::backend(name, e))?;
        let mut removed = Vec::new();
        for key in keys {
            if layout.version_from_payload_key(name, &key).is_none() || referenced.contains(&key) { continue; }
            match self.backend.delete(&key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(RegistryError::backend(name, e)),
            }
            info!(name, key = %key, "orphan payload collected");
            removed.push(key);
        }
        Ok(removed)
    }
}
