//! Local filesystem backend.
//!
//! Every key maps to a file under the root. A hidden sidecar `.<file>.meta` next to it holds
//! the generation counter and content metadata; an `fs2` advisory lock on the sidecar
//! serialises all mutations of that key across processes. Data is written to a temp file and
//! renamed into place, so readers never see a torn payload. Sidecars are kept on delete so a
//! generation is never handed out twice for the same key.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use fs2::FileExt;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use super::{validate_key, Backend, ContentMetadata, KeyLayout, PutOutcome, StoredObject, VersionTag};
use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    generation: u64,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct KeyPaths {
    key: String,
    dir: PathBuf,
    file_name: String,
    data: PathBuf,
    sidecar: PathBuf,
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Always,
    IfAbsent,
    IfGeneration(u64),
}

impl LocalBackend {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = root.as_ref();
        let label = root.display().to_string();
        fs::create_dir_all(root).map_err(|e| BackendError::from_io(&label, e))?;
        let root = root.canonicalize().map_err(|e| BackendError::from_io(&label, e))?;
        debug!(root = %root.display(), "local backend opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path { &self.root }

    fn paths(&self, key: &str) -> Result<KeyPaths, BackendError> {
        validate_key(key)?;
        let data = self.root.join(key);
        let file_name = key.rsplit('/').next().unwrap_or(key).to_string();
        if is_bookkeeping(&file_name) {
            return Err(BackendError::InvalidKey { key: key.to_string(), reason: "name reserved for backend bookkeeping".into() });
        }
        let dir = data.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        let sidecar = dir.join(format!(".{file_name}.meta"));
        Ok(KeyPaths { key: key.to_string(), dir, file_name, data, sidecar })
    }

    async fn write(&self, key: &str, bytes: Bytes, content: Option<ContentMetadata>, mode: WriteMode) -> Result<PutOutcome, BackendError> {
        let paths = self.paths(key)?;
        blocking(key, move || write_locked(&paths, &bytes, content, mode)).await
    }
}

fn is_bookkeeping(file_name: &str) -> bool {
    (file_name.starts_with('.') && file_name.ends_with(".meta")) || file_name.contains(".tmp-")
}

async fn blocking<T, F>(key: &str, f: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| BackendError::unavailable(key, e))?
}

fn read_sidecar(paths: &KeyPaths, file: &mut File) -> Result<Sidecar, BackendError> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).map_err(|e| BackendError::from_io(&paths.key, e))?;
    file.read_to_string(&mut raw).map_err(|e| BackendError::from_io(&paths.key, e))?;
    if raw.trim().is_empty() { return Ok(Sidecar::default()); }
    serde_json::from_str(&raw).map_err(|e| BackendError::unavailable(&paths.key, format!("unreadable sidecar: {e}")))
}

fn write_sidecar(paths: &KeyPaths, file: &mut File, sidecar: &Sidecar) -> Result<(), BackendError> {
    let raw = serde_json::to_vec(sidecar).map_err(|e| BackendError::unavailable(&paths.key, e))?;
    let io = |e: std::io::Error| BackendError::from_io(&paths.key, e);
    file.set_len(0).map_err(io)?;
    file.seek(SeekFrom::Start(0)).map_err(io)?;
    file.write_all(&raw).map_err(io)?;
    file.sync_data().map_err(io)
}

fn open_sidecar(paths: &KeyPaths, create: bool) -> Result<File, BackendError> {
    if create { fs::create_dir_all(&paths.dir).map_err(|e| BackendError::from_io(&paths.key, e))?; }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(&paths.sidecar)
        .map_err(|e| BackendError::from_io(&paths.key, e))
}

fn write_locked(paths: &KeyPaths, bytes: &[u8], content: Option<ContentMetadata>, mode: WriteMode) -> Result<PutOutcome, BackendError> {
    let io = |e: std::io::Error| BackendError::from_io(&paths.key, e);
    let mut guard = open_sidecar(paths, true)?;
    guard.lock_exclusive().map_err(io)?;
    let outcome = (|| -> Result<PutOutcome, BackendError> {
        let mut sidecar = read_sidecar(paths, &mut guard)?;
        let exists = paths.data.exists();
        match mode {
            WriteMode::IfAbsent if exists => return Ok(PutOutcome::AlreadyExists),
            WriteMode::IfGeneration(expected) if !exists || sidecar.generation != expected => return Ok(PutOutcome::VersionMismatch),
            _ => {}
        }
        let tmp = paths.dir.join(format!(".{}.tmp-{}", paths.file_name, Uuid::new_v4().simple()));
        let mut out = File::create(&tmp).map_err(io)?;
        out.write_all(bytes).map_err(io)?;
        out.sync_all().map_err(io)?;
        drop(out);
        // Bump the generation before the rename: a crash in between yields a spurious
        // mismatch, never a stale tag that still matches new content.
        sidecar.generation += 1;
        if let Some(content) = content {
            sidecar.content_type = content.content_type;
            sidecar.attributes = content.attributes;
        }
        write_sidecar(paths, &mut guard, &sidecar)?;
        if let Err(e) = fs::rename(&tmp, &paths.data) {
            let _ = fs::remove_file(&tmp);
            return Err(io(e));
        }
        Ok(PutOutcome::Written(VersionTag::generation(sidecar.generation)))
    })();
    let _ = FileExt::unlock(&guard);
    outcome
}

fn read_locked(paths: &KeyPaths) -> Result<StoredObject, BackendError> {
    let io = |e: std::io::Error| BackendError::from_io(&paths.key, e);
    let mut guard = open_sidecar(paths, false)?;
    guard.lock_shared().map_err(io)?;
    let result = (|| -> Result<StoredObject, BackendError> {
        let sidecar = read_sidecar(paths, &mut guard)?;
        let bytes = fs::read(&paths.data).map_err(io)?;
        Ok(StoredObject {
            bytes: Bytes::from(bytes),
            content: ContentMetadata { content_type: sidecar.content_type, attributes: sidecar.attributes },
            tag: VersionTag::generation(sidecar.generation),
        })
    })();
    let _ = FileExt::unlock(&guard);
    result
}

fn delete_locked(paths: &KeyPaths) -> Result<(), BackendError> {
    let io = |e: std::io::Error| BackendError::from_io(&paths.key, e);
    let mut guard = open_sidecar(paths, false)?;
    guard.lock_exclusive().map_err(io)?;
    let result = (|| -> Result<(), BackendError> {
        let mut sidecar = read_sidecar(paths, &mut guard)?;
        fs::remove_file(&paths.data).map_err(io)?;
        sidecar.generation += 1;
        sidecar.content_type = None;
        sidecar.attributes.clear();
        write_sidecar(paths, &mut guard, &sidecar)
    })();
    let _ = FileExt::unlock(&guard);
    result
}

fn walk(root: &Path, prefix: &str) -> Result<Vec<String>, BackendError> {
    let start = match prefix.rsplit_once('/') {
        Some((dir, _)) => root.join(dir),
        None => root.to_path_buf(),
    };
    if !start.is_dir() { return Ok(Vec::new()); }
    let mut keys = Vec::new();
    for entry in WalkDir::new(&start).follow_links(false) {
        let entry = entry.map_err(|e| BackendError::unavailable(prefix, e))?;
        if !entry.file_type().is_file() { continue; }
        let file_name = entry.file_name().to_string_lossy();
        if is_bookkeeping(&file_name) { continue; }
        let Ok(rel) = entry.path().strip_prefix(root) else { continue };
        let key = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
        if key.starts_with(prefix) { keys.push(key); }
    }
    keys.sort();
    Ok(keys)
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> &'static str { "local" }

    fn layout(&self) -> KeyLayout { KeyLayout::Filesystem }

    async fn put(&self, key: &str, bytes: Bytes, content: ContentMetadata) -> Result<VersionTag, BackendError> {
        match self.write(key, bytes, Some(content), WriteMode::Always).await? {
            PutOutcome::Written(tag) => Ok(tag),
            other => Err(BackendError::unavailable(key, format!("unconditional write reported {other:?}"))),
        }
    }

    async fn put_if_absent(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, BackendError> {
        self.write(key, bytes, Some(ContentMetadata::default()), WriteMode::IfAbsent).await
    }

    async fn put_if_version_matches(&self, key: &str, bytes: Bytes, expected: &VersionTag) -> Result<PutOutcome, BackendError> {
        let Some(generation) = expected.generation.as_deref().and_then(|g| g.parse().ok()) else {
            return Ok(PutOutcome::VersionMismatch);
        };
        self.write(key, bytes, None, WriteMode::IfGeneration(generation)).await
    }

    async fn get(&self, key: &str) -> Result<StoredObject, BackendError> {
        let paths = self.paths(key)?;
        blocking(key, move || read_locked(&paths)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let paths = self.paths(key)?;
        blocking(key, move || Ok(paths.data.is_file())).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let paths = self.paths(key)?;
        blocking(key, move || delete_locked(&paths)).await
    }

    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String, BackendError>> {
        let root = self.root.clone();
        let owned = prefix.to_string();
        stream::once(async move { blocking(prefix, move || walk(&root, &owned)).await })
            .map_ok(|keys| stream::iter(keys.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let b = LocalBackend::open(dir.path()).unwrap();
        (dir, b)
    }

    #[tokio::test]
    async fn put_get_delete() {
        let (_dir, b) = backend();
        let meta = ContentMetadata::with_content_type("application/json").attribute("name", "m");
        b.put("m/1.payload", Bytes::from_static(b"{}"), meta.clone()).await.unwrap();
        let got = b.get("m/1.payload").await.unwrap();
        assert_eq!(&got.bytes[..], b"{}");
        assert_eq!(got.content, meta);
        assert!(b.exists("m/1.payload").await.unwrap());
        b.delete("m/1.payload").await.unwrap();
        assert!(!b.exists("m/1.payload").await.unwrap());
        assert!(b.get("m/1.payload").await.unwrap_err().is_not_found());
        assert!(b.delete("m/1.payload").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn put_if_absent_only_once() {
        let (_dir, b) = backend();
        let first = b.put_if_absent("m/.lock", Bytes::from_static(b"a")).await.unwrap();
        assert!(matches!(first, PutOutcome::Written(_)));
        let second = b.put_if_absent("m/.lock", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(second, PutOutcome::AlreadyExists);
        assert_eq!(&b.get("m/.lock").await.unwrap().bytes[..], b"a");
    }

    #[tokio::test]
    async fn conditional_update_tracks_generation() {
        let (_dir, b) = backend();
        let tag = b.put_if_absent("k", Bytes::from_static(b"1")).await.unwrap().tag().unwrap();
        let tag2 = b.put_if_version_matches("k", Bytes::from_static(b"2"), &tag).await.unwrap().tag().unwrap();
        assert_ne!(tag, tag2);
        assert_eq!(b.put_if_version_matches("k", Bytes::from_static(b"3"), &tag).await.unwrap(), PutOutcome::VersionMismatch);
        assert_eq!(&b.get("k").await.unwrap().bytes[..], b"2");
    }

    #[tokio::test]
    async fn generations_survive_delete() {
        let (_dir, b) = backend();
        let tag = b.put_if_absent("k", Bytes::from_static(b"1")).await.unwrap().tag().unwrap();
        b.delete("k").await.unwrap();
        let again = b.put_if_absent("k", Bytes::from_static(b"1")).await.unwrap().tag().unwrap();
        assert_ne!(tag, again);
        assert_eq!(b.put_if_version_matches("k", Bytes::from_static(b"x"), &tag).await.unwrap(), PutOutcome::VersionMismatch);
    }

    #[tokio::test]
    async fn racing_creators_have_one_winner() {
        let (_dir, b) = backend();
        let b = std::sync::Arc::new(b);
        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let b = b.clone();
            tasks.push(tokio::spawn(async move { b.put_if_absent("race/.lock", Bytes::from(vec![i])).await.unwrap() }));
        }
        let mut winners = 0;
        for t in tasks { if matches!(t.await.unwrap(), PutOutcome::Written(_)) { winners += 1; } }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn listing_hides_bookkeeping_files() {
        let (_dir, b) = backend();
        b.put("a/catalog.json", Bytes::from_static(b"{}"), ContentMetadata::default()).await.unwrap();
        b.put("a/1.payload", Bytes::from_static(b"x"), ContentMetadata::default()).await.unwrap();
        b.put("ab/catalog.json", Bytes::from_static(b"{}"), ContentMetadata::default()).await.unwrap();
        b.put_if_absent("a/.lock", Bytes::from_static(b"l")).await.unwrap();
        let keys: Vec<String> = b.list_keys("a/").try_collect().await.unwrap();
        assert_eq!(keys, vec!["a/.lock", "a/1.payload", "a/catalog.json"]);
        let all: Vec<String> = b.list_keys("").try_collect().await.unwrap();
        assert_eq!(all.len(), 4);
        let none: Vec<String> = b.list_keys("zzz/").try_collect().await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn rejects_escaping_and_reserved_keys() {
        let (_dir, b) = backend();
        assert!(matches!(b.get("../x").await, Err(BackendError::InvalidKey { .. })));
        assert!(matches!(b.put("a/.x.meta", Bytes::new(), ContentMetadata::default()).await, Err(BackendError::InvalidKey { .. })));
    }
}
