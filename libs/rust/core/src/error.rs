//! Error taxonomy shared by backends, materializers, the lock manager and the registry.

use std::time::Duration;

use thiserror::Error;

use crate::catalog::Version;

/// Failures raised by a storage backend. Conditional-write outcomes are not errors,
/// see [`crate::backend::PutOutcome`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable for key '{key}': {message}")]
    Unavailable { key: String, message: String },
    #[error("permission denied for key '{key}': {message}")]
    PermissionDenied { key: String, message: String },
    #[error("key '{key}' not found")]
    NotFound { key: String },
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
}

impl BackendError {
    pub fn unavailable(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Unavailable { key: key.into(), message: message.to_string() }
    }

    pub fn not_found(key: impl Into<String>) -> Self { Self::NotFound { key: key.into() } }

    /// Only transient failures are worth retrying at the backend boundary.
    pub fn is_transient(&self) -> bool { matches!(self, Self::Unavailable { .. }) }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }

    pub fn key(&self) -> &str {
        match self {
            Self::Unavailable { key, .. }
            | Self::PermissionDenied { key, .. }
            | Self::NotFound { key }
            | Self::InvalidKey { key, .. } => key,
        }
    }

    pub fn from_io(key: &str, e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Self::NotFound { key: key.to_string() },
            ErrorKind::PermissionDenied => Self::PermissionDenied { key: key.to_string(), message: e.to_string() },
            _ => Self::Unavailable { key: key.to_string(), message: e.to_string() },
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MaterializerError {
    #[error("no materializer registered for type '{0}'")]
    Unknown(String),
    #[error("materializer '{0}' is already registered with a different implementation")]
    Duplicate(String),
    #[error("materializer '{tag}' expects a {expected} artifact, got {found}")]
    VariantMismatch { tag: String, expected: &'static str, found: &'static str },
    #[error("materializer '{tag}' failed to encode: {message}")]
    Encode { tag: String, message: String },
    #[error("materializer '{tag}' failed to decode: {message}")]
    Decode { tag: String, message: String },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock '{name}'")]
    Timeout { name: String, waited: Duration },
    #[error("lock '{name}' lost (fencing token {fencing})")]
    Lost { name: String, fencing: u64 },
    #[error("lock token at '{key}' is unreadable: {message}")]
    CorruptToken { key: String, message: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors surfaced to registry callers. Every variant names the object it concerns.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("object '{name}'{} not found", fmt_version(.version))]
    NotFound { name: String, version: Option<Version> },
    #[error("invalid object name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("invalid version {requested} for '{name}': must exceed {highest}")]
    InvalidVersion { name: String, requested: Version, highest: Version },
    #[error("backend unavailable while accessing '{key}' for '{name}': {message}")]
    BackendUnavailable { name: String, key: String, message: String },
    #[error("permission denied on '{key}' for '{name}': {message}")]
    PermissionDenied { name: String, key: String, message: String },
    #[error("timed out after {waited:?} acquiring the write lock for '{name}'")]
    LockTimeout { name: String, waited: Duration },
    #[error("write lock for '{name}' was lost (fencing token {fencing}); write aborted")]
    LockLost { name: String, fencing: u64 },
    #[error("concurrent modification of '{name}': expected parent {}, found {}", fmt_opt(.expected), fmt_opt(.actual))]
    ConcurrentModification { name: String, expected: Option<Version>, actual: Option<Version> },
    #[error("unknown materializer '{tag}' for '{name}'")]
    UnknownMaterializer { name: String, tag: String },
    #[error("materializer '{0}' is already registered with a different implementation")]
    DuplicateMaterializer(String),
    #[error("materializing '{name}' failed: {source}")]
    Materialize { name: String, #[source] source: MaterializerError },
    #[error("catalog '{key}' for '{name}' is corrupt: {message}")]
    CorruptCatalog { name: String, key: String, message: String },
    #[error("lock token '{key}' for '{name}' is corrupt: {message}")]
    CorruptLockToken { name: String, key: String, message: String },
    #[error("payload '{key}' of '{name}' v{version} does not match its recorded checksum")]
    CorruptPayload { name: String, version: Version, key: String },
}

fn fmt_version(v: &Option<Version>) -> String {
    v.map(|v| format!(" version {v}")).unwrap_or_default()
}

fn fmt_opt(v: &Option<Version>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "none".into())
}

impl RegistryError {
    /// Attaches the object name to a backend failure.
    pub(crate) fn backend(name: &str, err: BackendError) -> Self {
        match err {
            BackendError::NotFound { .. } => Self::NotFound { name: name.to_string(), version: None },
            BackendError::PermissionDenied { key, message } => Self::PermissionDenied { name: name.to_string(), key, message },
            BackendError::Unavailable { key, message } => Self::BackendUnavailable { name: name.to_string(), key, message },
            BackendError::InvalidKey { key, reason } => Self::BackendUnavailable { name: name.to_string(), key, message: reason },
        }
    }

    pub(crate) fn lock(name: &str, err: LockError) -> Self {
        match err {
            LockError::Timeout { waited, .. } => Self::LockTimeout { name: name.to_string(), waited },
            LockError::Lost { fencing, .. } => Self::LockLost { name: name.to_string(), fencing },
            LockError::CorruptToken { key, message } => Self::CorruptLockToken { name: name.to_string(), key, message },
            LockError::Backend(e) => Self::backend(name, e),
        }
    }

    pub(crate) fn materialize(name: &str, err: MaterializerError) -> Self {
        match err {
            MaterializerError::Unknown(tag) => Self::UnknownMaterializer { name: name.to_string(), tag },
            MaterializerError::Duplicate(tag) => Self::DuplicateMaterializer(tag),
            other => Self::Materialize { name: name.to_string(), source: other },
        }
    }

    /// Whether retrying the whole operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. } | Self::LockTimeout { .. } | Self::LockLost { .. } | Self::ConcurrentModification { .. })
    }
}

impl From<MaterializerError> for RegistryError {
    fn from(e: MaterializerError) -> Self {
        match e {
            MaterializerError::Duplicate(tag) => Self::DuplicateMaterializer(tag),
            other => Self::Materialize { name: String::new(), source: other },
        }
    }
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
