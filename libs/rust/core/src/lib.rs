//! Versioned object registry: named, versioned artifacts with metadata over interchangeable
//! storage backends, with leased single-writer locking per object name.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod lock;
pub mod materializer;
mod metrics;
pub mod registry;

pub use backend::{Backend, BucketBackend, CloudBlobBackend, ContentMetadata, KeyLayout, LocalBackend, ObjectStoreBackend, PutOutcome, RetryingBackend, StoredObject, VersionTag};
pub use catalog::{CatalogEntry, Metadata, Version, VersionEntry};
pub use config::{BackendConfig, BucketConfig, CloudBlobConfig, LockSettings, RegistryConfig, RetrySettings};
pub use error::{BackendError, LockError, MaterializerError, RegistryError};
pub use lock::{LockConfig, LockHandle, LockManager, LockToken};
pub use materializer::{Artifact, Materializer, MaterializerRegistry};
pub use registry::{PulledObject, PushOptions, Registry};

/// Installs a fmt subscriber filtered by `RUST_LOG` (falling back to `default_filter`).
/// `ARCA_JSON_LOG=1|true` switches to flattened JSON lines. A second call is a no-op.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let json = std::env::var("ARCA_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_line_number(true)
            .boxed()
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))?;
    if tracing_subscriber::registry().with(fmt_layer).with(env_filter).try_init().is_ok() {
        info!(target: "arca", "tracing initialized");
    }
    Ok(())
}
