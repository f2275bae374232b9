//! Per-name metadata catalog: the JSON index of every version ever assigned to an object.
//!
//! Document shape:
//! `{"name", "versions": [{"version", "payload_key", "materializer_type", "metadata",
//! "created_at", "tombstoned", "checksum", "size"}], "fencing_token"}`

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// User metadata stored alongside a payload.
pub type Metadata = Map<String, Value>;

/// Registry-assigned version number. Starts at 1 and only grows for a given name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const FIRST: Version = Version(1);
    pub fn next(self) -> Version { Version(self.0 + 1) }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self { Version(v) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: Version,
    pub payload_key: String,
    pub materializer_type: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tombstoned: bool,
    /// Hex SHA-256 of the stored payload bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub versions: Vec<VersionEntry>,
    /// Fencing token of the last lock holder that committed to this catalog.
    #[serde(default)]
    pub fencing_token: u64,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), versions: Vec::new(), fencing_token: 0 } }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        let mut entry: CatalogEntry = serde_json::from_slice(bytes)?;
        entry.versions.sort_by_key(|v| v.version);
        Ok(entry)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> { serde_json::to_vec_pretty(self) }

    /// Highest non-tombstoned version.
    pub fn latest(&self) -> Option<Version> { self.live().map(|v| v.version).max() }

    /// Highest version ever assigned, tombstoned or not. New versions must exceed it.
    pub fn highest_assigned(&self) -> Option<Version> { self.versions.iter().map(|v| v.version).max() }

    pub fn next_version(&self) -> Version { self.highest_assigned().map(Version::next).unwrap_or(Version::FIRST) }

    pub fn live(&self) -> impl Iterator<Item = &VersionEntry> { self.versions.iter().filter(|v| !v.tombstoned) }

    pub fn live_versions(&self) -> Vec<Version> { self.live().map(|v| v.version).collect() }

    pub fn has_live_versions(&self) -> bool { self.live().next().is_some() }

    /// Live entry for `version`, or the latest live entry when `version` is `None`.
    pub fn resolve(&self, version: Option<Version>) -> Option<&VersionEntry> {
        match version {
            Some(v) => self.live().find(|e| e.version == v),
            None => self.live().max_by_key(|e| e.version),
        }
    }

    pub fn push_version(&mut self, entry: VersionEntry) {
        self.versions.push(entry);
        self.versions.sort_by_key(|v| v.version);
    }

    /// Marks a live version deleted. Returns the tombstoned entry, `None` if absent or already gone.
    pub fn tombstone(&mut self, version: Version) -> Option<&VersionEntry> {
        let entry = self.versions.iter_mut().find(|e| e.version == version && !e.tombstoned)?;
        entry.tombstoned = true;
        Some(entry)
    }
}
