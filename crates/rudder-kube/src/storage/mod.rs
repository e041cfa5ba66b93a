//! Revision store: ordered, append-only history of revisions per release
//!
//! Three backends are provided:
//! - **Secrets**: one Kubernetes Secret per revision (cluster-side default)
//! - **File**: one file per revision on local disk (development/testing)
//! - **Memory**: process-local, used by tests and embedders
//!
//! Every backend keys records by `(namespace, name, version)`. Racing
//! operations on a release meet at two points: `create` must fail with
//! [`KubeError::RevisionExists`] when the version is taken, and `update_if`
//! must fail with [`KubeError::StatusConflict`] when the stored status moved.

mod file;
mod memory;
mod secrets;

pub use file::FileDriver;
pub use memory::{MemoryDriver, OperationCounts};
pub use secrets::SecretsDriver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{KubeError, Result};
use crate::release::{ReleaseStatus, StoredRelease};

/// Label selecting every revision record written by rudder
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "rudder";
pub const NAME_LABEL: &str = "rudder.io/release-name";
pub const VERSION_LABEL: &str = "rudder.io/release-version";
pub const STATUS_LABEL: &str = "rudder.io/release-status";

/// Storage driver trait for revision persistence
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Get a specific revision
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease>;

    /// All revisions of a release, ascending by version
    ///
    /// Returns `ReleaseNotFound` when the release has no history.
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>>;

    /// List revisions across releases, optionally filtered
    async fn list(&self, namespace: Option<&str>, name: Option<&str>)
        -> Result<Vec<StoredRelease>>;

    /// Persist a new revision, failing if its version already exists
    async fn create(&self, release: &StoredRelease) -> Result<()>;

    /// Overwrite an existing revision, failing if it is absent
    async fn update(&self, release: &StoredRelease) -> Result<()>;

    /// Overwrite an existing revision only while its stored status is
    /// `expected`
    ///
    /// The check and the write are one atomic step, so an operation working
    /// from a stale copy can't overwrite the outcome of another one.
    async fn update_if(&self, release: &StoredRelease, expected: ReleaseStatus) -> Result<()>;

    /// Delete one revision
    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease>;

    /// Delete every revision of a release
    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>>;

    /// The head (highest version) revision
    async fn last(&self, namespace: &str, name: &str) -> Result<StoredRelease> {
        self.history(namespace, name)
            .await?
            .pop()
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    /// The single `deployed` revision
    async fn deployed(&self, namespace: &str, name: &str) -> Result<StoredRelease> {
        self.history(namespace, name)
            .await?
            .into_iter()
            .rev()
            .find(|r| r.status == ReleaseStatus::Deployed)
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    /// Check if a release has any history
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.history(namespace, name).await {
            Ok(history) => Ok(!history.is_empty()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Compression applied to serialized revisions
    #[serde(default)]
    pub compression: CompressionMethod,
}

/// Compression method for revision data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum CompressionMethod {
    None,

    /// Gzip compression (Helm-compatible)
    Gzip { level: u32 },

    /// Zstd compression (better ratio, faster)
    Zstd { level: i32 },
}

impl Default for CompressionMethod {
    fn default() -> Self {
        Self::Zstd { level: 3 }
    }
}

/// Compress data using the configured method
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    let compression_err = |e: std::io::Error| KubeError::Compression(e.to_string());
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { level } => {
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder.write_all(data).map_err(compression_err)?;
            encoder.finish().map_err(compression_err)
        }
        CompressionMethod::Zstd { level } => {
            zstd::encode_all(std::io::Cursor::new(data), level).map_err(compression_err)
        }
    }
}

/// Decompress data
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    let compression_err = |e: std::io::Error| KubeError::Compression(e.to_string());
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { .. } => {
            use std::io::Read;
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(compression_err)?;
            Ok(out)
        }
        CompressionMethod::Zstd { .. } => {
            zstd::decode_all(std::io::Cursor::new(data)).map_err(compression_err)
        }
    }
}

/// Serialize and compress a revision
pub fn encode_release(release: &StoredRelease, compression: CompressionMethod) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(release)?;
    compress(&json, compression)
}

/// Decompress and deserialize a revision
pub fn decode_release(data: &[u8], compression: CompressionMethod) -> Result<StoredRelease> {
    let json = decompress(data, compression)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Encode a revision as base64 text (serialize + compress + base64)
pub fn encode_for_storage(release: &StoredRelease, config: &StorageConfig) -> Result<String> {
    let compressed = encode_release(release, config.compression)?;
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        &compressed,
    ))
}

/// Decode a revision from base64 text
pub fn decode_from_storage(data: &str, compression: CompressionMethod) -> Result<StoredRelease> {
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
        .map_err(|e| KubeError::Serialization(format!("base64 decode error: {}", e)))?;
    decode_release(&decoded, compression)
}

/// Labels applied to all storage records
pub fn storage_labels(release: &StoredRelease) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (NAME_LABEL.to_string(), release.name.clone()),
        (VERSION_LABEL.to_string(), release.version.to_string()),
        (STATUS_LABEL.to_string(), release.status.to_string()),
    ])
}

/// Reject a write whose stored revision no longer has the expected status
pub(crate) fn ensure_status(stored: &StoredRelease, expected: ReleaseStatus) -> Result<()> {
    if stored.status != expected {
        return Err(KubeError::StatusConflict {
            name: stored.name.clone(),
            version: stored.version,
            expected: expected.to_string(),
            actual: stored.status.to_string(),
        });
    }
    Ok(())
}

/// Sort revisions ascending by version
pub(crate) fn sort_history(history: &mut [StoredRelease]) {
    history.sort_by_key(|r| r.version);
}
