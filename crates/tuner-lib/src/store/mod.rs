//! Durable storage for policy state
//!
//! Models are saved as self-describing blobs (header line with format,
//! length and SHA256 checksum, followed by the serialized state). Every
//! save is conditional on the revision the writer started from, so a
//! second writer on the same key surfaces as [`StoreError::Conflict`]
//! instead of silently overwriting.

mod file;
mod http;
mod memory;

pub use file::FileModelStore;
pub use http::HttpModelStore;
pub use memory::InMemoryModelStore;

use crate::error::StoreError;
use crate::policy::PolicyState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Current blob format version
const BLOB_FORMAT: u32 = 1;

/// Stable name of a persisted model
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelKey(String);

impl ModelKey {
    /// `<target>_<experiment>.model`
    pub fn new(target: &str, experiment_id: &str) -> Self {
        Self(format!("{target}_{experiment_id}.model"))
    }

    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable blob storage for policy state
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Fetch the state stored under `key`
    async fn load(&self, key: &ModelKey) -> Result<PolicyState, StoreError>;

    /// Store `state`, conditional on the store still holding
    /// `state.revision` (0 meaning absent). Returns the new revision.
    async fn save(&self, key: &ModelKey, state: &PolicyState) -> Result<u64, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobHeader {
    format: u32,
    length: usize,
    checksum: String,
}

/// Serialize a state into a checksummed blob
pub fn encode_blob(state: &PolicyState) -> Result<Vec<u8>, StoreError> {
    let body = serde_json::to_vec(state)?;
    let header = BlobHeader {
        format: BLOB_FORMAT,
        length: body.len(),
        checksum: compute_checksum(&body),
    };
    let mut blob = serde_json::to_vec(&header)?;
    blob.push(b'\n');
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Parse and verify a blob produced by [`encode_blob`]
pub fn decode_blob(key: &ModelKey, blob: &[u8]) -> Result<PolicyState, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };

    let split = blob
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt("missing header".to_string()))?;
    let header: BlobHeader = serde_json::from_slice(&blob[..split])
        .map_err(|e| corrupt(format!("unreadable header: {e}")))?;
    let body = &blob[split + 1..];

    if header.format != BLOB_FORMAT {
        return Err(corrupt(format!("unsupported format {}", header.format)));
    }
    if header.length != body.len() {
        return Err(corrupt(format!(
            "truncated body: expected {} bytes, got {}",
            header.length,
            body.len()
        )));
    }
    let checksum = compute_checksum(body);
    if checksum != header.checksum {
        return Err(corrupt(format!(
            "checksum mismatch: expected {}, got {}",
            header.checksum, checksum
        )));
    }

    serde_json::from_slice(body).map_err(|e| corrupt(format!("unreadable state: {e}")))
}

/// Revision check shared by all stores
fn check_revision(key: &ModelKey, stored: Option<u64>, base: u64) -> Result<u64, StoreError> {
    let found = stored.unwrap_or(0);
    if found != base {
        return Err(StoreError::Conflict {
            key: key.to_string(),
            expected: base,
            found,
        });
    }
    Ok(base + 1)
}

/// State stamped with the revision it is being saved as
fn stamped(state: &PolicyState, revision: u64) -> PolicyState {
    let mut stamped = state.clone();
    stamped.revision = revision;
    stamped
}

/// Compute SHA256 checksum of data
fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
