//! Error taxonomy for the tuner
//!
//! Each seam has its own error enum; [`TunerError`] folds them into the
//! four classes the controller reacts to (missing model, bad observation,
//! transient I/O, fatal configuration) plus the single-writer violations.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the policy engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    /// Action, probability or context of an observation is unusable
    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    /// Context for a recommendation lacks a feature or holds a non-finite value
    #[error("invalid context: {0}")]
    InvalidContext(String),

    /// Engine configuration (action space, features, epsilon) is unusable
    #[error("invalid policy configuration: {0}")]
    Config(String),
}

/// Errors raised by model stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no model stored under `{0}`")]
    NotFound(String),

    /// Another writer saved the key since this engine loaded it
    #[error("model `{key}` was modified concurrently (based on revision {expected}, store has {found})")]
    Conflict { key: String, expected: u64, found: u64 },

    #[error("stored model `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("model store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model store unreachable: {0}")]
    Transient(String),

    #[error("model serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the record queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("record queue unreachable: {0}")]
    Transient(String),

    #[error("record queue rejected request: {0}")]
    Rejected(String),

    #[error("unknown record `{0}`")]
    UnknownRecord(String),
}

/// Errors raised by the resource updater and the invocation transport
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("target unreachable: {0}")]
    Transient(String),

    #[error("target rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("target call timed out after {0:?}")]
    Timeout(Duration),
}

/// Crate-level error used by the control loop and orchestrator
#[derive(Debug, Error)]
pub enum TunerError {
    /// Store has no object for the key; callers start a fresh engine
    #[error("no stored model under `{0}`")]
    ModelLoad(String),

    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("model `{key}` was modified concurrently (based on revision {expected}, store has {found})")]
    Conflict { key: String, expected: u64, found: u64 },

    #[error("target `{0}` already has an active controller")]
    TargetBusy(String),

    #[error("{0}")]
    Internal(String),
}

impl TunerError {
    /// Whether retrying the failed call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, TunerError::TransientIo(_))
    }
}

impl From<PolicyError> for TunerError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::InvalidObservation(msg) | PolicyError::InvalidContext(msg) => {
                TunerError::InvalidObservation(msg)
            }
            PolicyError::Config(msg) => TunerError::FatalConfig(msg),
        }
    }
}

impl From<StoreError> for TunerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => TunerError::ModelLoad(key),
            StoreError::Conflict {
                key,
                expected,
                found,
            } => TunerError::Conflict {
                key,
                expected,
                found,
            },
            StoreError::Transient(msg) => TunerError::TransientIo(msg),
            StoreError::Io(e) => TunerError::TransientIo(e.to_string()),
            other => TunerError::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for TunerError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Transient(msg) => TunerError::TransientIo(msg),
            other => TunerError::Internal(other.to_string()),
        }
    }
}

impl From<TargetError> for TunerError {
    fn from(e: TargetError) -> Self {
        match e {
            TargetError::Transient(msg) => TunerError::TransientIo(msg),
            TargetError::Timeout(d) => TunerError::TransientIo(format!("timed out after {d:?}")),
            other => TunerError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_model_load() {
        let err: TunerError = StoreError::NotFound("fn_exp.model".to_string()).into();
        assert!(matches!(err, TunerError::ModelLoad(ref k) if k == "fn_exp.model"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        let err: TunerError = TargetError::Timeout(Duration::from_secs(3)).into();
        assert!(err.is_transient());

        let err: TunerError = TargetError::Rejected {
            status: 400,
            body: "bad memory size".to_string(),
        }
        .into();
        assert!(!err.is_transient());

        let err: TunerError = QueueError::Transient("connection refused".to_string()).into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_policy_config_is_fatal() {
        let err: TunerError = PolicyError::Config("empty action space".to_string()).into();
        assert!(matches!(err, TunerError::FatalConfig(_)));
    }
}
