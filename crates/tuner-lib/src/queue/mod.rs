//! Record queue: execution outcomes waiting to be learned from
//!
//! The queue's storage engine lives elsewhere; this module only defines
//! the operations the controller needs and two clients for them.

mod http;
mod memory;

pub use http::HttpRecordQueue;
pub use memory::InMemoryRecordQueue;

use crate::error::QueueError;
use crate::models::{QueueRecord, RecommendationAudit};
use async_trait::async_trait;

#[async_trait]
pub trait RecordQueue: Send + Sync {
    /// Unprocessed records for `target`, oldest first
    async fn unprocessed(&self, target: &str) -> Result<Vec<QueueRecord>, QueueError>;

    /// Up to `limit` processed records for `target`, newest first
    async fn recent_processed(&self, target: &str, limit: usize)
        -> Result<Vec<QueueRecord>, QueueError>;

    /// Claim a record: `unprocessed → processed`, attributed to
    /// `experiment_id`. Returns false when the record was already
    /// processed, so exactly one caller wins a concurrent claim.
    async fn mark_processed(&self, id: &str, experiment_id: &str) -> Result<bool, QueueError>;

    async fn insert_audit(&self, audit: &RecommendationAudit) -> Result<(), QueueError>;

    /// Append a new unprocessed record
    async fn insert(&self, record: QueueRecord) -> Result<(), QueueError>;
}
