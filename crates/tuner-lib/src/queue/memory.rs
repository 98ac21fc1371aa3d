use super::RecordQueue;
use crate::error::QueueError;
use crate::models::{ExecutionMetrics, QueueRecord, RecommendationAudit, RecordStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Process-local queue for simulations and tests
#[derive(Default)]
pub struct InMemoryRecordQueue {
    records: RwLock<Vec<QueueRecord>>,
    audits: RwLock<Vec<RecommendationAudit>>,
    next_id: AtomicU64,
}

impl InMemoryRecordQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an unprocessed record with a generated id; returns the id
    pub async fn push(&self, target: &str, payload: ExecutionMetrics) -> String {
        let id = format!("rec-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.records.write().await.push(QueueRecord {
            id: id.clone(),
            target: target.to_string(),
            payload,
            created_at: Utc::now(),
            status: RecordStatus::Unprocessed,
            experiment_id: None,
        });
        id
    }

    pub async fn records(&self) -> Vec<QueueRecord> {
        self.records.read().await.clone()
    }

    pub async fn audits(&self) -> Vec<RecommendationAudit> {
        self.audits.read().await.clone()
    }

    pub async fn pending(&self, target: &str) -> usize {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.target == target && r.status == RecordStatus::Unprocessed)
            .count()
    }
}

#[async_trait]
impl RecordQueue for InMemoryRecordQueue {
    async fn unprocessed(&self, target: &str) -> Result<Vec<QueueRecord>, QueueError> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.target == target && r.status == RecordStatus::Unprocessed)
            .cloned()
            .collect();
        // stable: insertion order breaks timestamp ties
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn recent_processed(
        &self,
        target: &str,
        limit: usize,
    ) -> Result<Vec<QueueRecord>, QueueError> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.target == target && r.status == RecordStatus::Processed)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    async fn mark_processed(&self, id: &str, experiment_id: &str) -> Result<bool, QueueError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| QueueError::UnknownRecord(id.to_string()))?;

        if record.status == RecordStatus::Processed {
            return Ok(false);
        }
        record.status = RecordStatus::Processed;
        record.experiment_id = Some(experiment_id.to_string());
        Ok(true)
    }

    async fn insert_audit(&self, audit: &RecommendationAudit) -> Result<(), QueueError> {
        self.audits.write().await.push(audit.clone());
        Ok(())
    }

    async fn insert(&self, record: QueueRecord) -> Result<(), QueueError> {
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(QueueError::Rejected(format!("duplicate record id `{}`", record.id)));
        }
        records.push(record);
        Ok(())
    }
}
