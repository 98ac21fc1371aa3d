//! REST client for a record queue service
//!
//! - `GET  /targets/{target}/records?status=unprocessed`
//! - `GET  /targets/{target}/records?status=processed&limit={n}`
//! - `POST /records/{id}/claim` with `{"experiment_id": ..., "claim_token": ...}`
//!   → `{"claimed": bool}`; a repeated claim with the same token answers
//!   `true` again, so a retried claim whose first response was lost still
//!   reports the win
//! - `POST /records`, `POST /audits`

use super::RecordQueue;
use crate::error::QueueError;
use crate::models::{QueueRecord, RecommendationAudit};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub struct HttpRecordQueue {
    client: Client,
    base_url: Url,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ClaimRequest<'a> {
    experiment_id: &'a str,
    claim_token: String,
}

#[derive(Deserialize)]
struct ClaimResponse {
    claimed: bool,
}

impl HttpRecordQueue {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QueueError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueueError::Rejected(format!("failed to create HTTP client: {e}")))?;
        let base_url = Url::parse(base_url)
            .map_err(|e| QueueError::Rejected(format!("invalid queue URL `{base_url}`: {e}")))?;

        Ok(Self {
            client,
            base_url,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, QueueError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| QueueError::Rejected(format!("queue URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send with retries; non-success statuses become errors
    async fn execute(
        &self,
        operation: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, QueueError> {
        self.retry
            .run(operation, || async {
                let response = build()
                    .send()
                    .await
                    .map_err(|e| QueueError::Transient(e.to_string()))?;
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(QueueError::Transient(format!("queue returned {status}")));
                }
                let body = response.text().await.unwrap_or_default();
                if status == StatusCode::NOT_FOUND {
                    return Err(QueueError::UnknownRecord(body));
                }
                Err(QueueError::Rejected(format!("{status}: {body}")))
            })
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<T, QueueError> {
        self.execute(operation, build)
            .await?
            .json::<T>()
            .await
            .map_err(|e| QueueError::Rejected(format!("unreadable queue response: {e}")))
    }

    async fn send(&self, operation: &str, build: impl Fn() -> RequestBuilder) -> Result<(), QueueError> {
        self.execute(operation, build).await.map(|_| ())
    }
}

#[async_trait]
impl RecordQueue for HttpRecordQueue {
    async fn unprocessed(&self, target: &str) -> Result<Vec<QueueRecord>, QueueError> {
        let url = self.url(&["targets", target, "records"])?;
        self.call("queue.unprocessed", || {
            self.client
                .get(url.clone())
                .query(&[("status", "unprocessed")])
        })
        .await
    }

    async fn recent_processed(
        &self,
        target: &str,
        limit: usize,
    ) -> Result<Vec<QueueRecord>, QueueError> {
        let url = self.url(&["targets", target, "records"])?;
        let limit = limit.to_string();
        self.call("queue.recent_processed", || {
            self.client
                .get(url.clone())
                .query(&[("status", "processed"), ("limit", limit.as_str())])
        })
        .await
    }

    async fn mark_processed(&self, id: &str, experiment_id: &str) -> Result<bool, QueueError> {
        let url = self.url(&["records", id, "claim"])?;
        // one token for every attempt of this claim
        let body = ClaimRequest {
            experiment_id,
            claim_token: format!("{:016x}", rand::random::<u64>()),
        };
        let response: ClaimResponse = self
            .call("queue.claim", || self.client.post(url.clone()).json(&body))
            .await?;
        Ok(response.claimed)
    }

    async fn insert_audit(&self, audit: &RecommendationAudit) -> Result<(), QueueError> {
        let url = self.url(&["audits"])?;
        self.send("queue.insert_audit", || self.client.post(url.clone()).json(audit))
            .await
    }

    async fn insert(&self, record: QueueRecord) -> Result<(), QueueError> {
        let url = self.url(&["records"])?;
        self.send("queue.insert", || self.client.post(url.clone()).json(&record))
            .await
    }
}
