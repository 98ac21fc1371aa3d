//! HTTP clients for the target's control plane and invocation endpoint

use super::{InvocationTransport, ResourceUpdater};
use crate::error::TargetError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

fn build_client(timeout: Duration) -> Result<Client, TargetError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TargetError::Transient(format!("failed to create HTTP client: {e}")))
}

fn request_error(e: reqwest::Error, timeout: Duration) -> TargetError {
    if e.is_timeout() {
        TargetError::Timeout(timeout)
    } else {
        TargetError::Transient(e.to_string())
    }
}

async fn status_error(response: Response) -> TargetError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TargetError::Transient(format!("{status}: {body}"))
    } else {
        TargetError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Allocation {
    memory_size: u32,
}

/// Changes allocations through `PUT /functions/{target}/memory`
pub struct HttpResourceUpdater {
    client: Client,
    base_url: Url,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpResourceUpdater {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TargetError> {
        let base_url = Url::parse(base_url).map_err(|e| TargetError::Rejected {
            status: 0,
            body: format!("invalid updater URL `{base_url}`: {e}"),
        })?;
        Ok(Self {
            client: build_client(timeout)?,
            base_url,
            timeout,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url_for(&self, target: &str) -> Result<Url, TargetError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TargetError::Rejected {
                status: 0,
                body: format!("updater URL {} cannot be a base", self.base_url),
            })?
            .pop_if_empty()
            .extend(["functions", target, "memory"]);
        Ok(url)
    }
}

#[async_trait]
impl ResourceUpdater for HttpResourceUpdater {
    async fn set_allocation(&self, target: &str, size_mb: u32) -> Result<(), TargetError> {
        let url = self.url_for(target)?;
        let body = Allocation {
            memory_size: size_mb,
        };
        self.retry
            .run("updater.set_allocation", || async {
                let response = self
                    .client
                    .put(url.clone())
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| request_error(e, self.timeout))?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(status_error(response).await)
                }
            })
            .await
    }

    async fn current_allocation(&self, target: &str) -> Result<Option<u32>, TargetError> {
        let url = self.url_for(target)?;
        self.retry
            .run("updater.current_allocation", || async {
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| request_error(e, self.timeout))?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(None),
                    s if s.is_success() => {
                        let allocation: Allocation = response
                            .json()
                            .await
                            .map_err(|e| TargetError::Transient(e.to_string()))?;
                        Ok(Some(allocation.memory_size))
                    }
                    _ => Err(status_error(response).await),
                }
            })
            .await
    }
}

/// Invokes targets with a JSON POST to their endpoint
pub struct HttpInvocationTransport {
    client: Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpInvocationTransport {
    pub fn new(timeout: Duration) -> Result<Self, TargetError> {
        Ok(Self {
            client: build_client(timeout)?,
            timeout,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl InvocationTransport for HttpInvocationTransport {
    async fn invoke(&self, endpoint: &str, payload: &Value) -> Result<Value, TargetError> {
        self.retry
            .run("transport.invoke", || async {
                let response = self
                    .client
                    .post(endpoint)
                    .json(payload)
                    .send()
                    .await
                    .map_err(|e| request_error(e, self.timeout))?;
                if !response.status().is_success() {
                    return Err(status_error(response).await);
                }
                let text = response
                    .text()
                    .await
                    .map_err(|e| request_error(e, self.timeout))?;
                // non-JSON bodies are kept as plain strings
                Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
            })
            .await
    }
}
