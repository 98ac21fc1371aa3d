//! Object-storage model store over HTTP
//!
//! Speaks a minimal bucket protocol: `GET /{bucket}/{key}` returns the
//! blob (404 when absent), `PUT /{bucket}/{key}` replaces it in one shot.

use super::{check_revision, decode_blob, encode_blob, stamped, ModelKey, ModelStore};
use crate::error::StoreError;
use crate::policy::PolicyState;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

pub struct HttpModelStore {
    client: Client,
    base_url: Url,
    bucket: String,
    retry: RetryPolicy,
}

impl HttpModelStore {
    pub fn new(base_url: &str, bucket: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transient(format!("failed to create HTTP client: {e}")))?;
        let base_url = Url::parse(base_url)
            .map_err(|e| StoreError::Transient(format!("invalid store URL `{base_url}`: {e}")))?;

        Ok(Self {
            client,
            base_url,
            bucket: bucket.into(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url_for(&self, key: &ModelKey) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Transient(format!("store URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push(&self.bucket)
            .push(key.as_str());
        Ok(url)
    }

    async fn fetch(&self, key: &ModelKey) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.url_for(key)?;
        self.retry
            .run("store.get", || async {
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(request_error)?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(None),
                    s if s.is_success() => {
                        let bytes = response.bytes().await.map_err(request_error)?;
                        Ok(Some(bytes.to_vec()))
                    }
                    s => Err(status_error(s, response.text().await.unwrap_or_default())),
                }
            })
            .await
    }

    async fn put(&self, key: &ModelKey, blob: Vec<u8>) -> Result<(), StoreError> {
        let url = self.url_for(key)?;
        self.retry
            .run("store.put", || async {
                let response = self
                    .client
                    .put(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(blob.clone())
                    .send()
                    .await
                    .map_err(request_error)?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(status_error(status, response.text().await.unwrap_or_default()))
                }
            })
            .await
    }
}

fn request_error(e: reqwest::Error) -> StoreError {
    StoreError::Transient(e.to_string())
}

fn status_error(status: StatusCode, body: String) -> StoreError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StoreError::Transient(format!("store returned {status}: {body}"))
    } else {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("store returned {status}: {body}"),
        ))
    }
}

#[async_trait]
impl ModelStore for HttpModelStore {
    async fn load(&self, key: &ModelKey) -> Result<PolicyState, StoreError> {
        let blob = self
            .fetch(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        decode_blob(key, &blob)
    }

    async fn save(&self, key: &ModelKey, state: &PolicyState) -> Result<u64, StoreError> {
        let stored = match self.fetch(key).await? {
            Some(blob) => Some(decode_blob(key, &blob)?.revision),
            None => None,
        };
        let revision = check_revision(key, stored, state.revision)?;

        // serialize fully before the single-shot overwrite
        let blob = encode_blob(&stamped(state, revision))?;
        self.put(key, blob).await?;
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionSpace;
    use crate::policy::PolicyConfig;

    fn state() -> PolicyState {
        let config = PolicyConfig::new(
            ActionSpace::new(vec![64, 128]).unwrap(),
            vec!["payload_size".to_string()],
        );
        PolicyState::fresh(&config)
    }

    fn store(url: &str) -> HttpModelStore {
        HttpModelStore::new(url, "models", Duration::from_secs(5))
            .unwrap()
            .with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/models/fn_exp.model")
            .with_status(404)
            .create_async()
            .await;

        let err = store(&server.url())
            .load(&ModelKey::new("fn", "exp"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_save_puts_new_revision() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/models/fn_exp.model")
            .with_status(404)
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/models/fn_exp.model")
            .with_status(200)
            .create_async()
            .await;

        let revision = store(&server.url())
            .save(&ModelKey::new("fn", "exp"), &state())
            .await
            .unwrap();
        assert_eq!(revision, 1);
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_save_detects_newer_remote_revision() {
        let mut server = mockito::Server::new_async().await;
        let mut remote = state();
        remote.revision = 3;
        server
            .mock("GET", "/models/fn_exp.model")
            .with_status(200)
            .with_body(encode_blob(&remote).unwrap())
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/models/fn_exp.model")
            .expect(0)
            .create_async()
            .await;

        let err = store(&server.url())
            .save(&ModelKey::new("fn", "exp"), &state())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { found: 3, .. }));
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/models/fn_exp.model")
            .with_status(503)
            .create_async()
            .await;

        let err = store(&server.url())
            .load(&ModelKey::new("fn", "exp"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));
    }
}
