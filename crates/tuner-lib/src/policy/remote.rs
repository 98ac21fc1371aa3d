//! Client for a policy agent reachable over HTTP

use super::wire::{
    ModelRef, ServeAction, ServeBody, ServeConfig, ServeError, ServeRequest, ServeResponse,
    ServeResult,
};
use super::{Policy, PolicyConfig, PolicyFactory};
use crate::error::TunerError;
use crate::models::{ActionSpace, Context, Observation, Recommendation};
use crate::retry::RetryPolicy;
use crate::store::ModelKey;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Policy hosted by a remote agent
///
/// The agent persists after every observation, so `checkpoint` is a no-op.
pub struct RemotePolicy {
    client: Client,
    invoke_url: Url,
    target: ModelRef,
    config: ServeConfig,
    action_space: ActionSpace,
    retry: RetryPolicy,
}

impl RemotePolicy {
    pub fn new(
        agent_url: &str,
        bucket: &str,
        key: &ModelKey,
        model_name: &str,
        config: &PolicyConfig,
        timeout: Duration,
    ) -> Result<Self, TunerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TunerError::FatalConfig(format!("failed to create HTTP client: {e}")))?;
        let invoke_url = Url::parse(agent_url)
            .and_then(|u| u.join("invoke"))
            .map_err(|e| TunerError::FatalConfig(format!("invalid agent URL `{agent_url}`: {e}")))?;

        Ok(Self {
            client,
            invoke_url,
            target: ModelRef {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            config: ServeConfig {
                action_space: config.action_space.sizes().to_vec(),
                features: config.features.clone(),
                model_name: model_name.to_string(),
                epsilon: Some(config.epsilon),
            },
            action_space: config.action_space.clone(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send(&self, action: ServeAction, body: ServeBody) -> Result<ServeResponse, TunerError> {
        let request = ServeRequest {
            action,
            target: self.target.clone(),
            config: self.config.clone(),
            request: body,
        };

        self.retry
            .run("policy.invoke", || async {
                let response = self
                    .client
                    .post(self.invoke_url.clone())
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| TunerError::TransientIo(format!("policy agent: {e}")))?;

                let status = response.status();
                if status.is_success() {
                    return response
                        .json::<ServeResponse>()
                        .await
                        .map_err(|e| TunerError::Internal(format!("unreadable agent response: {e}")));
                }

                let message = match response.json::<ServeError>().await {
                    Ok(body) => body.error,
                    Err(_) => status.to_string(),
                };
                Err(match status {
                    StatusCode::UNPROCESSABLE_ENTITY => TunerError::InvalidObservation(message),
                    StatusCode::BAD_REQUEST => TunerError::FatalConfig(message),
                    s if s.is_server_error() => TunerError::TransientIo(message),
                    _ => TunerError::Internal(format!("policy agent returned {status}: {message}")),
                })
            })
            .await
    }
}

#[async_trait]
impl Policy for RemotePolicy {
    fn action_space(&self) -> &ActionSpace {
        &self.action_space
    }

    fn features(&self) -> &[String] {
        &self.config.features
    }

    fn is_warm(&self) -> bool {
        false
    }

    async fn observe(&self, observation: &Observation) -> Result<(), TunerError> {
        let body = ServeBody::for_observation(observation, &self.action_space);
        match self.send(ServeAction::Observe, body).await?.result {
            ServeResult::Observed(_) => Ok(()),
            ServeResult::Recommend(_) => Err(TunerError::Internal(
                "agent answered observe with a recommendation".to_string(),
            )),
        }
    }

    async fn recommend(&self, context: &Context) -> Result<Recommendation, TunerError> {
        match self
            .send(ServeAction::Recommend, ServeBody::for_context(context))
            .await?
            .result
        {
            ServeResult::Recommend(result) => Ok(result.into_recommendation(&self.action_space)?),
            ServeResult::Observed(_) => Err(TunerError::Internal(
                "agent answered recommend without a recommendation".to_string(),
            )),
        }
    }

    async fn checkpoint(&self) -> Result<Option<u64>, TunerError> {
        Ok(None)
    }
}

/// Opens [`RemotePolicy`] clients for one agent and bucket
pub struct RemotePolicyFactory {
    agent_url: String,
    bucket: String,
    config: PolicyConfig,
    timeout: Duration,
    retry: RetryPolicy,
}

impl RemotePolicyFactory {
    pub fn new(
        agent_url: impl Into<String>,
        bucket: impl Into<String>,
        config: PolicyConfig,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            agent_url: agent_url.into(),
            bucket: bucket.into(),
            config,
            timeout,
            retry,
        }
    }
}

#[async_trait]
impl PolicyFactory for RemotePolicyFactory {
    fn action_space(&self) -> &ActionSpace {
        &self.config.action_space
    }

    async fn open(&self, target: &str, experiment_id: &str) -> Result<Arc<dyn Policy>, TunerError> {
        let key = ModelKey::new(target, experiment_id);
        let policy = RemotePolicy::new(
            &self.agent_url,
            &self.bucket,
            &key,
            target,
            &self.config,
            self.timeout,
        )?
        .with_retry(self.retry.clone());
        Ok(Arc::new(policy))
    }
}
