//! Serving side of the policy boundary
//!
//! Keeps one engine per model in memory, loads it from the store on first
//! use and saves it after every observation.

use super::wire::{ServeAction, ServeConfig, ServeRequest, ServeResponse};
use super::{PolicyConfig, PolicyEngine, DEFAULT_EPSILON, DEFAULT_RIDGE};
use crate::error::{PolicyError, StoreError, TunerError};
use crate::models::ActionSpace;
use crate::observability::{StructuredLogger, TunerMetrics};
use crate::store::{ModelKey, ModelStore};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type SharedEngine = Arc<Mutex<PolicyEngine>>;

pub struct PolicyService {
    store: Arc<dyn ModelStore>,
    engines: DashMap<ModelKey, SharedEngine>,
    default_epsilon: f64,
    metrics: TunerMetrics,
    logger: StructuredLogger,
}

impl PolicyService {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self {
            store,
            engines: DashMap::new(),
            default_epsilon: DEFAULT_EPSILON,
            metrics: TunerMetrics::new(),
            logger: StructuredLogger::new("policy_service"),
        }
    }

    pub fn with_default_epsilon(mut self, epsilon: f64) -> Self {
        self.default_epsilon = epsilon;
        self
    }

    /// Number of models currently held in memory
    pub fn cached_models(&self) -> usize {
        self.engines.len()
    }

    pub async fn handle(&self, request: &ServeRequest) -> Result<ServeResponse, TunerError> {
        let config = self.policy_config(&request.config)?;
        let key = model_key(&request.target.bucket, &request.target.key)?;
        let engine = self.engine(&key, &config).await?;

        match request.action {
            ServeAction::Recommend => {
                let context = request.request.context();
                let recommendation = engine.lock().await.recommend(&context)?;
                self.metrics.inc_recommendations();
                debug!(
                    key = %key,
                    recommended = recommendation.size_mb,
                    probability = recommendation.probability,
                    "Served recommendation"
                );
                Ok(ServeResponse::recommended(&recommendation))
            }
            ServeAction::Observe => {
                let observation = request.request.observation(&config.action_space)?;
                let mut engine = engine.lock().await;

                // the cached engine only moves once the update is stored, so
                // a client retrying a failed save does not count it twice
                let mut next = engine.clone();
                let start = Instant::now();
                next.observe(&observation)?;
                self.metrics
                    .observe_policy_update_latency(start.elapsed().as_secs_f64());

                let snapshot = next.snapshot();
                match self.store.save(&key, &snapshot).await {
                    Ok(revision) => {
                        next.mark_persisted(revision);
                        *engine = next;
                        self.metrics.inc_observations_applied();
                        self.metrics.inc_model_saves();
                        self.logger
                            .log_model_saved(key.as_str(), revision, snapshot.updates);
                        Ok(ServeResponse::observed())
                    }
                    Err(e @ StoreError::Conflict { .. }) => {
                        // another writer owns this model now; reload on next use
                        drop(engine);
                        self.engines.remove(&key);
                        warn!(key = %key, error = %e, "Dropped cached model after conflicting save");
                        Err(e.into())
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Observation not stored, discarded");
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn policy_config(&self, config: &ServeConfig) -> Result<PolicyConfig, PolicyError> {
        let action_space = ActionSpace::new(config.action_space.clone())?;
        let policy = PolicyConfig {
            action_space,
            features: config.features.clone(),
            epsilon: config.epsilon.unwrap_or(self.default_epsilon),
            ridge: DEFAULT_RIDGE,
            seed: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    async fn engine(&self, key: &ModelKey, config: &PolicyConfig) -> Result<SharedEngine, TunerError> {
        if let Some(engine) = self.engines.get(key).map(|e| e.value().clone()) {
            {
                let guard = engine.lock().await;
                if guard.action_space() != &config.action_space || guard.features() != config.features {
                    return Err(PolicyError::Config(format!(
                        "model `{key}` is served with action space {:?} and features {:?}",
                        guard.action_space().sizes(),
                        guard.features()
                    ))
                    .into());
                }
            }
            return Ok(engine);
        }

        let engine = match self.store.load(key).await {
            Ok(state) => PolicyEngine::restore(config, state)?,
            Err(StoreError::NotFound(_)) => PolicyEngine::fresh(config)?,
            Err(e) => return Err(e.into()),
        };
        info!(key = %key, lifecycle = ?engine.lifecycle(), "Loaded model into service");

        let shared = self
            .engines
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(engine)))
            .value()
            .clone();
        Ok(shared)
    }
}

/// Store key for a bucket-qualified model reference
fn model_key(bucket: &str, key: &str) -> Result<ModelKey, PolicyError> {
    let valid = |part: &str| {
        !part.is_empty() && part != "." && part != ".." && !part.contains(['/', '\\'])
    };
    if !valid(bucket) || !valid(key) {
        return Err(PolicyError::Config(format!(
            "invalid model reference `{bucket}/{key}`"
        )));
    }
    Ok(ModelKey::from_raw(format!("{bucket}/{key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::wire::{ModelRef, ServeBody, ServeResult};
    use crate::policy::PolicyState;
    use crate::store::InMemoryModelStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn request(action: ServeAction, body: ServeBody) -> ServeRequest {
        ServeRequest {
            action,
            target: ModelRef {
                bucket: "models".to_string(),
                key: "decompress_exp.model".to_string(),
            },
            config: ServeConfig {
                action_space: vec![64, 128],
                features: vec!["bytes".to_string()],
                model_name: "decompress".to_string(),
                epsilon: None,
            },
            request: body,
        }
    }

    fn features() -> BTreeMap<String, f64> {
        BTreeMap::from([("bytes".to_string(), 100.0)])
    }

    #[tokio::test]
    async fn test_observe_then_recommend() {
        let store = Arc::new(InMemoryModelStore::new());
        let service = PolicyService::new(store.clone());

        let observe = request(
            ServeAction::Observe,
            ServeBody {
                selected_action: Some(64),
                cost: Some(-10.0),
                probability: Some(0.5),
                features: features(),
            },
        );
        let response = service.handle(&observe).await.unwrap();
        assert_eq!(response, ServeResponse::observed());
        assert_eq!(
            store.keys().await,
            vec![ModelKey::from_raw("models/decompress_exp.model")]
        );

        let recommend = request(
            ServeAction::Recommend,
            ServeBody {
                features: features(),
                ..ServeBody::default()
            },
        );
        let response = service.handle(&recommend).await.unwrap();
        let ServeResult::Recommend(result) = response.result else {
            panic!("expected recommend result");
        };
        assert!([64, 128].contains(&result.recommended_action));
        assert_eq!(result.probability_list.len(), 2);
        let sum: f64 = result.probability_list.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_mismatched_config_rejected() {
        let service = PolicyService::new(Arc::new(InMemoryModelStore::new()));
        let recommend = request(
            ServeAction::Recommend,
            ServeBody {
                features: features(),
                ..ServeBody::default()
            },
        );
        service.handle(&recommend).await.unwrap();

        let mut other = recommend.clone();
        other.config.action_space = vec![64, 128, 256];
        let err = service.handle(&other).await.unwrap_err();
        assert!(matches!(err, TunerError::FatalConfig(_)));
    }

    #[tokio::test]
    async fn test_invalid_observation_rejected() {
        let service = PolicyService::new(Arc::new(InMemoryModelStore::new()));
        let observe = request(
            ServeAction::Observe,
            ServeBody {
                selected_action: Some(64),
                cost: Some(1.0),
                probability: Some(0.0),
                features: features(),
            },
        );
        let err = service.handle(&observe).await.unwrap_err();
        assert!(matches!(err, TunerError::InvalidObservation(_)));
    }

    /// Store whose first save fails as if the backend were briefly down
    struct BlinkingStore {
        inner: InMemoryModelStore,
        fail_next_save: AtomicBool,
    }

    #[async_trait]
    impl ModelStore for BlinkingStore {
        async fn load(&self, key: &ModelKey) -> Result<PolicyState, StoreError> {
            self.inner.load(key).await
        }

        async fn save(&self, key: &ModelKey, state: &PolicyState) -> Result<u64, StoreError> {
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Transient("blob store unavailable".to_string()));
            }
            self.inner.save(key, state).await
        }
    }

    #[tokio::test]
    async fn test_failed_save_is_not_applied_twice_on_retry() {
        let store = Arc::new(BlinkingStore {
            inner: InMemoryModelStore::new(),
            fail_next_save: AtomicBool::new(true),
        });
        let service = PolicyService::new(store.clone());
        let observe = request(
            ServeAction::Observe,
            ServeBody {
                selected_action: Some(64),
                cost: Some(-10.0),
                probability: Some(0.5),
                features: features(),
            },
        );

        let err = service.handle(&observe).await.unwrap_err();
        assert!(matches!(err, TunerError::TransientIo(_)));

        // the client resends the same observation
        service.handle(&observe).await.unwrap();

        let key = ModelKey::from_raw("models/decompress_exp.model");
        let stored = store.inner.load(&key).await.unwrap();
        assert_eq!(stored.updates, 1);
        assert_eq!(stored.revision, 1);
    }

    #[test]
    fn test_model_key_rejects_traversal() {
        assert!(model_key("models", "a.model").is_ok());
        assert!(model_key("..", "a.model").is_err());
        assert!(model_key("models", "../a.model").is_err());
        assert!(model_key("", "a.model").is_err());
    }
}
