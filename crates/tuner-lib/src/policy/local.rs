use super::{Lifecycle, Policy, PolicyConfig, PolicyEngine, PolicyFactory};
use crate::error::{StoreError, TunerError};
use crate::models::{ActionSpace, Context, Observation, Recommendation};
use crate::observability::{StructuredLogger, TunerMetrics};
use crate::store::{ModelKey, ModelStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::info;

/// In-process policy persisted through a [`ModelStore`]
pub struct LocalPolicy {
    engine: Mutex<PolicyEngine>,
    store: Arc<dyn ModelStore>,
    key: ModelKey,
    action_space: ActionSpace,
    features: Vec<String>,
    warm: bool,
    metrics: TunerMetrics,
    logger: StructuredLogger,
}

impl LocalPolicy {
    /// Load the model under `key`, or start fresh when none is stored
    pub async fn open(
        config: &PolicyConfig,
        store: Arc<dyn ModelStore>,
        key: ModelKey,
    ) -> Result<Self, TunerError> {
        let engine = match store.load(&key).await {
            Ok(state) => PolicyEngine::restore(config, state)?,
            Err(StoreError::NotFound(_)) => {
                info!(key = %key, "No stored model, starting fresh");
                PolicyEngine::fresh(config)?
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            key = %key,
            lifecycle = ?engine.lifecycle(),
            revision = engine.revision(),
            updates = engine.updates(),
            "Opened policy"
        );

        Ok(Self {
            action_space: engine.action_space().clone(),
            features: engine.features().to_vec(),
            warm: engine.lifecycle() == Lifecycle::Warm,
            engine: Mutex::new(engine),
            store,
            key,
            metrics: TunerMetrics::new(),
            logger: StructuredLogger::new("policy"),
        })
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub async fn updates(&self) -> u64 {
        self.engine.lock().await.updates()
    }
}

#[async_trait]
impl Policy for LocalPolicy {
    fn action_space(&self) -> &ActionSpace {
        &self.action_space
    }

    fn features(&self) -> &[String] {
        &self.features
    }

    fn is_warm(&self) -> bool {
        self.warm
    }

    async fn observe(&self, observation: &Observation) -> Result<(), TunerError> {
        let start = Instant::now();
        self.engine.lock().await.observe(observation)?;
        self.metrics
            .observe_policy_update_latency(start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn recommend(&self, context: &Context) -> Result<Recommendation, TunerError> {
        let recommendation = self.engine.lock().await.recommend(context)?;
        self.metrics.inc_recommendations();
        Ok(recommendation)
    }

    async fn checkpoint(&self) -> Result<Option<u64>, TunerError> {
        let mut engine = self.engine.lock().await;
        if !engine.is_dirty() {
            return Ok(None);
        }

        let snapshot = engine.snapshot();
        let revision = self.store.save(&self.key, &snapshot).await?;
        engine.mark_persisted(revision);

        self.metrics.inc_model_saves();
        self.logger
            .log_model_saved(self.key.as_str(), revision, snapshot.updates);
        Ok(Some(revision))
    }
}

/// Opens [`LocalPolicy`] instances against a shared store
pub struct LocalPolicyFactory {
    config: PolicyConfig,
    store: Arc<dyn ModelStore>,
}

impl LocalPolicyFactory {
    pub fn new(config: PolicyConfig, store: Arc<dyn ModelStore>) -> Self {
        Self { config, store }
    }
}

#[async_trait]
impl PolicyFactory for LocalPolicyFactory {
    fn action_space(&self) -> &ActionSpace {
        &self.config.action_space
    }

    async fn open(&self, target: &str, experiment_id: &str) -> Result<Arc<dyn Policy>, TunerError> {
        let key = ModelKey::new(target, experiment_id);
        let policy = LocalPolicy::open(&self.config, self.store.clone(), key).await?;
        Ok(Arc::new(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryModelStore;

    fn config() -> PolicyConfig {
        PolicyConfig::new(
            ActionSpace::new(vec![64, 128]).unwrap(),
            vec!["payload_size".to_string()],
        )
        .with_seed(3)
    }

    fn ctx() -> Context {
        Context::new().with("payload_size", 100.0)
    }

    #[tokio::test]
    async fn test_fresh_then_warm() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryModelStore::new());
        let key = ModelKey::new("fn", "exp");

        let policy = LocalPolicy::open(&config(), store.clone(), key.clone())
            .await
            .unwrap();
        assert!(!policy.is_warm());
        assert_eq!(policy.checkpoint().await.unwrap(), None);

        policy
            .observe(&Observation {
                action: 2,
                context: ctx(),
                cost: 1.0,
                probability: 0.5,
            })
            .await
            .unwrap();
        assert_eq!(policy.checkpoint().await.unwrap(), Some(1));
        assert_eq!(policy.checkpoint().await.unwrap(), None);

        let reopened = LocalPolicy::open(&config(), store, key).await.unwrap();
        assert!(reopened.is_warm());
        assert_eq!(reopened.updates().await, 1);
    }

    #[tokio::test]
    async fn test_save_load_preserves_distribution() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryModelStore::new());
        let key = ModelKey::new("fn", "exp");

        let policy = LocalPolicy::open(&config(), store.clone(), key.clone())
            .await
            .unwrap();
        for i in 0..20 {
            policy
                .observe(&Observation {
                    action: 1 + i % 2,
                    context: Context::new().with("payload_size", 10.0 * i as f64),
                    cost: if i % 2 == 0 { 8.0 } else { 3.0 },
                    probability: 0.5,
                })
                .await
                .unwrap();
        }
        policy.checkpoint().await.unwrap();
        let before = policy.recommend(&ctx()).await.unwrap().distribution;

        let reopened = LocalPolicy::open(&config(), store, key).await.unwrap();
        let after = reopened.recommend(&ctx()).await.unwrap().distribution;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_mismatched_action_space_is_fatal() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryModelStore::new());
        let key = ModelKey::new("fn", "exp");
        let policy = LocalPolicy::open(&config(), store.clone(), key.clone())
            .await
            .unwrap();
        policy
            .observe(&Observation {
                action: 1,
                context: ctx(),
                cost: 1.0,
                probability: 1.0,
            })
            .await
            .unwrap();
        policy.checkpoint().await.unwrap();

        let other = PolicyConfig::new(
            ActionSpace::new(vec![64, 128, 256]).unwrap(),
            vec!["payload_size".to_string()],
        );
        let err = LocalPolicy::open(&other, store, key).await.err();
        assert!(matches!(err, Some(TunerError::FatalConfig(_))));
    }
}
