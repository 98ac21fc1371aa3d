//! Wires configured backends into the tuner's collaborators

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tuner_lib::config::{PolicyBackend, QueueSettings, StoreSettings};
use tuner_lib::policy::{LocalPolicyFactory, PolicyFactory, RemotePolicyFactory};
use tuner_lib::queue::{HttpRecordQueue, InMemoryRecordQueue, RecordQueue};
use tuner_lib::store::{FileModelStore, HttpModelStore, InMemoryModelStore, ModelStore};
use tuner_lib::target::{
    HttpInvocationTransport, HttpResourceUpdater, InvocationTransport, PayloadGenerator,
    ResourceUpdater, SimulatedTarget,
};
use tuner_lib::TunerConfig;

/// Everything a command needs to act on one target
///
/// Retries live in the HTTP clients built here, each with the configured
/// budget; the controller, load generator and orchestrator call once.
pub struct Runtime {
    pub config: TunerConfig,
    pub target: String,
    pub store: Arc<dyn ModelStore>,
    pub queue: Arc<dyn RecordQueue>,
    pub policies: Arc<dyn PolicyFactory>,
    pub updater: Option<Arc<dyn ResourceUpdater>>,
    pub transport: Arc<dyn InvocationTransport>,
    pub payloads: Arc<dyn PayloadGenerator>,
    pub endpoint: String,
    /// Set when running against the in-process simulator
    pub simulator: Option<Arc<SimulatedTarget>>,
}

impl Runtime {
    /// Build the collaborators for `target`
    ///
    /// With `simulate`, invocations, allocations and the record queue are
    /// all served in-process; the model store stays as configured.
    pub fn build(config: TunerConfig, target: &str, simulate: bool) -> Result<Self> {
        let settings = config.target(target);
        let policy_config = config.policy.to_policy_config()?;

        let store: Arc<dyn ModelStore> = match &config.store {
            StoreSettings::File { dir } => Arc::new(FileModelStore::new(dir.clone())),
            StoreSettings::Http {
                endpoint,
                bucket,
                timeout_ms,
            } => Arc::new(
                HttpModelStore::new(endpoint, bucket.clone(), millis(*timeout_ms))
                    .context("Failed to create model store client")?
                    .with_retry(config.retry.clone()),
            ),
            StoreSettings::Memory => Arc::new(InMemoryModelStore::new()),
        };

        let policies: Arc<dyn PolicyFactory> = match &config.policy.backend {
            PolicyBackend::Local => Arc::new(LocalPolicyFactory::new(policy_config, store.clone())),
            PolicyBackend::Remote {
                agent_url,
                bucket,
                timeout_ms,
            } => Arc::new(RemotePolicyFactory::new(
                agent_url.clone(),
                bucket.clone(),
                policy_config,
                millis(*timeout_ms),
                config.retry.clone(),
            )),
        };

        let payloads: Arc<dyn PayloadGenerator> =
            Arc::from(settings.payload.build(config.policy.seed)?);

        if simulate {
            let queue = Arc::new(InMemoryRecordQueue::new());
            let simulator = Arc::new(SimulatedTarget::new(
                queue.clone(),
                config.simulation.clone(),
                config.policy.seed,
            ));
            return Ok(Self {
                target: target.to_string(),
                store,
                queue,
                policies,
                updater: Some(simulator.clone()),
                transport: simulator.clone(),
                payloads,
                endpoint: SimulatedTarget::endpoint(target),
                simulator: Some(simulator),
                config,
            });
        }

        let queue: Arc<dyn RecordQueue> = match &config.queue {
            QueueSettings::Http {
                endpoint,
                timeout_ms,
            } => Arc::new(
                HttpRecordQueue::new(endpoint, millis(*timeout_ms))
                    .context("Failed to create record queue client")?
                    .with_retry(config.retry.clone()),
            ),
            // nothing would ever fill it
            QueueSettings::Memory => Arc::new(InMemoryRecordQueue::new()),
        };

        let updater = match &settings.updater_endpoint {
            Some(endpoint) => Some(Arc::new(
                HttpResourceUpdater::new(endpoint, settings.timeout())
                    .context("Failed to create resource updater client")?
                    .with_retry(config.retry.clone()),
            ) as Arc<dyn ResourceUpdater>),
            None => None,
        };

        let transport = Arc::new(
            HttpInvocationTransport::new(settings.timeout())
                .context("Failed to create invocation client")?
                .with_retry(config.retry.clone()),
        );

        let endpoint = settings.invoke_endpoint.clone().unwrap_or_default();

        Ok(Self {
            target: target.to_string(),
            store,
            queue,
            policies,
            updater,
            transport,
            payloads,
            endpoint,
            simulator: None,
            config,
        })
    }

    /// Fail unless the target can receive load
    pub fn require_endpoint(&self) -> Result<&str> {
        if self.endpoint.is_empty() {
            return Err(anyhow!(
                "target `{}` has no invoke_endpoint configured (or use --simulate)",
                self.target
            ));
        }
        Ok(&self.endpoint)
    }

    /// Fail unless allocations can be changed
    pub fn require_updater(&self) -> Result<Arc<dyn ResourceUpdater>> {
        self.updater.clone().ok_or_else(|| {
            anyhow!(
                "target `{}` has no updater_endpoint configured (or use --simulate)",
                self.target
            )
        })
    }

    /// Fail unless records can reach the controller
    pub fn require_queue(&self) -> Result<()> {
        if self.simulator.is_none() && self.config.queue == QueueSettings::Memory {
            return Err(anyhow!(
                "an http record queue must be configured (or use --simulate)"
            ));
        }
        Ok(())
    }
}

fn millis(ms: u64) -> std::time::Duration {
    std::time::Duration::from_millis(ms)
}
