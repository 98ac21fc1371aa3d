//! Benchmark sweeps over forced memory configurations
//!
//! For each configuration the orchestrator pins the target's allocation,
//! runs a load generator and a shadow control loop side by side, gives
//! in-flight records a grace period to land and then stops the loop with
//! a bounded drain. Configurations never overlap.

use crate::control::{ControlConfig, ControlLoopBuilder, ControlMode, ControlStats, LeaseRegistry};
use crate::error::TunerError;
use crate::load::{LoadConfig, LoadGenerator, LoadReport};
use crate::models::{ActionSpace, Experiment};
use crate::observability::StructuredLogger;
use crate::policy::PolicyFactory;
use crate::queue::RecordQueue;
use crate::target::{InvocationTransport, PayloadGenerator, ResourceUpdater};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sweep settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Forced configurations in sweep order; empty means the whole action space
    #[serde(default)]
    pub sizes: Vec<u32>,

    /// Wait after the load finishes for records to reach the queue
    #[serde(default = "default_grace")]
    pub grace_ms: u64,

    /// How long a cancelled control loop may take to stop
    #[serde(default = "default_drain")]
    pub drain_ms: u64,

    /// Experiment id is `<prefix>_<target>`
    #[serde(default = "default_prefix")]
    pub experiment_prefix: String,
}

fn default_grace() -> u64 {
    60_000
}

fn default_drain() -> u64 {
    10_000
}

fn default_prefix() -> String {
    "benchmark".to_string()
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            sizes: Vec::new(),
            grace_ms: default_grace(),
            drain_ms: default_drain(),
            experiment_prefix: default_prefix(),
        }
    }
}

impl BenchmarkConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }

    /// Sweep configurations, defaulting to every size of `space`
    pub fn sizes_for(&self, space: &ActionSpace) -> Vec<u32> {
        if self.sizes.is_empty() {
            space.sizes().to_vec()
        } else {
            self.sizes.clone()
        }
    }

    pub fn experiment(&self, target: &str, space: &ActionSpace) -> Experiment {
        Experiment::new(
            format!("{}_{}", self.experiment_prefix, target),
            target,
            self.sizes_for(space),
        )
    }

    pub fn validate(&self, space: &ActionSpace) -> Result<(), TunerError> {
        if self.drain_ms == 0 {
            return Err(TunerError::FatalConfig("benchmark drain must be positive".to_string()));
        }
        if self.experiment_prefix.is_empty() {
            return Err(TunerError::FatalConfig(
                "benchmark experiment prefix must not be empty".to_string(),
            ));
        }
        validate_sweep(&self.sizes_for(space), space)
    }
}

/// Sweep sizes must be a non-empty list drawn from the action space
pub fn validate_sweep(sizes: &[u32], space: &ActionSpace) -> Result<(), TunerError> {
    if sizes.is_empty() {
        return Err(TunerError::FatalConfig("benchmark sweep is empty".to_string()));
    }
    if let Some(size) = sizes.iter().find(|s| space.action_for(**s).is_none()) {
        return Err(TunerError::FatalConfig(format!(
            "sweep size {size} is not in the action space {:?}",
            space.sizes()
        )));
    }
    Ok(())
}

/// Outcome of one forced configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationReport {
    pub size_mb: u32,
    pub experiment_id: String,
    pub load: LoadReport,
    /// Present when the control loop stopped cleanly
    pub control: Option<ControlStats>,
    /// Why the configuration's controller (or setup) failed
    pub error: Option<String>,
}

/// Outcome of a whole sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub experiment_id: String,
    pub target: String,
    pub configurations: Vec<ConfigurationReport>,
    /// The sweep was stopped before it completed
    pub cancelled: bool,
}

impl SweepReport {
    pub fn failures(&self) -> usize {
        self.configurations
            .iter()
            .filter(|c| c.error.is_some())
            .count()
    }
}

pub struct ExperimentOrchestrator {
    updater: Arc<dyn ResourceUpdater>,
    queue: Arc<dyn RecordQueue>,
    policies: Arc<dyn PolicyFactory>,
    transport: Arc<dyn InvocationTransport>,
    payloads: Arc<dyn PayloadGenerator>,
    endpoint: String,
    control: ControlConfig,
    load: LoadConfig,
    benchmark: BenchmarkConfig,
    leases: LeaseRegistry,
    logger: StructuredLogger,
}

impl ExperimentOrchestrator {
    /// Run every configuration of `experiment` in order
    ///
    /// Fails only on an invalid sweep or load configuration, before any
    /// allocation is touched. Controller and setup failures are logged and
    /// recorded per configuration.
    pub async fn run(
        &self,
        experiment: &Experiment,
        cancel: CancellationToken,
    ) -> Result<SweepReport, TunerError> {
        validate_sweep(&experiment.configurations, self.policies.action_space())?;
        self.load.validate()?;

        self.logger
            .log_sweep_started(&experiment.target, &experiment.id, &experiment.configurations);

        let mut report = SweepReport {
            experiment_id: experiment.id.clone(),
            target: experiment.target.clone(),
            configurations: Vec::with_capacity(experiment.configurations.len()),
            cancelled: false,
        };

        for &size in &experiment.configurations {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.run_configuration(experiment, size, &cancel).await;
            self.logger.log_configuration_finished(
                &experiment.target,
                &outcome.experiment_id,
                size,
                outcome.load.sent,
                outcome.load.failed,
                outcome.error.as_deref(),
            );
            report.configurations.push(outcome);
        }
        report.cancelled = cancel.is_cancelled();

        info!(
            experiment_id = %report.experiment_id,
            configurations = report.configurations.len(),
            failures = report.failures(),
            cancelled = report.cancelled,
            "Benchmark sweep finished"
        );
        Ok(report)
    }

    async fn run_configuration(
        &self,
        experiment: &Experiment,
        size: u32,
        cancel: &CancellationToken,
    ) -> ConfigurationReport {
        let target = experiment.target.as_str();
        let experiment_id = experiment.configuration_id(size);
        let mut outcome = ConfigurationReport {
            size_mb: size,
            experiment_id: experiment_id.clone(),
            load: LoadReport::default(),
            control: None,
            error: None,
        };

        if let Err(e) = self.updater.set_allocation(target, size).await {
            error!(target = %target, size_mb = size, error = %e, "Could not force configuration");
            outcome.error = Some(format!("setting allocation failed: {e}"));
            return outcome;
        }

        let policy = match self.policies.open(target, &experiment_id).await {
            Ok(policy) => policy,
            Err(e) => {
                error!(target = %target, experiment_id = %experiment_id, error = %e, "Could not open policy");
                outcome.error = Some(format!("opening policy failed: {e}"));
                return outcome;
            }
        };

        let control = ControlLoopBuilder::new(target)
            .policy(policy)
            .queue(self.queue.clone())
            .updater(self.updater.clone())
            .leases(self.leases.clone())
            .experiment_id(experiment_id.clone())
            .poll_interval(self.control.poll_interval)
            .context_window(self.control.context_window)
            .objective(self.control.objective)
            .checkpoint_every(self.control.checkpoint_every)
            .mode(ControlMode::Shadow)
            .build();
        let control = match control {
            Ok(control) => control,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        let control_token = cancel.child_token();
        let mut handle = tokio::spawn(control.run(control_token.clone()));

        let load = LoadGenerator::new(
            target,
            self.endpoint.clone(),
            self.transport.clone(),
            self.payloads.clone(),
            self.load.clone(),
        );
        match load.run(cancel.child_token()).await {
            Ok(load_report) => outcome.load = load_report,
            Err(e) => warn!(target = %target, error = %e, "Load generator failed"),
        }

        info!(
            target = %target,
            size_mb = size,
            grace_ms = self.benchmark.grace_ms,
            "Load finished, waiting for in-flight records"
        );
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.benchmark.grace()) => {}
        }

        control_token.cancel();
        match tokio::time::timeout(self.benchmark.drain(), &mut handle).await {
            Ok(Ok(Ok(stats))) => outcome.control = Some(stats),
            Ok(Ok(Err(e))) => outcome.error = Some(e.to_string()),
            Ok(Err(join_error)) => outcome.error = Some(format!("control loop panicked: {join_error}")),
            Err(_) => {
                warn!(
                    target = %target,
                    drain_ms = self.benchmark.drain_ms,
                    "Control loop did not drain in time, aborting"
                );
                handle.abort();
                // wait for the aborted task so its lease is released
                let _ = handle.await;
                outcome.error = Some(format!(
                    "control loop did not stop within {:?}",
                    self.benchmark.drain()
                ));
            }
        }
        outcome
    }
}

/// Builder for an experiment orchestrator
pub struct ExperimentOrchestratorBuilder {
    updater: Option<Arc<dyn ResourceUpdater>>,
    queue: Option<Arc<dyn RecordQueue>>,
    policies: Option<Arc<dyn PolicyFactory>>,
    transport: Option<Arc<dyn InvocationTransport>>,
    payloads: Option<Arc<dyn PayloadGenerator>>,
    endpoint: Option<String>,
    control: ControlConfig,
    load: LoadConfig,
    benchmark: BenchmarkConfig,
    leases: LeaseRegistry,
}

impl ExperimentOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            updater: None,
            queue: None,
            policies: None,
            transport: None,
            payloads: None,
            endpoint: None,
            control: ControlConfig::default(),
            load: LoadConfig::default(),
            benchmark: BenchmarkConfig::default(),
            leases: LeaseRegistry::new(),
        }
    }

    pub fn updater(mut self, updater: Arc<dyn ResourceUpdater>) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn RecordQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn policies(mut self, policies: Arc<dyn PolicyFactory>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn InvocationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn payloads(mut self, payloads: Arc<dyn PayloadGenerator>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    /// Invocation endpoint the load is sent to
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Template for the per-configuration control loops; target,
    /// experiment id and mode are set by the orchestrator
    pub fn control(mut self, control: ControlConfig) -> Self {
        self.control = control;
        self
    }

    pub fn load(mut self, load: LoadConfig) -> Self {
        self.load = load;
        self
    }

    pub fn benchmark(mut self, benchmark: BenchmarkConfig) -> Self {
        self.benchmark = benchmark;
        self
    }

    pub fn leases(mut self, leases: LeaseRegistry) -> Self {
        self.leases = leases;
        self
    }

    pub fn build(self) -> Result<ExperimentOrchestrator, TunerError> {
        fn required<T>(value: Option<T>, what: &str) -> Result<T, TunerError> {
            value.ok_or_else(|| TunerError::FatalConfig(format!("orchestrator needs {what}")))
        }

        Ok(ExperimentOrchestrator {
            updater: required(self.updater, "a resource updater")?,
            queue: required(self.queue, "a record queue")?,
            policies: required(self.policies, "a policy factory")?,
            transport: required(self.transport, "an invocation transport")?,
            payloads: required(self.payloads, "a payload generator")?,
            endpoint: required(self.endpoint, "an invocation endpoint")?,
            control: self.control,
            load: self.load,
            benchmark: self.benchmark,
            leases: self.leases,
            logger: StructuredLogger::new("orchestrator"),
        })
    }
}

impl Default for ExperimentOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
