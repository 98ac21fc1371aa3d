//! Observe / recommend / apply loop for one target
//!
//! Each cycle drains the target's unprocessed queue records into the
//! policy, asks for the next allocation and pushes it to the resource
//! updater. Cycles without new records sleep for the poll interval.

use super::{ContextWindow, LeaseRegistry, ProbabilityLedger};
use crate::error::TunerError;
use crate::health::{components, HealthRegistry};
use crate::models::{Context, Objective, Observation, QueueRecord, RecommendationAudit};
use crate::observability::{StructuredLogger, TunerMetrics};
use crate::policy::Policy;
use crate::queue::RecordQueue;
use crate::target::ResourceUpdater;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Whether the loop pushes its recommendations to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Apply every recommendation through the resource updater
    #[default]
    Active,
    /// Learn and audit only; the allocation is owned by someone else
    /// (a benchmark sweep forcing its baseline)
    Shadow,
}

/// Configuration for one control loop run
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub target: String,
    /// Attribution id written to claimed records and audit rows
    pub experiment_id: String,
    /// Sleep between polls when the queue is empty (default: 5 seconds)
    pub poll_interval: Duration,
    pub context_window: ContextWindow,
    pub objective: Objective,
    pub mode: ControlMode,
    /// Save the model after this many cycles with updates (default: 1)
    pub checkpoint_every: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            experiment_id: "default".to_string(),
            poll_interval: Duration::from_secs(5),
            context_window: ContextWindow::default(),
            objective: Objective::default(),
            mode: ControlMode::default(),
            checkpoint_every: 1,
        }
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControlStats {
    pub cycles: u64,
    /// Records learned from
    pub observed: u64,
    /// Records consumed but unusable (bad action, probability or context)
    pub rejected: u64,
    /// Records another claimant processed first
    pub skipped: u64,
    /// Records whose claim or policy update failed
    pub record_failures: u64,
    /// Policy updates postponed to a later cycle after a transient failure
    pub deferred: u64,
    pub recommendations: u64,
    pub apply_failures: u64,
    pub checkpoints: u64,
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    /// Nothing learned; sleep before polling again
    Idle,
    /// A recommendation was produced (and applied unless in shadow mode)
    Applied,
    /// Cancellation observed between phases
    Interrupted,
}

/// Claimed record whose policy update has not gone through yet
#[derive(Debug)]
struct PendingObservation {
    record_id: String,
    observation: Observation,
}

/// What the observing phase produced
#[derive(Debug, Default)]
struct ObservedBatch {
    contexts: Vec<Context>,
    /// Allocation of the newest record seen this cycle
    prior_size: Option<u32>,
}

pub struct ControlLoop {
    policy: Arc<dyn Policy>,
    queue: Arc<dyn RecordQueue>,
    updater: Arc<dyn ResourceUpdater>,
    leases: LeaseRegistry,
    health: Option<HealthRegistry>,
    config: ControlConfig,
    ledger: ProbabilityLedger,
    stats: ControlStats,
    /// Claimed records still owed a policy update, oldest first
    deferred: VecDeque<PendingObservation>,
    pending_checkpoint: u32,
    metrics: TunerMetrics,
    logger: StructuredLogger,
}

impl ControlLoop {
    pub fn new(
        policy: Arc<dyn Policy>,
        queue: Arc<dyn RecordQueue>,
        updater: Arc<dyn ResourceUpdater>,
        leases: LeaseRegistry,
        config: ControlConfig,
    ) -> Self {
        Self {
            policy,
            queue,
            updater,
            leases,
            health: None,
            config,
            ledger: ProbabilityLedger::new(),
            stats: ControlStats::default(),
            deferred: VecDeque::new(),
            pending_checkpoint: 0,
            metrics: TunerMetrics::new(),
            logger: StructuredLogger::new("control_loop"),
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Run until `cancel` fires
    ///
    /// Fails before the first cycle when the target is already leased or
    /// the queue or updater cannot be reached, and mid-run only when the
    /// model was overwritten by another writer.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ControlStats, TunerError> {
        let target = self.config.target.clone();
        let experiment_id = self.config.experiment_id.clone();
        let _lease = self.leases.acquire(&target, &experiment_id)?;

        self.startup().await?;
        self.logger
            .log_controller_started(&target, &experiment_id, self.policy.is_warm());

        let outcome = loop {
            if cancel.is_cancelled() {
                break Ok("cancelled");
            }
            self.stats.cycles += 1;

            let idle = match self.cycle(&cancel).await {
                Ok(CycleOutcome::Applied) => false,
                Ok(CycleOutcome::Idle) => true,
                Ok(CycleOutcome::Interrupted) => break Ok("cancelled"),
                Err(e) => {
                    warn!(target = %target, cycle = self.stats.cycles, error = %e, "Control cycle aborted");
                    true
                }
            };

            if let Err(e) = self.maybe_checkpoint(false).await {
                break Err(e);
            }

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break Ok("cancelled"),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        };

        let outcome = match outcome {
            Ok(reason) => {
                self.flush_deferred().await;
                self.maybe_checkpoint(true).await.map(|_| reason)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(reason) => {
                self.logger
                    .log_controller_stopped(&target, &experiment_id, self.stats.cycles, reason);
                Ok(self.stats)
            }
            Err(e) => {
                self.logger.log_controller_stopped(
                    &target,
                    &experiment_id,
                    self.stats.cycles,
                    &e.to_string(),
                );
                Err(e)
            }
        }
    }

    /// Reachability check and probability bookkeeping for the allocation
    /// the target already has
    async fn startup(&mut self) -> Result<(), TunerError> {
        let target = self.config.target.as_str();
        let pending = self.queue.unprocessed(target).await.map_err(|e| {
            error!(target = %target, error = %e, "Record queue unreachable at startup");
            TunerError::from(e)
        })?;
        self.set_queue_health(true, "").await;

        let current = self.updater.current_allocation(target).await.map_err(|e| {
            error!(target = %target, error = %e, "Resource updater unreachable at startup");
            TunerError::from(e)
        })?;

        if let Some(size) = current {
            self.ledger.force(size);
        }
        info!(
            target = %target,
            pending = pending.len(),
            current_allocation = ?current,
            mode = ?self.config.mode,
            window = %self.config.context_window,
            "Control loop ready"
        );
        Ok(())
    }

    /// One Observing → Recommending → Applying pass
    async fn cycle(&mut self, cancel: &CancellationToken) -> Result<CycleOutcome, TunerError> {
        let target = self.config.target.clone();
        let records = match self.queue.unprocessed(&target).await {
            Ok(records) => {
                self.set_queue_health(true, "").await;
                records
            }
            Err(e) => {
                self.set_queue_health(false, &e.to_string()).await;
                return Err(e.into());
            }
        };

        if records.is_empty() && self.deferred.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        debug!(
            target = %target,
            records = records.len(),
            deferred = self.deferred.len(),
            "Observing"
        );

        let batch = self.observe_records(&records).await;
        if batch.contexts.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Interrupted);
        }

        self.recommend_and_apply(batch).await?;
        Ok(CycleOutcome::Applied)
    }

    /// Retry postponed updates, then claim and learn from each new record
    async fn observe_records(&mut self, records: &[QueueRecord]) -> ObservedBatch {
        let mut batch = ObservedBatch::default();

        let deferred = std::mem::take(&mut self.deferred);
        for pending in deferred {
            self.apply_observation(pending, &mut batch).await;
        }

        for record in records {
            let claimed = self
                .queue
                .mark_processed(&record.id, &self.config.experiment_id)
                .await;

            match claimed {
                Ok(true) => {}
                Ok(false) => {
                    debug!(record_id = %record.id, "Record already claimed");
                    self.stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    // unclaimed; it is still unprocessed for the next poll
                    warn!(record_id = %record.id, error = %e, "Failed to claim record");
                    self.stats.record_failures += 1;
                    continue;
                }
            }

            batch.prior_size = Some(record.payload.memory_size_mb);

            let observation = match self.observation_for(record) {
                Ok(observation) => observation,
                Err(e) => {
                    self.reject(&record.id, &e);
                    continue;
                }
            };
            let pending = PendingObservation {
                record_id: record.id.clone(),
                observation,
            };
            self.apply_observation(pending, &mut batch).await;
        }

        if batch.contexts.is_empty() {
            return batch;
        }
        self.pending_checkpoint += 1;
        batch
    }

    /// Feed one claimed record to the policy. A transient failure keeps it
    /// for the next cycle, since the queue no longer offers it.
    async fn apply_observation(&mut self, pending: PendingObservation, batch: &mut ObservedBatch) {
        match self.policy.observe(&pending.observation).await {
            Ok(()) => {
                self.stats.observed += 1;
                self.metrics.inc_observations_applied();
                batch.contexts.push(pending.observation.context);
            }
            Err(e @ TunerError::InvalidObservation(_)) => self.reject(&pending.record_id, &e),
            Err(e) if e.is_transient() => {
                warn!(
                    target = %self.config.target,
                    record_id = %pending.record_id,
                    error = %e,
                    "Policy update failed, retrying next cycle"
                );
                self.stats.deferred += 1;
                self.deferred.push_back(pending);
            }
            Err(e) => {
                error!(
                    target = %self.config.target,
                    record_id = %pending.record_id,
                    error = %e,
                    "Policy update failed for claimed record"
                );
                self.stats.record_failures += 1;
            }
        }
    }

    /// Last attempt at postponed updates before the loop stops
    async fn flush_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let mut batch = ObservedBatch::default();
        let deferred = std::mem::take(&mut self.deferred);
        for pending in deferred {
            self.apply_observation(pending, &mut batch).await;
        }
        if !batch.contexts.is_empty() {
            self.pending_checkpoint += 1;
        }
        if !self.deferred.is_empty() {
            warn!(
                target = %self.config.target,
                records = self.deferred.len(),
                "Stopping with claimed records the policy never learned from"
            );
        }
    }

    /// Build the policy observation for a queue record
    fn observation_for(&self, record: &QueueRecord) -> Result<Observation, TunerError> {
        let metrics = &record.payload;
        let size = metrics.memory_size_mb;

        let action = self.policy.action_space().action_for(size).ok_or_else(|| {
            TunerError::InvalidObservation(format!(
                "memory size {size} is not in the action space {:?}",
                self.policy.action_space().sizes()
            ))
        })?;

        let probability = self
            .ledger
            .resolve(size, metrics.probability)
            .ok_or_else(|| {
                TunerError::InvalidObservation(format!(
                    "no selection probability known for memory size {size}"
                ))
            })?;

        let cost = metrics.cost_under(&self.config.objective).ok_or_else(|| {
            TunerError::InvalidObservation(
                "record carries neither a cost nor the durations to derive one".to_string(),
            )
        })?;
        if !cost.is_finite() {
            return Err(TunerError::InvalidObservation(format!("cost {cost} is not finite")));
        }

        Ok(Observation {
            action,
            context: metrics.context(self.policy.features()),
            cost,
            probability,
        })
    }

    fn reject(&mut self, record_id: &str, e: &TunerError) {
        self.stats.rejected += 1;
        self.metrics.inc_observations_rejected();
        self.logger
            .log_observation_rejected(&self.config.target, record_id, &e.to_string());
    }

    async fn recommend_and_apply(&mut self, batch: ObservedBatch) -> Result<(), TunerError> {
        let target = self.config.target.clone();
        let features = self.policy.features().to_vec();

        let history: Vec<Context> = match self.config.context_window.history_limit() {
            Some(limit) => self
                .queue
                .recent_processed(&target, limit)
                .await?
                .iter()
                .map(|r| r.payload.context(&features))
                .collect(),
            None => Vec::new(),
        };
        let context = self
            .config
            .context_window
            .representative(&batch.contexts, &history, &features);

        debug!(target = %target, context = ?context, "Recommending");
        let recommendation = self.policy.recommend(&context).await?;
        self.stats.recommendations += 1;

        if self.config.mode == ControlMode::Active {
            if let Err(e) = self
                .updater
                .set_allocation(&target, recommendation.size_mb)
                .await
            {
                self.stats.apply_failures += 1;
                self.metrics.inc_apply_failures();
                return Err(e.into());
            }
            // shadow runs never change the allocation, so the forced size stays certain
            self.ledger
                .record(recommendation.size_mb, recommendation.probability);
        }
        self.metrics
            .set_recommended_memory(&target, recommendation.size_mb);

        let distribution = recommendation.by_size(self.policy.action_space());
        self.logger.log_recommendation_applied(
            &target,
            &self.config.experiment_id,
            recommendation.size_mb,
            batch.prior_size,
            recommendation.probability,
            &distribution,
            batch.contexts.len(),
        );

        let audit = RecommendationAudit {
            target: target.clone(),
            experiment_id: self.config.experiment_id.clone(),
            distribution,
            observed_count: batch.contexts.len(),
            context,
            recommended_size: recommendation.size_mb,
            prior_size: batch.prior_size,
            created_at: Utc::now(),
        };
        self.queue.insert_audit(&audit).await?;
        Ok(())
    }

    /// Save the model when enough cycles changed it, or unconditionally
    /// with `force`. Only a conflicting writer is an error; other save
    /// failures keep the updates pending for the next attempt.
    async fn maybe_checkpoint(&mut self, force: bool) -> Result<(), TunerError> {
        if self.pending_checkpoint == 0 {
            return Ok(());
        }
        if !force && self.pending_checkpoint < self.config.checkpoint_every.max(1) {
            return Ok(());
        }

        match self.policy.checkpoint().await {
            Ok(revision) => {
                if revision.is_some() {
                    self.stats.checkpoints += 1;
                }
                self.pending_checkpoint = 0;
                Ok(())
            }
            Err(e @ TunerError::Conflict { .. }) => {
                error!(target = %self.config.target, error = %e, "Model written by another controller");
                Err(e)
            }
            Err(e) => {
                warn!(target = %self.config.target, error = %e, "Checkpoint failed, will retry");
                Ok(())
            }
        }
    }

    async fn set_queue_health(&self, ok: bool, message: &str) {
        if let Some(health) = &self.health {
            if ok {
                health.set_healthy(components::RECORD_QUEUE).await;
            } else {
                health
                    .set_degraded(components::RECORD_QUEUE, message.to_string())
                    .await;
            }
        }
    }
}

/// Builder for a control loop
pub struct ControlLoopBuilder {
    policy: Option<Arc<dyn Policy>>,
    queue: Option<Arc<dyn RecordQueue>>,
    updater: Option<Arc<dyn ResourceUpdater>>,
    leases: LeaseRegistry,
    health: Option<HealthRegistry>,
    config: ControlConfig,
}

impl ControlLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            policy: None,
            queue: None,
            updater: None,
            leases: LeaseRegistry::new(),
            health: None,
            config: ControlConfig {
                target: target.into(),
                ..ControlConfig::default()
            },
        }
    }

    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn RecordQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn updater(mut self, updater: Arc<dyn ResourceUpdater>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Share leases with other loops in this process
    pub fn leases(mut self, leases: LeaseRegistry) -> Self {
        self.leases = leases;
        self
    }

    /// Report record queue reachability
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn experiment_id(mut self, id: impl Into<String>) -> Self {
        self.config.experiment_id = id.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn context_window(mut self, window: ContextWindow) -> Self {
        self.config.context_window = window;
        self
    }

    pub fn objective(mut self, objective: Objective) -> Self {
        self.config.objective = objective;
        self
    }

    pub fn mode(mut self, mode: ControlMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn checkpoint_every(mut self, cycles: u32) -> Self {
        self.config.checkpoint_every = cycles;
        self
    }

    /// Build the control loop
    pub fn build(self) -> Result<ControlLoop, TunerError> {
        let policy = self
            .policy
            .ok_or_else(|| TunerError::FatalConfig("control loop needs a policy".to_string()))?;
        let queue = self
            .queue
            .ok_or_else(|| TunerError::FatalConfig("control loop needs a record queue".to_string()))?;
        let updater = self.updater.ok_or_else(|| {
            TunerError::FatalConfig("control loop needs a resource updater".to_string())
        })?;
        if self.config.target.is_empty() {
            return Err(TunerError::FatalConfig("control loop needs a target".to_string()));
        }
        if self.config.poll_interval.is_zero() {
            return Err(TunerError::FatalConfig(
                "poll interval must be positive".to_string(),
            ));
        }

        let mut control = ControlLoop::new(policy, queue, updater, self.leases, self.config);
        control.health = self.health;
        Ok(control)
    }
}
