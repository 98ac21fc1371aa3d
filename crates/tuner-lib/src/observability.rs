//! Observability infrastructure for the tuner
//!
//! Provides:
//! - Prometheus metrics (policy update latency, request latency, recommendations, model saves)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge_vec, Histogram, IntCounter,
    IntGaugeVec,
};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for policy latency (in seconds)
const POLICY_LATENCY_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
];

/// Buckets for invocation round trips (in seconds)
const REQUEST_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<TunerMetricsInner> = OnceLock::new();

struct TunerMetricsInner {
    policy_update_latency_seconds: Histogram,
    request_latency_seconds: Histogram,
    observations_applied: IntCounter,
    observations_rejected: IntCounter,
    recommendations: IntCounter,
    apply_failures: IntCounter,
    load_requests_sent: IntCounter,
    load_requests_failed: IntCounter,
    model_saves: IntCounter,
    recommended_memory_mb: IntGaugeVec,
}

impl TunerMetricsInner {
    fn new() -> Self {
        Self {
            policy_update_latency_seconds: register_histogram!(
                "memory_tuner_policy_update_latency_seconds",
                "Time spent applying one observation to the policy",
                POLICY_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register policy_update_latency_seconds"),

            request_latency_seconds: register_histogram!(
                "memory_tuner_request_latency_seconds",
                "Round trip time of load generator invocations",
                REQUEST_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register request_latency_seconds"),

            observations_applied: register_int_counter!(
                "memory_tuner_observations_applied_total",
                "Observations applied to a policy"
            )
            .expect("Failed to register observations_applied"),

            observations_rejected: register_int_counter!(
                "memory_tuner_observations_rejected_total",
                "Queue records consumed but rejected as invalid"
            )
            .expect("Failed to register observations_rejected"),

            recommendations: register_int_counter!(
                "memory_tuner_recommendations_total",
                "Recommendations produced by a policy"
            )
            .expect("Failed to register recommendations"),

            apply_failures: register_int_counter!(
                "memory_tuner_apply_failures_total",
                "Failed attempts to push an allocation to a target"
            )
            .expect("Failed to register apply_failures"),

            load_requests_sent: register_int_counter!(
                "memory_tuner_load_requests_sent_total",
                "Invocations issued by the load generator"
            )
            .expect("Failed to register load_requests_sent"),

            load_requests_failed: register_int_counter!(
                "memory_tuner_load_requests_failed_total",
                "Load generator invocations that failed"
            )
            .expect("Failed to register load_requests_failed"),

            model_saves: register_int_counter!(
                "memory_tuner_model_saves_total",
                "Policy snapshots written to the model store"
            )
            .expect("Failed to register model_saves"),

            recommended_memory_mb: register_int_gauge_vec!(
                "memory_tuner_recommended_memory_mb",
                "Last allocation applied per target",
                &["target"]
            )
            .expect("Failed to register recommended_memory_mb"),
        }
    }
}

/// Tuner metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct TunerMetrics {
    _private: (),
}

impl Default for TunerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TunerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TunerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TunerMetricsInner {
        GLOBAL_METRICS.get_or_init(TunerMetricsInner::new)
    }

    pub fn observe_policy_update_latency(&self, duration_secs: f64) {
        self.inner().policy_update_latency_seconds.observe(duration_secs);
    }

    pub fn observe_request_latency(&self, duration_secs: f64) {
        self.inner().request_latency_seconds.observe(duration_secs);
    }

    pub fn inc_observations_applied(&self) {
        self.inner().observations_applied.inc();
    }

    pub fn inc_observations_rejected(&self) {
        self.inner().observations_rejected.inc();
    }

    pub fn inc_recommendations(&self) {
        self.inner().recommendations.inc();
    }

    pub fn inc_apply_failures(&self) {
        self.inner().apply_failures.inc();
    }

    pub fn inc_load_requests_sent(&self) {
        self.inner().load_requests_sent.inc();
    }

    pub fn inc_load_requests_failed(&self) {
        self.inner().load_requests_failed.inc();
    }

    pub fn inc_model_saves(&self) {
        self.inner().model_saves.inc();
    }

    pub fn set_recommended_memory(&self, target: &str, size_mb: u32) {
        self.inner()
            .recommended_memory_mb
            .with_label_values(&[target])
            .set(size_mb as i64);
    }

    /// Render every registered metric in the text exposition format
    pub fn render() -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Structured logger for tuner events
///
/// One named `event` per significant controller action so audit
/// tooling can filter the JSON log stream.
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Log an allocation pushed to a target
    pub fn log_recommendation_applied(
        &self,
        target: &str,
        experiment_id: &str,
        recommended_size: u32,
        prior_size: Option<u32>,
        probability: f64,
        distribution: &BTreeMap<u32, f64>,
        observed_count: usize,
    ) {
        info!(
            event = "recommendation_applied",
            component = %self.component,
            target = %target,
            experiment_id = %experiment_id,
            recommended_size = recommended_size,
            prior_size = ?prior_size,
            probability = probability,
            distribution = ?distribution,
            observed_count = observed_count,
            "Applied memory recommendation"
        );
    }

    /// Log a queue record that was consumed but could not be learned from
    pub fn log_observation_rejected(&self, target: &str, record_id: &str, reason: &str) {
        warn!(
            event = "observation_rejected",
            component = %self.component,
            target = %target,
            record_id = %record_id,
            reason = %reason,
            "Rejected queue record"
        );
    }

    pub fn log_sweep_started(&self, target: &str, experiment_id: &str, configurations: &[u32]) {
        info!(
            event = "sweep_started",
            component = %self.component,
            target = %target,
            experiment_id = %experiment_id,
            configurations = ?configurations,
            "Benchmark sweep started"
        );
    }

    pub fn log_configuration_finished(
        &self,
        target: &str,
        experiment_id: &str,
        size_mb: u32,
        requests_sent: u64,
        requests_failed: u64,
        controller_error: Option<&str>,
    ) {
        match controller_error {
            None => info!(
                event = "configuration_finished",
                component = %self.component,
                target = %target,
                experiment_id = %experiment_id,
                size_mb = size_mb,
                requests_sent = requests_sent,
                requests_failed = requests_failed,
                "Configuration finished"
            ),
            Some(error) => warn!(
                event = "configuration_finished",
                component = %self.component,
                target = %target,
                experiment_id = %experiment_id,
                size_mb = size_mb,
                requests_sent = requests_sent,
                requests_failed = requests_failed,
                controller_error = %error,
                "Configuration finished with controller failure"
            ),
        }
    }

    pub fn log_model_saved(&self, key: &str, revision: u64, updates: u64) {
        info!(
            event = "model_saved",
            component = %self.component,
            key = %key,
            revision = revision,
            updates = updates,
            "Saved policy model"
        );
    }

    pub fn log_controller_started(&self, target: &str, experiment_id: &str, warm: bool) {
        info!(
            event = "controller_started",
            component = %self.component,
            target = %target,
            experiment_id = %experiment_id,
            warm_start = warm,
            "Control loop started"
        );
    }

    pub fn log_controller_stopped(&self, target: &str, experiment_id: &str, cycles: u64, reason: &str) {
        info!(
            event = "controller_stopped",
            component = %self.component,
            target = %target,
            experiment_id = %experiment_id,
            cycles = cycles,
            reason = %reason,
            "Control loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuner_metrics_creation() {
        let metrics = TunerMetrics::new();
        metrics.observe_policy_update_latency(0.0001);
        metrics.observe_request_latency(0.2);
        metrics.inc_observations_applied();
        metrics.inc_recommendations();
        metrics.set_recommended_memory("thumbnail", 256);

        let rendered = TunerMetrics::render();
        assert!(rendered.contains("memory_tuner_recommended_memory_mb"));
        assert!(rendered.contains("thumbnail"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("controller");
        assert_eq!(logger.component, "controller");
    }
}
