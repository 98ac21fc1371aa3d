//! Local stand-in for a serverless function and its log pipeline
//!
//! Invocations compute a synthetic duration from the payload size and the
//! current allocation and write the resulting execution metrics straight
//! into a record queue, the way the log processor would.

use super::{InvocationTransport, ResourceUpdater};
use crate::error::TargetError;
use crate::models::{ExecutionMetrics, QueueRecord, RecordStatus};
use crate::queue::RecordQueue;
use chrono::Utc;
use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Endpoint scheme routed to the simulator
const SIM_SCHEME: &str = "sim://";

/// Shape of the synthetic duration model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationProfile {
    /// Fixed overhead per invocation
    pub base_ms: f64,
    /// Work per KiB of payload at `reference_mb`
    pub ms_per_kib: f64,
    /// Allocation at which `ms_per_kib` holds; work scales inversely with memory
    pub reference_mb: u32,
    /// Allocation assumed before the first update
    pub initial_mb: u32,
    /// Relative noise amplitude
    pub jitter: f64,
    /// Share of invocations that fail
    pub failure_rate: f64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            base_ms: 20.0,
            ms_per_kib: 2.0,
            reference_mb: 128,
            initial_mb: 128,
            jitter: 0.05,
            failure_rate: 0.0,
        }
    }
}

pub struct SimulatedTarget {
    queue: Arc<dyn RecordQueue>,
    profile: SimulationProfile,
    allocations: DashMap<String, u32>,
    rng: Mutex<ChaCha8Rng>,
    invocations: AtomicU64,
}

impl SimulatedTarget {
    pub fn new(queue: Arc<dyn RecordQueue>, profile: SimulationProfile, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            queue,
            profile,
            allocations: DashMap::new(),
            rng: Mutex::new(rng),
            invocations: AtomicU64::new(0),
        }
    }

    /// Endpoint that routes invocations for `target` to this simulator
    pub fn endpoint(target: &str) -> String {
        format!("{SIM_SCHEME}{target}")
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn allocation(&self, target: &str) -> u32 {
        self.allocations
            .get(target)
            .map(|a| *a)
            .unwrap_or(self.profile.initial_mb)
    }

    /// Expected duration without noise
    pub fn expected_duration_ms(&self, payload_bytes: f64, memory_mb: u32) -> f64 {
        let scale = self.profile.reference_mb as f64 / memory_mb.max(1) as f64;
        self.profile.base_ms + self.profile.ms_per_kib * (payload_bytes / 1024.0) * scale
    }

    /// Noise factor and whether this invocation fails
    fn draw(&self) -> (f64, bool) {
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        let noise = if self.profile.jitter > 0.0 {
            rng.gen_range(-self.profile.jitter..=self.profile.jitter)
        } else {
            0.0
        };
        let failed = rng.gen::<f64>() < self.profile.failure_rate;
        (1.0 + noise, failed)
    }
}

fn payload_bytes(payload: &Value) -> f64 {
    ["payload_size", "bytes"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_f64))
        .unwrap_or(1.0)
}

#[async_trait::async_trait]
impl ResourceUpdater for SimulatedTarget {
    async fn set_allocation(&self, target: &str, size_mb: u32) -> Result<(), TargetError> {
        if size_mb == 0 {
            return Err(TargetError::Rejected {
                status: 400,
                body: "memory size must be positive".to_string(),
            });
        }
        self.allocations.insert(target.to_string(), size_mb);
        Ok(())
    }

    async fn current_allocation(&self, target: &str) -> Result<Option<u32>, TargetError> {
        Ok(Some(self.allocation(target)))
    }
}

#[async_trait::async_trait]
impl InvocationTransport for SimulatedTarget {
    async fn invoke(&self, endpoint: &str, payload: &Value) -> Result<Value, TargetError> {
        let target = endpoint.strip_prefix(SIM_SCHEME).unwrap_or(endpoint);
        let n = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;

        let (factor, failed) = self.draw();
        if failed {
            return Err(TargetError::Transient(format!("simulated failure of {target}")));
        }

        let memory = self.allocation(target);
        let bytes = payload_bytes(payload);
        let duration = self.expected_duration_ms(bytes, memory) * factor;
        let metrics = ExecutionMetrics {
            duration_ms: Some(duration),
            billed_duration_ms: Some(duration.ceil()),
            memory_size_mb: memory,
            max_memory_used_mb: (30.0 + bytes / (1024.0 * 1024.0)).min(memory as f64),
            payload_size: bytes,
            probability: None,
            cost: None,
            extra: BTreeMap::new(),
        };
        trace!(target = %target, memory = memory, duration_ms = duration, "Simulated invocation");

        self.queue
            .insert(QueueRecord {
                id: format!("sim-{target}-{n}"),
                target: target.to_string(),
                payload: metrics,
                created_at: Utc::now(),
                status: RecordStatus::Unprocessed,
                experiment_id: None,
            })
            .await
            .map_err(|e| TargetError::Transient(e.to_string()))?;

        Ok(json!({"statusCode": 200, "body": {"duration": duration}}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryRecordQueue;

    #[tokio::test]
    async fn test_invocation_lands_in_queue() {
        let queue = Arc::new(InMemoryRecordQueue::new());
        let sim = SimulatedTarget::new(queue.clone(), SimulationProfile::default(), Some(1));

        sim.set_allocation("resize", 256).await.unwrap();
        sim.invoke(&SimulatedTarget::endpoint("resize"), &json!({"payload_size": 4096}))
            .await
            .unwrap();

        let records = queue.unprocessed("resize").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload.memory_size_mb, 256);
        assert_eq!(records[0].payload.payload_size, 4096.0);
        assert!(records[0].payload.billed_duration_ms >= records[0].payload.duration_ms);
        assert!(records[0].payload.cost.is_none());
    }

    #[test]
    fn test_more_memory_is_faster() {
        let sim = SimulatedTarget::new(
            Arc::new(InMemoryRecordQueue::new()),
            SimulationProfile::default(),
            None,
        );
        assert!(sim.expected_duration_ms(10_000.0, 512) < sim.expected_duration_ms(10_000.0, 128));
    }

    #[tokio::test]
    async fn test_failures_are_transient() {
        let profile = SimulationProfile {
            failure_rate: 1.0,
            ..SimulationProfile::default()
        };
        let sim = SimulatedTarget::new(Arc::new(InMemoryRecordQueue::new()), profile, Some(2));
        let err = sim.invoke("sim://resize", &json!({})).await.unwrap_err();
        assert!(matches!(err, TargetError::Transient(_)));
    }
}
