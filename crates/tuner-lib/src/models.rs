//! Core data models for the memory tuner

use crate::error::PolicyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// 1-based identifier of an action within an [`ActionSpace`]
pub type ActionId = usize;

/// Ordered set of candidate memory sizes (MB)
///
/// Sizes are strictly ascending; size `i` (0-based) is action `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct ActionSpace {
    sizes: Vec<u32>,
}

impl ActionSpace {
    pub fn new(sizes: Vec<u32>) -> Result<Self, PolicyError> {
        if sizes.len() < 2 {
            return Err(PolicyError::Config(format!(
                "action space needs at least 2 sizes, got {}",
                sizes.len()
            )));
        }
        if sizes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PolicyError::Config(format!(
                "action space must be strictly ascending: {sizes:?}"
            )));
        }
        if sizes[0] == 0 {
            return Err(PolicyError::Config("memory size 0 is not allocatable".to_string()));
        }
        Ok(Self { sizes })
    }

    /// Number of actions (N)
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }

    pub fn contains(&self, action: ActionId) -> bool {
        (1..=self.sizes.len()).contains(&action)
    }

    /// Memory size for a 1-based action id
    pub fn size_of(&self, action: ActionId) -> Option<u32> {
        action.checked_sub(1).and_then(|i| self.sizes.get(i)).copied()
    }

    /// 1-based action id for a memory size
    pub fn action_for(&self, size_mb: u32) -> Option<ActionId> {
        self.sizes.binary_search(&size_mb).ok().map(|i| i + 1)
    }

    /// Iterate over action ids in ascending order
    pub fn actions(&self) -> impl Iterator<Item = ActionId> {
        1..=self.sizes.len()
    }
}

impl TryFrom<Vec<u32>> for ActionSpace {
    type Error = PolicyError;

    fn try_from(sizes: Vec<u32>) -> Result<Self, Self::Error> {
        Self::new(sizes)
    }
}

impl From<ActionSpace> for Vec<u32> {
    fn from(space: ActionSpace) -> Self {
        space.sizes
    }
}

/// Named numeric features describing a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, f64>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Context with every feature set to 1, used before any history exists
    pub fn neutral(features: &[String]) -> Self {
        Self(features.iter().map(|f| (f.clone(), 1.0)).collect())
    }

    /// Feature-wise mean over contexts; a feature missing from some
    /// contexts is averaged over the ones that carry it
    pub fn mean<'a>(contexts: impl IntoIterator<Item = &'a Context>, features: &[String]) -> Option<Self> {
        let mut sums = vec![0.0; features.len()];
        let mut counts = vec![0usize; features.len()];

        for ctx in contexts {
            for (i, name) in features.iter().enumerate() {
                if let Some(v) = ctx.get(name) {
                    sums[i] += v;
                    counts[i] += 1;
                }
            }
        }

        if counts.iter().all(|&c| c == 0) {
            return None;
        }

        let mut mean = Context::new();
        for (i, name) in features.iter().enumerate() {
            if counts[i] > 0 {
                mean.insert(name.clone(), sums[i] / counts[i] as f64);
            }
        }
        Some(mean)
    }
}

/// One completed, attributable outcome of a past recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub action: ActionId,
    pub context: Context,
    /// Objective value for `action`; lower is better
    pub cost: f64,
    /// Probability under which `action` was sampled
    pub probability: f64,
}

/// Output of one inference call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: ActionId,
    pub size_mb: u32,
    /// Probability of `action` within `distribution`
    pub probability: f64,
    /// Probability per action, ordered by action id
    pub distribution: Vec<f64>,
}

impl Recommendation {
    /// Distribution keyed by memory size, as written to the audit trail
    pub fn by_size(&self, space: &ActionSpace) -> BTreeMap<u32, f64> {
        space
            .sizes()
            .iter()
            .copied()
            .zip(self.distribution.iter().copied())
            .collect()
    }
}

/// Cost function applied to execution metrics
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Objective {
    /// Billed duration in milliseconds
    #[default]
    Time,
    /// GB-seconds: memory (GB) times billed duration (s)
    Budget,
    /// Zero within the latency target, duration/threshold beyond it
    Slo { threshold_ms: f64 },
}

impl Objective {
    /// Cost of one execution; `None` when the metrics lack the durations
    /// this objective needs
    pub fn cost(&self, metrics: &ExecutionMetrics) -> Option<f64> {
        match *self {
            Objective::Time => metrics.billed_duration_ms,
            Objective::Budget => metrics
                .billed_duration_ms
                .map(|billed| (metrics.memory_size_mb as f64 / 1024.0) * (billed / 1000.0)),
            Objective::Slo { threshold_ms } => metrics.duration_ms.map(|duration| {
                if duration <= threshold_ms {
                    0.0
                } else {
                    duration / threshold_ms
                }
            }),
        }
    }
}

/// Execution metrics extracted from one function invocation
///
/// Numeric fields accept JSON numbers or numeric strings. A record either
/// carries its own signed `cost` or the durations an objective derives
/// one from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    #[serde(
        rename = "duration",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_number"
    )]
    pub duration_ms: Option<f64>,
    #[serde(
        rename = "billed_duration",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_number"
    )]
    pub billed_duration_ms: Option<f64>,
    #[serde(rename = "memory_size", deserialize_with = "de_size")]
    pub memory_size_mb: u32,
    #[serde(rename = "max_memory_used", default, deserialize_with = "de_number")]
    pub max_memory_used_mb: f64,
    #[serde(default = "default_payload_size", alias = "bytes", deserialize_with = "de_number")]
    pub payload_size: f64,
    /// Selection probability captured when the allocation was applied
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_number")]
    pub probability: Option<f64>,
    /// Objective value recorded with the execution, used as is; may be
    /// negative for throughput-like objectives
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_number")]
    pub cost: Option<f64>,
    /// Additional request features
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_payload_size() -> f64 {
    1.0
}

impl ExecutionMetrics {
    /// Value of a named context feature, if this record carries it
    pub fn feature(&self, name: &str) -> Option<f64> {
        match name {
            "payload_size" | "bytes" => Some(self.payload_size),
            "duration" => self.duration_ms,
            "max_memory_used" => Some(self.max_memory_used_mb),
            other => self.extra.get(other).and_then(json_number),
        }
    }

    /// Stored cost if present, otherwise the objective's cost
    pub fn cost_under(&self, objective: &Objective) -> Option<f64> {
        self.cost.or_else(|| objective.cost(self))
    }

    /// Context restricted to the given features
    pub fn context(&self, features: &[String]) -> Context {
        let mut ctx = Context::new();
        for name in features {
            if let Some(v) = self.feature(name) {
                ctx.insert(name.clone(), v);
            }
        }
        ctx
    }
}

fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

fn de_number<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match NumberOrString::deserialize(d)? {
        NumberOrString::Number(v) => Ok(v),
        NumberOrString::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match Option::<NumberOrString>::deserialize(d)? {
        None => Ok(None),
        Some(NumberOrString::Number(v)) => Ok(Some(v)),
        Some(NumberOrString::Text(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

fn de_size<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let v = de_number(d)?;
    if v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
        return Err(serde::de::Error::custom(format!("invalid memory size {v}")));
    }
    Ok(v as u32)
}

/// Processing state of a queue record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Unprocessed,
    Processed,
}

/// One persisted execution outcome awaiting consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: String,
    pub target: String,
    pub payload: ExecutionMetrics,
    pub created_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
}

/// A benchmark sweep over forced configurations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub target: String,
    pub configurations: Vec<u32>,
    pub started_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(id: impl Into<String>, target: impl Into<String>, configurations: Vec<u32>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            configurations,
            started_at: Utc::now(),
        }
    }

    /// Attribution id for records produced while `size_mb` is forced
    pub fn configuration_id(&self, size_mb: u32) -> String {
        format!("{}_{}", self.id, size_mb)
    }
}

/// Audit row written for every applied recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationAudit {
    pub target: String,
    pub experiment_id: String,
    pub distribution: BTreeMap<u32, f64>,
    pub observed_count: usize,
    pub context: Context,
    pub recommended_size: u32,
    pub prior_size: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_space_mapping() {
        let space = ActionSpace::new(vec![64, 128, 256]).unwrap();
        assert_eq!(space.len(), 3);
        assert_eq!(space.action_for(128), Some(2));
        assert_eq!(space.size_of(3), Some(256));
        assert_eq!(space.size_of(0), None);
        assert_eq!(space.size_of(4), None);
        assert_eq!(space.action_for(100), None);
        assert_eq!(space.actions().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_action_space_rejects_invalid() {
        assert!(ActionSpace::new(vec![]).is_err());
        assert!(ActionSpace::new(vec![128]).is_err());
        assert!(ActionSpace::new(vec![128, 64]).is_err());
        assert!(ActionSpace::new(vec![64, 64]).is_err());
        assert!(serde_json::from_str::<ActionSpace>("[256, 128]").is_err());
    }

    #[test]
    fn test_context_mean() {
        let features = vec!["payload_size".to_string()];
        let a = Context::new().with("payload_size", 100.0);
        let b = Context::new().with("payload_size", 300.0);
        let mean = Context::mean([&a, &b], &features).unwrap();
        assert_eq!(mean.get("payload_size"), Some(200.0));

        assert!(Context::mean(std::iter::empty(), &features).is_none());
    }

    #[test]
    fn test_metrics_accept_numeric_strings() {
        let json = r#"{
            "duration": "1.90",
            "memory_size": "128",
            "billed_duration": "2",
            "max_memory_used": "37",
            "payload_size": 2048,
            "region": "eu-west-1"
        }"#;
        let metrics: ExecutionMetrics = serde_json::from_str(json).unwrap();
        assert_eq!(metrics.duration_ms, Some(1.9));
        assert_eq!(metrics.memory_size_mb, 128);
        assert_eq!(metrics.billed_duration_ms, Some(2.0));
        assert_eq!(metrics.payload_size, 2048.0);
        assert!(metrics.probability.is_none());
        assert!(metrics.cost.is_none());
        assert_eq!(metrics.feature("bytes"), Some(2048.0));
        assert_eq!(metrics.feature("region"), None);
    }

    #[test]
    fn test_objective_costs() {
        let metrics = ExecutionMetrics {
            duration_ms: Some(1500.0),
            billed_duration_ms: Some(1500.0),
            memory_size_mb: 512,
            max_memory_used_mb: 80.0,
            payload_size: 10.0,
            probability: None,
            cost: None,
            extra: BTreeMap::new(),
        };
        assert_eq!(Objective::Time.cost(&metrics), Some(1500.0));
        assert!((Objective::Budget.cost(&metrics).unwrap() - 0.75).abs() < 1e-12);
        assert_eq!(Objective::Slo { threshold_ms: 2000.0 }.cost(&metrics), Some(0.0));
        assert_eq!(Objective::Slo { threshold_ms: 1000.0 }.cost(&metrics), Some(1.5));
        assert_eq!(metrics.cost_under(&Objective::Time), Some(1500.0));
    }

    #[test]
    fn test_stored_cost_replaces_objective() {
        let json = r#"{"memory_size": 64, "cost": -10, "probability": 0.5, "bytes": 100}"#;
        let metrics: ExecutionMetrics = serde_json::from_str(json).unwrap();
        assert_eq!(metrics.cost, Some(-10.0));
        assert_eq!(metrics.probability, Some(0.5));
        assert_eq!(metrics.payload_size, 100.0);
        assert_eq!(metrics.feature("bytes"), Some(100.0));
        assert!(metrics.duration_ms.is_none());
        assert_eq!(metrics.cost_under(&Objective::Time), Some(-10.0));
        assert_eq!(metrics.cost_under(&Objective::Budget), Some(-10.0));

        let bare: ExecutionMetrics = serde_json::from_str(r#"{"memory_size": 64}"#).unwrap();
        assert_eq!(bare.cost_under(&Objective::Time), None);
    }

    #[test]
    fn test_experiment_configuration_id() {
        let exp = Experiment::new("benchmark_decompress", "decompress", vec![128, 256]);
        assert_eq!(exp.configuration_id(256), "benchmark_decompress_256");
    }
}
