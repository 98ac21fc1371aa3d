//! Contextual bandit engine
//!
//! Epsilon-greedy exploration over a small discrete action space, with a
//! ridge-regression cost model per action trained by inverse propensity
//! scoring.

use super::regressor::RidgeRegressor;
use crate::error::PolicyError;
use crate::models::{ActionId, ActionSpace, Context, Observation, Recommendation};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default exploration rate
pub const DEFAULT_EPSILON: f64 = 0.1;

/// Default ridge prior strength
pub const DEFAULT_RIDGE: f64 = 1.0;

/// Tolerance when checking that a distribution sums to one
pub const DISTRIBUTION_TOLERANCE: f64 = 1e-6;

/// Static engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub action_space: ActionSpace,
    pub features: Vec<String>,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_ridge")]
    pub ridge: f64,
    /// Fixed RNG seed; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

fn default_ridge() -> f64 {
    DEFAULT_RIDGE
}

impl PolicyConfig {
    pub fn new(action_space: ActionSpace, features: Vec<String>) -> Self {
        Self {
            action_space,
            features,
            epsilon: DEFAULT_EPSILON,
            ridge: DEFAULT_RIDGE,
            seed: None,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.features.is_empty() {
            return Err(PolicyError::Config("at least one context feature is required".to_string()));
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(PolicyError::Config(format!(
                "epsilon must lie in [0, 1], got {}",
                self.epsilon
            )));
        }
        if !(self.ridge > 0.0 && self.ridge.is_finite()) {
            return Err(PolicyError::Config(format!(
                "ridge must be positive, got {}",
                self.ridge
            )));
        }
        Ok(())
    }
}

/// Persistable model state
///
/// Carries the action space and feature list it was trained against so a
/// reload with a different configuration is refused instead of silently
/// reinterpreting the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyState {
    pub action_space: ActionSpace,
    pub features: Vec<String>,
    pub epsilon: f64,
    pub scorers: Vec<RidgeRegressor>,
    /// Observations applied since the model was created
    pub updates: u64,
    /// Store revision this state was loaded from or last saved as
    pub revision: u64,
}

impl PolicyState {
    pub fn fresh(config: &PolicyConfig) -> Self {
        let dim = config.features.len() + 1;
        Self {
            action_space: config.action_space.clone(),
            features: config.features.clone(),
            epsilon: config.epsilon,
            scorers: (0..config.action_space.len())
                .map(|_| RidgeRegressor::new(dim, config.ridge))
                .collect(),
            updates: 0,
            revision: 0,
        }
    }

    /// Internal consistency of a deserialized state
    pub fn check(&self) -> Result<(), PolicyError> {
        let dim = self.features.len() + 1;
        if self.scorers.len() != self.action_space.len() {
            return Err(PolicyError::Config(format!(
                "state has {} scorers for {} actions",
                self.scorers.len(),
                self.action_space.len()
            )));
        }
        if self.scorers.iter().any(|s| s.dim() != dim) {
            return Err(PolicyError::Config(format!(
                "scorer dimension does not match {} features",
                self.features.len()
            )));
        }
        Ok(())
    }
}

/// How the engine came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Started without a stored model
    Fresh,
    /// Restored from a stored model
    Warm,
}

/// Epsilon-greedy contextual bandit over memory sizes
#[derive(Clone)]
pub struct PolicyEngine {
    state: PolicyState,
    lifecycle: Lifecycle,
    rng: ChaCha8Rng,
    dirty: bool,
}

impl PolicyEngine {
    /// Create an untrained engine
    pub fn fresh(config: &PolicyConfig) -> Result<Self, PolicyError> {
        config.validate()?;
        Ok(Self {
            state: PolicyState::fresh(config),
            lifecycle: Lifecycle::Fresh,
            rng: seeded_rng(config.seed),
            dirty: false,
        })
    }

    /// Restore an engine from a stored state
    ///
    /// The stored action space and features must equal the configured
    /// ones; exploration rate follows the configuration.
    pub fn restore(config: &PolicyConfig, mut state: PolicyState) -> Result<Self, PolicyError> {
        config.validate()?;
        state.check()?;
        if state.action_space != config.action_space {
            return Err(PolicyError::Config(format!(
                "stored model was trained on action space {:?}, configured {:?}",
                state.action_space.sizes(),
                config.action_space.sizes()
            )));
        }
        if state.features != config.features {
            return Err(PolicyError::Config(format!(
                "stored model uses features {:?}, configured {:?}",
                state.features, config.features
            )));
        }
        state.epsilon = config.epsilon;
        Ok(Self {
            state,
            lifecycle: Lifecycle::Warm,
            rng: seeded_rng(config.seed),
            dirty: false,
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn action_space(&self) -> &ActionSpace {
        &self.state.action_space
    }

    pub fn features(&self) -> &[String] {
        &self.state.features
    }

    pub fn epsilon(&self) -> f64 {
        self.state.epsilon
    }

    pub fn updates(&self) -> u64 {
        self.state.updates
    }

    pub fn revision(&self) -> u64 {
        self.state.revision
    }

    /// Whether observations were applied since the last save
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Copy of the current state for persistence
    pub fn snapshot(&self) -> PolicyState {
        self.state.clone()
    }

    /// Record that the state was saved under `revision`
    pub fn mark_persisted(&mut self, revision: u64) {
        self.state.revision = revision;
        self.dirty = false;
    }

    /// Predicted cost per action, ordered by action id
    pub fn predicted_costs(&self, context: &Context) -> Result<Vec<f64>, PolicyError> {
        let x = self
            .feature_vector(context)
            .map_err(PolicyError::InvalidContext)?;
        Ok(self.state.scorers.iter().map(|s| s.predict(&x)).collect())
    }

    /// Greedy action and the epsilon-greedy distribution for `context`
    pub fn distribution(&self, context: &Context) -> Result<(ActionId, Vec<f64>), PolicyError> {
        let costs = self.predicted_costs(context)?;
        let greedy = greedy_action(&costs);

        let n = costs.len() as f64;
        let eps = self.state.epsilon;
        let distribution = (1..=costs.len())
            .map(|a| {
                if a == greedy {
                    1.0 - eps + eps / n
                } else {
                    eps / n
                }
            })
            .collect();

        Ok((greedy, distribution))
    }

    /// Recommend an action using a caller-provided random source
    pub fn recommend_with<R: Rng + ?Sized>(
        &self,
        context: &Context,
        rng: &mut R,
    ) -> Result<Recommendation, PolicyError> {
        let (_, distribution) = self.distribution(context)?;
        self.draw(distribution, rng.gen::<f64>())
    }

    /// Recommend an action; only the engine's RNG advances
    pub fn recommend(&mut self, context: &Context) -> Result<Recommendation, PolicyError> {
        let (_, distribution) = self.distribution(context)?;
        let u = self.rng.gen::<f64>();
        self.draw(distribution, u)
    }

    fn draw(&self, distribution: Vec<f64>, u: f64) -> Result<Recommendation, PolicyError> {
        let action = sample_action(&distribution, u);
        let size_mb = self
            .state
            .action_space
            .size_of(action)
            .ok_or_else(|| PolicyError::Config(format!("sampled unknown action {action}")))?;

        Ok(Recommendation {
            action,
            size_mb,
            probability: distribution[action - 1],
            distribution,
        })
    }

    /// Importance-weighted update from one logged outcome
    ///
    /// The chosen action regresses toward `cost / probability`, every
    /// other action toward zero, so each scorer estimates its action's
    /// expected cost regardless of how often the logging policy chose it.
    pub fn observe(&mut self, observation: &Observation) -> Result<(), PolicyError> {
        let Observation {
            action,
            context,
            cost,
            probability,
        } = observation;

        if !self.state.action_space.contains(*action) {
            return Err(PolicyError::InvalidObservation(format!(
                "action {action} outside 1..={}",
                self.state.action_space.len()
            )));
        }
        if !(probability.is_finite() && *probability > 0.0 && *probability <= 1.0) {
            return Err(PolicyError::InvalidObservation(format!(
                "probability {probability} outside (0, 1]"
            )));
        }
        if !cost.is_finite() {
            return Err(PolicyError::InvalidObservation(format!("non-finite cost {cost}")));
        }
        let x = self
            .feature_vector(context)
            .map_err(PolicyError::InvalidObservation)?;

        let loss = cost / probability;
        for (i, scorer) in self.state.scorers.iter_mut().enumerate() {
            let target = if i + 1 == *action { loss } else { 0.0 };
            scorer.update(&x, target);
        }

        self.state.updates += 1;
        self.dirty = true;

        debug!(
            action = action,
            cost = cost,
            probability = probability,
            updates = self.state.updates,
            "Applied observation"
        );
        Ok(())
    }

    /// `[1, f1, f2, ...]` in configured feature order
    fn feature_vector(&self, context: &Context) -> Result<Vec<f64>, String> {
        let mut x = Vec::with_capacity(self.state.features.len() + 1);
        x.push(1.0);
        for name in &self.state.features {
            match context.get(name) {
                Some(v) if v.is_finite() => x.push(v),
                Some(v) => return Err(format!("feature `{name}` is not finite ({v})")),
                None => return Err(format!("context is missing feature `{name}`")),
            }
        }
        Ok(x)
    }
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}

/// Lowest-cost action; ties go to the lowest action id
fn greedy_action(costs: &[f64]) -> ActionId {
    let mut best = 0;
    for (i, c) in costs.iter().enumerate() {
        if *c < costs[best] {
            best = i;
        }
    }
    best + 1
}

/// Walk the normalized cumulative distribution with draw `u ∈ [0, 1)`
pub fn sample_action(distribution: &[f64], u: f64) -> ActionId {
    let total: f64 = distribution.iter().sum();
    let mut cumulative = 0.0;
    for (i, p) in distribution.iter().enumerate() {
        cumulative += p / total;
        if cumulative > u {
            return i + 1;
        }
    }
    // rounding left the last bucket short of u; use the last reachable action
    distribution
        .iter()
        .rposition(|p| *p > 0.0)
        .map(|i| i + 1)
        .unwrap_or(distribution.len())
}
