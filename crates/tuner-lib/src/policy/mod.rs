//! Bandit policy: the learning engine and the backends that host it
//!
//! The control loop talks to a [`Policy`]; [`LocalPolicy`] runs the
//! engine in-process against a model store, [`RemotePolicy`] forwards to
//! a policy agent over HTTP.

mod engine;
mod local;
mod regressor;
mod remote;
mod service;
pub mod wire;

pub use engine::{
    sample_action, Lifecycle, PolicyConfig, PolicyEngine, PolicyState, DEFAULT_EPSILON,
    DEFAULT_RIDGE, DISTRIBUTION_TOLERANCE,
};
pub use local::{LocalPolicy, LocalPolicyFactory};
pub use regressor::RidgeRegressor;
pub use remote::{RemotePolicy, RemotePolicyFactory};
pub use service::PolicyService;

use crate::error::TunerError;
use crate::models::{ActionSpace, Context, Observation, Recommendation};
use async_trait::async_trait;
use std::sync::Arc;

/// A bandit policy bound to one model key
///
/// Calls are serialized by the implementation; the owner is expected to
/// be the single writer of the underlying model.
#[async_trait]
pub trait Policy: Send + Sync {
    fn action_space(&self) -> &ActionSpace;

    fn features(&self) -> &[String];

    /// Whether the policy was restored from a stored model
    fn is_warm(&self) -> bool;

    async fn observe(&self, observation: &Observation) -> Result<(), TunerError>;

    async fn recommend(&self, context: &Context) -> Result<Recommendation, TunerError>;

    /// Persist pending updates; returns the saved revision, if any
    async fn checkpoint(&self) -> Result<Option<u64>, TunerError>;
}

/// Opens the policy for a (target, experiment) pair
#[async_trait]
pub trait PolicyFactory: Send + Sync {
    /// Action space every policy from this factory is built over
    fn action_space(&self) -> &ActionSpace;

    async fn open(&self, target: &str, experiment_id: &str) -> Result<Arc<dyn Policy>, TunerError>;
}
