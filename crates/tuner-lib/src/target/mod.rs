//! The tuned resource: how its allocation is changed and how it is invoked

mod http;
mod payload;
mod simulated;

pub use http::{HttpInvocationTransport, HttpResourceUpdater};
pub use payload::{FixedPayload, PayloadGenerator, PayloadSpec, RandomSizePayload};
pub use simulated::{SimulatedTarget, SimulationProfile};

use crate::error::TargetError;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait ResourceUpdater: Send + Sync {
    async fn set_allocation(&self, target: &str, size_mb: u32) -> Result<(), TargetError>;

    /// Allocation currently applied, `None` when the target has none yet
    async fn current_allocation(&self, target: &str) -> Result<Option<u32>, TargetError>;
}

#[async_trait]
pub trait InvocationTransport: Send + Sync {
    async fn invoke(&self, endpoint: &str, payload: &Value) -> Result<Value, TargetError>;
}
