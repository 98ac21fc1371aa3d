//! Control loop driving one target's allocation from its queue records

mod context;
mod lease;
mod ledger;
mod r#loop;

pub use context::ContextWindow;
pub use lease::{LeaseRegistry, TargetLease};
pub use ledger::ProbabilityLedger;
pub use r#loop::{ControlConfig, ControlLoop, ControlLoopBuilder, ControlMode, ControlStats};
