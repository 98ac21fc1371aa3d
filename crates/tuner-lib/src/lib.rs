//! Adaptive memory tuner for serverless functions
//!
//! This crate provides the core functionality for:
//! - Contextual-bandit policy learning and persistence
//! - Control loops that turn execution records into memory allocations
//! - Load generation and benchmark sweeps over forced configurations
//! - Health checks and observability

pub mod config;
pub mod control;
pub mod error;
pub mod experiment;
pub mod health;
pub mod load;
pub mod models;
pub mod observability;
pub mod policy;
pub mod queue;
pub mod retry;
pub mod store;
pub mod target;

pub use config::TunerConfig;
pub use control::{ControlConfig, ControlLoop, ControlLoopBuilder, ControlMode, ControlStats};
pub use error::TunerError;
pub use experiment::{ExperimentOrchestrator, ExperimentOrchestratorBuilder, SweepReport};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use load::{LoadConfig, LoadGenerator, LoadReport};
pub use models::*;
pub use observability::{StructuredLogger, TunerMetrics};
