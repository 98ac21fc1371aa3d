//! Policy agent - hosts bandit models behind an HTTP API
//!
//! Controllers running with a remote policy backend send observe and
//! recommend requests here; models are persisted after every observation.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tuner_lib::{
    health::{components, HealthRegistry},
    observability::TunerMetrics,
    policy::PolicyService,
    store::{FileModelStore, HttpModelStore, ModelStore},
};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = AGENT_VERSION, "Starting policy-agent");

    let config = config::AgentConfig::load()?;

    let store: Arc<dyn ModelStore> = match &config.store_endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, bucket = %config.store_bucket, "Using object model store");
            Arc::new(HttpModelStore::new(
                endpoint,
                config.store_bucket.clone(),
                config.store_timeout(),
            )?)
        }
        None => {
            info!(dir = %config.store_dir.display(), "Using file model store");
            Arc::new(FileModelStore::new(config.store_dir.clone()))
        }
    };

    let health_registry = HealthRegistry::new();
    health_registry.register(components::POLICY_SERVICE).await;
    health_registry.register(components::MODEL_STORE).await;

    let service = Arc::new(PolicyService::new(store).with_default_epsilon(config.epsilon));
    let state = Arc::new(api::AppState::new(
        service,
        health_registry.clone(),
        TunerMetrics::new(),
    ));

    health_registry.set_ready(true).await;

    api::serve(config.api_port, state, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "agent_stopped", reason = "SIGINT received", "Shutting down");
        }
    })
    .await
}
