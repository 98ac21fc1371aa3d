//! Agent configuration

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration, read from `AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Port for `/invoke`, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory of the file model store
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Object-store base URL; replaces the file store when set
    #[serde(default)]
    pub store_endpoint: Option<String>,

    #[serde(default = "default_store_bucket")]
    pub store_bucket: String,

    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,

    /// Exploration rate for requests that do not carry one
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_store_bucket() -> String {
    "models".to_string()
}

fn default_store_timeout() -> u64 {
    10
}

fn default_epsilon() -> f64 {
    tuner_lib::policy::DEFAULT_EPSILON
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            store_dir: default_store_dir(),
            store_endpoint: None,
            store_bucket: default_store_bucket(),
            store_timeout_secs: default_store_timeout(),
            epsilon: default_epsilon(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT").try_parsing(true))
            .build()?;

        let agent: AgentConfig = config
            .try_deserialize()
            .context("invalid AGENT_* configuration")?;
        agent.validate()?;
        Ok(agent)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.epsilon) {
            bail!("epsilon must be within [0, 1], got {}", self.epsilon);
        }
        if self.store_timeout_secs == 0 {
            bail!("store_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}
