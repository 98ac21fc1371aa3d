//! Tuner configuration
//!
//! Loaded from an optional file (TOML, YAML or JSON by extension) with
//! `TUNER__<SECTION>__<KEY>` environment overrides on top, e.g.
//! `TUNER__CONTROL__POLL_INTERVAL_MS=1000`.

use crate::control::{ContextWindow, ControlConfig, ControlMode};
use crate::error::TunerError;
use crate::experiment::BenchmarkConfig;
use crate::load::LoadConfig;
use crate::models::{ActionSpace, Objective};
use crate::policy::{PolicyConfig, DEFAULT_EPSILON, DEFAULT_RIDGE};
use crate::retry::RetryPolicy;
use crate::target::{PayloadSpec, SimulationProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "TUNER";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub policy: PolicySettings,
    pub store: StoreSettings,
    pub queue: QueueSettings,
    pub control: ControlSettings,
    pub load: LoadConfig,
    pub benchmark: BenchmarkConfig,
    /// Retry budget of every HTTP client; callers make a single attempt
    pub retry: RetryPolicy,
    pub simulation: SimulationProfile,
    pub targets: BTreeMap<String, TargetSettings>,
}

/// Bandit policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Candidate memory sizes in MB, ascending
    pub action_space: Vec<u32>,
    pub features: Vec<String>,
    pub epsilon: f64,
    pub ridge: f64,
    /// Fixed seed for reproducible exploration
    pub seed: Option<u64>,
    pub objective: Objective,
    pub backend: PolicyBackend,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            action_space: vec![128, 256, 512, 1024],
            features: vec!["payload_size".to_string()],
            epsilon: DEFAULT_EPSILON,
            ridge: DEFAULT_RIDGE,
            seed: None,
            objective: Objective::default(),
            backend: PolicyBackend::default(),
        }
    }
}

impl PolicySettings {
    pub fn action_space(&self) -> Result<ActionSpace, TunerError> {
        Ok(ActionSpace::new(self.action_space.clone())?)
    }

    pub fn to_policy_config(&self) -> Result<PolicyConfig, TunerError> {
        let mut config = PolicyConfig::new(self.action_space()?, self.features.clone())
            .with_epsilon(self.epsilon);
        config.ridge = self.ridge;
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Where the policy engine runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyBackend {
    /// In-process engine persisted through the configured store
    #[default]
    Local,
    /// Policy agent reached over HTTP
    Remote {
        agent_url: String,
        #[serde(default = "default_bucket")]
        bucket: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

/// Model store backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreSettings {
    File {
        dir: PathBuf,
    },
    Http {
        endpoint: String,
        #[serde(default = "default_bucket")]
        bucket: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Memory,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::File {
            dir: PathBuf::from("models"),
        }
    }
}

/// Record queue backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueSettings {
    Http {
        endpoint: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Process-local queue, only useful together with the simulator
    #[default]
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub poll_interval_ms: u64,
    pub context_window: ContextWindow,
    pub checkpoint_every: u32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            context_window: ContextWindow::default(),
            checkpoint_every: 1,
        }
    }
}

impl ControlSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// How one tuned function is reached
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    /// Invocation URL used by the load generator
    pub invoke_endpoint: Option<String>,
    /// Base URL of the service that changes the function's memory
    pub updater_endpoint: Option<String>,
    pub payload: PayloadSpec,
    pub timeout_ms: Option<u64>,
}

impl TargetSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or_else(default_timeout_ms))
    }
}

fn default_bucket() -> String {
    "models".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl TunerConfig {
    /// Load configuration from `path` (if any) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, TunerError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TunerError::FatalConfig(format!("cannot read configuration: {e}")))?;

        let tuner: TunerConfig = config
            .try_deserialize()
            .map_err(|e| TunerError::FatalConfig(format!("invalid configuration: {e}")))?;
        tuner.validate()?;
        Ok(tuner)
    }

    /// Reject configurations that cannot start a run
    pub fn validate(&self) -> Result<(), TunerError> {
        let policy = self.policy.to_policy_config()?;

        if let PolicyBackend::Remote { agent_url, .. } = &self.policy.backend {
            parse_url("policy.backend.agent_url", agent_url)?;
        }
        if let Objective::Slo { threshold_ms } = self.policy.objective {
            if !(threshold_ms.is_finite() && threshold_ms > 0.0) {
                return Err(TunerError::FatalConfig(format!(
                    "slo threshold must be positive, got {threshold_ms}"
                )));
            }
        }

        match &self.store {
            StoreSettings::Http { endpoint, bucket, .. } => {
                parse_url("store.endpoint", endpoint)?;
                if bucket.is_empty() {
                    return Err(TunerError::FatalConfig("store bucket must not be empty".to_string()));
                }
            }
            StoreSettings::File { dir } if dir.as_os_str().is_empty() => {
                return Err(TunerError::FatalConfig("store dir must not be empty".to_string()));
            }
            _ => {}
        }
        if let QueueSettings::Http { endpoint, .. } = &self.queue {
            parse_url("queue.endpoint", endpoint)?;
        }

        if self.control.poll_interval_ms == 0 {
            return Err(TunerError::FatalConfig("control.poll_interval_ms must be positive".to_string()));
        }
        if self.control.checkpoint_every == 0 {
            return Err(TunerError::FatalConfig("control.checkpoint_every must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(TunerError::FatalConfig("retry.max_attempts must be positive".to_string()));
        }

        self.load.validate()?;
        self.benchmark.validate(&policy.action_space)?;

        for (name, target) in &self.targets {
            if let Some(endpoint) = &target.invoke_endpoint {
                parse_url(&format!("targets.{name}.invoke_endpoint"), endpoint)?;
            }
            if let Some(endpoint) = &target.updater_endpoint {
                parse_url(&format!("targets.{name}.updater_endpoint"), endpoint)?;
            }
            target.payload.validate()?;
        }
        Ok(())
    }

    /// Settings for `name`, falling back to defaults for unlisted targets
    pub fn target(&self, name: &str) -> TargetSettings {
        self.targets.get(name).cloned().unwrap_or_default()
    }

    /// Control loop settings for one target run
    pub fn control_config(&self, target: &str, experiment_id: &str, mode: ControlMode) -> ControlConfig {
        ControlConfig {
            target: target.to_string(),
            experiment_id: experiment_id.to_string(),
            poll_interval: self.control.poll_interval(),
            context_window: self.control.context_window,
            objective: self.policy.objective,
            mode,
            checkpoint_every: self.control.checkpoint_every,
        }
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url, TunerError> {
    Url::parse(value).map_err(|e| TunerError::FatalConfig(format!("{field}: invalid url `{value}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TunerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.policy.action_space, vec![128, 256, 512, 1024]);
        assert_eq!(config.control.context_window, ContextWindow::Cycle);
        assert_eq!(config.store, StoreSettings::File { dir: PathBuf::from("models") });
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[policy]
action_space = [64, 128, 256]
epsilon = 0.2
objective = {{ kind = "slo", threshold_ms = 250.0 }}

[store]
kind = "http"
endpoint = "http://blobs:9000"

[control]
poll_interval_ms = 1000
context_window = "last_10"

[benchmark]
sizes = [64, 256]
grace_ms = 2000

[targets.resize]
invoke_endpoint = "http://gateway/resize"
payload = {{ kind = "random_size", min_bytes = 100, max_bytes = 2000 }}
"#
        )
        .unwrap();

        let config = TunerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.policy.action_space, vec![64, 128, 256]);
        assert_eq!(config.policy.epsilon, 0.2);
        assert_eq!(config.policy.objective, Objective::Slo { threshold_ms: 250.0 });
        assert_eq!(config.control.context_window, ContextWindow::Last(10));
        assert_eq!(config.control.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.benchmark.sizes, vec![64, 256]);
        assert!(matches!(config.store, StoreSettings::Http { ref bucket, .. } if bucket == "models"));

        let target = config.target("resize");
        assert_eq!(target.invoke_endpoint.as_deref(), Some("http://gateway/resize"));
        assert!(matches!(target.payload, PayloadSpec::RandomSize { max_bytes: 2000, .. }));
        assert_eq!(config.target("other"), TargetSettings::default());
    }

    #[test]
    fn test_invalid_action_space_is_fatal() {
        let mut config = TunerConfig::default();
        config.policy.action_space = vec![256, 128];
        assert!(matches!(config.validate(), Err(TunerError::FatalConfig(_))));

        config.policy.action_space = vec![128];
        assert!(config.validate().is_err());

        config.policy.action_space = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sweep_outside_action_space_is_fatal() {
        let mut config = TunerConfig::default();
        config.benchmark.sizes = vec![128, 3008];
        assert!(matches!(config.validate(), Err(TunerError::FatalConfig(_))));
    }

    #[test]
    fn test_other_invalid_settings() {
        let mut config = TunerConfig::default();
        config.policy.epsilon = 1.5;
        assert!(config.validate().is_err());

        let mut config = TunerConfig::default();
        config.policy.features.clear();
        assert!(config.validate().is_err());

        let mut config = TunerConfig::default();
        config.control.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = TunerConfig::default();
        config.load.max_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = TunerConfig::default();
        config.queue = QueueSettings::Http {
            endpoint: "not a url".to_string(),
            timeout_ms: 1_000,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = TunerConfig::load(Some(Path::new("/nonexistent/tuner.toml"))).unwrap_err();
        assert!(matches!(err, TunerError::FatalConfig(_)));
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"load": {{"max_in_flight": 4}}}}"#).unwrap();

        std::env::set_var("TUNER__LOAD__MAX_IN_FLIGHT", "32");
        let config = TunerConfig::load(Some(file.path()));
        std::env::remove_var("TUNER__LOAD__MAX_IN_FLIGHT");

        assert_eq!(config.unwrap().load.max_in_flight, 32);
    }

    #[test]
    fn test_control_config_carries_settings() {
        let mut config = TunerConfig::default();
        config.policy.objective = Objective::Budget;
        config.control.context_window = ContextWindow::Last(100);

        let control = config.control_config("resize", "exp-1", ControlMode::Shadow);
        assert_eq!(control.target, "resize");
        assert_eq!(control.experiment_id, "exp-1");
        assert_eq!(control.objective, Objective::Budget);
        assert_eq!(control.context_window, ContextWindow::Last(100));
        assert_eq!(control.mode, ControlMode::Shadow);
        assert_eq!(control.poll_interval, Duration::from_secs(5));
    }
}
