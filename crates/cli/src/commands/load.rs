//! `tuner load`: drive invocation load at one target

use anyhow::Result;
use std::time::Duration;
use tabled::Tabled;
use tuner_lib::load::{DispatchMode, LoadConfig};
use tuner_lib::{LoadGenerator, LoadReport};

use super::shutdown_token;
use crate::output::{print_json, print_rows, OutputFormat};
use crate::runtime::Runtime;

#[derive(Tabled)]
struct LoadRow {
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Windows")]
    windows: u64,
    #[tabled(rename = "Sent")]
    sent: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
}

/// Command-line overrides for the configured load
#[derive(Debug, Default)]
pub struct LoadOverrides {
    pub duration: Option<Duration>,
    pub concurrent: bool,
    pub max_in_flight: Option<usize>,
}

impl LoadOverrides {
    pub fn apply(&self, mut config: LoadConfig) -> LoadConfig {
        if let Some(duration) = self.duration {
            config.duration_ms = duration.as_millis() as u64;
        }
        if self.concurrent {
            config.mode = DispatchMode::Concurrent;
        }
        if let Some(max) = self.max_in_flight {
            config.max_in_flight = max;
        }
        config
    }
}

pub async fn run_load(runtime: Runtime, overrides: &LoadOverrides, format: OutputFormat) -> Result<()> {
    let endpoint = runtime.require_endpoint()?.to_string();
    let config = overrides.apply(runtime.config.load.clone());

    let generator = LoadGenerator::new(
        runtime.target.clone(),
        endpoint,
        runtime.transport.clone(),
        runtime.payloads.clone(),
        config,
    );

    let report: LoadReport = generator.run(shutdown_token()).await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => print_rows(vec![LoadRow {
            target: runtime.target.clone(),
            windows: report.windows,
            sent: report.sent,
            failed: report.failed,
        }]),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply() {
        let overrides = LoadOverrides {
            duration: Some(Duration::from_secs(2)),
            concurrent: true,
            max_in_flight: Some(4),
        };
        let config = overrides.apply(LoadConfig::default());
        assert_eq!(config.duration_ms, 2_000);
        assert_eq!(config.mode, DispatchMode::Concurrent);
        assert_eq!(config.max_in_flight, 4);
    }

    #[test]
    fn test_no_overrides_keep_config() {
        let config = LoadOverrides::default().apply(LoadConfig::default());
        assert_eq!(config, LoadConfig::default());
    }
}
