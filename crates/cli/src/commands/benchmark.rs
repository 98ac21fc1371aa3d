//! `tuner benchmark`: sweep forced memory configurations

use anyhow::Result;
use tabled::Tabled;
use tuner_lib::control::ControlMode;
use tuner_lib::experiment::{ConfigurationReport, ExperimentOrchestratorBuilder, SweepReport};

use super::shutdown_token;
use crate::output::{
    color_status, format_mb, print_json, print_rows, print_success, print_warning, OutputFormat,
};
use crate::runtime::Runtime;

#[derive(Tabled)]
struct ConfigurationRow {
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Experiment")]
    experiment_id: String,
    #[tabled(rename = "Sent")]
    sent: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
    #[tabled(rename = "Observed")]
    observed: String,
    #[tabled(rename = "Rejected")]
    rejected: String,
    #[tabled(rename = "Status")]
    status: String,
}

impl From<&ConfigurationReport> for ConfigurationRow {
    fn from(c: &ConfigurationReport) -> Self {
        let counter = |f: fn(&tuner_lib::ControlStats) -> u64| {
            c.control
                .as_ref()
                .map(|s| f(s).to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        Self {
            memory: format_mb(c.size_mb),
            experiment_id: c.experiment_id.clone(),
            sent: c.load.sent,
            failed: c.load.failed,
            observed: counter(|s| s.observed),
            rejected: counter(|s| s.rejected),
            status: match &c.error {
                Some(e) => format!("{}: {e}", color_status("failed")),
                None => color_status("ok"),
            },
        }
    }
}

/// Run a sweep; `sizes` replaces the configured sweep when non-empty
pub async fn benchmark(runtime: Runtime, sizes: Vec<u32>, format: OutputFormat) -> Result<()> {
    runtime.require_queue()?;
    let updater = runtime.require_updater()?;
    let endpoint = runtime.require_endpoint()?.to_string();

    let mut benchmark = runtime.config.benchmark.clone();
    if !sizes.is_empty() {
        benchmark.sizes = sizes;
    }
    let experiment = benchmark.experiment(&runtime.target, runtime.policies.action_space());

    let orchestrator = ExperimentOrchestratorBuilder::new()
        .updater(updater)
        .queue(runtime.queue.clone())
        .policies(runtime.policies.clone())
        .transport(runtime.transport.clone())
        .payloads(runtime.payloads.clone())
        .endpoint(endpoint)
        .control(
            runtime
                .config
                .control_config(&runtime.target, &experiment.id, ControlMode::Shadow),
        )
        .load(runtime.config.load.clone())
        .benchmark(benchmark)
        .build()?;

    let report: SweepReport = orchestrator.run(&experiment, shutdown_token()).await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_rows(report.configurations.iter().map(ConfigurationRow::from).collect());
            if report.cancelled {
                print_warning(&format!("Sweep `{}` cancelled", report.experiment_id));
            } else if report.failures() > 0 {
                print_warning(&format!(
                    "Sweep `{}` finished with {} failed configurations",
                    report.experiment_id,
                    report.failures()
                ));
            } else {
                print_success(&format!("Sweep `{}` finished", report.experiment_id));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuner_lib::{ControlStats, LoadReport};

    #[test]
    fn test_row_without_controller() {
        let report = ConfigurationReport {
            size_mb: 2048,
            experiment_id: "benchmark_resize_2048".to_string(),
            load: LoadReport {
                sent: 5,
                failed: 1,
                windows: 1,
            },
            control: None,
            error: Some("target busy".to_string()),
        };
        let row = ConfigurationRow::from(&report);
        assert_eq!(row.memory, "2Gi");
        assert_eq!(row.observed, "-");
        assert!(row.status.contains("target busy"));
    }

    #[test]
    fn test_row_with_controller() {
        let report = ConfigurationReport {
            size_mb: 128,
            experiment_id: "benchmark_resize_128".to_string(),
            load: LoadReport::default(),
            control: Some(ControlStats {
                observed: 7,
                rejected: 1,
                ..ControlStats::default()
            }),
            error: None,
        };
        let row = ConfigurationRow::from(&report);
        assert_eq!(row.observed, "7");
        assert_eq!(row.rejected, "1");
    }
}
