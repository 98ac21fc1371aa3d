//! `tuner operate`: run a control loop against one target

use anyhow::Result;
use std::time::Duration;
use tabled::Tabled;
use tracing::warn;
use tuner_lib::control::{ControlLoopBuilder, ControlMode, ControlStats, LeaseRegistry};
use tuner_lib::LoadGenerator;

use super::{cancel_after, shutdown_token};
use crate::output::{print_info, print_json, print_rows, print_success, OutputFormat};
use crate::runtime::Runtime;

#[derive(Tabled)]
struct CounterRow {
    #[tabled(rename = "Counter")]
    name: &'static str,
    #[tabled(rename = "Value")]
    value: u64,
}

fn counter_rows(stats: &ControlStats) -> Vec<CounterRow> {
    [
        ("cycles", stats.cycles),
        ("observed", stats.observed),
        ("rejected", stats.rejected),
        ("skipped", stats.skipped),
        ("record failures", stats.record_failures),
        ("deferred", stats.deferred),
        ("recommendations", stats.recommendations),
        ("apply failures", stats.apply_failures),
        ("checkpoints", stats.checkpoints),
    ]
    .into_iter()
    .map(|(name, value)| CounterRow { name, value })
    .collect()
}

/// Run the controller until Ctrl-C or `run_for` elapses
///
/// Against the simulator, load is generated in the background so the
/// queue has records to learn from.
pub async fn operate(
    runtime: Runtime,
    experiment_id: &str,
    mode: ControlMode,
    run_for: Option<Duration>,
    format: OutputFormat,
) -> Result<()> {
    runtime.require_queue()?;
    let updater = runtime.require_updater()?;
    let config = runtime.config.control_config(&runtime.target, experiment_id, mode);
    let policy = runtime.policies.open(&runtime.target, experiment_id).await?;

    let control_loop = ControlLoopBuilder::new(&runtime.target)
        .policy(policy)
        .queue(runtime.queue.clone())
        .updater(updater)
        .leases(LeaseRegistry::new())
        .experiment_id(experiment_id)
        .poll_interval(config.poll_interval)
        .context_window(config.context_window)
        .objective(config.objective)
        .mode(config.mode)
        .checkpoint_every(config.checkpoint_every)
        .build()?;

    let cancel = shutdown_token();
    cancel_after(&cancel, run_for);

    let background_load = match &runtime.simulator {
        Some(_) => {
            let generator = LoadGenerator::new(
                runtime.target.clone(),
                runtime.endpoint.clone(),
                runtime.transport.clone(),
                runtime.payloads.clone(),
                runtime.config.load.clone(),
            );
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                while !cancel.is_cancelled() {
                    if let Err(e) = generator.run(cancel.clone()).await {
                        warn!(error = %e, "Background load stopped");
                        break;
                    }
                }
            }))
        }
        None => None,
    };

    if matches!(format, OutputFormat::Table) {
        print_info(&format!(
            "Controlling `{}` as {experiment_id} ({mode:?}); Ctrl-C to stop",
            runtime.target
        ));
    }

    let result = control_loop.run(cancel.clone()).await;
    cancel.cancel();
    if let Some(handle) = background_load {
        let _ = handle.await;
    }
    let stats = result?;

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            print_rows(counter_rows(&stats));
            print_success(&format!("Controller for `{}` stopped", runtime.target));
        }
    }
    Ok(())
}
