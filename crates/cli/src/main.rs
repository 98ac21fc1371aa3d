//! Adaptive memory tuner CLI
//!
//! Runs control loops, load and benchmark sweeps against serverless
//! functions, and inspects the learned policies.

mod commands;
mod config;
mod output;
mod runtime;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tuner_lib::control::ControlMode;

use commands::load::LoadOverrides;
use commands::policy::parse_feature;

/// Adaptive memory tuner
#[derive(Parser)]
#[command(name = "tuner")]
#[command(author, version, about = "Adaptive memory tuner for serverless functions", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON); defaults to ~/.config/tuner/config.toml
    #[arg(long, short, env = "TUNER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub format: output::OutputFormat,

    /// Serve invocations, allocations and records from an in-process simulator
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct TargetArgs {
    /// Function to act on
    pub target: String,

    /// Experiment the model and records are attributed to
    #[arg(long, short, default_value = "default")]
    pub experiment_id: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control loop for a target until interrupted
    Operate {
        #[command(flatten)]
        target: TargetArgs,

        /// Learn without changing the allocation
        #[arg(long)]
        shadow: bool,

        /// Stop after this many seconds
        #[arg(long)]
        run_for_secs: Option<u64>,
    },

    /// Send invocation load to a target
    Load {
        /// Function to invoke
        target: String,

        /// Overall duration in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,

        /// Dispatch on a fixed rate instead of one request at a time
        #[arg(long)]
        concurrent: bool,

        /// In-flight cap for concurrent dispatch
        #[arg(long)]
        max_in_flight: Option<usize>,
    },

    /// Sweep forced memory configurations under load
    Benchmark {
        /// Function to benchmark
        target: String,

        /// Sizes to sweep in order (defaults to the configured sweep)
        #[arg(long, value_delimiter = ',')]
        sizes: Vec<u32>,
    },

    /// Ask the policy for a memory size without applying it
    Recommend {
        #[command(flatten)]
        target: TargetArgs,

        /// Context feature as name=value; repeatable
        #[arg(long = "feature", value_parser = parse_feature)]
        features: Vec<(String, f64)>,
    },

    /// Show a stored model
    Inspect {
        #[command(flatten)]
        target: TargetArgs,

        /// Context feature as name=value; repeatable
        #[arg(long = "feature", value_parser = parse_feature)]
        features: Vec<(String, f64)>,
    },
}

impl Commands {
    fn target(&self) -> &str {
        match self {
            Commands::Operate { target, .. }
            | Commands::Recommend { target, .. }
            | Commands::Inspect { target, .. } => &target.target,
            Commands::Load { target, .. } | Commands::Benchmark { target, .. } => target,
        }
    }
}

fn init_tracing(json: bool, verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json, cli.verbose);

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::load(cli.config.as_deref())?;
    let runtime = runtime::Runtime::build(config, cli.command.target(), cli.simulate)?;

    match cli.command {
        Commands::Operate {
            target,
            shadow,
            run_for_secs,
        } => {
            let mode = if shadow {
                ControlMode::Shadow
            } else {
                ControlMode::Active
            };
            commands::control::operate(
                runtime,
                &target.experiment_id,
                mode,
                run_for_secs.map(Duration::from_secs),
                cli.format,
            )
            .await
        }
        Commands::Load {
            duration_ms,
            concurrent,
            max_in_flight,
            ..
        } => {
            let overrides = LoadOverrides {
                duration: duration_ms.map(Duration::from_millis),
                concurrent,
                max_in_flight,
            };
            commands::load::run_load(runtime, &overrides, cli.format).await
        }
        Commands::Benchmark { sizes, .. } => {
            commands::benchmark::benchmark(runtime, sizes, cli.format).await
        }
        Commands::Recommend { target, features } => {
            commands::policy::recommend(runtime, &target.experiment_id, &features, cli.format).await
        }
        Commands::Inspect { target, features } => {
            commands::policy::inspect(runtime, &target.experiment_id, &features, cli.format).await
        }
    }
}
