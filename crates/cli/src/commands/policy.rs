//! `tuner recommend` and `tuner inspect`: query a stored policy

use anyhow::{bail, Context as _, Result};
use serde::Serialize;
use tabled::Tabled;
use tuner_lib::error::StoreError;
use tuner_lib::policy::PolicyEngine;
use tuner_lib::store::ModelKey;
use tuner_lib::{ActionSpace, Context};

use crate::output::{
    format_mb, format_probability, print_info, print_json, print_rows, OutputFormat,
};
use crate::runtime::Runtime;

/// Parse a `name=value` feature argument
pub fn parse_feature(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{s}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty feature name in `{s}`"));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("feature `{name}` needs a number, got `{value}`"))?;
    if !value.is_finite() {
        return Err(format!("feature `{name}` must be finite"));
    }
    Ok((name.to_string(), value))
}

/// Context from explicit features; unset model features default to 1
fn context_for(model_features: &[String], given: &[(String, f64)]) -> Result<Context> {
    let mut context = Context::neutral(model_features);
    for (name, value) in given {
        if !model_features.contains(name) {
            bail!("unknown feature `{name}`; the model uses {model_features:?}");
        }
        context.insert(name.clone(), *value);
    }
    Ok(context)
}

#[derive(Tabled)]
struct ActionRow {
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Probability")]
    probability: String,
    #[tabled(rename = "Predicted cost")]
    predicted_cost: String,
    #[tabled(rename = "")]
    marker: &'static str,
}

fn action_rows(
    space: &ActionSpace,
    distribution: &[f64],
    costs: Option<&[f64]>,
    chosen: u32,
) -> Vec<ActionRow> {
    space
        .sizes()
        .iter()
        .enumerate()
        .map(|(i, &size)| ActionRow {
            memory: format_mb(size),
            probability: format_probability(distribution.get(i).copied().unwrap_or(0.0)),
            predicted_cost: costs
                .and_then(|c| c.get(i))
                .map(|c| format!("{c:.2}"))
                .unwrap_or_else(|| "-".to_string()),
            marker: if size == chosen { "◀" } else { "" },
        })
        .collect()
}

/// Sample a recommendation from the policy without applying it
pub async fn recommend(
    runtime: Runtime,
    experiment_id: &str,
    features: &[(String, f64)],
    format: OutputFormat,
) -> Result<()> {
    let policy = runtime.policies.open(&runtime.target, experiment_id).await?;
    let context = context_for(policy.features(), features)?;
    let recommendation = policy.recommend(&context).await?;

    match format {
        OutputFormat::Json => print_json(&recommendation)?,
        OutputFormat::Table => {
            if !policy.is_warm() {
                print_info("No stored model yet; sampling from an untrained policy");
            }
            print_rows(action_rows(
                policy.action_space(),
                &recommendation.distribution,
                None,
                recommendation.size_mb,
            ));
            println!(
                "\nRecommended: {} (p = {})",
                format_mb(recommendation.size_mb),
                format_probability(recommendation.probability)
            );
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ModelSummary {
    key: String,
    revision: u64,
    updates: u64,
    epsilon: f64,
    features: Vec<String>,
    action_space: Vec<u32>,
    greedy_mb: u32,
    distribution: Vec<f64>,
    predicted_costs: Vec<f64>,
}

/// Show a stored model and what it predicts for a context
pub async fn inspect(
    runtime: Runtime,
    experiment_id: &str,
    features: &[(String, f64)],
    format: OutputFormat,
) -> Result<()> {
    let key = ModelKey::new(&runtime.target, experiment_id);
    let state = match runtime.store.load(&key).await {
        Ok(state) => state,
        Err(StoreError::NotFound(_)) => bail!("no model stored under `{key}`"),
        Err(e) => return Err(e).context(format!("Failed to load model `{key}`")),
    };
    let revision = state.revision;

    let config = runtime.config.policy.to_policy_config()?;
    let engine = PolicyEngine::restore(&config, state)
        .with_context(|| format!("Model `{key}` does not match the configured policy"))?;

    let context = context_for(engine.features(), features)?;
    let (greedy, distribution) = engine.distribution(&context)?;
    let predicted_costs = engine.predicted_costs(&context)?;
    let greedy_mb = engine.action_space().size_of(greedy).unwrap_or_default();

    let summary = ModelSummary {
        key: key.to_string(),
        revision,
        updates: engine.updates(),
        epsilon: engine.epsilon(),
        features: engine.features().to_vec(),
        action_space: engine.action_space().sizes().to_vec(),
        greedy_mb,
        distribution,
        predicted_costs,
    };

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            println!(
                "Model {} (revision {}, {} updates, epsilon {})",
                summary.key, summary.revision, summary.updates, summary.epsilon
            );
            println!("Context: {}", serde_json::to_string(&context)?);
            print_rows(action_rows(
                engine.action_space(),
                &summary.distribution,
                Some(&summary.predicted_costs),
                greedy_mb,
            ));
        }
    }
    Ok(())
}
