//! Configuration discovery for the CLI

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tuner_lib::TunerConfig;

/// Load the tuner configuration
///
/// An explicit path must exist. Without one, `~/.config/tuner/config.toml`
/// is used when present, otherwise defaults plus `TUNER__*` overrides.
pub fn load(explicit: Option<&Path>) -> Result<TunerConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_path().filter(|p| p.exists()),
    };

    TunerConfig::load(path.as_deref()).with_context(|| match &path {
        Some(p) => format!("Failed to load configuration from {}", p.display()),
        None => "Failed to load configuration".to_string(),
    })
}

/// Get the default configuration file path
fn default_path() -> Option<PathBuf> {
    let home = dirs_next::home_dir()?;
    Some(home.join(".config").join("tuner").join("config.toml"))
}
