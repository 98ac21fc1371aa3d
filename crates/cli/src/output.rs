//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table of rows
pub fn print_rows<T: Tabled>(rows: Vec<T>) {
    if rows.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any serializable report as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a memory size in MB
pub fn format_mb(size_mb: u32) -> String {
    if size_mb >= 1024 && size_mb % 1024 == 0 {
        format!("{}Gi", size_mb / 1024)
    } else {
        format!("{}Mi", size_mb)
    }
}

/// Format a probability as percentage
pub fn format_probability(p: f64) -> String {
    format!("{:.1}%", p * 100.0)
}

/// Color an outcome label
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "ok" | "applied" | "warm" => status.green().to_string(),
        "shadow" | "fresh" | "cancelled" => status.yellow().to_string(),
        "failed" | "error" => status.red().to_string(),
        _ => status.to_string(),
    }
}
