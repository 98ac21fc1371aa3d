//! Representative request context for the next recommendation

use crate::models::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which records the next context is averaged over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContextWindow {
    /// Records observed in the current cycle
    #[default]
    Cycle,
    /// The most recent `n` processed records
    Last(usize),
}

impl ContextWindow {
    /// History size this window needs from the queue
    pub fn history_limit(&self) -> Option<usize> {
        match self {
            ContextWindow::Cycle => None,
            ContextWindow::Last(n) => Some(*n),
        }
    }

    /// Mean context over the window
    ///
    /// An empty history falls back to the current cycle, and an empty
    /// cycle to the neutral context (every feature 1). Features no record
    /// carried are also set to 1.
    pub fn representative(&self, cycle: &[Context], history: &[Context], features: &[String]) -> Context {
        let windowed = match self {
            ContextWindow::Cycle => None,
            ContextWindow::Last(_) => Context::mean(history, features),
        };
        let mut context = windowed
            .or_else(|| Context::mean(cycle, features))
            .unwrap_or_else(|| Context::neutral(features));
        for name in features {
            if context.get(name).is_none() {
                context.insert(name.clone(), 1.0);
            }
        }
        context
    }
}

impl FromStr for ContextWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cycle" | "wait_period" => Ok(ContextWindow::Cycle),
            other => other
                .strip_prefix("last_")
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .map(ContextWindow::Last)
                .ok_or_else(|| {
                    format!("unknown context window `{other}` (expected cycle or last_<n>)")
                }),
        }
    }
}

impl TryFrom<String> for ContextWindow {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContextWindow> for String {
    fn from(w: ContextWindow) -> Self {
        w.to_string()
    }
}

impl fmt::Display for ContextWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextWindow::Cycle => f.write_str("cycle"),
            ContextWindow::Last(n) => write!(f, "last_{n}"),
        }
    }
}
