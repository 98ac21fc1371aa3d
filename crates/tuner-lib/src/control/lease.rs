//! One controller per target within a process

use crate::error::TunerError;
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of targets that currently have an active controller
#[derive(Debug, Clone, Default)]
pub struct LeaseRegistry {
    held: Arc<DashMap<String, String>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `target`; fails with `TargetBusy` when held
    pub fn acquire(&self, target: &str, holder: &str) -> Result<TargetLease, TunerError> {
        use dashmap::mapref::entry::Entry;

        match self.held.entry(target.to_string()) {
            Entry::Occupied(e) => Err(TunerError::TargetBusy(format!(
                "{target} (held by {})",
                e.get()
            ))),
            Entry::Vacant(e) => {
                e.insert(holder.to_string());
                Ok(TargetLease {
                    registry: self.held.clone(),
                    target: target.to_string(),
                })
            }
        }
    }

    pub fn is_held(&self, target: &str) -> bool {
        self.held.contains_key(target)
    }
}

/// Released on drop
#[derive(Debug)]
pub struct TargetLease {
    registry: Arc<DashMap<String, String>>,
    target: String,
}

impl TargetLease {
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        self.registry.remove(&self.target);
    }
}
