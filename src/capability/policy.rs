//! In-memory policy store

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use super::{Capability, CapabilityGate, Decision, GateError};
use crate::errors::{Result, SandboxError};

/// Static principal → capability grants.
///
/// A grant ending in `*` covers every capability with that prefix, so
/// `display.*` covers `display.pointer`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticPolicy {
    #[serde(default)]
    grants: HashMap<String, BTreeSet<String>>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `capabilities` to `principal_id`
    pub fn grant<I, S>(mut self, principal_id: &str, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .entry(principal_id.to_string())
            .or_default()
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Load `{"grants": {"principal": ["cap", ...]}}` from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            SandboxError::InvalidConfig(format!(
                "Invalid policy file {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn covers(&self, principal_id: &str, capability: &Capability) -> bool {
        let Some(granted) = self.grants.get(principal_id) else {
            return false;
        };
        granted.iter().any(|grant| match grant.strip_suffix('*') {
            Some(prefix) => capability.as_str().starts_with(prefix),
            None => grant == capability.as_str(),
        })
    }
}

impl CapabilityGate for StaticPolicy {
    fn check(
        &self,
        principal_id: &str,
        required: &BTreeSet<Capability>,
    ) -> std::result::Result<Decision, GateError> {
        let missing: Vec<&str> = required
            .iter()
            .filter(|cap| !self.covers(principal_id, cap))
            .map(Capability::as_str)
            .collect();

        if missing.is_empty() {
            Ok(Decision::Allow)
        } else {
            Ok(Decision::Deny {
                reason: format!("missing capabilities: {}", missing.join(", ")),
            })
        }
    }
}
