//! Execution requests as submitted by the scheduler

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::SandboxError;

/// Named policy level that bounds which additive grants a profile may carry.
///
/// Ordered: `Baseline < Elevated`, so `a.min(b)` is the more restrictive tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    #[default]
    Baseline,
    Elevated,
}

impl TrustTier {
    pub fn is_elevated(&self) -> bool {
        matches!(self, TrustTier::Elevated)
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustTier::Baseline => f.write_str("baseline"),
            TrustTier::Elevated => f.write_str("elevated"),
        }
    }
}

impl FromStr for TrustTier {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "baseline" => Ok(TrustTier::Baseline),
            "elevated" => Ok(TrustTier::Elevated),
            other => Err(SandboxError::InvalidConfig(format!(
                "Unknown trust tier: {}",
                other
            ))),
        }
    }
}

/// One tool invocation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    tool_id: String,
    #[serde(default)]
    arguments: Map<String, Value>,
    #[serde(default)]
    trust_tier: TrustTier,
    timeout_s: u64,
    memory_limit_mb: u64,
    principal_id: String,
}

impl ExecutionRequest {
    pub fn new(
        tool_id: impl Into<String>,
        principal_id: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            tool_id: tool_id.into(),
            arguments,
            trust_tier: TrustTier::Baseline,
            timeout_s: 30,
            memory_limit_mb: 256,
            principal_id: principal_id.into(),
        }
    }

    pub fn with_trust_tier(mut self, tier: TrustTier) -> Self {
        self.trust_tier = tier;
        self
    }

    pub fn with_timeout_s(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub fn with_memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }

    pub fn tool_id(&self) -> &str {
        &self.tool_id
    }

    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    pub fn trust_tier(&self) -> TrustTier {
        self.trust_tier
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    pub fn timeout_s(&self) -> u64 {
        self.timeout_s
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    /// Reject requests that cannot possibly run
    pub fn validate(&self) -> crate::Result<()> {
        if self.tool_id.trim().is_empty() {
            return Err(SandboxError::InvalidArguments(
                "tool_id cannot be empty".to_string(),
            ));
        }
        if self.principal_id.trim().is_empty() {
            return Err(SandboxError::InvalidArguments(
                "principal_id cannot be empty".to_string(),
            ));
        }
        if self.timeout_s == 0 {
            return Err(SandboxError::InvalidArguments(
                "timeout_s must be greater than zero".to_string(),
            ));
        }
        if self.memory_limit_mb == 0 {
            return Err(SandboxError::InvalidArguments(
                "memory_limit_mb must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
