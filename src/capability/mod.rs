//! Capability gate: the engine's view of the external authorization decision
//!
//! The engine never decides *whether* a principal may do something. It asks a
//! [`CapabilityGate`], records one audit entry per question, and fails closed
//! when the answer is "no" or cannot be obtained.

pub mod audit;
pub mod policy;

pub use audit::{AuditRecord, AuditSink, LogAuditSink, MemoryAuditSink};
pub use policy::StaticPolicy;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Capability granting outbound network access to a sandboxed tool
pub const CAP_SANDBOX_NETWORK: &str = "sandbox.network";
/// Capability granting additional read-only host mounts
pub const CAP_SANDBOX_MOUNT_READ: &str = "sandbox.mount.read";
/// Capability granting syscalls beyond the baseline allowlist
pub const CAP_SANDBOX_SYSCALL: &str = "sandbox.syscall";
/// Capability class for reading the host display
pub const CAP_DISPLAY_CAPTURE: &str = "display.capture";
/// Capability class for moving and clicking the host pointer
pub const CAP_DISPLAY_POINTER: &str = "display.pointer";
/// Capability class for injecting host keystrokes
pub const CAP_DISPLAY_KEYBOARD: &str = "display.keyboard";

const DISPLAY_CLASS_PREFIX: &str = "display.";

/// A named permission, e.g. `fs.write` or `display.pointer`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host-display capabilities form a separate, higher-privilege class
    pub fn is_display_class(&self) -> bool {
        self.0.starts_with(DISPLAY_CLASS_PREFIX)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Capability::new(value)
    }
}

/// Answer from the policy store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

/// The decision service could not answer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("policy service unavailable: {0}")]
    Unavailable(String),

    #[error("policy lookup failed: {0}")]
    Lookup(String),
}

/// External authorization decision. Implementations hold no engine state.
pub trait CapabilityGate: Send + Sync {
    fn check(
        &self,
        principal_id: &str,
        required: &BTreeSet<Capability>,
    ) -> std::result::Result<Decision, GateError>;
}

/// Proof that a capability check succeeded.
///
/// Only [`authorize`] constructs this, so anything that takes an
/// `&Authorization` cannot run before the gate has answered `Allow`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    principal_id: String,
    granted: BTreeSet<Capability>,
}

impl Authorization {
    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    pub fn covers(&self, capability: &Capability) -> bool {
        self.granted.contains(capability)
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.granted
    }

    #[cfg(test)]
    pub(crate) fn for_testing(principal_id: &str, granted: &[&str]) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            granted: granted.iter().map(|c| Capability::new(*c)).collect(),
        }
    }
}

/// Why a check did not produce an [`Authorization`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    Denied(String),
    Undecidable(GateError),
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::Denied(reason) => write!(f, "denied: {}", reason),
            Denial::Undecidable(err) => write!(f, "undecidable (failing closed): {}", err),
        }
    }
}

/// Ask the gate about `required`, audit the question, and fail closed.
///
/// Exactly one audit record is emitted per call, whatever the outcome.
pub fn authorize(
    gate: &dyn CapabilityGate,
    audit: &dyn AuditSink,
    principal_id: &str,
    required: &BTreeSet<Capability>,
    action: &str,
    resource: &str,
) -> std::result::Result<Authorization, Denial> {
    let outcome = match gate.check(principal_id, required) {
        Ok(Decision::Allow) => Ok(Authorization {
            principal_id: principal_id.to_string(),
            granted: required.clone(),
        }),
        Ok(Decision::Deny { reason }) => Err(Denial::Denied(reason)),
        Err(err) => {
            warn!(
                "Capability check for '{}' could not be decided: {}",
                principal_id, err
            );
            Err(Denial::Undecidable(err))
        }
    };

    audit.record(AuditRecord::new(
        principal_id,
        action,
        resource,
        outcome.is_ok(),
    ));
    debug!(
        "authorize principal={} action={} resource={} allowed={}",
        principal_id,
        action,
        resource,
        outcome.is_ok()
    );

    outcome
}
