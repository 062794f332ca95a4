//! Sandbox instance lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one sandbox instance.
///
/// ```text
/// Created -> Prepared -> Running -> {Completed, TimedOut, Crashed, Cancelled}
///    |           |                                 |
///    +-----------+-> SetupFailed                   |
///                         |                        |
///                         +--------> Cleaned <-----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Prepared,
    Running,
    Completed,
    TimedOut,
    Crashed,
    Cancelled,
    SetupFailed,
    Cleaned,
}

impl SandboxState {
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Created, Prepared)
                | (Created, SetupFailed)
                | (Prepared, Running)
                | (Prepared, SetupFailed)
                | (Running, Completed)
                | (Running, TimedOut)
                | (Running, Crashed)
                | (Running, Cancelled)
                | (Created, Cleaned)
                | (Prepared, Cleaned)
                | (Completed, Cleaned)
                | (TimedOut, Cleaned)
                | (Crashed, Cleaned)
                | (Cancelled, Cleaned)
                | (SetupFailed, Cleaned)
        )
    }

    /// The process (if any) is gone and only cleanup remains
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            SandboxState::Completed
                | SandboxState::TimedOut
                | SandboxState::Crashed
                | SandboxState::Cancelled
                | SandboxState::SetupFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxState::Created => "created",
            SandboxState::Prepared => "prepared",
            SandboxState::Running => "running",
            SandboxState::Completed => "completed",
            SandboxState::TimedOut => "timed_out",
            SandboxState::Crashed => "crashed",
            SandboxState::Cancelled => "cancelled",
            SandboxState::SetupFailed => "setup_failed",
            SandboxState::Cleaned => "cleaned",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
