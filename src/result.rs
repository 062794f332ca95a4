//! Caller-facing result model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Structured failure classification returned to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Capability check failed or could not be decided. No process was spawned.
    PermissionDenied,
    /// Profile, workspace, mount or namespace construction failed
    SetupFailure,
    /// Wall-clock timeout elapsed; the process group was terminated
    ExecutionTimeout,
    /// Nonzero exit or fatal signal unrelated to a timeout
    ExecutionCrash,
    /// A kernel-enforced resource limit was hit
    ResourceExhausted,
    /// Cancelled by the scheduler before completion
    Cancelled,
    /// Teardown failed. Informational only.
    CleanupFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::SetupFailure => "setup_failure",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::ExecutionCrash => "execution_crash",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CleanupFailure => "cleanup_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata about a file a tool left in its workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name (last path component)
    pub name: String,
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Creation time, when the filesystem records one
    pub created: Option<DateTime<Utc>>,
    /// Last modification time
    pub modified: Option<DateTime<Utc>>,
    /// Host copy made before cleanup, if an export directory is configured
    pub exported_to: Option<PathBuf>,
}

/// Outcome of one execution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub artifacts: Vec<Artifact>,
    pub error_kind: Option<ErrorKind>,
    pub diagnostic_message: String,
    /// Sandbox instance that served the request (absent when none was created)
    pub instance_id: Option<String>,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    /// Non-fatal problems (unreadable artifacts, cleanup trouble)
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// A failed result for a request that never reached a process
    pub fn rejected(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            artifacts: Vec::new(),
            error_kind: Some(kind),
            diagnostic_message: message.into(),
            instance_id: None,
            wall_time_ms: 0,
            cpu_time_ms: 0,
            warnings: Vec::new(),
        }
    }

    /// Record a teardown problem without disturbing the determined outcome
    pub fn note_cleanup_failure(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.error_kind.is_none() {
            self.error_kind = Some(ErrorKind::CleanupFailure);
        }
        self.warnings.push(format!("cleanup: {}", message));
    }

    /// Check if the process was killed by the syscall filter (SIGSYS)
    pub fn killed_by_seccomp(&self) -> bool {
        self.signal == Some(libc::SIGSYS)
    }
}
