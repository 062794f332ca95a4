//! Error types for tool execution

use std::io;
use thiserror::Error;

use crate::gui::DisplayError;
use crate::result::ErrorKind;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors raised while preparing, running or tearing down a tool execution.
///
/// Every variant maps onto exactly one [`ErrorKind`] so the facade can turn
/// any internal failure into a structured result.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid lifecycle transition: {0}")]
    InvalidState(String),

    #[error("Setup failed in {stage}: {message}")]
    ChildSetup { stage: String, message: String },

    #[error("Display: {0}")]
    Display(#[from] DisplayError),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),
}

impl SandboxError {
    /// Classify this error for the caller-facing result
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Display(DisplayError::TimedOut { .. }) => ErrorKind::ExecutionTimeout,
            SandboxError::Display(_) => ErrorKind::ExecutionCrash,
            SandboxError::Cleanup(_) => ErrorKind::CleanupFailure,
            SandboxError::Io(_)
            | SandboxError::Syscall(_)
            | SandboxError::Namespace(_)
            | SandboxError::Seccomp(_)
            | SandboxError::Mount(_)
            | SandboxError::InvalidConfig(_)
            | SandboxError::UnknownTool(_)
            | SandboxError::InvalidArguments(_)
            | SandboxError::InvalidState(_)
            | SandboxError::ChildSetup { .. } => ErrorKind::SetupFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let sandbox_err = SandboxError::from(io_err);
        assert!(sandbox_err.to_string().contains("IO error"));
        assert_eq!(sandbox_err.kind(), ErrorKind::SetupFailure);
    }

    #[test]
    fn test_child_setup_display() {
        let err = SandboxError::ChildSetup {
            stage: "chroot".to_string(),
            message: "Operation not permitted".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Setup failed in chroot: Operation not permitted"
        );
        assert_eq!(err.kind(), ErrorKind::SetupFailure);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SandboxError::Cleanup("x".into()).kind(),
            ErrorKind::CleanupFailure
        );
        assert_eq!(
            SandboxError::UnknownTool("x".into()).kind(),
            ErrorKind::SetupFailure
        );
    }

    #[test]
    fn test_display_failures() {
        let hung = SandboxError::from(DisplayError::TimedOut {
            program: "grim".to_string(),
        });
        assert_eq!(hung.kind(), ErrorKind::ExecutionTimeout);
        assert_eq!(hung.to_string(), "Display: grim did not finish in time");

        let missing = SandboxError::from(DisplayError::Unavailable("no xdotool".to_string()));
        assert_eq!(missing.kind(), ErrorKind::ExecutionCrash);
    }
}
