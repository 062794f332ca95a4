//! Process spawning, supervision and instance lifecycle

pub mod executor;
pub mod output;
pub mod process;
pub mod state;
pub mod status;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use executor::{RunOutcome, SandboxExecutor, SandboxInstance};
pub use process::{ChildExit, ProcessConfig};
pub use state::SandboxState;

/// Scheduler-side revocation of a running request.
///
/// Clones share one flag. The executor observes it at its next poll.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_cancellation() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
