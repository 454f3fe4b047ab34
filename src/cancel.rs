//! Cooperative cancellation shared by the pipeline, the ring queue and collaborator callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{InterruptKind, LoadError};

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const SHUTDOWN: u8 = 2;

/// A cloneable flag signalling that the current load must stop.
///
/// Clones observe the same flag, so a signal handler, another thread or a collaborator callback
/// can interrupt a run that is blocked on the ring queue or busy parsing.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation on behalf of the user.
    pub fn cancel(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Request an administrative shutdown. Takes precedence over a plain cancel.
    pub fn shutdown(&self) {
        self.state.store(SHUTDOWN, Ordering::SeqCst);
    }

    /// The pending interrupt, if any.
    pub fn interrupt(&self) -> Option<InterruptKind> {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => None,
            CANCELLED => Some(InterruptKind::Cancelled),
            _ => Some(InterruptKind::Shutdown),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.interrupt().is_some()
    }

    /// Returns `Err(LoadError::Interrupted)` once an interrupt has been requested.
    pub fn check(&self) -> Result<(), LoadError> {
        match self.interrupt() {
            Some(kind) => Err(LoadError::Interrupted(kind)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());

        other.cancel();
        assert_eq!(token.interrupt(), Some(InterruptKind::Cancelled));
        assert!(matches!(
            token.check(),
            Err(LoadError::Interrupted(InterruptKind::Cancelled))
        ));
    }

    #[test]
    fn shutdown_overrides_cancel() {
        let token = CancelToken::new();
        token.cancel();
        token.shutdown();
        token.cancel();
        assert_eq!(token.interrupt(), Some(InterruptKind::Shutdown));
    }
}
