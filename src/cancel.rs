//! Cancellation signal shared between the embedding tool and the core.
//!
//! The core performs no parallel execution of its own; cancellation is
//! checked before each worktree call and between continuation entries.
//! Work already committed to the store is never rolled back; the store
//! stays valid, just possibly a step short of the intended end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;

use crate::errors::{Error, Result};

/// A cloneable cancellation flag. All clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail fast if the signal is raised. Called at suspension points.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::external(anyhow::anyhow!("operation canceled")));
        }
        Ok(())
    }

    /// Wire this token to Ctrl-C. May be installed at most once per
    /// process; the handler only raises the flag, so in-flight store
    /// transactions finish and the next suspension point observes it.
    pub fn install_ctrlc_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || token.cancel()).context("Failed to install Ctrl-C handler")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_clear() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_observed_by_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        token.cancel();
        assert!(other.is_canceled());
        assert!(other.check().is_err());
    }

    #[test]
    fn test_check_error_mentions_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let err = token.check().unwrap_err();
        assert!(err.to_string().contains("canceled"));
    }
}
