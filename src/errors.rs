//! Error taxonomy for the stack-state engine.
//!
//! Callers match on the *kind* of failure, not on message text. The service
//! layer recovers locally only from [`Error::Conflict`] (transactor retry)
//! and [`Error::Interrupted`] (continuation push); everything else is
//! surfaced unchanged to the embedding tool.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The failure kinds the core can produce.
#[derive(Debug, Error)]
pub enum Error {
    /// A referenced branch is not tracked, or a state blob is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A track/create conflicts with an existing record.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Bad input: empty name, trunk where a stack branch is required,
    /// a reparent that would break the forest.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The compare-and-swap on the state reference failed repeatedly.
    /// Retryable at a higher level; the store is unchanged.
    #[error("state update conflict: {0}")]
    Conflict(String),

    /// A rebase stopped cleanly and a continuation entry was pushed.
    /// Not a user-facing failure, but a signal up the stack.
    #[error("rebase of '{branch}' interrupted; resume to continue")]
    Interrupted { branch: String },

    /// On-disk state violates invariants: a cycle, a dangling base,
    /// an unreadable schema. Fatal.
    #[error("state integrity error: {0}")]
    Integrity(String),

    /// The worktree or backing-ref store failed; surfaced verbatim with
    /// context attached by the caller.
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl Error {
    /// Wrap a collaborator failure.
    pub fn external<E: Into<anyhow::Error>>(err: E) -> Self {
        Error::External(err.into())
    }

    /// True for the retryable CAS-miss kind.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// True when a rebase paused and a continuation was recorded.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_predicates() {
        assert!(Error::Conflict("tip moved".into()).is_conflict());
        assert!(!Error::NotFound("branch 'x'".into()).is_conflict());
        assert!(Error::Interrupted { branch: "f".into() }.is_interrupted());
        assert!(!Error::Conflict("tip moved".into()).is_interrupted());
    }

    #[test]
    fn test_external_preserves_message() {
        let err = Error::external(anyhow::anyhow!("disk full"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_interrupted_names_branch() {
        let err = Error::Interrupted { branch: "feature-2".into() };
        assert!(err.to_string().contains("feature-2"));
    }
}
