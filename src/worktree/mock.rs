//! Scripted worktree for tests.
//!
//! The mock keeps branch tips in a map and replays scripted rebase
//! outcomes, recording every call so tests can assert exactly which
//! mutations happened. Clones share state, so a test can hand one clone
//! to the service and keep another for assertions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::{RebaseStatus, Worktree};
use crate::errors::{Error, Result};
use crate::storage::Oid;

/// A deterministic fake commit id.
pub fn fake_oid(seed: u8) -> Oid {
    Oid::from_hex(&format!("{:02x}", seed).repeat(20)).unwrap()
}

/// One recorded worktree call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeCall {
    Checkout(String),
    RebaseOnto {
        branch: String,
        new_base: String,
        old_base: String,
    },
    CreateBranch { name: String, at: String },
    RenameBranch { old: String, new: String },
    DeleteBranch(String),
    Push { remote: String, branch: String, force: bool },
    DetachHead,
    RebaseAbort,
    RebaseContinue,
}

/// What the next rebase (or rebase-continue) should do.
#[derive(Debug, Clone)]
enum Scripted {
    Outcome(RebaseStatus),
    Fail(String),
}

#[derive(Default)]
struct Inner {
    branches: BTreeMap<String, Oid>,
    current: Option<String>,
    remotes: BTreeMap<String, String>,
    rebase_in_progress: bool,
    scripted_rebases: VecDeque<Scripted>,
    fail_next_rename: Option<String>,
    calls: Vec<WorktreeCall>,
}

/// Shared-state scripted [`Worktree`].
#[derive(Clone, Default)]
pub struct MockWorktree {
    inner: Arc<Mutex<Inner>>,
}

impl MockWorktree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or move a branch tip.
    pub fn set_branch(&self, name: &str, tip: Oid) {
        let mut inner = self.inner.lock().unwrap();
        inner.branches.insert(name.to_string(), tip);
    }

    pub fn set_current(&self, name: &str) {
        self.inner.lock().unwrap().current = Some(name.to_string());
    }

    pub fn add_remote(&self, name: &str, url: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.remotes.insert(name.to_string(), url.to_string());
    }

    /// Queue the outcome of the next unscripted rebase. Unqueued rebases
    /// complete successfully.
    pub fn script_rebase(&self, status: RebaseStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.scripted_rebases.push_back(Scripted::Outcome(status));
    }

    /// Queue a hard failure for the next rebase.
    pub fn script_rebase_failure(&self, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.scripted_rebases.push_back(Scripted::Fail(message.to_string()));
    }

    /// Make the next rename fail, as if the underlying tool refused.
    pub fn fail_next_rename(&self, message: &str) {
        self.inner.lock().unwrap().fail_next_rename = Some(message.to_string());
    }

    /// Everything the service asked this worktree to do, in order.
    pub fn calls(&self) -> Vec<WorktreeCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Recorded rebase invocations only.
    pub fn rebase_calls(&self) -> Vec<WorktreeCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, WorktreeCall::RebaseOnto { .. }))
            .collect()
    }

    fn next_scripted(inner: &mut Inner) -> Scripted {
        inner
            .scripted_rebases
            .pop_front()
            .unwrap_or(Scripted::Outcome(RebaseStatus::Completed))
    }
}

impl Worktree for MockWorktree {
    fn current_branch(&self) -> Result<String> {
        self.inner
            .lock()
            .unwrap()
            .current
            .clone()
            .ok_or_else(|| Error::external(anyhow::anyhow!("HEAD is detached")))
    }

    fn checkout(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(WorktreeCall::Checkout(name.to_string()));
        if !inner.branches.contains_key(name) {
            return Err(Error::external(anyhow::anyhow!("Branch '{}' not found", name)));
        }
        inner.current = Some(name.to_string());
        Ok(())
    }

    fn peel_to_commit(&self, rev: &str) -> Result<Oid> {
        let inner = self.inner.lock().unwrap();
        if let Some(tip) = inner.branches.get(rev) {
            return Ok(tip.clone());
        }
        if let Ok(oid) = Oid::from_hex(rev) {
            return Ok(oid);
        }
        Err(Error::external(anyhow::anyhow!("Failed to resolve '{}'", rev)))
    }

    fn rebase_onto(&self, branch: &str, new_base: &str, old_base: &str) -> Result<RebaseStatus> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(WorktreeCall::RebaseOnto {
            branch: branch.to_string(),
            new_base: new_base.to_string(),
            old_base: old_base.to_string(),
        });
        match Self::next_scripted(&mut inner) {
            Scripted::Outcome(RebaseStatus::Completed) => {
                inner.current = Some(branch.to_string());
                Ok(RebaseStatus::Completed)
            }
            Scripted::Outcome(RebaseStatus::Interrupted) => {
                inner.rebase_in_progress = true;
                inner.current = Some(branch.to_string());
                Ok(RebaseStatus::Interrupted)
            }
            Scripted::Fail(message) => Err(Error::external(anyhow::anyhow!(message))),
        }
    }

    fn create_branch(&self, name: &str, at: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(WorktreeCall::CreateBranch {
            name: name.to_string(),
            at: at.to_string(),
        });
        let tip = match inner.branches.get(at) {
            Some(tip) => tip.clone(),
            None => Oid::from_hex(at).map_err(|_| Error::external(anyhow::anyhow!("Failed to resolve '{}'", at)))?,
        };
        if inner.branches.contains_key(name) {
            return Err(Error::external(anyhow::anyhow!("Branch '{}' already exists", name)));
        }
        inner.branches.insert(name.to_string(), tip);
        Ok(())
    }

    fn rename_branch(&self, old: &str, new: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(WorktreeCall::RenameBranch {
            old: old.to_string(),
            new: new.to_string(),
        });
        if let Some(message) = inner.fail_next_rename.take() {
            return Err(Error::external(anyhow::anyhow!(message)));
        }
        let tip = inner
            .branches
            .remove(old)
            .ok_or_else(|| Error::external(anyhow::anyhow!("Branch '{}' not found", old)))?;
        inner.branches.insert(new.to_string(), tip);
        if inner.current.as_deref() == Some(old) {
            inner.current = Some(new.to_string());
        }
        Ok(())
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(WorktreeCall::DeleteBranch(name.to_string()));
        inner
            .branches
            .remove(name)
            .ok_or_else(|| Error::external(anyhow::anyhow!("Branch '{}' not found", name)))?;
        Ok(())
    }

    fn list_remotes(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().remotes.keys().cloned().collect())
    }

    fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().remotes.get(remote).cloned())
    }

    fn push(&self, remote: &str, branch: &str, force: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(WorktreeCall::Push {
            remote: remote.to_string(),
            branch: branch.to_string(),
            force,
        });
        Ok(())
    }

    fn detach_head(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(WorktreeCall::DetachHead);
        inner.current = None;
        Ok(())
    }

    fn rebase_in_progress(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().rebase_in_progress)
    }

    fn rebase_abort(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(WorktreeCall::RebaseAbort);
        inner.rebase_in_progress = false;
        Ok(())
    }

    fn rebase_continue(&self) -> Result<RebaseStatus> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(WorktreeCall::RebaseContinue);
        match Self::next_scripted(&mut inner) {
            Scripted::Outcome(RebaseStatus::Completed) => {
                inner.rebase_in_progress = false;
                Ok(RebaseStatus::Completed)
            }
            Scripted::Outcome(RebaseStatus::Interrupted) => {
                inner.rebase_in_progress = true;
                Ok(RebaseStatus::Interrupted)
            }
            Scripted::Fail(message) => Err(Error::external(anyhow::anyhow!(message))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_bookkeeping() {
        let worktree = MockWorktree::new();
        worktree.set_branch("main", fake_oid(1));
        worktree.set_current("main");

        worktree.create_branch("feat", "main").unwrap();
        assert_eq!(worktree.peel_to_commit("feat").unwrap(), fake_oid(1));

        worktree.checkout("feat").unwrap();
        assert_eq!(worktree.current_branch().unwrap(), "feat");

        worktree.rename_branch("feat", "feat-2").unwrap();
        assert_eq!(worktree.current_branch().unwrap(), "feat-2");
        assert!(worktree.peel_to_commit("feat").is_err());
    }

    #[test]
    fn test_peel_accepts_raw_hashes() {
        let worktree = MockWorktree::new();
        let oid = fake_oid(9);
        assert_eq!(worktree.peel_to_commit(oid.as_str()).unwrap(), oid);
    }

    #[test]
    fn test_scripted_rebase_interruption() {
        let worktree = MockWorktree::new();
        worktree.set_branch("main", fake_oid(1));
        worktree.set_branch("feat", fake_oid(2));

        worktree.script_rebase(RebaseStatus::Interrupted);
        let status = worktree
            .rebase_onto("feat", fake_oid(3).as_str(), fake_oid(1).as_str())
            .unwrap();
        assert!(status.is_interrupted());
        assert!(worktree.rebase_in_progress().unwrap());

        // Continuing with no script completes and clears the state.
        assert_eq!(worktree.rebase_continue().unwrap(), RebaseStatus::Completed);
        assert!(!worktree.rebase_in_progress().unwrap());
    }

    #[test]
    fn test_unscripted_rebase_completes() {
        let worktree = MockWorktree::new();
        worktree.set_branch("feat", fake_oid(2));
        let status = worktree
            .rebase_onto("feat", fake_oid(3).as_str(), fake_oid(1).as_str())
            .unwrap();
        assert_eq!(status, RebaseStatus::Completed);
        assert_eq!(worktree.rebase_calls().len(), 1);
    }

    #[test]
    fn test_fail_next_rename_is_one_shot() {
        let worktree = MockWorktree::new();
        worktree.set_branch("a", fake_oid(1));

        worktree.fail_next_rename("refused");
        assert!(worktree.rename_branch("a", "b").is_err());
        assert!(worktree.rename_branch("a", "b").is_ok());
    }
}
