//! The interrupted-operation continuation queue.
//!
//! Multi-branch operations that get interrupted (a rebase hitting a
//! conflict) persist how to resume themselves at the `rebase-continue`
//! key. The queue is last-in-first-out (a sub-operation's entry sits
//! above its caller's), with the top stored as the LAST element of the
//! on-disk array. Commands must be idempotent under re-run: resuming a
//! restack that already finished is a state check, not a second rebase.

use slog::debug;

use crate::errors::Result;
use crate::service::StackService;
use crate::state::ContinuationEntry;
use crate::storage::UpdateRequest;
use crate::worktree::Worktree;

/// The state of an in-flight stack operation as observed from the
/// store and the worktree.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueState {
    /// No continuation recorded.
    Idle,
    /// Work to resume, repository not mid-rebase.
    Active { head: ContinuationEntry },
    /// Work to resume and the underlying tool is mid-rebase; only
    /// resume or abort make progress.
    Conflicted { head: ContinuationEntry },
}

impl StackService {
    /// The whole queue, bottom first. The top (next to resume) is the
    /// last element.
    pub fn continuations(&self) -> Result<Vec<ContinuationEntry>> {
        self.store.reader()?.continuations()
    }

    /// The entry a resume would run next.
    pub fn head_continuation(&self) -> Result<Option<ContinuationEntry>> {
        Ok(self.continuations()?.pop())
    }

    /// Push an entry on top of the queue.
    pub fn push_continuation(&self, entry: ContinuationEntry) -> Result<()> {
        self.store.update_with(|reader| {
            let mut queue = reader.continuations()?;
            queue.push(entry.clone());

            let mut request = UpdateRequest::new(format!(
                "record continuation for {}",
                entry.branch.as_deref().unwrap_or("<none>")
            ));
            request.put_continuations(&queue)?;
            Ok(Some(request))
        })?;
        Ok(())
    }

    /// Pop the top entry, if any. Popping the last entry removes the
    /// key entirely; a present-but-empty queue never reaches disk.
    pub fn pop_continuation(&self) -> Result<Option<ContinuationEntry>> {
        let mut popped = None;
        self.store.update_with(|reader| {
            let mut queue = reader.continuations()?;
            match queue.pop() {
                Some(entry) => {
                    popped = Some(entry);
                    let mut request = UpdateRequest::new("pop continuation");
                    request.put_continuations(&queue)?;
                    Ok(Some(request))
                }
                None => {
                    popped = None;
                    Ok(None)
                }
            }
        })?;
        Ok(popped)
    }

    /// Drop the whole queue. This is the state-side half of an abort;
    /// aborting the in-flight rebase itself is the embedding tool's
    /// call into the worktree.
    pub fn clear_continuations(&self) -> Result<()> {
        self.store.update_with(|reader| {
            if reader.continuations()?.is_empty() {
                return Ok(None);
            }
            let mut request = UpdateRequest::new("clear continuations");
            request.put_continuations(&[])?;
            Ok(Some(request))
        })?;
        Ok(())
    }

    /// Observe the continuation state machine.
    pub fn queue_state(&self) -> Result<QueueState> {
        match self.head_continuation()? {
            None => Ok(QueueState::Idle),
            Some(head) => {
                if self.worktree.rebase_in_progress()? {
                    Ok(QueueState::Conflicted { head })
                } else {
                    Ok(QueueState::Active { head })
                }
            }
        }
    }

    /// Pop and run the top entry through `runner` (the embedding tool's
    /// command dispatcher). Checks out the entry's branch first when one
    /// is recorded and it is not already current.
    ///
    /// Returns `false` when the queue was empty. When the re-run is
    /// itself interrupted, or fails any other way, the entry stays
    /// resumable: it is pushed back unless the re-run already pushed an
    /// identical one.
    pub fn resume_next(&self, runner: &mut dyn FnMut(&ContinuationEntry) -> Result<()>) -> Result<bool> {
        self.cancel.check()?;

        let entry = match self.pop_continuation()? {
            Some(entry) => entry,
            None => return Ok(false),
        };
        debug!(
            self.logger, "resuming continuation";
            "command" => entry.command.join(" "),
            "branch" => entry.branch.as_deref().unwrap_or("")
        );

        if let Some(branch) = &entry.branch {
            if self.worktree.current_branch().ok().as_deref() != Some(branch.as_str()) {
                if let Err(e) = self.worktree.checkout(branch) {
                    self.push_continuation(entry)?;
                    return Err(e);
                }
            }
        }

        match runner(&entry) {
            Ok(()) => Ok(true),
            Err(e) => {
                if self.head_continuation()?.as_ref() != Some(&entry) {
                    self.push_continuation(entry)?;
                }
                Err(e)
            }
        }
    }

    /// Resume until the queue is empty or an entry fails. Returns the
    /// number of entries that completed.
    pub fn resume_all(&self, runner: &mut dyn FnMut(&ContinuationEntry) -> Result<()>) -> Result<usize> {
        let mut completed = 0;
        while self.resume_next(runner)? {
            completed += 1;
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::service::Collaborators;
    use crate::state::CONTINUE_KEY;
    use crate::storage::memory::MemoryBackingStore;
    use crate::worktree::mock::{fake_oid, MockWorktree};
    use crate::worktree::RebaseStatus;

    fn service() -> (StackService, MockWorktree) {
        let worktree = MockWorktree::new();
        let service = StackService::new(Collaborators::new(
            Box::new(MemoryBackingStore::new()),
            Box::new(worktree.clone()),
        ));
        (service, worktree)
    }

    fn entry(cmd: &str, branch: Option<&str>) -> ContinuationEntry {
        let mut entry = ContinuationEntry::new(cmd.split(' ').map(|s| s.to_string()).collect());
        if let Some(branch) = branch {
            entry = entry.with_branch(branch);
        }
        entry
    }

    #[test]
    fn test_lifo_order() {
        let (service, _) = service();

        service.push_continuation(entry("outer restack", None)).unwrap();
        service.push_continuation(entry("inner restack", None)).unwrap();

        // The later push resumes first.
        assert_eq!(
            service.head_continuation().unwrap().unwrap().command,
            vec!["inner".to_string(), "restack".to_string()]
        );
        assert_eq!(
            service.pop_continuation().unwrap().unwrap().command[0],
            "inner".to_string()
        );
        assert_eq!(
            service.pop_continuation().unwrap().unwrap().command[0],
            "outer".to_string()
        );
        assert!(service.pop_continuation().unwrap().is_none());
    }

    #[test]
    fn test_pop_last_removes_key() {
        let (service, _) = service();
        service.push_continuation(entry("restack", None)).unwrap();
        assert!(service.store().read(CONTINUE_KEY).unwrap().is_some());

        service.pop_continuation().unwrap();
        assert!(service.store().read(CONTINUE_KEY).unwrap().is_none());
        assert!(service.continuations().unwrap().is_empty());
    }

    #[test]
    fn test_clear_continuations() {
        let (service, _) = service();
        service.push_continuation(entry("a", None)).unwrap();
        service.push_continuation(entry("b", None)).unwrap();

        service.clear_continuations().unwrap();
        assert!(service.continuations().unwrap().is_empty());
        assert!(service.store().read(CONTINUE_KEY).unwrap().is_none());
        // Idempotent.
        service.clear_continuations().unwrap();
    }

    #[test]
    fn test_queue_state_machine() {
        let (service, worktree) = service();
        assert_eq!(service.queue_state().unwrap(), QueueState::Idle);

        service.push_continuation(entry("restack", Some("feat"))).unwrap();
        assert!(matches!(service.queue_state().unwrap(), QueueState::Active { .. }));

        // Simulate the repository entering rebase state.
        worktree.set_branch("feat", fake_oid(1));
        worktree.script_rebase(RebaseStatus::Interrupted);
        worktree
            .rebase_onto("feat", fake_oid(2).as_str(), fake_oid(1).as_str())
            .unwrap();
        assert!(matches!(service.queue_state().unwrap(), QueueState::Conflicted { .. }));
    }

    #[test]
    fn test_resume_runs_entries_in_lifo_order() {
        let (service, worktree) = service();
        worktree.set_branch("a", fake_oid(1));
        worktree.set_branch("b", fake_oid(2));

        service.push_continuation(entry("restack a", Some("a"))).unwrap();
        service.push_continuation(entry("restack b", Some("b"))).unwrap();

        let mut ran = Vec::new();
        let completed = service
            .resume_all(&mut |entry| {
                ran.push(entry.command.join(" "));
                Ok(())
            })
            .unwrap();

        assert_eq!(completed, 2);
        assert_eq!(ran, vec!["restack b", "restack a"]);
        assert!(service.continuations().unwrap().is_empty());
    }

    #[test]
    fn test_resume_checks_out_entry_branch() {
        let (service, worktree) = service();
        worktree.set_branch("feat", fake_oid(1));
        worktree.set_current("other-branch-does-not-exist-in-map");
        worktree.set_branch("other-branch-does-not-exist-in-map", fake_oid(3));

        service.push_continuation(entry("restack", Some("feat"))).unwrap();
        service.resume_next(&mut |_| Ok(())).unwrap();

        assert_eq!(worktree.current_branch().unwrap(), "feat");
    }

    #[test]
    fn test_interrupted_resume_stays_resumable() {
        let (service, worktree) = service();
        worktree.set_branch("feat", fake_oid(1));

        service.push_continuation(entry("restack", Some("feat"))).unwrap();

        // The re-run is interrupted again without re-pushing itself.
        let err = service
            .resume_next(&mut |_| Err(Error::Interrupted { branch: "feat".into() }))
            .unwrap_err();
        assert!(err.is_interrupted());

        // The same entry is back on top.
        let head = service.head_continuation().unwrap().unwrap();
        assert_eq!(head.branch.as_deref(), Some("feat"));
        assert_eq!(service.continuations().unwrap().len(), 1);
    }

    #[test]
    fn test_interrupted_resume_does_not_duplicate_selfpushed_entry() {
        let (service, worktree) = service();
        worktree.set_branch("feat", fake_oid(1));

        let resume = entry("restack", Some("feat"));
        service.push_continuation(resume.clone()).unwrap();

        // The re-run pushes an identical entry itself (as the restack
        // orchestrator does) before reporting the interruption.
        let service_ref = &service;
        let err = service
            .resume_next(&mut |popped| {
                service_ref.push_continuation(popped.clone()).unwrap();
                Err(Error::Interrupted { branch: "feat".into() })
            })
            .unwrap_err();
        assert!(err.is_interrupted());

        assert_eq!(service.continuations().unwrap().len(), 1);
    }

    #[test]
    fn test_resume_empty_queue_is_noop() {
        let (service, _) = service();
        let mut calls = 0;
        assert!(!service
            .resume_next(&mut |_| {
                calls += 1;
                Ok(())
            })
            .unwrap());
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_resume_respects_cancellation() {
        let (service, worktree) = service();
        worktree.set_branch("feat", fake_oid(1));
        service.push_continuation(entry("restack", Some("feat"))).unwrap();

        service.cancel_token().cancel();
        assert!(service.resume_next(&mut |_| Ok(())).is_err());
        // Entry untouched.
        assert_eq!(service.continuations().unwrap().len(), 1);
    }
}
