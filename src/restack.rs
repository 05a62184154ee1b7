//! Restack orchestration.
//!
//! Given an ordered set of branches (usually the result of
//! [`list_upstack`](crate::service::StackService::list_upstack)), replay
//! each one whose base has moved. A branch whose recorded base hash
//! already matches the base tip is skipped; an interrupted rebase pushes
//! a continuation entry and stops the run without touching later
//! branches, leaving the repository for the user to resolve.

use slog::{debug, info};

use crate::errors::{Error, Result};
use crate::service::StackService;
use crate::state::ContinuationEntry;
use crate::storage::UpdateRequest;
use crate::worktree::{RebaseStatus, Worktree};

/// One orchestrator run.
#[derive(Debug, Clone)]
pub struct RestackPlan {
    /// Branches in visit order; every branch must follow its base.
    pub branches: Vec<String>,
    /// The first branch is already on the right commit (the caller just
    /// produced it); record its base hash without rebasing.
    pub skip_start: bool,
    /// Argument vector the embedding tool understands, pushed as the
    /// continuation command when a rebase is interrupted.
    pub resume_command: Vec<String>,
    /// Optional note stored on the continuation entry.
    pub message: Option<String>,
}

impl RestackPlan {
    pub fn new(branches: Vec<String>, resume_command: Vec<String>) -> Self {
        Self {
            branches,
            skip_start: false,
            resume_command,
            message: None,
        }
    }

    pub fn skip_start(mut self) -> Self {
        self.skip_start = true;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// What happened to one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Recorded base hash already matched the base tip.
    AlreadyStacked,
    /// Replayed (or, with skip-start, adopted) onto the new base tip.
    Restacked { base: String, base_hash: String },
}

/// Per-branch outcomes of a completed run, in visit order.
#[derive(Debug, Clone, Default)]
pub struct RestackReport {
    pub outcomes: Vec<(String, BranchOutcome)>,
}

impl RestackReport {
    pub fn restacked_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, BranchOutcome::Restacked { .. }))
            .count()
    }
}

impl StackService {
    /// Run a restack plan.
    ///
    /// Returns [`Error::Interrupted`] when a rebase paused; the
    /// continuation queue then holds the resume command and the
    /// repository is left mid-rebase for the user. Any other failure
    /// restores the originally checked-out branch before propagating.
    pub fn restack(&self, plan: &RestackPlan) -> Result<RestackReport> {
        let original = self.worktree.current_branch().ok();

        match self.restack_branches(plan) {
            Ok(report) => {
                self.restore_branch(original.as_deref());
                info!(self.logger, "restack complete"; "restacked" => report.restacked_count());
                Ok(report)
            }
            Err(e) if e.is_interrupted() => Err(e),
            Err(e) => {
                self.restore_branch(original.as_deref());
                Err(e)
            }
        }
    }

    fn restore_branch(&self, original: Option<&str>) {
        if let Some(branch) = original {
            if self.worktree.current_branch().ok().as_deref() != Some(branch) {
                // Best effort; the original error (if any) matters more.
                let _ = self.worktree.checkout(branch);
            }
        }
    }

    fn restack_branches(&self, plan: &RestackPlan) -> Result<RestackReport> {
        let mut report = RestackReport::default();

        for (index, branch) in plan.branches.iter().enumerate() {
            self.cancel.check()?;

            let record = self.lookup(branch)?;
            let tip = self.worktree.peel_to_commit(&record.base.name)?;

            if record.base.hash == tip.as_str() {
                debug!(self.logger, "already restacked"; "branch" => branch.as_str());
                report.outcomes.push((branch.clone(), BranchOutcome::AlreadyStacked));
                continue;
            }

            if !(plan.skip_start && index == 0) {
                self.cancel.check()?;
                match self.worktree.rebase_onto(branch, tip.as_str(), &record.base.hash)? {
                    RebaseStatus::Completed => {}
                    RebaseStatus::Interrupted => {
                        let mut entry =
                            ContinuationEntry::new(plan.resume_command.clone()).with_branch(branch.clone());
                        if let Some(message) = &plan.message {
                            entry = entry.with_message(message.clone());
                        }
                        self.push_continuation(entry)?;

                        info!(
                            self.logger, "rebase interrupted, continuation recorded";
                            "branch" => branch.as_str()
                        );
                        return Err(Error::Interrupted { branch: branch.clone() });
                    }
                }
            }

            self.store.update_with(|reader| {
                let mut updated = reader.require_branch(branch)?;
                updated.base.hash = tip.as_str().to_string();

                let mut request = UpdateRequest::new(format!("branch restack {}", branch));
                request.put_branch(branch, &updated)?;
                Ok(Some(request))
            })?;

            debug!(self.logger, "restacked"; "branch" => branch.as_str(), "onto" => tip.short());
            report.outcomes.push((
                branch.clone(),
                BranchOutcome::Restacked {
                    base: record.base.name.clone(),
                    base_hash: tip.as_str().to_string(),
                },
            ));
        }

        Ok(report)
    }
}
