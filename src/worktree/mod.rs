//! The worktree collaborator: everything the core asks of the underlying
//! version control checkout.
//!
//! The core never shells out or touches the working copy on its own; it
//! describes *what* to do (rebase B onto H, transplanting from the old
//! base) and the worktree decides *how*. [`GitWorktree`] is the
//! production implementation; [`mock::MockWorktree`] scripts outcomes
//! for tests.

pub mod mock;

use anyhow::{Context, Result as AnyResult};
use git2::{BranchType, Repository};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::errors::{Error, Result};
use crate::storage::Oid;

/// How a rebase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseStatus {
    /// All commits replayed; the branch points at the new tip.
    Completed,
    /// The rebase stopped cleanly (conflict, edit, or break) and the
    /// repository is in rebase state awaiting the user.
    Interrupted,
}

impl RebaseStatus {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RebaseStatus::Interrupted)
    }
}

/// Version-control operations consumed by the core.
pub trait Worktree: Send {
    /// Name of the currently checked-out branch. Fails on detached HEAD.
    fn current_branch(&self) -> Result<String>;

    fn checkout(&self, name: &str) -> Result<()>;

    /// Resolve a revision (branch name or hash) to a commit id.
    fn peel_to_commit(&self, rev: &str) -> Result<Oid>;

    /// Replay the commits of `branch` that are not reachable from
    /// `old_base` onto `new_base`.
    fn rebase_onto(&self, branch: &str, new_base: &str, old_base: &str) -> Result<RebaseStatus>;

    fn create_branch(&self, name: &str, at: &str) -> Result<()>;

    fn rename_branch(&self, old: &str, new: &str) -> Result<()>;

    fn delete_branch(&self, name: &str) -> Result<()>;

    fn list_remotes(&self) -> Result<Vec<String>>;

    /// URL of a remote, or `None` when the remote does not exist.
    fn remote_url(&self, remote: &str) -> Result<Option<String>>;

    /// Push `branch` to `remote`. Restacked branches rewrite history, so
    /// the default is a leased force push; `force` escalates to an
    /// unconditional one.
    fn push(&self, remote: &str, branch: &str, force: bool) -> Result<()>;

    fn detach_head(&self) -> Result<()>;

    /// True while the underlying tool is mid-rebase.
    fn rebase_in_progress(&self) -> Result<bool>;

    /// Abandon an in-progress rebase.
    fn rebase_abort(&self) -> Result<()>;

    /// Continue an in-progress rebase after the user resolved conflicts.
    fn rebase_continue(&self) -> Result<RebaseStatus>;
}

/// Git-backed worktree.
///
/// Branch and reference inspection goes through git2; rebases run the
/// `git` CLI, because libgit2 cannot leave the repository in the
/// standard resumable rebase state that conflict resolution needs.
pub struct GitWorktree {
    repo: Repository,
    git_dir: PathBuf,
    workdir: PathBuf,
}

impl GitWorktree {
    /// Open the repository containing `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path).context("Failed to open git repository")?;
        let git_dir = repo.path().to_path_buf();
        let workdir = repo
            .workdir()
            .context("Repository has no working tree")?
            .to_path_buf();
        Ok(Self { repo, git_dir, workdir })
    }

    fn git(&self, args: &[&str]) -> AnyResult<std::process::Output> {
        Command::new("git")
            .args(args)
            .env("GIT_EDITOR", "true")
            .stdin(Stdio::null())
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    fn find_local_branch(&self, name: &str) -> AnyResult<git2::Branch<'_>> {
        self.repo
            .find_branch(name, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", name))
    }
}

impl Worktree for GitWorktree {
    fn current_branch(&self) -> Result<String> {
        let head = self.repo.head().context("Failed to read HEAD")?;
        if !head.is_branch() {
            return Err(Error::external(anyhow::anyhow!("HEAD is detached")));
        }
        Ok(head
            .shorthand()
            .context("Branch name is not valid UTF-8")?
            .to_string())
    }

    fn checkout(&self, name: &str) -> Result<()> {
        let refname = format!("refs/heads/{}", name);
        let reference = self
            .repo
            .find_reference(&refname)
            .with_context(|| format!("Branch '{}' not found", name))?;
        let commit = reference.peel_to_commit().context("Failed to peel branch to commit")?;
        let tree = commit.tree().context("Failed to read commit tree")?;

        // Safe checkout: never clobber uncommitted changes.
        let mut builder = git2::build::CheckoutBuilder::new();
        builder.safe().recreate_missing(true);
        self.repo
            .checkout_tree(tree.as_object(), Some(&mut builder))
            .with_context(|| format!("Failed to check out '{}'", name))?;
        self.repo
            .set_head(&refname)
            .with_context(|| format!("Failed to set HEAD to '{}'", name))?;
        Ok(())
    }

    fn peel_to_commit(&self, rev: &str) -> Result<Oid> {
        if let Ok(branch) = self.repo.find_branch(rev, BranchType::Local) {
            let commit = branch.get().peel_to_commit().context("Failed to peel branch")?;
            return Ok(Oid::from(commit.id()));
        }
        let obj = self
            .repo
            .revparse_single(rev)
            .with_context(|| format!("Failed to resolve '{}'", rev))?;
        let commit = obj.peel_to_commit().context("Failed to peel to commit")?;
        Ok(Oid::from(commit.id()))
    }

    fn rebase_onto(&self, branch: &str, new_base: &str, old_base: &str) -> Result<RebaseStatus> {
        let output = self.git(&["rebase", "--onto", new_base, old_base, branch])?;
        if output.status.success() {
            return Ok(RebaseStatus::Completed);
        }
        if self.rebase_in_progress()? {
            return Ok(RebaseStatus::Interrupted);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::external(anyhow::anyhow!(
            "git rebase --onto failed: {}",
            stderr.trim()
        )))
    }

    fn create_branch(&self, name: &str, at: &str) -> Result<()> {
        let target = self.peel_to_commit(at)?;
        let commit = self
            .repo
            .find_commit(target.to_git2()?)
            .context("Failed to find target commit")?;
        self.repo
            .branch(name, &commit, false)
            .with_context(|| format!("Failed to create branch '{}' at '{}'", name, at))?;
        Ok(())
    }

    fn rename_branch(&self, old: &str, new: &str) -> Result<()> {
        let mut branch = self.find_local_branch(old)?;
        branch
            .rename(new, false)
            .with_context(|| format!("Failed to rename '{}' to '{}'", old, new))?;
        Ok(())
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        let mut branch = self.find_local_branch(name)?;
        branch
            .delete()
            .with_context(|| format!("Failed to delete branch '{}'", name))?;
        Ok(())
    }

    fn list_remotes(&self) -> Result<Vec<String>> {
        let remotes = self.repo.remotes().context("Failed to list remotes")?;
        Ok(remotes.iter().flatten().map(|s| s.to_string()).collect())
    }

    fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        match self.repo.find_remote(remote) {
            Ok(r) => Ok(r.url().map(|s| s.to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(Error::external(anyhow::Error::new(e).context("Failed to look up remote"))),
        }
    }

    fn push(&self, remote: &str, branch: &str, force: bool) -> Result<()> {
        let force_arg = if force { "--force" } else { "--force-with-lease" };

        let output = self.git(&["push", "--quiet", remote, branch, force_arg])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::external(anyhow::anyhow!("git push failed: {}", stderr.trim())));
        }
        Ok(())
    }

    fn detach_head(&self) -> Result<()> {
        let head = self.repo.head().context("Failed to read HEAD")?;
        let commit = head.peel_to_commit().context("Failed to peel HEAD")?;
        self.repo
            .set_head_detached(commit.id())
            .context("Failed to detach HEAD")?;
        Ok(())
    }

    fn rebase_in_progress(&self) -> Result<bool> {
        // Git keeps resumable rebase state in one of these directories.
        let rebase_merge = self.git_dir.join("rebase-merge");
        let rebase_apply = self.git_dir.join("rebase-apply");
        Ok(rebase_merge.exists() || rebase_apply.exists())
    }

    fn rebase_abort(&self) -> Result<()> {
        let output = self.git(&["rebase", "--abort"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::external(anyhow::anyhow!(
                "git rebase --abort failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn rebase_continue(&self) -> Result<RebaseStatus> {
        let output = self.git(&["rebase", "--continue"])?;
        if output.status.success() {
            return Ok(RebaseStatus::Completed);
        }
        if self.rebase_in_progress()? {
            return Ok(RebaseStatus::Interrupted);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::external(anyhow::anyhow!(
            "git rebase --continue failed: {}",
            stderr.trim()
        )))
    }
}
