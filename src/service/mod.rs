//! Stack graph operations.
//!
//! [`StackService`] is the primary interface consumed by the embedding
//! tool. Every mutation is one transaction against the state store;
//! every read runs against one pinned snapshot. The service owns its
//! collaborators and never holds worktree state across calls.

mod traversal;


pub use traversal::RestackStatus;

use serde_json::Value;
use slog::{debug, info, Logger};

use crate::cancel::CancelToken;
use crate::errors::{Error, Result};
use crate::state::{BranchBase, BranchRecord, ChangeAssociation, RepoInfo};
use crate::storage::{Author, BackingRefStore, Clock, Oid, StateStore, SystemClock, UpdateRequest};
use crate::worktree::Worktree;

/// Everything the service needs from the outside world.
pub struct Collaborators {
    pub backing: Box<dyn BackingRefStore>,
    pub worktree: Box<dyn Worktree>,
    pub clock: Box<dyn Clock>,
    pub author: Author,
    pub logger: Logger,
    pub cancel: CancelToken,
}

impl Collaborators {
    /// Collaborators with a wall clock, a fallback author, a discarded
    /// logger, and a fresh cancel token.
    pub fn new(backing: Box<dyn BackingRefStore>, worktree: Box<dyn Worktree>) -> Self {
        Self {
            backing,
            worktree,
            clock: Box::new(SystemClock),
            author: Author::new("strata", "strata@local"),
            logger: crate::log::null_logger(),
            cancel: CancelToken::new(),
        }
    }
}

/// The stack-state service.
pub struct StackService {
    pub(crate) store: StateStore,
    pub(crate) worktree: Box<dyn Worktree>,
    pub(crate) logger: Logger,
    pub(crate) cancel: CancelToken,
}

impl StackService {
    pub fn new(collaborators: Collaborators) -> Self {
        let Collaborators {
            backing,
            worktree,
            clock,
            author,
            logger,
            cancel,
        } = collaborators;
        Self {
            store: StateStore::new(backing, clock, author),
            worktree,
            logger,
            cancel,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn worktree(&self) -> &dyn Worktree {
        self.worktree.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether repository metadata exists.
    pub fn initialized(&self) -> Result<bool> {
        Ok(self.store.reader()?.repo_info()?.is_some())
    }

    /// Record repository metadata. Idempotent for the same trunk;
    /// refuses to silently move the trunk of an initialized repository
    /// (use [`reinit`](Self::reinit) for that).
    pub fn init(&self, trunk: &str, remote: Option<&str>) -> Result<()> {
        if trunk.is_empty() {
            return Err(Error::InvalidArgument("trunk name is empty".into()));
        }

        self.store.update_with(|reader| {
            let mut info = match reader.repo_info()? {
                Some(existing) => {
                    if existing.trunk != trunk {
                        return Err(Error::AlreadyExists(format!(
                            "repository is already initialized with trunk '{}'",
                            existing.trunk
                        )));
                    }
                    existing
                }
                None => RepoInfo::new(trunk, None),
            };
            info.remote = remote.map(|r| r.to_string());

            let mut request = UpdateRequest::new("initialize repository");
            request.put_repo(&info)?;
            Ok(Some(request))
        })?;

        info!(self.logger, "initialized repository"; "trunk" => trunk, "remote" => remote.unwrap_or(""));
        Ok(())
    }

    /// Rewrite repository metadata, keeping unknown fields. Branch
    /// records are left alone; callers moving the trunk are expected to
    /// re-verify their stacks afterwards.
    pub fn reinit(&self, trunk: &str, remote: Option<&str>) -> Result<()> {
        if trunk.is_empty() {
            return Err(Error::InvalidArgument("trunk name is empty".into()));
        }

        self.store.update_with(|reader| {
            let mut info = reader.repo_info()?.unwrap_or_else(|| RepoInfo::new(trunk, None));
            info.trunk = trunk.to_string();
            info.remote = remote.map(|r| r.to_string());

            let mut request = UpdateRequest::new("reinitialize repository");
            request.put_repo(&info)?;
            Ok(Some(request))
        })?;

        info!(self.logger, "reinitialized repository"; "trunk" => trunk);
        Ok(())
    }

    /// Change (or clear) the configured remote.
    pub fn set_remote(&self, remote: Option<&str>) -> Result<()> {
        self.store.update_with(|reader| {
            let mut info = reader.require_repo()?;
            info.remote = remote.map(|r| r.to_string());

            let mut request = UpdateRequest::new("set remote");
            request.put_repo(&info)?;
            Ok(Some(request))
        })?;
        Ok(())
    }

    /// The configured trunk branch name.
    pub fn trunk(&self) -> Result<String> {
        Ok(self.store.reader()?.require_repo()?.trunk)
    }

    /// The configured remote, if any.
    pub fn remote(&self) -> Result<Option<String>> {
        Ok(self.store.reader()?.require_repo()?.remote)
    }

    /// Record a new tracked branch based on `base` at `base_hash`.
    pub fn track(&self, name: &str, base: &str, base_hash: &Oid) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("branch name is empty".into()));
        }
        if name == base {
            return Err(Error::InvalidArgument(format!(
                "branch '{}' cannot be its own base",
                name
            )));
        }

        self.store.update_with(|reader| {
            let repo = reader.require_repo()?;
            if name == repo.trunk {
                return Err(Error::InvalidArgument(format!(
                    "trunk '{}' cannot be tracked as a stack branch",
                    repo.trunk
                )));
            }
            if reader.branch(name)?.is_some() {
                return Err(Error::AlreadyExists(format!("branch '{}' is already tracked", name)));
            }
            if base != repo.trunk && reader.branch(base)?.is_none() {
                return Err(Error::InvalidArgument(format!(
                    "base '{}' is neither the trunk nor a tracked branch",
                    base
                )));
            }

            let record = BranchRecord::new(base, base_hash.as_str());
            let mut request = UpdateRequest::new(format!("track branch {}", name));
            request.put_branch(name, &record)?;
            Ok(Some(request))
        })?;

        debug!(self.logger, "tracked branch"; "branch" => name, "base" => base);
        Ok(())
    }

    /// Stop tracking a branch. Branches based on it are reparented to
    /// its base in the same transaction, inheriting the forgotten
    /// record's base hash so their commit ranges stay correct for later
    /// restacks.
    pub fn forget(&self, name: &str) -> Result<()> {
        self.store.update_with(|reader| {
            let record = reader.require_branch(name)?;

            let mut request = UpdateRequest::new(format!("forget branch {}", name));
            request.delete_branch(name);

            for child in traversal::children_of(reader, name)? {
                let mut child_record = reader.require_branch(&child)?;
                child_record.base = BranchBase {
                    name: record.base.name.clone(),
                    hash: record.base.hash.clone(),
                };
                request.put_branch(&child, &child_record)?;
            }
            Ok(Some(request))
        })?;

        debug!(self.logger, "forgot branch"; "branch" => name);
        Ok(())
    }

    /// Alias for [`forget`](Self::forget), matching the verb most stack
    /// tools expose.
    pub fn untrack(&self, name: &str) -> Result<()> {
        self.forget(name)
    }

    /// Rename a tracked branch, rewriting every child's base in the same
    /// transaction. The underlying branch rename happens first; if the
    /// worktree refuses, the state is left untouched.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        if new.is_empty() {
            return Err(Error::InvalidArgument("branch name is empty".into()));
        }

        {
            let reader = self.store.reader()?;
            let repo = reader.require_repo()?;
            reader.require_branch(old)?;
            if new == repo.trunk {
                return Err(Error::InvalidArgument(format!(
                    "cannot rename onto the trunk '{}'",
                    repo.trunk
                )));
            }
            if reader.branch(new)?.is_some() {
                return Err(Error::AlreadyExists(format!("branch '{}' is already tracked", new)));
            }
        }

        self.cancel.check()?;
        self.worktree.rename_branch(old, new)?;

        self.store.update_with(|reader| {
            let record = reader.require_branch(old)?;

            let mut request = UpdateRequest::new(format!("rename branch {} to {}", old, new));
            request.delete_branch(old);
            request.put_branch(new, &record)?;

            for child in traversal::children_of(reader, old)? {
                let mut child_record = reader.require_branch(&child)?;
                child_record.base.name = new.to_string();
                request.put_branch(&child, &child_record)?;
            }
            Ok(Some(request))
        })?;

        debug!(self.logger, "renamed branch"; "old" => old, "new" => new);
        Ok(())
    }

    /// The record for a tracked branch.
    pub fn lookup(&self, name: &str) -> Result<BranchRecord> {
        self.store.reader()?.require_branch(name)
    }

    /// Names of all tracked branches, sorted.
    pub fn list_tracked(&self) -> Result<Vec<String>> {
        Ok(self.store.reader()?.branches()?.into_iter().map(|(n, _)| n).collect())
    }

    /// Record (or clear) the upstream remote branch for `name`.
    pub fn set_upstream(&self, name: &str, upstream: Option<&str>) -> Result<()> {
        self.store.update_with(|reader| {
            let mut record = reader.require_branch(name)?;
            record.upstream = upstream.map(|u| u.to_string());

            let mut request = UpdateRequest::new(format!("set upstream of {}", name));
            request.put_branch(name, &record)?;
            Ok(Some(request))
        })?;
        Ok(())
    }

    /// Associate `name` with a forge change request.
    pub fn set_change(&self, name: &str, forge: &str, id: Value) -> Result<()> {
        self.store.update_with(|reader| {
            let mut record = reader.require_branch(name)?;
            record.change = Some(ChangeAssociation {
                forge: forge.to_string(),
                id: id.clone(),
            });

            let mut request = UpdateRequest::new(format!("record change for {}", name));
            request.put_branch(name, &record)?;
            Ok(Some(request))
        })?;

        debug!(self.logger, "recorded change association"; "branch" => name, "forge" => forge);
        Ok(())
    }

    /// Propagate a merged branch's history to its direct children: each
    /// child's merged-downstack becomes the merged branch's own history
    /// followed by `change_ids`. One transaction per merge; grandchildren
    /// are untouched until their own parent merges.
    pub fn append_merged_downstack(&self, name: &str, change_ids: &[Value]) -> Result<()> {
        self.store.update_with(|reader| {
            let record = reader.require_branch(name)?;

            let mut history: Vec<Value> = record.merged_downstack().to_vec();
            history.extend(change_ids.iter().cloned());

            let mut request = UpdateRequest::new(format!("propagate merged changes from {}", name));
            for child in traversal::children_of(reader, name)? {
                let mut child_record = reader.require_branch(&child)?;
                child_record.merged_downstack = Some(history.clone());
                request.put_branch(&child, &child_record)?;
            }
            Ok(Some(request))
        })?;

        debug!(self.logger, "propagated merged history"; "branch" => name);
        Ok(())
    }

    /// The opaque per-forge blob, if recorded.
    pub fn forge_blob(&self, forge_id: &str) -> Result<Option<Value>> {
        self.store.reader()?.forge_blob(forge_id)
    }

    /// Record the opaque per-forge blob.
    pub fn set_forge_blob(&self, forge_id: &str, blob: Value) -> Result<()> {
        self.store.update_with(|_| {
            let mut request = UpdateRequest::new(format!("record forge state for {}", forge_id));
            request.put_forge_blob(forge_id, blob.clone());
            Ok(Some(request))
        })?;
        Ok(())
    }
}
