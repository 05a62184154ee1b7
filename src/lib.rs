//! Stack-state engine for stacked-branch workflows.
//!
//! Strata tracks a forest of short-lived branches rooted at a long-lived
//! trunk, keeps that graph in a durable, versioned store inside the
//! repository itself, replays descendants when an ancestor moves, and
//! persists how to resume when a rebase is interrupted.
//!
//! The crate is the *core* of such a tool: it speaks no network
//! protocol, renders no UI, and parses no command line. The embedding
//! tool supplies the collaborators, a [`Worktree`](worktree::Worktree)
//! for version-control mutations and a
//! [`BackingRefStore`](storage::BackingRefStore) for the state
//! reference, and drives the [`StackService`](service::StackService).
//!
//! # Layers
//!
//! - [`storage`]: snapshot chain under `refs/strata/state`, and the
//!   transactor with its compare-and-swap retry protocol.
//! - [`state`]: the on-disk schema, repository info, branch records,
//!   the continuation queue, opaque per-forge blobs.
//! - [`service`]: track / forget / rename / traversals /
//!   verify-restacked / merged-downstack propagation.
//! - [`restack`]: replay of out-of-date branches in dependency order.
//! - [`continuation`]: the persistent resume queue for interrupted
//!   operations.
//! - [`worktree`]: the version-control collaborator, with a git
//!   implementation and a scripted mock.
//!
//! # Example
//!
//! ```no_run
//! use strata::service::{Collaborators, StackService};
//! use strata::storage::git::GitBackingStore;
//! use strata::worktree::{GitWorktree, Worktree};
//!
//! # fn main() -> strata::Result<()> {
//! let path = std::path::Path::new(".");
//! let worktree = GitWorktree::open(path)?;
//! let backing = GitBackingStore::open(path)?;
//!
//! let service = StackService::new(Collaborators::new(
//!     Box::new(backing),
//!     Box::new(worktree),
//! ));
//!
//! service.init("main", Some("origin"))?;
//! let tip = service.worktree().peel_to_commit("main")?;
//! service.track("feature", "main", &tip)?;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod continuation;
pub mod errors;
pub mod escape;
pub mod log;
pub mod restack;
pub mod service;
pub mod state;
pub mod storage;
pub mod worktree;

pub use cancel::CancelToken;
pub use continuation::QueueState;
pub use errors::{Error, Result};
pub use restack::{BranchOutcome, RestackPlan, RestackReport};
pub use service::{Collaborators, RestackStatus, StackService};
pub use state::{BranchRecord, ContinuationEntry, RepoInfo};
pub use storage::{Author, Oid};
