//! Durable, versioned state storage.
//!
//! The state of the branch graph lives inside the repository itself, as a
//! chain of snapshot objects under a dedicated reference. This module is
//! layered:
//!
//! - [`backend`]: the `BackingRefStore` collaborator, content-addressed
//!   blobs and trees, parented snapshots, and a compare-and-swap publish
//!   of the state reference.
//! - [`git`]: the production backend, storing snapshots as commits under
//!   `refs/strata/state` via git2.
//! - [`memory`]: a content-addressed in-memory backend for tests.
//! - [`store`]: the typed transactor, grouped upserts/deletes committed
//!   atomically, with bounded CAS retry.

pub mod backend;
pub mod git;
pub mod memory;
pub mod store;

pub use backend::{BackingRefStore, Change, SnapshotMeta};
pub use store::{StateStore, StoreReader, UpdateRequest};

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::errors::{Error, Result};

/// Object ID: a 40-character lowercase hex string.
///
/// Snapshot, tree, and blob ids share this representation regardless of
/// backend; the git backend maps it onto `git2::Oid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(String);

impl Oid {
    /// Parse and validate a hex object id.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 40 {
            return Err(Error::InvalidArgument(format!(
                "object id has length {}, expected 40",
                s.len()
            )));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidArgument("object id contains non-hex characters".into()));
        }
        Ok(Self(s.to_lowercase()))
    }

    /// Wrap a string known to be a valid id (e.g. straight from git).
    pub(crate) fn from_hex_unchecked(s: &str) -> Self {
        Self(s.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 7 chars), for messages.
    pub fn short(&self) -> &str {
        &self.0[..7.min(self.0.len())]
    }

    pub fn to_git2(&self) -> Result<git2::Oid> {
        Ok(git2::Oid::from_str(&self.0).context("Failed to parse object id")?)
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<git2::Oid> for Oid {
    fn from(oid: git2::Oid) -> Self {
        Self(oid.to_string())
    }
}

/// Identity recorded on every snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Time source for snapshot timestamps. Injected so tests are
/// deterministic.
pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to one instant, for tests.
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
