//! The backing-ref-store collaborator.
//!
//! A backend stores immutable, content-addressed objects (blobs, trees,
//! and parented snapshots) and one mutable reference pointing at the
//! current snapshot. The reference only moves through a compare-and-swap;
//! a missed swap is a [`Conflict`](crate::Error::Conflict) the transactor
//! retries.

use chrono::{DateTime, Utc};

use super::{Author, Oid};
use crate::errors::Result;

/// One pending mutation of the state tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Put(Vec<u8>),
    Delete,
}

/// Decoded snapshot header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Previous snapshot, absent for the first one.
    pub parent: Option<Oid>,
    /// Root of the state tree this snapshot describes.
    pub tree: Oid,
    pub message: String,
    pub author: Author,
    pub timestamp: DateTime<Utc>,
}

/// Storage collaborator consumed by the transactor.
///
/// Implementations must make `write_snapshot` durable before `publish`
/// moves the reference: once `publish` succeeds, every object reachable
/// from the new snapshot is readable by any other process.
pub trait BackingRefStore: Send {
    /// Current tip of the state reference, if any snapshot was ever
    /// published.
    fn head(&self) -> Result<Option<Oid>>;

    /// Decode a snapshot header. Unknown ids are an integrity error.
    fn read_snapshot(&self, id: &Oid) -> Result<SnapshotMeta>;

    /// Read a blob's bytes.
    fn read_blob(&self, id: &Oid) -> Result<Vec<u8>>;

    /// Look up the blob at a slash-separated path inside a tree.
    fn tree_entry(&self, tree: &Oid, key: &str) -> Result<Option<Oid>>;

    /// List every `(key, blob)` pair under a slash-separated prefix.
    /// An empty prefix lists the whole tree. Keys are returned sorted.
    fn tree_entries(&self, tree: &Oid, prefix: &str) -> Result<Vec<(String, Oid)>>;

    /// Build a new snapshot: the parent's tree (or an empty tree) with
    /// the change set applied, plus header metadata. The snapshot is
    /// written but not yet published.
    fn write_snapshot(
        &self,
        parent: Option<&Oid>,
        changes: &[(String, Change)],
        message: &str,
        author: &Author,
        timestamp: DateTime<Utc>,
    ) -> Result<Oid>;

    /// Compare-and-swap the state reference from `expected` to `new`.
    /// `expected == None` asserts the reference does not exist yet.
    /// A mismatch fails with [`Conflict`](crate::Error::Conflict) and
    /// leaves the reference unchanged.
    fn publish(&self, expected: Option<&Oid>, new: &Oid) -> Result<()>;
}
