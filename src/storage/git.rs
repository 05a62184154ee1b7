//! Git-backed state storage.
//!
//! Snapshots are ordinary commits chained under [`STATE_REF`]; the state
//! tree is the commit tree, one blob per logical key. Storing state this
//! way keeps it inside the repository's object database (surviving
//! clones and usable from any worktree) and gives atomic publish for
//! free: git reference updates are compare-and-swap at the ref level.
//!
//! Objects are written to the object database before the reference moves,
//! so a crash between the two leaves only unreachable objects behind.

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, TimeZone, Utc};
use git2::Repository;
use std::collections::BTreeMap;
use std::path::Path;

use super::backend::{BackingRefStore, Change, SnapshotMeta};
use super::{Author, Oid};
use crate::errors::{Error, Result};

/// The mutable reference holding the snapshot chain.
pub const STATE_REF: &str = "refs/strata/state";

const BLOB_MODE: i32 = 0o100644;
const TREE_MODE: i32 = 0o040000;

/// [`BackingRefStore`] over a git repository.
pub struct GitBackingStore {
    repo: Repository,
}

impl GitBackingStore {
    /// Open the repository containing `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Wrap an already-open repository handle.
    pub fn from_repository(repo: Repository) -> Self {
        Self { repo }
    }

    fn signature<'a>(author: &Author, timestamp: DateTime<Utc>) -> AnyResult<git2::Signature<'a>> {
        let time = git2::Time::new(timestamp.timestamp(), 0);
        git2::Signature::new(&author.name, &author.email, &time).context("Failed to build signature")
    }

    fn find_tree(&self, id: &Oid) -> AnyResult<git2::Tree<'_>> {
        self.repo
            .find_tree(id.to_git2()?)
            .with_context(|| format!("State tree {} is missing", id.short()))
    }

    /// Walk `key` segment by segment down from `tree`.
    fn lookup_path(&self, tree: &git2::Tree<'_>, key: &str) -> AnyResult<Option<(git2::Oid, Option<git2::ObjectType>)>> {
        let mut current = tree.id();
        let mut kind = Some(git2::ObjectType::Tree);

        for segment in key.split('/') {
            if kind != Some(git2::ObjectType::Tree) {
                return Ok(None);
            }
            let subtree = self.repo.find_tree(current)?;
            match subtree.get_name(segment) {
                Some(entry) => {
                    kind = entry.kind();
                    current = entry.id();
                }
                None => return Ok(None),
            };
        }
        Ok(Some((current, kind)))
    }

    fn collect_blobs(&self, tree_id: git2::Oid, prefix: &str, out: &mut Vec<(String, Oid)>) -> AnyResult<()> {
        let tree = self.repo.find_tree(tree_id)?;
        for entry in tree.iter() {
            let name = entry
                .name()
                .context("State tree entry name is not valid UTF-8")?
                .to_string();
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            match entry.kind() {
                Some(git2::ObjectType::Blob) => out.push((key, Oid::from(entry.id()))),
                Some(git2::ObjectType::Tree) => self.collect_blobs(entry.id(), &key, out)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Apply one level of the change set on top of `base`, recursing into
    /// subtrees. Returns `None` when the resulting tree is empty so the
    /// caller can drop the entry entirely.
    fn apply_level(
        &self,
        base: Option<&git2::Tree<'_>>,
        changes: &[(&str, &Change)],
    ) -> AnyResult<Option<git2::Oid>> {
        let mut builder = self.repo.treebuilder(base).context("Failed to open tree builder")?;

        // Split into blob operations at this level and grouped nested ones.
        let mut nested: BTreeMap<&str, Vec<(&str, &Change)>> = BTreeMap::new();
        for &(key, change) in changes {
            match key.split_once('/') {
                Some((head, rest)) => nested.entry(head).or_default().push((rest, change)),
                None => match change {
                    Change::Put(bytes) => {
                        let blob = self.repo.blob(bytes).context("Failed to write state blob")?;
                        builder.insert(key, blob, BLOB_MODE)?;
                    }
                    Change::Delete => {
                        if builder.get(key)?.is_some() {
                            builder.remove(key)?;
                        }
                    }
                },
            }
        }

        for (segment, sub_changes) in nested {
            let sub_base = match base.and_then(|t| t.get_name(segment)) {
                Some(entry) if entry.kind() == Some(git2::ObjectType::Tree) => {
                    Some(self.repo.find_tree(entry.id())?)
                }
                _ => None,
            };
            match self.apply_level(sub_base.as_ref(), &sub_changes)? {
                Some(sub_id) => {
                    builder.insert(segment, sub_id, TREE_MODE)?;
                }
                None => {
                    if builder.get(segment)?.is_some() {
                        builder.remove(segment)?;
                    }
                }
            }
        }

        if builder.len() == 0 {
            return Ok(None);
        }
        Ok(Some(builder.write().context("Failed to write state tree")?))
    }
}

impl BackingRefStore for GitBackingStore {
    fn head(&self) -> Result<Option<Oid>> {
        match self.repo.find_reference(STATE_REF) {
            Ok(reference) => {
                let target = reference
                    .target()
                    .ok_or_else(|| Error::Integrity(format!("{} is not a direct reference", STATE_REF)))?;
                Ok(Some(Oid::from(target)))
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(Error::external(anyhow::Error::new(e).context("Failed to read state reference"))),
        }
    }

    fn read_snapshot(&self, id: &Oid) -> Result<SnapshotMeta> {
        let commit = self
            .repo
            .find_commit(id.to_git2()?)
            .map_err(|_| Error::Integrity(format!("snapshot {} is missing or not a commit", id.short())))?;

        let parent = match commit.parent_count() {
            0 => None,
            _ => Some(Oid::from(commit.parent_id(0).map_err(|e| Error::external(e))?)),
        };
        let author = commit.author();
        let timestamp = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .ok_or_else(|| Error::Integrity(format!("snapshot {} has an unreadable timestamp", id.short())))?;

        Ok(SnapshotMeta {
            parent,
            tree: Oid::from(commit.tree_id()),
            message: commit.message().unwrap_or("").to_string(),
            author: Author::new(author.name().unwrap_or(""), author.email().unwrap_or("")),
            timestamp,
        })
    }

    fn read_blob(&self, id: &Oid) -> Result<Vec<u8>> {
        let blob = self
            .repo
            .find_blob(id.to_git2()?)
            .map_err(|_| Error::Integrity(format!("state blob {} is missing", id.short())))?;
        Ok(blob.content().to_vec())
    }

    fn tree_entry(&self, tree: &Oid, key: &str) -> Result<Option<Oid>> {
        let tree = self.find_tree(tree)?;
        match self.lookup_path(&tree, key)? {
            Some((id, Some(git2::ObjectType::Blob))) => Ok(Some(Oid::from(id))),
            _ => Ok(None),
        }
    }

    fn tree_entries(&self, tree: &Oid, prefix: &str) -> Result<Vec<(String, Oid)>> {
        let root = self.find_tree(tree)?;
        let mut out = Vec::new();

        if prefix.is_empty() {
            self.collect_blobs(root.id(), "", &mut out)?;
        } else if let Some((id, Some(git2::ObjectType::Tree))) = self.lookup_path(&root, prefix)? {
            self.collect_blobs(id, prefix, &mut out)?;
        }

        out.sort();
        Ok(out)
    }

    fn write_snapshot(
        &self,
        parent: Option<&Oid>,
        changes: &[(String, Change)],
        message: &str,
        author: &Author,
        timestamp: DateTime<Utc>,
    ) -> Result<Oid> {
        let parent_commit = match parent {
            Some(id) => Some(
                self.repo
                    .find_commit(id.to_git2()?)
                    .map_err(|_| Error::Integrity(format!("parent snapshot {} is missing", id.short())))?,
            ),
            None => None,
        };
        let base_tree = match &parent_commit {
            Some(commit) => Some(commit.tree().map_err(Error::external)?),
            None => None,
        };

        let borrowed: Vec<(&str, &Change)> = changes.iter().map(|(k, c)| (k.as_str(), c)).collect();
        let tree_id = match self.apply_level(base_tree.as_ref(), &borrowed)? {
            Some(id) => id,
            // An empty state tree is legal (nothing tracked yet).
            None => self
                .repo
                .treebuilder(None)
                .and_then(|mut b| b.write())
                .context("Failed to write empty state tree")?,
        };
        let tree = self.repo.find_tree(tree_id).map_err(Error::external)?;

        let sig = Self::signature(author, timestamp)?;
        let parents: Vec<&git2::Commit<'_>> = parent_commit.iter().collect();
        let id = self
            .repo
            .commit(None, &sig, &sig, message, &tree, &parents)
            .context("Failed to write snapshot")?;

        Ok(Oid::from(id))
    }

    fn publish(&self, expected: Option<&Oid>, new: &Oid) -> Result<()> {
        let new_id = new.to_git2()?;
        let log = format!("strata: {}", new.short());

        let result = match expected {
            // First snapshot: creating must fail if someone else got there.
            None => self.repo.reference(STATE_REF, new_id, false, &log).map(|_| ()),
            Some(old) => self
                .repo
                .reference_matching(STATE_REF, new_id, true, old.to_git2()?, &log)
                .map(|_| ()),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == git2::ErrorCode::Modified || e.code() == git2::ErrorCode::Exists => {
                Err(Error::Conflict(format!("{} moved underneath this update", STATE_REF)))
            }
            Err(e) => Err(Error::external(
                anyhow::Error::new(e).context("Failed to update state reference"),
            )),
        }
    }
}
