//! In-memory backing store for tests.
//!
//! Content-addressed like the git backend (ids are truncated SHA-256 of
//! the object payload) so snapshot chains and CAS behave identically.
//! Clones share the same state, which lets a test race two handles the
//! way two processes would race on the real reference.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::backend::{BackingRefStore, Change, SnapshotMeta};
use super::{Author, Oid};
use crate::errors::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TreeNode {
    Blob(Oid),
    Tree(Oid),
}

type TreeObject = BTreeMap<String, TreeNode>;

#[derive(Default)]
struct Inner {
    blobs: HashMap<Oid, Vec<u8>>,
    trees: HashMap<Oid, TreeObject>,
    snapshots: HashMap<Oid, SnapshotMeta>,
    head: Option<Oid>,
}

/// Shared-state in-memory [`BackingRefStore`].
#[derive(Clone, Default)]
pub struct MemoryBackingStore {
    inner: Arc<Mutex<Inner>>,
}

fn hash_object(kind: &str, payload: &[u8]) -> Oid {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0]);
    hasher.update(payload);
    let digest = hasher.finalize();
    let hex: String = digest[..20].iter().map(|b| format!("{:02x}", b)).collect();
    Oid::from_hex_unchecked(&hex)
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_blob(inner: &mut Inner, bytes: &[u8]) -> Oid {
        let id = hash_object("blob", bytes);
        inner.blobs.insert(id.clone(), bytes.to_vec());
        id
    }

    fn write_tree(inner: &mut Inner, tree: TreeObject) -> Oid {
        let mut payload = Vec::new();
        for (name, node) in &tree {
            let (tag, id) = match node {
                TreeNode::Blob(id) => ("b", id),
                TreeNode::Tree(id) => ("t", id),
            };
            payload.extend_from_slice(tag.as_bytes());
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(id.as_str().as_bytes());
            payload.push(0);
        }
        let id = hash_object("tree", &payload);
        inner.trees.insert(id.clone(), tree);
        id
    }

    /// Apply one level of changes on a tree, recursing into subtrees.
    /// Returns `None` for an empty result so empty subtrees are pruned.
    fn apply_level(inner: &mut Inner, base: Option<&Oid>, changes: &[(&str, &Change)]) -> Result<Option<Oid>> {
        let mut tree: TreeObject = match base {
            Some(id) => inner
                .trees
                .get(id)
                .cloned()
                .ok_or_else(|| Error::Integrity(format!("state tree {} is missing", id.short())))?,
            None => TreeObject::new(),
        };

        let mut nested: BTreeMap<&str, Vec<(&str, &Change)>> = BTreeMap::new();
        for &(key, change) in changes {
            match key.split_once('/') {
                Some((head, rest)) => nested.entry(head).or_default().push((rest, change)),
                None => match change {
                    Change::Put(bytes) => {
                        let blob = Self::write_blob(inner, bytes);
                        tree.insert(key.to_string(), TreeNode::Blob(blob));
                    }
                    Change::Delete => {
                        tree.remove(key);
                    }
                },
            }
        }

        for (segment, sub_changes) in nested {
            let sub_base = match tree.get(segment) {
                Some(TreeNode::Tree(id)) => Some(id.clone()),
                _ => None,
            };
            match Self::apply_level(inner, sub_base.as_ref(), &sub_changes)? {
                Some(id) => {
                    tree.insert(segment.to_string(), TreeNode::Tree(id));
                }
                None => {
                    tree.remove(segment);
                }
            }
        }

        if tree.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::write_tree(inner, tree)))
    }

    fn lookup_path(inner: &Inner, tree: &Oid, key: &str) -> Result<Option<TreeNode>> {
        let mut current = TreeNode::Tree(tree.clone());
        for segment in key.split('/') {
            let id = match &current {
                TreeNode::Tree(id) => id.clone(),
                TreeNode::Blob(_) => return Ok(None),
            };
            let tree = inner
                .trees
                .get(&id)
                .ok_or_else(|| Error::Integrity(format!("state tree {} is missing", id.short())))?;
            match tree.get(segment) {
                Some(node) => current = node.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn collect_blobs(inner: &Inner, tree: &Oid, prefix: &str, out: &mut Vec<(String, Oid)>) -> Result<()> {
        let entries = inner
            .trees
            .get(tree)
            .ok_or_else(|| Error::Integrity(format!("state tree {} is missing", tree.short())))?;
        for (name, node) in entries {
            let key = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            match node {
                TreeNode::Blob(id) => out.push((key, id.clone())),
                TreeNode::Tree(id) => Self::collect_blobs(inner, &id.clone(), &key, out)?,
            }
        }
        Ok(())
    }
}

impl BackingRefStore for MemoryBackingStore {
    fn head(&self) -> Result<Option<Oid>> {
        Ok(self.inner.lock().unwrap().head.clone())
    }

    fn read_snapshot(&self, id: &Oid) -> Result<SnapshotMeta> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Integrity(format!("snapshot {} is missing", id.short())))
    }

    fn read_blob(&self, id: &Oid) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Integrity(format!("state blob {} is missing", id.short())))
    }

    fn tree_entry(&self, tree: &Oid, key: &str) -> Result<Option<Oid>> {
        let inner = self.inner.lock().unwrap();
        match Self::lookup_path(&inner, tree, key)? {
            Some(TreeNode::Blob(id)) => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    fn tree_entries(&self, tree: &Oid, prefix: &str) -> Result<Vec<(String, Oid)>> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        if prefix.is_empty() {
            Self::collect_blobs(&inner, tree, "", &mut out)?;
        } else if let Some(TreeNode::Tree(id)) = Self::lookup_path(&inner, tree, prefix)? {
            Self::collect_blobs(&inner, &id, prefix, &mut out)?;
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
        let mut inner = self.inner.lock().unwrap();

        let base_tree = match parent {
            Some(id) => {
                let meta = inner
                    .snapshots
                    .get(id)
                    .ok_or_else(|| Error::Integrity(format!("parent snapshot {} is missing", id.short())))?;
                Some(meta.tree.clone())
            }
            None => None,
        };

        let borrowed: Vec<(&str, &Change)> = changes.iter().map(|(k, c)| (k.as_str(), c)).collect();
        let tree = match Self::apply_level(&mut inner, base_tree.as_ref(), &borrowed)? {
            Some(id) => id,
            None => Self::write_tree(&mut inner, TreeObject::new()),
        };

        let meta = SnapshotMeta {
            parent: parent.cloned(),
            tree,
            message: message.to_string(),
            author: author.clone(),
            timestamp,
        };

        let mut payload = Vec::new();
        if let Some(p) = &meta.parent {
            payload.extend_from_slice(p.as_str().as_bytes());
        }
        payload.extend_from_slice(meta.tree.as_str().as_bytes());
        payload.extend_from_slice(meta.message.as_bytes());
        payload.extend_from_slice(meta.author.email.as_bytes());
        payload.extend_from_slice(meta.timestamp.to_rfc3339().as_bytes());
        let id = hash_object("snapshot", &payload);

        inner.snapshots.insert(id.clone(), meta);
        Ok(id)
    }

    fn publish(&self, expected: Option<&Oid>, new: &Oid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.head.as_ref() != expected {
            return Err(Error::Conflict("state reference moved underneath this update".into()));
        }
        if !inner.snapshots.contains_key(new) {
            return Err(Error::Integrity(format!("snapshot {} was never written", new.short())));
        }
        inner.head = Some(new.clone());
        Ok(())
    }
}
