//! Stack graph traversals.
//!
//! All orders are deterministic: siblings sort lexicographically, and a
//! branch is always visited after its base. The base relation is a
//! forest by construction; a cycle or a dangling base observed here is a
//! fatal integrity error, not a recoverable condition.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::{Error, Result};
use crate::service::StackService;
use crate::storage::StoreReader;
use crate::worktree::Worktree;

/// Walk limit; a deeper chain means corrupt metadata.
const MAX_STACK_DEPTH: usize = 1000;

/// Result of comparing a branch's recorded base against reality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestackStatus {
    /// The recorded base hash matches the base's current tip.
    UpToDate,
    /// The base has moved; the branch must be restacked.
    NeedsRestack {
        base: String,
        recorded: String,
        actual: String,
    },
}

impl RestackStatus {
    pub fn needs_restack(&self) -> bool {
        matches!(self, RestackStatus::NeedsRestack { .. })
    }
}

/// Direct children of `name`, sorted lexicographically.
pub(crate) fn children_of(reader: &StoreReader<'_>, name: &str) -> Result<Vec<String>> {
    let mut children = Vec::new();
    for (branch, record) in reader.branches()? {
        if record.base.name == name {
            children.push(branch);
        }
    }
    // branches() is name-sorted already; keep the guarantee explicit.
    children.sort();
    Ok(children)
}

impl StackService {
    /// Branches whose base is `name`. `name` must be the trunk or a
    /// tracked branch.
    pub fn list_above(&self, name: &str) -> Result<Vec<String>> {
        let reader = self.store.reader()?;
        let repo = reader.require_repo()?;
        if name != repo.trunk {
            reader.require_branch(name)?;
        }
        children_of(&reader, name)
    }

    /// `name` followed by every transitive descendant, breadth-first,
    /// siblings in lexicographic order. A branch always appears after
    /// its base.
    pub fn list_upstack(&self, name: &str) -> Result<Vec<String>> {
        let reader = self.store.reader()?;
        let repo = reader.require_repo()?;
        if name == repo.trunk {
            return Err(Error::InvalidArgument(format!(
                "trunk '{}' has no upstack; pass a tracked branch",
                repo.trunk
            )));
        }
        reader.require_branch(name)?;

        // One child map for the whole walk, from one snapshot.
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for (branch, record) in reader.branches()? {
            children.entry(record.base.name.clone()).or_default().push(branch);
        }
        for siblings in children.values_mut() {
            siblings.sort();
        }

        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(name.to_string());

        while let Some(branch) = queue.pop_front() {
            if !visited.insert(branch.clone()) {
                return Err(Error::Integrity(format!(
                    "cycle in branch bases reached through '{}'",
                    branch
                )));
            }
            if let Some(siblings) = children.get(&branch) {
                for child in siblings {
                    queue.push_back(child.clone());
                }
            }
            result.push(branch);
        }

        Ok(result)
    }

    /// `name` followed by its base, its base's base, and so on, ending
    /// with the branch whose base is the trunk. The trunk itself is
    /// excluded.
    pub fn list_downstack(&self, name: &str) -> Result<Vec<String>> {
        let reader = self.store.reader()?;
        let repo = reader.require_repo()?;
        if name == repo.trunk {
            return Err(Error::InvalidArgument(format!(
                "trunk '{}' has no downstack; pass a tracked branch",
                repo.trunk
            )));
        }

        let mut result = vec![name.to_string()];
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(name.to_string());

        let mut current = name.to_string();
        let mut record = reader.require_branch(name)?;
        while record.base.name != repo.trunk {
            let base = record.base.name.clone();
            if !seen.insert(base.clone()) {
                return Err(Error::Integrity(format!(
                    "cycle in branch bases reached through '{}'",
                    base
                )));
            }
            if result.len() >= MAX_STACK_DEPTH {
                return Err(Error::Integrity(format!(
                    "base chain exceeds maximum depth ({})",
                    MAX_STACK_DEPTH
                )));
            }
            record = reader.branch(&base)?.ok_or_else(|| {
                Error::Integrity(format!(
                    "branch '{}' has base '{}' which is neither the trunk nor tracked",
                    current, base
                ))
            })?;
            current = base.clone();
            result.push(base);
        }

        Ok(result)
    }

    /// Compare the current tip of `name`'s base against the recorded
    /// base hash.
    pub fn verify_restacked(&self, name: &str) -> Result<RestackStatus> {
        let record = self.lookup(name)?;
        self.cancel.check()?;
        let actual = self.worktree.peel_to_commit(&record.base.name)?;

        if record.base.hash == actual.as_str() {
            Ok(RestackStatus::UpToDate)
        } else {
            Ok(RestackStatus::NeedsRestack {
                base: record.base.name,
                recorded: record.base.hash,
                actual: actual.as_str().to_string(),
            })
        }
    }
}
