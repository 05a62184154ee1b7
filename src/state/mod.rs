//! Stack state model: the typed view over the transactor.
//!
//! Key layout inside every snapshot tree:
//!
//! ```text
//! repo                         RepoInfo
//! branches/<escaped-name>      BranchRecord
//! rebase-continue              array of ContinuationEntry (absent = empty)
//! forges/<forge-id>            opaque per-forge blob
//! ```

pub mod schema;

pub use schema::{BranchBase, BranchRecord, ChangeAssociation, ContinuationEntry, RepoInfo, SCHEMA_VERSION};

use serde_json::Value;

use crate::errors::{Error, Result};
use crate::escape::{escape_branch_name, unescape_branch_name};
use crate::storage::{StoreReader, UpdateRequest};

pub const REPO_KEY: &str = "repo";
pub const BRANCHES_PREFIX: &str = "branches";
pub const CONTINUE_KEY: &str = "rebase-continue";
pub const FORGES_PREFIX: &str = "forges";

/// State-tree key for a branch record.
pub fn branch_key(name: &str) -> String {
    format!("{}/{}", BRANCHES_PREFIX, escape_branch_name(name))
}

/// State-tree key for a per-forge blob.
pub fn forge_key(forge_id: &str) -> String {
    format!("{}/{}", FORGES_PREFIX, escape_branch_name(forge_id))
}

// Typed reads. These live on the reader so that service transactions can
// compose several of them against one consistent snapshot.
impl StoreReader<'_> {
    pub fn repo_info(&self) -> Result<Option<RepoInfo>> {
        self.read_json(REPO_KEY)
    }

    /// RepoInfo, or `NotFound` when the repository was never initialized.
    pub fn require_repo(&self) -> Result<RepoInfo> {
        self.repo_info()?
            .ok_or_else(|| Error::NotFound("repository is not initialized for stacking".into()))
    }

    pub fn branch(&self, name: &str) -> Result<Option<BranchRecord>> {
        let record: Option<BranchRecord> = self.read_json(&branch_key(name))?;
        Ok(record.map(BranchRecord::upgraded))
    }

    /// Branch record, or `NotFound`.
    pub fn require_branch(&self, name: &str) -> Result<BranchRecord> {
        self.branch(name)?
            .ok_or_else(|| Error::NotFound(format!("branch '{}' is not tracked", name)))
    }

    /// All tracked branches with their records, sorted by name.
    pub fn branches(&self) -> Result<Vec<(String, BranchRecord)>> {
        let mut out = Vec::new();
        for (key, bytes) in self.read_tree(BRANCHES_PREFIX)? {
            let escaped = key
                .strip_prefix(BRANCHES_PREFIX)
                .and_then(|rest| rest.strip_prefix('/'))
                .ok_or_else(|| Error::Integrity(format!("unexpected state key '{}'", key)))?;
            let name = unescape_branch_name(escaped)?;
            let record: BranchRecord = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Integrity(format!("branch record '{}' is unreadable: {}", name, e)))?;
            out.push((name, record.upgraded()));
        }
        // read_tree sorts by escaped key; re-sort by the real name.
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// The continuation queue, oldest first; the top of the queue is the
    /// LAST element. Empty when the key is absent.
    pub fn continuations(&self) -> Result<Vec<ContinuationEntry>> {
        let queue: Option<Vec<ContinuationEntry>> = self.read_json(CONTINUE_KEY)?;
        match queue {
            Some(entries) if entries.is_empty() => Err(Error::Integrity(
                "continuation queue is present but empty; it must be absent instead".into(),
            )),
            Some(entries) => Ok(entries),
            None => Ok(Vec::new()),
        }
    }

    pub fn forge_blob(&self, forge_id: &str) -> Result<Option<Value>> {
        self.read_json(&forge_key(forge_id))
    }
}

// Typed writes: builders that serialize schema types into an update.
impl UpdateRequest {
    pub fn put_repo(&mut self, info: &RepoInfo) -> Result<&mut Self> {
        let value = serde_json::to_value(info).map_err(|e| Error::external(anyhow::Error::new(e)))?;
        Ok(self.put(REPO_KEY, value))
    }

    pub fn put_branch(&mut self, name: &str, record: &BranchRecord) -> Result<&mut Self> {
        let value = serde_json::to_value(record).map_err(|e| Error::external(anyhow::Error::new(e)))?;
        Ok(self.put(branch_key(name), value))
    }

    pub fn delete_branch(&mut self, name: &str) -> &mut Self {
        self.delete(branch_key(name))
    }

    /// Replace the continuation queue. An empty queue deletes the key so
    /// a present-but-empty queue never reaches disk.
    pub fn put_continuations(&mut self, entries: &[ContinuationEntry]) -> Result<&mut Self> {
        if entries.is_empty() {
            return Ok(self.delete(CONTINUE_KEY));
        }
        let value = serde_json::to_value(entries).map_err(|e| Error::external(anyhow::Error::new(e)))?;
        Ok(self.put(CONTINUE_KEY, value))
    }

    pub fn put_forge_blob(&mut self, forge_id: &str, blob: Value) -> &mut Self {
        self.put(forge_key(forge_id), blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackingStore;
    use crate::storage::{Author, StateStore, SystemClock};
    use serde_json::json;

    fn store() -> StateStore {
        StateStore::new(
            Box::new(MemoryBackingStore::new()),
            Box::new(SystemClock),
            Author::new("Test User", "test@example.com"),
        )
    }

    #[test]
    fn test_branch_key_escapes() {
        assert_eq!(branch_key("feat-1"), "branches/feat-1");
        assert_eq!(branch_key("user/feat"), "branches/user%2Ffeat");
    }

    #[test]
    fn test_repo_info_read_write() {
        let store = store();
        let mut request = UpdateRequest::new("initialize repository");
        request.put_repo(&RepoInfo::new("main", Some("origin".into()))).unwrap();
        store.update(request).unwrap();

        let reader = store.reader().unwrap();
        let info = reader.require_repo().unwrap();
        assert_eq!(info.trunk, "main");
        assert_eq!(info.remote.as_deref(), Some("origin"));
    }

    #[test]
    fn test_require_repo_absent_is_not_found() {
        let store = store();
        let reader = store.reader().unwrap();
        let err = reader.require_repo().unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_branches_listed_by_real_name() {
        let store = store();
        let mut request = UpdateRequest::new("seed");
        request
            .put_branch("user/b", &BranchRecord::new("main", "11".repeat(20)))
            .unwrap();
        request
            .put_branch("a", &BranchRecord::new("main", "22".repeat(20)))
            .unwrap();
        store.update(request).unwrap();

        let reader = store.reader().unwrap();
        let names: Vec<String> = reader.branches().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "user/b"]);
        assert!(reader.branch("user/b").unwrap().is_some());
    }

    #[test]
    fn test_require_branch_not_tracked() {
        let store = store();
        let reader = store.reader().unwrap();
        let err = reader.require_branch("ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_continuations_absent_means_empty() {
        let store = store();
        let reader = store.reader().unwrap();
        assert!(reader.continuations().unwrap().is_empty());
    }

    #[test]
    fn test_empty_queue_deletes_key() {
        let store = store();
        let entry = ContinuationEntry::new(vec!["restack".into()]);

        let mut request = UpdateRequest::new("push");
        request.put_continuations(std::slice::from_ref(&entry)).unwrap();
        store.update(request).unwrap();
        assert!(store.read(CONTINUE_KEY).unwrap().is_some());

        let mut request = UpdateRequest::new("pop");
        request.put_continuations(&[]).unwrap();
        store.update(request).unwrap();
        assert!(store.read(CONTINUE_KEY).unwrap().is_none());
    }

    #[test]
    fn test_present_empty_queue_is_integrity_error() {
        let store = store();
        let mut request = UpdateRequest::new("corrupt");
        request.put(CONTINUE_KEY, json!([]));
        store.update(request).unwrap();

        let err = store.reader().unwrap().continuations().unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_forge_blob_roundtrip() {
        let store = store();
        let mut request = UpdateRequest::new("record forge state");
        request.put_forge_blob("github", json!({"installation": 99}));
        store.update(request).unwrap();

        let reader = store.reader().unwrap();
        let blob = reader.forge_blob("github").unwrap().unwrap();
        assert_eq!(blob["installation"], 99);
        assert!(reader.forge_blob("gitlab").unwrap().is_none());
    }

    #[test]
    fn test_legacy_pr_record_visible_through_reader() {
        let store = store();
        let mut request = UpdateRequest::new("seed legacy");
        request.put(
            branch_key("old"),
            json!({"base": {"name": "main", "hash": "ab".repeat(20)}, "pr": 7}),
        );
        store.update(request).unwrap();

        let record = store.reader().unwrap().require_branch("old").unwrap();
        assert_eq!(record.change.as_ref().unwrap().id, json!(7));
    }
}
