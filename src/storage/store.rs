//! The key–value transactor.
//!
//! Reads are served from a pinned snapshot without locking; snapshot
//! trees are immutable, so a [`StoreReader`] always sees a consistent
//! state. Writes go through [`StateStore::update_with`]: the caller's
//! prepare closure builds an [`UpdateRequest`] against the pinned tip,
//! and when the publish loses the compare-and-swap the closure is re-run
//! against the new tip, a bounded number of times, before the conflict
//! is surfaced.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::backend::{BackingRefStore, Change};
use super::{Author, Clock, Oid};
use crate::errors::{Error, Result};

/// Attempts before a persistent CAS miss becomes a fatal conflict.
const MAX_UPDATE_RETRIES: usize = 5;

/// One atomic update: upserts and deletes applied together, recorded as
/// a single snapshot with a human-readable message.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub upserts: Vec<(String, Value)>,
    pub deletes: Vec<String>,
    pub message: String,
}

impl UpdateRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            upserts: Vec::new(),
            deletes: Vec::new(),
            message: message.into(),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.upserts.push((key.into(), value));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.deletes.push(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// A consistent view of the store at one snapshot.
pub struct StoreReader<'a> {
    backend: &'a dyn BackingRefStore,
    head: Option<Oid>,
    tree: Option<Oid>,
}

impl<'a> StoreReader<'a> {
    fn pin(backend: &'a dyn BackingRefStore) -> Result<Self> {
        let head = backend.head()?;
        let tree = match &head {
            Some(id) => Some(backend.read_snapshot(id)?.tree),
            None => None,
        };
        Ok(Self { backend, head, tree })
    }

    /// Snapshot this reader is pinned to, if any.
    pub fn head(&self) -> Option<&Oid> {
        self.head.as_ref()
    }

    /// Raw bytes at `key`, or `None` when absent.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let tree = match &self.tree {
            Some(t) => t,
            None => return Ok(None),
        };
        match self.backend.tree_entry(tree, key)? {
            Some(blob) => Ok(Some(self.backend.read_blob(&blob)?)),
            None => Ok(None),
        }
    }

    /// Decode the JSON blob at `key`. A blob that exists but does not
    /// parse is an integrity error, not a missing value.
    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Integrity(format!("state blob '{}' is unreadable: {}", key, e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every `(key, bytes)` pair under `prefix`, sorted by key.
    pub fn read_tree(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let tree = match &self.tree {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        for (key, blob) in self.backend.tree_entries(tree, prefix)? {
            out.push((key, self.backend.read_blob(&blob)?));
        }
        Ok(out)
    }
}

/// Typed transactor over a [`BackingRefStore`].
pub struct StateStore {
    backend: Box<dyn BackingRefStore>,
    clock: Box<dyn Clock>,
    author: Author,
}

impl StateStore {
    pub fn new(backend: Box<dyn BackingRefStore>, clock: Box<dyn Clock>, author: Author) -> Self {
        Self { backend, clock, author }
    }

    /// Pin a consistent reader at the current tip.
    pub fn reader(&self) -> Result<StoreReader<'_>> {
        StoreReader::pin(self.backend.as_ref())
    }

    /// One-shot read of a single key.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.reader()?.read(key)
    }

    /// Apply a fixed request. Re-applies the same request on a CAS miss;
    /// use [`update_with`](Self::update_with) when the request depends on
    /// current state.
    pub fn update(&self, request: UpdateRequest) -> Result<Option<Oid>> {
        self.update_with(|_| Ok(Some(request.clone())))
    }

    /// Run `prepare` against a pinned reader and publish its request
    /// atomically. On a CAS miss, `prepare` is re-run against the new
    /// tip, up to [`MAX_UPDATE_RETRIES`] attempts. Returning `None` from
    /// `prepare` abandons the update; an empty request publishes nothing.
    ///
    /// Returns the published snapshot id, or `None` when nothing was
    /// written.
    pub fn update_with<F>(&self, mut prepare: F) -> Result<Option<Oid>>
    where
        F: FnMut(&StoreReader<'_>) -> Result<Option<UpdateRequest>>,
    {
        for _ in 0..MAX_UPDATE_RETRIES {
            let reader = self.reader()?;

            let request = match prepare(&reader)? {
                Some(request) => request,
                None => return Ok(None),
            };
            if request.is_empty() {
                return Ok(None);
            }

            let mut changes: Vec<(String, Change)> = Vec::with_capacity(request.upserts.len() + request.deletes.len());
            for (key, value) in &request.upserts {
                let bytes = serde_json::to_vec(value).map_err(|e| Error::external(anyhow::Error::new(e)))?;
                changes.push((key.clone(), Change::Put(bytes)));
            }
            for key in &request.deletes {
                changes.push((key.clone(), Change::Delete));
            }

            let snapshot = self.backend.write_snapshot(
                reader.head(),
                &changes,
                &request.message,
                &self.author,
                self.clock.now(),
            )?;

            match self.backend.publish(reader.head(), &snapshot) {
                Ok(()) => return Ok(Some(snapshot)),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict(format!(
            "state update lost the reference race {} times",
            MAX_UPDATE_RETRIES
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackingStore;
    use crate::storage::{FixedClock, SystemClock};
    use chrono::Utc;
    use serde_json::json;

    fn store() -> (StateStore, MemoryBackingStore) {
        let backend = MemoryBackingStore::new();
        let store = StateStore::new(
            Box::new(backend.clone()),
            Box::new(SystemClock),
            Author::new("Test User", "test@example.com"),
        );
        (store, backend)
    }

    #[test]
    fn test_update_and_read() {
        let (store, _) = store();

        let mut request = UpdateRequest::new("seed");
        request.put("repo", json!({"v": 1, "trunk": "main"}));
        store.update(request).unwrap().unwrap();

        let reader = store.reader().unwrap();
        let repo: Option<Value> = reader.read_json("repo").unwrap();
        assert_eq!(repo.unwrap()["trunk"], "main");
        assert!(reader.read("branches/none").unwrap().is_none());
    }

    #[test]
    fn test_read_tree_prefix() {
        let (store, _) = store();

        let mut request = UpdateRequest::new("seed");
        request
            .put("repo", json!({}))
            .put("branches/b", json!({"n": 2}))
            .put("branches/a", json!({"n": 1}));
        store.update(request).unwrap();

        let entries = store.reader().unwrap().read_tree("branches").unwrap();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["branches/a", "branches/b"]);
    }

    #[test]
    fn test_empty_request_publishes_nothing() {
        let (store, backend) = store();
        assert!(store.update(UpdateRequest::new("noop")).unwrap().is_none());
        assert!(backend.head().unwrap().is_none());
    }

    #[test]
    fn test_prepare_none_abandons() {
        let (store, backend) = store();
        let result = store.update_with(|_| Ok(None)).unwrap();
        assert!(result.is_none());
        assert!(backend.head().unwrap().is_none());
    }

    #[test]
    fn test_cas_retry_reruns_prepare() {
        let (store, backend) = store();

        let mut request = UpdateRequest::new("seed");
        request.put("repo", json!({}));
        store.update(request).unwrap();

        // A rival publishes between our pin and our publish on the first
        // attempt only.
        let rival = StateStore::new(
            Box::new(backend.clone()),
            Box::new(SystemClock),
            Author::new("Rival", "rival@example.com"),
        );
        let mut attempts = 0;
        let result = store
            .update_with(|reader| {
                attempts += 1;
                if attempts == 1 {
                    let mut steal = UpdateRequest::new("rival write");
                    steal.put("branches/rival", json!({}));
                    rival.update(steal).unwrap();
                }
                // The retried prepare must observe the rival's write.
                if attempts > 1 {
                    assert!(reader.read("branches/rival").unwrap().is_some());
                }
                let mut request = UpdateRequest::new("mine");
                request.put("branches/mine", json!({}));
                Ok(Some(request))
            })
            .unwrap();

        assert!(result.is_some());
        assert_eq!(attempts, 2);

        let reader = store.reader().unwrap();
        assert!(reader.read("branches/rival").unwrap().is_some());
        assert!(reader.read("branches/mine").unwrap().is_some());
    }

    #[test]
    fn test_persistent_conflict_is_fatal_and_atomic() {
        let (store, backend) = store();

        let mut request = UpdateRequest::new("seed");
        request.put("repo", json!({}));
        store.update(request).unwrap();
        let before = backend.head().unwrap();

        // A rival wins every race.
        let rival = StateStore::new(
            Box::new(backend.clone()),
            Box::new(SystemClock),
            Author::new("Rival", "rival@example.com"),
        );
        let mut n = 0;
        let err = store
            .update_with(|_| {
                n += 1;
                let mut steal = UpdateRequest::new(format!("rival {}", n));
                steal.put(format!("branches/rival-{}", n), json!({}));
                rival.update(steal).unwrap();
                let mut request = UpdateRequest::new("mine");
                request.put("branches/mine", json!({}));
                Ok(Some(request))
            })
            .unwrap_err();
        assert!(err.is_conflict());

        // Our key never landed; the store only reflects the rival.
        let reader = store.reader().unwrap();
        assert!(reader.read("branches/mine").unwrap().is_none());
        assert_ne!(backend.head().unwrap(), before);
    }

    #[test]
    fn test_snapshot_metadata_recorded() {
        let backend = MemoryBackingStore::new();
        let now = Utc::now();
        let store = StateStore::new(
            Box::new(backend.clone()),
            Box::new(FixedClock(now)),
            Author::new("Test User", "test@example.com"),
        );

        let mut request = UpdateRequest::new("initialize repository");
        request.put("repo", json!({}));
        let id = store.update(request).unwrap().unwrap();

        let meta = backend.read_snapshot(&id).unwrap();
        assert_eq!(meta.message, "initialize repository");
        assert_eq!(meta.author.name, "Test User");
        assert_eq!(meta.timestamp, now);
        assert!(meta.parent.is_none());
    }
}
