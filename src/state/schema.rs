//! On-disk blob schemas.
//!
//! Every blob carries a `v` version integer. Readers accept every prior
//! version and keep unknown fields so that an older client writing back
//! a record produced by a newer one loses nothing; upgrades happen on
//! write only.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current schema version written by this client.
pub const SCHEMA_VERSION: u32 = 1;

fn default_version() -> u32 {
    SCHEMA_VERSION
}

/// Repository-wide metadata. Singleton, at key `repo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoInfo {
    #[serde(default = "default_version")]
    pub v: u32,
    /// The long-lived branch every stack roots at. Never tracked itself.
    pub trunk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RepoInfo {
    pub fn new(trunk: impl Into<String>, remote: Option<String>) -> Self {
        Self {
            v: SCHEMA_VERSION,
            trunk: trunk.into(),
            remote,
            extra: Map::new(),
        }
    }
}

/// Where a branch was last known to sit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchBase {
    /// The trunk or another tracked branch.
    pub name: String,
    /// Commit hash of `name`'s tip when this branch was last stacked on
    /// it. A differing current tip means the branch needs a restack.
    pub hash: String,
}

/// Association with a forge change request. The id is opaque; the core
/// only compares it for equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAssociation {
    pub forge: String,
    pub id: Value,
}

/// Forge id assumed for records written before per-forge association
/// existed (a bare top-level `pr` number).
const LEGACY_PR_FORGE: &str = "github";

/// One tracked non-trunk branch. At key `branches/<escaped-name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    #[serde(default = "default_version")]
    pub v: u32,
    pub base: BranchBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeAssociation>,
    /// Change ids already merged below this branch, oldest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_downstack: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BranchRecord {
    pub fn new(base: impl Into<String>, base_hash: impl Into<String>) -> Self {
        Self {
            v: SCHEMA_VERSION,
            base: BranchBase {
                name: base.into(),
                hash: base_hash.into(),
            },
            upstream: None,
            change: None,
            merged_downstack: None,
            extra: Map::new(),
        }
    }

    /// Migrate legacy shapes into the current in-memory form. Called on
    /// every read; the new shape only reaches disk when the record is
    /// written back.
    pub fn upgraded(mut self) -> Self {
        if self.change.is_none() {
            if let Some(pr) = self.extra.remove("pr") {
                if pr.is_i64() || pr.is_u64() {
                    self.change = Some(ChangeAssociation {
                        forge: LEGACY_PR_FORGE.to_string(),
                        id: pr,
                    });
                } else {
                    // Not the historical shape after all; keep it as an
                    // unknown field.
                    self.extra.insert("pr".to_string(), pr);
                }
            }
        }
        self
    }

    /// The merged-downstack history, empty when unset.
    pub fn merged_downstack(&self) -> &[Value] {
        self.merged_downstack.as_deref().unwrap_or(&[])
    }
}

/// One persisted resume instruction. The queue at `rebase-continue` is a
/// JSON array of these; an empty queue is stored as an absent key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationEntry {
    /// Argument vector understood by the embedding tool.
    pub command: Vec<String>,
    /// Branch to be on when resuming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ContinuationEntry {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            branch: None,
            message: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_repo_info_roundtrip() {
        let info = RepoInfo::new("main", Some("origin".into()));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, json!({"v": 1, "trunk": "main", "remote": "origin"}));
        let back: RepoInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.v, SCHEMA_VERSION);
    }

    #[test]
    fn test_branch_record_wire_shape() {
        let mut record = BranchRecord::new("main", "aa".repeat(20));
        record.upstream = Some("origin/feat".into());
        record.change = Some(ChangeAssociation {
            forge: "github".into(),
            id: json!(41),
        });
        record.merged_downstack = Some(vec![json!(7)]);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["base"]["name"], "main");
        assert_eq!(json["base"]["hash"], "aa".repeat(20));
        assert_eq!(json["upstream"], "origin/feat");
        assert_eq!(json["change"]["forge"], "github");
        assert_eq!(json["change"]["id"], 41);
        // camelCase on the wire.
        assert_eq!(json["mergedDownstack"], json!([7]));
        assert!(json.get("merged_downstack").is_none());
    }

    #[test]
    fn test_unknown_fields_roundtrip() {
        let raw = json!({
            "v": 1,
            "base": {"name": "main", "hash": "ab".repeat(20)},
            "future": 42,
            "nested": {"keep": true}
        });

        let mut record: BranchRecord = serde_json::from_value(raw).unwrap();
        record = record.upgraded();
        record.upstream = Some("origin/x".into());

        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["future"], 42);
        assert_eq!(written["nested"]["keep"], true);
        assert_eq!(written["upstream"], "origin/x");
    }

    #[test]
    fn test_legacy_pr_upgraded_on_read() {
        let raw = json!({
            "base": {"name": "main", "hash": "cd".repeat(20)},
            "pr": 123
        });

        let record: BranchRecord = serde_json::from_value(raw).unwrap();
        let record = record.upgraded();

        let change = record.change.as_ref().unwrap();
        assert_eq!(change.forge, "github");
        assert_eq!(change.id, json!(123));

        // Rewrite happens on write: the old field is gone, the new shape
        // is present.
        let written = serde_json::to_value(&record).unwrap();
        assert!(written.get("pr").is_none());
        assert_eq!(written["change"]["id"], 123);
    }

    #[test]
    fn test_non_integer_pr_kept_as_unknown_field() {
        let raw = json!({
            "base": {"name": "main", "hash": "cd".repeat(20)},
            "pr": "not-a-number"
        });

        let record: BranchRecord = serde_json::from_value::<BranchRecord>(raw).unwrap().upgraded();
        assert!(record.change.is_none());
        assert_eq!(record.extra["pr"], "not-a-number");
    }

    #[test]
    fn test_future_version_still_parses() {
        let raw = json!({
            "v": 3,
            "base": {"name": "main", "hash": "ef".repeat(20)},
            "newField": {"a": 1}
        });

        let record: BranchRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.v, 3);
        // A future version's marker is written back untouched.
        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["v"], 3);
        assert_eq!(written["newField"]["a"], 1);
    }

    #[test]
    fn test_continuation_entry_roundtrip() {
        let entry = ContinuationEntry::new(vec!["upstack".into(), "restack".into()])
            .with_branch("feat-2")
            .with_message("restack interrupted by conflict");

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["command"], json!(["upstack", "restack"]));
        assert_eq!(json["branch"], "feat-2");

        let back: ContinuationEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_continuation_entry_minimal() {
        let entry = ContinuationEntry::new(vec!["restack".into()]);
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("branch").is_none());
        assert!(json.get("message").is_none());
    }
}
