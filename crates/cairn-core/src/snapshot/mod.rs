pub mod entry;

use std::fmt;

use cairn_types::manifest_id::ManifestId;
use cairn_types::object_id::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use self::entry::DirEntry;

/// Identity of a snapshot source: which user on which host snapshotted
/// which path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceInfo {
    pub host: String,
    #[serde(rename = "userName")]
    pub user_name: String,
    pub path: String,
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user_name, self.host, self.path)
    }
}

/// Why a snapshot manifest is not a complete picture of its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncompleteReason {
    #[serde(rename = "checkpoint")]
    Checkpoint,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "limit reached")]
    LimitReached,
}

impl fmt::Display for IncompleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IncompleteReason::Checkpoint => "checkpoint",
            IncompleteReason::Canceled => "canceled",
            IncompleteReason::LimitReached => "limit reached",
        })
    }
}

/// Aggregate statistics for one upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(rename = "totalSize")]
    pub total_file_size: i64,
    #[serde(rename = "excludedTotalSize", default)]
    pub excluded_total_file_size: i64,
    #[serde(rename = "fileCount")]
    pub total_file_count: i32,
    #[serde(rename = "cachedFiles")]
    pub cached_files: i32,
    #[serde(rename = "nonCachedFiles")]
    pub non_cached_files: i32,
    #[serde(rename = "dirCount")]
    pub total_directory_count: i32,
    #[serde(rename = "excludedFileCount", default)]
    pub excluded_file_count: i32,
    #[serde(rename = "excludedDirCount", default)]
    pub excluded_dir_count: i32,
    #[serde(rename = "ignoredErrorCount", default)]
    pub ignored_error_count: i32,
    #[serde(rename = "errorCount", default)]
    pub error_count: i32,
}

/// Metadata describing one published snapshot: its source, time bounds,
/// root directory entry, aggregate stats, and completeness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ManifestId>,
    pub source: SourceInfo,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,
    #[serde(rename = "rootEntry", default, skip_serializing_if = "Option::is_none")]
    pub root_entry: Option<DirEntry>,
    pub stats: Stats,
    #[serde(rename = "incomplete", default, skip_serializing_if = "Option::is_none")]
    pub incomplete_reason: Option<IncompleteReason>,
}

impl SnapshotManifest {
    /// Empty prototype for a source; filled in as the upload progresses.
    pub fn new(source: SourceInfo) -> Self {
        Self {
            id: None,
            source,
            start_time: DateTime::UNIX_EPOCH,
            end_time: DateTime::UNIX_EPOCH,
            root_entry: None,
            stats: Stats::default(),
            incomplete_reason: None,
        }
    }

    pub fn root_object_id(&self) -> Option<&ObjectId> {
        self.root_entry.as_ref().map(|e| &e.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_reason_wire_values() {
        assert_eq!(
            serde_json::to_string(&IncompleteReason::Checkpoint).unwrap(),
            "\"checkpoint\""
        );
        assert_eq!(
            serde_json::to_string(&IncompleteReason::LimitReached).unwrap(),
            "\"limit reached\""
        );
        assert_eq!(
            serde_json::to_string(&IncompleteReason::Canceled).unwrap(),
            "\"canceled\""
        );
    }

    #[test]
    fn manifest_omits_absent_optionals() {
        let m = SnapshotManifest::new(SourceInfo {
            host: "h".into(),
            user_name: "u".into(),
            path: "/src".into(),
        });
        let v = serde_json::to_value(&m).unwrap();
        let obj = v.as_object().unwrap();
        assert!(!obj.contains_key("incomplete"));
        assert!(!obj.contains_key("rootEntry"));
        assert!(!obj.contains_key("id"));
    }
}
