//! Directory entries, rollup summaries, and the directory-manifest wire
//! format.
//!
//! A directory manifest is JSON: a stream-type marker, the sorted list of
//! entries (directories first, then non-directories, each group by name),
//! and a summary aggregating counts, sizes, and failures over the subtree.

use cairn_types::object_id::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::IncompleteReason;

/// Stream-type marker at the head of every directory manifest.
pub const DIRECTORY_STREAM_TYPE: &str = "cairn:directory";

/// Cap on failed-entry records carried by one directory summary.
pub const MAX_FAILED_ENTRIES_PER_DIRECTORY_SUMMARY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    #[serde(rename = "d")]
    Directory,
    #[serde(rename = "f")]
    File,
    #[serde(rename = "s")]
    Symlink,
}

/// One entry of a directory manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub permissions: u32,
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "modTime")]
    pub mod_time: DateTime<Utc>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(rename = "objectID")]
    pub object_id: ObjectId,
    #[serde(rename = "summary", default, skip_serializing_if = "Option::is_none")]
    pub dir_summary: Option<DirectorySummary>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}

/// A failed entry recorded in a directory summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub path: String,
    pub error: String,
}

/// Rollup statistics over a directory subtree. A parent summary is the
/// component-wise sum of its direct entries' contributions plus its
/// children's summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySummary {
    #[serde(rename = "size")]
    pub total_file_size: i64,
    #[serde(rename = "files")]
    pub total_file_count: i64,
    #[serde(rename = "symlinks", default)]
    pub total_symlink_count: i64,
    #[serde(rename = "dirs")]
    pub total_dir_count: i64,
    #[serde(rename = "maxTime")]
    pub max_mod_time: DateTime<Utc>,
    #[serde(rename = "incomplete", default, skip_serializing_if = "Option::is_none")]
    pub incomplete_reason: Option<IncompleteReason>,
    #[serde(rename = "numFailed", default)]
    pub fatal_error_count: i64,
    #[serde(rename = "numIgnoredErrors", default)]
    pub ignored_error_count: i64,
    #[serde(rename = "errors", default, skip_serializing_if = "Vec::is_empty")]
    pub failed_entries: Vec<FailedEntry>,
}

impl Default for DirectorySummary {
    fn default() -> Self {
        Self {
            total_file_size: 0,
            total_file_count: 0,
            total_symlink_count: 0,
            total_dir_count: 0,
            max_mod_time: DateTime::UNIX_EPOCH,
            incomplete_reason: None,
            fatal_error_count: 0,
            ignored_error_count: 0,
            failed_entries: Vec::new(),
        }
    }
}

/// Canonical encoded form of one directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirManifest {
    #[serde(rename = "stream")]
    pub stream_type: String,
    pub summary: DirectorySummary,
    pub entries: Vec<DirEntry>,
}
