pub mod cache;
pub mod committed;
pub mod format;
pub mod merged;

pub use cache::{DiskIndexCache, IndexBlobCache, MemoryIndexCache};
pub use committed::CommittedContentIndex;
pub use format::{PackIndex, ReadAt};
pub use merged::MergedIndex;

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::Write;

use cairn_types::blob_id::BlobId;
use cairn_types::content_id::ContentId;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::Result;

/// Per-content metadata tracked by a pack index: where one deduplicated
/// chunk lives inside a pack blob, how it is encoded, and whether it has
/// been marked deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub content_id: ContentId,
    /// Absolute Unix timestamp in seconds; stored relative to a per-index base.
    pub timestamp_seconds: i64,
    pub pack_blob_id: BlobId,
    pub pack_offset: u32,
    pub original_length: u32,
    pub packed_length: u32,
    pub compression_header_id: u32,
    pub format_version: u8,
    pub encryption_key_id: u8,
    pub deleted: bool,
}

impl ContentInfo {
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.timestamp_seconds, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Conflict resolution between entries for the same content ID:
    /// latest timestamp wins, then non-deleted over deleted, then the
    /// lexicographically greatest pack blob ID.
    pub(crate) fn supersedes(&self, other: &ContentInfo) -> bool {
        if self.timestamp_seconds != other.timestamp_seconds {
            return self.timestamp_seconds > other.timestamp_seconds;
        }
        if self.deleted != other.deleted {
            return !self.deleted;
        }
        self.pack_blob_id > other.pack_blob_id
    }
}

/// Half-open range `[start, end)` of content IDs, compared as printable
/// strings. Bounds need not be valid content IDs themselves.
#[derive(Debug, Clone)]
pub struct IdRange {
    pub start: String,
    pub end: String,
}

/// Upper bound greater than any printable content ID character.
const MAX_ID_BOUND: &str = "\u{7f}";

impl IdRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Range covering every content ID.
    pub fn all() -> Self {
        Self::new("", MAX_ID_BOUND)
    }

    /// Range covering all IDs that start with `prefix`.
    pub fn prefixed(prefix: &str) -> Self {
        Self::new(prefix, format!("{prefix}{MAX_ID_BOUND}"))
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        id.as_str() >= self.start.as_str() && id.as_str() < self.end.as_str()
    }
}

/// Accumulates content infos and writes them as a sorted v2 pack index.
///
/// Duplicate IDs are resolved with the merged-index precedence, so feeding a
/// builder from several indexes produces the same result as merging them.
#[derive(Debug, Default)]
pub struct Builder {
    entries: BTreeMap<ContentId, ContentInfo>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, info: ContentInfo) {
        match self.entries.entry(info.content_id.clone()) {
            Entry::Occupied(mut e) => {
                if info.supersedes(e.get()) {
                    e.insert(info);
                }
            }
            Entry::Vacant(e) => {
                e.insert(info);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode the accumulated entries as a v2 pack index.
    pub fn build(&self, out: &mut dyn Write) -> Result<()> {
        let sorted: Vec<&ContentInfo> = self.entries.values().collect();
        format::build_v2(&sorted, out)
    }
}
