//! Source-tree abstraction consumed by the uploader.
//!
//! Source entries form a closed variant set (file, directory, symlink,
//! streaming file, error entry). Metadata is uniform across kinds; two
//! optional capabilities sit on the base trait: exposing the object ID of
//! an already-uploaded incarnation (repository-backed sources), and
//! producing a pre-computed directory entry (placeholder sources).

pub mod ignorefs;
pub mod local;
pub mod repofs;

use std::io::Read;
use std::sync::Arc;

use cairn_types::object_id::ObjectId;
use chrono::{DateTime, Utc};

use crate::error::{CairnError, Result};
use crate::snapshot::entry::{DirEntry, EntryType};

/// File owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// POSIX-ish metadata common to every source entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub name: String,
    /// Permission bits.
    pub mode: u32,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub owner: Owner,
}

/// Base trait shared by all source-entry kinds.
pub trait EntryInfo: Send + Sync {
    fn meta(&self) -> &EntryMeta;

    /// Object ID of an already-uploaded incarnation of this entry, when the
    /// source is repository-backed. Enables the incremental cache.
    fn object_id(&self) -> Option<ObjectId> {
        None
    }

    /// Pre-computed directory entry for placeholder sources. A returned
    /// entry is adopted without re-hashing once its object ID verifies.
    fn dir_entry_or_nil(&self) -> Result<Option<DirEntry>> {
        Ok(None)
    }
}

pub trait FileSource: EntryInfo {
    fn open(&self) -> Result<Box<dyn Read + Send>>;
}

pub trait DirectorySource: EntryInfo {
    fn read_dir(&self) -> Result<Vec<SourceEntry>>;
}

pub trait SymlinkSource: EntryInfo {
    fn read_link(&self) -> Result<String>;
}

/// A file whose size is unknown until its stream is drained.
pub trait StreamingFileSource: EntryInfo {
    fn get_reader(&self) -> Result<Box<dyn Read + Send>>;
}

/// An entry that could not be materialized while reading its parent.
pub trait ErrorSource: EntryInfo {
    fn error_info(&self) -> CairnError;
}

/// Closed variant set of source entries.
#[derive(Clone)]
pub enum SourceEntry {
    File(Arc<dyn FileSource>),
    Directory(Arc<dyn DirectorySource>),
    Symlink(Arc<dyn SymlinkSource>),
    StreamingFile(Arc<dyn StreamingFileSource>),
    Error(Arc<dyn ErrorSource>),
}

impl SourceEntry {
    pub fn meta(&self) -> &EntryMeta {
        match self {
            SourceEntry::File(e) => e.meta(),
            SourceEntry::Directory(e) => e.meta(),
            SourceEntry::Symlink(e) => e.meta(),
            SourceEntry::StreamingFile(e) => e.meta(),
            SourceEntry::Error(e) => e.meta(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, SourceEntry::Directory(_))
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            SourceEntry::File(e) => e.object_id(),
            SourceEntry::Directory(e) => e.object_id(),
            SourceEntry::Symlink(e) => e.object_id(),
            SourceEntry::StreamingFile(e) => e.object_id(),
            SourceEntry::Error(e) => e.object_id(),
        }
    }

    pub fn dir_entry_or_nil(&self) -> Result<Option<DirEntry>> {
        match self {
            SourceEntry::File(e) => e.dir_entry_or_nil(),
            SourceEntry::Directory(e) => e.dir_entry_or_nil(),
            SourceEntry::Symlink(e) => e.dir_entry_or_nil(),
            SourceEntry::StreamingFile(e) => e.dir_entry_or_nil(),
            SourceEntry::Error(e) => e.dir_entry_or_nil(),
        }
    }

    /// Manifest entry type of this source entry, when it has one.
    pub fn entry_type(&self) -> Option<EntryType> {
        match self {
            SourceEntry::File(_) | SourceEntry::StreamingFile(_) => Some(EntryType::File),
            SourceEntry::Directory(_) => Some(EntryType::Directory),
            SourceEntry::Symlink(_) => Some(EntryType::Symlink),
            SourceEntry::Error(_) => None,
        }
    }

    /// Stable identity of the underlying source object, used as a
    /// checkpoint-registry key. Valid while the entry is alive.
    pub fn identity(&self) -> usize {
        match self {
            SourceEntry::File(e) => Arc::as_ptr(e) as *const () as usize,
            SourceEntry::Directory(e) => Arc::as_ptr(e) as *const () as usize,
            SourceEntry::Symlink(e) => Arc::as_ptr(e) as *const () as usize,
            SourceEntry::StreamingFile(e) => Arc::as_ptr(e) as *const () as usize,
            SourceEntry::Error(e) => Arc::as_ptr(e) as *const () as usize,
        }
    }
}

/// Locate an entry by name within one directory listing.
pub fn find_by_name<'a>(entries: &'a [SourceEntry], name: &str) -> Option<&'a SourceEntry> {
    entries.iter().find(|e| e.name() == name)
}

/// Whether two entries carry identical snapshot-relevant metadata. Matching
/// entries may be reused from the previous snapshot without re-hashing.
pub fn metadata_equals(a: &EntryMeta, b: &EntryMeta) -> bool {
    a.mod_time == b.mod_time && a.mode == b.mode && a.size == b.size && a.owner == b.owner
}

/// Error entry with a fixed message, produced when reading a directory
/// yields children that cannot be materialized.
pub struct StaticErrorEntry {
    meta: EntryMeta,
    message: String,
    unknown_type: bool,
}

impl StaticErrorEntry {
    /// Entry representing an I/O failure for `name`.
    pub fn io_error(meta: EntryMeta, message: impl Into<String>) -> Self {
        Self {
            meta,
            message: message.into(),
            unknown_type: false,
        }
    }

    /// Entry representing a file-system node of an unsupported type.
    pub fn unknown_type(meta: EntryMeta) -> Self {
        Self {
            meta,
            message: String::new(),
            unknown_type: true,
        }
    }
}

impl EntryInfo for StaticErrorEntry {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

impl ErrorSource for StaticErrorEntry {
    fn error_info(&self) -> CairnError {
        if self.unknown_type {
            CairnError::UnknownEntryType
        } else {
            CairnError::Other(self.message.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, size: i64) -> EntryMeta {
        EntryMeta {
            name: name.to_string(),
            mode: 0o644,
            size,
            mod_time: DateTime::UNIX_EPOCH,
            owner: Owner::default(),
        }
    }

    #[test]
    fn metadata_equality_ignores_name() {
        let a = meta("a", 10);
        let b = meta("b", 10);
        assert!(metadata_equals(&a, &b));

        let c = meta("a", 11);
        assert!(!metadata_equals(&a, &c));
    }

    #[test]
    fn identity_is_stable_per_arc() {
        let entry = Arc::new(StaticErrorEntry::unknown_type(meta("x", 0)));
        let a = SourceEntry::Error(entry.clone());
        let b = SourceEntry::Error(entry);
        assert_eq!(a.identity(), b.identity());

        let other = SourceEntry::Error(Arc::new(StaticErrorEntry::unknown_type(meta("x", 0))));
        assert_ne!(a.identity(), other.identity());
    }

    #[test]
    fn unknown_type_errors_are_classified() {
        let entry = StaticErrorEntry::unknown_type(meta("sock", 0));
        assert!(matches!(entry.error_info(), CairnError::UnknownEntryType));

        let entry = StaticErrorEntry::io_error(meta("f", 0), "permission denied");
        assert!(matches!(entry.error_info(), CairnError::Other(_)));
    }
}
