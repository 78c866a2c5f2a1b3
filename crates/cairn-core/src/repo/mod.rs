//! Repository capability traits consumed by the uploader and the garbage
//! collector. Concrete implementations (object stores, pack writers,
//! encryption, compression) live behind these interfaces.

use cairn_types::content_id::ContentId;
use cairn_types::manifest_id::ManifestId;
use cairn_types::object_id::ObjectId;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::index::ContentInfo;
use crate::snapshot::{SnapshotManifest, SourceInfo};

/// Content-ID prefix of directory-manifest objects.
pub const OBJECT_PREFIX_DIRECTORY: char = 'k';

/// Content-ID prefix of manifest-system contents; never garbage-collected.
pub const MANIFEST_CONTENT_PREFIX: char = 'm';

/// Options for creating an object writer.
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Human-readable description, e.g. `FILE:report.pdf` or `DIR:src/sub`.
    pub description: String,
    /// Name of the compressor to apply, if any.
    pub compressor: Option<String>,
    /// Content-ID prefix for the resulting contents.
    pub prefix: Option<char>,
    /// Hint: number of asynchronous writes the writer may keep in flight.
    pub async_writes: usize,
}

/// Streams bytes into the repository and yields a content-addressed object
/// ID. Writers release their resources when dropped, including after a
/// mid-copy failure.
pub trait ObjectWriter: Send {
    /// Write a buffer. Returns the number of bytes accepted; a short write
    /// is treated as fatal by callers.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Finish the object and return its ID.
    fn result(&mut self) -> Result<ObjectId>;

    /// Flush what has been written so far into an intermediate object that
    /// can be referenced by a checkpoint manifest. Returns `None` when there
    /// is nothing worth checkpointing yet.
    fn checkpoint(&mut self) -> Result<Option<ObjectId>>;
}

/// Write access to a repository: objects, snapshot manifests, and time.
pub trait RepositoryWriter: Send + Sync {
    fn new_object_writer(&self, options: WriterOptions) -> Box<dyn ObjectWriter>;

    /// Verify that `object_id` is fully backed by repository contents and
    /// return the content IDs it reads through.
    fn verify_object(&self, object_id: &ObjectId) -> Result<Vec<ContentId>>;

    /// Read back a stored object.
    fn open_object(&self, object_id: &ObjectId) -> Result<Vec<u8>>;

    /// Repository wall clock. All snapshot timestamps come from here.
    fn time(&self) -> DateTime<Utc>;

    /// Flush pending writes so objects written so far are durable.
    fn flush(&self) -> Result<()>;

    fn save_snapshot(&self, manifest: &SnapshotManifest) -> Result<ManifestId>;

    fn list_snapshot_manifests(&self) -> Result<Vec<ManifestId>>;

    fn load_snapshot(&self, id: &ManifestId) -> Result<SnapshotManifest>;

    /// Evaluate the retention policy for `source`, typically after a
    /// checkpoint or final snapshot save. The default does nothing.
    fn apply_retention(&self, source: &SourceInfo) -> Result<()> {
        let _ = source;
        Ok(())
    }
}

/// Options for iterating the repository's content registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterateOptions {
    /// Include contents marked deleted, so they can be undeleted.
    pub include_deleted: bool,
}

/// Direct content-registry access required by maintenance tasks such as
/// garbage collection.
pub trait MaintenanceRepository: RepositoryWriter {
    fn iterate_contents(
        &self,
        options: IterateOptions,
        cb: &mut dyn FnMut(&ContentInfo) -> Result<()>,
    ) -> Result<()>;

    fn delete_content(&self, content_id: &ContentId) -> Result<()>;

    fn undelete_content(&self, content_id: &ContentId) -> Result<()>;
}
