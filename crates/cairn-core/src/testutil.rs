//! Shared test fixtures: an in-memory repository and an in-memory source
//! tree builder.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use cairn_types::content_id::ContentId;
use cairn_types::manifest_id::ManifestId;
use cairn_types::object_id::ObjectId;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{CairnError, Result};
use crate::fs::{
    DirectorySource, EntryInfo, EntryMeta, FileSource, Owner, SourceEntry, StaticErrorEntry,
    StreamingFileSource, SymlinkSource,
};
use crate::index::ContentInfo;
use crate::repo::{
    IterateOptions, MaintenanceRepository, ObjectWriter, RepositoryWriter, WriterOptions,
};
use crate::snapshot::{SnapshotManifest, SourceInfo};

pub fn test_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap()
}

pub fn test_source_info() -> SourceInfo {
    SourceInfo {
        host: "host".into(),
        user_name: "user".into(),
        path: "/data/src".into(),
    }
}

/// Deterministic short hex digest used for fake object and content IDs.
fn digest(data: &[u8]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write(data);
    format!("{:016x}", hasher.finish())
}

#[derive(Default)]
struct RepoState {
    objects: HashMap<ObjectId, Vec<u8>>,
    object_contents: HashMap<ObjectId, Vec<ContentId>>,
    contents: BTreeMap<ContentId, ContentInfo>,
    snapshots: BTreeMap<ManifestId, SnapshotManifest>,
    next_manifest: u64,
    flush_count: u32,
    retention_applied: u32,
}

/// In-memory repository. Objects are addressed by a digest of their bytes;
/// each written object registers one content ID in the content registry.
pub struct TestRepository {
    state: Mutex<RepoState>,
    now: Mutex<DateTime<Utc>>,
    me: std::sync::Weak<TestRepository>,
}

impl TestRepository {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(RepoState::default()),
            now: Mutex::new(test_time()),
            me: me.clone(),
        })
    }

    fn self_arc(&self) -> Arc<TestRepository> {
        self.me.upgrade().expect("repository alive")
    }

    pub fn snapshots(&self) -> Vec<SnapshotManifest> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .values()
            .cloned()
            .collect()
    }

    pub fn flush_count(&self) -> u32 {
        self.state.lock().unwrap().flush_count
    }

    pub fn retention_applied(&self) -> u32 {
        self.state.lock().unwrap().retention_applied
    }

    /// Register a content-registry entry directly (for GC tests).
    pub fn put_content(&self, info: ContentInfo) {
        let mut state = self.state.lock().unwrap();
        state.contents.insert(info.content_id.clone(), info);
    }

    pub fn content(&self, id: &ContentId) -> Option<ContentInfo> {
        self.state.lock().unwrap().contents.get(id).cloned()
    }

    /// Store raw object bytes and associate them with content IDs, without
    /// going through a writer.
    pub fn put_object(&self, object_id: ObjectId, data: Vec<u8>, content_ids: Vec<ContentId>) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(object_id.clone(), data);
        state.object_contents.insert(object_id, content_ids);
    }

    fn store_object(&self, data: Vec<u8>, prefix: Option<char>) -> Result<ObjectId> {
        let digest = digest(&data);
        let object_id = ObjectId::new(digest.as_str());
        let content_id = ContentId::from_hash(prefix, &hex_bytes(&digest))?;

        let now = self.time();
        let mut state = self.state.lock().unwrap();
        state.objects.insert(object_id.clone(), data.clone());
        state
            .object_contents
            .insert(object_id.clone(), vec![content_id.clone()]);
        state.contents.entry(content_id.clone()).or_insert(ContentInfo {
            content_id,
            timestamp_seconds: now.timestamp(),
            pack_blob_id: "p0".into(),
            pack_offset: 0,
            original_length: data.len() as u32,
            packed_length: data.len() as u32,
            compression_header_id: 0,
            format_version: 1,
            encryption_key_id: 0,
            deleted: false,
        });
        Ok(object_id)
    }
}

fn hex_bytes(digest: &str) -> Vec<u8> {
    hex::decode(digest).expect("digest is hex")
}

impl RepositoryWriter for TestRepository {
    fn new_object_writer(&self, options: WriterOptions) -> Box<dyn ObjectWriter> {
        Box::new(TestObjectWriter {
            repo: self.self_arc(),
            prefix: options.prefix,
            buf: Vec::new(),
        })
    }

    fn verify_object(&self, object_id: &ObjectId) -> Result<Vec<ContentId>> {
        self.state
            .lock()
            .unwrap()
            .object_contents
            .get(object_id)
            .cloned()
            .ok_or_else(|| CairnError::ObjectNotFound(object_id.clone()))
    }

    fn open_object(&self, object_id: &ObjectId) -> Result<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(object_id)
            .cloned()
            .ok_or_else(|| CairnError::ObjectNotFound(object_id.clone()))
    }

    fn time(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn flush(&self) -> Result<()> {
        self.state.lock().unwrap().flush_count += 1;
        Ok(())
    }

    fn save_snapshot(&self, manifest: &SnapshotManifest) -> Result<ManifestId> {
        let mut state = self.state.lock().unwrap();
        state.next_manifest += 1;
        let id = ManifestId::new(format!("s{:08}", state.next_manifest));
        let mut manifest = manifest.clone();
        manifest.id = Some(id.clone());
        state.snapshots.insert(id.clone(), manifest);
        Ok(id)
    }

    fn list_snapshot_manifests(&self) -> Result<Vec<ManifestId>> {
        Ok(self.state.lock().unwrap().snapshots.keys().cloned().collect())
    }

    fn load_snapshot(&self, id: &ManifestId) -> Result<SnapshotManifest> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| CairnError::SnapshotNotFound(id.clone()))
    }

    fn apply_retention(&self, _source: &SourceInfo) -> Result<()> {
        self.state.lock().unwrap().retention_applied += 1;
        Ok(())
    }
}

impl MaintenanceRepository for TestRepository {
    fn iterate_contents(
        &self,
        options: IterateOptions,
        cb: &mut dyn FnMut(&ContentInfo) -> Result<()>,
    ) -> Result<()> {
        let contents: Vec<ContentInfo> = self
            .state
            .lock()
            .unwrap()
            .contents
            .values()
            .cloned()
            .collect();
        for info in contents {
            if info.deleted && !options.include_deleted {
                continue;
            }
            cb(&info)?;
        }
        Ok(())
    }

    fn delete_content(&self, content_id: &ContentId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.contents.get_mut(content_id) {
            Some(info) => {
                info.deleted = true;
                Ok(())
            }
            None => Err(CairnError::ContentNotFound(content_id.clone())),
        }
    }

    fn undelete_content(&self, content_id: &ContentId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.contents.get_mut(content_id) {
            Some(info) => {
                info.deleted = false;
                Ok(())
            }
            None => Err(CairnError::ContentNotFound(content_id.clone())),
        }
    }
}

struct TestObjectWriter {
    repo: Arc<TestRepository>,
    prefix: Option<char>,
    buf: Vec<u8>,
}

impl ObjectWriter for TestObjectWriter {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn result(&mut self) -> Result<ObjectId> {
        self.repo.store_object(std::mem::take(&mut self.buf), self.prefix)
    }

    fn checkpoint(&mut self) -> Result<Option<ObjectId>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let oid = self.repo.store_object(self.buf.clone(), self.prefix)?;
        Ok(Some(oid))
    }
}

// ---------------------------------------------------------------------------
// In-memory source tree
// ---------------------------------------------------------------------------

fn test_meta(name: &str, size: i64, mod_time: DateTime<Utc>, mode: u32) -> EntryMeta {
    EntryMeta {
        name: name.to_string(),
        mode,
        size,
        mod_time,
        owner: Owner { uid: 500, gid: 500 },
    }
}

/// In-memory directory; children are added by the test then read back by
/// the uploader in name order.
pub struct TestDirectory {
    meta: EntryMeta,
    children: Mutex<Vec<SourceEntry>>,
}

impl TestDirectory {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_mod_time(name, test_time())
    }

    pub fn with_mod_time(name: &str, mod_time: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            meta: test_meta(name, 0, mod_time, 0o755),
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn add_file(self: &Arc<Self>, name: &str, content: &[u8]) -> Arc<TestFile> {
        self.add_file_with_mod_time(name, content, test_time())
    }

    pub fn add_file_with_mod_time(
        self: &Arc<Self>,
        name: &str,
        content: &[u8],
        mod_time: DateTime<Utc>,
    ) -> Arc<TestFile> {
        let file = Arc::new(TestFile {
            meta: test_meta(name, content.len() as i64, mod_time, 0o644),
            content: content.to_vec(),
            open_gate: Mutex::new(None),
        });
        self.children
            .lock()
            .unwrap()
            .push(SourceEntry::File(file.clone()));
        file
    }

    pub fn add_dir(self: &Arc<Self>, name: &str) -> Arc<TestDirectory> {
        let dir = TestDirectory::new(name);
        self.children
            .lock()
            .unwrap()
            .push(SourceEntry::Directory(dir.clone()));
        dir
    }

    pub fn add_symlink(self: &Arc<Self>, name: &str, target: &str) {
        let link = Arc::new(TestSymlink {
            meta: test_meta(name, target.len() as i64, test_time(), 0o777),
            target: target.to_string(),
        });
        self.children
            .lock()
            .unwrap()
            .push(SourceEntry::Symlink(link));
    }

    pub fn add_streaming_file(self: &Arc<Self>, name: &str, content: &[u8]) {
        let file = Arc::new(TestStreamingFile {
            meta: test_meta(name, 0, test_time(), 0o644),
            content: content.to_vec(),
        });
        self.children
            .lock()
            .unwrap()
            .push(SourceEntry::StreamingFile(file));
    }

    pub fn add_placeholder_file(
        self: &Arc<Self>,
        name: &str,
        dir_entry: crate::snapshot::entry::DirEntry,
    ) {
        let file = Arc::new(TestPlaceholderFile {
            meta: test_meta(name, dir_entry.size, test_time(), 0o644),
            dir_entry,
        });
        self.children
            .lock()
            .unwrap()
            .push(SourceEntry::File(file));
    }

    pub fn add_failing_dir(self: &Arc<Self>, name: &str) {
        self.children
            .lock()
            .unwrap()
            .push(SourceEntry::Directory(TestFailingDirectory::new(name)));
    }

    pub fn add_error_entry(self: &Arc<Self>, name: &str, message: &str) {
        let entry = Arc::new(StaticErrorEntry::io_error(
            test_meta(name, 0, test_time(), 0),
            message,
        ));
        self.children.lock().unwrap().push(SourceEntry::Error(entry));
    }

    pub fn add_unknown_entry(self: &Arc<Self>, name: &str) {
        let entry = Arc::new(StaticErrorEntry::unknown_type(test_meta(
            name,
            0,
            test_time(),
            0,
        )));
        self.children.lock().unwrap().push(SourceEntry::Error(entry));
    }
}

impl EntryInfo for TestDirectory {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

impl DirectorySource for TestDirectory {
    fn read_dir(&self) -> Result<Vec<SourceEntry>> {
        let mut children = self.children.lock().unwrap().clone();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(children)
    }
}

/// Gate installed on a [`TestFile`] to coordinate checkpoint tests: the
/// reader signals when the file is opened, then blocks until released.
pub struct ReadGate {
    pub reached: crossbeam_channel::Sender<()>,
    pub release: crossbeam_channel::Receiver<()>,
}

pub struct TestFile {
    meta: EntryMeta,
    content: Vec<u8>,
    open_gate: Mutex<Option<ReadGate>>,
}

impl TestFile {
    /// Make the next `open` block after signaling `reached`, until
    /// `release` yields.
    pub fn install_gate(&self, gate: ReadGate) {
        *self.open_gate.lock().unwrap() = Some(gate);
    }
}

impl EntryInfo for TestFile {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

impl FileSource for TestFile {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        if let Some(gate) = self.open_gate.lock().unwrap().take() {
            let _ = gate.reached.send(());
            let _ = gate.release.recv();
        }
        Ok(Box::new(Cursor::new(self.content.clone())))
    }
}

/// File source that exposes a pre-computed directory entry instead of
/// content, like a shallow placeholder produced by a previous restore.
pub struct TestPlaceholderFile {
    meta: EntryMeta,
    dir_entry: crate::snapshot::entry::DirEntry,
}

impl EntryInfo for TestPlaceholderFile {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    fn dir_entry_or_nil(&self) -> Result<Option<crate::snapshot::entry::DirEntry>> {
        Ok(Some(self.dir_entry.clone()))
    }
}

impl FileSource for TestPlaceholderFile {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Err(CairnError::Other(
            "placeholder files have no content to open".into(),
        ))
    }
}

/// Directory whose listing always fails.
pub struct TestFailingDirectory {
    meta: EntryMeta,
}

impl TestFailingDirectory {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            meta: test_meta(name, 0, test_time(), 0o755),
        })
    }
}

impl EntryInfo for TestFailingDirectory {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

impl DirectorySource for TestFailingDirectory {
    fn read_dir(&self) -> Result<Vec<SourceEntry>> {
        Err(CairnError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "permission denied",
        )))
    }
}

pub struct TestSymlink {
    meta: EntryMeta,
    target: String,
}

impl EntryInfo for TestSymlink {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

impl SymlinkSource for TestSymlink {
    fn read_link(&self) -> Result<String> {
        Ok(self.target.clone())
    }
}

pub struct TestStreamingFile {
    meta: EntryMeta,
    content: Vec<u8>,
}

impl EntryInfo for TestStreamingFile {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

impl StreamingFileSource for TestStreamingFile {
    fn get_reader(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.content.clone())))
    }
}
