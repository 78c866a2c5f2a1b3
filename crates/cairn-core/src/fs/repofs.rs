//! Repository-backed sources: previous snapshot trees opened as source
//! entries. Each entry exposes the object ID it was uploaded under, which
//! is what lets the uploader reuse unchanged entries without re-hashing.

use std::io::{Cursor, Read};
use std::sync::Arc;

use cairn_types::object_id::ObjectId;

use crate::error::{CairnError, Result};
use crate::repo::RepositoryWriter;
use crate::snapshot::entry::{DirEntry, DirManifest, EntryType, DIRECTORY_STREAM_TYPE};
use crate::snapshot::SnapshotManifest;

use super::{
    DirectorySource, EntryInfo, EntryMeta, FileSource, Owner, SourceEntry, SymlinkSource,
};

/// Open a snapshot manifest's root as a source entry, when it has one.
pub fn snapshot_root(
    repo: &Arc<dyn RepositoryWriter>,
    manifest: &SnapshotManifest,
) -> Option<SourceEntry> {
    let root = manifest.root_entry.as_ref()?;
    Some(entry_from_dir_entry(repo, root))
}

/// Materialize one stored directory entry as a source entry.
pub fn entry_from_dir_entry(repo: &Arc<dyn RepositoryWriter>, de: &DirEntry) -> SourceEntry {
    let meta = meta_from_dir_entry(de);
    let repo = Arc::clone(repo);
    let object_id = de.object_id.clone();

    match de.entry_type {
        EntryType::Directory => SourceEntry::Directory(Arc::new(StoredDirectory {
            repo,
            meta,
            object_id,
        })),
        EntryType::File => SourceEntry::File(Arc::new(StoredFile {
            repo,
            meta,
            object_id,
        })),
        EntryType::Symlink => SourceEntry::Symlink(Arc::new(StoredSymlink {
            repo,
            meta,
            object_id,
        })),
    }
}

fn meta_from_dir_entry(de: &DirEntry) -> EntryMeta {
    EntryMeta {
        name: de.name.clone(),
        mode: de.permissions,
        size: de.size,
        mod_time: de.mod_time,
        owner: Owner {
            uid: de.uid,
            gid: de.gid,
        },
    }
}

/// A directory stored in the repository as a directory manifest.
pub struct StoredDirectory {
    repo: Arc<dyn RepositoryWriter>,
    meta: EntryMeta,
    object_id: ObjectId,
}

impl EntryInfo for StoredDirectory {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    fn object_id(&self) -> Option<ObjectId> {
        Some(self.object_id.clone())
    }
}

impl DirectorySource for StoredDirectory {
    fn read_dir(&self) -> Result<Vec<SourceEntry>> {
        let data = self.repo.open_object(&self.object_id)?;
        let manifest: DirManifest = serde_json::from_slice(&data)?;

        if manifest.stream_type != DIRECTORY_STREAM_TYPE {
            return Err(CairnError::Other(format!(
                "unsupported directory stream type: '{}'",
                manifest.stream_type
            )));
        }

        Ok(manifest
            .entries
            .iter()
            .map(|de| entry_from_dir_entry(&self.repo, de))
            .collect())
    }
}

/// A file stored in the repository as a content-addressed object.
pub struct StoredFile {
    repo: Arc<dyn RepositoryWriter>,
    meta: EntryMeta,
    object_id: ObjectId,
}

impl EntryInfo for StoredFile {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    fn object_id(&self) -> Option<ObjectId> {
        Some(self.object_id.clone())
    }
}

impl FileSource for StoredFile {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let data = self.repo.open_object(&self.object_id)?;
        Ok(Box::new(Cursor::new(data)))
    }
}

/// A symlink whose target bytes are stored as an object.
pub struct StoredSymlink {
    repo: Arc<dyn RepositoryWriter>,
    meta: EntryMeta,
    object_id: ObjectId,
}

impl EntryInfo for StoredSymlink {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    fn object_id(&self) -> Option<ObjectId> {
        Some(self.object_id.clone())
    }
}

impl SymlinkSource for StoredSymlink {
    fn read_link(&self) -> Result<String> {
        let data = self.repo.open_object(&self.object_id)?;
        String::from_utf8(data)
            .map_err(|_| CairnError::Other("symlink target is not UTF-8".into()))
    }
}
