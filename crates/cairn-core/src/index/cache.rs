//! Local cache of committed index blobs.
//!
//! The committed content index never re-downloads an index blob it has seen:
//! blobs are persisted here and opened on demand. The disk backend writes
//! atomically (temp file + rename) and memory-maps files on open so lookups
//! touch only the pages the binary search visits; the memory backend backs
//! tests and cache-less configurations.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cairn_types::blob_id::BlobId;
use memmap2::Mmap;
use tracing::{debug, warn};

use crate::error::Result;

use super::format::PackIndex;

const INDEX_CACHE_EXTENSION: &str = "ndx";

/// Storage backend for cached index blobs.
pub trait IndexBlobCache: Send + Sync {
    /// Whether the blob is already cached.
    fn has(&self, blob_id: &BlobId) -> Result<bool>;

    /// Persist a blob. Overwrites any previous copy.
    fn add(&self, blob_id: &BlobId, data: &[u8]) -> Result<()>;

    /// Open a cached blob as a pack index.
    fn open_index(&self, blob_id: &BlobId) -> Result<Arc<PackIndex>>;

    /// Drop cached blobs not listed in `keep`.
    fn expire_unused(&self, keep: &[BlobId]) -> Result<()>;
}

/// On-disk cache: one file per index blob under a cache directory,
/// memory-mapped on open.
pub struct DiskIndexCache {
    dir: PathBuf,
}

impl DiskIndexCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn blob_path(&self, blob_id: &BlobId) -> PathBuf {
        self.dir
            .join(format!("{blob_id}.{INDEX_CACHE_EXTENSION}"))
    }
}

impl IndexBlobCache for DiskIndexCache {
    fn has(&self, blob_id: &BlobId) -> Result<bool> {
        Ok(self.blob_path(blob_id).exists())
    }

    fn add(&self, blob_id: &BlobId, data: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let path = self.blob_path(blob_id);
        let tmp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        // Atomic rename into place.
        fs::rename(&tmp_path, &path)?;

        debug!(%blob_id, bytes = data.len(), "cached index blob");
        Ok(())
    }

    fn open_index(&self, blob_id: &BlobId) -> Result<Arc<PackIndex>> {
        let file = fs::File::open(self.blob_path(blob_id))?;

        // SAFETY: files are written atomically (temp + rename), so a mapped
        // file is always a complete index blob and is never mutated in place.
        let mmap = unsafe { Mmap::map(&file) }?;

        Ok(Arc::new(PackIndex::open(Box::new(mmap))?))
    }

    fn expire_unused(&self, keep: &[BlobId]) -> Result<()> {
        let keep: HashSet<&str> = keep.iter().map(|b| b.as_str()).collect();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = Path::new(&name)
                .file_stem()
                .and_then(|s| s.to_str())
            else {
                continue;
            };

            if !keep.contains(stem) {
                debug!(blob_id = stem, "expiring unused index blob");
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(blob_id = stem, error = %e, "unable to expire index blob");
                }
            }
        }

        Ok(())
    }
}

/// In-memory cache used when no cache directory is configured and by tests.
#[derive(Default)]
pub struct MemoryIndexCache {
    contents: Mutex<HashMap<BlobId, Vec<u8>>>,
}

impl MemoryIndexCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexBlobCache for MemoryIndexCache {
    fn has(&self, blob_id: &BlobId) -> Result<bool> {
        Ok(self.contents.lock().unwrap().contains_key(blob_id))
    }

    fn add(&self, blob_id: &BlobId, data: &[u8]) -> Result<()> {
        self.contents
            .lock()
            .unwrap()
            .insert(blob_id.clone(), data.to_vec());
        Ok(())
    }

    fn open_index(&self, blob_id: &BlobId) -> Result<Arc<PackIndex>> {
        let data = self
            .contents
            .lock()
            .unwrap()
            .get(blob_id)
            .cloned()
            .ok_or_else(|| {
                crate::error::CairnError::Storage(format!("index blob not cached: {blob_id}"))
            })?;
        Ok(Arc::new(PackIndex::open(Box::new(data))?))
    }

    fn expire_unused(&self, keep: &[BlobId]) -> Result<()> {
        let keep: HashSet<&BlobId> = keep.iter().collect();
        self.contents
            .lock()
            .unwrap()
            .retain(|id, _| keep.contains(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Builder, ContentInfo, IdRange};
    use cairn_types::content_id::ContentId;

    fn index_bytes(ids: &[&str]) -> Vec<u8> {
        let mut b = Builder::new();
        for id in ids {
            b.add(ContentInfo {
                content_id: ContentId::parse(id).unwrap(),
                timestamp_seconds: 1,
                pack_blob_id: BlobId::from("p0"),
                pack_offset: 0,
                original_length: 1,
                packed_length: 1,
                compression_header_id: 0,
                format_version: 1,
                encryption_key_id: 0,
                deleted: false,
            });
        }
        let mut buf = Vec::new();
        b.build(&mut buf).unwrap();
        buf
    }

    #[test]
    fn disk_cache_roundtrip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskIndexCache::new(dir.path().join("indexes"));

        let keep_id = BlobId::from("n01");
        let drop_id = BlobId::from("n02");

        assert!(!cache.has(&keep_id).unwrap());
        cache.add(&keep_id, &index_bytes(&["aabbcc"])).unwrap();
        cache.add(&drop_id, &index_bytes(&["ddeeff"])).unwrap();
        assert!(cache.has(&keep_id).unwrap());
        assert!(cache.has(&drop_id).unwrap());

        let ndx = cache.open_index(&keep_id).unwrap();
        assert_eq!(ndx.approximate_count(), 1);
        let mut seen = Vec::new();
        ndx.iterate(&IdRange::all(), &mut |i| {
            seen.push(i.content_id.to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["aabbcc"]);

        cache.expire_unused(&[keep_id.clone()]).unwrap();
        assert!(cache.has(&keep_id).unwrap());
        assert!(!cache.has(&drop_id).unwrap());
    }

    #[test]
    fn disk_cache_expire_on_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskIndexCache::new(dir.path().join("never-created"));
        cache.expire_unused(&[]).unwrap();
    }

    #[test]
    fn memory_cache_roundtrip_and_expiry() {
        let cache = MemoryIndexCache::new();
        let id = BlobId::from("n01");

        assert!(!cache.has(&id).unwrap());
        cache.add(&id, &index_bytes(&["aabbcc"])).unwrap();
        assert!(cache.has(&id).unwrap());
        assert_eq!(cache.open_index(&id).unwrap().approximate_count(), 1);

        cache.expire_unused(&[]).unwrap();
        assert!(!cache.has(&id).unwrap());
        assert!(cache.open_index(&id).is_err());
    }
}
