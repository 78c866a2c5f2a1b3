//! Committed content index: the registry of currently active pack indexes.
//!
//! The uploader consults this to resolve contents and the garbage collector
//! scans it; `use_index_files` atomically replaces the active merged set
//! whenever the repository's index blob list changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use cairn_types::blob_id::BlobId;
use cairn_types::content_id::ContentId;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::Result;

use super::cache::IndexBlobCache;
use super::format::PackIndex;
use super::merged::MergedIndex;
use super::{Builder, ContentInfo, IdRange};

/// Indexes with fewer entries than this are combined into a single
/// in-memory index, reducing the number of segments consulted per lookup.
const SMALL_INDEX_ENTRY_COUNT_THRESHOLD: usize = 100;

/// Fixed parallelism of `fetch_index_blobs`.
const PARALLEL_FETCHES: usize = 4;

struct State {
    deletion_watermark: DateTime<Utc>,
    in_use: HashMap<BlobId, Arc<PackIndex>>,
    merged: MergedIndex,
}

/// In-memory registry of the repository's active pack indexes.
///
/// A single mutex protects the active set and the deletion watermark;
/// `revision` is bumped with release semantics after every mutation so
/// readers that cache lookups can validate freshness. Replaced index
/// readers are closed when their last reference is dropped.
pub struct CommittedContentIndex {
    revision: AtomicI64,
    cache: Arc<dyn IndexBlobCache>,
    state: Mutex<State>,
}

impl CommittedContentIndex {
    pub fn new(cache: Arc<dyn IndexBlobCache>) -> Self {
        Self {
            revision: AtomicI64::new(0),
            cache,
            state: Mutex::new(State {
                deletion_watermark: DateTime::<Utc>::MIN_UTC,
                in_use: HashMap::new(),
                merged: MergedIndex::default(),
            }),
        }
    }

    /// Monotonically increasing counter, bumped after every mutation of the
    /// active set.
    pub fn revision(&self) -> i64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn deletion_watermark(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().deletion_watermark
    }

    /// Resolve one content ID through the merged view. A deleted entry whose
    /// timestamp is at or below the deletion watermark reads as not-found.
    pub fn get_content(&self, content_id: &ContentId) -> Result<Option<ContentInfo>> {
        let st = self.state.lock().unwrap();
        match st.merged.get_info(content_id)? {
            Some(info) if should_ignore(&info, st.deletion_watermark) => Ok(None),
            other => Ok(other),
        }
    }

    /// Persist an index blob in the cache and, when `use_index` is set, add
    /// it to the active set. Idempotent for repeated blob IDs. The revision
    /// is bumped after completion whether or not the call succeeded, so
    /// cached lookups made concurrently are invalidated either way.
    pub fn add_index_blob(&self, blob_id: &BlobId, data: &[u8], use_index: bool) -> Result<()> {
        let result = (|| {
            self.cache.add(blob_id, data)?;

            if !use_index {
                return Ok(());
            }

            let mut st = self.state.lock().unwrap();
            if st.in_use.contains_key(blob_id) {
                return Ok(());
            }

            debug!(%blob_id, "use-new-committed-index");

            let ndx = self.cache.open_index(blob_id)?;
            st.in_use.insert(blob_id.clone(), ndx.clone());
            st.merged.push(ndx);
            Ok(())
        })();

        self.revision.fetch_add(1, Ordering::Release);
        result
    }

    /// Replace the active set with exactly `index_files`, updating the
    /// deletion watermark. When the requested set equals the current one,
    /// only the watermark changes. Superseded cache entries are expired
    /// asynchronously.
    pub fn use_index_files(
        &self,
        index_files: &[BlobId],
        deletion_watermark: DateTime<Utc>,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.deletion_watermark = deletion_watermark;

        if !index_files_changed(&st.in_use, index_files) {
            return Ok(());
        }

        debug!(count = index_files.len(), "use-indexes");

        let mut in_use = HashMap::with_capacity(index_files.len());
        let mut opened = Vec::with_capacity(index_files.len());
        for blob_id in index_files {
            let ndx = self.cache.open_index(blob_id)?;
            in_use.insert(blob_id.clone(), ndx.clone());
            opened.push(ndx);
        }

        let combined = combine_small_indexes(opened)?;
        debug!(
            requested = index_files.len(),
            segments = combined.len(),
            "combined index segments"
        );

        self.revision.fetch_add(1, Ordering::Release);
        st.merged = MergedIndex::new(combined);
        st.in_use = in_use;
        drop(st);

        let cache = Arc::clone(&self.cache);
        let keep = index_files.to_vec();
        std::thread::spawn(move || {
            if let Err(e) = cache.expire_unused(&keep) {
                warn!(error = %e, "unable to expire unused index blobs");
            }
        });

        Ok(())
    }

    /// Iterate the merged view within `range`, suppressing entries hidden
    /// by the deletion watermark. The active set is snapshotted before the
    /// first callback, so long iterations do not hold the lock.
    pub fn list_contents(
        &self,
        range: &IdRange,
        cb: &mut dyn FnMut(ContentInfo) -> Result<()>,
    ) -> Result<()> {
        let (merged, watermark) = {
            let st = self.state.lock().unwrap();
            (st.merged.clone(), st.deletion_watermark)
        };

        merged.iterate(range, &mut |info| {
            if should_ignore(&info, watermark) {
                return Ok(());
            }
            cb(info)
        })
    }

    /// Download index blobs missing from the cache via `fetch_one`, with
    /// fixed parallelism. Any download error aborts the batch.
    pub fn fetch_index_blobs(
        &self,
        blob_ids: &[BlobId],
        fetch_one: &(dyn Fn(&BlobId) -> Result<Vec<u8>> + Sync),
    ) -> Result<()> {
        let mut missing = Vec::new();
        for blob_id in blob_ids {
            if !self.cache.has(blob_id)? {
                missing.push(blob_id.clone());
            }
        }

        if missing.is_empty() {
            return Ok(());
        }

        debug!(count = missing.len(), "downloading new index blobs");

        let (tx, rx) = crossbeam_channel::unbounded::<BlobId>();
        for blob_id in missing {
            tx.send(blob_id).expect("unbounded send");
        }
        drop(tx);

        let abort = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            let mut workers = Vec::with_capacity(PARALLEL_FETCHES);
            for _ in 0..PARALLEL_FETCHES {
                let rx = rx.clone();
                let abort = &abort;
                workers.push(scope.spawn(move || -> Result<()> {
                    for blob_id in rx.iter() {
                        if abort.load(Ordering::Relaxed) {
                            return Ok(());
                        }
                        let data = match fetch_one(&blob_id) {
                            Ok(data) => data,
                            Err(e) => {
                                abort.store(true, Ordering::Relaxed);
                                return Err(e);
                            }
                        };
                        self.add_index_blob(&blob_id, &data, false)?;
                    }
                    Ok(())
                }));
            }

            let mut first_err = None;
            for worker in workers {
                if let Err(e) = worker.join().expect("fetch worker panicked") {
                    first_err.get_or_insert(e);
                }
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}

fn should_ignore(info: &ContentInfo, deletion_watermark: DateTime<Utc>) -> bool {
    info.deleted && info.timestamp() <= deletion_watermark
}

fn index_files_changed(in_use: &HashMap<BlobId, Arc<PackIndex>>, index_files: &[BlobId]) -> bool {
    if index_files.len() != in_use.len() {
        return true;
    }
    index_files.iter().any(|f| !in_use.contains_key(f))
}

/// Merge every index with fewer than 100 entries into one in-memory index,
/// passing large indexes through untouched. A no-op when at most one index
/// is small.
fn combine_small_indexes(indexes: Vec<Arc<PackIndex>>) -> Result<Vec<Arc<PackIndex>>> {
    let (small, mut keep): (Vec<_>, Vec<_>) = indexes
        .into_iter()
        .partition(|n| n.approximate_count() < SMALL_INDEX_ENTRY_COUNT_THRESHOLD);

    if small.len() <= 1 {
        keep.extend(small);
        return Ok(keep);
    }

    let mut builder = Builder::new();
    for ndx in &small {
        ndx.iterate(&IdRange::all(), &mut |info| {
            builder.add(info);
            Ok(())
        })?;
    }

    let mut buf = Vec::new();
    builder.build(&mut buf)?;
    keep.push(Arc::new(PackIndex::open(Box::new(buf))?));
    Ok(keep)
}
