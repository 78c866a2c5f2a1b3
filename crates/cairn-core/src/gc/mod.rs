//! Snapshot garbage collection: mark contents reachable from live
//! snapshots, then sweep the content registry — deleting unreferenced
//! contents old enough to be safe, and undeleting referenced contents that
//! an earlier run marked deleted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use cairn_types::content_id::ContentId;
use chrono::Duration;
use tracing::{debug, info};

use crate::error::{CairnError, Result};
use crate::repo::{IterateOptions, MaintenanceRepository, MANIFEST_CONTENT_PREFIX};
use crate::snapshot::entry::{DirEntry, DirManifest, DIRECTORY_STREAM_TYPE};

/// Flush cadence while deleting unused contents.
const DELETE_FLUSH_EVERY: u32 = 100_000;

/// Parallelism of the mark phase across snapshot trees.
const TREE_WALK_PARALLELISM: usize = 4;

/// Safety limits protecting concurrent writers from garbage collection.
#[derive(Debug, Clone, Copy)]
pub struct SafetyParameters {
    /// Minimum content age before an unreferenced content may be deleted.
    /// Protects contents written by uploads whose snapshot manifests have
    /// not been published yet.
    pub min_content_age_subject_to_gc: Duration,
}

impl SafetyParameters {
    /// Production defaults.
    pub fn full() -> Self {
        Self {
            min_content_age_subject_to_gc: Duration::hours(24),
        }
    }

    /// No safety margin. Only sensible when nothing else writes to the
    /// repository.
    pub fn none() -> Self {
        Self {
            min_content_age_subject_to_gc: Duration::zero(),
        }
    }
}

impl Default for SafetyParameters {
    fn default() -> Self {
        Self::full()
    }
}

/// Per-bucket counters reported by one GC run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub unused_count: u32,
    pub unused_bytes: i64,
    pub in_use_count: u32,
    pub in_use_bytes: i64,
    pub system_count: u32,
    pub system_bytes: i64,
    pub too_recent_count: u32,
    pub too_recent_bytes: i64,
    pub undeleted_count: u32,
    pub undeleted_bytes: i64,
}

/// Concurrency-safe `(count, total_bytes)` accumulator.
#[derive(Default)]
struct CountSum {
    count: AtomicU32,
    sum: AtomicI64,
}

impl CountSum {
    fn add(&self, bytes: i64) -> (u32, i64) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        let sum = self.sum.fetch_add(bytes, Ordering::Relaxed) + bytes;
        (count, sum)
    }

    fn totals(&self) -> (u32, i64) {
        (
            self.count.load(Ordering::Relaxed),
            self.sum.load(Ordering::Relaxed),
        )
    }
}

/// Run garbage collection over every snapshot in the repository.
///
/// With `gc_delete` unset this is a dry run: unused contents are counted
/// and a [`CairnError::WouldDelete`] surfaces the intent.
pub fn run(
    repo: &dyn MaintenanceRepository,
    gc_delete: bool,
    safety: SafetyParameters,
) -> Result<GcStats> {
    let mut used = Mutex::new(HashSet::new());

    find_in_use_content_ids(repo, &used)?;

    let used = used.get_mut().unwrap();
    info!(referenced = used.len(), "looking for unreferenced contents");

    sweep(repo, used, gc_delete, safety)
}

/// Mark phase: walk every live snapshot tree, collecting the content IDs
/// each object reads through.
fn find_in_use_content_ids(
    repo: &dyn MaintenanceRepository,
    used: &Mutex<HashSet<ContentId>>,
) -> Result<()> {
    let ids = repo.list_snapshot_manifests()?;
    let mut roots = Vec::new();
    for id in &ids {
        let manifest = repo.load_snapshot(id)?;
        if let Some(root) = manifest.root_entry {
            roots.push(root);
        }
    }

    info!(snapshots = roots.len(), "looking for active contents");

    let workers = TREE_WALK_PARALLELISM.min(roots.len().max(1));
    let chunk_size = roots.len().div_ceil(workers).max(1);

    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for chunk in roots.chunks(chunk_size) {
            handles.push(scope.spawn(move || -> Result<()> {
                for root in chunk {
                    walk_tree(repo, root, used)?;
                }
                Ok(())
            }));
        }

        let mut first_err = None;
        for handle in handles {
            if let Err(e) = handle.join().expect("tree walker panicked") {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}

/// Expand one directory entry: mark its object's contents and recurse into
/// directory manifests.
fn walk_tree(
    repo: &dyn MaintenanceRepository,
    entry: &DirEntry,
    used: &Mutex<HashSet<ContentId>>,
) -> Result<()> {
    let content_ids = repo.verify_object(&entry.object_id)?;
    {
        let mut used = used.lock().unwrap();
        for id in content_ids {
            used.insert(id);
        }
    }

    if !entry.is_dir() {
        return Ok(());
    }

    let data = repo.open_object(&entry.object_id)?;
    let manifest: DirManifest = serde_json::from_slice(&data)?;
    if manifest.stream_type != DIRECTORY_STREAM_TYPE {
        return Err(CairnError::Other(format!(
            "unsupported directory stream type: '{}'",
            manifest.stream_type
        )));
    }

    for child in &manifest.entries {
        walk_tree(repo, child, used)?;
    }

    Ok(())
}

fn sweep(
    repo: &dyn MaintenanceRepository,
    used: &HashSet<ContentId>,
    gc_delete: bool,
    safety: SafetyParameters,
) -> Result<GcStats> {
    let unused = CountSum::default();
    let in_use = CountSum::default();
    let system = CountSum::default();
    let too_recent = CountSum::default();
    let undeleted = CountSum::default();

    let now = repo.time();

    // Deleted contents are included so referenced ones can be recovered.
    let iterate_result = repo.iterate_contents(
        IterateOptions {
            include_deleted: true,
        },
        &mut |ci| {
            if ci.content_id.prefix() == Some(MANIFEST_CONTENT_PREFIX) {
                system.add(i64::from(ci.packed_length));
                return Ok(());
            }

            if used.contains(&ci.content_id) {
                if ci.deleted {
                    repo.undelete_content(&ci.content_id).map_err(|e| {
                        CairnError::Other(format!(
                            "could not undelete referenced content {}: {e}",
                            ci.content_id
                        ))
                    })?;
                    undeleted.add(i64::from(ci.packed_length));
                }

                in_use.add(i64::from(ci.packed_length));
                return Ok(());
            }

            if now - ci.timestamp() < safety.min_content_age_subject_to_gc {
                debug!(
                    content_id = %ci.content_id,
                    bytes = ci.packed_length,
                    modified = %ci.timestamp(),
                    "recent unreferenced content"
                );
                too_recent.add(i64::from(ci.packed_length));
                return Ok(());
            }

            debug!(
                content_id = %ci.content_id,
                bytes = ci.packed_length,
                modified = %ci.timestamp(),
                "unreferenced"
            );
            let (count, total) = unused.add(i64::from(ci.packed_length));

            if gc_delete {
                repo.delete_content(&ci.content_id)?;
            }

            if count % DELETE_FLUSH_EVERY == 0 {
                info!(count, total_bytes = total, "found unused contents so far");
                if gc_delete {
                    repo.flush()?;
                }
            }

            Ok(())
        },
    );

    let mut stats = GcStats::default();
    (stats.unused_count, stats.unused_bytes) = unused.totals();
    (stats.in_use_count, stats.in_use_bytes) = in_use.totals();
    (stats.system_count, stats.system_bytes) = system.totals();
    (stats.too_recent_count, stats.too_recent_bytes) = too_recent.totals();
    (stats.undeleted_count, stats.undeleted_bytes) = undeleted.totals();

    iterate_result?;

    if stats.unused_count > 0 && !gc_delete {
        return Err(CairnError::WouldDelete {
            count: stats.unused_count,
            bytes: stats.unused_bytes,
        });
    }

    repo.flush()?;
    Ok(stats)
}
