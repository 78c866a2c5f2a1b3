//! Snapshot uploader: walks a source tree, hashes file contents through
//! object writers, assembles directory manifests bottom-up, reuses entries
//! from previous snapshots, and periodically checkpoints long uploads so
//! interrupted runs resume from partial state.

pub mod checkpoint;
pub mod dir_builder;
mod estimate;
pub mod workpool;

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cairn_types::object_id::ObjectId;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::actions::{ActionPhase, ActionRunner};
use crate::error::{CairnError, Result};
use crate::fs::{
    find_by_name, ignorefs, metadata_equals, repofs, DirectorySource, EntryMeta, FileSource,
    SourceEntry, StreamingFileSource, SymlinkSource,
};
use crate::policy::{ActionCommand, LogDetail, Policy, PolicyTree};
use crate::progress::{NullUploadProgress, UploadProgress};
use crate::repo::{ObjectWriter, RepositoryWriter, WriterOptions, OBJECT_PREFIX_DIRECTORY};
use crate::snapshot::entry::{DirEntry, DirManifest, DirectorySummary, EntryType};
use crate::snapshot::{IncompleteReason, SnapshotManifest, SourceInfo, Stats};

use self::checkpoint::{checkpoint_error, CheckpointRegistry, RegistrationGuard};
use self::dir_builder::DirManifestBuilder;
use self::workpool::{AsyncGroup, WorkerPool};

/// Default frequency of mid-upload checkpointing.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(45 * 60);

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Minimal log-detail levels that unlock particular log fields.
const MIN_DETAIL_LEVEL_SIZE: LogDetail = LogDetail(3);
const MIN_DETAIL_LEVEL_DIR_STATS: LogDetail = LogDetail(5);

type TickerFactory = Box<dyn Fn(Duration) -> Receiver<Instant> + Send + Sync>;

#[derive(Default)]
struct UploadCounters {
    total_file_size: AtomicI64,
    excluded_total_file_size: AtomicI64,
    total_file_count: AtomicI32,
    cached_files: AtomicI32,
    non_cached_files: AtomicI32,
    total_directory_count: AtomicI32,
    excluded_file_count: AtomicI32,
    excluded_dir_count: AtomicI32,
    ignored_error_count: AtomicI32,
    error_count: AtomicI32,
}

impl UploadCounters {
    fn snapshot(&self) -> Stats {
        Stats {
            total_file_size: self.total_file_size.load(Ordering::Relaxed),
            excluded_total_file_size: self.excluded_total_file_size.load(Ordering::Relaxed),
            total_file_count: self.total_file_count.load(Ordering::Relaxed),
            cached_files: self.cached_files.load(Ordering::Relaxed),
            non_cached_files: self.non_cached_files.load(Ordering::Relaxed),
            total_directory_count: self.total_directory_count.load(Ordering::Relaxed),
            excluded_file_count: self.excluded_file_count.load(Ordering::Relaxed),
            excluded_dir_count: self.excluded_dir_count.load(Ordering::Relaxed),
            ignored_error_count: self.ignored_error_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total_file_size.store(0, Ordering::Relaxed);
        self.excluded_total_file_size.store(0, Ordering::Relaxed);
        self.total_file_count.store(0, Ordering::Relaxed);
        self.cached_files.store(0, Ordering::Relaxed);
        self.non_cached_files.store(0, Ordering::Relaxed);
        self.total_directory_count.store(0, Ordering::Relaxed);
        self.excluded_file_count.store(0, Ordering::Relaxed);
        self.excluded_dir_count.store(0, Ordering::Relaxed);
        self.ignored_error_count.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
    }
}

/// Mutable state shared by every thread participating in one upload.
#[derive(Default)]
struct UploadShared {
    canceled: AtomicBool,
    total_written_bytes: AtomicI64,
    counters: UploadCounters,
}

impl UploadShared {
    fn incomplete_reason(&self, max_upload_bytes: i64) -> Option<IncompleteReason> {
        if self.canceled.load(Ordering::Acquire) {
            return Some(IncompleteReason::Canceled);
        }

        let written = self.total_written_bytes.load(Ordering::Acquire);
        if max_upload_bytes > 0 && written > max_upload_bytes {
            return Some(IncompleteReason::LimitReached);
        }

        None
    }
}

/// Uploads filesystem trees to a repository as snapshots.
pub struct Uploader {
    pub progress: Arc<dyn UploadProgress>,

    /// Automatically cancel the upload after this many written bytes (0 = off).
    pub max_upload_bytes: i64,

    /// Probability in [0, 100] of discarding an incremental cache hit so the
    /// entry is re-hashed.
    pub force_hash_percentage: f64,

    /// Requested number of parallel file reads; clamped by policy and CPUs.
    pub parallel_uploads: usize,

    /// Run policy-defined folder and snapshot-root actions.
    pub enable_actions: bool,

    pub override_dir_log_detail: Option<LogDetail>,
    pub override_entry_log_detail: Option<LogDetail>,

    /// Fail the entire snapshot on the first non-ignored error.
    pub fail_fast: bool,

    pub checkpoint_interval: Duration,

    /// When set, policy ignore rules are not applied.
    pub disable_ignore_rules: bool,

    pub actions: Option<Arc<dyn ActionRunner>>,

    repo: Arc<dyn RepositoryWriter>,
    shared: Arc<UploadShared>,

    pub(crate) ticker: TickerFactory,
    /// Test hook: signaled after every completed checkpoint.
    pub(crate) checkpoint_finished: Option<Sender<()>>,
    pub(crate) disable_estimation: bool,
}

impl Uploader {
    pub fn new(repo: Arc<dyn RepositoryWriter>) -> Self {
        Self {
            progress: Arc::new(NullUploadProgress),
            max_upload_bytes: 0,
            force_hash_percentage: 0.0,
            parallel_uploads: 0,
            enable_actions: false,
            override_dir_log_detail: None,
            override_entry_log_detail: None,
            fail_fast: false,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            disable_ignore_rules: false,
            actions: None,
            repo,
            shared: Arc::new(UploadShared::default()),
            ticker: Box::new(crossbeam_channel::tick),
            checkpoint_finished: None,
            disable_estimation: false,
        }
    }

    /// Request cancellation. The upload stops cooperatively and publishes an
    /// incomplete snapshot.
    pub fn cancel(&self) {
        self.shared.canceled.store(true, Ordering::Release);
    }

    /// True once the upload has been canceled, either explicitly or by
    /// exceeding the byte budget. Monotonic for the lifetime of the upload.
    pub fn is_canceled(&self) -> bool {
        self.shared.incomplete_reason(self.max_upload_bytes).is_some()
    }

    /// Upload `source` and return its snapshot manifest. Previous manifests
    /// of the same source enable the incremental cache.
    pub fn upload(
        &self,
        source: SourceEntry,
        policy_tree: &Arc<PolicyTree>,
        source_info: SourceInfo,
        previous_manifests: &[SnapshotManifest],
    ) -> Result<SnapshotManifest> {
        self.progress.upload_started();
        let result = self.upload_internal(source, policy_tree, source_info, previous_manifests);
        self.progress.upload_finished();
        result
    }

    fn upload_internal(
        &self,
        source: SourceEntry,
        policy_tree: &Arc<PolicyTree>,
        source_info: SourceInfo,
        previous_manifests: &[SnapshotManifest],
    ) -> Result<SnapshotManifest> {
        let parallel =
            effective_parallel_file_reads(self.parallel_uploads, policy_tree.effective());
        debug!(source = %source_info, parallel, "uploading");

        self.shared.counters.reset();
        self.shared.total_written_bytes.store(0, Ordering::Release);

        let ctx = Arc::new(UploadContext {
            repo: Arc::clone(&self.repo),
            progress: Arc::clone(&self.progress),
            shared: Arc::clone(&self.shared),
            pool: Arc::new(WorkerPool::new(parallel.saturating_sub(1))),
            actions: self.actions.clone(),
            max_upload_bytes: self.max_upload_bytes,
            force_hash_percentage: self.force_hash_percentage,
            enable_actions: self.enable_actions,
            fail_fast: self.fail_fast,
            disable_ignore_rules: self.disable_ignore_rules,
            override_dir_log_detail: self.override_dir_log_detail,
            override_entry_log_detail: self.override_entry_log_detail,
            parallel_uploads: self.parallel_uploads,
        });

        let start_time = self.repo.time();

        let root_entry = match source {
            SourceEntry::Directory(dir) => {
                let mut previous_dirs = Vec::new();
                for manifest in previous_manifests {
                    if let Some(SourceEntry::Directory(d)) =
                        repofs::snapshot_root(&self.repo, manifest)
                    {
                        previous_dirs.push(d);
                    }
                }
                let previous_dirs = unique_directories(previous_dirs);

                let estimator = if self.disable_estimation {
                    None
                } else {
                    let cancel = Arc::new(AtomicBool::new(false));
                    let scan_dir = wrap_ignorefs(&ctx, Arc::clone(&dir), policy_tree, false);
                    let progress = Arc::clone(&self.progress);
                    let cancel2 = Arc::clone(&cancel);
                    let handle = std::thread::spawn(move || {
                        let ds = estimate::scan_directory(&scan_dir, &cancel2);
                        progress.estimated_data_size(ds.num_files, ds.total_file_size);
                    });
                    Some((cancel, handle))
                };

                let wrapped = wrap_ignorefs(&ctx, dir, policy_tree, true);
                let result = upload_dir_with_checkpointing(
                    self,
                    &ctx,
                    wrapped,
                    policy_tree,
                    previous_dirs,
                    &source_info,
                );

                if let Some((cancel, handle)) = estimator {
                    cancel.store(true, Ordering::Relaxed);
                    let _ = handle.join();
                }

                result?
            }
            SourceEntry::File(file) => {
                self.progress.estimated_data_size(1, file.meta().size);
                upload_file_with_checkpointing(self, &ctx, file, policy_tree, &source_info)?
            }
            _ => {
                return Err(CairnError::Other(format!(
                    "unsupported source: {source_info}"
                )))
            }
        };

        ctx.pool.close();

        Ok(SnapshotManifest {
            id: None,
            source: source_info,
            start_time,
            end_time: self.repo.time(),
            root_entry: Some(root_entry),
            stats: self.shared.counters.snapshot(),
            incomplete_reason: ctx.incomplete_reason(),
        })
    }
}

/// Per-upload state captured by worker tasks and checkpoint callbacks.
struct UploadContext {
    repo: Arc<dyn RepositoryWriter>,
    progress: Arc<dyn UploadProgress>,
    shared: Arc<UploadShared>,
    pool: Arc<WorkerPool>,
    actions: Option<Arc<dyn ActionRunner>>,
    max_upload_bytes: i64,
    force_hash_percentage: f64,
    enable_actions: bool,
    fail_fast: bool,
    disable_ignore_rules: bool,
    override_dir_log_detail: Option<LogDetail>,
    override_entry_log_detail: Option<LogDetail>,
    parallel_uploads: usize,
}

impl UploadContext {
    fn incomplete_reason(&self) -> Option<IncompleteReason> {
        self.shared.incomplete_reason(self.max_upload_bytes)
    }

    fn is_canceled(&self) -> bool {
        self.incomplete_reason().is_some()
    }

    fn cancel(&self) {
        self.shared.canceled.store(true, Ordering::Release);
    }
}

fn effective_parallel_file_reads(parallel_uploads: usize, policy: &Policy) -> usize {
    let max = policy.upload.max_parallel_file_reads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
    });

    if parallel_uploads < 1 || parallel_uploads > max {
        max
    } else {
        parallel_uploads
    }
}

fn wrap_ignorefs(
    ctx: &Arc<UploadContext>,
    dir: Arc<dyn DirectorySource>,
    policy_tree: &Arc<PolicyTree>,
    report_stats: bool,
) -> Arc<dyn DirectorySource> {
    if ctx.disable_ignore_rules {
        return dir;
    }

    let ctx = Arc::clone(ctx);
    ignorefs::wrap(
        dir,
        Arc::clone(policy_tree),
        Arc::new(move |path: &str, entry: &SourceEntry| {
            if entry.is_dir() {
                debug!(path, "ignored directory");
                if report_stats {
                    ctx.progress.excluded_dir(path);
                    ctx.shared
                        .counters
                        .excluded_dir_count
                        .fetch_add(1, Ordering::Relaxed);
                }
            } else {
                debug!(path, "ignored");
                if report_stats {
                    ctx.progress.excluded_file(path, entry.meta().size);
                    ctx.shared
                        .counters
                        .excluded_file_count
                        .fetch_add(1, Ordering::Relaxed);
                    ctx.shared
                        .counters
                        .excluded_total_file_size
                        .fetch_add(entry.meta().size, Ordering::Relaxed);
                }
            }
        }),
    )
}

/// Drop duplicate previous directories that resolve to the same object.
fn unique_directories(dirs: Vec<Arc<dyn DirectorySource>>) -> Vec<Arc<dyn DirectorySource>> {
    if dirs.len() <= 1 {
        return dirs;
    }

    let mut unique: HashMap<ObjectId, Arc<dyn DirectorySource>> = HashMap::new();
    for dir in &dirs {
        if let Some(oid) = dir.object_id() {
            unique.insert(oid, Arc::clone(dir));
        }
    }

    if unique.len() == dirs.len() {
        dirs
    } else {
        unique.into_values().collect()
    }
}

// ---------------------------------------------------------------------------
// Periodic checkpointing
// ---------------------------------------------------------------------------

/// Stops the periodic checkpoint thread when dropped.
struct Checkpointer {
    shutdown: Option<Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn start_checkpointer(
    uploader: &Uploader,
    ctx: &Arc<UploadContext>,
    registry: &Arc<CheckpointRegistry>,
    prototype: SnapshotManifest,
) -> Checkpointer {
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let ticks = (uploader.ticker)(uploader.checkpoint_interval);
    let ctx = Arc::clone(ctx);
    let registry = Arc::clone(registry);
    let finished = uploader.checkpoint_finished.clone();

    let handle = std::thread::spawn(move || loop {
        crossbeam_channel::select! {
            recv(shutdown_rx) -> _ => return,
            recv(ticks) -> msg => {
                if msg.is_err() {
                    return;
                }
                if let Err(e) = checkpoint_root(&ctx, &registry, &prototype) {
                    warn!(error = %e, "error checkpointing");
                    ctx.cancel();
                    return;
                }
                if let Some(tx) = &finished {
                    let _ = tx.send(());
                }
            }
        }
    });

    Checkpointer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    }
}

/// Run the root checkpoint registry; when it produced a partial root entry,
/// save it as an incomplete snapshot manifest, apply retention, and flush.
fn checkpoint_root(
    ctx: &UploadContext,
    registry: &CheckpointRegistry,
    prototype: &SnapshotManifest,
) -> Result<()> {
    let builder = DirManifestBuilder::new();
    registry.run_checkpoints(&builder).map_err(checkpoint_error)?;

    let manifest = builder.build(ctx.repo.time(), None);
    if manifest.entries.is_empty() {
        // Nothing in flight; the tick is a no-op.
        return Ok(());
    }
    if manifest.entries.len() > 1 {
        return Err(CairnError::Other(format!(
            "produced more than one checkpoint: {}",
            manifest.entries.len()
        )));
    }

    let root_entry = manifest.entries[0].clone();
    debug!(oid = %root_entry.object_id, "checkpointed root");

    let mut man = prototype.clone();
    man.end_time = ctx.repo.time();
    man.start_time = man.end_time;
    man.root_entry = Some(root_entry);
    man.incomplete_reason = Some(IncompleteReason::Checkpoint);

    ctx.repo.save_snapshot(&man)?;
    ctx.repo.apply_retention(&man.source)?;
    ctx.repo.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Root-level uploads
// ---------------------------------------------------------------------------

fn upload_dir_with_checkpointing(
    uploader: &Uploader,
    ctx: &Arc<UploadContext>,
    root_dir: Arc<dyn DirectorySource>,
    policy_tree: &Arc<PolicyTree>,
    previous_dirs: Vec<Arc<dyn DirectorySource>>,
    source_info: &SourceInfo,
) -> Result<DirEntry> {
    let builder = Arc::new(DirManifestBuilder::new());
    let registry = Arc::new(CheckpointRegistry::new());

    let _checkpointer = start_checkpointer(
        uploader,
        ctx,
        &registry,
        SnapshotManifest::new(source_info.clone()),
    );

    let root_actions = policy_tree.effective().actions.clone();
    run_action(
        ctx,
        ActionPhase::BeforeSnapshotRoot,
        root_actions.before_snapshot_root.as_ref(),
        &source_info.path,
    )
    .map_err(|e| CairnError::DirectoryRead(Box::new(e)))?;

    let result = upload_dir_internal(
        ctx,
        root_dir,
        Arc::clone(policy_tree),
        previous_dirs,
        ".".to_string(),
        builder,
        registry,
    );

    run_action_logged(
        ctx,
        ActionPhase::AfterSnapshotRoot,
        root_actions.after_snapshot_root.as_ref(),
        &source_info.path,
    );

    result
}

fn upload_file_with_checkpointing(
    uploader: &Uploader,
    ctx: &Arc<UploadContext>,
    file: Arc<dyn FileSource>,
    policy_tree: &Arc<PolicyTree>,
    source_info: &SourceInfo,
) -> Result<DirEntry> {
    let mut async_writes = effective_parallel_file_reads(ctx.parallel_uploads, policy_tree.effective());
    if async_writes == 1 {
        async_writes = 0;
    }

    let registry = Arc::new(CheckpointRegistry::new());
    let _checkpointer = start_checkpointer(
        uploader,
        ctx,
        &registry,
        SnapshotManifest::new(source_info.clone()),
    );

    let identity = Arc::as_ptr(&file) as *const () as usize;
    let name = file.meta().name.clone();
    let de = upload_file_internal(
        ctx,
        &registry,
        identity,
        &name,
        &file,
        policy_tree.effective(),
        async_writes,
    )?;

    let summary = DirectorySummary {
        total_file_count: 1,
        total_file_size: de.size,
        max_mod_time: de.mod_time,
        ..Default::default()
    };

    Ok(DirEntry {
        dir_summary: Some(summary),
        ..de
    })
}

// ---------------------------------------------------------------------------
// Directory walk
// ---------------------------------------------------------------------------

fn upload_dir_internal(
    ctx: &Arc<UploadContext>,
    directory: Arc<dyn DirectorySource>,
    policy_tree: Arc<PolicyTree>,
    previous_dirs: Vec<Arc<dyn DirectorySource>>,
    dir_relative_path: String,
    this_builder: Arc<DirManifestBuilder>,
    this_checkpoint_registry: Arc<CheckpointRegistry>,
) -> Result<DirEntry> {
    ctx.shared
        .counters
        .total_directory_count
        .fetch_add(1, Ordering::Relaxed);
    let t0 = Instant::now();

    ctx.progress.started_directory(&dir_relative_path);
    let result = upload_dir_contents(
        ctx,
        &directory,
        &policy_tree,
        previous_dirs,
        &dir_relative_path,
        &this_builder,
        &this_checkpoint_registry,
    );
    ctx.progress.finished_directory(&dir_relative_path);

    let level = ctx
        .override_dir_log_detail
        .or(policy_tree.effective().logging.directories.snapshotted)
        .unwrap_or(LogDetail::NONE);
    maybe_log_entry_processed(
        level,
        "snapshotted directory",
        &dir_relative_path,
        result.as_ref().ok(),
        result.as_ref().err(),
        t0,
    );

    result
}

fn upload_dir_contents(
    ctx: &Arc<UploadContext>,
    directory: &Arc<dyn DirectorySource>,
    policy_tree: &Arc<PolicyTree>,
    previous_dirs: Vec<Arc<dyn DirectorySource>>,
    dir_relative_path: &str,
    this_builder: &Arc<DirManifestBuilder>,
    this_checkpoint_registry: &Arc<CheckpointRegistry>,
) -> Result<DirEntry> {
    let defined_actions = policy_tree
        .defined()
        .map(|p| p.actions.clone())
        .unwrap_or_default();

    run_action(
        ctx,
        ActionPhase::BeforeFolder,
        defined_actions.before_folder.as_ref(),
        dir_relative_path,
    )
    .map_err(|e| CairnError::DirectoryRead(Box::new(e)))?;

    let result = upload_dir_children(
        ctx,
        directory,
        policy_tree,
        previous_dirs,
        dir_relative_path,
        this_builder,
        this_checkpoint_registry,
    );

    run_action_logged(
        ctx,
        ActionPhase::AfterFolder,
        defined_actions.after_folder.as_ref(),
        dir_relative_path,
    );

    result
}

fn upload_dir_children(
    ctx: &Arc<UploadContext>,
    directory: &Arc<dyn DirectorySource>,
    policy_tree: &Arc<PolicyTree>,
    previous_dirs: Vec<Arc<dyn DirectorySource>>,
    dir_relative_path: &str,
    this_builder: &Arc<DirManifestBuilder>,
    this_checkpoint_registry: &Arc<CheckpointRegistry>,
) -> Result<DirEntry> {
    // Placeholder directories are adopted whole once their object verifies.
    if let Some(de) = directory.dir_entry_or_nil()? {
        ctx.repo
            .verify_object(&de.object_id)
            .map_err(|_| CairnError::InvalidPlaceholder(dir_relative_path.to_string()))?;
        return Ok(de);
    }

    let entries = directory
        .read_dir()
        .map_err(|e| CairnError::DirectoryRead(Box::new(e)))?;

    let mut prev_entries: Vec<Vec<SourceEntry>> = Vec::new();
    for prev_dir in &previous_dirs {
        match prev_dir.read_dir() {
            Ok(list) => prev_entries.push(list),
            Err(e) => warn!(error = %e, "unable to read previous directory entries"),
        }
    }

    let child_checkpoint_registry = Arc::new(CheckpointRegistry::new());

    // Checkpointing the parent snapshots this directory: clone the live
    // builder, fold in the children's partial state, and write a manifest
    // without disturbing the upload.
    let dir_identity = Arc::as_ptr(directory) as *const () as usize;
    let checkpoint_cb = {
        let ctx = Arc::clone(ctx);
        let builder = Arc::clone(this_builder);
        let child_registry = Arc::clone(&child_checkpoint_registry);
        let meta = directory.meta().clone();
        let rel = dir_relative_path.to_string();
        Box::new(move || -> Result<Option<DirEntry>> {
            let checkpoint_builder = builder.clone_state();
            child_registry.run_checkpoints(&checkpoint_builder)?;

            let manifest =
                checkpoint_builder.build(meta.mod_time, Some(IncompleteReason::Checkpoint));
            let oid = write_dir_manifest(&ctx, &rel, &manifest)?;
            Ok(Some(new_dir_entry_with_summary(
                &meta,
                EntryType::Directory,
                oid,
                manifest.summary,
            )))
        })
    };
    let _registration =
        RegistrationGuard::new(this_checkpoint_registry, dir_identity, checkpoint_cb);

    if let Err(e) = process_children(
        ctx,
        &child_checkpoint_registry,
        this_builder,
        dir_relative_path,
        &entries,
        policy_tree,
        &prev_entries,
    ) {
        if !e.is_canceled() {
            return Err(e);
        }
    }

    let manifest = this_builder.build(directory.meta().mod_time, ctx.incomplete_reason());
    let oid = write_dir_manifest(ctx, dir_relative_path, &manifest)?;
    Ok(new_dir_entry_with_summary(
        directory.meta(),
        EntryType::Directory,
        oid,
        manifest.summary,
    ))
}

#[allow(clippy::too_many_arguments)]
fn process_children(
    ctx: &Arc<UploadContext>,
    child_registry: &Arc<CheckpointRegistry>,
    parent_builder: &Arc<DirManifestBuilder>,
    dir_relative_path: &str,
    entries: &[SourceEntry],
    policy_tree: &Arc<PolicyTree>,
    prev_entries: &[Vec<SourceEntry>],
) -> Result<()> {
    let mut group: AsyncGroup<Result<()>> = AsyncGroup::new();

    // Subdirectories first, to seed checkpoint structure.
    if let Err(e) = process_subdirectories(
        ctx,
        child_registry,
        parent_builder,
        dir_relative_path,
        entries,
        policy_tree,
        prev_entries,
        &mut group,
    ) {
        if !e.is_canceled() {
            return Err(e);
        }
    }

    if let Err(e) = process_non_directories(
        ctx,
        child_registry,
        parent_builder,
        dir_relative_path,
        entries,
        policy_tree,
        prev_entries,
        &mut group,
    ) {
        if !e.is_canceled() {
            return Err(e);
        }
    }

    for result in group.wait() {
        result?;
    }

    if ctx.is_canceled() {
        return Err(CairnError::Canceled);
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_subdirectories(
    ctx: &Arc<UploadContext>,
    child_registry: &Arc<CheckpointRegistry>,
    parent_builder: &Arc<DirManifestBuilder>,
    dir_relative_path: &str,
    entries: &[SourceEntry],
    policy_tree: &Arc<PolicyTree>,
    prev_entries: &[Vec<SourceEntry>],
    group: &mut AsyncGroup<Result<()>>,
) -> Result<()> {
    for entry in entries {
        let SourceEntry::Directory(dir) = entry else {
            continue;
        };

        if ctx.is_canceled() {
            return Err(CairnError::Canceled);
        }

        let name = entry.name().to_string();
        let entry_relative_path = join_path(dir_relative_path, &name);

        let mut previous_sub_dirs = Vec::new();
        for prev in prev_entries {
            if let Some(SourceEntry::Directory(d)) = find_by_name(prev, &name) {
                previous_sub_dirs.push(Arc::clone(d));
            }
        }
        let previous_sub_dirs = unique_directories(previous_sub_dirs);

        let child_tree = policy_tree.child(&name);
        let child_builder = Arc::new(DirManifestBuilder::new());

        let task = {
            let ctx = Arc::clone(ctx);
            let dir = Arc::clone(dir);
            let parent_builder = Arc::clone(parent_builder);
            let child_registry = Arc::clone(child_registry);
            let rel = entry_relative_path;
            move || -> Result<()> {
                let ignore_dir_errors = child_tree
                    .effective()
                    .error_handling
                    .effective_ignore_directory_errors();

                match upload_dir_internal(
                    &ctx,
                    dir,
                    child_tree,
                    previous_sub_dirs,
                    rel.clone(),
                    child_builder,
                    child_registry,
                ) {
                    Ok(de) => {
                        parent_builder.add_entry(de);
                        Ok(())
                    }
                    Err(e) if e.is_canceled() => Err(e),
                    Err(e @ CairnError::DirectoryRead(_)) => {
                        // Only subdirectory read failures are recoverable; a
                        // snapshot whose root cannot be read would be an
                        // empty, unrestorable snapshot.
                        report_error_and_maybe_cancel(
                            &ctx,
                            e,
                            ignore_dir_errors,
                            &parent_builder,
                            &rel,
                        );
                        Ok(())
                    }
                    Err(e) => Err(CairnError::Other(format!(
                        "unable to process directory '{rel}': {e}"
                    ))),
                }
            }
        };

        if let Some(result) = group.run_or_inline(&ctx.pool, task) {
            result?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_non_directories(
    ctx: &Arc<UploadContext>,
    parent_checkpoint_registry: &Arc<CheckpointRegistry>,
    parent_builder: &Arc<DirManifestBuilder>,
    dir_relative_path: &str,
    entries: &[SourceEntry],
    policy_tree: &Arc<PolicyTree>,
    prev_entries: &[Vec<SourceEntry>],
    group: &mut AsyncGroup<Result<()>>,
) -> Result<()> {
    let worker_count = effective_parallel_file_reads(ctx.parallel_uploads, policy_tree.effective());

    // When there are fewer entries than workers, let each file spread its
    // writes across the idle capacity.
    let mut async_writes_per_file = 0;
    if !entries.is_empty() && entries.len() < worker_count {
        async_writes_per_file = worker_count / entries.len();
        if async_writes_per_file == 1 {
            async_writes_per_file = 0;
        }
    }

    for entry in entries {
        if entry.is_dir() {
            continue;
        }

        if ctx.is_canceled() {
            return Err(CairnError::Canceled);
        }

        let entry_relative_path = join_path(dir_relative_path, entry.name());
        let prev_matches: Vec<SourceEntry> = prev_entries
            .iter()
            .filter_map(|list| find_by_name(list, entry.name()).cloned())
            .collect();

        let task = {
            let ctx = Arc::clone(ctx);
            let entry = entry.clone();
            let parent_builder = Arc::clone(parent_builder);
            let registry = Arc::clone(parent_checkpoint_registry);
            let policy_tree = Arc::clone(policy_tree);
            move || -> Result<()> {
                process_single_non_directory(
                    &ctx,
                    &registry,
                    &parent_builder,
                    &policy_tree,
                    &entry,
                    &prev_matches,
                    &entry_relative_path,
                    async_writes_per_file,
                )
            }
        };

        if let Some(result) = group.run_or_inline(&ctx.pool, task) {
            result?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_single_non_directory(
    ctx: &Arc<UploadContext>,
    parent_checkpoint_registry: &Arc<CheckpointRegistry>,
    parent_builder: &Arc<DirManifestBuilder>,
    policy_tree: &Arc<PolicyTree>,
    entry: &SourceEntry,
    prev_matches: &[SourceEntry],
    entry_relative_path: &str,
    async_writes: usize,
) -> Result<()> {
    let t0 = Instant::now();
    let effective = policy_tree.effective();

    // Reuse the previous snapshot's entry when metadata is unchanged.
    if let Some(oid) = cached_object_id(ctx, entry, prev_matches, entry_relative_path) {
        ctx.shared
            .counters
            .cached_files
            .fetch_add(1, Ordering::Relaxed);
        ctx.shared
            .counters
            .total_file_size
            .fetch_add(entry.meta().size, Ordering::Relaxed);
        ctx.progress
            .cached_file(entry_relative_path, entry.meta().size);

        let de = new_dir_entry(
            entry.meta(),
            entry.entry_type().unwrap_or(EntryType::File),
            oid,
        );
        maybe_log_entry_processed(
            entry_log_level(ctx, effective.logging.entries.cache_hit),
            "cached",
            entry_relative_path,
            Some(&de),
            None,
            t0,
        );
        parent_builder.add_entry(de);
        return Ok(());
    }

    match entry {
        SourceEntry::File(f) => {
            ctx.shared
                .counters
                .non_cached_files
                .fetch_add(1, Ordering::Relaxed);

            let file_policy = policy_tree.child(entry.name());
            match upload_file_internal(
                ctx,
                parent_checkpoint_registry,
                entry.identity(),
                entry_relative_path,
                f,
                file_policy.effective(),
                async_writes,
            ) {
                Ok(de) => {
                    maybe_log_entry_processed(
                        entry_log_level(ctx, effective.logging.entries.snapshotted),
                        "snapshotted file",
                        entry_relative_path,
                        Some(&de),
                        None,
                        t0,
                    );
                    parent_builder.add_entry(de);
                }
                Err(e) => {
                    maybe_log_entry_processed(
                        entry_log_level(ctx, effective.logging.entries.snapshotted),
                        "snapshotted file",
                        entry_relative_path,
                        None,
                        Some(&e),
                        t0,
                    );
                    report_error_and_maybe_cancel(
                        ctx,
                        e,
                        effective.error_handling.effective_ignore_file_errors(),
                        parent_builder,
                        entry_relative_path,
                    );
                }
            }
            Ok(())
        }

        SourceEntry::Symlink(l) => {
            match upload_symlink_internal(ctx, entry_relative_path, l) {
                Ok(de) => {
                    maybe_log_entry_processed(
                        entry_log_level(ctx, effective.logging.entries.snapshotted),
                        "snapshotted symlink",
                        entry_relative_path,
                        Some(&de),
                        None,
                        t0,
                    );
                    parent_builder.add_entry(de);
                }
                Err(e) => {
                    report_error_and_maybe_cancel(
                        ctx,
                        e,
                        effective.error_handling.effective_ignore_file_errors(),
                        parent_builder,
                        entry_relative_path,
                    );
                }
            }
            Ok(())
        }

        SourceEntry::StreamingFile(sf) => {
            ctx.shared
                .counters
                .non_cached_files
                .fetch_add(1, Ordering::Relaxed);

            match upload_streaming_file_internal(ctx, entry_relative_path, sf) {
                Ok(de) => {
                    maybe_log_entry_processed(
                        entry_log_level(ctx, effective.logging.entries.snapshotted),
                        "snapshotted streaming file",
                        entry_relative_path,
                        Some(&de),
                        None,
                        t0,
                    );
                    parent_builder.add_entry(de);
                }
                Err(e) => {
                    report_error_and_maybe_cancel(
                        ctx,
                        e,
                        effective.error_handling.effective_ignore_file_errors(),
                        parent_builder,
                        entry_relative_path,
                    );
                }
            }
            Ok(())
        }

        SourceEntry::Error(err_entry) => {
            let info = err_entry.error_info();
            let (is_ignored, prefix) = if matches!(info, CairnError::UnknownEntryType) {
                (
                    effective.error_handling.effective_ignore_unknown_types(),
                    "unknown entry",
                )
            } else {
                (
                    effective.error_handling.effective_ignore_file_errors(),
                    "error",
                )
            };

            maybe_log_entry_processed(
                entry_log_level(ctx, effective.logging.entries.snapshotted),
                prefix,
                entry_relative_path,
                None,
                Some(&info),
                t0,
            );
            report_error_and_maybe_cancel(
                ctx,
                info,
                is_ignored,
                parent_builder,
                entry_relative_path,
            );
            Ok(())
        }

        SourceEntry::Directory(_) => Ok(()), // handled by the subdirectory pass
    }
}

/// Previous-snapshot entry with byte-equal metadata, unless the force-hash
/// roll discards it. The roll uses a non-blocking thread-local generator.
fn cached_object_id(
    ctx: &UploadContext,
    entry: &SourceEntry,
    prev_matches: &[SourceEntry],
    entry_relative_path: &str,
) -> Option<ObjectId> {
    let mut missed = false;
    let mut hit = None;
    for prev in prev_matches {
        if metadata_equals(entry.meta(), prev.meta()) {
            hit = Some(prev);
            break;
        }
        missed = true;
    }

    let Some(prev) = hit else {
        if missed {
            debug!(path = entry_relative_path, "cache miss");
        }
        return None;
    };

    let oid = prev.object_id()?;

    if 100.0 * rand::random::<f64>() < ctx.force_hash_percentage {
        debug!(path = entry_relative_path, oid = %oid, "re-hashing cached object");
        return None;
    }

    Some(oid)
}

// ---------------------------------------------------------------------------
// Per-kind uploads
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn upload_file_internal(
    ctx: &Arc<UploadContext>,
    parent_checkpoint_registry: &CheckpointRegistry,
    identity: usize,
    rel_path: &str,
    f: &Arc<dyn FileSource>,
    policy: &Policy,
    async_writes: usize,
) -> Result<DirEntry> {
    ctx.progress.hashing_file(rel_path);
    let result = upload_file_inner(
        ctx,
        parent_checkpoint_registry,
        identity,
        rel_path,
        f,
        policy,
        async_writes,
    );
    ctx.progress.finished_hashing_file(rel_path, f.meta().size);
    result
}

fn upload_file_inner(
    ctx: &Arc<UploadContext>,
    parent_checkpoint_registry: &CheckpointRegistry,
    identity: usize,
    rel_path: &str,
    f: &Arc<dyn FileSource>,
    policy: &Policy,
    async_writes: usize,
) -> Result<DirEntry> {
    // Placeholder entries carry a pre-computed directory entry; adopt it
    // once its object ID verifies against the repository.
    if let Some(de) = f.dir_entry_or_nil()? {
        ctx.repo
            .verify_object(&de.object_id)
            .map_err(|_| CairnError::InvalidPlaceholder(rel_path.to_string()))?;
        return Ok(de);
    }

    let mut reader = f.open()?;
    let meta = f.meta().clone();

    let writer = Arc::new(Mutex::new(ctx.repo.new_object_writer(WriterOptions {
        description: format!("FILE:{}", meta.name),
        compressor: policy.compression.compressor_for_file(&meta),
        prefix: None,
        async_writes,
    })));

    let checkpoint_cb = {
        let writer = Arc::clone(&writer);
        let meta = meta.clone();
        Box::new(move || -> Result<Option<DirEntry>> {
            match writer.lock().unwrap().checkpoint()? {
                None => Ok(None),
                Some(oid) => Ok(Some(new_dir_entry(&meta, EntryType::File, oid))),
            }
        })
    };
    let _registration =
        RegistrationGuard::new(parent_checkpoint_registry, identity, checkpoint_cb);

    let written = copy_with_progress(ctx, &writer, reader.as_mut())?;
    let oid = writer.lock().unwrap().result()?;

    let mut de = new_dir_entry(&meta, EntryType::File, oid);
    de.size = written;

    ctx.shared
        .counters
        .total_file_count
        .fetch_add(1, Ordering::Relaxed);
    ctx.shared
        .counters
        .total_file_size
        .fetch_add(written, Ordering::Relaxed);

    Ok(de)
}

fn upload_symlink_internal(
    ctx: &Arc<UploadContext>,
    rel_path: &str,
    l: &Arc<dyn SymlinkSource>,
) -> Result<DirEntry> {
    ctx.progress.hashing_file(rel_path);
    let result = (|| {
        let target = l.read_link()?;
        let meta = l.meta().clone();

        let writer = Arc::new(Mutex::new(ctx.repo.new_object_writer(WriterOptions {
            description: format!("SYMLINK:{}", meta.name),
            ..Default::default()
        })));

        let mut reader = std::io::Cursor::new(target.into_bytes());
        let written = copy_with_progress(ctx, &writer, &mut reader)?;
        let oid = writer.lock().unwrap().result()?;

        let mut de = new_dir_entry(&meta, EntryType::Symlink, oid);
        de.size = written;
        Ok(de)
    })();
    ctx.progress.finished_hashing_file(rel_path, l.meta().size);
    result
}

fn upload_streaming_file_internal(
    ctx: &Arc<UploadContext>,
    rel_path: &str,
    f: &Arc<dyn StreamingFileSource>,
) -> Result<DirEntry> {
    ctx.progress.hashing_file(rel_path);

    let result = (|| {
        let mut reader = f.get_reader()?;
        let meta = f.meta().clone();

        let writer = Arc::new(Mutex::new(ctx.repo.new_object_writer(WriterOptions {
            description: format!("STREAMFILE:{}", meta.name),
            ..Default::default()
        })));

        let written = copy_with_progress(ctx, &writer, reader.as_mut())?;
        let oid = writer.lock().unwrap().result()?;

        let mut de = new_dir_entry(&meta, EntryType::File, oid);
        // The stream determines the size; the source had none to offer.
        de.size = written;
        de.mod_time = ctx.repo.time();

        ctx.shared
            .counters
            .total_file_count
            .fetch_add(1, Ordering::Relaxed);
        ctx.shared
            .counters
            .total_file_size
            .fetch_add(written, Ordering::Relaxed);

        Ok(de)
    })();

    let reported = match &result {
        Ok(de) => de.size,
        Err(_) => 0,
    };
    ctx.progress.finished_hashing_file(rel_path, reported);
    result
}

/// Inner copy loop: fixed-size buffer, cancellation check before every
/// read, atomic byte accounting. A short write is a fatal I/O error.
fn copy_with_progress(
    ctx: &UploadContext,
    writer: &Arc<Mutex<Box<dyn ObjectWriter>>>,
    reader: &mut dyn Read,
) -> Result<i64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written: i64 = 0;

    loop {
        if ctx.is_canceled() {
            return Err(CairnError::Canceled);
        }

        let read_bytes = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if read_bytes == 0 {
            break;
        }

        let wrote = writer.lock().unwrap().write(&buf[..read_bytes])?;
        if wrote != read_bytes {
            return Err(CairnError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write",
            )));
        }

        written += read_bytes as i64;
        ctx.shared
            .total_written_bytes
            .fetch_add(read_bytes as i64, Ordering::AcqRel);
        ctx.progress.hashed_bytes(read_bytes as i64);
    }

    Ok(written)
}

fn write_dir_manifest(
    ctx: &UploadContext,
    dir_relative_path: &str,
    manifest: &DirManifest,
) -> Result<ObjectId> {
    let mut writer = ctx.repo.new_object_writer(WriterOptions {
        description: format!("DIR:{dir_relative_path}"),
        prefix: Some(OBJECT_PREFIX_DIRECTORY),
        ..Default::default()
    });

    let encoded = serde_json::to_vec(manifest)?;
    let mut offset = 0;
    while offset < encoded.len() {
        let n = writer.write(&encoded[offset..])?;
        if n == 0 {
            return Err(CairnError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write",
            )));
        }
        offset += n;
    }

    writer.result()
}

// ---------------------------------------------------------------------------
// Error routing, actions, helpers
// ---------------------------------------------------------------------------

fn report_error_and_maybe_cancel(
    ctx: &UploadContext,
    err: CairnError,
    is_ignored: bool,
    builder: &DirManifestBuilder,
    entry_relative_path: &str,
) {
    if ctx.is_canceled() && err.is_canceled() {
        // Already canceled; do not report another.
        return;
    }

    if is_ignored {
        ctx.shared
            .counters
            .ignored_error_count
            .fetch_add(1, Ordering::Relaxed);
    } else {
        ctx.shared
            .counters
            .error_count
            .fetch_add(1, Ordering::Relaxed);
    }

    let root = err.root_cause();
    ctx.progress.error(entry_relative_path, root, is_ignored);
    builder.add_failed_entry(entry_relative_path, is_ignored, root);

    if ctx.fail_fast && !is_ignored {
        ctx.cancel();
    }
}

fn run_action(
    ctx: &UploadContext,
    phase: ActionPhase,
    action: Option<&ActionCommand>,
    dir_path: &str,
) -> Result<()> {
    if !ctx.enable_actions {
        return Ok(());
    }
    let Some(action) = action else {
        return Ok(());
    };
    let Some(runner) = &ctx.actions else {
        return Ok(());
    };
    runner.run(phase, action, dir_path)
}

fn run_action_logged(
    ctx: &UploadContext,
    phase: ActionPhase,
    action: Option<&ActionCommand>,
    dir_path: &str,
) {
    if let Err(e) = run_action(ctx, phase, action, dir_path) {
        warn!(phase = phase.as_str(), error = %e, "action failed");
    }
}

fn entry_log_level(ctx: &UploadContext, policy_level: Option<LogDetail>) -> LogDetail {
    ctx.override_entry_log_detail
        .or(policy_level)
        .unwrap_or(LogDetail::NONE)
}

fn maybe_log_entry_processed(
    level: LogDetail,
    msg: &str,
    path: &str,
    de: Option<&DirEntry>,
    err: Option<&CairnError>,
    t0: Instant,
) {
    if level <= LogDetail::NONE && err.is_none() {
        return;
    }
    let dur = t0.elapsed();

    if let Some(e) = err {
        debug!(path, error = %e, dur = ?dur, "{msg}");
        return;
    }
    let Some(de) = de else {
        debug!(path, dur = ?dur, "{msg}");
        return;
    };

    match de.dir_summary.as_ref() {
        Some(ds) if level >= MIN_DETAIL_LEVEL_DIR_STATS => {
            debug!(
                path,
                dur = ?dur,
                size = ds.total_file_size,
                files = ds.total_file_count,
                dirs = ds.total_dir_count,
                errors = ds.ignored_error_count + ds.fatal_error_count,
                "{msg}"
            );
        }
        _ if level >= MIN_DETAIL_LEVEL_SIZE => {
            debug!(path, dur = ?dur, size = de.size, "{msg}");
        }
        _ => {
            debug!(path, dur = ?dur, "{msg}");
        }
    }
}

fn new_dir_entry(meta: &EntryMeta, entry_type: EntryType, object_id: ObjectId) -> DirEntry {
    DirEntry {
        name: meta.name.clone(),
        entry_type,
        permissions: meta.mode & 0o777,
        size: meta.size,
        mod_time: meta.mod_time,
        uid: meta.owner.uid,
        gid: meta.owner.gid,
        object_id,
        dir_summary: None,
    }
}

fn new_dir_entry_with_summary(
    meta: &EntryMeta,
    entry_type: EntryType,
    object_id: ObjectId,
    summary: DirectorySummary,
) -> DirEntry {
    let mut de = new_dir_entry(meta, entry_type, object_id);
    de.dir_summary = Some(summary);
    de
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}
