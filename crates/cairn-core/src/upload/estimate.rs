//! Best-effort size estimation for directory uploads.
//!
//! The scan runs on its own thread in parallel with the actual upload and
//! only feeds progress reporting; it never affects upload correctness.
//! Unreadable directories are skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::fs::{DirectorySource, SourceEntry};

#[derive(Debug, Default, Clone, Copy)]
pub(super) struct ScanResult {
    pub num_files: i64,
    pub total_file_size: i64,
    pub num_dirs: i64,
}

/// Walk `dir`, counting files and bytes. Cancellation is checked once per
/// directory.
pub(super) fn scan_directory(dir: &Arc<dyn DirectorySource>, canceled: &AtomicBool) -> ScanResult {
    let mut result = ScanResult::default();
    scan_recursive(dir, canceled, &mut result);
    debug!(
        files = result.num_files,
        bytes = result.total_file_size,
        dirs = result.num_dirs,
        "estimation scan finished"
    );
    result
}

fn scan_recursive(dir: &Arc<dyn DirectorySource>, canceled: &AtomicBool, result: &mut ScanResult) {
    if canceled.load(Ordering::Relaxed) {
        return;
    }

    result.num_dirs += 1;

    let entries = match dir.read_dir() {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries {
        match entry {
            SourceEntry::Directory(sub) => scan_recursive(&sub, canceled, result),
            SourceEntry::File(f) => {
                result.num_files += 1;
                result.total_file_size += f.meta().size;
            }
            SourceEntry::StreamingFile(_) => {
                result.num_files += 1;
            }
            SourceEntry::Symlink(_) | SourceEntry::Error(_) => {}
        }
    }
}
