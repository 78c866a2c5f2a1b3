//! Thread-safe accumulator of directory entries and rollup statistics.
//!
//! One builder exists per directory being uploaded; children (possibly on
//! worker threads) add entries and failures concurrently, then the owner
//! seals the directory with [`DirManifestBuilder::build`]. Checkpoints
//! operate on a deep clone so the live builder is never disturbed.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::CairnError;
use crate::snapshot::entry::{
    DirEntry, DirManifest, DirectorySummary, EntryType, FailedEntry, DIRECTORY_STREAM_TYPE,
    MAX_FAILED_ENTRIES_PER_DIRECTORY_SUMMARY,
};
use crate::snapshot::IncompleteReason;

#[derive(Default)]
struct Inner {
    summary: DirectorySummary,
    entries: Vec<DirEntry>,
}

#[derive(Default)]
pub struct DirManifestBuilder {
    inner: Mutex<Inner>,
}

impl DirManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the current state, sharing no mutable state with the
    /// live builder.
    pub fn clone_state(&self) -> DirManifestBuilder {
        let inner = self.inner.lock().unwrap();
        DirManifestBuilder {
            inner: Mutex::new(Inner {
                summary: inner.summary.clone(),
                entries: inner.entries.clone(),
            }),
        }
    }

    /// Record one finished child entry, folding its contribution into the
    /// summary. Directory entries with summaries aggregate their subtree's
    /// counts, errors, and maximum mod-time upward.
    pub fn add_entry(&self, de: DirEntry) {
        let mut inner = self.inner.lock().unwrap();

        if de.mod_time > inner.summary.max_mod_time {
            inner.summary.max_mod_time = de.mod_time;
        }

        match de.entry_type {
            EntryType::Symlink => {
                inner.summary.total_symlink_count += 1;
            }
            EntryType::File => {
                inner.summary.total_file_count += 1;
                inner.summary.total_file_size += de.size;
            }
            EntryType::Directory => {
                if let Some(child) = &de.dir_summary {
                    inner.summary.total_file_count += child.total_file_count;
                    inner.summary.total_file_size += child.total_file_size;
                    inner.summary.total_symlink_count += child.total_symlink_count;
                    inner.summary.total_dir_count += child.total_dir_count;
                    inner.summary.fatal_error_count += child.fatal_error_count;
                    inner.summary.ignored_error_count += child.ignored_error_count;
                    let failed = child.failed_entries.clone();
                    inner.summary.failed_entries.extend(failed);

                    if child.max_mod_time > inner.summary.max_mod_time {
                        inner.summary.max_mod_time = child.max_mod_time;
                    }
                }
            }
        }

        inner.entries.push(de);
    }

    /// Record a child that could not be uploaded.
    pub fn add_failed_entry(&self, rel_path: &str, is_ignored: bool, err: &CairnError) {
        let mut inner = self.inner.lock().unwrap();

        if is_ignored {
            inner.summary.ignored_error_count += 1;
        } else {
            inner.summary.fatal_error_count += 1;
        }

        inner.summary.failed_entries.push(FailedEntry {
            path: rel_path.to_string(),
            error: err.to_string(),
        });
    }

    /// Seal the directory: order entries (directories first, then
    /// non-directories, each group by name), cap and sort the failed-entry
    /// list, and produce the canonical manifest.
    pub fn build(
        &self,
        dir_mod_time: DateTime<Utc>,
        incomplete_reason: Option<IncompleteReason>,
    ) -> DirManifest {
        let mut inner = self.inner.lock().unwrap();

        let mut summary = inner.summary.clone();
        summary.total_dir_count += 1;

        if inner.entries.is_empty() {
            summary.max_mod_time = dir_mod_time;
        }
        summary.incomplete_reason = incomplete_reason;

        summary.failed_entries.sort_by(|a, b| a.path.cmp(&b.path));
        summary
            .failed_entries
            .truncate(MAX_FAILED_ENTRIES_PER_DIRECTORY_SUMMARY);

        inner.entries.sort_by(|a, b| {
            // Directories sort before non-directories.
            b.is_dir()
                .cmp(&a.is_dir())
                .then_with(|| a.name.cmp(&b.name))
        });

        DirManifest {
            stream_type: DIRECTORY_STREAM_TYPE.to_string(),
            summary,
            entries: inner.entries.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::object_id::ObjectId;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn file_entry(name: &str, size: i64, mod_time: DateTime<Utc>) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            entry_type: EntryType::File,
            permissions: 0o644,
            size,
            mod_time,
            uid: 0,
            gid: 0,
            object_id: ObjectId::from("aa11"),
            dir_summary: None,
        }
    }

    fn dir_entry(name: &str, summary: DirectorySummary) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            entry_type: EntryType::Directory,
            permissions: 0o755,
            size: 0,
            mod_time: ts(1),
            uid: 0,
            gid: 0,
            object_id: ObjectId::from("bb22"),
            dir_summary: Some(summary),
        }
    }

    #[test]
    fn aggregates_counts_and_sizes() {
        let b = DirManifestBuilder::new();
        b.add_entry(file_entry("a.txt", 100, ts(10)));
        b.add_entry(file_entry("b.txt", 50, ts(20)));

        let child = DirectorySummary {
            total_file_size: 500,
            total_file_count: 3,
            total_dir_count: 2,
            max_mod_time: ts(99),
            fatal_error_count: 1,
            ignored_error_count: 2,
            failed_entries: vec![FailedEntry {
                path: "sub/x".into(),
                error: "boom".into(),
            }],
            ..Default::default()
        };
        b.add_entry(dir_entry("sub", child.clone()));

        let m = b.build(ts(5), None);
        assert_eq!(m.summary.total_file_count, 5);
        assert_eq!(m.summary.total_file_size, 650);
        assert_eq!(m.summary.total_dir_count, 3); // child's 2 + this dir
        assert_eq!(m.summary.max_mod_time, ts(99));
        assert_eq!(m.summary.fatal_error_count, 1);
        assert_eq!(m.summary.ignored_error_count, 2);
        assert_eq!(m.summary.failed_entries, child.failed_entries);

        // Parent counts dominate each child's (invariant over summaries).
        for c in m.entries.iter().filter_map(|e| e.dir_summary.as_ref()) {
            assert!(m.summary.total_file_count >= c.total_file_count);
            assert!(m.summary.total_file_size >= c.total_file_size);
            assert!(m.summary.total_dir_count >= c.total_dir_count);
        }
    }

    #[test]
    fn entries_sorted_directories_first_then_names() {
        let b = DirManifestBuilder::new();
        b.add_entry(file_entry("zz.txt", 1, ts(1)));
        b.add_entry(file_entry("aa.txt", 1, ts(1)));
        b.add_entry(dir_entry("zdir", DirectorySummary::default()));
        b.add_entry(dir_entry("adir", DirectorySummary::default()));

        let m = b.build(ts(1), None);
        let names: Vec<&str> = m.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["adir", "zdir", "aa.txt", "zz.txt"]);
    }

    #[test]
    fn empty_directory_takes_dir_mod_time() {
        let b = DirManifestBuilder::new();
        let m = b.build(ts(1234), None);
        assert_eq!(m.summary.max_mod_time, ts(1234));
        assert_eq!(m.summary.total_dir_count, 1);
    }

    #[test]
    fn failed_entries_sorted_and_capped() {
        let b = DirManifestBuilder::new();
        for i in (0..10).rev() {
            b.add_failed_entry(
                &format!("entry-{i:02}"),
                false,
                &CairnError::Other("x".into()),
            );
        }

        let m = b.build(ts(1), None);
        assert_eq!(
            m.summary.failed_entries.len(),
            MAX_FAILED_ENTRIES_PER_DIRECTORY_SUMMARY
        );
        assert_eq!(m.summary.failed_entries[0].path, "entry-00");
        assert_eq!(m.summary.fatal_error_count, 10);
    }

    #[test]
    fn ignored_and_fatal_errors_counted_separately() {
        let b = DirManifestBuilder::new();
        b.add_failed_entry("a", true, &CairnError::Other("x".into()));
        b.add_failed_entry("b", false, &CairnError::Other("y".into()));

        let m = b.build(ts(1), None);
        assert_eq!(m.summary.ignored_error_count, 1);
        assert_eq!(m.summary.fatal_error_count, 1);
    }

    #[test]
    fn clone_state_is_independent() {
        let b = DirManifestBuilder::new();
        b.add_entry(file_entry("a.txt", 10, ts(1)));

        let snapshot = b.clone_state();
        b.add_entry(file_entry("b.txt", 10, ts(2)));

        let from_snapshot = snapshot.build(ts(1), Some(IncompleteReason::Checkpoint));
        let from_live = b.build(ts(1), None);
        assert_eq!(from_snapshot.entries.len(), 1);
        assert_eq!(from_live.entries.len(), 2);
        assert_eq!(
            from_snapshot.summary.incomplete_reason,
            Some(IncompleteReason::Checkpoint)
        );
    }

    #[test]
    fn concurrent_adds_lose_nothing() {
        use std::sync::Arc;

        let b = Arc::new(DirManifestBuilder::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let b = Arc::clone(&b);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    b.add_entry(file_entry(&format!("f-{t}-{i}"), 1, ts(1)));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let m = b.build(ts(1), None);
        assert_eq!(m.entries.len(), 400);
        assert_eq!(m.summary.total_file_count, 400);
        assert_eq!(m.summary.total_file_size, 400);
    }
}
