//! Progress sink for upload observers. All methods default to no-ops so
//! implementations only override what they render.

use crate::error::CairnError;

pub trait UploadProgress: Send + Sync {
    fn upload_started(&self) {}

    fn upload_finished(&self) {}

    /// Hashing of `path` has begun.
    fn hashing_file(&self, _path: &str) {}

    /// Hashing of `path` finished after reading `size` bytes.
    fn finished_hashing_file(&self, _path: &str, _size: i64) {}

    /// `bytes` more source bytes were hashed and written.
    fn hashed_bytes(&self, _bytes: i64) {}

    /// `path` was reused from the previous snapshot without re-hashing.
    fn cached_file(&self, _path: &str, _size: i64) {}

    fn excluded_file(&self, _path: &str, _size: i64) {}

    fn excluded_dir(&self, _path: &str) {}

    fn error(&self, _path: &str, _err: &CairnError, _is_ignored: bool) {}

    /// Estimated totals for the source, from the parallel estimation scan.
    fn estimated_data_size(&self, _file_count: i64, _total_bytes: i64) {}

    fn started_directory(&self, _path: &str) {}

    fn finished_directory(&self, _path: &str) {}
}

/// Progress sink that discards all events.
#[derive(Debug, Default)]
pub struct NullUploadProgress;

impl UploadProgress for NullUploadProgress {}
