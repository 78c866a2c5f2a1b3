//! Local filesystem sources.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::Result;

use super::{
    DirectorySource, EntryInfo, EntryMeta, FileSource, Owner, SourceEntry, StaticErrorEntry,
    SymlinkSource,
};

/// A directory on the local filesystem.
pub struct LocalDirectory {
    path: PathBuf,
    meta: EntryMeta,
}

impl LocalDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let metadata = fs::symlink_metadata(&path)?;
        let meta = entry_meta(&path, &metadata);
        Ok(Arc::new(Self { path, meta }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EntryInfo for LocalDirectory {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

impl DirectorySource for LocalDirectory {
    fn read_dir(&self) -> Result<Vec<SourceEntry>> {
        let mut entries = Vec::new();

        for dirent in fs::read_dir(&self.path)? {
            let dirent = dirent?;
            let child_path = dirent.path();
            let name = dirent.file_name().to_string_lossy().to_string();

            let metadata = match fs::symlink_metadata(&child_path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %child_path.display(), error = %e, "stat failed");
                    entries.push(SourceEntry::Error(Arc::new(StaticErrorEntry::io_error(
                        placeholder_meta(&name),
                        e.to_string(),
                    ))));
                    continue;
                }
            };

            let meta = entry_meta(&child_path, &metadata);
            let file_type = metadata.file_type();

            let entry = if file_type.is_dir() {
                SourceEntry::Directory(Arc::new(LocalDirectory {
                    path: child_path,
                    meta,
                }))
            } else if file_type.is_symlink() {
                SourceEntry::Symlink(Arc::new(LocalSymlink {
                    path: child_path,
                    meta,
                }))
            } else if file_type.is_file() {
                SourceEntry::File(Arc::new(LocalFile {
                    path: child_path,
                    meta,
                }))
            } else {
                SourceEntry::Error(Arc::new(StaticErrorEntry::unknown_type(meta)))
            };

            entries.push(entry);
        }

        entries.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(entries)
    }
}

/// A regular file on the local filesystem.
pub struct LocalFile {
    path: PathBuf,
    meta: EntryMeta,
}

impl EntryInfo for LocalFile {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

impl FileSource for LocalFile {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(&self.path)?))
    }
}

/// A symbolic link on the local filesystem.
pub struct LocalSymlink {
    path: PathBuf,
    meta: EntryMeta,
}

impl EntryInfo for LocalSymlink {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }
}

impl SymlinkSource for LocalSymlink {
    fn read_link(&self) -> Result<String> {
        Ok(fs::read_link(&self.path)?.to_string_lossy().to_string())
    }
}

fn entry_meta(path: &Path, metadata: &fs::Metadata) -> EntryMeta {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());

    EntryMeta {
        name,
        mode: permissions(metadata),
        size: metadata.len() as i64,
        mod_time: metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH),
        owner: owner(metadata),
    }
}

fn placeholder_meta(name: &str) -> EntryMeta {
    EntryMeta {
        name: name.to_string(),
        mode: 0,
        size: 0,
        mod_time: DateTime::UNIX_EPOCH,
        owner: Owner::default(),
    }
}

#[cfg(unix)]
fn permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permissions(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o555
    } else {
        0o755
    }
}

#[cfg(unix)]
fn owner(metadata: &fs::Metadata) -> Owner {
    use std::os::unix::fs::MetadataExt;
    Owner {
        uid: metadata.uid(),
        gid: metadata.gid(),
    }
}

#[cfg(not(unix))]
fn owner(_metadata: &fs::Metadata) -> Owner {
    Owner::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_dir_classifies_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("a-sub")).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("b.txt", dir.path().join("c-link")).unwrap();

        let root = LocalDirectory::new(dir.path()).unwrap();
        let entries = root.read_dir().unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.name()).collect();
        #[cfg(unix)]
        assert_eq!(names, vec!["a-sub", "b.txt", "c-link"]);
        #[cfg(not(unix))]
        assert_eq!(names, vec!["a-sub", "b.txt"]);

        assert!(entries[0].is_dir());
        match &entries[1] {
            SourceEntry::File(f) => {
                assert_eq!(f.meta().size, 5);
                let mut content = Vec::new();
                f.open().unwrap().read_to_end(&mut content).unwrap();
                assert_eq!(content, b"hello");
            }
            _ => panic!("expected file entry"),
        }

        #[cfg(unix)]
        match &entries[2] {
            SourceEntry::Symlink(l) => assert_eq!(l.read_link().unwrap(), "b.txt"),
            _ => panic!("expected symlink entry"),
        }
    }
}
