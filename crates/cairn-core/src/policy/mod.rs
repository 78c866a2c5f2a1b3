//! Hierarchical snapshot policy: per-directory settings resolved against
//! inherited defaults. The uploader only reads effective policies; defining
//! and persisting them is the caller's concern.

use std::collections::HashMap;
use std::sync::Arc;

use crate::fs::EntryMeta;

/// Verbosity of per-entry and per-directory upload logging. Higher values
/// add fields (duration, then size, then directory stats, mod-time, object
/// ID).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogDetail(pub u8);

impl LogDetail {
    pub const NONE: LogDetail = LogDetail(0);
    pub const NORMAL: LogDetail = LogDetail(5);
    pub const MAX: LogDetail = LogDetail(10);
}

/// Command run around folders or the snapshot root when actions are enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCommand {
    pub command: String,
}

impl ActionCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadPolicy {
    /// Upper bound on files hashed in parallel. Defaults to the CPU count.
    pub max_parallel_file_reads: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CompressionPolicy {
    /// Compressor applied to file contents, if any.
    pub compressor: Option<String>,
    /// Files smaller than this are stored uncompressed.
    pub min_size: i64,
    /// File extensions (without the dot) never worth compressing.
    pub never_compress_extensions: Vec<String>,
}

impl CompressionPolicy {
    /// Pick the compressor for one file, honoring size and extension rules.
    pub fn compressor_for_file(&self, meta: &EntryMeta) -> Option<String> {
        let name = self.compressor.as_ref()?;
        if self.min_size > 0 && meta.size < self.min_size {
            return None;
        }
        if let Some(ext) = meta.name.rsplit_once('.').map(|(_, ext)| ext) {
            if self.never_compress_extensions.iter().any(|e| e == ext) {
                return None;
            }
        }
        Some(name.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorHandlingPolicy {
    pub ignore_file_errors: Option<bool>,
    pub ignore_directory_errors: Option<bool>,
    pub ignore_unknown_types: Option<bool>,
}

impl ErrorHandlingPolicy {
    pub fn effective_ignore_file_errors(&self) -> bool {
        self.ignore_file_errors.unwrap_or(false)
    }

    pub fn effective_ignore_directory_errors(&self) -> bool {
        self.ignore_directory_errors.unwrap_or(false)
    }

    pub fn effective_ignore_unknown_types(&self) -> bool {
        self.ignore_unknown_types.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirLoggingPolicy {
    pub snapshotted: Option<LogDetail>,
    pub ignored: Option<LogDetail>,
}

#[derive(Debug, Clone, Default)]
pub struct EntryLoggingPolicy {
    pub snapshotted: Option<LogDetail>,
    pub ignored: Option<LogDetail>,
    pub cache_hit: Option<LogDetail>,
    pub cache_miss: Option<LogDetail>,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingPolicy {
    pub directories: DirLoggingPolicy,
    pub entries: EntryLoggingPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct ActionsPolicy {
    pub before_folder: Option<ActionCommand>,
    pub after_folder: Option<ActionCommand>,
    pub before_snapshot_root: Option<ActionCommand>,
    pub after_snapshot_root: Option<ActionCommand>,
}

#[derive(Debug, Clone, Default)]
pub struct FilesPolicy {
    /// gitignore-style patterns excluding entries from the snapshot.
    pub ignore_rules: Vec<String>,
}

/// Full set of options recognized for one directory.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub upload: UploadPolicy,
    pub compression: CompressionPolicy,
    pub error_handling: ErrorHandlingPolicy,
    pub logging: LoggingPolicy,
    pub actions: ActionsPolicy,
    pub files: FilesPolicy,
}

impl Policy {
    /// Overlay `defined` on top of `inherited`: every set option wins over
    /// the inherited value.
    fn overlay(inherited: &Policy, defined: &Policy) -> Policy {
        Policy {
            upload: UploadPolicy {
                max_parallel_file_reads: defined
                    .upload
                    .max_parallel_file_reads
                    .or(inherited.upload.max_parallel_file_reads),
            },
            compression: CompressionPolicy {
                compressor: defined
                    .compression
                    .compressor
                    .clone()
                    .or_else(|| inherited.compression.compressor.clone()),
                min_size: if defined.compression.min_size != 0 {
                    defined.compression.min_size
                } else {
                    inherited.compression.min_size
                },
                never_compress_extensions: if defined
                    .compression
                    .never_compress_extensions
                    .is_empty()
                {
                    inherited.compression.never_compress_extensions.clone()
                } else {
                    defined.compression.never_compress_extensions.clone()
                },
            },
            error_handling: ErrorHandlingPolicy {
                ignore_file_errors: defined
                    .error_handling
                    .ignore_file_errors
                    .or(inherited.error_handling.ignore_file_errors),
                ignore_directory_errors: defined
                    .error_handling
                    .ignore_directory_errors
                    .or(inherited.error_handling.ignore_directory_errors),
                ignore_unknown_types: defined
                    .error_handling
                    .ignore_unknown_types
                    .or(inherited.error_handling.ignore_unknown_types),
            },
            logging: LoggingPolicy {
                directories: DirLoggingPolicy {
                    snapshotted: defined
                        .logging
                        .directories
                        .snapshotted
                        .or(inherited.logging.directories.snapshotted),
                    ignored: defined
                        .logging
                        .directories
                        .ignored
                        .or(inherited.logging.directories.ignored),
                },
                entries: EntryLoggingPolicy {
                    snapshotted: defined
                        .logging
                        .entries
                        .snapshotted
                        .or(inherited.logging.entries.snapshotted),
                    ignored: defined
                        .logging
                        .entries
                        .ignored
                        .or(inherited.logging.entries.ignored),
                    cache_hit: defined
                        .logging
                        .entries
                        .cache_hit
                        .or(inherited.logging.entries.cache_hit),
                    cache_miss: defined
                        .logging
                        .entries
                        .cache_miss
                        .or(inherited.logging.entries.cache_miss),
                },
            },
            actions: defined.actions.clone(),
            files: FilesPolicy {
                ignore_rules: if defined.files.ignore_rules.is_empty() {
                    inherited.files.ignore_rules.clone()
                } else {
                    defined.files.ignore_rules.clone()
                },
            },
        }
    }
}

/// Policy resolution over the source tree: each node carries the policy in
/// effect there and the explicitly defined one, if any.
pub struct PolicyTree {
    effective: Arc<Policy>,
    defined: Option<Arc<Policy>>,
    children: HashMap<String, Arc<PolicyTree>>,
}

impl PolicyTree {
    /// Tree with a single policy in effect everywhere.
    pub fn single(policy: Policy) -> Arc<PolicyTree> {
        Arc::new(PolicyTree {
            effective: Arc::new(policy.clone()),
            defined: Some(Arc::new(policy)),
            children: HashMap::new(),
        })
    }

    /// Build a tree from `/`-separated relative paths to defined policies.
    /// The empty path defines the root policy.
    pub fn build(definitions: HashMap<String, Policy>) -> Arc<PolicyTree> {
        let mut nested: Nested = Nested::default();
        for (path, policy) in definitions {
            nested.insert(&path, policy);
        }
        nested.into_tree(&Arc::new(Policy::default()))
    }

    pub fn effective(&self) -> &Arc<Policy> {
        &self.effective
    }

    pub fn defined(&self) -> Option<&Arc<Policy>> {
        self.defined.as_ref()
    }

    /// Resolve the subtree for a child directory. Children without defined
    /// policies inherit this node's effective policy.
    pub fn child(&self, name: &str) -> Arc<PolicyTree> {
        match self.children.get(name) {
            Some(child) => Arc::clone(child),
            None => Arc::new(PolicyTree {
                effective: Arc::clone(&self.effective),
                defined: None,
                children: HashMap::new(),
            }),
        }
    }
}

#[derive(Default)]
struct Nested {
    policy: Option<Policy>,
    children: HashMap<String, Nested>,
}

impl Nested {
    fn insert(&mut self, path: &str, policy: Policy) {
        if path.is_empty() {
            self.policy = Some(policy);
            return;
        }
        let (head, rest) = match path.split_once('/') {
            Some((head, rest)) => (head, rest),
            None => (path, ""),
        };
        self.children.entry(head.to_string()).or_default().insert(rest, policy);
    }

    fn into_tree(self, inherited: &Arc<Policy>) -> Arc<PolicyTree> {
        let (effective, defined) = match self.policy {
            Some(p) => {
                let merged = Arc::new(Policy::overlay(inherited, &p));
                (Arc::clone(&merged), Some(Arc::new(p)))
            }
            None => (Arc::clone(inherited), None),
        };

        let children = self
            .children
            .into_iter()
            .map(|(name, nested)| (name, nested.into_tree(&effective)))
            .collect();

        Arc::new(PolicyTree {
            effective,
            defined,
            children,
        })
    }
}
