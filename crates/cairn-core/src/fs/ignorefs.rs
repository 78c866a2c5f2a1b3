//! Ignore-rule filtering over directory sources.
//!
//! Wraps a directory so that children matching the effective policy's
//! gitignore-style rules never reach the uploader. Ignored entries are
//! reported through a callback so progress and statistics still see them.

use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{CairnError, Result};
use crate::policy::PolicyTree;

use super::{DirectorySource, EntryInfo, EntryMeta, SourceEntry};

/// Invoked once per ignored entry with its path relative to the wrap root.
pub type IgnoredCallback = dyn Fn(&str, &SourceEntry) + Send + Sync;

/// Wrap `dir` so its listing honors the policy tree's ignore rules.
pub fn wrap(
    dir: Arc<dyn DirectorySource>,
    policy_tree: Arc<PolicyTree>,
    on_ignored: Arc<IgnoredCallback>,
) -> Arc<dyn DirectorySource> {
    Arc::new(IgnoreDirectory {
        inner: dir,
        policy_tree,
        rel_path: String::new(),
        on_ignored,
    })
}

struct IgnoreDirectory {
    inner: Arc<dyn DirectorySource>,
    policy_tree: Arc<PolicyTree>,
    rel_path: String,
    on_ignored: Arc<IgnoredCallback>,
}

impl IgnoreDirectory {
    fn child_path(&self, name: &str) -> String {
        if self.rel_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.rel_path, name)
        }
    }
}

impl EntryInfo for IgnoreDirectory {
    fn meta(&self) -> &EntryMeta {
        self.inner.meta()
    }

    fn object_id(&self) -> Option<cairn_types::object_id::ObjectId> {
        self.inner.object_id()
    }

    fn dir_entry_or_nil(&self) -> Result<Option<crate::snapshot::entry::DirEntry>> {
        self.inner.dir_entry_or_nil()
    }
}

impl DirectorySource for IgnoreDirectory {
    fn read_dir(&self) -> Result<Vec<SourceEntry>> {
        let matcher = build_matcher(&self.policy_tree.effective().files.ignore_rules)?;
        let children = self.inner.read_dir()?;

        let mut kept = Vec::with_capacity(children.len());
        for child in children {
            let is_dir = child.is_dir();

            if let Some(m) = &matcher {
                if m.matched(child.name(), is_dir).is_ignore() {
                    (self.on_ignored)(&self.child_path(child.name()), &child);
                    continue;
                }
            }

            // Nested directories keep filtering with their own effective rules.
            let entry = match child {
                SourceEntry::Directory(sub) => {
                    let name = sub.meta().name.clone();
                    SourceEntry::Directory(Arc::new(IgnoreDirectory {
                        policy_tree: self.policy_tree.child(&name),
                        rel_path: self.child_path(&name),
                        inner: sub,
                        on_ignored: Arc::clone(&self.on_ignored),
                    }))
                }
                other => other,
            };
            kept.push(entry);
        }

        Ok(kept)
    }
}

fn build_matcher(rules: &[String]) -> Result<Option<Gitignore>> {
    if rules.is_empty() {
        return Ok(None);
    }

    let mut builder = GitignoreBuilder::new("");
    for rule in rules {
        builder
            .add_line(None, rule)
            .map_err(|e| CairnError::Config(format!("invalid ignore rule '{rule}': {e}")))?;
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| CairnError::Config(format!("ignore matcher build failed: {e}")))
}
