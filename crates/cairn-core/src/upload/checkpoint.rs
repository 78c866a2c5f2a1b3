//! Registry of checkpoint callbacks for one upload.
//!
//! While an upload runs, every in-flight object writer and directory
//! registers a callback able to materialize its current partial state as a
//! directory entry. Running the root registry therefore assembles a
//! consistent partial tree without disturbing the live upload. The registry
//! lives no longer than the enclosing upload and holds no owning references
//! back into it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CairnError, Result};
use crate::snapshot::entry::DirEntry;

use super::dir_builder::DirManifestBuilder;

pub(crate) type CheckpointFunc = Box<dyn Fn() -> Result<Option<DirEntry>> + Send + Sync>;

#[derive(Default)]
pub struct CheckpointRegistry {
    callbacks: Mutex<HashMap<usize, CheckpointFunc>>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `cb` under the identity of a source entry. Re-registering
    /// the same identity replaces the previous callback.
    pub(crate) fn add_checkpoint_callback(&self, identity: usize, cb: CheckpointFunc) {
        self.callbacks.lock().unwrap().insert(identity, cb);
    }

    pub(crate) fn remove_checkpoint_callback(&self, identity: usize) {
        self.callbacks.lock().unwrap().remove(&identity);
    }

    /// Invoke every registered callback; each non-nil entry produced is
    /// added to `builder`. A callback error aborts and is returned.
    pub fn run_checkpoints(&self, builder: &DirManifestBuilder) -> Result<()> {
        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.values() {
            if let Some(de) = cb()? {
                builder.add_entry(de);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }
}

/// Removes a callback registration when dropped, covering every exit path
/// of the registering scope.
pub(crate) struct RegistrationGuard<'a> {
    registry: &'a CheckpointRegistry,
    identity: usize,
}

impl<'a> RegistrationGuard<'a> {
    pub(crate) fn new(
        registry: &'a CheckpointRegistry,
        identity: usize,
        cb: CheckpointFunc,
    ) -> Self {
        registry.add_checkpoint_callback(identity, cb);
        Self { registry, identity }
    }
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove_checkpoint_callback(self.identity);
    }
}

/// Error used when a registered callback fails; exposed for uploads to
/// treat checkpoint failures as fatal.
pub(crate) fn checkpoint_error(err: CairnError) -> CairnError {
    CairnError::Other(format!("running checkpointers: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::object_id::ObjectId;
    use chrono::DateTime;

    use crate::snapshot::entry::EntryType;

    fn entry(name: &str) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            entry_type: EntryType::File,
            permissions: 0o644,
            size: 1,
            mod_time: DateTime::UNIX_EPOCH,
            uid: 0,
            gid: 0,
            object_id: ObjectId::from("cc33"),
            dir_summary: None,
        }
    }

    #[test]
    fn callbacks_feed_the_builder() {
        let registry = CheckpointRegistry::new();
        registry.add_checkpoint_callback(1, Box::new(|| Ok(Some(entry("one")))));
        registry.add_checkpoint_callback(2, Box::new(|| Ok(None)));

        let builder = DirManifestBuilder::new();
        registry.run_checkpoints(&builder).unwrap();

        let m = builder.build(DateTime::UNIX_EPOCH, None);
        assert_eq!(m.entries.len(), 1);
        assert_eq!(m.entries[0].name, "one");
    }

    #[test]
    fn callback_error_aborts() {
        let registry = CheckpointRegistry::new();
        registry.add_checkpoint_callback(1, Box::new(|| Err(CairnError::Other("boom".into()))));

        let builder = DirManifestBuilder::new();
        assert!(registry.run_checkpoints(&builder).is_err());
    }

    #[test]
    fn guard_removes_registration_on_drop() {
        let registry = CheckpointRegistry::new();
        {
            let _guard =
                RegistrationGuard::new(&registry, 7, Box::new(|| Ok(Some(entry("seven")))));
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn reregistering_replaces() {
        let registry = CheckpointRegistry::new();
        registry.add_checkpoint_callback(1, Box::new(|| Ok(Some(entry("old")))));
        registry.add_checkpoint_callback(1, Box::new(|| Ok(Some(entry("new")))));

        let builder = DirManifestBuilder::new();
        registry.run_checkpoints(&builder).unwrap();
        let m = builder.build(DateTime::UNIX_EPOCH, None);
        assert_eq!(m.entries.len(), 1);
        assert_eq!(m.entries[0].name, "new");
    }
}
