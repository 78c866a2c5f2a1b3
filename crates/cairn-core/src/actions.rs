//! Execution of policy-defined action commands around folders and snapshot
//! roots. The uploader only invokes the [`ActionRunner`] capability; the
//! default shell runner is provided for callers that want the conventional
//! `sh -c` behavior.

use std::process::Command;

use tracing::info;

use crate::error::{CairnError, Result};
use crate::policy::ActionCommand;

/// Where in the upload lifecycle an action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    BeforeFolder,
    AfterFolder,
    BeforeSnapshotRoot,
    AfterSnapshotRoot,
}

impl ActionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionPhase::BeforeFolder => "before-folder",
            ActionPhase::AfterFolder => "after-folder",
            ActionPhase::BeforeSnapshotRoot => "before-snapshot-root",
            ActionPhase::AfterSnapshotRoot => "after-snapshot-root",
        }
    }
}

/// Runs action commands. `before-*` failures abort the surrounding upload
/// step; `after-*` failures are logged and ignored by the uploader.
pub trait ActionRunner: Send + Sync {
    fn run(&self, phase: ActionPhase, action: &ActionCommand, dir_path: &str) -> Result<()>;
}

/// Runs actions through `sh -c`, exposing the phase and directory via
/// environment variables.
#[derive(Debug, Default)]
pub struct ShellActionRunner;

impl ActionRunner for ShellActionRunner {
    fn run(&self, phase: ActionPhase, action: &ActionCommand, dir_path: &str) -> Result<()> {
        info!(phase = phase.as_str(), command = %action.command, "running action");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&action.command)
            .env("CAIRN_ACTION_PHASE", phase.as_str())
            .env("CAIRN_SNAPSHOT_PATH", dir_path)
            .output()
            .map_err(|e| {
                CairnError::Action(format!("failed to execute '{}': {e}", action.command))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(CairnError::Action(format!(
                "action '{}' exited with {code}: {stderr}",
                action.command
            )));
        }

        Ok(())
    }
}
