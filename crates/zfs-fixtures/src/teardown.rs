//! Release actions registered while provisioning, unwound in reverse.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::storage::{FailureKind, StorageBackend, StorageError};
use crate::{Error, Result};

/// One piece of state to release when a fixture is torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReleaseAction {
    /// Export a pool created for the fixture.
    ExportPool { pool: String },
    /// Unmount a dataset; legacy datasets are unmounted by path.
    UnmountDataset {
        dataset: String,
        path: PathBuf,
        legacy: bool,
    },
    /// Remove the directory a dataset was mounted on.
    RemoveMountDir { path: PathBuf },
}

impl std::fmt::Display for ReleaseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseAction::ExportPool { pool } => write!(f, "export pool {}", pool),
            ReleaseAction::UnmountDataset { dataset, path, .. } => {
                write!(f, "unmount {} from {}", dataset, path.display())
            }
            ReleaseAction::RemoveMountDir { path } => write!(f, "remove {}", path.display()),
        }
    }
}

/// Stack of release actions in registration order.
#[derive(Debug, Default)]
pub struct TeardownStack {
    actions: Vec<ReleaseAction>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: ReleaseAction) {
        debug!("Registered teardown action: {}", action);
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Pending actions in registration order.
    pub fn actions(&self) -> &[ReleaseAction] {
        &self.actions
    }

    /// Drop every pending action without running it.
    pub fn forget(&mut self) -> Vec<ReleaseAction> {
        std::mem::take(&mut self.actions)
    }

    /// Run every action, most recent first.
    ///
    /// Already-absent pools and datasets that are not mounted are tolerated.
    /// Any other failure is collected and the remaining actions still run;
    /// the mount directory of a dataset that failed to unmount is kept so
    /// its contents are not deleted through the live mount.
    pub async fn unwind(&mut self, backend: &dyn StorageBackend) -> Result<()> {
        let mut failures = Vec::new();
        let mut still_mounted = HashSet::new();

        while let Some(action) = self.actions.pop() {
            info!("Teardown: {}", action);
            let outcome = match &action {
                ReleaseAction::ExportPool { pool } => backend.export_pool(pool).await,
                ReleaseAction::UnmountDataset { dataset, path, legacy } => {
                    let result = if *legacy {
                        backend.unmount_path(path).await
                    } else {
                        backend.unmount_dataset(dataset).await
                    };
                    if matches!(&result, Err(e) if e.kind() == FailureKind::Other) {
                        still_mounted.insert(path.clone());
                    }
                    result
                }
                ReleaseAction::RemoveMountDir { path } => {
                    if still_mounted.contains(path) {
                        warn!("Keeping {} since it is still mounted", path.display());
                        continue;
                    }
                    remove_dir(path);
                    Ok(())
                }
            };

            if let Err(e) = outcome {
                tolerate_or_collect(&action, e, &mut failures);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown { failures })
        }
    }
}

fn tolerate_or_collect(action: &ReleaseAction, error: StorageError, failures: &mut Vec<String>) {
    match error.kind() {
        FailureKind::Absent | FailureKind::NotMounted => {
            warn!("Teardown: ignoring failure to {}: {}", action, error.message());
        }
        FailureKind::Other => {
            warn!("Teardown: failed to {}: {}", action, error);
            failures.push(format!("{}: {}", action, error.message()));
        }
    }
}

fn remove_dir(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        // Best effort: the work directory is cleaned up by its owner anyway.
        Err(e) => warn!("Teardown: couldn't remove {}: {}", path.display(), e),
    }
}
