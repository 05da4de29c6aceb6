//! Storage subsystem seam.
//!
//! Everything the engine does to pools, datasets and mounts goes through
//! [`StorageBackend`]. [`ZfsCli`] drives the real kernel module through the
//! `zpool`/`zfs` programs; [`EmulatorBackend`] keeps the same state in memory
//! so fixtures can be exercised without root.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;

pub mod cli;
pub mod emulator;

pub use cli::ZfsCli;
pub use emulator::EmulatorBackend;

/// Result type for storage subsystem operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Mountpoint value meaning "mounted manually, outside of zfs".
pub const LEGACY_MOUNTPOINT: &str = "legacy";

/// Failure reported by the storage subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{program} {} failed (exit code {}): {stderr}", .args.join(" "), exit_code_label(.exit_code))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} failed: {source}")]
    Syscall {
        operation: String,
        #[source]
        source: Errno,
    },

    #[error("{0}")]
    Emulated(String),
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// How a storage failure should be treated by teardown and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The pool or dataset is already gone.
    Absent,
    /// The target was not mounted in the first place.
    NotMounted,
    /// Anything else: a real failure.
    Other,
}

impl StorageError {
    /// Human readable message the subsystem reported.
    pub fn message(&self) -> String {
        match self {
            StorageError::CommandFailed { stderr, .. } => stderr.clone(),
            StorageError::Spawn { source, .. } => source.to_string(),
            StorageError::Syscall { source, .. } => source.desc().to_string(),
            StorageError::Emulated(message) => message.clone(),
        }
    }

    /// Classify this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            StorageError::Syscall { source, .. } => match source {
                Errno::EINVAL => FailureKind::NotMounted,
                Errno::ENOENT => FailureKind::Absent,
                _ => FailureKind::Other,
            },
            _ => classify_failure(&self.message()),
        }
    }
}

/// Translate storage subsystem error text into a [`FailureKind`].
///
/// libzfs and the CLI only report these conditions as text, so this is the
/// one place that knows the wording. Keep it in sync with the messages of
/// `zpool`, `zfs` and `umount`.
pub fn classify_failure(message: &str) -> FailureKind {
    let message = message.to_lowercase();
    const ABSENT: &[&str] = &[
        "no pools available",
        "dataset does not exist",
        "no such pool",
        "no such pool or dataset",
        "could not find any pools",
    ];
    const NOT_MOUNTED: &[&str] = &["not currently mounted", "not mounted"];

    if ABSENT.iter().any(|needle| message.contains(needle)) {
        FailureKind::Absent
    } else if NOT_MOUNTED.iter().any(|needle| message.contains(needle)) {
        FailureKind::NotMounted
    } else {
        FailureKind::Other
    }
}

/// Virtual device a pool is built on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualDevice {
    /// One file leaf.
    Single(PathBuf),
    /// A mirror of two or more file leaves.
    Mirror(Vec<PathBuf>),
}

impl VirtualDevice {
    /// Build the device for a set of backing files: one leaf is a plain file vdev, more is a mirror.
    pub fn from_leaves(mut leaves: Vec<PathBuf>) -> Option<Self> {
        match leaves.len() {
            0 => None,
            1 => leaves.pop().map(VirtualDevice::Single),
            _ => Some(VirtualDevice::Mirror(leaves)),
        }
    }

    /// Backing files of this device.
    pub fn leaves(&self) -> &[PathBuf] {
        match self {
            VirtualDevice::Single(leaf) => std::slice::from_ref(leaf),
            VirtualDevice::Mirror(leaves) => leaves,
        }
    }

    /// Whether this device is a mirror.
    pub fn is_mirror(&self) -> bool {
        matches!(self, VirtualDevice::Mirror(_))
    }

    /// vdev arguments as `zpool create` expects them.
    pub fn zpool_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.is_mirror() {
            args.push("mirror".to_string());
        }
        args.extend(self.leaves().iter().map(|p| p.display().to_string()));
        args
    }
}

/// Operations the engine needs from the storage subsystem.
///
/// Dataset and snapshot names are fully qualified (`pool/child`,
/// `pool/child@snap`).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human readable backend name, used in logs.
    fn name(&self) -> &'static str;

    /// Create a pool on `vdev` with its alternate root pinned to `altroot`.
    async fn create_pool(&self, pool: &str, vdev: &VirtualDevice, altroot: &Path) -> StorageResult<()>;

    /// Names of every imported pool.
    async fn list_pools(&self) -> StorageResult<Vec<String>>;

    /// Export a pool, unmounting its datasets.
    async fn export_pool(&self, pool: &str) -> StorageResult<()>;

    /// Destroy an imported pool.
    async fn destroy_pool(&self, pool: &str) -> StorageResult<()>;

    /// Check that an existing dataset can be opened.
    async fn open_dataset(&self, dataset: &str) -> StorageResult<()>;

    /// Create a filesystem dataset without mounting it.
    async fn create_dataset(&self, dataset: &str) -> StorageResult<()>;

    /// Set a native or user property on a dataset or snapshot.
    async fn set_property(&self, target: &str, property: &str, value: &str) -> StorageResult<()>;

    /// Read a property value, inherited or not.
    async fn get_property(&self, target: &str, property: &str) -> StorageResult<String>;

    /// Mount a dataset at its (altroot-prefixed) mountpoint.
    async fn mount_dataset(&self, dataset: &str) -> StorageResult<()>;

    /// Unmount a dataset mounted by zfs.
    async fn unmount_dataset(&self, dataset: &str) -> StorageResult<()>;

    /// Mount a dataset whose mountpoint is `legacy` at an explicit path.
    async fn mount_legacy(&self, dataset: &str, target: &Path) -> StorageResult<()>;

    /// Take a snapshot.
    async fn snapshot(&self, snapshot: &str) -> StorageResult<()>;

    /// Put an ext4 filesystem on a backing file.
    async fn format_plain(&self, device: &Path) -> StorageResult<()>;

    /// Mount an ext4 backing file.
    async fn mount_plain(&self, device: &Path, target: &Path) -> StorageResult<()>;

    /// Unmount whatever is mounted at `target`.
    async fn unmount_path(&self, target: &Path) -> StorageResult<()>;
}
