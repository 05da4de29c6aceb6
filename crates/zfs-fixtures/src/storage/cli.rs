//! Storage backend driving the real kernel module through `zpool` and `zfs`.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use nix::mount::{mount, umount, MsFlags};
use tokio::process::Command;
use tracing::debug;

use super::{StorageBackend, StorageError, StorageResult, VirtualDevice};
use crate::config::FixtureConfig;

/// Backend shelling out to the ZFS command line tools.
#[derive(Debug, Clone)]
pub struct ZfsCli {
    zfs: String,
    zpool: String,
}

impl Default for ZfsCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ZfsCli {
    /// Create a backend using `zfs` and `zpool` from `PATH`.
    pub fn new() -> Self {
        Self {
            zfs: "zfs".to_string(),
            zpool: "zpool".to_string(),
        }
    }

    /// Create a backend using the programs named in the configuration.
    pub fn from_config(config: &FixtureConfig) -> Self {
        Self {
            zfs: config.zfs_bin.clone(),
            zpool: config.zpool_bin.clone(),
        }
    }

    /// Check if ZFS is available on this system.
    pub fn available() -> bool {
        if !cfg!(target_os = "linux") {
            return false;
        }

        std::process::Command::new("which")
            .arg("zfs")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Execute a command, returning its trimmed stdout.
    async fn run(&self, program: &str, args: &[&str]) -> StorageResult<String> {
        debug!("Running command: {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| StorageError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(StorageError::CommandFailed {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn zfs(&self, args: &[&str]) -> StorageResult<String> {
        self.run(&self.zfs, args).await
    }

    async fn zpool(&self, args: &[&str]) -> StorageResult<String> {
        self.run(&self.zpool, args).await
    }
}

#[async_trait]
impl StorageBackend for ZfsCli {
    fn name(&self) -> &'static str {
        "zfs-cli"
    }

    async fn create_pool(&self, pool: &str, vdev: &VirtualDevice, altroot: &Path) -> StorageResult<()> {
        let altroot = altroot.display().to_string();
        let vdev_args = vdev.zpool_args();
        // -R pins the altroot and disables the cachefile so test pools never
        // get auto-imported on the host.
        let mut args = vec!["create", "-f", "-R", altroot.as_str(), pool];
        args.extend(vdev_args.iter().map(String::as_str));
        self.zpool(&args).await.map(|_| ())
    }

    async fn list_pools(&self) -> StorageResult<Vec<String>> {
        let stdout = self.zpool(&["list", "-H", "-o", "name"]).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != "no pools available")
            .map(str::to_string)
            .collect())
    }

    async fn export_pool(&self, pool: &str) -> StorageResult<()> {
        self.zpool(&["export", "-f", pool]).await.map(|_| ())
    }

    async fn destroy_pool(&self, pool: &str) -> StorageResult<()> {
        self.zpool(&["destroy", "-f", pool]).await.map(|_| ())
    }

    async fn open_dataset(&self, dataset: &str) -> StorageResult<()> {
        self.zfs(&["list", "-H", "-o", "name", dataset]).await.map(|_| ())
    }

    async fn create_dataset(&self, dataset: &str) -> StorageResult<()> {
        // Properties are applied afterwards, so never mount on creation.
        self.zfs(&["create", "-u", dataset]).await.map(|_| ())
    }

    async fn set_property(&self, target: &str, property: &str, value: &str) -> StorageResult<()> {
        let assignment = format!("{}={}", property, value);
        self.zfs(&["set", &assignment, target]).await.map(|_| ())
    }

    async fn get_property(&self, target: &str, property: &str) -> StorageResult<String> {
        self.zfs(&["get", "-H", "-o", "value", property, target]).await
    }

    async fn mount_dataset(&self, dataset: &str) -> StorageResult<()> {
        self.zfs(&["mount", dataset]).await.map(|_| ())
    }

    async fn unmount_dataset(&self, dataset: &str) -> StorageResult<()> {
        self.zfs(&["unmount", dataset]).await.map(|_| ())
    }

    async fn mount_legacy(&self, dataset: &str, target: &Path) -> StorageResult<()> {
        debug!("Mounting legacy dataset {} on {}", dataset, target.display());
        mount(Some(dataset), target, Some("zfs"), MsFlags::empty(), None::<&str>).map_err(|source| {
            StorageError::Syscall {
                operation: format!("mount {} on {}", dataset, target.display()),
                source,
            }
        })
    }

    async fn snapshot(&self, snapshot: &str) -> StorageResult<()> {
        self.zfs(&["snapshot", snapshot]).await.map(|_| ())
    }

    async fn format_plain(&self, device: &Path) -> StorageResult<()> {
        let device = device.display().to_string();
        self.run("mkfs.ext4", &["-q", "-F", &device]).await.map(|_| ())
    }

    async fn mount_plain(&self, device: &Path, target: &Path) -> StorageResult<()> {
        let device = device.display().to_string();
        let target = target.display().to_string();
        self.run("mount", &["-t", "ext4", &device, &target]).await.map(|_| ())
    }

    async fn unmount_path(&self, target: &Path) -> StorageResult<()> {
        debug!("Unmounting {}", target.display());
        umount(target).map_err(|source| StorageError::Syscall {
            operation: format!("umount {}", target.display()),
            source,
        })
    }
}
