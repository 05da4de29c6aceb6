//! Test helpers for provisioning fixtures in throwaway directories.
//!
//! Provides a work directory for backing files and a payload repository
//! populated with small system trees, both removed when the environment drops.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use zfs_fixtures::{EmulatorBackend, FixtureConfig, FixtureContext};

/// Backing files stay sparse, but keep them small anyway.
pub const TEST_DEVICE_SIZE: u64 = 4 * 1024 * 1024;

/// A work directory and payload repository for one test.
pub struct FixtureTestEnvironment {
    /// Directory backing files, altroots and mount points are created in.
    pub work_dir: PathBuf,
    /// Payload repository root.
    pub content_root: PathBuf,
    _work: TempDir,
    _content: TempDir,
}

impl FixtureTestEnvironment {
    /// Create a new environment with the standard payloads.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let work = TempDir::new()?;
        let content = TempDir::new()?;
        write_payloads(content.path())?;

        Ok(Self {
            work_dir: work.path().to_path_buf(),
            content_root: content.path().to_path_buf(),
            _work: work,
            _content: content,
        })
    }

    /// Configuration pointing at this environment's payloads.
    pub fn config(&self) -> FixtureConfig {
        FixtureConfig::new()
            .content_root(&self.content_root)
            .device_size(TEST_DEVICE_SIZE)
    }

    /// Context backed by a fresh emulator.
    pub fn emulated(&self) -> (FixtureContext, Arc<EmulatorBackend>) {
        FixtureContext::emulated(self.config())
    }

    /// A sub-directory of the work directory, for a second concurrent run.
    pub fn sub_work_dir(&self, name: &str) -> PathBuf {
        let dir = self.work_dir.join(name);
        fs::create_dir_all(&dir).unwrap_or_else(|e| panic!("couldn't create {}: {}", dir.display(), e));
        dir
    }
}

fn write_payloads(root: &Path) -> std::io::Result<()> {
    let rootfs = root.join("rootfs");
    fs::create_dir_all(rootfs.join("etc"))?;
    fs::create_dir_all(rootfs.join("boot"))?;
    fs::write(rootfs.join("etc/machine-id"), "8b1f0f5e6a5b4c2d9e7f0a1b2c3d4e5f\n")?;
    fs::write(
        rootfs.join("etc/os-release"),
        "NAME=\"Ubuntu\"\nVERSION=\"20.04 LTS (Focal Fossa)\"\nID=ubuntu\n",
    )?;
    fs::write(rootfs.join("boot/vmlinuz-5.4.0-21-generic"), "kernel")?;
    fs::write(rootfs.join("boot/initrd.img-5.4.0-21-generic"), "initrd")?;

    let old = root.join("rootfs-old");
    fs::create_dir_all(old.join("etc"))?;
    fs::write(old.join("etc/machine-id"), "8b1f0f5e6a5b4c2d9e7f0a1b2c3d4e5f\n")?;
    fs::write(old.join("etc/os-release"), "NAME=\"Ubuntu\"\nVERSION=\"19.10\"\n")?;

    let efi = root.join("efi");
    fs::create_dir_all(efi.join("EFI/ubuntu"))?;
    fs::write(efi.join("EFI/ubuntu/grub.cfg"), "search.fs_uuid 1234 root\n")?;

    fs::create_dir_all(root.join("home/user"))?;
    fs::write(root.join("home/user/.profile"), "# profile\n")?;
    Ok(())
}

/// Whether the tests run with root privileges.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}
