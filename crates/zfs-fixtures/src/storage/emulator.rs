//! In-memory storage backend.
//!
//! Models the subset of pool and dataset behaviour fixtures depend on:
//! inherited mountpoints, altroot prefixes, `canmount`, legacy mounts and
//! user properties. Mounting creates the target directory on disk, so content
//! replication and fstab synthesis run against real files. Failures use the
//! same wording as the real tools so [`classify_failure`](super::classify_failure)
//! treats both backends alike.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{StorageBackend, StorageError, StorageResult, VirtualDevice, LEGACY_MOUNTPOINT};

const NO_MOUNTPOINT: &str = "none";
const UNSET_VALUE: &str = "-";

#[derive(Debug)]
struct EmulatedPool {
    altroot: PathBuf,
    vdev: VirtualDevice,
}

#[derive(Debug, Default)]
struct EmulatedDataset {
    properties: BTreeMap<String, String>,
    mounted_at: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct EmulatorState {
    pools: BTreeMap<String, EmulatedPool>,
    datasets: BTreeMap<String, EmulatedDataset>,
    snapshots: BTreeMap<String, BTreeMap<String, String>>,
    formatted: BTreeSet<PathBuf>,
    plain_mounts: BTreeSet<PathBuf>,
    journal: Vec<String>,
}

/// Storage backend keeping pools and datasets in memory.
#[derive(Debug, Default)]
pub struct EmulatorBackend {
    state: RwLock<EmulatorState>,
}

fn failure(message: impl Into<String>) -> StorageError {
    StorageError::Emulated(message.into())
}

fn pool_of(name: &str) -> &str {
    name.split(['/', '@']).next().unwrap_or(name)
}

fn parent_of(dataset: &str) -> Option<&str> {
    dataset.rsplit_once('/').map(|(parent, _)| parent)
}

fn leaf_of(dataset: &str) -> &str {
    dataset.rsplit_once('/').map_or(dataset, |(_, leaf)| leaf)
}

/// Whether `name` is `pool` itself or something inside it.
fn belongs_to(name: &str, pool: &str) -> bool {
    pool_of(name) == pool
}

impl EmulatorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, EmulatorState>> {
        self.state
            .read()
            .map_err(|_| failure("emulator state lock poisoned"))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, EmulatorState>> {
        self.state
            .write()
            .map_err(|_| failure("emulator state lock poisoned"))
    }

    /// Every operation performed so far, in order, written as the equivalent command line.
    pub fn journal(&self) -> Vec<String> {
        self.read().map(|state| state.journal.clone()).unwrap_or_default()
    }

    /// Whether a pool is currently imported.
    pub fn is_imported(&self, pool: &str) -> bool {
        self.read()
            .map(|state| state.pools.contains_key(pool))
            .unwrap_or(false)
    }

    /// Read a property the way `zfs get -H -o value` would, or `None` if the target does not exist.
    pub fn property(&self, target: &str, property: &str) -> Option<String> {
        let state = self.read().ok()?;
        state.lookup(target, property).ok()
    }

    /// Where a dataset is mounted, if it is.
    pub fn mounted_at(&self, dataset: &str) -> Option<PathBuf> {
        let state = self.read().ok()?;
        state.datasets.get(dataset)?.mounted_at.clone()
    }

    /// Names of the snapshots taken of a dataset.
    pub fn snapshots_of(&self, dataset: &str) -> Vec<String> {
        let prefix = format!("{}@", dataset);
        self.read()
            .map(|state| {
                state
                    .snapshots
                    .keys()
                    .filter(|name| name.starts_with(&prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Import a pool behind the engine's back, the way a leaked pool from an earlier run would look.
    pub fn inject_pool(&self, pool: &str, altroot: &Path) {
        if let Ok(mut state) = self.write() {
            state.pools.insert(
                pool.to_string(),
                EmulatedPool {
                    altroot: altroot.to_path_buf(),
                    vdev: VirtualDevice::Mirror(Vec::new()),
                },
            );
            state.datasets.entry(pool.to_string()).or_default();
            state.journal.push(format!("inject {}", pool));
        }
    }
}

impl EmulatorState {
    fn dataset(&self, name: &str) -> StorageResult<&EmulatedDataset> {
        self.datasets
            .get(name)
            .ok_or_else(|| failure(format!("cannot open '{}': dataset does not exist", name)))
    }

    fn dataset_mut(&mut self, name: &str) -> StorageResult<&mut EmulatedDataset> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| failure(format!("cannot open '{}': dataset does not exist", name)))
    }

    fn pool(&self, name: &str) -> StorageResult<&EmulatedPool> {
        self.pools
            .get(name)
            .ok_or_else(|| failure(format!("cannot open '{}': no such pool", name)))
    }

    /// Mountpoint before the altroot is applied, following inheritance.
    fn raw_mountpoint(&self, dataset: &str) -> String {
        if let Some(value) = self.datasets.get(dataset).and_then(|d| d.properties.get("mountpoint")) {
            return value.clone();
        }
        match parent_of(dataset) {
            None => format!("/{}", dataset),
            Some(parent) => {
                let inherited = self.raw_mountpoint(parent);
                if inherited == LEGACY_MOUNTPOINT || inherited == NO_MOUNTPOINT {
                    inherited
                } else {
                    Path::new(&inherited).join(leaf_of(dataset)).display().to_string()
                }
            }
        }
    }

    /// Mountpoint as reported to callers: altroot-prefixed unless legacy or none.
    fn effective_mountpoint(&self, dataset: &str) -> StorageResult<String> {
        let raw = self.raw_mountpoint(dataset);
        if raw == LEGACY_MOUNTPOINT || raw == NO_MOUNTPOINT {
            return Ok(raw);
        }
        let pool = self.pool(pool_of(dataset))?;
        let relative = raw.trim_start_matches('/');
        let path = if relative.is_empty() {
            pool.altroot.clone()
        } else {
            pool.altroot.join(relative)
        };
        Ok(path.display().to_string())
    }

    fn user_property(&self, dataset: &str, property: &str) -> Option<String> {
        if let Some(value) = self.datasets.get(dataset).and_then(|d| d.properties.get(property)) {
            return Some(value.clone());
        }
        parent_of(dataset).and_then(|parent| self.user_property(parent, property))
    }

    fn lookup(&self, target: &str, property: &str) -> StorageResult<String> {
        if target.contains('@') {
            let properties = self
                .snapshots
                .get(target)
                .ok_or_else(|| failure(format!("cannot open '{}': dataset does not exist", target)))?;
            return Ok(properties
                .get(property)
                .cloned()
                .unwrap_or_else(|| UNSET_VALUE.to_string()));
        }

        let dataset = self.dataset(target)?;
        match property {
            "mountpoint" => self.effective_mountpoint(target),
            "canmount" => Ok(dataset
                .properties
                .get("canmount")
                .cloned()
                .unwrap_or_else(|| "on".to_string())),
            "mounted" => Ok(if dataset.mounted_at.is_some() { "yes" } else { "no" }.to_string()),
            "name" => Ok(target.to_string()),
            user if user.contains(':') => Ok(self
                .user_property(target, user)
                .unwrap_or_else(|| UNSET_VALUE.to_string())),
            other => Ok(dataset
                .properties
                .get(other)
                .cloned()
                .unwrap_or_else(|| UNSET_VALUE.to_string())),
        }
    }
}

#[async_trait]
impl StorageBackend for EmulatorBackend {
    fn name(&self) -> &'static str {
        "emulator"
    }

    async fn create_pool(&self, pool: &str, vdev: &VirtualDevice, altroot: &Path) -> StorageResult<()> {
        let mut state = self.write()?;
        if state.pools.contains_key(pool) {
            return Err(failure(format!("cannot create '{}': pool already exists", pool)));
        }
        for leaf in vdev.leaves() {
            if !leaf.is_file() {
                return Err(failure(format!(
                    "cannot open '{}': No such file or directory",
                    leaf.display()
                )));
            }
            let in_use = state
                .pools
                .values()
                .any(|other| other.vdev.leaves().iter().any(|l| l == leaf));
            if in_use {
                return Err(failure(format!(
                    "{} is part of active pool",
                    leaf.display()
                )));
            }
        }

        debug!("Emulating pool {} on {:?}", pool, vdev);
        state.pools.insert(
            pool.to_string(),
            EmulatedPool {
                altroot: altroot.to_path_buf(),
                vdev: vdev.clone(),
            },
        );
        state.datasets.insert(pool.to_string(), EmulatedDataset::default());
        let command = format!("zpool create -R {} {} {}", altroot.display(), pool, vdev.zpool_args().join(" "));
        state.journal.push(command);
        Ok(())
    }

    async fn list_pools(&self) -> StorageResult<Vec<String>> {
        let state = self.read()?;
        Ok(state.pools.keys().cloned().collect())
    }

    async fn export_pool(&self, pool: &str) -> StorageResult<()> {
        let mut state = self.write()?;
        state.pool(pool)?;
        state.pools.remove(pool);
        state.datasets.retain(|name, _| !belongs_to(name, pool));
        state.snapshots.retain(|name, _| !belongs_to(name, pool));
        state.journal.push(format!("zpool export -f {}", pool));
        Ok(())
    }

    async fn destroy_pool(&self, pool: &str) -> StorageResult<()> {
        let mut state = self.write()?;
        state.pool(pool)?;
        state.pools.remove(pool);
        state.datasets.retain(|name, _| !belongs_to(name, pool));
        state.snapshots.retain(|name, _| !belongs_to(name, pool));
        state.journal.push(format!("zpool destroy -f {}", pool));
        Ok(())
    }

    async fn open_dataset(&self, dataset: &str) -> StorageResult<()> {
        let state = self.read()?;
        state.dataset(dataset).map(|_| ())
    }

    async fn create_dataset(&self, dataset: &str) -> StorageResult<()> {
        let mut state = self.write()?;
        if state.datasets.contains_key(dataset) {
            return Err(failure(format!("cannot create '{}': dataset already exists", dataset)));
        }
        let parent = parent_of(dataset)
            .ok_or_else(|| failure(format!("cannot create '{}': missing dataset name", dataset)))?;
        if !state.datasets.contains_key(parent) {
            return Err(failure(format!("cannot create '{}': parent does not exist", dataset)));
        }
        state.datasets.insert(dataset.to_string(), EmulatedDataset::default());
        state.journal.push(format!("zfs create -u {}", dataset));
        Ok(())
    }

    async fn set_property(&self, target: &str, property: &str, value: &str) -> StorageResult<()> {
        let mut state = self.write()?;
        if target.contains('@') {
            let properties = state
                .snapshots
                .get_mut(target)
                .ok_or_else(|| failure(format!("cannot open '{}': dataset does not exist", target)))?;
            properties.insert(property.to_string(), value.to_string());
        } else {
            if property == "canmount" && !matches!(value, "on" | "off" | "noauto") {
                return Err(failure(format!("cannot set property for '{}': 'canmount' must be one of 'on | off | noauto'", target)));
            }
            state
                .dataset_mut(target)?
                .properties
                .insert(property.to_string(), value.to_string());
        }
        state.journal.push(format!("zfs set {}={} {}", property, value, target));
        Ok(())
    }

    async fn get_property(&self, target: &str, property: &str) -> StorageResult<String> {
        let state = self.read()?;
        state.lookup(target, property)
    }

    async fn mount_dataset(&self, dataset: &str) -> StorageResult<()> {
        let mut state = self.write()?;
        let current = state.dataset(dataset)?;
        if current.mounted_at.is_some() {
            return Err(failure(format!("cannot mount '{}': filesystem already mounted", dataset)));
        }
        if current.properties.get("canmount").map(String::as_str) == Some("off") {
            return Err(failure(format!(
                "cannot mount '{}': 'canmount' property is set to 'off'",
                dataset
            )));
        }
        let mountpoint = state.effective_mountpoint(dataset)?;
        if mountpoint == LEGACY_MOUNTPOINT {
            return Err(failure(format!(
                "cannot mount '{}': legacy mountpoint\nuse mount(8) to mount this filesystem",
                dataset
            )));
        }
        if mountpoint == NO_MOUNTPOINT {
            return Err(failure(format!("cannot mount '{}': no mountpoint set", dataset)));
        }

        let path = PathBuf::from(&mountpoint);
        std::fs::create_dir_all(&path)
            .map_err(|e| failure(format!("cannot mount '{}': failed to create mountpoint: {}", dataset, e)))?;
        state.dataset_mut(dataset)?.mounted_at = Some(path);
        state.journal.push(format!("zfs mount {}", dataset));
        Ok(())
    }

    async fn unmount_dataset(&self, dataset: &str) -> StorageResult<()> {
        let mut state = self.write()?;
        let entry = state.dataset_mut(dataset)?;
        if entry.mounted_at.take().is_none() {
            return Err(failure(format!("cannot unmount '{}': not currently mounted", dataset)));
        }
        state.journal.push(format!("zfs unmount {}", dataset));
        Ok(())
    }

    async fn mount_legacy(&self, dataset: &str, target: &Path) -> StorageResult<()> {
        let mut state = self.write()?;
        state.dataset(dataset)?;
        if state.raw_mountpoint(dataset) != LEGACY_MOUNTPOINT {
            return Err(failure(format!(
                "filesystem '{}' cannot be mounted using 'mount'",
                dataset
            )));
        }
        if !target.is_dir() {
            return Err(failure(format!(
                "mount: {}: mount point does not exist.",
                target.display()
            )));
        }
        state.dataset_mut(dataset)?.mounted_at = Some(target.to_path_buf());
        state
            .journal
            .push(format!("mount -t zfs {} {}", dataset, target.display()));
        Ok(())
    }

    async fn snapshot(&self, snapshot: &str) -> StorageResult<()> {
        let mut state = self.write()?;
        let (dataset, _) = snapshot
            .split_once('@')
            .ok_or_else(|| failure(format!("cannot create snapshot '{}': invalid snapshot name", snapshot)))?;
        state.dataset(dataset)?;
        if state.snapshots.contains_key(snapshot) {
            return Err(failure(format!("cannot create snapshot '{}': dataset already exists", snapshot)));
        }
        state.snapshots.insert(snapshot.to_string(), BTreeMap::new());
        state.journal.push(format!("zfs snapshot {}", snapshot));
        Ok(())
    }

    async fn format_plain(&self, device: &Path) -> StorageResult<()> {
        let mut state = self.write()?;
        if !device.is_file() {
            return Err(failure(format!(
                "The file {} does not exist and no size was specified.",
                device.display()
            )));
        }
        state.formatted.insert(device.to_path_buf());
        state.journal.push(format!("mkfs.ext4 -q -F {}", device.display()));
        Ok(())
    }

    async fn mount_plain(&self, device: &Path, target: &Path) -> StorageResult<()> {
        let mut state = self.write()?;
        if !state.formatted.contains(device) {
            return Err(failure(format!(
                "mount: {}: wrong fs type, bad option, bad superblock on {}",
                target.display(),
                device.display()
            )));
        }
        if !target.is_dir() {
            return Err(failure(format!(
                "mount: {}: mount point does not exist.",
                target.display()
            )));
        }
        if !state.plain_mounts.insert(target.to_path_buf()) {
            return Err(failure(format!("mount: {}: already mounted", target.display())));
        }
        state
            .journal
            .push(format!("mount -t ext4 {} {}", device.display(), target.display()));
        Ok(())
    }

    async fn unmount_path(&self, target: &Path) -> StorageResult<()> {
        let mut state = self.write()?;
        if !state.plain_mounts.remove(target) {
            let legacy = state
                .datasets
                .values_mut()
                .find(|d| d.mounted_at.as_deref() == Some(target));
            match legacy {
                Some(dataset) => dataset.mounted_at = None,
                None => return Err(failure(format!("umount: {}: not mounted.", target.display()))),
            }
        }
        state.journal.push(format!("umount {}", target.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{classify_failure, FailureKind};
    use tempfile::TempDir;

    fn backing_file(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(format!("{}.disk", name));
        std::fs::write(&path, b"").unwrap();
        path
    }

    async fn pool_with_altroot(dir: &TempDir) -> (EmulatorBackend, PathBuf) {
        let backend = EmulatorBackend::new();
        let altroot = dir.path().join("rpool");
        std::fs::create_dir_all(&altroot).unwrap();
        let vdev = VirtualDevice::Single(backing_file(dir, "rpool"));
        backend.create_pool("t-rpool", &vdev, &altroot).await.unwrap();
        (backend, altroot)
    }

    #[tokio::test]
    async fn mountpoints_inherit_and_honour_altroot() {
        let dir = TempDir::new().unwrap();
        let (backend, altroot) = pool_with_altroot(&dir).await;

        assert_eq!(
            backend.get_property("t-rpool", "mountpoint").await.unwrap(),
            altroot.join("t-rpool").display().to_string()
        );

        backend.set_property("t-rpool", "mountpoint", "/").await.unwrap();
        backend.create_dataset("t-rpool/ROOT").await.unwrap();
        backend.create_dataset("t-rpool/ROOT/ubuntu").await.unwrap();
        assert_eq!(
            backend.get_property("t-rpool/ROOT/ubuntu", "mountpoint").await.unwrap(),
            altroot.join("ROOT/ubuntu").display().to_string()
        );

        backend.set_property("t-rpool/ROOT/ubuntu", "mountpoint", "/").await.unwrap();
        assert_eq!(
            backend.get_property("t-rpool/ROOT/ubuntu", "mountpoint").await.unwrap(),
            altroot.display().to_string()
        );

        backend.set_property("t-rpool/ROOT", "mountpoint", "legacy").await.unwrap();
        backend.create_dataset("t-rpool/ROOT/other").await.unwrap();
        assert_eq!(
            backend.get_property("t-rpool/ROOT/other", "mountpoint").await.unwrap(),
            "legacy"
        );
    }

    #[tokio::test]
    async fn mount_rules_follow_canmount_and_legacy() {
        let dir = TempDir::new().unwrap();
        let (backend, altroot) = pool_with_altroot(&dir).await;
        backend.create_dataset("t-rpool/off").await.unwrap();
        backend.set_property("t-rpool/off", "canmount", "off").await.unwrap();
        let err = backend.mount_dataset("t-rpool/off").await.unwrap_err();
        assert!(err.message().contains("'canmount' property is set to 'off'"));

        backend.create_dataset("t-rpool/legacy").await.unwrap();
        backend.set_property("t-rpool/legacy", "mountpoint", "legacy").await.unwrap();
        assert!(backend.mount_dataset("t-rpool/legacy").await.is_err());
        backend.mount_legacy("t-rpool/legacy", &altroot).await.unwrap();
        assert_eq!(backend.mounted_at("t-rpool/legacy"), Some(altroot.clone()));
        backend.unmount_path(&altroot).await.unwrap();
        assert_eq!(backend.mounted_at("t-rpool/legacy"), None);

        let err = backend.unmount_dataset("t-rpool/off").await.unwrap_err();
        assert_eq!(classify_failure(&err.message()), FailureKind::NotMounted);
    }

    #[tokio::test]
    async fn mounting_creates_the_directory() {
        let dir = TempDir::new().unwrap();
        let (backend, altroot) = pool_with_altroot(&dir).await;
        backend.create_dataset("t-rpool/data").await.unwrap();
        backend.mount_dataset("t-rpool/data").await.unwrap();
        assert!(altroot.join("t-rpool/data").is_dir());
        assert_eq!(
            backend.get_property("t-rpool/data", "mounted").await.unwrap(),
            "yes"
        );
    }

    #[tokio::test]
    async fn user_properties_on_datasets_and_snapshots() {
        let dir = TempDir::new().unwrap();
        let (backend, _) = pool_with_altroot(&dir).await;
        backend.create_dataset("t-rpool/ROOT").await.unwrap();
        backend.set_property("t-rpool/ROOT", "org:prop", "v").await.unwrap();
        backend.create_dataset("t-rpool/ROOT/child").await.unwrap();
        assert_eq!(backend.property("t-rpool/ROOT/child", "org:prop").as_deref(), Some("v"));
        assert_eq!(backend.property("t-rpool", "org:prop").as_deref(), Some("-"));

        backend.snapshot("t-rpool/ROOT@s1").await.unwrap();
        backend.set_property("t-rpool/ROOT@s1", "org:creation", "42").await.unwrap();
        assert_eq!(backend.property("t-rpool/ROOT@s1", "org:creation").as_deref(), Some("42"));
        assert_eq!(backend.snapshots_of("t-rpool/ROOT"), vec!["t-rpool/ROOT@s1"]);
        assert!(backend.snapshot("t-rpool/ROOT@s1").await.is_err());
    }

    #[tokio::test]
    async fn export_forgets_pool_and_reports_absence() {
        let dir = TempDir::new().unwrap();
        let (backend, _) = pool_with_altroot(&dir).await;
        backend.create_dataset("t-rpool/data").await.unwrap();
        backend.export_pool("t-rpool").await.unwrap();

        assert!(!backend.is_imported("t-rpool"));
        assert!(backend.list_pools().await.unwrap().is_empty());
        let err = backend.export_pool("t-rpool").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Absent);
        let err = backend.open_dataset("t-rpool/data").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Absent);
    }

    #[tokio::test]
    async fn pool_creation_requires_unused_backing_files() {
        let dir = TempDir::new().unwrap();
        let (backend, altroot) = pool_with_altroot(&dir).await;
        let taken = VirtualDevice::Single(dir.path().join("rpool.disk"));
        assert!(backend.create_pool("t-other", &taken, &altroot).await.is_err());
        let missing = VirtualDevice::Single(dir.path().join("missing.disk"));
        assert!(backend.create_pool("t-other", &missing, &altroot).await.is_err());
        let fresh = VirtualDevice::Single(backing_file(&dir, "fresh"));
        let err = backend.create_pool("t-rpool", &fresh, &altroot).await.unwrap_err();
        assert!(err.message().contains("pool already exists"));
    }

    #[tokio::test]
    async fn plain_devices_must_be_formatted_before_mounting() {
        let dir = TempDir::new().unwrap();
        let backend = EmulatorBackend::new();
        let device = backing_file(&dir, "boot");
        let target = dir.path().join("boot");
        std::fs::create_dir_all(&target).unwrap();

        assert!(backend.mount_plain(&device, &target).await.is_err());
        backend.format_plain(&device).await.unwrap();
        backend.mount_plain(&device, &target).await.unwrap();
        backend.unmount_path(&target).await.unwrap();
        let err = backend.unmount_path(&target).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::NotMounted);
        assert_eq!(
            backend.journal(),
            vec![
                format!("mkfs.ext4 -q -F {}", device.display()),
                format!("mount -t ext4 {} {}", device.display(), target.display()),
                format!("umount {}", target.display()),
            ]
        );
    }
}
