//! Pool and dataset provisioning.
//!
//! A fixture is built in one sequential pass over its devices. Pools are
//! created with their altroot pinned under the work directory and named
//! `<run-id>-<pool>`, so concurrent runs sharing the kernel's pool namespace
//! never collide. Every pool export and dataset mount is registered on a
//! [`TeardownStack`] as soon as it exists; if any later step fails the stack
//! is unwound before the error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::FixtureConfig;
use crate::content;
use crate::driver_env::{ENV_CURRENT_ROOT_DATASET, ENV_POOL_DIR};
use crate::fstab::FstabSynthesizer;
use crate::materializer::{self, MaterializedDevice};
use crate::schema::{ContentMap, DatasetSpec, Device, DeviceKind, FixtureSpec, PoolSpec, CORRUPTED_DEVICE_NAME};
use crate::snapshot::{SnapshotProvisioner, LAST_BOOTED_KERNEL_PROPERTY};
use crate::storage::{StorageBackend, LEGACY_MOUNTPOINT};
use crate::teardown::{ReleaseAction, TeardownStack};
use crate::{Error, Result};

/// User property suffix marking a dataset as a boot candidate.
pub const BOOTFS_PROPERTY: &str = "bootfs";
/// User property suffix carrying the last time a dataset was booted.
pub const LAST_USED_PROPERTY: &str = "last-used";
/// User property suffix naming the run a pool was created for.
pub const RUN_PROPERTY: &str = "fixture-run";

/// Name a logical pool (or pool-relative dataset) gets within a run.
pub fn pool_identifier(run_id: &str, name: &str) -> String {
    if run_id.is_empty() {
        name.to_string()
    } else {
        format!("{}-{}", run_id, name)
    }
}

/// A dataset mounted while provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountRecord {
    pub dataset: String,
    pub path: PathBuf,
    /// Mounted by path because its mountpoint is `legacy`.
    pub legacy: bool,
}

/// What a provisioning pass produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionOutcome {
    /// Fully-qualified name of the dataset flagged as the current system root.
    pub root_dataset: Option<String>,
    pub run_id: String,
    pub work_dir: PathBuf,
    /// Pools created, in document order.
    pub pools: Vec<String>,
    /// Datasets mounted, in provisioning order.
    pub mounts: Vec<MountRecord>,
}

impl ProvisionOutcome {
    /// Root dataset name, empty when no dataset is flagged.
    pub fn root_dataset_name(&self) -> &str {
        self.root_dataset.as_deref().unwrap_or("")
    }

    /// Environment the program under test needs to find the fixture.
    pub fn driver_env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_POOL_DIR.to_string(), self.work_dir.display().to_string()),
            (
                ENV_CURRENT_ROOT_DATASET.to_string(),
                self.root_dataset_name().to_string(),
            ),
        ]
    }

    /// Path a dataset was mounted on, if it was.
    pub fn mount_path(&self, dataset: &str) -> Option<&Path> {
        self.mounts
            .iter()
            .find(|m| m.dataset == dataset)
            .map(|m| m.path.as_path())
    }
}

/// A provisioned fixture and the state still to release.
///
/// Dropping a fixture with pending release actions leaves pools imported;
/// hand it to [`Fixture::teardown`] or opt out with [`Fixture::into_persistent`].
#[derive(Debug)]
pub struct Fixture {
    outcome: ProvisionOutcome,
    teardown: TeardownStack,
}

impl Fixture {
    pub fn outcome(&self) -> &ProvisionOutcome {
        &self.outcome
    }

    pub fn root_dataset(&self) -> Option<&str> {
        self.outcome.root_dataset.as_deref()
    }

    pub fn driver_env(&self) -> Vec<(String, String)> {
        self.outcome.driver_env()
    }

    /// Release actions still pending, in registration order.
    pub fn pending_release(&self) -> &[ReleaseAction] {
        self.teardown.actions()
    }

    /// Release everything this fixture registered.
    pub async fn teardown(mut self, backend: &dyn StorageBackend) -> Result<()> {
        self.teardown.unwind(backend).await
    }

    /// Keep the fixture's state in place and return what was provisioned.
    pub fn into_persistent(mut self) -> ProvisionOutcome {
        let forgotten = self.teardown.forget();
        debug!("Leaving {} release action(s) to the caller", forgotten.len());
        std::mem::take(&mut self.outcome)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if !self.teardown.is_empty() {
            warn!(
                "Fixture for run {:?} dropped with {} pending release action(s); pools may stay imported",
                self.outcome.run_id,
                self.teardown.len()
            );
        }
    }
}

/// Provision every device of `spec` under `work_dir`.
///
/// Plain filesystem devices are populated concurrently with the pool pass
/// and are always joined before returning, whether or not the pools built.
pub async fn provision(
    backend: Arc<dyn StorageBackend>,
    config: &FixtureConfig,
    spec: &FixtureSpec,
    work_dir: &Path,
    run_id: &str,
) -> Result<Fixture> {
    info!(
        "Provisioning {} device(s) in {} for run {:?} using {}",
        spec.devices.len(),
        work_dir.display(),
        run_id,
        backend.name()
    );

    let mut builder = Builder {
        backend: backend.as_ref(),
        config,
        work_dir,
        run_id,
        fstab: FstabSynthesizer::new(work_dir, run_id),
        teardown: TeardownStack::new(),
        outcome: ProvisionOutcome {
            run_id: run_id.to_string(),
            work_dir: work_dir.to_path_buf(),
            ..Default::default()
        },
    };
    let mut plain_tasks = JoinSet::new();

    let built = builder.build(spec, &backend, &mut plain_tasks).await;
    let joined = join_plain_tasks(&mut plain_tasks).await;
    let result = match (built, joined) {
        (Err(e), Err(plain)) => {
            error!("Plain filesystem device failed as well: {}", plain);
            Err(e)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    };

    let Builder {
        mut teardown, outcome, ..
    } = builder;
    match result {
        Ok(()) => {
            info!(
                "Provisioned {} pool(s), root dataset {:?}",
                outcome.pools.len(),
                outcome.root_dataset_name()
            );
            Ok(Fixture { outcome, teardown })
        }
        Err(e) => {
            error!("Provisioning failed, releasing what was built: {}", e);
            if let Err(cleanup) = teardown.unwind(backend.as_ref()).await {
                warn!("Cleanup after failed provisioning was incomplete: {}", cleanup);
            }
            Err(e)
        }
    }
}

struct Builder<'a> {
    backend: &'a dyn StorageBackend,
    config: &'a FixtureConfig,
    work_dir: &'a Path,
    run_id: &'a str,
    fstab: FstabSynthesizer,
    teardown: TeardownStack,
    outcome: ProvisionOutcome,
}

impl Builder<'_> {
    async fn build(
        &mut self,
        spec: &FixtureSpec,
        shared: &Arc<dyn StorageBackend>,
        plain_tasks: &mut JoinSet<Result<()>>,
    ) -> Result<()> {
        for device in &spec.devices {
            let materialized = materializer::materialize(device, self.work_dir, self.config.device_size)?;
            match &device.kind {
                DeviceKind::StoragePool(pool) => {
                    self.provision_pool(device, &materialized, pool).await?;
                }
                DeviceKind::PlainFilesystem { content } => {
                    let task = PlainFilesystemTask {
                        backend: Arc::clone(shared),
                        device: materialized.backing_files[0].clone(),
                        mount_dir: materialized.mount_dir.clone(),
                        content: content.clone(),
                        content_root: self.config.content_root.clone(),
                        timeout: self.config.format_timeout,
                    };
                    plain_tasks.spawn(task.run());
                }
                DeviceKind::Empty => {
                    debug!("Device {} is an empty disk", device.names[0]);
                }
            }
        }
        Ok(())
    }

    async fn provision_pool(&mut self, device: &Device, materialized: &MaterializedDevice, spec: &PoolSpec) -> Result<()> {
        let pool = pool_identifier(self.run_id, &spec.pool_name);
        info!("Creating pool {} on {:?}", pool, materialized.vdev.leaves());
        self.backend
            .create_pool(&pool, &materialized.vdev, &materialized.mount_dir)
            .await
            .map_err(|e| Error::storage(format!("create pool {}", pool), e))?;
        self.outcome.pools.push(pool.clone());
        if spec.keep_imported {
            info!("Pool {} stays imported after teardown", pool);
        } else {
            self.teardown.push(ReleaseAction::ExportPool { pool: pool.clone() });
        }
        if !self.run_id.is_empty() {
            self.set(&pool, &self.config.user_property(RUN_PROPERTY), self.run_id)
                .await?;
        }

        for dataset in &spec.datasets {
            self.provision_dataset(&pool, materialized, dataset).await?;
        }

        if device.names.iter().any(|name| name == CORRUPTED_DEVICE_NAME) {
            let path = materializer::backing_file_path(self.work_dir, CORRUPTED_DEVICE_NAME);
            materializer::scramble(&path)?;
        }
        Ok(())
    }

    async fn provision_dataset(&mut self, pool: &str, materialized: &MaterializedDevice, spec: &DatasetSpec) -> Result<()> {
        let name = if spec.is_pool_root() {
            pool.to_string()
        } else {
            format!("{}/{}", pool, spec.name)
        };

        if spec.is_pool_root() {
            self.backend
                .open_dataset(&name)
                .await
                .map_err(|e| Error::storage(format!("open dataset {}", name), e))?;
        } else {
            debug!("Creating dataset {}", name);
            self.backend
                .create_dataset(&name)
                .await
                .map_err(|e| Error::storage(format!("create dataset {}", name), e))?;
        }

        if let Some(mountpoint) = &spec.mountpoint {
            self.set(&name, "mountpoint", mountpoint).await?;
        }
        if let Some(canmount) = spec.canmount.property_value() {
            self.set(&name, "canmount", canmount).await?;
            if let Err(e) = self.backend.unmount_dataset(&name).await {
                debug!("No stale mount for {}: {}", name, e.message());
            }
        }

        let mounted = if spec.canmount.should_mount() {
            Some(self.mount(&name, materialized, spec).await?)
        } else {
            None
        };

        if spec.bootfs {
            self.set(&name, &self.config.user_property(BOOTFS_PROPERTY), "yes")
                .await?;
        }
        if let Some(last_used) = spec.last_used {
            self.set(
                &name,
                &self.config.user_property(LAST_USED_PROPERTY),
                &last_used.timestamp().to_string(),
            )
            .await?;
        }
        if let Some(kernel) = &spec.last_booted_kernel {
            self.set(&name, &self.config.user_property(LAST_BOOTED_KERNEL_PROPERTY), kernel)
                .await?;
        }

        if spec.is_current_system_root {
            if let Some(existing) = &self.outcome.root_dataset {
                return Err(Error::provisioning(
                    format!("record root dataset {}", name),
                    format!("{} is already flagged as the current system root", existing),
                ));
            }
            info!("Dataset {} is the current system root", name);
            self.outcome.root_dataset = Some(name.clone());
        }

        SnapshotProvisioner {
            backend: self.backend,
            config: self.config,
            fstab: &self.fstab,
        }
        .provision_all(&name, spec, mounted.as_deref())
        .await?;

        match &mounted {
            Some(path) => {
                content::replace(&spec.content, path, &self.config.content_root)?;
                self.fstab
                    .complete_system(spec.mountpoint.as_deref(), path, spec.last_used, &spec.fstab)?;
            }
            None if !spec.content.is_empty() || !spec.fstab.is_empty() => {
                warn!("Dataset {} is not mounted, its content and fstab are skipped", name);
            }
            None => {}
        }
        Ok(())
    }

    /// Mount a dataset at its effective mountpoint and register its release.
    async fn mount(&mut self, name: &str, materialized: &MaterializedDevice, spec: &DatasetSpec) -> Result<PathBuf> {
        // The mountpoint may be inherited, so read back what the pool resolved.
        let mountpoint = self
            .backend
            .get_property(name, "mountpoint")
            .await
            .map_err(|e| Error::storage(format!("get mount point for {}", name), e))?;

        let legacy = mountpoint == LEGACY_MOUNTPOINT;
        let path = if legacy {
            let path = materialized.mount_dir.clone();
            self.backend
                .mount_legacy(name, &path)
                .await
                .map_err(|e| Error::storage(format!("manually mount dataset {}", name), e))?;
            path
        } else {
            self.backend
                .mount_dataset(name)
                .await
                .map_err(|e| Error::storage(format!("mount dataset {}", name), e))?;
            PathBuf::from(mountpoint)
        };
        info!("Mounted {} on {}", name, path.display());

        self.outcome.mounts.push(MountRecord {
            dataset: name.to_string(),
            path: path.clone(),
            legacy,
        });
        if spec.keep_imported {
            info!("Dataset {} stays mounted after teardown", name);
        } else {
            self.teardown.push(ReleaseAction::RemoveMountDir { path: path.clone() });
            self.teardown.push(ReleaseAction::UnmountDataset {
                dataset: name.to_string(),
                path: path.clone(),
                legacy,
            });
        }
        Ok(path)
    }

    async fn set(&self, target: &str, property: &str, value: &str) -> Result<()> {
        debug!("Setting {}={} on {}", property, value, target);
        self.backend
            .set_property(target, property, value)
            .await
            .map_err(|e| Error::storage(format!("set {} on {}", property, target), e))
    }
}

/// Format, mount, populate and unmount one plain filesystem device.
struct PlainFilesystemTask {
    backend: Arc<dyn StorageBackend>,
    device: PathBuf,
    mount_dir: PathBuf,
    content: ContentMap,
    content_root: PathBuf,
    timeout: Duration,
}

impl PlainFilesystemTask {
    async fn run(self) -> Result<()> {
        info!("Preparing plain filesystem on {}", self.device.display());
        match tokio::time::timeout(self.timeout, self.populate()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Plain filesystem on {} did not finish within {:?}",
                    self.device.display(),
                    self.timeout
                );
                if let Err(e) = self.backend.unmount_path(&self.mount_dir).await {
                    debug!("Nothing to unmount at {}: {}", self.mount_dir.display(), e.message());
                }
                Err(Error::FormatTimeout {
                    path: self.device.clone(),
                    timeout: self.timeout,
                })
            }
        }
    }

    async fn populate(&self) -> Result<()> {
        let device = self.device.display().to_string();
        self.backend
            .format_plain(&self.device)
            .await
            .map_err(|e| Error::storage(format!("format {} to ext4", device), e))?;
        self.backend
            .mount_plain(&self.device, &self.mount_dir)
            .await
            .map_err(|e| Error::storage(format!("mount ext4 partition {}", device), e))?;

        let populated = content::replace(&self.content, &self.mount_dir, &self.content_root);
        let unmounted = self
            .backend
            .unmount_path(&self.mount_dir)
            .await
            .map_err(|e| Error::storage(format!("unmount ext4 partition {}", device), e));
        populated.and(unmounted)
    }
}

/// Join every plain filesystem task, returning the first failure.
async fn join_plain_tasks(tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    let mut first = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(Error::provisioning("plain filesystem task", e)));
        if let Err(e) = result {
            if first.is_none() {
                first = Some(e);
            } else {
                error!("Plain filesystem device failed: {}", e);
            }
        }
    }
    first.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_identifiers_are_run_scoped() {
        assert_eq!(pool_identifier("run-a", "data"), "run-a-data");
        assert_eq!(pool_identifier("", "data"), "data");
        assert_eq!(pool_identifier("r", "rpool/boot"), "r-rpool/boot");
    }

    #[test]
    fn driver_env_points_at_the_work_dir() {
        let outcome = ProvisionOutcome {
            root_dataset: Some("r-rpool/ROOT/ubuntu".to_string()),
            run_id: "r".to_string(),
            work_dir: PathBuf::from("/tmp/w"),
            ..Default::default()
        };
        assert_eq!(
            outcome.driver_env(),
            vec![
                ("TEST_POOL_DIR".to_string(), "/tmp/w".to_string()),
                (
                    "TEST_MOCKZFS_CURRENT_ROOT_DATASET".to_string(),
                    "r-rpool/ROOT/ubuntu".to_string()
                ),
            ]
        );
        assert_eq!(ProvisionOutcome::default().root_dataset_name(), "");
    }
}
