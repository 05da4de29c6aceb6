//! Snapshots taken while a dataset is provisioned.

use std::path::Path;

use chrono::{DateTime, Local, TimeZone, Utc};
use tracing::info;

use crate::config::FixtureConfig;
use crate::content;
use crate::fstab::FstabSynthesizer;
use crate::schema::{DatasetSpec, SnapshotSpec};
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// User property suffix carrying a snapshot's test creation time.
pub const CREATION_PROPERTY: &str = "creation.test";
/// User property suffix carrying the kernel a dataset or snapshot last booted.
pub const LAST_BOOTED_KERNEL_PROPERTY: &str = "last-booted-kernel";

/// Encode a creation time as the value of the creation property.
///
/// The instant is taken in the host's local zone before it is reduced to
/// epoch seconds, which is what tools reading `creation` expect.
pub fn encode_creation(created: DateTime<Utc>) -> String {
    created.with_timezone(&Local).timestamp().to_string()
}

/// Decode a creation property value back into a UTC instant.
pub fn decode_creation(value: &str) -> Option<DateTime<Utc>> {
    let seconds: i64 = value.trim().parse().ok()?;
    Local
        .timestamp_opt(seconds, 0)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

/// Takes the snapshots of one dataset in document order.
pub(crate) struct SnapshotProvisioner<'a> {
    pub backend: &'a dyn StorageBackend,
    pub config: &'a FixtureConfig,
    pub fstab: &'a FstabSynthesizer,
}

impl SnapshotProvisioner<'_> {
    /// Populate, snapshot and tag every snapshot of `spec`.
    ///
    /// Snapshot content and fstab entries are written into the mounted
    /// dataset first, so each snapshot captures its own state; the dataset's
    /// own content replaces it afterwards.
    pub async fn provision_all(&self, dataset: &str, spec: &DatasetSpec, mounted: Option<&Path>) -> Result<()> {
        for snapshot in &spec.snapshots {
            self.provision(dataset, spec, snapshot, mounted).await?;
        }
        Ok(())
    }

    async fn provision(
        &self,
        dataset: &str,
        spec: &DatasetSpec,
        snapshot: &SnapshotSpec,
        mounted: Option<&Path>,
    ) -> Result<()> {
        let full_name = format!("{}@{}", dataset, snapshot.name);

        match mounted {
            Some(path) => {
                content::replace(&snapshot.content, path, &self.config.content_root)?;
                // Snapshots never carry the dataset's last-used time, so boot
                // metadata falls back to the far future instant.
                self.fstab
                    .complete_system(spec.mountpoint.as_deref(), path, None, &snapshot.fstab)?;
            }
            None if !snapshot.content.is_empty() || !snapshot.fstab.is_empty() => {
                return Err(Error::snapshot(
                    &full_name,
                    format!("{} is not mounted, can't populate snapshot content", dataset),
                ));
            }
            None => {}
        }

        info!("Taking snapshot {}", full_name);
        self.backend
            .snapshot(&full_name)
            .await
            .map_err(|e| Error::snapshot(&full_name, e))?;

        if let Some(created) = snapshot.creation_date {
            let property = self.config.user_property(CREATION_PROPERTY);
            self.backend
                .set_property(&full_name, &property, &encode_creation(created))
                .await
                .map_err(|e| Error::snapshot(&full_name, e))?;
        }
        if let Some(kernel) = &snapshot.last_booted_kernel {
            let property = self.config.user_property(LAST_BOOTED_KERNEL_PROPERTY);
            self.backend
                .set_property(&full_name, &property, kernel)
                .await
                .map_err(|e| Error::snapshot(&full_name, e))?;
        }
        Ok(())
    }
}
