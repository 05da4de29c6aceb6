use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use zfs_fixtures::schema::{self, DeviceKind};
use zfs_fixtures::FixtureSpec;

use crate::{print_json, GlobalArgs};

/// Arguments for checking a fixture document
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Fixture document (YAML)
    #[arg(value_name = "FIXTURE")]
    pub fixture: PathBuf,
}

/// What a fixture document declares, per device.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub names: Vec<String>,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    pub datasets: usize,
    pub snapshots: usize,
    pub keep_imported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_root: Option<String>,
}

impl CheckArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let spec = schema::load(&self.fixture)
            .with_context(|| format!("Invalid fixture {}", self.fixture.display()))?;
        let summary = summarize(&spec);

        if global.json {
            return print_json(&summary);
        }
        println!("{}: {} device(s)", self.fixture.display(), summary.len());
        for device in &summary {
            println!("  {}", describe(device));
        }
        Ok(())
    }
}

pub fn summarize(spec: &FixtureSpec) -> Vec<DeviceSummary> {
    spec.devices
        .iter()
        .map(|device| {
            let mut summary = DeviceSummary {
                names: device.names.clone(),
                kind: "empty",
                pool: None,
                datasets: 0,
                snapshots: 0,
                keep_imported: false,
                system_root: None,
            };
            match &device.kind {
                DeviceKind::StoragePool(pool) => {
                    summary.kind = "zfs";
                    summary.pool = Some(pool.pool_name.clone());
                    summary.datasets = pool.datasets.len();
                    summary.snapshots = pool.datasets.iter().map(|d| d.snapshots.len()).sum();
                    summary.keep_imported = pool.keep_imported;
                    summary.system_root = pool
                        .datasets
                        .iter()
                        .find(|d| d.is_current_system_root)
                        .map(|d| d.name.clone());
                }
                DeviceKind::PlainFilesystem { .. } => summary.kind = "ext4",
                DeviceKind::Empty => {}
            }
            summary
        })
        .collect()
}

fn describe(device: &DeviceSummary) -> String {
    let names = device.names.join(",");
    match &device.pool {
        Some(pool) => {
            let mut line = format!(
                "{}: zfs pool {} ({} dataset(s), {} snapshot(s))",
                names, pool, device.datasets, device.snapshots
            );
            if let Some(root) = &device.system_root {
                line.push_str(&format!(", system root {}", root));
            }
            if device.keep_imported {
                line.push_str(", kept imported");
            }
            line
        }
        None => format!("{}: {}", names, device.kind),
    }
}
