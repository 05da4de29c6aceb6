use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use zfs_fixtures::schema;

use crate::{print_json, GlobalArgs};

/// Arguments for provisioning a fixture that outlives the command
#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Fixture document (YAML)
    #[arg(value_name = "FIXTURE")]
    pub fixture: PathBuf,

    /// Directory for backing files and mount points
    #[arg(long = "work-dir", value_name = "DIR")]
    pub work_dir: PathBuf,

    /// Run identifier prefixed to every pool name
    #[arg(long = "run-id", value_name = "ID", default_value = "")]
    pub run_id: String,
}

impl ProvisionArgs {
    pub async fn run(self, global: &GlobalArgs) -> Result<()> {
        let spec = schema::load(&self.fixture)
            .with_context(|| format!("Invalid fixture {}", self.fixture.display()))?;
        let context = global.context()?;

        std::fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;
        let fixture = context
            .provision(&spec, &self.work_dir, &self.run_id)
            .await
            .context("Provisioning failed")?;

        // Releasing is left to `fixturectl audit`.
        let outcome = fixture.into_persistent();
        info!("Provisioned {} pool(s) in {}", outcome.pools.len(), self.work_dir.display());

        if global.json {
            return print_json(&outcome);
        }
        println!("{}", outcome.root_dataset_name());
        Ok(())
    }
}

/// Arguments for auditing and removing a run's pools
#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Fixture document the run was provisioned from
    #[arg(value_name = "FIXTURE")]
    pub fixture: PathBuf,

    /// Run identifier the pools were provisioned with
    #[arg(long = "run-id", value_name = "ID", default_value = "")]
    pub run_id: String,
}

impl AuditArgs {
    pub async fn run(self, global: &GlobalArgs) -> Result<()> {
        let spec = schema::load(&self.fixture)
            .with_context(|| format!("Invalid fixture {}", self.fixture.display()))?;
        let context = global.context()?;

        context.audit(&spec, &self.run_id).await.context("Audit failed")?;
        info!("Audit of run {:?} passed", self.run_id);
        Ok(())
    }
}
