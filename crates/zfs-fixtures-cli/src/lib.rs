//! fixturectl: operator CLI for ZFS fixtures

pub mod check;
pub mod fixture;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use zfs_fixtures::{FixtureConfig, FixtureContext, ZfsCli};

// Re-export CLI types for testing
pub use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fixturectl")]
#[command(about = "Provision, run against and audit ZFS storage fixtures")]
#[command(version, author, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand
#[derive(clap::Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Use the in-memory storage emulator instead of the zfs kernel module
    #[arg(long, global = true)]
    pub emulate: bool,

    /// Payload repository root (overrides FIXTURES_CONTENT_DIR)
    #[arg(long = "content-root", value_name = "DIR", global = true)]
    pub content_root: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long = "log-level", default_value = "info", global = true)]
    pub log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse a fixture document and summarize it
    Check(check::CheckArgs),
    /// Provision a fixture and leave it in place
    Provision(fixture::ProvisionArgs),
    /// Provision a fixture, run a command against it, then release everything
    Run(run::RunArgs),
    /// Check imported pools against a fixture and remove the run's pools
    Audit(fixture::AuditArgs),
}

impl GlobalArgs {
    /// Install the tracing subscriber; logs go to stderr.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    /// Configuration from the environment, overridden by flags.
    pub fn config(&self) -> Result<FixtureConfig> {
        let mut config = FixtureConfig::from_env().context("Invalid fixture configuration")?;
        if let Some(root) = &self.content_root {
            config = config.content_root(root);
        }
        Ok(config)
    }

    /// Context for the selected storage backend.
    pub fn context(&self) -> Result<FixtureContext> {
        let config = self.config()?;
        if self.emulate {
            let (context, _) = FixtureContext::emulated(config);
            return Ok(context);
        }
        if !ZfsCli::available() {
            warn!("zfs not found on PATH; pass --emulate to use the in-memory emulator");
        }
        Ok(FixtureContext::zfs(config))
    }
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}
