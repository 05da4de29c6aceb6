use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};
use zfs_fixtures::driver_env::ENV_SECUREBOOT;
use zfs_fixtures::{schema, SecureBootState};

use crate::GlobalArgs;

/// Arguments for running a command against a scoped fixture
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Fixture document (YAML)
    #[arg(value_name = "FIXTURE")]
    pub fixture: PathBuf,

    /// Directory for backing files and mount points
    #[arg(long = "work-dir", value_name = "DIR")]
    pub work_dir: PathBuf,

    /// Run identifier prefixed to every pool name
    #[arg(long = "run-id", value_name = "ID", default_value = "")]
    pub run_id: String,

    /// Firmware state the mokutil shim reports (efi-sb, efi-nosb, legacy)
    #[arg(long = "secure-boot", value_name = "STATE")]
    pub secure_boot: Option<SecureBootState>,

    /// Directory holding the command shims, prepended to PATH
    #[arg(long = "shim-dir", value_name = "DIR")]
    pub shim_dir: Option<PathBuf>,

    /// Command and arguments to run against the fixture
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Provision, run the command, release, audit. Returns the command's exit code.
    pub async fn run(self, global: &GlobalArgs) -> Result<i32> {
        let Some((program, program_args)) = self.command.split_first() else {
            return Err(anyhow::anyhow!("No command specified to run against the fixture"));
        };
        let spec = schema::load(&self.fixture)
            .with_context(|| format!("Invalid fixture {}", self.fixture.display()))?;
        let context = global.context()?;
        let path = match &self.shim_dir {
            Some(dir) => Some(prepend_path(dir, std::env::var_os("PATH"))?),
            None => None,
        };

        std::fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;

        let secure_boot = self.secure_boot;
        let status = context
            .run_scoped(&spec, &self.work_dir, &self.run_id, |outcome| async move {
                let mut command = tokio::process::Command::new(program);
                command.args(program_args).envs(outcome.driver_env());
                if let Some(state) = secure_boot {
                    command.env(ENV_SECUREBOOT, state.as_str());
                }
                if let Some(path) = path {
                    command.env("PATH", path);
                }

                info!(
                    "Running {} with root dataset {:?}",
                    program,
                    outcome.root_dataset_name()
                );
                Ok::<_, zfs_fixtures::Error>(command.status().await?)
            })
            .await
            .context("Fixture run failed")?;

        if !status.success() {
            warn!("{} exited with {}", program, status);
        }
        // Killed by a signal: no code to propagate.
        Ok(status.code().unwrap_or(1))
    }
}

/// `dir` followed by the entries of `current`.
pub fn prepend_path(dir: &Path, current: Option<OsString>) -> Result<OsString> {
    let mut entries = vec![dir.to_path_buf()];
    if let Some(current) = current {
        entries.extend(std::env::split_paths(&current));
    }
    std::env::join_paths(entries).context("Shim directory cannot be placed on PATH")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shim_dir_comes_first_on_path() {
        let path = prepend_path(Path::new("/opt/shims"), Some("/usr/bin:/bin".into())).unwrap();
        assert_eq!(path, OsString::from("/opt/shims:/usr/bin:/bin"));
        let path = prepend_path(Path::new("/opt/shims"), None).unwrap();
        assert_eq!(path, OsString::from("/opt/shims"));
    }

    #[test]
    fn separators_in_the_shim_dir_are_rejected() {
        assert!(prepend_path(Path::new("/opt/a:b"), None).is_err());
    }
}
