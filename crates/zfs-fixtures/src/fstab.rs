//! Mount table synthesis for provisioned system datasets.
//!
//! Pool and backing file names only exist once a run is provisioned, so the
//! fstab a system dataset ships cannot be stored verbatim with its payload.
//! Entries are written at provisioning time, translated from logical names.

use std::fs::{self, DirBuilder, File, FileTimes, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::materializer::backing_file_path;
use crate::provision::pool_identifier;
use crate::schema::{FstabEntry, FstabType};
use crate::{Error, Result};

/// 2033-05-18T03:33:20Z, the instant the `date` shim reports as "now".
pub const FAR_FUTURE_EPOCH: i64 = 2_000_000_000;

/// Writes fstab entries and boot metadata for one provisioning run.
#[derive(Debug, Clone)]
pub struct FstabSynthesizer {
    work_dir: PathBuf,
    run_id: String,
}

/// Paths of the system files under a dataset mounted at `/` or `/etc`.
struct SystemFiles {
    fstab: PathBuf,
    machine_id: PathBuf,
    os_release: PathBuf,
}

impl FstabSynthesizer {
    pub fn new(work_dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            run_id: run_id.into(),
        }
    }

    /// Render one fstab line, translating the logical filesystem name.
    pub fn render_line(&self, entry: &FstabEntry) -> String {
        let filesystem = match entry.kind {
            FstabType::StoragePool => pool_identifier(&self.run_id, &entry.filesystem),
            FstabType::PlainFilesystem => backing_file_path(&self.work_dir, &entry.filesystem)
                .display()
                .to_string(),
        };
        format!(
            "{}\t{}\t{}\tdefaults\t0\t0\n",
            filesystem,
            entry.mountpoint,
            entry.kind.as_str()
        )
    }

    /// Complete a system dataset mounted at `dataset_path`.
    ///
    /// Only datasets whose configured mountpoint is `/` or `/etc` are
    /// touched. For `/`, empty `boot` and `etc` directories are ensured.
    /// Entries are appended to the fstab, then the access and modification
    /// times of `machine-id` and `os-release` are set to `last_used`, or to
    /// [`FAR_FUTURE_EPOCH`] when none is given. Missing files are skipped.
    pub fn complete_system(
        &self,
        mountpoint: Option<&str>,
        dataset_path: &Path,
        last_used: Option<DateTime<Utc>>,
        entries: &[FstabEntry],
    ) -> Result<()> {
        let files = match mountpoint {
            Some("/") => {
                for dir in ["boot", "etc"] {
                    let path = dataset_path.join(dir);
                    DirBuilder::new()
                        .recursive(true)
                        .mode(0o700)
                        .create(&path)
                        .map_err(|e| Error::content(&path, e))?;
                }
                SystemFiles::under(&dataset_path.join("etc"))
            }
            Some("/etc") => SystemFiles::under(dataset_path),
            _ => return Ok(()),
        };

        if !entries.is_empty() {
            let mut fstab = OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o660)
                .open(&files.fstab)
                .map_err(|e| Error::content(&files.fstab, format!("couldn't append to fstab: {}", e)))?;
            for entry in entries {
                let line = self.render_line(entry);
                debug!("Adding fstab entry to {}: {}", files.fstab.display(), line.trim_end());
                fstab
                    .write_all(line.as_bytes())
                    .map_err(|e| Error::content(&files.fstab, format!("couldn't write to fstab: {}", e)))?;
            }
        }

        let stamp = last_used.unwrap_or_else(far_future);
        for path in [&files.machine_id, &files.os_release] {
            touch(path, stamp)?;
        }
        Ok(())
    }
}

impl SystemFiles {
    fn under(etc: &Path) -> Self {
        Self {
            fstab: etc.join("fstab"),
            machine_id: etc.join("machine-id"),
            os_release: etc.join("os-release"),
        }
    }
}

/// The instant the boot menu generator is made to believe is "now".
pub fn far_future() -> DateTime<Utc> {
    Utc.timestamp_opt(FAR_FUTURE_EPOCH, 0)
        .single()
        .unwrap_or_default()
}

fn touch(path: &Path, stamp: DateTime<Utc>) -> Result<()> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }
    let time = SystemTime::from(stamp);
    let file = File::open(path).map_err(|e| Error::content(path, e))?;
    file.set_times(FileTimes::new().set_accessed(time).set_modified(time))
        .map_err(|e| Error::content(path, format!("couldn't change access time: {}", e)))
}
