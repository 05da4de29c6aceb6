//! Fixture engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Size of every backing file, matching what the boot menu tests expect.
pub const DEFAULT_DEVICE_SIZE: u64 = 100 * 1024 * 1024;

/// User property namespace the boot menu generator reads.
pub const DEFAULT_PROPERTY_NAMESPACE: &str = "com.ubuntu.zsys";

/// Environment variable overriding the payload repository root.
pub const ENV_CONTENT_DIR: &str = "FIXTURES_CONTENT_DIR";
/// Environment variable overriding the backing file size, in MiB.
pub const ENV_DEVICE_SIZE_MB: &str = "FIXTURES_DEVICE_SIZE_MB";
/// Environment variable overriding the plain filesystem format bound, in seconds.
pub const ENV_FORMAT_TIMEOUT_SECS: &str = "FIXTURES_FORMAT_TIMEOUT_SECS";
/// Environment variable overriding the `zfs` program.
pub const ENV_ZFS_BIN: &str = "FIXTURES_ZFS_BIN";
/// Environment variable overriding the `zpool` program.
pub const ENV_ZPOOL_BIN: &str = "FIXTURES_ZPOOL_BIN";

/// Configuration shared by every fixture built through a context.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    /// Root directory payload identifiers are resolved against (default: "testdata/content")
    pub content_root: PathBuf,
    /// Backing file size in bytes (default: 100 MiB)
    pub device_size: u64,
    /// Upper bound for formatting, mounting and populating a plain filesystem device (default: 3s)
    pub format_timeout: Duration,
    /// How long a test group waits for an upstream group to register (default: 10ms)
    pub rendezvous_timeout: Duration,
    /// Program used for dataset operations (default: "zfs")
    pub zfs_bin: String,
    /// Program used for pool operations (default: "zpool")
    pub zpool_bin: String,
    /// Prefix of the user properties written on datasets and snapshots (default: "com.ubuntu.zsys")
    pub property_namespace: String,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from("testdata").join("content"),
            device_size: DEFAULT_DEVICE_SIZE,
            format_timeout: Duration::from_secs(3),
            rendezvous_timeout: Duration::from_millis(10),
            zfs_bin: "zfs".to_string(),
            zpool_bin: "zpool".to_string(),
            property_namespace: DEFAULT_PROPERTY_NAMESPACE.to_string(),
        }
    }
}

impl FixtureConfig {
    /// Create a configuration with default values, allowing fluent configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the default configuration overlaid with `FIXTURES_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values from a variable lookup, so the environment handling can be tested in isolation.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CONTENT_DIR) {
            self.content_root = PathBuf::from(dir);
        }
        if let Some(size) = lookup(ENV_DEVICE_SIZE_MB) {
            let mb: u64 = size.trim().parse().map_err(|_| {
                Error::config(format!("{} must be a number of MiB, got {:?}", ENV_DEVICE_SIZE_MB, size))
            })?;
            if mb == 0 {
                return Err(Error::config(format!("{} must not be zero", ENV_DEVICE_SIZE_MB)));
            }
            self.device_size = mb.checked_mul(1024 * 1024).ok_or_else(|| {
                Error::config(format!("{} is too large: {} MiB", ENV_DEVICE_SIZE_MB, mb))
            })?;
        }
        if let Some(secs) = lookup(ENV_FORMAT_TIMEOUT_SECS) {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                Error::config(format!("{} must be a number of seconds, got {:?}", ENV_FORMAT_TIMEOUT_SECS, secs))
            })?;
            self.format_timeout = Duration::from_secs(secs);
        }
        if let Some(bin) = lookup(ENV_ZFS_BIN) {
            self.zfs_bin = bin;
        }
        if let Some(bin) = lookup(ENV_ZPOOL_BIN) {
            self.zpool_bin = bin;
        }
        Ok(self)
    }

    /// Set the payload repository root.
    pub fn content_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.content_root = root.into();
        self
    }

    /// Set the backing file size in bytes.
    pub fn device_size(mut self, bytes: u64) -> Self {
        self.device_size = bytes;
        self
    }

    /// Set the plain filesystem format bound.
    pub fn format_timeout(mut self, timeout: Duration) -> Self {
        self.format_timeout = timeout;
        self
    }

    /// Set the rendezvous wait bound.
    pub fn rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    /// Set the user property namespace.
    pub fn property_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.property_namespace = namespace.into();
        self
    }

    /// Fully-qualified name of a user property.
    pub fn user_property(&self, suffix: &str) -> String {
        user_property(&self.property_namespace, suffix)
    }
}

/// Join a property namespace and suffix the way zsys names its user properties.
pub fn user_property(namespace: &str, suffix: &str) -> String {
    format!("{}:{}", namespace, suffix)
}
