//! Disposable ZFS storage fixtures for boot menu integration tests.
//!
//! A fixture document describes synthetic disks: ZFS pools with datasets,
//! snapshots and payload content, ext4 partitions and blank disks. The engine
//! materializes them as backing files under a work directory, drives the
//! storage subsystem through a [`StorageBackend`], and guarantees the pools it
//! created are released and audited afterwards.
//!
//! ```no_run
//! # async fn demo() -> zfs_fixtures::Result<()> {
//! use zfs_fixtures::{schema, FixtureConfig, FixtureContext};
//!
//! let spec = schema::load("testdata/rpool.yaml".as_ref())?;
//! let context = FixtureContext::zfs(FixtureConfig::from_env()?);
//! let work_dir = std::path::Path::new("/tmp/fixture");
//! context
//!     .run_scoped(&spec, work_dir, "run-a", |outcome| async move {
//!         println!("root dataset: {}", outcome.root_dataset_name());
//!         Ok(())
//!     })
//!     .await
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod content;
pub mod context;
pub mod driver_env;
pub mod error;
pub mod fstab;
pub mod materializer;
pub mod provision;
pub mod rendezvous;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod teardown;

pub use config::FixtureConfig;
pub use context::FixtureContext;
pub use driver_env::SecureBootState;
pub use error::Error;
pub use fstab::FAR_FUTURE_EPOCH;
pub use provision::{pool_identifier, Fixture, MountRecord, ProvisionOutcome};
pub use rendezvous::{GroupGuard, Rendezvous, WaitOutcome};
pub use schema::FixtureSpec;
pub use storage::{EmulatorBackend, StorageBackend, ZfsCli};
pub use teardown::{ReleaseAction, TeardownStack};

/// Result type for fixture operations
pub type Result<T> = std::result::Result<T, Error>;
