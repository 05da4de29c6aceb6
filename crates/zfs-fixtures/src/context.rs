//! Explicit test context tying a backend, configuration and rendezvous together.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info};

use crate::audit;
use crate::config::FixtureConfig;
use crate::provision::{self, Fixture, ProvisionOutcome};
use crate::rendezvous::Rendezvous;
use crate::schema::FixtureSpec;
use crate::storage::{EmulatorBackend, StorageBackend, ZfsCli};
use crate::Result;

/// Everything a test needs to build fixtures, passed around explicitly.
#[derive(Clone)]
pub struct FixtureContext {
    backend: Arc<dyn StorageBackend>,
    config: FixtureConfig,
    rendezvous: Rendezvous,
}

impl std::fmt::Debug for FixtureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureContext")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

impl FixtureContext {
    pub fn new(backend: Arc<dyn StorageBackend>, config: FixtureConfig) -> Self {
        let rendezvous = Rendezvous::new(config.rendezvous_timeout);
        Self {
            backend,
            config,
            rendezvous,
        }
    }

    /// Context driving the real storage subsystem with the configured programs.
    pub fn zfs(config: FixtureConfig) -> Self {
        Self::new(Arc::new(ZfsCli::from_config(&config)), config)
    }

    /// Context backed by an in-memory emulator.
    pub fn emulated(config: FixtureConfig) -> (Self, Arc<EmulatorBackend>) {
        let emulator = Arc::new(EmulatorBackend::new());
        let backend: Arc<dyn StorageBackend> = emulator.clone();
        (Self::new(backend, config), emulator)
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    /// Build a fixture; on failure everything already built is released.
    pub async fn provision(&self, spec: &FixtureSpec, work_dir: &Path, run_id: &str) -> Result<Fixture> {
        provision::provision(Arc::clone(&self.backend), &self.config, spec, work_dir, run_id).await
    }

    /// Release a fixture's registered state.
    pub async fn teardown(&self, fixture: Fixture) -> Result<()> {
        fixture.teardown(self.backend.as_ref()).await
    }

    /// Check imported pools against `spec` and remove every pool of the run.
    pub async fn audit(&self, spec: &FixtureSpec, run_id: &str) -> Result<()> {
        audit::audit(self.backend.as_ref(), &self.config, spec, run_id).await
    }

    /// Provision, run `body`, then always tear down and audit.
    ///
    /// A panic in `body` is resumed once teardown and audit have run.
    /// Otherwise the first error among body, teardown and audit is returned.
    pub async fn run_scoped<F, Fut, T>(&self, spec: &FixtureSpec, work_dir: &Path, run_id: &str, body: F) -> Result<T>
    where
        F: FnOnce(ProvisionOutcome) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let fixture = match self.provision(spec, work_dir, run_id).await {
            Ok(fixture) => fixture,
            Err(e) => {
                // Whatever provisioning left behind still has to be swept.
                if let Err(audit) = self.audit(spec, run_id).await {
                    error!("Audit after failed provisioning: {}", audit);
                }
                return Err(e);
            }
        };

        let outcome = fixture.outcome().clone();
        let ran = AssertUnwindSafe(body(outcome)).catch_unwind().await;

        let torn_down = self.teardown(fixture).await;
        let audited = self.audit(spec, run_id).await;
        info!("Run {:?} finished, fixture released", run_id);

        let result = match ran {
            Ok(result) => result,
            Err(panic) => {
                log_secondary(torn_down, audited);
                std::panic::resume_unwind(panic)
            }
        };
        match (result, torn_down, audited) {
            (Err(e), torn_down, audited) => {
                log_secondary(torn_down, audited);
                Err(e)
            }
            (Ok(_), Err(e), audited) => {
                log_secondary(Ok(()), audited);
                Err(e)
            }
            (Ok(_), Ok(()), Err(e)) => Err(e),
            (Ok(value), Ok(()), Ok(())) => Ok(value),
        }
    }
}

fn log_secondary(torn_down: Result<()>, audited: Result<()>) {
    if let Err(e) = torn_down {
        error!("Teardown: {}", e);
    }
    if let Err(e) = audited {
        error!("Audit: {}", e);
    }
}
