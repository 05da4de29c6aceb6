//! Post-run pool audit.
//!
//! Pools live in a namespace shared by every process on the host, so after a
//! test the audit checks which of the run's pools are still imported against
//! what the fixture asked for, then destroys them all so the next run starts
//! clean. A pool belongs to the run when its run tag names the run, or, for
//! untagged pools, when the fixture declares its name. Run identifiers may
//! prefix one another, so the name prefix alone never decides ownership.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::config::FixtureConfig;
use crate::provision::{pool_identifier, RUN_PROPERTY};
use crate::schema::FixtureSpec;
use crate::storage::{FailureKind, StorageBackend};
use crate::{Error, Result};

/// Check imported pools against `spec` and destroy every pool of the run.
///
/// Pools flagged `keep_imported` must still be imported, every other pool of
/// the fixture must be gone, and no unknown pool may be tagged with the run.
/// Cleanup happens even when expectations are not met.
pub async fn audit(
    backend: &dyn StorageBackend,
    config: &FixtureConfig,
    spec: &FixtureSpec,
    run_id: &str,
) -> Result<()> {
    let imported = match backend.list_pools().await {
        Ok(pools) => pools,
        Err(e) if e.kind() == FailureKind::Absent => Vec::new(),
        Err(e) => return Err(Error::storage("list imported pools", e)),
    };
    let declared: BTreeSet<String> = spec
        .pools()
        .map(|(_, pool)| pool_identifier(run_id, &pool.pool_name))
        .collect();
    let prefix = pool_identifier(run_id, "");
    let tag = config.user_property(RUN_PROPERTY);

    let mut seen = BTreeSet::new();
    for pool in imported {
        if !run_id.is_empty() && !pool.starts_with(&prefix) {
            continue;
        }
        match run_tag(backend, &pool, &tag).await {
            Some(owner) if owner == run_id => {
                seen.insert(pool);
            }
            Some(owner) => debug!("Pool {} belongs to run {:?}, leaving it alone", pool, owner),
            None if declared.contains(&pool) => {
                seen.insert(pool);
            }
            None => debug!("Pool {} carries no run tag, leaving it alone", pool),
        }
    }
    info!("Auditing run {:?}: {} pool(s) imported", run_id, seen.len());

    let mut mismatches = Vec::new();
    let mut unknown = seen.clone();
    for (_, pool) in spec.pools() {
        let name = pool_identifier(run_id, &pool.pool_name);
        let present = unknown.remove(&name);
        if pool.keep_imported && !present {
            mismatches.push(format!("expected pool {} to remain imported, it is not", name));
        } else if !pool.keep_imported && present {
            mismatches.push(format!("expected pool {} not to be imported, it is", name));
        }
    }
    for pool in &unknown {
        mismatches.push(format!("pool {} is imported but not part of this fixture", pool));
    }

    for pool in &seen {
        if let Err(message) = remove_pool(backend, pool).await {
            mismatches.push(message);
        }
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        for mismatch in &mismatches {
            warn!("Audit: {}", mismatch);
        }
        Err(Error::AuditMismatch { mismatches })
    }
}

/// Run a pool was tagged with at creation, if any.
async fn run_tag(backend: &dyn StorageBackend, pool: &str, property: &str) -> Option<String> {
    let value = backend.get_property(pool, property).await.ok()?;
    let value = value.trim();
    if value.is_empty() || value == "-" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Destroy a pool, falling back to exporting it.
async fn remove_pool(backend: &dyn StorageBackend, pool: &str) -> std::result::Result<(), String> {
    info!("Audit: destroying pool {}", pool);
    let destroyed = match backend.destroy_pool(pool).await {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == FailureKind::Absent => return Ok(()),
        Err(e) => e,
    };
    warn!("Couldn't destroy pool {}, exporting it instead: {}", pool, destroyed.message());
    match backend.export_pool(pool).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == FailureKind::Absent => Ok(()),
        Err(e) => Err(format!("couldn't remove pool {}: {}", pool, e.message())),
    }
}
