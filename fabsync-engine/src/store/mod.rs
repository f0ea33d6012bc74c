//! Inventory persistence boundary.
//!
//! Two implementations share the record rules below: [`MemoryStore`] for
//! dev mode and tests, [`RedbStore`] for a single-node daemon.

mod error;
mod memory;
mod persistent;
mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use persistent::RedbStore;
pub use traits::{
    CreateFabricRequest, DesiredStateStore, FabricStore, InventoryStore, SyncResultUpdate,
    UpdateFabricConfigRequest,
};

use chrono::{DateTime, Utc};

use crate::attempt::AttemptOutcome;
use crate::fabric::{DEFAULT_SYNC_INTERVAL_SECS, Fabric, MAX_SYNC_INTERVAL_SECS};

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::Invalid("fabric name must not be empty".to_string()));
    }
    Ok(())
}

fn validate_interval(secs: u64) -> Result<()> {
    if secs == 0 || secs > MAX_SYNC_INTERVAL_SECS {
        return Err(StoreError::Invalid(format!(
            "sync interval must be between 1 and {} seconds, got {}",
            MAX_SYNC_INTERVAL_SECS, secs
        )));
    }
    Ok(())
}

/// Build a new fabric record from a create request.
fn new_fabric(req: CreateFabricRequest, now: DateTime<Utc>) -> Result<Fabric> {
    validate_name(&req.name)?;
    let sync_interval_secs = req.sync_interval_secs.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);
    validate_interval(sync_interval_secs)?;

    Ok(Fabric {
        id: req.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        name: req.name,
        cluster_endpoint: req.cluster_endpoint.trim().to_string(),
        credentials: req.credentials,
        sync_enabled: req.sync_enabled,
        sync_interval_secs,
        last_sync_at: None,
        last_error: None,
        consecutive_failures: 0,
        sync_epoch: 0,
        created_at: now,
        updated_at: now,
    })
}

/// Apply a configuration edit in place.
fn apply_config(fabric: &mut Fabric, req: UpdateFabricConfigRequest, now: DateTime<Utc>) -> Result<()> {
    if let Some(name) = &req.name {
        validate_name(name)?;
    }
    if let Some(secs) = req.sync_interval_secs {
        validate_interval(secs)?;
    }

    if req.resets_sync_health(fabric) {
        fabric.last_error = None;
        fabric.consecutive_failures = 0;
        fabric.sync_epoch = fabric.sync_epoch.wrapping_add(1);
    }
    if let Some(name) = req.name {
        fabric.name = name;
    }
    if let Some(endpoint) = req.cluster_endpoint {
        fabric.cluster_endpoint = endpoint.trim().to_string();
    }
    if let Some(credentials) = req.credentials {
        fabric.credentials = credentials;
    }
    if let Some(enabled) = req.sync_enabled {
        fabric.sync_enabled = enabled;
    }
    if let Some(secs) = req.sync_interval_secs {
        fabric.sync_interval_secs = secs;
    }
    fabric.updated_at = now;
    Ok(())
}

/// Settle an attempt result in place. Returns false for a stale result.
pub(crate) fn apply_sync(fabric: &mut Fabric, update: SyncResultUpdate, now: DateTime<Utc>) -> bool {
    if update.epoch != fabric.sync_epoch {
        return false;
    }
    if let Some(at) = update.synced_at {
        fabric.last_sync_at = Some(at);
    }
    fabric.last_error = update
        .error
        .map(|e| e.escalate(fabric.last_error.as_ref(), update.auth_retry_limit));
    fabric.consecutive_failures = match update.outcome {
        AttemptOutcome::Failure => fabric.consecutive_failures.saturating_add(1),
        AttemptOutcome::Success | AttemptOutcome::Partial => 0,
    };
    fabric.updated_at = now;
    true
}

fn ensure_deletable(fabric: &Fabric) -> Result<()> {
    if fabric.sync_enabled {
        return Err(StoreError::Conflict(format!(
            "fabric {} still has sync enabled, disable it first",
            fabric.id
        )));
    }
    Ok(())
}
