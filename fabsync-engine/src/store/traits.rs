//! Inventory store trait definitions.
//!
//! The engine only talks to the inventory through these traits, so the
//! backing store (in-memory, redb) can be swapped without touching the
//! reconciler or scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attempt::AttemptOutcome;
use crate::fabric::{ClusterCredentials, Fabric, SyncError};
use crate::resource::{ResourceKey, ResourceSpec};

use super::error::Result;

// =============================================================================
// Fabric Request DTOs
// =============================================================================

/// Request to register a new fabric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateFabricRequest {
    /// Explicit id, generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub cluster_endpoint: String,
    #[serde(default)]
    pub credentials: ClusterCredentials,
    #[serde(default)]
    pub sync_enabled: bool,
    /// Defaults to [`crate::fabric::DEFAULT_SYNC_INTERVAL_SECS`] when absent.
    #[serde(default)]
    pub sync_interval_secs: Option<u64>,
}

/// User-facing configuration edit. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFabricConfigRequest {
    pub name: Option<String>,
    pub cluster_endpoint: Option<String>,
    pub credentials: Option<ClusterCredentials>,
    pub sync_enabled: Option<bool>,
    pub sync_interval_secs: Option<u64>,
}

impl UpdateFabricConfigRequest {
    /// Whether applying this edit to `current` gives the fabric a clean slate:
    /// the connection settings change or sync is switched back on.
    pub fn resets_sync_health(&self, current: &Fabric) -> bool {
        let endpoint_changed = self
            .cluster_endpoint
            .as_ref()
            .is_some_and(|e| e != &current.cluster_endpoint);
        let credentials_changed = self
            .credentials
            .as_ref()
            .is_some_and(|c| c != &current.credentials);
        let re_enabled = self.sync_enabled == Some(true) && !current.sync_enabled;
        endpoint_changed || credentials_changed || re_enabled
    }
}

/// Result of a finished attempt, settled onto the fabric record by the store.
///
/// The store applies it against the current record in one step: the failure
/// counter and error escalation build on what is stored, not on the snapshot
/// the attempt was dispatched with. A result whose `epoch` no longer matches
/// the record's `sync_epoch` leaves the record untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResultUpdate {
    /// `sync_epoch` of the record the attempt was dispatched with.
    pub epoch: u64,
    pub outcome: AttemptOutcome,
    /// Moves `last_sync_at` when set.
    pub synced_at: Option<DateTime<Utc>>,
    /// New `last_error` before escalation. `None` clears it.
    pub error: Option<SyncError>,
    pub auth_retry_limit: u32,
}

impl SyncResultUpdate {
    /// A clean sync at `at`.
    pub fn synced(epoch: u64, at: DateTime<Utc>) -> Self {
        Self {
            epoch,
            outcome: AttemptOutcome::Success,
            synced_at: Some(at),
            error: None,
            auth_retry_limit: 1,
        }
    }

    /// A failed attempt with `error`.
    pub fn failed(epoch: u64, error: SyncError, auth_retry_limit: u32) -> Self {
        Self {
            epoch,
            outcome: AttemptOutcome::Failure,
            synced_at: None,
            error: Some(error),
            auth_retry_limit,
        }
    }
}

// =============================================================================
// Domain Store Traits
// =============================================================================

/// Store trait for fabric records.
#[async_trait]
pub trait FabricStore: Send + Sync {
    /// List all fabrics.
    async fn list_fabrics(&self) -> Result<Vec<Fabric>>;

    /// Get a fabric by ID.
    async fn get_fabric(&self, id: &str) -> Result<Option<Fabric>>;

    /// Register a new fabric.
    async fn create_fabric(&self, req: CreateFabricRequest) -> Result<Fabric>;

    /// Apply a configuration edit.
    async fn update_fabric_config(&self, id: &str, req: UpdateFabricConfigRequest)
    -> Result<Fabric>;

    /// Settle an attempt result onto the sync fields. Configuration fields are
    /// left untouched; a stale result (see [`SyncResultUpdate`]) changes nothing.
    async fn apply_sync_result(&self, id: &str, update: SyncResultUpdate) -> Result<Fabric>;

    /// Delete a fabric and its desired state. Refused while sync is enabled.
    async fn delete_fabric(&self, id: &str) -> Result<()>;
}

/// Store trait for the desired state of a fabric's cluster resources.
#[async_trait]
pub trait DesiredStateStore: Send + Sync {
    /// List the desired resources of a fabric.
    async fn list_desired(&self, fabric_id: &str) -> Result<Vec<ResourceSpec>>;

    /// Create or replace a desired resource.
    async fn put_desired(&self, fabric_id: &str, resource: ResourceSpec) -> Result<()>;

    /// Remove a desired resource.
    async fn delete_desired(&self, fabric_id: &str, key: &ResourceKey) -> Result<()>;
}

// =============================================================================
// Composite InventoryStore Trait
// =============================================================================

/// Composite inventory store used by the engine.
pub trait InventoryStore: FabricStore + DesiredStateStore + Send + Sync {}

impl<T> InventoryStore for T where T: FabricStore + DesiredStateStore + Send + Sync {}
