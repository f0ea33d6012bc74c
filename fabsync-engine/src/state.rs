//! Sync state calculation.
//!
//! [`compute`] is the single place where a fabric's [`SyncState`] is derived.
//! The checks run in a fixed precedence order and the first match wins:
//!
//! 1. no cluster endpoint → `NotConfigured`
//! 2. sync disabled → `Disabled`
//! 3. attempt in flight → `Syncing`
//! 4. fatal last error → `Error`
//! 5. never synced → `NeverSynced`
//! 6. interval elapsed (inclusive) → `OutOfSync`
//! 7. otherwise → `InSync`

use chrono::{DateTime, Utc};

use crate::fabric::{Fabric, SyncState};

/// Derive the sync state of `fabric` at `now`.
pub fn compute(fabric: &Fabric, now: DateTime<Utc>, in_flight: bool) -> SyncState {
    if !fabric.is_configured() {
        return SyncState::NotConfigured;
    }
    if !fabric.sync_enabled {
        return SyncState::Disabled;
    }
    if in_flight {
        return SyncState::Syncing;
    }
    if fabric.last_error.as_ref().is_some_and(|e| e.fatal) {
        return SyncState::Error;
    }
    match fabric.last_sync_at {
        None => SyncState::NeverSynced,
        Some(last) if now - last >= fabric.sync_interval() => SyncState::OutOfSync,
        Some(_) => SyncState::InSync,
    }
}
