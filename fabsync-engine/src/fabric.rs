//! Fabric inventory record and the error/state vocabulary attached to it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default interval between two synchronizations of a fabric.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

/// Upper bound accepted for `sync_interval_secs` (30 days).
pub const MAX_SYNC_INTERVAL_SECS: u64 = 30 * 24 * 3600;

/// A fabric: one externally managed cluster and the inventory's view of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fabric {
    pub id: String,
    pub name: String,
    /// Cluster API endpoint, empty when the fabric has not been wired up yet.
    pub cluster_endpoint: String,
    pub credentials: ClusterCredentials,
    pub sync_enabled: bool,
    pub sync_interval_secs: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<SyncError>,
    pub consecutive_failures: u32,
    /// Bumped whenever a configuration edit resets sync health. Results of
    /// attempts dispatched under an older epoch are not settled.
    #[serde(default)]
    pub sync_epoch: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Fabric {
    /// Interval after which a synced fabric is considered overdue.
    pub fn sync_interval(&self) -> Duration {
        let secs = self.sync_interval_secs.min(MAX_SYNC_INTERVAL_SECS);
        Duration::seconds(secs as i64)
    }

    /// Whether a cluster endpoint has been set.
    pub fn is_configured(&self) -> bool {
        !self.cluster_endpoint.trim().is_empty()
    }
}

/// Opaque reference to the secret used to authenticate against the cluster.
///
/// The engine never interprets the reference itself; the cluster connector
/// resolves it. `Debug` only reveals the reference scheme.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterCredentials(String);

impl ClusterCredentials {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn reference(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = self.0.split_once(':').map(|(s, _)| s).unwrap_or("opaque");
        write!(f, "ClusterCredentials({}:<redacted>)", scheme)
    }
}

/// Classification of a synchronization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Endpoint unreachable, TLS or handshake failure.
    Connection,
    /// Invalid credentials or insufficient permission.
    Authentication,
    /// A single create/update/delete call failed.
    Resource,
    /// The attempt exceeded its wall-clock budget.
    Timeout,
    /// The fabric configuration itself is unusable (bad URL, unresolvable secret).
    Configuration,
    /// Inventory store failure or a crashed worker.
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Connection => "connection",
            ErrorClass::Authentication => "authentication",
            ErrorClass::Resource => "resource",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error stored in `Fabric::last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub class: ErrorClass,
    pub message: String,
    /// Fatal errors park the fabric in `SyncState::Error` until it is reconfigured.
    pub fatal: bool,
    /// Consecutive attempts that ended with an error of this class.
    pub occurrences: u32,
    pub occurred_at: DateTime<Utc>,
}

impl SyncError {
    pub fn new(class: ErrorClass, message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            class,
            message: message.into(),
            fatal: class == ErrorClass::Configuration,
            occurrences: 1,
            occurred_at,
        }
    }

    /// Carry the occurrence count over from the previous error of the same class
    /// and decide whether the error has become fatal.
    ///
    /// Authentication failures are retried `auth_retry_limit` times before they
    /// are escalated; configuration errors are fatal straight away.
    pub fn escalate(mut self, previous: Option<&SyncError>, auth_retry_limit: u32) -> Self {
        self.occurrences = previous
            .filter(|p| p.class == self.class)
            .map(|p| p.occurrences.saturating_add(1))
            .unwrap_or(1);
        self.fatal = match self.class {
            ErrorClass::Configuration => true,
            ErrorClass::Authentication => self.occurrences >= auth_retry_limit.max(1),
            _ => false,
        };
        self
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.class, self.message)
    }
}

/// Logical synchronization state of a fabric, derived by [`crate::state::compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NotConfigured,
    Disabled,
    NeverSynced,
    InSync,
    OutOfSync,
    Syncing,
    Error,
}

impl SyncState {
    pub const ALL: [SyncState; 7] = [
        SyncState::NotConfigured,
        SyncState::Disabled,
        SyncState::NeverSynced,
        SyncState::InSync,
        SyncState::OutOfSync,
        SyncState::Syncing,
        SyncState::Error,
    ];

    /// States the scheduler dispatches on its own.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, SyncState::NeverSynced | SyncState::OutOfSync)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NotConfigured => "not_configured",
            SyncState::Disabled => "disabled",
            SyncState::NeverSynced => "never_synced",
            SyncState::InSync => "in_sync",
            SyncState::OutOfSync => "out_of_sync",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
