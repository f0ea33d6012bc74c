pub mod attempt;
pub mod audit;
pub mod circuit;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod fabric;
pub mod reconciler;
pub mod resolver;
pub mod resource;
pub mod scheduler;
pub mod state;
pub mod store;

pub use attempt::{
    ActionCounts, ActionStatus, AttemptOutcome, ReconciliationAttempt, ResourceAction, Trigger,
};
pub use audit::{AuditError, AuditTrail, MemoryAuditTrail, RedbAuditTrail};
pub use circuit::{BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterClient, ClusterConnector, ClusterError, FakeConnector, HttpConnector};
pub use config::{ConfigError, EngineConfig};
pub use engine::{
    EngineError, FabricStatus, HistorySummary, RejectReason, SyncEngine, TriggerResult,
};
pub use fabric::{ClusterCredentials, ErrorClass, Fabric, SyncError, SyncState};
pub use reconciler::Reconciler;
pub use resolver::{FieldChange, ResourceDelta, ResourceDiff};
pub use resource::{ResourceKey, ResourceKind, ResourceSpec};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerHealth};
pub use store::{InventoryStore, MemoryStore, RedbStore, StoreError};
