//! Test helpers for fabsync-engine integration tests.
//!
//! Builds a [`SyncEngine`] over in-memory stores, a fake cluster and a
//! manually driven clock, so every test goes through the same scheduler and
//! reconciler path as the daemon.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use fabsync_engine::attempt::ReconciliationAttempt;
use fabsync_engine::cluster::FakeCluster;
use fabsync_engine::store::{
    CreateFabricRequest, DesiredStateStore, FabricStore, SyncResultUpdate,
};
use fabsync_engine::{
    ClusterCredentials, EngineConfig, Fabric, FakeConnector, ManualClock, MemoryAuditTrail,
    MemoryStore, ResourceKey, ResourceKind, ResourceSpec, SyncEngine, TriggerResult,
};

pub const ENDPOINT: &str = "fake://dc1";

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub struct TestEngine {
    pub engine: SyncEngine,
    pub config: EngineConfig,
    pub store: Arc<MemoryStore>,
    pub audit: Arc<MemoryAuditTrail>,
    pub connector: Arc<FakeConnector>,
    pub clock: Arc<ManualClock>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditTrail::new());
        let connector = Arc::new(FakeConnector::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let engine = SyncEngine::new(
            config.clone(),
            store.clone(),
            connector.clone(),
            audit.clone(),
            clock.clone(),
        )
        .unwrap();
        Self {
            engine,
            config,
            store,
            audit,
            connector,
            clock,
        }
    }

    /// A second engine over the same stores, cluster and clock, as after a
    /// daemon restart.
    pub fn restarted(&self) -> SyncEngine {
        SyncEngine::new(
            self.config.clone(),
            self.store.clone(),
            self.connector.clone(),
            self.audit.clone(),
            self.clock.clone(),
        )
        .unwrap()
    }

    pub async fn add_fabric(&self, id: &str, endpoint: &str) -> Fabric {
        self.store
            .create_fabric(CreateFabricRequest {
                id: Some(id.to_string()),
                name: format!("{}-name", id),
                cluster_endpoint: endpoint.to_string(),
                credentials: ClusterCredentials::new("token:secret"),
                sync_enabled: true,
                sync_interval_secs: Some(300),
            })
            .await
            .unwrap()
    }

    /// Mark a fabric as last synced `minutes_ago` minutes before now.
    pub async fn synced_ago(&self, id: &str, minutes_ago: i64) {
        let epoch = self.fabric(id).await.sync_epoch;
        self.store
            .apply_sync_result(
                id,
                SyncResultUpdate::synced(epoch, self.now() - Duration::minutes(minutes_ago)),
            )
            .await
            .unwrap();
    }

    pub async fn desire(&self, fabric_id: &str, kind: ResourceKind, name: &str, spec: Value) {
        self.store
            .put_desired(
                fabric_id,
                ResourceSpec::new(ResourceKey::new(kind, name), spec),
            )
            .await
            .unwrap();
    }

    pub fn cluster(&self, endpoint: &str) -> Arc<FakeCluster> {
        self.connector.cluster(endpoint)
    }

    pub async fn fabric(&self, id: &str) -> Fabric {
        self.store.get_fabric(id).await.unwrap().unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        use fabsync_engine::Clock;
        self.clock.now()
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    /// Trigger an attempt and wait until it has been settled.
    pub async fn trigger_and_wait(&self, id: &str) -> TriggerResult {
        let result = self.engine.trigger_now(id).await.unwrap();
        self.engine.wait_idle().await;
        result
    }

    pub async fn last_attempt(&self, id: &str) -> ReconciliationAttempt {
        self.engine
            .history(id, 1)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
    }
}
