//! Sync engine facade.
//!
//! Wires the store, cluster connector, audit trail, circuit breaker,
//! reconciler and scheduler together and exposes the operations other
//! components call: state lookup, manual trigger, history and
//! reconfiguration.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::attempt::{AttemptOutcome, ReconciliationAttempt, Trigger};
use crate::audit::{AuditError, AuditTrail};
use crate::circuit::{CircuitBreaker, CircuitSnapshot};
use crate::clock::Clock;
use crate::cluster::ClusterConnector;
use crate::config::{ConfigError, EngineConfig};
use crate::fabric::{Fabric, SyncError, SyncState};
use crate::reconciler::Reconciler;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::state;
use crate::store::{InventoryStore, StoreError, UpdateFabricConfigRequest};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("fabric not found: {0}")]
    FabricNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Why a manual trigger was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    CircuitOpen,
    AlreadySyncing,
    NotConfigured,
    #[serde(rename = "sync_disabled")]
    Disabled,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::AlreadySyncing => "already_syncing",
            RejectReason::NotConfigured => "not_configured",
            RejectReason::Disabled => "sync_disabled",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum TriggerResult {
    Accepted,
    Rejected(RejectReason),
}

/// Summary of a fabric's recent attempts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    /// Attempts looked at, newest first, at most the configured summary length.
    pub recent: usize,
    pub successes: usize,
    pub partials: usize,
    pub failures: usize,
    pub last_outcome: Option<AttemptOutcome>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub circuit: CircuitSnapshot,
}

/// Answer of [`SyncEngine::get_state`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FabricStatus {
    pub fabric_id: String,
    pub state: SyncState,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<SyncError>,
    pub history: HistorySummary,
}

pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn InventoryStore>,
    audit: Arc<dyn AuditTrail>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<Scheduler>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn InventoryStore>,
        connector: Arc<dyn ClusterConnector>,
        audit: Arc<dyn AuditTrail>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), clock.clone()));
        let reconciler = Arc::new(
            Reconciler::new(
                store.clone(),
                connector,
                audit.clone(),
                breaker.clone(),
                clock.clone(),
            )
            .with_attempt_timeout(config.attempt_timeout)
            .with_auth_retry_limit(config.auth_retry_limit),
        );
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            reconciler,
            breaker.clone(),
            clock.clone(),
            config.tick_interval,
            config.max_concurrent,
        ));

        Ok(Self {
            config,
            store,
            audit,
            breaker,
            clock,
            scheduler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    async fn fabric(&self, fabric_id: &str) -> Result<Fabric, EngineError> {
        self.store
            .get_fabric(fabric_id)
            .await?
            .ok_or_else(|| EngineError::FabricNotFound(fabric_id.to_string()))
    }

    /// Current sync state of a fabric with its recent history.
    pub async fn get_state(&self, fabric_id: &str) -> Result<FabricStatus, EngineError> {
        let fabric = self.fabric(fabric_id).await?;
        let in_flight = self.scheduler.guard().contains(fabric_id);
        let state = state::compute(&fabric, self.clock.now(), in_flight);
        let recent = self
            .audit
            .history(fabric_id, self.config.history_summary_len)
            .await?;

        let count = |outcome: AttemptOutcome| recent.iter().filter(|a| a.outcome == outcome).count();
        let history = HistorySummary {
            recent: recent.len(),
            successes: count(AttemptOutcome::Success),
            partials: count(AttemptOutcome::Partial),
            failures: count(AttemptOutcome::Failure),
            last_outcome: recent.first().map(|a| a.outcome),
            last_attempt_at: recent.first().map(|a| a.finished_at),
            consecutive_failures: fabric.consecutive_failures,
            circuit: self.breaker.snapshot(fabric_id),
        };

        Ok(FabricStatus {
            fabric_id: fabric.id,
            state,
            last_sync_at: fabric.last_sync_at,
            last_error: fabric.last_error,
            history,
        })
    }

    /// Start an attempt now, outside the tick schedule.
    ///
    /// Accepted attempts go through the same worker pool, breaker and audit
    /// path as scheduled ones.
    pub async fn trigger_now(&self, fabric_id: &str) -> Result<TriggerResult, EngineError> {
        let fabric = self.fabric(fabric_id).await?;
        let guard = self.scheduler.guard();

        let reject = |reason: RejectReason| {
            info!(fabric_id = %fabric_id, reason = %reason, "Manual trigger rejected");
            Ok(TriggerResult::Rejected(reason))
        };

        if guard.contains(fabric_id) {
            return reject(RejectReason::AlreadySyncing);
        }
        match state::compute(&fabric, self.clock.now(), false) {
            SyncState::NotConfigured => return reject(RejectReason::NotConfigured),
            SyncState::Disabled => return reject(RejectReason::Disabled),
            _ => {}
        }
        if !self.breaker.may_attempt(fabric_id) {
            return reject(RejectReason::CircuitOpen);
        }
        let Some(ticket) = guard.try_acquire(fabric_id) else {
            self.breaker.release_trial(fabric_id);
            return reject(RejectReason::AlreadySyncing);
        };

        info!(fabric_id = %fabric_id, "Manual trigger accepted");
        self.scheduler.dispatch(fabric, Trigger::Manual, ticket, None);
        Ok(TriggerResult::Accepted)
    }

    /// Most recent attempts of a fabric, newest first.
    pub async fn history(
        &self,
        fabric_id: &str,
        limit: usize,
    ) -> Result<Vec<ReconciliationAttempt>, EngineError> {
        self.fabric(fabric_id).await?;
        Ok(self.audit.history(fabric_id, limit).await?)
    }

    /// Apply a configuration edit. Changing the connection settings or
    /// re-enabling sync also resets the fabric's circuit.
    pub async fn reconfigure(
        &self,
        fabric_id: &str,
        req: UpdateFabricConfigRequest,
    ) -> Result<Fabric, EngineError> {
        let current = self.fabric(fabric_id).await?;
        let resets = req.resets_sync_health(&current);
        let updated = self.store.update_fabric_config(fabric_id, req).await?;
        if resets {
            self.breaker.reset(fabric_id);
        }
        info!(
            fabric_id = %fabric_id,
            sync_enabled = updated.sync_enabled,
            interval_secs = updated.sync_interval_secs,
            reset = resets,
            "Fabric reconfigured"
        );
        Ok(updated)
    }

    /// Rebuild circuit state from the stored failure counters and the audit
    /// trail. Returns the number of fabrics with a failure streak.
    pub async fn restore(&self) -> Result<usize, EngineError> {
        let fabrics = self.store.list_fabrics().await?;
        let mut failing = 0;
        for fabric in fabrics {
            if fabric.consecutive_failures == 0 {
                self.breaker.reset(&fabric.id);
                continue;
            }
            failing += 1;

            let window = self.config.history_summary_len.max(1);
            let recent = self.audit.history(&fabric.id, window).await?;
            let trailing = recent
                .iter()
                .take_while(|a| a.outcome == AttemptOutcome::Failure)
                .count();
            let expected = (fabric.consecutive_failures as usize).min(window);
            if trailing != expected {
                warn!(
                    fabric_id = %fabric.id,
                    stored = fabric.consecutive_failures,
                    audited = trailing,
                    "Failure counter and audit trail disagree"
                );
            }

            let last_failure_at = recent
                .first()
                .filter(|a| a.outcome == AttemptOutcome::Failure)
                .map(|a| a.finished_at)
                .or_else(|| fabric.last_error.as_ref().map(|e| e.occurred_at));
            self.breaker
                .hydrate(&fabric.id, fabric.consecutive_failures, last_failure_at);
        }
        info!(failing, "Circuit state restored");
        Ok(failing)
    }

    /// Spawn the scheduler loop.
    pub fn start(&self) -> SchedulerHandle {
        self.scheduler.start()
    }

    /// Wait until no attempt is in flight.
    pub async fn wait_idle(&self) {
        self.scheduler.guard().wait_idle().await;
    }
}
