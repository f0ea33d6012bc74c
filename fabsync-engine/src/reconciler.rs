//! Reconciliation of one fabric against its cluster.
//!
//! One call to [`Reconciler::reconcile`] is one attempt:
//!
//! 1. open a scoped cluster session
//! 2. list every managed resource kind
//! 3. load the fabric's desired state
//! 4. resolve every key present on either side
//! 5. apply creates and updates in kind order, then deletes in reverse order
//! 6. settle the outcome onto the fabric record, then audit it and feed the breaker
//!
//! A fabric reconfigured while its attempt was running only gets the attempt
//! audited: the stored record and the breaker keep the reset state.
//!
//! The whole attempt runs against one deadline. When it passes, the in-flight
//! call is dropped, everything applied so far stays applied and the attempt
//! fails with a timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use crate::attempt::{
    ActionStatus, ReconciliationAttempt, ResourceAction, Trigger, next_attempt_id, settle,
};
use crate::audit::AuditTrail;
use crate::circuit::CircuitBreaker;
use crate::clock::Clock;
use crate::cluster::{ClusterConnector, ClusterError, SessionLease};
use crate::fabric::{ErrorClass, Fabric, SyncError};
use crate::resolver::{ResourceDiff, resolve};
use crate::resource::{ResourceKey, ResourceKind, ResourceSpec};
use crate::state;
use crate::store::{self, InventoryStore, SyncResultUpdate};

/// Extra time the result writes get beyond the attempt deadline.
const SETTLE_GRACE: Duration = Duration::from_secs(5);

/// Runs reconciliation attempts and settles their results.
pub struct Reconciler {
    store: Arc<dyn InventoryStore>,
    connector: Arc<dyn ClusterConnector>,
    audit: Arc<dyn AuditTrail>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    attempt_timeout: Duration,
    auth_retry_limit: u32,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        connector: Arc<dyn ClusterConnector>,
        audit: Arc<dyn AuditTrail>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            connector,
            audit,
            breaker,
            clock,
            attempt_timeout: Duration::from_secs(180),
            auth_retry_limit: 3,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_auth_retry_limit(mut self, limit: u32) -> Self {
        self.auth_retry_limit = limit;
        self
    }

    /// Run one attempt for `fabric`. Never fails: every problem ends up in the
    /// returned attempt.
    pub async fn reconcile(&self, fabric: &Fabric, trigger: Trigger) -> ReconciliationAttempt {
        let started_at = self.clock.now();
        info!(
            fabric_id = %fabric.id,
            fabric = %fabric.name,
            trigger = %trigger,
            "Starting reconciliation"
        );

        let deadline = Instant::now() + self.attempt_timeout;
        let mut actions = Vec::new();
        let abort = self.run(fabric, deadline, &mut actions).await.err();
        self.finish(fabric, trigger, started_at, actions, abort, deadline)
            .await
    }

    /// Settle an attempt whose worker crashed before producing a result.
    pub async fn record_crash(
        &self,
        fabric: &Fabric,
        trigger: Trigger,
        message: &str,
    ) -> ReconciliationAttempt {
        let now = self.clock.now();
        error!(fabric_id = %fabric.id, error = %message, "Reconciliation worker crashed");
        let abort = SyncError::new(
            ErrorClass::Internal,
            format!("reconciliation worker crashed: {}", message),
            now,
        );
        self.finish(fabric, trigger, now, Vec::new(), Some(abort), Instant::now())
            .await
    }

    async fn run(
        &self,
        fabric: &Fabric,
        deadline: Instant,
        actions: &mut Vec<ResourceAction>,
    ) -> Result<(), SyncError> {
        let client = self
            .within(
                deadline,
                "connecting",
                self.connector
                    .connect(&fabric.cluster_endpoint, &fabric.credentials),
            )
            .await?
            .map_err(|e| self.cluster_error(e))?;
        let session = SessionLease::new(client);

        let mut observed: BTreeMap<ResourceKey, ResourceSpec> = BTreeMap::new();
        for kind in ResourceKind::ALL {
            let resources = self
                .within(deadline, "listing resources", session.list(kind))
                .await?
                .map_err(|e| self.cluster_error(e))?;
            observed.extend(resources.into_iter().map(|r| (r.key.clone(), r)));
        }

        let desired: BTreeMap<ResourceKey, ResourceSpec> = self
            .within(
                deadline,
                "loading desired state",
                self.store.list_desired(&fabric.id),
            )
            .await?
            .map_err(|e| {
                SyncError::new(
                    ErrorClass::Internal,
                    format!("loading desired state: {}", e),
                    self.clock.now(),
                )
            })?
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        debug!(
            fabric_id = %fabric.id,
            desired = desired.len(),
            observed = observed.len(),
            "Resolving resources"
        );

        let keys: BTreeSet<&ResourceKey> = desired.keys().chain(observed.keys()).collect();
        let mut deletes = Vec::new();
        for key in keys {
            let wanted = desired.get(key);
            let seen = observed.get(key);
            let diff = resolve(wanted, seen, &fabric.id);

            match (&diff, wanted) {
                (ResourceDiff::Delete, _) => deletes.push(key),
                (ResourceDiff::Create, Some(wanted)) => {
                    let body = wanted.clone().with_ownership(&fabric.id);
                    let result = self
                        .within(deadline, "applying resources", session.create(&body))
                        .await?;
                    actions.push(self.settle_call(fabric, key, diff, result.map(|_| ()))?);
                }
                (ResourceDiff::Update(_), Some(wanted)) => {
                    let mut body = wanted.clone().with_ownership(&fabric.id);
                    body.server = seen.and_then(|s| s.server.clone());
                    let result = self
                        .within(deadline, "applying resources", session.update(&body))
                        .await?;
                    actions.push(self.settle_call(fabric, key, diff, result.map(|_| ()))?);
                }
                _ => {
                    if let ResourceDiff::Conflict { reason } = &diff {
                        warn!(
                            fabric_id = %fabric.id,
                            resource = %key,
                            reason = %reason,
                            "Resource conflict flagged for review"
                        );
                    }
                    actions.push(ResourceAction::passive(key.clone(), diff));
                }
            }
        }

        // dependents first
        for key in deletes.into_iter().rev() {
            let result = match self
                .within(deadline, "deleting resources", session.delete(key))
                .await?
            {
                // already gone
                Err(ClusterError::NotFound(_)) => Ok(()),
                other => other,
            };
            actions.push(self.settle_call(fabric, key, ResourceDiff::Delete, result)?);
        }

        Ok(())
    }

    /// Turn a cluster call result into an action. Connection and
    /// authentication failures abort the attempt instead.
    fn settle_call(
        &self,
        fabric: &Fabric,
        key: &ResourceKey,
        diff: ResourceDiff,
        result: Result<(), ClusterError>,
    ) -> Result<ResourceAction, SyncError> {
        let status = match result {
            Ok(()) => {
                debug!(fabric_id = %fabric.id, resource = %key, action = diff.as_str(), "Applied");
                ActionStatus::Applied
            }
            Err(e) if e.class() == ErrorClass::Resource => {
                warn!(
                    fabric_id = %fabric.id,
                    resource = %key,
                    action = diff.as_str(),
                    error = %e,
                    "Resource action failed"
                );
                ActionStatus::Failed {
                    error: e.to_string(),
                }
            }
            Err(e) => return Err(self.cluster_error(e)),
        };
        Ok(ResourceAction {
            key: key.clone(),
            diff,
            status,
        })
    }

    async fn within<F: Future>(
        &self,
        deadline: Instant,
        phase: &str,
        fut: F,
    ) -> Result<F::Output, SyncError> {
        timeout_at(deadline, fut).await.map_err(|_| {
            SyncError::new(
                ErrorClass::Timeout,
                format!(
                    "attempt exceeded {}s while {}",
                    self.attempt_timeout.as_secs(),
                    phase
                ),
                self.clock.now(),
            )
        })
    }

    fn cluster_error(&self, e: ClusterError) -> SyncError {
        SyncError::new(e.class(), e.to_string(), self.clock.now())
    }

    async fn finish(
        &self,
        fabric: &Fabric,
        trigger: Trigger,
        started_at: chrono::DateTime<chrono::Utc>,
        actions: Vec<ResourceAction>,
        abort: Option<SyncError>,
        deadline: Instant,
    ) -> ReconciliationAttempt {
        let finished_at = self.clock.now();
        let state_before = state::compute(fabric, started_at, false);
        let settlement = settle(&actions, abort, finished_at);
        let outcome = settlement.outcome;
        let raw_error = settlement.error.clone();

        let update = SyncResultUpdate {
            epoch: fabric.sync_epoch,
            outcome,
            synced_at: settlement.advance_last_sync.then_some(finished_at),
            error: settlement.error,
            auth_retry_limit: self.auth_retry_limit,
        };

        // Each write gets what is left of the budget plus a short grace period.
        let write_deadline = deadline.max(Instant::now()) + SETTLE_GRACE;
        let stored = match timeout_at(
            write_deadline,
            self.store.apply_sync_result(&fabric.id, update.clone()),
        )
        .await
        {
            Ok(Ok(updated)) => Some(updated),
            Ok(Err(e)) => {
                error!(fabric_id = %fabric.id, error = %e, "Failed to store sync result");
                None
            }
            Err(_) => {
                error!(fabric_id = %fabric.id, "Timed out storing sync result");
                None
            }
        };
        let updated = stored.unwrap_or_else(|| {
            let mut local = fabric.clone();
            store::apply_sync(&mut local, update, finished_at);
            local
        });

        let stale = updated.sync_epoch != fabric.sync_epoch;
        let error = if stale {
            info!(
                fabric_id = %fabric.id,
                outcome = %outcome,
                "Fabric was reconfigured during the attempt, result only audited"
            );
            raw_error
        } else {
            updated.last_error.clone()
        };

        let attempt = ReconciliationAttempt {
            id: next_attempt_id().to_string(),
            fabric_id: fabric.id.clone(),
            trigger,
            started_at,
            finished_at,
            outcome,
            actions,
            error,
            state_before,
            state_after: state::compute(&updated, finished_at, false),
        };

        let audit_deadline = deadline.max(Instant::now()) + SETTLE_GRACE;
        match timeout_at(audit_deadline, self.audit.record(&attempt)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                fabric_id = %fabric.id,
                attempt_id = %attempt.id,
                error = %e,
                "Failed to record attempt"
            ),
            Err(_) => error!(
                fabric_id = %fabric.id,
                attempt_id = %attempt.id,
                "Timed out recording attempt"
            ),
        }
        if !stale {
            self.breaker.record_result(&fabric.id, attempt.outcome);
        }

        attempt
    }
}
