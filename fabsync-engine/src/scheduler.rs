//! Scheduler - decides which fabrics to reconcile and dispatches them.
//!
//! Every tick the scheduler:
//! - computes the sync state of every fabric
//! - keeps `NeverSynced` and `OutOfSync` fabrics
//! - orders them `NeverSynced` first, then by oldest `last_sync_at`
//! - dispatches as many as there are free worker slots, skipping fabrics
//!   whose circuit is open or that are already in flight
//!
//! A fabric is in flight from the moment its [`DispatchTicket`] is taken until
//! its attempt has been settled and the ticket dropped.

use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::attempt::{ReconciliationAttempt, Trigger};
use crate::circuit::CircuitBreaker;
use crate::clock::Clock;
use crate::fabric::{Fabric, SyncState};
use crate::reconciler::Reconciler;
use crate::state;
use crate::store::{InventoryStore, StoreError};

// =============================================================================
// Dispatch guard
// =============================================================================

/// Table of fabrics with an attempt in flight.
#[derive(Default)]
pub struct DispatchGuard {
    in_flight: Mutex<HashSet<String>>,
    idle: Notify,
}

impl DispatchGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn table(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `fabric_id`. Returns `None` when it is already in flight.
    pub fn try_acquire(self: &Arc<Self>, fabric_id: &str) -> Option<DispatchTicket> {
        if !self.table().insert(fabric_id.to_string()) {
            return None;
        }
        Some(DispatchTicket {
            guard: self.clone(),
            fabric_id: fabric_id.to_string(),
        })
    }

    pub fn contains(&self, fabric_id: &str) -> bool {
        self.table().contains(fabric_id)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no fabric is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Proof that a fabric is in flight. Dropping it releases the fabric.
pub struct DispatchTicket {
    guard: Arc<DispatchGuard>,
    fabric_id: String,
}

impl DispatchTicket {
    pub fn fabric_id(&self) -> &str {
        &self.fabric_id
    }
}

impl Drop for DispatchTicket {
    fn drop(&mut self) {
        let empty = {
            let mut table = self.guard.table();
            table.remove(&self.fabric_id);
            table.is_empty()
        };
        if empty {
            self.guard.idle.notify_waiters();
        }
    }
}

// =============================================================================
// Health
// =============================================================================

/// Health of the scheduler loop, published on every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerHealth {
    pub running: bool,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick_error: Option<String>,
    pub in_flight: usize,
    pub dispatched_total: u64,
    /// Dispatches skipped because the fabric's circuit was open.
    pub suppressed_total: u64,
    pub crashed_total: u64,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Fabrics due for reconciliation.
    pub due: usize,
    pub dispatched: usize,
    pub suppressed: usize,
    /// Due fabrics left for a later tick because all workers were busy.
    pub deferred: usize,
}

/// Order due fabrics: `NeverSynced` first, then the longest-unsynced.
pub fn order_candidates(candidates: &mut [(SyncState, Fabric)]) {
    candidates.sort_by(|(state_a, a), (state_b, b)| {
        let never_a = *state_a == SyncState::NeverSynced;
        let never_b = *state_b == SyncState::NeverSynced;
        never_b
            .cmp(&never_a)
            .then_with(|| a.last_sync_at.cmp(&b.last_sync_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct Scheduler {
    store: Arc<dyn InventoryStore>,
    reconciler: Arc<Reconciler>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    guard: Arc<DispatchGuard>,
    permits: Arc<Semaphore>,
    tick_interval: Duration,
    health: Arc<watch::Sender<SchedulerHealth>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        reconciler: Arc<Reconciler>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
        max_concurrent: usize,
    ) -> Self {
        let (health, _) = watch::channel(SchedulerHealth::default());
        Self {
            store,
            reconciler,
            breaker,
            clock,
            guard: DispatchGuard::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tick_interval,
            health: Arc::new(health),
        }
    }

    pub fn guard(&self) -> &Arc<DispatchGuard> {
        &self.guard
    }

    pub fn health(&self) -> watch::Receiver<SchedulerHealth> {
        self.health.subscribe()
    }

    /// Evaluate all fabrics once and dispatch the due ones.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let fabrics = self.store.list_fabrics().await?;
        let now = self.clock.now();

        let mut candidates: Vec<(SyncState, Fabric)> = fabrics
            .into_iter()
            .filter_map(|fabric| {
                let in_flight = self.guard.contains(&fabric.id);
                let state = state::compute(&fabric, now, in_flight);
                state.is_dispatchable().then_some((state, fabric))
            })
            .collect();
        order_candidates(&mut candidates);

        let mut report = TickReport {
            due: candidates.len(),
            ..Default::default()
        };
        for (state, fabric) in candidates {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                report.deferred += 1;
                continue;
            };
            if !self.breaker.may_attempt(&fabric.id) {
                debug!(fabric_id = %fabric.id, "Circuit open, skipping");
                report.suppressed += 1;
                continue;
            }
            let Some(ticket) = self.guard.try_acquire(&fabric.id) else {
                self.breaker.release_trial(&fabric.id);
                continue;
            };
            debug!(fabric_id = %fabric.id, state = %state, "Dispatching");
            self.dispatch(fabric, Trigger::Scheduled, ticket, Some(permit));
            report.dispatched += 1;
        }

        if report.deferred > 0 {
            debug!(deferred = report.deferred, "Worker pool saturated");
        }
        let in_flight = self.guard.len();
        self.health.send_modify(|h| {
            h.ticks += 1;
            h.last_tick_at = Some(now);
            h.last_tick_error = None;
            h.in_flight = in_flight;
            h.dispatched_total += report.dispatched as u64;
            h.suppressed_total += report.suppressed as u64;
        });
        Ok(report)
    }

    /// Run an attempt for `fabric` on the worker pool.
    ///
    /// Without a `permit` the task waits for a free worker slot first. The
    /// attempt runs in its own task so a panic is caught here and settled as
    /// an internal failure.
    pub fn dispatch(
        &self,
        fabric: Fabric,
        trigger: Trigger,
        ticket: DispatchTicket,
        permit: Option<OwnedSemaphorePermit>,
    ) -> JoinHandle<ReconciliationAttempt> {
        let reconciler = self.reconciler.clone();
        let permits = self.permits.clone();
        let health = self.health.clone();
        let guard = self.guard.clone();

        tokio::spawn(async move {
            let _ticket = ticket;
            let _permit = match permit {
                Some(permit) => permit,
                None => match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return reconciler
                            .record_crash(&fabric, trigger, "worker pool closed")
                            .await;
                    }
                },
            };
            let in_flight = guard.len();
            health.send_modify(|h| h.in_flight = in_flight);

            let worker = {
                let reconciler = reconciler.clone();
                let fabric = fabric.clone();
                tokio::spawn(async move { reconciler.reconcile(&fabric, trigger).await })
            };

            match worker.await {
                Ok(attempt) => attempt,
                Err(e) => {
                    health.send_modify(|h| h.crashed_total += 1);
                    let message = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        "worker cancelled".to_string()
                    };
                    reconciler.record_crash(&fabric, trigger, &message).await
                }
            }
        })
    }

    /// Tick until `shutdown` flips to `true`, then wait for in-flight attempts.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.tick_interval.as_secs_f64(),
            workers = self.permits.available_permits(),
            "Scheduler started"
        );
        self.health.send_modify(|h| h.running = true);

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) if report.dispatched > 0 => {
                            info!(
                                due = report.due,
                                dispatched = report.dispatched,
                                suppressed = report.suppressed,
                                deferred = report.deferred,
                                "Scheduler tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Scheduler tick failed");
                            self.health.send_modify(|h| {
                                h.ticks += 1;
                                h.last_tick_at = Some(self.clock.now());
                                h.last_tick_error = Some(e.to_string());
                            });
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let in_flight = self.guard.len();
        if in_flight > 0 {
            warn!(in_flight, "Scheduler stopping, waiting for in-flight reconciliations");
        }
        self.guard.wait_idle().await;
        self.health.send_modify(|h| {
            h.running = false;
            h.in_flight = 0;
        });
        info!("Scheduler stopped");
    }

    /// Spawn [`Scheduler::run`] as an owned task.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(self.clone().run(rx));
        SchedulerHandle {
            join,
            shutdown,
            health: self.health(),
        }
    }
}

/// Owner of a running scheduler task.
pub struct SchedulerHandle {
    join: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    health: watch::Receiver<SchedulerHealth>,
}

impl SchedulerHandle {
    pub fn health(&self) -> SchedulerHealth {
        self.health.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerHealth> {
        self.health.clone()
    }

    /// Whether the task has exited, for supervisors.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task to exit on its own. Returns the join error on panic.
    pub async fn join(&mut self) -> Result<(), tokio::task::JoinError> {
        (&mut self.join).await
    }

    /// Ask the loop to stop and wait for it.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown.send(true);
        self.join.await
    }
}
