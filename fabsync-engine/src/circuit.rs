//! Per-fabric circuit breaker.
//!
//! A fabric's circuit starts `Closed`. After `failure_threshold` consecutive
//! failed attempts it opens and stays open for a cool-down of
//! `base_cooldown * 2^min(failures, max_backoff_exponent)` (capped at
//! `max_cooldown`). Once the cool-down has elapsed the next caller of
//! [`CircuitBreaker::may_attempt`] moves it to `HalfOpen` and owns the single
//! trial slot. The trial's outcome closes or reopens the circuit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attempt::AttemptOutcome;
use crate::clock::Clock;

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    pub base_cooldown: Duration,
    /// Cap on the exponent applied to `base_cooldown`.
    pub max_backoff_exponent: u32,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(10),
            max_backoff_exponent: 8,
            max_cooldown: Duration::from_secs(30 * 60),
        }
    }
}

impl BreakerConfig {
    /// Cool-down applied after `failures` consecutive failures.
    pub fn cooldown(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.max_backoff_exponent).min(31);
        let factor = 1u32 << exponent;
        self.base_cooldown
            .checked_mul(factor)
            .unwrap_or(self.max_cooldown)
            .min(self.max_cooldown)
    }
}

/// State of one fabric's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open { reopen_at: DateTime<Utc> },
    HalfOpen { trial_in_flight: bool },
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Point-in-time view of a fabric's circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

impl CircuitSnapshot {
    pub fn reopen_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CircuitState::Open { reopen_at } => Some(reopen_at),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: CircuitState,
    consecutive_failures: u32,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }
}

/// Failure-isolation gate shared by the scheduler and manual triggers.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reopen_at(&self, from: DateTime<Utc>, failures: u32) -> DateTime<Utc> {
        let cooldown = chrono::Duration::from_std(self.config.cooldown(failures))
            .unwrap_or(chrono::Duration::MAX);
        from.checked_add_signed(cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether an attempt against `fabric_id` may start now.
    ///
    /// Moving an open circuit to half-open and claiming its trial slot happen
    /// under one lock, so only one caller ever gets the trial.
    pub fn may_attempt(&self, fabric_id: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(fabric_id) else {
            return true;
        };

        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open { reopen_at } if now >= reopen_at => {
                info!(
                    fabric_id = %fabric_id,
                    failures = entry.consecutive_failures,
                    "Circuit half-open, allowing trial attempt"
                );
                entry.state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
            CircuitState::Open { .. } => false,
            CircuitState::HalfOpen {
                trial_in_flight: false,
            } => {
                entry.state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
            CircuitState::HalfOpen {
                trial_in_flight: true,
            } => false,
        }
    }

    /// Feed the outcome of a finished attempt.
    pub fn record_result(&self, fabric_id: &str, outcome: AttemptOutcome) {
        let now = self.clock.now();
        let mut entries = self.entries();
        let entry = entries.entry(fabric_id.to_string()).or_default();

        match outcome {
            AttemptOutcome::Success | AttemptOutcome::Partial => {
                if entry.state != CircuitState::Closed {
                    info!(fabric_id = %fabric_id, "Circuit closed");
                }
                *entry = Entry::default();
            }
            AttemptOutcome::Failure => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                let failures = entry.consecutive_failures;
                let trip = match entry.state {
                    CircuitState::Closed => failures >= self.config.failure_threshold,
                    CircuitState::Open { .. } | CircuitState::HalfOpen { .. } => true,
                };
                if trip {
                    let reopen_at = self.reopen_at(now, failures);
                    warn!(
                        fabric_id = %fabric_id,
                        failures,
                        reopen_at = %reopen_at,
                        "Circuit opened"
                    );
                    entry.state = CircuitState::Open { reopen_at };
                } else {
                    debug!(fabric_id = %fabric_id, failures, "Attempt failed, circuit still closed");
                }
            }
        }
    }

    /// Give back a half-open trial slot that was reserved but never used.
    pub fn release_trial(&self, fabric_id: &str) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(fabric_id)
            && entry.state
                == (CircuitState::HalfOpen {
                    trial_in_flight: true,
                })
        {
            entry.state = CircuitState::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    /// Forget everything about a fabric's circuit.
    pub fn reset(&self, fabric_id: &str) {
        if self.entries().remove(fabric_id).is_some() {
            info!(fabric_id = %fabric_id, "Circuit reset");
        }
    }

    /// Rebuild a fabric's circuit from persisted failure information.
    pub fn hydrate(
        &self,
        fabric_id: &str,
        consecutive_failures: u32,
        last_failure_at: Option<DateTime<Utc>>,
    ) {
        let state = if consecutive_failures >= self.config.failure_threshold {
            let from = last_failure_at.unwrap_or_else(|| self.clock.now());
            CircuitState::Open {
                reopen_at: self.reopen_at(from, consecutive_failures),
            }
        } else {
            CircuitState::Closed
        };
        debug!(
            fabric_id = %fabric_id,
            consecutive_failures,
            state = state.as_str(),
            "Circuit hydrated"
        );
        self.entries().insert(
            fabric_id.to_string(),
            Entry {
                state,
                consecutive_failures,
            },
        );
    }

    pub fn snapshot(&self, fabric_id: &str) -> CircuitSnapshot {
        let entry = self
            .entries()
            .get(fabric_id)
            .copied()
            .unwrap_or_default();
        CircuitSnapshot {
            state: entry.state,
            consecutive_failures: entry.consecutive_failures,
        }
    }
}
