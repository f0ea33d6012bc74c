//! Reconciliation attempt records and outcome aggregation.

use std::fmt;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

use crate::fabric::{ErrorClass, SyncError, SyncState};
use crate::resolver::ResourceDiff;
use crate::resource::ResourceKey;

static ATTEMPT_IDS: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Monotonic ULID, so attempt ids sort in creation order.
pub fn next_attempt_id() -> Ulid {
    let mut generator = ATTEMPT_IDS.lock().unwrap_or_else(|e| e.into_inner());
    generator.generate().unwrap_or_else(|_| Ulid::new())
}

/// What started an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => f.write_str("scheduled"),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Partial,
    Failure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Partial => "partial",
            AttemptOutcome::Failure => "failure",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of handling one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    Applied,
    Failed { error: String },
    Unchanged,
    Flagged { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAction {
    pub key: ResourceKey,
    pub diff: ResourceDiff,
    pub status: ActionStatus,
}

impl ResourceAction {
    /// Record a diff that needs no cluster call.
    pub fn passive(key: ResourceKey, diff: ResourceDiff) -> Self {
        let status = match &diff {
            ResourceDiff::Conflict { reason } => ActionStatus::Flagged {
                reason: reason.clone(),
            },
            _ => ActionStatus::Unchanged,
        };
        Self { key, diff, status }
    }
}

/// Per-kind action counts of an attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub failed: usize,
}

impl ActionCounts {
    pub fn of(actions: &[ResourceAction]) -> Self {
        let mut counts = Self::default();
        for action in actions {
            match (&action.status, &action.diff) {
                (ActionStatus::Failed { .. }, _) => counts.failed += 1,
                (ActionStatus::Flagged { .. }, _) => counts.conflicts += 1,
                (ActionStatus::Unchanged, _) => counts.unchanged += 1,
                (ActionStatus::Applied, ResourceDiff::Create) => counts.created += 1,
                (ActionStatus::Applied, ResourceDiff::Update(_)) => counts.updated += 1,
                (ActionStatus::Applied, ResourceDiff::Delete) => counts.deleted += 1,
                (ActionStatus::Applied, _) => counts.unchanged += 1,
            }
        }
        counts
    }

    pub fn applied(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    /// Actions that required a cluster call.
    pub fn actionable(&self) -> usize {
        self.applied() + self.failed
    }
}

/// One finished sync run. Handed to the audit trail as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationAttempt {
    pub id: String,
    pub fabric_id: String,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub actions: Vec<ResourceAction>,
    pub error: Option<SyncError>,
    pub state_before: SyncState,
    pub state_after: SyncState,
}

impl ReconciliationAttempt {
    pub fn counts(&self) -> ActionCounts {
        ActionCounts::of(&self.actions)
    }
}

/// How an attempt's result is applied to the fabric record.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub outcome: AttemptOutcome,
    /// Whether `last_sync_at` moves to the attempt's finish time.
    pub advance_last_sync: bool,
    /// New `last_error`, before escalation.
    pub error: Option<SyncError>,
}

/// Aggregate per-resource results into an outcome.
///
/// * An aborted attempt fails.
/// * Any failed call or flagged conflict makes it partial.
/// * Otherwise it succeeded.
///
/// Resource-level failures never fail the attempt, so they stay out of the
/// circuit breaker. `last_sync_at` only moves when at least one call went
/// through or none was needed. Conflicts are never errors: a partial attempt
/// with only conflicts clears `last_error`.
pub fn settle(
    actions: &[ResourceAction],
    abort: Option<SyncError>,
    now: DateTime<Utc>,
) -> Settlement {
    if let Some(error) = abort {
        return Settlement {
            outcome: AttemptOutcome::Failure,
            advance_last_sync: false,
            error: Some(error),
        };
    }

    let counts = ActionCounts::of(actions);
    let first_failure = actions.iter().find_map(|a| match &a.status {
        ActionStatus::Failed { error } => Some(format!("{}: {}", a.key, error)),
        _ => None,
    });

    let outcome = if counts.failed > 0 || counts.conflicts > 0 {
        AttemptOutcome::Partial
    } else {
        AttemptOutcome::Success
    };
    let error = first_failure.map(|first| {
        SyncError::new(
            ErrorClass::Resource,
            format!(
                "{} of {} resource actions failed, first: {}",
                counts.failed,
                counts.actionable(),
                first
            ),
            now,
        )
    });

    Settlement {
        outcome,
        advance_last_sync: counts.actionable() == 0 || counts.applied() > 0,
        error,
    }
}
