//! Append-only audit trail of reconciliation attempts.
//!
//! Every recorded attempt is also emitted as a `tracing` event on the
//! `audit` target, so it shows up in the local log even when the
//! persistent trail is unavailable.

mod memory;
mod persistent;

pub use memory::MemoryAuditTrail;
pub use persistent::RedbAuditTrail;

use async_trait::async_trait;
use thiserror::Error;

use crate::attempt::{AttemptOutcome, ReconciliationAttempt};

#[derive(Debug, Error)]
pub enum AuditError {
    /// An attempt with this id was already recorded.
    #[error("attempt already recorded: {0}")]
    Duplicate(String),

    #[error("invalid attempt: {0}")]
    Invalid(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage: {0}")]
    Storage(String),
}

/// Recorder of finished reconciliation attempts. No update or delete.
#[async_trait]
pub trait AuditTrail: Send + Sync {
    /// Append a finalized attempt.
    async fn record(&self, attempt: &ReconciliationAttempt) -> Result<(), AuditError>;

    /// Most recent attempts of a fabric, newest first.
    async fn history(
        &self,
        fabric_id: &str,
        limit: usize,
    ) -> Result<Vec<ReconciliationAttempt>, AuditError>;
}

fn emit(attempt: &ReconciliationAttempt) {
    let counts = attempt.counts();
    let error = attempt.error.as_ref().map(|e| e.to_string());
    let duration_ms = (attempt.finished_at - attempt.started_at).num_milliseconds();
    match attempt.outcome {
        AttemptOutcome::Failure => tracing::warn!(
            target: "audit",
            fabric_id = %attempt.fabric_id,
            attempt_id = %attempt.id,
            trigger = %attempt.trigger,
            state_before = %attempt.state_before,
            state_after = %attempt.state_after,
            duration_ms,
            error = error.as_deref().unwrap_or(""),
            "Reconciliation failed"
        ),
        outcome => tracing::info!(
            target: "audit",
            fabric_id = %attempt.fabric_id,
            attempt_id = %attempt.id,
            trigger = %attempt.trigger,
            outcome = %outcome,
            state_before = %attempt.state_before,
            state_after = %attempt.state_after,
            created = counts.created,
            updated = counts.updated,
            deleted = counts.deleted,
            conflicts = counts.conflicts,
            failed = counts.failed,
            duration_ms,
            "Reconciliation finished"
        ),
    }
}
