use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AuditError, AuditTrail, emit};
use crate::attempt::ReconciliationAttempt;

/// In-process audit trail, used in dev mode and tests.
#[derive(Default)]
pub struct MemoryAuditTrail {
    attempts: RwLock<HashMap<String, Vec<ReconciliationAttempt>>>,
}

impl MemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempts recorded across all fabrics.
    pub async fn len(&self) -> usize {
        self.attempts.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditTrail for MemoryAuditTrail {
    async fn record(&self, attempt: &ReconciliationAttempt) -> Result<(), AuditError> {
        let mut attempts = self.attempts.write().await;
        let entries = attempts.entry(attempt.fabric_id.clone()).or_default();
        if entries.iter().any(|a| a.id == attempt.id) {
            return Err(AuditError::Duplicate(attempt.id.clone()));
        }
        entries.push(attempt.clone());
        emit(attempt);
        Ok(())
    }

    async fn history(
        &self,
        fabric_id: &str,
        limit: usize,
    ) -> Result<Vec<ReconciliationAttempt>, AuditError> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .get(fabric_id)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
