use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use ulid::Ulid;

use super::{AuditError, AuditTrail, emit};
use crate::attempt::ReconciliationAttempt;

const TABLE_ATTEMPTS: TableDefinition<(&str, u128), &[u8]> = TableDefinition::new("attempts");

fn storage(e: impl Into<redb::Error>) -> AuditError {
    AuditError::Storage(e.into().to_string())
}

/// Audit trail in a redb file, keyed by `(fabric_id, attempt ULID)`.
pub struct RedbAuditTrail {
    db: Arc<Database>,
}

impl RedbAuditTrail {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let db = Database::create(path.as_ref()).map_err(storage)?;

        let txn = db.begin_write().map_err(storage)?;
        txn.open_table(TABLE_ATTEMPTS).map_err(storage)?;
        txn.commit().map_err(storage)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn append(db: &Database, fabric_id: &str, key: u128, value: &[u8]) -> Result<(), AuditError> {
        let txn = db.begin_write().map_err(storage)?;
        {
            let mut attempts = txn.open_table(TABLE_ATTEMPTS).map_err(storage)?;
            if attempts.get((fabric_id, key)).map_err(storage)?.is_some() {
                return Err(AuditError::Duplicate(Ulid(key).to_string()));
            }
            attempts.insert((fabric_id, key), value).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(())
    }

    fn query(
        db: &Database,
        fabric_id: &str,
        limit: usize,
    ) -> Result<Vec<ReconciliationAttempt>, AuditError> {
        let txn = db.begin_read().map_err(storage)?;
        let attempts = txn.open_table(TABLE_ATTEMPTS).map_err(storage)?;
        let range = attempts
            .range((fabric_id, 0u128)..=(fabric_id, u128::MAX))
            .map_err(storage)?;

        let mut results = Vec::new();
        for item in range.rev() {
            if results.len() >= limit {
                break;
            }
            let (_, value) = item.map_err(storage)?;
            results.push(serde_json::from_slice(value.value())?);
        }
        Ok(results)
    }
}

#[async_trait]
impl AuditTrail for RedbAuditTrail {
    async fn record(&self, attempt: &ReconciliationAttempt) -> Result<(), AuditError> {
        let ulid: Ulid = attempt
            .id
            .parse()
            .map_err(|e| AuditError::Invalid(format!("attempt id {}: {e}", attempt.id)))?;
        let value = serde_json::to_vec(attempt)?;
        let fabric_id = attempt.fabric_id.clone();
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || Self::append(&db, &fabric_id, ulid.0, &value))
            .await
            .map_err(|e| AuditError::Storage(format!("audit writer task failed: {e}")))??;

        emit(attempt);
        Ok(())
    }

    async fn history(
        &self,
        fabric_id: &str,
        limit: usize,
    ) -> Result<Vec<ReconciliationAttempt>, AuditError> {
        let fabric_id = fabric_id.to_string();
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || Self::query(&db, &fabric_id, limit))
            .await
            .map_err(|e| AuditError::Storage(format!("audit reader task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptOutcome;
    use crate::audit::test_support::make_attempt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn record_and_query() {
        let dir = TempDir::new().unwrap();
        let trail = RedbAuditTrail::open(dir.path().join("audit.redb")).unwrap();

        let first = make_attempt("f", 0, AttemptOutcome::Failure);
        let second = make_attempt("f", 1, AttemptOutcome::Success);
        trail.record(&first).await.unwrap();
        trail.record(&second).await.unwrap();
        trail
            .record(&make_attempt("g", 0, AttemptOutcome::Success))
            .await
            .unwrap();

        let history = trail.history("f", 10).await.unwrap();
        assert_eq!(history, vec![second.clone(), first]);

        let latest = trail.history("f", 1).await.unwrap();
        assert_eq!(latest, vec![second]);
    }

    #[tokio::test]
    async fn prefix_does_not_leak_between_fabrics() {
        let dir = TempDir::new().unwrap();
        let trail = RedbAuditTrail::open(dir.path().join("audit.redb")).unwrap();
        trail
            .record(&make_attempt("fab", 0, AttemptOutcome::Success))
            .await
            .unwrap();
        trail
            .record(&make_attempt("fab-2", 0, AttemptOutcome::Success))
            .await
            .unwrap();

        assert_eq!(trail.history("fab", 10).await.unwrap().len(), 1);
        assert_eq!(trail.history("fa", 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.redb");
        let attempt = make_attempt("f", 0, AttemptOutcome::Partial);
        {
            let trail = RedbAuditTrail::open(&path).unwrap();
            trail.record(&attempt).await.unwrap();
        }

        let trail = RedbAuditTrail::open(&path).unwrap();
        assert_eq!(trail.history("f", 10).await.unwrap(), vec![attempt.clone()]);
        assert!(matches!(
            trail.record(&attempt).await,
            Err(AuditError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn rejects_non_ulid_ids() {
        let dir = TempDir::new().unwrap();
        let trail = RedbAuditTrail::open(dir.path().join("audit.redb")).unwrap();
        let mut attempt = make_attempt("f", 0, AttemptOutcome::Success);
        attempt.id = "not-a-ulid".to_string();
        assert!(matches!(
            trail.record(&attempt).await,
            Err(AuditError::Invalid(_))
        ));
    }
}
