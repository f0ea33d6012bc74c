//! redb-backed inventory store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};

use crate::fabric::Fabric;
use crate::resource::{ResourceKey, ResourceSpec};

use super::error::{Result, StoreError};
use super::traits::{
    CreateFabricRequest, DesiredStateStore, FabricStore, SyncResultUpdate,
    UpdateFabricConfigRequest,
};

const TABLE_FABRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("fabrics");
const TABLE_DESIRED: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("desired_resources");

fn internal(e: impl Into<redb::Error>) -> StoreError {
    StoreError::Internal(e.into().to_string())
}

/// Inventory store in a single redb file.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(internal)?;

        let txn = db.begin_write().map_err(internal)?;
        txn.open_table(TABLE_FABRICS).map_err(internal)?;
        txn.open_table(TABLE_DESIRED).map_err(internal)?;
        txn.commit().map_err(internal)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Run blocking redb work off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Internal(format!("store task failed: {e}")))?
    }

    fn read_fabric(db: &Database, id: &str) -> Result<Option<Fabric>> {
        let txn = db.begin_read().map_err(internal)?;
        let fabrics = txn.open_table(TABLE_FABRICS).map_err(internal)?;
        match fabrics.get(id).map_err(internal)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write of one fabric inside a single write transaction.
    fn modify_fabric<F>(db: &Database, id: &str, f: F) -> Result<Fabric>
    where
        F: FnOnce(&mut Fabric, &[Fabric]) -> Result<()>,
    {
        let txn = db.begin_write().map_err(internal)?;
        let fabric = {
            let mut fabrics = txn.open_table(TABLE_FABRICS).map_err(internal)?;
            let mut all = Vec::new();
            for item in fabrics.iter().map_err(internal)? {
                let (_, value) = item.map_err(internal)?;
                all.push(serde_json::from_slice::<Fabric>(value.value())?);
            }
            let mut fabric = all
                .iter()
                .find(|f| f.id == id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("fabric {}", id)))?;
            f(&mut fabric, &all)?;
            let value = serde_json::to_vec(&fabric)?;
            fabrics.insert(id, value.as_slice()).map_err(internal)?;
            fabric
        };
        txn.commit().map_err(internal)?;
        Ok(fabric)
    }
}

#[async_trait]
impl FabricStore for RedbStore {
    async fn list_fabrics(&self) -> Result<Vec<Fabric>> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(internal)?;
            let fabrics = txn.open_table(TABLE_FABRICS).map_err(internal)?;
            let mut results = Vec::new();
            for item in fabrics.iter().map_err(internal)? {
                let (_, value) = item.map_err(internal)?;
                results.push(serde_json::from_slice(value.value())?);
            }
            Ok(results)
        })
        .await
    }

    async fn get_fabric(&self, id: &str) -> Result<Option<Fabric>> {
        let id = id.to_string();
        self.blocking(move |db| Self::read_fabric(db, &id)).await
    }

    async fn create_fabric(&self, req: CreateFabricRequest) -> Result<Fabric> {
        let fabric = super::new_fabric(req, Utc::now())?;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(internal)?;
            {
                let mut fabrics = txn.open_table(TABLE_FABRICS).map_err(internal)?;
                if fabrics.get(fabric.id.as_str()).map_err(internal)?.is_some() {
                    return Err(StoreError::Conflict(format!(
                        "fabric {} already exists",
                        fabric.id
                    )));
                }
                for item in fabrics.iter().map_err(internal)? {
                    let (_, value) = item.map_err(internal)?;
                    let existing: Fabric = serde_json::from_slice(value.value())?;
                    if existing.name == fabric.name {
                        return Err(StoreError::Conflict(format!(
                            "fabric name {} already in use",
                            fabric.name
                        )));
                    }
                }
                let value = serde_json::to_vec(&fabric)?;
                fabrics
                    .insert(fabric.id.as_str(), value.as_slice())
                    .map_err(internal)?;
            }
            txn.commit().map_err(internal)?;
            Ok(fabric)
        })
        .await
    }

    async fn update_fabric_config(
        &self,
        id: &str,
        req: UpdateFabricConfigRequest,
    ) -> Result<Fabric> {
        let id = id.to_string();
        self.blocking(move |db| {
            Self::modify_fabric(db, &id, |fabric, all| {
                if let Some(name) = &req.name
                    && all.iter().any(|f| f.id != fabric.id && &f.name == name)
                {
                    return Err(StoreError::Conflict(format!(
                        "fabric name {} already in use",
                        name
                    )));
                }
                super::apply_config(fabric, req, Utc::now())
            })
        })
        .await
    }

    async fn apply_sync_result(&self, id: &str, update: SyncResultUpdate) -> Result<Fabric> {
        let id = id.to_string();
        self.blocking(move |db| {
            Self::modify_fabric(db, &id, |fabric, _| {
                super::apply_sync(fabric, update, Utc::now());
                Ok(())
            })
        })
        .await
    }

    async fn delete_fabric(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(internal)?;
            {
                let mut fabrics = txn.open_table(TABLE_FABRICS).map_err(internal)?;
                let fabric: Fabric = match fabrics.get(id.as_str()).map_err(internal)? {
                    Some(value) => serde_json::from_slice(value.value())?,
                    None => return Err(StoreError::NotFound(format!("fabric {}", id))),
                };
                super::ensure_deletable(&fabric)?;
                fabrics.remove(id.as_str()).map_err(internal)?;

                let mut desired = txn.open_table(TABLE_DESIRED).map_err(internal)?;
                let mut keys = Vec::new();
                for item in desired
                    .range((id.as_str(), "")..)
                    .map_err(internal)?
                {
                    let (key, _) = item.map_err(internal)?;
                    let (fabric_id, resource_key) = key.value();
                    if fabric_id != id {
                        break;
                    }
                    keys.push(resource_key.to_string());
                }
                for key in keys {
                    desired
                        .remove((id.as_str(), key.as_str()))
                        .map_err(internal)?;
                }
            }
            txn.commit().map_err(internal)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DesiredStateStore for RedbStore {
    async fn list_desired(&self, fabric_id: &str) -> Result<Vec<ResourceSpec>> {
        let fabric_id = fabric_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(internal)?;
            let desired = txn.open_table(TABLE_DESIRED).map_err(internal)?;
            let mut results = Vec::new();
            for item in desired
                .range((fabric_id.as_str(), "")..)
                .map_err(internal)?
            {
                let (key, value) = item.map_err(internal)?;
                if key.value().0 != fabric_id {
                    break;
                }
                results.push(serde_json::from_slice(value.value())?);
            }
            Ok(results)
        })
        .await
    }

    async fn put_desired(&self, fabric_id: &str, resource: ResourceSpec) -> Result<()> {
        let fabric_id = fabric_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(internal)?;
            {
                let fabrics = txn.open_table(TABLE_FABRICS).map_err(internal)?;
                if fabrics.get(fabric_id.as_str()).map_err(internal)?.is_none() {
                    return Err(StoreError::NotFound(format!("fabric {}", fabric_id)));
                }
                let mut desired = txn.open_table(TABLE_DESIRED).map_err(internal)?;
                let key = resource.key.storage_key();
                let value = serde_json::to_vec(&resource)?;
                desired
                    .insert((fabric_id.as_str(), key.as_str()), value.as_slice())
                    .map_err(internal)?;
            }
            txn.commit().map_err(internal)?;
            Ok(())
        })
        .await
    }

    async fn delete_desired(&self, fabric_id: &str, key: &ResourceKey) -> Result<()> {
        let fabric_id = fabric_id.to_string();
        let key = key.clone();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(internal)?;
            {
                let mut desired = txn.open_table(TABLE_DESIRED).map_err(internal)?;
                let storage_key = key.storage_key();
                let removed = desired
                    .remove((fabric_id.as_str(), storage_key.as_str()))
                    .map_err(internal)?;
                if removed.is_none() {
                    return Err(StoreError::NotFound(format!("desired resource {}", key)));
                }
            }
            txn.commit().map_err(internal)?;
            Ok(())
        })
        .await
    }
}
