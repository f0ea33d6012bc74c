//! In-memory inventory store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::fabric::Fabric;
use crate::resource::{ResourceKey, ResourceSpec};

use super::error::{Result, StoreError};
use super::traits::{
    CreateFabricRequest, DesiredStateStore, FabricStore, SyncResultUpdate,
    UpdateFabricConfigRequest,
};

#[derive(Default)]
struct Inner {
    fabrics: BTreeMap<String, Fabric>,
    desired: BTreeMap<String, BTreeMap<ResourceKey, ResourceSpec>>,
}

/// Inventory store held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FabricStore for MemoryStore {
    async fn list_fabrics(&self) -> Result<Vec<Fabric>> {
        Ok(self.inner.read().await.fabrics.values().cloned().collect())
    }

    async fn get_fabric(&self, id: &str) -> Result<Option<Fabric>> {
        Ok(self.inner.read().await.fabrics.get(id).cloned())
    }

    async fn create_fabric(&self, req: CreateFabricRequest) -> Result<Fabric> {
        let fabric = super::new_fabric(req, Utc::now())?;
        let mut inner = self.inner.write().await;
        if inner.fabrics.contains_key(&fabric.id) {
            return Err(StoreError::Conflict(format!("fabric {} already exists", fabric.id)));
        }
        if inner.fabrics.values().any(|f| f.name == fabric.name) {
            return Err(StoreError::Conflict(format!(
                "fabric name {} already in use",
                fabric.name
            )));
        }
        inner.fabrics.insert(fabric.id.clone(), fabric.clone());
        Ok(fabric)
    }

    async fn update_fabric_config(
        &self,
        id: &str,
        req: UpdateFabricConfigRequest,
    ) -> Result<Fabric> {
        let mut inner = self.inner.write().await;
        if let Some(name) = &req.name
            && inner.fabrics.values().any(|f| f.id != id && &f.name == name)
        {
            return Err(StoreError::Conflict(format!("fabric name {} already in use", name)));
        }
        let fabric = inner
            .fabrics
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("fabric {}", id)))?;
        super::apply_config(fabric, req, Utc::now())?;
        Ok(fabric.clone())
    }

    async fn apply_sync_result(&self, id: &str, update: SyncResultUpdate) -> Result<Fabric> {
        let mut inner = self.inner.write().await;
        let fabric = inner
            .fabrics
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("fabric {}", id)))?;
        super::apply_sync(fabric, update, Utc::now());
        Ok(fabric.clone())
    }

    async fn delete_fabric(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let fabric = inner
            .fabrics
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("fabric {}", id)))?;
        super::ensure_deletable(fabric)?;
        inner.fabrics.remove(id);
        inner.desired.remove(id);
        Ok(())
    }
}

#[async_trait]
impl DesiredStateStore for MemoryStore {
    async fn list_desired(&self, fabric_id: &str) -> Result<Vec<ResourceSpec>> {
        let inner = self.inner.read().await;
        Ok(inner
            .desired
            .get(fabric_id)
            .map(|resources| resources.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_desired(&self, fabric_id: &str, resource: ResourceSpec) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.fabrics.contains_key(fabric_id) {
            return Err(StoreError::NotFound(format!("fabric {}", fabric_id)));
        }
        inner
            .desired
            .entry(fabric_id.to_string())
            .or_default()
            .insert(resource.key.clone(), resource);
        Ok(())
    }

    async fn delete_desired(&self, fabric_id: &str, key: &ResourceKey) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .desired
            .get_mut(fabric_id)
            .and_then(|resources| resources.remove(key))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("desired resource {}", key)))
    }
}
