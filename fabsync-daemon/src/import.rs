//! Inventory import from a JSON file.
//!
//! ```json
//! {
//!   "fabrics": [
//!     {
//!       "id": "dc1",
//!       "name": "Datacenter 1",
//!       "cluster_endpoint": "https://dc1-control:6443",
//!       "credentials": "env:DC1_TOKEN",
//!       "resources": [
//!         { "kind": "VPC", "metadata": { "name": "vpc-1" }, "spec": { "vlanNamespace": "default" } }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Fabrics are upserted by id. The listed resources replace the fabric's
//! desired state; drift against the cluster is left to the reconciler.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use fabsync_engine::store::{
    CreateFabricRequest, DesiredStateStore, FabricStore, UpdateFabricConfigRequest,
};
use fabsync_engine::{ClusterCredentials, ResourceKey, ResourceSpec, SyncEngine};

#[derive(Debug, Deserialize)]
pub struct ImportFile {
    #[serde(default)]
    pub fabrics: Vec<ImportedFabric>,
}

#[derive(Debug, Deserialize)]
pub struct ImportedFabric {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cluster_endpoint: String,
    #[serde(default)]
    pub credentials: ClusterCredentials,
    #[serde(default = "enabled")]
    pub sync_enabled: bool,
    #[serde(default)]
    pub sync_interval_secs: Option<u64>,
    /// API objects (`kind`, `metadata`, `spec`).
    #[serde(default)]
    pub resources: Vec<Value>,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
    pub resources: usize,
    pub removed: usize,
}

pub async fn load(path: &Path) -> Result<ImportFile> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read import file {}", path.display()))?;
    parse(&text).with_context(|| format!("Invalid import file {}", path.display()))
}

pub fn parse(text: &str) -> Result<ImportFile> {
    let file: ImportFile = serde_json::from_str(text)?;
    let mut ids = BTreeSet::new();
    for fabric in &file.fabrics {
        if !ids.insert(fabric.id.as_str()) {
            bail!("fabric {} is listed twice", fabric.id);
        }
    }
    Ok(file)
}

fn desired_resources(fabric: &ImportedFabric) -> Result<Vec<ResourceSpec>> {
    fabric
        .resources
        .iter()
        .enumerate()
        .map(|(i, object)| {
            let mut resource = ResourceSpec::from_object(object).with_context(|| {
                format!(
                    "resource #{} of fabric {} is not a valid API object",
                    i, fabric.id
                )
            })?;
            resource.server = None;
            Ok(resource)
        })
        .collect()
}

/// Upsert every fabric in `file` and replace its desired state.
pub async fn apply(
    engine: &SyncEngine,
    file: ImportFile,
    default_interval_secs: u64,
) -> Result<ImportSummary> {
    let store = engine.store();
    let mut summary = ImportSummary::default();

    for fabric in file.fabrics {
        let resources = desired_resources(&fabric)?;
        let interval = fabric.sync_interval_secs.unwrap_or(default_interval_secs);

        match store.get_fabric(&fabric.id).await? {
            Some(_) => {
                engine
                    .reconfigure(
                        &fabric.id,
                        UpdateFabricConfigRequest {
                            name: Some(fabric.name.clone()),
                            cluster_endpoint: Some(fabric.cluster_endpoint.clone()),
                            credentials: Some(fabric.credentials.clone()),
                            sync_enabled: Some(fabric.sync_enabled),
                            sync_interval_secs: Some(interval),
                        },
                    )
                    .await
                    .with_context(|| format!("Failed to update fabric {}", fabric.id))?;
                summary.updated += 1;
            }
            None => {
                store
                    .create_fabric(CreateFabricRequest {
                        id: Some(fabric.id.clone()),
                        name: fabric.name.clone(),
                        cluster_endpoint: fabric.cluster_endpoint.clone(),
                        credentials: fabric.credentials.clone(),
                        sync_enabled: fabric.sync_enabled,
                        sync_interval_secs: Some(interval),
                    })
                    .await
                    .with_context(|| format!("Failed to create fabric {}", fabric.id))?;
                summary.created += 1;
            }
        }

        let wanted: BTreeSet<ResourceKey> = resources.iter().map(|r| r.key.clone()).collect();
        for existing in store.list_desired(&fabric.id).await? {
            if !wanted.contains(&existing.key) {
                store.delete_desired(&fabric.id, &existing.key).await?;
                summary.removed += 1;
            }
        }
        for resource in resources {
            debug!(fabric_id = %fabric.id, resource = %resource.key, "Importing desired resource");
            store.put_desired(&fabric.id, resource).await?;
            summary.resources += 1;
        }
    }

    info!(
        created = summary.created,
        updated = summary.updated,
        resources = summary.resources,
        removed = summary.removed,
        "Inventory imported"
    );
    Ok(summary)
}
