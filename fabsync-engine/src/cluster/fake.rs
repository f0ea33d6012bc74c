//! In-process fake cluster.
//!
//! Implements the real client traits, so tests and `--dev` runs go through the
//! same scheduler and reconciler code as production. Reachability,
//! authorization, latency and per-resource failures can be injected.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ClusterClient, ClusterConnector, ClusterError};
use crate::fabric::ClusterCredentials;
use crate::resource::{ResourceKey, ResourceKind, ResourceSpec, ServerMetadata};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Connector handing out sessions to fake clusters, one per endpoint.
#[derive(Default)]
pub struct FakeConnector {
    clusters: Mutex<HashMap<String, Arc<FakeCluster>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fake cluster behind `endpoint`, created on first use.
    pub fn cluster(&self, endpoint: &str) -> Arc<FakeCluster> {
        lock(&self.clusters)
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(FakeCluster::default()))
            .clone()
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &ClusterCredentials,
    ) -> Result<Box<dyn ClusterClient>, ClusterError> {
        if !endpoint.contains("://") {
            return Err(ClusterError::InvalidConfig(format!(
                "endpoint {} is not a URL",
                endpoint
            )));
        }
        let cluster = self.cluster(endpoint);
        cluster.connects.fetch_add(1, Ordering::SeqCst);
        cluster.delay().await;

        if !cluster.reachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unreachable(format!(
                "connection refused by {}",
                endpoint
            )));
        }
        if !cluster.authorized.load(Ordering::SeqCst) || credentials.is_empty() {
            return Err(ClusterError::Unauthorized("401 Unauthorized".to_string()));
        }

        cluster.open_sessions.fetch_add(1, Ordering::SeqCst);
        debug!(endpoint = %endpoint, "Fake cluster session opened");
        Ok(Box::new(FakeClient {
            cluster,
            released: AtomicBool::new(false),
        }))
    }
}

/// State of one fake cluster.
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ResourceKey, ResourceSpec>>,
    failing: Mutex<HashSet<ResourceKey>>,
    latency: Mutex<Duration>,
    reachable: AtomicBool,
    authorized: AtomicBool,
    panic_on_list: AtomicBool,
    open_sessions: AtomicUsize,
    connects: AtomicUsize,
    writes: AtomicUsize,
    next_version: AtomicU64,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(HashSet::new()),
            latency: Mutex::new(Duration::ZERO),
            reachable: AtomicBool::new(true),
            authorized: AtomicBool::new(true),
            panic_on_list: AtomicBool::new(false),
            open_sessions: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            next_version: AtomicU64::new(1),
        }
    }
}

impl FakeCluster {
    fn stamp(&self, mut resource: ResourceSpec, uid: Option<String>) -> ResourceSpec {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let generation = resource
            .server
            .as_ref()
            .and_then(|s| s.generation)
            .unwrap_or(0)
            + 1;
        resource.server = Some(ServerMetadata {
            uid: uid.or_else(|| Some(format!("uid-{}", version))),
            resource_version: Some(version.to_string()),
            generation: Some(generation),
            creation_timestamp: None,
        });
        resource
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_failure(&self, key: &ResourceKey) -> Result<(), ClusterError> {
        if lock(&self.failing).contains(key) {
            return Err(ClusterError::Rejected {
                status: 422,
                message: format!("admission webhook denied {}", key),
            });
        }
        Ok(())
    }

    /// Seed an object as if created by someone else. Labels are kept as given.
    pub fn insert(&self, resource: ResourceSpec) {
        let resource = self.stamp(resource, None);
        lock(&self.objects).insert(resource.key.clone(), resource);
    }

    pub fn get(&self, key: &ResourceKey) -> Option<ResourceSpec> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn objects(&self) -> Vec<ResourceSpec> {
        lock(&self.objects).values().cloned().collect()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    /// Delay applied to every call, including connect.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Make writes to `key` fail with a rejection.
    pub fn fail_on(&self, key: ResourceKey) {
        lock(&self.failing).insert(key);
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    /// Make the next `list` call panic, to exercise worker crash handling.
    pub fn set_panic_on_list(&self, panic: bool) {
        self.panic_on_list.store(panic, Ordering::SeqCst);
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Successful create, update and delete calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

struct FakeClient {
    cluster: Arc<FakeCluster>,
    released: AtomicBool,
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceSpec>, ClusterError> {
        self.cluster.delay().await;
        if self.cluster.panic_on_list.swap(false, Ordering::SeqCst) {
            panic!("fake cluster list panicked");
        }
        if !self.cluster.reachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unreachable("connection reset".to_string()));
        }
        Ok(lock(&self.cluster.objects)
            .values()
            .filter(|r| r.key.kind == kind)
            .cloned()
            .collect())
    }

    async fn create(&self, resource: &ResourceSpec) -> Result<ResourceSpec, ClusterError> {
        self.cluster.delay().await;
        self.cluster.check_failure(&resource.key)?;
        let mut objects = lock(&self.cluster.objects);
        if objects.contains_key(&resource.key) {
            return Err(ClusterError::Conflict(format!("{} already exists", resource.key)));
        }
        let mut created = resource.clone();
        created.server = None;
        let created = self.cluster.stamp(created, None);
        objects.insert(created.key.clone(), created.clone());
        self.cluster.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update(&self, resource: &ResourceSpec) -> Result<ResourceSpec, ClusterError> {
        self.cluster.delay().await;
        self.cluster.check_failure(&resource.key)?;
        let mut objects = lock(&self.cluster.objects);
        let Some(current) = objects.get(&resource.key) else {
            return Err(ClusterError::NotFound(resource.key.to_string()));
        };
        let expected = resource.server.as_ref().and_then(|s| s.resource_version.as_ref());
        let actual = current.server.as_ref().and_then(|s| s.resource_version.as_ref());
        if expected.is_some() && expected != actual {
            return Err(ClusterError::Conflict(format!(
                "{} was modified concurrently",
                resource.key
            )));
        }
        let uid = current.server.as_ref().and_then(|s| s.uid.clone());
        let mut updated = resource.clone();
        updated.server = current.server.clone();
        let updated = self.cluster.stamp(updated, uid);
        objects.insert(updated.key.clone(), updated.clone());
        self.cluster.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError> {
        self.cluster.delay().await;
        self.cluster.check_failure(key)?;
        if lock(&self.cluster.objects).remove(key).is_none() {
            return Err(ClusterError::NotFound(key.to_string()));
        }
        self.cluster.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.cluster.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
