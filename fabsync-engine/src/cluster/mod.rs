//! Cluster-client boundary.
//!
//! The reconciler opens one session per attempt through a
//! [`ClusterConnector`] and holds it in a [`SessionLease`], which releases the
//! session when dropped. That covers early returns, timeouts and panics.

pub mod fake;
pub mod http;

pub use fake::{FakeCluster, FakeConnector};
pub use http::HttpConnector;

use std::ops::Deref;

use async_trait::async_trait;
use thiserror::Error;

use crate::fabric::{ClusterCredentials, ErrorClass};
use crate::resource::{ResourceKey, ResourceKind, ResourceSpec};

/// Errors returned by cluster clients, classified for the reconciler.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),
}

impl ClusterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClusterError::Unreachable(_) | ClusterError::Tls(_) => ErrorClass::Connection,
            ClusterError::Unauthorized(_) | ClusterError::Forbidden(_) => {
                ErrorClass::Authentication
            }
            ClusterError::Timeout(_) => ErrorClass::Timeout,
            ClusterError::Rejected { .. } | ClusterError::NotFound(_) | ClusterError::Conflict(_) => {
                ErrorClass::Resource
            }
            ClusterError::InvalidConfig(_) => ErrorClass::Configuration,
        }
    }
}

/// Opens sessions against a cluster API.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &ClusterCredentials,
    ) -> Result<Box<dyn ClusterClient>, ClusterError>;
}

/// One open session against a cluster API.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List all resources of a kind, across namespaces.
    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceSpec>, ClusterError>;

    async fn create(&self, resource: &ResourceSpec) -> Result<ResourceSpec, ClusterError>;

    /// Replace a resource. `resource.server` carries the version to update from.
    async fn update(&self, resource: &ResourceSpec) -> Result<ResourceSpec, ClusterError>;

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError>;

    /// Close the session. Called exactly once, by [`SessionLease`].
    fn release(&self);
}

/// Scoped ownership of a cluster session.
pub struct SessionLease {
    client: Box<dyn ClusterClient>,
}

impl SessionLease {
    pub fn new(client: Box<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

impl Deref for SessionLease {
    type Target = dyn ClusterClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.client.release();
    }
}
