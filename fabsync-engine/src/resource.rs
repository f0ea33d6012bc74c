//! Declarative cluster resources as seen by the reconciler.
//!
//! The resource schema itself is opaque: only the identity (`ResourceKey`),
//! labels and the `spec` payload take part in reconciliation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Label marking a resource as created and owned by the sync engine.
pub const MANAGED_BY_LABEL: &str = "fabsync.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`] on owned resources.
pub const MANAGED_BY_VALUE: &str = "fabsync";
/// Label naming the fabric that owns a resource.
pub const FABRIC_LABEL: &str = "fabsync.io/fabric";

pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource kinds the engine reconciles, in the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Switch,
    Server,
    Connection,
    Vpc,
    VpcAttachment,
    VpcPeering,
    External,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Switch,
        ResourceKind::Server,
        ResourceKind::Connection,
        ResourceKind::Vpc,
        ResourceKind::VpcAttachment,
        ResourceKind::VpcPeering,
        ResourceKind::External,
    ];

    pub fn api_group(&self) -> &'static str {
        match self {
            ResourceKind::Switch | ResourceKind::Server | ResourceKind::Connection => {
                "wiring.githedgehog.com"
            }
            ResourceKind::Vpc
            | ResourceKind::VpcAttachment
            | ResourceKind::VpcPeering
            | ResourceKind::External => "vpc.githedgehog.com",
        }
    }

    pub fn api_version(&self) -> &'static str {
        "v1beta1"
    }

    /// Lower-case plural used in API paths.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Switch => "switches",
            ResourceKind::Server => "servers",
            ResourceKind::Connection => "connections",
            ResourceKind::Vpc => "vpcs",
            ResourceKind::VpcAttachment => "vpcattachments",
            ResourceKind::VpcPeering => "vpcpeerings",
            ResourceKind::External => "externals",
        }
    }

    /// `kind` field as it appears in API objects.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResourceKind::Switch => "Switch",
            ResourceKind::Server => "Server",
            ResourceKind::Connection => "Connection",
            ResourceKind::Vpc => "VPC",
            ResourceKind::VpcAttachment => "VPCAttachment",
            ResourceKind::VpcPeering => "VPCPeering",
            ResourceKind::External => "External",
        }
    }

    pub fn from_kind_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.kind_name() == name)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

/// Identity of a resource within one fabric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: name.into(),
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Stable string form, used as a storage key.
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.kind.kind_name(), self.namespace, self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Metadata owned by the cluster API server. Never compared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    pub creation_timestamp: Option<String>,
}

/// A resource as desired by the inventory or observed on the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub key: ResourceKey,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerMetadata>,
}

impl ResourceSpec {
    pub fn new(key: ResourceKey, spec: Value) -> Self {
        Self {
            key,
            labels: BTreeMap::new(),
            spec,
            server: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Stamp the ownership markers for `fabric_id`.
    pub fn with_ownership(mut self, fabric_id: &str) -> Self {
        self.labels
            .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        self.labels
            .insert(FABRIC_LABEL.to_string(), fabric_id.to_string());
        self
    }

    /// Both markers must be present and name this fabric.
    pub fn is_managed_by(&self, fabric_id: &str) -> bool {
        self.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
            && self.labels.get(FABRIC_LABEL).map(String::as_str) == Some(fabric_id)
    }

    /// Labels that take part in comparison (ownership markers stripped).
    pub fn user_labels(&self) -> BTreeMap<&str, &str> {
        self.labels
            .iter()
            .filter(|(k, _)| k.as_str() != MANAGED_BY_LABEL && k.as_str() != FABRIC_LABEL)
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    /// Parse an API object (`apiVersion`/`kind`/`metadata`/`spec`).
    pub fn from_object(object: &Value) -> Option<Self> {
        let kind = ResourceKind::from_kind_name(object.get("kind")?.as_str()?)?;
        let metadata = object.get("metadata")?;
        let name = metadata.get("name")?.as_str()?;
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_NAMESPACE);

        let labels = metadata
            .get("labels")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let text = |field: &str| {
            metadata
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let server = ServerMetadata {
            uid: text("uid"),
            resource_version: text("resourceVersion"),
            generation: metadata.get("generation").and_then(Value::as_i64),
            creation_timestamp: text("creationTimestamp"),
        };

        Some(Self {
            key: ResourceKey::new(kind, name).in_namespace(namespace),
            labels,
            spec: object.get("spec").cloned().unwrap_or(Value::Null),
            server: Some(server),
        })
    }

    /// Render as an API object. `resourceVersion` is carried for optimistic updates.
    pub fn to_object(&self) -> Value {
        let mut metadata = Map::new();
        metadata.insert("name".to_string(), json!(self.key.name));
        metadata.insert("namespace".to_string(), json!(self.key.namespace));
        if !self.labels.is_empty() {
            metadata.insert("labels".to_string(), json!(self.labels));
        }
        if let Some(rv) = self
            .server
            .as_ref()
            .and_then(|s| s.resource_version.as_ref())
        {
            metadata.insert("resourceVersion".to_string(), json!(rv));
        }

        json!({
            "apiVersion": format!("{}/{}", self.key.kind.api_group(), self.key.kind.api_version()),
            "kind": self.key.kind.kind_name(),
            "metadata": Value::Object(metadata),
            "spec": self.spec,
        })
    }
}
