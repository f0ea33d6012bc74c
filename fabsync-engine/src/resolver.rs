//! Conflict resolution between desired and observed resources.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::ResourceSpec;

pub const REASON_EXTERNALLY_MODIFIED: &str = "externally modified";

/// Reconciling action for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResourceDiff {
    Create,
    Update(ResourceDelta),
    Delete,
    NoOp,
    Conflict { reason: String },
}

impl ResourceDiff {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceDiff::Create => "create",
            ResourceDiff::Update(_) => "update",
            ResourceDiff::Delete => "delete",
            ResourceDiff::NoOp => "no-op",
            ResourceDiff::Conflict { .. } => "conflict",
        }
    }

    /// Whether the diff requires a call against the cluster.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            ResourceDiff::Create | ResourceDiff::Update(_) | ResourceDiff::Delete
        )
    }
}

impl fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceDiff::Conflict { reason } => write!(f, "conflict({})", reason),
            ResourceDiff::Update(delta) => write!(f, "update({} fields)", delta.changes.len()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Field-level difference between desired and observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub changes: Vec<FieldChange>,
}

impl ResourceDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// One changed field. `None` means the field is absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: String,
    pub desired: Option<Value>,
    pub observed: Option<Value>,
}

/// Decide how to reconcile one resource of `fabric_id`.
///
/// Server-managed metadata and the ownership markers never count as a
/// difference. A differing resource without this fabric's ownership markers
/// is a conflict, never an update or delete.
pub fn resolve(
    desired: Option<&ResourceSpec>,
    observed: Option<&ResourceSpec>,
    fabric_id: &str,
) -> ResourceDiff {
    match (desired, observed) {
        (None, None) => ResourceDiff::NoOp,
        (Some(_), None) => ResourceDiff::Create,
        (None, Some(observed)) => {
            if observed.is_managed_by(fabric_id) {
                ResourceDiff::Delete
            } else {
                ResourceDiff::NoOp
            }
        }
        (Some(desired), Some(observed)) => {
            let delta = delta(desired, observed);
            if delta.is_empty() {
                ResourceDiff::NoOp
            } else if observed.is_managed_by(fabric_id) {
                ResourceDiff::Update(delta)
            } else {
                ResourceDiff::Conflict {
                    reason: REASON_EXTERNALLY_MODIFIED.to_string(),
                }
            }
        }
    }
}

/// Compare labels and spec of two resources.
pub fn delta(desired: &ResourceSpec, observed: &ResourceSpec) -> ResourceDelta {
    let mut changes = Vec::new();

    let desired_labels = desired.user_labels();
    let observed_labels = observed.user_labels();
    let keys: BTreeSet<&str> = desired_labels
        .keys()
        .chain(observed_labels.keys())
        .copied()
        .collect();
    for key in keys {
        let d = desired_labels.get(key);
        let o = observed_labels.get(key);
        if d != o {
            changes.push(FieldChange {
                path: format!("metadata.labels.{}", key),
                desired: d.map(|v| Value::String(v.to_string())),
                observed: o.map(|v| Value::String(v.to_string())),
            });
        }
    }

    diff_value("spec", Some(&desired.spec), Some(&observed.spec), &mut changes);
    ResourceDelta { changes }
}

fn diff_value(
    path: &str,
    desired: Option<&Value>,
    observed: Option<&Value>,
    changes: &mut Vec<FieldChange>,
) {
    if desired == observed {
        return;
    }
    if let (Some(Value::Object(d)), Some(Value::Object(o))) = (desired, observed) {
        let keys: BTreeSet<&String> = d.keys().chain(o.keys()).collect();
        for key in keys {
            diff_value(&format!("{}.{}", path, key), d.get(key), o.get(key), changes);
        }
        return;
    }
    changes.push(FieldChange {
        path: path.to_string(),
        desired: desired.cloned(),
        observed: observed.cloned(),
    });
}
