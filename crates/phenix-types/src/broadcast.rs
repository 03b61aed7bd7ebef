//! Broadcast envelope types
//!
//! A broadcast pairs a [`RequestPolicy`], describing which operators may see
//! it, with a [`Resource`] envelope that is pushed to them. Broadcasts are
//! ephemeral notifications and are never persisted.

use serde::{Deserialize, Serialize};

/// Authorization shape a subscriber must satisfy to receive a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPolicy {
    /// Resource kind checked against the subscriber's role (e.g. `vms`)
    pub resource: String,

    /// Experiment scope, empty for unscoped resources
    pub scope: String,

    /// Verb checked against the subscriber's role
    pub verb: String,

    /// Optional instance names (e.g. the VM name)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

impl RequestPolicy {
    pub fn new(
        resource: impl Into<String>,
        scope: impl Into<String>,
        verb: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            scope: scope.into(),
            verb: verb.into(),
            names: Vec::new(),
        }
    }

    /// Restrict delivery to subscribers allowed to see the named instance
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }
}

/// Envelope identifying what changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource kind as seen by clients (e.g. `experiment/vm`)
    #[serde(rename = "resource")]
    pub kind: String,

    /// Instance identity (e.g. `exp1/host-01`)
    pub id: String,

    /// Event name (e.g. `starting`, `progress`, `errorStarting`)
    pub action: String,
}

impl Resource {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            action: action.into(),
        }
    }

    /// Same resource, different event name
    pub fn with_action(&self, action: impl Into<String>) -> Self {
        Self {
            kind: self.kind.clone(),
            id: self.id.clone(),
            action: action.into(),
        }
    }
}

/// Message delivered to a subscriber
///
/// Serializes to the wire shape `{resource, id, action, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    #[serde(flatten)]
    pub resource: Resource,

    /// Opaque body, usually the updated resource representation
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl Publication {
    pub fn new(resource: Resource, payload: Option<serde_json::Value>) -> Self {
        Self { resource, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publication_wire_shape() {
        let publication = Publication::new(
            Resource::new("experiment/vm", "exp1/host-01", "progress"),
            Some(serde_json::json!({ "percent": 0.5 })),
        );

        let value = serde_json::to_value(&publication).unwrap();
        assert_eq!(value["resource"], "experiment/vm");
        assert_eq!(value["id"], "exp1/host-01");
        assert_eq!(value["action"], "progress");
        assert_eq!(value["payload"]["percent"], 0.5);
    }

    #[test]
    fn test_request_policy_names() {
        let policy = RequestPolicy::new("vms", "exp1", "get").with_name("host-01");
        assert_eq!(policy.names, vec!["host-01".to_string()]);
    }

    #[test]
    fn test_resource_with_action() {
        let base = Resource::new("experiment", "exp1", "starting");
        let done = base.with_action("start");
        assert_eq!(done.kind, "experiment");
        assert_eq!(done.action, "start");
    }
}
