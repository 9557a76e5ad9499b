//! State types for tracking applied resources.
//!
//! A [`StateRecord`] holds what was last applied for one resource and what
//! the provider returned. Records are the only durable entity; everything
//! else is rebuilt from the declarations on every run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::graph::{AttrValue, ResourceId};

/// Current version of the state record format.
pub const STATE_VERSION: &str = "1.0";

/// Attribute values returned by a provider.
pub type Outputs = BTreeMap<String, serde_json::Value>;

/// Snapshot of every state record, keyed by resource.
pub type StateSnapshot = HashMap<ResourceId, StateRecord>;

/// Last-applied state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Record format version.
    pub version: String,
    /// Resource identifier.
    pub id: ResourceId,
    /// Declared attributes as of the last apply, references unresolved.
    pub declared: BTreeMap<String, AttrValue>,
    /// Attribute values sent to the provider, references resolved.
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Outputs reported by the provider.
    pub outputs: Outputs,
    /// Resources this one depended on when it was applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    /// Hash of the declaration that produced this record.
    pub declaration_hash: String,
    /// Previous instance of a create-before-destroy replacement that has not
    /// been destroyed yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<DeposedObject>,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An instance superseded by a replacement and still awaiting destruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeposedObject {
    /// Attributes the old instance was applied with.
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Outputs of the old instance.
    pub outputs: Outputs,
    /// When the instance was deposed.
    pub deposed_at: DateTime<Utc>,
}

impl StateRecord {
    /// Creates a record for a freshly applied resource.
    #[must_use]
    pub fn new(
        id: ResourceId,
        declared: BTreeMap<String, AttrValue>,
        attributes: BTreeMap<String, serde_json::Value>,
        outputs: Outputs,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            id,
            declared,
            attributes,
            outputs,
            dependencies: Vec::new(),
            declaration_hash: String::new(),
            deposed: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<ResourceId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the declaration hash.
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.declaration_hash = hash.into();
        self
    }

    /// Builds the record that replaces `self` after an in-place update.
    ///
    /// Creation time and any deposed object are carried over.
    #[must_use]
    pub fn updated(&self, next: Self) -> Self {
        Self {
            created_at: self.created_at,
            deposed: self.deposed.clone(),
            updated_at: Utc::now(),
            ..next
        }
    }

    /// Builds the record for a replacement instance, deposing `self`.
    #[must_use]
    pub fn superseded_by(&self, next: Self) -> Self {
        Self {
            deposed: Some(DeposedObject {
                attributes: self.attributes.clone(),
                outputs: self.outputs.clone(),
                deposed_at: Utc::now(),
            }),
            ..next
        }
    }

    /// Returns a copy without the deposed object.
    #[must_use]
    pub fn without_deposed(&self) -> Self {
        Self {
            deposed: None,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Returns an output value by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&serde_json::Value> {
        self.outputs.get(name)
    }

    /// Returns true if a reference to `target` was resolved against
    /// `outputs`, either in this instance or in its deposed one.
    #[must_use]
    pub fn is_bound_to(&self, target: &ResourceId, outputs: &Outputs) -> bool {
        self.declared.iter().any(|(name, value)| {
            let Some(reference) = value.as_reference() else {
                return false;
            };
            let Some(output) = outputs.get(&reference.attribute) else {
                return false;
            };
            &reference.target == target
                && (self.attributes.get(name) == Some(output)
                    || self
                        .deposed
                        .as_ref()
                        .is_some_and(|d| d.attributes.get(name) == Some(output)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(cidr: &str, id: &str) -> StateRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert(String::from("cidr"), json!(cidr));
        let mut outputs = Outputs::new();
        outputs.insert(String::from("id"), json!(id));
        StateRecord::new(
            ResourceId::new("network", "main"),
            BTreeMap::new(),
            attributes,
            outputs,
        )
    }

    #[test]
    fn test_superseded_by_deposes_old_instance() {
        let old = record("10.0.0.0/16", "net-1");
        let new = old.superseded_by(record("10.1.0.0/16", "net-2"));

        assert_eq!(new.output("id"), Some(&json!("net-2")));
        let deposed = new.deposed.as_ref().unwrap();
        assert_eq!(deposed.outputs.get("id"), Some(&json!("net-1")));

        let cleaned = new.without_deposed();
        assert!(cleaned.deposed.is_none());
        assert_eq!(cleaned.output("id"), Some(&json!("net-2")));
    }

    #[test]
    fn test_updated_keeps_creation_time() {
        let old = record("10.0.0.0/16", "net-1");
        let new = old.updated(record("10.0.0.0/16", "net-1"));
        assert_eq!(new.created_at, old.created_at);
    }

    #[test]
    fn test_is_bound_to_matches_resolved_reference() {
        let network = ResourceId::new("network", "main");
        let mut declared = BTreeMap::new();
        declared.insert(
            String::from("network_id"),
            AttrValue::reference(network.clone(), "id"),
        );
        let mut attributes = BTreeMap::new();
        attributes.insert(String::from("network_id"), json!("net-1"));
        let subnet = StateRecord::new(ResourceId::new("subnet", "a"), declared, attributes, Outputs::new());

        let old = record("10.0.0.0/16", "net-1").outputs;
        let new = record("10.1.0.0/16", "net-2").outputs;
        assert!(subnet.is_bound_to(&network, &old));
        assert!(!subnet.is_bound_to(&network, &new));
        assert!(!subnet.is_bound_to(&ResourceId::new("network", "other"), &old));
    }

    #[test]
    fn test_record_json_roundtrip_omits_empty_deposed() {
        let rec = record("10.0.0.0/16", "net-1");
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("deposed"));
        let back: StateRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
