//! Resource identity and attribute types.
//!
//! A resource is identified by its `(kind, name)` pair and carries a mapping
//! of attribute names to values. A value is either a literal or a typed
//! reference to an attribute produced by another resource.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::GraphError;

/// Characters that may not appear in a kind or a name. Both end up as path
/// components of the local state store.
const RESERVED: &[char] = &['.', '/', '\\'];

/// Unique identifier of a declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Resource kind (e.g. `network`, `subnet`).
    pub kind: String,
    /// Resource name, unique within the kind.
    pub name: String,
}

impl ResourceId {
    /// Creates a new resource identifier.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Checks that kind and name are non-empty and free of `.`, `/` and `\`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidIdentifier`] otherwise.
    pub fn validate(&self) -> Result<(), GraphError> {
        let reason = if self.kind.is_empty() || self.name.is_empty() {
            "kind and name must not be empty"
        } else if self.kind.contains(RESERVED) || self.name.contains(RESERVED) {
            "kind and name must not contain '.', '/' or '\\'"
        } else {
            return Ok(());
        };
        Err(GraphError::InvalidIdentifier {
            id: self.to_string(),
            reason,
        })
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((kind, name)) = s.split_once('.') else {
            return Err(GraphError::InvalidReference {
                resource: String::from("<identifier>"),
                reference: s.to_string(),
                expected: "kind.name",
            });
        };
        let id = Self::new(kind, name);
        id.validate()?;
        Ok(id)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// A typed reference to an attribute produced by another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// The referenced resource.
    pub target: ResourceId,
    /// Output attribute of the referenced resource.
    pub attribute: String,
}

impl Reference {
    /// Creates a reference to `attribute` of `target`.
    #[must_use]
    pub fn new(target: ResourceId, attribute: impl Into<String>) -> Self {
        Self {
            target,
            attribute: attribute.into(),
        }
    }

    /// Parses a `kind.name.attribute` reference.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidReference`] if the text does not have
    /// three non-empty dot-separated parts.
    pub fn parse(owner: &str, text: &str) -> Result<Self, GraphError> {
        let parts: Vec<&str> = text.split('.').collect();
        match parts.as_slice() {
            [kind, name, attribute]
                if !kind.is_empty() && !name.is_empty() && !attribute.is_empty() =>
            {
                Ok(Self::new(ResourceId::new(*kind, *name), *attribute))
            }
            _ => Err(GraphError::InvalidReference {
                resource: owner.to_string(),
                reference: text.to_string(),
                expected: "kind.name.attribute",
            }),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// Declared value of a single attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    /// A literal value.
    Literal(serde_json::Value),
    /// A value produced at runtime by another resource.
    Reference(Reference),
}

impl AttrValue {
    /// Creates a literal attribute value.
    #[must_use]
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Creates a reference attribute value.
    #[must_use]
    pub fn reference(target: ResourceId, attribute: impl Into<String>) -> Self {
        Self::Reference(Reference::new(target, attribute))
    }

    /// Returns the reference if this value is one.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Reference(reference) => Some(reference),
            Self::Literal(_) => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(serde_json::Value::String(s)) => write!(f, "\"{s}\""),
            Self::Literal(value) => write!(f, "{value}"),
            Self::Reference(reference) => write!(f, "<{reference}>"),
        }
    }
}

/// A declared infrastructure resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Resource identifier.
    pub id: ResourceId,
    /// Declared attributes.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Explicit ordering dependencies that carry no attribute value.
    pub depends_on: Vec<ResourceId>,
}

impl Resource {
    /// Creates a resource with no attributes.
    #[must_use]
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds a literal attribute.
    #[must_use]
    pub fn with_literal(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes
            .insert(name.to_string(), AttrValue::literal(value));
        self
    }

    /// Adds a reference attribute.
    #[must_use]
    pub fn with_reference(mut self, name: &str, target: ResourceId, attribute: &str) -> Self {
        self.attributes
            .insert(name.to_string(), AttrValue::reference(target, attribute));
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, target: ResourceId) -> Self {
        self.depends_on.push(target);
        self
    }

    /// Iterates over every `(attribute, reference)` pair in declaration order.
    pub fn references(&self) -> impl Iterator<Item = (&str, &Reference)> {
        self.attributes
            .iter()
            .filter_map(|(name, value)| value.as_reference().map(|r| (name.as_str(), r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_parse_and_display() {
        let id: ResourceId = "subnet.private-a".parse().unwrap();
        assert_eq!(id.kind, "subnet");
        assert_eq!(id.name, "private-a");
        assert_eq!(id.to_string(), "subnet.private-a");

        assert!("subnet".parse::<ResourceId>().is_err());
        assert!("subnet.".parse::<ResourceId>().is_err());
        assert!("a.b.c".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_path_separators_are_rejected() {
        for text in ["subnet.a/b", "subnet.a\\b", "net/work.main", "subnet./"] {
            let err = text.parse::<ResourceId>().unwrap_err();
            assert!(matches!(err, GraphError::InvalidIdentifier { .. }), "{text}");
        }
        assert!(ResourceId::new("subnet", "..").validate().is_err());
        assert!(ResourceId::new("subnet", "private-a").validate().is_ok());

        let json = serde_json::to_string("subnet.a/b").unwrap();
        assert!(serde_json::from_str::<ResourceId>(&json).is_err());
    }

    #[test]
    fn test_reference_parse() {
        let reference = Reference::parse("subnet.a", "network.main.id").unwrap();
        assert_eq!(reference.target, ResourceId::new("network", "main"));
        assert_eq!(reference.attribute, "id");

        assert!(Reference::parse("subnet.a", "network.main").is_err());
        assert!(Reference::parse("subnet.a", "network..id").is_err());
    }

    #[test]
    fn test_resource_id_serializes_as_string() {
        let id = ResourceId::new("network", "main");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"network.main\"");
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_references_iterates_only_references() {
        let resource = Resource::new(ResourceId::new("subnet", "a"))
            .with_literal("cidr", "10.0.1.0/24")
            .with_reference("network_id", ResourceId::new("network", "main"), "id");

        let refs: Vec<_> = resource.references().collect();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "network_id");
    }
}
