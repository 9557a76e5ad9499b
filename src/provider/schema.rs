//! Per-kind mutation rules.
//!
//! The provider decides which attributes can change in place and which
//! force a new instance. The planner only needs that answer, so the rules
//! are kept as a small registry keyed by resource kind.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Ordering used when a resource has to be replaced.
///
/// This is a planning policy, not a provider requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Create the new instance, re-point dependents, then destroy the old one.
    #[default]
    CreateBeforeDestroy,
    /// Destroy the old instance (and its dependents' old instances) first.
    DestroyBeforeCreate,
}

/// Mutation rules for one resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Attributes whose change forces a replacement.
    #[serde(default)]
    pub force_new: BTreeSet<String>,
    /// Kind-specific replace ordering.
    #[serde(default)]
    pub replace_strategy: Option<ReplaceStrategy>,
}

/// Registry of resource schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, ResourceSchema>,
    default_strategy: ReplaceStrategy,
}

impl ResourceSchema {
    /// Creates a schema with the given replace-forcing attributes.
    #[must_use]
    pub fn force_new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            force_new: attributes.into_iter().map(Into::into).collect(),
            replace_strategy: None,
        }
    }

    /// Sets the kind-specific replace ordering.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: ReplaceStrategy) -> Self {
        self.replace_strategy = Some(strategy);
        self
    }
}

impl SchemaRegistry {
    /// Creates an empty registry: every attribute is mutable in place.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the strategy used for kinds without their own.
    #[must_use]
    pub const fn with_default_strategy(mut self, strategy: ReplaceStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Registers the schema of a kind.
    #[must_use]
    pub fn with_schema(mut self, kind: impl Into<String>, schema: ResourceSchema) -> Self {
        self.schemas.insert(kind.into(), schema);
        self
    }

    /// Returns true if changing `attribute` on `kind` forces a replacement.
    #[must_use]
    pub fn requires_replacement(&self, kind: &str, attribute: &str) -> bool {
        self.schemas
            .get(kind)
            .is_some_and(|schema| schema.force_new.contains(attribute))
    }

    /// Replace ordering for a kind.
    #[must_use]
    pub fn strategy_for(&self, kind: &str) -> ReplaceStrategy {
        self.schemas
            .get(kind)
            .and_then(|schema| schema.replace_strategy)
            .unwrap_or(self.default_strategy)
    }

    /// Returns the schema of a kind, if registered.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&ResourceSchema> {
        self.schemas.get(kind)
    }
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CreateBeforeDestroy => "create_before_destroy",
            Self::DestroyBeforeCreate => "destroy_before_create",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_replacement() {
        let registry = SchemaRegistry::new()
            .with_schema("network", ResourceSchema::force_new(["cidr"]));

        assert!(registry.requires_replacement("network", "cidr"));
        assert!(!registry.requires_replacement("network", "tags"));
        assert!(!registry.requires_replacement("subnet", "cidr"));
    }

    #[test]
    fn test_strategy_override() {
        let registry = SchemaRegistry::new()
            .with_default_strategy(ReplaceStrategy::CreateBeforeDestroy)
            .with_schema(
                "dns_record",
                ResourceSchema::force_new(["name"])
                    .with_strategy(ReplaceStrategy::DestroyBeforeCreate),
            );

        assert_eq!(
            registry.strategy_for("dns_record"),
            ReplaceStrategy::DestroyBeforeCreate
        );
        assert_eq!(
            registry.strategy_for("network"),
            ReplaceStrategy::CreateBeforeDestroy
        );
    }
}
