//! Declaration file types.
//!
//! This module defines the structs that map to `terrace.yaml`: project
//! metadata, state location, provider endpoint, execution settings,
//! per-kind schemas and the resource declarations themselves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{GraphError, Result};
use crate::graph::{AttrValue, Reference, Resource, ResourceId};
use crate::provider::{ReplaceStrategy, ResourceSchema, SchemaRegistry};

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeclarationConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State storage configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Execution settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Mutation rules per resource kind.
    #[serde(default)]
    pub schemas: BTreeMap<String, ResourceSchema>,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// State directory, relative to the configuration file.
    #[serde(default)]
    pub path: Option<String>,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the provider service.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

/// Execution settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of steps in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for the retry delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Replace ordering for kinds without their own.
    #[serde(default)]
    pub replace_strategy: ReplaceStrategy,
}

/// A declared resource as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Attribute values.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDecl>,
    /// Explicit dependencies as `kind.name`.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A declared attribute value: `{ ref: kind.name.attribute }` or a literal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttributeDecl {
    /// Reference to another resource's attribute.
    Reference(ReferenceDecl),
    /// Any other value.
    Literal(serde_json::Value),
}

/// Reference form of an attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReferenceDecl {
    /// `kind.name.attribute`.
    #[serde(rename = "ref")]
    pub target: String,
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_token_env() -> String {
    String::from("TERRACE_PROVIDER_TOKEN")
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_timeout_secs(),
            token_env: default_token_env(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            replace_strategy: ReplaceStrategy::default(),
        }
    }
}

impl ResourceDecl {
    /// Returns the `kind.name` identifier.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.kind, &self.name)
    }

    /// Converts the declaration into a graph resource.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidReference`] for malformed references or
    /// `depends_on` entries.
    pub fn to_resource(&self) -> Result<Resource> {
        let id = self.id();
        let owner = id.to_string();

        let attributes = self
            .attributes
            .iter()
            .map(|(name, decl)| {
                let value = match decl {
                    AttributeDecl::Reference(r) => {
                        AttrValue::Reference(Reference::parse(&owner, &r.target)?)
                    }
                    AttributeDecl::Literal(v) => AttrValue::Literal(v.clone()),
                };
                Ok((name.clone(), value))
            })
            .collect::<std::result::Result<BTreeMap<_, _>, GraphError>>()?;

        let depends_on = self
            .depends_on
            .iter()
            .map(|dep| {
                dep.parse::<ResourceId>().map_err(|_| GraphError::InvalidReference {
                    resource: owner.clone(),
                    reference: dep.clone(),
                    expected: "kind.name",
                })
            })
            .collect::<std::result::Result<Vec<_>, GraphError>>()?;

        Ok(Resource {
            id,
            attributes,
            depends_on,
        })
    }
}

impl DeclarationConfig {
    /// Converts every declaration into graph resources, in order.
    ///
    /// # Errors
    ///
    /// Returns the first malformed reference found.
    pub fn to_resources(&self) -> Result<Vec<Resource>> {
        self.resources.iter().map(ResourceDecl::to_resource).collect()
    }

    /// Builds the schema registry from the `schemas` section.
    #[must_use]
    pub fn schema_registry(&self) -> SchemaRegistry {
        self.schemas.iter().fold(
            SchemaRegistry::new().with_default_strategy(self.execution.replace_strategy),
            |registry, (kind, schema)| registry.with_schema(kind.clone(), schema.clone()),
        )
    }

    /// Returns the number of declared resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}
