//! Error types for the Terrace apply engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, planning, provider calls and state
//! management. Build and plan errors are fatal and abort before any mutation;
//! provider errors are contained to the failing branch of a run.

use std::path::PathBuf;
use thiserror::Error;

use crate::graph::ResourceId;

/// The main error type for the Terrace apply engine.
#[derive(Debug, Error)]
pub enum TerraceError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Errors raised while building or validating the resource graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A reference names a resource that is not declared.
    #[error("{resource} references undeclared resource {target}{}", describe_attribute(.attribute.as_deref()))]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: ResourceId,
        /// The missing resource.
        target: ResourceId,
        /// Attribute carrying the reference, `None` for `depends_on` entries.
        attribute: Option<String>,
    },

    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    CycleDetected {
        /// Resources on the cycle, first resource repeated at the end.
        cycle: Vec<ResourceId>,
    },

    /// Two resources share the same identifier.
    #[error("Duplicate resource: {resource}")]
    DuplicateResource {
        /// The duplicated identifier.
        resource: ResourceId,
    },

    /// A resource kind or name cannot be used as an identifier.
    #[error("Invalid resource identifier '{id}': {reason}")]
    InvalidIdentifier {
        /// The offending identifier.
        id: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A reference or identifier string is malformed.
    #[error("Invalid reference '{reference}' in {resource}: expected {expected}")]
    InvalidReference {
        /// Resource (or declaration entry) holding the bad reference.
        resource: String,
        /// The malformed reference text.
        reference: String,
        /// Expected shape.
        expected: &'static str,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A replacement cannot be ordered without breaking a live dependent.
    #[error("Cannot replace {resource}: still required by {}; {reason}", format_list(.dependents))]
    UnsatisfiableChange {
        /// Resource that must be replaced.
        resource: ResourceId,
        /// Still-declared dependents that block the replacement.
        dependents: Vec<ResourceId>,
        /// Human-readable resolution hint.
        reason: String,
    },

    /// State changed between planning and taking the run lock.
    #[error("State changed since the plan was computed; plan again")]
    StaleState,
}

/// Provider failures after classification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// A retry-eligible failure that persisted through every attempt.
    #[error("Transient provider failure for {resource} after {attempts} attempt(s): {message}")]
    Transient {
        /// Resource the step targeted.
        resource: ResourceId,
        /// Last error message from the provider.
        message: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A terminal failure; never retried.
    #[error("Permanent provider failure for {resource}: {message}")]
    Permanent {
        /// Resource the step targeted.
        resource: ResourceId,
        /// Error message from the provider.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// A state record is corrupted or unreadable.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State storage could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// The run lock was released or taken over while the run held it.
    #[error("Run lock {lock_id} is no longer held")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// No record exists for the resource.
    #[error("No state record for {resource}")]
    RecordNotFound {
        /// The resource looked up.
        resource: ResourceId,
    },
}

/// Result type alias for Terrace operations.
pub type Result<T> = std::result::Result<T, TerraceError>;

fn describe_attribute(attribute: Option<&str>) -> String {
    attribute.map_or_else(
        || String::from(" (depends_on)"),
        |attr| format!(" (attribute '{attr}')"),
    )
}

fn format_cycle(cycle: &[ResourceId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_list(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl TerraceError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the resource identifiers implicated by this error, if any.
    #[must_use]
    pub fn resources(&self) -> Vec<ResourceId> {
        match self {
            Self::Graph(GraphError::UnresolvedReference { resource, target, .. }) => {
                vec![resource.clone(), target.clone()]
            }
            Self::Graph(GraphError::CycleDetected { cycle }) => cycle.clone(),
            Self::Graph(GraphError::DuplicateResource { resource })
            | Self::Provider(
                ProviderError::Transient { resource, .. } | ProviderError::Permanent { resource, .. },
            )
            | Self::State(StateError::RecordNotFound { resource }) => vec![resource.clone()],
            Self::Plan(PlanError::UnsatisfiableChange {
                resource,
                dependents,
                ..
            }) => std::iter::once(resource.clone())
                .chain(dependents.iter().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Returns the resource the failed step targeted.
    #[must_use]
    pub const fn resource(&self) -> &ResourceId {
        match self {
            Self::Transient { resource, .. } | Self::Permanent { resource, .. } => resource,
        }
    }

    /// Returns true if the failure was classified as transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = GraphError::CycleDetected {
            cycle: vec![
                ResourceId::new("network", "a"),
                ResourceId::new("subnet", "b"),
                ResourceId::new("network", "a"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: network.a -> subnet.b -> network.a"
        );
    }

    #[test]
    fn test_unresolved_reference_names_both_resources() {
        let err = TerraceError::from(GraphError::UnresolvedReference {
            resource: ResourceId::new("subnet", "a"),
            target: ResourceId::new("network", "missing"),
            attribute: Some(String::from("network_id")),
        });
        let text = err.to_string();
        assert!(text.contains("subnet.a"));
        assert!(text.contains("network.missing"));
        assert!(text.contains("network_id"));
        assert_eq!(err.resources().len(), 2);
    }

    #[test]
    fn test_unsatisfiable_change_resources() {
        let err = TerraceError::from(PlanError::UnsatisfiableChange {
            resource: ResourceId::new("network", "main"),
            dependents: vec![ResourceId::new("subnet", "a")],
            reason: String::from("switch to create_before_destroy"),
        });
        assert_eq!(
            err.resources(),
            vec![ResourceId::new("network", "main"), ResourceId::new("subnet", "a")]
        );
    }
}
