//! Provider capability.
//!
//! The engine never talks to infrastructure directly. Each plan step is
//! turned into a [`ProviderRequest`] and handed to a [`Provider`]; failures
//! come back as raw [`ProviderFailure`]s and an [`ErrorClassifier`] decides
//! whether they are worth retrying.

mod http;
mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::graph::ResourceId;
use crate::state::Outputs;

pub use http::HttpProvider;
pub use schema::{ReplaceStrategy, ResourceSchema, SchemaRegistry};

/// Operation a provider is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create a new instance.
    Create,
    /// Mutate an existing instance in place.
    Update,
    /// Destroy an instance.
    Delete,
}

/// A fully resolved request for one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Operation to perform.
    pub operation: Operation,
    /// Target resource.
    pub resource: ResourceId,
    /// Attribute values with every reference substituted.
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Outputs of the instance being updated or destroyed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_outputs: Option<Outputs>,
}

/// Raw failure reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    /// Error message.
    pub message: String,
    /// Status code, when the provider speaks a status-bearing protocol.
    pub status: Option<u16>,
    /// Minimum delay the provider asked for before retrying.
    pub retry_after: Option<Duration>,
}

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry-eligible.
    Transient,
    /// Terminal.
    Permanent,
}

/// A system that performs infrastructure mutations.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Applies one request and returns the instance's outputs.
    ///
    /// Delete requests return empty outputs.
    async fn apply(&self, request: &ProviderRequest) -> Result<Outputs, ProviderFailure>;

    /// Short provider name for logs.
    fn name(&self) -> &str;
}

/// Decides whether a provider failure is transient or permanent.
pub trait ErrorClassifier: Send + Sync {
    /// Classifies a failure.
    fn classify(&self, failure: &ProviderFailure) -> ErrorClass;
}

/// Classifies by status code: no status (network failure), 408, 425, 429
/// and 5xx are transient; everything else is permanent.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusClassifier;

impl ErrorClassifier for StatusClassifier {
    fn classify(&self, failure: &ProviderFailure) -> ErrorClass {
        match failure.status {
            None | Some(408 | 425 | 429 | 500..=599) => ErrorClass::Transient,
            Some(_) => ErrorClass::Permanent,
        }
    }
}

impl<F> ErrorClassifier for F
where
    F: Fn(&ProviderFailure) -> ErrorClass + Send + Sync,
{
    fn classify(&self, failure: &ProviderFailure) -> ErrorClass {
        self(failure)
    }
}

impl ProviderFailure {
    /// Creates a failure without a status code.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Creates a failure carrying a status code.
    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            retry_after: None,
        }
    }

    /// Sets the provider-requested retry delay.
    #[must_use]
    pub const fn retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}
