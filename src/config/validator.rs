//! Configuration validation.
//!
//! Collects every problem in a declaration file before anything is planned.
//! Errors stop the run; warnings are reported and ignored.

use crate::error::{ConfigError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::declaration::{AttributeDecl, DeclarationConfig, ExecutionConfig, ResourceDecl};

/// Concurrency above which a warning is emitted.
const HIGH_CONCURRENCY: usize = 64;

/// Retry count above which a warning is emitted.
const HIGH_RETRIES: u32 = 10;

/// Validator for declaration files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a declaration file.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &DeclarationConfig) -> Result<ValidationResult> {
        let result = self.collect(config);

        if let Some(first_error) = result.errors.first() {
            return Err(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }
            .into());
        }

        debug!(
            "Configuration validation passed with {} warnings",
            result.warnings.len()
        );
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn collect(&self, config: &DeclarationConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_provider(config, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_schemas(config, &mut result);

        result
    }

    fn validate_project(config: &DeclarationConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens or underscores.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.concurrency == 0 {
            result.error("execution.concurrency", "Concurrency must be at least 1");
        } else if execution.concurrency > HIGH_CONCURRENCY {
            result.warnings.push(format!(
                "execution.concurrency: {} parallel steps may trip provider rate limits",
                execution.concurrency
            ));
        }

        if execution.max_retries > HIGH_RETRIES {
            result.warnings.push(format!(
                "execution.max_retries: {} retries can stall a run for a long time",
                execution.max_retries
            ));
        }

        if execution.initial_backoff_ms > execution.max_backoff_ms {
            result.error(
                "execution.initial_backoff_ms",
                format!(
                    "Initial backoff ({}ms) exceeds max backoff ({}ms)",
                    execution.initial_backoff_ms, execution.max_backoff_ms
                ),
            );
        }
    }

    fn validate_provider(config: &DeclarationConfig, result: &mut ValidationResult) {
        match config.provider.endpoint.as_deref() {
            Some(endpoint) if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) => {
                result.error(
                    "provider.endpoint",
                    format!("Provider endpoint must be an http(s) URL: {endpoint}"),
                );
            }
            None if !config.resources.is_empty() => {
                result
                    .warnings
                    .push(String::from("provider.endpoint: not set; only planning is possible"));
            }
            _ => {}
        }

        if config.provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Timeout must be at least 1 second");
        }
    }

    fn validate_resources(resources: &[ResourceDecl], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared; apply will delete everything in state"));
            return;
        }

        let mut seen = HashSet::new();
        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_name(&resource.kind) {
                result.error(
                    format!("{prefix}.kind"),
                    format!("Resource kind '{}' is invalid", resource.kind),
                );
            }
            if !is_valid_name(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Resource name '{}' is invalid", resource.name),
                );
            }

            let id = resource.id();
            if !seen.insert(id.clone()) {
                result.error(format!("{prefix}.name"), format!("Duplicate resource: {id}"));
            }

            for (attr, value) in &resource.attributes {
                if let AttributeDecl::Reference(reference) = value {
                    if reference.target.split('.').count() != 3 {
                        result.error(
                            format!("{prefix}.attributes.{attr}"),
                            format!(
                                "Reference '{}' must have the form kind.name.attribute",
                                reference.target
                            ),
                        );
                    }
                }
            }

            for (j, dep) in resource.depends_on.iter().enumerate() {
                if dep.parse::<crate::graph::ResourceId>().is_err() {
                    result.error(
                        format!("{prefix}.depends_on[{j}]"),
                        format!("Dependency '{dep}' must have the form kind.name"),
                    );
                }
            }
        }
    }

    fn validate_schemas(config: &DeclarationConfig, result: &mut ValidationResult) {
        for (kind, schema) in &config.schemas {
            let declared: Vec<&ResourceDecl> =
                config.resources.iter().filter(|r| &r.kind == kind).collect();

            if declared.is_empty() {
                result
                    .warnings
                    .push(format!("schemas.{kind}: no resource of this kind is declared"));
                continue;
            }

            for attribute in &schema.force_new {
                if !declared.iter().any(|r| r.attributes.contains_key(attribute)) {
                    result.warnings.push(format!(
                        "schemas.{kind}.force_new: attribute '{attribute}' is never declared"
                    ));
                }
            }
        }
    }
}

impl ValidationResult {
    /// Returns true if no errors were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

/// Returns true for lowercase alphanumeric names with inner `-` or `_`.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && !name.starts_with(['-', '_'])
        && !name.ends_with(['-', '_'])
}
