//! Configuration parser for loading declaration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, TerraceError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::declaration::DeclarationConfig;

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["terrace.yaml", "terrace.yml", "infra.yaml", "infra.yml"];

/// Configuration parser for loading declarations.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeclarationConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeclarationConfig> {
        debug!("Parsing YAML configuration");

        let config: DeclarationConfig = serde_yaml::from_str(content).map_err(|e| {
            TerraceError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed {} resources for project {}",
            config.resources.len(),
            config.project.name
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognised variables: `TERRACE_PROJECT_NAME`,
    /// `TERRACE_PROJECT_ENVIRONMENT`, `TERRACE_STATE_PATH`,
    /// `TERRACE_PROVIDER_ENDPOINT` and `TERRACE_CONCURRENCY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeclarationConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies overrides looked up through `lookup`.
    fn apply_overrides(
        config: &mut DeclarationConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(name) = lookup("TERRACE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(env) = lookup("TERRACE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Some(path) = lookup("TERRACE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Some(endpoint) = lookup("TERRACE_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        if let Some(concurrency) = lookup("TERRACE_CONCURRENCY") {
            config.execution.concurrency = concurrency.parse().map_err(|_| {
                ConfigError::validation(
                    format!("TERRACE_CONCURRENCY must be a positive integer, got '{concurrency}'"),
                    "execution.concurrency",
                )
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads the provider token from the configured environment variable.
    #[must_use]
    pub fn provider_token(config: &DeclarationConfig) -> Option<String> {
        let token = std::env::var(&config.provider.token_env).ok();
        if token.is_none() {
            warn!(
                "{} is not set; provider requests will be unauthenticated",
                config.provider.token_env
            );
        }
        token
    }

    /// Resolves the state directory for a configuration file.
    #[must_use]
    pub fn state_dir(config: &DeclarationConfig, config_file: &Path) -> PathBuf {
        let base = config_file.parent().unwrap_or_else(|| Path::new("."));
        config.state.path.as_ref().map_or_else(
            || base.join(crate::state::STATE_DIR),
            |path| base.join(path),
        )
    }
}

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttributeDecl;
    use crate::provider::ReplaceStrategy;
    use std::collections::HashMap;

    const FULL: &str = r#"
project:
  name: platform
  environment: prod

state:
  path: state

provider:
  endpoint: "http://127.0.0.1:9000"

execution:
  concurrency: 8
  max_retries: 5
  replace_strategy: destroy_before_create

schemas:
  network:
    force_new: [cidr]

resources:
  - kind: network
    name: main
    attributes:
      cidr: 10.0.0.0/16
      tags:
        team: infra
  - kind: subnet
    name: a
    attributes:
      network_id: { ref: network.main.id }
      cidr: 10.0.1.0/24
    depends_on: [network.main]
"#;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.execution.concurrency, 4);
        assert_eq!(config.execution.max_retries, 3);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = ConfigParser::new().parse_yaml(FULL, None).unwrap();

        assert_eq!(config.execution.concurrency, 8);
        assert_eq!(
            config.execution.replace_strategy,
            ReplaceStrategy::DestroyBeforeCreate
        );
        assert_eq!(config.resources.len(), 2);
        assert!(matches!(
            config.resources[1].attributes["network_id"],
            AttributeDecl::Reference(_)
        ));
        assert!(matches!(
            config.resources[0].attributes["tags"],
            AttributeDecl::Literal(_)
        ));

        let resources = config.to_resources().unwrap();
        let subnet = &resources[1];
        let (attr, reference) = subnet.references().next().unwrap();
        assert_eq!(attr, "network_id");
        assert_eq!(reference.to_string(), "network.main.id");
        assert_eq!(subnet.depends_on.len(), 1);

        let registry = config.schema_registry();
        assert!(registry.requires_replacement("network", "cidr"));
    }

    #[test]
    fn test_malformed_reference_is_rejected() {
        let yaml = r"
project:
  name: p
resources:
  - kind: subnet
    name: a
    attributes:
      network_id: { ref: network.main }
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert!(config.to_resources().is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        let result = ConfigParser::new().parse_yaml("project: [", None);
        assert!(matches!(
            result,
            Err(TerraceError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = ConfigParser::new().parse_yaml(FULL, None).unwrap();
        let vars: HashMap<&str, &str> = [
            ("TERRACE_PROJECT_NAME", "other"),
            ("TERRACE_CONCURRENCY", "2"),
            ("TERRACE_PROVIDER_ENDPOINT", "http://provider"),
        ]
        .into_iter()
        .collect();

        ConfigParser::apply_overrides(&mut config, |name| vars.get(name).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.project.name, "other");
        assert_eq!(config.execution.concurrency, 2);
        assert_eq!(config.provider.endpoint.as_deref(), Some("http://provider"));

        let bad: HashMap<&str, &str> = [("TERRACE_CONCURRENCY", "many")].into_iter().collect();
        assert!(
            ConfigParser::apply_overrides(&mut config, |name| bad.get(name).map(ToString::to_string))
                .is_err()
        );
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = tempfile::TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join("terrace.yaml"), "project:\n  name: x\n").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, temp.path().join("terrace.yaml"));
    }

    #[test]
    fn test_state_dir_relative_to_config() {
        let config = ConfigParser::new().parse_yaml(FULL, None).unwrap();
        let dir = ConfigParser::state_dir(&config, Path::new("/srv/infra/terrace.yaml"));
        assert_eq!(dir, PathBuf::from("/srv/infra/state"));
    }
}
