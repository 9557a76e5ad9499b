//! Configuration module for the terrace engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `terrace.yaml`
//! - Validation of configuration values
//! - Computing declaration hashes for change detection

mod declaration;
mod hash;
mod parser;
mod validator;

pub use declaration::{
    AttributeDecl, DeclarationConfig, ExecutionConfig, ProjectConfig, ProviderConfig,
    ReferenceDecl, ResourceDecl, StateConfig,
};
pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
