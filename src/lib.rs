// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![warn(dead_code)]                   // Unused code should go
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]
#![warn(unused_variables)]
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]
#![deny(non_upper_case_globals)]
#![deny(nonstandard_style)]
#![forbid(unsafe_op_in_unsafe_fn)]

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::too_many_arguments)]
#![warn(clippy::cognitive_complexity)]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Terrace
//!
//! A dependency-graph resolver and apply engine for declared infrastructure.
//!
//! ## Overview
//!
//! Resources are declared in a YAML file. Attributes may reference another
//! resource's outputs, which makes that resource a dependency. Terrace:
//!
//! - Builds the resource graph and rejects cycles and dangling references
//! - Diffs the declarations against per-resource recorded state
//! - Compiles an ordered plan of creates, updates, replacements and deletes
//! - Executes the plan concurrently where the graph allows, with retries
//!
//! ## Architecture
//!
//! 1. **Graph**: [`graph::GraphBuilder`] then [`graph::CycleChecker`]
//! 2. **Plan**: [`planner::DiffEngine`] then [`planner::Plan::compile`]
//! 3. **Execute**: [`planner::ExecutionEngine`] against a [`provider::Provider`]
//! 4. **Record**: every completed step commits to a [`state::StateStore`]
//!
//! ## Modules
//!
//! - [`config`]: Declaration parsing and validation
//! - [`graph`]: Resource graph construction and checking
//! - [`planner`]: Diff, plan compilation and execution
//! - [`provider`]: Provider interface, schemas and the HTTP provider
//! - [`state`]: State storage backends (local, memory)
//! - [`reconciler`]: End-to-end runs over one declaration file
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: platform
//!   environment: prod
//!
//! schemas:
//!   network:
//!     force_new: [cidr]
//!
//! resources:
//!   - kind: network
//!     name: main
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   - kind: subnet
//!     name: a
//!     attributes:
//!       network_id: { ref: network.main.id }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeclarationConfig};
pub use error::{Result, TerraceError};
pub use graph::{CycleChecker, GraphBuilder, ResourceGraph, ResourceId, ValidatedGraph};
pub use planner::{ApplyReport, CancelHandle, DiffEngine, ExecutionEngine, ExecutionOptions, Plan};
pub use provider::{HttpProvider, Provider, ProviderFailure, ProviderRequest, SchemaRegistry};
pub use reconciler::Reconciler;
pub use state::{LocalStateStore, MemoryStateStore, StateRecord, StateStore};
