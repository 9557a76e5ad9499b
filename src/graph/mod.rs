//! Resource graph module.
//!
//! This module turns declared resources into a dependency graph and proves
//! it acyclic before any planning takes place.

mod builder;
mod checker;
mod resource;

pub use builder::{GraphBuilder, ResourceGraph};
pub use checker::{CycleChecker, ValidatedGraph};
pub use resource::{AttrValue, Reference, Resource, ResourceId};
