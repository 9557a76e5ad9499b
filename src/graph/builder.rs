//! Resource graph construction.
//!
//! Turns a set of declared resources into a directed graph whose edges point
//! from a referring resource to the resource it references.

use std::collections::HashMap;
use tracing::debug;

use crate::error::{GraphError, Result};

use super::resource::{Resource, ResourceId};

/// Directed graph of declared resources.
///
/// Nodes keep declaration order; edges are stored as index lists in both
/// directions and are deduplicated.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Resources in declaration order.
    resources: Vec<Resource>,
    /// Identifier to node index.
    index: HashMap<ResourceId, usize>,
    /// For each node, the nodes it depends on (sorted).
    dependencies: Vec<Vec<usize>>,
    /// For each node, the nodes that depend on it (sorted).
    dependents: Vec<Vec<usize>>,
}

/// Builder for [`ResourceGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    resources: Vec<Resource>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// Adds a declared resource.
    #[must_use]
    pub fn resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Adds several declared resources.
    #[must_use]
    pub fn resources(mut self, resources: impl IntoIterator<Item = Resource>) -> Self {
        self.resources.extend(resources);
        self
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidIdentifier`] for a kind or name that
    /// cannot be stored, [`GraphError::DuplicateResource`] if two resources
    /// share an identifier and [`GraphError::UnresolvedReference`] if a
    /// reference or explicit dependency names an undeclared resource.
    pub fn build(self) -> Result<ResourceGraph> {
        let mut index = HashMap::with_capacity(self.resources.len());
        for (i, resource) in self.resources.iter().enumerate() {
            resource.id.validate()?;
            if index.insert(resource.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateResource {
                    resource: resource.id.clone(),
                }
                .into());
            }
        }

        let mut dependencies = vec![Vec::new(); self.resources.len()];
        let mut dependents = vec![Vec::new(); self.resources.len()];

        for (i, resource) in self.resources.iter().enumerate() {
            let attribute_targets = resource
                .references()
                .map(|(attr, reference)| (&reference.target, Some(attr)));
            let explicit_targets = resource.depends_on.iter().map(|target| (target, None));

            for (target, attribute) in attribute_targets.chain(explicit_targets) {
                let Some(&j) = index.get(target) else {
                    return Err(GraphError::UnresolvedReference {
                        resource: resource.id.clone(),
                        target: target.clone(),
                        attribute: attribute.map(String::from),
                    }
                    .into());
                };
                dependencies[i].push(j);
                dependents[j].push(i);
            }
        }

        for edges in dependencies.iter_mut().chain(dependents.iter_mut()) {
            edges.sort_unstable();
            edges.dedup();
        }

        debug!(
            "Built resource graph: {} nodes, {} edges",
            self.resources.len(),
            dependencies.iter().map(Vec::len).sum::<usize>()
        );

        Ok(ResourceGraph {
            resources: self.resources,
            index,
            dependencies,
            dependents,
        })
    }
}

impl ResourceGraph {
    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns all resources in declaration order.
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Returns the resource at a node index.
    #[must_use]
    pub fn resource(&self, node: usize) -> &Resource {
        &self.resources[node]
    }

    /// Looks up the node index of a resource.
    #[must_use]
    pub fn node(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Looks up a resource by identifier.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.node(id).map(|i| &self.resources[i])
    }

    /// Returns true if the resource is declared.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Node indices the given node depends on.
    #[must_use]
    pub fn dependencies(&self, node: usize) -> &[usize] {
        &self.dependencies[node]
    }

    /// Node indices that depend on the given node.
    #[must_use]
    pub fn dependents(&self, node: usize) -> &[usize] {
        &self.dependents[node]
    }

    /// Identifiers of the resources the given resource depends on.
    #[must_use]
    pub fn dependency_ids(&self, node: usize) -> Vec<ResourceId> {
        self.dependencies[node]
            .iter()
            .map(|&j| self.resources[j].id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TerraceError;

    fn network() -> Resource {
        Resource::new(ResourceId::new("network", "main")).with_literal("cidr", "10.0.0.0/16")
    }

    fn subnet() -> Resource {
        Resource::new(ResourceId::new("subnet", "a"))
            .with_reference("network_id", ResourceId::new("network", "main"), "id")
            .with_reference("network_cidr", ResourceId::new("network", "main"), "cidr")
    }

    #[test]
    fn test_edges_point_to_referenced_resource() {
        let graph = GraphBuilder::new()
            .resource(network())
            .resource(subnet())
            .build()
            .unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependents(0), &[1]);
        assert!(graph.dependencies(0).is_empty());
    }

    #[test]
    fn test_unresolved_reference() {
        let err = GraphBuilder::new().resource(subnet()).build().unwrap_err();
        match err {
            TerraceError::Graph(GraphError::UnresolvedReference {
                resource,
                target,
                attribute,
            }) => {
                assert_eq!(resource, ResourceId::new("subnet", "a"));
                assert_eq!(target, ResourceId::new("network", "main"));
                assert!(attribute.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unresolved_depends_on() {
        let resource = Resource::new(ResourceId::new("instance", "web"))
            .with_dependency(ResourceId::new("role", "missing"));
        let err = GraphBuilder::new().resource(resource).build().unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Graph(GraphError::UnresolvedReference { attribute: None, .. })
        ));
    }

    #[test]
    fn test_name_with_path_separator_is_rejected() {
        let err = GraphBuilder::new()
            .resource(Resource::new(ResourceId::new("subnet", "a/b")))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Graph(GraphError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_duplicate_resource() {
        let err = GraphBuilder::new()
            .resource(network())
            .resource(network())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Graph(GraphError::DuplicateResource { .. })
        ));
    }
}
