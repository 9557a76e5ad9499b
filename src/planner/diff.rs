//! Diff engine for comparing declared resources against state records.
//!
//! The diff walks the validated graph in topological order so that a
//! replacement is known before any resource referring to it is examined.

use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::graph::{AttrValue, ResourceId, ValidatedGraph};
use crate::provider::SchemaRegistry;
use crate::state::{StateRecord, StateSnapshot};

/// Pseudo-attribute reported when only explicit dependencies changed.
pub const DEPENDS_ON: &str = "depends_on";

/// Engine for computing diffs between declarations and state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Declaration hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource identifier.
    pub id: ResourceId,
    /// Graph node, for declared resources.
    pub node: Option<usize>,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Changed attributes.
    pub details: Vec<DiffDetail>,
    /// Hash stored in the state record.
    pub old_hash: Option<String>,
    /// Hash of the current declaration.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffType {
    /// Declared, no record.
    Create,
    /// Changed in place.
    Update,
    /// Changed in an attribute that forces a new instance.
    Replace,
    /// Recorded, no longer declared.
    Delete,
    /// Unchanged.
    NoChange,
}

/// A single changed attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// Attribute name.
    pub attribute: String,
    /// Value as of the last apply.
    pub old: Option<AttrValue>,
    /// Declared value.
    pub new: Option<AttrValue>,
    /// Whether this change forces a replacement.
    pub forces_replacement: bool,
    /// The declaration is unchanged but the resolved value will differ,
    /// because the referenced resource is replaced or has moved on since
    /// this one was applied.
    pub upstream_replaced: bool,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Declared resources in topological order, then orphans in id order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the declared graph and the state snapshot.
    #[must_use]
    pub fn compute_diff(
        &self,
        graph: &ValidatedGraph,
        snapshot: &StateSnapshot,
        schemas: &SchemaRegistry,
    ) -> DiffResult {
        let resources = graph.graph();
        let mut diffs = Vec::with_capacity(resources.len());
        let mut renewed: HashSet<ResourceId> = HashSet::new();

        for &node in graph.topological_order() {
            let resource = resources.resource(node);
            let new_hash = self.hasher.hash_resource(resource);

            let Some(record) = snapshot.get(&resource.id) else {
                debug!("{} needs to be created", resource.id);
                renewed.insert(resource.id.clone());
                diffs.push(ResourceDiff {
                    id: resource.id.clone(),
                    node: Some(node),
                    diff_type: DiffType::Create,
                    details: Vec::new(),
                    old_hash: None,
                    new_hash: Some(new_hash),
                });
                continue;
            };

            let stale = Self::stale_references(resource, record, snapshot, &renewed);

            let details = if record.declaration_hash == new_hash && stale.is_empty() {
                Vec::new()
            } else {
                let mut details = Self::attribute_changes(
                    &resource.id.kind,
                    &resource.attributes,
                    record,
                    schemas,
                );
                Self::add_upstream_changes(resource, record, &stale, schemas, &mut details);

                let mut declared_deps = resources.dependency_ids(node);
                let mut recorded_deps = record.dependencies.clone();
                declared_deps.sort();
                recorded_deps.sort();
                recorded_deps.dedup();
                if declared_deps != recorded_deps {
                    details.push(DiffDetail {
                        attribute: String::from(DEPENDS_ON),
                        old: None,
                        new: None,
                        forces_replacement: false,
                        upstream_replaced: false,
                    });
                }
                details
            };

            let diff_type = if details.is_empty() {
                DiffType::NoChange
            } else if details.iter().any(|d| d.forces_replacement) {
                renewed.insert(resource.id.clone());
                DiffType::Replace
            } else {
                DiffType::Update
            };

            debug!("{}: {diff_type}", resource.id);
            diffs.push(ResourceDiff {
                id: resource.id.clone(),
                node: Some(node),
                diff_type,
                details,
                old_hash: Some(record.declaration_hash.clone()),
                new_hash: Some(new_hash),
            });
        }

        let mut orphans: Vec<&StateRecord> = snapshot
            .values()
            .filter(|record| !resources.contains(&record.id))
            .collect();
        orphans.sort_by(|a, b| a.id.cmp(&b.id));

        for record in orphans {
            debug!("Found orphaned resource: {}", record.id);
            diffs.push(ResourceDiff {
                id: record.id.clone(),
                node: None,
                diff_type: DiffType::Delete,
                details: Vec::new(),
                old_hash: Some(record.declaration_hash.clone()),
                new_hash: None,
            });
        }

        DiffResult::from_diffs(diffs)
    }

    /// Compares declared attributes with the recorded declaration.
    fn attribute_changes(
        kind: &str,
        declared: &std::collections::BTreeMap<String, AttrValue>,
        record: &StateRecord,
        schemas: &SchemaRegistry,
    ) -> Vec<DiffDetail> {
        let mut details = Vec::new();

        for (name, value) in declared {
            let old = record.declared.get(name);
            if old != Some(value) {
                details.push(DiffDetail {
                    attribute: name.clone(),
                    old: old.cloned(),
                    new: Some(value.clone()),
                    forces_replacement: schemas.requires_replacement(kind, name),
                    upstream_replaced: false,
                });
            }
        }

        for (name, old) in &record.declared {
            if !declared.contains_key(name) {
                details.push(DiffDetail {
                    attribute: name.clone(),
                    old: Some(old.clone()),
                    new: None,
                    forces_replacement: schemas.requires_replacement(kind, name),
                    upstream_replaced: false,
                });
            }
        }

        details
    }

    /// Returns the references whose recorded value will not survive this run.
    ///
    /// That is the case when the target gets a new instance, or when the
    /// value sent last time no longer matches the target's recorded output
    /// (an earlier run replaced the target but failed before rebinding).
    fn stale_references<'a>(
        resource: &'a crate::graph::Resource,
        record: &StateRecord,
        snapshot: &StateSnapshot,
        renewed: &HashSet<ResourceId>,
    ) -> Vec<&'a str> {
        resource
            .references()
            .filter(|(name, reference)| {
                renewed.contains(&reference.target)
                    || snapshot
                        .get(&reference.target)
                        .and_then(|target| target.output(&reference.attribute))
                        .is_some_and(|current| record.attributes.get(*name) != Some(current))
            })
            .map(|(name, _)| name)
            .collect()
    }

    /// Marks unchanged references with a stale value as changed.
    fn add_upstream_changes(
        resource: &crate::graph::Resource,
        record: &StateRecord,
        stale: &[&str],
        schemas: &SchemaRegistry,
        details: &mut Vec<DiffDetail>,
    ) {
        for &name in stale {
            if details.iter().any(|d| d.attribute == name) {
                continue;
            }
            details.push(DiffDetail {
                attribute: name.to_string(),
                old: record.declared.get(name).cloned(),
                new: resource.attributes.get(name).cloned(),
                forces_replacement: schemas.requires_replacement(&resource.id.kind, name),
                upstream_replaced: true,
            });
        }
    }
}

impl DiffResult {
    fn from_diffs(diffs: Vec<ResourceDiff>) -> Self {
        let mut counts: HashMap<DiffType, usize> = HashMap::new();
        for diff in &diffs {
            *counts.entry(diff.diff_type).or_default() += 1;
        }
        let count = |t: DiffType| counts.get(&t).copied().unwrap_or(0);

        Self {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }

    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.replaces > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Returns the diff of a resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| &d.id == id)
    }
}

impl fmt::Display for DiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for DiffDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<AttrValue>| v.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string);

        if self.attribute == DEPENDS_ON {
            return write!(f, "{DEPENDS_ON} changed");
        }
        write!(f, "{}: {} -> {}", self.attribute, show(&self.old), show(&self.new))?;
        if self.upstream_replaced {
            write!(f, " (known after apply)")?;
        }
        if self.forces_replacement {
            write!(f, " # forces replacement")?;
        }
        Ok(())
    }
}

impl fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.attribute)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CycleChecker, GraphBuilder, Resource};
    use crate::provider::ResourceSchema;
    use crate::state::Outputs;

    fn network(cidr: &str) -> Resource {
        Resource::new(ResourceId::new("network", "main")).with_literal("cidr", cidr)
    }

    fn subnet() -> Resource {
        Resource::new(ResourceId::new("subnet", "a"))
            .with_literal("cidr", "10.0.1.0/24")
            .with_reference("network_id", ResourceId::new("network", "main"), "id")
    }

    fn validated(resources: Vec<Resource>) -> ValidatedGraph {
        let graph = GraphBuilder::new().resources(resources).build().unwrap();
        CycleChecker::new().check(graph).unwrap()
    }

    fn applied(graph: &ValidatedGraph) -> StateSnapshot {
        let hasher = ConfigHasher::new();
        graph
            .graph()
            .resources()
            .iter()
            .enumerate()
            .map(|(node, r)| {
                let record = StateRecord::new(
                    r.id.clone(),
                    r.attributes.clone(),
                    std::collections::BTreeMap::new(),
                    Outputs::new(),
                )
                .with_dependencies(graph.graph().dependency_ids(node))
                .with_hash(hasher.hash_resource(r));
                (r.id.clone(), record)
            })
            .collect()
    }

    fn schemas() -> SchemaRegistry {
        SchemaRegistry::new()
            .with_schema("network", ResourceSchema::force_new(["cidr"]))
            .with_schema("subnet", ResourceSchema::force_new(["network_id"]))
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let graph = validated(vec![network("10.0.0.0/16"), subnet()]);
        let diff = DiffEngine::new().compute_diff(&graph, &StateSnapshot::new(), &schemas());

        assert_eq!(diff.creates, 2);
        assert_eq!(diff.diffs[0].id, ResourceId::new("network", "main"));
        assert!(diff.has_changes());
    }

    #[test]
    fn test_unchanged_declarations_produce_no_change() {
        let graph = validated(vec![network("10.0.0.0/16"), subnet()]);
        let state = applied(&graph);
        let diff = DiffEngine::new().compute_diff(&graph, &state, &schemas());

        assert!(!diff.has_changes());
        assert_eq!(diff.unchanged, 2);
    }

    #[test]
    fn test_in_place_update() {
        let before = validated(vec![network("10.0.0.0/16").with_literal("tags", "a")]);
        let state = applied(&before);
        let after = validated(vec![network("10.0.0.0/16").with_literal("tags", "b")]);

        let diff = DiffEngine::new().compute_diff(&after, &state, &schemas());
        assert_eq!(diff.updates, 1);
        assert_eq!(diff.diffs[0].details[0].attribute, "tags");
        assert!(!diff.diffs[0].details[0].forces_replacement);
    }

    #[test]
    fn test_replace_propagates_through_references() {
        let before = validated(vec![network("10.0.0.0/16"), subnet()]);
        let state = applied(&before);
        let after = validated(vec![network("10.1.0.0/16"), subnet()]);

        let diff = DiffEngine::new().compute_diff(&after, &state, &schemas());
        assert_eq!(diff.replaces, 2);

        let sub = diff.get(&ResourceId::new("subnet", "a")).unwrap();
        assert_eq!(sub.diff_type, DiffType::Replace);
        assert!(sub.details[0].upstream_replaced);
    }

    #[test]
    fn test_upstream_replace_without_force_new_is_update() {
        let before = validated(vec![network("10.0.0.0/16"), subnet()]);
        let state = applied(&before);
        let after = validated(vec![network("10.1.0.0/16"), subnet()]);
        let registry = SchemaRegistry::new().with_schema("network", ResourceSchema::force_new(["cidr"]));

        let diff = DiffEngine::new().compute_diff(&after, &state, &registry);
        assert_eq!(
            diff.get(&ResourceId::new("subnet", "a")).unwrap().diff_type,
            DiffType::Update
        );
    }

    #[test]
    fn test_reference_bound_to_an_older_instance_is_stale() {
        let graph = validated(vec![network("10.1.0.0/16"), subnet()]);
        let mut state = applied(&graph);
        let network_id = ResourceId::new("network", "main");
        let subnet_id = ResourceId::new("subnet", "a");
        state
            .get_mut(&network_id)
            .unwrap()
            .outputs
            .insert(String::from("id"), serde_json::json!("net-2"));
        state
            .get_mut(&subnet_id)
            .unwrap()
            .attributes
            .insert(String::from("network_id"), serde_json::json!("net-1"));
        let registry = SchemaRegistry::new().with_schema("network", ResourceSchema::force_new(["cidr"]));

        let diff = DiffEngine::new().compute_diff(&graph, &state, &registry);
        assert_eq!(diff.get(&network_id).unwrap().diff_type, DiffType::NoChange);
        let sub = diff.get(&subnet_id).unwrap();
        assert_eq!(sub.diff_type, DiffType::Update);
        assert_eq!(sub.details[0].attribute, "network_id");
        assert!(sub.details[0].upstream_replaced);

        state
            .get_mut(&subnet_id)
            .unwrap()
            .attributes
            .insert(String::from("network_id"), serde_json::json!("net-2"));
        let diff = DiffEngine::new().compute_diff(&graph, &state, &registry);
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_orphans_are_deleted_in_id_order() {
        let before = validated(vec![
            network("10.0.0.0/16"),
            subnet(),
            Resource::new(ResourceId::new("bucket", "logs")),
        ]);
        let state = applied(&before);
        let after = validated(vec![network("10.0.0.0/16")]);

        let diff = DiffEngine::new().compute_diff(&after, &state, &schemas());
        let deletes: Vec<String> = diff
            .diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Delete)
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(deletes, vec!["bucket.logs", "subnet.a"]);
    }

    #[test]
    fn test_dependency_change_is_an_update() {
        let before = validated(vec![
            network("10.0.0.0/16"),
            Resource::new(ResourceId::new("app", "web")),
        ]);
        let state = applied(&before);
        let after = validated(vec![
            network("10.0.0.0/16"),
            Resource::new(ResourceId::new("app", "web"))
                .with_dependency(ResourceId::new("network", "main")),
        ]);

        let diff = DiffEngine::new().compute_diff(&after, &state, &schemas());
        let app = diff.get(&ResourceId::new("app", "web")).unwrap();
        assert_eq!(app.diff_type, DiffType::Update);
        assert_eq!(app.details[0].attribute, DEPENDS_ON);
    }
}
