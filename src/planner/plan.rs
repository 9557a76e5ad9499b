//! Plan types and construction.
//!
//! A [`Plan`] is the ordered list of provider calls needed to move the
//! recorded state to the declared one. Steps refer to each other by index;
//! a step never appears before a step it depends on.
//!
//! Ordering rules:
//! - provisioning follows the declared graph (dependencies first);
//! - teardown follows the recorded graph in reverse (dependents first);
//! - `create_before_destroy` replacements create the new instance and
//!   re-provision surviving dependents before the old instance goes;
//! - `destroy_before_create` replacements tear down dependents and the old
//!   instance before the new one is created;
//! - deposed instances left behind by an earlier run are destroyed before
//!   the same resource is replaced or torn down, and only once every
//!   recorded dependent has moved off them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

use crate::config::ConfigHasher;
use crate::error::{PlanError, Result};
use crate::graph::{AttrValue, ResourceId, ValidatedGraph};
use crate::provider::{Operation, ReplaceStrategy, SchemaRegistry};
use crate::state::{StateRecord, StateSnapshot};

use super::diff::{DiffDetail, DiffResult, DiffType, ResourceDiff};

/// A complete, ordered plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the declaration set this plan is based on.
    pub declaration_hash: String,
    /// Hash of the state snapshot this plan was compiled against.
    pub state_hash: String,
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

/// A single planned provider call.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// Position in the plan.
    pub index: usize,
    /// Action to perform.
    pub action: ActionType,
    /// Target resource.
    pub resource: ResourceId,
    /// Declared attributes; references are resolved at dispatch time.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Declared dependencies, stored in the new record.
    pub resource_dependencies: Vec<ResourceId>,
    /// Hash of the declaration, stored in the new record.
    pub declaration_hash: Option<String>,
    /// State record as of planning time.
    pub prior: Option<StateRecord>,
    /// Replace ordering, for replace steps.
    pub strategy: Option<ReplaceStrategy>,
    /// Whether this step destroys a deposed instance instead of the
    /// current one.
    pub deposed: bool,
    /// Why the step is planned.
    pub reason: String,
    /// Attribute changes behind the step.
    pub changes: Vec<DiffDetail>,
    /// Indices of the steps that must complete first.
    pub dependencies: Vec<usize>,
}

/// Phase of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePhase {
    /// Create the new instance.
    Create,
    /// Destroy the old instance.
    Destroy,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new instance.
    Create,
    /// Update an instance in place.
    Update,
    /// One half of a replacement.
    Replace(ReplacePhase),
    /// Destroy an instance that is no longer declared.
    Delete,
}

/// Step counts by action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Create steps.
    pub create: usize,
    /// Update steps.
    pub update: usize,
    /// Replaced resources.
    pub replace: usize,
    /// Delete steps, including deposed cleanups.
    pub delete: usize,
}

/// Ordering key of a step among ready steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Priority {
    /// 0 for provisioning, 1 for teardown.
    phase: u8,
    /// Declaration index; orphans come after every declared resource.
    order: usize,
    /// Deposed cleanups first within a resource.
    sub: u8,
    /// Insertion index.
    seq: usize,
}

/// Unordered steps plus the edges between them.
#[derive(Debug, Default)]
struct StepSet {
    steps: Vec<PlanStep>,
    priorities: Vec<Priority>,
    predecessors: Vec<HashSet<usize>>,
    provision: HashMap<ResourceId, usize>,
    teardown: HashMap<ResourceId, usize>,
    cleanup: HashMap<ResourceId, usize>,
}

impl ActionType {
    /// Provider operation performed by this action.
    #[must_use]
    pub const fn operation(self) -> Operation {
        match self {
            Self::Create | Self::Replace(ReplacePhase::Create) => Operation::Create,
            Self::Update => Operation::Update,
            Self::Delete | Self::Replace(ReplacePhase::Destroy) => Operation::Delete,
        }
    }

    /// Returns true for actions that destroy an instance.
    #[must_use]
    pub const fn is_teardown(self) -> bool {
        matches!(self, Self::Delete | Self::Replace(ReplacePhase::Destroy))
    }
}

impl Plan {
    /// Compiles an ordered plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnsatisfiableChange`] when a destroy-first
    /// replacement would remove a resource that a still-declared resource
    /// keeps depending on, or when the ordering constraints conflict.
    pub fn compile(
        graph: &ValidatedGraph,
        diff: &DiffResult,
        snapshot: &StateSnapshot,
        schemas: &SchemaRegistry,
    ) -> Result<Self> {
        let resources = graph.graph();
        let strategies = Self::replace_strategies(diff, snapshot, schemas);

        let mut set = StepSet::default();
        let mut orphan_rank = resources.len();

        for resource_diff in &diff.diffs {
            let order = resource_diff.node.unwrap_or_else(|| {
                orphan_rank += 1;
                orphan_rank - 1
            });
            let prior = snapshot.get(&resource_diff.id);

            if let Some(record) = prior.filter(|r| r.deposed.is_some()) {
                set.push_cleanup(record, order);
            }

            match resource_diff.diff_type {
                DiffType::NoChange => {}
                DiffType::Create | DiffType::Update => {
                    let action = if resource_diff.diff_type == DiffType::Create {
                        ActionType::Create
                    } else {
                        ActionType::Update
                    };
                    let step = Self::provision_step(graph, resource_diff, action, prior, None);
                    set.push(step, 0, order);
                }
                DiffType::Replace => {
                    let strategy = strategies
                        .get(&resource_diff.id)
                        .copied()
                        .unwrap_or_default();
                    let create = Self::provision_step(
                        graph,
                        resource_diff,
                        ActionType::Replace(ReplacePhase::Create),
                        prior,
                        Some(strategy),
                    );
                    set.push(create, 0, order);

                    let destroy = PlanStep {
                        strategy: Some(strategy),
                        deposed: strategy == ReplaceStrategy::CreateBeforeDestroy,
                        reason: format!("old instance ({strategy})"),
                        ..PlanStep::teardown(
                            ActionType::Replace(ReplacePhase::Destroy),
                            resource_diff.id.clone(),
                            prior.cloned(),
                        )
                    };
                    set.push(destroy, 1, order);
                }
                DiffType::Delete => {
                    let step = PlanStep {
                        reason: String::from("no longer declared"),
                        ..PlanStep::teardown(
                            ActionType::Delete,
                            resource_diff.id.clone(),
                            prior.cloned(),
                        )
                    };
                    set.push(step, 1, order);
                }
            }
        }

        Self::link_provisioning(graph, &mut set);
        Self::link_teardown(snapshot, &mut set);
        Self::link_replacements(graph, snapshot, &strategies, &mut set)?;
        Self::link_cleanups(snapshot, &mut set)?;

        let steps = set.into_ordered()?;
        let hasher = ConfigHasher::new();
        let declaration_hash = hasher.hash_resources(resources.resources());
        let state_hash = hasher.hash_state(snapshot);

        info!("Compiled plan with {} steps", steps.len());
        Ok(Self {
            created_at: Utc::now(),
            declaration_hash,
            state_hash,
            steps,
        })
    }

    /// Decides the replace ordering of every replaced resource.
    ///
    /// A resource whose recorded dependency is replaced destroy-first must
    /// itself be replaced destroy-first.
    fn replace_strategies(
        diff: &DiffResult,
        snapshot: &StateSnapshot,
        schemas: &SchemaRegistry,
    ) -> HashMap<ResourceId, ReplaceStrategy> {
        let replaced: Vec<&ResourceId> = diff
            .diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Replace)
            .map(|d| &d.id)
            .collect();

        let mut strategies: HashMap<ResourceId, ReplaceStrategy> = replaced
            .iter()
            .map(|id| ((*id).clone(), schemas.strategy_for(&id.kind)))
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for id in &replaced {
                if strategies.get(*id) == Some(&ReplaceStrategy::DestroyBeforeCreate) {
                    continue;
                }
                let forced = snapshot.get(*id).is_some_and(|record| {
                    record
                        .dependencies
                        .iter()
                        .any(|dep| strategies.get(dep) == Some(&ReplaceStrategy::DestroyBeforeCreate))
                });
                if forced {
                    debug!("{id} is replaced destroy-first because a dependency is");
                    strategies.insert((*id).clone(), ReplaceStrategy::DestroyBeforeCreate);
                    changed = true;
                }
            }
        }

        strategies
    }

    fn provision_step(
        graph: &ValidatedGraph,
        diff: &ResourceDiff,
        action: ActionType,
        prior: Option<&StateRecord>,
        strategy: Option<ReplaceStrategy>,
    ) -> PlanStep {
        let resources = graph.graph();
        let (attributes, resource_dependencies) = diff.node.map_or_else(
            || (BTreeMap::new(), Vec::new()),
            |node| {
                (
                    resources.resource(node).attributes.clone(),
                    resources.dependency_ids(node),
                )
            },
        );

        let reason = match action {
            ActionType::Create => String::from("declared, not in state"),
            ActionType::Replace(_) => {
                let forcing: Vec<&str> = diff
                    .details
                    .iter()
                    .filter(|d| d.forces_replacement)
                    .map(|d| d.attribute.as_str())
                    .collect();
                format!("{} forces replacement", forcing.join(", "))
            }
            _ => {
                let changed: Vec<&str> = diff.details.iter().map(|d| d.attribute.as_str()).collect();
                format!("changed: {}", changed.join(", "))
            }
        };

        PlanStep {
            index: 0,
            action,
            resource: diff.id.clone(),
            attributes,
            resource_dependencies,
            declaration_hash: diff.new_hash.clone(),
            prior: prior.cloned(),
            strategy,
            deposed: false,
            reason,
            changes: diff.details.clone(),
            dependencies: Vec::new(),
        }
    }

    /// Provisioning of a dependency precedes provisioning of its dependents.
    ///
    /// Resources without a step are walked through so that ordering holds
    /// across unchanged intermediate resources.
    fn link_provisioning(graph: &ValidatedGraph, set: &mut StepSet) {
        let resources = graph.graph();
        for (node, resource) in resources.resources().iter().enumerate() {
            let Some(&after) = set.provision.get(&resource.id) else {
                continue;
            };

            let mut visited = HashSet::new();
            let mut stack: Vec<usize> = resources.dependencies(node).to_vec();
            while let Some(dep) = stack.pop() {
                if !visited.insert(dep) {
                    continue;
                }
                match set.provision.get(&resources.resource(dep).id) {
                    Some(&before) => set.edge(before, after),
                    None => stack.extend_from_slice(resources.dependencies(dep)),
                }
            }
        }
    }

    /// Teardown of a dependent precedes teardown of what it depended on,
    /// following the dependencies recorded at apply time.
    fn link_teardown(snapshot: &StateSnapshot, set: &mut StepSet) {
        let teardowns: Vec<(ResourceId, usize)> =
            set.teardown.iter().map(|(id, &i)| (id.clone(), i)).collect();

        for (id, before) in teardowns {
            let Some(record) = snapshot.get(&id) else {
                continue;
            };

            let mut visited = HashSet::new();
            let mut stack: Vec<&ResourceId> = record.dependencies.iter().collect();
            while let Some(dep) = stack.pop() {
                if !visited.insert(dep) {
                    continue;
                }
                if let Some(&after) = set.teardown.get(dep) {
                    set.edge(before, after);
                } else if let Some(dep_record) = snapshot.get(dep) {
                    stack.extend(dep_record.dependencies.iter());
                }
            }
        }
    }

    /// Orders the two halves of each replacement and the surviving
    /// dependents around them.
    fn link_replacements(
        graph: &ValidatedGraph,
        snapshot: &StateSnapshot,
        strategies: &HashMap<ResourceId, ReplaceStrategy>,
        set: &mut StepSet,
    ) -> Result<()> {
        let resources = graph.graph();

        let mut recorded_dependents: HashMap<&ResourceId, Vec<&ResourceId>> = HashMap::new();
        for record in snapshot.values() {
            for dep in &record.dependencies {
                recorded_dependents.entry(dep).or_default().push(&record.id);
            }
        }

        let mut teardowns: Vec<(ResourceId, usize)> =
            set.teardown.iter().map(|(id, &i)| (id.clone(), i)).collect();
        teardowns.sort();

        for (id, destroy) in teardowns {
            let strategy = strategies.get(&id).copied();
            let dependents = recorded_dependents.get(&id).cloned().unwrap_or_default();

            if strategy == Some(ReplaceStrategy::DestroyBeforeCreate) {
                if let Some(&create) = set.provision.get(&id) {
                    set.edge(destroy, create);
                }

                let mut blocking: Vec<ResourceId> = Vec::new();
                for dependent in dependents {
                    let Some(node) = resources.node(dependent) else {
                        continue;
                    };
                    let still_depends = resources.dependency_ids(node).contains(&id);
                    let replaced = strategies.get(dependent)
                        == Some(&ReplaceStrategy::DestroyBeforeCreate);

                    if replaced {
                        continue;
                    }
                    if still_depends {
                        blocking.push(dependent.clone());
                    } else if let Some(&before) = set.provision.get(dependent) {
                        set.edge(before, destroy);
                    }
                }

                if !blocking.is_empty() {
                    blocking.sort();
                    return Err(PlanError::UnsatisfiableChange {
                        resource: id,
                        dependents: blocking,
                        reason: String::from(
                            "destroy_before_create would remove it while they still depend on it; \
                             replace them as well or use create_before_destroy",
                        ),
                    }
                    .into());
                }
            } else {
                if let Some(&create) = set.provision.get(&id) {
                    set.edge(create, destroy);
                }
                for dependent in dependents {
                    if let Some(&before) = set.provision.get(dependent) {
                        set.edge(before, destroy);
                    }
                }
            }
        }

        Ok(())
    }

    /// Orders the destruction of deposed instances.
    ///
    /// A cleanup runs before any step that overwrites or removes the record
    /// holding the deposed instance, and after an in-place update of it.
    /// Recorded dependents still bound to the deposed instance are moved off
    /// it first.
    fn link_cleanups(snapshot: &StateSnapshot, set: &mut StepSet) -> Result<()> {
        let mut cleanups: Vec<(ResourceId, usize)> =
            set.cleanup.iter().map(|(id, &i)| (id.clone(), i)).collect();
        cleanups.sort();

        for (id, cleanup) in cleanups {
            let provision = set.provision.get(&id).copied();
            match provision {
                Some(update) if set.steps[update].action == ActionType::Update => {
                    set.edge(update, cleanup);
                }
                Some(create) => set.edge(cleanup, create),
                None => {}
            }
            if let Some(&after) = set.teardown.get(&id) {
                set.edge(cleanup, after);
            }

            let Some(deposed) = snapshot.get(&id).and_then(|r| r.deposed.as_ref()) else {
                continue;
            };
            let mut bound: Vec<&ResourceId> = snapshot
                .values()
                .filter(|r| r.id != id && r.is_bound_to(&id, &deposed.outputs))
                .map(|r| &r.id)
                .collect();
            bound.sort();

            let replaced_again = provision.is_some_and(|i| set.steps[i].action != ActionType::Update);
            let rebinding: Vec<ResourceId> = bound
                .iter()
                .filter(|dependent| set.provision.contains_key(**dependent))
                .map(|&dependent| dependent.clone())
                .collect();
            if replaced_again && !rebinding.is_empty() {
                return Err(PlanError::UnsatisfiableChange {
                    resource: id,
                    dependents: rebinding,
                    reason: String::from(
                        "they still use the instance deposed by an earlier run; \
                         apply once without replacing it again",
                    ),
                }
                .into());
            }

            for dependent in bound {
                debug!("{dependent} must move off the deposed {id} before it is destroyed");
                let before: Vec<usize> = [&set.provision, &set.teardown, &set.cleanup]
                    .into_iter()
                    .filter_map(|steps| steps.get(dependent).copied())
                    .collect();
                for step in before {
                    set.edge(step, cleanup);
                }
            }
        }

        Ok(())
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns the step counts by action.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for step in &self.steps {
            match step.action {
                ActionType::Create => summary.create += 1,
                ActionType::Update => summary.update += 1,
                ActionType::Replace(ReplacePhase::Create) => summary.replace += 1,
                ActionType::Replace(ReplacePhase::Destroy) => {}
                ActionType::Delete => summary.delete += 1,
            }
        }
        summary
    }

    /// Returns the indices of the steps that depend directly on `index`.
    #[must_use]
    pub fn dependents(&self, index: usize) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|s| s.dependencies.contains(&index))
            .map(|s| s.index)
            .collect()
    }

    /// Returns steps that can be executed immediately (no dependencies).
    #[must_use]
    pub fn ready_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .collect()
    }
}

impl PlanStep {
    fn teardown(action: ActionType, resource: ResourceId, prior: Option<StateRecord>) -> Self {
        Self {
            index: 0,
            action,
            resource,
            attributes: BTreeMap::new(),
            resource_dependencies: Vec::new(),
            declaration_hash: None,
            prior,
            strategy: None,
            deposed: false,
            reason: String::new(),
            changes: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Returns a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        let target = if self.deposed {
            format!("{} (deposed)", self.resource)
        } else {
            self.resource.to_string()
        };
        match self.action {
            ActionType::Create => format!("Create {target}"),
            ActionType::Update => format!("Update {target}"),
            ActionType::Replace(ReplacePhase::Create) => format!("Create replacement for {target}"),
            ActionType::Replace(ReplacePhase::Destroy) => format!("Destroy old {target}"),
            ActionType::Delete => format!("Delete {target}"),
        }
    }
}

impl StepSet {
    fn push(&mut self, mut step: PlanStep, phase: u8, order: usize) -> usize {
        let seq = self.steps.len();
        step.index = seq;

        let map = if step.deposed && step.action == ActionType::Delete {
            &mut self.cleanup
        } else if step.action.is_teardown() {
            &mut self.teardown
        } else {
            &mut self.provision
        };
        map.insert(step.resource.clone(), seq);

        let sub = u8::from(!(step.deposed && step.action == ActionType::Delete));
        self.priorities.push(Priority {
            phase,
            order,
            sub,
            seq,
        });
        self.predecessors.push(HashSet::new());
        self.steps.push(step);
        seq
    }

    fn push_cleanup(&mut self, record: &StateRecord, order: usize) {
        let step = PlanStep {
            deposed: true,
            reason: String::from("deposed instance left by an earlier replacement"),
            ..PlanStep::teardown(ActionType::Delete, record.id.clone(), Some(record.clone()))
        };
        self.push(step, 1, order);
    }

    fn edge(&mut self, before: usize, after: usize) {
        if before != after {
            self.predecessors[after].insert(before);
        }
    }

    /// Orders the steps with Kahn's algorithm, smallest priority first.
    fn into_ordered(self) -> Result<Vec<PlanStep>> {
        let count = self.steps.len();
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(HashSet::len).collect();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (after, preds) in self.predecessors.iter().enumerate() {
            for &before in preds {
                successors[before].push(after);
            }
        }

        let mut ready: BinaryHeap<Reverse<Priority>> = (0..count)
            .filter(|&i| in_degree[i] == 0)
            .map(|i| Reverse(self.priorities[i]))
            .collect();
        let mut order = Vec::with_capacity(count);

        while let Some(Reverse(priority)) = ready.pop() {
            let i = priority.seq;
            order.push(i);
            for &next in &successors[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(self.priorities[next]));
                }
            }
        }

        if order.len() != count {
            let mut stuck: Vec<ResourceId> = (0..count)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.steps[i].resource.clone())
                .collect();
            stuck.sort();
            stuck.dedup();
            let resource = stuck.remove(0);
            return Err(PlanError::UnsatisfiableChange {
                resource,
                dependents: stuck,
                reason: String::from("the required ordering of these changes is circular"),
            }
            .into());
        }

        let mut position = vec![0; count];
        for (new, &old) in order.iter().enumerate() {
            position[old] = new;
        }

        let mut slots: Vec<Option<PlanStep>> = self.steps.into_iter().map(Some).collect();
        let mut steps = Vec::with_capacity(count);
        for (new, &old) in order.iter().enumerate() {
            let Some(mut step) = slots[old].take() else {
                continue;
            };
            step.index = new;
            let mut deps: Vec<usize> = self.predecessors[old].iter().map(|&p| position[p]).collect();
            deps.sort_unstable();
            step.dependencies = deps;
            steps.push(step);
        }

        Ok(steps)
    }
}

impl fmt::Display for ReplacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Replace(phase) => write!(f, "replace ({phase})"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} steps):", self.steps.len())?;
        for step in &self.steps {
            write!(f, "  {}. {step}", step.index)?;
            if !step.dependencies.is_empty() {
                let deps: Vec<String> = step.dependencies.iter().map(ToString::to_string).collect();
                write!(f, " after [{}]", deps.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CycleChecker, GraphBuilder, Resource};
    use crate::planner::DiffEngine;
    use crate::provider::ResourceSchema;
    use crate::state::Outputs;
    use serde_json::json;

    fn network(cidr: &str) -> Resource {
        Resource::new(ResourceId::new("network", "main")).with_literal("cidr", cidr)
    }

    fn subnet() -> Resource {
        Resource::new(ResourceId::new("subnet", "a"))
            .with_literal("cidr", "10.0.1.0/24")
            .with_reference("network_id", ResourceId::new("network", "main"), "id")
    }

    fn instance() -> Resource {
        Resource::new(ResourceId::new("instance", "web"))
            .with_literal("size", "small")
            .with_reference("subnet_id", ResourceId::new("subnet", "a"), "id")
    }

    fn schemas(strategy: ReplaceStrategy) -> SchemaRegistry {
        SchemaRegistry::new()
            .with_default_strategy(strategy)
            .with_schema("network", ResourceSchema::force_new(["cidr"]))
            .with_schema("subnet", ResourceSchema::force_new(["network_id"]))
    }

    fn compile(
        resources: Vec<Resource>,
        snapshot: &StateSnapshot,
        registry: &SchemaRegistry,
    ) -> Result<Plan> {
        let graph = CycleChecker::new()
            .check(GraphBuilder::new().resources(resources).build()?)?;
        let diff = DiffEngine::new().compute_diff(&graph, snapshot, registry);
        Plan::compile(&graph, &diff, snapshot, registry)
    }

    /// Applies every step to the snapshot the way a successful run would.
    fn apply(plan: &Plan, snapshot: &mut StateSnapshot) {
        for step in &plan.steps {
            match step.action {
                ActionType::Create | ActionType::Update | ActionType::Replace(ReplacePhase::Create) => {
                    let mut outputs = Outputs::new();
                    outputs.insert(String::from("id"), json!(format!("{}-id", step.resource)));
                    let resolved = step
                        .attributes
                        .iter()
                        .map(|(name, value)| {
                            let value = match value {
                                AttrValue::Literal(v) => v.clone(),
                                AttrValue::Reference(r) => snapshot
                                    .get(&r.target)
                                    .and_then(|t| t.output(&r.attribute))
                                    .cloned()
                                    .unwrap_or_default(),
                            };
                            (name.clone(), value)
                        })
                        .collect();
                    let record = StateRecord::new(
                        step.resource.clone(),
                        step.attributes.clone(),
                        resolved,
                        outputs,
                    )
                    .with_dependencies(step.resource_dependencies.clone())
                    .with_hash(step.declaration_hash.clone().unwrap_or_default());
                    snapshot.insert(step.resource.clone(), record);
                }
                ActionType::Delete if step.deposed => {}
                ActionType::Delete | ActionType::Replace(ReplacePhase::Destroy) => {
                    if step.strategy != Some(ReplaceStrategy::CreateBeforeDestroy) {
                        snapshot.remove(&step.resource);
                    }
                }
            }
        }
    }

    fn describe(plan: &Plan) -> Vec<String> {
        plan.steps
            .iter()
            .map(|s| format!("{} {}", s.action, s.resource))
            .collect()
    }

    fn position(plan: &Plan, action: ActionType, resource: &str) -> usize {
        plan.steps
            .iter()
            .position(|s| s.action == action && s.resource.to_string() == resource)
            .unwrap()
    }

    #[test]
    fn test_first_run_creates_in_dependency_order() {
        let registry = schemas(ReplaceStrategy::CreateBeforeDestroy);
        let plan = compile(
            vec![instance(), subnet(), network("10.0.0.0/16")],
            &StateSnapshot::new(),
            &registry,
        )
        .unwrap();

        assert_eq!(
            describe(&plan),
            vec!["create network.main", "create subnet.a", "create instance.web"]
        );
        assert_eq!(plan.steps[1].dependencies, vec![0]);
        assert_eq!(plan.steps[2].dependencies, vec![1]);
    }

    #[test]
    fn test_scenario_across_runs() {
        let registry = schemas(ReplaceStrategy::CreateBeforeDestroy);
        let mut state = StateSnapshot::new();

        let first = compile(vec![network("10.0.0.0/16"), subnet(), instance()], &state, &registry).unwrap();
        assert_eq!(first.len(), 3);
        apply(&first, &mut state);

        let second = compile(vec![network("10.0.0.0/16"), subnet(), instance()], &state, &registry).unwrap();
        assert!(second.is_empty());

        let removed = compile(vec![network("10.0.0.0/16"), subnet()], &state, &registry).unwrap();
        assert_eq!(describe(&removed), vec!["delete instance.web"]);

        let replaced = compile(vec![network("10.1.0.0/16"), subnet()], &state, &registry).unwrap();
        assert_eq!(
            describe(&replaced),
            vec![
                "replace (create) network.main",
                "replace (create) subnet.a",
                "delete instance.web",
                "replace (destroy) subnet.a",
                "replace (destroy) network.main",
            ]
        );
        assert!(replaced.steps[3].deposed);
    }

    #[test]
    fn test_destroy_before_create_tears_down_dependents_first() {
        let registry = schemas(ReplaceStrategy::DestroyBeforeCreate);
        let mut state = StateSnapshot::new();
        let first = compile(vec![network("10.0.0.0/16"), subnet(), instance()], &state, &registry).unwrap();
        apply(&first, &mut state);

        let plan = compile(vec![network("10.1.0.0/16"), subnet()], &state, &registry).unwrap();
        assert_eq!(
            describe(&plan),
            vec![
                "delete instance.web",
                "replace (destroy) subnet.a",
                "replace (destroy) network.main",
                "replace (create) network.main",
                "replace (create) subnet.a",
            ]
        );
    }

    #[test]
    fn test_destroy_first_dependency_forces_destroy_first_dependent() {
        let registry = SchemaRegistry::new()
            .with_schema(
                "network",
                ResourceSchema::force_new(["cidr"]).with_strategy(ReplaceStrategy::DestroyBeforeCreate),
            )
            .with_schema("subnet", ResourceSchema::force_new(["network_id"]));
        let mut state = StateSnapshot::new();
        let first = compile(vec![network("10.0.0.0/16"), subnet()], &state, &registry).unwrap();
        apply(&first, &mut state);

        let plan = compile(vec![network("10.1.0.0/16"), subnet()], &state, &registry).unwrap();
        let subnet_destroy = plan
            .steps
            .iter()
            .find(|s| s.action == ActionType::Replace(ReplacePhase::Destroy) && s.resource.kind == "subnet")
            .unwrap();
        assert_eq!(subnet_destroy.strategy, Some(ReplaceStrategy::DestroyBeforeCreate));
        assert_eq!(subnet_destroy.index, 0);
    }

    #[test]
    fn test_destroy_first_with_live_dependent_is_unsatisfiable() {
        // Subnet can update network_id in place, so it is never replaced.
        let registry = SchemaRegistry::new()
            .with_default_strategy(ReplaceStrategy::DestroyBeforeCreate)
            .with_schema("network", ResourceSchema::force_new(["cidr"]));
        let mut state = StateSnapshot::new();
        let first = compile(vec![network("10.0.0.0/16"), subnet()], &state, &registry).unwrap();
        apply(&first, &mut state);

        let err = compile(vec![network("10.1.0.0/16"), subnet()], &state, &registry).unwrap_err();
        match err {
            crate::error::TerraceError::Plan(PlanError::UnsatisfiableChange {
                resource,
                dependents,
                ..
            }) => {
                assert_eq!(resource, ResourceId::new("network", "main"));
                assert_eq!(dependents, vec![ResourceId::new("subnet", "a")]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_update_does_not_propagate() {
        let registry = schemas(ReplaceStrategy::CreateBeforeDestroy);
        let mut state = StateSnapshot::new();
        let first = compile(vec![network("10.0.0.0/16"), subnet()], &state, &registry).unwrap();
        apply(&first, &mut state);

        let plan = compile(
            vec![network("10.0.0.0/16").with_literal("tags", "x"), subnet()],
            &state,
            &registry,
        )
        .unwrap();
        assert_eq!(describe(&plan), vec!["update network.main"]);
    }

    #[test]
    fn test_leftover_deposed_is_destroyed_first() {
        let registry = schemas(ReplaceStrategy::CreateBeforeDestroy);
        let mut state = StateSnapshot::new();
        let first = compile(vec![network("10.0.0.0/16")], &state, &registry).unwrap();
        apply(&first, &mut state);

        let id = ResourceId::new("network", "main");
        let current = state.get(&id).unwrap().clone();
        let with_deposed = current.superseded_by(current.clone());
        state.insert(id.clone(), with_deposed);

        let unchanged = compile(vec![network("10.0.0.0/16")], &state, &registry).unwrap();
        assert_eq!(unchanged.len(), 1);
        assert!(unchanged.steps[0].deposed);
        assert_eq!(unchanged.steps[0].action, ActionType::Delete);

        let replaced = compile(vec![network("10.1.0.0/16")], &state, &registry).unwrap();
        assert_eq!(replaced.len(), 3);
        assert!(replaced.steps[0].deposed);
        assert!(replaced.steps[1].dependencies.contains(&0));
    }

    /// State after a create-before-destroy replacement of the network whose
    /// subnet update never ran: the subnet still points at the old network.
    fn half_replaced(registry: &SchemaRegistry) -> StateSnapshot {
        let mut state = StateSnapshot::new();
        let first = compile(vec![network("10.0.0.0/16"), subnet()], &state, registry).unwrap();
        apply(&first, &mut state);

        let id = ResourceId::new("network", "main");
        let old = state[&id].clone();
        let mut outputs = Outputs::new();
        outputs.insert(String::from("id"), json!("network.main-id2"));
        let fresh = StateRecord {
            outputs,
            ..old.clone()
        };
        state.insert(id, old.superseded_by(fresh));
        state
    }

    #[test]
    fn test_deposed_cleanup_waits_for_bound_dependents() {
        let registry = SchemaRegistry::new().with_schema("network", ResourceSchema::force_new(["cidr"]));
        let state = half_replaced(&registry);

        let plan = compile(vec![network("10.0.0.0/16"), subnet()], &state, &registry).unwrap();
        assert_eq!(describe(&plan), vec!["update subnet.a", "delete network.main"]);
        assert!(plan.steps[1].deposed);
        assert_eq!(plan.steps[1].dependencies, vec![0]);
        assert!(plan.steps[0].changes[0].upstream_replaced);

        // Same ordering when the subnet goes away instead.
        let plan = compile(vec![network("10.0.0.0/16")], &state, &registry).unwrap();
        assert_eq!(describe(&plan), vec!["delete subnet.a", "delete network.main"]);
        assert_eq!(plan.steps[1].dependencies, vec![0]);
    }

    #[test]
    fn test_deposed_cleanup_follows_in_place_update() {
        let registry = SchemaRegistry::new().with_schema("network", ResourceSchema::force_new(["cidr"]));
        let state = half_replaced(&registry);

        let plan = compile(
            vec![network("10.0.0.0/16").with_literal("tags", "x"), subnet()],
            &state,
            &registry,
        )
        .unwrap();
        let update = position(&plan, ActionType::Update, "network.main");
        let rebind = position(&plan, ActionType::Update, "subnet.a");
        let cleanup = plan.steps.iter().position(|s| s.deposed).unwrap();
        assert!(update < cleanup);
        assert!(rebind < cleanup);
    }

    #[test]
    fn test_replacing_again_while_deposed_is_in_use_is_unsatisfiable() {
        let registry = SchemaRegistry::new().with_schema("network", ResourceSchema::force_new(["cidr"]));
        let state = half_replaced(&registry);

        let err = compile(vec![network("10.2.0.0/16"), subnet()], &state, &registry).unwrap_err();
        match err {
            crate::error::TerraceError::Plan(PlanError::UnsatisfiableChange {
                resource,
                dependents,
                ..
            }) => {
                assert_eq!(resource, ResourceId::new("network", "main"));
                assert_eq!(dependents, vec![ResourceId::new("subnet", "a")]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_orders_hold_for_every_edge() {
        let registry = schemas(ReplaceStrategy::CreateBeforeDestroy);
        let declared = vec![
            network("10.0.0.0/16"),
            subnet(),
            instance(),
            Resource::new(ResourceId::new("dns", "web"))
                .with_reference("target", ResourceId::new("instance", "web"), "ip")
                .with_dependency(ResourceId::new("network", "main")),
        ];
        let mut state = StateSnapshot::new();
        let plan = compile(declared.clone(), &state, &registry).unwrap();

        for (a, b) in [("subnet.a", "network.main"), ("instance.web", "subnet.a"), ("dns.web", "instance.web"), ("dns.web", "network.main")] {
            assert!(position(&plan, ActionType::Create, b) < position(&plan, ActionType::Create, a));
        }
        for step in &plan.steps {
            assert!(step.dependencies.iter().all(|&d| d < step.index));
        }

        apply(&plan, &mut state);
        let teardown = compile(Vec::new(), &state, &registry).unwrap();
        for (a, b) in [("subnet.a", "network.main"), ("instance.web", "subnet.a"), ("dns.web", "instance.web"), ("dns.web", "network.main")] {
            assert!(position(&teardown, ActionType::Delete, a) < position(&teardown, ActionType::Delete, b));
        }
    }

    #[test]
    fn test_unchanged_middle_resource_still_orders_ends() {
        // network -> subnet (depends_on only, unchanged) -> instance
        let registry = schemas(ReplaceStrategy::CreateBeforeDestroy);
        let sub = Resource::new(ResourceId::new("subnet", "a"))
            .with_dependency(ResourceId::new("network", "main"));
        let inst = Resource::new(ResourceId::new("instance", "web"))
            .with_literal("size", "small")
            .with_dependency(ResourceId::new("subnet", "a"));
        let mut state = StateSnapshot::new();
        let first = compile(vec![network("10.0.0.0/16"), sub.clone(), inst.clone()], &state, &registry).unwrap();
        apply(&first, &mut state);

        let plan = compile(
            vec![
                network("10.0.0.0/16").with_literal("tags", "x"),
                sub,
                inst.with_literal("size", "large"),
            ],
            &state,
            &registry,
        )
        .unwrap();
        assert_eq!(describe(&plan), vec!["update network.main", "update instance.web"]);
        assert_eq!(plan.steps[1].dependencies, vec![0]);
    }

    #[test]
    fn test_summary_and_display() {
        let registry = schemas(ReplaceStrategy::CreateBeforeDestroy);
        let plan = compile(vec![network("10.0.0.0/16"), subnet()], &StateSnapshot::new(), &registry).unwrap();
        let summary = plan.summary();
        assert_eq!(summary.create, 2);
        assert_eq!(summary.delete, 0);
        assert_eq!(plan.dependents(0), vec![1]);
        assert!(plan.to_string().contains("Create network.main"));
        assert_eq!(plan.ready_steps().len(), 1);
    }
}
