//! Reconciler for converging recorded state to the declarations.
//!
//! One run is: build the resource graph, check it, diff it against the
//! state store, compile the plan and execute it. Every stage before
//! execution is pure and fails without touching anything.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, DeclarationConfig};
use crate::error::{ConfigError, PlanError, Result};
use crate::graph::{CycleChecker, GraphBuilder, ValidatedGraph};
use crate::planner::{ApplyReport, CancelHandle, DiffEngine, ExecutionEngine, ExecutionOptions, Plan};
use crate::provider::{ErrorClassifier, Provider, SchemaRegistry, StatusClassifier};
use crate::state::{LockInfo, StateSnapshot, StateStore, LOCK_REFRESH_SECS, generate_holder_id};

/// Reconciler for one declaration file.
pub struct Reconciler {
    /// Declarations.
    config: DeclarationConfig,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Provider; only needed to execute.
    provider: Option<Arc<dyn Provider>>,
    /// Failure classifier handed to the engine.
    classifier: Arc<dyn ErrorClassifier>,
    /// Per-kind mutation rules.
    schemas: SchemaRegistry,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Lock holder id.
    holder: String,
    /// Interval between run lock renewals.
    lock_refresh: Duration,
}

impl Reconciler {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: DeclarationConfig, store: Arc<dyn StateStore>) -> Self {
        let schemas = config.schema_registry();
        Self {
            config,
            store,
            provider: None,
            classifier: Arc::new(StatusClassifier),
            schemas,
            diff_engine: DiffEngine::new(),
            holder: generate_holder_id(),
            lock_refresh: Duration::from_secs(LOCK_REFRESH_SECS),
        }
    }

    /// Sets the provider that executes plans.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Sets the failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets how often the run lock is renewed while a plan executes.
    #[must_use]
    pub const fn with_lock_refresh(mut self, period: Duration) -> Self {
        self.lock_refresh = period;
        self
    }

    /// Returns the declarations.
    #[must_use]
    pub const fn config(&self) -> &DeclarationConfig {
        &self.config
    }

    /// Builds and checks the declared resource graph.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed references, unresolved references,
    /// duplicates or cycles.
    pub fn validated_graph(&self) -> Result<ValidatedGraph> {
        let graph = GraphBuilder::new()
            .resources(self.config.to_resources()?)
            .build()?;
        CycleChecker::new().check(graph)
    }

    /// Computes the plan for the current declarations.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the state cannot be loaded
    /// or the changes cannot be ordered.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.validated_graph()?;
        let snapshot = self.store.load().await?;
        self.compile(&graph, &snapshot)
    }

    /// Computes the plan that destroys everything in state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let snapshot = self.store.load().await?;
        self.compile(&Self::nothing_declared()?, &snapshot)
    }

    fn nothing_declared() -> Result<ValidatedGraph> {
        CycleChecker::new().check(GraphBuilder::new().build()?)
    }

    fn compile(&self, graph: &ValidatedGraph, snapshot: &StateSnapshot) -> Result<Plan> {
        let diff = self.diff_engine.compute_diff(graph, snapshot, &self.schemas);
        if !diff.has_changes() {
            debug!("Recorded state matches the declarations");
        }
        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.replaces, diff.deletes, diff.unchanged
        );
        Plan::compile(graph, &diff, snapshot, &self.schemas)
    }

    /// Plans and applies the declarations.
    ///
    /// The plan is computed from state loaded under the run lock, so a
    /// concurrent run cannot change the state between planning and applying.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails or the run lock cannot be taken.
    /// Provider failures are reported in the [`ApplyReport`].
    pub async fn apply(&self, options: ExecutionOptions, cancel: &CancelHandle) -> Result<ApplyReport> {
        info!(
            "Applying {}/{}",
            self.config.project.name, self.config.project.environment
        );
        let graph = self.validated_graph()?;
        self.run(&graph, options, cancel).await
    }

    /// Destroys every resource in state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or locked.
    pub async fn destroy(&self, options: ExecutionOptions, cancel: &CancelHandle) -> Result<ApplyReport> {
        warn!(
            "Destroying every resource of {}/{}",
            self.config.project.name, self.config.project.environment
        );
        self.run(&Self::nothing_declared()?, options, cancel).await
    }

    async fn run(
        &self,
        graph: &ValidatedGraph,
        options: ExecutionOptions,
        cancel: &CancelHandle,
    ) -> Result<ApplyReport> {
        if options.dry_run {
            let snapshot = self.store.load().await?;
            let plan = self.compile(graph, &snapshot)?;
            info!("Dry run: {} steps planned, nothing executed", plan.len());
            return Ok(ApplyReport::planned(&plan));
        }

        let lock = self.store.acquire_lock(&self.holder).await?;
        debug!("Acquired run lock {}", lock.lock_id);

        let result = self.plan_locked(graph, options, cancel, &lock).await;
        self.release(&lock).await;
        result
    }

    async fn plan_locked(
        &self,
        graph: &ValidatedGraph,
        options: ExecutionOptions,
        cancel: &CancelHandle,
        lock: &LockInfo,
    ) -> Result<ApplyReport> {
        let snapshot = self.store.load().await?;
        let plan = self.compile(graph, &snapshot)?;
        self.execute_locked(&plan, options, cancel, lock).await
    }

    /// Executes an already compiled plan under the run lock.
    ///
    /// The plan is refused if the state changed after it was computed, for
    /// example because another run applied in the meantime.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider is configured, the run lock cannot be
    /// taken, the state cannot be loaded or the plan is stale.
    pub async fn execute(
        &self,
        plan: &Plan,
        options: ExecutionOptions,
        cancel: &CancelHandle,
    ) -> Result<ApplyReport> {
        if options.dry_run {
            info!("Dry run: {} steps planned, nothing executed", plan.len());
            return Ok(ApplyReport::planned(plan));
        }
        if plan.is_empty() {
            info!("No changes to apply");
            return Ok(ApplyReport::default());
        }
        self.provider()?;

        let lock = self.store.acquire_lock(&self.holder).await?;
        debug!("Acquired run lock {}", lock.lock_id);

        let result = match self.store.load().await {
            Ok(current) if ConfigHasher::new().hash_state(&current) == plan.state_hash => {
                self.execute_locked(plan, options, cancel, &lock).await
            }
            Ok(_) => {
                warn!("State changed since the plan was computed");
                Err(PlanError::StaleState.into())
            }
            Err(e) => Err(e),
        };

        self.release(&lock).await;
        result
    }

    fn provider(&self) -> Result<&Arc<dyn Provider>> {
        self.provider.as_ref().ok_or_else(|| {
            ConfigError::validation(
                "a provider endpoint is required to apply changes",
                "provider.endpoint",
            )
            .into()
        })
    }

    async fn execute_locked(
        &self,
        plan: &Plan,
        options: ExecutionOptions,
        cancel: &CancelHandle,
        lock: &LockInfo,
    ) -> Result<ApplyReport> {
        if plan.is_empty() {
            info!("No changes to apply");
            return Ok(ApplyReport::default());
        }
        let engine = ExecutionEngine::new(Arc::clone(self.provider()?), Arc::clone(&self.store))
            .with_classifier(Arc::clone(&self.classifier))
            .with_options(options);

        let (stop, stopped) = oneshot::channel();
        let keeper = self.keep_lock(lock.lock_id.clone(), cancel.clone(), stopped);

        let result = engine.execute(plan, cancel).await;

        drop(stop);
        match keeper.await {
            Ok(true) => error!("Run lock {} was lost; remaining steps were cancelled", lock.lock_id),
            Ok(false) => {}
            Err(e) => warn!("Lock renewal task ended unexpectedly: {e}"),
        }
        result
    }

    /// Renews the run lock until `stopped` fires.
    ///
    /// Cancels the run and returns true if the lock could not be renewed.
    fn keep_lock(
        &self,
        lock_id: String,
        cancel: CancelHandle,
        mut stopped: oneshot::Receiver<()>,
    ) -> JoinHandle<bool> {
        let store = Arc::clone(&self.store);
        let period = self.lock_refresh;
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => return false,
                    _ = ticks.tick() => match store.renew_lock(&lock_id).await {
                        Ok(info) => debug!("Renewed run lock {lock_id} until {}", info.expires_at),
                        Err(e) => {
                            error!("Cannot renew run lock {lock_id}: {e}");
                            cancel.cancel();
                            return true;
                        }
                    },
                }
            }
        })
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release run lock {}: {e}", lock.lock_id);
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.config.project.name)
            .field("store", &self.store.backend_type())
            .field("provider", &self.provider.as_ref().map(|p| p.name().to_string()))
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{GraphError, PlanError, StateError, TerraceError};
    use crate::provider::{ProviderFailure, ProviderRequest};
    use crate::graph::ResourceId;
    use crate::state::{MemoryStateStore, Outputs, StateRecord};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use serde_json::json;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn apply(&self, request: &ProviderRequest) -> std::result::Result<Outputs, ProviderFailure> {
            let mut outputs = Outputs::new();
            outputs.insert(String::from("id"), json!(request.resource.to_string()));
            Ok(outputs)
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    /// Provider that watches the run lock while it works.
    struct LockWatcher {
        store: Arc<MemoryStateStore>,
        seen: std::sync::Mutex<Vec<crate::state::LockInfo>>,
        steal: bool,
    }

    #[async_trait]
    impl Provider for LockWatcher {
        async fn apply(&self, request: &ProviderRequest) -> std::result::Result<Outputs, ProviderFailure> {
            let held = self.store.get_lock_info().await.unwrap().unwrap();
            self.seen.lock().unwrap().push(held.clone());
            if self.steal {
                self.store.release_lock(&held.lock_id).await.unwrap();
                self.store.acquire_lock("intruder").await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
            EchoProvider.apply(request).await
        }

        fn name(&self) -> &str {
            "lock-watcher"
        }
    }

    const YAML: &str = r"
project:
  name: platform
schemas:
  network:
    force_new: [cidr]
resources:
  - kind: network
    name: main
    attributes:
      cidr: 10.0.0.0/16
  - kind: subnet
    name: a
    attributes:
      network_id: { ref: network.main.id }
";

    fn reconciler(yaml: &str, store: &Arc<MemoryStateStore>) -> Reconciler {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        Reconciler::new(config, Arc::clone(store) as Arc<dyn StateStore>)
            .with_provider(Arc::new(EchoProvider))
    }

    #[tokio::test]
    async fn test_apply_then_converged() {
        let store = Arc::new(MemoryStateStore::new());
        let reconciler = reconciler(YAML, &store);

        let report = reconciler
            .apply(ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap();
        assert!(report.success());
        assert_eq!(report.created.len(), 2);
        assert!(store.get_lock_info().await.unwrap().is_none());

        assert!(reconciler.plan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let store = Arc::new(MemoryStateStore::new());
        let reconciler = reconciler(YAML, &store);
        reconciler
            .apply(ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap();

        let report = reconciler
            .destroy(ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_reference_aborts_before_state() {
        let store = Arc::new(MemoryStateStore::new());
        let yaml = r"
project:
  name: platform
resources:
  - kind: subnet
    name: a
    attributes:
      network_id: { ref: network.missing.id }
";
        let err = reconciler(yaml, &store).plan().await.unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Graph(GraphError::UnresolvedReference { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_refuses_when_locked() {
        let store = Arc::new(MemoryStateStore::new());
        store.acquire_lock("someone-else").await.unwrap();

        let err = reconciler(YAML, &store)
            .apply(ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TerraceError::State(StateError::LockedByOther { .. })
        ));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_made_before_another_apply_is_refused() {
        let store = Arc::new(MemoryStateStore::new());
        let first = reconciler(YAML, &store);
        let second = reconciler(YAML, &store);

        let first_plan = first.plan().await.unwrap();
        let second_plan = second.plan().await.unwrap();
        assert_eq!(second_plan.len(), 2);

        let report = first
            .execute(&first_plan, ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap();
        assert!(report.success());

        let err = second
            .execute(&second_plan, ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::Plan(PlanError::StaleState)));
        assert_eq!(store.commit_log().await.len(), 2);
        assert!(store.get_lock_info().await.unwrap().is_none());

        let report = second
            .apply(ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(report.total_changes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_applies_create_once() {
        let store = Arc::new(MemoryStateStore::new());
        let first = reconciler(YAML, &store);
        let second = reconciler(YAML, &store);
        let options = ExecutionOptions::default();

        let cancel_first = CancelHandle::new();
        let cancel_second = CancelHandle::new();
        let (a, b) = tokio::join!(
            first.apply(options, &cancel_first),
            second.apply(options, &cancel_second)
        );
        let created: usize = [a, b]
            .into_iter()
            .filter_map(std::result::Result::ok)
            .map(|report| report.created.len())
            .sum();
        assert_eq!(created, 2);
        assert_eq!(store.commit_log().await.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_is_renewed_during_a_long_run() {
        let store = Arc::new(MemoryStateStore::new());
        let provider = Arc::new(LockWatcher {
            store: Arc::clone(&store),
            seen: std::sync::Mutex::default(),
            steal: false,
        });
        let config = ConfigParser::new().parse_yaml(YAML, None).unwrap();
        let reconciler = Reconciler::new(config, Arc::clone(&store) as Arc<dyn StateStore>)
            .with_provider(provider.clone())
            .with_lock_refresh(Duration::from_millis(10));

        let report = reconciler
            .apply(ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap();
        assert!(report.success());

        let seen = provider.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].lock_id, seen[1].lock_id);
        assert!(seen[1].expires_at > seen[0].expires_at);
        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_lock_cancels_the_run_and_is_left_alone() {
        let store = Arc::new(MemoryStateStore::new());
        let provider = Arc::new(LockWatcher {
            store: Arc::clone(&store),
            seen: std::sync::Mutex::default(),
            steal: true,
        });
        let config = ConfigParser::new().parse_yaml(YAML, None).unwrap();
        let reconciler = Reconciler::new(config, Arc::clone(&store) as Arc<dyn StateStore>)
            .with_provider(provider)
            .with_lock_refresh(Duration::from_millis(10));

        let report = reconciler
            .apply(ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.created, vec![ResourceId::new("network", "main")]);
        assert_eq!(report.skipped[0].resource, ResourceId::new("subnet", "a"));

        let lock = store.get_lock_info().await.unwrap().unwrap();
        assert_eq!(lock.holder, "intruder");
    }

    #[tokio::test]
    async fn test_dry_run_ignores_lock_and_store() {
        let store = Arc::new(MemoryStateStore::new());
        store.acquire_lock("someone-else").await.unwrap();

        let report = reconciler(YAML, &store)
            .apply(ExecutionOptions::default().with_dry_run(true), &CancelHandle::new())
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.created.len(), 2);
        assert!(store.commit_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_undeclared_record_is_planned_for_deletion() {
        let orphan = StateRecord::new(
            ResourceId::new("bucket", "logs"),
            BTreeMap::new(),
            BTreeMap::new(),
            Outputs::new(),
        );
        let store = Arc::new(MemoryStateStore::with_records([orphan]));

        let plan = reconciler(YAML, &store).plan().await.unwrap();
        assert_eq!(plan.summary().create, 2);
        assert_eq!(plan.summary().delete, 1);
        let last = plan.steps.last().unwrap();
        assert_eq!(last.resource, ResourceId::new("bucket", "logs"));
        assert!(last.action.is_teardown());
    }

    #[tokio::test]
    async fn test_apply_without_provider_fails_but_plan_works() {
        let store = Arc::new(MemoryStateStore::new());
        let config = ConfigParser::new().parse_yaml(YAML, None).unwrap();
        let reconciler = Reconciler::new(config, Arc::clone(&store) as Arc<dyn StateStore>);

        assert_eq!(reconciler.plan().await.unwrap().len(), 2);
        let err = reconciler
            .apply(ExecutionOptions::default(), &CancelHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::Config(ConfigError::ValidationError { .. })));
        assert!(store.get_lock_info().await.unwrap().is_none());
    }
}
