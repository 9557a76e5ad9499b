//! Execution engine for applying plans.
//!
//! The coordinator owns the ready set and an in-memory view of every state
//! record. Ready steps are dispatched onto a [`JoinSet`] up to the
//! concurrency limit. A worker resolves nothing itself: references are
//! substituted by the coordinator at dispatch time, the worker calls the
//! provider (retrying transient failures) and commits the resulting record
//! before it reports back. Dependents therefore only ever see committed
//! state.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{ProviderError, Result};
use crate::graph::{AttrValue, ResourceId};
use crate::provider::{
    ErrorClass, ErrorClassifier, Provider, ProviderRequest, ReplaceStrategy, StatusClassifier,
};
use crate::state::{StateRecord, StateStore};

use super::plan::{ActionType, Plan, PlanStep, ReplacePhase};

/// Tunables of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Maximum number of steps in flight; zero runs one at a time.
    pub concurrency: usize,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the computed retry delay.
    pub max_backoff: Duration,
    /// Report the plan without calling the provider or the store.
    pub dry_run: bool,
}

/// Cooperative cancellation for a running apply.
///
/// Cancelling stops new dispatch. Steps already in flight finish and commit.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

/// Executor for plans.
pub struct ExecutionEngine {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    classifier: Arc<dyn ErrorClassifier>,
    options: ExecutionOptions,
}

/// Outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Resources created.
    pub created: Vec<ResourceId>,
    /// Resources updated in place.
    pub updated: Vec<ResourceId>,
    /// Resources whose replacement instance was created.
    pub replaced: Vec<ResourceId>,
    /// Resources (or deposed instances) destroyed.
    pub deleted: Vec<ResourceId>,
    /// Steps that failed.
    pub failed: Vec<FailedStep>,
    /// Steps never attempted.
    pub skipped: Vec<SkippedStep>,
    /// Whether this report describes a dry run.
    pub dry_run: bool,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

/// A step that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStep {
    /// Target resource.
    pub resource: ResourceId,
    /// Action of the step.
    pub action: ActionType,
    /// Error message.
    pub error: String,
    /// Provider attempts made.
    pub attempts: u32,
}

/// A step that was never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedStep {
    /// Target resource.
    pub resource: ResourceId,
    /// Action of the step.
    pub action: ActionType,
    /// Why it was skipped.
    pub reason: String,
}

/// Progress of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StepStatus {
    Pending,
    Running,
    Done,
    Failed { error: String, attempts: u32 },
    Skipped { reason: String },
}

/// How the record is written once the provider call succeeds.
#[derive(Debug)]
enum Commit {
    /// Store `base` with the returned outputs.
    Fresh(StateRecord),
    /// Store `base` as an in-place update of `prior`.
    Update { prior: StateRecord, base: StateRecord },
    /// Store `base` as a replacement deposing `prior`.
    Supersede { prior: StateRecord, base: StateRecord },
    /// Store `record` without its deposed instance.
    ClearDeposed(StateRecord),
    /// Remove the record.
    Remove,
}

/// Everything a worker needs to run one step.
#[derive(Debug)]
struct Work {
    index: usize,
    request: ProviderRequest,
    commit: Commit,
}

/// What a worker reports back.
#[derive(Debug)]
enum Outcome {
    /// Succeeded; the record now stored, or `None` if it was removed.
    Committed { record: Option<StateRecord>, attempts: u32 },
    /// Failed after `attempts` provider calls.
    Failed { error: String, attempts: u32 },
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

impl From<&ExecutionConfig> for ExecutionOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            dry_run: false,
        }
    }
}

impl ExecutionOptions {
    /// Sets the concurrency limit (at least 1).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the retry bound.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Enables or disables dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl CancelHandle {
    /// Creates a handle that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Creates an engine with default options and status-code classification.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            classifier: Arc::new(StatusClassifier),
            options: ExecutionOptions::default(),
        }
    }

    /// Sets the error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets the run options.
    #[must_use]
    pub const fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the run options.
    #[must_use]
    pub const fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Executes a plan.
    ///
    /// Provider failures do not abort the run; they are reported per step.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state cannot be loaded at the start.
    pub async fn execute(&self, plan: &Plan, cancel: &CancelHandle) -> Result<ApplyReport> {
        if self.options.dry_run {
            info!("Dry run: {} steps planned, nothing executed", plan.len());
            return Ok(ApplyReport::planned(plan));
        }

        let concurrency = self.options.concurrency.max(1);
        info!(
            "Executing plan with {} steps (concurrency {concurrency})",
            plan.len()
        );
        if plan.is_empty() {
            return Ok(ApplyReport::default());
        }

        let mut records = self.store.load().await?;
        let count = plan.steps.len();
        let mut status = vec![StepStatus::Pending; count];
        let mut attempts = vec![0u32; count];
        let mut waiting: Vec<usize> = plan.steps.iter().map(|s| s.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for step in &plan.steps {
            for &dep in &step.dependencies {
                dependents[dep].push(step.index);
            }
        }

        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| waiting[i] == 0).collect();
        let mut in_flight: JoinSet<(usize, Outcome)> = JoinSet::new();
        let mut cancel_rx = cancel.subscribe();
        let mut cancelled = cancel.is_cancelled();

        loop {
            cancelled = cancelled || cancel.is_cancelled();

            while !cancelled && in_flight.len() < concurrency {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                let step = &plan.steps[index];

                match Self::prepare(step, &records) {
                    Ok(Some(work)) => {
                        info!("Starting step {index}: {}", step.description());
                        status[index] = StepStatus::Running;
                        let provider = Arc::clone(&self.provider);
                        let store = Arc::clone(&self.store);
                        let classifier = Arc::clone(&self.classifier);
                        let options = self.options;
                        in_flight.spawn(async move {
                            let outcome = run_step(provider, store, classifier, options, work).await;
                            (index, outcome)
                        });
                    }
                    Ok(None) => {
                        debug!("Step {index} has nothing to do: {}", step.description());
                        status[index] = StepStatus::Done;
                        Self::release(index, &dependents, &mut waiting, &mut ready);
                    }
                    Err(message) => {
                        error!("Step {index} failed: {message}");
                        status[index] = StepStatus::Failed {
                            error: message,
                            attempts: 0,
                        };
                        Self::skip_dependents(plan, index, &dependents, &mut status);
                    }
                }
            }

            if in_flight.is_empty() {
                if cancelled || ready.is_empty() {
                    break;
                }
                continue;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok((index, outcome)) => {
                            let step = &plan.steps[index];
                            match outcome {
                                Outcome::Committed { record, attempts: n } => {
                                    info!("Completed step {index}: {}", step.description());
                                    attempts[index] = n;
                                    match record {
                                        Some(record) => {
                                            records.insert(step.resource.clone(), record);
                                        }
                                        None => {
                                            records.remove(&step.resource);
                                        }
                                    }
                                    status[index] = StepStatus::Done;
                                    Self::release(index, &dependents, &mut waiting, &mut ready);
                                }
                                Outcome::Failed { error: message, attempts: n } => {
                                    error!("Step {index} ({}) failed: {message}", step.description());
                                    status[index] = StepStatus::Failed { error: message, attempts: n };
                                    Self::skip_dependents(plan, index, &dependents, &mut status);
                                }
                            }
                        }
                        Err(e) => {
                            error!("Worker task ended unexpectedly: {e}");
                        }
                    }
                }
                changed = cancel_rx.changed(), if !cancelled => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        warn!("Cancellation requested; waiting for {} in-flight steps", in_flight.len());
                        cancelled = true;
                    }
                }
            }
        }

        // A worker that panicked never reported back.
        for index in 0..count {
            if status[index] == StepStatus::Running {
                status[index] = StepStatus::Failed {
                    error: String::from("worker task ended unexpectedly"),
                    attempts: 0,
                };
                Self::skip_dependents(plan, index, &dependents, &mut status);
            }
        }

        let leftover = if cancelled { "run cancelled" } else { "not started" };
        for state in &mut status {
            if *state == StepStatus::Pending {
                *state = StepStatus::Skipped {
                    reason: String::from(leftover),
                };
            }
        }

        let report = ApplyReport::from_statuses(plan, &status, &attempts, cancelled);
        info!("{report}");
        Ok(report)
    }

    /// Builds the work item for a step from the current records.
    ///
    /// Returns `Ok(None)` for teardown steps whose instance is already gone.
    fn prepare(
        step: &PlanStep,
        records: &HashMap<ResourceId, StateRecord>,
    ) -> std::result::Result<Option<Work>, String> {
        let current = records.get(&step.resource);
        let operation = step.action.operation();

        if step.action.is_teardown() {
            let (target, commit) = if step.deposed {
                let Some(record) = current else {
                    return Ok(None);
                };
                let Some(deposed) = &record.deposed else {
                    return Ok(None);
                };
                (
                    (deposed.attributes.clone(), deposed.outputs.clone()),
                    Commit::ClearDeposed(record.without_deposed()),
                )
            } else {
                let Some(record) = current else {
                    return Ok(None);
                };
                (
                    (record.attributes.clone(), record.outputs.clone()),
                    Commit::Remove,
                )
            };

            return Ok(Some(Work {
                index: step.index,
                request: ProviderRequest {
                    operation,
                    resource: step.resource.clone(),
                    attributes: target.0,
                    prior_outputs: Some(target.1),
                },
                commit,
            }));
        }

        let attributes = resolve(step, records)?;
        let base = StateRecord::new(
            step.resource.clone(),
            step.attributes.clone(),
            attributes.clone(),
            BTreeMap::new(),
        )
        .with_dependencies(step.resource_dependencies.clone())
        .with_hash(step.declaration_hash.clone().unwrap_or_default());

        let (commit, prior_outputs) = match (step.action, current) {
            (ActionType::Update, Some(prior)) => (
                Commit::Update {
                    prior: prior.clone(),
                    base,
                },
                Some(prior.outputs.clone()),
            ),
            (ActionType::Replace(ReplacePhase::Create), Some(prior))
                if step.strategy != Some(ReplaceStrategy::DestroyBeforeCreate) =>
            {
                (
                    Commit::Supersede {
                        prior: prior.clone(),
                        base,
                    },
                    None,
                )
            }
            _ => (Commit::Fresh(base), None),
        };

        Ok(Some(Work {
            index: step.index,
            request: ProviderRequest {
                operation,
                resource: step.resource.clone(),
                attributes,
                prior_outputs,
            },
            commit,
        }))
    }

    fn release(
        index: usize,
        dependents: &[Vec<usize>],
        waiting: &mut [usize],
        ready: &mut BTreeSet<usize>,
    ) {
        for &next in &dependents[index] {
            waiting[next] -= 1;
            if waiting[next] == 0 {
                ready.insert(next);
            }
        }
    }

    /// Marks every pending transitive dependent of `failed` as skipped.
    fn skip_dependents(
        plan: &Plan,
        failed: usize,
        dependents: &[Vec<usize>],
        status: &mut [StepStatus],
    ) {
        let cause = plan.steps[failed].description();
        let mut queue: VecDeque<usize> = dependents[failed].iter().copied().collect();
        while let Some(index) = queue.pop_front() {
            if status[index] != StepStatus::Pending {
                continue;
            }
            warn!("Skipping step {index}: depends on failed step {failed}");
            status[index] = StepStatus::Skipped {
                reason: format!("depends on failed step {failed} ({cause})"),
            };
            queue.extend(dependents[index].iter().copied());
        }
    }
}

/// Substitutes every reference with the referenced resource's output.
fn resolve(
    step: &PlanStep,
    records: &HashMap<ResourceId, StateRecord>,
) -> std::result::Result<BTreeMap<String, serde_json::Value>, String> {
    step.attributes
        .iter()
        .map(|(name, value)| {
            let resolved = match value {
                AttrValue::Literal(v) => v.clone(),
                AttrValue::Reference(reference) => records
                    .get(&reference.target)
                    .and_then(|record| record.output(&reference.attribute))
                    .cloned()
                    .ok_or_else(|| {
                        format!(
                            "attribute {name} references {reference}, which has no such output"
                        )
                    })?,
            };
            Ok((name.clone(), resolved))
        })
        .collect()
}

/// Calls the provider with retries, then commits the result.
async fn run_step(
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    classifier: Arc<dyn ErrorClassifier>,
    options: ExecutionOptions,
    work: Work,
) -> Outcome {
    let resource = work.request.resource.clone();
    let mut attempt = 0u32;

    let outputs = loop {
        attempt += 1;
        match provider.apply(&work.request).await {
            Ok(outputs) => break outputs,
            Err(failure) => {
                let error = match classifier.classify(&failure) {
                    ErrorClass::Permanent => ProviderError::Permanent {
                        resource,
                        message: failure.to_string(),
                    },
                    ErrorClass::Transient if attempt > options.max_retries => {
                        ProviderError::Transient {
                            resource,
                            message: failure.to_string(),
                            attempts: attempt,
                        }
                    }
                    ErrorClass::Transient => {
                        let delay = options
                            .backoff(attempt)
                            .max(failure.retry_after.unwrap_or_default());
                        warn!(
                            "Step {} attempt {attempt} failed ({failure}); retrying in {delay:?}",
                            work.index
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                };
                if error.is_transient() {
                    warn!("Step {} gave up: {error}", work.index);
                } else {
                    warn!("Step {} failed: {error}", work.index);
                }
                return Outcome::Failed {
                    error: error.to_string(),
                    attempts: attempt,
                };
            }
        }
    };

    let record = match work.commit {
        Commit::Fresh(base) => Some(StateRecord { outputs, ..base }),
        Commit::Update { prior, base } => Some(prior.updated(StateRecord { outputs, ..base })),
        Commit::Supersede { prior, base } => {
            Some(prior.superseded_by(StateRecord { outputs, ..base }))
        }
        Commit::ClearDeposed(record) => Some(record),
        Commit::Remove => None,
    };

    let written = match &record {
        Some(record) => store.commit(&resource, record).await,
        None => store.remove(&resource).await,
    };

    match written {
        Ok(()) => Outcome::Committed {
            record,
            attempts: attempt,
        },
        Err(e) => {
            error!("{resource} was applied but its state could not be written: {e}");
            Outcome::Failed {
                error: e.to_string(),
                attempts: attempt,
            }
        }
    }
}

impl ApplyReport {
    /// Builds the report of a dry run: every step as if it succeeded.
    #[must_use]
    pub fn planned(plan: &Plan) -> Self {
        let mut report = Self {
            dry_run: true,
            ..Self::default()
        };
        for step in &plan.steps {
            report.record_success(step);
        }
        report
    }

    fn from_statuses(plan: &Plan, status: &[StepStatus], attempts: &[u32], cancelled: bool) -> Self {
        let mut report = Self {
            cancelled,
            ..Self::default()
        };

        for (step, state) in plan.steps.iter().zip(status) {
            match state {
                StepStatus::Done => report.record_success(step),
                StepStatus::Failed { error, attempts: n } => report.failed.push(FailedStep {
                    resource: step.resource.clone(),
                    action: step.action,
                    error: error.clone(),
                    attempts: (*n).max(attempts[step.index]),
                }),
                StepStatus::Skipped { reason } => report.skipped.push(SkippedStep {
                    resource: step.resource.clone(),
                    action: step.action,
                    reason: reason.clone(),
                }),
                StepStatus::Pending | StepStatus::Running => report.skipped.push(SkippedStep {
                    resource: step.resource.clone(),
                    action: step.action,
                    reason: String::from("not started"),
                }),
            }
        }

        report
    }

    fn record_success(&mut self, step: &PlanStep) {
        let id = step.resource.clone();
        match step.action {
            ActionType::Create => self.created.push(id),
            ActionType::Update => self.updated.push(id),
            ActionType::Replace(ReplacePhase::Create) => self.replaced.push(id),
            ActionType::Replace(ReplacePhase::Destroy) => {}
            ActionType::Delete => self.deleted.push(id),
        }
    }

    /// Returns true if every step ran and succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && !self.cancelled
    }

    /// Number of resources changed.
    #[must_use]
    pub fn total_changes(&self) -> usize {
        self.created.len() + self.updated.len() + self.replaced.len() + self.deleted.len()
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.dry_run { "Dry run: " } else { "" };
        write!(
            f,
            "{prefix}{} created, {} updated, {} replaced, {} deleted, {} failed, {} skipped",
            self.created.len(),
            self.updated.len(),
            self.replaced.len(),
            self.deleted.len(),
            self.failed.len(),
            self.skipped.len()
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}
