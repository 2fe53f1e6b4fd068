//! Entity task execution engine
//!
//! Applies one task to every entity of a collection:
//! - parallel mode: rayon pool with a fixed number of workers
//! - sequential mode: strictly one entity at a time, in collection order
//! - failure isolation: with `continue_on_error` a failing entity is
//!   recorded and tainted while the rest of the batch proceeds; without it
//!   the first failure cancels all entities not yet started
//! - panics inside a task are caught and reported as that entity's failure

use crate::config::TaskConfig;
use crate::entity::EntityHandle;
use crate::error::{Result, TaskFailure, WorkflowError};
use crate::report::{BatchReport, EntityOutcome, GlobalReport, Outcome};
use crate::task::{EntityTask, GlobalTask, TaskError, TaskResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Concurrency mode and error policy for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPolicy {
    pub parallel: bool,
    pub continue_on_error: bool,
}

impl RunPolicy {
    pub fn parallel() -> Self {
        Self {
            parallel: true,
            continue_on_error: false,
        }
    }

    pub fn sequential() -> Self {
        Self {
            parallel: false,
            continue_on_error: false,
        }
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self::parallel()
    }
}

/// How long a failure keeps an entity out of the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintScope {
    /// Tainted entities are skipped by every later stage of the run
    #[default]
    Run,
    /// Failures are only recorded; later stages attempt the entity again
    Stage,
}

/// Why an entity was tainted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintRecord {
    pub stage: String,
    pub variant: Option<String>,
    pub reason: String,
}

impl std::fmt::Display for TaintRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage '{}'", self.stage)?;
        if let Some(variant) = &self.variant {
            write!(f, " (variant {})", variant)?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// Tainted entities of the current run, shared by all pool workers.
///
/// Besides run-scoped taints, the ledger remembers which entities failed
/// their most recent invocation. Global tasks leave those out under either
/// taint scope.
#[derive(Debug, Default)]
pub struct TaintLedger {
    entries: DashMap<String, TaintRecord>,
    last_failed: DashMap<String, TaintRecord>,
}

impl TaintLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the first taint of an entity
    pub fn mark(&self, entity_id: &str, record: TaintRecord) {
        self.entries.entry(entity_id.to_string()).or_insert(record);
    }

    /// Remember that the latest invocation of `entity_id` failed
    pub fn record_failure(&self, entity_id: &str, record: TaintRecord) {
        self.last_failed.insert(entity_id.to_string(), record);
    }

    pub fn record_success(&self, entity_id: &str) {
        self.last_failed.remove(entity_id);
    }

    pub fn failed_last(&self, entity_id: &str) -> bool {
        self.last_failed.contains_key(entity_id)
    }

    /// Entities a global task must not see
    pub fn excludes(&self, entity_id: &str) -> bool {
        self.is_tainted(entity_id) || self.failed_last(entity_id)
    }

    pub fn get(&self, entity_id: &str) -> Option<TaintRecord> {
        self.entries.get(entity_id).map(|r| r.value().clone())
    }

    pub fn is_tainted(&self, entity_id: &str) -> bool {
        self.entries.contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.last_failed.clear();
    }

    pub fn snapshot(&self) -> BTreeMap<String, TaintRecord> {
        self.entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }
}

/// Per-batch abort state
struct AbortSignal {
    raised: AtomicBool,
    first_failure: Mutex<Option<TaskFailure>>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            first_failure: Mutex::new(None),
        }
    }

    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    fn raise(&self, failure: TaskFailure) {
        let mut slot = self.first_failure.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
        self.raised.store(true, Ordering::Release);
    }

    fn into_failure(self) -> Option<TaskFailure> {
        self.first_failure.into_inner()
    }
}

/// Fans tasks out over entity collections
pub struct ExecutionEngine {
    pool: rayon::ThreadPool,
    workers: usize,
    taint_scope: TaintScope,
    ledger: TaintLedger,
}

impl ExecutionEngine {
    /// Build the worker pool (`num_workers == 0` uses every hardware thread)
    pub fn new(num_workers: usize) -> Result<Self> {
        let workers = if num_workers == 0 {
            num_cpus::get()
        } else {
            num_workers
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("glacier-worker-{}", i))
            .build()?;

        info!("Worker pool: {} threads", workers);

        Ok(Self {
            pool,
            workers,
            taint_scope: TaintScope::default(),
            ledger: TaintLedger::new(),
        })
    }

    pub fn with_taint_scope(mut self, scope: TaintScope) -> Self {
        self.taint_scope = scope;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn taint_scope(&self) -> TaintScope {
        self.taint_scope
    }

    pub fn ledger(&self) -> &TaintLedger {
        &self.ledger
    }

    /// Run `op` inside the worker pool, so nested rayon work uses its threads
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Run `task` once for every entity in `handles`.
    ///
    /// Returns `BatchAbort` when `continue_on_error` is off and any entity
    /// fails; no report is produced for that batch.
    pub fn run(
        &self,
        stage: &str,
        task: &dyn EntityTask,
        handles: &[EntityHandle],
        config: &TaskConfig,
        policy: RunPolicy,
    ) -> Result<BatchReport> {
        if handles.is_empty() {
            return Err(WorkflowError::EmptySelection(format!(
                "stage '{}' received no entities",
                stage
            )));
        }

        let variant = config.variant().map(str::to_string);
        let start = Instant::now();
        info!(
            "Stage '{}'{}: running task '{}' on {} entities ({})",
            stage,
            variant_label(variant.as_deref()),
            task.name(),
            handles.len(),
            if policy.parallel {
                "parallel"
            } else {
                "sequential"
            }
        );

        let abort = AbortSignal::new();
        let process = |handle: &EntityHandle| {
            self.process_one(stage, task, handle, config, policy, &abort)
        };

        let outcomes: Vec<Option<EntityOutcome>> = if policy.parallel {
            self.pool
                .install(|| handles.par_iter().map(process).collect())
        } else {
            let mut outcomes = Vec::with_capacity(handles.len());
            for handle in handles {
                outcomes.push(process(handle));
                if abort.is_raised() {
                    break;
                }
            }
            outcomes
        };

        if let Some(failure) = abort.into_failure() {
            let completed = outcomes.iter().filter(|o| o.is_some()).count();
            let cancelled = handles.len() - completed;
            error!(
                "Stage '{}'{} aborted: {} ({} entities not started)",
                stage,
                variant_label(variant.as_deref()),
                failure,
                cancelled
            );
            return Err(WorkflowError::BatchAbort {
                stage: stage.to_string(),
                variant,
                failure: Box::new(failure),
                completed,
                cancelled,
            });
        }

        Ok(BatchReport::new(
            stage,
            task.name(),
            variant,
            outcomes.into_iter().flatten().collect(),
            start.elapsed().as_millis() as u64,
        ))
    }

    /// `None` when the batch was aborted before this entity started
    fn process_one(
        &self,
        stage: &str,
        task: &dyn EntityTask,
        handle: &EntityHandle,
        config: &TaskConfig,
        policy: RunPolicy,
        abort: &AbortSignal,
    ) -> Option<EntityOutcome> {
        if abort.is_raised() {
            return None;
        }

        let entity_id = handle.id();
        if self.taint_scope == TaintScope::Run {
            if let Some(record) = self.ledger.get(entity_id) {
                debug!("{}: skipped in stage '{}' (tainted by {})", entity_id, stage, record);
                return Some(EntityOutcome::new(
                    entity_id,
                    Outcome::Skipped { tainted_by: record },
                    0,
                ));
            }
        }

        let start = Instant::now();
        let result = catch_task_panic(|| task.process(handle, config));
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(output) => {
                debug!("{}: stage '{}' done in {}ms", entity_id, stage, duration_ms);
                self.ledger.record_success(entity_id);
                Outcome::Succeeded { output }
            }
            Err(error) => {
                let variant = config.variant().map(str::to_string);
                if policy.continue_on_error {
                    warn!(
                        "{}: stage '{}'{} failed: {}",
                        entity_id,
                        stage,
                        variant_label(variant.as_deref()),
                        error
                    );
                    let record = TaintRecord {
                        stage: stage.to_string(),
                        variant,
                        reason: error.to_string(),
                    };
                    if self.taint_scope == TaintScope::Run {
                        self.ledger.mark(entity_id, record.clone());
                    }
                    self.ledger.record_failure(entity_id, record);
                } else {
                    abort.raise(TaskFailure::new(entity_id, stage, variant, error.clone()));
                }
                Outcome::Failed { error }
            }
        };

        Some(EntityOutcome::new(entity_id, outcome, duration_ms))
    }

    /// Run a global task once over every untainted entity.
    ///
    /// Entities whose latest invocation failed are left out too, so under
    /// `TaintScope::Stage` one broken entity cannot fail the global task.
    /// A global task failure is fatal: later stages depend on its output
    /// for the whole selection.
    pub fn run_global(
        &self,
        stage: &str,
        task: &dyn GlobalTask,
        handles: &[EntityHandle],
        config: &TaskConfig,
    ) -> Result<GlobalReport> {
        let eligible: Vec<&EntityHandle> = handles
            .iter()
            .filter(|h| !self.ledger.excludes(h.id()))
            .collect();

        if eligible.is_empty() {
            warn!(
                "Stage '{}': no eligible entities left, global task '{}' not run",
                stage,
                task.name()
            );
            return Ok(GlobalReport {
                stage: stage.to_string(),
                task: task.name().to_string(),
                entities: 0,
                output: None,
                duration_ms: 0,
            });
        }

        info!(
            "Stage '{}': running global task '{}' over {} entities",
            stage,
            task.name(),
            eligible.len()
        );

        let start = Instant::now();
        let output = catch_task_panic(|| task.run(&eligible, config)).map_err(|error| {
            error!("Stage '{}': global task '{}' failed: {}", stage, task.name(), error);
            WorkflowError::GlobalTaskFailed {
                stage: stage.to_string(),
                task: task.name().to_string(),
                error,
            }
        })?;

        Ok(GlobalReport {
            stage: stage.to_string(),
            task: task.name().to_string(),
            entities: eligible.len(),
            output: Some(output),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn catch_task_panic<T>(f: impl FnOnce() -> TaskResult<T>) -> TaskResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked".to_string());
        Err(TaskError::panic(message))
    })
}

pub(crate) fn variant_label(variant: Option<&str>) -> String {
    variant
        .map(|v| format!(" [variant {}]", v))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::task::{TaskErrorKind, TaskOutput};
    use std::sync::atomic::AtomicUsize;

    struct FailOn {
        ids: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl FailOn {
        fn new(ids: Vec<&'static str>) -> Self {
            Self {
                ids,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl EntityTask for FailOn {
        fn name(&self) -> &'static str {
            "fail_on"
        }

        fn process(&self, handle: &EntityHandle, _config: &TaskConfig) -> TaskResult<TaskOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ids.contains(&handle.id()) {
                return Err(TaskError::computation(format!("{} diverged", handle.id())));
            }
            Ok(TaskOutput::new().with_items(1))
        }
    }

    struct Panicking;

    impl EntityTask for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn process(&self, _handle: &EntityHandle, _config: &TaskConfig) -> TaskResult<TaskOutput> {
            panic!("index out of bounds");
        }
    }

    fn handles(n: usize) -> Vec<EntityHandle> {
        (0..n)
            .map(|i| {
                let id = format!("g{}", i);
                EntityHandle::new(Entity::new(&id), std::env::temp_dir().join(&id))
            })
            .collect()
    }

    #[test]
    fn test_engine_worker_count() {
        let engine = ExecutionEngine::new(2).unwrap();
        assert_eq!(engine.workers(), 2);
        assert!(ExecutionEngine::new(0).unwrap().workers() >= 1);
    }

    #[test]
    fn test_install_runs_on_worker_threads() {
        let engine = ExecutionEngine::new(2).unwrap();
        let name = engine.install(|| std::thread::current().name().map(str::to_string));
        assert!(name.unwrap().starts_with("glacier-worker-"));
    }

    #[test]
    fn test_empty_collection_rejected() {
        let engine = ExecutionEngine::new(1).unwrap();
        let task = FailOn::new(vec![]);
        let result = engine.run("s", &task, &[], &TaskConfig::default(), RunPolicy::sequential());
        assert!(matches!(result, Err(WorkflowError::EmptySelection(_))));
    }

    #[test]
    fn test_sequential_abort_stops_at_first_failure() {
        let engine = ExecutionEngine::new(1).unwrap();
        let task = FailOn::new(vec!["g2"]);

        let err = engine
            .run("s", &task, &handles(6), &TaskConfig::default(), RunPolicy::sequential())
            .unwrap_err();

        match err {
            WorkflowError::BatchAbort {
                failure,
                completed,
                cancelled,
                ..
            } => {
                assert_eq!(failure.entity_id, "g2");
                assert_eq!(completed, 3);
                assert_eq!(cancelled, 3);
            }
            other => panic!("Expected BatchAbort, got {}", other),
        }
        assert_eq!(task.calls.load(Ordering::SeqCst), 3);
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn test_continue_on_error_taints_and_skips_later() {
        let engine = ExecutionEngine::new(2).unwrap();
        let policy = RunPolicy::parallel().continue_on_error(true);
        let handles = handles(4);

        let first = engine
            .run("s1", &FailOn::new(vec!["g1"]), &handles, &TaskConfig::default(), policy)
            .unwrap();
        assert_eq!(first.succeeded(), 3);
        assert_eq!(first.failed(), 1);
        assert!(engine.ledger().is_tainted("g1"));

        let second_task = FailOn::new(vec![]);
        let second = engine
            .run("s2", &second_task, &handles, &TaskConfig::default(), policy)
            .unwrap();
        assert_eq!(second.succeeded(), 3);
        assert_eq!(second.skipped(), 1);
        assert_eq!(second_task.calls.load(Ordering::SeqCst), 3);

        match second.outcome("g1") {
            Some(Outcome::Skipped { tainted_by }) => assert_eq!(tainted_by.stage, "s1"),
            other => panic!("Expected Skipped, got {:?}", other),
        }
    }

    #[test]
    fn test_stage_scope_retries_failed_entities() {
        let engine = ExecutionEngine::new(2)
            .unwrap()
            .with_taint_scope(TaintScope::Stage);
        let policy = RunPolicy::sequential().continue_on_error(true);
        let handles = handles(3);

        engine
            .run("s1", &FailOn::new(vec!["g0"]), &handles, &TaskConfig::default(), policy)
            .unwrap();
        assert!(engine.ledger().is_empty());

        let second = engine
            .run("s2", &FailOn::new(vec![]), &handles, &TaskConfig::default(), policy)
            .unwrap();
        assert_eq!(second.succeeded(), 3);
        assert_eq!(second.skipped(), 0);
    }

    #[test]
    fn test_panic_is_isolated() {
        let engine = ExecutionEngine::new(2).unwrap();
        let report = engine
            .run(
                "s",
                &Panicking,
                &handles(3),
                &TaskConfig::default(),
                RunPolicy::parallel().continue_on_error(true),
            )
            .unwrap();

        assert_eq!(report.failed(), 3);
        let (_, error) = report.failures().next().unwrap();
        assert_eq!(error.kind, TaskErrorKind::Panic);
        assert!(error.message.contains("index out of bounds"));
    }

    #[test]
    fn test_variant_recorded_in_report_and_taint() {
        let engine = ExecutionEngine::new(1).unwrap();
        let config = TaskConfig::default().with_variant("007");
        let report = engine
            .run(
                "past",
                &FailOn::new(vec!["g0"]),
                &handles(2),
                &config,
                RunPolicy::sequential().continue_on_error(true),
            )
            .unwrap();

        assert_eq!(report.variant.as_deref(), Some("007"));
        assert_eq!(
            engine.ledger().get("g0").unwrap().variant.as_deref(),
            Some("007")
        );
    }

    struct CountGlobal;

    impl GlobalTask for CountGlobal {
        fn name(&self) -> &'static str {
            "count_global"
        }

        fn run(&self, handles: &[&EntityHandle], _config: &TaskConfig) -> TaskResult<TaskOutput> {
            Ok(TaskOutput::new().with_items(handles.len()))
        }
    }

    #[test]
    fn test_global_task_excludes_tainted() {
        let engine = ExecutionEngine::new(1).unwrap();
        engine.ledger().mark(
            "g1",
            TaintRecord {
                stage: "s0".to_string(),
                variant: None,
                reason: "broken".to_string(),
            },
        );

        let report = engine
            .run_global("ref", &CountGlobal, &handles(3), &TaskConfig::default())
            .unwrap();
        assert_eq!(report.entities, 2);
        assert_eq!(report.output.unwrap().items_processed, 2);
    }

    #[test]
    fn test_global_task_excludes_last_failures_under_stage_scope() {
        let engine = ExecutionEngine::new(2)
            .unwrap()
            .with_taint_scope(TaintScope::Stage);
        let policy = RunPolicy::parallel().continue_on_error(true);
        let handles = handles(4);

        engine
            .run("s1", &FailOn::new(vec!["g2"]), &handles, &TaskConfig::default(), policy)
            .unwrap();
        assert!(engine.ledger().is_empty());
        assert!(engine.ledger().failed_last("g2"));

        let report = engine
            .run_global("ref", &CountGlobal, &handles, &TaskConfig::default())
            .unwrap();
        assert_eq!(report.entities, 3);

        // A later success makes the entity eligible again
        engine
            .run("s2", &FailOn::new(vec![]), &handles, &TaskConfig::default(), policy)
            .unwrap();
        assert!(!engine.ledger().failed_last("g2"));
        let report = engine
            .run_global("ref", &CountGlobal, &handles, &TaskConfig::default())
            .unwrap();
        assert_eq!(report.entities, 4);
    }

    #[test]
    fn test_ledger_keeps_first_taint() {
        let ledger = TaintLedger::new();
        let record = |stage: &str| TaintRecord {
            stage: stage.to_string(),
            variant: None,
            reason: "x".to_string(),
        };
        ledger.mark("g", record("first"));
        ledger.mark("g", record("second"));

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get("g").unwrap().stage, "first");
        assert_eq!(ledger.snapshot().len(), 1);

        ledger.record_failure("h", record("third"));
        assert!(ledger.excludes("h"));
        assert!(!ledger.is_tainted("h"));
        ledger.clear();
        assert!(!ledger.excludes("g") && !ledger.excludes("h"));
    }
}
