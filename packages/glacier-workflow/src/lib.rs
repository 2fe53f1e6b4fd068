/*
 * Glacier Workflow - Entity Task Orchestration
 *
 * Runs multi-stage processing pipelines over collections of independent
 * glacier directories.
 *
 * Architecture:
 * - Entity handles bound to per-glacier working directories
 * - Typed task registry (per-entity and global tasks)
 * - Execution engine (rayon worker pool, failure isolation, taint ledger)
 * - Pipeline plan (ordered stages with declared prerequisites)
 * - Pipeline driver (selection, initialization, variant fan-out, reports)
 */

// Public modules
pub mod config;
pub mod driver;
pub mod engine;
pub mod entity;
pub mod error;
pub mod init;
pub mod plan;
pub mod report;
pub mod task;
pub mod tasks;

// Re-exports
pub use config::{
    ConfigError, ConfigResult, ExecutionConfig, ParamValue, TaskConfig, VariantSpec,
    WorkflowConfig,
};
pub use driver::{DriverOptions, PipelineDriver};
pub use engine::{ExecutionEngine, RunPolicy, TaintLedger, TaintRecord, TaintScope};
pub use entity::{load_entities, Entity, EntityFilter, EntityHandle, EntitySelection};
pub use error::{Result, TaskFailure, WorkflowError};
pub use init::{DirectoryInitializer, InitOptions, LocalDirectoryInitializer, ENTITY_DESCRIPTOR};
pub use plan::{PipelinePlan, StageKind, StageNode, StageSpec};
pub use report::{
    BatchReport, EntityOutcome, GlobalReport, Outcome, PipelineReport, StageRecord, StageSummary,
};
pub use task::{
    EntityTask, GlobalTask, TaskError, TaskErrorKind, TaskKind, TaskOutput, TaskRef,
    TaskRegistry, TaskResult,
};
