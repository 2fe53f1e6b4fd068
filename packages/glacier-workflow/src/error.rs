use crate::config::ConfigError;
use crate::task::{TaskError, TaskKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// One entity's failed invocation of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub entity_id: String,
    pub stage: String,
    pub variant: Option<String>,
    pub error: TaskError,
}

impl TaskFailure {
    pub fn new(
        entity_id: impl Into<String>,
        stage: impl Into<String>,
        variant: Option<String>,
        error: TaskError,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            stage: stage.into(),
            variant,
            error,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} in stage '{}'", self.entity_id, self.stage)?;
        if let Some(variant) = &self.variant {
            write!(f, " (variant {})", variant)?;
        }
        write!(f, ": {}", self.error)
    }
}

impl std::error::Error for TaskFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Batch aborted in stage '{stage}': {failure} ({completed} entities finished, {cancelled} not started)")]
    BatchAbort {
        stage: String,
        variant: Option<String>,
        failure: Box<TaskFailure>,
        completed: usize,
        cancelled: usize,
    },

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Global task '{task}' failed in stage '{stage}': {error}")]
    GlobalTaskFailed {
        stage: String,
        task: String,
        error: TaskError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Duplicate stage: {0}")]
    DuplicateStage(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Stage '{stage}' is declared before its prerequisite '{dependency}'")]
    StageOrder { stage: String, dependency: String },

    #[error("Unknown task '{name}'. {suggestion}")]
    UnknownTask { name: String, suggestion: String },

    #[error("Task '{task}' is a {found} task, stage '{stage}' needs a {expected} task")]
    TaskKindMismatch {
        stage: String,
        task: String,
        expected: TaskKind,
        found: TaskKind,
    },

    #[error("Duplicate task registration: {0}")]
    DuplicateTask(String),

    #[error("Empty selection: {0}")]
    EmptySelection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl WorkflowError {
    /// Fatal errors halt the pipeline before any stage runs
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            WorkflowError::Config(_)
                | WorkflowError::DuplicateStage(_)
                | WorkflowError::MissingDependency(_)
                | WorkflowError::StageOrder { .. }
                | WorkflowError::UnknownTask { .. }
                | WorkflowError::TaskKindMismatch { .. }
                | WorkflowError::DuplicateTask(_)
        )
    }
}
