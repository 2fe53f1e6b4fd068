use crate::config::{find_closest_match, TaskConfig};
use crate::entity::EntityHandle;
use crate::error::{Result, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// Task error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// An artifact written by an earlier stage is absent
    MissingInput,
    /// Entity data present but unusable
    InvalidInput,
    /// Missing or out-of-range configuration parameter
    InvalidParameter,
    Io,
    Serialization,
    Computation,
    /// The task panicked; caught by the engine
    Panic,
}

impl TaskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::MissingInput => "missing_input",
            TaskErrorKind::InvalidInput => "invalid_input",
            TaskErrorKind::InvalidParameter => "invalid_parameter",
            TaskErrorKind::Io => "io",
            TaskErrorKind::Serialization => "serialization",
            TaskErrorKind::Computation => "computation",
            TaskErrorKind::Panic => "panic",
        }
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error reported by a task
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn missing_input(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::MissingInput, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::InvalidInput, message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::InvalidParameter, message)
    }

    pub fn computation(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Computation, message)
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Panic, message)
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        Self::new(TaskErrorKind::Io, e.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(TaskErrorKind::Serialization, e.to_string())
    }
}

/// What a successful task invocation produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Files written into the entity's working directory
    pub artifacts: Vec<PathBuf>,
    pub items_processed: usize,
}

impl TaskOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, path: PathBuf) -> Self {
        self.artifacts.push(path);
        self
    }

    pub fn with_items(mut self, items: usize) -> Self {
        self.items_processed = items;
        self
    }
}

/// Per-entity task: fanned out over a collection by the engine.
///
/// Implementations must tolerate being re-run from scratch for the same
/// entity and variant, and must never leave a partial artifact that looks
/// complete to a downstream task. `EntityHandle::write_json` writes through
/// a temporary file for that reason.
pub trait EntityTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    fn process(&self, handle: &EntityHandle, config: &TaskConfig) -> TaskResult<TaskOutput>;
}

/// Entity-independent task, invoked once over the whole selection
pub trait GlobalTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    fn run(&self, handles: &[&EntityHandle], config: &TaskConfig) -> TaskResult<TaskOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Entity,
    Global,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Entity => write!(f, "per-entity"),
            TaskKind::Global => write!(f, "global"),
        }
    }
}

/// Registered task
#[derive(Clone)]
pub enum TaskRef {
    Entity(Arc<dyn EntityTask>),
    Global(Arc<dyn GlobalTask>),
}

impl TaskRef {
    pub fn name(&self) -> &'static str {
        match self {
            TaskRef::Entity(t) => t.name(),
            TaskRef::Global(t) => t.name(),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TaskRef::Entity(t) => t.description(),
            TaskRef::Global(t) => t.description(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRef::Entity(_) => TaskKind::Entity,
            TaskRef::Global(_) => TaskKind::Global,
        }
    }
}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRef")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Named task lookup
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskRef>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&mut self, task: Arc<dyn EntityTask>) -> Result<()> {
        self.insert(TaskRef::Entity(task))
    }

    pub fn register_global(&mut self, task: Arc<dyn GlobalTask>) -> Result<()> {
        self.insert(TaskRef::Global(task))
    }

    fn insert(&mut self, task: TaskRef) -> Result<()> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(WorkflowError::DuplicateTask(name));
        }
        self.tasks.insert(name, task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&TaskRef> {
        self.tasks.get(name).ok_or_else(|| {
            let known: Vec<String> = self.tasks.keys().cloned().collect();
            WorkflowError::UnknownTask {
                name: name.to_string(),
                suggestion: find_closest_match(name, &known),
            }
        })
    }

    /// Resolve a task for a stage that needs the given kind
    pub fn resolve(&self, stage: &str, name: &str, expected: TaskKind) -> Result<TaskRef> {
        let task = self.get(name)?;
        if task.kind() != expected {
            return Err(WorkflowError::TaskKindMismatch {
                stage: stage.to_string(),
                task: name.to_string(),
                expected,
                found: task.kind(),
            });
        }
        Ok(task.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRef> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
