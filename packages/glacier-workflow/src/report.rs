//! Batch and pipeline reports

use crate::engine::TaintRecord;
use crate::entity::write_json_atomic;
use crate::error::{Result, TaskFailure};
use crate::task::{TaskError, TaskOutput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Result of one entity in one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { output: TaskOutput },
    Failed { error: TaskError },
    Skipped { tainted_by: TaintRecord },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity_id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub duration_ms: u64,
}

impl EntityOutcome {
    pub fn new(entity_id: impl Into<String>, outcome: Outcome, duration_ms: u64) -> Self {
        Self {
            entity_id: entity_id.into(),
            outcome,
            duration_ms,
        }
    }
}

/// Outcome of applying one task to a whole collection.
///
/// Outcomes are kept in collection order regardless of the order workers
/// finished in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub stage: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub outcomes: Vec<EntityOutcome>,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn new(
        stage: impl Into<String>,
        task: impl Into<String>,
        variant: Option<String>,
        outcomes: Vec<EntityOutcome>,
        duration_ms: u64,
    ) -> Self {
        Self {
            stage: stage.into(),
            task: task.into(),
            variant,
            outcomes,
            duration_ms,
        }
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Entities the task was actually invoked on
    pub fn attempted(&self) -> usize {
        self.succeeded() + self.failed()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped { .. }))
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }

    pub fn outcome(&self, entity_id: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.entity_id == entity_id)
            .map(|o| &o.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &TaskError)> {
        self.outcomes.iter().filter_map(|o| match &o.outcome {
            Outcome::Failed { error } => Some((o.entity_id.as_str(), error)),
            _ => None,
        })
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().map(|o| o.entity_id.as_str())
    }

    pub fn summary(&self) -> StageSummary {
        StageSummary {
            stage: self.stage.clone(),
            variant: self.variant.clone(),
            attempted: self.attempted(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            skipped: self.skipped(),
            failures: self
                .failures()
                .map(|(entity_id, error)| {
                    TaskFailure::new(
                        entity_id,
                        self.stage.clone(),
                        self.variant.clone(),
                        error.clone(),
                    )
                })
                .collect(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Counts and failure reasons logged after every batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub variant: Option<String>,
    /// Entities the task was invoked on (skipped ones excluded)
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<TaskFailure>,
    pub duration_ms: u64,
}

impl std::fmt::Display for StageSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stage)?;
        if let Some(variant) = &self.variant {
            write!(f, " [{}]", variant)?;
        }
        write!(
            f,
            ": {} attempted, {} succeeded, {} failed, {} skipped ({}ms)",
            self.attempted, self.succeeded, self.failed, self.skipped, self.duration_ms
        )
    }
}

/// Result of one global task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalReport {
    pub stage: String,
    pub task: String,
    /// Entities handed to the task (untainted ones only)
    pub entities: usize,
    /// `None` when no entity was eligible and the task was not run
    pub output: Option<TaskOutput>,
    pub duration_ms: u64,
}

/// What happened to one declared stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageRecord {
    Disabled {
        stage: String,
        group: Option<String>,
    },
    Global {
        stage: String,
        report: GlobalReport,
    },
    Entity {
        stage: String,
        report: BatchReport,
    },
    Variants {
        stage: String,
        reports: Vec<BatchReport>,
    },
}

impl StageRecord {
    pub fn stage(&self) -> &str {
        match self {
            StageRecord::Disabled { stage, .. }
            | StageRecord::Global { stage, .. }
            | StageRecord::Entity { stage, .. }
            | StageRecord::Variants { stage, .. } => stage,
        }
    }

    pub fn batches(&self) -> &[BatchReport] {
        match self {
            StageRecord::Entity { report, .. } => std::slice::from_ref(report),
            StageRecord::Variants { reports, .. } => reports,
            _ => &[],
        }
    }
}

/// Everything one pipeline run did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Entities selected and initialized for this run
    pub entities: Vec<String>,
    pub stages: Vec<StageRecord>,
    /// Entities tainted at the end of the run
    pub tainted: BTreeMap<String, TaintRecord>,
}

impl PipelineReport {
    pub fn new(entities: Vec<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            entities,
            stages: Vec::new(),
            tainted: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, record: StageRecord) {
        self.stages.push(record);
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage() == name)
    }

    pub fn batches(&self) -> impl Iterator<Item = &BatchReport> {
        self.stages.iter().flat_map(StageRecord::batches)
    }

    pub fn total_failed(&self) -> usize {
        self.batches().map(BatchReport::failed).sum()
    }

    pub fn finish(&mut self, tainted: BTreeMap<String, TaintRecord>) {
        self.tainted = tainted;
        self.finished_at = Some(Utc::now());
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_json_atomic(path, self)?;
        info!("Run report written to {}", path.display());
        Ok(())
    }
}
