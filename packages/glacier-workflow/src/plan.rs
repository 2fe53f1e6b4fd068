//! Pipeline plan
//!
//! Ordered stage list with declared prerequisites. Stages run in declared
//! order; a prerequisite must be declared earlier than the stage needing it,
//! which also rules out cycles.

use crate::config::ConfigError;
use crate::engine::RunPolicy;
use crate::error::{Result, WorkflowError};
use crate::task::{TaskKind, TaskRef, TaskRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// How a stage is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// One invocation over the whole selection
    Global,
    /// Fan-out over the selection
    Entity,
    /// Fan-out over the selection once per variant, variants in order
    Variants,
}

impl StageKind {
    pub fn task_kind(self) -> TaskKind {
        match self {
            StageKind::Global => TaskKind::Global,
            StageKind::Entity | StageKind::Variants => TaskKind::Entity,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageKind::Global => "global",
            StageKind::Entity => "entity",
            StageKind::Variants => "variants",
        };
        f.write_str(s)
    }
}

fn default_enabled() -> bool {
    true
}

/// Declared stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub name: String,

    /// Registered task name
    pub task: String,

    pub kind: StageKind,

    /// Stages that must have run before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,

    /// Run-flag group toggling this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Overrides the run's error policy for this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,

    /// Overrides the run's concurrency mode for this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
}

impl StageSpec {
    fn new(name: impl Into<String>, task: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            kind,
            after: Vec::new(),
            group: None,
            enabled: true,
            continue_on_error: None,
            parallel: None,
        }
    }

    pub fn entity(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self::new(name, task, StageKind::Entity)
    }

    pub fn global(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self::new(name, task, StageKind::Global)
    }

    pub fn variants(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self::new(name, task, StageKind::Variants)
    }

    pub fn after<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after.extend(stages.into_iter().map(Into::into));
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = Some(continue_on_error);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = Some(parallel);
        self
    }

    /// Enabled by its own flag and by its group's run flag (missing = on)
    pub fn is_enabled(&self, run_flags: &BTreeMap<String, bool>) -> bool {
        self.enabled
            && self
                .group
                .as_ref()
                .and_then(|g| run_flags.get(g))
                .copied()
                .unwrap_or(true)
    }

    /// Run policy with this stage's overrides applied
    pub fn policy(&self, base: RunPolicy) -> RunPolicy {
        RunPolicy {
            parallel: self.parallel.unwrap_or(base.parallel),
            continue_on_error: self.continue_on_error.unwrap_or(base.continue_on_error),
        }
    }
}

/// Stage bound to its registered task
#[derive(Debug, Clone)]
pub struct StageNode {
    pub spec: StageSpec,
    pub task: TaskRef,
}

/// Validated, ordered stage list
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    stages: Vec<StageNode>,
}

impl PipelinePlan {
    /// Validate the declared stages and bind each one to its task.
    ///
    /// Rejects duplicate stage names, unknown prerequisites, prerequisites
    /// declared after the stage needing them, unknown tasks and tasks of
    /// the wrong kind.
    pub fn new(specs: Vec<StageSpec>, registry: &TaskRegistry) -> Result<Self> {
        let mut position: HashMap<&str, usize> = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if position.insert(spec.name.as_str(), i).is_some() {
                return Err(WorkflowError::DuplicateStage(spec.name.clone()));
            }
        }

        for (i, spec) in specs.iter().enumerate() {
            for dep in &spec.after {
                match position.get(dep.as_str()) {
                    None => {
                        return Err(WorkflowError::MissingDependency(format!(
                            "Stage '{}' depends on non-existent stage '{}'",
                            spec.name, dep
                        )))
                    }
                    Some(&j) if j >= i => {
                        return Err(WorkflowError::StageOrder {
                            stage: spec.name.clone(),
                            dependency: dep.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        let stages = specs
            .into_iter()
            .map(|spec| -> Result<StageNode> {
                let task = registry.resolve(&spec.name, &spec.task, spec.kind.task_kind())?;
                Ok(StageNode { spec, task })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageNode] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&StageNode> {
        self.stages.iter().find(|s| s.spec.name == name)
    }

    /// Declared run-flag groups
    pub fn groups(&self) -> BTreeSet<&str> {
        self.stages
            .iter()
            .filter_map(|s| s.spec.group.as_deref())
            .collect()
    }

    /// Enabled stages whose prerequisites are disabled.
    ///
    /// Logged as warnings; with `strict` the first one is an error.
    pub fn check_prerequisites(
        &self,
        run_flags: &BTreeMap<String, bool>,
        strict: bool,
    ) -> Result<Vec<(String, String)>> {
        let mut disabled = Vec::new();
        for node in self.stages.iter().filter(|s| s.spec.is_enabled(run_flags)) {
            for dep in &node.spec.after {
                let dep_enabled = self
                    .get(dep)
                    .map(|d| d.spec.is_enabled(run_flags))
                    .unwrap_or(false);
                if dep_enabled {
                    continue;
                }
                if strict {
                    return Err(ConfigError::DisabledPrerequisite {
                        stage: node.spec.name.clone(),
                        prerequisite: dep.clone(),
                        hint: "enable its run flag or disable this stage".to_string(),
                    }
                    .into());
                }
                warn!(
                    "Stage '{}' is enabled but its prerequisite '{}' is disabled; it will rely on existing outputs",
                    node.spec.name, dep
                );
                disabled.push((node.spec.name.clone(), dep.clone()));
            }
        }
        Ok(disabled)
    }

    /// Execution plan as string (for logging)
    pub fn execution_plan(&self, run_flags: &BTreeMap<String, bool>) -> String {
        self.stages
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let spec = &node.spec;
                let mut line = format!(
                    "Stage {}: {} [{}] task={}",
                    i + 1,
                    spec.name,
                    spec.kind,
                    node.task.name()
                );
                if let Some(group) = &spec.group {
                    line.push_str(&format!(" group={}", group));
                }
                if !spec.after.is_empty() {
                    line.push_str(&format!(" after={}", spec.after.join(",")));
                }
                if !spec.is_enabled(run_flags) {
                    line.push_str(" (disabled)");
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
