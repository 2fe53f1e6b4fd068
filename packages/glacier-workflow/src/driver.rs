use crate::config::{ConfigError, ConfigResult, TaskConfig, WorkflowConfig};
use crate::engine::{variant_label, ExecutionEngine, RunPolicy};
use crate::entity::{Entity, EntityFilter, EntityHandle};
use crate::error::{Result, WorkflowError};
use crate::init::{DirectoryInitializer, InitOptions, LocalDirectoryInitializer};
use crate::plan::{PipelinePlan, StageKind, StageSpec};
use crate::report::{BatchReport, PipelineReport, StageRecord};
use crate::task::{EntityTask, TaskRef, TaskRegistry};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

/// Run report file name inside the working directory
pub const REPORT_FILE: &str = "workflow_report.json";

/// Run-level settings of a driver
#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    pub policy: RunPolicy,
    pub init: InitOptions,
    pub filter: EntityFilter,
    pub run_flags: BTreeMap<String, bool>,
    /// Suffixes for per-variant stages, processed in this order
    pub variants: Vec<String>,
    pub strict_stages: bool,
    pub report_path: Option<PathBuf>,
}

impl DriverOptions {
    pub fn from_config(config: &WorkflowConfig) -> ConfigResult<Self> {
        Ok(Self {
            policy: config.execution.run_policy(),
            init: config.init,
            filter: config.entities.filter(),
            run_flags: config.run_flags.clone(),
            variants: config.variants()?,
            strict_stages: config.execution.strict_stages,
            report_path: Some(config.paths.working_dir.join(REPORT_FILE)),
        })
    }
}

/// Runs a validated plan over a selection of entities
pub struct PipelineDriver {
    plan: PipelinePlan,
    engine: ExecutionEngine,
    initializer: Box<dyn DirectoryInitializer>,
    options: DriverOptions,
}

impl PipelineDriver {
    pub fn new(
        plan: PipelinePlan,
        engine: ExecutionEngine,
        initializer: Box<dyn DirectoryInitializer>,
        options: DriverOptions,
    ) -> Self {
        Self {
            plan,
            engine,
            initializer,
            options,
        }
    }

    /// Bind the configured stages to `registry` and build the worker pool
    pub fn from_config(config: &WorkflowConfig, registry: &TaskRegistry) -> Result<Self> {
        let plan = PipelinePlan::new(config.stages.clone(), registry)?;
        let engine = ExecutionEngine::new(config.execution.num_workers)?
            .with_taint_scope(config.execution.taint_scope);
        let initializer = LocalDirectoryInitializer::new(&config.paths.working_dir)
            .with_parallel(config.execution.use_multiprocessing);
        let options = DriverOptions::from_config(config)?;

        Ok(Self::new(plan, engine, Box::new(initializer), options))
    }

    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut DriverOptions {
        &mut self.options
    }

    /// Execute every enabled stage, in plan order, over the selected entities.
    ///
    /// Configuration problems are reported before any directory is touched.
    /// A batch abort or a failed global task ends the run with an error;
    /// isolated per-entity failures only show up in the returned report.
    pub fn run(&self, entities: Vec<Entity>, config: &TaskConfig) -> Result<PipelineReport> {
        let start = Instant::now();
        let flags = &self.options.run_flags;

        info!("Execution plan:\n{}", self.plan.execution_plan(flags));
        self.plan
            .check_prerequisites(flags, self.options.strict_stages)?;
        self.check_variants()?;

        let selected = self.options.filter.apply(entities);
        if selected.is_empty() {
            return Err(WorkflowError::EmptySelection(
                "no entities left after region filtering and selection".to_string(),
            ));
        }
        info!("Number of glaciers: {}", selected.len());

        let (initializer, init) = (&self.initializer, self.options.init);
        let handles = self
            .engine
            .install(|| initializer.initialize(&selected, init))?;
        self.engine.ledger().clear();

        let mut report =
            PipelineReport::new(handles.iter().map(|h| h.id().to_string()).collect());

        for node in self.plan.stages() {
            let spec = &node.spec;
            if !spec.is_enabled(flags) {
                info!("Stage '{}' disabled, skipping", spec.name);
                report.push(StageRecord::Disabled {
                    stage: spec.name.clone(),
                    group: spec.group.clone(),
                });
                continue;
            }

            let record = match &node.task {
                TaskRef::Global(task) => StageRecord::Global {
                    stage: spec.name.clone(),
                    report: self
                        .engine
                        .run_global(&spec.name, task.as_ref(), &handles, config)?,
                },
                TaskRef::Entity(task) if spec.kind == StageKind::Variants => {
                    let mut reports = Vec::with_capacity(self.options.variants.len());
                    for variant in &self.options.variants {
                        let variant_config = config.with_variant(variant.as_str());
                        reports.push(self.run_batch(
                            spec,
                            task.as_ref(),
                            &handles,
                            &variant_config,
                        )?);
                    }
                    StageRecord::Variants {
                        stage: spec.name.clone(),
                        reports,
                    }
                }
                TaskRef::Entity(task) => StageRecord::Entity {
                    stage: spec.name.clone(),
                    report: self.run_batch(spec, task.as_ref(), &handles, config)?,
                },
            };
            report.push(record);
        }

        report.finish(self.engine.ledger().snapshot());
        info!(
            "Pipeline finished in {}ms: {} stages, {} failed invocations, {} tainted glaciers",
            start.elapsed().as_millis(),
            report.stages.len(),
            report.total_failed(),
            report.tainted.len()
        );

        if let Some(path) = &self.options.report_path {
            report.write_json(path)?;
        }
        Ok(report)
    }

    fn check_variants(&self) -> Result<()> {
        if !self.options.variants.is_empty() {
            return Ok(());
        }
        let needs_variants = self.plan.stages().iter().find(|n| {
            n.spec.kind == StageKind::Variants && n.spec.is_enabled(&self.options.run_flags)
        });
        match needs_variants {
            Some(node) => Err(ConfigError::Variants(format!(
                "stage '{}' runs per variant but no variants are configured",
                node.spec.name
            ))
            .into()),
            None => Ok(()),
        }
    }

    fn run_batch(
        &self,
        spec: &StageSpec,
        task: &dyn EntityTask,
        handles: &[EntityHandle],
        config: &TaskConfig,
    ) -> Result<BatchReport> {
        let policy = spec.policy(self.options.policy);
        let batch = self.engine.run(&spec.name, task, handles, config, policy)?;

        let summary = batch.summary();
        info!("Stage summary: {}", summary);
        for failure in &summary.failures {
            warn!(
                "  {}{} failed: {}",
                failure.entity_id,
                variant_label(failure.variant.as_deref()),
                failure.error
            );
        }
        Ok(batch)
    }
}
