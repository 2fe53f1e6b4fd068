//! End-to-end pipeline runs with the reference tasks
//!
//! Uses the shipped Arctic Canada workflow with the working directory moved
//! into a temporary directory, a short variant list, no allow-list and
//! aborting batches unless a test says otherwise.

use glacier_workflow::tasks::{reference_registry, ModelRun, Outline};
use glacier_workflow::{
    Entity, EntityHandle, PipelineDriver, StageRecord, StageSpec, TaintScope, TaskErrorKind,
    VariantSpec, WorkflowConfig, WorkflowError,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

fn workflow(wd: &Path) -> WorkflowConfig {
    let file = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/arctic_canada.yaml");
    let mut config = WorkflowConfig::from_yaml_file(file).unwrap();
    config.paths.working_dir = wd.to_path_buf();
    config.paths.inputs.clear();
    config.variants = VariantSpec::list(["001", "002"]);
    config.entities.selection = None;
    config.execution.continue_on_error = false;
    config.execution.num_workers = 4;
    config
}

fn glaciers(n: usize) -> Vec<Entity> {
    (0..n)
        .map(|i| {
            Entity::new(format!("RGI50-03.{:05}", i))
                .with_region("03")
                .with_attribute("area_km2", 1.0 + i as f64)
        })
        .collect()
}

fn glacier_dir(wd: &Path, id: &str) -> PathBuf {
    wd.join("per_glacier").join("03").join(id)
}

fn run(config: &WorkflowConfig, entities: Vec<Entity>) -> glacier_workflow::Result<glacier_workflow::PipelineReport> {
    let registry = reference_registry().unwrap();
    PipelineDriver::from_config(config, &registry)?.run(entities, &config.task_config())
}

#[test]
fn shipped_workflow_is_valid() {
    let file = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/arctic_canada.yaml");
    let config = WorkflowConfig::from_yaml_file(file).unwrap();

    assert_eq!(config.variants().unwrap().len(), 13);
    assert_eq!(
        config.variants().unwrap()[0],
        "b.e11.BLMTRC5CN.f19_g16.001.cam.h0"
    );
    assert_eq!(config.stages.len(), 6);
    assert!(config.execution.continue_on_error);
    assert_eq!(config.params["border"].as_f64(), Some(200.0));
    assert_eq!(config.params["dmax"].as_f64(), Some(230.0));

    let entities = glacier_workflow::load_entities(config.entities.file.as_ref().unwrap()).unwrap();
    assert_eq!(entities.len(), 13);
    let selected = config.entities.filter().apply(entities);
    assert_eq!(selected.len(), 8);
    assert!(selected.iter().any(|e| e.id == "RGI50-03.04539"));
    assert!(!selected.iter().any(|e| e.id == "RGI50-03.01987"));
}

#[test]
fn full_pipeline_writes_every_artifact() {
    let wd = tempfile::tempdir().unwrap();
    let config = workflow(wd.path());

    let report = run(&config, glaciers(5)).unwrap();

    assert_eq!(report.entities.len(), 5);
    assert_eq!(report.total_failed(), 0);
    assert!(report.tainted.is_empty());
    assert!(matches!(
        report.stage("compute_ref_stats"),
        Some(StageRecord::Global { report, .. }) if report.entities == 5
    ));

    let dir = glacier_dir(wd.path(), "RGI50-03.00004");
    for file in [
        "entity.json",
        "outline.json",
        "climate_monthly.json",
        "ref_stats.json",
        "inversion_output.json",
        "gcm_data001.json",
        "gcm_data002.json",
        "model_run001.json",
        "model_run002.json",
    ] {
        assert!(dir.join(file).is_file(), "{} missing", file);
    }
    assert!(wd.path().join("workflow_report.json").is_file());
}

#[test]
fn disabled_producer_surfaces_missing_input() {
    let wd = tempfile::tempdir().unwrap();
    let mut config = workflow(wd.path());
    config.run_flags.insert("gis_prepro".to_string(), false);
    config.execution.continue_on_error = true;

    let report = run(&config, glaciers(3)).unwrap();

    assert!(matches!(
        report.stage("glacier_masks"),
        Some(StageRecord::Disabled { .. })
    ));
    let climate = &report.stage("process_climate_data").unwrap().batches()[0];
    assert_eq!(climate.failed(), 3);
    assert!(climate
        .failures()
        .all(|(_, e)| e.kind == TaskErrorKind::MissingInput));

    // Everything downstream is skipped, the global stage sees nobody
    let inversion = &report.stage("volume_inversion").unwrap().batches()[0];
    assert_eq!(inversion.skipped(), 3);
    assert_eq!(report.tainted.len(), 3);
}

#[test]
fn disabled_producer_rejected_in_strict_mode() {
    let wd = tempfile::tempdir().unwrap();
    let mut config = workflow(wd.path());
    config.run_flags.insert("gis_prepro".to_string(), false);
    config.execution.strict_stages = true;

    let err = run(&config, glaciers(3)).unwrap_err();
    assert!(err.is_configuration());
    assert!(!wd.path().join("per_glacier").exists());
}

#[test]
fn rerunning_one_variant_leaves_others_untouched() {
    let wd = tempfile::tempdir().unwrap();
    let config = workflow(wd.path());
    run(&config, glaciers(2)).unwrap();

    let dir = glacier_dir(wd.path(), "RGI50-03.00001");
    let sentinel = r#"{"sentinel": true}"#;
    std::fs::write(dir.join("model_run002.json"), sentinel).unwrap();
    let before_001 = std::fs::read_to_string(dir.join("model_run001.json")).unwrap();

    // Only the member stages, only member 001, existing directories kept
    let mut rerun = workflow(wd.path());
    rerun.init.reset = false;
    rerun.variants = VariantSpec::list(["001"]);
    for group in ["gis_prepro", "climate_prepro", "inversion"] {
        rerun.run_flags.insert(group.to_string(), false);
    }
    let report = run(&rerun, glaciers(2)).unwrap();

    assert_eq!(report.total_failed(), 0);
    assert_eq!(
        std::fs::read_to_string(dir.join("model_run002.json")).unwrap(),
        sentinel
    );
    assert_eq!(
        std::fs::read_to_string(dir.join("model_run001.json")).unwrap(),
        before_001
    );
    let handle = EntityHandle::new(Entity::new("RGI50-03.00001"), dir);
    let model: ModelRun = handle.read_json("model_run001.json").unwrap();
    assert_eq!(model.member, "001");
}

#[test]
fn allow_list_restricts_every_batch() {
    let wd = tempfile::tempdir().unwrap();
    let mut config = workflow(wd.path());
    let selected = ["RGI50-03.00002", "RGI50-03.00005", "RGI50-03.00009"];
    config.entities.selection = Some(selected.iter().map(|s| s.to_string()).collect());

    let report = run(&config, glaciers(10)).unwrap();

    let expected: BTreeSet<&str> = selected.into_iter().collect();
    assert_eq!(report.batches().count(), 7);
    for batch in report.batches() {
        let ids: BTreeSet<&str> = batch.entity_ids().collect();
        assert_eq!(ids, expected, "stage {}", batch.stage);
    }
    assert!(!glacier_dir(wd.path(), "RGI50-03.00000").exists());
}

#[test]
fn failing_glacier_aborts_stage_without_continue() {
    let wd = tempfile::tempdir().unwrap();
    let mut config = workflow(wd.path());
    config.execution.use_multiprocessing = false;
    let mut entities = glaciers(4);
    entities[1] = Entity::new("RGI50-03.00001").with_region("03");

    let err = run(&config, entities).unwrap_err();

    match err {
        WorkflowError::BatchAbort {
            stage,
            failure,
            completed,
            cancelled,
            ..
        } => {
            assert_eq!(stage, "glacier_masks");
            assert_eq!(failure.entity_id, "RGI50-03.00001");
            assert_eq!(failure.error.kind, TaskErrorKind::InvalidInput);
            assert_eq!((completed, cancelled), (2, 2));
        }
        other => panic!("Expected BatchAbort, got {}", other),
    }
    assert!(!wd.path().join("workflow_report.json").exists());
}

#[test]
fn failing_glacier_is_tainted_with_continue() {
    let wd = tempfile::tempdir().unwrap();
    let mut config = workflow(wd.path());
    config.execution.continue_on_error = true;
    let mut entities = glaciers(4);
    entities[2] = Entity::new("RGI50-03.00002").with_region("03");

    let report = run(&config, entities).unwrap();

    assert_eq!(report.total_failed(), 1);
    assert_eq!(
        report.tainted.get("RGI50-03.00002").unwrap().stage,
        "glacier_masks"
    );
    for batch in report.batches().skip(1) {
        assert_eq!(batch.skipped(), 1, "stage {}", batch.stage);
        assert_eq!(batch.succeeded(), 3, "stage {}", batch.stage);
    }

    let handle = EntityHandle::new(
        Entity::new("RGI50-03.00003"),
        glacier_dir(wd.path(), "RGI50-03.00003"),
    );
    let outline: Outline = handle.read_json("outline.json").unwrap();
    assert_eq!(outline.area_km2, 4.0);
}

#[test]
fn stage_scope_failure_does_not_fail_global_stage() {
    let wd = tempfile::tempdir().unwrap();
    let mut config = workflow(wd.path());
    config.execution.continue_on_error = true;
    config.execution.taint_scope = TaintScope::Stage;
    let mut entities = glaciers(4);
    entities[1] = Entity::new("RGI50-03.00001").with_region("03");

    let report = run(&config, entities).unwrap();

    assert!(matches!(
        report.stage("compute_ref_stats"),
        Some(StageRecord::Global { report, .. }) if report.entities == 3
    ));
    // Retried everywhere, failing everywhere, nobody else affected
    for batch in report.batches() {
        assert_eq!(batch.failed(), 1, "stage {}", batch.stage);
        assert_eq!(batch.succeeded(), 3, "stage {}", batch.stage);
    }
    assert!(report.tainted.is_empty());
    assert!(glacier_dir(wd.path(), "RGI50-03.00003")
        .join("model_run002.json")
        .is_file());
}

#[test]
fn misordered_plan_rejected_before_initialization() {
    let wd = tempfile::tempdir().unwrap();
    let mut config = workflow(wd.path());
    config.stages.swap(0, 1);

    let err = run(&config, glaciers(2)).unwrap_err();
    assert!(matches!(err, WorkflowError::StageOrder { .. }));
    assert!(!wd.path().join("per_glacier").exists());
}

#[test]
fn unknown_task_rejected() {
    let wd = tempfile::tempdir().unwrap();
    let mut config = workflow(wd.path());
    config
        .stages
        .push(StageSpec::entity("calving", "calving_flux").after(["run_evolution"]));

    let err = run(&config, glaciers(2)).unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownTask { .. }));
}

#[test]
fn reset_without_force_refused_over_existing_state() {
    let wd = tempfile::tempdir().unwrap();
    let config = workflow(wd.path());
    run(&config, glaciers(2)).unwrap();

    let mut again = workflow(wd.path());
    again.init.force = false;
    let err = run(&again, glaciers(2)).unwrap_err();
    assert!(matches!(err, WorkflowError::Initialization(_)));
    assert!(glacier_dir(wd.path(), "RGI50-03.00000")
        .join("model_run001.json")
        .is_file());
}
