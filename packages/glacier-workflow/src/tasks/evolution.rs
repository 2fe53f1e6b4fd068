use super::{
    unit_hash, ClimateMonthly, InversionOutput, CLIMATE_FILE, GCM_DATA_PREFIX, INVERSION_FILE,
    MODEL_RUN_PREFIX,
};
use crate::config::TaskConfig;
use crate::entity::EntityHandle;
use crate::task::{EntityTask, TaskOutput, TaskResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Path key of the directory holding ensemble member files
pub const GCM_DIR_KEY: &str = "gcm_dir";

/// GCM member climate bias-corrected against the reference series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcmData {
    pub entity_id: String,
    pub member: String,
    pub temp_file: PathBuf,
    pub precc_file: PathBuf,
    pub precl_file: PathBuf,
    pub y0: i64,
    pub nyears: i64,
    pub temp_bias_c: f64,
}

/// Prepares one ensemble member's climate for each glacier
pub struct ProcessGcmData;

impl EntityTask for ProcessGcmData {
    fn name(&self) -> &'static str {
        "process_gcm_data"
    }

    fn description(&self) -> &'static str {
        "Ensemble member climate (per variant)"
    }

    fn process(&self, handle: &EntityHandle, config: &TaskConfig) -> TaskResult<TaskOutput> {
        let member = config.require_variant()?;
        let climate: ClimateMonthly = handle.read_json(CLIMATE_FILE)?;

        let gcm_dir = config.path(GCM_DIR_KEY).map(PathBuf::from).unwrap_or_default();
        let input = |key: &str| -> TaskResult<PathBuf> {
            Ok(gcm_dir.join(format!("{}{}", member, config.str(key)?)))
        };

        let data = GcmData {
            entity_id: climate.entity_id.clone(),
            member: member.to_string(),
            temp_file: input("temp_suffix")?,
            precc_file: input("precc_suffix")?,
            precl_file: input("precl_suffix")?,
            y0: climate.y0,
            nyears: climate.nyears,
            temp_bias_c: unit_hash(member) - 0.5,
        };

        let path = handle.write_json(&member_file(GCM_DATA_PREFIX, member), &data)?;

        Ok(TaskOutput::new()
            .with_artifact(path)
            .with_items(climate.n_months as usize))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRun {
    pub entity_id: String,
    pub member: String,
    pub y0: i64,
    pub nyears: i64,
    pub initial_volume_km3: f64,
    pub final_volume_km3: f64,
}

/// Runs the glacier evolution model under one ensemble member
pub struct RunEvolution;

impl EntityTask for RunEvolution {
    fn name(&self) -> &'static str {
        "run_evolution"
    }

    fn description(&self) -> &'static str {
        "Glacier evolution under an ensemble member (per variant)"
    }

    fn process(&self, handle: &EntityHandle, config: &TaskConfig) -> TaskResult<TaskOutput> {
        let member = config.require_variant()?;
        let inversion: InversionOutput = handle.read_json(INVERSION_FILE)?;
        let gcm: GcmData = handle.read_json(&member_file(GCM_DATA_PREFIX, member))?;

        // Warmer member, more loss
        let loss_per_century = (0.02 + 0.05 * (gcm.temp_bias_c + 0.5)).min(0.99);
        let centuries = gcm.nyears as f64 / 100.0;
        let final_volume_km3 = inversion.volume_km3 * (1.0 - loss_per_century).powf(centuries);

        let run = ModelRun {
            entity_id: inversion.entity_id,
            member: member.to_string(),
            y0: gcm.y0,
            nyears: gcm.nyears,
            initial_volume_km3: inversion.volume_km3,
            final_volume_km3,
        };
        let path = handle.write_json(&member_file(MODEL_RUN_PREFIX, member), &run)?;

        Ok(TaskOutput::new()
            .with_artifact(path)
            .with_items(gcm.nyears as usize))
    }
}

/// `<prefix><member>.json`
fn member_file(prefix: &str, member: &str) -> String {
    format!("{}{}.json", prefix, member)
}
