use super::{Outline, RefStats, INVERSION_FILE, OUTLINE_FILE, REF_STATS_FILE};
use crate::config::TaskConfig;
use crate::entity::EntityHandle;
use crate::task::{EntityTask, TaskError, TaskOutput, TaskResult};
use serde::{Deserialize, Serialize};

/// Default creep parameter (s-1 Pa-3)
pub const DEFAULT_GLEN_A: f64 = 2.4e-24;

// Volume-area scaling V = c * A^gamma (km3, km2)
const VAS_C: f64 = 0.034;
const VAS_GAMMA: f64 = 1.375;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InversionOutput {
    pub entity_id: String,
    pub glen_a: f64,
    pub volume_km3: f64,
    pub mean_thickness_m: f64,
}

/// Estimates ice volume from the outline and regional statistics
pub struct VolumeInversion;

impl EntityTask for VolumeInversion {
    fn name(&self) -> &'static str {
        "volume_inversion"
    }

    fn description(&self) -> &'static str {
        "Ice thickness and volume"
    }

    fn process(&self, handle: &EntityHandle, config: &TaskConfig) -> TaskResult<TaskOutput> {
        let outline: Outline = handle.read_json(OUTLINE_FILE)?;
        let stats: RefStats = handle.read_json(REF_STATS_FILE)?;

        let glen_a = config.f64_or("inversion_glen_a", DEFAULT_GLEN_A)?;
        if glen_a.is_nan() || glen_a <= 0.0 {
            return Err(TaskError::invalid_parameter(format!(
                "inversion_glen_a must be positive, got {}",
                glen_a
            )));
        }

        // Softer ice (larger A) gives thinner glaciers; colder regions slightly thicker
        let flow_factor = (glen_a / DEFAULT_GLEN_A).powf(-0.2);
        let climate_factor = 1.0 - 0.005 * stats.mean_temp_c;
        let volume_km3 = VAS_C * outline.area_km2.powf(VAS_GAMMA) * flow_factor * climate_factor;
        if !volume_km3.is_finite() || volume_km3 <= 0.0 {
            return Err(TaskError::computation(format!(
                "{}: inversion produced volume {}",
                handle.id(),
                volume_km3
            )));
        }

        let inversion = InversionOutput {
            entity_id: outline.entity_id,
            glen_a,
            volume_km3,
            mean_thickness_m: volume_km3 / outline.area_km2 * 1000.0,
        };
        let path = handle.write_json(INVERSION_FILE, &inversion)?;

        Ok(TaskOutput::new().with_artifact(path).with_items(1))
    }
}
