use super::{unit_hash, Outline, CLIMATE_FILE, OUTLINE_FILE, REF_STATS_FILE};
use crate::config::TaskConfig;
use crate::entity::EntityHandle;
use crate::task::{EntityTask, GlobalTask, TaskError, TaskOutput, TaskResult};
use serde::{Deserialize, Serialize};

/// Monthly reference climate summary at the glacier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateMonthly {
    pub entity_id: String,
    pub y0: i64,
    pub nyears: i64,
    pub n_months: i64,
    pub ref_hgt_m: f64,
    pub mean_temp_c: f64,
    pub annual_prcp_mm: f64,
}

/// Extracts the reference climate series for each glacier
pub struct ProcessClimateData;

impl EntityTask for ProcessClimateData {
    fn name(&self) -> &'static str {
        "process_climate_data"
    }

    fn description(&self) -> &'static str {
        "Reference climate series at the glacier location"
    }

    fn process(&self, handle: &EntityHandle, config: &TaskConfig) -> TaskResult<TaskOutput> {
        let outline: Outline = handle.read_json(OUTLINE_FILE)?;
        let y0 = config.i64("y0")?;
        let nyears = config.i64("nyears")?;
        if nyears <= 0 {
            return Err(TaskError::invalid_parameter(format!(
                "nyears must be positive, got {}",
                nyears
            )));
        }

        let h = unit_hash(handle.id());
        let climate = ClimateMonthly {
            entity_id: outline.entity_id,
            y0,
            nyears,
            n_months: nyears * 12,
            ref_hgt_m: 800.0 + 1200.0 * h,
            mean_temp_c: -18.0 + 8.0 * h,
            annual_prcp_mm: 150.0 + 350.0 * (1.0 - h),
        };
        let path = handle.write_json(CLIMATE_FILE, &climate)?;

        Ok(TaskOutput::new()
            .with_artifact(path)
            .with_items(climate.n_months as usize))
    }
}

/// Regional statistics shared by every glacier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefStats {
    pub n_glaciers: usize,
    pub mean_temp_c: f64,
    pub mean_prcp_mm: f64,
}

/// Computes regional reference statistics and distributes them
pub struct ComputeRefStats;

impl GlobalTask for ComputeRefStats {
    fn name(&self) -> &'static str {
        "compute_ref_stats"
    }

    fn description(&self) -> &'static str {
        "Regional climate statistics written to every glacier"
    }

    fn run(&self, handles: &[&EntityHandle], _config: &TaskConfig) -> TaskResult<TaskOutput> {
        let series = handles
            .iter()
            .map(|h| h.read_json::<ClimateMonthly>(CLIMATE_FILE))
            .collect::<TaskResult<Vec<_>>>()?;

        let n = series.len() as f64;
        let stats = RefStats {
            n_glaciers: series.len(),
            mean_temp_c: series.iter().map(|c| c.mean_temp_c).sum::<f64>() / n,
            mean_prcp_mm: series.iter().map(|c| c.annual_prcp_mm).sum::<f64>() / n,
        };

        let mut output = TaskOutput::new().with_items(handles.len());
        for handle in handles {
            output = output.with_artifact(handle.write_json(REF_STATS_FILE, &stats)?);
        }
        Ok(output)
    }
}
