use super::OUTLINE_FILE;
use crate::config::TaskConfig;
use crate::entity::{Entity, EntityHandle};
use crate::init::ENTITY_DESCRIPTOR;
use crate::task::{EntityTask, TaskError, TaskOutput, TaskResult};
use serde::{Deserialize, Serialize};

const DEFAULT_BORDER: i64 = 20;

// Square grid spacing: dx = d1 * sqrt(area) + d2, capped at dmax (meters)
const DX_D1: f64 = 14.0;
const DX_D2: f64 = 10.0;
const DX_MAX: f64 = 400.0;

/// Glacier outline and local grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub entity_id: String,
    pub area_km2: f64,
    pub dx_m: f64,
    pub nx: usize,
    pub ny: usize,
    pub border: usize,
}

/// Defines the local grid and glacier mask
pub struct GlacierMasks;

impl EntityTask for GlacierMasks {
    fn name(&self) -> &'static str {
        "glacier_masks"
    }

    fn description(&self) -> &'static str {
        "Local grid and outline from the inventory attributes"
    }

    fn process(&self, handle: &EntityHandle, config: &TaskConfig) -> TaskResult<TaskOutput> {
        let entity: Entity = handle.read_json(ENTITY_DESCRIPTOR)?;
        let area_km2 = entity
            .f64_attribute("area_km2")
            .filter(|a| *a > 0.0)
            .ok_or_else(|| {
                TaskError::invalid_input(format!(
                    "{}: inventory area_km2 missing or not positive",
                    entity.id
                ))
            })?;

        let border = config.i64_or("border", DEFAULT_BORDER)?;
        if border < 0 {
            return Err(TaskError::invalid_parameter(format!(
                "border must be non-negative, got {}",
                border
            )));
        }
        let border = border as usize;

        let dx_m = (DX_D1 * area_km2.sqrt() + DX_D2).round().min(DX_MAX);
        let extent_m = area_km2.sqrt() * 1000.0;
        let cells = (extent_m / dx_m).ceil() as usize + 2 * border;

        let outline = Outline {
            entity_id: entity.id.clone(),
            area_km2,
            dx_m,
            nx: cells,
            ny: cells,
            border,
        };
        let path = handle.write_json(OUTLINE_FILE, &outline)?;

        Ok(TaskOutput::new().with_artifact(path).with_items(1))
    }
}
