//! Reference tasks
//!
//! Deterministic stand-ins for the regional glacier workflow: outlines,
//! reference climate, volume inversion, GCM member preprocessing and the
//! evolution run. They exchange small JSON artifacts through the entity
//! working directories, which is all the pipeline needs to exercise stage
//! ordering, variants and failure isolation.

pub mod climate;
pub mod evolution;
pub mod gis;
pub mod inversion;

use crate::error::Result;
use crate::task::TaskRegistry;
use std::sync::Arc;

pub use climate::{ClimateMonthly, ComputeRefStats, ProcessClimateData, RefStats};
pub use evolution::{GcmData, ModelRun, ProcessGcmData, RunEvolution};
pub use gis::{GlacierMasks, Outline};
pub use inversion::{InversionOutput, VolumeInversion};

pub const OUTLINE_FILE: &str = "outline.json";
pub const CLIMATE_FILE: &str = "climate_monthly.json";
pub const REF_STATS_FILE: &str = "ref_stats.json";
pub const INVERSION_FILE: &str = "inversion_output.json";
pub const GCM_DATA_PREFIX: &str = "gcm_data";
pub const MODEL_RUN_PREFIX: &str = "model_run";

pub fn register_reference_tasks(registry: &mut TaskRegistry) -> Result<()> {
    registry.register_entity(Arc::new(GlacierMasks))?;
    registry.register_entity(Arc::new(ProcessClimateData))?;
    registry.register_global(Arc::new(ComputeRefStats))?;
    registry.register_entity(Arc::new(VolumeInversion))?;
    registry.register_entity(Arc::new(ProcessGcmData))?;
    registry.register_entity(Arc::new(RunEvolution))?;
    Ok(())
}

/// Registry holding only the reference tasks
pub fn reference_registry() -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    register_reference_tasks(&mut registry)?;
    Ok(registry)
}

/// Stable per-entity value in [0, 1) (FNV-1a of the identifier)
pub(crate) fn unit_hash(id: &str) -> f64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash >> 11) as f64 / (1u64 << 53) as f64
}
