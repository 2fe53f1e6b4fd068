use crate::entity::{write_json_atomic, Entity, EntityHandle};
use crate::error::{Result, WorkflowError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Descriptor written into every entity directory
pub const ENTITY_DESCRIPTOR: &str = "entity.json";

/// Subdirectory of the working directory holding entity directories
pub const PER_ENTITY_DIR: &str = "per_glacier";

const DEFAULT_REGION_DIR: &str = "default";

/// Directory initialization flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitOptions {
    /// Discard existing entity state
    #[serde(default)]
    pub reset: bool,

    /// Proceed where validation would refuse
    #[serde(default)]
    pub force: bool,
}

impl InitOptions {
    pub fn reset_forced() -> Self {
        Self {
            reset: true,
            force: true,
        }
    }
}

/// Turns entity descriptors into handles bound to working directories
pub trait DirectoryInitializer: Send + Sync {
    fn initialize(&self, entities: &[Entity], options: InitOptions) -> Result<Vec<EntityHandle>>;
}

/// Working directories under `<working_dir>/per_glacier/<region>/<id>`.
///
/// Parallel initialization fans out on whichever rayon pool the caller is
/// installed in; sequential initialization stops at the first failing entity.
pub struct LocalDirectoryInitializer {
    root: PathBuf,
    parallel: bool,
}

impl LocalDirectoryInitializer {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            root: working_dir.as_ref().join(PER_ENTITY_DIR),
            parallel: true,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity_dir(&self, entity: &Entity) -> PathBuf {
        let region = entity.region.as_deref().unwrap_or(DEFAULT_REGION_DIR);
        self.root.join(region).join(&entity.id)
    }

    fn validate_id(entity: &Entity) -> Result<()> {
        let id = entity.id.as_str();
        let region_ok = entity
            .region
            .as_deref()
            .map_or(true, |r| is_safe_segment(r));
        if !is_safe_segment(id) || !region_ok {
            return Err(WorkflowError::Initialization(format!(
                "entity '{}' (region {:?}) cannot be used as a directory name",
                id, entity.region
            )));
        }
        Ok(())
    }

    fn init_one(&self, entity: &Entity, options: InitOptions) -> Result<EntityHandle> {
        let dir = self.entity_dir(entity);
        let descriptor = dir.join(ENTITY_DESCRIPTOR);

        if options.reset && dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| init_io_error(&dir, e))?;
        } else if descriptor.is_file() {
            let existing: Entity = std::fs::read_to_string(&descriptor)
                .map_err(|e| init_io_error(&descriptor, e))
                .and_then(|content| {
                    serde_json::from_str(&content).map_err(|e| init_io_error(&descriptor, e))
                })?;

            if existing.id != entity.id {
                if !options.force {
                    return Err(WorkflowError::Initialization(format!(
                        "{} belongs to entity '{}', not '{}' (use force to overwrite)",
                        dir.display(),
                        existing.id,
                        entity.id
                    )));
                }
                warn!(
                    "Overwriting descriptor of {} (was '{}', now '{}')",
                    dir.display(),
                    existing.id,
                    entity.id
                );
            }
        }

        std::fs::create_dir_all(&dir).map_err(|e| init_io_error(&dir, e))?;
        write_json_atomic(&descriptor, entity).map_err(|e| init_io_error(&descriptor, e))?;

        Ok(EntityHandle::new(entity.clone(), dir))
    }
}

impl DirectoryInitializer for LocalDirectoryInitializer {
    fn initialize(&self, entities: &[Entity], options: InitOptions) -> Result<Vec<EntityHandle>> {
        let mut seen = HashSet::new();
        for entity in entities {
            Self::validate_id(entity)?;
            if !seen.insert(entity.id.as_str()) {
                return Err(WorkflowError::Initialization(format!(
                    "duplicate entity id '{}'",
                    entity.id
                )));
            }
        }

        if options.reset && !options.force {
            let existing = entities
                .iter()
                .filter(|e| self.entity_dir(e).exists())
                .count();
            if existing > 0 {
                return Err(WorkflowError::Initialization(format!(
                    "reset would discard {} existing entity directories under {}; set force to proceed",
                    existing,
                    self.root.display()
                )));
            }
        }

        info!(
            "Initializing {} entity directories under {} (reset={}, force={}, {})",
            entities.len(),
            self.root.display(),
            options.reset,
            options.force,
            if self.parallel { "parallel" } else { "sequential" }
        );

        if self.parallel {
            entities
                .par_iter()
                .map(|entity| self.init_one(entity, options))
                .collect()
        } else {
            entities
                .iter()
                .map(|entity| self.init_one(entity, options))
                .collect()
        }
    }
}

fn is_safe_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
}

fn init_io_error<E: std::fmt::Display>(path: &Path, e: E) -> WorkflowError {
    WorkflowError::Initialization(format!("{}: {}", path.display(), e))
}
