//! Entities and their working-directory handles

use crate::error::{Result, WorkflowError};
use crate::task::{TaskError, TaskResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One independently processable unit (a glacier)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Inventory attributes (area, outline source, ...)
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            region: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn f64_attribute(&self, key: &str) -> Option<f64> {
        self.attribute(key).and_then(serde_json::Value::as_f64)
    }
}

/// Load entity descriptors from a JSON array
pub fn load_entities(path: impl AsRef<Path>) -> Result<Vec<Entity>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        WorkflowError::Initialization(format!(
            "cannot read entity file {}: {}",
            path.display(),
            e
        ))
    })?;
    let entities: Vec<Entity> = serde_json::from_str(&content).map_err(|e| {
        WorkflowError::Initialization(format!(
            "cannot parse entity file {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut seen = HashSet::new();
    for entity in &entities {
        if !seen.insert(entity.id.as_str()) {
            return Err(WorkflowError::Initialization(format!(
                "duplicate entity id '{}' in {}",
                entity.id,
                path.display()
            )));
        }
    }

    info!("Loaded {} entities from {}", entities.len(), path.display());
    Ok(entities)
}

/// Which identifiers to keep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EntitySelection {
    #[default]
    All,
    AllowList(BTreeSet<String>),
}

impl EntitySelection {
    pub fn allow_list<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EntitySelection::AllowList(ids.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, id: &str) -> bool {
        match self {
            EntitySelection::All => true,
            EntitySelection::AllowList(ids) => ids.contains(id),
        }
    }
}

/// Region filter plus identifier selection, applied before initialization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    pub region: Option<String>,
    pub selection: EntitySelection,
}

impl EntityFilter {
    pub fn new(region: Option<String>, selection: EntitySelection) -> Self {
        Self { region, selection }
    }

    pub fn all() -> Self {
        Self::default()
    }

    /// Keep matching entities, preserving input order
    pub fn apply(&self, entities: Vec<Entity>) -> Vec<Entity> {
        let total = entities.len();
        let selected: Vec<Entity> = entities
            .into_iter()
            .filter(|e| match &self.region {
                Some(region) => e.region.as_deref() == Some(region.as_str()),
                None => true,
            })
            .filter(|e| self.selection.contains(&e.id))
            .collect();

        if let EntitySelection::AllowList(ids) = &self.selection {
            let found: HashSet<&str> = selected.iter().map(|e| e.id.as_str()).collect();
            for missing in ids.iter().filter(|id| !found.contains(id.as_str())) {
                warn!("Selected entity {} not found after region filtering", missing);
            }
        }

        if selected.len() != total {
            info!("Selection kept {} of {} entities", selected.len(), total);
        }
        selected
    }
}

/// Runtime handle bound to one entity's working directory.
///
/// Created once by the directory initializer and reused by every stage.
/// The engine hands each handle to exactly one worker at a time.
#[derive(Debug)]
pub struct EntityHandle {
    entity: Entity,
    dir: PathBuf,
}

impl EntityHandle {
    pub fn new(entity: Entity, dir: PathBuf) -> Self {
        Self { entity, dir }
    }

    pub fn id(&self) -> &str {
        &self.entity.id
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<name><suffix>.<ext>`
    pub fn artifact_path(&self, name: &str, suffix: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}{}.{}", name, suffix, ext))
    }

    pub fn has_file(&self, file_name: &str) -> bool {
        self.dir.join(file_name).is_file()
    }

    pub fn read_json<T: DeserializeOwned>(&self, file_name: &str) -> TaskResult<T> {
        let path = self.dir.join(file_name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TaskError::missing_input(format!(
                    "{}: {} not found",
                    self.id(),
                    file_name
                )))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| {
            TaskError::new(
                crate::task::TaskErrorKind::Serialization,
                format!("{}: cannot parse {}: {}", self.id(), file_name, e),
            )
        })
    }

    /// Write through a temporary file in the same directory, then rename
    pub fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> TaskResult<PathBuf> {
        let path = self.dir.join(file_name);
        write_json_atomic(&path, value)?;
        Ok(path)
    }
}

/// Serialize `value` next to `path` and rename it into place
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
