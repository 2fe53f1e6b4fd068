//! Workflow file (YAML schema v1)

use super::error::{ConfigError, ConfigResult};
use super::params::{ParamValue, TaskConfig};
use super::variants::VariantSpec;
use crate::engine::{RunPolicy, TaintScope};
use crate::entity::{EntityFilter, EntitySelection};
use crate::init::InitOptions;
use crate::plan::StageSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Key under which the working directory is exposed to tasks
pub const WORKING_DIR_KEY: &str = "working_dir";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub working_dir: PathBuf,

    /// Create every configured directory at startup
    #[serde(default = "default_true")]
    pub create_dirs: bool,

    /// Named input directories (topography, climate, inventory, ...)
    #[serde(default)]
    pub inputs: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntitySourceConfig {
    /// JSON array of entity descriptors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Keep only entities of this region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Allow-list of entity identifiers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<String>>,
}

impl EntitySourceConfig {
    pub fn filter(&self) -> EntityFilter {
        let selection = match &self.selection {
            Some(ids) => EntitySelection::allow_list(ids.iter().cloned()),
            None => EntitySelection::All,
        };
        EntityFilter::new(self.region.clone(), selection)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Fan entities out over the worker pool
    #[serde(default = "default_true")]
    pub use_multiprocessing: bool,

    /// Record failures and keep going instead of aborting the stage
    #[serde(default)]
    pub continue_on_error: bool,

    /// Worker pool size (0=all hardware threads, 1..=256)
    #[serde(default)]
    pub num_workers: usize,

    #[serde(default)]
    pub taint_scope: TaintScope,

    /// Reject enabled stages whose prerequisites are disabled
    #[serde(default)]
    pub strict_stages: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            use_multiprocessing: true,
            continue_on_error: false,
            num_workers: 0,
            taint_scope: TaintScope::default(),
            strict_stages: false,
        }
    }
}

impl ExecutionConfig {
    pub fn run_policy(&self) -> RunPolicy {
        RunPolicy {
            parallel: self.use_multiprocessing,
            continue_on_error: self.continue_on_error,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.num_workers > 256 {
            return Err(ConfigError::range_with_hint(
                "execution.num_workers",
                self.num_workers,
                0,
                256,
                "Number of workers must be reasonable (0=auto)",
            ));
        }
        Ok(())
    }
}

/// Complete workflow description
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Schema version (always 1 for v1)
    #[serde(default)]
    pub version: Option<u32>,

    pub paths: PathsConfig,

    #[serde(default)]
    pub entities: EntitySourceConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub init: InitOptions,

    /// Stage group on/off switches (missing group = enabled)
    #[serde(default)]
    pub run_flags: BTreeMap<String, bool>,

    /// Passed unmodified to every task
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,

    #[serde(default)]
    pub variants: VariantSpec,

    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

impl WorkflowConfig {
    /// Minimal configuration rooted at `working_dir`
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            version: Some(1),
            paths: PathsConfig {
                working_dir: working_dir.into(),
                create_dirs: true,
                inputs: BTreeMap::new(),
            },
            entities: EntitySourceConfig::default(),
            execution: ExecutionConfig::default(),
            init: InitOptions::default(),
            run_flags: BTreeMap::new(),
            params: BTreeMap::new(),
            variants: VariantSpec::default(),
            stages: Vec::new(),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_yaml_str(&content)?;

        // Relative paths are resolved against the workflow file's directory
        if let Some(base) = path.as_ref().parent() {
            config.resolve_relative_paths(base);
        }
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        serde_yaml::to_string(self).map_err(ConfigError::Yaml)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        match self.version {
            None => return Err(ConfigError::MissingVersion),
            Some(v) if !SUPPORTED_VERSIONS.contains(&v) => {
                return Err(ConfigError::UnsupportedVersion {
                    found: v,
                    supported: SUPPORTED_VERSIONS.to_vec(),
                })
            }
            Some(_) => {}
        }

        if self.paths.working_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingSetting("paths.working_dir".to_string()));
        }

        self.execution.validate()?;
        self.variants.expand()?;

        let groups = self.groups();
        let valid: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        for flag in self.run_flags.keys() {
            if !groups.contains(flag.as_str()) {
                return Err(ConfigError::unknown_group_with_suggestion(flag, &valid));
            }
        }

        Ok(())
    }

    /// Stage groups declared by the stage list
    pub fn groups(&self) -> BTreeSet<&str> {
        self.stages
            .iter()
            .filter_map(|s| s.group.as_deref())
            .collect()
    }

    pub fn variants(&self) -> ConfigResult<Vec<String>> {
        self.variants.expand()
    }

    /// All configured directories, working directory first
    pub fn directories(&self) -> Vec<&Path> {
        std::iter::once(self.paths.working_dir.as_path())
            .chain(self.paths.inputs.values().map(PathBuf::as_path))
            .collect()
    }

    pub fn ensure_directories(&self) -> ConfigResult<()> {
        if !self.paths.create_dirs {
            return Ok(());
        }
        for dir in self.directories() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Immutable task configuration (parameters plus every named path)
    pub fn task_config(&self) -> TaskConfig {
        let mut paths = self.paths.inputs.clone();
        paths.insert(WORKING_DIR_KEY.to_string(), self.paths.working_dir.clone());
        TaskConfig::new(self.params.clone(), paths)
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.paths.working_dir);
        self.paths.inputs.values_mut().for_each(resolve);
        if let Some(file) = self.entities.file.as_mut() {
            resolve(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StageKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const WORKFLOW: &str = r#"
version: 1
paths:
  working_dir: /tmp/glacier-wd
  inputs:
    topo_dir: /tmp/glacier-data/topo
entities:
  region: "03"
  selection: ["RGI50-03.04079", "RGI50-03.02440"]
execution:
  use_multiprocessing: true
  continue_on_error: true
  num_workers: 4
init:
  reset: true
  force: true
run_flags:
  inversion: false
params:
  y0: 851
  nyears: 1155
  temp_suffix: ".TREFHT.085001-200512.nc"
variants:
  template: "b.e11.BLMTRC5CN.f19_g16.{member}.cam.h0"
  count: 13
stages:
  - name: glacier_masks
    task: glacier_masks
    kind: entity
    group: gis_prepro
  - name: volume_inversion
    task: volume_inversion
    kind: entity
    group: inversion
    after: [glacier_masks]
"#;

    #[test]
    fn test_yaml_loading() {
        let config = WorkflowConfig::from_yaml_str(WORKFLOW).unwrap();

        assert_eq!(config.paths.working_dir, PathBuf::from("/tmp/glacier-wd"));
        assert_eq!(config.entities.region.as_deref(), Some("03"));
        assert!(config.execution.continue_on_error);
        assert_eq!(config.execution.num_workers, 4);
        assert!(config.init.reset && config.init.force);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[1].kind, StageKind::Entity);
        assert_eq!(config.stages[1].after, vec!["glacier_masks".to_string()]);
        assert_eq!(config.variants().unwrap().len(), 13);
    }

    #[test]
    fn test_task_config_carries_params_and_paths() {
        let config = WorkflowConfig::from_yaml_str(WORKFLOW).unwrap();
        let task_config = config.task_config();

        assert_eq!(task_config.i64("nyears").unwrap(), 1155);
        assert_eq!(
            task_config.path(WORKING_DIR_KEY),
            Some(Path::new("/tmp/glacier-wd"))
        );
        assert!(task_config.path("topo_dir").is_some());
    }

    #[test]
    fn test_missing_version() {
        let result = WorkflowConfig::from_yaml_str("paths:\n  working_dir: /tmp/x\n");
        assert!(matches!(result, Err(ConfigError::MissingVersion)));
    }

    #[test]
    fn test_unsupported_version() {
        let result = WorkflowConfig::from_yaml_str("version: 2\npaths:\n  working_dir: /tmp/x\n");
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = WorkflowConfig::from_yaml_str(
            "version: 1\npaths:\n  working_dir: /tmp/x\nuse_multiprocessing: true\n",
        );
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_unknown_run_flag_group() {
        let yaml = WORKFLOW.replace("inversion: false", "inverson: false");
        let err = WorkflowConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("Did you mean 'inversion'"));
    }

    #[test]
    fn test_worker_range() {
        let yaml = WORKFLOW.replace("num_workers: 4", "num_workers: 1000");
        let err = WorkflowConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Range { .. }));
    }

    #[test]
    fn test_yaml_roundtrip_keeps_stages() {
        let config = WorkflowConfig::from_yaml_str(WORKFLOW).unwrap();
        let yaml = config.to_yaml().unwrap();
        let reloaded = WorkflowConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(reloaded.stages, config.stages);
        assert_eq!(reloaded.params, config.params);
    }

    #[test]
    fn test_relative_paths_resolved_against_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = NamedTempFile::new_in(dir.path()).unwrap();
        file.write_all(b"version: 1\npaths:\n  working_dir: wd\nentities:\n  file: glaciers.json\n")
            .unwrap();

        let config = WorkflowConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.paths.working_dir, dir.path().join("wd"));
        assert_eq!(config.entities.file, Some(dir.path().join("glaciers.json")));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WorkflowConfig::new(dir.path().join("wd"));
        config
            .paths
            .inputs
            .insert("cru_dir".to_string(), dir.path().join("cru"));

        config.ensure_directories().unwrap();
        assert!(dir.path().join("wd").is_dir());
        assert!(dir.path().join("cru").is_dir());
    }
}
