//! Workflow configuration
//!
//! A workflow is described by one YAML file (schema v1): paths, entity
//! source and selection, execution policy, initialization flags, stage run
//! flags, flat task parameters, variant enumeration and the ordered stage
//! list. The file is loaded once at startup; tasks only ever see the
//! immutable [`TaskConfig`] derived from it.
//!
//! # Examples
//!
//! ```rust,ignore
//! use glacier_workflow::config::WorkflowConfig;
//!
//! let config = WorkflowConfig::from_yaml_file("configs/arctic_canada.yaml")?;
//! let task_config = config.task_config();
//! let members = config.variants()?;
//! ```

pub mod error;
pub mod params;
pub mod variants;
pub mod workflow_config;

// Re-exports
pub use error::{ConfigError, ConfigResult};
pub(crate) use error::find_closest_match;
pub use params::{ParamValue, TaskConfig};
pub use variants::{VariantSpec, MEMBER_PLACEHOLDER};
pub use workflow_config::{
    EntitySourceConfig, ExecutionConfig, PathsConfig, WorkflowConfig, SUPPORTED_VERSIONS,
    WORKING_DIR_KEY,
};
