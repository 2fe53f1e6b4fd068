//! Task-facing configuration
//!
//! `TaskConfig` is built once from the workflow file and handed to every
//! task by reference. The parameter and path maps are shared behind `Arc`,
//! so binding a variant suffix for one fan-out is a cheap clone.

use crate::task::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Flat parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Immutable configuration passed to every task invocation
#[derive(Debug, Clone, Default)]
pub struct TaskConfig {
    params: Arc<BTreeMap<String, ParamValue>>,
    paths: Arc<BTreeMap<String, PathBuf>>,
    variant: Option<String>,
}

impl TaskConfig {
    pub fn new(params: BTreeMap<String, ParamValue>, paths: BTreeMap<String, PathBuf>) -> Self {
        Self {
            params: Arc::new(params),
            paths: Arc::new(paths),
            variant: None,
        }
    }

    /// Same parameters with a variant suffix bound
    pub fn with_variant(&self, variant: impl Into<String>) -> Self {
        Self {
            params: Arc::clone(&self.params),
            paths: Arc::clone(&self.paths),
            variant: Some(variant.into()),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Arc::make_mut(&mut self.params).insert(key.into(), value.into());
        self
    }

    pub fn with_path(mut self, key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Arc::make_mut(&mut self.paths).insert(key.into(), path.into());
        self
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Artifact file suffix ("" when no variant is bound)
    pub fn filesuffix(&self) -> &str {
        self.variant.as_deref().unwrap_or("")
    }

    /// Variant suffix, required by per-variant tasks
    pub fn require_variant(&self) -> TaskResult<&str> {
        self.variant()
            .ok_or_else(|| TaskError::invalid_parameter("task requires a variant suffix"))
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn f64(&self, key: &str) -> TaskResult<f64> {
        self.typed(key, "a number", ParamValue::as_f64)
    }

    pub fn i64(&self, key: &str) -> TaskResult<i64> {
        self.typed(key, "an integer", ParamValue::as_i64)
    }

    pub fn bool(&self, key: &str) -> TaskResult<bool> {
        self.typed(key, "a boolean", ParamValue::as_bool)
    }

    pub fn str(&self, key: &str) -> TaskResult<&str> {
        let value = self.require(key)?;
        value
            .as_str()
            .ok_or_else(|| Self::wrong_type(key, "a string", value))
    }

    pub fn f64_or(&self, key: &str, default: f64) -> TaskResult<f64> {
        match self.param(key) {
            None => Ok(default),
            Some(_) => self.f64(key),
        }
    }

    pub fn i64_or(&self, key: &str, default: i64) -> TaskResult<i64> {
        match self.param(key) {
            None => Ok(default),
            Some(_) => self.i64(key),
        }
    }

    pub fn paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.paths
    }

    pub fn path(&self, key: &str) -> Option<&Path> {
        self.paths.get(key).map(PathBuf::as_path)
    }

    fn require(&self, key: &str) -> TaskResult<&ParamValue> {
        self.param(key)
            .ok_or_else(|| TaskError::invalid_parameter(format!("missing parameter '{}'", key)))
    }

    fn typed<T>(
        &self,
        key: &str,
        expected: &str,
        convert: impl Fn(&ParamValue) -> Option<T>,
    ) -> TaskResult<T> {
        let value = self.require(key)?;
        convert(value).ok_or_else(|| Self::wrong_type(key, expected, value))
    }

    fn wrong_type(key: &str, expected: &str, value: &ParamValue) -> TaskError {
        TaskError::invalid_parameter(format!(
            "parameter '{}' must be {}, got '{}'",
            key, expected, value
        ))
    }
}
