use super::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Placeholder replaced by the zero-padded member index
pub const MEMBER_PLACEHOLDER: &str = "{member}";

/// Upper bound on template-expanded variants
pub const MAX_VARIANTS: usize = 10_000;

/// Variant enumeration: an explicit list, or a template expanded over
/// `start..start + count`.
///
/// ```yaml
/// variants:
///   template: "b.e11.BLMTRC5CN.f19_g16.{member}.cam.h0"
///   count: 13
///   width: 3
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default)]
    pub count: usize,

    #[serde(default = "default_start")]
    pub start: usize,

    #[serde(default = "default_width")]
    pub width: usize,
}

fn default_start() -> usize {
    1
}

fn default_width() -> usize {
    3
}

impl Default for VariantSpec {
    fn default() -> Self {
        Self {
            list: Vec::new(),
            template: None,
            count: 0,
            start: default_start(),
            width: default_width(),
        }
    }
}

impl VariantSpec {
    pub fn list<I, S>(variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            list: variants.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn template(template: impl Into<String>, count: usize, width: usize) -> Self {
        Self {
            template: Some(template.into()),
            count,
            width,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty() && self.template.is_none()
    }

    /// Expand into the ordered suffix list
    pub fn expand(&self) -> ConfigResult<Vec<String>> {
        let variants = match (&self.template, self.list.is_empty()) {
            (Some(_), false) => {
                return Err(ConfigError::Variants(
                    "set either 'list' or 'template', not both".to_string(),
                ))
            }
            (None, _) => self.list.clone(),
            (Some(template), true) => {
                if !template.contains(MEMBER_PLACEHOLDER) {
                    return Err(ConfigError::Variants(format!(
                        "template '{}' has no {} placeholder",
                        template, MEMBER_PLACEHOLDER
                    )));
                }
                if self.count == 0 || self.count > MAX_VARIANTS {
                    return Err(ConfigError::range_with_hint(
                        "variants.count",
                        self.count,
                        1,
                        MAX_VARIANTS,
                        "A template needs at least one member; ensembles are expanded in memory",
                    ));
                }
                let end = self.start.checked_add(self.count).ok_or_else(|| {
                    ConfigError::range_with_hint(
                        "variants.start",
                        self.start,
                        0,
                        usize::MAX - self.count,
                        "start + count must not overflow",
                    )
                })?;
                (self.start..end)
                    .map(|i| {
                        let member = format!("{:0width$}", i, width = self.width);
                        template.replace(MEMBER_PLACEHOLDER, &member)
                    })
                    .collect()
            }
        };

        let mut seen = HashSet::new();
        for variant in &variants {
            if variant.is_empty() {
                return Err(ConfigError::Variants("empty variant suffix".to_string()));
            }
            if variant.contains('/') || variant.contains('\\') {
                return Err(ConfigError::Variants(format!(
                    "variant '{}' contains a path separator",
                    variant
                )));
            }
            if !seen.insert(variant.as_str()) {
                return Err(ConfigError::Variants(format!(
                    "duplicate variant '{}'",
                    variant
                )));
            }
        }

        Ok(variants)
    }
}
