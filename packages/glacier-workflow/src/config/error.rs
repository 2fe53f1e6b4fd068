//! Configuration error types

use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    /// Missing version field in YAML
    #[error("Missing 'version' field in workflow file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    /// Unsupported version
    #[error("Unsupported workflow version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    /// Run flag for a group no stage belongs to
    #[error("Unknown run flag group '{group}'. {suggestion}")]
    UnknownGroup { group: String, suggestion: String },

    /// Enabled stage whose prerequisite is disabled (strict mode)
    #[error("Stage '{stage}' is enabled but its prerequisite '{prerequisite}' is disabled. {hint}")]
    DisabledPrerequisite {
        stage: String,
        prerequisite: String,
        hint: String,
    },

    /// Bad variant enumeration
    #[error("Invalid variants: {0}")]
    Variants(String),

    /// Missing required parameter or path
    #[error("Missing required setting '{0}'")]
    MissingSetting(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Create a range error with a hint
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }

    /// Create an unknown group error with suggestion
    pub fn unknown_group_with_suggestion(group: impl Into<String>, valid_groups: &[String]) -> Self {
        let group = group.into();
        let suggestion = find_closest_match(&group, valid_groups);
        Self::UnknownGroup { group, suggestion }
    }
}

/// Find closest match using simple edit distance
pub(crate) fn find_closest_match(target: &str, candidates: &[String]) -> String {
    candidates
        .iter()
        .min_by_key(|candidate| levenshtein_distance(target, candidate))
        .map(|closest| format!("Did you mean '{}'?", closest))
        .unwrap_or_else(|| "No valid names available".to_string())
}

/// Simple Levenshtein distance implementation
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let a: Vec<char> = s1.chars().collect();
    let b: Vec<char> = s2.chars().collect();
    let mut matrix = vec![vec![0; b.len() + 1]; a.len() + 1];

    for (i, row) in matrix.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b.len() {
        matrix[0][j] = j;
    }

    for i in 0..a.len() {
        for j in 0..b.len() {
            let cost = if a[i] == b[j] { 0 } else { 1 };
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1) // deletion
                .min(matrix[i + 1][j] + 1) // insertion
                .min(matrix[i][j] + cost); // substitution
        }
    }

    matrix[a.len()][b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("inversion", "inversion"), 0);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("glaciér", "glacier"), 1);
    }

    #[test]
    fn test_closest_match() {
        let groups = vec![
            "gis_prepro".to_string(),
            "climate_prepro".to_string(),
            "inversion".to_string(),
        ];

        let suggestion = find_closest_match("inverson", &groups);
        assert!(suggestion.contains("inversion"));
    }

    #[test]
    fn test_closest_match_empty_candidates() {
        let suggestion = find_closest_match("past", &[]);
        assert!(suggestion.contains("No valid names"));
    }

    #[test]
    fn test_range_error_formatting() {
        let err = ConfigError::range_with_hint("num_workers", 512, 0, 256, "0 means all cores");

        let msg = err.to_string();
        assert!(msg.contains("num_workers"));
        assert!(msg.contains("512"));
        assert!(msg.contains("0..=256"));
    }

    #[test]
    fn test_unsupported_version_error() {
        let err = ConfigError::UnsupportedVersion {
            found: 2,
            supported: vec![1],
        };

        let msg = err.to_string();
        assert!(msg.contains("version 2"));
        assert!(msg.contains("Supported versions: 1"));
    }

    #[test]
    fn test_unknown_group_error() {
        let err = ConfigError::unknown_group_with_suggestion("glaicer", &["glacier".to_string()]);
        let msg = err.to_string();
        assert!(msg.contains("glaicer"));
        assert!(msg.contains("Did you mean 'glacier'"));
    }
}
