//! Test selection configuration.
//!
//! [`TestConfig`] is the serializable form supplied by the host.
//! [`TestConfig::compile`] validates it into [`FilterSettings`], which the
//! executor reads at the start of every batch.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Errors that can occur while loading or compiling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid {field} pattern: {source}")]
    InvalidPattern {
        field: &'static str,
        #[source]
        source: regex::Error,
    },
}

/// Host-supplied test selection settings. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TestConfig {
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    /// Regex matched against the full declaring class name.
    pub include_pattern: Option<String>,
    pub exclude_pattern: Option<String>,
    pub include_engines: Vec<String>,
    pub exclude_engines: Vec<String>,
    /// Echo captured test output to the log.
    pub display_test_output: bool,
}

impl TestConfig {
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(input)?)
    }

    /// Validate patterns and build the settings used by the filter chain.
    pub fn compile(&self) -> Result<FilterSettings, ConfigError> {
        Ok(FilterSettings {
            include_tags: to_set(&self.include_tags),
            exclude_tags: to_set(&self.exclude_tags),
            include_pattern: compile_pattern("include-pattern", self.include_pattern.as_deref())?,
            exclude_pattern: compile_pattern("exclude-pattern", self.exclude_pattern.as_deref())?,
            include_engines: to_set(&self.include_engines),
            exclude_engines: to_set(&self.exclude_engines),
            display_test_output: self.display_test_output,
        })
    }
}

fn to_set(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn compile_pattern(field: &'static str, pattern: Option<&str>) -> Result<Option<Regex>, ConfigError> {
    let Some(pattern) = pattern.filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    Regex::new(&format!("^(?:{pattern})$"))
        .map(Some)
        .map_err(|source| ConfigError::InvalidPattern { field, source })
}

/// Validated filter settings.
#[derive(Debug, Clone, Default)]
pub struct FilterSettings {
    pub include_tags: HashSet<String>,
    pub exclude_tags: HashSet<String>,
    pub include_pattern: Option<Regex>,
    pub exclude_pattern: Option<Regex>,
    pub include_engines: HashSet<String>,
    pub exclude_engines: HashSet<String>,
    pub display_test_output: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = TestConfig::from_json("{}").unwrap();
        assert_eq!(config, TestConfig::default());

        let settings = config.compile().unwrap();
        assert!(settings.include_tags.is_empty());
        assert!(settings.include_pattern.is_none());
        assert!(!settings.display_test_output);
    }

    #[test]
    fn reads_kebab_case_fields() {
        let config = TestConfig::from_json(
            r#"{
                "include-tags": ["fast", " "],
                "exclude-engines": ["spock"],
                "include-pattern": "org\\.acme\\..*",
                "display-test-output": true
            }"#,
        )
        .unwrap();
        let settings = config.compile().unwrap();

        assert_eq!(settings.include_tags, HashSet::from(["fast".to_string()]));
        assert!(settings.exclude_engines.contains("spock"));
        assert!(settings.display_test_output);
    }

    #[test]
    fn pattern_is_a_full_match() {
        let config = TestConfig {
            include_pattern: Some("org\\.acme\\.Foo.*".into()),
            ..TestConfig::default()
        };
        let pattern = config.compile().unwrap().include_pattern.unwrap();
        assert!(pattern.is_match("org.acme.FooTest"));
        assert!(!pattern.is_match("com.org.acme.FooTest"));
    }

    #[test]
    fn alternation_stays_anchored() {
        let config = TestConfig { exclude_pattern: Some("A|B".into()), ..TestConfig::default() };
        let pattern = config.compile().unwrap().exclude_pattern.unwrap();
        assert!(pattern.is_match("A"));
        assert!(!pattern.is_match("AB"));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let config = TestConfig { exclude_pattern: Some("(".into()), ..TestConfig::default() };
        let err = config.compile().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { field: "exclude-pattern", .. }));
    }

    #[test]
    fn invalid_json_is_reported() {
        assert!(matches!(TestConfig::from_json("{"), Err(ConfigError::InvalidJson(_))));
    }
}
