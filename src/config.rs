// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - built-in defaults
// - optional TOML file
// - NOCTUA_* environment overrides (`__` separates nesting)
// Command-line flags are applied on top by the CLI layer.
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::analysis::RuleNamePolicy;
use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_DASHBOARDS_FILE, DEFAULT_LIMIT, DEFAULT_METRICS_FILE, DEFAULT_RANGE_LITERAL,
    DEFAULT_RULES_FILE, DEFAULT_SUBQUERY_LITERAL, DEFAULT_SUBSTITUTIONS, DEFAULT_TIMEOUT_SECS,
};
use crate::error::ConfigError;
use crate::logging::{LogFormat, LogLevel};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "NOCTUA_";

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of one engine invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Snapshot file locations
    #[serde(default)]
    pub snapshots: SnapshotsConfig,

    /// Analysis bounds
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// CSV reader/writer tuning
    #[serde(default)]
    pub csv: CsvConfig,

    /// Identifier extraction rewrites
    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Self::figment().merge(Toml::file(path)).merge(Self::env()))
    }

    /// Defaults plus environment overrides, or a file when one is given
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::extract(Self::figment().merge(Self::env())),
        }
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    fn env() -> Env {
        Env::prefixed(ENV_PREFIX).split("__")
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.csv.batch_size == 0 {
            return Err(ConfigError::invalid_value("csv.batch_size", "batch size must be at least 1"));
        }

        if self.analysis.timeout.is_zero() {
            return Err(ConfigError::invalid_value("analysis.timeout", "timeout must be greater than zero"));
        }

        if let Some(pos) = self.extractor.substitutions.iter().position(|s| s.placeholder.is_empty()) {
            return Err(ConfigError::invalid_value(
                format!("extractor.substitutions[{pos}]"),
                "placeholder must not be empty",
            ));
        }

        for (field, value) in [
            ("snapshots.rules_file", &self.snapshots.rules_file),
            ("snapshots.metrics_file", &self.snapshots.metrics_file),
            ("snapshots.dashboards_file", &self.snapshots.dashboards_file),
        ] {
            if value.as_os_str().is_empty() {
                return Err(ConfigError::invalid_value(field, "path must not be empty"));
            }
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Snapshot Locations
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotsConfig {
    #[serde(default = "default_rules_file")]
    pub rules_file: PathBuf,

    #[serde(default = "default_metrics_file")]
    pub metrics_file: PathBuf,

    #[serde(default = "default_dashboards_file")]
    pub dashboards_file: PathBuf,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            rules_file: default_rules_file(),
            metrics_file: default_metrics_file(),
            dashboards_file: default_dashboards_file(),
        }
    }
}

// ----------------------------------------------------------------------------
// Analysis Bounds
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Maximum result cardinality of every analysis
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Deadline of one invocation
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Which rule names satisfy a dashboard reference
    #[serde(default)]
    pub rule_names: RuleNamePolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            timeout: default_timeout(),
            rule_names: RuleNamePolicy::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// CSV
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvConfig {
    /// Rows buffered between writer flushes
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

// ----------------------------------------------------------------------------
// Extractor
// ----------------------------------------------------------------------------

/// One template placeholder and the literal it is rewritten to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    pub placeholder: String,
    pub literal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Replacement for `[$var]` ranges
    #[serde(default = "default_range_literal")]
    pub range_literal: String,

    /// Replacement for `[$a:$b]` subqueries
    #[serde(default = "default_subquery_literal")]
    pub subquery_literal: String,

    /// Placeholder rewrites, earlier entries win on overlap
    #[serde(default = "default_substitutions")]
    pub substitutions: Vec<Substitution>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            range_literal: default_range_literal(),
            subquery_literal: default_subquery_literal(),
            substitutions: default_substitutions(),
        }
    }
}

// ----------------------------------------------------------------------------
// Logging
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default)]
    pub level: LogLevel,

    /// Output format (pretty, compact, json)
    #[serde(default)]
    pub format: LogFormat,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            colors: true,
            source_location: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Default Value Functions
// ----------------------------------------------------------------------------

fn default_rules_file() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_FILE)
}
fn default_metrics_file() -> PathBuf {
    PathBuf::from(DEFAULT_METRICS_FILE)
}
fn default_dashboards_file() -> PathBuf {
    PathBuf::from(DEFAULT_DASHBOARDS_FILE)
}
fn default_limit() -> usize {
    DEFAULT_LIMIT
}
fn default_timeout() -> Duration {
    Duration::from_secs(DEFAULT_TIMEOUT_SECS)
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_range_literal() -> String {
    DEFAULT_RANGE_LITERAL.to_string()
}
fn default_subquery_literal() -> String {
    DEFAULT_SUBQUERY_LITERAL.to_string()
}
fn default_substitutions() -> Vec<Substitution> {
    DEFAULT_SUBSTITUTIONS
        .iter()
        .map(|(placeholder, literal)| Substitution {
            placeholder: placeholder.to_string(),
            literal: literal.to_string(),
        })
        .collect()
}
fn default_true() -> bool {
    true
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.analysis.limit, 10);
        assert_eq!(config.analysis.timeout, Duration::from_secs(300));
        assert_eq!(config.csv.batch_size, 100);
        assert_eq!(config.snapshots.rules_file, PathBuf::from("rules.csv"));
        assert_eq!(config.extractor.substitutions.len(), 8);
        assert_eq!(config.extractor.substitutions[0].placeholder, "$__interval");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_str() {
        let toml = r#"
            [analysis]
            limit = 25
            timeout = "30s"
            rule_names = "recording"

            [csv]
            batch_size = 500

            [logging]
            format = "json"
        "#;

        let config = EngineConfig::from_str(toml).unwrap();
        assert_eq!(config.analysis.limit, 25);
        assert_eq!(config.analysis.timeout, Duration::from_secs(30));
        assert_eq!(config.analysis.rule_names, RuleNamePolicy::Recording);
        assert_eq!(config.csv.batch_size, 500);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.snapshots.metrics_file, PathBuf::from("metrics.csv"));
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::from_str("[csv]\nbatch_size = 0").is_err());
        assert!(EngineConfig::from_str("[logging]\nformat = \"xml\"").is_err());
        assert!(EngineConfig::from_str("[analysis]\ntimeout = \"0s\"").is_err());
        assert!(EngineConfig::from_str("[[extractor.substitutions]]\nplaceholder = \"\"\nliteral = \"5m\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/definitely/not/here/noctua.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noctua.toml");
        std::fs::write(&path, "[snapshots]\nrules_file = \"/tmp/r.csv\"\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.snapshots.rules_file, PathBuf::from("/tmp/r.csv"));
        assert_eq!(config.snapshots.dashboards_file, PathBuf::from("dashboards.csv"));
        assert_eq!(config.analysis.limit, 10);
    }

    #[test]
    fn test_generate_default_config_round_trips() {
        let rendered = EngineConfig::generate_default_config();
        assert!(rendered.contains("[analysis]"));
        let parsed = EngineConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }
}
