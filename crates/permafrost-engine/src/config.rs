//! Configuration binding for the permafrost CLI
//!
//! One YAML file carries the named connections, where settings come from
//! (inline list or the contractual settings table), CSV and retry options,
//! and the optional audit target. Connection URLs support `${VAR}` /
//! `${VAR:-default}` environment expansion so credentials stay out of the
//! file.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::batch::BatchSizePolicy;
use crate::csv::CsvOptions;
use crate::error::{ArchiveError, Result};
use crate::retry::RetryPolicies;
use crate::settings::ArchiveSetting;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

fn default_settings_table() -> String {
    "ArchiveSettings".to_string()
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Logical connection name → connection URL
    #[serde(default)]
    pub connections: HashMap<String, String>,

    /// Where archive settings come from
    #[serde(default)]
    pub settings: SettingsSourceConfig,

    /// CSV export options
    #[serde(default)]
    pub csv: CsvOptions,

    /// Retry policies (default plus per-operation overrides)
    #[serde(default)]
    pub retry: RetryPolicies,

    /// Batch-size adaptation bounds
    #[serde(default)]
    pub batch: BatchSizePolicy,

    /// Optional audit log target
    #[serde(default)]
    pub audit: Option<AuditConfig>,

    /// Optional command timeout for delete statements, in seconds
    #[serde(default)]
    pub delete_timeout_seconds: Option<u64>,
}

/// Where archive settings come from; a configured table wins over the
/// inline list
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsSourceConfig {
    /// Settings defined directly in the config file
    #[serde(default)]
    pub inline: Vec<ArchiveSetting>,

    /// Settings read from a database table
    #[serde(default)]
    pub table: Option<SettingsTableConfig>,
}

/// Settings table location
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsTableConfig {
    /// Connection the settings table lives on
    pub connection: String,
    /// Table name
    #[serde(default = "default_settings_table")]
    pub name: String,
}

/// Audit log target
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Connection the audit tables live on
    pub connection: String,
}

impl EngineConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ArchiveError::fs(format!("read {}", path.display()), e))?;
        let mut config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| ArchiveError::config(format!("{}: {e}", path.display())))?;

        for url in config.connections.values_mut() {
            *url = expand_env(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configured bounds
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.csv.validate()?;
        if self.batch.min == 0 {
            return Err(ArchiveError::config("batch: min must be positive"));
        }
        if self.batch.max < self.batch.min {
            return Err(ArchiveError::config(format!(
                "batch: max ({}) must be at least min ({})",
                self.batch.max, self.batch.min
            )));
        }
        if self.batch.target_seconds == 0 {
            return Err(ArchiveError::config("batch: target_seconds must be positive"));
        }
        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:-default}` against the process environment
pub fn expand_env(input: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config: EngineConfig = serde_yaml::from_str("connections: {}\n").unwrap();
        assert!(config.connections.is_empty());
        assert!(config.settings.inline.is_empty());
        assert!(config.settings.table.is_none());
        assert_eq!(config.csv.delimiter, ',');
        assert_eq!(config.csv.max_rows_per_file, 100_000);
        assert!(config.retry.default.enabled);
        assert_eq!(config.batch.min, 100);
        assert!(config.audit.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
connections:
  online: "postgres://localhost/online"
  history: "sqlite:/var/data/history.db"
settings:
  table:
    connection: history
csv:
  delimiter: ";"
  max_rows_per_file: 5000
retry:
  default:
    max_retry_count: 5
    retry_delay_seconds: 2
  overrides:
    events-Csv:
      enabled: false
batch:
  min: 200
  max: 1000
  target_seconds: 10
audit:
  connection: history
delete_timeout_seconds: 60
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.settings.table.as_ref().unwrap().name, "ArchiveSettings");
        assert_eq!(config.csv.delimiter, ';');
        assert_eq!(config.retry.for_operation("events-Archive").max_retry_count, 5);
        assert!(!config.retry.for_operation("events-Csv").enabled);
        assert_eq!(config.delete_timeout_seconds, Some(60));
        assert_eq!(config.audit.as_ref().unwrap().connection, "history");
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let config: EngineConfig =
            serde_yaml::from_str("batch:\n  min: 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: EngineConfig =
            serde_yaml::from_str("batch:\n  min: 500\n  max: 100\n").unwrap();
        assert!(config.validate().is_err());

        let config: EngineConfig =
            serde_yaml::from_str("retry:\n  default:\n    max_retry_count: 99\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("PERMAFROST_TEST_DB", "postgres://db.internal/x");
        assert_eq!(
            expand_env("${PERMAFROST_TEST_DB}"),
            "postgres://db.internal/x"
        );
        assert_eq!(
            expand_env("${PERMAFROST_TEST_MISSING:-sqlite:fallback.db}"),
            "sqlite:fallback.db"
        );
        assert_eq!(expand_env("${PERMAFROST_TEST_MISSING}"), "");
        assert_eq!(expand_env("plain"), "plain");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: std::result::Result<EngineConfig, _> =
            serde_yaml::from_str("bogus_key: 1\n");
        assert!(result.is_err());
    }
}
