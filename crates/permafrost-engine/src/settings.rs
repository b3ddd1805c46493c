//! Archive settings: the per-table contract driving a run
//!
//! Settings are created and mutated outside the engine; a run reads a
//! snapshot through [`SettingsProvider`] and never writes one back. Two
//! providers ship: a static one over the config file's inline list, and a
//! SQL one over the contractual `ArchiveSettings` table.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use permafrost_db::{dialect_for, Connection, DatabaseGateway, Row, SqlBuilder};

use crate::error::{ArchiveError, Result};

/// Default batch size when a setting requests `batch_size: 0`
pub const DEFAULT_BATCH_SIZE: u32 = 1000;

fn default_true() -> bool {
    true
}

/// Per-table archive contract; read-only during a run
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSetting {
    /// Stable identity of this setting
    #[serde(default)]
    pub id: i64,
    /// Whether this setting participates in runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Online-tier connection: logical name or full URL
    pub source_connection: String,
    /// History-tier connection: logical name or full URL
    pub target_connection: String,
    /// Table to archive; same name on both tiers
    pub table_name: String,
    /// Column carrying the row's age
    pub date_column: String,
    /// Unique primary-key column
    pub primary_key_column: String,
    /// Rows dated strictly before this leave the online tier
    pub online_cutoff: NaiveDate,
    /// Rows dated strictly before this leave the history tier
    pub history_cutoff: NaiveDate,
    /// Initial requested batch size; 0 means the engine default
    #[serde(default)]
    pub batch_size: u32,
    /// Whether to export aged history rows to CSV
    #[serde(default)]
    pub csv_enabled: bool,
    /// Root folder for CSV archives; required when `csv_enabled`
    #[serde(default)]
    pub csv_root_folder: Option<String>,
    /// Whether Phase 1 deletes moved rows from the online tier
    #[serde(default)]
    pub physical_delete_enabled: bool,
}

impl ArchiveSetting {
    /// The batch size Phase 1/2 loops start from
    pub fn effective_batch_size(&self) -> u32 {
        if self.batch_size > 0 {
            self.batch_size
        } else {
            DEFAULT_BATCH_SIZE
        }
    }

    /// Whether the cutoffs are ordered correctly.
    ///
    /// Cutoffs are date-only; a violation is a per-setting warning, not a
    /// run failure.
    pub fn cutoffs_valid(&self) -> bool {
        self.online_cutoff > self.history_cutoff
    }

    /// Structural validation, before any database is touched
    pub fn validate(&self) -> Result<()> {
        let require = |value: &str, what: &str| -> Result<()> {
            if value.trim().is_empty() {
                Err(ArchiveError::config(format!(
                    "setting '{}': {what} must not be empty",
                    self.table_name
                )))
            } else {
                Ok(())
            }
        };
        require(&self.table_name, "table_name")?;
        require(&self.date_column, "date_column")?;
        require(&self.primary_key_column, "primary_key_column")?;
        require(&self.source_connection, "source_connection")?;
        require(&self.target_connection, "target_connection")?;
        if self.csv_enabled
            && self
                .csv_root_folder
                .as_deref()
                .map_or(true, |f| f.trim().is_empty())
        {
            return Err(ArchiveError::config(format!(
                "setting '{}': csv_root_folder is required when csv_enabled",
                self.table_name
            )));
        }
        Ok(())
    }
}

/// Read-only source of archive settings
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Fetch all settings; the engine filters to enabled ones itself
    async fn list_all(&self, cancel: &CancellationToken) -> Result<Vec<ArchiveSetting>>;
}

/// Settings provider over a fixed in-memory list
pub struct StaticSettingsProvider {
    settings: Vec<ArchiveSetting>,
}

impl StaticSettingsProvider {
    /// Create a provider returning the given settings
    pub fn new(settings: Vec<ArchiveSetting>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SettingsProvider for StaticSettingsProvider {
    async fn list_all(&self, cancel: &CancellationToken) -> Result<Vec<ArchiveSetting>> {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        Ok(self.settings.clone())
    }
}

/// Settings provider over the contractual `ArchiveSettings` table
pub struct SqlSettingsProvider {
    gateway: Arc<DatabaseGateway>,
    connection: String,
    table: String,
}

impl SqlSettingsProvider {
    /// Read settings from `table` on the given connection
    pub fn new(
        gateway: Arc<DatabaseGateway>,
        connection: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            connection: connection.into(),
            table: table.into(),
        }
    }
}

#[async_trait]
impl SettingsProvider for SqlSettingsProvider {
    async fn list_all(&self, cancel: &CancellationToken) -> Result<Vec<ArchiveSetting>> {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let db_type = self.gateway.database_type(&self.connection)?;
        let builder = SqlBuilder::new(dialect_for(db_type));
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            builder.quote(&self.table)?,
            builder.quote("id")?,
        );

        let conn = self.gateway.open(&self.connection).await?;
        let rows = conn.query(&sql, &[]).await?;
        rows.iter().map(setting_from_row).collect()
    }
}

/// Map one `ArchiveSettings` row onto a setting
fn setting_from_row(row: &Row) -> Result<ArchiveSetting> {
    let text = |column: &str| -> Result<String> {
        row.get_by_name(column)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                ArchiveError::config(format!("settings row is missing column '{column}'"))
            })
    };
    let date = |column: &str| -> Result<NaiveDate> {
        row.get_by_name(column)
            .and_then(|v| v.as_date())
            .ok_or_else(|| {
                ArchiveError::config(format!("settings row has no valid date in '{column}'"))
            })
    };
    let flag = |column: &str| -> bool {
        row.get_by_name(column)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };

    Ok(ArchiveSetting {
        id: row.get_by_name("id").and_then(|v| v.as_i64()).unwrap_or(0),
        enabled: flag("enabled"),
        source_connection: text("sourceConnectionName")?,
        target_connection: text("targetConnectionName")?,
        table_name: text("tableName")?,
        date_column: text("dateColumn")?,
        primary_key_column: text("primaryKeyColumn")?,
        online_cutoff: date("onlineRetentionDate")?,
        history_cutoff: date("historyRetentionDate")?,
        batch_size: row
            .get_by_name("batchSize")
            .and_then(|v| v.as_i64())
            .map(|n| n.max(0) as u32)
            .unwrap_or(0),
        csv_enabled: flag("csvEnabled"),
        csv_root_folder: row
            .get_by_name("csvRootFolder")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty()),
        physical_delete_enabled: flag("isPhysicalDeleteEnabled"),
    })
}
