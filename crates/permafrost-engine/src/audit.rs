//! Run/detail audit log
//!
//! One parent row per run, one child row per setting per run, each carrying
//! the movement counters. The engine emits these in real time, but the audit
//! writer is not on the critical path: failures are logged by the caller and
//! never fail the run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use permafrost_db::{dialect_for, Connection, DatabaseGateway, SqlBuilder, Value};

use crate::error::Result;

/// Run and per-table outcome states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    /// Work is in flight
    Running,
    /// Everything completed
    Success,
    /// Some tables completed before one failed
    PartialFail,
    /// Nothing completed
    Fail,
    /// Setting was skipped (validation warning)
    Skipped,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Success => write!(f, "Success"),
            Self::PartialFail => write!(f, "PartialFail"),
            Self::Fail => write!(f, "Fail"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Parent audit row: one per run
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Run identity
    pub job_run_id: Uuid,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run ended, once it has
    pub ended_at: Option<DateTime<Utc>>,
    /// Current state
    pub status: AuditStatus,
    /// Host that executed the run
    pub host_name: String,
    /// Enabled settings in this run
    pub total_tables: u64,
    /// Settings that completed
    pub succeeded_tables: u64,
    /// Settings that failed
    pub failed_tables: u64,
    /// Free-form summary
    pub message: Option<String>,
}

impl RunRecord {
    /// Start a new run record on this host
    pub fn begin() -> Self {
        Self {
            job_run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            status: AuditStatus::Running,
            host_name: hostname(),
            total_tables: 0,
            succeeded_tables: 0,
            failed_tables: 0,
            message: None,
        }
    }
}

/// Snapshot of one table's movement counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Rows read from the online tier
    pub source_scanned: u64,
    /// Rows newly inserted into the history tier
    pub inserted_to_history: u64,
    /// Rows deleted from the online tier
    pub deleted_from_source: u64,
    /// Rows exported to CSV
    pub exported_to_csv: u64,
    /// Rows deleted from the history tier
    pub deleted_from_history: u64,
}

/// Live movement counters for one table, updated as phases progress
#[derive(Debug, Default)]
pub struct TableCounters {
    /// Rows read from the online tier
    pub source_scanned: AtomicU64,
    /// Rows newly inserted into the history tier
    pub inserted_to_history: AtomicU64,
    /// Rows deleted from the online tier
    pub deleted_from_source: AtomicU64,
    /// Rows exported to CSV
    pub exported_to_csv: AtomicU64,
    /// Rows deleted from the history tier
    pub deleted_from_history: AtomicU64,
}

impl TableCounters {
    /// Add to a counter
    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Read a consistent-enough snapshot for audit emission
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            source_scanned: self.source_scanned.load(Ordering::Relaxed),
            inserted_to_history: self.inserted_to_history.load(Ordering::Relaxed),
            deleted_from_source: self.deleted_from_source.load(Ordering::Relaxed),
            exported_to_csv: self.exported_to_csv.load(Ordering::Relaxed),
            deleted_from_history: self.deleted_from_history.load(Ordering::Relaxed),
        }
    }
}

/// Child audit row: one per setting per run
#[derive(Debug, Clone)]
pub struct DetailRecord {
    /// Run this row belongs to
    pub job_run_id: Uuid,
    /// Setting identity
    pub setting_id: i64,
    /// Archived table
    pub table_name: String,
    /// Current state
    pub status: AuditStatus,
    /// Movement counters so far
    pub counters: CounterSnapshot,
    /// Failure description, when failed
    pub error_message: Option<String>,
    /// When this setting started
    pub started_at: DateTime<Utc>,
    /// When this setting finished, once it has
    pub ended_at: Option<DateTime<Utc>>,
}

/// Sink for run/detail audit rows
#[async_trait]
pub trait AuditWriter: Send + Sync {
    /// Insert or update the parent run row
    async fn write_run(&self, run: &RunRecord) -> Result<()>;

    /// Insert or update one setting's child row
    async fn write_detail(&self, detail: &DetailRecord) -> Result<()>;
}

/// Audit writer that discards everything
#[derive(Debug, Clone, Default)]
pub struct NoopAuditWriter;

#[async_trait]
impl AuditWriter for NoopAuditWriter {
    async fn write_run(&self, _run: &RunRecord) -> Result<()> {
        Ok(())
    }

    async fn write_detail(&self, _detail: &DetailRecord) -> Result<()> {
        Ok(())
    }
}

const RUNS_TABLE: &str = "ArchiveRuns";
const DETAILS_TABLE: &str = "ArchiveRunDetails";

/// Audit writer over the `ArchiveRuns` / `ArchiveRunDetails` tables
pub struct SqlAuditWriter {
    gateway: Arc<DatabaseGateway>,
    connection: String,
}

impl SqlAuditWriter {
    /// Write audit rows through the given connection
    pub fn new(gateway: Arc<DatabaseGateway>, connection: impl Into<String>) -> Self {
        Self {
            gateway,
            connection: connection.into(),
        }
    }

    fn builder(&self) -> Result<SqlBuilder> {
        let db_type = self.gateway.database_type(&self.connection)?;
        Ok(SqlBuilder::new(dialect_for(db_type)))
    }
}

#[async_trait]
impl AuditWriter for SqlAuditWriter {
    async fn write_run(&self, run: &RunRecord) -> Result<()> {
        let builder = self.builder()?;
        let d = builder.dialect();
        let tbl = builder.quote(RUNS_TABLE)?;
        let conn = self.gateway.open(&self.connection).await?;

        let update_sql = format!(
            "UPDATE {tbl} SET {} = {}, {} = {}, {} = {}, {} = {}, {} = {}, {} = {} WHERE {} = {}",
            d.quote_identifier("endedAt"),
            d.placeholder(1),
            d.quote_identifier("status"),
            d.placeholder(2),
            d.quote_identifier("totalTables"),
            d.placeholder(3),
            d.quote_identifier("succeededTables"),
            d.placeholder(4),
            d.quote_identifier("failedTables"),
            d.placeholder(5),
            d.quote_identifier("message"),
            d.placeholder(6),
            d.quote_identifier("jobRunId"),
            d.placeholder(7),
        );
        let update_params = vec![
            Value::from(run.ended_at),
            Value::from(run.status.to_string()),
            Value::from(run.total_tables as i64),
            Value::from(run.succeeded_tables as i64),
            Value::from(run.failed_tables as i64),
            Value::from(run.message.clone()),
            Value::Uuid(run.job_run_id),
        ];
        if conn.execute(&update_sql, &update_params).await? > 0 {
            return Ok(());
        }

        let insert_sql = format!(
            "INSERT INTO {tbl} ({}) VALUES ({})",
            [
                "jobRunId",
                "startedAt",
                "endedAt",
                "status",
                "hostName",
                "totalTables",
                "succeededTables",
                "failedTables",
                "message",
            ]
            .iter()
            .map(|c| d.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", "),
            d.placeholder_list(1, 9),
        );
        let insert_params = vec![
            Value::Uuid(run.job_run_id),
            Value::from(run.started_at),
            Value::from(run.ended_at),
            Value::from(run.status.to_string()),
            Value::from(run.host_name.clone()),
            Value::from(run.total_tables as i64),
            Value::from(run.succeeded_tables as i64),
            Value::from(run.failed_tables as i64),
            Value::from(run.message.clone()),
        ];
        conn.execute(&insert_sql, &insert_params).await?;
        Ok(())
    }

    async fn write_detail(&self, detail: &DetailRecord) -> Result<()> {
        let builder = self.builder()?;
        let d = builder.dialect();
        let tbl = builder.quote(DETAILS_TABLE)?;
        let conn = self.gateway.open(&self.connection).await?;

        let update_sql = format!(
            "UPDATE {tbl} SET {} = {}, {} = {}, {} = {}, {} = {}, {} = {}, {} = {}, {} = {}, {} = {} \
             WHERE {} = {} AND {} = {}",
            d.quote_identifier("status"),
            d.placeholder(1),
            d.quote_identifier("sourceScanned"),
            d.placeholder(2),
            d.quote_identifier("insertedToHistory"),
            d.placeholder(3),
            d.quote_identifier("deletedFromSource"),
            d.placeholder(4),
            d.quote_identifier("exportedToCsv"),
            d.placeholder(5),
            d.quote_identifier("deletedFromHistory"),
            d.placeholder(6),
            d.quote_identifier("errorMessage"),
            d.placeholder(7),
            d.quote_identifier("endedAt"),
            d.placeholder(8),
            d.quote_identifier("jobRunId"),
            d.placeholder(9),
            d.quote_identifier("settingId"),
            d.placeholder(10),
        );
        let c = &detail.counters;
        let update_params = vec![
            Value::from(detail.status.to_string()),
            Value::from(c.source_scanned as i64),
            Value::from(c.inserted_to_history as i64),
            Value::from(c.deleted_from_source as i64),
            Value::from(c.exported_to_csv as i64),
            Value::from(c.deleted_from_history as i64),
            Value::from(detail.error_message.clone()),
            Value::from(detail.ended_at),
            Value::Uuid(detail.job_run_id),
            Value::from(detail.setting_id),
        ];
        if conn.execute(&update_sql, &update_params).await? > 0 {
            return Ok(());
        }

        let insert_sql = format!(
            "INSERT INTO {tbl} ({}) VALUES ({})",
            [
                "jobRunId",
                "settingId",
                "tableName",
                "status",
                "sourceScanned",
                "insertedToHistory",
                "deletedFromSource",
                "exportedToCsv",
                "deletedFromHistory",
                "errorMessage",
                "startedAt",
                "endedAt",
            ]
            .iter()
            .map(|col| d.quote_identifier(col))
            .collect::<Vec<_>>()
            .join(", "),
            d.placeholder_list(1, 12),
        );
        let insert_params = vec![
            Value::Uuid(detail.job_run_id),
            Value::from(detail.setting_id),
            Value::from(detail.table_name.clone()),
            Value::from(detail.status.to_string()),
            Value::from(c.source_scanned as i64),
            Value::from(c.inserted_to_history as i64),
            Value::from(c.deleted_from_source as i64),
            Value::from(c.exported_to_csv as i64),
            Value::from(c.deleted_from_history as i64),
            Value::from(detail.error_message.clone()),
            Value::from(detail.started_at),
            Value::from(detail.ended_at),
        ];
        conn.execute(&insert_sql, &insert_params).await?;
        Ok(())
    }
}

/// System hostname via the `hostname` command, falling back to "unknown"
pub fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(AuditStatus::Running.to_string(), "Running");
        assert_eq!(AuditStatus::Success.to_string(), "Success");
        assert_eq!(AuditStatus::PartialFail.to_string(), "PartialFail");
        assert_eq!(AuditStatus::Fail.to_string(), "Fail");
        assert_eq!(AuditStatus::Skipped.to_string(), "Skipped");
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = TableCounters::default();
        TableCounters::add(&counters.source_scanned, 100);
        TableCounters::add(&counters.source_scanned, 50);
        TableCounters::add(&counters.inserted_to_history, 140);

        let snap = counters.snapshot();
        assert_eq!(snap.source_scanned, 150);
        assert_eq!(snap.inserted_to_history, 140);
        assert_eq!(snap.deleted_from_source, 0);
    }

    #[test]
    fn test_run_record_begin() {
        let run = RunRecord::begin();
        assert_eq!(run.status, AuditStatus::Running);
        assert!(run.ended_at.is_none());
        assert!(!run.host_name.is_empty());
    }

    #[tokio::test]
    async fn test_noop_writer() {
        let writer = NoopAuditWriter;
        assert!(writer.write_run(&RunRecord::begin()).await.is_ok());
    }
}
