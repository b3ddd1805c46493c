//! The archive engine
//!
//! Iterates enabled settings in order and, per table, runs Phase 1 (move
//! online → history with target-side de-duplication, then optional source
//! delete) and Phase 2 (export history → CSV, then history delete), each
//! wrapped in its named retry policy. Tables are processed strictly one at a
//! time; a table failure halts the remaining settings, while a setting
//! validation warning only skips that setting.
//!
//! Crash safety without cross-database transactions: a batch is inserted into
//! the history tier before its source rows are deleted, and a CSV part file
//! is closed before its history rows are deleted. Re-running after a crash
//! re-reads the same rows, de-duplicates them against the target, and
//! overwrites the same part files.

use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use permafrost_db::{dialect_for, Connection, DatabaseGateway, Row, SqlBuilder, Value};

use crate::audit::{
    AuditStatus, AuditWriter, DetailRecord, NoopAuditWriter, RunRecord, TableCounters,
};
use crate::batch::{BatchSizeController, BatchSizePolicy};
use crate::csv::{CsvExporter, CsvOptions};
use crate::error::{ArchiveError, Result};
use crate::reader::{BatchCursor, CursorBatchReader};
use crate::retry::RetryExecutor;
use crate::settings::{ArchiveSetting, SettingsProvider};

/// Fixed timeout for history-tier bulk loads
const BULK_LOAD_TIMEOUT: Duration = Duration::from_secs(180);

/// Outcome of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Whether the run completed without a table failure
    pub succeeded: bool,
    /// One diagnostic message per processed setting
    pub messages: Vec<String>,
}

/// The archive execution engine; one instance drives one run at a time
pub struct ArchiveEngine {
    gateway: Arc<DatabaseGateway>,
    settings: Arc<dyn SettingsProvider>,
    audit: Arc<dyn AuditWriter>,
    retry: RetryExecutor,
    exporter: CsvExporter,
    batch_policy: BatchSizePolicy,
    delete_timeout: Option<Duration>,
}

impl ArchiveEngine {
    /// Create an engine with default retry, CSV and batch-size behavior
    pub fn new(gateway: Arc<DatabaseGateway>, settings: Arc<dyn SettingsProvider>) -> Self {
        Self {
            gateway,
            settings,
            audit: Arc::new(NoopAuditWriter),
            retry: RetryExecutor::new(Default::default()),
            exporter: CsvExporter::new(CsvOptions::default()),
            batch_policy: BatchSizePolicy::default(),
            delete_timeout: None,
        }
    }

    /// Attach an audit writer
    pub fn with_audit_writer(mut self, audit: Arc<dyn AuditWriter>) -> Self {
        self.audit = audit;
        self
    }

    /// Replace the retry executor
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the CSV export options
    pub fn with_csv_options(mut self, options: CsvOptions) -> Self {
        self.exporter = CsvExporter::new(options);
        self
    }

    /// Replace the batch-size policy
    pub fn with_batch_policy(mut self, policy: BatchSizePolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    /// Apply a command timeout to delete statements
    pub fn with_delete_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Execute one run over all enabled settings
    pub async fn run_once(&self, cancel: &CancellationToken) -> RunReport {
        let mut messages = Vec::new();
        let mut run = RunRecord::begin();
        info!(run_id = %run.job_run_id, host = %run.host_name, "archive run starting");
        self.emit_run(&run).await;

        let all = match self.settings.list_all(cancel).await {
            Ok(all) => all,
            Err(e) => {
                let cause = e.base_cause();
                error!(error = %cause, "failed to load settings");
                messages.push(format!("run failed: {cause}"));
                run.status = AuditStatus::Fail;
                run.ended_at = Some(Utc::now());
                run.message = messages.last().cloned();
                self.emit_run(&run).await;
                return RunReport {
                    succeeded: false,
                    messages,
                };
            }
        };

        let enabled: Vec<ArchiveSetting> = all.into_iter().filter(|s| s.enabled).collect();
        run.total_tables = enabled.len() as u64;

        if enabled.is_empty() {
            info!("no enabled settings");
            messages.push("no enabled settings".to_string());
            run.status = AuditStatus::Success;
            run.ended_at = Some(Utc::now());
            self.emit_run(&run).await;
            return RunReport {
                succeeded: true,
                messages,
            };
        }

        let mut halted = false;
        for setting in &enabled {
            let table = setting.table_name.clone();
            let counters = TableCounters::default();
            let mut detail = DetailRecord {
                job_run_id: run.job_run_id,
                setting_id: setting.id,
                table_name: table.clone(),
                status: AuditStatus::Running,
                counters: counters.snapshot(),
                error_message: None,
                started_at: Utc::now(),
                ended_at: None,
            };
            self.emit_detail(&detail).await;

            if let Err(e) = setting.validate() {
                let cause = e.base_cause();
                warn!(table = %table, error = %cause, "skipping invalid setting");
                messages.push(format!("[{table}] skipped: {cause}"));
                detail.status = AuditStatus::Skipped;
                detail.error_message = Some(cause);
                detail.ended_at = Some(Utc::now());
                self.emit_detail(&detail).await;
                continue;
            }

            if !setting.cutoffs_valid() {
                let msg = format!(
                    "[{table}] skipped: online retention must be later than history retention \
                     (online={}, history={})",
                    setting.online_cutoff, setting.history_cutoff
                );
                warn!(table = %table, online = %setting.online_cutoff, history = %setting.history_cutoff, "cutoffs out of order, skipping");
                messages.push(msg.clone());
                detail.status = AuditStatus::Skipped;
                detail.error_message = Some(msg);
                detail.ended_at = Some(Utc::now());
                self.emit_detail(&detail).await;
                continue;
            }

            match self.archive_table(setting, &counters, &mut detail, cancel).await {
                Ok(()) => {
                    run.succeeded_tables += 1;
                    messages.push(format!(
                        "{table} moved (online>{}; history>{})",
                        setting.online_cutoff, setting.history_cutoff
                    ));
                    detail.status = AuditStatus::Success;
                    detail.counters = counters.snapshot();
                    detail.ended_at = Some(Utc::now());
                    self.emit_detail(&detail).await;
                }
                Err(e) => {
                    run.failed_tables += 1;
                    let cause = e.base_cause();
                    error!(table = %table, error = %cause, "table archive failed, halting run");
                    messages.push(format!("[{table}] error: {cause}"));
                    detail.status = AuditStatus::Fail;
                    detail.counters = counters.snapshot();
                    detail.error_message = Some(cause);
                    detail.ended_at = Some(Utc::now());
                    self.emit_detail(&detail).await;
                    halted = true;
                    break;
                }
            }
        }

        run.ended_at = Some(Utc::now());
        run.status = if run.failed_tables > 0 {
            if run.succeeded_tables > 0 {
                AuditStatus::PartialFail
            } else {
                AuditStatus::Fail
            }
        } else {
            AuditStatus::Success
        };
        run.message = Some(format!(
            "{}/{} tables archived",
            run.succeeded_tables, run.total_tables
        ));
        self.emit_run(&run).await;
        info!(run_id = %run.job_run_id, status = %run.status, "archive run finished");

        RunReport {
            succeeded: !halted,
            messages,
        }
    }

    /// Phase 1 then, when configured, Phase 2 for one table, each under its
    /// named retry policy. Counters reach the audit log as each phase lands.
    async fn archive_table(
        &self,
        setting: &ArchiveSetting,
        counters: &TableCounters,
        detail: &mut DetailRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let table = &setting.table_name;

        self.retry
            .execute(&format!("{table}-Archive"), cancel, || {
                self.run_move_phase(setting, counters, cancel)
            })
            .await?;
        detail.counters = counters.snapshot();
        self.emit_detail(detail).await;

        if setting.csv_enabled {
            self.retry
                .execute(&format!("{table}-Csv"), cancel, || {
                    self.run_export_phase(setting, counters, cancel)
                })
                .await?;
            detail.counters = counters.snapshot();
            self.emit_detail(detail).await;
        }
        Ok(())
    }

    /// Phase 1: move rows older than the online cutoff from source to target
    async fn run_move_phase(
        &self,
        setting: &ArchiveSetting,
        counters: &TableCounters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(table = %setting.table_name, cutoff = %setting.online_cutoff, "move phase starting");

        let source_builder = self.builder_for(&setting.source_connection)?;
        let target_builder = self.builder_for(&setting.target_connection)?;
        let reader = CursorBatchReader::new(
            Arc::clone(&self.gateway),
            setting.source_connection.clone(),
            self.builder_for(&setting.source_connection)?,
            setting.table_name.clone(),
            setting.date_column.clone(),
            setting.primary_key_column.clone(),
            setting.online_cutoff,
        );

        let mut cursor = BatchCursor::default();
        let mut controller = BatchSizeController::new(setting.effective_batch_size(), self.batch_policy);

        loop {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            let batch = reader.next(controller.current(), &cursor, cancel).await?;
            let Some(last_row) = batch.last().cloned() else {
                break;
            };
            TableCounters::add(&counters.source_scanned, batch.len() as u64);

            let keys = batch_keys(&batch, &setting.primary_key_column, &setting.table_name)?;

            // duration spans the write+delete pair, not the read
            let started = Instant::now();
            let inserted = self
                .insert_missing(setting, &target_builder, &batch, &keys, cancel)
                .await?;
            TableCounters::add(&counters.inserted_to_history, inserted);

            if setting.physical_delete_enabled {
                let deleted = self
                    .delete_keys(&setting.source_connection, &source_builder, setting, &keys.raw, cancel)
                    .await?;
                TableCounters::add(&counters.deleted_from_source, deleted);
            }
            let elapsed = started.elapsed();

            cursor.advance(&last_row, &setting.date_column, &setting.primary_key_column)?;
            let next = controller.record(batch.len(), elapsed);
            debug!(
                table = %setting.table_name,
                rows = batch.len(),
                inserted,
                elapsed_ms = elapsed.as_millis() as u64,
                next_batch = next,
                "moved batch"
            );
        }
        Ok(())
    }

    /// Phase 2: export rows older than the history cutoff to CSV, then
    /// delete them from the target
    async fn run_export_phase(
        &self,
        setting: &ArchiveSetting,
        counters: &TableCounters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(table = %setting.table_name, cutoff = %setting.history_cutoff, "export phase starting");

        let root = setting.csv_root_folder.as_deref().ok_or_else(|| {
            ArchiveError::config(format!(
                "setting '{}': csv_root_folder is required when csv_enabled",
                setting.table_name
            ))
        })?;

        let target_builder = self.builder_for(&setting.target_connection)?;
        let reader = CursorBatchReader::new(
            Arc::clone(&self.gateway),
            setting.target_connection.clone(),
            self.builder_for(&setting.target_connection)?,
            setting.table_name.clone(),
            setting.date_column.clone(),
            setting.primary_key_column.clone(),
            setting.history_cutoff,
        );

        let mut cursor = BatchCursor::default();
        let mut controller = BatchSizeController::new(setting.effective_batch_size(), self.batch_policy);

        loop {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            let batch = reader.next(controller.current(), &cursor, cancel).await?;
            let Some(last_row) = batch.last().cloned() else {
                break;
            };

            let keys = batch_keys(&batch, &setting.primary_key_column, &setting.table_name)?;
            let (from_date, to_date) =
                batch_date_range(&batch, &setting.date_column, &setting.table_name)?;

            let started = Instant::now();
            let columns = last_row.columns().to_vec();
            let parts = self.exporter.write_parts(
                &batch,
                &columns,
                Path::new(root),
                &setting.table_name,
                from_date,
                to_date,
                cancel,
            )?;
            TableCounters::add(&counters.exported_to_csv, batch.len() as u64);

            // part files are closed; only now may the history rows go
            let deleted = self
                .delete_keys(&setting.target_connection, &target_builder, setting, &keys.raw, cancel)
                .await?;
            TableCounters::add(&counters.deleted_from_history, deleted);
            let elapsed = started.elapsed();

            cursor.advance(&last_row, &setting.date_column, &setting.primary_key_column)?;
            let next = controller.record(batch.len(), elapsed);
            debug!(
                table = %setting.table_name,
                rows = batch.len(),
                parts = parts.len(),
                deleted,
                elapsed_ms = elapsed.as_millis() as u64,
                next_batch = next,
                "exported batch"
            );
        }
        Ok(())
    }

    /// Insert the batch's rows that are not yet in the target.
    ///
    /// Idempotence across runs comes from this filter plus the dialect's
    /// INSERT-if-absent form; neither needs a cross-database transaction.
    async fn insert_missing(
        &self,
        setting: &ArchiveSetting,
        builder: &SqlBuilder,
        batch: &[Row],
        keys: &BatchKeys,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let conn = self.gateway.open(&setting.target_connection).await?;

        let mut existing: HashSet<String> = HashSet::new();
        for stmt in builder.existing_keys(
            &setting.table_name,
            &setting.primary_key_column,
            &keys.raw,
        )? {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            for row in conn.query(&stmt.sql, &stmt.params).await? {
                if let Some(key) = row.get(0).and_then(Value::key_string) {
                    existing.insert(key);
                }
            }
        }

        let fresh: Vec<&Row> = batch
            .iter()
            .zip(&keys.canonical)
            .filter(|(_, key)| !existing.contains(key.as_str()))
            .map(|(row, _)| row)
            .collect();
        if fresh.is_empty() {
            debug!(table = %setting.table_name, "all rows already in target, bulk load skipped");
            return Ok(0);
        }

        let columns = fresh[0].columns().to_vec();
        let mut inserted = 0_u64;
        for stmt in builder.insert_if_absent(
            &setting.table_name,
            &columns,
            &setting.primary_key_column,
            &fresh,
        )? {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let affected =
                match tokio::time::timeout(BULK_LOAD_TIMEOUT, conn.execute(&stmt.sql, &stmt.params))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(permafrost_db::Error::timeout(format!(
                            "bulk load into {} exceeded {}s",
                            setting.table_name,
                            BULK_LOAD_TIMEOUT.as_secs()
                        ))
                        .into())
                    }
                };
            inserted += affected;
        }
        Ok(inserted)
    }

    /// Delete the given primary keys from one tier, in bounded chunks
    async fn delete_keys(
        &self,
        connection: &str,
        builder: &SqlBuilder,
        setting: &ArchiveSetting,
        keys: &[Value],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let conn = self.gateway.open(connection).await?;

        let mut deleted = 0_u64;
        for stmt in builder.delete_in(&setting.table_name, &setting.primary_key_column, keys)? {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let affected = match self.delete_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, conn.execute(&stmt.sql, &stmt.params)).await {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(permafrost_db::Error::timeout(format!(
                                "delete from {} exceeded {}s",
                                setting.table_name,
                                limit.as_secs()
                            ))
                            .into())
                        }
                    }
                }
                None => conn.execute(&stmt.sql, &stmt.params).await?,
            };
            deleted += affected;
        }
        Ok(deleted)
    }

    fn builder_for(&self, connection: &str) -> Result<SqlBuilder> {
        let db_type = self.gateway.database_type(connection)?;
        Ok(SqlBuilder::new(dialect_for(db_type)))
    }

    async fn emit_run(&self, run: &RunRecord) {
        if let Err(e) = self.audit.write_run(run).await {
            warn!(error = %e, "audit run write failed");
        }
    }

    async fn emit_detail(&self, detail: &DetailRecord) {
        if let Err(e) = self.audit.write_detail(detail).await {
            warn!(error = %e, "audit detail write failed");
        }
    }
}

/// A batch's primary keys in raw and canonical-text form
#[derive(Debug)]
struct BatchKeys {
    raw: Vec<Value>,
    canonical: Vec<String>,
}

/// Collect the batch's primary keys; a NULL or blank key fails the batch
fn batch_keys(batch: &[Row], pk_column: &str, table: &str) -> Result<BatchKeys> {
    let mut raw = Vec::with_capacity(batch.len());
    let mut canonical = Vec::with_capacity(batch.len());
    for row in batch {
        let value = row.get_by_name(pk_column).ok_or_else(|| {
            ArchiveError::config(format!(
                "{table}: row is missing primary key column '{pk_column}'"
            ))
        })?;
        let key = value.key_string().ok_or_else(|| {
            ArchiveError::config(format!("{table}: blank primary key value in '{pk_column}'"))
        })?;
        raw.push(value.clone());
        canonical.push(key);
    }
    Ok(BatchKeys { raw, canonical })
}

/// Min and max of the batch's date column
fn batch_date_range(
    batch: &[Row],
    date_column: &str,
    table: &str,
) -> Result<(NaiveDate, NaiveDate)> {
    let mut min: Option<NaiveDate> = None;
    let mut max: Option<NaiveDate> = None;
    for row in batch {
        let date = row
            .get_by_name(date_column)
            .and_then(Value::as_date)
            .ok_or_else(|| {
                ArchiveError::config(format!(
                    "{table}: row has no usable date in '{date_column}'"
                ))
            })?;
        min = Some(min.map_or(date, |m| m.min(date)));
        max = Some(max.map_or(date, |m| m.max(date)));
    }
    match (min, max) {
        (Some(min), Some(max)) => Ok((min, max)),
        _ => Err(ArchiveError::config(format!("{table}: empty batch"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, date: &str) -> Row {
        Row::new(
            vec!["id".into(), "created_at".into()],
            vec![Value::from(id), Value::from(date)],
        )
    }

    #[test]
    fn test_batch_keys() {
        let batch = vec![row(1, "2024-01-01"), row(2, "2024-01-02")];
        let keys = batch_keys(&batch, "id", "events").unwrap();
        assert_eq!(keys.raw.len(), 2);
        assert_eq!(keys.canonical, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_batch_keys_blank_pk_fails() {
        let batch = vec![Row::new(
            vec!["id".into(), "created_at".into()],
            vec![Value::Null, Value::from("2024-01-01")],
        )];
        let err = batch_keys(&batch, "id", "events").unwrap_err();
        assert!(err.to_string().contains("blank primary key"));
    }

    #[test]
    fn test_batch_date_range() {
        let batch = vec![
            row(1, "2022-03-09"),
            row(2, "2022-03-01"),
            row(3, "2022-03-28"),
        ];
        let (from, to) = batch_date_range(&batch, "created_at", "events").unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2022, 3, 1).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2022, 3, 28).unwrap());
    }

    #[test]
    fn test_batch_date_range_rejects_bad_dates() {
        let batch = vec![row(1, "not a date")];
        assert!(batch_date_range(&batch, "created_at", "events").is_err());
    }
}
