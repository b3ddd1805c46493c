//! Cursor-driven batch reader
//!
//! Produces a lazy sequence of row batches strictly older than a cutoff,
//! advancing a monotonic `(date, primary key)` cursor across calls. The
//! cursor guarantees strict forward progress: a row that keeps failing
//! downstream is never re-read within the same phase. An empty batch is
//! terminal for the phase.

use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use permafrost_db::{Connection, DatabaseGateway, Row, SqlBuilder, Value};

use crate::error::{ArchiveError, Result};

/// Monotonic `(date, primary key)` position within one phase's loop.
///
/// Starts empty and only moves forward; it is discarded at phase end.
#[derive(Debug, Clone, Default)]
pub struct BatchCursor {
    last_date: Option<Value>,
    last_pk: Option<Value>,
}

impl BatchCursor {
    /// Cursor values as a `(date, pk)` pair, once advanced at least once
    pub fn position(&self) -> Option<(Value, Value)> {
        match (&self.last_date, &self.last_pk) {
            (Some(d), Some(pk)) => Some((d.clone(), pk.clone())),
            _ => None,
        }
    }

    /// Advance past the given row (the last row of a processed batch)
    pub fn advance(&mut self, row: &Row, date_column: &str, pk_column: &str) -> Result<()> {
        let date = row.get_by_name(date_column).ok_or_else(|| {
            ArchiveError::config(format!("row is missing date column '{date_column}'"))
        })?;
        let pk = row.get_by_name(pk_column).ok_or_else(|| {
            ArchiveError::config(format!("row is missing primary key column '{pk_column}'"))
        })?;
        self.last_date = Some(date.clone());
        self.last_pk = Some(pk.clone());
        Ok(())
    }
}

/// Reads batches of rows older than a cutoff from one table
pub struct CursorBatchReader {
    gateway: Arc<DatabaseGateway>,
    connection: String,
    builder: SqlBuilder,
    table: String,
    date_column: String,
    pk_column: String,
    cutoff: NaiveDate,
}

impl CursorBatchReader {
    /// Create a reader over `table` on the given connection
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<DatabaseGateway>,
        connection: impl Into<String>,
        builder: SqlBuilder,
        table: impl Into<String>,
        date_column: impl Into<String>,
        pk_column: impl Into<String>,
        cutoff: NaiveDate,
    ) -> Self {
        Self {
            gateway,
            connection: connection.into(),
            builder,
            table: table.into(),
            date_column: date_column.into(),
            pk_column: pk_column.into(),
            cutoff,
        }
    }

    /// Fetch the next batch after `cursor`, at most `size` rows.
    ///
    /// Opens a fresh connection per call; nothing is retained across batches.
    pub async fn next(
        &self,
        size: u32,
        cursor: &BatchCursor,
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>> {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let stmt = self.builder.batch_select(
            &self.table,
            &self.date_column,
            &self.pk_column,
            Value::Date(self.cutoff),
            cursor.position(),
            size,
        )?;

        let conn = self.gateway.open(&self.connection).await?;
        let rows = conn.query(&stmt.sql, &stmt.params).await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permafrost_db::Value;

    #[test]
    fn test_cursor_starts_empty() {
        let cursor = BatchCursor::default();
        assert!(cursor.position().is_none());
    }

    #[test]
    fn test_cursor_advance() {
        let mut cursor = BatchCursor::default();
        let row = Row::new(
            vec!["id".into(), "created_at".into()],
            vec![Value::from(42_i64), Value::from("2024-02-01")],
        );

        cursor.advance(&row, "created_at", "id").unwrap();
        let (date, pk) = cursor.position().unwrap();
        assert_eq!(date, Value::from("2024-02-01"));
        assert_eq!(pk, Value::from(42_i64));
    }

    #[test]
    fn test_cursor_advance_missing_column() {
        let mut cursor = BatchCursor::default();
        let row = Row::new(vec!["id".into()], vec![Value::from(1_i64)]);
        assert!(cursor.advance(&row, "created_at", "id").is_err());
    }
}
