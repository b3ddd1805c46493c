//! SQLite backend implementation for permafrost-db
//!
//! Embedded backend over rusqlite. rusqlite is synchronous, so calls run
//! inline under a short-lived lock with no await points while it is held.

use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Convert a permafrost value to an owned rusqlite value
fn to_sqlite(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Int16(n) => Sql::Integer(i64::from(*n)),
        Value::Int32(n) => Sql::Integer(i64::from(*n)),
        Value::Int64(n) => Sql::Integer(*n),
        Value::Float64(n) => Sql::Real(*n),
        Value::Decimal(d) => Sql::Text(d.to_string()),
        Value::String(s) => Sql::Text(s.clone()),
        Value::Bytes(b) => Sql::Blob(b.clone()),
        // ISO-8601 text keeps date ordering lexicographic
        Value::Date(d) => Sql::Text(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(dt) => Sql::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        Value::DateTimeTz(dt) => Sql::Text(dt.to_rfc3339()),
        Value::Uuid(u) => Sql::Text(u.to_string()),
    }
}

/// Convert a rusqlite value to a permafrost value
fn from_sqlite(value: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as Sql;
    match value {
        Sql::Null => Value::Null,
        Sql::Integer(n) => Value::Int64(n),
        Sql::Real(n) => Value::Float64(n),
        Sql::Text(s) => Value::String(s),
        Sql::Blob(b) => Value::Bytes(b),
    }
}

fn map_sqlite_error(e: rusqlite::Error, sql: &str) -> Error {
    let locked = matches!(
        &e,
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    );
    if locked {
        Error::connection_with_source("database is locked", e)
    } else {
        Error::Query {
            message: e.to_string(),
            sql: Some(sql.to_string()),
            source: Some(Box::new(e)),
        }
    }
}

/// SQLite connection implementation
pub struct SqliteConnection {
    conn: Mutex<rusqlite::Connection>,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection").finish()
    }
}

impl SqliteConnection {
    /// Open (or create) a database file; `:memory:` opens a throwaway database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = rusqlite::Connection::open(path.as_ref())
            .map_err(|e| Error::connection_with_source("failed to open sqlite database", e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::connection_with_source("failed to set busy timeout", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(|e| map_sqlite_error(e, sql))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter().map(to_sqlite)))
            .map_err(|e| map_sqlite_error(e, sql))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| map_sqlite_error(e, sql))? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                let value: rusqlite::types::Value =
                    row.get(idx).map_err(|e| map_sqlite_error(e, sql))?;
                values.push(from_sqlite(value));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(sql, rusqlite::params_from_iter(params.iter().map(to_sqlite)))
            .map_err(|e| map_sqlite_error(e, sql))?;
        Ok(affected as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn fixture() -> SqliteConnection {
        let conn = SqliteConnection::open(":memory:").unwrap();
        conn.execute(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, created_at TEXT, note TEXT, payload BLOB)",
            &[],
        )
        .await
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_execute_and_query_roundtrip() {
        let conn = fixture().await;

        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let affected = conn
            .execute(
                "INSERT INTO events (id, created_at, note, payload) VALUES (?, ?, ?, ?)",
                &[
                    Value::from(1_i64),
                    Value::from(date),
                    Value::from("hello"),
                    Value::from(vec![1_u8, 2, 3]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = conn
            .query("SELECT * FROM events WHERE id = ?", &[Value::from(1_i64)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns(), &["id", "created_at", "note", "payload"]);
        assert_eq!(rows[0].get_by_name("id"), Some(&Value::Int64(1)));
        assert_eq!(
            rows[0].get_by_name("created_at"),
            Some(&Value::String("2024-01-15".into()))
        );
        assert_eq!(
            rows[0].get_by_name("created_at").unwrap().as_date(),
            Some(date)
        );
        assert_eq!(
            rows[0].get_by_name("payload"),
            Some(&Value::Bytes(vec![1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn test_query_scalar() {
        let conn = fixture().await;
        for id in 1..=3_i64 {
            conn.execute(
                "INSERT INTO events (id, created_at) VALUES (?, ?)",
                &[Value::from(id), Value::from("2024-01-01")],
            )
            .await
            .unwrap();
        }

        let count = conn
            .query_scalar("SELECT COUNT(*) FROM events", &[])
            .await
            .unwrap();
        assert_eq!(count.and_then(|v| v.as_i64()), Some(3));
    }

    #[tokio::test]
    async fn test_null_values() {
        let conn = fixture().await;
        conn.execute(
            "INSERT INTO events (id, created_at, note) VALUES (?, ?, ?)",
            &[Value::from(1_i64), Value::from("2024-01-01"), Value::Null],
        )
        .await
        .unwrap();

        let row = conn
            .query_one("SELECT note FROM events", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(row.get(0).unwrap().is_null());
    }

    #[tokio::test]
    async fn test_query_error_carries_sql() {
        let conn = fixture().await;
        let err = conn.query("SELECT * FROM nope", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Query { .. }));
    }
}
