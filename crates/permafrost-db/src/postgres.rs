//! PostgreSQL backend implementation for permafrost-db
//!
//! Thin backend over tokio-postgres. Deadlock victims and cancelled
//! statements are mapped onto the crate's error taxonomy so the retry layer
//! can classify them without touching driver types.

use async_trait::async_trait;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Convert a permafrost value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<i32>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
    }
}

/// Convert a tokio-postgres row to a permafrost Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

/// Convert one PostgreSQL column value to a permafrost Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(Value::Int16)
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(Value::Int32)
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Int64)
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Float64(f64::from(v)))
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Float64)
            .unwrap_or(Value::Null),
        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)
            .ok()
            .flatten()
            .map(Value::Decimal)
            .unwrap_or(Value::Null),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(Value::Date)
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .ok()
            .flatten()
            .map(Value::DateTimeTz)
            .unwrap_or(Value::Null),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(Value::Uuid)
            .unwrap_or(Value::Null),
        _ => {
            // Fall back to text for unknown types
            row.try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null)
        }
    }
}

fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if let Some(db_error) = e.as_db_error() {
        if db_error.code() == &SqlState::T_R_DEADLOCK_DETECTED {
            return Error::Deadlock;
        }
        if db_error.code() == &SqlState::QUERY_CANCELED {
            return Error::timeout(db_error.message().to_string());
        }
        let message = db_error.message().to_string();
        return Error::Query {
            message,
            sql: Some(sql.to_string()),
            source: Some(Box::new(e)),
        };
    }
    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }
    Error::Query {
        message: e.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: tokio_postgres::Client,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection").finish()
    }
}

impl PgConnection {
    /// Wrap an established tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self { client }
    }

    fn param_boxes(params: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
        params.iter().map(value_to_sql).collect()
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let boxed = Self::param_boxes(params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let pg_rows = self
            .client
            .query(sql, &refs)
            .await
            .map_err(|e| map_pg_error(e, sql))?;

        Ok(pg_rows.iter().map(pg_row_to_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let boxed = Self::param_boxes(params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        self.client
            .execute(sql, &refs)
            .await
            .map_err(|e| map_pg_error(e, sql))
    }
}

/// Connect to a PostgreSQL database
pub async fn connect(config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
    let connecting = tokio_postgres::connect(&config.url, tokio_postgres::NoTls);
    let (client, connection) =
        match tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connecting)
            .await
        {
            Ok(result) => {
                result.map_err(|e| Error::connection_with_source("failed to connect", e))?
            }
            Err(_) => {
                return Err(Error::connection(format!(
                    "connect timed out after {}ms",
                    config.connect_timeout_ms
                )))
            }
        };

    // The connection object drives the socket; it ends when the client drops.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "postgres connection task ended with error");
        }
    });

    Ok(Box::new(PgConnection::new(client)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversion_covers_all_variants() {
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Int16(1),
            Value::Int32(2),
            Value::Int64(3),
            Value::Float64(1.5),
            Value::String("hello".into()),
            Value::Bytes(vec![1, 2]),
            Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            Value::Uuid(uuid::Uuid::new_v4()),
        ];
        for value in &values {
            let _ = value_to_sql(value);
        }
    }
}
