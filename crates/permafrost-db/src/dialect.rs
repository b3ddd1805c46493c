//! SQL dialect abstraction for permafrost-db
//!
//! The archive engine emits a deliberately small SQL surface: cursor-batch
//! SELECTs, key-existence probes, multi-row INSERT-if-absent, and DELETE-IN.
//! Each dialect hand-builds those statements with strict identifier quoting;
//! values never appear in SQL text, only as parameters.

use crate::connection::DatabaseType;

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a parameter (e.g., $1, ?, @p1); 1-based
    fn placeholder(&self, index: usize) -> String;

    /// Comma-joined list of `count` placeholders starting at 1-based `start`
    fn placeholder_list(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Expression casting `expr` to the dialect's text type
    fn cast_to_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS TEXT)")
    }

    /// Table hint applied after the FROM clause of batch reads.
    ///
    /// SQL Server skips row-locked rows with READPAST so a batch read never
    /// stalls behind a concurrent writer; a skipped row is re-read on the
    /// next run. Other backends read past writers already.
    fn read_past_hint(&self) -> &'static str {
        ""
    }

    /// Row-limit fragment placed right after SELECT (SQL Server TOP)
    fn select_limit_prefix(&self, _limit: u32) -> String {
        String::new()
    }

    /// Row-limit fragment appended after ORDER BY (LIMIT)
    fn select_limit_suffix(&self, limit: u32) -> String {
        format!(" LIMIT {limit}")
    }

    /// Multi-row INSERT that skips rows whose primary key already exists.
    ///
    /// `columns` and `pk_column` are unquoted identifiers; placeholders are
    /// numbered row-major across `row_count` rows.
    fn insert_if_absent_sql(
        &self,
        table: &str,
        columns: &[String],
        pk_column: &str,
        row_count: usize,
    ) -> String;
}

fn values_clause(dialect: &dyn SqlDialect, row_count: usize, column_count: usize) -> String {
    (0..row_count)
        .map(|r| {
            format!(
                "({})",
                dialect.placeholder_list(r * column_count + 1, column_count)
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ===========================================================================
// PostgreSQL
// ===========================================================================

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn insert_if_absent_sql(
        &self,
        table: &str,
        columns: &[String],
        pk_column: &str,
        row_count: usize,
    ) -> String {
        let cols: Vec<_> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO NOTHING",
            self.quote_identifier(table),
            cols.join(", "),
            values_clause(self, row_count, columns.len()),
            self.quote_identifier(pk_column),
        )
    }
}

// ===========================================================================
// SQLite
// ===========================================================================

/// SQLite dialect
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn insert_if_absent_sql(
        &self,
        table: &str,
        columns: &[String],
        _pk_column: &str,
        row_count: usize,
    ) -> String {
        let cols: Vec<_> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES {}",
            self.quote_identifier(table),
            cols.join(", "),
            values_clause(self, row_count, columns.len()),
        )
    }
}

// ===========================================================================
// SQL Server
// ===========================================================================

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@p{index}")
    }

    fn cast_to_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS NVARCHAR(MAX))")
    }

    fn read_past_hint(&self) -> &'static str {
        " WITH (READPAST)"
    }

    fn select_limit_prefix(&self, limit: u32) -> String {
        format!("TOP ({limit}) ")
    }

    fn select_limit_suffix(&self, _limit: u32) -> String {
        String::new()
    }

    fn insert_if_absent_sql(
        &self,
        table: &str,
        columns: &[String],
        pk_column: &str,
        row_count: usize,
    ) -> String {
        let tbl = self.quote_identifier(table);
        let cols: Vec<_> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        let pk = self.quote_identifier(pk_column);
        format!(
            "INSERT INTO {tbl} ({cols}) SELECT {src_cols} FROM (VALUES {values}) AS src ({cols}) \
             WHERE NOT EXISTS (SELECT 1 FROM {tbl} WHERE {tbl}.{pk} = src.{pk})",
            cols = cols.join(", "),
            src_cols = cols
                .iter()
                .map(|c| format!("src.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
            values = values_clause(self, row_count, columns.len()),
        )
    }
}

/// Get the dialect for a database type
pub fn dialect_for(db_type: DatabaseType) -> Box<dyn SqlDialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgresDialect),
        DatabaseType::Sqlite => Box::new(SqliteDialect),
        DatabaseType::SqlServer => Box::new(SqlServerDialect),
        // Default to PostgreSQL quoting for anything unrecognized
        DatabaseType::Unknown => Box::new(PostgresDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_dialect() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.quote_identifier("events"), "\"events\"");
        assert_eq!(dialect.quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(dialect.placeholder(3), "$3");
        assert_eq!(dialect.placeholder_list(2, 3), "$2, $3, $4");
        assert_eq!(dialect.select_limit_suffix(50), " LIMIT 50");
        assert_eq!(dialect.select_limit_prefix(50), "");
        assert_eq!(dialect.read_past_hint(), "");
    }

    #[test]
    fn test_sqlite_dialect() {
        let dialect = SqliteDialect;
        assert_eq!(dialect.quote_identifier("events"), "\"events\"");
        assert_eq!(dialect.placeholder(3), "?");
        assert_eq!(dialect.placeholder_list(1, 3), "?, ?, ?");
    }

    #[test]
    fn test_sqlserver_dialect() {
        let dialect = SqlServerDialect;
        assert_eq!(dialect.quote_identifier("events"), "[events]");
        assert_eq!(dialect.quote_identifier("we]ird"), "[we]]ird]");
        assert_eq!(dialect.placeholder(3), "@p3");
        assert_eq!(dialect.select_limit_prefix(50), "TOP (50) ");
        assert_eq!(dialect.select_limit_suffix(50), "");
        assert_eq!(dialect.read_past_hint(), " WITH (READPAST)");
        assert_eq!(
            dialect.cast_to_text("[id]"),
            "CAST([id] AS NVARCHAR(MAX))"
        );
    }

    #[test]
    fn test_postgres_insert_if_absent() {
        let sql = PostgresDialect.insert_if_absent_sql(
            "events",
            &["id".into(), "note".into()],
            "id",
            2,
        );
        assert_eq!(
            sql,
            "INSERT INTO \"events\" (\"id\", \"note\") VALUES ($1, $2), ($3, $4) \
             ON CONFLICT (\"id\") DO NOTHING"
        );
    }

    #[test]
    fn test_sqlite_insert_if_absent() {
        let sql = SqliteDialect.insert_if_absent_sql(
            "events",
            &["id".into(), "note".into()],
            "id",
            2,
        );
        assert_eq!(
            sql,
            "INSERT OR IGNORE INTO \"events\" (\"id\", \"note\") VALUES (?, ?), (?, ?)"
        );
    }

    #[test]
    fn test_sqlserver_insert_if_absent() {
        let sql = SqlServerDialect.insert_if_absent_sql(
            "events",
            &["id".into(), "note".into()],
            "id",
            1,
        );
        assert!(sql.starts_with("INSERT INTO [events] ([id], [note]) SELECT src.[id], src.[note]"));
        assert!(sql.contains("FROM (VALUES (@p1, @p2)) AS src ([id], [note])"));
        assert!(sql.contains("WHERE NOT EXISTS (SELECT 1 FROM [events] WHERE [events].[id] = src.[id])"));
    }

    #[test]
    fn test_dialect_for() {
        assert_eq!(dialect_for(DatabaseType::PostgreSQL).name(), "PostgreSQL");
        assert_eq!(dialect_for(DatabaseType::Sqlite).name(), "SQLite");
        assert_eq!(dialect_for(DatabaseType::SqlServer).name(), "SQL Server");
        assert_eq!(dialect_for(DatabaseType::Unknown).name(), "PostgreSQL");
    }
}
