//! Statement builder for permafrost-db
//!
//! Composes the engine's SQL from dialect primitives. Identifiers come from
//! operator-managed settings, not user input, but they are still run through
//! an allow-list before being quoted; everything else travels as parameters.
//!
//! Every IN-list statement is chunked at [`MAX_PARAMS_PER_COMMAND`] to stay
//! safely under vendor parameter limits (typically 2100).

use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Upper bound on bind parameters per generated command
pub const MAX_PARAMS_PER_COMMAND: usize = 1000;

/// A generated SQL statement with its bind parameters
#[derive(Debug, Clone)]
pub struct Statement {
    /// SQL text with dialect placeholders
    pub sql: String,
    /// Bind parameters, in placeholder order
    pub params: Vec<Value>,
}

/// Builds the engine's statements for one SQL dialect
pub struct SqlBuilder {
    dialect: Box<dyn SqlDialect>,
}

impl SqlBuilder {
    /// Create a builder over the given dialect
    pub fn new(dialect: Box<dyn SqlDialect>) -> Self {
        Self { dialect }
    }

    /// The dialect this builder emits SQL for
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Validate and quote an identifier
    pub fn quote(&self, name: &str) -> Result<String> {
        check_identifier(name)?;
        Ok(self.dialect.quote_identifier(name))
    }

    /// Batch read of rows strictly older than `cutoff`, resuming after the
    /// monotonic `(date, primary key)` cursor when one is present.
    pub fn batch_select(
        &self,
        table: &str,
        date_column: &str,
        pk_column: &str,
        cutoff: Value,
        cursor: Option<(Value, Value)>,
        limit: u32,
    ) -> Result<Statement> {
        let tbl = self.quote(table)?;
        let date_col = self.quote(date_column)?;
        let pk_col = self.quote(pk_column)?;
        let d = self.dialect.as_ref();

        let mut params = vec![cutoff];
        let mut sql = format!(
            "SELECT {prefix}* FROM {tbl}{hint} WHERE {date_col} < {p1}",
            prefix = d.select_limit_prefix(limit),
            hint = d.read_past_hint(),
            p1 = d.placeholder(1),
        );

        if let Some((last_date, last_pk)) = cursor {
            sql.push_str(&format!(
                " AND (({date_col} > {p2}) OR ({date_col} = {p3} AND {pk_col} > {p4}))",
                p2 = d.placeholder(2),
                p3 = d.placeholder(3),
                p4 = d.placeholder(4),
            ));
            params.push(last_date.clone());
            params.push(last_date);
            params.push(last_pk);
        }

        sql.push_str(&format!(
            " ORDER BY {date_col} ASC, {pk_col} ASC{suffix}",
            suffix = d.select_limit_suffix(limit),
        ));

        Ok(Statement { sql, params })
    }

    /// Probe which of `keys` already exist in `table`, as canonical text.
    ///
    /// Returns one statement per chunk of at most [`MAX_PARAMS_PER_COMMAND`]
    /// keys; each result row carries the key cast to text in column 0.
    pub fn existing_keys(
        &self,
        table: &str,
        pk_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Statement>> {
        let tbl = self.quote(table)?;
        let pk_col = self.quote(pk_column)?;
        let d = self.dialect.as_ref();

        let mut statements = Vec::new();
        for chunk in keys.chunks(MAX_PARAMS_PER_COMMAND) {
            let sql = format!(
                "SELECT {cast} FROM {tbl} WHERE {pk_col} IN ({list})",
                cast = d.cast_to_text(&pk_col),
                list = d.placeholder_list(1, chunk.len()),
            );
            statements.push(Statement {
                sql,
                params: chunk.to_vec(),
            });
        }
        Ok(statements)
    }

    /// Multi-row INSERT of `rows` into `table`, skipping rows whose primary
    /// key already exists. Rows are chunked so each statement stays under
    /// the parameter limit.
    pub fn insert_if_absent(
        &self,
        table: &str,
        columns: &[String],
        pk_column: &str,
        rows: &[&Row],
    ) -> Result<Vec<Statement>> {
        check_identifier(table)?;
        check_identifier(pk_column)?;
        for column in columns {
            check_identifier(column)?;
        }
        if columns.is_empty() {
            return Err(Error::config(format!("no columns to insert into {table}")));
        }

        let rows_per_statement = (MAX_PARAMS_PER_COMMAND / columns.len()).max(1);

        let mut statements = Vec::new();
        for chunk in rows.chunks(rows_per_statement) {
            let sql = self
                .dialect
                .insert_if_absent_sql(table, columns, pk_column, chunk.len());

            let mut params = Vec::with_capacity(chunk.len() * columns.len());
            for row in chunk {
                for column in columns {
                    let value = row.get_by_name(column).ok_or_else(|| {
                        Error::config(format!("row is missing required column '{column}'"))
                    })?;
                    params.push(value.clone());
                }
            }
            statements.push(Statement { sql, params });
        }
        Ok(statements)
    }

    /// DELETE of the given primary keys, chunked at the parameter limit
    pub fn delete_in(
        &self,
        table: &str,
        pk_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Statement>> {
        let tbl = self.quote(table)?;
        let pk_col = self.quote(pk_column)?;
        let d = self.dialect.as_ref();

        let mut statements = Vec::new();
        for chunk in keys.chunks(MAX_PARAMS_PER_COMMAND) {
            let sql = format!(
                "DELETE FROM {tbl} WHERE {pk_col} IN ({list})",
                list = d.placeholder_list(1, chunk.len()),
            );
            statements.push(Statement {
                sql,
                params: chunk.to_vec(),
            });
        }
        Ok(statements)
    }
}

/// Allow-list check for identifiers spliced into SQL text
fn check_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("empty identifier"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '#' | '@' | ' ');
    if let Some(bad) = name.chars().find(|c| !allowed(*c)) {
        return Err(Error::config(format!(
            "identifier '{name}' contains disallowed character '{bad}'"
        )));
    }
    if name.len() > 128 {
        return Err(Error::config(format!(
            "identifier too long ({} chars): {}...",
            name.len(),
            &name[..32]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{PostgresDialect, SqlServerDialect, SqliteDialect};

    fn pg() -> SqlBuilder {
        SqlBuilder::new(Box::new(PostgresDialect))
    }

    #[test]
    fn test_identifier_allow_list() {
        assert!(check_identifier("events").is_ok());
        assert!(check_identifier("Order Details").is_ok());
        assert!(check_identifier("t$1#x@y_z").is_ok());

        assert!(check_identifier("").is_err());
        assert!(check_identifier("events; DROP TABLE x").is_err());
        assert!(check_identifier("a\"b").is_err());
        assert!(check_identifier(&"x".repeat(200)).is_err());
    }

    #[test]
    fn test_batch_select_without_cursor() {
        let stmt = pg()
            .batch_select("events", "created_at", "id", Value::from("2025-01-01"), None, 500)
            .unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"events\" WHERE \"created_at\" < $1 \
             ORDER BY \"created_at\" ASC, \"id\" ASC LIMIT 500"
        );
        assert_eq!(stmt.params.len(), 1);
    }

    #[test]
    fn test_batch_select_with_cursor() {
        let stmt = pg()
            .batch_select(
                "events",
                "created_at",
                "id",
                Value::from("2025-01-01"),
                Some((Value::from("2024-02-01"), Value::from(17_i64))),
                500,
            )
            .unwrap();

        assert!(stmt.sql.contains(
            "((\"created_at\" > $2) OR (\"created_at\" = $3 AND \"id\" > $4))"
        ));
        assert_eq!(stmt.params.len(), 4);
        assert_eq!(stmt.params[1], stmt.params[2]);
    }

    #[test]
    fn test_batch_select_sqlserver_shape() {
        let builder = SqlBuilder::new(Box::new(SqlServerDialect));
        let stmt = builder
            .batch_select("events", "created_at", "id", Value::from("2025-01-01"), None, 200)
            .unwrap();

        assert!(stmt.sql.starts_with("SELECT TOP (200) * FROM [events] WITH (READPAST)"));
        assert!(stmt.sql.ends_with("ORDER BY [created_at] ASC, [id] ASC"));
        assert!(!stmt.sql.contains("LIMIT"));
    }

    #[test]
    fn test_existing_keys_chunking() {
        let keys: Vec<Value> = (0..2500_i64).map(Value::from).collect();
        let statements = pg().existing_keys("events", "id", &keys).unwrap();

        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].params.len(), 1000);
        assert_eq!(statements[1].params.len(), 1000);
        assert_eq!(statements[2].params.len(), 500);
        assert!(statements[0].sql.starts_with("SELECT CAST(\"id\" AS TEXT) FROM \"events\""));
        for stmt in &statements {
            assert!(stmt.params.len() <= MAX_PARAMS_PER_COMMAND);
        }
    }

    #[test]
    fn test_delete_in_chunking() {
        let keys: Vec<Value> = (0..1001_i64).map(Value::from).collect();
        let statements = pg().delete_in("events", "id", &keys).unwrap();

        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].params.len(), 1000);
        assert_eq!(statements[1].params.len(), 1);
        assert!(statements[0].sql.starts_with("DELETE FROM \"events\" WHERE \"id\" IN ("));
    }

    #[test]
    fn test_insert_if_absent_params_in_column_order() {
        let columns: Vec<String> = vec!["id".into(), "note".into()];
        // row stores columns in a different order than requested
        let row = Row::new(
            vec!["note".into(), "id".into()],
            vec![Value::from("hello"), Value::from(1_i64)],
        );
        let rows = vec![&row];
        let statements = pg().insert_if_absent("events", &columns, "id", &rows).unwrap();

        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].params, vec![Value::from(1_i64), Value::from("hello")]);
    }

    #[test]
    fn test_insert_if_absent_chunks_by_param_budget() {
        let columns: Vec<String> = vec!["id".into(), "a".into(), "b".into()];
        let rows: Vec<Row> = (0..400_i64)
            .map(|i| {
                Row::new(
                    columns.clone(),
                    vec![Value::from(i), Value::from("a"), Value::from("b")],
                )
            })
            .collect();
        let row_refs: Vec<&Row> = rows.iter().collect();
        let statements = pg()
            .insert_if_absent("events", &columns, "id", &row_refs)
            .unwrap();

        // 1000 params / 3 columns = 333 rows per statement
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].params.len(), 333 * 3);
        assert_eq!(statements[1].params.len(), 67 * 3);
        for stmt in &statements {
            assert!(stmt.params.len() <= MAX_PARAMS_PER_COMMAND);
        }
    }

    #[test]
    fn test_insert_if_absent_missing_column() {
        let columns: Vec<String> = vec!["id".into(), "note".into()];
        let row = Row::new(vec!["id".into()], vec![Value::from(1_i64)]);
        let rows = vec![&row];
        let err = pg()
            .insert_if_absent("events", &columns, "id", &rows)
            .unwrap_err();
        assert!(err.to_string().contains("missing required column"));
    }

    #[test]
    fn test_sqlite_statements() {
        let builder = SqlBuilder::new(Box::new(SqliteDialect));
        let keys = vec![Value::from(1_i64), Value::from(2_i64)];
        let statements = builder.delete_in("events", "id", &keys).unwrap();
        assert_eq!(
            statements[0].sql,
            "DELETE FROM \"events\" WHERE \"id\" IN (?, ?)"
        );
    }
}
