//! Cold-tier CSV export
//!
//! Streams ordered column-tagged rows into one or more UTF-8 part files
//! (with BOM), split by a row-count limit, one header line per file,
//! RFC 4180 quoting against the configured delimiter. File names come from
//! a token template and are deterministic, so a re-run after a crash
//! overwrites the same files instead of duplicating them. A part file is
//! fully written and closed before the caller deletes its source rows.

use chrono::NaiveDate;
use serde::Deserialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use permafrost_db::{Row, Value};

use crate::error::{ArchiveError, Result};

/// UTF-8 byte-order mark written at the start of every part file
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

fn default_delimiter() -> char {
    ','
}

fn default_max_rows_per_file() -> usize {
    100_000
}

fn default_file_name_template() -> String {
    "{TableName}_{FromDate:yyyyMMdd}_{ToDate:yyyyMMdd}_Part{PartIndex}.csv".to_string()
}

/// CSV export options
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CsvOptions {
    /// Field delimiter
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Maximum data rows per part file
    #[serde(default = "default_max_rows_per_file")]
    pub max_rows_per_file: usize,
    /// Part file name template with `{TableName}`, `{FromDate:yyyyMMdd}`,
    /// `{ToDate:yyyyMMdd}` and `{PartIndex}` tokens
    #[serde(default = "default_file_name_template")]
    pub file_name_template: String,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            max_rows_per_file: default_max_rows_per_file(),
            file_name_template: default_file_name_template(),
        }
    }
}

impl CsvOptions {
    /// Check the configured values
    pub fn validate(&self) -> Result<()> {
        if self.max_rows_per_file == 0 {
            return Err(ArchiveError::config("csv: max_rows_per_file must be positive"));
        }
        if self.file_name_template.trim().is_empty() {
            return Err(ArchiveError::config("csv: file_name_template must not be empty"));
        }
        Ok(())
    }
}

/// Writes batches of rows into partitioned CSV part files
pub struct CsvExporter {
    options: CsvOptions,
}

impl CsvExporter {
    /// Create an exporter with the given options
    pub fn new(options: CsvOptions) -> Self {
        Self { options }
    }

    /// Write `rows` under `<root>/<table>/<yyyyMM of to_date>/`, split into
    /// parts of at most `max_rows_per_file` rows. Returns the paths written,
    /// each fully flushed and closed.
    #[allow(clippy::too_many_arguments)]
    pub fn write_parts(
        &self,
        rows: &[Row],
        columns: &[String],
        root: &Path,
        table: &str,
        from_date: NaiveDate,
        to_date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let folder = root.join(table).join(to_date.format("%Y%m").to_string());
        fs::create_dir_all(&folder)
            .map_err(|e| ArchiveError::fs(format!("create {}", folder.display()), e))?;
        check_containment(root, &folder)?;

        let mut written = Vec::new();
        for (index, chunk) in rows.chunks(self.options.max_rows_per_file).enumerate() {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            let name = render_file_name(
                &self.options.file_name_template,
                table,
                from_date,
                to_date,
                index + 1,
            );
            let path = folder.join(name);
            self.write_one(chunk, columns, &path)?;
            written.push(path);
        }
        Ok(written)
    }

    fn write_one(&self, rows: &[Row], columns: &[String], path: &Path) -> Result<()> {
        let delimiter = self.options.delimiter;
        let file = fs::File::create(path)
            .map_err(|e| ArchiveError::fs(format!("create {}", path.display()), e))?;
        let mut writer = BufWriter::new(file);

        let io_err = |e: std::io::Error| ArchiveError::fs(format!("write {}", path.display()), e);

        writer.write_all(UTF8_BOM).map_err(io_err)?;

        let header: Vec<String> = columns
            .iter()
            .map(|c| escape_csv(c, delimiter))
            .collect();
        writer
            .write_all(header.join(&delimiter.to_string()).as_bytes())
            .map_err(io_err)?;
        writer.write_all(b"\n").map_err(io_err)?;

        for row in rows {
            let fields: Vec<String> = columns
                .iter()
                .map(|column| {
                    let value = row.get_by_name(column).unwrap_or(&Value::Null);
                    escape_csv(&field_text(value), delimiter)
                })
                .collect();
            writer
                .write_all(fields.join(&delimiter.to_string()).as_bytes())
                .map_err(io_err)?;
            writer.write_all(b"\n").map_err(io_err)?;
        }

        writer.flush().map_err(io_err)?;
        Ok(())
    }
}

/// Refuse to write through a folder that resolves outside the export root
fn check_containment(root: &Path, folder: &Path) -> Result<()> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| ArchiveError::fs(format!("resolve {}", root.display()), e))?;
    let canonical_folder = folder
        .canonicalize()
        .map_err(|e| ArchiveError::fs(format!("resolve {}", folder.display()), e))?;
    if !canonical_folder.starts_with(&canonical_root) {
        return Err(ArchiveError::fs(
            format!(
                "{} resolves outside the csv root {}",
                folder.display(),
                root.display()
            ),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "path escapes csv root"),
        ));
    }
    Ok(())
}

/// Substitute the file-name template tokens; the part index is 1-based and
/// zero-padded to width 2.
fn render_file_name(
    template: &str,
    table: &str,
    from_date: NaiveDate,
    to_date: NaiveDate,
    part_index: usize,
) -> String {
    template
        .replace("{TableName}", table)
        .replace("{FromDate:yyyyMMdd}", &from_date.format("%Y%m%d").to_string())
        .replace("{ToDate:yyyyMMdd}", &to_date.format("%Y%m%d").to_string())
        .replace("{PartIndex}", &format!("{part_index:02}"))
}

/// Stringify one value for a CSV field; NULL becomes the empty string
fn field_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int16(n) => n.to_string(),
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Float64(n) => n.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        Value::DateTimeTz(dt) => dt.to_rfc3339(),
        Value::Uuid(u) => u.to_string(),
    }
}

/// Quote a field when it contains the delimiter, a double quote or a line
/// break; internal double quotes are doubled.
fn escape_csv(field: &str, delimiter: char) -> String {
    let needs_quoting = field.contains(delimiter)
        || field.contains('"')
        || field.contains('\n')
        || field.contains('\r');
    if needs_quoting {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
