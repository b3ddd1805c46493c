//! Database gateway for permafrost-db
//!
//! Opens connections by logical name (resolved against the configured
//! connection map) or by full connection URL. Connections are opened per
//! operation and dropped on the operation's exit path; the gateway itself
//! holds no live handles.

use std::collections::HashMap;
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, DatabaseType};
use crate::error::{Error, Result};

/// Opens connections by logical name or full connection URL.
///
/// Holds no live handles; connection URLs may carry credentials, so there is
/// deliberately no `Debug` impl.
#[derive(Clone, Default)]
pub struct DatabaseGateway {
    named: HashMap<String, String>,
}

impl DatabaseGateway {
    /// Create a gateway over a map of logical name → connection URL
    pub fn new(named: HashMap<String, String>) -> Self {
        Self { named }
    }

    /// Resolve a logical name or pass a full URL through
    pub fn resolve(&self, name_or_url: &str) -> Result<String> {
        let trimmed = name_or_url.trim();
        if trimmed.is_empty() {
            return Err(Error::config("empty connection string"));
        }
        if is_url(trimmed) {
            return Ok(trimmed.to_string());
        }
        match self.named.get(trimmed) {
            Some(url) if !url.trim().is_empty() => Ok(url.trim().to_string()),
            Some(_) => Err(Error::config(format!(
                "connection '{trimmed}' resolves to an empty connection string"
            ))),
            None => Err(Error::config(format!("unknown connection '{trimmed}'"))),
        }
    }

    /// Database type behind a logical name or URL
    pub fn database_type(&self, name_or_url: &str) -> Result<DatabaseType> {
        Ok(DatabaseType::from_url(&self.resolve(name_or_url)?))
    }

    /// Open a connection to the database behind a logical name or URL
    pub async fn open(&self, name_or_url: &str) -> Result<Box<dyn Connection>> {
        let config = ConnectionConfig::new(self.resolve(name_or_url)?);
        debug!(?config, "opening connection");
        match DatabaseType::from_url(&config.url) {
            DatabaseType::Sqlite => {
                #[cfg(feature = "sqlite")]
                {
                    let conn = crate::sqlite::SqliteConnection::open(&sqlite_path(&config.url))?;
                    Ok(Box::new(conn) as Box<dyn Connection>)
                }
                #[cfg(not(feature = "sqlite"))]
                {
                    Err(Error::unsupported(
                        "SQLite connection requested but built without the `sqlite` feature",
                    ))
                }
            }
            DatabaseType::PostgreSQL => {
                #[cfg(feature = "postgres")]
                {
                    crate::postgres::connect(&config).await
                }
                #[cfg(not(feature = "postgres"))]
                {
                    Err(Error::unsupported(
                        "PostgreSQL connection requested but built without the `postgres` feature",
                    ))
                }
            }
            other => Err(Error::unsupported(format!(
                "no backend available for {other} connection URLs"
            ))),
        }
    }
}

/// Whether the string is a connection URL rather than a logical name
fn is_url(s: &str) -> bool {
    s.contains("://") || s.starts_with("sqlite:") || s.starts_with("file:")
}

/// Filesystem path (or `:memory:`) behind a sqlite URL
#[cfg(feature = "sqlite")]
pub(crate) fn sqlite_path(url: &str) -> String {
    let rest = url.strip_prefix("sqlite:").unwrap_or(url);
    rest.strip_prefix("//").unwrap_or(rest).to_string()
}
