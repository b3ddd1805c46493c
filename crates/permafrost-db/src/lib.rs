//! # permafrost-db
//!
//! Relational database connectivity for the Permafrost archive pipeline.
//!
//! This crate provides the small, vendor-neutral surface the archive engine
//! needs to talk to its online and history tiers:
//!
//! - **Value/Row types**: dynamic, ordered column → value rows, because the
//!   archived tables are only discovered at runtime
//! - **Error taxonomy**: granular classification so the retry layer can tell
//!   a deadlock victim from a structural timeout
//! - **SQL dialects**: identifier quoting, placeholders and the handful of
//!   statement shapes the engine emits, per vendor
//! - **Statement builder**: INSERT-if-absent, DELETE-IN and cursor-batch
//!   SELECTs, chunked to stay under per-command parameter limits
//! - **Gateway**: opens connections by logical name or full connection URL
//!
//! ## Feature Flags
//!
//! - `sqlite` - embedded SQLite backend via rusqlite
//! - `postgres` - PostgreSQL backend via tokio-postgres

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod builder;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod gateway;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use builder::{SqlBuilder, Statement, MAX_PARAMS_PER_COMMAND};
pub use connection::{Connection, ConnectionConfig, DatabaseType};
pub use dialect::{dialect_for, PostgresDialect, SqlDialect, SqlServerDialect, SqliteDialect};
pub use error::{Error, ErrorCategory, Result};
pub use gateway::DatabaseGateway;
pub use types::{Row, Value};
