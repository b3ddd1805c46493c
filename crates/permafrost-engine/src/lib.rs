//! # permafrost-engine
//!
//! Age-based data lifecycle engine over two relational databases. For each
//! configured table, data flows through three tiers in order of decreasing
//! access frequency: the **online** store (source database), the **history**
//! store (target database), and **cold** CSV archives on a filesystem. A
//! single on-demand run advances all eligible rows one tier colder.
//!
//! ```text
//! ┌──────────┐  Phase 1   ┌──────────┐  Phase 2   ┌───────────┐
//! │  online  │───────────▶│ history  │───────────▶│ CSV parts │
//! │ (source) │ move+dedup │ (target) │ export+del │  (cold)   │
//! └──────────┘            └──────────┘            └───────────┘
//! ```
//!
//! The engine is batched, cursor-driven, adaptive, idempotent, retry-wrapped
//! and crash-safe: no cross-database transactions, correctness comes from
//! target-side primary-key de-duplication plus insert-before-delete ordering.
//! Runs are user-triggered; there is no scheduler and at most one run is in
//! flight.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod audit;
pub mod batch;
pub mod config;
pub mod csv;
pub mod engine;
pub mod error;
pub mod reader;
pub mod retry;
pub mod settings;

pub use engine::{ArchiveEngine, RunReport};
pub use error::{ArchiveError, Result};
pub use settings::{ArchiveSetting, SettingsProvider};
