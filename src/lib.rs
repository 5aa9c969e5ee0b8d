//! sheetpipe: Excel directory-tree to PostgreSQL ETL
//!
//! Walks a data root where each leaf folder maps to one target table,
//! streams workbook sheets in chunks, evolves table schemas in place with
//! safe type widening, and records every import and DDL change in an
//! audit ledger. Runs are idempotent and resumable.

pub mod config;
pub mod db;
pub mod error;
pub mod excel;
pub mod ingestion;

pub use config::Config;
pub use db::Db;
pub use error::{EtlError, Result};
pub use ingestion::{Orchestrator, RunStatus};
