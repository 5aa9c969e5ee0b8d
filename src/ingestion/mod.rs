//! The pipeline engine: identifier normalization, type inference, schema
//! evolution, chunked loading and run orchestration

pub mod chunk_loader;
pub mod identifiers;
pub mod inference;
pub mod orchestrator;
pub mod pause;
pub mod schema_manager;

pub use chunk_loader::{load_file, FileOutcome, LoadResult};
pub use identifiers::{dedupe_identifiers, normalize_identifier, table_name_from_parts};
pub use inference::{infer_column_type, CellValue, SqlType};
pub use orchestrator::{ImportTracker, Orchestrator, RunStatus};
pub use pause::{Checkpoint, PauseManager};
pub use schema_manager::SchemaManager;

/// Engine-managed metadata columns present on every target table.
pub const META_SOURCE_FILE: &str = "source_file";
pub const META_LOAD_TIMESTAMP: &str = "load_timestamp";
