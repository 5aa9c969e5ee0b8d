use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("cannot read {} with any available engine (modern: {modern}; legacy: {legacy})", path.display())]
    Read {
        path: PathBuf,
        modern: String,
        legacy: String,
    },

    #[error("schema change failed for {table}: {message}")]
    Schema { table: String, message: String },

    #[error("insert rejected for {table}: {message}")]
    Integrity { table: String, message: String },

    #[error("database connection error: {0}")]
    Connection(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EtlError {
    /// Connection and configuration failures stop the whole run;
    /// everything else is scoped to the file being processed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EtlError::Connection(_) | EtlError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
