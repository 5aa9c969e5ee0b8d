//! Durable pause checkpoint for interrupted runs

use crate::error::{EtlError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const PAUSE_FILE: &str = ".etl_pause.json";

/// What was left undone when a run stopped early: the folders never
/// started plus the files never attempted in the folder that was in
/// progress. Present on disk iff a prior run was interrupted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub data_root: PathBuf,
    /// Folder paths relative to the data root, `/`-joined, sorted.
    pub remaining_folders: Vec<String>,
    /// Absolute paths of files not yet attempted in the in-progress folder.
    pub remaining_files_in_current_folder: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// Owns the checkpoint file living in the data root.
pub struct PauseManager {
    path: PathBuf,
}

impl PauseManager {
    pub fn new(data_root: &Path) -> Self {
        Self {
            path: data_root.join(PAUSE_FILE),
        }
    }

    /// Write the checkpoint atomically: temp file in the same directory,
    /// fsync, rename over the final name.
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");

        let payload = serde_json::to_vec_pretty(checkpoint)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;

        info!(
            "Wrote pause checkpoint to {} ({} folders, {} files pending)",
            self.path.display(),
            checkpoint.remaining_folders.len(),
            checkpoint.remaining_files_in_current_folder.len()
        );
        Ok(())
    }

    pub fn read(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let text = fs::read_to_string(&self.path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&text).map_err(|e| {
            EtlError::Checkpoint(format!("unreadable pause file {}: {e}", self.path.display()))
        })?;
        info!("Found pause checkpoint from {}", checkpoint.created_at);
        Ok(Some(checkpoint))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Remove the checkpoint after a clean finish.
    pub fn clear(&self) {
        if self.path.exists() {
            match fs::remove_file(&self.path) {
                Ok(()) => info!("Deleted pause checkpoint"),
                Err(e) => warn!("Failed to delete pause checkpoint: {e}"),
            }
        }
    }
}
