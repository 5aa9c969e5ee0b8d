//! Run coordination: discovery, folder/file ordering, commit boundaries,
//! pause policy and the resume checkpoint

use crate::config::Config;
use crate::db::Db;
use crate::error::{EtlError, Result};
use crate::excel::discover_workbooks;
use crate::ingestion::chunk_loader::{load_file, FileOutcome};
use crate::ingestion::identifiers::table_name_from_parts;
use crate::ingestion::pause::{Checkpoint, PauseManager};
use crate::ingestion::schema_manager::SchemaManager;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How a run ended: everything done, or stopped early with a checkpoint
/// on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Checkpointed,
}

/// Counters accumulated over one run, reported at the end.
#[derive(Clone, Debug, Default)]
pub struct ImportTracker {
    pub files_processed: u64,
    pub files_skipped: u64,
    pub rows_inserted: u64,
    pub schema_changes: u64,
    pub errors: Vec<String>,
}

impl ImportTracker {
    fn completed(&self) -> u64 {
        self.files_processed + self.files_skipped
    }

    fn should_pause(&self, pause_every: u32) -> bool {
        pause_every > 0 && self.completed() > 0 && self.completed() % pause_every as u64 == 0
    }

    pub fn log_summary(&self) {
        info!("{}", "=".repeat(60));
        info!("ETL RUN SUMMARY");
        info!("{}", "=".repeat(60));
        info!("Files processed: {}", self.files_processed);
        info!("Files skipped: {}", self.files_skipped);
        info!("Rows inserted: {}", self.rows_inserted);
        info!("Schema changes: {}", self.schema_changes);
        info!("Errors: {}", self.errors.len());
        for err in &self.errors {
            error!("  - {err}");
        }
        info!("{}", "=".repeat(60));
    }
}

#[derive(Clone, Debug)]
struct FolderWork {
    parts: Vec<String>,
    files: Vec<PathBuf>,
}

impl FolderWork {
    fn key(&self) -> String {
        self.parts.join("/")
    }
}

/// Drives the whole pipeline: one file at a time, folders in sorted path
/// order, files in sorted name order. Owns the commit boundary and the
/// pause checkpoint.
pub struct Orchestrator {
    config: Config,
    db: Db,
    schema: SchemaManager,
    pub tracker: ImportTracker,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: Config, db: Db) -> Self {
        Self {
            config,
            db,
            schema: SchemaManager::new(),
            tracker: ImportTracker::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed at file boundaries; set it to stop cooperatively.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Scan the data root and process everything under it.
    pub async fn run(&mut self, data_root: &Path) -> Result<RunStatus> {
        let data_root = canonical_root(data_root)?;
        self.log_run_header(&data_root);

        let pause = PauseManager::new(&data_root);
        let plan = full_plan(&data_root)?;

        if plan.is_empty() {
            warn!("No workbook files found under {}", data_root.display());
            return Ok(RunStatus::Completed);
        }

        let status = self.process(&data_root, plan, &pause).await?;
        self.tracker.log_summary();
        if status == RunStatus::Completed {
            pause.clear();
        }
        Ok(status)
    }

    /// Continue from the checkpoint a previous run left behind, processing
    /// exactly the recorded remainder.
    pub async fn resume(&mut self, data_root: &Path) -> Result<RunStatus> {
        let data_root = canonical_root(data_root)?;
        let pause = PauseManager::new(&data_root);

        let Some(checkpoint) = pause.read()? else {
            info!("No pause checkpoint found, nothing to resume");
            return Ok(RunStatus::Completed);
        };

        if checkpoint.data_root != data_root {
            warn!(
                "Checkpoint was written for {}, resuming against {}",
                checkpoint.data_root.display(),
                data_root.display()
            );
        }

        self.log_run_header(&data_root);
        info!(
            "Resuming: {} folders and {} files pending",
            checkpoint.remaining_folders.len(),
            checkpoint.remaining_files_in_current_folder.len()
        );

        let plan = plan_from_checkpoint(&data_root, &checkpoint)?;
        let status = self.process(&data_root, plan, &pause).await?;
        self.tracker.log_summary();
        if status == RunStatus::Completed {
            pause.clear();
        }
        Ok(status)
    }

    pub async fn finish(self) {
        self.db.close().await;
    }

    fn log_run_header(&self, data_root: &Path) {
        info!("Starting ETL run");
        info!("Data root: {}", data_root.display());
        info!("Sectional commit: {}", self.config.sectional_commit);
        info!("Pause every: {} files", self.config.pause_every);
        info!("Pause duration: {} seconds", self.config.pause_seconds);
        info!("Chunk size: {} rows", self.config.chunk_size);
        info!("Dry run: {}", self.config.skip_db);
    }

    async fn process(
        &mut self,
        data_root: &Path,
        plan: Vec<FolderWork>,
        pause: &PauseManager,
    ) -> Result<RunStatus> {
        for (folder_idx, folder) in plan.iter().enumerate() {
            let table = table_name_from_parts(&folder.parts);
            let sheet = self.config.sheet_map.resolve(&folder.parts);

            info!(
                "Processing folder {} ({} files) -> table {table}, sheet {sheet:?}",
                folder.key(),
                folder.files.len()
            );

            if self.config.sectional_commit {
                self.db.begin().await?;
            }

            for (file_idx, file) in folder.files.iter().enumerate() {
                if self.cancel.load(Ordering::SeqCst) {
                    info!("Cancellation requested, stopping at file boundary");
                    // Work so far is clean at a file boundary; keep it.
                    self.db.commit().await?;
                    let checkpoint = make_checkpoint(
                        data_root,
                        &plan,
                        folder_idx,
                        folder.files[file_idx..].to_vec(),
                    );
                    pause.write(&checkpoint)?;
                    return Ok(RunStatus::Checkpointed);
                }

                info!("Processing file: {}", file.display());
                match load_file(
                    &mut self.db,
                    &mut self.schema,
                    &table,
                    file,
                    &sheet,
                    self.config.chunk_size,
                )
                .await
                {
                    Ok(result) => {
                        match result.outcome {
                            FileOutcome::Imported => {
                                self.tracker.files_processed += 1;
                                self.tracker.rows_inserted += result.rows_inserted;
                            }
                            FileOutcome::Skipped | FileOutcome::Empty => {
                                self.tracker.files_skipped += 1;
                            }
                        }
                        self.tracker.schema_changes += result.schema_changes as u64;
                    }
                    Err(e) if e.is_fatal() => {
                        error!("Fatal error, stopping run: {e}");
                        self.tracker.errors.push(e.to_string());
                        // The in-flight file never completed; under
                        // sectional commit the whole folder rolled back
                        // with the connection.
                        let remaining = if self.config.sectional_commit {
                            folder.files.clone()
                        } else {
                            folder.files[file_idx..].to_vec()
                        };
                        let checkpoint =
                            make_checkpoint(data_root, &plan, folder_idx, remaining);
                        pause.write(&checkpoint)?;
                        return Err(e);
                    }
                    Err(e) => {
                        error!("Error processing {}: {e}", file.display());
                        self.tracker.errors.push(format!("{}: {e}", file.display()));

                        if self.config.sectional_commit {
                            self.db.rollback().await;
                            // Earlier files of this folder rolled back and
                            // must be re-attempted; the failing file is
                            // excluded so a resume does not loop on it.
                            let mut remaining = folder.files.clone();
                            remaining.remove(file_idx);
                            let checkpoint =
                                make_checkpoint(data_root, &plan, folder_idx, remaining);
                            pause.write(&checkpoint)?;
                            return Ok(RunStatus::Checkpointed);
                        }
                    }
                }

                if self.tracker.should_pause(self.config.pause_every) {
                    info!(
                        "Pause threshold reached, sleeping {} seconds",
                        self.config.pause_seconds
                    );
                    self.db.commit().await?;
                    tokio::time::sleep(Duration::from_secs(self.config.pause_seconds)).await;
                    if self.config.sectional_commit {
                        self.db.begin().await?;
                    }
                }
            }

            self.db.commit().await?;
        }

        Ok(RunStatus::Completed)
    }
}

fn canonical_root(data_root: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(data_root).map_err(|e| {
        EtlError::Config(format!(
            "data root {} is not accessible: {e}",
            data_root.display()
        ))
    })
}

fn full_plan(data_root: &Path) -> Result<Vec<FolderWork>> {
    let folders = discover_workbooks(data_root)?;
    Ok(folders
        .into_iter()
        .map(|(parts, files)| FolderWork { parts, files })
        .collect())
}

/// Rebuild a work plan from a checkpoint: first the files left in the
/// folder that was in progress, then the folders never started.
fn plan_from_checkpoint(data_root: &Path, checkpoint: &Checkpoint) -> Result<Vec<FolderWork>> {
    let mut plan = Vec::new();

    if let Some(first) = checkpoint.remaining_files_in_current_folder.first() {
        let parts = folder_parts(data_root, first);
        let mut files = checkpoint.remaining_files_in_current_folder.clone();
        files.sort();
        plan.push(FolderWork { parts, files });
    }

    let discovered = full_plan(data_root)?;
    for folder in discovered {
        if checkpoint.remaining_folders.contains(&folder.key()) {
            plan.push(folder);
        }
    }

    Ok(plan)
}

fn folder_parts(data_root: &Path, file: &Path) -> Vec<String> {
    file.parent()
        .and_then(|p| p.strip_prefix(data_root).ok())
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn make_checkpoint(
    data_root: &Path,
    plan: &[FolderWork],
    folder_idx: usize,
    remaining_files: Vec<PathBuf>,
) -> Checkpoint {
    Checkpoint {
        data_root: data_root.to_path_buf(),
        remaining_folders: plan[folder_idx + 1..].iter().map(FolderWork::key).collect(),
        remaining_files_in_current_folder: remaining_files,
        created_at: Utc::now(),
    }
}
