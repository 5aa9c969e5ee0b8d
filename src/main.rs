use sheetpipe::config::Config;
use sheetpipe::db::{ledger, Db};
use sheetpipe::ingestion::{normalize_identifier, Orchestrator, RunStatus};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::error;

#[derive(Parser)]
#[command(name = "sheetpipe")]
#[command(about = "Excel directory-tree to PostgreSQL ETL with schema evolution")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ETL over a data root
    Etl {
        /// Root directory containing workbook files
        #[arg(default_value = "data")]
        data_root: PathBuf,
    },
    /// Resume an interrupted run from its pause checkpoint
    Resume {
        /// Root directory the checkpoint was written for
        #[arg(default_value = "data")]
        data_root: PathBuf,
    },
    /// Show import and schema-change statistics
    Status,
    /// Delete a file's imported rows and its ledger entry
    Revert {
        /// Target table to revert rows from
        #[arg(long)]
        table: String,

        /// Source file path recorded at import time
        #[arg(long)]
        source_file: Option<String>,

        /// SHA-256 content hash recorded at import time
        #[arg(long)]
        file_hash: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Undo the schema changes a file caused (add_column only)
    RevertSchema {
        /// Target table
        #[arg(long)]
        table: String,

        /// Source file that caused the changes
        #[arg(long)]
        source_file: String,

        /// Show the plan without executing it
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = Config::from_env()?;
    tracing_subscriber::fmt()
        .with_max_level(if config.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    match args.command {
        Commands::Etl { data_root } => run_etl(config, data_root, false).await,
        Commands::Resume { data_root } => run_etl(config, data_root, true).await,
        Commands::Status => show_status(config).await,
        Commands::Revert {
            table,
            source_file,
            file_hash,
            yes,
        } => run_revert(config, table, source_file, file_hash, yes).await,
        Commands::RevertSchema {
            table,
            source_file,
            dry_run,
        } => run_revert_schema(config, table, source_file, dry_run).await,
    }
}

async fn run_etl(config: Config, data_root: PathBuf, resume: bool) -> Result<()> {
    let db = Db::connect(&config).await?;
    let mut orchestrator = Orchestrator::new(config, db);

    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Interrupt received, finishing the current file");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let result = if resume {
        orchestrator.resume(&data_root).await
    } else {
        orchestrator.run(&data_root).await
    };

    let status = match result {
        Ok(status) => status,
        Err(e) => {
            orchestrator.finish().await;
            return Err(e.into());
        }
    };
    orchestrator.finish().await;

    match status {
        RunStatus::Completed => {
            println!("ETL completed successfully");
            Ok(())
        }
        RunStatus::Checkpointed => {
            bail!("run stopped early; pause checkpoint written (resume to continue)")
        }
    }
}

async fn show_status(config: Config) -> Result<()> {
    let mut db = Db::connect(&config).await?;
    let report = ledger::status_report(&mut db).await?;
    db.close().await;

    println!("Total imports: {}", report.total_imports);
    println!("Total schema changes: {}", report.total_schema_changes);
    if !report.recent_tables.is_empty() {
        println!("\nRecent tables:");
        for table in &report.recent_tables {
            println!(
                "  {}: {} files, {} rows",
                table.table_name, table.file_count, table.total_rows
            );
        }
    }
    Ok(())
}

async fn run_revert(
    config: Config,
    table: String,
    source_file: Option<String>,
    file_hash: Option<String>,
    yes: bool,
) -> Result<()> {
    if source_file.is_none() && file_hash.is_none() {
        bail!("must specify either --source-file or --file-hash");
    }

    // Table names only ever come out of the normalizer; hold the CLI to
    // the same alphabet before the name reaches any SQL text.
    let table = normalize_identifier(&table);

    if !yes && !confirm(&format!("Revert import from table {table}?"))? {
        println!("Aborted");
        return Ok(());
    }

    let mut db = Db::connect(&config).await?;
    let rows = match (&source_file, &file_hash) {
        (Some(file), _) => ledger::revert_by_source_file(&mut db, &table, file).await?,
        (None, Some(hash)) => ledger::revert_by_fingerprint(&mut db, &table, hash).await?,
        (None, None) => unreachable!(),
    };
    db.close().await;

    println!("Reverted {rows} rows from {table}");
    Ok(())
}

async fn run_revert_schema(
    config: Config,
    table: String,
    source_file: String,
    dry_run: bool,
) -> Result<()> {
    let table = normalize_identifier(&table);
    let mut db = Db::connect(&config).await?;
    let plan = ledger::revert_schema_changes(&mut db, &table, &source_file, dry_run).await?;
    db.close().await;

    if dry_run {
        println!("Schema changes that would be reverted:");
        for ddl in &plan.statements {
            println!("  - {ddl}");
        }
    } else {
        println!("Reverted {} schema changes", plan.statements.len());
    }
    for note in &plan.skipped {
        println!("  (skipped) {note}");
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
