//! Import and schema-change audit ledger
//!
//! Two append-only tables record every file imported and every DDL change
//! performed. The `(table_name, source_file, file_sha256)` triple in
//! `etl_imports` is the deduplication key: its presence means "done, do
//! not reimport".

use super::connection::{classify, Db};
use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::fmt;
use tracing::{info, warn};

const AUDIT_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS etl_imports (
    id BIGSERIAL PRIMARY KEY,
    table_name TEXT NOT NULL,
    source_file TEXT NOT NULL,
    file_sha256 TEXT NOT NULL,
    row_count BIGINT NOT NULL,
    imported_at TIMESTAMPTZ NOT NULL,
    UNIQUE (table_name, source_file, file_sha256)
);

CREATE TABLE IF NOT EXISTS etl_schema_changes (
    id BIGSERIAL PRIMARY KEY,
    table_name TEXT NOT NULL,
    change_type TEXT NOT NULL,
    column_name TEXT,
    old_type TEXT,
    new_type TEXT,
    source_file TEXT,
    changed_at TIMESTAMPTZ NOT NULL
);
"#;

pub async fn ensure_audit_tables(db: &mut Db) -> Result<()> {
    db.execute_ddl("etl_imports", AUDIT_DDL).await?;
    info!("Audit tables ensured: etl_imports, etl_schema_changes");
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    CreateTable,
    AddColumn,
    AlterType,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::CreateTable => "create_table",
            ChangeType::AddColumn => "add_column",
            ChangeType::AlterType => "alter_type",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub async fn is_imported(
    db: &mut Db,
    table_name: &str,
    source_file: &str,
    file_hash: &str,
) -> Result<bool> {
    if db.is_dry_run() {
        return Ok(false);
    }

    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS cnt
        FROM etl_imports
        WHERE table_name = $1 AND source_file = $2 AND file_sha256 = $3
        "#,
    )
    .bind(table_name)
    .bind(source_file)
    .bind(file_hash)
    .fetch_one(db.conn()?)
    .await
    .map_err(|e| classify(table_name, e))?;

    Ok(row.get::<i64, _>("cnt") > 0)
}

/// Record a completed import. The uniqueness constraint turns a duplicate
/// into an integrity error rather than a second ledger row.
pub async fn record_import(
    db: &mut Db,
    table_name: &str,
    source_file: &str,
    file_hash: &str,
    row_count: u64,
    imported_at: DateTime<Utc>,
) -> Result<()> {
    if db.is_dry_run() {
        info!("[dry run] would record import of {source_file} into {table_name} ({row_count} rows)");
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO etl_imports (table_name, source_file, file_sha256, row_count, imported_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(table_name)
    .bind(source_file)
    .bind(file_hash)
    .bind(row_count as i64)
    .bind(imported_at)
    .execute(db.conn()?)
    .await
    .map_err(|e| classify(table_name, e))?;

    info!("Logged import: {source_file} -> {table_name} ({row_count} rows)");
    Ok(())
}

pub async fn record_schema_change(
    db: &mut Db,
    table_name: &str,
    change_type: ChangeType,
    column_name: Option<&str>,
    old_type: Option<&str>,
    new_type: Option<&str>,
    source_file: &str,
) -> Result<()> {
    if db.is_dry_run() {
        info!(
            "[dry run] would log schema change {change_type} on {table_name}.{}",
            column_name.unwrap_or("-")
        );
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO etl_schema_changes
            (table_name, change_type, column_name, old_type, new_type, source_file, changed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(table_name)
    .bind(change_type.as_str())
    .bind(column_name)
    .bind(old_type)
    .bind(new_type)
    .bind(source_file)
    .bind(Utc::now())
    .execute(db.conn()?)
    .await
    .map_err(|e| classify(table_name, e))?;

    Ok(())
}

/// Delete a file's rows from the target table (selected by the
/// `source_file` metadata column) and drop the matching ledger rows.
/// Returns the number of data rows deleted.
pub async fn revert_by_source_file(
    db: &mut Db,
    table_name: &str,
    source_file: &str,
) -> Result<u64> {
    if db.is_dry_run() {
        info!("[dry run] would revert {table_name} rows from {source_file}");
        return Ok(0);
    }

    info!("Reverting import: {source_file} from {table_name}");

    let delete = format!(r#"DELETE FROM "{table_name}" WHERE source_file = $1"#);
    let result = sqlx::query(&delete)
        .bind(source_file)
        .execute(db.conn()?)
        .await
        .map_err(|e| classify(table_name, e))?;
    let rows_deleted = result.rows_affected();

    sqlx::query(
        r#"
        DELETE FROM etl_imports
        WHERE table_name = $1 AND source_file = $2
        "#,
    )
    .bind(table_name)
    .bind(source_file)
    .execute(db.conn()?)
    .await
    .map_err(|e| classify(table_name, e))?;

    info!("Reverted {rows_deleted} rows from {table_name}");
    Ok(rows_deleted)
}

/// Revert by content hash: resolve the ledger entry to its source file,
/// then revert that file. Useful when the path has since changed.
pub async fn revert_by_fingerprint(
    db: &mut Db,
    table_name: &str,
    file_hash: &str,
) -> Result<u64> {
    if db.is_dry_run() {
        info!("[dry run] would revert {table_name} rows with hash {file_hash}");
        return Ok(0);
    }

    let row = sqlx::query(
        r#"
        SELECT source_file
        FROM etl_imports
        WHERE table_name = $1 AND file_sha256 = $2
        "#,
    )
    .bind(table_name)
    .bind(file_hash)
    .fetch_optional(db.conn()?)
    .await
    .map_err(|e| classify(table_name, e))?;

    let Some(row) = row else {
        warn!("No import found for hash {file_hash} in {table_name}");
        return Ok(0);
    };

    let source_file: String = row.get("source_file");
    revert_by_source_file(db, table_name, &source_file).await
}

/// Plan produced by `revert_schema_changes`: DDL that will (or would) run,
/// plus the changes that cannot be undone.
#[derive(Clone, Debug, Default)]
pub struct SchemaRevertPlan {
    pub statements: Vec<String>,
    pub skipped: Vec<String>,
}

/// Undo the schema changes a file caused, newest first. Only `add_column`
/// is invertible; `alter_type` and `create_table` are reported and left
/// alone. With `dry_run` the plan is returned without executing.
pub async fn revert_schema_changes(
    db: &mut Db,
    table_name: &str,
    source_file: &str,
    dry_run: bool,
) -> Result<SchemaRevertPlan> {
    let mut plan = SchemaRevertPlan::default();

    if db.is_dry_run() {
        info!("[dry run] would revert schema changes for {table_name} from {source_file}");
        return Ok(plan);
    }

    let changes = sqlx::query(
        r#"
        SELECT change_type, column_name, old_type, new_type
        FROM etl_schema_changes
        WHERE table_name = $1 AND source_file = $2
        ORDER BY changed_at DESC, id DESC
        "#,
    )
    .bind(table_name)
    .bind(source_file)
    .fetch_all(db.conn()?)
    .await
    .map_err(|e| classify(table_name, e))?;

    if changes.is_empty() {
        info!("No schema changes found for {source_file} in {table_name}");
        return Ok(plan);
    }

    for change in &changes {
        let change_type: String = change.get("change_type");
        let column_name: Option<String> = change.get("column_name");

        match change_type.as_str() {
            "add_column" => {
                if let Some(column) = column_name {
                    plan.statements
                        .push(format!(r#"ALTER TABLE "{table_name}" DROP COLUMN "{column}""#));
                }
            }
            "alter_type" => {
                let old: Option<String> = change.get("old_type");
                let new: Option<String> = change.get("new_type");
                plan.skipped.push(format!(
                    "alter_type on {}.{} ({} -> {}) is not invertible",
                    table_name,
                    column_name.as_deref().unwrap_or("-"),
                    old.as_deref().unwrap_or("?"),
                    new.as_deref().unwrap_or("?"),
                ));
            }
            "create_table" => {
                plan.skipped.push(format!(
                    "create_table is not invertible; drop \"{table_name}\" manually if intended"
                ));
            }
            other => {
                warn!("Unknown change type {other:?} in ledger, skipping");
            }
        }
    }

    for note in &plan.skipped {
        warn!("{note}");
    }

    if dry_run {
        info!("Dry run; {} statements planned", plan.statements.len());
        return Ok(plan);
    }

    for ddl in &plan.statements {
        db.execute_ddl(table_name, ddl).await?;
        info!("Executed: {ddl}");
    }

    Ok(plan)
}

#[derive(Clone, Debug)]
pub struct ImportRecord {
    pub source_file: String,
    pub file_sha256: String,
    pub row_count: i64,
    pub imported_at: DateTime<Utc>,
}

pub async fn import_history(db: &mut Db, table_name: &str, limit: i64) -> Result<Vec<ImportRecord>> {
    if db.is_dry_run() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT source_file, file_sha256, row_count, imported_at
        FROM etl_imports
        WHERE table_name = $1
        ORDER BY imported_at DESC
        LIMIT $2
        "#,
    )
    .bind(table_name)
    .bind(limit)
    .fetch_all(db.conn()?)
    .await
    .map_err(|e| classify(table_name, e))?;

    Ok(rows
        .iter()
        .map(|row| ImportRecord {
            source_file: row.get("source_file"),
            file_sha256: row.get("file_sha256"),
            row_count: row.get("row_count"),
            imported_at: row.get("imported_at"),
        })
        .collect())
}

#[derive(Clone, Debug)]
pub struct TableActivity {
    pub table_name: String,
    pub file_count: i64,
    pub total_rows: i64,
}

#[derive(Clone, Debug, Default)]
pub struct StatusReport {
    pub total_imports: i64,
    pub total_schema_changes: i64,
    pub recent_tables: Vec<TableActivity>,
}

pub async fn status_report(db: &mut Db) -> Result<StatusReport> {
    if db.is_dry_run() {
        return Ok(StatusReport::default());
    }

    let imports: i64 = sqlx::query("SELECT COUNT(*) FROM etl_imports")
        .fetch_one(db.conn()?)
        .await
        .map_err(|e| classify("etl_imports", e))?
        .get(0);

    let changes: i64 = sqlx::query("SELECT COUNT(*) FROM etl_schema_changes")
        .fetch_one(db.conn()?)
        .await
        .map_err(|e| classify("etl_schema_changes", e))?
        .get(0);

    let rows = sqlx::query(
        r#"
        SELECT table_name, COUNT(*) AS file_count, COALESCE(SUM(row_count), 0)::BIGINT AS total_rows
        FROM etl_imports
        GROUP BY table_name
        ORDER BY MAX(imported_at) DESC
        LIMIT 10
        "#,
    )
    .fetch_all(db.conn()?)
    .await
    .map_err(|e| classify("etl_imports", e))?;

    Ok(StatusReport {
        total_imports: imports,
        total_schema_changes: changes,
        recent_tables: rows
            .iter()
            .map(|row| TableActivity {
                table_name: row.get("table_name"),
                file_count: row.get("file_count"),
                total_rows: row.get("total_rows"),
            })
            .collect(),
    })
}
