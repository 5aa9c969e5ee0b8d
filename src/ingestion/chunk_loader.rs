//! Per-file chunked load: dedupe check, schema reconciliation, bulk insert

use crate::db::connection::classify;
use crate::db::{ledger, Db};
use crate::error::{EtlError, Result};
use crate::excel::{compute_file_hash, WorkbookReader};
use crate::ingestion::identifiers::{dedupe_identifiers, normalize_identifier};
use crate::ingestion::inference::{infer_column_type, CellValue, SqlType};
use crate::ingestion::schema_manager::SchemaManager;
use crate::ingestion::{META_LOAD_TIMESTAMP, META_SOURCE_FILE};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use std::path::Path;
use tracing::{debug, info, warn};

/// PostgreSQL caps bind parameters per statement at 65535; chunks wider
/// than the budget are split into several statements.
const MAX_BIND_PARAMS: usize = 65_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    /// Rows were inserted and a ledger entry written.
    Imported,
    /// The `(table, source_file, fingerprint)` triple was already in the
    /// ledger; nothing was done.
    Skipped,
    /// The file produced no rows; no ledger entry so a later run retries.
    Empty,
}

#[derive(Clone, Debug)]
pub struct LoadResult {
    pub outcome: FileOutcome,
    pub rows_inserted: u64,
    pub schema_changes: usize,
}

/// Import a single workbook file into its target table.
///
/// Atomicity is the caller's concern: under sectional commit the
/// surrounding transaction makes this all-or-nothing, otherwise a mid-file
/// failure leaves partial rows behind. The ledger entry is only written
/// after the last chunk, so a re-run always sees an incomplete file as
/// un-imported.
pub async fn load_file(
    db: &mut Db,
    schema: &mut SchemaManager,
    table: &str,
    path: &Path,
    sheet_name: &str,
    chunk_size: usize,
) -> Result<LoadResult> {
    let source_file = path.display().to_string();
    let file_hash = compute_file_hash(path)?;

    if ledger::is_imported(db, table, &source_file, &file_hash).await? {
        info!("File already imported, skipping: {source_file}");
        return Ok(LoadResult {
            outcome: FileOutcome::Skipped,
            rows_inserted: 0,
            schema_changes: 0,
        });
    }

    let imported_at = Utc::now();
    let load_timestamp = imported_at.naive_utc();

    let mut reader = WorkbookReader::open(path, sheet_name, chunk_size)?;
    let mut rows_inserted: u64 = 0;
    let mut schema_changes = 0usize;
    let mut first_chunk = true;

    while let Some(chunk) = reader.next_chunk() {
        if chunk.rows.is_empty() {
            continue;
        }

        let chunk_columns = resolve_columns(&chunk.columns, &chunk.rows);
        let user_columns: Vec<(String, SqlType)> = chunk_columns
            .iter()
            .map(|c| (c.name.clone(), c.ty))
            .collect();

        if first_chunk {
            schema_changes += schema
                .ensure_table(db, table, &user_columns, &source_file)
                .await?;
            first_chunk = false;
        }

        // A column that is entirely null in this chunk carries no type
        // evidence: it lands as TEXT when new, but must not widen an
        // existing typed column.
        let existing = schema.introspect(db, table).await?;
        let reconcile_columns: Vec<(String, SqlType)> = chunk_columns
            .iter()
            .map(|c| {
                if c.has_values {
                    (c.name.clone(), c.ty)
                } else {
                    let live = existing
                        .iter()
                        .find(|(n, _)| *n == c.name)
                        .map(|(_, t)| *t)
                        .unwrap_or(SqlType::Text);
                    (c.name.clone(), live)
                }
            })
            .collect();
        schema_changes += schema
            .reconcile(db, table, &reconcile_columns, &source_file)
            .await?;

        let live = schema.introspect(db, table).await?;
        let columns = insert_columns(&chunk_columns, &live, table)?;

        let rows: Vec<Vec<CellValue>> = chunk
            .rows
            .iter()
            .map(|row| {
                let mut full = row.clone();
                full.push(CellValue::Text(source_file.clone()));
                full.push(CellValue::DateTime(load_timestamp));
                full
            })
            .collect();

        insert_rows(db, table, &columns, &rows).await?;
        rows_inserted += chunk.rows.len() as u64;
        debug!("Inserted chunk of {} rows into {table}", chunk.rows.len());
    }

    if rows_inserted == 0 {
        warn!("No data imported from {source_file}");
        return Ok(LoadResult {
            outcome: FileOutcome::Empty,
            rows_inserted: 0,
            schema_changes,
        });
    }

    ledger::record_import(db, table, &source_file, &file_hash, rows_inserted, imported_at).await?;
    info!("Imported {rows_inserted} rows from {source_file} into {table}");

    Ok(LoadResult {
        outcome: FileOutcome::Imported,
        rows_inserted,
        schema_changes,
    })
}

#[derive(Clone, Debug)]
struct ChunkColumn {
    name: String,
    ty: SqlType,
    has_values: bool,
}

/// Normalize and dedupe the chunk's header names, then infer a type per
/// column. The metadata names are seeded into deduplication so a user
/// column spelled `source_file` cannot collide with the engine's own.
fn resolve_columns(raw_columns: &[String], rows: &[Vec<CellValue>]) -> Vec<ChunkColumn> {
    let mut names: Vec<String> = vec![
        META_SOURCE_FILE.to_string(),
        META_LOAD_TIMESTAMP.to_string(),
    ];
    names.extend(raw_columns.iter().map(|c| normalize_identifier(c)));

    let deduped = dedupe_identifiers(&names);

    deduped
        .into_iter()
        .skip(2)
        .enumerate()
        .map(|(idx, name)| ChunkColumn {
            name,
            ty: infer_column_type(rows.iter().map(|row| &row[idx])),
            has_values: rows.iter().any(|row| !row[idx].is_null()),
        })
        .collect()
}

/// Pair every inserted column with its live type: the chunk's user columns
/// followed by the two metadata columns.
fn insert_columns(
    chunk_columns: &[ChunkColumn],
    live: &[(String, SqlType)],
    table: &str,
) -> Result<Vec<(String, SqlType)>> {
    let live_type = |name: &str| live.iter().find(|(n, _)| n == name).map(|(_, t)| *t);

    let mut columns = Vec::with_capacity(chunk_columns.len() + 2);
    for column in chunk_columns {
        let name = &column.name;
        let ty = live_type(name).ok_or_else(|| EtlError::Schema {
            table: table.to_string(),
            message: format!("column {name} missing after reconcile"),
        })?;
        if column.has_values && !column.ty.assignable_to(ty) {
            return Err(EtlError::Schema {
                table: table.to_string(),
                message: format!("{} not assignable to {ty} for column {name}", column.ty),
            });
        }
        columns.push((name.clone(), ty));
    }
    columns.push((
        META_SOURCE_FILE.to_string(),
        live_type(META_SOURCE_FILE).unwrap_or(SqlType::Text),
    ));
    columns.push((
        META_LOAD_TIMESTAMP.to_string(),
        live_type(META_LOAD_TIMESTAMP).unwrap_or(SqlType::Timestamp),
    ));
    Ok(columns)
}

/// A value converted for its live column type, ready to bind.
#[derive(Debug)]
enum Bound {
    I32(Option<i32>),
    I64(Option<i64>),
    F64(Option<f64>),
    Bool(Option<bool>),
    Date(Option<NaiveDate>),
    Timestamp(Option<NaiveDateTime>),
    Text(Option<String>),
}

fn to_bound(value: &CellValue, ty: SqlType, table: &str) -> Result<Bound> {
    let mismatch = || EtlError::Schema {
        table: table.to_string(),
        message: format!("value {value:?} not storable as {ty}"),
    };

    Ok(match ty {
        SqlType::Integer => Bound::I32(match value {
            CellValue::Null => None,
            _ => Some(value.as_i32().ok_or_else(mismatch)?),
        }),
        SqlType::BigInt => Bound::I64(match value {
            CellValue::Null => None,
            _ => Some(value.as_i64().ok_or_else(mismatch)?),
        }),
        SqlType::DoublePrecision => Bound::F64(match value {
            CellValue::Null => None,
            _ => Some(value.as_f64().ok_or_else(mismatch)?),
        }),
        SqlType::Boolean => Bound::Bool(match value {
            CellValue::Null => None,
            _ => Some(value.as_bool().ok_or_else(mismatch)?),
        }),
        SqlType::Date => Bound::Date(match value {
            CellValue::Null => None,
            _ => Some(value.as_date().ok_or_else(mismatch)?),
        }),
        SqlType::Timestamp => Bound::Timestamp(match value {
            CellValue::Null => None,
            _ => Some(value.as_datetime().ok_or_else(mismatch)?),
        }),
        SqlType::Text => Bound::Text(value.to_text()),
    })
}

/// Multi-row parameterized insert, split to respect the bind budget.
async fn insert_rows(
    db: &mut Db,
    table: &str,
    columns: &[(String, SqlType)],
    rows: &[Vec<CellValue>],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    if db.is_dry_run() {
        info!("[dry run] would insert {} rows into {table}", rows.len());
        return Ok(());
    }

    let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);

    for batch in rows.chunks(rows_per_statement) {
        let bound: Vec<Vec<Bound>> = batch
            .iter()
            .map(|row| {
                row.iter()
                    .zip(columns)
                    .map(|(value, (_, ty))| to_bound(value, *ty, table))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!(r#"INSERT INTO "{table}" ("#));
        let mut separated = qb.separated(", ");
        for (name, _) in columns {
            separated.push(format!(r#""{name}""#));
        }
        qb.push(") ");

        qb.push_values(bound, |mut b, row| {
            for value in row {
                match value {
                    Bound::I32(v) => b.push_bind(v),
                    Bound::I64(v) => b.push_bind(v),
                    Bound::F64(v) => b.push_bind(v),
                    Bound::Bool(v) => b.push_bind(v),
                    Bound::Date(v) => b.push_bind(v),
                    Bound::Timestamp(v) => b.push_bind(v),
                    Bound::Text(v) => b.push_bind(v),
                };
            }
        });

        qb.build()
            .execute(db.conn()?)
            .await
            .map_err(|e| classify(table, e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_columns_normalizes_and_infers() {
        let raw = vec!["  My Col (%)".to_string(), "Amount".to_string()];
        let rows = vec![
            vec![CellValue::Text("a".into()), CellValue::Int(1)],
            vec![CellValue::Text("b".into()), CellValue::Int(2)],
        ];

        let columns = resolve_columns(&raw, &rows);
        assert_eq!(columns[0].name, "my_col");
        assert_eq!(columns[0].ty, SqlType::Text);
        assert_eq!(columns[1].name, "amount");
        assert_eq!(columns[1].ty, SqlType::Integer);
    }

    #[test]
    fn test_resolve_columns_protects_metadata_names() {
        let raw = vec!["source_file".to_string(), "load_timestamp".to_string()];
        let rows = vec![vec![
            CellValue::Text("x".into()),
            CellValue::Text("y".into()),
        ]];

        let columns = resolve_columns(&raw, &rows);
        assert_eq!(columns[0].name, "source_file_2");
        assert_eq!(columns[1].name, "load_timestamp_2");
    }

    #[test]
    fn test_resolve_columns_dedupes_duplicate_headers() {
        let raw = vec!["x".to_string(), "X".to_string(), "x ".to_string()];
        let rows = vec![vec![
            CellValue::Int(1),
            CellValue::Int(2),
            CellValue::Int(3),
        ]];

        let names: Vec<_> = resolve_columns(&raw, &rows)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["x", "x_2", "x_3"]);
    }

    #[test]
    fn test_resolve_columns_flags_all_null_columns() {
        let raw = vec!["a".to_string(), "b".to_string()];
        let rows = vec![
            vec![CellValue::Int(1), CellValue::Null],
            vec![CellValue::Null, CellValue::Null],
        ];

        let columns = resolve_columns(&raw, &rows);
        assert!(columns[0].has_values);
        assert!(!columns[1].has_values);
        // No evidence defaults to TEXT for a fresh column.
        assert_eq!(columns[1].ty, SqlType::Text);
    }

    #[test]
    fn test_to_bound_widens_values_to_live_type() {
        // An integer stored in a column already widened to DOUBLE PRECISION.
        let b = to_bound(&CellValue::Int(3), SqlType::DoublePrecision, "t").unwrap();
        assert!(matches!(b, Bound::F64(Some(v)) if v == 3.0));

        // A date stored in a TIMESTAMP column keeps its date portion.
        let d = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let b = to_bound(&CellValue::Date(d), SqlType::Timestamp, "t").unwrap();
        assert!(matches!(b, Bound::Timestamp(Some(dt)) if dt.date() == d));

        // Anything renders as text in a TEXT column.
        let b = to_bound(&CellValue::Bool(true), SqlType::Text, "t").unwrap();
        assert!(matches!(b, Bound::Text(Some(s)) if s == "true"));
    }

    #[test]
    fn test_to_bound_nulls() {
        for ty in [
            SqlType::Integer,
            SqlType::BigInt,
            SqlType::DoublePrecision,
            SqlType::Boolean,
            SqlType::Date,
            SqlType::Timestamp,
            SqlType::Text,
        ] {
            let b = to_bound(&CellValue::Null, ty, "t").unwrap();
            let is_null = matches!(
                b,
                Bound::I32(None)
                    | Bound::I64(None)
                    | Bound::F64(None)
                    | Bound::Bool(None)
                    | Bound::Date(None)
                    | Bound::Timestamp(None)
                    | Bound::Text(None)
            );
            assert!(is_null, "{ty} null did not bind as NULL");
        }
    }

    #[test]
    fn test_to_bound_rejects_untyped_mismatch() {
        let err = to_bound(&CellValue::Text("x".into()), SqlType::Integer, "t").unwrap_err();
        assert!(matches!(err, EtlError::Schema { .. }));
    }
}
