//! Table DDL ownership: creation, column addition and safe type widening
//!
//! Every change is appended to the schema-change ledger. Column types only
//! move upward along the widening ladder; the manager never drops or
//! narrows anything.

use crate::db::{ledger, ChangeType, Db};
use crate::error::Result;
use crate::ingestion::inference::SqlType;
use crate::ingestion::{META_LOAD_TIMESTAMP, META_SOURCE_FILE};
use std::collections::HashMap;
use tracing::info;

pub struct SchemaManager {
    /// Introspection cache; dropped for a table after any reconcile that
    /// issued DDL so the next lookup hits the live catalog.
    cache: HashMap<String, Vec<(String, SqlType)>>,
}

impl SchemaManager {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Current `{column: type}` view of a table, cached between DDL changes.
    pub async fn introspect(&mut self, db: &mut Db, table: &str) -> Result<Vec<(String, SqlType)>> {
        if let Some(columns) = self.cache.get(table) {
            return Ok(columns.clone());
        }

        let columns = db.table_columns(table).await?;
        if !columns.is_empty() {
            self.cache.insert(table.to_string(), columns.clone());
        }
        Ok(columns)
    }

    /// Create the table with the given user columns plus the metadata
    /// columns when it does not exist yet. Returns the number of schema
    /// changes logged (zero when the table was already there).
    pub async fn ensure_table(
        &mut self,
        db: &mut Db,
        table: &str,
        user_columns: &[(String, SqlType)],
        source_file: &str,
    ) -> Result<usize> {
        let exists = if db.is_dry_run() {
            self.cache.contains_key(table)
        } else {
            db.table_exists(table).await?
        };
        if exists {
            return Ok(0);
        }

        info!(
            "Creating table {table} with {} user columns",
            user_columns.len()
        );
        db.execute_ddl(table, &create_table_ddl(table, user_columns))
            .await?;

        ledger::record_schema_change(
            db,
            table,
            ChangeType::CreateTable,
            None,
            None,
            None,
            source_file,
        )
        .await?;
        for (name, ty) in user_columns {
            ledger::record_schema_change(
                db,
                table,
                ChangeType::AddColumn,
                Some(name),
                None,
                Some(ty.pg_name()),
                source_file,
            )
            .await?;
        }

        let mut full = user_columns.to_vec();
        full.push((META_SOURCE_FILE.to_string(), SqlType::Text));
        full.push((META_LOAD_TIMESTAMP.to_string(), SqlType::Timestamp));
        self.cache.insert(table.to_string(), full);

        Ok(1 + user_columns.len())
    }

    /// Align the live table with an incoming chunk schema: add missing
    /// columns, widen types along the ladder. Returns the number of
    /// changes performed.
    ///
    /// After this returns, every inferred chunk type is assignable without
    /// loss to the live column type.
    pub async fn reconcile(
        &mut self,
        db: &mut Db,
        table: &str,
        chunk_columns: &[(String, SqlType)],
        source_file: &str,
    ) -> Result<usize> {
        let mut current = self.introspect(db, table).await?;
        let mut changes = 0usize;

        for (name, inferred) in chunk_columns {
            match current.iter().position(|(c, _)| c == name) {
                None => {
                    info!("Adding column {name} ({inferred}) to {table}");
                    db.execute_ddl(table, &add_column_ddl(table, name, *inferred))
                        .await?;
                    ledger::record_schema_change(
                        db,
                        table,
                        ChangeType::AddColumn,
                        Some(name),
                        None,
                        Some(inferred.pg_name()),
                        source_file,
                    )
                    .await?;
                    current.push((name.clone(), *inferred));
                    changes += 1;
                }
                Some(idx) => {
                    let existing = current[idx].1;
                    let widened = existing.widen(*inferred);
                    if widened == existing {
                        continue;
                    }
                    info!("Widening column {table}.{name}: {existing} -> {widened}");
                    db.execute_ddl(table, &alter_type_ddl(table, name, widened))
                        .await?;
                    ledger::record_schema_change(
                        db,
                        table,
                        ChangeType::AlterType,
                        Some(name),
                        Some(existing.pg_name()),
                        Some(widened.pg_name()),
                        source_file,
                    )
                    .await?;
                    current[idx].1 = widened;
                    changes += 1;
                }
            }
        }

        if changes > 0 {
            if db.is_dry_run() {
                // No catalog to re-read; carry the simulated state forward.
                self.cache.insert(table.to_string(), current);
            } else {
                self.cache.remove(table);
            }
        }

        Ok(changes)
    }
}

impl Default for SchemaManager {
    fn default() -> Self {
        Self::new()
    }
}

fn create_table_ddl(table: &str, user_columns: &[(String, SqlType)]) -> String {
    let mut defs: Vec<String> = user_columns
        .iter()
        .map(|(name, ty)| format!(r#""{name}" {}"#, ty.pg_name()))
        .collect();
    defs.push(format!(r#""{META_SOURCE_FILE}" TEXT NOT NULL"#));
    defs.push(format!(r#""{META_LOAD_TIMESTAMP}" TIMESTAMP NOT NULL"#));
    format!(r#"CREATE TABLE "{table}" ({})"#, defs.join(", "))
}

fn add_column_ddl(table: &str, column: &str, ty: SqlType) -> String {
    format!(r#"ALTER TABLE "{table}" ADD COLUMN "{column}" {}"#, ty.pg_name())
}

/// Widening to TEXT needs an explicit cast; the other ladder moves have
/// implicit casts.
fn alter_type_ddl(table: &str, column: &str, to: SqlType) -> String {
    match to {
        SqlType::Text => format!(
            r#"ALTER TABLE "{table}" ALTER COLUMN "{column}" TYPE TEXT USING "{column}"::text"#
        ),
        other => format!(
            r#"ALTER TABLE "{table}" ALTER COLUMN "{column}" TYPE {}"#,
            other.pg_name()
        ),
    }
}
