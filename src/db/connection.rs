//! Single-connection database access
//!
//! ETL runs hold one plain connection instead of a pool; a long-lived pool
//! would only keep locks alive between files. In dry-run mode (`SKIP_DB=1`)
//! no connection exists and every write is logged instead of executed.

use crate::config::Config;
use crate::error::{EtlError, Result};
use crate::ingestion::inference::SqlType;
use sqlx::{Connection, PgConnection, Row};
use tracing::{debug, info};

pub struct Db {
    conn: Option<PgConnection>,
    in_transaction: bool,
}

impl Db {
    /// Connect and bootstrap the audit tables, or return a dry-run handle
    /// when `SKIP_DB=1`.
    pub async fn connect(config: &Config) -> Result<Self> {
        if config.skip_db {
            info!("SKIP_DB=1: dry run, no database connection");
            return Ok(Self::dry_run());
        }

        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| EtlError::Config("DATABASE_URL is not set".to_string()))?;

        info!("Connecting to {}", config.masked_database_url());
        let mut conn = PgConnection::connect(url)
            .await
            .map_err(|e| EtlError::Connection(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(|e| EtlError::Connection(e.to_string()))?;

        let mut db = Self {
            conn: Some(conn),
            in_transaction: false,
        };
        super::ledger::ensure_audit_tables(&mut db).await?;
        Ok(db)
    }

    /// A handle that performs no database work; every write logs instead.
    pub fn dry_run() -> Self {
        Self {
            conn: None,
            in_transaction: false,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.conn.is_none()
    }

    pub fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EtlError::Connection("no database connection (dry run)".to_string()))
    }

    /// Execute a DDL statement; in dry-run mode, log what would run.
    pub async fn execute_ddl(&mut self, table: &str, ddl: &str) -> Result<()> {
        if self.is_dry_run() {
            info!("[dry run] would execute: {ddl}");
            return Ok(());
        }

        sqlx::raw_sql(ddl)
            .execute(self.conn()?)
            .await
            .map_err(|e| classify(table, e))?;

        debug!("Executed DDL: {ddl}");
        Ok(())
    }

    pub async fn table_exists(&mut self, table: &str) -> Result<bool> {
        if self.is_dry_run() {
            return Ok(false);
        }

        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM information_schema.tables
                 WHERE table_schema = 'public' AND table_name = $1
             )",
        )
        .bind(table)
        .fetch_one(self.conn()?)
        .await
        .map_err(|e| classify(table, e))?;

        Ok(row.get::<bool, _>(0))
    }

    /// Live column set from the catalog, in ordinal position order.
    pub async fn table_columns(&mut self, table: &str) -> Result<Vec<(String, SqlType)>> {
        if self.is_dry_run() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT column_name, data_type
             FROM information_schema.columns
             WHERE table_schema = 'public' AND table_name = $1
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(self.conn()?)
        .await
        .map_err(|e| classify(table, e))?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get("column_name");
                let ty: String = row.get("data_type");
                (name, SqlType::from_pg(&ty))
            })
            .collect())
    }

    pub async fn begin(&mut self) -> Result<()> {
        if self.is_dry_run() || self.in_transaction {
            return Ok(());
        }
        sqlx::raw_sql("BEGIN")
            .execute(self.conn()?)
            .await
            .map_err(|e| EtlError::Connection(e.to_string()))?;
        self.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        if self.is_dry_run() || !self.in_transaction {
            return Ok(());
        }
        sqlx::raw_sql("COMMIT")
            .execute(self.conn()?)
            .await
            .map_err(|e| EtlError::Connection(e.to_string()))?;
        self.in_transaction = false;
        Ok(())
    }

    /// Best-effort rollback; errors are swallowed because the connection
    /// may already be gone when this runs.
    pub async fn rollback(&mut self) {
        if self.is_dry_run() || !self.in_transaction {
            return;
        }
        self.in_transaction = false;
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = sqlx::raw_sql("ROLLBACK").execute(conn).await {
                debug!("Rollback failed: {e}");
            }
        }
    }

    pub async fn close(self) {
        if let Some(conn) = self.conn {
            if let Err(e) = conn.close().await {
                debug!("Connection close failed: {e}");
            } else {
                info!("Database connection closed");
            }
        }
    }
}

/// Map a sqlx error onto the ETL taxonomy by SQLSTATE class: 23 (integrity
/// constraint violation) aborts the file without a ledger entry, 22/42
/// (data exception, DDL failure) abort the file, connection-level failures
/// abort the run.
pub fn classify(table: &str, e: sqlx::Error) -> EtlError {
    match &e {
        sqlx::Error::Database(dbe) => {
            let code = dbe.code().map(|c| c.into_owned()).unwrap_or_default();
            if code.starts_with("23") {
                EtlError::Integrity {
                    table: table.to_string(),
                    message: dbe.to_string(),
                }
            } else if code.starts_with("22") || code.starts_with("42") {
                EtlError::Schema {
                    table: table.to_string(),
                    message: dbe.to_string(),
                }
            } else if code.starts_with("08") || code.starts_with("57") {
                EtlError::Connection(dbe.to_string())
            } else {
                EtlError::Schema {
                    table: table.to_string(),
                    message: dbe.to_string(),
                }
            }
        }
        _ => EtlError::Connection(e.to_string()),
    }
}
