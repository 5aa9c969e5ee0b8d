//! Integration tests against a live PostgreSQL.
//!
//! Run with a scratch database:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/sheetpipe_test cargo test -- --ignored
//! ```

use sheetpipe::config::{Config, SheetMap};
use sheetpipe::db::{ledger, Db};
use sheetpipe::ingestion::{Orchestrator, RunStatus};
use sqlx::{Connection, PgConnection, Row};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Minimal single-sheet workbook, (header, rows) given as inline strings
/// and numbers already rendered.
fn write_xlsx(path: &Path, sheet_name: &str, rows: &[Vec<(&str, bool)>]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::<()>::default();

    zip.start_file("[Content_Types].xml", options).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
<Default Extension="xml" ContentType="application/xml"/>
<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>
<Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>
</Types>"#,
    )
    .unwrap();

    zip.start_file("_rels/.rels", options).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>
</Relationships>"#,
    )
    .unwrap();

    zip.start_file("xl/workbook.xml", options).unwrap();
    zip.write_all(
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
<sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets>
</workbook>"#,
            xml_escape(sheet_name)
        )
        .as_bytes(),
    )
    .unwrap();

    zip.start_file("xl/_rels/workbook.xml.rels", options).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
</Relationships>"#,
    )
    .unwrap();

    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (row_idx, row) in rows.iter().enumerate() {
        sheet.push_str(&format!(r#"<row r="{}">"#, row_idx + 1));
        for (col_idx, (value, is_number)) in row.iter().enumerate() {
            let reference = format!("{}{}", (b'A' + col_idx as u8) as char, row_idx + 1);
            if *is_number {
                sheet.push_str(&format!(r#"<c r="{reference}"><v>{value}</v></c>"#));
            } else {
                sheet.push_str(&format!(
                    r#"<c r="{reference}" t="inlineStr"><is><t>{}</t></is></c>"#,
                    xml_escape(value)
                ));
            }
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    zip.start_file("xl/worksheets/sheet1.xml", options).unwrap();
    zip.write_all(sheet.as_bytes()).unwrap();
    zip.finish().unwrap();
}

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database")
}

fn test_config() -> Config {
    Config {
        database_url: Some(database_url()),
        sectional_commit: false,
        pause_every: 0,
        pause_seconds: 0,
        chunk_size: 10_000,
        skip_db: false,
        debug: false,
        sheet_map: SheetMap::from_yaml("default_sheet: Data").unwrap(),
    }
}

/// Unique per-test folder name so target tables never collide between runs.
fn unique_folder(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    format!("{prefix}{}_{nanos}", std::process::id())
}

async fn raw_connection() -> PgConnection {
    PgConnection::connect(&database_url()).await.unwrap()
}

async fn count_rows(conn: &mut PgConnection, table: &str) -> i64 {
    sqlx::query(&format!(r#"SELECT COUNT(*) FROM "{table}""#))
        .fetch_one(conn)
        .await
        .unwrap()
        .get(0)
}

async fn drop_table(conn: &mut PgConnection, table: &str) {
    let _ = sqlx::raw_sql(&format!(r#"DROP TABLE IF EXISTS "{table}""#))
        .execute(&mut *conn)
        .await;
    let _ = sqlx::query("DELETE FROM etl_imports WHERE table_name = $1")
        .bind(table)
        .execute(&mut *conn)
        .await;
    let _ = sqlx::query("DELETE FROM etl_schema_changes WHERE table_name = $1")
        .bind(table)
        .execute(&mut *conn)
        .await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL and DATABASE_URL"]
async fn test_import_rerun_widen_and_revert() {
    let folder = unique_folder("sp_sales_");
    let table = folder.clone();

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join(&folder)).unwrap();

    let q1 = [
        vec![("id", false), ("name", false), ("when", false)],
        vec![("1", true), ("alpha", false), ("2024-01-05", false)],
        vec![("2", true), ("beta", false), ("2024-01-12", false)],
        vec![("3", true), ("gamma", false), ("2024-02-01", false)],
        vec![("4", true), ("delta", false), ("2024-02-19", false)],
        vec![("5", true), ("epsilon", false), ("2024-03-03", false)],
    ];
    write_xlsx(&root.join(&folder).join("q1.xlsx"), "Data", &q1);

    // First run creates the table and imports five rows.
    let config = test_config();
    let mut orchestrator = Orchestrator::new(config.clone(), Db::connect(&config).await.unwrap());
    assert_eq!(orchestrator.run(root).await.unwrap(), RunStatus::Completed);
    assert_eq!(orchestrator.tracker.files_processed, 1);
    assert_eq!(orchestrator.tracker.rows_inserted, 5);
    orchestrator.finish().await;

    let mut conn = raw_connection().await;
    assert_eq!(count_rows(&mut conn, &table).await, 5);

    // Metadata columns are populated on every row.
    let nulls: i64 = sqlx::query(&format!(
        r#"SELECT COUNT(*) FROM "{table}" WHERE source_file IS NULL OR load_timestamp IS NULL"#
    ))
    .fetch_one(&mut conn)
    .await
    .unwrap()
    .get(0);
    assert_eq!(nulls, 0);

    // Exactly one ledger entry, four schema changes (create + 3 columns).
    let imports: i64 = sqlx::query("SELECT COUNT(*) FROM etl_imports WHERE table_name = $1")
        .bind(&table)
        .fetch_one(&mut conn)
        .await
        .unwrap()
        .get(0);
    assert_eq!(imports, 1);
    let changes: i64 =
        sqlx::query("SELECT COUNT(*) FROM etl_schema_changes WHERE table_name = $1")
            .bind(&table)
            .fetch_one(&mut conn)
            .await
            .unwrap()
            .get(0);
    assert_eq!(changes, 4);

    // Re-running the same file is a no-op.
    let mut rerun = Orchestrator::new(config.clone(), Db::connect(&config).await.unwrap());
    assert_eq!(rerun.run(root).await.unwrap(), RunStatus::Completed);
    assert_eq!(rerun.tracker.files_processed, 0);
    assert_eq!(rerun.tracker.files_skipped, 1);
    rerun.finish().await;
    assert_eq!(count_rows(&mut conn, &table).await, 5);

    // A second file with timestamps widens `when` from DATE to TIMESTAMP.
    let q2 = [
        vec![("id", false), ("name", false), ("when", false)],
        vec![("6", true), ("zeta", false), ("2024-04-01 09:30:00", false)],
    ];
    write_xlsx(&root.join(&folder).join("q2.xlsx"), "Data", &q2);

    let mut widen = Orchestrator::new(config.clone(), Db::connect(&config).await.unwrap());
    assert_eq!(widen.run(root).await.unwrap(), RunStatus::Completed);
    widen.finish().await;

    let data_type: String = sqlx::query(
        "SELECT data_type FROM information_schema.columns
         WHERE table_name = $1 AND column_name = 'when'",
    )
    .bind(&table)
    .fetch_one(&mut conn)
    .await
    .unwrap()
    .get(0);
    assert_eq!(data_type, "timestamp without time zone");

    // Prior rows kept their date portion through the cast.
    let preserved: i64 = sqlx::query(&format!(
        r#"SELECT COUNT(*) FROM "{table}" WHERE "when" = TIMESTAMP '2024-01-05 00:00:00'"#
    ))
    .fetch_one(&mut conn)
    .await
    .unwrap()
    .get(0);
    assert_eq!(preserved, 1);
    assert_eq!(count_rows(&mut conn, &table).await, 6);

    // Revert q1 by fingerprint, then reimport reproduces the row count.
    let q1_path = root.join(&folder).join("q1.xlsx");
    let hash = sheetpipe::excel::compute_file_hash(&q1_path).unwrap();

    let mut db = Db::connect(&config).await.unwrap();
    let deleted = ledger::revert_by_fingerprint(&mut db, &table, &hash)
        .await
        .unwrap();
    db.close().await;
    assert_eq!(deleted, 5);
    assert_eq!(count_rows(&mut conn, &table).await, 1);

    let mut reimport = Orchestrator::new(config.clone(), Db::connect(&config).await.unwrap());
    assert_eq!(reimport.run(root).await.unwrap(), RunStatus::Completed);
    assert_eq!(reimport.tracker.files_processed, 1);
    assert_eq!(reimport.tracker.files_skipped, 1);
    reimport.finish().await;
    assert_eq!(count_rows(&mut conn, &table).await, 6);

    drop_table(&mut conn, &table).await;
    let _ = conn.close().await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL and DATABASE_URL"]
async fn test_revert_schema_changes_drops_added_columns() {
    let folder = unique_folder("sp_schema_");
    let table = folder.clone();

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join(&folder)).unwrap();

    let first = [
        vec![("id", false)],
        vec![("1", true)],
    ];
    write_xlsx(&root.join(&folder).join("a.xlsx"), "Data", &first);

    let second = [
        vec![("id", false), ("note", false)],
        vec![("2", true), ("hello", false)],
    ];
    write_xlsx(&root.join(&folder).join("b.xlsx"), "Data", &second);

    let config = test_config();
    let mut orchestrator = Orchestrator::new(config.clone(), Db::connect(&config).await.unwrap());
    assert_eq!(orchestrator.run(root).await.unwrap(), RunStatus::Completed);
    orchestrator.finish().await;

    let b_path = fs::canonicalize(root.join(&folder).join("b.xlsx"))
        .unwrap()
        .display()
        .to_string();

    // Dry run lists the DROP COLUMN without executing it.
    let mut db = Db::connect(&config).await.unwrap();
    let plan = ledger::revert_schema_changes(&mut db, &table, &b_path, true)
        .await
        .unwrap();
    assert_eq!(plan.statements.len(), 1);
    assert!(plan.statements[0].contains("DROP COLUMN"));

    let mut conn = raw_connection().await;
    let note_exists: i64 = sqlx::query(
        "SELECT COUNT(*) FROM information_schema.columns
         WHERE table_name = $1 AND column_name = 'note'",
    )
    .bind(&table)
    .fetch_one(&mut conn)
    .await
    .unwrap()
    .get(0);
    assert_eq!(note_exists, 1);

    // Executing the plan drops the column.
    let plan = ledger::revert_schema_changes(&mut db, &table, &b_path, false)
        .await
        .unwrap();
    assert_eq!(plan.statements.len(), 1);
    db.close().await;

    let note_exists: i64 = sqlx::query(
        "SELECT COUNT(*) FROM information_schema.columns
         WHERE table_name = $1 AND column_name = 'note'",
    )
    .bind(&table)
    .fetch_one(&mut conn)
    .await
    .unwrap()
    .get(0);
    assert_eq!(note_exists, 0);

    drop_table(&mut conn, &table).await;
    let _ = conn.close().await;
}
