//! Chunked row source over a single workbook sheet
//!
//! The modern reader is tried first and the legacy reader second, because
//! files in the wild frequently carry the wrong extension. Both failures
//! travel in the resulting error.

use crate::error::{EtlError, Result};
use crate::ingestion::inference::{coerce_string, normalize_datetime, CellValue};
use calamine::{open_workbook, Data, Range, Reader, Xls, Xlsb, Xlsx};
use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

/// A bounded batch of rows with a homogeneous column set.
#[derive(Clone, Debug)]
pub struct Chunk {
    /// Raw header names, before identifier normalization.
    pub columns: Vec<String>,
    /// Row-major values; every row has `columns.len()` entries.
    pub rows: Vec<Vec<CellValue>>,
}

/// Pull-based reader producing chunks of up to `chunk_size` rows.
///
/// Finite and non-restartable: once a chunk is consumed, re-reading the
/// file requires opening a new reader.
#[derive(Debug)]
pub struct WorkbookReader {
    columns: Vec<String>,
    rows: VecDeque<Vec<Data>>,
    chunk_size: usize,
}

impl WorkbookReader {
    pub fn open(path: &Path, sheet_name: &str, chunk_size: usize) -> Result<Self> {
        debug!(
            "Opening {} sheet {:?} with chunk size {}",
            path.display(),
            sheet_name,
            chunk_size
        );

        let range = load_range(path, sheet_name)?;

        let Some(range) = range else {
            warn!(
                "Sheet {:?} not found in {}, producing no rows",
                sheet_name,
                path.display()
            );
            return Ok(Self {
                columns: Vec::new(),
                rows: VecDeque::new(),
                chunk_size,
            });
        };

        let mut rows_iter = range.rows();
        let Some(header_row) = rows_iter.next() else {
            warn!("Empty sheet {:?} in {}", sheet_name, path.display());
            return Ok(Self {
                columns: Vec::new(),
                rows: VecDeque::new(),
                chunk_size,
            });
        };

        if header_row.iter().all(|c| matches!(c, Data::Empty)) {
            warn!("Empty or invalid header in {}", path.display());
        }

        let columns: Vec<String> = header_row
            .iter()
            .enumerate()
            .map(|(i, cell)| header_name(i, cell))
            .collect();

        let rows: VecDeque<Vec<Data>> = rows_iter
            .filter(|row| !row.iter().all(|c| matches!(c, Data::Empty)))
            .map(|row| row.to_vec())
            .collect();

        Ok(Self {
            columns,
            rows,
            chunk_size: chunk_size.max(1),
        })
    }

    /// Yield the next chunk, or `None` at end of stream. Consumed rows are
    /// released immediately.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        if self.rows.is_empty() || self.columns.is_empty() {
            return None;
        }

        let take = self.chunk_size.min(self.rows.len());
        let width = self.columns.len();
        let rows = self
            .rows
            .drain(..take)
            .map(|raw| {
                let mut row: Vec<CellValue> = raw.iter().take(width).map(cell_to_value).collect();
                row.resize(width, CellValue::Null);
                row
            })
            .collect();

        Some(Chunk {
            columns: self.columns.clone(),
            rows,
        })
    }
}

/// Open the sheet with the modern reader, falling back to the legacy one.
fn load_range(path: &Path, sheet_name: &str) -> Result<Option<Range<Data>>> {
    let is_xlsb = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("xlsb"));

    let modern = if is_xlsb {
        open_range::<Xlsb<BufReader<File>>>(path, sheet_name)
    } else {
        open_range::<Xlsx<BufReader<File>>>(path, sheet_name)
    };

    match modern {
        Ok(range) => Ok(range),
        Err(modern_err) => match open_range::<Xls<BufReader<File>>>(path, sheet_name) {
            Ok(range) => {
                debug!(
                    "Modern reader failed for {} ({modern_err}), legacy reader succeeded",
                    path.display()
                );
                Ok(range)
            }
            Err(legacy_err) => Err(EtlError::Read {
                path: path.to_path_buf(),
                modern: modern_err,
                legacy: legacy_err,
            }),
        },
    }
}

fn open_range<R>(path: &Path, sheet_name: &str) -> std::result::Result<Option<Range<Data>>, String>
where
    R: Reader<BufReader<File>>,
    R::Error: std::fmt::Display,
{
    let mut workbook: R = open_workbook::<R, _>(path).map_err(|e| e.to_string())?;

    let sheet = workbook
        .sheet_names()
        .iter()
        .find(|n| n.eq_ignore_ascii_case(sheet_name))
        .cloned();

    match sheet {
        Some(name) => workbook
            .worksheet_range(&name)
            .map(Some)
            .map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

fn header_name(index: usize, cell: &Data) -> String {
    let name = match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        other => other.to_string().trim().to_string(),
    };
    if name.is_empty() {
        format!("col_{index}")
    } else {
        name
    }
}

/// Normalize a calamine cell into the closed value set.
///
/// Whole floats become integers (spreadsheets store most integers as
/// floats); invalid date serials and error cells become null.
fn cell_to_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Null,
        Data::Bool(b) => CellValue::Bool(*b),
        Data::Int(i) => CellValue::Int(*i),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                CellValue::Int(*f as i64)
            } else {
                CellValue::Float(*f)
            }
        }
        Data::String(s) => coerce_string(s),
        Data::DateTime(x) => match x.as_datetime() {
            Some(dt) => normalize_datetime(dt),
            None => CellValue::Null,
        },
        Data::DateTimeIso(s) => parse_iso_datetime(s),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(_) => CellValue::Null,
    }
}

fn parse_iso_datetime(s: &str) -> CellValue {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return normalize_datetime(dt);
        }
    }
    coerce_string(s)
}
