//! Cell value model and SQL type inference with the widening ladder

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of values a cell can carry once normalized.
///
/// Every value entering the loader is converted into one of these variants
/// before inference; nothing opaque flows downstream. Empty temporal
/// sentinels are represented as `Null`, never as a literal string.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Render as text, used when the live column type is TEXT.
    pub fn to_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(b) => Some(b.to_string()),
            CellValue::Int(i) => Some(i.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            CellValue::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            CellValue::Text(s) => Some(s.clone()),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            CellValue::Int(i) => i32::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(i) => Some(*i as f64),
            CellValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(d) => Some(*d),
            CellValue::DateTime(dt) => Some(dt.date()),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::Date(d) => d.and_hms_opt(0, 0, 0),
            CellValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

/// Coerce a raw string cell into a typed value.
///
/// Trimmed empties become null; boolean words, numeric literals (currency
/// symbols, percent signs and thousands separators stripped) and common
/// date/datetime layouts are promoted to their typed variants. Everything
/// else stays text.
pub fn coerce_string(raw: &str) -> CellValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return CellValue::Null;
    }

    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "yes" => return CellValue::Bool(true),
        "false" | "no" => return CellValue::Bool(false),
        _ => {}
    }

    if let Some(value) = parse_numeric(trimmed) {
        return value;
    }
    if let Some(value) = parse_temporal(trimmed) {
        return value;
    }

    CellValue::Text(trimmed.to_string())
}

fn parse_numeric(s: &str) -> Option<CellValue> {
    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, '$' | '%' | ',') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() || (cleaned.len() != s.len() && cleaned.parse::<f64>().is_err()) {
        return None;
    }

    if let Ok(i) = cleaned.parse::<i64>() {
        return Some(CellValue::Int(i));
    }
    if let Ok(f) = cleaned.parse::<f64>() {
        if f.is_finite() {
            return Some(CellValue::Float(f));
        }
    }
    None
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%b-%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
];

fn parse_temporal(s: &str) -> Option<CellValue> {
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(normalize_datetime(dt));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(CellValue::Date(d));
        }
    }
    None
}

/// A datetime at exactly midnight is treated as a pure calendar date.
pub fn normalize_datetime(dt: NaiveDateTime) -> CellValue {
    if dt.time() == NaiveTime::from_hms_opt(0, 0, 0).unwrap() && dt.nanosecond() == 0 {
        CellValue::Date(dt.date())
    } else {
        CellValue::DateTime(dt)
    }
}

/// The fixed ladder of column types. Widening moves strictly upward;
/// `Text` is terminal and the join of any incompatible pairing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Integer,
    BigInt,
    DoublePrecision,
    Date,
    Timestamp,
    Boolean,
    Text,
}

impl SqlType {
    pub fn pg_name(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::DoublePrecision => "DOUBLE PRECISION",
            SqlType::Date => "DATE",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Text => "TEXT",
        }
    }

    /// Map a catalog type name back onto the ladder. Types the engine never
    /// emits collapse to TEXT, the terminal element.
    pub fn from_pg(name: &str) -> SqlType {
        match name.trim().to_uppercase().as_str() {
            "SMALLINT" | "INT2" | "INTEGER" | "INT" | "INT4" => SqlType::Integer,
            "BIGINT" | "INT8" => SqlType::BigInt,
            "REAL" | "FLOAT4" | "DOUBLE PRECISION" | "FLOAT8" | "NUMERIC" => {
                SqlType::DoublePrecision
            }
            "DATE" => SqlType::Date,
            "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" | "TIMESTAMP WITH TIME ZONE"
            | "TIMESTAMPTZ" => SqlType::Timestamp,
            "BOOLEAN" | "BOOL" => SqlType::Boolean,
            _ => SqlType::Text,
        }
    }

    fn numeric_rank(&self) -> Option<u8> {
        match self {
            SqlType::Integer => Some(0),
            SqlType::BigInt => Some(1),
            SqlType::DoublePrecision => Some(2),
            _ => None,
        }
    }

    fn temporal_rank(&self) -> Option<u8> {
        match self {
            SqlType::Date => Some(0),
            SqlType::Timestamp => Some(1),
            _ => None,
        }
    }

    /// Least upper bound of two types in the widening ladder.
    pub fn widen(self, other: SqlType) -> SqlType {
        if self == other {
            return self;
        }
        if let (Some(a), Some(b)) = (self.numeric_rank(), other.numeric_rank()) {
            return if a >= b { self } else { other };
        }
        if let (Some(a), Some(b)) = (self.temporal_rank(), other.temporal_rank()) {
            return if a >= b { self } else { other };
        }
        SqlType::Text
    }

    /// Whether `self` can be stored without loss in a column of type `target`.
    pub fn assignable_to(self, target: SqlType) -> bool {
        self.widen(target) == target
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pg_name())
    }
}

/// Infer the column type for a set of observed values.
///
/// Takes the widest ladder type that accepts every non-null value; a column
/// of nothing but nulls is TEXT.
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = &'a CellValue>) -> SqlType {
    let mut saw_any = false;
    let mut all_bool = true;
    let mut all_int = true;
    let mut all_numeric = true;
    let mut all_date = true;
    let mut all_temporal = true;
    let mut fits_i32 = true;

    for value in values {
        match value {
            CellValue::Null => continue,
            CellValue::Bool(_) => {
                all_int = false;
                all_numeric = false;
                all_date = false;
                all_temporal = false;
            }
            CellValue::Int(i) => {
                all_bool = false;
                all_date = false;
                all_temporal = false;
                if i32::try_from(*i).is_err() {
                    fits_i32 = false;
                }
            }
            CellValue::Float(_) => {
                all_bool = false;
                all_int = false;
                all_date = false;
                all_temporal = false;
            }
            CellValue::Date(_) => {
                all_bool = false;
                all_int = false;
                all_numeric = false;
            }
            CellValue::DateTime(_) => {
                all_bool = false;
                all_int = false;
                all_numeric = false;
                all_date = false;
            }
            CellValue::Text(_) => {
                all_bool = false;
                all_int = false;
                all_numeric = false;
                all_date = false;
                all_temporal = false;
            }
        }
        saw_any = true;
    }

    if !saw_any {
        SqlType::Text
    } else if all_bool {
        SqlType::Boolean
    } else if all_int {
        if fits_i32 {
            SqlType::Integer
        } else {
            SqlType::BigInt
        }
    } else if all_numeric {
        SqlType::DoublePrecision
    } else if all_date {
        SqlType::Date
    } else if all_temporal {
        SqlType::Timestamp
    } else {
        SqlType::Text
    }
}
