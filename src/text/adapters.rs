//! Column types and per-column type adapters.
//!
//! An adapter converts one raw field into one typed cell of a row under
//! construction. Conversion failure is reported as a value so the load phase
//! can apply its atomicity policy; nothing here panics on content.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::table::writer::Row;
use crate::{Result, StampedeError};

/// Storage type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Long,
    Double,
    Timestamp,
    /// Interned string; stored as a 4-byte dictionary key.
    Symbol,
    String,
}

impl ColumnType {
    /// On-disk width of one value, `None` for var-size columns.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ColumnType::Boolean => Some(1),
            ColumnType::Long | ColumnType::Double | ColumnType::Timestamp => Some(8),
            ColumnType::Symbol => Some(4),
            ColumnType::String => None,
        }
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self, ColumnType::Symbol)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Long => "LONG",
            ColumnType::Double => "DOUBLE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Symbol => "SYMBOL",
            ColumnType::String => "STRING",
        };
        f.write_str(s)
    }
}

/// Timestamp field parser producing epoch microseconds (UTC).
#[derive(Debug, Clone, Default)]
pub struct TimestampAdapter {
    /// chrono format string; when unset, the built-in formats are tried.
    format: Option<String>,
}

impl TimestampAdapter {
    pub fn new(format: Option<String>) -> Self {
        Self { format }
    }

    /// Parse a raw field. `None` means the field is not a timestamp this
    /// adapter understands; the caller decides whether that rejects the
    /// record or the load.
    pub fn parse(&self, raw: &[u8]) -> Option<i64> {
        let s = std::str::from_utf8(raw).ok()?.trim();
        if s.is_empty() {
            return None;
        }

        if let Some(fmt) = &self.format {
            let dt = NaiveDateTime::parse_from_str(s, fmt).ok()?;
            return Some(dt.and_utc().timestamp_micros());
        }

        // Bare integer: already epoch micros.
        if s.as_bytes()[0].is_ascii_digit() || s.starts_with('-') {
            if let Ok(n) = s.parse::<i64>() {
                return Some(n);
            }
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.timestamp_micros());
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Some(dt.and_utc().timestamp_micros());
            }
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros());
        }
        None
    }

    /// Whether the raw field parses under this adapter; used by detection.
    pub fn accepts(&self, raw: &[u8]) -> bool {
        self.parse(raw).is_some()
    }
}

/// One column's field-to-cell conversion.
#[derive(Debug, Clone)]
pub enum TypeAdapter {
    Boolean,
    Long,
    Double,
    Timestamp(TimestampAdapter),
    Symbol,
    String,
}

impl TypeAdapter {
    pub fn for_type(column_type: ColumnType, ts_format: Option<String>) -> Self {
        match column_type {
            ColumnType::Boolean => TypeAdapter::Boolean,
            ColumnType::Long => TypeAdapter::Long,
            ColumnType::Double => TypeAdapter::Double,
            ColumnType::Timestamp => TypeAdapter::Timestamp(TimestampAdapter::new(ts_format)),
            ColumnType::Symbol => TypeAdapter::Symbol,
            ColumnType::String => TypeAdapter::String,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            TypeAdapter::Boolean => ColumnType::Boolean,
            TypeAdapter::Long => ColumnType::Long,
            TypeAdapter::Double => ColumnType::Double,
            TypeAdapter::Timestamp(_) => ColumnType::Timestamp,
            TypeAdapter::Symbol => ColumnType::Symbol,
            TypeAdapter::String => ColumnType::String,
        }
    }

    /// Convert `raw` and place it into column `col` of the row.
    pub fn write(&self, row: &mut Row<'_>, col: usize, raw: &[u8]) -> Result<()> {
        let cast = || StampedeError::Cast { column: col };
        match self {
            TypeAdapter::Boolean => {
                let v = parse_bool(raw).ok_or_else(cast)?;
                row.put_bool(col, v);
            }
            TypeAdapter::Long => {
                let s = std::str::from_utf8(raw).map_err(|_| cast())?;
                let v = s.trim().parse::<i64>().map_err(|_| cast())?;
                row.put_long(col, v);
            }
            TypeAdapter::Double => {
                let s = std::str::from_utf8(raw).map_err(|_| cast())?;
                let v = s.trim().parse::<f64>().map_err(|_| cast())?;
                row.put_double(col, v);
            }
            TypeAdapter::Timestamp(adapter) => {
                let v = adapter.parse(raw).ok_or_else(cast)?;
                row.put_timestamp(col, v);
            }
            TypeAdapter::Symbol => {
                let s = std::str::from_utf8(raw).map_err(|_| cast())?;
                row.put_symbol(col, s)?;
            }
            TypeAdapter::String => {
                row.put_str(col, raw);
            }
        }
        Ok(())
    }

    /// Whether `raw` would convert; used by type detection.
    pub fn accepts(&self, raw: &[u8]) -> bool {
        match self {
            TypeAdapter::Boolean => parse_bool(raw).is_some(),
            TypeAdapter::Long => matches!(std::str::from_utf8(raw), Ok(s) if s.trim().parse::<i64>().is_ok()),
            TypeAdapter::Double => matches!(std::str::from_utf8(raw), Ok(s) if s.trim().parse::<f64>().is_ok()),
            TypeAdapter::Timestamp(adapter) => adapter.accepts(raw),
            TypeAdapter::Symbol | TypeAdapter::String => std::str::from_utf8(raw).is_ok(),
        }
    }
}

fn parse_bool(raw: &[u8]) -> Option<bool> {
    match raw {
        b"true" | b"TRUE" | b"True" => Some(true),
        b"false" | b"FALSE" | b"False" => Some(false),
        _ => None,
    }
}
