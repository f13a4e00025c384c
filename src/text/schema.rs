//! Header and column-type detection over the first records of a file.
//!
//! Detection is a first-N-lines heuristic by contract: the chosen types are
//! not guaranteed beyond the sample. A text column whose sample stays under
//! the configured cardinality cutoff becomes a symbol column.

use ahash::AHashSet;

use crate::text::adapters::{ColumnType, TimestampAdapter, TypeAdapter};
use crate::text::lexer::{CsvLexer, RecordSink, SinkFlow};
use crate::{Result, StampedeError};

/// Distinct-value tracking stops once a text column is clearly not a symbol.
const DISTINCT_CAP: usize = 1024;

/// One detected column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Result of structure analysis.
#[derive(Debug, Clone)]
pub struct DetectedSchema {
    pub columns: Vec<DetectedColumn>,
    /// The first record is a header and must not be indexed.
    pub header: bool,
    /// Index of the designated timestamp column, when one was found.
    pub timestamp_index: Option<usize>,
}

/// Structure analyzer configuration.
pub struct SchemaDetector {
    pub delimiter: u8,
    pub max_lines: usize,
    pub symbol_cardinality_cutoff: f64,
    pub force_header: bool,
    pub timestamp_column: Option<String>,
    pub timestamp_format: Option<String>,
}

struct SampleSink {
    rows: Vec<Vec<Vec<u8>>>,
    limit: usize,
}

impl RecordSink for SampleSink {
    fn on_record(&mut self, _line: u64, _start: u64, _end: u64, fields: &[Vec<u8>]) -> Result<SinkFlow> {
        self.rows.push(fields.to_vec());
        if self.rows.len() >= self.limit {
            return Ok(SinkFlow::Stop);
        }
        Ok(SinkFlow::Continue)
    }
}

impl SchemaDetector {
    /// Analyze the first buffer of the file.
    ///
    /// `whole_file` marks that `buf` contains the entire file, in which case
    /// an unterminated final record is included in the sample.
    pub fn detect(&self, buf: &[u8], whole_file: bool) -> Result<DetectedSchema> {
        let mut lexer = CsvLexer::of(self.delimiter);
        let mut sink = SampleSink { rows: Vec::new(), limit: self.max_lines };
        lexer.restart(0, 0);
        let flow = lexer.parse(buf, 0, &mut sink)?;
        if whole_file && flow == SinkFlow::Continue {
            lexer.parse_last(&mut sink)?;
        }

        if sink.rows.is_empty() {
            return Err(StampedeError::Structure("no records in analysis sample".into()));
        }

        let column_count = sink.rows.iter().map(|r| r.len()).max().unwrap_or(0);
        let header = self.force_header || Self::detect_header(&sink.rows, column_count);
        let data = if header { &sink.rows[1..] } else { &sink.rows[..] };
        if data.is_empty() {
            return Err(StampedeError::Structure("header only, no data records".into()));
        }

        let mut columns = Vec::with_capacity(column_count);
        for col in 0..column_count {
            let name = if header {
                column_name(&sink.rows[0], col)
            } else {
                format!("f{col}")
            };
            let column_type = self.detect_column_type(data, col);
            columns.push(DetectedColumn { name, column_type });
        }

        let timestamp_index = self.resolve_timestamp_index(&mut columns)?;

        Ok(DetectedSchema { columns, header, timestamp_index })
    }

    /// Header when the first record is all-text and at least one column's
    /// remaining samples detect as non-text. All-text files need the forced
    /// flag.
    fn detect_header(rows: &[Vec<Vec<u8>>], column_count: usize) -> bool {
        if rows.len() < 2 {
            return false;
        }
        let first = &rows[0];
        if first.len() != column_count {
            return false;
        }
        let all_text = first.iter().all(|f| !f.is_empty() && is_text(f));
        if !all_text {
            return false;
        }
        (0..column_count).any(|col| {
            let mut saw_value = false;
            for row in &rows[1..] {
                let field = row.get(col).map(Vec::as_slice).unwrap_or(b"");
                if field.is_empty() {
                    continue;
                }
                saw_value = true;
                if is_text(field) {
                    return false;
                }
            }
            saw_value
        })
    }

    fn detect_column_type(&self, data: &[Vec<Vec<u8>>], col: usize) -> ColumnType {
        let ts = TypeAdapter::Timestamp(TimestampAdapter::new(self.timestamp_format.clone()));
        let mut can_long = true;
        let mut can_double = true;
        let mut can_bool = true;
        let mut can_ts = true;
        let mut samples = 0usize;
        let mut distinct: AHashSet<Vec<u8>> = AHashSet::new();

        for row in data {
            let field = row.get(col).map(Vec::as_slice).unwrap_or(b"");
            if field.is_empty() {
                continue;
            }
            samples += 1;
            can_long = can_long && TypeAdapter::Long.accepts(field);
            can_double = can_double && TypeAdapter::Double.accepts(field);
            can_bool = can_bool && TypeAdapter::Boolean.accepts(field);
            can_ts = can_ts && ts.accepts(field);
            if distinct.len() <= DISTINCT_CAP {
                distinct.insert(field.to_vec());
            }
        }

        if samples == 0 {
            return ColumnType::String;
        }
        if can_long {
            return ColumnType::Long;
        }
        if can_double {
            return ColumnType::Double;
        }
        if can_bool {
            return ColumnType::Boolean;
        }
        if can_ts {
            return ColumnType::Timestamp;
        }
        let ratio = distinct.len() as f64 / samples as f64;
        if distinct.len() <= DISTINCT_CAP && ratio <= self.symbol_cardinality_cutoff {
            ColumnType::Symbol
        } else {
            ColumnType::String
        }
    }

    fn resolve_timestamp_index(&self, columns: &mut [DetectedColumn]) -> Result<Option<usize>> {
        if let Some(requested) = &self.timestamp_column {
            let idx = columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(requested))
                .ok_or_else(|| {
                    StampedeError::Structure(format!(
                        "timestamp column '{requested}' not found in file header"
                    ))
                })?;
            // The designated column is a timestamp no matter what detection said.
            columns[idx].column_type = ColumnType::Timestamp;
            return Ok(Some(idx));
        }
        Ok(columns.iter().position(|c| c.column_type == ColumnType::Timestamp))
    }
}

fn is_text(field: &[u8]) -> bool {
    let ts = TypeAdapter::Timestamp(TimestampAdapter::new(None));
    !(TypeAdapter::Long.accepts(field)
        || TypeAdapter::Double.accepts(field)
        || TypeAdapter::Boolean.accepts(field)
        || ts.accepts(field))
}

fn column_name(header: &[Vec<u8>], col: usize) -> String {
    let raw = header.get(col).map(Vec::as_slice).unwrap_or(b"");
    let name: String = String::from_utf8_lossy(raw)
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        format!("f{col}")
    } else {
        name
    }
}
