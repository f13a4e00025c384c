//! Push lexer for delimited text.
//!
//! The lexer is fed byte slices with an absolute base offset and delivers
//! complete records to a [`RecordSink`]. Fields may be double-quote enclosed;
//! inside quotes, delimiters and newlines (0x0A) are literal and a doubled
//! `""` is a literal quote. A `\r` immediately before the record separator is
//! trimmed.
//!
//! State survives across `parse` calls, so a record may straddle any number
//! of input windows. `restart` repositions the lexer at an arbitrary file
//! offset and line number; `parse_last` flushes a final record that has no
//! trailing newline.

use crate::Result;

/// Record separator.
pub const LINE_SEP: u8 = b'\n';

const QUOTE: u8 = b'"';

/// Flow control returned by a sink after each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    /// Stop parsing; remaining bytes of the window are not consumed.
    Stop,
}

/// Receiver of lexed records.
///
/// `start` is the absolute offset of the record's first byte; `end` is one
/// past its separator (or the end of input for an unterminated last record),
/// so `end - start` is the record's byte length.
pub trait RecordSink {
    fn on_record(&mut self, line: u64, start: u64, end: u64, fields: &[Vec<u8>]) -> Result<SinkFlow>;
}

/// Delimited-text lexer with quote state.
pub struct CsvLexer {
    delim: u8,
    fields: Vec<Vec<u8>>,
    /// Fields completed in the current record; `fields[field_count]` is the
    /// one being accumulated.
    field_count: usize,
    in_quotes: bool,
    /// A quote was seen while inside quotes; the next byte decides whether it
    /// was an escape (`""`) or the closing quote.
    quote_carry: bool,
    /// Any byte of the current record has been consumed.
    in_record: bool,
    line: u64,
    record_start: u64,
    pos: u64,
}

impl CsvLexer {
    pub fn of(delim: u8) -> Self {
        Self {
            delim,
            fields: vec![Vec::new()],
            field_count: 0,
            in_quotes: false,
            quote_carry: false,
            in_record: false,
            line: 0,
            record_start: 0,
            pos: 0,
        }
    }

    pub fn delimiter(&self) -> u8 {
        self.delim
    }

    /// Reposition at an absolute offset and line number, dropping any partial
    /// record state.
    pub fn restart(&mut self, offset: u64, line: u64) {
        self.field_count = 0;
        self.fields[0].clear();
        self.in_quotes = false;
        self.quote_carry = false;
        self.in_record = false;
        self.line = line;
        self.record_start = offset;
        self.pos = offset;
    }

    /// Absolute offset of the next unconsumed byte.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Feed a window of bytes. `base_offset` must equal [`position`] unless
    /// the lexer was just restarted there.
    ///
    /// [`position`]: CsvLexer::position
    pub fn parse<S: RecordSink>(&mut self, buf: &[u8], base_offset: u64, sink: &mut S) -> Result<SinkFlow> {
        debug_assert_eq!(base_offset, self.pos);
        for (i, &b) in buf.iter().enumerate() {
            let abs = base_offset + i as u64;

            if self.quote_carry {
                self.quote_carry = false;
                if b == QUOTE {
                    // Escaped quote: keep one, stay inside quotes.
                    self.current_field().push(QUOTE);
                    self.pos = abs + 1;
                    self.in_record = true;
                    continue;
                }
                // The carried quote closed the quoted section.
                self.in_quotes = false;
            }

            if self.in_quotes {
                if b == QUOTE {
                    self.quote_carry = true;
                } else {
                    self.current_field().push(b);
                }
                self.pos = abs + 1;
                self.in_record = true;
                continue;
            }

            if b == QUOTE {
                self.in_quotes = true;
                self.in_record = true;
            } else if b == self.delim {
                self.end_field();
                self.in_record = true;
            } else if b == LINE_SEP {
                self.pos = abs + 1;
                if self.emit_record(sink)? == SinkFlow::Stop {
                    return Ok(SinkFlow::Stop);
                }
                continue;
            } else {
                self.current_field().push(b);
                self.in_record = true;
            }
            self.pos = abs + 1;
        }
        Ok(SinkFlow::Continue)
    }

    /// Flush a final record that was not terminated by a newline.
    pub fn parse_last<S: RecordSink>(&mut self, sink: &mut S) -> Result<()> {
        if self.quote_carry {
            self.quote_carry = false;
            self.in_quotes = false;
        }
        if self.in_record {
            self.in_quotes = false;
            self.emit_record(sink)?;
        }
        Ok(())
    }

    fn current_field(&mut self) -> &mut Vec<u8> {
        &mut self.fields[self.field_count]
    }

    fn end_field(&mut self) {
        self.field_count += 1;
        if self.fields.len() == self.field_count {
            self.fields.push(Vec::new());
        } else {
            self.fields[self.field_count].clear();
        }
    }

    fn emit_record<S: RecordSink>(&mut self, sink: &mut S) -> Result<SinkFlow> {
        // Trim a carriage return that sat right before the separator.
        if let Some(&b'\r') = self.fields[self.field_count].last() {
            self.fields[self.field_count].pop();
        }
        let nf = self.field_count + 1;
        let line = self.line;
        let start = self.record_start;
        let end = self.pos;

        self.line += 1;
        self.record_start = end;
        self.field_count = 0;
        let blank = nf == 1 && self.fields[0].is_empty();
        if blank {
            // Empty line: not a record, but it still advances line numbers.
            self.fields[0].clear();
            self.in_record = false;
            return Ok(SinkFlow::Continue);
        }
        let flow = sink.on_record(line, start, end, &self.fields[..nf])?;
        self.fields[0].clear();
        self.in_record = false;
        Ok(flow)
    }
}
