//! Phase 3b: loading a partition through its merged index.
//!
//! The loader walks `__index` in timestamp order and random-reads each record
//! from the source file: exactly `max_record_len` bytes are read at the
//! record's offset and the lexer stops at the first separator inside the
//! slab. Phase 2 guarantees no record is longer than that, so one slab always
//! holds one whole record. Fields are driven through the type adapters into a
//! staging-table row carrying the index entry's timestamp.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::Mmap;

use crate::config::Atomicity;
use crate::ingest::indexer::INDEX_ENTRY_SIZE;
use crate::table::writer::TableWriter;
use crate::text::adapters::TypeAdapter;
use crate::text::lexer::{CsvLexer, RecordSink, SinkFlow};
use crate::{Result, StampedeError};

/// Rows between circuit-breaker checks.
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Per-partition load result.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadStats {
    /// Rows appended to the staging table.
    pub rows: u64,
    /// Rows cancelled under `Atomicity::SkipRow`.
    pub rejected: u64,
    /// Fields left null under `Atomicity::SkipColumn`.
    pub field_nulls: u64,
}

/// Loader over one source file, reused across the partitions of a task.
pub struct PartitionLoader<'a> {
    pub input_path: &'a Path,
    pub adapters: &'a [TypeAdapter],
    pub timestamp_index: usize,
    pub atomicity: Atomicity,
    pub circuit_breaker: Option<&'a AtomicBool>,
}

struct RowSink<'a, 'w> {
    writer: &'w mut TableWriter,
    adapters: &'a [TypeAdapter],
    timestamp_index: usize,
    atomicity: Atomicity,
    pending_ts: i64,
    emitted: bool,
    stats: LoadStats,
}

impl RecordSink for RowSink<'_, '_> {
    fn on_record(&mut self, line: u64, _start: u64, _end: u64, fields: &[Vec<u8>]) -> Result<SinkFlow> {
        self.emitted = true;
        let mut row = self.writer.new_row(self.pending_ts)?;
        for (i, adapter) in self.adapters.iter().enumerate() {
            if i == self.timestamp_index {
                continue;
            }
            let raw = fields.get(i).map(Vec::as_slice).unwrap_or(b"");
            if raw.is_empty() {
                continue;
            }
            if let Err(e) = adapter.write(&mut row, i, raw) {
                log::error!(
                    "type conversion failed [line={line}, column={i}, type={}]",
                    adapter.column_type()
                );
                match self.atomicity {
                    Atomicity::SkipAll => {
                        row.cancel();
                        return Err(e);
                    }
                    Atomicity::SkipRow => {
                        row.cancel();
                        self.stats.rejected += 1;
                        return Ok(SinkFlow::Stop);
                    }
                    Atomicity::SkipColumn => {
                        self.stats.field_nulls += 1;
                    }
                }
            }
        }
        row.append()?;
        self.stats.rows += 1;
        Ok(SinkFlow::Stop)
    }
}

impl PartitionLoader<'_> {
    /// Load every record listed in `merged_index` into the staging writer.
    /// `scratch` is the per-worker slab, grown once to `max_record_len`.
    pub fn load_partition(
        &self,
        writer: &mut TableWriter,
        merged_index: &Path,
        max_record_len: usize,
        lexer: &mut CsvLexer,
        scratch: &mut Vec<u8>,
    ) -> Result<LoadStats> {
        let file = File::open(self.input_path)?;
        let file_len = file.metadata()?.len();

        let index_file = File::open(merged_index)?;
        if index_file.metadata()?.len() == 0 {
            return Ok(LoadStats::default());
        }
        let index = unsafe { Mmap::map(&index_file)? };

        if scratch.len() < max_record_len {
            scratch.resize(max_record_len, 0);
        }

        let mut sink = RowSink {
            writer,
            adapters: self.adapters,
            timestamp_index: self.timestamp_index,
            atomicity: self.atomicity,
            pending_ts: 0,
            emitted: false,
            stats: LoadStats::default(),
        };

        for (n, entry) in index.chunks_exact(INDEX_ENTRY_SIZE).enumerate() {
            if n as u64 % CANCEL_CHECK_INTERVAL == 0 {
                if let Some(flag) = self.circuit_breaker {
                    if flag.load(Ordering::Relaxed) {
                        return Err(StampedeError::Cancelled);
                    }
                }
            }
            let ts = i64::from_le_bytes(entry[..8].try_into().unwrap_or_default());
            let off = i64::from_le_bytes(entry[8..].try_into().unwrap_or_default()) as u64;
            if off >= file_len {
                return Err(StampedeError::Table(format!(
                    "index offset {off} beyond source length {file_len}"
                )));
            }

            let len = (max_record_len as u64).min(file_len - off) as usize;
            read_exact_at(&file, &mut scratch[..len], off)?;

            sink.pending_ts = ts;
            sink.emitted = false;
            lexer.restart(off, 0);
            let flow = lexer.parse(&scratch[..len], off, &mut sink)?;
            if flow == SinkFlow::Continue && !sink.emitted {
                // Last record of the file, no trailing separator.
                lexer.parse_last(&mut sink)?;
            }
        }
        Ok(sink.stats)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0usize;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "source file truncated during load",
            ));
        }
        read += n;
    }
    Ok(())
}
