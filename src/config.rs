//! Ingest configuration and request/summary types.
//!
//! `IngestConfig` carries the engine-wide knobs (directory roots, worker
//! count, chunk sizing); `IngestRequest` carries the per-load parameters the
//! front-end hands over for a single file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::partition::PartitionBy;

/// Default lower bound for a boundary-scan chunk (300 MiB).
///
/// Files smaller than `worker_count * min_chunk_size` are scanned with fewer
/// chunks than workers.
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 300 * 1024 * 1024;

/// Default capacity of the bounded task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default read buffer for structure analysis and mmap window sizing.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of records sampled for header/type detection.
pub const DEFAULT_ANALYSIS_MAX_LINES: usize = 1000;

/// Behavior when a field fails type conversion during the load phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atomicity {
    /// Any conversion failure aborts the whole load.
    SkipAll,
    /// The offending row is cancelled; the load continues.
    SkipRow,
    /// The offending field is left null; the row is kept.
    SkipColumn,
}

impl Default for Atomicity {
    fn default() -> Self {
        Atomicity::SkipAll
    }
}

/// Engine configuration. One instance outlives many loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory that input file names are resolved against.
    pub input_root: PathBuf,
    /// Directory that per-load work directories are created under.
    pub work_root: PathBuf,
    /// Database root; final tables live at `{db_root}/{table}`.
    pub db_root: PathBuf,
    /// Fixed worker pool size. The coordinator participates in draining on
    /// top of this.
    pub worker_count: usize,
    /// Minimum byte length of a boundary-scan chunk.
    pub min_chunk_size: u64,
    /// Capacity of the bounded task queue; a full queue runs the task on the
    /// submitting thread.
    pub queue_capacity: usize,
    /// Bytes read for structure analysis; also the mmap window granularity
    /// used by the scanning phases.
    pub buffer_size: usize,
    /// Records sampled for header and column-type detection.
    pub analysis_max_lines: usize,
    /// Field conversion failure policy for the load phase.
    pub atomicity: Atomicity,
    /// A text column whose sample distinct-count ratio stays at or below this
    /// value is detected as a symbol column.
    pub symbol_cardinality_cutoff: f64,
    /// Symbol columns to receive a key index when partitions are attached.
    pub indexed_columns: Vec<String>,
    /// Row-list block capacity for key indexes.
    pub index_block_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            input_root: PathBuf::from("."),
            work_root: PathBuf::from("./tmp"),
            db_root: PathBuf::from("./db"),
            worker_count: workers,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            analysis_max_lines: DEFAULT_ANALYSIS_MAX_LINES,
            atomicity: Atomicity::default(),
            symbol_cardinality_cutoff: 0.5,
            indexed_columns: Vec::new(),
            index_block_capacity: 256,
        }
    }
}

/// Parameters of one load.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Target table name; also names the work directory.
    pub table_name: String,
    /// Input file name, resolved against `IngestConfig::input_root`.
    pub input_file_name: String,
    /// Partition unit of the target table.
    pub partition_by: PartitionBy,
    /// Column delimiter byte. `None` auto-detects from the first buffer.
    pub delimiter: Option<u8>,
    /// Designated timestamp column name. Required when the target table does
    /// not exist yet and the file has no detectable timestamp column.
    pub timestamp_column: Option<String>,
    /// chrono format string for the timestamp column. `None` tries the
    /// built-in formats.
    pub timestamp_format: Option<String>,
    /// Treat the first record as a header regardless of detection.
    pub force_header: bool,
}

impl IngestRequest {
    pub fn new(table_name: impl Into<String>, input_file_name: impl Into<String>, partition_by: PartitionBy) -> Self {
        Self {
            table_name: table_name.into(),
            input_file_name: input_file_name.into(),
            partition_by,
            delimiter: None,
            timestamp_column: None,
            timestamp_format: None,
            force_header: false,
        }
    }

    pub fn delimiter(mut self, delim: u8) -> Self {
        self.delimiter = Some(delim);
        self
    }

    pub fn timestamp_column(mut self, name: impl Into<String>) -> Self {
        self.timestamp_column = Some(name.into());
        self
    }

    pub fn timestamp_format(mut self, format: impl Into<String>) -> Self {
        self.timestamp_format = Some(format.into());
        self
    }

    pub fn force_header(mut self, force: bool) -> Self {
        self.force_header = force;
        self
    }
}

/// Result of a successful load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records indexed during phase 2 (excludes the header and records with
    /// unparseable timestamps).
    pub rows_indexed: u64,
    /// Rows appended to staging tables.
    pub rows_loaded: u64,
    /// Rows rejected by type adapters under `Atomicity::SkipRow`.
    pub rows_rejected: u64,
    /// Records dropped in phase 2 because their timestamp failed to parse.
    pub parse_errors: u64,
    /// Canonical ascending partition directory names.
    pub partitions: Vec<String>,
}
