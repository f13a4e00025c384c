//! Stampede: parallel bulk ingest for time-partitioned columnar tables.
//!
//! Loads one large delimited text file, unordered in its timestamp column
//! and possibly larger than memory, into a time-partitioned columnar table
//! with a fixed pool of worker threads and mostly memory-mapped I/O.
//!
//! The work happens in five phases, each a barrier:
//!
//! 1. **Boundary scan**: split the file into chunks and find a safe
//!    line-start per chunk despite quoted newlines (quote-parity hypotheses).
//! 2. **Indexing**: scan chunks in parallel, appending `(timestamp, offset)`
//!    entries to per-(partition, worker) shard files.
//! 3. **Merge & load**: k-way merge each partition's shards into one sorted
//!    index, then random-read the source in timestamp order into per-worker
//!    staging tables.
//! 4. **Symbol reconciliation**: merge per-worker symbol dictionaries into
//!    the final table's and rewrite the staged key columns.
//! 5. **Attach**: move partition directories from staging into the final
//!    table and register them.
//!
//! ```no_run
//! use stampede::{IngestConfig, IngestCoordinator, IngestRequest, PartitionBy};
//!
//! let config = IngestConfig {
//!     input_root: "/data/in".into(),
//!     work_root: "/data/tmp".into(),
//!     db_root: "/data/db".into(),
//!     ..IngestConfig::default()
//! };
//! let mut coordinator = IngestCoordinator::new(config)?;
//! let summary = coordinator.run(
//!     IngestRequest::new("trips", "trips.csv", PartitionBy::Day)
//!         .timestamp_column("pickup_at"),
//! )?;
//! println!("loaded {} rows into {} partitions", summary.rows_loaded, summary.partitions.len());
//! # Ok::<(), stampede::StampedeError>(())
//! ```
//!
//! On any failure the per-load work directory is discarded and the operation
//! is restartable from scratch; there is no mid-phase recovery.

pub mod config;
pub mod ingest;
pub mod partition;
pub mod table;
pub mod text;

pub use config::{Atomicity, IngestConfig, IngestRequest, IngestSummary};
pub use ingest::IngestCoordinator;
pub use partition::PartitionBy;
pub use table::{TableReader, TableWriter};

/// Ingest engine error type.
#[derive(Debug, thiserror::Error)]
pub enum StampedeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not determine file structure: {0}")]
    Structure(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("bad partition directory name: {0}")]
    PartitionName(String),

    #[error("value does not convert to the type of column {column}")]
    Cast { column: usize },

    #[error("import cancelled")]
    Cancelled,

    #[error("metadata serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StampedeError>;
