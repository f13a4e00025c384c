//! The five-phase parallel ingest pipeline.
//!
//! ```text
//! source file
//!   │  1. boundary scan      quote parity → safe chunk line-starts
//!   ▼
//! chunk list
//!   │  2. indexing           (timestamp, offset) shards per (partition, worker)
//!   ▼
//! workRoot/{table}/{partition}/{worker}_{chunk}
//!   │  3. merge + load       k-way merge → __index → pread rows → staging tables
//!   ▼
//! workRoot/{table}/{table}__{worker}/{partition}
//!   │  4. symbol merge       dictionaries unified, staged keys rewritten
//!   ▼
//!   │  5. move + attach      partitions renamed into the final table
//!   ▼
//! dbRoot/{table}/{partition}
//! ```
//!
//! Each phase is a barrier: the coordinator submits tasks to the shared
//! bounded queue and drains it cooperatively until every outcome arrived.

pub mod boundary;
pub mod coordinator;
pub mod indexer;
pub mod loader;
pub mod merge;
pub mod queue;
pub mod symbols;

#[cfg(test)]
mod tests;

pub use boundary::{reconcile_boundaries, scan_chunk, ChunkBoundary, ChunkStat};
pub use coordinator::IngestCoordinator;
pub use indexer::{IndexerOutcome, PartitionIndexer, INDEX_ENTRY_SIZE};
pub use loader::{LoadStats, PartitionLoader};
pub use merge::{merge_partition_index, MERGED_INDEX_FILE_NAME};
pub use queue::{ImportTask, TaskOutcome, WorkQueue};
