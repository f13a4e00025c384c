//! Phase 3a: k-way merge of a partition's index shards.
//!
//! Every `{workerId}_{chunkId}` file in a partition directory is a run sorted
//! by (timestamp, offset). The merger maps each run and streams the ascending
//! merge into a single `__index` file sized to the sum of the runs, so the
//! loader walks one sorted stream per partition.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::ingest::indexer::INDEX_ENTRY_SIZE;
use crate::{Result, StampedeError};

/// Name of the merged index inside a partition directory.
pub const MERGED_INDEX_FILE_NAME: &str = "__index";

struct Run {
    map: Mmap,
    pos: usize,
}

impl Run {
    fn entry(&self, pos: usize) -> Option<(i64, i64)> {
        let start = pos * INDEX_ENTRY_SIZE;
        let slice = self.map.get(start..start + INDEX_ENTRY_SIZE)?;
        Some((
            i64::from_le_bytes(slice[..8].try_into().unwrap_or_default()),
            i64::from_le_bytes(slice[8..].try_into().unwrap_or_default()),
        ))
    }
}

/// Merge all index shards of `partition_dir` into its `__index` file.
/// Returns the merged path and the entry count.
pub fn merge_partition_index(partition_dir: &Path) -> Result<(PathBuf, u64)> {
    let mut shard_paths: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(partition_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name() == MERGED_INDEX_FILE_NAME {
            continue;
        }
        shard_paths.push(entry.path());
    }
    // Deterministic run order regardless of directory iteration order.
    shard_paths.sort();

    let mut runs = Vec::with_capacity(shard_paths.len());
    let mut total = 0u64;
    for path in &shard_paths {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            continue;
        }
        if len % INDEX_ENTRY_SIZE as u64 != 0 {
            return Err(StampedeError::Table(format!(
                "index shard has a partial entry: {}",
                path.display()
            )));
        }
        total += len / INDEX_ENTRY_SIZE as u64;
        let map = unsafe { Mmap::map(&file)? };
        runs.push(Run { map, pos: 0 });
    }

    let merged_path = partition_dir.join(MERGED_INDEX_FILE_NAME);
    let mut out = BufWriter::new(File::create(&merged_path)?);

    // Heap keyed by (timestamp, offset, run) gives the global
    // (timestamp, offset) order; run index keeps equal entries stable.
    let mut heap: BinaryHeap<Reverse<(i64, i64, usize)>> = BinaryHeap::with_capacity(runs.len());
    for (i, run) in runs.iter().enumerate() {
        if let Some((ts, off)) = run.entry(0) {
            heap.push(Reverse((ts, off, i)));
        }
    }
    while let Some(Reverse((ts, off, i))) = heap.pop() {
        out.write_all(&ts.to_le_bytes())?;
        out.write_all(&off.to_le_bytes())?;
        let run = &mut runs[i];
        run.pos += 1;
        if let Some((ts, off)) = run.entry(run.pos) {
            heap.push(Reverse((ts, off, i)));
        }
    }
    out.flush()?;

    // Mappings drop here, before the loader takes over the partition.
    Ok((merged_path, total))
}
