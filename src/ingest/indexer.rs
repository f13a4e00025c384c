//! Phase 2: timestamp/offset indexing.
//!
//! One indexer task lexes a chunk `[lo, hi)` of the source file from mmap
//! windows and appends a 16-byte little-endian `(timestamp, offset)` entry to
//! `{importRoot}/{partitionName}/{workerId}_{chunkId}` for every record,
//! creating partition directories on first use. A record straddling `hi`
//! belongs to this chunk; the first record at or past `hi` belongs to the
//! next one.
//!
//! When the chunk closes, each shard it wrote is sorted by (timestamp,
//! offset) so phase 3 can treat shards as sorted runs.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use memmap2::MmapOptions;

use crate::partition::PartitionBy;
use crate::text::adapters::TimestampAdapter;
use crate::text::lexer::{CsvLexer, RecordSink, SinkFlow};
use crate::Result;

/// Bytes per index entry: LE i64 timestamp, LE i64 offset.
pub const INDEX_ENTRY_SIZE: usize = 16;

/// Per-chunk indexing result.
#[derive(Debug, Clone, Default)]
pub struct IndexerOutcome {
    /// Records indexed.
    pub records: u64,
    /// Records dropped for an unparseable or missing timestamp field.
    pub rejected: u64,
    /// Longest record in bytes, separator included.
    pub max_record_len: u64,
    /// Distinct partition keys this chunk wrote shards for.
    pub partition_keys: Vec<i64>,
}

/// Indexer for one chunk of the source file.
pub struct PartitionIndexer<'a> {
    pub input_path: &'a Path,
    pub import_root: &'a Path,
    pub partition_by: PartitionBy,
    pub timestamp_index: usize,
    pub timestamp_adapter: &'a TimestampAdapter,
    pub worker_id: usize,
    pub chunk_id: usize,
    pub window_size: usize,
    /// The chunk starts at the file head and the file has a header record.
    pub skip_header: bool,
}

struct IndexSink<'a> {
    hi: u64,
    timestamp_index: usize,
    adapter: &'a TimestampAdapter,
    partition_by: PartitionBy,
    import_root: &'a Path,
    shard_name: String,
    shards: AHashMap<i64, BufWriter<File>>,
    outcome: IndexerOutcome,
    skip_first: bool,
}

impl IndexSink<'_> {
    fn shard(&mut self, key: i64) -> Result<&mut BufWriter<File>> {
        use std::collections::hash_map::Entry;
        match self.shards.entry(key) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let dir = self.import_root.join(self.partition_by.dir_name(key));
                fs::create_dir_all(&dir)?;
                let file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(dir.join(&self.shard_name))?;
                Ok(v.insert(BufWriter::new(file)))
            }
        }
    }
}

impl RecordSink for IndexSink<'_> {
    fn on_record(&mut self, line: u64, start: u64, end: u64, fields: &[Vec<u8>]) -> Result<SinkFlow> {
        if start >= self.hi {
            return Ok(SinkFlow::Stop);
        }
        let len = end - start;
        if len > self.outcome.max_record_len {
            self.outcome.max_record_len = len;
        }
        if self.skip_first {
            self.skip_first = false;
            return Ok(SinkFlow::Continue);
        }

        let raw = fields.get(self.timestamp_index).map(Vec::as_slice).unwrap_or(b"");
        match self.adapter.parse(raw) {
            Some(ts) => {
                let key = self.partition_by.floor(ts);
                let shard = self.shard(key)?;
                shard.write_all(&ts.to_le_bytes())?;
                shard.write_all(&(start as i64).to_le_bytes())?;
                self.outcome.records += 1;
            }
            None => {
                log::debug!("dropping record at line {line}: bad timestamp field");
                self.outcome.rejected += 1;
            }
        }
        Ok(SinkFlow::Continue)
    }
}

impl PartitionIndexer<'_> {
    /// Index `[lo, hi)`, starting at `starting_line`. The lexer is restarted
    /// at `lo`; scanning runs past `hi` until the straddling record ends.
    pub fn index_chunk(&self, lexer: &mut CsvLexer, lo: u64, hi: u64, starting_line: u64) -> Result<IndexerOutcome> {
        let file = File::open(self.input_path)?;
        let file_len = file.metadata()?.len();

        let mut sink = IndexSink {
            hi,
            timestamp_index: self.timestamp_index,
            adapter: self.timestamp_adapter,
            partition_by: self.partition_by,
            import_root: self.import_root,
            shard_name: format!("{}_{}", self.worker_id, self.chunk_id),
            shards: AHashMap::new(),
            outcome: IndexerOutcome::default(),
            skip_first: self.skip_header && lo == 0,
        };

        lexer.restart(lo, starting_line);
        let window = self.window_size.max(4096) as u64;
        let mut pos = lo;
        let mut stopped = false;
        while pos < file_len {
            let len = (file_len - pos).min(window) as usize;
            let map = unsafe { MmapOptions::new().offset(pos).len(len).map(&file)? };
            if lexer.parse(&map, pos, &mut sink)? == SinkFlow::Stop {
                stopped = true;
                break;
            }
            pos += len as u64;
        }
        if !stopped {
            lexer.parse_last(&mut sink)?;
        }

        let mut shard_paths = Vec::with_capacity(sink.shards.len());
        let mut outcome = sink.outcome;
        for (key, mut writer) in sink.shards {
            writer.flush()?;
            outcome.partition_keys.push(key);
            shard_paths.push(
                self.import_root
                    .join(self.partition_by.dir_name(key))
                    .join(format!("{}_{}", self.worker_id, self.chunk_id)),
            );
        }
        outcome.partition_keys.sort_unstable();
        for path in &shard_paths {
            sort_shard(path)?;
        }
        Ok(outcome)
    }
}

/// Sort a shard file in place by (timestamp, offset).
fn sort_shard(path: &PathBuf) -> Result<()> {
    let data = fs::read(path)?;
    let mut entries: Vec<(i64, i64)> = data
        .chunks_exact(INDEX_ENTRY_SIZE)
        .map(|c| {
            (
                i64::from_le_bytes(c[..8].try_into().unwrap_or_default()),
                i64::from_le_bytes(c[8..].try_into().unwrap_or_default()),
            )
        })
        .collect();
    if entries.windows(2).all(|w| w[0] <= w[1]) {
        return Ok(());
    }
    entries.sort_unstable();
    let mut out = Vec::with_capacity(entries.len() * INDEX_ENTRY_SIZE);
    for (ts, off) in entries {
        out.extend_from_slice(&ts.to_le_bytes());
        out.extend_from_slice(&off.to_le_bytes());
    }
    fs::write(path, out)?;
    Ok(())
}

/// Decode an index shard or merged index file.
pub fn read_index_entries(data: &[u8]) -> Vec<(i64, i64)> {
    data.chunks_exact(INDEX_ENTRY_SIZE)
        .map(|c| {
            (
                i64::from_le_bytes(c[..8].try_into().unwrap_or_default()),
                i64::from_le_bytes(c[8..].try_into().unwrap_or_default()),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run_indexer(content: &[u8], lo: u64, hi: u64, skip_header: bool, dir: &Path) -> IndexerOutcome {
        let input = dir.join("input.csv");
        let mut f = File::create(&input).unwrap();
        f.write_all(content).unwrap();
        let import_root = dir.join("work");
        fs::create_dir_all(&import_root).unwrap();

        let adapter = TimestampAdapter::new(None);
        let indexer = PartitionIndexer {
            input_path: &input,
            import_root: &import_root,
            partition_by: PartitionBy::Day,
            timestamp_index: 0,
            timestamp_adapter: &adapter,
            worker_id: 0,
            chunk_id: 0,
            window_size: 4096,
            skip_header,
        };
        let mut lexer = CsvLexer::of(b',');
        indexer.index_chunk(&mut lexer, lo, hi, 0).unwrap()
    }

    #[test]
    fn indexes_one_entry_per_record() {
        let dir = tempdir().unwrap();
        let content = b"2020-01-01T00:00:00Z,1\n2020-01-02T00:00:00Z,2\n2020-01-01T06:00:00Z,3\n";
        let outcome = run_indexer(content, 0, content.len() as u64, false, dir.path());
        assert_eq!(outcome.records, 3);
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.partition_keys.len(), 2);
        assert_eq!(outcome.max_record_len, 23);

        let shard = dir.path().join("work/2020-01-01/0_0");
        let data = fs::read(shard).unwrap();
        assert_eq!(data.len(), 2 * INDEX_ENTRY_SIZE);
        let entries = read_index_entries(&data);
        // Sorted by timestamp: midnight record before the 06:00 one.
        assert!(entries[0].0 < entries[1].0);
        assert_eq!(entries[0].1, 0);
        assert_eq!(entries[1].1, 46);
    }

    #[test]
    fn header_is_skipped_but_measured() {
        let dir = tempdir().unwrap();
        let content = b"ts,value\n2020-01-01T00:00:00Z,1\n";
        let outcome = run_indexer(content, 0, content.len() as u64, true, dir.path());
        assert_eq!(outcome.records, 1);
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.max_record_len, 23);
    }

    #[test]
    fn bad_timestamps_are_rejected_not_fatal() {
        let dir = tempdir().unwrap();
        let content = b"2020-01-01T00:00:00Z,1\nnot-a-time,2\n2020-01-01T00:00:02Z,3\n";
        let outcome = run_indexer(content, 0, content.len() as u64, false, dir.path());
        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn straddling_record_belongs_to_lower_chunk() {
        let dir = tempdir().unwrap();
        let content = b"2020-01-01T00:00:00Z,aaaa\n2020-01-01T00:00:01Z,bbbb\n";
        let mid = 30; // inside the second record
        let out_lo = run_indexer(content, 0, mid, false, dir.path());
        assert_eq!(out_lo.records, 2);

        // The upper chunk starts exactly at the second record and owns it
        // alone; combined coverage is exactly once when chunks abut at a
        // record start.
        let dir2 = tempdir().unwrap();
        let second_start = 26;
        let out_lo = run_indexer(content, 0, second_start, false, dir2.path());
        let dir3 = tempdir().unwrap();
        let out_hi = run_indexer(content, second_start, content.len() as u64, false, dir3.path());
        assert_eq!(out_lo.records + out_hi.records, 2);
        assert_eq!(out_lo.records, 1);
    }

    #[test]
    fn shards_are_sorted_after_close() {
        let dir = tempdir().unwrap();
        let content = b"2020-01-01T09:00:00Z,1\n2020-01-01T03:00:00Z,2\n2020-01-01T06:00:00Z,3\n";
        run_indexer(content, 0, content.len() as u64, false, dir.path());
        let data = fs::read(dir.path().join("work/2020-01-01/0_0")).unwrap();
        let entries = read_index_entries(&data);
        assert!(entries.windows(2).all(|w| w[0] <= w[1]));
    }
}
