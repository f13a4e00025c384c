//! End-to-end pipeline scenarios over real temp directories.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::{tempdir, TempDir};

use crate::config::{Atomicity, IngestConfig, IngestRequest, IngestSummary};
use crate::ingest::coordinator::IngestCoordinator;
use crate::partition::PartitionBy;
use crate::table::meta::{ColumnDef, TableMeta};
use crate::table::reader::TableReader;
use crate::table::writer::TableWriter;
use crate::text::adapters::ColumnType;
use crate::{Result, StampedeError};

struct Fixture {
    _dir: TempDir,
    config: IngestConfig,
}

impl Fixture {
    fn new(workers: usize) -> Self {
        let dir = tempdir().unwrap();
        let config = IngestConfig {
            input_root: dir.path().join("in"),
            work_root: dir.path().join("tmp"),
            db_root: dir.path().join("db"),
            worker_count: workers,
            min_chunk_size: 4096,
            ..IngestConfig::default()
        };
        fs::create_dir_all(&config.input_root).unwrap();
        Self { _dir: dir, config }
    }

    fn write_input(&self, name: &str, content: &[u8]) {
        fs::write(self.config.input_root.join(name), content).unwrap();
    }

    fn run(&self, request: IngestRequest) -> Result<IngestSummary> {
        IngestCoordinator::new(self.config.clone())?.run(request)
    }

    fn table_root(&self, table: &str) -> std::path::PathBuf {
        self.config.db_root.join(table)
    }

    fn work_dir(&self, table: &str) -> std::path::PathBuf {
        self.config.work_root.join(table)
    }
}

fn reader(fixture: &Fixture, table: &str) -> TableReader {
    TableReader::open(fixture.table_root(table)).unwrap()
}

/// Single worker, no quotes: each day lands in its own partition.
#[test]
fn single_worker_two_day_partitions() {
    let fx = Fixture::new(1);
    fx.write_input("t.csv", b"t,v\n2020-01-01T00:00:00Z,1\n2020-01-02T00:00:00Z,2\n");
    let summary = fx
        .run(IngestRequest::new("t", "t.csv", PartitionBy::Day))
        .unwrap();

    assert_eq!(summary.rows_indexed, 2);
    assert_eq!(summary.rows_loaded, 2);
    assert_eq!(summary.partitions, vec!["2020-01-01", "2020-01-02"]);

    let r = reader(&fx, "t");
    assert_eq!(r.partitions().len(), 2);
    for &key in r.partitions() {
        assert_eq!(r.partition_row_count(key).unwrap(), 1);
    }
    assert!(fx.table_root("t").join("2020-01-01").is_dir());
    assert!(!fx.work_dir("t").exists());
}

/// A quoted field with embedded newlines
/// spanning chunk boundaries; four workers with tiny chunks.
#[test]
fn quoted_field_across_chunk_boundaries() {
    let fx = Fixture::new(4);

    let mut content = Vec::new();
    let mut expected = 0u64;
    for i in 0..2000 {
        if i == 500 {
            // One long quoted field with newlines, sized well past a chunk.
            let big = "x\ny".repeat(3000);
            content.extend_from_slice(
                format!("2020-01-01T00:08:20Z,\"{big}\",500\n").as_bytes(),
            );
        } else {
            content.extend_from_slice(
                format!(
                    "2020-01-01T{:02}:{:02}:{:02}Z,note_{i},{i}\n",
                    i / 3600,
                    (i / 60) % 60,
                    i % 60
                )
                .as_bytes(),
            );
        }
        expected += 1;
    }
    fx.write_input("q.csv", &content);

    let summary = fx
        .run(IngestRequest::new("q", "q.csv", PartitionBy::Day))
        .unwrap();
    assert_eq!(summary.rows_indexed, expected);
    assert_eq!(summary.rows_loaded, expected);

    let r = reader(&fx, "q");
    assert_eq!(r.row_count().unwrap(), expected);

    // The long line survived intact.
    let key = r.partitions()[0];
    let values = r.read_longs(key, 2).unwrap();
    assert!(values.contains(&500));
    let strings = r.read_strings(key, 1).unwrap();
    let big = strings
        .iter()
        .flatten()
        .max_by_key(|s| s.len())
        .unwrap()
        .clone();
    assert_eq!(big.len(), "x\ny".repeat(3000).len());
    assert!(big.starts_with("x\nyx"));
}

/// A chunk starting inside a quoted field gives the same
/// result as the single-worker run.
#[test]
fn odd_parity_matches_single_worker() {
    let content = {
        let mut c = Vec::new();
        for i in 0..800 {
            if i % 7 == 3 {
                c.extend_from_slice(
                    format!("2020-01-0{}T00:00:{:02}Z,\"field with\nnewline and \"\"quote\"\"\",{i}\n",
                        1 + i % 3, i % 60)
                    .as_bytes(),
                );
            } else {
                c.extend_from_slice(
                    format!("2020-01-0{}T00:00:{:02}Z,plain,{i}\n", 1 + i % 3, i % 60).as_bytes(),
                );
            }
        }
        c
    };

    let fx1 = Fixture::new(1);
    fx1.write_input("p.csv", &content);
    let s1 = fx1.run(IngestRequest::new("p", "p.csv", PartitionBy::Day)).unwrap();

    let fx4 = Fixture::new(4);
    fx4.write_input("p.csv", &content);
    let s4 = fx4.run(IngestRequest::new("p", "p.csv", PartitionBy::Day)).unwrap();

    assert_eq!(s1.rows_indexed, 800);
    assert_eq!(s1.rows_indexed, s4.rows_indexed);
    assert_eq!(s1.rows_loaded, s4.rows_loaded);
    assert_eq!(s1.partitions, s4.partitions);

    let r1 = reader(&fx1, "p");
    let r4 = reader(&fx4, "p");
    for (&k1, &k4) in r1.partitions().iter().zip(r4.partitions()) {
        assert_eq!(k1, k4);
        assert_eq!(r1.read_longs(k1, 2).unwrap(), r4.read_longs(k4, 2).unwrap());
    }
}

/// Create an empty target table so the load uses declared column types
/// instead of detection (detection would soften a column with bad values to
/// STRING and mask the conversion failure).
fn create_typed_table(fx: &Fixture, table: &str, columns: Vec<ColumnDef>) {
    let meta = TableMeta::new(table, PartitionBy::Day, 0, columns);
    TableWriter::create(fx.table_root(table), meta).unwrap();
}

/// SKIP_ROW drops exactly the bad row; other columns of the
/// surviving rows are untouched.
#[test]
fn skip_row_atomicity() {
    let mut fx = Fixture::new(2);
    fx.config.atomicity = Atomicity::SkipRow;
    create_typed_table(
        &fx,
        "a",
        vec![
            ColumnDef::new("ts", ColumnType::Timestamp),
            ColumnDef::new("v", ColumnType::Long),
            ColumnDef::new("s", ColumnType::Symbol),
        ],
    );
    fx.write_input(
        "a.csv",
        b"2020-01-01T00:00:00Z,1,one\n2020-01-01T00:00:01Z,bad,two\n2020-01-01T00:00:02Z,3,three\n",
    );
    let summary = fx
        .run(IngestRequest::new("a", "a.csv", PartitionBy::Day))
        .unwrap();
    assert_eq!(summary.rows_indexed, 3);
    assert_eq!(summary.rows_loaded, 2);
    assert_eq!(summary.rows_rejected, 1);

    let r = reader(&fx, "a");
    let key = r.partitions()[0];
    assert_eq!(r.read_longs(key, 1).unwrap(), vec![1, 3]);
    assert_eq!(
        r.read_symbols(key, 2).unwrap(),
        vec![Some("one".to_string()), Some("three".to_string())]
    );
}

/// Default atomicity (SKIP_ALL): a bad field aborts and cleans up.
#[test]
fn skip_all_aborts_and_cleans_up() {
    let fx = Fixture::new(2);
    create_typed_table(
        &fx,
        "a",
        vec![
            ColumnDef::new("ts", ColumnType::Timestamp),
            ColumnDef::new("v", ColumnType::Long),
        ],
    );
    fx.write_input(
        "a.csv",
        b"2020-01-01T00:00:00Z,1\n2020-01-01T00:00:01Z,bad\n",
    );
    let err = fx.run(IngestRequest::new("a", "a.csv", PartitionBy::Day));
    assert!(err.is_err());
    assert!(!fx.work_dir("a").exists());
}

/// Overlapping per-worker symbol sets reconcile to one dictionary.
#[test]
fn symbol_merge_consistency() {
    let fx = Fixture::new(2);
    // Two day partitions so both workers get a staging table, with "b"
    // observed by both.
    let mut content = Vec::new();
    for i in 0..50 {
        let sym = if i % 2 == 0 { "a" } else { "b" };
        content.extend_from_slice(format!("2020-01-01T00:00:{:02}Z,{sym}\n", i % 60).as_bytes());
    }
    for i in 0..50 {
        let sym = if i % 2 == 0 { "b" } else { "c" };
        content.extend_from_slice(format!("2020-01-02T00:00:{:02}Z,{sym}\n", i % 60).as_bytes());
    }
    fx.write_input("s.csv", &content);

    let summary = fx
        .run(IngestRequest::new("s", "s.csv", PartitionBy::Day))
        .unwrap();
    assert_eq!(summary.rows_loaded, 100);

    let r = reader(&fx, "s");
    assert_eq!(r.partitions().len(), 2);

    // Every row with symbol "b" resolves to the same key across partitions.
    let mut b_keys = std::collections::BTreeSet::new();
    let mut distinct = std::collections::BTreeSet::new();
    for &key in r.partitions() {
        let keys = r.read_keys(key, 1).unwrap();
        let syms = r.read_symbols(key, 1).unwrap();
        for (k, s) in keys.iter().zip(&syms) {
            distinct.insert(*k);
            if s.as_deref() == Some("b") {
                b_keys.insert(*k);
            }
        }
    }
    assert_eq!(distinct.len(), 3, "dictionary must hold exactly a, b, c");
    assert_eq!(b_keys.len(), 1, "'b' must map to one final key");
}

/// After success the final table owns the partitions, the
/// work root is gone, and counts add up.
#[test]
fn attach_after_move() {
    let fx = Fixture::new(2);
    let mut content = Vec::new();
    for i in 0..200 {
        content.extend_from_slice(
            format!("2020-0{}-01T00:00:{:02}Z,{i}\n", 1 + i % 3, i % 60).as_bytes(),
        );
    }
    fx.write_input("m.csv", &content);
    let summary = fx
        .run(IngestRequest::new("m", "m.csv", PartitionBy::Month))
        .unwrap();

    assert_eq!(summary.partitions, vec!["2020-01", "2020-02", "2020-03"]);
    for name in &summary.partitions {
        assert!(fx.table_root("m").join(name).is_dir());
    }
    assert!(!fx.work_dir("m").exists());

    let r = reader(&fx, "m");
    assert_eq!(r.row_count().unwrap(), 200);
}

/// Exactly-once coverage and per-partition sort order across worker counts.
#[test]
fn coverage_and_sort_across_worker_counts() {
    let mut content = Vec::new();
    let total = 1000u64;
    // Deliberately unordered timestamps.
    for i in (0..total).rev() {
        content.extend_from_slice(
            format!(
                "2020-01-{:02}T{:02}:00:{:02}Z,{i}\n",
                1 + (i * 7) % 3,
                (i * 13) % 24,
                i % 60
            )
            .as_bytes(),
        );
    }

    for workers in [1usize, 2, 4, 8] {
        let fx = Fixture::new(workers);
        fx.write_input("c.csv", &content);
        let summary = fx
            .run(IngestRequest::new("c", "c.csv", PartitionBy::Day))
            .unwrap();
        assert_eq!(summary.rows_indexed, total, "workers={workers}");
        assert_eq!(summary.rows_loaded, total, "workers={workers}");

        let r = reader(&fx, "c");
        assert_eq!(r.row_count().unwrap(), total);
        for &key in r.partitions() {
            let ts = r.read_longs(key, 0).unwrap();
            assert!(ts.windows(2).all(|w| w[0] <= w[1]), "workers={workers}");
            // Partitioning correctness: every row floors to its partition.
            for &t in &ts {
                assert_eq!(PartitionBy::Day.floor(t), key);
            }
        }
    }
}

/// Restart idempotence: two runs against a re-created target agree.
#[test]
fn restart_is_idempotent() {
    let content = b"2020-01-01T00:00:00Z,1\n2020-01-02T00:00:00Z,2\n2020-01-02T01:00:00Z,3\n";

    let run_once = |fx: &Fixture| {
        fx.run(IngestRequest::new("r", "r.csv", PartitionBy::Day)).unwrap()
    };

    let fx = Fixture::new(2);
    fx.write_input("r.csv", content);
    let first = run_once(&fx);
    let first_rows = reader(&fx, "r").row_count().unwrap();

    fs::remove_dir_all(fx.table_root("r")).unwrap();
    let second = run_once(&fx);
    let second_rows = reader(&fx, "r").row_count().unwrap();

    assert_eq!(first.partitions, second.partitions);
    assert_eq!(first.rows_loaded, second.rows_loaded);
    assert_eq!(first_rows, second_rows);
}

/// Header files: the header names columns and is not loaded as data.
#[test]
fn header_detected_and_skipped() {
    let fx = Fixture::new(2);
    fx.write_input(
        "h.csv",
        b"ts,price,venue\n2020-01-01T00:00:00Z,1.5,NYSE\n2020-01-01T00:00:01Z,2.5,LSE\n",
    );
    let summary = fx
        .run(IngestRequest::new("h", "h.csv", PartitionBy::Day))
        .unwrap();
    assert_eq!(summary.rows_loaded, 2);

    let r = reader(&fx, "h");
    assert_eq!(r.meta().columns[1].name, "price");
    let key = r.partitions()[0];
    assert_eq!(r.read_doubles(key, 1).unwrap(), vec![1.5, 2.5]);
}

/// Loading into an existing empty table reuses its schema.
#[test]
fn existing_empty_table_is_reused() {
    let fx = Fixture::new(1);
    fx.write_input("e.csv", b"2020-01-01T00:00:00Z,7\n");
    fx.run(IngestRequest::new("e", "e.csv", PartitionBy::Day)).unwrap();

    // Remove the partition but keep the (now empty) table, then load again.
    let r = reader(&fx, "e");
    let key = r.partitions()[0];
    fs::remove_dir_all(fx.table_root("e").join(PartitionBy::Day.dir_name(key))).unwrap();
    let mut meta = r.meta().clone();
    meta.partitions.clear();
    meta.save(&fx.table_root("e")).unwrap();

    let summary = fx.run(IngestRequest::new("e", "e.csv", PartitionBy::Day)).unwrap();
    assert_eq!(summary.rows_loaded, 1);
}

/// Loading into a non-empty table is a configuration error.
#[test]
fn non_empty_target_is_rejected() {
    let fx = Fixture::new(1);
    fx.write_input("n.csv", b"2020-01-01T00:00:00Z,7\n");
    fx.run(IngestRequest::new("n", "n.csv", PartitionBy::Day)).unwrap();

    let err = fx
        .run(IngestRequest::new("n", "n.csv", PartitionBy::Day))
        .unwrap_err();
    assert!(matches!(err, StampedeError::Config(_)));
}

/// Mismatched partition unit against an existing table is rejected.
#[test]
fn partition_unit_mismatch_is_rejected() {
    let fx = Fixture::new(1);
    fx.write_input("u.csv", b"2020-01-01T00:00:00Z,7\n");
    fx.run(IngestRequest::new("u", "u.csv", PartitionBy::Day)).unwrap();

    // Empty the table, then ask for MONTH against the DAY table.
    let r = reader(&fx, "u");
    let key = r.partitions()[0];
    fs::remove_dir_all(fx.table_root("u").join(PartitionBy::Day.dir_name(key))).unwrap();
    let mut meta = r.meta().clone();
    meta.partitions.clear();
    meta.save(&fx.table_root("u")).unwrap();

    let err = fx
        .run(IngestRequest::new("u", "u.csv", PartitionBy::Month))
        .unwrap_err();
    assert!(matches!(err, StampedeError::Config(_)));
}

/// Empty input is a configuration error raised before any phase runs.
#[test]
fn empty_file_is_rejected() {
    let fx = Fixture::new(2);
    fx.write_input("z.csv", b"");
    let err = fx.run(IngestRequest::new("z", "z.csv", PartitionBy::Day)).unwrap_err();
    assert!(matches!(err, StampedeError::Config(_)));
    assert!(!fx.work_dir("z").exists());
}

/// A tripped circuit breaker cancels the load and cleans up.
#[test]
fn circuit_breaker_cancels_load() {
    let fx = Fixture::new(2);
    fx.write_input("x.csv", b"2020-01-01T00:00:00Z,1\n2020-01-01T00:00:01Z,2\n");

    let mut coordinator = IngestCoordinator::new(fx.config.clone()).unwrap();
    let flag = Arc::new(AtomicBool::new(true));
    coordinator.set_circuit_breaker(Arc::clone(&flag));
    let err = coordinator
        .run(IngestRequest::new("x", "x.csv", PartitionBy::Day))
        .unwrap_err();
    assert!(matches!(err, StampedeError::Cancelled));
    assert!(!fx.work_dir("x").exists());
    flag.store(false, Ordering::Relaxed);
}

/// Key indexes are present on attached partitions for configured columns.
#[test]
fn key_index_built_for_configured_column() {
    let mut fx = Fixture::new(2);
    fx.config.indexed_columns = vec!["venue".to_string()];
    fx.write_input(
        "k.csv",
        b"ts,venue\n2020-01-01T00:00:00Z,NYSE\n2020-01-01T00:00:01Z,LSE\n2020-01-01T00:00:02Z,NYSE\n2020-01-01T00:00:03Z,LSE\n",
    );
    fx.run(IngestRequest::new("k", "k.csv", PartitionBy::Day)).unwrap();

    let idx = fx.table_root("k").join("2020-01-01").join("venue.idx");
    assert!(idx.is_file(), "missing {}", idx.display());
    let data = fs::read(idx).unwrap();
    let n_keys = u32::from_le_bytes(data[..4].try_into().unwrap());
    assert_eq!(n_keys, 2);
}

/// Semicolon-delimited input is auto-detected.
#[test]
fn delimiter_auto_detection() {
    let fx = Fixture::new(1);
    fx.write_input("d.csv", b"2020-01-01T00:00:00Z;1\n2020-01-01T00:00:01Z;2\n");
    let summary = fx.run(IngestRequest::new("d", "d.csv", PartitionBy::Day)).unwrap();
    assert_eq!(summary.rows_loaded, 2);
}

/// Records with unparseable timestamps are dropped during indexing, not
/// loaded and not fatal.
#[test]
fn bad_timestamps_count_as_parse_errors() {
    let fx = Fixture::new(2);
    fx.write_input(
        "b.csv",
        b"2020-01-01T00:00:00Z,1\nnot-a-timestamp,2\n2020-01-01T00:00:02Z,3\n",
    );
    // The bad sample stops detection from calling f0 a timestamp column, so
    // name it explicitly (headerless files get synthetic f{n} names).
    let summary = fx
        .run(IngestRequest::new("b", "b.csv", PartitionBy::Day).timestamp_column("f0"))
        .unwrap();
    assert_eq!(summary.rows_indexed, 2);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.rows_loaded, 2);
}

/// Hour partitioning produces hour-named directories.
#[test]
fn hour_partitioning() {
    let fx = Fixture::new(1);
    fx.write_input(
        "hr.csv",
        b"2020-01-01T03:10:00Z,1\n2020-01-01T04:20:00Z,2\n2020-01-01T03:40:00Z,3\n",
    );
    let summary = fx.run(IngestRequest::new("hr", "hr.csv", PartitionBy::Hour)).unwrap();
    assert_eq!(summary.partitions, vec!["2020-01-01T03", "2020-01-01T04"]);
    let r = reader(&fx, "hr");
    assert_eq!(r.row_count().unwrap(), 3);
}

fn assert_send<T: Send>() {}

#[test]
fn shared_task_types_are_send() {
    assert_send::<crate::ingest::queue::ImportTask>();
    assert_send::<crate::ingest::queue::TaskOutcome>();
}

/// Work directories from an interrupted earlier run are replaced, not
/// appended to.
#[test]
fn stale_work_dir_is_replaced() {
    let fx = Fixture::new(1);
    fx.write_input("w.csv", b"2020-01-01T00:00:00Z,1\n");
    let stale = fx.work_dir("w").join("leftover");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("junk"), b"junk").unwrap();

    let summary = fx.run(IngestRequest::new("w", "w.csv", PartitionBy::Day)).unwrap();
    assert_eq!(summary.rows_loaded, 1);
    assert!(!fx.work_dir("w").exists());
}

/// The designated timestamp column can sit anywhere, named via the header.
#[test]
fn named_timestamp_column_mid_row() {
    let fx = Fixture::new(1);
    fx.write_input(
        "mid.csv",
        b"price,when,qty\n1.5,2020-01-01T00:00:00Z,10\n2.5,2020-01-02T00:00:00Z,20\n",
    );
    let summary = fx
        .run(
            IngestRequest::new("mid", "mid.csv", PartitionBy::Day)
                .timestamp_column("when")
                .force_header(true),
        )
        .unwrap();
    assert_eq!(summary.partitions.len(), 2);

    let r = reader(&fx, "mid");
    assert_eq!(r.meta().timestamp_index, 1);
    let key = r.partitions()[0];
    assert_eq!(r.read_doubles(key, 0).unwrap(), vec![1.5]);
    assert_eq!(r.read_longs(key, 2).unwrap(), vec![10]);
}
