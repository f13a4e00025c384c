//! Phase orchestration for one load.
//!
//! The coordinator owns the work directory and the task queue. Phases run
//! strictly in order; within a phase it submits tasks and then drains the
//! queue cooperatively until the barrier clears. Any task fault surfaces at
//! the barrier, after which the work directory is torn down: a failed load
//! leaves nothing behind but the (possibly empty) target table.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ahash::AHashSet;

use crate::config::{IngestConfig, IngestRequest, IngestSummary};
use crate::ingest::boundary::{reconcile_boundaries, ChunkBoundary, ChunkStat};
use crate::ingest::queue::{ImportTask, LoadPlan, TaskContext, TaskOutcome, WorkQueue};
use crate::ingest::symbols::staging_table_root;
use crate::table::meta::{ColumnDef, TableMeta};
use crate::table::writer::TableWriter;
use crate::text::adapters::{ColumnType, TimestampAdapter, TypeAdapter};
use crate::text::delimiter::detect_delimiter;
use crate::text::schema::SchemaDetector;
use crate::{Result, StampedeError};

/// Drives the five-phase pipeline for one load at a time.
pub struct IngestCoordinator {
    config: IngestConfig,
    queue: WorkQueue,
    circuit_breaker: Option<Arc<AtomicBool>>,
}

/// Work distribution of the import phase: one entry per task,
/// `(task index, partition lo, partition hi)`.
type TaskDistribution = Vec<(usize, usize, usize)>;

struct PreparedLoad {
    meta: TableMeta,
    header: bool,
    delimiter: u8,
    input_path: PathBuf,
    file_len: u64,
}

impl IngestCoordinator {
    pub fn new(config: IngestConfig) -> Result<Self> {
        if config.worker_count == 0 {
            return Err(StampedeError::Config("worker count must be at least 1".into()));
        }
        if config.min_chunk_size == 0 {
            return Err(StampedeError::Config("min chunk size must be positive".into()));
        }
        let queue = WorkQueue::new(config.worker_count, config.queue_capacity)?;
        Ok(Self { config, queue, circuit_breaker: None })
    }

    /// Install an external cancellation flag, polled at loader row-batch
    /// boundaries.
    pub fn set_circuit_breaker(&mut self, flag: Arc<AtomicBool>) {
        self.circuit_breaker = Some(flag);
    }

    /// Run one load. The work directory is removed on success and on failure.
    pub fn run(&mut self, request: IngestRequest) -> Result<IngestSummary> {
        let result = self.run_phases(&request);
        self.remove_work_dir(&request.table_name);
        result
    }

    fn run_phases(&mut self, request: &IngestRequest) -> Result<IngestSummary> {
        let prepared = self.parse_structure(request)?;
        let import_root = self.create_work_dir(&request.table_name)?;

        let worker_count = self.config.worker_count;
        let timestamp_adapter = TimestampAdapter::new(request.timestamp_format.clone());
        let adapters: Vec<TypeAdapter> = prepared
            .meta
            .columns
            .iter()
            .map(|c| TypeAdapter::for_type(c.column_type, request.timestamp_format.clone()))
            .collect();

        let plan = Arc::new(LoadPlan {
            input_path: prepared.input_path.clone(),
            import_root: import_root.clone(),
            table_name: request.table_name.clone(),
            partition_by: request.partition_by,
            timestamp_index: prepared.meta.timestamp_index,
            timestamp_adapter,
            adapters,
            columns: prepared.meta.columns.clone(),
            atomicity: self.config.atomicity,
            header: prepared.header,
            window_size: self.config.buffer_size,
            index_block_capacity: self.config.index_block_capacity,
            circuit_breaker: self.circuit_breaker.clone(),
        });
        let contexts: Vec<Arc<TaskContext>> = (0..worker_count)
            .map(|i| Arc::new(TaskContext::new(i, prepared.delimiter)))
            .collect();

        // Phase 1: chunk boundaries.
        let boundaries = self.find_chunk_boundaries(&plan, prepared.file_len)?;

        // Phase 2: timestamp/offset indexing.
        let indexed = self.index_chunks(&plan, &contexts, &boundaries)?;
        if indexed.partitions.is_empty() {
            return Err(StampedeError::Structure(
                "no partitions to merge and load found".into(),
            ));
        }
        // Phase 3 reads exactly max_record_len bytes per record; a longer
        // record cannot exist because phase 2 measured every one.
        if indexed.max_record_len == 0 || indexed.max_record_len > prepared.file_len {
            return Err(StampedeError::Structure(format!(
                "implausible maximum record length {}",
                indexed.max_record_len
            )));
        }

        // Phase 3: merge and load into staging tables.
        let partitions = Arc::new(indexed.partitions);
        let (distribution, load) =
            self.import_partitions(&plan, &contexts, &partitions, indexed.max_record_len)?;

        // Phases 4a/4b: dictionary reconciliation and key rewrite, then the
        // optional key-index build.
        let final_root = self.config.db_root.join(&request.table_name);
        let final_writer = Arc::new(TableWriter::open(&final_root)?);
        self.merge_symbols(&plan, &final_writer, distribution.len())?;
        self.build_key_indexes(&plan, &prepared.meta, distribution.len())?;

        // Phase 5: move staged partitions into the final table and attach.
        self.move_and_attach(&plan, &final_writer, &distribution, &partitions)?;

        Ok(IngestSummary {
            rows_indexed: indexed.records,
            rows_loaded: load.rows,
            rows_rejected: load.rejected,
            parse_errors: indexed.rejected,
            partitions: partitions.iter().map(|(_, name)| name.clone()).collect(),
        })
    }

    // ========================================================================
    // Phase 0: structure analysis and table preparation
    // ========================================================================

    fn parse_structure(&self, request: &IngestRequest) -> Result<PreparedLoad> {
        if request.table_name.is_empty()
            || request
                .table_name
                .contains(|c: char| c == '/' || c == '\\' || c == '.')
        {
            return Err(StampedeError::Config(format!(
                "invalid table name '{}'",
                request.table_name
            )));
        }

        let input_path = self.config.input_root.join(&request.input_file_name);
        let mut file = File::open(&input_path).map_err(|e| {
            StampedeError::Config(format!("cannot open input file {}: {e}", input_path.display()))
        })?;
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Err(StampedeError::Config(format!(
                "ignoring empty input file {}",
                input_path.display()
            )));
        }

        let mut buf = vec![0u8; self.config.buffer_size.min(file_len as usize)];
        file.read_exact(&mut buf)?;

        let delimiter = match request.delimiter {
            Some(d) => d,
            None => detect_delimiter(&buf)?,
        };

        let detector = SchemaDetector {
            delimiter,
            max_lines: self.config.analysis_max_lines,
            symbol_cardinality_cutoff: self.config.symbol_cardinality_cutoff,
            force_header: request.force_header,
            timestamp_column: request.timestamp_column.clone(),
            timestamp_format: request.timestamp_format.clone(),
        };
        let schema = detector.detect(&buf, buf.len() as u64 == file_len)?;

        let final_root = self.config.db_root.join(&request.table_name);
        let meta = if TableMeta::exists(&final_root) {
            self.open_existing_table(request, &final_root, schema.columns.len())?
        } else {
            self.create_new_table(request, &final_root, &schema.columns, schema.timestamp_index)?
        };

        Ok(PreparedLoad {
            meta,
            header: schema.header,
            delimiter,
            input_path,
            file_len,
        })
    }

    fn create_new_table(
        &self,
        request: &IngestRequest,
        final_root: &Path,
        detected: &[crate::text::schema::DetectedColumn],
        timestamp_index: Option<usize>,
    ) -> Result<TableMeta> {
        let timestamp_index = timestamp_index.ok_or_else(|| {
            StampedeError::Config(
                "timestamp column must be set when importing to a new table".into(),
            )
        })?;
        let columns: Vec<ColumnDef> = detected
            .iter()
            .map(|c| {
                let indexed = c.column_type.is_symbol()
                    && self
                        .config
                        .indexed_columns
                        .iter()
                        .any(|n| n.eq_ignore_ascii_case(&c.name));
                ColumnDef::new(c.name.clone(), c.column_type).indexed(indexed)
            })
            .collect();
        let meta = TableMeta::new(&request.table_name, request.partition_by, timestamp_index, columns);
        TableWriter::create(final_root, meta.clone())?;
        log::info!("created table {} at {}", request.table_name, final_root.display());
        Ok(meta)
    }

    fn open_existing_table(
        &self,
        request: &IngestRequest,
        final_root: &Path,
        file_column_count: usize,
    ) -> Result<TableMeta> {
        let meta = TableMeta::load(final_root)?;
        if meta.partition_by != request.partition_by {
            return Err(StampedeError::Config(format!(
                "declared partition by unit {} doesn't match table's {}",
                request.partition_by, meta.partition_by
            )));
        }
        if !meta.partitions.is_empty() {
            return Err(StampedeError::Config(format!(
                "target table must be empty [table={}]",
                request.table_name
            )));
        }
        if file_column_count > meta.columns.len() {
            return Err(StampedeError::Config(format!(
                "column count mismatch [textColumnCount={}, tableColumnCount={}, table={}]",
                file_column_count,
                meta.columns.len(),
                request.table_name
            )));
        }
        if meta.timestamp_index >= file_column_count {
            return Err(StampedeError::Config(
                "designated timestamp column is missing from the input file".into(),
            ));
        }
        if let Some(requested) = &request.timestamp_column {
            match meta.column_index(requested) {
                Some(idx) if idx == meta.timestamp_index => {}
                _ => {
                    return Err(StampedeError::Config(format!(
                        "invalid timestamp column '{requested}'"
                    )))
                }
            }
        }
        if meta.columns[meta.timestamp_index].column_type != ColumnType::Timestamp {
            return Err(StampedeError::Config(format!(
                "column '{}' is not a timestamp",
                meta.columns[meta.timestamp_index].name
            )));
        }
        Ok(meta)
    }

    // ========================================================================
    // Work directory lifecycle
    // ========================================================================

    fn import_root(&self, table_name: &str) -> PathBuf {
        self.config.work_root.join(table_name)
    }

    fn create_work_dir(&self, table_name: &str) -> Result<PathBuf> {
        let dir = self.import_root(table_name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        log::info!("created import dir {}", dir.display());
        Ok(dir)
    }

    fn remove_work_dir(&self, table_name: &str) {
        let dir = self.import_root(table_name);
        if dir.exists() {
            log::info!("removing import directory path={}", dir.display());
            if let Err(e) = fs::remove_dir_all(&dir) {
                log::error!("can't remove import directory {}: {e}", dir.display());
            }
        }
    }

    // ========================================================================
    // Phase 1: boundary scan
    // ========================================================================

    fn find_chunk_boundaries(&self, plan: &Arc<LoadPlan>, file_len: u64) -> Result<Vec<ChunkBoundary>> {
        log::info!("started checking boundaries in file={}", plan.input_path.display());

        let worker_count = self.config.worker_count as u64;
        if worker_count == 1 {
            return Ok(vec![
                ChunkBoundary { offset: 0, line: 0 },
                ChunkBoundary { offset: file_len, line: 0 },
            ]);
        }

        let chunk_size = (file_len / worker_count).max(self.config.min_chunk_size);
        let chunks = (file_len / chunk_size).max(1) as usize;

        for i in 0..chunks {
            let lo = i as u64 * chunk_size;
            let hi = (lo + chunk_size).min(file_len);
            self.queue.submit(ImportTask::BoundaryCheck {
                plan: Arc::clone(plan),
                slot: i,
                lo,
                hi,
            });
        }
        let outcomes = self.queue.barrier(chunks)?;

        let mut stats = vec![ChunkStat::default(); chunks];
        for outcome in outcomes {
            if let TaskOutcome::Boundary { slot, stat } = outcome {
                stats[slot] = stat;
            }
        }
        let boundaries = reconcile_boundaries(&stats, file_len);

        log::info!("finished checking boundaries in file={}", plan.input_path.display());
        Ok(boundaries)
    }

    // ========================================================================
    // Phase 2: indexing
    // ========================================================================

    fn index_chunks(
        &self,
        plan: &Arc<LoadPlan>,
        contexts: &[Arc<TaskContext>],
        boundaries: &[ChunkBoundary],
    ) -> Result<IndexedFile> {
        if boundaries.len() < 2 {
            return Err(StampedeError::Structure(format!(
                "no chunks found for indexing in file={}",
                plan.input_path.display()
            )));
        }
        log::info!("started indexing file={}", plan.input_path.display());

        let mut submitted = 0;
        for (i, pair) in boundaries.windows(2).enumerate() {
            self.queue.submit(ImportTask::Indexing {
                plan: Arc::clone(plan),
                ctx: Arc::clone(&contexts[i]),
                chunk_id: i,
                lo: pair[0].offset,
                hi: pair[1].offset,
                starting_line: pair[0].line,
            });
            submitted += 1;
        }
        let outcomes = self.queue.barrier(submitted)?;

        let mut records = 0;
        let mut rejected = 0;
        let mut max_record_len = 0;
        let mut keys: AHashSet<i64> = AHashSet::new();
        for outcome in outcomes {
            if let TaskOutcome::Indexed { outcome, .. } = outcome {
                records += outcome.records;
                rejected += outcome.rejected;
                max_record_len = max_record_len.max(outcome.max_record_len);
                keys.extend(outcome.partition_keys);
            }
        }
        let mut sorted: Vec<i64> = keys.into_iter().collect();
        sorted.sort_unstable();
        let partitions: Vec<(i64, String)> = sorted
            .into_iter()
            .map(|k| (k, plan.partition_by.dir_name(k)))
            .collect();

        log::info!(
            "finished indexing file={} [records={records}, rejected={rejected}, maxRecordLen={max_record_len}, partitions={}]",
            plan.input_path.display(),
            partitions.len()
        );
        Ok(IndexedFile { records, rejected, max_record_len, partitions })
    }

    // ========================================================================
    // Phase 3: merge and load
    // ========================================================================

    fn import_partitions(
        &self,
        plan: &Arc<LoadPlan>,
        contexts: &[Arc<TaskContext>],
        partitions: &Arc<Vec<(i64, String)>>,
        max_record_len: u64,
    ) -> Result<(TaskDistribution, crate::ingest::loader::LoadStats)> {
        log::info!("started index merge and partition load");

        let partition_count = partitions.len();
        let worker_count = self.config.worker_count;
        let per_task = (partition_count + worker_count - 1) / worker_count;
        let task_count = (partition_count + per_task - 1) / per_task;

        let mut distribution: TaskDistribution = Vec::with_capacity(task_count);
        for i in 0..task_count {
            let lo = i * per_task;
            let hi = (lo + per_task).min(partition_count);
            self.queue.submit(ImportTask::PartitionImport {
                plan: Arc::clone(plan),
                ctx: Arc::clone(&contexts[i]),
                task_idx: i,
                partitions: Arc::clone(partitions),
                lo,
                hi,
                max_record_len,
            });
            distribution.push((i, lo, hi));
        }
        let outcomes = self.queue.barrier(task_count)?;

        let mut load = crate::ingest::loader::LoadStats::default();
        for outcome in outcomes {
            if let TaskOutcome::Imported { stats, .. } = outcome {
                load.rows += stats.rows;
                load.rejected += stats.rejected;
                load.field_nulls += stats.field_nulls;
            }
        }
        log::info!("finished index merge and partition load [rows={}]", load.rows);
        Ok((distribution, load))
    }

    // ========================================================================
    // Phase 4: symbol reconciliation
    // ========================================================================

    fn merge_symbols(
        &self,
        plan: &Arc<LoadPlan>,
        final_writer: &Arc<TableWriter>,
        staging_count: usize,
    ) -> Result<()> {
        let symbol_columns: Vec<usize> = plan
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.column_type.is_symbol())
            .map(|(i, _)| i)
            .collect();
        if symbol_columns.is_empty() {
            return Ok(());
        }

        log::info!("started symbol table merge");
        for &col in &symbol_columns {
            self.queue.submit(ImportTask::SymbolTableMerge {
                plan: Arc::clone(plan),
                writer: Arc::clone(final_writer),
                column: col,
                column_name: plan.columns[col].name.clone(),
                staging_count,
            });
        }
        self.queue.barrier(symbol_columns.len())?;
        final_writer.persist_dictionaries()?;
        log::info!("finished symbol table merge");

        log::info!("started symbol keys update");
        let mut submitted = 0;
        for t in 0..staging_count {
            let staging_root = staging_table_root(&plan.import_root, &plan.table_name, t);
            let staging_meta = TableMeta::load(&staging_root)?;
            for &key in &staging_meta.partitions {
                let dir = staging_meta.partition_dir(&staging_root, key);
                for &col in &symbol_columns {
                    self.queue.submit(ImportTask::UpdateSymbolKeys {
                        partition_dir: dir.clone(),
                        column_name: plan.columns[col].name.clone(),
                    });
                    submitted += 1;
                }
            }
        }
        self.queue.barrier(submitted)?;
        log::info!("finished symbol keys update");
        Ok(())
    }

    fn build_key_indexes(
        &self,
        plan: &Arc<LoadPlan>,
        meta: &TableMeta,
        staging_count: usize,
    ) -> Result<()> {
        let any_indexed = meta
            .columns
            .iter()
            .any(|c| c.indexed && c.column_type.is_symbol());
        if !any_indexed {
            return Ok(());
        }
        log::info!("started build column indexes");
        for t in 0..staging_count {
            self.queue.submit(ImportTask::BuildIndex {
                plan: Arc::clone(plan),
                staging_index: t,
            });
        }
        self.queue.barrier(staging_count)?;
        log::info!("finished build column indexes");
        Ok(())
    }

    // ========================================================================
    // Phase 5: move and attach
    // ========================================================================

    fn move_and_attach(
        &self,
        plan: &Arc<LoadPlan>,
        final_writer: &Arc<TableWriter>,
        distribution: &TaskDistribution,
        partitions: &Arc<Vec<(i64, String)>>,
    ) -> Result<()> {
        log::info!("started attaching partitions");
        let final_root = final_writer.root().to_path_buf();

        for &(task_idx, lo, hi) in distribution {
            let staging_root = staging_table_root(&plan.import_root, &plan.table_name, task_idx);
            for (_, name) in &partitions[lo..hi] {
                let src = staging_root.join(name);
                let dst = final_root.join(name);
                if !src.is_dir() {
                    continue;
                }
                if let Err(e) = fs::rename(&src, &dst) {
                    log::error!("can't move {} to {}: {e}", src.display(), dst.display());
                }
            }
        }

        for &(key, ref name) in partitions.iter() {
            match final_writer.attach_partition(key) {
                Ok(rows) => log::info!("attached partition {name} [rows={rows}]"),
                Err(e) => log::error!("cannot attach partition {name}: {e}"),
            }
        }
        log::info!("finished attaching partitions");
        Ok(())
    }
}

struct IndexedFile {
    records: u64,
    rejected: u64,
    max_record_len: u64,
    partitions: Vec<(i64, String)>,
}
