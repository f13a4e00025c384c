//! The shared work queue: phase-tagged tasks, a fixed worker pool, and the
//! cooperative barrier.
//!
//! Tasks flow through a bounded multi-producer/multi-consumer channel. The
//! coordinator keeps a receiver of its own: after submitting a phase's tasks
//! it drains the channel alongside the pool until every outcome has arrived,
//! which keeps a single-worker (or saturated) configuration from
//! deadlocking. A full channel degrades to running the task on the
//! submitting thread.
//!
//! Workers never unwind across the channel: every task maps to a
//! `Result`, and the first error wins a shared slot that the coordinator
//! checks when the barrier clears.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::Atomicity;
use crate::ingest::boundary::{scan_chunk, ChunkStat};
use crate::ingest::indexer::{IndexerOutcome, PartitionIndexer};
use crate::ingest::loader::{LoadStats, PartitionLoader};
use crate::ingest::merge::merge_partition_index;
use crate::ingest::symbols::{self, staging_table_root};
use crate::partition::PartitionBy;
use crate::table::meta::{ColumnDef, TableMeta};
use crate::table::writer::{SyncMode, TableWriter};
use crate::text::adapters::{TimestampAdapter, TypeAdapter};
use crate::text::lexer::CsvLexer;
use crate::{Result, StampedeError};

/// Immutable description of one load, shared by every task of the run.
pub struct LoadPlan {
    pub input_path: PathBuf,
    pub import_root: PathBuf,
    pub table_name: String,
    pub partition_by: PartitionBy,
    pub timestamp_index: usize,
    pub timestamp_adapter: TimestampAdapter,
    pub adapters: Vec<TypeAdapter>,
    pub columns: Vec<ColumnDef>,
    pub atomicity: Atomicity,
    /// The file has a header record; only the first chunk's indexer skips it.
    pub header: bool,
    pub window_size: usize,
    pub index_block_capacity: usize,
    pub circuit_breaker: Option<Arc<AtomicBool>>,
}

impl LoadPlan {
    fn staging_meta(&self, worker: usize) -> TableMeta {
        TableMeta::new(
            format!("{}__{worker}", self.table_name),
            self.partition_by,
            self.timestamp_index,
            self.columns.clone(),
        )
    }
}

/// Per-worker mutable state: the lexer and the record slab. A context is
/// used by at most one task at a time; the locks are uncontended and only
/// make the sharing explicit.
pub struct TaskContext {
    pub worker_id: usize,
    pub lexer: Mutex<CsvLexer>,
    pub scratch: Mutex<Vec<u8>>,
}

impl TaskContext {
    pub fn new(worker_id: usize, delimiter: u8) -> Self {
        Self {
            worker_id,
            lexer: Mutex::new(CsvLexer::of(delimiter)),
            scratch: Mutex::new(Vec::new()),
        }
    }
}

/// One task, tagged by phase.
pub enum ImportTask {
    BoundaryCheck {
        plan: Arc<LoadPlan>,
        slot: usize,
        lo: u64,
        hi: u64,
    },
    Indexing {
        plan: Arc<LoadPlan>,
        ctx: Arc<TaskContext>,
        chunk_id: usize,
        lo: u64,
        hi: u64,
        starting_line: u64,
    },
    PartitionImport {
        plan: Arc<LoadPlan>,
        ctx: Arc<TaskContext>,
        task_idx: usize,
        /// `(key, dir_name)` for every partition of the run, ascending.
        partitions: Arc<Vec<(i64, String)>>,
        lo: usize,
        hi: usize,
        max_record_len: u64,
    },
    SymbolTableMerge {
        plan: Arc<LoadPlan>,
        writer: Arc<TableWriter>,
        column: usize,
        column_name: String,
        staging_count: usize,
    },
    UpdateSymbolKeys {
        partition_dir: PathBuf,
        column_name: String,
    },
    BuildIndex {
        plan: Arc<LoadPlan>,
        staging_index: usize,
    },
}

/// Result of one completed task.
#[derive(Debug)]
pub enum TaskOutcome {
    Boundary { slot: usize, stat: ChunkStat },
    Indexed { chunk_id: usize, outcome: IndexerOutcome },
    Imported { task_idx: usize, stats: LoadStats },
    SymbolsMerged { column: usize },
    KeysUpdated,
    IndexBuilt { staging_index: usize },
    /// The task failed; its error sits in the shared slot.
    Failed,
}

impl ImportTask {
    pub fn phase_name(&self) -> &'static str {
        match self {
            ImportTask::BoundaryCheck { .. } => "BOUNDARY_CHECK",
            ImportTask::Indexing { .. } => "INDEXING",
            ImportTask::PartitionImport { .. } => "PARTITION_IMPORT",
            ImportTask::SymbolTableMerge { .. } => "SYMBOL_TABLE_MERGE",
            ImportTask::UpdateSymbolKeys { .. } => "UPDATE_SYMBOL_KEYS",
            ImportTask::BuildIndex { .. } => "BUILD_INDEX",
        }
    }

    pub fn execute(self) -> Result<TaskOutcome> {
        match self {
            ImportTask::BoundaryCheck { plan, slot, lo, hi } => {
                let file = File::open(&plan.input_path)?;
                let stat = scan_chunk(&file, lo, hi, plan.window_size)?;
                Ok(TaskOutcome::Boundary { slot, stat })
            }
            ImportTask::Indexing { plan, ctx, chunk_id, lo, hi, starting_line } => {
                let indexer = PartitionIndexer {
                    input_path: &plan.input_path,
                    import_root: &plan.import_root,
                    partition_by: plan.partition_by,
                    timestamp_index: plan.timestamp_index,
                    timestamp_adapter: &plan.timestamp_adapter,
                    worker_id: ctx.worker_id,
                    chunk_id,
                    window_size: plan.window_size,
                    skip_header: plan.header,
                };
                let mut lexer = ctx.lexer.lock();
                let outcome = indexer.index_chunk(&mut lexer, lo, hi, starting_line)?;
                Ok(TaskOutcome::Indexed { chunk_id, outcome })
            }
            ImportTask::PartitionImport {
                plan,
                ctx,
                task_idx,
                partitions,
                lo,
                hi,
                max_record_len,
            } => {
                let staging_root = staging_table_root(&plan.import_root, &plan.table_name, task_idx);
                let mut writer = TableWriter::create(&staging_root, plan.staging_meta(task_idx))?;
                let loader = PartitionLoader {
                    input_path: &plan.input_path,
                    adapters: &plan.adapters,
                    timestamp_index: plan.timestamp_index,
                    atomicity: plan.atomicity,
                    circuit_breaker: plan.circuit_breaker.as_deref(),
                };
                let mut lexer = ctx.lexer.lock();
                let mut scratch = ctx.scratch.lock();
                let mut stats = LoadStats::default();
                for (_, dir_name) in &partitions[lo..hi] {
                    let partition_dir = plan.import_root.join(dir_name);
                    let (merged, _) = merge_partition_index(&partition_dir)?;
                    let s = loader.load_partition(
                        &mut writer,
                        &merged,
                        max_record_len as usize,
                        &mut lexer,
                        &mut scratch,
                    )?;
                    stats.rows += s.rows;
                    stats.rejected += s.rejected;
                    stats.field_nulls += s.field_nulls;
                }
                writer.commit(SyncMode::Sync)?;
                Ok(TaskOutcome::Imported { task_idx, stats })
            }
            ImportTask::SymbolTableMerge {
                plan,
                writer,
                column,
                column_name,
                staging_count,
            } => {
                symbols::merge_symbol_column(
                    &writer,
                    &plan.import_root,
                    &plan.table_name,
                    staging_count,
                    column,
                    &column_name,
                )?;
                Ok(TaskOutcome::SymbolsMerged { column })
            }
            ImportTask::UpdateSymbolKeys { partition_dir, column_name } => {
                symbols::update_symbol_keys(&partition_dir, &column_name)?;
                Ok(TaskOutcome::KeysUpdated)
            }
            ImportTask::BuildIndex { plan, staging_index } => {
                let staging_root = staging_table_root(&plan.import_root, &plan.table_name, staging_index);
                let writer = TableWriter::open(&staging_root)?;
                let meta = writer.meta();
                for &key in &meta.partitions {
                    for (i, col) in meta.columns.iter().enumerate() {
                        if col.indexed && col.column_type.is_symbol() {
                            writer.build_key_index(key, i, plan.index_block_capacity)?;
                        }
                    }
                }
                Ok(TaskOutcome::IndexBuilt { staging_index })
            }
        }
    }
}

/// First-fault-wins error slot shared by the pool.
#[derive(Default)]
pub struct ErrorSlot {
    inner: Mutex<Option<StampedeError>>,
}

impl ErrorSlot {
    pub fn set_first(&self, err: StampedeError) {
        let mut slot = self.inner.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take(&self) -> Option<StampedeError> {
        self.inner.lock().take()
    }
}

/// Bounded task queue plus its worker pool.
pub struct WorkQueue {
    task_tx: Option<Sender<ImportTask>>,
    task_rx: Receiver<ImportTask>,
    outcome_tx: Sender<TaskOutcome>,
    outcome_rx: Receiver<TaskOutcome>,
    errors: Arc<ErrorSlot>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawn `worker_count` pool threads over a queue of `capacity` slots.
    /// Zero workers is legal: the barrier's drain loop then runs every task
    /// on the coordinator thread.
    pub fn new(worker_count: usize, capacity: usize) -> Result<Self> {
        let (task_tx, task_rx) = bounded::<ImportTask>(capacity.max(1));
        let (outcome_tx, outcome_rx) = unbounded::<TaskOutcome>();
        let errors = Arc::new(ErrorSlot::default());

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let rx = task_rx.clone();
            let tx = outcome_tx.clone();
            let errors = Arc::clone(&errors);
            let handle = std::thread::Builder::new()
                .name(format!("stampede-worker-{i}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        run_task(task, &tx, &errors);
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            task_tx: Some(task_tx),
            task_rx,
            outcome_tx,
            outcome_rx,
            errors,
            workers,
        })
    }

    /// Queue a task; a full queue runs it on the calling thread instead.
    pub fn submit(&self, task: ImportTask) {
        let Some(tx) = &self.task_tx else {
            return;
        };
        match tx.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                run_task(task, &self.outcome_tx, &self.errors);
            }
        }
    }

    /// Wait for `submitted` outcomes, executing queued tasks on this thread
    /// while waiting. Surfaces the first task fault after every in-flight
    /// task has drained.
    pub fn barrier(&self, submitted: usize) -> Result<Vec<TaskOutcome>> {
        let mut outcomes = Vec::with_capacity(submitted);
        while outcomes.len() < submitted {
            if let Ok(task) = self.task_rx.try_recv() {
                run_task(task, &self.outcome_tx, &self.errors);
                continue;
            }
            match self.outcome_rx.recv_timeout(Duration::from_millis(1)) {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => {}
            }
        }
        if let Some(err) = self.errors.take() {
            return Err(err);
        }
        Ok(outcomes)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops.
        self.task_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_task(task: ImportTask, outcome_tx: &Sender<TaskOutcome>, errors: &ErrorSlot) {
    let phase = task.phase_name();
    let outcome = match task.execute() {
        Ok(outcome) => outcome,
        Err(err) => {
            log::error!("{phase} task failed: {err}");
            errors.set_first(err);
            TaskOutcome::Failed
        }
    };
    let _ = outcome_tx.send(outcome);
}
