//! Partitioned columnar table writer.
//!
//! Layout under a table root:
//!
//! ```text
//! {root}/
//! ├── _meta                 schema + partition registry (bincode)
//! ├── {symcol}.sym          dictionary per symbol column
//! └── {partitionName}/
//!     ├── {col}.d           column data (fixed width, or var bytes)
//!     ├── {col}.i           var-size columns: LE i64 end offsets
//!     └── {col}.idx         key index (built on request)
//! ```
//!
//! Rows are built through [`TableWriter::new_row`]; a row is buffered until
//! `append` and discarded by `cancel`. The writer keeps one partition open at
//! a time; a row for a different partition flushes and switches. Dictionaries
//! sit behind per-column locks so dictionary merging can run in parallel
//! across columns on a shared writer handle while row building stays
//! exclusive.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::partition::PartitionBy;
use crate::table::meta::TableMeta;
use crate::table::symbol::{SymbolMapWriter, NULL_KEY, SYMBOL_FILE_SUFFIX};
use crate::text::adapters::ColumnType;
use crate::{Result, StampedeError};

/// Null sentinel for LONG and TIMESTAMP columns.
pub const NULL_LONG: i64 = i64::MIN;

/// File suffix of column data files.
pub const DATA_FILE_SUFFIX: &str = ".d";

/// File suffix of var-size column offset files.
pub const OFFSET_FILE_SUFFIX: &str = ".i";

/// File suffix of key index files.
pub const KEY_INDEX_FILE_SUFFIX: &str = ".idx";

/// Durability applied by [`TableWriter::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    NoSync,
    Sync,
}

#[derive(Debug, Clone)]
enum PendingCell {
    Unset,
    Bool(bool),
    Long(i64),
    Double(f64),
    Timestamp(i64),
    Key(i32),
    Str(Vec<u8>),
}

struct ColumnFile {
    column_type: ColumnType,
    data: BufWriter<File>,
    /// End-offset stream, var-size columns only.
    offsets: Option<BufWriter<File>>,
    var_offset: i64,
}

struct OpenPartition {
    key: i64,
    files: Vec<ColumnFile>,
    row_count: u64,
}

/// Writer over one table root.
pub struct TableWriter {
    root: PathBuf,
    meta: RwLock<TableMeta>,
    partition_by: PartitionBy,
    timestamp_index: usize,
    dicts: Vec<Mutex<SymbolMapWriter>>,
    open: Option<OpenPartition>,
    pending: Vec<PendingCell>,
    pending_ts: i64,
}

impl TableWriter {
    /// Create a table at `root`, writing its metadata. Parent directories are
    /// created as needed.
    pub fn create(root: impl Into<PathBuf>, meta: TableMeta) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        meta.save(&root)?;
        Ok(Self::from_meta(root, meta, true)?)
    }

    /// Open an existing table, loading metadata and dictionaries.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = TableMeta::load(&root)?;
        Self::from_meta(root, meta, false)
    }

    fn from_meta(root: PathBuf, meta: TableMeta, fresh: bool) -> Result<Self> {
        let mut dicts = Vec::with_capacity(meta.columns.len());
        for col in &meta.columns {
            let dict = if col.column_type.is_symbol() && !fresh {
                SymbolMapWriter::load(&root.join(format!("{}{}", col.name, SYMBOL_FILE_SUFFIX)))?
            } else {
                SymbolMapWriter::new()
            };
            dicts.push(Mutex::new(dict));
        }
        let pending = vec![PendingCell::Unset; meta.columns.len()];
        let partition_by = meta.partition_by;
        let timestamp_index = meta.timestamp_index;
        Ok(Self {
            root,
            meta: RwLock::new(meta),
            partition_by,
            timestamp_index,
            dicts,
            open: None,
            pending,
            pending_ts: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> TableMeta {
        self.meta.read().clone()
    }

    pub fn partition_by(&self) -> PartitionBy {
        self.partition_by
    }

    /// Total rows across attached partitions, derived from the timestamp
    /// column files.
    pub fn row_count(&self) -> Result<u64> {
        let meta = self.meta.read();
        let ts_name = meta.columns[meta.timestamp_index].name.clone();
        let mut total = 0;
        for &key in &meta.partitions {
            let dir = meta.partition_dir(&self.root, key);
            total += partition_row_count(&dir, &ts_name)?;
        }
        Ok(total)
    }

    /// Start a row with the given designated timestamp. Switches the open
    /// partition when the timestamp floors to a different key.
    pub fn new_row(&mut self, ts: i64) -> Result<Row<'_>> {
        let key = self.partition_by.floor(ts);
        let switch = match &self.open {
            Some(p) => p.key != key,
            None => true,
        };
        if switch {
            self.close_partition(SyncMode::NoSync)?;
            self.open_partition(key)?;
        }
        for cell in &mut self.pending {
            *cell = PendingCell::Unset;
        }
        self.pending_ts = ts;
        Ok(Row { writer: self })
    }

    fn open_partition(&mut self, key: i64) -> Result<()> {
        let meta = self.meta.read();
        let dir = meta.partition_dir(&self.root, key);
        fs::create_dir_all(&dir)?;

        let mut files = Vec::with_capacity(meta.columns.len());
        let mut row_count = 0;
        for (i, col) in meta.columns.iter().enumerate() {
            let data_path = dir.join(format!("{}{}", col.name, DATA_FILE_SUFFIX));
            let data_file = OpenOptions::new().append(true).create(true).open(&data_path)?;
            let data_len = data_file.metadata()?.len();
            if i == meta.timestamp_index {
                row_count = data_len / 8;
            }
            let offsets = if col.column_type.fixed_width().is_none() {
                let path = dir.join(format!("{}{}", col.name, OFFSET_FILE_SUFFIX));
                let f = OpenOptions::new().append(true).create(true).open(path)?;
                Some(BufWriter::new(f))
            } else {
                None
            };
            files.push(ColumnFile {
                column_type: col.column_type,
                data: BufWriter::new(data_file),
                offsets,
                var_offset: data_len as i64,
            });
        }
        drop(meta);
        self.open = Some(OpenPartition { key, files, row_count });
        Ok(())
    }

    /// Flush and drop the open partition, registering it in the metadata.
    fn close_partition(&mut self, mode: SyncMode) -> Result<()> {
        let Some(mut partition) = self.open.take() else {
            return Ok(());
        };
        for file in &mut partition.files {
            file.data.flush()?;
            if let Some(offsets) = &mut file.offsets {
                offsets.flush()?;
            }
            if mode == SyncMode::Sync {
                file.data.get_ref().sync_all()?;
                if let Some(offsets) = &file.offsets {
                    offsets.get_ref().sync_all()?;
                }
            }
        }
        if partition.row_count > 0 {
            self.meta.write().add_partition(partition.key);
        }
        Ok(())
    }

    fn append_pending(&mut self) -> Result<()> {
        // The designated timestamp always comes from `new_row`.
        self.pending[self.timestamp_index] = PendingCell::Timestamp(self.pending_ts);
        let partition = self
            .open
            .as_mut()
            .ok_or_else(|| StampedeError::Table("append without an open partition".into()))?;

        for (i, file) in partition.files.iter_mut().enumerate() {
            let cell = &self.pending[i];
            match (&file.column_type, cell) {
                (ColumnType::Boolean, PendingCell::Bool(v)) => {
                    file.data.write_all(&[*v as u8])?;
                }
                (ColumnType::Boolean, _) => {
                    file.data.write_all(&[0u8])?;
                }
                (ColumnType::Long, PendingCell::Long(v)) => {
                    file.data.write_all(&v.to_le_bytes())?;
                }
                (ColumnType::Long, _) => {
                    file.data.write_all(&NULL_LONG.to_le_bytes())?;
                }
                (ColumnType::Double, PendingCell::Double(v)) => {
                    file.data.write_all(&v.to_le_bytes())?;
                }
                (ColumnType::Double, _) => {
                    file.data.write_all(&f64::NAN.to_le_bytes())?;
                }
                (ColumnType::Timestamp, PendingCell::Timestamp(v)) => {
                    file.data.write_all(&v.to_le_bytes())?;
                }
                (ColumnType::Timestamp, _) => {
                    file.data.write_all(&NULL_LONG.to_le_bytes())?;
                }
                (ColumnType::Symbol, PendingCell::Key(k)) => {
                    file.data.write_all(&k.to_le_bytes())?;
                }
                (ColumnType::Symbol, _) => {
                    file.data.write_all(&NULL_KEY.to_le_bytes())?;
                }
                (ColumnType::String, cell) => {
                    if let PendingCell::Str(bytes) = cell {
                        file.data.write_all(bytes)?;
                        file.var_offset += bytes.len() as i64;
                    }
                    if let Some(offsets) = &mut file.offsets {
                        offsets.write_all(&file.var_offset.to_le_bytes())?;
                    }
                }
            }
        }
        partition.row_count += 1;
        Ok(())
    }

    /// Flush column files and persist dictionaries and metadata.
    pub fn commit(&mut self, mode: SyncMode) -> Result<()> {
        self.close_partition(mode)?;
        self.persist_dictionaries()?;
        let meta = self.meta.read().clone();
        meta.save(&self.root)?;
        Ok(())
    }

    /// Intern a symbol through the column's dictionary.
    pub fn resolve_symbol(&self, col: usize, value: &str) -> Result<i32> {
        let dict = self
            .dicts
            .get(col)
            .ok_or_else(|| StampedeError::Table(format!("no column {col}")))?;
        Ok(dict.lock().resolve_or_insert(value))
    }

    /// Merge a staged dictionary into this table's dictionary for `col`,
    /// returning the old-key to new-key remap. Insertion order of `names` is
    /// preserved for first-seen strings.
    pub fn merge_into_dictionary(&self, col: usize, names: &[String]) -> Result<Vec<i32>> {
        let dict = self
            .dicts
            .get(col)
            .ok_or_else(|| StampedeError::Table(format!("no column {col}")))?;
        let mut dict = dict.lock();
        Ok(names.iter().map(|n| dict.resolve_or_insert(n)).collect())
    }

    pub fn dictionary_len(&self, col: usize) -> usize {
        self.dicts.get(col).map(|d| d.lock().len()).unwrap_or(0)
    }

    /// Write every symbol column's dictionary next to the partitions.
    pub fn persist_dictionaries(&self) -> Result<()> {
        let meta = self.meta.read();
        for (i, col) in meta.columns.iter().enumerate() {
            if !col.column_type.is_symbol() {
                continue;
            }
            let path = self.root.join(format!("{}{}", col.name, SYMBOL_FILE_SUFFIX));
            self.dicts[i].lock().persist(&path)?;
        }
        Ok(())
    }

    /// Register a partition directory that was moved under this table's root.
    /// Returns the row count found in it.
    pub fn attach_partition(&self, key: i64) -> Result<u64> {
        let (dir, ts_name) = {
            let meta = self.meta.read();
            (
                meta.partition_dir(&self.root, key),
                meta.columns[meta.timestamp_index].name.clone(),
            )
        };
        if !dir.is_dir() {
            return Err(StampedeError::Table(format!(
                "partition directory missing: {}",
                dir.display()
            )));
        }
        let rows = partition_row_count(&dir, &ts_name)?;
        {
            let mut meta = self.meta.write();
            meta.add_partition(key);
            meta.save(&self.root)?;
        }
        Ok(rows)
    }

    /// Build the key index for a symbol column in one partition:
    ///
    /// ```text
    /// [u32 key_count] then per key, ascending:
    /// [i32 key][u32 row_count][u32 row]...
    /// ```
    pub fn build_key_index(&self, key: i64, col: usize, block_capacity: usize) -> Result<()> {
        let meta = self.meta.read();
        let def = meta
            .columns
            .get(col)
            .ok_or_else(|| StampedeError::Table(format!("no column {col}")))?;
        if !def.column_type.is_symbol() {
            return Err(StampedeError::Table(format!(
                "key index requires a symbol column, {} is {}",
                def.name, def.column_type
            )));
        }
        let dir = meta.partition_dir(&self.root, key);
        let data = fs::read(dir.join(format!("{}{}", def.name, DATA_FILE_SUFFIX)))?;

        let mut rows_by_key: AHashMap<i32, Vec<u32>> = AHashMap::new();
        for (row, cell) in data.chunks_exact(4).enumerate() {
            let k = i32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]);
            if k == NULL_KEY {
                continue;
            }
            rows_by_key
                .entry(k)
                .or_insert_with(|| Vec::with_capacity(block_capacity))
                .push(row as u32);
        }
        let mut keys: Vec<i32> = rows_by_key.keys().copied().collect();
        keys.sort_unstable();

        let path = dir.join(format!("{}{}", def.name, KEY_INDEX_FILE_SUFFIX));
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&(keys.len() as u32).to_le_bytes())?;
        for k in keys {
            let rows = &rows_by_key[&k];
            w.write_all(&k.to_le_bytes())?;
            w.write_all(&(rows.len() as u32).to_le_bytes())?;
            for &row in rows {
                w.write_all(&row.to_le_bytes())?;
            }
        }
        w.flush()?;
        Ok(())
    }
}

/// One row under construction. Dropped rows are cancelled implicitly: nothing
/// reaches the column files until [`Row::append`].
pub struct Row<'a> {
    writer: &'a mut TableWriter,
}

impl Row<'_> {
    pub fn put_bool(&mut self, col: usize, v: bool) {
        self.put(col, PendingCell::Bool(v));
    }

    pub fn put_long(&mut self, col: usize, v: i64) {
        self.put(col, PendingCell::Long(v));
    }

    pub fn put_double(&mut self, col: usize, v: f64) {
        self.put(col, PendingCell::Double(v));
    }

    pub fn put_timestamp(&mut self, col: usize, v: i64) {
        self.put(col, PendingCell::Timestamp(v));
    }

    pub fn put_str(&mut self, col: usize, v: &[u8]) {
        self.put(col, PendingCell::Str(v.to_vec()));
    }

    pub fn put_symbol(&mut self, col: usize, v: &str) -> Result<()> {
        let key = self.writer.resolve_symbol(col, v)?;
        self.put(col, PendingCell::Key(key));
        Ok(())
    }

    fn put(&mut self, col: usize, cell: PendingCell) {
        if let Some(slot) = self.writer.pending.get_mut(col) {
            *slot = cell;
        }
    }

    /// Write the row into the open partition.
    pub fn append(self) -> Result<()> {
        self.writer.append_pending()
    }

    /// Discard the row.
    pub fn cancel(self) {}
}

/// Row count of a partition directory, derived from the timestamp column.
pub fn partition_row_count(dir: &Path, ts_column: &str) -> Result<u64> {
    let path = dir.join(format!("{ts_column}{DATA_FILE_SUFFIX}"));
    let len = fs::metadata(&path)?.len();
    Ok(len / 8)
}
