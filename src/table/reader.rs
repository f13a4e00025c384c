//! Read-side companion of the table writer.
//!
//! Covers what verification needs: partition row counts and typed column
//! reads with symbol resolution. Whole-column reads are fine here; the
//! ingest pipeline itself never goes through this path.

use std::fs;
use std::path::PathBuf;

use crate::table::meta::TableMeta;
use crate::table::symbol::{SymbolMapReader, NULL_KEY, SYMBOL_FILE_SUFFIX};
use crate::table::writer::{DATA_FILE_SUFFIX, NULL_LONG, OFFSET_FILE_SUFFIX};
use crate::text::adapters::ColumnType;
use crate::{Result, StampedeError};

/// Read-only view of a table.
pub struct TableReader {
    root: PathBuf,
    meta: TableMeta,
    dicts: Vec<Option<SymbolMapReader>>,
}

impl TableReader {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = TableMeta::load(&root)?;
        let mut dicts = Vec::with_capacity(meta.columns.len());
        for col in &meta.columns {
            if col.column_type.is_symbol() {
                let path = root.join(format!("{}{}", col.name, SYMBOL_FILE_SUFFIX));
                dicts.push(Some(SymbolMapReader::open(&path)?));
            } else {
                dicts.push(None);
            }
        }
        Ok(Self { root, meta, dicts })
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn partitions(&self) -> &[i64] {
        &self.meta.partitions
    }

    pub fn partition_row_count(&self, key: i64) -> Result<u64> {
        let ts = &self.meta.columns[self.meta.timestamp_index].name;
        let path = self.partition_dir(key).join(format!("{ts}{DATA_FILE_SUFFIX}"));
        Ok(fs::metadata(path)?.len() / 8)
    }

    pub fn row_count(&self) -> Result<u64> {
        let mut total = 0;
        for &key in &self.meta.partitions {
            total += self.partition_row_count(key)?;
        }
        Ok(total)
    }

    pub fn read_longs(&self, key: i64, col: usize) -> Result<Vec<i64>> {
        let data = self.column_data(key, col, &[ColumnType::Long, ColumnType::Timestamp])?;
        Ok(data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect())
    }

    pub fn read_doubles(&self, key: i64, col: usize) -> Result<Vec<f64>> {
        let data = self.column_data(key, col, &[ColumnType::Double])?;
        Ok(data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect())
    }

    pub fn read_bools(&self, key: i64, col: usize) -> Result<Vec<bool>> {
        let data = self.column_data(key, col, &[ColumnType::Boolean])?;
        Ok(data.iter().map(|&b| b != 0).collect())
    }

    pub fn read_keys(&self, key: i64, col: usize) -> Result<Vec<i32>> {
        let data = self.column_data(key, col, &[ColumnType::Symbol])?;
        Ok(data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect())
    }

    /// Symbol column resolved through the table dictionary; `None` is null.
    pub fn read_symbols(&self, key: i64, col: usize) -> Result<Vec<Option<String>>> {
        let keys = self.read_keys(key, col)?;
        let dict = self.dicts[col]
            .as_ref()
            .ok_or_else(|| StampedeError::Table(format!("column {col} is not a symbol")))?;
        keys.into_iter()
            .map(|k| {
                if k == NULL_KEY {
                    return Ok(None);
                }
                dict.name_of(k)
                    .map(|s| Some(s.to_string()))
                    .ok_or_else(|| StampedeError::Table(format!("dangling symbol key {k}")))
            })
            .collect()
    }

    /// String column; zero-length values read as `None`.
    pub fn read_strings(&self, key: i64, col: usize) -> Result<Vec<Option<String>>> {
        let def = self.column_def(col, &[ColumnType::String])?;
        let dir = self.partition_dir(key);
        let data = fs::read(dir.join(format!("{}{}", def, DATA_FILE_SUFFIX)))?;
        let offsets = fs::read(dir.join(format!("{}{}", def, OFFSET_FILE_SUFFIX)))?;

        let mut out = Vec::new();
        let mut prev = 0i64;
        for c in offsets.chunks_exact(8) {
            let end = i64::from_le_bytes(c.try_into().unwrap_or_default());
            if end < prev || end as usize > data.len() {
                return Err(StampedeError::Table("corrupt string offsets".into()));
            }
            if end == prev {
                out.push(None);
            } else {
                let s = String::from_utf8_lossy(&data[prev as usize..end as usize]).into_owned();
                out.push(Some(s));
            }
            prev = end;
        }
        Ok(out)
    }

    /// Non-null longs of one column across every partition, in partition and
    /// row order.
    pub fn read_longs_all(&self, col: usize) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        for &key in &self.meta.partitions {
            out.extend(self.read_longs(key, col)?.into_iter().filter(|&v| v != NULL_LONG));
        }
        Ok(out)
    }

    fn partition_dir(&self, key: i64) -> PathBuf {
        self.meta.partition_dir(&self.root, key)
    }

    fn column_def(&self, col: usize, expect: &[ColumnType]) -> Result<&str> {
        let def = self
            .meta
            .columns
            .get(col)
            .ok_or_else(|| StampedeError::Table(format!("no column {col}")))?;
        if !expect.contains(&def.column_type) {
            return Err(StampedeError::Table(format!(
                "column {} is {}, expected one of {:?}",
                def.name, def.column_type, expect
            )));
        }
        Ok(&def.name)
    }

    fn column_data(&self, key: i64, col: usize, expect: &[ColumnType]) -> Result<Vec<u8>> {
        let name = self.column_def(col, expect)?;
        let path = self.partition_dir(key).join(format!("{name}{DATA_FILE_SUFFIX}"));
        Ok(fs::read(path)?)
    }
}
