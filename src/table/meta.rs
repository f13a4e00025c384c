//! Table metadata persistence.
//!
//! A table root holds a single `_meta` file with the schema, the designated
//! timestamp column, the partition unit and the keys of attached partitions.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::partition::PartitionBy;
use crate::text::adapters::ColumnType;
use crate::{Result, StampedeError};

pub const META_FILE_NAME: &str = "_meta";

const META_VERSION: u32 = 1;

/// Schema entry for one column. Column identity is the ordinal plus the name;
/// nothing about a column is derived from randomness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    /// The column receives a key index when its partition is attached.
    pub indexed: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type, indexed: false }
    }

    pub fn indexed(mut self, indexed: bool) -> Self {
        self.indexed = indexed;
        self
    }
}

/// Persistent description of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub version: u32,
    pub table_name: String,
    pub partition_by: PartitionBy,
    pub timestamp_index: usize,
    pub columns: Vec<ColumnDef>,
    /// Keys of attached partitions, ascending.
    pub partitions: Vec<i64>,
}

impl TableMeta {
    pub fn new(
        table_name: impl Into<String>,
        partition_by: PartitionBy,
        timestamp_index: usize,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            version: META_VERSION,
            table_name: table_name.into(),
            partition_by,
            timestamp_index,
            columns,
            partitions: Vec::new(),
        }
    }

    pub fn exists(table_root: &Path) -> bool {
        table_root.join(META_FILE_NAME).exists()
    }

    pub fn load(table_root: &Path) -> Result<Self> {
        let path = table_root.join(META_FILE_NAME);
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        let meta: TableMeta = bincode::deserialize(&data)
            .map_err(|e| StampedeError::Serialization(e.to_string()))?;
        if meta.version != META_VERSION {
            return Err(StampedeError::Table(format!(
                "unsupported metadata version {} in {}",
                meta.version,
                path.display()
            )));
        }
        Ok(meta)
    }

    pub fn save(&self, table_root: &Path) -> Result<()> {
        let data = bincode::serialize(self).map_err(|e| StampedeError::Serialization(e.to_string()))?;
        let path = table_root.join(META_FILE_NAME);
        let mut file = File::create(path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Ordinals of symbol columns, ascending.
    pub fn symbol_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.column_type.is_symbol())
            .map(|(i, _)| i)
            .collect()
    }

    /// Register an attached partition, keeping the list sorted and unique.
    pub fn add_partition(&mut self, key: i64) {
        if let Err(pos) = self.partitions.binary_search(&key) {
            self.partitions.insert(pos, key);
        }
    }

    pub fn partition_dir(&self, table_root: &Path, key: i64) -> PathBuf {
        table_root.join(self.partition_by.dir_name(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_meta() -> TableMeta {
        TableMeta::new(
            "trades",
            PartitionBy::Day,
            0,
            vec![
                ColumnDef::new("ts", ColumnType::Timestamp),
                ColumnDef::new("price", ColumnType::Double),
                ColumnDef::new("venue", ColumnType::Symbol).indexed(true),
            ],
        )
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let meta = sample_meta();
        meta.save(dir.path()).unwrap();
        assert!(TableMeta::exists(dir.path()));
        let loaded = TableMeta::load(dir.path()).unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn partition_registry_stays_sorted() {
        let mut meta = sample_meta();
        meta.add_partition(200);
        meta.add_partition(100);
        meta.add_partition(200);
        meta.add_partition(300);
        assert_eq!(meta.partitions, vec![100, 200, 300]);
    }

    #[test]
    fn symbol_columns_and_lookup() {
        let meta = sample_meta();
        assert_eq!(meta.symbol_columns(), vec![2]);
        assert_eq!(meta.column_index("VENUE"), Some(2));
        assert_eq!(meta.column_index("nope"), None);
    }
}
