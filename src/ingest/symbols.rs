//! Phase 4: symbol dictionary reconciliation.
//!
//! Every staging table interned its symbol values independently, so the same
//! string can hold different keys across workers. For each symbol column the
//! merger folds the staged dictionaries into the final table's dictionary in
//! worker index order (insertion order within a worker) and persists the
//! resulting old-key to new-key remap next to the column in every staged
//! partition. A second pass rewrites each staged 4-byte key file in place
//! through its remap.
//!
//! Keys are deterministic for a given run but carry no cross-run stability;
//! the contract is only that post-rewrite keys agree with the final
//! dictionary.

use std::path::{Path, PathBuf};

use crate::table::meta::TableMeta;
use crate::table::symbol::{self, REMAP_FILE_SUFFIX, SYMBOL_FILE_SUFFIX};
use crate::table::writer::{TableWriter, DATA_FILE_SUFFIX};
use crate::Result;

/// Root directory of one staging table.
pub fn staging_table_root(import_root: &Path, table_name: &str, worker: usize) -> PathBuf {
    import_root.join(format!("{table_name}__{worker}"))
}

/// Merge one symbol column's staged dictionaries into the final table and
/// write the remap into every staged partition of every staging table.
pub fn merge_symbol_column(
    final_writer: &TableWriter,
    import_root: &Path,
    table_name: &str,
    staging_count: usize,
    col: usize,
    column_name: &str,
) -> Result<()> {
    for worker in 0..staging_count {
        let staging_root = staging_table_root(import_root, table_name, worker);
        if !staging_root.is_dir() {
            continue;
        }
        let names =
            symbol::read_symbol_file(&staging_root.join(format!("{column_name}{SYMBOL_FILE_SUFFIX}")))?;
        let remap = final_writer.merge_into_dictionary(col, &names)?;

        let staging_meta = TableMeta::load(&staging_root)?;
        for &key in &staging_meta.partitions {
            let dir = staging_meta.partition_dir(&staging_root, key);
            symbol::write_remap(&dir.join(format!("{column_name}{REMAP_FILE_SUFFIX}")), &remap)?;
        }
    }
    Ok(())
}

/// Rewrite one staged partition's key column through its persisted remap.
pub fn update_symbol_keys(partition_dir: &Path, column_name: &str) -> Result<()> {
    let remap = symbol::read_remap(&partition_dir.join(format!("{column_name}{REMAP_FILE_SUFFIX}")))?;
    symbol::rewrite_keys(
        &partition_dir.join(format!("{column_name}{DATA_FILE_SUFFIX}")),
        &remap,
    )
}
