//! Symbol dictionaries and key remapping.
//!
//! A symbol column stores 4-byte integer keys; the strings live in a
//! per-table dictionary file next to the partitions:
//!
//! ```text
//! {table}/{column}.sym     [u32 len][utf8 bytes] ...   key order = entry order
//! {partition}/{column}.r   [i32] ...                   remap, indexed by old key
//! ```
//!
//! A dictionary never assigns two keys to the same string; key 0 is the first
//! string interned. The null key is `-1` and never enters a dictionary.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use ahash::AHashMap;
use memmap2::MmapMut;

use crate::{Result, StampedeError};

/// File suffix of a dictionary next to its table's partitions.
pub const SYMBOL_FILE_SUFFIX: &str = ".sym";

/// File suffix of a key remap next to a staged column.
pub const REMAP_FILE_SUFFIX: &str = ".r";

/// Key stored for a null symbol value.
pub const NULL_KEY: i32 = -1;

/// Interning dictionary writer for one symbol column.
#[derive(Debug, Default)]
pub struct SymbolMapWriter {
    map: AHashMap<String, i32>,
    names: Vec<String>,
}

impl SymbolMapWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted dictionary, keeping key order.
    pub fn load(path: &Path) -> Result<Self> {
        let names = read_symbol_file(path)?;
        let mut writer = Self::new();
        for name in names {
            writer.resolve_or_insert(&name);
        }
        Ok(writer)
    }

    /// Look up a string, interning it when absent.
    pub fn resolve_or_insert(&mut self, value: &str) -> i32 {
        if let Some(&key) = self.map.get(value) {
            return key;
        }
        let key = self.names.len() as i32;
        self.map.insert(value.to_string(), key);
        self.names.push(value.to_string());
        key
    }

    pub fn resolve(&self, value: &str) -> Option<i32> {
        self.map.get(value).copied()
    }

    pub fn name_of(&self, key: i32) -> Option<&str> {
        usize::try_from(key).ok().and_then(|i| self.names.get(i)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Write the dictionary out, replacing any previous file.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);
        for name in &self.names {
            w.write_all(&(name.len() as u32).to_le_bytes())?;
            w.write_all(name.as_bytes())?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    }
}

/// Read-only view of a persisted dictionary.
#[derive(Debug)]
pub struct SymbolMapReader {
    names: Vec<String>,
}

impl SymbolMapReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { names: read_symbol_file(path)? })
    }

    pub fn name_of(&self, key: i32) -> Option<&str> {
        usize::try_from(key).ok().and_then(|i| self.names.get(i)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Decode a `.sym` file into its strings, key order preserved. A missing file
/// is an empty dictionary (the staging worker saw no value for the column).
pub fn read_symbol_file(path: &Path) -> Result<Vec<String>> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_end(&mut data)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    let mut names = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 4 > data.len() {
            return Err(corrupt(path));
        }
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + len > data.len() {
            return Err(corrupt(path));
        }
        let name = std::str::from_utf8(&data[pos..pos + len]).map_err(|_| corrupt(path))?;
        names.push(name.to_string());
        pos += len;
    }
    Ok(names)
}

/// Write a key remap (old key -> new key) as a packed little-endian i32 array.
pub fn write_remap(path: &Path, remap: &[i32]) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    for &key in remap {
        w.write_all(&key.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

/// Read a key remap written by [`write_remap`].
pub fn read_remap(path: &Path) -> Result<Vec<i32>> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    if data.len() % 4 != 0 {
        return Err(corrupt(path));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Rewrite every 4-byte key of a staged column file in place through the
/// remap. Null keys pass through unchanged; a key outside the remap is
/// corruption.
pub fn rewrite_keys(column_path: &Path, remap: &[i32]) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(column_path)?;
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        return Ok(());
    }
    if len % 4 != 0 {
        return Err(corrupt(column_path));
    }
    let mut mmap = unsafe { MmapMut::map_mut(&file)? };
    for cell in mmap.chunks_exact_mut(4) {
        let old = i32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]);
        if old == NULL_KEY {
            continue;
        }
        let new = usize::try_from(old)
            .ok()
            .and_then(|i| remap.get(i).copied())
            .ok_or_else(|| corrupt(column_path))?;
        cell.copy_from_slice(&new.to_le_bytes());
    }
    mmap.flush()?;
    Ok(())
}

fn corrupt(path: &Path) -> StampedeError {
    StampedeError::Table(format!("corrupt symbol data in {}", path.display()))
}
