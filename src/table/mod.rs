//! Columnar table storage: metadata, symbol dictionaries, the partitioned
//! writer used by the load phase and the reader used for verification.

pub mod meta;
pub mod reader;
pub mod symbol;
pub mod writer;

pub use meta::{ColumnDef, TableMeta, META_FILE_NAME};
pub use reader::TableReader;
pub use symbol::{SymbolMapReader, SymbolMapWriter};
pub use writer::{Row, SyncMode, TableWriter};
