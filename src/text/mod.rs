//! Delimited-text handling: lexing, delimiter detection, structure analysis
//! and per-column type adapters.

pub mod adapters;
pub mod delimiter;
pub mod lexer;
pub mod schema;

pub use adapters::{ColumnType, TimestampAdapter, TypeAdapter};
pub use delimiter::detect_delimiter;
pub use lexer::{CsvLexer, RecordSink, SinkFlow};
pub use schema::{DetectedColumn, DetectedSchema, SchemaDetector};
