//! File Storage Adapters
//!
//! - [`CsvBarWriter`]: one write-once CSV per backfilled symbol
//! - [`AppendLog`]: append-only CSV log per captured event kind
//! - symbol lists read from a CSV `ticker` column

mod append_log;
mod bar_files;
mod symbols;

pub use append_log::{AppendLog, LogFile, columns, render_line};
pub use bar_files::{BarLayout, CsvBarWriter};
pub use symbols::{SymbolsFileError, normalize_symbols, read_symbols_file};
