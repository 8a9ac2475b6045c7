//! Symbol lists.

use std::collections::BTreeSet;
use std::path::Path;

use crate::domain::Symbol;

/// Failure reading a symbols file.
#[derive(Debug, thiserror::Error)]
pub enum SymbolsFileError {
    /// File could not be read or parsed as CSV.
    #[error("failed to read symbols file: {0}")]
    Csv(#[from] csv::Error),

    /// Header row has no `ticker` column.
    #[error("symbols file has no 'ticker' column")]
    MissingTickerColumn,
}

/// Upper-case, trim, de-duplicate and sort.
#[must_use]
pub fn normalize_symbols<I, S>(symbols: I) -> Vec<Symbol>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    symbols
        .into_iter()
        .map(|s| s.as_ref().trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Read the `ticker` column of a CSV file. The column name is matched
/// case-insensitively; other columns are ignored.
///
/// # Errors
///
/// Returns an error if the file cannot be read or has no `ticker` column.
pub fn read_symbols_file(path: &Path) -> Result<Vec<Symbol>, SymbolsFileError> {
    let mut reader = csv::Reader::from_path(path)?;
    let column = reader
        .headers()?
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case("ticker"))
        .ok_or(SymbolsFileError::MissingTickerColumn)?;

    let mut tickers = Vec::new();
    for record in reader.records() {
        if let Some(ticker) = record?.get(column) {
            tickers.push(ticker.to_string());
        }
    }
    Ok(normalize_symbols(tickers))
}
