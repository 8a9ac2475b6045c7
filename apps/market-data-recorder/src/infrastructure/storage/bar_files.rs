//! Per-symbol bar files.
//!
//! Each series is rendered to CSV in memory, written to `<SYMBOL>.csv.tmp`
//! in the output directory, synced, then renamed over `<SYMBOL>.csv`. An
//! interrupted run leaves either the previous file or the new one, never a
//! half-written file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tokio::io::AsyncWriteExt;

use crate::application::ports::{BarSink, SinkError};
use crate::domain::history::{Bar, BarSeries};

/// Column layout of a bar file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarLayout {
    /// `time, open, high, low, close, trade_count, volume, vwap`
    #[default]
    Full,
    /// `time, open, high, low, close, volume`
    Ohlcv,
}

impl BarLayout {
    /// Header row.
    #[must_use]
    pub const fn header(self) -> &'static [&'static str] {
        match self {
            Self::Full => &[
                "time",
                "open",
                "high",
                "low",
                "close",
                "trade_count",
                "volume",
                "vwap",
            ],
            Self::Ohlcv => &["time", "open", "high", "low", "close", "volume"],
        }
    }

    fn row(self, bar: &Bar) -> Vec<String> {
        let time = bar.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
        match self {
            Self::Full => vec![
                time,
                bar.open.to_string(),
                bar.high.to_string(),
                bar.low.to_string(),
                bar.close.to_string(),
                bar.trade_count.map_or_else(String::new, |n| n.to_string()),
                bar.volume.to_string(),
                bar.vwap.map_or_else(String::new, |v| v.to_string()),
            ],
            Self::Ohlcv => vec![
                time,
                bar.open.to_string(),
                bar.high.to_string(),
                bar.low.to_string(),
                bar.close.to_string(),
                bar.volume.to_string(),
            ],
        }
    }
}

impl FromStr for BarLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "ohlcv" => Ok(Self::Ohlcv),
            other => Err(format!("unknown layout '{other}' (expected full or ohlcv)")),
        }
    }
}

impl fmt::Display for BarLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Ohlcv => "ohlcv",
        })
    }
}

/// Writes one CSV per symbol into a directory.
#[derive(Debug, Clone)]
pub struct CsvBarWriter {
    out_dir: PathBuf,
    layout: BarLayout,
}

impl CsvBarWriter {
    /// Create a writer for `out_dir`. The directory is created on first write.
    #[must_use]
    pub fn new(out_dir: impl Into<PathBuf>, layout: BarLayout) -> Self {
        Self {
            out_dir: out_dir.into(),
            layout,
        }
    }

    /// Output directory.
    #[must_use]
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Final path for `symbol`.
    #[must_use]
    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.out_dir.join(format!("{symbol}.csv"))
    }

    fn render(&self, series: &BarSeries) -> Result<Vec<u8>, SinkError> {
        let encode = |e: csv::Error| SinkError::Encode {
            symbol: series.symbol().to_string(),
            message: e.to_string(),
        };

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(self.layout.header()).map_err(encode)?;
        for bar in series.bars() {
            writer.write_record(self.layout.row(bar)).map_err(encode)?;
        }
        writer.into_inner().map_err(|e| SinkError::Encode {
            symbol: series.symbol().to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl BarSink for CsvBarWriter {
    async fn write_series(&self, series: &BarSeries) -> Result<PathBuf, SinkError> {
        let bytes = self.render(series)?;
        let path = self.path_for(series.symbol());
        let tmp_path = path.with_extension("csv.tmp");
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SinkError::Io { path, source }
        };

        tokio::fs::create_dir_all(&self.out_dir)
            .await
            .map_err(io_err(&self.out_dir))?;

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(io_err(&tmp_path))?;
        file.write_all(&bytes).await.map_err(io_err(&tmp_path))?;
        file.sync_all().await.map_err(io_err(&tmp_path))?;
        drop(file);

        if let Err(source) = tokio::fs::rename(&tmp_path, &path).await {
            if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
                tracing::debug!(
                    path = %tmp_path.display(),
                    error = %e,
                    "Temporary bar file not removed"
                );
            }
            return Err(SinkError::Io { path, source });
        }

        tracing::debug!(
            symbol = %series.symbol(),
            bars = series.len(),
            path = %path.display(),
            "Bar file written"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn series() -> BarSeries {
        let mut series = BarSeries::new("AAPL");
        series
            .extend_page(vec![Bar {
                symbol: "AAPL".to_string(),
                timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 5, 0, 0).unwrap(),
                open: Decimal::new(18715, 2),
                high: Decimal::new(18844, 2),
                low: Decimal::new(183_885, 3),
                close: Decimal::new(18564, 2),
                volume: 82_488_674,
                trade_count: Some(1_009_074),
                vwap: None,
            }])
            .unwrap();
        series
    }

    #[tokio::test]
    async fn writes_full_layout() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CsvBarWriter::new(dir.path(), BarLayout::Full);

        let path = writer.write_series(&series()).await.unwrap();

        assert_eq!(path, dir.path().join("AAPL.csv"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "time,open,high,low,close,trade_count,volume,vwap\n\
             2024-01-02T05:00:00Z,187.15,188.44,183.885,185.64,1009074,82488674,\n"
        );
        assert!(!dir.path().join("AAPL.csv.tmp").exists());
    }

    #[tokio::test]
    async fn writes_ohlcv_layout_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AAPL.csv"), "stale\n").unwrap();
        let writer = CsvBarWriter::new(dir.path(), BarLayout::Ohlcv);

        let path = writer.write_series(&series()).await.unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            contents,
            "time,open,high,low,close,volume\n\
             2024-01-02T05:00:00Z,187.15,188.44,183.885,185.64,82488674\n"
        );
    }

    #[tokio::test]
    async fn creates_missing_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("bars").join("1Day");
        let writer = CsvBarWriter::new(&nested, BarLayout::Full);

        writer.write_series(&series()).await.unwrap();

        assert!(nested.join("AAPL.csv").exists());
    }

    #[tokio::test]
    async fn failed_rename_reports_target_and_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("AAPL.csv");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();
        let writer = CsvBarWriter::new(dir.path(), BarLayout::Full);

        let err = writer.write_series(&series()).await.unwrap_err();

        assert!(matches!(err, SinkError::Io { ref path, .. } if *path == blocker));
        assert!(!dir.path().join("AAPL.csv.tmp").exists());
        assert!(blocker.join("keep").exists());
    }

    #[test]
    fn layout_parses() {
        assert_eq!("OHLCV".parse::<BarLayout>().unwrap(), BarLayout::Ohlcv);
        assert_eq!("full".parse::<BarLayout>().unwrap(), BarLayout::Full);
        assert!("wide".parse::<BarLayout>().is_err());
    }
}
