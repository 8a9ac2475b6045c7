//! Append-only capture log.
//!
//! One CSV file per event kind, opened once in append mode. Every record is
//! rendered to a complete line in memory and queued; queued lines go to the
//! file in a single write every `flush_every` records or on `flush`, and
//! `close` also syncs. A file left with a partial trailing line by a crash
//! is truncated back to its last complete record on open.
//!
//! A write that fails partway is cut back to the last complete line and the
//! queued records are dropped, so the file never holds a torn line mid-file.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::application::ports::{CaptureLog, LogError};
use crate::domain::streaming::{CaptureRecord, EventKind, Execution, Quote, Trade};

const TAIL_CHUNK: usize = 64 * 1024;

// =============================================================================
// Row Layouts
// =============================================================================

const QUOTE_COLUMNS: &[&str] = &[
    "symbol",
    "timestamp",
    "ask_exchange",
    "ask_price",
    "ask_size",
    "bid_exchange",
    "bid_price",
    "bid_size",
    "conditions",
    "tape",
    "received_at",
];

const TRADE_COLUMNS: &[&str] = &[
    "symbol",
    "timestamp",
    "exchange",
    "price",
    "size",
    "id",
    "conditions",
    "tape",
    "received_at",
];

const EXECUTION_COLUMNS: &[&str] = &[
    "received_at",
    "event",
    "timestamp",
    "order_id",
    "client_order_id",
    "symbol",
    "side",
    "order_type",
    "price",
    "qty",
    "filled_qty",
    "filled_avg_price",
    "position_qty",
    "status",
];

/// Header row for the log of `kind`.
#[must_use]
pub const fn columns(kind: EventKind) -> &'static [&'static str] {
    match kind {
        EventKind::Quotes => QUOTE_COLUMNS,
        EventKind::Trades => TRADE_COLUMNS,
        EventKind::TradeUpdates => EXECUTION_COLUMNS,
    }
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn optional(value: Option<Decimal>) -> String {
    value.map_or_else(String::new, |v| v.to_string())
}

fn quote_row(q: &Quote) -> Vec<String> {
    vec![
        q.symbol.clone(),
        timestamp(q.timestamp),
        q.ask_exchange.clone(),
        q.ask_price.to_string(),
        q.ask_size.to_string(),
        q.bid_exchange.clone(),
        q.bid_price.to_string(),
        q.bid_size.to_string(),
        q.conditions.join(" "),
        q.tape.clone(),
        timestamp(q.received_at),
    ]
}

fn trade_row(t: &Trade) -> Vec<String> {
    vec![
        t.symbol.clone(),
        timestamp(t.timestamp),
        t.exchange.clone(),
        t.price.to_string(),
        t.size.to_string(),
        t.trade_id.to_string(),
        t.conditions.join(" "),
        t.tape.clone(),
        timestamp(t.received_at),
    ]
}

fn execution_row(e: &Execution) -> Vec<String> {
    vec![
        timestamp(e.received_at),
        e.event.clone(),
        e.timestamp.map_or_else(String::new, timestamp),
        e.order_id.clone(),
        e.client_order_id.clone(),
        e.symbol.clone(),
        e.side.clone(),
        e.order_type.clone(),
        optional(e.price),
        optional(e.qty),
        e.filled_qty.to_string(),
        optional(e.filled_avg_price),
        optional(e.position_qty),
        e.status.clone(),
    ]
}

/// Render one record as a complete CSV line, newline included.
///
/// # Errors
///
/// Returns `Encode` if the CSV writer fails.
pub fn render_line(record: &CaptureRecord) -> Result<Vec<u8>, LogError> {
    let fields = match record {
        CaptureRecord::Quote(q) => quote_row(q),
        CaptureRecord::Trade(t) => trade_row(t),
        CaptureRecord::Execution(e) => execution_row(e),
    };
    encode_row(fields)
}

fn encode_row<I, T>(fields: I) -> Result<Vec<u8>, LogError>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(fields)
        .map_err(|e| LogError::Encode(e.to_string()))?;
    writer
        .into_inner()
        .map_err(|e| LogError::Encode(e.to_string()))
}

// =============================================================================
// Append Log
// =============================================================================

/// Append-only CSV log for one event kind.
#[derive(Debug)]
pub struct AppendLog<F = File> {
    kind: EventKind,
    path: PathBuf,
    file: F,
    /// Bytes known to end on a complete line.
    committed: u64,
    /// A failed write left bytes past `committed` that are not yet cut.
    torn: bool,
    pending: Vec<u8>,
    pending_records: usize,
    flush_every: usize,
}

/// File operations the log needs beyond writing.
#[async_trait]
pub trait LogFile: AsyncWrite + Unpin + Send {
    /// Cut the file to `len` bytes.
    async fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Sync contents to disk.
    async fn sync(&mut self) -> io::Result<()>;
}

#[async_trait]
impl LogFile for File {
    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.sync_all().await
    }
}

impl AppendLog {
    /// Open (or create) `<dir>/<kind file name>`, repairing a torn tail
    /// and writing the header if the file is empty.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory or file cannot be prepared.
    pub async fn open(dir: &Path, kind: EventKind, flush_every: usize) -> Result<Self, LogError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(kind.log_file_name());

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;

        let length = file.metadata().await?.len();
        let kept = complete_prefix_len(&mut file, length).await?;
        if kept < length {
            file.set_len(kept).await?;
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = length - kept,
                "Truncated partial trailing record"
            );
        }

        let mut committed = kept;
        if kept == 0 {
            let header = encode_row(columns(kind))?;
            file.write_all(&header).await?;
            file.flush().await?;
            committed = header.len() as u64;
        }

        tracing::info!(kind = %kind, path = %path.display(), "Capture log opened");
        Ok(Self::from_parts(kind, path, file, committed, flush_every))
    }
}

impl<F: LogFile> AppendLog<F> {
    /// Wrap an open file whose first `committed` bytes end on a line boundary.
    #[must_use]
    pub fn from_parts(
        kind: EventKind,
        path: PathBuf,
        file: F,
        committed: u64,
        flush_every: usize,
    ) -> Self {
        Self {
            kind,
            path,
            file,
            committed,
            torn: false,
            pending: Vec::new(),
            pending_records: 0,
            flush_every: flush_every.max(1),
        }
    }

    /// File path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records queued but not yet written.
    #[must_use]
    pub const fn pending_records(&self) -> usize {
        self.pending_records
    }

    /// Write queued lines. On failure they are dropped, never retried.
    async fn write_pending(&mut self) -> Result<(), LogError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.pending_records);
        let result = self.commit_pending().await;
        self.pending.clear();

        result.map_err(|source| {
            tracing::warn!(
                path = %self.path.display(),
                dropped = records,
                error = %source,
                "Capture log write failed, queued records dropped"
            );
            LogError::WriteFailed { records, source }
        })
    }

    async fn commit_pending(&mut self) -> io::Result<()> {
        if self.torn {
            self.file.truncate(self.committed).await?;
            self.torn = false;
        }
        match write_and_flush(&mut self.file, &self.pending).await {
            Ok(()) => {
                self.committed += self.pending.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.torn = true;
                match self.file.truncate(self.committed).await {
                    Ok(()) => self.torn = false,
                    Err(cut) => tracing::error!(
                        path = %self.path.display(),
                        error = %cut,
                        "Failed to cut capture log back to its last complete line"
                    ),
                }
                Err(e)
            }
        }
    }
}

async fn write_and_flush<W: AsyncWrite + Unpin>(file: &mut W, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

#[async_trait]
impl<F: LogFile> CaptureLog for AppendLog<F> {
    fn kind(&self) -> EventKind {
        self.kind
    }

    async fn append(&mut self, record: &CaptureRecord) -> Result<(), LogError> {
        if record.kind() != self.kind {
            return Err(LogError::WrongKind {
                expected: self.kind,
                found: record.kind(),
            });
        }
        let line = render_line(record)?;
        self.pending.extend_from_slice(&line);
        self.pending_records += 1;

        if self.pending_records >= self.flush_every {
            self.write_pending().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), LogError> {
        self.write_pending().await
    }

    async fn close(&mut self) -> Result<(), LogError> {
        self.write_pending().await?;
        self.file.sync().await?;
        Ok(())
    }
}

/// Length of the file up to and including its last newline.
async fn complete_prefix_len(file: &mut File, length: u64) -> std::io::Result<u64> {
    let mut buf = vec![0u8; TAIL_CHUNK];
    let mut end = length;

    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK as u64);
        let chunk = &mut buf[..usize::try_from(end - start).unwrap_or(TAIL_CHUNK)];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(chunk).await?;

        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}
