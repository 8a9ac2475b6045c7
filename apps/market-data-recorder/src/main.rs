//! Market Data Recorder Binary
//!
//! # Usage
//!
//! ```bash
//! # Daily bars for the last year, one CSV per symbol
//! market-data-recorder backfill AAPL MSFT --out data/bars
//!
//! # Quotes and trades until Ctrl+C
//! market-data-recorder capture AAPL MSFT --out data/capture
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `ALPACA_KEY`: Alpaca API key
//! - `ALPACA_SECRET`: Alpaca API secret
//!
//! ## Optional
//! - `RECORDER_ENV`: PAPER | LIVE (default: PAPER)
//! - `ALPACA_FEED`: Market data feed - "sip" | "iex" (default: iex)
//! - `ALPACA_DATA_URL`: REST base URL (default: <https://data.alpaca.markets>)
//! - `RECORDER_REQUESTS_PER_MINUTE`: Backfill request ceiling (default: 200)
//! - `RECORDER_PAGE_SIZE`: Bars per page, 1 to 10000 (default: 1000)
//! - `RECORDER_SHUTDOWN_TIMEOUT_SECS`: Whole-shutdown bound (default: 10)
//! - `RECORDER_METRICS_PORT`: Prometheus port, 0 disables (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use market_data_recorder::infrastructure::storage::{normalize_symbols, read_symbols_file};
use market_data_recorder::infrastructure::telemetry;
use market_data_recorder::{
    Adjustment, AlpacaBarsClient, AppendLog, BackfillJob, BackfillService, BarLayout, CaptureLog,
    CaptureReport, CaptureSupervisor, CsvBarWriter, EventKind, MarketDataSource, RecorderConfig,
    RequestPacer, StreamSource, Symbol, Timeframe, TradeUpdatesSource, init_metrics,
};

/// How often the capture loop checks whether every stream has ended.
const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Command Line
// =============================================================================

#[derive(Parser)]
#[command(name = "market-data-recorder", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch historical bars into one CSV per symbol
    Backfill(BackfillArgs),
    /// Record live quotes, trades and trade updates until stopped
    Capture(CaptureArgs),
}

#[derive(Args)]
struct BackfillArgs {
    /// Symbols to fetch
    symbols: Vec<String>,

    /// CSV file with a `ticker` column
    #[arg(long)]
    symbols_file: Option<PathBuf>,

    /// First day (YYYY-MM-DD, default: one year ago)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day, inclusive (YYYY-MM-DD, default: today)
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Bar interval (e.g. 1Day, 15Min, 1Hour)
    #[arg(long, default_value = "1Day")]
    timeframe: Timeframe,

    /// Output directory
    #[arg(long, default_value = "data/bars")]
    out: PathBuf,

    /// Column layout: full | ohlcv
    #[arg(long, default_value = "full")]
    layout: BarLayout,

    /// Request ceiling (overrides RECORDER_REQUESTS_PER_MINUTE)
    #[arg(long)]
    requests_per_minute: Option<u32>,

    /// Bars per page, 1 to 10000 (overrides RECORDER_PAGE_SIZE)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=10_000))]
    page_size: Option<u32>,

    /// Corporate action adjustment: raw | split | dividend | all
    #[arg(long, default_value = "all")]
    adjustment: Adjustment,
}

#[derive(Args)]
struct CaptureArgs {
    /// Symbols to subscribe
    symbols: Vec<String>,

    /// CSV file with a `ticker` column
    #[arg(long)]
    symbols_file: Option<PathBuf>,

    /// Record quotes
    #[arg(long)]
    quotes: bool,

    /// Record trades
    #[arg(long)]
    trades: bool,

    /// Record account trade updates
    #[arg(long)]
    trade_updates: bool,

    /// Output directory
    #[arg(long, default_value = "data/capture")]
    out: PathBuf,

    /// Shutdown bound in seconds (overrides RECORDER_SHUTDOWN_TIMEOUT_SECS)
    #[arg(long)]
    shutdown_timeout: Option<u64>,
}

impl CaptureArgs {
    /// Selected kinds; quotes and trades when no flag is given.
    fn kinds(&self) -> Vec<EventKind> {
        if !(self.quotes || self.trades || self.trade_updates) {
            return vec![EventKind::Quotes, EventKind::Trades];
        }
        [
            (self.quotes, EventKind::Quotes),
            (self.trades, EventKind::Trades),
            (self.trade_updates, EventKind::TradeUpdates),
        ]
        .into_iter()
        .filter_map(|(selected, kind)| selected.then_some(kind))
        .collect()
    }
}

// =============================================================================
// Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();
    let cli = Cli::parse();

    let telemetry_guard = telemetry::init();

    let config = RecorderConfig::from_env()?;
    log_config(&config, telemetry_guard.is_exporting());

    if let Some(addr) = init_metrics(config.metrics_port)? {
        tracing::info!(addr = %addr, "Prometheus metrics listening");
    }

    match cli.command {
        Command::Backfill(args) => backfill(config, args).await,
        Command::Capture(args) => capture(config, args).await,
    }
}

async fn backfill(mut config: RecorderConfig, args: BackfillArgs) -> anyhow::Result<ExitCode> {
    if let Some(rpm) = args.requests_per_minute {
        config.backfill.requests_per_minute = rpm;
    }
    if let Some(page_size) = args.page_size {
        config.backfill.page_size = page_size;
    }
    config.validate()?;

    let symbols = collect_symbols(&args.symbols, args.symbols_file.as_deref())?;
    if symbols.is_empty() {
        bail!("no symbols given (pass symbols or --symbols-file)");
    }

    let today = Utc::now().date_naive();
    let end_day = args.end.unwrap_or(today);
    let start_day = args
        .start
        .or_else(|| end_day.checked_sub_days(Days::new(365)))
        .unwrap_or(end_day);
    let start = start_of_day(start_day);
    let end = end_of_day(end_day).min(Utc::now());
    if start > end {
        bail!("start {start_day} is after end {end_day}");
    }

    let provider = Arc::new(
        AlpacaBarsClient::new(
            config.data_url.clone(),
            config.credentials.clone(),
            config.feed,
            config.backfill.http_timeout,
        )
        .context("failed to build HTTP client")?,
    );
    let sink = Arc::new(CsvBarWriter::new(&args.out, args.layout));
    let pacer = Arc::new(RequestPacer::per_minute(config.backfill.requests_per_minute));
    let service = BackfillService::new(provider, sink, pacer, config.backfill.backfill_config());

    let job = BackfillJob {
        symbols,
        timeframe: args.timeframe,
        start,
        end,
        adjustment: args.adjustment,
    };

    tracing::info!(
        symbols = job.symbols.len(),
        timeframe = %job.timeframe,
        start = %job.start,
        end = %job.end,
        out = %args.out.display(),
        requests_per_minute = config.backfill.requests_per_minute,
        "Backfill started"
    );

    let report = service.run(&job).await;

    println!("{report}");
    for (symbol, error) in report.failures() {
        println!("  failed {symbol}: {error}");
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn capture(mut config: RecorderConfig, args: CaptureArgs) -> anyhow::Result<ExitCode> {
    if let Some(secs) = args.shutdown_timeout {
        config.capture.shutdown_timeout = Duration::from_secs(secs);
    }

    let kinds = args.kinds();
    let symbols = collect_symbols(&args.symbols, args.symbols_file.as_deref())?;
    let needs_symbols = kinds.iter().any(|k| *k != EventKind::TradeUpdates);
    if needs_symbols && symbols.is_empty() {
        bail!("quotes and trades need symbols (pass symbols or --symbols-file)");
    }

    let mut sources: Vec<Arc<dyn StreamSource>> = Vec::new();
    if needs_symbols {
        sources.push(Arc::new(MarketDataSource::from_config(&config)));
    }
    if kinds.contains(&EventKind::TradeUpdates) {
        sources.push(Arc::new(TradeUpdatesSource::from_config(&config)));
    }

    let mut logs: Vec<Box<dyn CaptureLog>> = Vec::with_capacity(kinds.len());
    for kind in &kinds {
        let log = AppendLog::open(&args.out, *kind, config.capture.flush_every)
            .await
            .with_context(|| format!("failed to open {kind} log in {}", args.out.display()))?;
        logs.push(Box::new(log));
    }

    let supervisor = match CaptureSupervisor::start_subscribed(
        config.capture.capture_config(),
        sources,
        logs,
        &kinds,
        &symbols,
    )
    .await
    {
        Ok(supervisor) => supervisor,
        Err(e) => {
            print_report(&e.report);
            return Err(e.into());
        }
    };

    tracing::info!(
        kinds = ?kinds,
        symbols = symbols.len(),
        out = %args.out.display(),
        "Capture running, Ctrl+C to stop"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown.clone()));

    let mut poll = tokio::time::interval(STREAM_POLL_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = poll.tick() => {
                if supervisor.all_streams_terminal() {
                    tracing::warn!("Every stream has stopped, shutting down");
                    break;
                }
            }
        }
    }

    let report = supervisor.shutdown().await;
    print_report(&report);

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn print_report(report: &CaptureReport) {
    println!("{report}");
    for stream in &report.streams {
        if let Some(error) = &stream.error {
            println!("  {} {}: {error}", stream.name, stream.state);
        }
    }
}

fn collect_symbols(args: &[String], file: Option<&Path>) -> anyhow::Result<Vec<Symbol>> {
    let mut symbols = args.to_vec();
    if let Some(path) = file {
        let from_file = read_symbols_file(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        symbols.extend(from_file);
    }
    Ok(normalize_symbols(symbols))
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.succ_opt().map_or_else(
        || day.and_time(NaiveTime::MIN).and_utc(),
        |next| start_of_day(next) - chrono::Duration::seconds(1),
    )
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RecorderConfig, exporting_spans: bool) {
    tracing::info!(
        environment = config.environment.as_str(),
        feed = config.feed.as_str(),
        data_url = %config.data_url,
        metrics_port = config.metrics_port,
        exporting_spans,
        "Configuration loaded"
    );
    tracing::debug!(
        stock_stream_url = %config.stock_stream_url(),
        trade_updates_url = %config.trade_updates_url(),
        "WebSocket endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
