//! Historical Backfill
//!
//! For each symbol, follow the provider's continuation cursor page by page,
//! accumulate the bars into one ordered series, and hand the completed
//! series to the sink. Every request, including retries, first passes
//! through the shared [`RequestPacer`].
//!
//! # Failure handling
//!
//! | Provider result      | Action                                              |
//! |----------------------|-----------------------------------------------------|
//! | empty, no cursor     | `NoData` outcome, no file written                   |
//! | `Malformed`          | backoff and retry, then `MalformedResponse`         |
//! | `Transport`          | backoff and retry, then `Transport`                 |
//! | `RateLimited`        | wait `Retry-After` (or backoff), separate budget    |
//! | `Rejected`           | symbol fails immediately                            |
//!
//! A failing symbol never aborts the run.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::Instrument;

use super::pacing::RequestPacer;
use crate::application::ports::{
    BarSink, BarsPage, BarsProvider, BarsRequest, ProviderError, SinkError,
};
use crate::domain::Symbol;
use crate::domain::history::{Adjustment, BarSeries, Timeframe};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Backfill tuning.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Bars requested per page.
    pub page_size: u32,
    /// Retries per page for malformed responses and transport errors.
    pub max_retries: u32,
    /// Retries per page for rate-limit responses.
    pub rate_limit_retries: u32,
    /// First retry delay.
    pub initial_backoff: Duration,
    /// Retry delay ceiling.
    pub max_backoff: Duration,
    /// Delay growth factor.
    pub backoff_multiplier: f64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_retries: 5,
            rate_limit_retries: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// What to fetch.
#[derive(Debug, Clone)]
pub struct BackfillJob {
    /// Symbols, fetched in this order.
    pub symbols: Vec<Symbol>,
    /// Bar interval.
    pub timeframe: Timeframe,
    /// Range start (inclusive).
    pub start: DateTime<Utc>,
    /// Range end (inclusive).
    pub end: DateTime<Utc>,
    /// Price adjustment.
    pub adjustment: Adjustment,
}

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// Why a symbol produced no output.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Provider answered but has no bars for the symbol in range.
    #[error("no data for symbol")]
    NoDataForSymbol,

    /// Responses kept failing shape checks.
    #[error("malformed response after {attempts} attempts: {detail}")]
    MalformedResponse {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        detail: String,
    },

    /// Provider kept throttling.
    #[error("rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded {
        /// Attempts made.
        attempts: u32,
    },

    /// Network failures persisted.
    #[error("transport error after {attempts} attempts: {detail}")]
    Transport {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        detail: String,
    },

    /// Provider refused the request.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// Series could not be written.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Result of backfilling one symbol.
#[derive(Debug)]
pub enum SymbolOutcome {
    /// Series written.
    Fetched {
        /// Bars written.
        bars: usize,
        /// Output location.
        path: PathBuf,
    },
    /// Provider had nothing in range; no output written.
    NoData,
    /// Fetch or write failed.
    Failed(FetchError),
}

impl SymbolOutcome {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fetched { .. } => "fetched",
            Self::NoData => "no_data",
            Self::Failed(_) => "failed",
        }
    }
}

/// Summary of a backfill run.
#[derive(Debug, Default)]
pub struct BackfillReport {
    /// Per-symbol outcomes in fetch order.
    pub outcomes: Vec<(Symbol, SymbolOutcome)>,
    /// Provider requests issued, retries included.
    pub requests: u64,
}

impl BackfillReport {
    /// Symbols written.
    #[must_use]
    pub fn fetched(&self) -> usize {
        self.count(|o| matches!(o, SymbolOutcome::Fetched { .. }))
    }

    /// Symbols with no data.
    #[must_use]
    pub fn no_data(&self) -> usize {
        self.count(|o| matches!(o, SymbolOutcome::NoData))
    }

    /// Symbols that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, SymbolOutcome::Failed(_)))
    }

    /// Total bars written.
    #[must_use]
    pub fn bars_written(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                SymbolOutcome::Fetched { bars, .. } => *bars,
                _ => 0,
            })
            .sum()
    }

    /// Failed symbols with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &FetchError)> {
        self.outcomes.iter().filter_map(|(symbol, o)| match o {
            SymbolOutcome::Failed(e) => Some((symbol.as_str(), e)),
            _ => None,
        })
    }

    /// Whether every symbol was fetched or had no data.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, pred: impl Fn(&SymbolOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

impl fmt::Display for BackfillReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} no_data={} failed={} requests={} bars={}",
            self.fetched(),
            self.no_data(),
            self.failed(),
            self.requests,
            self.bars_written()
        )
    }
}

// =============================================================================
// Retry Backoff
// =============================================================================

/// Deterministic exponential retry delay.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl RetryBackoff {
    /// Start from the configured initial delay.
    #[must_use]
    pub const fn new(config: &BackfillConfig) -> Self {
        Self {
            current: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.backoff_multiplier,
        }
    }

    /// Delay for the next retry; grows until the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }
}

// =============================================================================
// Service
// =============================================================================

/// Runs backfill jobs against a provider and a sink.
pub struct BackfillService<P, S>
where
    P: BarsProvider,
    S: BarSink,
{
    provider: Arc<P>,
    sink: Arc<S>,
    pacer: Arc<RequestPacer>,
    config: BackfillConfig,
    requests: AtomicU64,
}

impl<P, S> BackfillService<P, S>
where
    P: BarsProvider,
    S: BarSink,
{
    /// Create a new `BackfillService`.
    pub const fn new(
        provider: Arc<P>,
        sink: Arc<S>,
        pacer: Arc<RequestPacer>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            provider,
            sink,
            pacer,
            config,
            requests: AtomicU64::new(0),
        }
    }

    /// Backfill every symbol in `job`, isolating failures per symbol.
    pub async fn run(&self, job: &BackfillJob) -> BackfillReport {
        let requests_before = self.requests.load(Ordering::Relaxed);
        let mut outcomes = Vec::with_capacity(job.symbols.len());

        tracing::info!(
            symbols = job.symbols.len(),
            timeframe = %job.timeframe,
            start = %job.start,
            end = %job.end,
            "Starting backfill"
        );

        for symbol in &job.symbols {
            let span = tracing::info_span!("backfill_symbol", symbol = %symbol);
            let outcome = self.backfill_symbol(job, symbol).instrument(span).await;
            metrics::record_symbol_outcome(outcome.as_str());
            outcomes.push((symbol.clone(), outcome));
        }

        let report = BackfillReport {
            outcomes,
            requests: self.requests.load(Ordering::Relaxed) - requests_before,
        };
        tracing::info!(%report, "Backfill finished");
        report
    }

    async fn backfill_symbol(&self, job: &BackfillJob, symbol: &str) -> SymbolOutcome {
        let series = match self.fetch_symbol(job, symbol).await {
            Ok(series) => series,
            Err(FetchError::NoDataForSymbol) => {
                tracing::info!("No data in range, skipping");
                return SymbolOutcome::NoData;
            }
            Err(e) => {
                tracing::error!(error = %e, "Backfill failed");
                return SymbolOutcome::Failed(e);
            }
        };

        match self.sink.write_series(&series).await {
            Ok(path) => {
                tracing::info!(bars = series.len(), path = %path.display(), "Series written");
                metrics::record_bars_written(series.len());
                SymbolOutcome::Fetched {
                    bars: series.len(),
                    path,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to write series");
                SymbolOutcome::Failed(FetchError::Sink(e))
            }
        }
    }

    /// Fetch every page for one symbol.
    ///
    /// # Errors
    ///
    /// `NoDataForSymbol` when the provider returns nothing in range, or the
    /// error that exhausted a page's retries.
    pub async fn fetch_symbol(
        &self,
        job: &BackfillJob,
        symbol: &str,
    ) -> Result<BarSeries, FetchError> {
        let mut series = BarSeries::new(symbol);
        let mut request = BarsRequest {
            symbol: symbol.to_string(),
            timeframe: job.timeframe,
            start: job.start,
            end: job.end,
            limit: self.config.page_size,
            adjustment: job.adjustment,
            page_token: None,
        };
        let mut pages = 0u32;

        loop {
            let page = self
                .fetch_page_with_retry(&request, series.last_timestamp())
                .await?;
            pages += 1;

            for bar in &page.bars {
                if let Err(violation) = bar.validate() {
                    tracing::warn!(timestamp = %bar.timestamp, %violation, "Inconsistent bar kept as delivered");
                }
            }

            series
                .extend_page(page.bars)
                .map_err(|e| FetchError::MalformedResponse {
                    attempts: 1,
                    detail: e.to_string(),
                })?;

            match page.next_page_token {
                Some(cursor) => request = request.next_page(cursor),
                None => break,
            }
        }

        tracing::debug!(pages, bars = series.len(), "Pagination complete");

        if series.is_empty() {
            return Err(FetchError::NoDataForSymbol);
        }
        Ok(series)
    }

    async fn fetch_page_with_retry(
        &self,
        request: &BarsRequest,
        after: Option<DateTime<Utc>>,
    ) -> Result<BarsPage, FetchError> {
        let mut backoff = RetryBackoff::new(&self.config);
        let mut failures = 0u32;
        let mut throttles = 0u32;

        loop {
            self.pacer.acquire().await;
            self.requests.fetch_add(1, Ordering::Relaxed);
            metrics::record_provider_request();

            let result = self
                .provider
                .fetch_page(request)
                .await
                .and_then(|page| check_page(request, after, page));

            let error = match result {
                Ok(page) => return Ok(page),
                Err(e) => e,
            };

            let delay = match error {
                ProviderError::RateLimited { retry_after } => {
                    throttles += 1;
                    if throttles > self.config.rate_limit_retries {
                        return Err(FetchError::RateLimitExceeded {
                            attempts: throttles,
                        });
                    }
                    let delay = retry_after.unwrap_or_else(|| backoff.next_delay());
                    tracing::warn!(
                        attempt = throttles,
                        delay_ms = delay.as_millis(),
                        "Rate limited, retrying"
                    );
                    metrics::record_retry("rate_limited");
                    delay
                }
                ProviderError::Malformed(detail) => {
                    failures += 1;
                    if failures > self.config.max_retries {
                        return Err(FetchError::MalformedResponse {
                            attempts: failures,
                            detail,
                        });
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        attempt = failures,
                        delay_ms = delay.as_millis(),
                        %detail,
                        "Malformed response, retrying"
                    );
                    metrics::record_retry("malformed");
                    delay
                }
                ProviderError::Transport(detail) => {
                    failures += 1;
                    if failures > self.config.max_retries {
                        return Err(FetchError::Transport {
                            attempts: failures,
                            detail,
                        });
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        attempt = failures,
                        delay_ms = delay.as_millis(),
                        %detail,
                        "Transport error, retrying"
                    );
                    metrics::record_retry("transport");
                    delay
                }
                ProviderError::Rejected { status, message } => {
                    return Err(FetchError::Rejected { status, message });
                }
            };

            tokio::time::sleep(delay).await;
        }
    }
}

/// Shape checks the provider adapter cannot make on its own: the page must
/// belong to the requested symbol, continue strictly after the previous
/// page, and not hand back the cursor it was given.
fn check_page(
    request: &BarsRequest,
    after: Option<DateTime<Utc>>,
    page: BarsPage,
) -> Result<BarsPage, ProviderError> {
    if page.next_page_token.is_some() && page.next_page_token == request.page_token {
        return Err(ProviderError::Malformed(
            "provider repeated the page cursor".to_string(),
        ));
    }

    let mut previous = after;
    for bar in &page.bars {
        if bar.symbol != request.symbol {
            return Err(ProviderError::Malformed(format!(
                "page for {} contains a bar for {}",
                request.symbol, bar.symbol
            )));
        }
        if let Some(prev) = previous
            && bar.timestamp <= prev
        {
            return Err(ProviderError::Malformed(format!(
                "bar at {} does not follow {prev}",
                bar.timestamp
            )));
        }
        previous = Some(bar.timestamp);
    }
    Ok(page)
}

// =============================================================================
// Tests
// =============================================================================
