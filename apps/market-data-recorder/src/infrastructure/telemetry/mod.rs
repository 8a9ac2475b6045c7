//! Logging and Trace Export
//!
//! Every run logs through a `tracing-subscriber` fmt layer filtered by
//! `RUST_LOG`. Span export over OTLP is opt-in, for long capture sessions
//! that should show up next to other services in a tracing backend.
//!
//! # Environment Variables
//!
//! - `OTEL_ENABLED`: `true`, `1` or `yes` to export spans (default: off)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: collector endpoint (default: http://localhost:4318)
//! - `OTEL_SERVICE_NAME`: reported service name (default: market-data-recorder)
//!
//! # Usage
//!
//! ```ignore
//! use market_data_recorder::infrastructure::telemetry;
//!
//! let _guard = telemetry::init();
//!
//! let span = tracing::info_span!("backfill_symbol", symbol = "AAPL");
//! let _entered = span.enter();
//! tracing::info!(bars = 252, "Series written");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_SERVICE_NAME: &str = "market-data-recorder";

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";

/// Applied when `RUST_LOG` does not mention this crate.
const DEFAULT_DIRECTIVE: &str = "market_data_recorder=info";

/// HTTP and WebSocket internals are chatty at info during a long backfill
/// or capture; keep them at warn regardless of `RUST_LOG`.
const QUIET_DEPENDENCIES: [&str; 5] = [
    "tungstenite=warn",
    "tokio_tungstenite=warn",
    "hyper=warn",
    "hyper_util=warn",
    "reqwest=warn",
];

/// Flushes and shuts down span export when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are being exported.
    #[must_use]
    pub const fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to flush trace export on exit: {e}");
        }
    }
}

/// Trace export settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub enabled: bool,
    /// Collector endpoint.
    pub otlp_endpoint: String,
    /// Reported service name.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`. Blank values count as unset.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            enabled: get("OTEL_ENABLED").is_some_and(|v| {
                matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
            }),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.otlp_endpoint),
            service_name: get("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
        }
    }
}

/// Install the global subscriber from environment settings.
///
/// Keep the returned guard alive until the program exits.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// Install the global subscriber.
///
/// If the OTLP exporter cannot be built, logging still goes to stdout and the
/// failure is logged once the subscriber is up.
#[must_use]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let (tracer_provider, export_error) = if config.enabled {
        match build_tracer_provider(&config) {
            Ok(provider) => (Some(provider), None),
            Err(e) => (None, Some(e)),
        }
    } else {
        (None, None)
    };

    let otel_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    if let Some(e) = export_error {
        tracing::warn!(
            error = %e,
            endpoint = %config.otlp_endpoint,
            "Trace export unavailable, logging to stdout only"
        );
    } else if tracer_provider.is_some() {
        tracing::debug!(endpoint = %config.otlp_endpoint, "Exporting spans");
    }

    TelemetryGuard { tracer_provider }
}

fn env_filter() -> EnvFilter {
    let builder = EnvFilter::builder();
    let builder = match parse_directive(DEFAULT_DIRECTIVE) {
        Some(directive) => builder.with_default_directive(directive),
        None => builder,
    };
    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|d| parse_directive(d))
        .fold(builder.from_env_lossy(), EnvFilter::add_directive)
}

fn parse_directive(directive: &str) -> Option<Directive> {
    directive.parse().ok()
}

fn build_tracer_provider(
    config: &TelemetryConfig,
) -> Result<SdkTracerProvider, opentelemetry_otlp::ExporterBuildError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build())
}

// =============================================================================
// Tests
// =============================================================================
