//! Recorder Configuration Settings
//!
//! Configuration types for the recorder, loaded from environment variables.
//! Built once at startup and passed to every component.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::application::services::{BackfillConfig, CaptureConfig};

/// Default historical data API.
pub const DEFAULT_DATA_URL: &str = "https://data.alpaca.markets";

/// Bars per page the historical API accepts.
pub const PAGE_SIZE_RANGE: RangeInclusive<u32> = 1..=10_000;

/// Market data feed type for Alpaca data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFeed {
    /// SIP (Securities Information Processor) - Full market data.
    Sip,
    /// IEX (Investors Exchange) - Free tier with limited data.
    #[default]
    Iex,
}

impl DataFeed {
    /// Parse feed type from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sip" => Self::Sip,
            _ => Self::Iex,
        }
    }

    /// Get the feed name for query strings and WebSocket URLs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sip => "sip",
            Self::Iex => "iex",
        }
    }
}

/// Account environment (paper vs live). Only the trade updates endpoint
/// depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Paper trading environment (simulated).
    #[default]
    Paper,
    /// Live trading environment (real money).
    Live,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" => Self::Live,
            _ => Self::Paper,
        }
    }

    /// Check if this is the live environment.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "live",
        }
    }
}

/// Alpaca API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Historical backfill settings.
#[derive(Debug, Clone)]
pub struct BackfillSettings {
    /// Provider request ceiling per minute.
    pub requests_per_minute: u32,
    /// Bars per page.
    pub page_size: u32,
    /// HTTP request timeout.
    pub http_timeout: Duration,
    /// Retries per page for malformed and transport failures.
    pub max_retries: u32,
    /// Retries per page for rate-limit responses.
    pub rate_limit_retries: u32,
    /// First retry delay.
    pub retry_initial: Duration,
    /// Retry delay ceiling.
    pub retry_max: Duration,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 200,
            page_size: 1000,
            http_timeout: Duration::from_secs(30),
            max_retries: 5,
            rate_limit_retries: 10,
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
        }
    }
}

impl BackfillSettings {
    /// Service tuning derived from these settings.
    #[must_use]
    pub fn backfill_config(&self) -> BackfillConfig {
        BackfillConfig {
            page_size: self.page_size,
            max_retries: self.max_retries,
            rate_limit_retries: self.rate_limit_retries,
            initial_backoff: self.retry_initial,
            max_backoff: self.retry_max,
            ..BackfillConfig::default()
        }
    }
}

/// Streaming capture settings.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Records appended between flushes.
    pub flush_every: usize,
    /// Longest time between flushes.
    pub flush_interval: Duration,
    /// Bound on the whole capture shutdown.
    pub shutdown_timeout: Duration,
    /// Receive loop to writer buffer.
    pub channel_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            flush_every: 100,
            flush_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            channel_capacity: 4096,
        }
    }
}

impl CaptureSettings {
    /// Supervisor tuning derived from these settings.
    #[must_use]
    pub const fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            shutdown_timeout: self.shutdown_timeout,
            channel_capacity: self.channel_capacity,
            flush_interval: self.flush_interval,
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(20),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 10,
        }
    }
}

/// Complete recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Account environment.
    pub environment: Environment,
    /// Market data feed type.
    pub feed: DataFeed,
    /// API credentials.
    pub credentials: Credentials,
    /// Historical data API base URL.
    pub data_url: String,
    /// Backfill settings.
    pub backfill: BackfillSettings,
    /// Capture settings.
    pub capture: CaptureSettings,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl RecorderConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are missing or empty.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvLookup(&lookup);

        let api_key = env.required("ALPACA_KEY")?;
        let api_secret = env.required("ALPACA_SECRET")?;

        let environment = lookup("RECORDER_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let feed = lookup("ALPACA_FEED")
            .map(|s| DataFeed::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let data_url = lookup("ALPACA_DATA_URL")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_DATA_URL.to_string());

        let backfill_defaults = BackfillSettings::default();
        let backfill = BackfillSettings {
            requests_per_minute: env.parse_or(
                "RECORDER_REQUESTS_PER_MINUTE",
                backfill_defaults.requests_per_minute,
            ),
            page_size: env.parse_or("RECORDER_PAGE_SIZE", backfill_defaults.page_size),
            http_timeout: env.secs_or("RECORDER_HTTP_TIMEOUT_SECS", backfill_defaults.http_timeout),
            max_retries: env.parse_or("RECORDER_MAX_RETRIES", backfill_defaults.max_retries),
            rate_limit_retries: env.parse_or(
                "RECORDER_RATE_LIMIT_RETRIES",
                backfill_defaults.rate_limit_retries,
            ),
            retry_initial: env.millis_or("RECORDER_RETRY_INITIAL_MS", backfill_defaults.retry_initial),
            retry_max: env.secs_or("RECORDER_RETRY_MAX_SECS", backfill_defaults.retry_max),
        };

        let capture_defaults = CaptureSettings::default();
        let capture = CaptureSettings {
            flush_every: env.parse_or("RECORDER_FLUSH_EVERY", capture_defaults.flush_every),
            flush_interval: env.millis_or(
                "RECORDER_FLUSH_INTERVAL_MS",
                capture_defaults.flush_interval,
            ),
            shutdown_timeout: env.secs_or(
                "RECORDER_SHUTDOWN_TIMEOUT_SECS",
                capture_defaults.shutdown_timeout,
            ),
            channel_capacity: env.parse_or(
                "RECORDER_CHANNEL_CAPACITY",
                capture_defaults.channel_capacity,
            ),
        };

        let ws_defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            heartbeat_interval: env.secs_or(
                "RECORDER_HEARTBEAT_INTERVAL_SECS",
                ws_defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env.secs_or(
                "RECORDER_HEARTBEAT_TIMEOUT_SECS",
                ws_defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: env.millis_or(
                "RECORDER_RECONNECT_DELAY_INITIAL_MS",
                ws_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs_or(
                "RECORDER_RECONNECT_DELAY_MAX_SECS",
                ws_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse_or(
                "RECORDER_RECONNECT_DELAY_MULTIPLIER",
                ws_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.parse_or(
                "RECORDER_MAX_RECONNECT_ATTEMPTS",
                ws_defaults.max_reconnect_attempts,
            ),
        };

        let config = Self {
            environment,
            feed,
            credentials: Credentials::new(api_key, api_secret),
            data_url,
            backfill,
            capture,
            websocket,
            metrics_port: env.parse_or("RECORDER_METRICS_PORT", 0),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject tunables the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !PAGE_SIZE_RANGE.contains(&self.backfill.page_size) {
            return Err(ConfigError::invalid(
                "RECORDER_PAGE_SIZE",
                format!(
                    "{} is outside {}..={}",
                    self.backfill.page_size,
                    PAGE_SIZE_RANGE.start(),
                    PAGE_SIZE_RANGE.end()
                ),
            ));
        }

        let ws = &self.websocket;
        for (key, value) in [
            ("RECORDER_HEARTBEAT_INTERVAL_SECS", ws.heartbeat_interval),
            ("RECORDER_HEARTBEAT_TIMEOUT_SECS", ws.heartbeat_timeout),
            ("RECORDER_RECONNECT_DELAY_INITIAL_MS", ws.reconnect_delay_initial),
            ("RECORDER_RECONNECT_DELAY_MAX_SECS", ws.reconnect_delay_max),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if ws.reconnect_delay_initial > ws.reconnect_delay_max {
            return Err(ConfigError::invalid(
                "RECORDER_RECONNECT_DELAY_INITIAL_MS",
                "exceeds RECORDER_RECONNECT_DELAY_MAX_SECS",
            ));
        }
        if !ws.reconnect_delay_multiplier.is_finite() || ws.reconnect_delay_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "RECORDER_RECONNECT_DELAY_MULTIPLIER",
                "must be a finite number of at least 1.0",
            ));
        }
        Ok(())
    }

    /// Get the stock stream WebSocket URL.
    ///
    /// Note: Market data streams always use production URLs regardless of
    /// account environment. Only trade updates use paper vs live endpoints.
    #[must_use]
    pub fn stock_stream_url(&self) -> String {
        format!("wss://stream.data.alpaca.markets/v2/{}", self.feed.as_str())
    }

    /// Get the trade updates WebSocket URL.
    #[must_use]
    pub fn trade_updates_url(&self) -> String {
        if self.environment.is_live() {
            "wss://api.alpaca.markets/stream".to_string()
        } else {
            "wss://paper-api.alpaca.markets/stream".to_string()
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Value parsed but is out of range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Offending setting.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Typed reads over a key lookup. Unparseable values fall back to the default.
struct EnvLookup<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> EnvLookup<'_, F> {
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs_or(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis_or(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const CREDS: [(&str, &str); 2] = [("ALPACA_KEY", "key123"), ("ALPACA_SECRET", "secret456")];

    #[test]
    fn data_feed_parsing() {
        assert_eq!(DataFeed::from_str_case_insensitive("sip"), DataFeed::Sip);
        assert_eq!(DataFeed::from_str_case_insensitive("SIP"), DataFeed::Sip);
        assert_eq!(DataFeed::from_str_case_insensitive("iex"), DataFeed::Iex);
        assert_eq!(
            DataFeed::from_str_case_insensitive("unknown"),
            DataFeed::Iex
        );
    }

    #[test]
    fn environment_parsing() {
        assert_eq!(
            Environment::from_str_case_insensitive("live"),
            Environment::Live
        );
        assert_eq!(
            Environment::from_str_case_insensitive("PAPER"),
            Environment::Paper
        );
        assert_eq!(
            Environment::from_str_case_insensitive("unknown"),
            Environment::Paper
        );
    }

    #[test]
    fn credentials_redacted_debug() {
        let creds = Credentials::new("key123".to_string(), "secret456".to_string());
        let debug = format!("{creds:?}");
        assert!(!debug.contains("key123"));
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let err = RecorderConfig::from_lookup(lookup(&[("ALPACA_KEY", "k")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "ALPACA_SECRET"));

        let err = RecorderConfig::from_lookup(lookup(&[("ALPACA_KEY", ""), ("ALPACA_SECRET", "s")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(key) if key == "ALPACA_KEY"));
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let config = RecorderConfig::from_lookup(lookup(&CREDS)).unwrap();
        assert_eq!(config.environment, Environment::Paper);
        assert_eq!(config.feed, DataFeed::Iex);
        assert_eq!(config.data_url, DEFAULT_DATA_URL);
        assert_eq!(config.backfill.requests_per_minute, 200);
        assert_eq!(config.backfill.page_size, 1000);
        assert_eq!(config.capture.flush_every, 100);
        assert_eq!(config.capture.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.websocket.max_reconnect_attempts, 10);
        assert_eq!(config.metrics_port, 0);
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = CREDS.to_vec();
        pairs.extend([
            ("RECORDER_ENV", "live"),
            ("ALPACA_FEED", "sip"),
            ("RECORDER_REQUESTS_PER_MINUTE", "1000"),
            ("RECORDER_PAGE_SIZE", "10000"),
            ("RECORDER_FLUSH_INTERVAL_MS", "250"),
            ("RECORDER_SHUTDOWN_TIMEOUT_SECS", "3"),
            ("RECORDER_RECONNECT_DELAY_MULTIPLIER", "1.5"),
        ]);
        let config = RecorderConfig::from_lookup(lookup(&pairs)).unwrap();

        assert!(config.environment.is_live());
        assert_eq!(config.feed, DataFeed::Sip);
        assert_eq!(config.backfill.requests_per_minute, 1000);
        assert_eq!(config.backfill.page_size, 10_000);
        assert_eq!(config.capture.flush_interval, Duration::from_millis(250));
        assert_eq!(config.capture.shutdown_timeout, Duration::from_secs(3));
        assert!((config.websocket.reconnect_delay_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(
            config.trade_updates_url(),
            "wss://api.alpaca.markets/stream"
        );
        assert_eq!(
            config.stock_stream_url(),
            "wss://stream.data.alpaca.markets/v2/sip"
        );
    }

    #[test]
    fn unparseable_values_fall_back() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("RECORDER_PAGE_SIZE", "lots"));
        let config = RecorderConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.backfill.page_size, 1000);
    }

    #[test_case("RECORDER_PAGE_SIZE", "0")]
    #[test_case("RECORDER_PAGE_SIZE", "10001")]
    #[test_case("RECORDER_HEARTBEAT_INTERVAL_SECS", "0")]
    #[test_case("RECORDER_HEARTBEAT_TIMEOUT_SECS", "0")]
    #[test_case("RECORDER_RECONNECT_DELAY_INITIAL_MS", "0")]
    #[test_case("RECORDER_RECONNECT_DELAY_MAX_SECS", "0")]
    #[test_case("RECORDER_RECONNECT_DELAY_MULTIPLIER", "0.5")]
    #[test_case("RECORDER_RECONNECT_DELAY_MULTIPLIER", "NaN")]
    fn out_of_range_values_are_rejected(key: &str, value: &str) {
        let mut pairs = CREDS.to_vec();
        pairs.push((key, value));
        let err = RecorderConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(
            matches!(&err, ConfigError::InvalidValue { key: bad, .. } if bad == key),
            "{err}"
        );
    }

    #[test]
    fn page_size_bounds_are_inclusive() {
        for size in ["1", "10000"] {
            let mut pairs = CREDS.to_vec();
            pairs.push(("RECORDER_PAGE_SIZE", size));
            assert!(RecorderConfig::from_lookup(lookup(&pairs)).is_ok(), "{size}");
        }
    }

    #[test]
    fn initial_reconnect_delay_above_ceiling_is_rejected() {
        let mut pairs = CREDS.to_vec();
        pairs.extend([
            ("RECORDER_RECONNECT_DELAY_INITIAL_MS", "5000"),
            ("RECORDER_RECONNECT_DELAY_MAX_SECS", "2"),
        ]);
        let err = RecorderConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.to_string().contains("RECORDER_RECONNECT_DELAY_INITIAL_MS"));
    }

    #[test]
    fn cli_override_is_validated() {
        let mut config = RecorderConfig::from_lookup(lookup(&CREDS)).unwrap();
        config.backfill.page_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn settings_convert_to_service_config() {
        let backfill = BackfillSettings::default().backfill_config();
        assert_eq!(backfill.page_size, 1000);
        assert_eq!(backfill.max_retries, 5);

        let capture = CaptureSettings::default().capture_config();
        assert_eq!(capture.channel_capacity, 4096);
    }
}
