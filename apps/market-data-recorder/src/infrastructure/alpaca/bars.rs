//! Historical Bars REST Client
//!
//! `GET {data_url}/v2/stocks/bars` for one symbol at a time. Each call is a
//! single attempt; pacing and retries belong to the backfill service.
//!
//! # Response Classification
//!
//! | Response | Result |
//! |---|---|
//! | 200 with a `bars` key (`null`, `{}` or missing symbol = empty page) | page |
//! | 200 without a `bars` key, or not JSON | `Malformed` |
//! | 429 | `RateLimited` with `Retry-After` when present |
//! | 408, 5xx, network failure, timeout | `Transport` |
//! | other statuses | `Rejected` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;

use super::messages::BarsResponse;
use super::normalize;
use crate::application::ports::{BarsPage, BarsProvider, BarsRequest, ProviderError};
use crate::domain::history::PageCursor;
use crate::infrastructure::config::{Credentials, DataFeed};

const KEY_HEADER: &str = "APCA-API-KEY-ID";
const SECRET_HEADER: &str = "APCA-API-SECRET-KEY";

/// Longest error body kept in a `Rejected` message.
const MAX_ERROR_BODY: usize = 200;

/// Alpaca historical bars client.
#[derive(Debug, Clone)]
pub struct AlpacaBarsClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    feed: DataFeed,
}

impl AlpacaBarsClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        feed: DataFeed,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("market-data-recorder/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            feed,
        })
    }

    fn query(&self, request: &BarsRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("symbols", request.symbol.clone()),
            ("timeframe", request.timeframe.to_string()),
            (
                "start",
                request.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("end", request.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("limit", request.limit.to_string()),
            ("adjustment", request.adjustment.as_str().to_string()),
            ("feed", self.feed.as_str().to_string()),
            ("sort", "asc".to_string()),
        ];
        if let Some(token) = &request.page_token {
            query.push(("page_token", token.as_str().to_string()));
        }
        query
    }
}

#[async_trait]
impl BarsProvider for AlpacaBarsClient {
    async fn fetch_page(&self, request: &BarsRequest) -> Result<BarsPage, ProviderError> {
        let url = format!("{}/v2/stocks/bars", self.base_url);
        tracing::debug!(
            symbol = %request.symbol,
            page_token = ?request.page_token.as_ref().map(PageCursor::as_str),
            "Requesting bars page"
        );

        let response = self
            .http
            .get(&url)
            .header(KEY_HEADER, self.credentials.api_key())
            .header(SECRET_HEADER, self.credentials.api_secret())
            .query(&self.query(request))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        interpret_response(&request.symbol, status, retry_after.as_deref(), &body)
    }
}

/// Classify a bars response.
///
/// # Errors
///
/// Returns the [`ProviderError`] the status and body call for.
pub fn interpret_response(
    symbol: &str,
    status: StatusCode,
    retry_after: Option<&str>,
    body: &str,
) -> Result<BarsPage, ProviderError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited {
            retry_after: retry_after.and_then(parse_retry_after),
        });
    }
    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return Err(ProviderError::Transport(format!("HTTP {status}")));
    }
    if !status.is_success() {
        return Err(ProviderError::Rejected {
            status: status.as_u16(),
            message: body.chars().take(MAX_ERROR_BODY).collect(),
        });
    }

    let parsed: BarsResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let bars = parsed
        .bars
        .and_then(|mut by_symbol| by_symbol.remove(symbol))
        .unwrap_or_default()
        .into_iter()
        .map(|raw| normalize::bar(symbol, raw))
        .collect();

    Ok(BarsPage {
        bars,
        next_page_token: parsed
            .next_page_token
            .filter(|token| !token.is_empty())
            .map(PageCursor::new),
    })
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::history::{Adjustment, Timeframe};
    use chrono::{TimeZone, Utc};
    use test_case::test_case;

    const PAGE: &str = r#"{
        "bars": {"AAPL": [
            {"t":"2024-01-02T05:00:00Z","o":187.15,"h":188.44,"l":183.885,"c":185.64,"v":82488674,"n":1009074,"vw":185.9465},
            {"t":"2024-01-03T05:00:00Z","o":184.22,"h":185.88,"l":183.43,"c":184.25,"v":58414460,"n":656956,"vw":184.3226}
        ]},
        "next_page_token": "QUFQTHxEfDIwMjQtMDEtMDM="
    }"#;

    #[test]
    fn parses_page_with_cursor() {
        let page = interpret_response("AAPL", StatusCode::OK, None, PAGE).unwrap();
        assert_eq!(page.bars.len(), 2);
        assert_eq!(page.bars[0].symbol, "AAPL");
        assert!(page.bars[0].timestamp < page.bars[1].timestamp);
        assert_eq!(
            page.next_page_token,
            Some(PageCursor::new("QUFQTHxEfDIwMjQtMDEtMDM="))
        );
    }

    #[test_case(r#"{"bars":null,"next_page_token":null}"# ; "null bars")]
    #[test_case(r#"{"bars":{},"next_page_token":null}"# ; "empty map")]
    #[test_case(r#"{"bars":{"MSFT":[]}}"# ; "other symbol only")]
    fn empty_pages_are_not_errors(body: &str) {
        let page = interpret_response("AAPL", StatusCode::OK, None, body).unwrap();
        assert!(page.bars.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test_case(r#"{"next_page_token":null}"# ; "missing bars key")]
    #[test_case("<html>gateway</html>" ; "not json")]
    #[test_case(r#"{"bars":{"AAPL":[{"t":"yesterday"}]}}"# ; "bad bar")]
    fn malformed_bodies(body: &str) {
        assert!(matches!(
            interpret_response("AAPL", StatusCode::OK, None, body),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        assert_eq!(
            interpret_response("AAPL", StatusCode::TOO_MANY_REQUESTS, Some("3"), ""),
            Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            })
        );
        assert_eq!(
            interpret_response(
                "AAPL",
                StatusCode::TOO_MANY_REQUESTS,
                Some("Wed, 21 Oct 2015 07:28:00 GMT"),
                ""
            ),
            Err(ProviderError::RateLimited { retry_after: None })
        );
    }

    #[test_case(StatusCode::INTERNAL_SERVER_ERROR)]
    #[test_case(StatusCode::BAD_GATEWAY)]
    #[test_case(StatusCode::REQUEST_TIMEOUT)]
    fn server_errors_are_transport(status: StatusCode) {
        assert!(matches!(
            interpret_response("AAPL", status, None, ""),
            Err(ProviderError::Transport(_))
        ));
    }

    #[test]
    fn client_errors_are_rejected() {
        let err = interpret_response(
            "AAPL",
            StatusCode::FORBIDDEN,
            None,
            r#"{"message":"forbidden"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 403, .. }));
    }

    #[test]
    fn query_carries_range_feed_and_cursor() {
        let client = AlpacaBarsClient::new(
            "https://data.example.test/",
            Credentials::new("k".to_string(), "s".to_string()),
            DataFeed::Iex,
            Duration::from_secs(5),
        )
        .unwrap();
        let request = BarsRequest {
            symbol: "AAPL".to_string(),
            timeframe: Timeframe::DAY,
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap(),
            limit: 1000,
            adjustment: Adjustment::All,
            page_token: Some(PageCursor::new("abc")),
        };
        let query = client.query(&request);

        assert!(query.contains(&("timeframe", "1Day".to_string())));
        assert!(query.contains(&("start", "2024-01-01T00:00:00Z".to_string())));
        assert!(query.contains(&("end", "2024-12-31T23:59:59Z".to_string())));
        assert!(query.contains(&("feed", "iex".to_string())));
        assert!(query.contains(&("page_token", "abc".to_string())));
        assert_eq!(client.base_url, "https://data.example.test");
    }
}
