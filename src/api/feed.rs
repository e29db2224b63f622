//! Market data feed and decision advisor seams, with HTTP clients for both.
//!
//! Indicator computation and prompt construction happen upstream; these
//! clients only fetch finished snapshots and advice.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::models::{Advice, Instrument, MarketSnapshot, Position};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Source of per-tick market snapshots.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn snapshot(&self, instrument: &Instrument) -> Result<MarketSnapshot>;
}

/// External decision advisor. Its output is untrusted.
#[async_trait]
pub trait DecisionAdvisor: Send + Sync {
    async fn advise(&self, snapshot: &MarketSnapshot, position: Option<&Position>) -> Result<Advice>;
}

fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Snapshot feed served over HTTP.
pub struct HttpFeed {
    client: Client,
    base_url: String,
}

impl HttpFeed {
    /// Create with custom base URL.
    pub fn with_base_url(base_url: String) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create from FEED_API_URL.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("FEED_API_URL").context("FEED_API_URL not set")?;
        Self::with_base_url(base_url)
    }
}

#[async_trait]
impl MarketFeed for HttpFeed {
    async fn snapshot(&self, instrument: &Instrument) -> Result<MarketSnapshot> {
        let url = format!("{}/snapshot/{}", self.base_url, instrument);
        debug!(url = %url, "Fetching market snapshot");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch market snapshot")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Snapshot request failed: {} - {}", status, body);
        }

        let snapshot: MarketSnapshot = response
            .json()
            .await
            .context("Failed to parse market snapshot")?;

        if snapshot.instrument != *instrument {
            anyhow::bail!(
                "Feed returned {} when asked for {}",
                snapshot.instrument,
                instrument
            );
        }
        Ok(snapshot)
    }
}

#[derive(Serialize)]
struct AdviceRequest<'a> {
    snapshot: &'a MarketSnapshot,
    position: Option<&'a Position>,
}

/// Decision advisor served over HTTP.
pub struct HttpAdvisor {
    client: Client,
    base_url: String,
}

impl HttpAdvisor {
    /// Create with custom base URL.
    pub fn with_base_url(base_url: String) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create from ADVISOR_API_URL.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("ADVISOR_API_URL").context("ADVISOR_API_URL not set")?;
        Self::with_base_url(base_url)
    }
}

#[async_trait]
impl DecisionAdvisor for HttpAdvisor {
    async fn advise(&self, snapshot: &MarketSnapshot, position: Option<&Position>) -> Result<Advice> {
        let url = format!("{}/advise", self.base_url);
        debug!(instrument = %snapshot.instrument, "Requesting advice");

        let response = self
            .client
            .post(&url)
            .json(&AdviceRequest { snapshot, position })
            .send()
            .await
            .context("Failed to request advice")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Advice request failed: {} - {}", status, body);
        }

        response.json().await.context("Failed to parse advice")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdviceSide, AdvisorAction, Quote};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/snapshot/USD_JPY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "instrument": "USD_JPY",
                "quote": {"bid": "150.010", "ask": "150.020", "time": "2024-05-07T02:00:00Z"},
                "indicators": {"atr": [0.05, 0.06], "adx": [21.0]}
            })))
            .mount(&server)
            .await;

        let feed = HttpFeed::with_base_url(server.uri()).unwrap();
        let snap = feed.snapshot(&Instrument::new("USD_JPY")).await.unwrap();

        assert_eq!(snap.quote.bid, dec!(150.010));
        assert!((snap.atr_pips().unwrap() - 6.0).abs() < 1e-9);
        assert!(snap.candles.is_empty());
        assert_eq!(snap.calendar_level, 0);
    }

    #[tokio::test]
    async fn test_snapshot_for_wrong_instrument_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/snapshot/USD_JPY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "instrument": "EUR_USD",
                "quote": {"bid": "1.08500", "ask": "1.08510", "time": "2024-05-07T02:00:00Z"}
            })))
            .mount(&server)
            .await;

        let feed = HttpFeed::with_base_url(server.uri()).unwrap();
        assert!(feed.snapshot(&Instrument::new("USD_JPY")).await.is_err());
    }

    #[tokio::test]
    async fn test_advice_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/advise"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "side": "short",
                "tpPips": 25,
                "slPips": 15,
                "action": "HOLD",
                "confidence": 0.6
            })))
            .mount(&server)
            .await;

        let snapshot = MarketSnapshot {
            instrument: Instrument::new("EUR_USD"),
            quote: Quote {
                bid: dec!(1.0850),
                ask: dec!(1.0851),
                time: Utc::now(),
            },
            candles: Vec::new(),
            indicators: Default::default(),
            calendar_level: 0,
        };

        let advisor = HttpAdvisor::with_base_url(server.uri()).unwrap();
        let advice = advisor.advise(&snapshot, None).await.unwrap();
        assert_eq!(advice.side, AdviceSide::Short);
        assert_eq!(advice.action, AdvisorAction::Hold);
        assert_eq!(advice.sl(), Some(15.0));
    }

    #[tokio::test]
    async fn test_advisor_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/advise"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let snapshot = MarketSnapshot {
            instrument: Instrument::new("USD_JPY"),
            quote: Quote {
                bid: dec!(150.00),
                ask: dec!(150.01),
                time: Utc::now(),
            },
            candles: Vec::new(),
            indicators: Default::default(),
            calendar_level: 0,
        };

        let advisor = HttpAdvisor::with_base_url(server.uri()).unwrap();
        assert!(advisor.advise(&snapshot, None).await.is_err());
    }
}
