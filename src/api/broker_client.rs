//! REST client for the broker's v3-style order API.
//!
//! Handles bearer authentication and maps HTTP failures onto [`BrokerError`].
//! Retries and timeouts are the gateway's business; this client makes
//! exactly one request per call.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::models::{
    AttachedOrder, AttachedTrailing, EntryOrder, Instrument, OrderType, Side, TimeInForce,
    WirePrice,
};

use super::broker::{
    Broker, BrokerError, CloseAck, EntryAck, OrderAck, OrderSnapshot, OrderState, RejectCode,
    TradeSnapshot, TradeState,
};
use super::types::*;

const PRACTICE_API_BASE: &str = "https://api-fxpractice.oanda.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated client for one broker account.
pub struct RestBroker {
    client: Client,
    base_url: String,
    account_id: String,
    token: String,
    timeout: Duration,
}

impl RestBroker {
    /// Create a new client against the practice environment.
    pub fn new(token: &str, account_id: &str) -> Result<Self> {
        Self::with_base_url(PRACTICE_API_BASE.to_string(), token, account_id)
    }

    /// Create with custom base URL (live environment, or tests).
    pub fn with_base_url(base_url: String, token: &str, account_id: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            token: token.to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Create from environment variables:
    /// - BROKER_API_TOKEN
    /// - BROKER_ACCOUNT_ID
    /// - BROKER_API_URL (defaults to the practice environment)
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("BROKER_API_TOKEN").context("BROKER_API_TOKEN not set")?;
        let account_id = std::env::var("BROKER_ACCOUNT_ID").context("BROKER_ACCOUNT_ID not set")?;
        let base_url =
            std::env::var("BROKER_API_URL").unwrap_or_else(|_| PRACTICE_API_BASE.to_string());

        Self::with_base_url(base_url, &token, &account_id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v3/accounts/{}{}", self.base_url, self.account_id, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.token)
            .header("Accept-Datetime-Format", "RFC3339")
    }

    /// Send a request and decode a 2xx body, or map the failure.
    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BrokerError> {
        let response = self.authed(req).send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();

        if !status.is_success() {
            return Err(api_error(status, response.text().await.unwrap_or_default()));
        }

        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        serde_json::from_str(&body).map_err(|e| BrokerError::Decode(e.to_string()))
    }

    fn transport_error(&self, e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::Timeout(self.timeout)
        } else {
            BrokerError::Transport(e.to_string())
        }
    }

    async fn modify_trade_orders(
        &self,
        trade_id: &str,
        body: &TradeOrdersRequest,
    ) -> Result<OrderAck, BrokerError> {
        let url = self.url(&format!("/trades/{}/orders", trade_id));
        debug!(url = %url, "Modifying dependent orders");

        let resp: TradeOrdersResponse = self.send(self.client.put(&url).json(body)).await?;
        Ok(OrderAck {
            order_id: resp.order_id(),
        })
    }
}

fn api_error(status: StatusCode, body: String) -> BrokerError {
    let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let message = parsed.error_message.unwrap_or(body);

    BrokerError::Api {
        status: status.as_u16(),
        code: RejectCode::from_code(parsed.error_code.as_deref()),
        message,
    }
}

fn order_type_name(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::TakeProfit => "TAKE_PROFIT",
        OrderType::StopLoss => "STOP_LOSS",
        OrderType::TrailingStop => "TRAILING_STOP_LOSS",
    }
}

fn tif_name(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Fok => "FOK",
        TimeInForce::Gtc => "GTC",
        TimeInForce::Gtd => "GTD",
    }
}

fn gtc(price: &WirePrice) -> PriceDetails {
    PriceDetails {
        price: price.clone(),
        time_in_force: "GTC",
    }
}

fn order_request(order: &EntryOrder) -> OrderRequestBody {
    OrderRequestBody {
        order: OrderRequest {
            order_type: order_type_name(order.order_type),
            instrument: order.instrument.to_string(),
            units: order.side.signed_units(order.units).to_string(),
            time_in_force: tif_name(order.time_in_force),
            price: order.limit_price.clone(),
            gtd_time: order.good_till,
            position_fill: "DEFAULT",
            take_profit_on_fill: order.take_profit.as_ref().map(gtc),
            stop_loss_on_fill: order.stop_loss.as_ref().map(gtc),
            client_extensions: ClientExtensionsWire::from(&order.client),
        },
    }
}

fn order_snapshot(order: OrderWire) -> Result<OrderSnapshot, BrokerError> {
    let state = match order.state.as_str() {
        "PENDING" => OrderState::Pending,
        "FILLED" => OrderState::Filled,
        "TRIGGERED" => OrderState::Triggered,
        "CANCELLED" => OrderState::Cancelled,
        other => return Err(BrokerError::Decode(format!("unknown order state {}", other))),
    };

    Ok(OrderSnapshot {
        id: order.id,
        state,
        client_id: order.client_extensions.map(|c| c.id),
        trade_id: order.trade_opened_id,
        fill_price: order.price,
        units: unit_count(order.units),
        fill_time: order.filled_time,
    })
}

fn close_ack(fill: Option<FillTransaction>) -> Result<CloseAck, BrokerError> {
    let fill = fill.ok_or_else(|| BrokerError::Decode("close response without fill".to_string()))?;
    Ok(CloseAck {
        price: fill.price,
        units: unit_count(fill.units),
        realized_pnl: pnl(fill.pl),
    })
}

#[async_trait]
impl Broker for RestBroker {
    async fn place_order(&self, order: &EntryOrder) -> Result<EntryAck, BrokerError> {
        let url = self.url("/orders");
        debug!(
            instrument = %order.instrument,
            correlation_id = %order.correlation_id(),
            "Placing order"
        );

        let resp: OrderCreateResponse = self
            .send(self.client.post(&url).json(&order_request(order)))
            .await?;
        let order_id = resp
            .order_create_transaction
            .map(|t| t.id)
            .ok_or_else(|| BrokerError::Decode("order response without create transaction".to_string()))?;

        if let Some(fill) = resp.order_fill_transaction {
            let opened = fill
                .trade_opened
                .ok_or_else(|| BrokerError::Decode("fill without opened trade".to_string()))?;
            let price = opened
                .price
                .or(fill.price)
                .ok_or_else(|| BrokerError::Decode("fill without price".to_string()))?;

            return Ok(EntryAck::Filled {
                order_id,
                trade_id: opened.trade_id,
                price,
                units: unit_count(opened.units),
                time: fill.time.unwrap_or_else(chrono::Utc::now),
            });
        }
        if let Some(cancel) = resp.order_cancel_transaction {
            return Ok(EntryAck::Cancelled {
                order_id,
                reason: cancel.reason,
            });
        }
        Ok(EntryAck::Pending { order_id })
    }

    async fn order_by_client_id(&self, client_id: &str) -> Result<Option<OrderSnapshot>, BrokerError> {
        let url = self.url(&format!("/orders/@{}", client_id));
        match self.send::<OrderResponse>(self.client.get(&url)).await {
            Ok(resp) => order_snapshot(resp.order).map(Some),
            Err(BrokerError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        let url = self.url(&format!("/orders/{}", order_id));
        let resp: OrderResponse = self.send(self.client.get(&url)).await?;
        order_snapshot(resp.order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let url = self.url(&format!("/orders/{}/cancel", order_id));
        let _: serde_json::Value = self.send(self.client.put(&url)).await?;
        Ok(())
    }

    async fn get_trade(&self, trade_id: &str) -> Result<TradeSnapshot, BrokerError> {
        let url = self.url(&format!("/trades/{}", trade_id));
        let resp: TradeResponse = self.send(self.client.get(&url)).await?;
        let t = resp.trade;
        let instrument = Instrument::new(t.instrument);

        let state = match t.state.as_str() {
            "CLOSED" => TradeState::Closed,
            _ => TradeState::Open,
        };
        let trailing_stop = t.trailing_stop_loss_order.map(|o| AttachedTrailing {
            id: o.id,
            distance_pips: instrument.price_to_pips(o.distance),
        });

        Ok(TradeSnapshot {
            id: t.id,
            state,
            units: unit_count(t.current_units),
            price: t.price,
            realized_pnl: pnl(t.realized_pl),
            unrealized_pnl: pnl(t.unrealized_pl),
            close_price: t.average_close_price,
            stop_loss: t.stop_loss_order.map(|o| AttachedOrder { id: o.id, price: o.price }),
            take_profit: t.take_profit_order.map(|o| AttachedOrder { id: o.id, price: o.price }),
            trailing_stop,
            instrument,
        })
    }

    async fn modify_stop_loss(&self, trade_id: &str, price: &WirePrice) -> Result<OrderAck, BrokerError> {
        let body = TradeOrdersRequest {
            stop_loss: Some(gtc(price)),
            ..TradeOrdersRequest::default()
        };
        self.modify_trade_orders(trade_id, &body).await
    }

    async fn modify_take_profit(&self, trade_id: &str, price: &WirePrice) -> Result<OrderAck, BrokerError> {
        let body = TradeOrdersRequest {
            take_profit: Some(gtc(price)),
            ..TradeOrdersRequest::default()
        };
        self.modify_trade_orders(trade_id, &body).await
    }

    async fn modify_trailing_stop(&self, trade_id: &str, distance: &WirePrice) -> Result<OrderAck, BrokerError> {
        let body = TradeOrdersRequest {
            trailing_stop_loss: Some(DistanceDetails {
                distance: distance.clone(),
                time_in_force: "GTC",
            }),
            ..TradeOrdersRequest::default()
        };
        self.modify_trade_orders(trade_id, &body).await
    }

    async fn close_trade(&self, trade_id: &str, units: Option<u64>) -> Result<CloseAck, BrokerError> {
        let url = self.url(&format!("/trades/{}/close", trade_id));
        let body = CloseTradeRequest {
            units: units.map(|u| u.to_string()).unwrap_or_else(|| "ALL".to_string()),
        };

        let resp: CloseTradeResponse = self.send(self.client.put(&url).json(&body)).await?;
        close_ack(resp.order_fill_transaction)
    }

    async fn close_position(&self, instrument: &Instrument, side: Side) -> Result<CloseAck, BrokerError> {
        let url = self.url(&format!("/positions/{}/close", instrument));
        let body = match side {
            Side::Long => ClosePositionRequest {
                long_units: Some("ALL".to_string()),
                short_units: None,
            },
            Side::Short => ClosePositionRequest {
                long_units: None,
                short_units: Some("ALL".to_string()),
            },
        };

        let resp: ClosePositionResponse = self.send(self.client.put(&url).json(&body)).await?;
        close_ack(match side {
            Side::Long => resp.long_order_fill_transaction,
            Side::Short => resp.short_order_fill_transaction,
        })
    }

    async fn account_balance(&self) -> Result<Decimal, BrokerError> {
        let resp: AccountSummaryResponse = self.send(self.client.get(self.url("/summary"))).await?;
        Ok(resp.account.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClientExtensions;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn broker(server: &MockServer) -> RestBroker {
        RestBroker::with_base_url(server.uri(), "test-token", "001-001").unwrap()
    }

    #[tokio::test]
    async fn test_market_order_fill() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/accounts/001-001/orders"))
            .and(header("Authorization", "Bearer test-token"))
            .and(body_partial_json(serde_json::json!({
                "order": {"type": "MARKET", "units": "-1000", "stopLossOnFill": {"price": "150.300"}}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "orderCreateTransaction": {"id": "10"},
                "orderFillTransaction": {
                    "id": "11",
                    "orderID": "10",
                    "price": "150.000",
                    "units": "-1000",
                    "tradeOpened": {"tradeID": "11", "units": "-1000", "price": "150.000"}
                }
            })))
            .mount(&server)
            .await;

        let order = EntryOrder::market(
            Instrument::new("USD_JPY"),
            Side::Short,
            1000,
            ClientExtensions::generate("market", 30.0, 30.0),
        )
        .with_protection(Some(dec!(149.70)), dec!(150.30));

        let ack = broker(&server).await.place_order(&order).await.unwrap();
        match ack {
            EntryAck::Filled { trade_id, price, units, .. } => {
                assert_eq!(trade_id, "11");
                assert_eq!(price, dec!(150.000));
                assert_eq!(units, 1000);
            }
            other => panic!("expected fill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_trade_maps_to_reject_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/accounts/001-001/trades/77"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "errorCode": "NO_SUCH_TRADE",
                "errorMessage": "The Trade specified does not exist"
            })))
            .mount(&server)
            .await;

        let err = broker(&server).await.get_trade("77").await.unwrap_err();
        assert_eq!(err.reject_code(), Some(&RejectCode::TradeNotFound));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/accounts/001-001/summary"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let err = broker(&server).await.account_balance().await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, BrokerError::Api { status: 503, code: RejectCode::Unspecified, .. }));
    }

    #[tokio::test]
    async fn test_unknown_client_id_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/accounts/001-001/orders/@abc123"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "errorCode": "ORDER_DOESNT_EXIST"
            })))
            .mount(&server)
            .await;

        assert!(broker(&server).await.order_by_client_id("abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trade_snapshot_and_stop_modification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/accounts/001-001/trades/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"trade": {
                "id": "5",
                "instrument": "USD_JPY",
                "price": "150.000",
                "state": "OPEN",
                "currentUnits": "333",
                "realizedPL": "0",
                "unrealizedPL": "3.33",
                "takeProfitOrder": {"id": "7", "price": "150.600"},
                "trailingStopLossOrder": {"id": "8", "distance": "0.060"}
            }})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v3/accounts/001-001/trades/5/orders"))
            .and(body_partial_json(serde_json::json!({"stopLoss": {"price": "150.000"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stopLossOrderTransaction": {"id": "9"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let b = broker(&server).await;
        let snap = b.get_trade("5").await.unwrap();
        assert_eq!(snap.state, TradeState::Open);
        assert_eq!(snap.units, 333);
        assert!(snap.stop_loss.is_none());
        assert_eq!(snap.trailing_stop.map(|t| t.distance_pips), Some(6.0));

        let price = Instrument::new("USD_JPY").format_price(dec!(150));
        let ack = b.modify_stop_loss("5", &price).await.unwrap();
        assert_eq!(ack.order_id.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_close_position_long_side() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v3/accounts/001-001/positions/EUR_USD/close"))
            .and(body_partial_json(serde_json::json!({"longUnits": "ALL"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "longOrderFillTransaction": {"price": "1.08600", "units": "-2000", "pl": "2.0000"}
            })))
            .mount(&server)
            .await;

        let ack = broker(&server)
            .await
            .close_position(&Instrument::new("EUR_USD"), Side::Long)
            .await
            .unwrap();
        assert_eq!(ack.units, 2000);
        assert_eq!(ack.price, Some(dec!(1.08600)));
        assert!((ack.realized_pnl - 2.0).abs() < 1e-9);
    }
}
