//! Wire types for the broker's v3-style REST API.
//!
//! Numbers arrive as strings. Unit counts are signed on the wire (negative
//! for short) and converted to magnitudes at the boundary.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{ClientExtensions, WirePrice};

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Attached order details on an entry order or a trade modification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceDetails {
    pub price: WirePrice,
    pub time_in_force: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceDetails {
    pub distance: WirePrice,
    pub time_in_force: &'static str,
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequestBody {
    pub order: OrderRequest,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub instrument: String,
    /// Signed unit count as a string
    pub units: String,
    pub time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<WirePrice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gtd_time: Option<DateTime<Utc>>,
    pub position_fill: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit_on_fill: Option<PriceDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss_on_fill: Option<PriceDetails>,
    pub client_extensions: ClientExtensionsWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientExtensionsWire {
    pub id: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub comment: String,
}

impl From<&ClientExtensions> for ClientExtensionsWire {
    fn from(c: &ClientExtensions) -> Self {
        Self {
            id: c.id.clone(),
            tag: c.tag.clone(),
            comment: c.comment.clone(),
        }
    }
}

/// Response of `POST /orders`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreateResponse {
    pub order_create_transaction: Option<TransactionRef>,
    pub order_fill_transaction: Option<FillTransaction>,
    pub order_cancel_transaction: Option<CancelTransaction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionRef {
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillTransaction {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "orderID", default)]
    pub order_id: String,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub units: Decimal,
    #[serde(default)]
    pub pl: Decimal,
    pub time: Option<DateTime<Utc>>,
    pub trade_opened: Option<TradeOpened>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOpened {
    #[serde(rename = "tradeID")]
    pub trade_id: String,
    pub units: Decimal,
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTransaction {
    #[serde(rename = "orderID", default)]
    pub order_id: String,
    #[serde(default)]
    pub reason: String,
}

/// Response of `GET /orders/{specifier}`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub order: OrderWire,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWire {
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub units: Decimal,
    pub client_extensions: Option<ClientExtensionsWire>,
    #[serde(rename = "tradeOpenedID")]
    pub trade_opened_id: Option<String>,
    pub price: Option<Decimal>,
    pub filled_time: Option<DateTime<Utc>>,
}

/// Response of `GET /trades/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeResponse {
    pub trade: TradeWire,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeWire {
    pub id: String,
    pub instrument: String,
    pub price: Decimal,
    pub state: String,
    #[serde(default)]
    pub current_units: Decimal,
    #[serde(rename = "realizedPL", default)]
    pub realized_pl: Decimal,
    #[serde(rename = "unrealizedPL", default)]
    pub unrealized_pl: Decimal,
    pub average_close_price: Option<Decimal>,
    pub take_profit_order: Option<AttachedWire>,
    pub stop_loss_order: Option<AttachedWire>,
    pub trailing_stop_loss_order: Option<TrailingWire>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachedWire {
    pub id: Option<String>,
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrailingWire {
    pub id: Option<String>,
    pub distance: Decimal,
}

/// Body of `PUT /trades/{id}/orders`. Only one field is set per request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOrdersRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<PriceDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<PriceDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_stop_loss: Option<DistanceDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOrdersResponse {
    pub stop_loss_order_transaction: Option<TransactionRef>,
    pub take_profit_order_transaction: Option<TransactionRef>,
    pub trailing_stop_loss_order_transaction: Option<TransactionRef>,
}

impl TradeOrdersResponse {
    pub fn order_id(&self) -> Option<String> {
        self.stop_loss_order_transaction
            .as_ref()
            .or(self.take_profit_order_transaction.as_ref())
            .or(self.trailing_stop_loss_order_transaction.as_ref())
            .map(|t| t.id.clone())
    }
}

/// Body of `PUT /trades/{id}/close`.
#[derive(Debug, Clone, Serialize)]
pub struct CloseTradeRequest {
    /// Unit count or `ALL`
    pub units: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTradeResponse {
    pub order_fill_transaction: Option<FillTransaction>,
}

/// Body of `PUT /positions/{instrument}/close`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_units: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_units: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionResponse {
    pub long_order_fill_transaction: Option<FillTransaction>,
    pub short_order_fill_transaction: Option<FillTransaction>,
}

/// Response of `GET /summary`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSummaryResponse {
    pub account: AccountWire,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountWire {
    pub balance: Decimal,
}

/// Magnitude of a signed wire unit count.
pub fn unit_count(units: Decimal) -> u64 {
    units.abs().trunc().to_u64().unwrap_or(0)
}

/// Decimal P/L as f64.
pub fn pnl(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
