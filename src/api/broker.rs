//! Broker abstraction: the order API the gateway drives, its error taxonomy
//! and acknowledgement types.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AttachedOrder, AttachedTrailing, EntryOrder, Instrument, Side, WirePrice};

/// Machine-readable broker rejection codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    TradeNotFound,
    OrderNotFound,
    PositionNotFound,
    InvalidModify,
    Other(String),
    Unspecified,
}

impl RejectCode {
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("NO_SUCH_TRADE") | Some("TRADE_DOESNT_EXIST") => Self::TradeNotFound,
            Some("ORDER_DOESNT_EXIST") | Some("NO_SUCH_ORDER") => Self::OrderNotFound,
            Some("CLOSEOUT_POSITION_DOESNT_EXIST") => Self::PositionNotFound,
            Some(c) if c.contains("PRICE_PRECISION") || c.contains("INVALID") => {
                Self::InvalidModify
            }
            Some(c) => Self::Other(c.to_string()),
            None => Self::Unspecified,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::TradeNotFound => "NO_SUCH_TRADE",
            Self::OrderNotFound => "ORDER_DOESNT_EXIST",
            Self::PositionNotFound => "CLOSEOUT_POSITION_DOESNT_EXIST",
            Self::InvalidModify => "INVALID_MODIFY",
            Self::Other(c) => c,
            Self::Unspecified => "UNSPECIFIED",
        }
    }

    /// The target of the request no longer exists at the broker.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            Self::TradeNotFound | Self::OrderNotFound | Self::PositionNotFound
        )
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from a single broker request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker returned HTTP {status}: {code} {message}")]
    Api {
        status: u16,
        code: RejectCode,
        message: String,
    },

    #[error("malformed broker response: {0}")]
    Decode(String),
}

impl BrokerError {
    /// Timeouts, transport failures, 5xx and 429 are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) => false,
        }
    }

    pub fn reject_code(&self) -> Option<&RejectCode> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Convenience for a 4xx rejection.
    pub fn rejected(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: RejectCode::from_code(Some(code)),
            message: message.into(),
        }
    }
}

/// Result of submitting an entry order.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryAck {
    Filled {
        order_id: String,
        trade_id: String,
        price: Decimal,
        units: u64,
        time: DateTime<Utc>,
    },
    Pending {
        order_id: String,
    },
    Cancelled {
        order_id: String,
        reason: String,
    },
}

/// Acknowledgement of a dependent-order change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderAck {
    pub order_id: Option<String>,
}

/// Acknowledgement of a full or partial close.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseAck {
    pub price: Option<Decimal>,
    pub units: u64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Filled,
    Triggered,
    Cancelled,
}

/// Broker view of an order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub id: String,
    pub state: OrderState,
    pub client_id: Option<String>,
    pub trade_id: Option<String>,
    pub fill_price: Option<Decimal>,
    pub units: u64,
    pub fill_time: Option<DateTime<Utc>>,
}

impl OrderSnapshot {
    /// Interpret an order found during reconciliation as an entry result.
    pub fn to_entry_ack(&self) -> EntryAck {
        match (self.state, &self.trade_id, self.fill_price) {
            (OrderState::Filled, Some(trade_id), Some(price)) => EntryAck::Filled {
                order_id: self.id.clone(),
                trade_id: trade_id.clone(),
                price,
                units: self.units,
                time: self.fill_time.unwrap_or_else(Utc::now),
            },
            (OrderState::Cancelled, _, _) => EntryAck::Cancelled {
                order_id: self.id.clone(),
                reason: "cancelled".to_string(),
            },
            _ => EntryAck::Pending {
                order_id: self.id.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Open,
    Closed,
}

/// Broker view of a trade and its attached orders.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSnapshot {
    pub id: String,
    pub instrument: Instrument,
    pub state: TradeState,
    pub units: u64,
    pub price: Decimal,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub close_price: Option<Decimal>,
    pub stop_loss: Option<AttachedOrder>,
    pub take_profit: Option<AttachedOrder>,
    pub trailing_stop: Option<AttachedTrailing>,
}

/// Order API of an FX broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn place_order(&self, order: &EntryOrder) -> Result<EntryAck, BrokerError>;

    /// Look up an order by the correlation id in its client extensions.
    async fn order_by_client_id(&self, client_id: &str)
        -> Result<Option<OrderSnapshot>, BrokerError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn get_trade(&self, trade_id: &str) -> Result<TradeSnapshot, BrokerError>;

    /// Replace the trade's stop-loss.
    async fn modify_stop_loss(&self, trade_id: &str, price: &WirePrice)
        -> Result<OrderAck, BrokerError>;

    /// Replace the trade's take-profit.
    async fn modify_take_profit(&self, trade_id: &str, price: &WirePrice)
        -> Result<OrderAck, BrokerError>;

    /// Replace the trade's trailing stop.
    async fn modify_trailing_stop(
        &self,
        trade_id: &str,
        distance: &WirePrice,
    ) -> Result<OrderAck, BrokerError>;

    /// Close `units` of a trade, or all of it.
    async fn close_trade(&self, trade_id: &str, units: Option<u64>)
        -> Result<CloseAck, BrokerError>;

    /// Close the whole position on one side of an instrument.
    async fn close_position(&self, instrument: &Instrument, side: Side)
        -> Result<CloseAck, BrokerError>;

    async fn account_balance(&self) -> Result<Decimal, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(BrokerError::Transport("reset".into()).is_transient());
        assert!(BrokerError::rejected(503, "SERVICE_UNAVAILABLE", "").is_transient());
        assert!(BrokerError::rejected(429, "RATE_LIMITED", "").is_transient());
        assert!(!BrokerError::rejected(404, "NO_SUCH_TRADE", "gone").is_transient());
        assert!(!BrokerError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn test_reject_codes() {
        assert_eq!(RejectCode::from_code(Some("NO_SUCH_TRADE")), RejectCode::TradeNotFound);
        assert_eq!(RejectCode::from_code(Some("ORDER_DOESNT_EXIST")), RejectCode::OrderNotFound);
        assert_eq!(
            RejectCode::from_code(Some("STOP_LOSS_ON_FILL_PRICE_PRECISION_EXCEEDED")),
            RejectCode::InvalidModify
        );
        assert_eq!(RejectCode::from_code(None), RejectCode::Unspecified);
        assert!(RejectCode::TradeNotFound.is_gone());
        assert!(!RejectCode::InvalidModify.is_gone());
    }

    #[test]
    fn test_reconciled_order_to_ack() {
        let snap = OrderSnapshot {
            id: "42".into(),
            state: OrderState::Filled,
            client_id: Some("abc".into()),
            trade_id: Some("43".into()),
            fill_price: Some(Decimal::new(15000, 2)),
            units: 1000,
            fill_time: None,
        };
        assert!(matches!(snap.to_entry_ack(), EntryAck::Filled { ref trade_id, .. } if trade_id == "43"));
    }
}
