//! Order model: entry intents, dependent orders and client correlation tags.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Instrument, WirePrice};

/// Broker limit on client extension comments.
pub const MAX_COMMENT_BYTES: usize = 240;

/// Tag stamped on every order this agent creates.
pub const CLIENT_TAG: &str = "fxguard";

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Signed unit count as the broker expects it.
    pub fn signed_units(&self, units: u64) -> i64 {
        let units = i64::try_from(units).unwrap_or(i64::MAX);
        match self {
            Side::Long => units,
            Side::Short => -units,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Some(Side::Long),
            "short" | "sell" => Some(Side::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order kinds the agent creates or manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    TakeProfit,
    StopLoss,
    TrailingStop,
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Fill or kill.
    #[serde(rename = "FOK")]
    Fok,
    /// Good till cancelled.
    #[serde(rename = "GTC")]
    Gtc,
    /// Good till date.
    #[serde(rename = "GTD")]
    Gtd,
}

/// Correlation data embedded in an entry order so a resubmission after a
/// timeout can be matched against what the broker already accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientExtensions {
    /// Caller-generated correlation id, unique per logical entry.
    pub id: String,
    pub tag: String,
    pub comment: String,
}

impl ClientExtensions {
    /// Create extensions with a fresh correlation id.
    pub fn generate(mode: &str, tp_pips: f64, sl_pips: f64) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let comment = serde_json::json!({
            "entry_uuid": id,
            "mode": mode,
            "tp": tp_pips,
            "sl": sl_pips,
        })
        .to_string();

        Self {
            id,
            tag: CLIENT_TAG.to_string(),
            comment: truncate_utf8(&comment, MAX_COMMENT_BYTES),
        }
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// An entry order ready for submission. All prices are already formatted.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryOrder {
    pub instrument: Instrument,
    pub side: Side,
    pub units: u64,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub limit_price: Option<WirePrice>,
    pub good_till: Option<DateTime<Utc>>,
    pub take_profit: Option<WirePrice>,
    pub stop_loss: Option<WirePrice>,
    pub client: ClientExtensions,
}

impl EntryOrder {
    /// Market order, fill-or-kill.
    pub fn market(instrument: Instrument, side: Side, units: u64, client: ClientExtensions) -> Self {
        Self {
            instrument,
            side,
            units,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Fok,
            limit_price: None,
            good_till: None,
            take_profit: None,
            stop_loss: None,
            client,
        }
    }

    /// Limit order, good till `good_till`.
    pub fn limit(
        instrument: Instrument,
        side: Side,
        units: u64,
        price: Decimal,
        good_till: DateTime<Utc>,
        client: ClientExtensions,
    ) -> Self {
        let limit_price = Some(instrument.format_price(price));
        Self {
            instrument,
            side,
            units,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtd,
            limit_price,
            good_till: Some(good_till),
            take_profit: None,
            stop_loss: None,
            client,
        }
    }

    /// Attach take-profit and stop-loss prices that activate on fill.
    pub fn with_protection(mut self, take_profit: Option<Decimal>, stop_loss: Decimal) -> Self {
        self.take_profit = take_profit.map(|p| self.instrument.format_price(p));
        self.stop_loss = Some(self.instrument.format_price(stop_loss));
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.client.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_client_extensions_are_unique() {
        let a = ClientExtensions::generate("market", 30.0, 20.0);
        let b = ClientExtensions::generate("market", 30.0, 20.0);
        assert_ne!(a.id, b.id);
        assert_eq!(a.tag, CLIENT_TAG);
        assert!(a.comment.contains(&a.id));
    }

    #[test]
    fn test_comment_truncated_on_char_boundary() {
        let long = "é".repeat(200);
        let out = truncate_utf8(&long, MAX_COMMENT_BYTES);
        assert!(out.len() <= MAX_COMMENT_BYTES);
        assert_eq!(out.chars().count(), 120);
    }

    #[test]
    fn test_entry_order_formats_prices() {
        let client = ClientExtensions::generate("limit", 30.0, 20.0);
        let order = EntryOrder::limit(
            Instrument::new("USD_JPY"),
            Side::Long,
            1000,
            dec!(149.95049),
            Utc::now(),
            client,
        )
        .with_protection(Some(dec!(150.25)), dec!(149.7549));

        assert_eq!(order.limit_price.as_ref().map(|p| p.as_str()), Some("149.950"));
        assert_eq!(order.take_profit.as_ref().map(|p| p.as_str()), Some("150.250"));
        assert_eq!(order.stop_loss.as_ref().map(|p| p.as_str()), Some("149.755"));
        assert_eq!(order.time_in_force, TimeInForce::Gtd);
    }

    #[test]
    fn test_signed_units() {
        assert_eq!(Side::Long.signed_units(1000), 1000);
        assert_eq!(Side::Short.signed_units(1000), -1000);
    }
}
