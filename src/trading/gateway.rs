//! Order gateway: turns an order intent into exactly one logical broker
//! side-effect over an unreliable transport.
//!
//! - Every call carries a fixed request timeout; a timeout is transient.
//! - Transient failures (timeouts, transport, 5xx, 429) are retried with
//!   capped exponential backoff up to `max_attempts`.
//! - Business rejections (4xx) are terminal and come back as
//!   [`GatewayOutcome::Rejected`] so callers drop the mutation.
//! - Entry retries first look the order up by correlation id, so an order
//!   that was accepted before its response was lost is not duplicated.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{
    Broker, BrokerError, CloseAck, EntryAck, OrderAck, OrderSnapshot, RejectCode, TradeSnapshot,
};
use crate::models::{EntryOrder, Instrument, Side};

use super::config::{ConfigSnapshot, GatewayConfig};
use super::outcome::{SkipReason, Verdict};

/// Terminal broker rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub status: u16,
    pub code: RejectCode,
    pub message: String,
}

/// Result of one gateway operation.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOutcome<T> {
    /// The broker applied the request
    Applied(T),
    /// The broker refused it; nothing changed
    Rejected(Rejection),
    /// Retries ran out or the response was unusable
    Failed { attempts: u32, error: BrokerError },
}

impl<T> GatewayOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(v) => Some(v),
            _ => None,
        }
    }

    /// Collapse into a verdict, turning failures into skip reasons.
    pub fn into_verdict(self) -> Verdict<T> {
        match self {
            Self::Applied(v) => Verdict::Act(v),
            Self::Rejected(r) => Verdict::Skip(SkipReason::BrokerRejected {
                code: r.code.to_string(),
                message: r.message,
            }),
            Self::Failed { attempts, error } => Verdict::Skip(SkipReason::BrokerUnavailable {
                attempts,
                error: error.to_string(),
            }),
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

/// Retrying, idempotent wrapper over a [`Broker`].
pub struct OrderGateway {
    broker: Arc<dyn Broker>,
    config: watch::Receiver<ConfigSnapshot>,
}

impl OrderGateway {
    /// Create a gateway reading its retry policy from the live config.
    pub fn new(broker: Arc<dyn Broker>, config: watch::Receiver<ConfigSnapshot>) -> Self {
        Self { broker, config }
    }

    fn settings(&self) -> GatewayConfig {
        self.config.borrow().config.gateway.clone()
    }

    /// Submit an entry order.
    pub async fn place_entry(&self, order: &EntryOrder) -> GatewayOutcome<EntryAck> {
        let client_id = order.correlation_id().to_string();
        let broker = &self.broker;

        self.execute("place_entry", |attempt| {
            let client_id = client_id.clone();
            async move {
                if attempt > 1 {
                    match broker.order_by_client_id(&client_id).await {
                        Ok(Some(existing)) => {
                            info!(
                                client_id = %client_id,
                                order_id = %existing.id,
                                "Entry already accepted by broker, not resubmitting"
                            );
                            return Ok(existing.to_entry_ack());
                        }
                        Ok(None) => {}
                        Err(e) => return Err(e),
                    }
                }
                broker.place_order(order).await
            }
        })
        .await
    }

    /// Look up an entry by correlation id.
    pub async fn find_entry(&self, client_id: &str) -> GatewayOutcome<Option<OrderSnapshot>> {
        self.execute("find_entry", |_| self.broker.order_by_client_id(client_id))
            .await
    }

    pub async fn get_order(&self, order_id: &str) -> GatewayOutcome<OrderSnapshot> {
        self.execute("get_order", |_| self.broker.get_order(order_id)).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> GatewayOutcome<()> {
        self.execute("cancel_order", |_| self.broker.cancel_order(order_id))
            .await
    }

    pub async fn get_trade(&self, trade_id: &str) -> GatewayOutcome<TradeSnapshot> {
        self.execute("get_trade", |_| self.broker.get_trade(trade_id)).await
    }

    /// Replace the stop-loss at `price`, rounded to the instrument precision.
    pub async fn modify_stop_loss(
        &self,
        instrument: &Instrument,
        trade_id: &str,
        price: Decimal,
    ) -> GatewayOutcome<OrderAck> {
        let wire = instrument.format_price(price);
        debug!(trade_id, price = %wire, "Modifying stop-loss");
        self.execute("modify_stop_loss", |_| {
            self.broker.modify_stop_loss(trade_id, &wire)
        })
        .await
    }

    /// Replace the take-profit at `price`, rounded to the instrument precision.
    pub async fn modify_take_profit(
        &self,
        instrument: &Instrument,
        trade_id: &str,
        price: Decimal,
    ) -> GatewayOutcome<OrderAck> {
        let wire = instrument.format_price(price);
        debug!(trade_id, price = %wire, "Modifying take-profit");
        self.execute("modify_take_profit", |_| {
            self.broker.modify_take_profit(trade_id, &wire)
        })
        .await
    }

    /// Replace the trailing stop with `distance_pips`.
    pub async fn modify_trailing_stop(
        &self,
        instrument: &Instrument,
        trade_id: &str,
        distance_pips: f64,
    ) -> GatewayOutcome<OrderAck> {
        let wire = instrument.format_distance(distance_pips);
        debug!(trade_id, distance = %wire, "Modifying trailing stop");
        self.execute("modify_trailing_stop", |_| {
            self.broker.modify_trailing_stop(trade_id, &wire)
        })
        .await
    }

    /// Close part of a trade.
    pub async fn reduce_trade(&self, trade_id: &str, units: u64) -> GatewayOutcome<CloseAck> {
        self.execute("reduce_trade", |_| {
            self.broker.close_trade(trade_id, Some(units))
        })
        .await
    }

    /// Close the whole position on one side of an instrument.
    pub async fn close_position(&self, instrument: &Instrument, side: Side) -> GatewayOutcome<CloseAck> {
        self.execute("close_position", |_| {
            self.broker.close_position(instrument, side)
        })
        .await
    }

    pub async fn account_balance(&self) -> GatewayOutcome<Decimal> {
        self.execute("account_balance", |_| self.broker.account_balance())
            .await
    }

    /// Run `call` under the retry policy. `call` receives the 1-based attempt.
    async fn execute<T, F, Fut>(&self, op: &'static str, mut call: F) -> GatewayOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let settings = self.settings();
        let timeout = Duration::from_millis(settings.request_timeout_ms);
        let max_attempts = settings.max_attempts.max(1);

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(settings.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(settings.max_backoff_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        let mut attempts = 0u32;
        let result = retry(policy, || {
            attempts += 1;
            let attempt = attempts;
            let fut = call(attempt);
            async move {
                let result = match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(BrokerError::Timeout(timeout)),
                };

                match result {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        warn!(op, attempt, max_attempts, error = %e, "Transient broker failure, retrying");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await;

        match result {
            Ok(value) => GatewayOutcome::Applied(value),
            Err(BrokerError::Api {
                status,
                code,
                message,
            }) if status != 429 && status < 500 => {
                warn!(op, status, code = %code, message = %message, "Broker rejected request, dropping it");
                GatewayOutcome::Rejected(Rejection {
                    status,
                    code,
                    message,
                })
            }
            Err(error) => {
                error!(op, attempts, error = %error, "Broker request failed");
                GatewayOutcome::Failed { attempts, error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BrokerOp, PaperBroker};
    use crate::models::{ClientExtensions, Quote};
    use crate::trading::config::{AgentConfig, ConfigHandle};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn fast_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.gateway.max_attempts = 3;
        config.gateway.initial_backoff_ms = 1;
        config.gateway.max_backoff_ms = 4;
        config.gateway.request_timeout_ms = 200;
        config
    }

    async fn setup() -> (Arc<PaperBroker>, OrderGateway, ConfigHandle, String) {
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        let usd_jpy = Instrument::new("USD_JPY");
        broker
            .set_quote(&usd_jpy, Quote { bid: dec!(149.99), ask: dec!(150.00), time: Utc::now() })
            .await;

        let order = EntryOrder::market(usd_jpy, Side::Long, 1000, ClientExtensions::generate("market", 30.0, 20.0))
            .with_protection(Some(dec!(150.30)), dec!(149.80));
        let EntryAck::Filled { trade_id, .. } = broker.place_order(&order).await.unwrap() else {
            panic!("expected fill");
        };

        let handle = ConfigHandle::new(fast_config(), None);
        let gateway = OrderGateway::new(broker.clone(), handle.subscribe());
        (broker, gateway, handle, trade_id)
    }

    #[tokio::test]
    async fn test_terminal_rejection_not_retried() {
        let (broker, gateway, _h, trade_id) = setup().await;
        broker
            .fail_next(BrokerOp::ModifyStopLoss, BrokerError::rejected(404, "NO_SUCH_TRADE", "gone"))
            .await;

        let outcome = gateway
            .modify_stop_loss(&Instrument::new("USD_JPY"), &trade_id, dec!(150.00))
            .await;

        assert_eq!(outcome.rejection().map(|r| r.code.clone()), Some(RejectCode::TradeNotFound));
        assert_eq!(broker.call_count(BrokerOp::ModifyStopLoss).await, 1);
    }

    #[tokio::test]
    async fn test_timeout_retried_up_to_max_attempts() {
        let (broker, gateway, _h, trade_id) = setup().await;
        for _ in 0..5 {
            broker
                .fail_next(BrokerOp::ModifyTrailingStop, BrokerError::Timeout(Duration::from_millis(200)))
                .await;
        }

        let outcome = gateway
            .modify_trailing_stop(&Instrument::new("USD_JPY"), &trade_id, 6.0)
            .await;

        assert!(matches!(outcome, GatewayOutcome::Failed { attempts: 3, .. }));
        assert_eq!(broker.call_count(BrokerOp::ModifyTrailingStop).await, 3);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let (broker, gateway, _h, trade_id) = setup().await;
        broker
            .fail_next(BrokerOp::ModifyTakeProfit, BrokerError::rejected(503, "SERVICE_UNAVAILABLE", ""))
            .await;

        let outcome = gateway
            .modify_take_profit(&Instrument::new("USD_JPY"), &trade_id, dec!(150.4004))
            .await;

        assert!(outcome.is_applied());
        assert_eq!(broker.call_count(BrokerOp::ModifyTakeProfit).await, 2);
        let snap = broker.trade(&trade_id).await.unwrap();
        assert_eq!(snap.take_profit.map(|t| t.price), Some(dec!(150.400)));
    }

    #[tokio::test]
    async fn test_slow_broker_hits_request_timeout() {
        let broker = Arc::new(PaperBroker::new(dec!(10000)).with_latency(Duration::from_millis(300)));
        let handle = ConfigHandle::new(fast_config(), None);
        let gateway = OrderGateway::new(broker.clone(), handle.subscribe());

        let outcome = gateway.get_trade("1").await;
        match outcome {
            GatewayOutcome::Failed { attempts, error } => {
                assert_eq!(attempts, 3);
                assert!(matches!(error, BrokerError::Timeout(_)));
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lost_entry_response_reconciled_by_correlation_id() {
        let (broker, gateway, _h, _) = setup().await;
        let submitted_before = broker.call_count(BrokerOp::PlaceOrder).await;
        broker
            .fail_after_apply(BrokerOp::PlaceOrder, BrokerError::Timeout(Duration::from_millis(200)))
            .await;

        let order = EntryOrder::market(
            Instrument::new("USD_JPY"),
            Side::Short,
            2000,
            ClientExtensions::generate("market", 30.0, 20.0),
        )
        .with_protection(None, dec!(150.20));

        let outcome = gateway.place_entry(&order).await;
        assert!(matches!(outcome, GatewayOutcome::Applied(EntryAck::Filled { units: 2000, .. })));
        // One submission, one reconciliation lookup, no duplicate order
        assert_eq!(broker.call_count(BrokerOp::PlaceOrder).await, submitted_before + 1);
        assert_eq!(broker.call_count(BrokerOp::OrderByClientId).await, 1);
    }

    #[tokio::test]
    async fn test_retry_policy_follows_reload() {
        let (broker, gateway, handle, trade_id) = setup().await;
        let mut config = fast_config();
        config.gateway.max_attempts = 1;
        handle.publish(config).unwrap();

        broker
            .fail_next(BrokerOp::ModifyStopLoss, BrokerError::Transport("reset".into()))
            .await;
        let outcome = gateway
            .modify_stop_loss(&Instrument::new("USD_JPY"), &trade_id, dec!(150.00))
            .await;

        assert!(matches!(outcome, GatewayOutcome::Failed { attempts: 1, .. }));
        assert_eq!(broker.call_count(BrokerOp::ModifyStopLoss).await, 1);
    }
}
