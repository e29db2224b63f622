//! In-memory paper broker for dry runs. Fills against the latest quote,
//! triggers stops and targets as quotes move, and records every call.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::{
    AttachedOrder, AttachedTrailing, EntryOrder, Instrument, OrderType, Quote, Side, WirePrice,
};

use super::broker::{
    Broker, BrokerError, CloseAck, EntryAck, OrderAck, OrderSnapshot, OrderState, TradeSnapshot,
    TradeState,
};

/// Broker operations, for call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    PlaceOrder,
    OrderByClientId,
    GetOrder,
    CancelOrder,
    GetTrade,
    ModifyStopLoss,
    ModifyTakeProfit,
    ModifyTrailingStop,
    CloseTrade,
    ClosePosition,
    AccountBalance,
}

/// One recorded broker call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub op: BrokerOp,
    pub target: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
struct ScriptedFailure {
    error: BrokerError,
    /// Apply the request, then lose the response
    after_apply: bool,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: String,
    instrument: Instrument,
    side: Side,
    units: u64,
    limit_price: Decimal,
    client_id: String,
    state: OrderState,
    expires: Option<DateTime<Utc>>,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
    trade_id: Option<String>,
    fill_price: Option<Decimal>,
    fill_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct PaperTrailing {
    id: String,
    distance: Decimal,
    extreme: Decimal,
}

#[derive(Debug, Clone)]
struct PaperTrade {
    id: String,
    instrument: Instrument,
    side: Side,
    units: u64,
    price: Decimal,
    state: TradeState,
    realized_pnl: f64,
    close_price: Option<Decimal>,
    stop_loss: Option<AttachedOrder>,
    take_profit: Option<AttachedOrder>,
    trailing: Option<PaperTrailing>,
}

impl PaperTrade {
    fn pnl_at(&self, price: Decimal, units: u64) -> f64 {
        ((price - self.price) * self.side.sign() * Decimal::from(units))
            .to_f64()
            .unwrap_or(0.0)
    }

    fn snapshot(&self, quote: Option<&Quote>) -> TradeSnapshot {
        let unrealized = match (self.state, quote) {
            (TradeState::Open, Some(q)) => self.pnl_at(q.exit_price(self.side), self.units),
            _ => 0.0,
        };

        TradeSnapshot {
            id: self.id.clone(),
            instrument: self.instrument.clone(),
            state: self.state,
            units: self.units,
            price: self.price,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: unrealized,
            close_price: self.close_price,
            stop_loss: self.stop_loss.clone(),
            take_profit: self.take_profit.clone(),
            trailing_stop: self.trailing.as_ref().map(|t| AttachedTrailing {
                id: Some(t.id.clone()),
                distance_pips: self.instrument.price_to_pips(t.distance),
            }),
        }
    }
}

#[derive(Default)]
struct PaperState {
    next_id: u64,
    balance: Decimal,
    quotes: HashMap<Instrument, Quote>,
    orders: HashMap<String, PaperOrder>,
    trades: HashMap<String, PaperTrade>,
    calls: Vec<RecordedCall>,
    failures: HashMap<BrokerOp, VecDeque<ScriptedFailure>>,
}

impl PaperState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn record(&mut self, op: BrokerOp, target: &str, value: Option<String>) {
        self.calls.push(RecordedCall {
            op,
            target: target.to_string(),
            value,
        });
    }

    fn take_failure(&mut self, op: BrokerOp, after_apply: bool) -> Option<BrokerError> {
        let queue = self.failures.get_mut(&op)?;
        if queue.front().map(|f| f.after_apply) == Some(after_apply) {
            queue.pop_front().map(|f| f.error)
        } else {
            None
        }
    }

    fn open_trade_mut(&mut self, trade_id: &str) -> Result<&mut PaperTrade, BrokerError> {
        match self.trades.get_mut(trade_id) {
            Some(t) if t.state == TradeState::Open => Ok(t),
            _ => Err(BrokerError::rejected(404, "NO_SUCH_TRADE", format!("trade {} not open", trade_id))),
        }
    }

    fn open_trade(
        &mut self,
        instrument: &Instrument,
        side: Side,
        units: u64,
        price: Decimal,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> String {
        let trade_id = self.next_id();
        let stop_loss = stop_loss.map(|price| AttachedOrder {
            id: Some(self.next_id()),
            price,
        });
        let take_profit = take_profit.map(|price| AttachedOrder {
            id: Some(self.next_id()),
            price,
        });

        self.trades.insert(
            trade_id.clone(),
            PaperTrade {
                id: trade_id.clone(),
                instrument: instrument.clone(),
                side,
                units,
                price,
                state: TradeState::Open,
                realized_pnl: 0.0,
                close_price: None,
                stop_loss,
                take_profit,
                trailing: None,
            },
        );
        trade_id
    }

    fn close(&mut self, trade_id: &str, price: Decimal, units: Option<u64>) -> Result<CloseAck, BrokerError> {
        let trade = self.open_trade_mut(trade_id)?;
        let units = units.unwrap_or(trade.units).min(trade.units);
        let pnl = trade.pnl_at(price, units);

        trade.units -= units;
        trade.realized_pnl += pnl;
        if trade.units == 0 {
            trade.state = TradeState::Closed;
            trade.close_price = Some(price);
        }
        self.balance += Decimal::try_from(pnl).unwrap_or(Decimal::ZERO);

        Ok(CloseAck {
            price: Some(price),
            units,
            realized_pnl: pnl,
        })
    }

    fn exit_price(&self, instrument: &Instrument, side: Side) -> Result<Decimal, BrokerError> {
        self.quotes
            .get(instrument)
            .map(|q| q.exit_price(side))
            .ok_or_else(|| BrokerError::rejected(400, "NO_QUOTE", format!("no quote for {}", instrument)))
    }
}

/// Simulated broker.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    latency: Option<Duration>,
}

impl PaperBroker {
    /// Create a paper broker with a starting balance.
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                balance,
                ..PaperState::default()
            }),
            latency: None,
        }
    }

    /// Delay every response, to exercise request timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Feed a new quote: fills limits, expires GTD orders, and triggers
    /// stops, trailing stops and targets.
    pub async fn set_quote(&self, instrument: &Instrument, quote: Quote) {
        let mut st = self.state.lock().await;
        st.quotes.insert(instrument.clone(), quote);

        let pending: Vec<String> = st
            .orders
            .values()
            .filter(|o| o.instrument == *instrument && o.state == OrderState::Pending)
            .map(|o| o.id.clone())
            .collect();

        for order_id in pending {
            let Some(order) = st.orders.get(&order_id).cloned() else {
                continue;
            };
            if order.expires.map(|e| quote.time >= e).unwrap_or(false) {
                if let Some(o) = st.orders.get_mut(&order_id) {
                    o.state = OrderState::Cancelled;
                }
                continue;
            }

            let fill = match order.side {
                Side::Long => quote.ask <= order.limit_price,
                Side::Short => quote.bid >= order.limit_price,
            };
            if fill {
                let trade_id = st.open_trade(
                    instrument,
                    order.side,
                    order.units,
                    order.limit_price,
                    order.take_profit,
                    order.stop_loss,
                );
                if let Some(o) = st.orders.get_mut(&order_id) {
                    o.state = OrderState::Filled;
                    o.trade_id = Some(trade_id);
                    o.fill_price = Some(order.limit_price);
                    o.fill_time = Some(quote.time);
                }
                debug!(order_id = %order_id, "Paper limit filled");
            }
        }

        let open: Vec<String> = st
            .trades
            .values()
            .filter(|t| t.instrument == *instrument && t.state == TradeState::Open)
            .map(|t| t.id.clone())
            .collect();

        for trade_id in open {
            let (price, hit) = {
                let Some(trade) = st.trades.get_mut(&trade_id) else {
                    continue;
                };
                let price = quote.exit_price(trade.side);
                let sign = trade.side.sign();

                if let Some(t) = trade.trailing.as_mut() {
                    if (price - t.extreme) * sign > Decimal::ZERO {
                        t.extreme = price;
                    }
                }

                let stop_hit = trade
                    .stop_loss
                    .as_ref()
                    .map(|s| (price - s.price) * sign <= Decimal::ZERO)
                    .unwrap_or(false);
                let trail_hit = trade
                    .trailing
                    .as_ref()
                    .map(|t| (t.extreme - price) * sign >= t.distance)
                    .unwrap_or(false);
                let target_hit = trade
                    .take_profit
                    .as_ref()
                    .map(|tp| (price - tp.price) * sign >= Decimal::ZERO)
                    .unwrap_or(false);

                (price, stop_hit || trail_hit || target_hit)
            };

            if hit {
                if let Ok(ack) = st.close(&trade_id, price, None) {
                    info!(trade_id = %trade_id, price = %price, pnl = ack.realized_pnl, "Paper trade closed by broker-side order");
                }
            }
        }
    }

    /// Every call recorded so far.
    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of calls of one kind.
    pub async fn call_count(&self, op: BrokerOp) -> usize {
        self.state.lock().await.calls.iter().filter(|c| c.op == op).count()
    }

    /// Fail the next call of `op` with `error` before touching state.
    #[cfg(test)]
    pub async fn fail_next(&self, op: BrokerOp, error: BrokerError) {
        self.push_failure(op, error, false).await;
    }

    /// Apply the next call of `op`, then report `error` instead of the result.
    #[cfg(test)]
    pub async fn fail_after_apply(&self, op: BrokerOp, error: BrokerError) {
        self.push_failure(op, error, true).await;
    }

    #[cfg(test)]
    async fn push_failure(&self, op: BrokerOp, error: BrokerError, after_apply: bool) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(ScriptedFailure { error, after_apply });
    }

    /// Drop a trade's stop-loss as if the broker had silently removed it.
    #[cfg(test)]
    pub async fn drop_stop_loss(&self, trade_id: &str) {
        if let Some(t) = self.state.lock().await.trades.get_mut(trade_id) {
            t.stop_loss = None;
        }
    }

    /// Replace a trade's take-profit out of band.
    #[cfg(test)]
    pub async fn set_take_profit(&self, trade_id: &str, price: Decimal) {
        if let Some(t) = self.state.lock().await.trades.get_mut(trade_id) {
            t.take_profit = Some(AttachedOrder { id: Some("ext".into()), price });
        }
    }

    /// Current broker view of a trade.
    pub async fn trade(&self, trade_id: &str) -> Option<TradeSnapshot> {
        let st = self.state.lock().await;
        let trade = st.trades.get(trade_id)?;
        Some(trade.snapshot(st.quotes.get(&trade.instrument)))
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_order(&self, order: &EntryOrder) -> Result<EntryAck, BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::PlaceOrder, order.instrument.as_str(), Some(order.units.to_string()));
        if let Some(e) = st.take_failure(BrokerOp::PlaceOrder, false) {
            return Err(e);
        }

        let order_id = st.next_id();
        let take_profit = order.take_profit.as_ref().map(WirePrice::to_decimal);
        let stop_loss = order.stop_loss.as_ref().map(WirePrice::to_decimal);

        let ack = match order.order_type {
            OrderType::Limit => {
                let limit_price = order
                    .limit_price
                    .as_ref()
                    .map(WirePrice::to_decimal)
                    .ok_or_else(|| BrokerError::rejected(400, "INVALID_PRICE", "limit order without price"))?;

                st.orders.insert(
                    order_id.clone(),
                    PaperOrder {
                        id: order_id.clone(),
                        instrument: order.instrument.clone(),
                        side: order.side,
                        units: order.units,
                        limit_price,
                        client_id: order.client.id.clone(),
                        state: OrderState::Pending,
                        expires: order.good_till,
                        take_profit,
                        stop_loss,
                        trade_id: None,
                        fill_price: None,
                        fill_time: None,
                    },
                );
                EntryAck::Pending { order_id }
            }
            _ => {
                let quote = *st.quotes.get(&order.instrument).ok_or_else(|| {
                    BrokerError::rejected(400, "NO_QUOTE", format!("no quote for {}", order.instrument))
                })?;
                let price = quote.entry_price(order.side);
                let trade_id =
                    st.open_trade(&order.instrument, order.side, order.units, price, take_profit, stop_loss);

                st.orders.insert(
                    order_id.clone(),
                    PaperOrder {
                        id: order_id.clone(),
                        instrument: order.instrument.clone(),
                        side: order.side,
                        units: order.units,
                        limit_price: price,
                        client_id: order.client.id.clone(),
                        state: OrderState::Filled,
                        expires: None,
                        take_profit,
                        stop_loss,
                        trade_id: Some(trade_id.clone()),
                        fill_price: Some(price),
                        fill_time: Some(quote.time),
                    },
                );
                EntryAck::Filled {
                    order_id,
                    trade_id,
                    price,
                    units: order.units,
                    time: quote.time,
                }
            }
        };

        if let Some(e) = st.take_failure(BrokerOp::PlaceOrder, true) {
            return Err(e);
        }
        Ok(ack)
    }

    async fn order_by_client_id(&self, client_id: &str) -> Result<Option<OrderSnapshot>, BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::OrderByClientId, client_id, None);
        if let Some(e) = st.take_failure(BrokerOp::OrderByClientId, false) {
            return Err(e);
        }

        Ok(st
            .orders
            .values()
            .find(|o| o.client_id == client_id)
            .map(order_snapshot))
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::GetOrder, order_id, None);
        if let Some(e) = st.take_failure(BrokerOp::GetOrder, false) {
            return Err(e);
        }

        st.orders
            .get(order_id)
            .map(order_snapshot)
            .ok_or_else(|| BrokerError::rejected(404, "ORDER_DOESNT_EXIST", format!("order {}", order_id)))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::CancelOrder, order_id, None);
        if let Some(e) = st.take_failure(BrokerOp::CancelOrder, false) {
            return Err(e);
        }

        match st.orders.get_mut(order_id) {
            Some(o) if o.state == OrderState::Pending => {
                o.state = OrderState::Cancelled;
                Ok(())
            }
            _ => Err(BrokerError::rejected(404, "ORDER_DOESNT_EXIST", format!("order {} not pending", order_id))),
        }
    }

    async fn get_trade(&self, trade_id: &str) -> Result<TradeSnapshot, BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::GetTrade, trade_id, None);
        if let Some(e) = st.take_failure(BrokerOp::GetTrade, false) {
            return Err(e);
        }

        let trade = st
            .trades
            .get(trade_id)
            .ok_or_else(|| BrokerError::rejected(404, "NO_SUCH_TRADE", format!("trade {}", trade_id)))?;
        Ok(trade.snapshot(st.quotes.get(&trade.instrument)))
    }

    async fn modify_stop_loss(&self, trade_id: &str, price: &WirePrice) -> Result<OrderAck, BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::ModifyStopLoss, trade_id, Some(price.to_string()));
        if let Some(e) = st.take_failure(BrokerOp::ModifyStopLoss, false) {
            return Err(e);
        }

        let id = st.next_id();
        let trade = st.open_trade_mut(trade_id)?;
        trade.stop_loss = Some(AttachedOrder {
            id: Some(id.clone()),
            price: price.to_decimal(),
        });
        Ok(OrderAck { order_id: Some(id) })
    }

    async fn modify_take_profit(&self, trade_id: &str, price: &WirePrice) -> Result<OrderAck, BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::ModifyTakeProfit, trade_id, Some(price.to_string()));
        if let Some(e) = st.take_failure(BrokerOp::ModifyTakeProfit, false) {
            return Err(e);
        }

        let id = st.next_id();
        let trade = st.open_trade_mut(trade_id)?;
        trade.take_profit = Some(AttachedOrder {
            id: Some(id.clone()),
            price: price.to_decimal(),
        });
        Ok(OrderAck { order_id: Some(id) })
    }

    async fn modify_trailing_stop(&self, trade_id: &str, distance: &WirePrice) -> Result<OrderAck, BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::ModifyTrailingStop, trade_id, Some(distance.to_string()));
        if let Some(e) = st.take_failure(BrokerOp::ModifyTrailingStop, false) {
            return Err(e);
        }

        let id = st.next_id();
        let (instrument, side) = {
            let trade = st.open_trade_mut(trade_id)?;
            (trade.instrument.clone(), trade.side)
        };
        let extreme = st.exit_price(&instrument, side)?;
        let trade = st.open_trade_mut(trade_id)?;
        trade.trailing = Some(PaperTrailing {
            id: id.clone(),
            distance: distance.to_decimal(),
            extreme,
        });
        Ok(OrderAck { order_id: Some(id) })
    }

    async fn close_trade(&self, trade_id: &str, units: Option<u64>) -> Result<CloseAck, BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::CloseTrade, trade_id, units.map(|u| u.to_string()));
        if let Some(e) = st.take_failure(BrokerOp::CloseTrade, false) {
            return Err(e);
        }

        let (instrument, side) = {
            let trade = st.open_trade_mut(trade_id)?;
            (trade.instrument.clone(), trade.side)
        };
        let price = st.exit_price(&instrument, side)?;
        st.close(trade_id, price, units)
    }

    async fn close_position(&self, instrument: &Instrument, side: Side) -> Result<CloseAck, BrokerError> {
        self.pause().await;
        let mut st = self.state.lock().await;
        st.record(BrokerOp::ClosePosition, instrument.as_str(), Some(side.to_string()));
        if let Some(e) = st.take_failure(BrokerOp::ClosePosition, false) {
            return Err(e);
        }

        let open: Vec<String> = st
            .trades
            .values()
            .filter(|t| t.instrument == *instrument && t.side == side && t.state == TradeState::Open)
            .map(|t| t.id.clone())
            .collect();
        if open.is_empty() {
            return Err(BrokerError::rejected(
                404,
                "CLOSEOUT_POSITION_DOESNT_EXIST",
                format!("no {} position in {}", side, instrument),
            ));
        }

        let price = st.exit_price(instrument, side)?;
        let mut total = CloseAck {
            price: Some(price),
            units: 0,
            realized_pnl: 0.0,
        };
        for trade_id in open {
            let ack = st.close(&trade_id, price, None)?;
            total.units += ack.units;
            total.realized_pnl += ack.realized_pnl;
        }

        if let Some(e) = st.take_failure(BrokerOp::ClosePosition, true) {
            return Err(e);
        }
        Ok(total)
    }

    async fn account_balance(&self) -> Result<Decimal, BrokerError> {
        let mut st = self.state.lock().await;
        st.record(BrokerOp::AccountBalance, "", None);
        Ok(st.balance)
    }
}

fn order_snapshot(o: &PaperOrder) -> OrderSnapshot {
    OrderSnapshot {
        id: o.id.clone(),
        state: o.state,
        client_id: Some(o.client_id.clone()),
        trade_id: o.trade_id.clone(),
        fill_price: o.fill_price,
        units: o.units,
        fill_time: o.fill_time,
    }
}
