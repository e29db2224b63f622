//! Data models for instruments, orders, positions, market data and trade records.

mod advice;
mod instrument;
mod order;
mod position;
mod series;
mod trade;

pub use advice::{Advice, AdviceSide, AdvisorAction, EntryMode};
pub use instrument::{Instrument, WirePrice};
pub use order::{ClientExtensions, EntryOrder, OrderType, Side, TimeInForce, CLIENT_TAG};
pub use position::{AttachedOrder, AttachedTrailing, LifecycleState, Position, PositionFlags};
pub use series::{detect_peak_reversal, Candle, IndicatorSet, MarketSnapshot, Quote, TimeSeries};
pub use trade::{ExitReason, RecordKind, TradeRecord};
