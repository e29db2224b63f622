//! Broker, market feed and decision advisor clients.

mod broker;
mod broker_client;
mod feed;
mod paper;
mod types;

pub use broker::{
    Broker, BrokerError, CloseAck, EntryAck, OrderAck, OrderSnapshot, OrderState, RejectCode,
    TradeSnapshot, TradeState,
};
pub use broker_client::RestBroker;
pub use feed::{DecisionAdvisor, HttpAdvisor, HttpFeed, MarketFeed};
pub use paper::{BrokerOp, PaperBroker, RecordedCall};
