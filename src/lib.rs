pub mod core;
pub mod exchanges;

pub use crate::core::{
    config::ExchangeConfig,
    errors::{ExchangeError, StateError},
    types::*,
};
pub use crate::exchanges::binance::{
    BinanceRestClient, StreamHandlers, StreamKind, SubscriptionManager, Unsubscribe,
    UserDataStream,
};
