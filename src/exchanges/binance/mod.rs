pub mod builder;
pub mod codec;
pub mod handlers;
pub mod rest;
pub mod streams;
pub mod subscription;
pub mod types;
pub mod user_data;

// Re-export main types for easier importing
pub use builder::{
    build_rest_client, create_binance_rest_client, create_subscription_manager,
    create_subscription_manager_with,
};
pub use codec::{BinanceCodec, BinanceMessage};
pub use handlers::StreamHandlers;
pub use rest::BinanceRestClient;
pub use streams::{StreamKind, USER_DATA_SUBSCRIPTION_ID};
pub use subscription::{SubscriptionManager, Unsubscribe};
pub use types::{
    AccountPositionEvent, AggTradeEvent, BalanceUpdateEvent, BinanceAccountInfo, BinanceBalance,
    BinanceExchangeInfo, BinanceOrderRequest, BinanceOrderResponse, BookTickerEvent,
    DepthUpdateEvent, ExecutionReportEvent, KlineEvent, ListStatusEvent, ListenKeyExpiredEvent,
    MiniTickerEvent, PartialDepthEvent, TickerEvent, TradeEvent,
};
pub use user_data::{UserDataConfig, UserDataState, UserDataStream};
