use crate::core::errors::ExchangeError;
use crate::exchanges::binance::codec::BinanceMessage;
use crate::exchanges::binance::types::{
    AccountPositionEvent, AggTradeEvent, BalanceUpdateEvent, BookTickerEvent, DepthUpdateEvent,
    ExecutionReportEvent, KlineEvent, ListStatusEvent, ListenKeyExpiredEvent, MiniTickerEvent,
    PartialDepthEvent, TickerEvent, TradeEvent,
};
use std::fmt;
use std::sync::Arc;
use tracing::{error, trace};

pub type EventHandler<T> = Arc<dyn Fn(T) + Send + Sync>;
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

/// Handlers attached to one subscription.
///
/// Every decoded frame arrives as a tagged `BinanceMessage`; `dispatch`
/// matches on the tag and calls the handler registered for that family.
/// Families without a handler are dropped.
#[derive(Clone, Default)]
pub struct StreamHandlers {
    kline: Option<EventHandler<KlineEvent>>,
    agg_trade: Option<EventHandler<AggTradeEvent>>,
    trade: Option<EventHandler<TradeEvent>>,
    depth_update: Option<EventHandler<DepthUpdateEvent>>,
    partial_depth: Option<EventHandler<PartialDepthEvent>>,
    ticker: Option<EventHandler<TickerEvent>>,
    mini_ticker: Option<EventHandler<MiniTickerEvent>>,
    book_ticker: Option<EventHandler<BookTickerEvent>>,
    account_position: Option<EventHandler<AccountPositionEvent>>,
    balance_update: Option<EventHandler<BalanceUpdateEvent>>,
    execution_report: Option<EventHandler<ExecutionReportEvent>>,
    list_status: Option<EventHandler<ListStatusEvent>>,
    listen_key_expired: Option<EventHandler<ListenKeyExpiredEvent>>,
    on_connect: Option<LifecycleHandler>,
    on_reconnect: Option<EventHandler<u32>>,
    on_error: Option<EventHandler<ExchangeError>>,
    on_disconnect: Option<LifecycleHandler>,
}

macro_rules! handler_setter {
    ($(#[$meta:meta])* $name:ident, $field:ident, $event:ty) => {
        $(#[$meta])*
        pub fn $name(mut self, handler: impl Fn($event) + Send + Sync + 'static) -> Self {
            self.$field = Some(Arc::new(handler));
            self
        }
    };
}

impl StreamHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    handler_setter!(on_kline, kline, KlineEvent);
    handler_setter!(on_agg_trade, agg_trade, AggTradeEvent);
    handler_setter!(on_trade, trade, TradeEvent);
    handler_setter!(on_depth_update, depth_update, DepthUpdateEvent);
    handler_setter!(on_partial_depth, partial_depth, PartialDepthEvent);
    handler_setter!(on_ticker, ticker, TickerEvent);
    handler_setter!(
        /// Also receives each element of `!miniTicker@arr`, in array order.
        on_mini_ticker,
        mini_ticker,
        MiniTickerEvent
    );
    handler_setter!(on_book_ticker, book_ticker, BookTickerEvent);
    handler_setter!(on_account_position, account_position, AccountPositionEvent);
    handler_setter!(on_balance_update, balance_update, BalanceUpdateEvent);
    handler_setter!(on_execution_report, execution_report, ExecutionReportEvent);
    handler_setter!(on_list_status, list_status, ListStatusEvent);
    handler_setter!(
        /// Called before the user data stream rotates to a new listen key.
        on_listen_key_expired,
        listen_key_expired,
        ListenKeyExpiredEvent
    );
    handler_setter!(
        /// Called after each automatic reconnect or token rotation with the attempt number.
        on_reconnect,
        on_reconnect,
        u32
    );
    handler_setter!(
        /// Asynchronous stream errors: decode failures, server error replies
        /// and the terminal reconnect error.
        on_error,
        on_error,
        ExchangeError
    );

    /// Called once the first connection is up.
    pub fn on_connect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(handler));
        self
    }

    /// Called exactly once when the subscription is torn down.
    pub fn on_disconnect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(handler));
        self
    }

    /// Route one decoded message to its handler.
    pub fn dispatch(&self, message: BinanceMessage) {
        match message {
            BinanceMessage::Kline(event) => Self::call(self.kline.as_ref(), "kline", event),
            BinanceMessage::AggTrade(event) => {
                Self::call(self.agg_trade.as_ref(), "aggTrade", event);
            }
            BinanceMessage::Trade(event) => Self::call(self.trade.as_ref(), "trade", event),
            BinanceMessage::DepthUpdate(event) => {
                Self::call(self.depth_update.as_ref(), "depthUpdate", event);
            }
            BinanceMessage::PartialDepth(event) => {
                Self::call(self.partial_depth.as_ref(), "partialDepth", event);
            }
            BinanceMessage::Ticker(event) => Self::call(self.ticker.as_ref(), "24hrTicker", event),
            BinanceMessage::MiniTicker(event) => {
                Self::call(self.mini_ticker.as_ref(), "24hrMiniTicker", event);
            }
            BinanceMessage::MiniTickers(events) => {
                for event in events {
                    Self::call(self.mini_ticker.as_ref(), "24hrMiniTicker", event);
                }
            }
            BinanceMessage::BookTicker(event) => {
                Self::call(self.book_ticker.as_ref(), "bookTicker", event);
            }
            BinanceMessage::AccountPosition(event) => {
                Self::call(
                    self.account_position.as_ref(),
                    "outboundAccountPosition",
                    event,
                );
            }
            BinanceMessage::BalanceUpdate(event) => {
                Self::call(self.balance_update.as_ref(), "balanceUpdate", event);
            }
            BinanceMessage::ExecutionReport(event) => {
                Self::call(self.execution_report.as_ref(), "executionReport", event);
            }
            BinanceMessage::ListStatus(event) => {
                Self::call(self.list_status.as_ref(), "listStatus", event);
            }
            BinanceMessage::ListenKeyExpired(event) => {
                Self::call(self.listen_key_expired.as_ref(), "listenKeyExpired", event);
            }
        }
    }

    fn call<T>(handler: Option<&EventHandler<T>>, family: &str, event: T) {
        match handler {
            Some(handler) => handler(event),
            None => trace!(family, "no handler registered, dropping event"),
        }
    }

    pub fn emit_error(&self, err: ExchangeError) {
        match &self.on_error {
            Some(handler) => handler(err),
            None => error!("unhandled stream error: {}", err),
        }
    }

    pub(crate) fn notify_connect(&self) {
        if let Some(handler) = &self.on_connect {
            handler();
        }
    }

    pub(crate) fn notify_reconnect(&self, attempt: u32) {
        if let Some(handler) = &self.on_reconnect {
            handler(attempt);
        }
    }

    pub(crate) fn notify_disconnect(&self) {
        if let Some(handler) = &self.on_disconnect {
            handler();
        }
    }

    pub(crate) fn error_handler(&self) -> Option<EventHandler<ExchangeError>> {
        self.on_error.clone()
    }
}

impl fmt::Debug for StreamHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<&str> = [
            ("kline", self.kline.is_some()),
            ("aggTrade", self.agg_trade.is_some()),
            ("trade", self.trade.is_some()),
            ("depthUpdate", self.depth_update.is_some()),
            ("partialDepth", self.partial_depth.is_some()),
            ("ticker", self.ticker.is_some()),
            ("miniTicker", self.mini_ticker.is_some()),
            ("bookTicker", self.book_ticker.is_some()),
            ("outboundAccountPosition", self.account_position.is_some()),
            ("balanceUpdate", self.balance_update.is_some()),
            ("executionReport", self.execution_report.is_some()),
            ("listStatus", self.list_status.is_some()),
            ("listenKeyExpired", self.listen_key_expired.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect();

        f.debug_struct("StreamHandlers")
            .field("registered", &registered)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_batch_dispatches_each_element() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handlers = StreamHandlers::new()
            .on_mini_ticker(move |event| sink.lock().unwrap().push(event.symbol));

        let ticker = |symbol: &str| MiniTickerEvent {
            event_time: 1,
            symbol: symbol.to_string(),
            close_price: "1".to_string(),
            open_price: "1".to_string(),
            high_price: "1".to_string(),
            low_price: "1".to_string(),
            volume: "0".to_string(),
            quote_volume: "0".to_string(),
        };
        handlers.dispatch(BinanceMessage::MiniTickers(vec![ticker("AAA"), ticker("BBB")]));

        assert_eq!(*seen.lock().unwrap(), vec!["AAA".to_string(), "BBB".to_string()]);
    }

    #[test]
    fn test_lifecycle_callbacks() {
        let count = Arc::new(AtomicUsize::new(0));
        let (a, b) = (count.clone(), count.clone());
        let handlers = StreamHandlers::new()
            .on_connect(move || {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .on_reconnect(move |attempt| {
                b.fetch_add(attempt as usize, Ordering::SeqCst);
            });

        handlers.notify_connect();
        handlers.notify_reconnect(3);
        handlers.notify_disconnect();
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(format!("{:?}", handlers).contains("registered"));
    }
}
