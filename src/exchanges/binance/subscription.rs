use crate::core::errors::{ExchangeError, StateError};
use crate::core::kernel::ws::{StreamConnection, WsConfig};
use crate::core::kernel::{ReqwestRest, RestClient, WsCodec};
use crate::core::types::{ConnectionState, KlineInterval};
use crate::exchanges::binance::codec::BinanceCodec;
use crate::exchanges::binance::handlers::StreamHandlers;
use crate::exchanges::binance::rest::BinanceRestClient;
use crate::exchanges::binance::streams::{
    build_combined_stream_url, build_raw_stream_url, combined_id, combined_stream_names,
    StreamKind, USER_DATA_SUBSCRIPTION_ID,
};
use crate::exchanges::binance::user_data::{UserDataConfig, UserDataStream};
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, instrument};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum SubscriptionStream<R: RestClient + 'static> {
    Market {
        connection: StreamConnection,
        codec: Arc<BinanceCodec>,
    },
    UserData(UserDataStream<R>),
}

struct Subscription<R: RestClient + 'static> {
    id: String,
    serial: u64,
    stream: SubscriptionStream<R>,
    handlers: StreamHandlers,
    disconnected: AtomicBool,
}

impl<R: RestClient + 'static> Subscription<R> {
    async fn stop(&self) -> Result<(), ExchangeError> {
        match &self.stream {
            SubscriptionStream::Market { connection, .. } => connection.disconnect().await,
            SubscriptionStream::UserData(stream) => stream.unsubscribe().await,
        }
    }

    /// Fire `on_disconnect` the first time only.
    fn finish(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.handlers.notify_disconnect();
        }
    }
}

struct RegistryState<R: RestClient + 'static> {
    entries: HashMap<String, Arc<Subscription<R>>>,
    /// Ids claimed by a subscribe call that has not finished opening yet
    pending: HashSet<String>,
    closed: bool,
}

struct Registry<R: RestClient + 'static> {
    state: Mutex<RegistryState<R>>,
    next_serial: AtomicU64,
}

impl<R: RestClient + 'static> Registry<R> {
    /// Claim `id` until the returned reservation is committed or dropped.
    fn reserve(&self, id: &str) -> Result<Reservation<'_, R>, ExchangeError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(StateError::Closed.into());
        }
        if state.entries.contains_key(id) || !state.pending.insert(id.to_string()) {
            return Err(StateError::DuplicateSubscription(id.to_string()).into());
        }
        Ok(Reservation {
            registry: self,
            id: id.to_string(),
            released: false,
        })
    }

    /// Turn a reservation into a live record.
    fn commit(
        &self,
        mut reservation: Reservation<'_, R>,
        subscription: Arc<Subscription<R>>,
    ) -> Result<(), ExchangeError> {
        let mut state = lock(&self.state);
        state.pending.remove(&reservation.id);
        reservation.released = true;
        if state.closed {
            return Err(StateError::Closed.into());
        }
        state
            .entries
            .insert(subscription.id.clone(), subscription);
        Ok(())
    }

    fn insert(&self, subscription: Arc<Subscription<R>>) -> Result<(), ExchangeError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(StateError::Closed.into());
        }
        if state.entries.contains_key(&subscription.id) || state.pending.contains(&subscription.id)
        {
            return Err(StateError::DuplicateSubscription(subscription.id.clone()).into());
        }
        state
            .entries
            .insert(subscription.id.clone(), subscription);
        Ok(())
    }

    fn get(&self, id: &str, serial: u64) -> Option<Arc<Subscription<R>>> {
        lock(&self.state)
            .entries
            .get(id)
            .filter(|s| s.serial == serial)
            .cloned()
    }

    fn forget(&self, id: &str, serial: u64) {
        let mut state = lock(&self.state);
        if state.entries.get(id).is_some_and(|s| s.serial == serial) {
            state.entries.remove(id);
        }
    }

    async fn remove(&self, id: &str, serial: u64) -> Result<(), ExchangeError> {
        let Some(subscription) = self.get(id, serial) else {
            return Ok(());
        };

        let result = subscription.stop().await;
        self.forget(id, serial);
        subscription.finish();
        info!(subscription_id = id, "unsubscribed");
        result
    }
}

/// A claimed id; released on drop unless committed.
struct Reservation<'a, R: RestClient + 'static> {
    registry: &'a Registry<R>,
    id: String,
    released: bool,
}

impl<R: RestClient + 'static> Drop for Reservation<'_, R> {
    fn drop(&mut self) {
        if !self.released {
            lock(&self.registry.state).pending.remove(&self.id);
        }
    }
}

/// Idempotent handle returned by every subscribe call.
pub struct Unsubscribe<R: RestClient + 'static = ReqwestRest> {
    id: String,
    serial: u64,
    registry: Weak<Registry<R>>,
    done: AtomicBool,
}

impl<R: RestClient + 'static> std::fmt::Debug for Unsubscribe<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("id", &self.id)
            .field("done", &self.done.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<R: RestClient + 'static> Unsubscribe<R> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tear the subscription down. Later calls are no-ops.
    pub async fn unsubscribe(&self) -> Result<(), ExchangeError> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.id, self.serial).await,
            None => Ok(()),
        }
    }
}

/// Creates one stream connection per logical subscription and tracks it
/// under a canonical id.
///
/// A manager holds no global state; several managers with different
/// credentials can live in one process.
pub struct SubscriptionManager<R: RestClient + 'static = ReqwestRest> {
    registry: Arc<Registry<R>>,
    rest: Option<Arc<BinanceRestClient<R>>>,
    ws_base_url: String,
    ws_config: WsConfig,
    user_data_config: UserDataConfig,
}

impl<R: RestClient + 'static> Clone for SubscriptionManager<R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            rest: self.rest.clone(),
            ws_base_url: self.ws_base_url.clone(),
            ws_config: self.ws_config.clone(),
            user_data_config: self.user_data_config.clone(),
        }
    }
}

impl<R: RestClient + 'static> std::fmt::Debug for SubscriptionManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("ws_base_url", &self.ws_base_url)
            .field("active", &self.active_subscription_ids())
            .finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    /// Manager for market data only; user data subscriptions are rejected.
    pub fn new(ws_base_url: impl Into<String>, ws_config: WsConfig) -> Self {
        Self::build(None, ws_base_url.into(), ws_config)
    }
}

impl<R: RestClient + 'static> SubscriptionManager<R> {
    pub fn with_rest(
        rest: Arc<BinanceRestClient<R>>,
        ws_base_url: impl Into<String>,
        ws_config: WsConfig,
    ) -> Self {
        Self::build(Some(rest), ws_base_url.into(), ws_config)
    }

    fn build(
        rest: Option<Arc<BinanceRestClient<R>>>,
        ws_base_url: String,
        ws_config: WsConfig,
    ) -> Self {
        Self {
            registry: Arc::new(Registry {
                state: Mutex::new(RegistryState {
                    entries: HashMap::new(),
                    pending: HashSet::new(),
                    closed: false,
                }),
                next_serial: AtomicU64::new(1),
            }),
            rest,
            ws_base_url: ws_base_url.trim_end_matches('/').to_string(),
            ws_config,
            user_data_config: UserDataConfig::default(),
        }
    }

    pub fn with_user_data_config(mut self, config: UserDataConfig) -> Self {
        self.user_data_config = config;
        self
    }

    pub fn ws_base_url(&self) -> &str {
        &self.ws_base_url
    }

    pub fn rest(&self) -> Option<&Arc<BinanceRestClient<R>>> {
        self.rest.as_ref()
    }

    /// Sorted ids of every live subscription.
    pub fn active_subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.registry.state).entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_active(&self, id: &str) -> bool {
        lock(&self.registry.state).entries.contains_key(id)
    }

    /// Connection state of a live subscription.
    pub fn subscription_state(&self, id: &str) -> Option<ConnectionState> {
        let state = lock(&self.registry.state);
        state.entries.get(id).map(|s| match &s.stream {
            SubscriptionStream::Market { connection, .. } => connection.state(),
            SubscriptionStream::UserData(stream) => stream.connection().state(),
        })
    }

    /// Subscribe to one raw market stream.
    pub async fn subscribe(
        &self,
        kind: StreamKind,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        let url = build_raw_stream_url(&self.ws_base_url, &kind.stream_name());
        self.open_market(kind.id(), url, handlers).await
    }

    pub async fn subscribe_kline(
        &self,
        symbol: &str,
        interval: KlineInterval,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        self.subscribe(StreamKind::kline(symbol, interval), handlers)
            .await
    }

    pub async fn subscribe_agg_trade(
        &self,
        symbol: &str,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        self.subscribe(StreamKind::agg_trade(symbol), handlers).await
    }

    pub async fn subscribe_trade(
        &self,
        symbol: &str,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        self.subscribe(StreamKind::trade(symbol), handlers).await
    }

    /// Top-N snapshots; `levels` must be 5, 10 or 20.
    pub async fn subscribe_partial_depth(
        &self,
        symbol: &str,
        levels: u32,
        fast: bool,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        let kind = StreamKind::partial_depth(symbol, levels, fast)?;
        self.subscribe(kind, handlers).await
    }

    pub async fn subscribe_diff_depth(
        &self,
        symbol: &str,
        fast: bool,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        self.subscribe(StreamKind::diff_depth(symbol, fast), handlers)
            .await
    }

    pub async fn subscribe_ticker(
        &self,
        symbol: &str,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        self.subscribe(StreamKind::ticker(symbol), handlers).await
    }

    pub async fn subscribe_mini_ticker(
        &self,
        symbol: &str,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        self.subscribe(StreamKind::mini_ticker(symbol), handlers)
            .await
    }

    pub async fn subscribe_all_mini_tickers(
        &self,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        self.subscribe(StreamKind::AllMiniTickers, handlers).await
    }

    pub async fn subscribe_book_ticker(
        &self,
        symbol: &str,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        self.subscribe(StreamKind::book_ticker(symbol), handlers)
            .await
    }

    pub async fn subscribe_all_book_tickers(
        &self,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        self.subscribe(StreamKind::AllBookTickers, handlers).await
    }

    /// Several streams multiplexed over one connection.
    pub async fn subscribe_combined(
        &self,
        streams: &[StreamKind],
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        if streams.is_empty() {
            return Err(ExchangeError::InvalidParameters(
                "combined subscription needs at least one stream".to_string(),
            ));
        }
        let url = build_combined_stream_url(&self.ws_base_url, &combined_stream_names(streams));
        self.open_market(combined_id(streams), url, handlers).await
    }

    /// Account events over a listen key; needs credentials.
    #[instrument(skip(self, handlers), fields(subscription_id = USER_DATA_SUBSCRIPTION_ID))]
    pub async fn subscribe_user_data(
        &self,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        let rest = self.rest.clone().ok_or_else(|| {
            ExchangeError::CredentialError(
                "user data stream requires a REST client with credentials".to_string(),
            )
        })?;
        // Held across the listen key POST so a concurrent call cannot acquire
        // (and later release) the same account-wide key
        let reservation = self.registry.reserve(USER_DATA_SUBSCRIPTION_ID)?;

        let stream = UserDataStream::start(
            rest,
            &self.ws_base_url,
            self.ws_config.clone(),
            self.user_data_config.clone(),
            handlers.clone(),
        )
        .await?;

        let subscription = Arc::new(Subscription {
            id: USER_DATA_SUBSCRIPTION_ID.to_string(),
            serial: self.registry.next_serial.fetch_add(1, Ordering::SeqCst),
            stream: SubscriptionStream::UserData(stream),
            handlers,
            disconnected: AtomicBool::new(false),
        });

        if let Err(e) = self.registry.commit(reservation, Arc::clone(&subscription)) {
            if let Err(stop_err) = subscription.stop().await {
                debug!("user data stream did not stop cleanly: {}", stop_err);
            }
            return Err(e);
        }

        subscription.handlers.notify_connect();
        info!("subscribed");
        Ok(self.handle_for(&subscription))
    }

    /// Add streams to a live market subscription with a SUBSCRIBE request.
    pub async fn add_streams(&self, id: &str, streams: &[StreamKind]) -> Result<(), ExchangeError> {
        let (connection, codec) = self.market_connection(id)?;
        let names: Vec<String> = streams.iter().map(StreamKind::stream_name).collect();
        connection
            .send_message(codec.encode_subscription(&names)?)
            .await
    }

    /// Drop streams from a live market subscription with an UNSUBSCRIBE request.
    pub async fn remove_streams(
        &self,
        id: &str,
        streams: &[StreamKind],
    ) -> Result<(), ExchangeError> {
        let (connection, codec) = self.market_connection(id)?;
        let names: Vec<String> = streams.iter().map(StreamKind::stream_name).collect();
        connection
            .send_message(codec.encode_unsubscription(&names)?)
            .await
    }

    /// Tear down every subscription; the manager stays usable.
    pub async fn unsubscribe_all(&self) -> Result<(), ExchangeError> {
        self.shutdown(false).await
    }

    /// Tear down every subscription concurrently and refuse new ones.
    ///
    /// `on_disconnect` fires once per subscription. Failures do not stop the
    /// others and come back together as `ExchangeError::Multiple`.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), ExchangeError> {
        self.shutdown(true).await
    }

    async fn shutdown(&self, refuse_new: bool) -> Result<(), ExchangeError> {
        let subscriptions: Vec<Arc<Subscription<R>>> = {
            let mut state = lock(&self.registry.state);
            if refuse_new {
                state.closed = true;
            }
            state.entries.drain().map(|(_, s)| s).collect()
        };

        let results = join_all(subscriptions.iter().map(|s| s.stop())).await;
        for subscription in &subscriptions {
            subscription.finish();
        }

        let errors: Vec<ExchangeError> = results.into_iter().filter_map(Result::err).collect();
        info!(
            closed = subscriptions.len(),
            failed = errors.len(),
            "subscriptions torn down"
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ExchangeError::Multiple(errors))
        }
    }

    fn market_connection(
        &self,
        id: &str,
    ) -> Result<(StreamConnection, Arc<BinanceCodec>), ExchangeError> {
        let state = lock(&self.registry.state);
        match state.entries.get(id).map(|s| &s.stream) {
            Some(SubscriptionStream::Market { connection, codec }) => {
                Ok((connection.clone(), Arc::clone(codec)))
            }
            Some(SubscriptionStream::UserData(_)) => Err(ExchangeError::InvalidParameters(
                "streams cannot be added to the user data subscription".to_string(),
            )),
            None => Err(ExchangeError::InvalidParameters(format!(
                "no active subscription with id {}",
                id
            ))),
        }
    }

    #[instrument(skip(self, url, handlers), fields(subscription_id = %id))]
    async fn open_market(
        &self,
        id: String,
        url: String,
        handlers: StreamHandlers,
    ) -> Result<Unsubscribe<R>, ExchangeError> {
        let connection = StreamConnection::new(id.clone(), url, self.ws_config.clone());
        let codec = Arc::new(BinanceCodec::new());

        let router = Arc::clone(&codec);
        let on_message = handlers.clone();
        connection.set_message_handler(move |text| router.route(&text, &on_message));
        if let Some(on_error) = handlers.error_handler() {
            connection.set_error_handler(move |err| on_error(err));
        }
        let on_reconnect = handlers.clone();
        connection.set_reconnect_handler(move |attempt| on_reconnect.notify_reconnect(attempt));

        let subscription = Arc::new(Subscription {
            id: id.clone(),
            serial: self.registry.next_serial.fetch_add(1, Ordering::SeqCst),
            stream: SubscriptionStream::Market {
                connection: connection.clone(),
                codec,
            },
            handlers,
            disconnected: AtomicBool::new(false),
        });
        self.registry.insert(Arc::clone(&subscription))?;

        if let Err(e) = connection.connect().await {
            self.registry.forget(&id, subscription.serial);
            if let Err(close_err) = connection.disconnect().await {
                debug!("failed connection did not close cleanly: {}", close_err);
            }
            return Err(e);
        }

        subscription.handlers.notify_connect();
        info!("subscribed");
        Ok(self.handle_for(&subscription))
    }

    fn handle_for(&self, subscription: &Subscription<R>) -> Unsubscribe<R> {
        Unsubscribe {
            id: subscription.id.clone(),
            serial: subscription.serial,
            registry: Arc::downgrade(&self.registry),
            done: AtomicBool::new(false),
        }
    }
}
