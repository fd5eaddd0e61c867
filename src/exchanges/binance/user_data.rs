use crate::core::errors::ExchangeError;
use crate::core::kernel::ws::{StreamConnection, WsConfig};
use crate::core::kernel::{RestClient, WsCodec};
use crate::core::types::ConnectionState;
use crate::exchanges::binance::codec::{BinanceCodec, BinanceMessage};
use crate::exchanges::binance::handlers::StreamHandlers;
use crate::exchanges::binance::rest::BinanceRestClient;
use crate::exchanges::binance::streams::{build_user_data_url, USER_DATA_SUBSCRIPTION_ID};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Timers of the listen key lifecycle
#[derive(Debug, Clone)]
pub struct UserDataConfig {
    /// Period of the keepalive PUT; the server expires keys after 60 minutes
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    /// Bound on the best-effort DELETE at unsubscribe
    pub close_timeout: Duration,
}

impl Default for UserDataConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30 * 60),
            keepalive_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl UserDataConfig {
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDataState {
    Connecting,
    Connected,
    Reconnecting,
    RotatingToken,
    Failed,
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct UserDataInner<R: RestClient + 'static> {
    rest: Arc<BinanceRestClient<R>>,
    connection: StreamConnection,
    ws_base_url: String,
    listen_key: Mutex<String>,
    /// Key issued by a rotation whose socket switch has not succeeded yet
    pending_key: Mutex<Option<String>>,
    handlers: StreamHandlers,
    codec: BinanceCodec,
    config: UserDataConfig,
    rotating: AtomicBool,
    failed: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

/// Account event stream authenticated by a listen key.
///
/// The socket URL always embeds the key currently held: a plain socket
/// drop reconnects under the same key, while a `listenKeyExpired` event
/// fetches a new key and moves the socket onto it.
pub struct UserDataStream<R: RestClient + 'static> {
    inner: Arc<UserDataInner<R>>,
}

impl<R: RestClient + 'static> std::fmt::Debug for UserDataStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDataStream")
            .field("state", &self.state())
            .field("connection", &self.inner.connection)
            .finish_non_exhaustive()
    }
}

impl<R: RestClient + 'static> UserDataStream<R> {
    /// Acquire a listen key, open the socket and start the keepalive timer.
    #[instrument(skip_all, fields(subscription_id = USER_DATA_SUBSCRIPTION_ID))]
    pub async fn start(
        rest: Arc<BinanceRestClient<R>>,
        ws_base_url: &str,
        ws_config: WsConfig,
        config: UserDataConfig,
        handlers: StreamHandlers,
    ) -> Result<Self, ExchangeError> {
        let listen_key = rest.start_user_data_stream().await?;
        let connection = StreamConnection::new(
            USER_DATA_SUBSCRIPTION_ID,
            build_user_data_url(ws_base_url, &listen_key),
            ws_config,
        );

        let inner = Arc::new(UserDataInner {
            rest,
            connection,
            ws_base_url: ws_base_url.trim_end_matches('/').to_string(),
            listen_key: Mutex::new(listen_key),
            pending_key: Mutex::new(None),
            handlers,
            codec: BinanceCodec::new(),
            config,
            rotating: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            keepalive: Mutex::new(None),
        });
        inner.wire_connection();

        if let Err(e) = inner.connection.connect().await {
            inner.cancel.cancel();
            if let Err(close_err) = inner.connection.disconnect().await {
                debug!("failed connection did not close cleanly: {}", close_err);
            }
            inner.release_listen_key().await;
            return Err(e);
        }

        let keepalive = tokio::spawn(Arc::clone(&inner).keepalive_loop());
        *lock(&inner.keepalive) = Some(keepalive);
        info!("user data stream connected");

        Ok(Self { inner })
    }

    /// The listen key embedded in the current socket URL.
    pub fn listen_key(&self) -> String {
        lock(&self.inner.listen_key).clone()
    }

    pub fn url(&self) -> String {
        self.inner.connection.url()
    }

    pub fn connection(&self) -> &StreamConnection {
        &self.inner.connection
    }

    pub fn state(&self) -> UserDataState {
        if self.inner.closed.load(Ordering::SeqCst) {
            return UserDataState::Closed;
        }
        if self.inner.failed.load(Ordering::SeqCst) {
            return UserDataState::Failed;
        }
        if self.inner.rotating.load(Ordering::SeqCst) {
            return UserDataState::RotatingToken;
        }
        match self.inner.connection.state() {
            ConnectionState::Connecting => UserDataState::Connecting,
            ConnectionState::Connected => UserDataState::Connected,
            ConnectionState::Reconnecting => UserDataState::Reconnecting,
            ConnectionState::Disconnected => UserDataState::Failed,
            ConnectionState::Closed => UserDataState::Closed,
        }
    }

    /// Stop keepalive, close the socket, then release the key (best effort).
    ///
    /// Idempotent; only the socket shutdown can fail.
    #[instrument(skip(self), fields(subscription_id = USER_DATA_SUBSCRIPTION_ID))]
    pub async fn unsubscribe(&self) -> Result<(), ExchangeError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.cancel.cancel();
        let keepalive = lock(&self.inner.keepalive).take();
        if let Some(handle) = keepalive {
            if let Err(e) = handle.await {
                warn!("keepalive task ended abnormally: {}", e);
            }
        }

        let result = self.inner.connection.disconnect().await;
        self.inner.release_listen_key().await;
        result
    }
}

impl<R: RestClient + 'static> UserDataInner<R> {
    fn wire_connection(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.connection.set_message_handler(move |text| {
            if let Some(inner) = weak.upgrade() {
                inner.on_frame(&text);
            }
        });

        let handlers = self.handlers.clone();
        self.connection
            .set_error_handler(move |err| handlers.emit_error(err));

        let handlers = self.handlers.clone();
        self.connection
            .set_reconnect_handler(move |attempt| handlers.notify_reconnect(attempt));
    }

    fn on_frame(self: &Arc<Self>, text: &str) {
        match self.codec.decode_message(text) {
            Ok(Some(BinanceMessage::ListenKeyExpired(event))) => {
                info!(expired = %event.listen_key, "listen key expired");
                self.handlers
                    .dispatch(BinanceMessage::ListenKeyExpired(event));
                self.begin_rotation();
            }
            Ok(Some(message)) => self.handlers.dispatch(message),
            Ok(None) => {}
            Err(e) => self.handlers.emit_error(e),
        }
    }

    /// Start at most one rotation task.
    fn begin_rotation(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.rotating.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(Arc::clone(self).rotation_loop());
    }

    async fn rotation_loop(self: Arc<Self>) {
        let attempts = AtomicU32::new(0);
        // The first attempt runs immediately, so the delays cover the rest
        let cap = self.connection.config().max_reconnect_attempts;
        let strategy = self
            .connection
            .config()
            .backoff()
            .take(cap.saturating_sub(1) as usize);
        let action = || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let inner = Arc::clone(&self);
            async move {
                let result = inner.rotate_once().await;
                if let Err(e) = &result {
                    warn!("listen key rotation failed: {}", e);
                }
                result
            }
        };

        let result = tokio::select! {
            () = self.cancel.cancelled() => return,
            result = Retry::start(strategy, action) => result,
        };
        self.rotating.store(false, Ordering::SeqCst);

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!(attempts, "rotated to a new listen key");
                self.handlers.notify_reconnect(attempts);
            }
            Err(e) => {
                error!(attempts, "giving up on listen key rotation: {}", e);
                self.failed.store(true, Ordering::SeqCst);
                if let Err(close_err) = self.connection.disconnect().await {
                    debug!("connection did not close cleanly: {}", close_err);
                }
                self.release_pending_key().await;
                self.handlers
                    .emit_error(ExchangeError::ReconnectLimitReached { attempts });
            }
        }
    }

    /// One rotation attempt. A key from an earlier attempt whose socket
    /// never came up is reused instead of requesting another one.
    async fn rotate_once(&self) -> Result<(), ExchangeError> {
        let pending = lock(&self.pending_key).clone();
        let listen_key = match pending {
            Some(listen_key) => listen_key,
            None => {
                let listen_key = self.rest.start_user_data_stream().await?;
                *lock(&self.pending_key) = Some(listen_key.clone());
                listen_key
            }
        };

        let url = build_user_data_url(&self.ws_base_url, &listen_key);
        self.connection.switch_url(url).await?;

        *lock(&self.listen_key) = listen_key;
        *lock(&self.pending_key) = None;
        Ok(())
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let period = self.config.keepalive_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let listen_key = lock(&self.listen_key).clone();
            let keepalive = timeout(
                self.config.keepalive_timeout,
                self.rest.keepalive_user_data_stream(&listen_key),
            );
            let outcome = tokio::select! {
                () = self.cancel.cancelled() => break,
                outcome = keepalive => outcome,
            };

            match outcome {
                Ok(Ok(())) => debug!("listen key kept alive"),
                Ok(Err(e)) => warn!("listen key keepalive failed: {}", e),
                Err(_) => warn!(
                    "listen key keepalive timed out after {:?}",
                    self.config.keepalive_timeout
                ),
            }
        }
    }

    /// Release the current key and any key a rotation left behind.
    async fn release_listen_key(&self) {
        let listen_key = lock(&self.listen_key).clone();
        self.close_key(&listen_key).await;

        let pending = lock(&self.pending_key).take();
        if let Some(pending) = pending.filter(|key| *key != listen_key) {
            self.close_key(&pending).await;
        }
    }

    async fn release_pending_key(&self) {
        let pending = lock(&self.pending_key).take();
        if let Some(listen_key) = pending {
            self.close_key(&listen_key).await;
        }
    }

    async fn close_key(&self, listen_key: &str) {
        match timeout(
            self.config.close_timeout,
            self.rest.close_user_data_stream(listen_key),
        )
        .await
        {
            Ok(Ok(())) => debug!("listen key closed"),
            Ok(Err(e)) => warn!("failed to close listen key: {}", e),
            Err(_) => warn!("closing listen key timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timers() {
        let config = UserDataConfig::default();
        assert_eq!(config.keepalive_interval, Duration::from_secs(1800));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(10));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
    }
}
