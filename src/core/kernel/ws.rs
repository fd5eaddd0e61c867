use crate::core::errors::{ExchangeError, StateError};
use crate::core::types::ConnectionState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receives every text frame, in wire order, on the connection's dispatch task.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(ExchangeError) + Send + Sync>;
/// Called after a successful automatic reconnect with the attempt number.
pub type ReconnectHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// Timing and buffering for a stream connection
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Bound on the opening handshake
    pub connect_timeout: Duration,
    /// A read that sees no frame for this long fails the connection
    pub read_deadline: Duration,
    /// Period of the client ping ticker; must stay below `read_deadline`
    pub ping_interval: Duration,
    /// Bound on every single frame write
    pub write_deadline: Duration,
    /// First reconnect delay; doubled per attempt
    pub reconnect_delay: Duration,
    /// Ceiling for the reconnect delay
    pub max_reconnect_delay: Duration,
    /// Attempts before giving up; zero disables reconnection
    pub max_reconnect_attempts: u32,
    /// Outbound frames queued ahead of the write loop
    pub outbound_buffer_size: usize,
    /// Inbound frames queued ahead of the message handler
    pub message_buffer_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_deadline: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_deadline: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            outbound_buffer_size: 256,
            message_buffer_size: 1024,
        }
    }
}

impl WsConfig {
    pub fn with_read_deadline(mut self, deadline: Duration) -> Self {
        self.read_deadline = deadline;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_write_deadline(mut self, deadline: Duration) -> Self {
        self.write_deadline = deadline;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set initial delay, ceiling and attempt cap in one go
    pub fn with_reconnect(mut self, initial: Duration, ceiling: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = ceiling;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_message_buffer_size(mut self, size: usize) -> Self {
        self.message_buffer_size = size.max(1);
        self
    }

    /// Delays before each reconnect attempt.
    ///
    /// Doubles from `reconnect_delay`, holds at `max_reconnect_delay`, and
    /// yields exactly `max_reconnect_attempts` items.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        let ceiling = self.max_reconnect_delay;
        std::iter::successors(Some(self.reconnect_delay), |delay| {
            Some(delay.saturating_mul(2))
        })
        .map(move |delay| delay.min(ceiling))
        .take(self.max_reconnect_attempts as usize)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One live socket: its loops, its outbound queue and the token that stops them.
struct Session {
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    async fn shutdown(self, grace: Duration) -> Result<(), ExchangeError> {
        self.cancel.cancel();
        let Self { reader, writer, .. } = self;
        match timeout(grace, async { tokio::join!(reader, writer) }).await {
            Ok((Ok(()), Ok(()))) => Ok(()),
            Ok((Err(e), _) | (_, Err(e))) => Err(ExchangeError::ProtocolError(format!(
                "stream task failed: {}",
                e
            ))),
            Err(_) => Err(ExchangeError::transport(format!(
                "stream tasks did not stop within {:?}",
                grace
            ))),
        }
    }
}

struct Shared {
    url: String,
    state: ConnectionState,
    generation: u64,
    session: Option<Session>,
}

#[derive(Default)]
struct Handlers {
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
    on_reconnect: Option<ReconnectHandler>,
}

struct ConnectionInner {
    name: String,
    config: WsConfig,
    shared: Mutex<Shared>,
    handlers: Mutex<Handlers>,
    shutdown: CancellationToken,
    inbound: mpsc::Sender<String>,
    inbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

/// A single persistent connection to one stream URL.
///
/// Each live socket is served by a read loop and a write loop. Text frames
/// go through a bounded queue to one dispatch task that calls the message
/// handler, so handlers see frames in wire order, also across reconnects,
/// and a slow handler backpressures the read loop instead of reordering.
///
/// All state transitions happen under one mutex; handlers are always
/// called after it is released. The handle is cheap to clone.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StreamConnection {
    pub fn new(name: impl Into<String>, url: impl Into<String>, config: WsConfig) -> Self {
        let (inbound, inbound_rx) = mpsc::channel(config.message_buffer_size.max(1));
        Self {
            inner: Arc::new(ConnectionInner {
                name: name.into(),
                config,
                shared: Mutex::new(Shared {
                    url: url.into(),
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    session: None,
                }),
                handlers: Mutex::new(Handlers::default()),
                shutdown: CancellationToken::new(),
                inbound,
                inbound_rx: Mutex::new(Some(inbound_rx)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &WsConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.shared).state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// URL the current (or next) socket is opened against.
    pub fn url(&self) -> String {
        lock(&self.inner.shared).url.clone()
    }

    pub fn set_message_handler(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        lock(&self.inner.handlers).on_message = Some(Arc::new(handler));
    }

    pub fn set_error_handler(&self, handler: impl Fn(ExchangeError) + Send + Sync + 'static) {
        lock(&self.inner.handlers).on_error = Some(Arc::new(handler));
    }

    pub fn set_reconnect_handler(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        lock(&self.inner.handlers).on_reconnect = Some(Arc::new(handler));
    }

    /// Open the socket and start both loops.
    ///
    /// Returns `Ok` without side effects when already connected.
    #[instrument(skip(self), fields(connection = %self.inner.name))]
    pub async fn connect(&self) -> Result<(), ExchangeError> {
        let url = {
            let mut shared = lock(&self.inner.shared);
            match shared.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(StateError::AlreadyConnecting.into())
                }
                ConnectionState::Closed => return Err(StateError::Closed.into()),
                ConnectionState::Disconnected => shared.state = ConnectionState::Connecting,
            }
            shared.url.clone()
        };

        match self.inner.dial(&url).await {
            Ok(stream) => {
                if self.inner.install(stream, ConnectionState::Connecting) {
                    info!("connected to {}", url);
                    Ok(())
                } else {
                    Err(StateError::Closed.into())
                }
            }
            Err(e) => {
                let mut shared = lock(&self.inner.shared);
                if shared.state == ConnectionState::Connecting {
                    shared.state = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Queue a text frame for the write loop.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), ExchangeError> {
        let outbound = {
            let shared = lock(&self.inner.shared);
            match (shared.state, shared.session.as_ref()) {
                (ConnectionState::Connected, Some(session)) => session.outbound.clone(),
                _ => return Err(StateError::NotConnected.into()),
            }
        };

        outbound
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| StateError::NotConnected.into())
    }

    /// Replace the target URL and reopen the socket against it.
    ///
    /// The old socket is fully stopped before the new one is dialled, so at
    /// most one socket is ever open. On failure the connection is left
    /// `Disconnected` and the call may be retried.
    #[instrument(skip(self, url), fields(connection = %self.inner.name))]
    pub async fn switch_url(&self, url: impl Into<String>) -> Result<(), ExchangeError> {
        let url = url.into();
        let stale = {
            let mut shared = lock(&self.inner.shared);
            if shared.state == ConnectionState::Closed {
                return Err(StateError::Closed.into());
            }
            shared.url.clone_from(&url);
            shared.state = ConnectionState::Connecting;
            shared.session.take()
        };

        if let Some(session) = stale {
            if let Err(e) = session.shutdown(self.grace()).await {
                warn!("previous socket did not stop cleanly: {}", e);
            }
        }

        match self.inner.dial(&url).await {
            Ok(stream) => {
                if self.inner.install(stream, ConnectionState::Connecting) {
                    info!("switched to {}", url);
                    Ok(())
                } else {
                    Err(StateError::Closed.into())
                }
            }
            Err(e) => {
                let mut shared = lock(&self.inner.shared);
                if shared.state == ConnectionState::Connecting {
                    shared.state = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Stop the connection for good. Safe to call any number of times.
    ///
    /// Order: mark `Closed` so nothing reconnects, stop the write loop (which
    /// sends a best-effort close frame and closes the socket), stop the read
    /// loop, then stop the dispatch task from scheduling further handler calls.
    #[instrument(skip(self), fields(connection = %self.inner.name))]
    pub async fn disconnect(&self) -> Result<(), ExchangeError> {
        let session = {
            let mut shared = lock(&self.inner.shared);
            if shared.state == ConnectionState::Closed {
                return Ok(());
            }
            shared.state = ConnectionState::Closed;
            shared.session.take()
        };

        let result = match session {
            Some(session) => session.shutdown(self.grace()).await,
            None => Ok(()),
        };
        self.inner.shutdown.cancel();
        debug!("disconnected");
        result
    }

    fn grace(&self) -> Duration {
        self.inner.config.write_deadline.saturating_mul(2)
    }
}

impl ConnectionInner {
    async fn dial(&self, url: &str) -> Result<WsStream, ExchangeError> {
        let (stream, _) = timeout(self.config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                ExchangeError::transport(format!(
                    "websocket connect to {} timed out after {:?}",
                    url, self.config.connect_timeout
                ))
            })??;
        Ok(stream)
    }

    /// Adopt a freshly dialled socket if the state is still `expected`.
    ///
    /// Returns false (dropping the socket) when a concurrent transition won.
    fn install(self: &Arc<Self>, stream: WsStream, expected: ConnectionState) -> bool {
        self.start_dispatcher();

        let mut shared = lock(&self.shared);
        if shared.state != expected {
            return false;
        }

        shared.generation += 1;
        let generation = shared.generation;
        let (write, read) = stream.split();
        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_buffer_size.max(1));
        let cancel = self.shutdown.child_token();

        let reader = tokio::spawn(Arc::clone(self).read_loop(
            read,
            outbound.clone(),
            cancel.clone(),
            generation,
        ));
        let writer = tokio::spawn(Arc::clone(self).write_loop(
            write,
            outbound_rx,
            cancel.clone(),
            generation,
        ));

        shared.session = Some(Session {
            outbound,
            cancel,
            reader,
            writer,
        });
        shared.state = ConnectionState::Connected;
        true
    }

    fn start_dispatcher(self: &Arc<Self>) {
        let Some(inbound) = lock(&self.inbound_rx).take() else {
            return;
        };
        tokio::spawn(Arc::clone(self).dispatch_loop(inbound));
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<String>) {
        loop {
            let text = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(text) => text,
                    None => break,
                },
            };

            let handler = lock(&self.handlers).on_message.clone();
            match handler {
                Some(handler) => handler(text),
                None => trace!(connection = %self.name, "no message handler, dropping frame"),
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut read: SplitStream<WsStream>,
        outbound: mpsc::Sender<Message>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let deadline = self.config.read_deadline;
        let failure = loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = timeout(deadline, read.next()) => frame,
            };

            let message = match frame {
                Err(_) => {
                    break ExchangeError::transport(format!(
                        "no frame received within {:?}",
                        deadline
                    ))
                }
                Ok(None) => break ExchangeError::transport("websocket stream ended"),
                Ok(Some(Err(e))) => break e.into(),
                Ok(Some(Ok(message))) => message,
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection = %self.name, "dropping non-UTF-8 binary frame: {}", e);
                        continue;
                    }
                },
                Message::Ping(payload) => {
                    if outbound.try_send(Message::Pong(payload)).is_err() {
                        warn!(connection = %self.name, "outbound queue full, pong skipped");
                    }
                    continue;
                }
                Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(frame) => {
                    break ExchangeError::transport(format!("server closed connection: {:?}", frame))
                }
            };

            tokio::select! {
                () = cancel.cancelled() => return,
                queued = self.inbound.send(text) => {
                    if queued.is_err() {
                        return;
                    }
                }
            }
        };

        self.on_session_failure(generation, failure);
    }

    async fn write_loop(
        self: Arc<Self>,
        mut write: SplitSink<WsStream, Message>,
        mut outbound: mpsc::Receiver<Message>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let deadline = self.config.write_deadline;
        let period = self.config.ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let failure = loop {
            let message = tokio::select! {
                () = cancel.cancelled() => {
                    let closing = async {
                        write.send(Message::Close(None)).await?;
                        write.close().await
                    };
                    if let Ok(Err(e)) = timeout(deadline, closing).await {
                        debug!(connection = %self.name, "close frame not delivered: {}", e);
                    }
                    return;
                }
                next = outbound.recv() => match next {
                    Some(message) => message,
                    None => return,
                },
                _ = ticker.tick() => Message::Ping(Vec::new()),
            };

            match timeout(deadline, write.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => break ExchangeError::from(e),
                Err(_) => {
                    break ExchangeError::transport(format!(
                        "write did not complete within {:?}",
                        deadline
                    ))
                }
            }
        };

        self.on_session_failure(generation, failure);
    }

    /// Either loop of a session reports its failure here; only the first
    /// report for the live generation acts.
    fn on_session_failure(self: &Arc<Self>, generation: u64, error: ExchangeError) {
        let reconnect = {
            let mut shared = lock(&self.shared);
            if shared.generation != generation || shared.state != ConnectionState::Connected {
                return;
            }
            if let Some(session) = shared.session.take() {
                session.cancel.cancel();
            }
            if self.config.max_reconnect_attempts == 0 {
                shared.state = ConnectionState::Disconnected;
                false
            } else {
                shared.state = ConnectionState::Reconnecting;
                true
            }
        };

        warn!(connection = %self.name, "connection lost: {}", error);
        if reconnect {
            tokio::spawn(Arc::clone(self).reconnect_loop());
        } else {
            self.emit_error(error);
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempts = 0;
        for delay in self.config.backoff() {
            attempts += 1;
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = sleep(delay) => {}
            }

            let url = {
                let shared = lock(&self.shared);
                if shared.state != ConnectionState::Reconnecting {
                    return;
                }
                shared.url.clone()
            };

            debug!(connection = %self.name, attempt = attempts, ?delay, "reconnecting");
            match self.dial(&url).await {
                Ok(stream) => {
                    if self.install(stream, ConnectionState::Reconnecting) {
                        info!(connection = %self.name, attempt = attempts, "reconnected");
                        let handler = lock(&self.handlers).on_reconnect.clone();
                        if let Some(handler) = handler {
                            handler(attempts);
                        }
                    }
                    return;
                }
                Err(e) => warn!(connection = %self.name, attempt = attempts, "reconnect failed: {}", e),
            }
        }

        let gave_up = {
            let mut shared = lock(&self.shared);
            if shared.state == ConnectionState::Reconnecting {
                shared.state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        };
        if gave_up {
            error!(connection = %self.name, attempts, "giving up on reconnect");
            self.emit_error(ExchangeError::ReconnectLimitReached { attempts });
        }
    }

    fn emit_error(&self, error: ExchangeError) {
        let handler = lock(&self.handlers).on_error.clone();
        match handler {
            Some(handler) => handler(error),
            None => error!(connection = %self.name, "unhandled stream error: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_ceiling_and_stops_at_cap() {
        let config = WsConfig::default().with_reconnect(
            Duration::from_millis(100),
            Duration::from_secs(1),
            6,
        );
        let delays: Vec<_> = config.backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_zero_cap_yields_no_attempts() {
        let config = WsConfig::default().with_reconnect(Duration::from_secs(1), Duration::from_secs(1), 0);
        assert_eq!(config.backoff().count(), 0);
    }

    #[test]
    fn test_default_keepalive_timings() {
        let config = WsConfig::default();
        assert!(config.ping_interval < config.read_deadline);
        assert_eq!(config.write_deadline, Duration::from_secs(10));
        assert_eq!(config.backoff().count(), 10);
        assert_eq!(config.backoff().last(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let conn = StreamConnection::new("test", "ws://127.0.0.1:1/ws/x", WsConfig::default());
        let err = conn.send_message("{}").await.unwrap_err();
        assert!(matches!(err, ExchangeError::StateError(StateError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_terminal() {
        let conn = StreamConnection::new("test", "ws://127.0.0.1:1/ws/x", WsConfig::default());
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ExchangeError::StateError(StateError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_dial_leaves_connection_disconnected() {
        let config = WsConfig::default().with_connect_timeout(Duration::from_secs(2));
        let conn = StreamConnection::new("test", "ws://127.0.0.1:1/ws/x", config);
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ExchangeError::TransportError { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
