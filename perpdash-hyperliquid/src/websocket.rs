//! Hyperliquid WebSocket client for real-time market data
//!
//! Owns the single physical connection to the exchange. The connection runs
//! as one task that is the only writer of the socket and of the active
//! subscription set; callers talk to it through an unbounded command channel,
//! so `subscribe`/`unsubscribe` never block.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected -> Disconnected` with a
//! fixed reconnect delay, and a terminal `Closed` reached only via
//! [`HyperliquidWebSocket::shutdown`]. On every successful connect the active
//! set is replayed, and a keep-alive ping is sent at a fixed interval for as
//! long as that connection stays up.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use perpdash_core::{
    ConnectionState, DashboardError, DashboardResult, SubscriptionKey, SubscriptionRequest,
    UpstreamMessage,
};

/// Hyperliquid mainnet WebSocket URL
pub const HYPERLIQUID_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// Hyperliquid testnet WebSocket URL
pub const HYPERLIQUID_TESTNET_WS_URL: &str = "wss://api.hyperliquid-testnet.xyz/ws";

/// Fixed delay before reconnecting after a disconnect
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Keep-alive interval (the exchange drops connections idle for 60s)
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Longest a connection attempt (TCP, TLS and upgrade) may take
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest slice of a malformed frame echoed into the logs
const LOGGED_FRAME_LIMIT: usize = 256;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for HyperliquidWebSocket
#[derive(Clone, Debug, PartialEq)]
pub struct HyperliquidWebSocketConfig {
    /// WebSocket endpoint (`ws://` or `wss://`)
    pub url: String,
    /// Fixed delay between a disconnect and the next connection attempt
    pub reconnect_delay: Duration,
    /// Interval between keep-alive pings while connected
    pub ping_interval: Duration,
    /// Deadline for one connection attempt; an attempt that runs over counts
    /// as a failed connect and is retried after `reconnect_delay`
    pub connect_timeout: Duration,
}

impl Default for HyperliquidWebSocketConfig {
    fn default() -> Self {
        Self {
            url: HYPERLIQUID_WS_URL.to_string(),
            reconnect_delay: RECONNECT_DELAY,
            ping_interval: PING_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl HyperliquidWebSocketConfig {
    /// Default timings against a custom endpoint
    pub fn with_url(url: impl Into<String>) -> DashboardResult<Self> {
        let config = Self {
            url: url.into(),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the config from environment variables.
    ///
    /// - `HYPERLIQUID_TESTNET=true` selects the testnet endpoint
    /// - `HYPERLIQUID_WS_URL` overrides the endpoint entirely
    /// - `HYPERLIQUID_RECONNECT_DELAY_MS`, `HYPERLIQUID_PING_INTERVAL_MS`,
    ///   `HYPERLIQUID_CONNECT_TIMEOUT_MS`
    pub fn from_env() -> DashboardResult<Self> {
        let mut config = Self::default();

        if std::env::var("HYPERLIQUID_TESTNET").is_ok_and(|v| v.eq_ignore_ascii_case("true")) {
            config.url = HYPERLIQUID_TESTNET_WS_URL.to_string();
        }
        if let Ok(url) = std::env::var("HYPERLIQUID_WS_URL") {
            config.url = url;
        }
        if let Some(delay) = env_millis("HYPERLIQUID_RECONNECT_DELAY_MS")? {
            config.reconnect_delay = delay;
        }
        if let Some(interval) = env_millis("HYPERLIQUID_PING_INTERVAL_MS")? {
            config.ping_interval = interval;
        }
        if let Some(deadline) = env_millis("HYPERLIQUID_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = deadline;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the endpoint scheme and that the timings are non-zero
    pub fn validate(&self) -> DashboardResult<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| DashboardError::config(format!("invalid url '{}': {}", self.url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(DashboardError::config(format!(
                "url '{}' is not a websocket endpoint",
                self.url
            )));
        }
        if self.ping_interval.is_zero() {
            return Err(DashboardError::config("ping interval must be non-zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(DashboardError::config("connect timeout must be non-zero"));
        }
        Ok(())
    }
}

fn env_millis(name: &str) -> DashboardResult<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| DashboardError::config(format!("{} must be milliseconds: {}", name, e))),
        Err(_) => Ok(None),
    }
}

// ============================================================================
// Updates and commands
// ============================================================================

/// Update emitted by the connection task, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum HyperliquidUpdate {
    /// A decoded data or error frame
    Message(UpstreamMessage),
    /// Connection state change
    ConnectionState(ConnectionState),
}

/// Commands sent to the connection task
#[derive(Debug)]
enum WebSocketCommand {
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
    Shutdown,
}

/// How a connected session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// Everything the connection task owns, handed over on `start`
struct ConnectionTask {
    command_rx: mpsc::UnboundedReceiver<WebSocketCommand>,
    update_tx: mpsc::UnboundedSender<HyperliquidUpdate>,
    state_tx: watch::Sender<ConnectionState>,
}

// ============================================================================
// Hyperliquid WebSocket Client
// ============================================================================

/// Hyperliquid WebSocket client.
///
/// Construct one per process and share it by `Arc`.
pub struct HyperliquidWebSocket {
    config: HyperliquidWebSocketConfig,
    /// Command sender to the connection task
    command_tx: mpsc::UnboundedSender<WebSocketCommand>,
    /// Observed connection state (only the connection task writes it)
    state_rx: watch::Receiver<ConnectionState>,
    /// Task state waiting for `start`
    pending: Mutex<Option<ConnectionTask>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HyperliquidWebSocket {
    /// Create a new client and the receiver for its updates.
    ///
    /// Nothing connects until [`start`](Self::start); subscriptions made before
    /// then are replayed on the first connect.
    pub fn new(
        config: HyperliquidWebSocketConfig,
    ) -> (Self, mpsc::UnboundedReceiver<HyperliquidUpdate>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        (
            Self {
                config,
                command_tx,
                state_rx,
                pending: Mutex::new(Some(ConnectionTask {
                    command_rx,
                    update_tx,
                    state_tx,
                })),
                task: Mutex::new(None),
            },
            update_rx,
        )
    }

    /// Spawn the connection task. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), anyhow::Error> {
        self.config.validate()?;

        let Some(task) = self.pending.lock().take() else {
            debug!("[Hyperliquid WS] Already started");
            return Ok(());
        };

        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            Self::connection_loop(config, task).await;
        });
        *self.task.lock() = Some(handle);

        Ok(())
    }

    /// Add a key to the active set, sending it now if connected
    pub fn subscribe(&self, key: SubscriptionKey) {
        if self.command_tx.send(WebSocketCommand::Subscribe(key)).is_err() {
            debug!("[Hyperliquid WS] Subscribe after shutdown ignored");
        }
    }

    /// Remove a key from the active set, unsubscribing now if connected
    pub fn unsubscribe(&self, key: SubscriptionKey) {
        if self.command_tx.send(WebSocketCommand::Unsubscribe(key)).is_err() {
            debug!("[Hyperliquid WS] Unsubscribe after shutdown ignored");
        }
    }

    /// Close the connection for good; no reconnect follows
    pub fn shutdown(&self) {
        info!("[Hyperliquid WS] Shutting down");
        if let Some(task) = self.pending.lock().take() {
            // Never started: there is no task to tell.
            task.state_tx.send_replace(ConnectionState::Closed);
            let _ = task
                .update_tx
                .send(HyperliquidUpdate::ConnectionState(ConnectionState::Closed));
            return;
        }
        let _ = self.command_tx.send(WebSocketCommand::Shutdown);
    }

    /// Wait until the connection task has stopped after `shutdown`
    pub async fn closed(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("[Hyperliquid WS] Connection task failed: {}", e);
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// A receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn config(&self) -> &HyperliquidWebSocketConfig {
        &self.config
    }

    /// Main connection loop with fixed-delay reconnection
    async fn connection_loop(config: HyperliquidWebSocketConfig, task: ConnectionTask) {
        let ConnectionTask {
            mut command_rx,
            update_tx,
            state_tx,
        } = task;

        // Keys wanted upstream, in the order they were first requested
        let mut active: IndexSet<SubscriptionKey> = IndexSet::new();

        loop {
            Self::set_state(&state_tx, &update_tx, ConnectionState::Connecting);
            info!("[Hyperliquid WS] Connecting to {}", config.url);

            let connect = timeout(config.connect_timeout, connect_async(config.url.as_str()));
            tokio::pin!(connect);

            let attempt = loop {
                tokio::select! {
                    result = &mut connect => break Some(result),
                    cmd = command_rx.recv() => match cmd {
                        Some(WebSocketCommand::Shutdown) | None => break None,
                        Some(cmd) => Self::apply_offline(cmd, &mut active),
                    },
                }
            };

            let outcome = match attempt {
                None => SessionEnd::Shutdown,
                Some(Ok(Ok((ws_stream, _)))) => {
                    Self::run_session(
                        ws_stream,
                        &config,
                        &mut command_rx,
                        &update_tx,
                        &state_tx,
                        &mut active,
                    )
                    .await
                }
                Some(Ok(Err(e))) => {
                    error!("[Hyperliquid WS] Connection failed: {}", e);
                    SessionEnd::Disconnected
                }
                Some(Err(_)) => {
                    error!(
                        "[Hyperliquid WS] Connection attempt timed out after {:?}",
                        config.connect_timeout
                    );
                    SessionEnd::Disconnected
                }
            };

            if outcome == SessionEnd::Shutdown {
                break;
            }

            Self::set_state(&state_tx, &update_tx, ConnectionState::Disconnected);
            info!(
                "[Hyperliquid WS] Reconnecting in {:?} ({} subscriptions to replay)",
                config.reconnect_delay,
                active.len()
            );

            let delay = tokio::time::sleep(config.reconnect_delay);
            tokio::pin!(delay);

            let shutdown = loop {
                tokio::select! {
                    _ = &mut delay => break false,
                    cmd = command_rx.recv() => match cmd {
                        Some(WebSocketCommand::Shutdown) | None => break true,
                        Some(cmd) => Self::apply_offline(cmd, &mut active),
                    },
                }
            };
            if shutdown {
                break;
            }
        }

        Self::set_state(&state_tx, &update_tx, ConnectionState::Closed);
        info!("[Hyperliquid WS] Closed");
    }

    /// Drive one connected session until it drops or shutdown is requested
    async fn run_session(
        ws_stream: UpstreamStream,
        config: &HyperliquidWebSocketConfig,
        command_rx: &mut mpsc::UnboundedReceiver<WebSocketCommand>,
        update_tx: &mpsc::UnboundedSender<HyperliquidUpdate>,
        state_tx: &watch::Sender<ConnectionState>,
        active: &mut IndexSet<SubscriptionKey>,
    ) -> SessionEnd {
        info!("[Hyperliquid WS] Connected successfully");
        let (mut write, mut read) = ws_stream.split();

        // Keys actually sent on this connection
        let mut live: HashSet<SubscriptionKey> = HashSet::with_capacity(active.len());

        for key in active.iter() {
            let request = SubscriptionRequest::subscribe(key.clone());
            if let Err(e) = Self::send_request(&mut write, &request).await {
                warn!("[Hyperliquid WS] Failed to re-subscribe {}: {}", key, e);
                return SessionEnd::Disconnected;
            }
            live.insert(key.clone());
        }
        if !live.is_empty() {
            info!("[Hyperliquid WS] Replayed {} subscriptions", live.len());
        }

        Self::set_state(state_tx, update_tx, ConnectionState::Connected);

        let mut keep_alive = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        Self::handle_message(text.as_str(), update_tx);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("[Hyperliquid WS] Connection closed by server: {:?}", frame);
                        return SessionEnd::Disconnected;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        trace!("[Hyperliquid WS] Pong");
                    }
                    // tungstenite answers pings itself on the next flush
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("[Hyperliquid WS] Error: {}", e);
                        return SessionEnd::Disconnected;
                    }
                    None => {
                        info!("[Hyperliquid WS] Stream ended");
                        return SessionEnd::Disconnected;
                    }
                },

                cmd = command_rx.recv() => match cmd {
                    Some(WebSocketCommand::Subscribe(key)) => {
                        active.insert(key.clone());
                        if live.insert(key.clone()) {
                            let request = SubscriptionRequest::subscribe(key.clone());
                            if let Err(e) = Self::send_request(&mut write, &request).await {
                                warn!("[Hyperliquid WS] Failed to subscribe {}: {}", key, e);
                                return SessionEnd::Disconnected;
                            }
                            debug!("[Hyperliquid WS] Subscribed to {}", key);
                        }
                    }
                    Some(WebSocketCommand::Unsubscribe(key)) => {
                        active.shift_remove(&key);
                        if live.remove(&key) {
                            let request = SubscriptionRequest::unsubscribe(key.clone());
                            if let Err(e) = Self::send_request(&mut write, &request).await {
                                warn!("[Hyperliquid WS] Failed to unsubscribe {}: {}", key, e);
                                return SessionEnd::Disconnected;
                            }
                            debug!("[Hyperliquid WS] Unsubscribed from {}", key);
                        }
                    }
                    Some(WebSocketCommand::Shutdown) | None => {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            debug!("[Hyperliquid WS] Close frame not sent: {}", e);
                        }
                        return SessionEnd::Shutdown;
                    }
                },

                _ = keep_alive.tick() => {
                    if let Err(e) = write.send(Message::Ping(Default::default())).await {
                        warn!("[Hyperliquid WS] Failed to send ping: {}", e);
                        return SessionEnd::Disconnected;
                    }
                    trace!("[Hyperliquid WS] Keep-alive ping sent");
                }
            }
        }
    }

    /// Record a command received while no connection is up
    fn apply_offline(cmd: WebSocketCommand, active: &mut IndexSet<SubscriptionKey>) {
        match cmd {
            WebSocketCommand::Subscribe(key) => {
                if active.insert(key.clone()) {
                    debug!("[Hyperliquid WS] Queued {} for next connect", key);
                }
            }
            WebSocketCommand::Unsubscribe(key) => {
                active.shift_remove(&key);
            }
            // Callers break out of their loop on shutdown before getting here
            WebSocketCommand::Shutdown => {}
        }
    }

    async fn send_request<W>(write: &mut W, request: &SubscriptionRequest) -> DashboardResult<()>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let json =
            serde_json::to_string(request).map_err(|e| DashboardError::parse(e.to_string()))?;
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| DashboardError::network(e.to_string()))
    }

    /// Decode one text frame and forward it; malformed frames are dropped
    fn handle_message(text: &str, update_tx: &mpsc::UnboundedSender<HyperliquidUpdate>) {
        match UpstreamMessage::decode(text) {
            Ok(UpstreamMessage::Pong) => {
                trace!("[Hyperliquid WS] Pong");
            }
            Ok(UpstreamMessage::SubscriptionResponse(ack)) => {
                debug!(
                    "[Hyperliquid WS] {:?} acknowledged for {}",
                    ack.method, ack.subscription
                );
            }
            Ok(message) => {
                if let UpstreamMessage::Error(ref reason) = message {
                    warn!("[Hyperliquid WS] Exchange error: {}", reason);
                }
                let _ = update_tx.send(HyperliquidUpdate::Message(message));
            }
            Err(e) => {
                let mut end = text.len().min(LOGGED_FRAME_LIMIT);
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                warn!("[Hyperliquid WS] Dropping malformed frame ({}): {}", e, &text[..end]);
            }
        }
    }

    fn set_state(
        state_tx: &watch::Sender<ConnectionState>,
        update_tx: &mpsc::UnboundedSender<HyperliquidUpdate>,
        state: ConnectionState,
    ) {
        if *state_tx.borrow() == state {
            return;
        }
        state_tx.send_replace(state);
        let _ = update_tx.send(HyperliquidUpdate::ConnectionState(state));
    }
}

impl std::fmt::Debug for HyperliquidWebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperliquidWebSocket")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
