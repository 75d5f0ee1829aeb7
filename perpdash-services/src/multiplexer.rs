//! Market Data Multiplexer
//!
//! Owns the single Hyperliquid connection and the subscription registry,
//! routes every upstream update to the registry in arrival order, and exposes
//! one subscribe operation per channel returning a typed [`Subscription`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use perpdash_core::{
    AllMids, Candle, ChannelPayload, ConnectionState, DashboardError, DashboardResult, L2Book,
    SubscriptionKey, Trade, UserEvent, UserFills,
};
use perpdash_hyperliquid::{HyperliquidUpdate, HyperliquidWebSocket, HyperliquidWebSocketConfig};

use crate::websocket::{Subscription, SubscriptionManager, WebSocketState};

/// Stale threshold - if no message for this duration, consider connection stale
const STALE_THRESHOLD_SECS: i64 = 60;

/// Interval of the periodic health log line
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Default candle interval
pub const DEFAULT_CANDLE_INTERVAL: &str = "1m";

/// Health status for the upstream connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    pub connected: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub is_stale: bool,
}

/// Overall multiplexer health
#[derive(Debug, Clone, Serialize)]
pub struct MultiplexerHealth {
    pub hyperliquid: ConnectionHealth,
    /// Keys currently subscribed upstream
    pub active_subscriptions: usize,
    /// Live downstream handles
    pub consumers: usize,
    pub healthy: bool,
}

/// Configuration for the MarketDataMultiplexer
#[derive(Clone, Debug, PartialEq)]
pub struct MultiplexerConfig {
    pub upstream: HyperliquidWebSocketConfig,
    /// Unsubscribe upstream when the last consumer of a key leaves
    pub release_idle_subscriptions: bool,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            upstream: HyperliquidWebSocketConfig::default(),
            release_idle_subscriptions: true,
        }
    }
}

impl MultiplexerConfig {
    /// Upstream settings from the environment plus `RELEASE_IDLE_SUBSCRIPTIONS`
    pub fn from_env() -> DashboardResult<Self> {
        let release_idle_subscriptions = match std::env::var("RELEASE_IDLE_SUBSCRIPTIONS") {
            Ok(value) => value.trim().parse::<bool>().map_err(|_| {
                DashboardError::config(format!(
                    "RELEASE_IDLE_SUBSCRIPTIONS must be true or false, got '{}'",
                    value
                ))
            })?,
            Err(_) => true,
        };

        Ok(Self {
            upstream: HyperliquidWebSocketConfig::from_env()?,
            release_idle_subscriptions,
        })
    }
}

/// Health metrics for the connection (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    connected: AtomicBool,
    last_message_epoch_ms: AtomicU64,
    message_count: AtomicU64,
}

impl ConnectionMetrics {
    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn record_message(&self) {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_message_epoch_ms.store(now, Ordering::SeqCst);
        self.message_count.fetch_add(1, Ordering::SeqCst);
    }

    fn get_health(&self, state: ConnectionState) -> ConnectionHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        let last_ms = self.last_message_epoch_ms.load(Ordering::SeqCst);
        let message_count = self.message_count.load(Ordering::SeqCst);

        let last_message_time = if last_ms > 0 {
            DateTime::from_timestamp_millis(last_ms as i64)
        } else {
            None
        };

        let is_stale = match last_message_time {
            Some(t) if connected => (Utc::now() - t).num_seconds() > STALE_THRESHOLD_SECS,
            _ => !connected,
        };

        ConnectionHealth {
            state,
            connected,
            last_message_time,
            message_count,
            is_stale,
        }
    }
}

/// Multiplexes one upstream connection into many typed downstream streams
pub struct MarketDataMultiplexer {
    config: MultiplexerConfig,
    upstream: Arc<HyperliquidWebSocket>,
    subscriptions: Arc<SubscriptionManager>,
    metrics: Arc<ConnectionMetrics>,
    /// Update receiver waiting for `start`
    updates: Mutex<Option<mpsc::UnboundedReceiver<HyperliquidUpdate>>>,
    router_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl MarketDataMultiplexer {
    /// Create a new MarketDataMultiplexer. Nothing connects until `start`.
    pub fn new(config: MultiplexerConfig) -> Self {
        let (upstream, updates) = HyperliquidWebSocket::new(config.upstream.clone());
        let upstream = Arc::new(upstream);
        let subscriptions = Arc::new(SubscriptionManager::new(
            upstream.clone(),
            config.release_idle_subscriptions,
        ));

        Self {
            config,
            upstream,
            subscriptions,
            metrics: Arc::new(ConnectionMetrics::default()),
            updates: Mutex::new(Some(updates)),
            router_task: Mutex::new(None),
            health_task: Mutex::new(None),
        }
    }

    /// Start the upstream connection, the routing task and health logging
    pub fn start(&self) -> Result<(), anyhow::Error> {
        let mut pending = self.updates.lock();
        if pending.is_none() {
            return Ok(());
        }
        info!("[Multiplexer] Starting MarketDataMultiplexer");

        // A rejected config leaves the receiver in place for a later attempt
        self.upstream.start()?;
        let Some(updates) = pending.take() else {
            return Ok(());
        };
        drop(pending);

        let subscriptions = Arc::clone(&self.subscriptions);
        let metrics = Arc::clone(&self.metrics);
        *self.router_task.lock() = Some(tokio::spawn(async move {
            Self::process_updates(updates, subscriptions, metrics).await;
        }));

        // Start periodic health logging task
        let metrics = Arc::clone(&self.metrics);
        let subscriptions = Arc::clone(&self.subscriptions);
        let state_rx = self.upstream.watch_state();
        *self.health_task.lock() = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;

                let health = metrics.get_health(*state_rx.borrow());
                let status = if health.connected {
                    format!(
                        "connected ({}s ago)",
                        health
                            .last_message_time
                            .map(|t| (Utc::now() - t).num_seconds())
                            .unwrap_or(0)
                    )
                } else {
                    "disconnected".to_string()
                };

                info!(
                    "[Multiplexer] Health: Hyperliquid={}, subscriptions={}, consumers={}",
                    status,
                    subscriptions.total_subscriptions(),
                    subscriptions.total_consumers()
                );
            }
        }));
        info!("[Multiplexer] Health logging task started");

        Ok(())
    }

    /// Route upstream updates into the registry, in arrival order
    async fn process_updates(
        mut rx: mpsc::UnboundedReceiver<HyperliquidUpdate>,
        subscriptions: Arc<SubscriptionManager>,
        metrics: Arc<ConnectionMetrics>,
    ) {
        info!("[Multiplexer] Starting update router");

        while let Some(update) = rx.recv().await {
            match update {
                HyperliquidUpdate::Message(message) => {
                    if message.is_market_data() {
                        metrics.record_message();
                    }
                    subscriptions.dispatch(message);
                }
                HyperliquidUpdate::ConnectionState(state) => {
                    metrics.set_connected(state.is_connected());
                    match state {
                        ConnectionState::Disconnected => {
                            warn!("[Multiplexer] Upstream disconnected, expect a gap in delivery")
                        }
                        other => info!("[Multiplexer] Upstream {:?}", other),
                    }
                }
            }
        }

        // Upstream is closed for good; end every open stream
        subscriptions.close_all();
        info!("[Multiplexer] Update router stopped");
    }

    /// Register interest in any key, yielding raw upstream messages
    pub fn open(&self, key: SubscriptionKey) -> Subscription {
        self.subscriptions.open(key)
    }

    /// Register interest in `key` with a typed payload
    pub fn open_typed<T: ChannelPayload>(&self, key: SubscriptionKey) -> Subscription<T> {
        self.subscriptions.open(key)
    }

    /// Mid prices for every coin
    pub fn subscribe_all_mids(&self) -> Subscription<AllMids> {
        self.open_typed(SubscriptionKey::AllMids)
    }

    /// Order book snapshots for one coin
    pub fn subscribe_l2_book(&self, coin: impl Into<String>) -> Subscription<L2Book> {
        self.open_typed(SubscriptionKey::l2_book(coin))
    }

    /// Public trade batches for one coin
    pub fn subscribe_trades(&self, coin: impl Into<String>) -> Subscription<Vec<Trade>> {
        self.open_typed(SubscriptionKey::trades(coin))
    }

    /// Account events for an address
    pub fn subscribe_user_events(&self, user: impl Into<String>) -> Subscription<UserEvent> {
        self.open_typed(SubscriptionKey::user(user))
    }

    /// Fill snapshot then live fills for an address
    pub fn subscribe_user_fills(&self, user: impl Into<String>) -> Subscription<UserFills> {
        self.open_typed(SubscriptionKey::user_fills(user))
    }

    /// Candles for a coin; `None` uses [`DEFAULT_CANDLE_INTERVAL`]
    pub fn subscribe_candles(
        &self,
        coin: impl Into<String>,
        interval: Option<&str>,
    ) -> Subscription<Candle> {
        let interval = interval.unwrap_or(DEFAULT_CANDLE_INTERVAL);
        self.open_typed(SubscriptionKey::candle(coin, interval))
    }

    /// Browser session state sharing this multiplexer's registry
    pub fn websocket_state(&self) -> WebSocketState {
        WebSocketState::new(Arc::clone(&self.subscriptions), self.upstream.watch_state())
    }

    /// Get health status for the upstream connection
    pub fn get_health(&self) -> MultiplexerHealth {
        let hyperliquid = self.metrics.get_health(self.upstream.state());
        let healthy = !hyperliquid.is_stale;

        MultiplexerHealth {
            hyperliquid,
            active_subscriptions: self.subscriptions.total_subscriptions(),
            consumers: self.subscriptions.total_consumers(),
            healthy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.upstream.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.upstream.watch_state()
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Close the upstream connection and end every open stream
    pub async fn shutdown(&self) {
        info!("[Multiplexer] Shutting down");
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }

        self.upstream.shutdown();
        self.upstream.closed().await;

        let router = self.router_task.lock().take();
        match router {
            Some(router) => {
                if let Err(e) = router.await {
                    warn!("[Multiplexer] Update router failed: {}", e);
                }
            }
            // Never started
            None => self.subscriptions.close_all(),
        }
    }
}

impl std::fmt::Debug for MarketDataMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataMultiplexer")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}
