//! WebSocket connection handler
//!
//! Handles individual browser WebSocket connections. Each client
//! subscription is one [`Subscription`] handle; all of a client's handles
//! live in one `StreamMap`, so dropping the map on disconnect closes them.
//!
//! Outgoing frames go through a bounded queue. When the browser reads slowly
//! the session stops pulling from its handles, and the registry's own
//! per-handle limit takes over from there.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamMap;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use perpdash_core::{
    ClientMessage, ConnectionState, DashboardError, DashboardResult, ErrorCode, ServerMessage,
    SubscriptionKey, UpstreamMessage,
};

use super::stream::Subscription;
use super::subscription::SubscriptionManager;

/// Unique identifier for a browser WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Outgoing frames buffered per client before the session waits
const OUTGOING_QUEUE_CAPACITY: usize = 100;

/// One client subscription. Yields `None` once when the handle ends.
type ClientStream = BoxStream<'static, Option<DashboardResult<UpstreamMessage>>>;

type ClientStreams = StreamMap<SubscriptionKey, ClientStream>;

fn client_stream(handle: Subscription<UpstreamMessage>) -> ClientStream {
    handle
        .map(Some)
        .chain(stream::once(future::ready(None)))
        .boxed()
}

/// Shared state for WebSocket handlers
#[derive(Clone)]
pub struct WebSocketState {
    /// Subscription registry shared with the multiplexer
    pub subscriptions: Arc<SubscriptionManager>,
    /// Upstream connection state, forwarded to clients as it changes
    connection_state: watch::Receiver<ConnectionState>,
    next_client_id: Arc<AtomicU64>,
    /// Connected clients and how many subscriptions each holds
    clients: Arc<DashMap<ClientId, usize>>,
}

impl WebSocketState {
    /// Create new WebSocket state
    pub fn new(
        subscriptions: Arc<SubscriptionManager>,
        connection_state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            subscriptions,
            connection_state,
            next_client_id: Arc::new(AtomicU64::new(1)),
            clients: Arc::new(DashMap::new()),
        }
    }

    fn new_client_id(&self) -> ClientId {
        ClientId(self.next_client_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Get total number of connected clients
    pub fn total_clients(&self) -> usize {
        self.clients.len()
    }

    /// Number of subscriptions held by one client
    pub fn client_subscriptions(&self, client_id: ClientId) -> usize {
        self.clients.get(&client_id).map(|n| *n).unwrap_or(0)
    }

    /// Handle a new WebSocket connection until either side closes it
    pub async fn handle_connection<S>(&self, socket: S)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let client_id = self.new_client_id();
        self.clients.insert(client_id, 0);
        info!("New WebSocket connection: {}", client_id);

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);

        // Task: Send outgoing messages to WebSocket
        let mut send_task = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(j) => j,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };

                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        let mut status_rx = self.connection_state.clone();
        let mut status_open = true;
        let status = *status_rx.borrow_and_update();
        let _ = outgoing_tx.send(ServerMessage::ConnectionStatus { status }).await;

        let mut streams = ClientStreams::new();

        loop {
            tokio::select! {
                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Received close from {}", client_id);
                        break;
                    }
                    Some(Ok(msg)) => {
                        if let Err(e) = self.handle_message(client_id, msg, &mut streams, &outgoing_tx) {
                            warn!("Error handling message from {}: {}", client_id, e);
                        }
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error for {}: {}", client_id, e);
                        break;
                    }
                },

                Some((subscription, item)) = streams.next(), if !streams.is_empty() => {
                    let message = match item {
                        Some(Ok(message)) => ServerMessage::Update { subscription, message },
                        Some(Err(e)) => Self::error_message(subscription, e),
                        None => {
                            streams.remove(&subscription);
                            self.set_client_subscriptions(client_id, streams.len());
                            debug!("Subscription {} of {} ended", subscription, client_id);
                            ServerMessage::Error {
                                code: ErrorCode::SubscriptionClosed,
                                message: format!("Subscription {} ended", subscription),
                                subscription: Some(subscription),
                            }
                        }
                    };
                    if outgoing_tx.send(message).await.is_err() {
                        break;
                    }
                }

                changed = status_rx.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let status = *status_rx.borrow_and_update();
                    let message = ServerMessage::ConnectionStatus { status };
                    if outgoing_tx.send(message).await.is_err() {
                        break;
                    }
                }

                _ = &mut send_task => {
                    debug!("Send task for {} finished", client_id);
                    break;
                }
            }
        }

        // Dropping the map closes every handle this client opened
        let open = streams.len();
        drop(streams);
        send_task.abort();

        self.clients.remove(&client_id);
        info!(
            "WebSocket connection closed: {} ({} subscriptions released)",
            client_id, open
        );
    }

    /// Handle an incoming WebSocket message
    fn handle_message(
        &self,
        client_id: ClientId,
        msg: Message,
        streams: &mut ClientStreams,
        outgoing_tx: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), String> {
        match msg {
            Message::Text(text) => {
                let client_msg: ClientMessage = match serde_json::from_str(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        Self::reply(client_id, outgoing_tx, ServerMessage::Error {
                            code: ErrorCode::InvalidMessage,
                            message: format!("Invalid JSON: {}", e),
                            subscription: None,
                        });
                        return Err(format!("Invalid JSON: {}", e));
                    }
                };

                match client_msg {
                    ClientMessage::Subscribe { subscription } => {
                        if !streams.contains_key(&subscription) {
                            let handle = self.subscriptions.open(subscription.clone());
                            streams.insert(subscription.clone(), client_stream(handle));
                            self.set_client_subscriptions(client_id, streams.len());
                            debug!("Client {} subscribed to {}", client_id, subscription);
                        }

                        let reply = ServerMessage::Subscribed { subscription };
                        Self::reply(client_id, outgoing_tx, reply);
                    }
                    ClientMessage::Unsubscribe { subscription } => {
                        match streams.remove(&subscription) {
                            Some(handle) => {
                                // Dropping the stream closes the handle
                                drop(handle);
                                self.set_client_subscriptions(client_id, streams.len());
                                debug!("Client {} unsubscribed from {}", client_id, subscription);
                                Self::reply(
                                    client_id,
                                    outgoing_tx,
                                    ServerMessage::Unsubscribed { subscription },
                                );
                            }
                            None => {
                                Self::reply(client_id, outgoing_tx, ServerMessage::Error {
                                    code: ErrorCode::NotSubscribed,
                                    message: format!("Not subscribed to {}", subscription),
                                    subscription: Some(subscription),
                                });
                            }
                        }
                    }
                    ClientMessage::Ping { timestamp } => {
                        Self::reply(client_id, outgoing_tx, ServerMessage::Pong {
                            client_timestamp: timestamp,
                            server_timestamp: Utc::now().timestamp_millis(),
                        });
                    }
                }
            }
            Message::Ping(_) => {
                // Handled automatically by tungstenite
                debug!("Received ping from {}", client_id);
            }
            Message::Pong(_) => {
                debug!("Received pong from {}", client_id);
            }
            Message::Binary(_) => {
                Self::reply(client_id, outgoing_tx, ServerMessage::Error {
                    code: ErrorCode::InvalidMessage,
                    message: "Binary messages not supported".to_string(),
                    subscription: None,
                });
            }
            Message::Close(_) | Message::Frame(_) => {}
        }

        Ok(())
    }

    /// Queue a direct reply. Replies are dropped while the queue is full.
    fn reply(
        client_id: ClientId,
        outgoing_tx: &mpsc::Sender<ServerMessage>,
        message: ServerMessage,
    ) {
        if let Err(mpsc::error::TrySendError::Full(message)) = outgoing_tx.try_send(message) {
            warn!("Outgoing queue for {} full, dropping {:?}", client_id, message);
        }
    }

    fn set_client_subscriptions(&self, client_id: ClientId, count: usize) {
        if let Some(mut entry) = self.clients.get_mut(&client_id) {
            *entry = count;
        }
    }

    fn error_message(subscription: SubscriptionKey, error: DashboardError) -> ServerMessage {
        let code = match &error {
            DashboardError::SubscriptionRejected { .. } => ErrorCode::SubscriptionRejected,
            DashboardError::Lagged { .. } => ErrorCode::Lagged,
            _ => ErrorCode::InternalError,
        };
        ServerMessage::Error {
            code,
            message: error.to_string(),
            subscription: Some(subscription),
        }
    }
}

impl std::fmt::Debug for WebSocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketState")
            .field("subscriptions", &self.subscriptions)
            .field("clients", &self.total_clients())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::UpstreamControl;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct NoopUpstream;

    impl UpstreamControl for NoopUpstream {
        fn subscribe(&self, _key: SubscriptionKey) {}
        fn unsubscribe(&self, _key: SubscriptionKey) {}
    }

    fn state() -> (WebSocketState, watch::Sender<ConnectionState>) {
        let manager = Arc::new(SubscriptionManager::new(Arc::new(NoopUpstream), true));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        (WebSocketState::new(manager, state_rx), state_tx)
    }

    /// In-memory socket: frames in from a channel, frames out to a channel
    struct TestSocket {
        incoming: mpsc::UnboundedReceiver<Message>,
        outgoing: mpsc::UnboundedSender<Message>,
    }

    impl Stream for TestSocket {
        type Item = Result<Message, tungstenite::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.incoming.poll_recv(cx).map(|msg| msg.map(Ok))
        }
    }

    impl Sink<Message> for TestSocket {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.outgoing
                .send(item)
                .map_err(|_| tungstenite::Error::ConnectionClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn connect(
        state: &WebSocketState,
    ) -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
        tokio::task::JoinHandle<()>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let socket = TestSocket {
            incoming: in_rx,
            outgoing: out_tx,
        };
        let state = state.clone();
        let task = tokio::spawn(async move { state.handle_connection(socket).await });
        (in_tx, out_rx, task)
    }

    async fn next_server_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> ServerMessage {
        loop {
            match rx.recv().await {
                Some(Message::Text(text)) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(_) => continue,
                None => panic!("connection closed"),
            }
        }
    }

    fn text(value: serde_json::Value) -> Message {
        Message::Text(value.to_string().into())
    }

    #[tokio::test]
    async fn test_subscribe_update_unsubscribe() {
        let (state, _state_tx) = state();
        let (input, mut output, task) = connect(&state);

        assert_eq!(
            next_server_message(&mut output).await,
            ServerMessage::ConnectionStatus {
                status: ConnectionState::Connected
            }
        );

        input
            .send(text(serde_json::json!({
                "type": "subscribe",
                "subscription": { "type": "l2Book", "coin": "BTC" }
            })))
            .unwrap();
        assert_eq!(
            next_server_message(&mut output).await,
            ServerMessage::Subscribed {
                subscription: SubscriptionKey::l2_book("BTC")
            }
        );

        let book = UpstreamMessage::decode(
            r#"{"channel":"l2Book","data":{"coin":"BTC","time":7,"levels":[[],[]]}}"#,
        )
        .unwrap();
        assert_eq!(state.subscriptions.dispatch(book.clone()), 1);
        assert_eq!(
            next_server_message(&mut output).await,
            ServerMessage::Update {
                subscription: SubscriptionKey::l2_book("BTC"),
                message: book
            }
        );

        input
            .send(text(serde_json::json!({
                "type": "unsubscribe",
                "subscription": { "type": "l2Book", "coin": "BTC" }
            })))
            .unwrap();
        assert!(matches!(
            next_server_message(&mut output).await,
            ServerMessage::Unsubscribed { .. }
        ));
        assert_eq!(state.subscriptions.total_consumers(), 0);

        drop(input);
        task.await.unwrap();
        assert_eq!(state.total_clients(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_releases_every_subscription() {
        let (state, _state_tx) = state();
        let (input, mut output, task) = connect(&state);
        next_server_message(&mut output).await;

        for coin in ["BTC", "ETH", "SOL"] {
            input
                .send(text(serde_json::json!({
                    "type": "subscribe",
                    "subscription": { "type": "trades", "coin": coin }
                })))
                .unwrap();
            next_server_message(&mut output).await;
        }
        assert_eq!(state.subscriptions.total_consumers(), 3);
        assert_eq!(state.total_clients(), 1);

        drop(input);
        task.await.unwrap();
        assert_eq!(state.subscriptions.total_consumers(), 0);
    }

    #[tokio::test]
    async fn test_bad_requests_get_error_replies() {
        let (state, _state_tx) = state();
        let (input, mut output, task) = connect(&state);
        next_server_message(&mut output).await;

        input.send(Message::Text("not json".into())).unwrap();
        assert!(matches!(
            next_server_message(&mut output).await,
            ServerMessage::Error {
                code: ErrorCode::InvalidMessage,
                ..
            }
        ));

        input
            .send(text(serde_json::json!({
                "type": "unsubscribe",
                "subscription": { "type": "allMids" }
            })))
            .unwrap();
        assert!(matches!(
            next_server_message(&mut output).await,
            ServerMessage::Error {
                code: ErrorCode::NotSubscribed,
                subscription: Some(SubscriptionKey::AllMids),
                ..
            }
        ));

        input
            .send(text(serde_json::json!({ "type": "ping", "timestamp": 42 })))
            .unwrap();
        match next_server_message(&mut output).await {
            ServerMessage::Pong {
                client_timestamp, ..
            } => assert_eq!(client_timestamp, 42),
            other => panic!("unexpected {:?}", other),
        }

        drop(input);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_is_told_when_a_subscription_ends_server_side() {
        let (state, _state_tx) = state();
        let (input, mut output, task) = connect(&state);
        next_server_message(&mut output).await;

        input
            .send(text(serde_json::json!({
                "type": "subscribe",
                "subscription": { "type": "trades", "coin": "ETH" }
            })))
            .unwrap();
        next_server_message(&mut output).await;
        assert_eq!(state.client_subscriptions(ClientId(1)), 1);

        state.subscriptions.close_all();
        match next_server_message(&mut output).await {
            ServerMessage::Error {
                code: ErrorCode::SubscriptionClosed,
                subscription,
                ..
            } => assert_eq!(subscription, Some(SubscriptionKey::trades("ETH"))),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(state.client_subscriptions(ClientId(1)), 0);
        assert_eq!(state.total_clients(), 1);

        drop(input);
        task.await.unwrap();
        assert_eq!(state.total_clients(), 0);
    }

    #[tokio::test]
    async fn test_connection_status_changes_are_forwarded() {
        let (state, state_tx) = state();
        let (input, mut output, task) = connect(&state);
        next_server_message(&mut output).await;

        state_tx.send_replace(ConnectionState::Disconnected);
        assert_eq!(
            next_server_message(&mut output).await,
            ServerMessage::ConnectionStatus {
                status: ConnectionState::Disconnected
            }
        );

        drop(input);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejections_are_reported_per_subscription() {
        let (state, _state_tx) = state();
        let (input, mut output, task) = connect(&state);
        next_server_message(&mut output).await;

        input
            .send(text(serde_json::json!({
                "type": "subscribe",
                "subscription": { "type": "l2Book", "coin": "NOPE" }
            })))
            .unwrap();
        next_server_message(&mut output).await;

        state.subscriptions.dispatch(UpstreamMessage::Error(
            r#"Invalid subscription {"type":"l2Book","coin":"NOPE"}"#.to_string(),
        ));
        assert!(matches!(
            next_server_message(&mut output).await,
            ServerMessage::Error {
                code: ErrorCode::SubscriptionRejected,
                ..
            }
        ));

        drop(input);
        task.await.unwrap();
    }
}
