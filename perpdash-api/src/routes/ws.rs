//! WebSocket route handler
//!
//! Upgrades `/ws` and adapts the axum socket to the session handler, which
//! speaks tungstenite messages. Frames are converted in place, so the axum
//! socket's own backpressure reaches the session unchanged.

use std::io;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{stream, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite;
use tracing::info;

use crate::AppState;

/// Create WebSocket routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket upgrade request received");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    state.ws_state.handle_connection(bridge(socket)).await;
}

/// Present an axum socket as a tungstenite one
fn bridge<S>(
    socket: S,
) -> impl Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
       + Sink<tungstenite::Message, Error = tungstenite::Error>
       + Send
       + 'static
where
    S: Stream<Item = Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + 'static,
{
    socket
        .with_flat_map(|msg| stream::iter(to_axum(msg).map(Ok::<_, axum::Error>)))
        .sink_map_err(bridge_error)
        .map(|frame| frame.map(from_axum).map_err(bridge_error))
}

fn bridge_error(e: axum::Error) -> tungstenite::Error {
    tungstenite::Error::Io(io::Error::other(e))
}

/// A close frame becomes a bare close, which ends the session
fn from_axum(msg: Message) -> tungstenite::Message {
    match msg {
        Message::Text(text) => tungstenite::Message::Text(text.as_str().into()),
        Message::Binary(data) => tungstenite::Message::Binary(data.to_vec().into()),
        Message::Ping(data) => tungstenite::Message::Ping(data.to_vec().into()),
        Message::Pong(data) => tungstenite::Message::Pong(data.to_vec().into()),
        Message::Close(_) => tungstenite::Message::Close(None),
    }
}

/// `None` for frames axum has no counterpart for
fn to_axum(msg: tungstenite::Message) -> Option<Message> {
    Some(match msg {
        tungstenite::Message::Text(text) => Message::Text(text.as_str().into()),
        tungstenite::Message::Binary(data) => Message::Binary(Bytes::from(data.to_vec())),
        tungstenite::Message::Ping(data) => Message::Ping(Bytes::from(data.to_vec())),
        tungstenite::Message::Pong(data) => Message::Pong(Bytes::from(data.to_vec())),
        tungstenite::Message::Close(_) | tungstenite::Message::Frame(_) => return None,
    })
}
