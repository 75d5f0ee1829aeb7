//! End-to-end multiplexing against a local mock exchange
//!
//! The mock exchange is a plain `ws://` server on localhost. Tests open
//! downstream subscriptions through the multiplexer and check what reaches
//! the exchange and what reaches each consumer.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use perpdash_core::{
    ClientMessage, ConnectionState, ServerMessage, SubscriptionKey, SubscriptionMethod,
    SubscriptionRequest, UpstreamMessage,
};
use perpdash_hyperliquid::HyperliquidWebSocketConfig;
use perpdash_services::{MarketDataMultiplexer, MultiplexerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(200);

type ServerSocket = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("client never connected")
        .unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_request(socket: &mut ServerSocket) -> Option<SubscriptionRequest> {
    while let Some(frame) = socket.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn expect_request(socket: &mut ServerSocket) -> SubscriptionRequest {
    timeout(WAIT, next_request(socket))
        .await
        .expect("no request from client")
        .expect("connection closed")
}

async fn expect_no_request(socket: &mut ServerSocket) {
    if let Ok(Some(request)) = timeout(QUIET, next_request(socket)).await {
        panic!("unexpected request {:?}", request);
    }
}

async fn send(socket: &mut ServerSocket, frame: &str) {
    socket.send(Message::Text(frame.into())).await.unwrap();
}

fn trades_frame(coin: &str, tid: u64) -> String {
    format!(
        r#"{{"channel":"trades","data":[{{"coin":"{}","side":"B","px":"100.5","sz":"2","hash":"0x{:x}","time":{},"tid":{}}}]}}"#,
        coin, tid, tid, tid
    )
}

async fn start(url: &str) -> MarketDataMultiplexer {
    let config = MultiplexerConfig {
        upstream: HyperliquidWebSocketConfig {
            reconnect_delay: Duration::from_millis(50),
            ..HyperliquidWebSocketConfig::with_url(url).unwrap()
        },
        release_idle_subscriptions: true,
    };
    let multiplexer = MarketDataMultiplexer::new(config);
    multiplexer.start().unwrap();
    multiplexer
}

async fn wait_connected(multiplexer: &MarketDataMultiplexer) {
    let mut rx = multiplexer.watch_state();
    timeout(WAIT, rx.wait_for(|s| s.is_connected()))
        .await
        .expect("never connected")
        .unwrap();
}

#[tokio::test]
async fn test_trades_reach_only_the_matching_coin() {
    let (listener, url) = bind().await;
    let multiplexer = start(&url).await;
    let mut exchange = accept(&listener).await;
    wait_connected(&multiplexer).await;

    let mut sol = multiplexer.subscribe_trades("SOL");
    assert_eq!(
        expect_request(&mut exchange).await,
        SubscriptionRequest::subscribe(SubscriptionKey::trades("SOL"))
    );

    send(&mut exchange, &trades_frame("SOL", 1)).await;
    send(&mut exchange, &trades_frame("ETH", 2)).await;
    send(&mut exchange, &trades_frame("SOL", 3)).await;

    let first = timeout(WAIT, sol.recv()).await.unwrap().unwrap().unwrap();
    let second = timeout(WAIT, sol.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!((first[0].coin.as_str(), first[0].tid), ("SOL", 1));
    assert_eq!((second[0].coin.as_str(), second[0].tid), ("SOL", 3));

    sol.close();
    assert_eq!(
        expect_request(&mut exchange).await,
        SubscriptionRequest::unsubscribe(SubscriptionKey::trades("SOL"))
    );

    send(&mut exchange, &trades_frame("SOL", 4)).await;
    assert!(sol.recv().await.is_none());

    multiplexer.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_all_mids_consumers_share_one_subscribe() {
    let (listener, url) = bind().await;
    let multiplexer = start(&url).await;
    let mut exchange = accept(&listener).await;
    wait_connected(&multiplexer).await;

    let (mut first, mut second) = tokio::join!(
        async { multiplexer.subscribe_all_mids() },
        async { multiplexer.subscribe_all_mids() }
    );

    assert_eq!(
        expect_request(&mut exchange).await,
        SubscriptionRequest::subscribe(SubscriptionKey::AllMids)
    );
    expect_no_request(&mut exchange).await;

    send(&mut exchange, r#"{"channel":"allMids","data":{"mids":{"BTC":"65000"}}}"#).await;
    assert!(timeout(WAIT, first.recv()).await.unwrap().unwrap().is_ok());
    assert!(timeout(WAIT, second.recv()).await.unwrap().unwrap().is_ok());

    first.close();
    expect_no_request(&mut exchange).await;

    send(&mut exchange, r#"{"channel":"allMids","data":{"mids":{"BTC":"65100"}}}"#).await;
    let mids = timeout(WAIT, second.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(mids.mid("BTC").map(|d| d.to_string()), Some("65100".to_string()));

    multiplexer.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_replays_keys_with_consumers() {
    let (listener, url) = bind().await;
    let multiplexer = start(&url).await;
    let mut exchange = accept(&listener).await;
    wait_connected(&multiplexer).await;

    let _book = multiplexer.subscribe_l2_book("BTC");
    let fills = multiplexer.subscribe_user_fills("0xabc");
    expect_request(&mut exchange).await;
    expect_request(&mut exchange).await;

    drop(fills);
    assert_eq!(
        expect_request(&mut exchange).await.method,
        SubscriptionMethod::Unsubscribe
    );

    drop(exchange);
    let mut state = multiplexer.watch_state();
    timeout(WAIT, state.wait_for(|s| !s.is_connected()))
        .await
        .unwrap()
        .unwrap();

    let mut exchange = accept(&listener).await;
    assert_eq!(
        expect_request(&mut exchange).await,
        SubscriptionRequest::subscribe(SubscriptionKey::l2_book("BTC"))
    );
    expect_no_request(&mut exchange).await;

    multiplexer.shutdown().await;
}

#[tokio::test]
async fn test_rejected_subscription_surfaces_as_handle_error() {
    let (listener, url) = bind().await;
    let multiplexer = start(&url).await;
    let mut exchange = accept(&listener).await;
    wait_connected(&multiplexer).await;

    let mut bad = multiplexer.subscribe_l2_book("NOPE");
    expect_request(&mut exchange).await;

    send(
        &mut exchange,
        r#"{"channel":"error","data":"Invalid subscription {\"type\":\"l2Book\",\"coin\":\"NOPE\"}"}"#,
    )
    .await;

    let item = timeout(WAIT, bad.recv()).await.unwrap().unwrap();
    assert!(item.is_err());

    multiplexer.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_ends_open_streams() {
    let (listener, url) = bind().await;
    let multiplexer = start(&url).await;
    let _exchange = accept(&listener).await;
    wait_connected(&multiplexer).await;

    let mut candles = multiplexer.subscribe_candles("ETH", None);
    multiplexer.shutdown().await;

    assert_eq!(multiplexer.state(), ConnectionState::Closed);
    assert!(timeout(WAIT, candles.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_browser_session_end_to_end() {
    let (exchange_listener, exchange_url) = bind().await;
    let multiplexer = start(&exchange_url).await;
    let mut exchange = accept(&exchange_listener).await;
    wait_connected(&multiplexer).await;

    // Serve one browser connection with the session handler
    let (browser_listener, browser_url) = bind().await;
    let ws_state = multiplexer.websocket_state();
    let server = tokio::spawn(async move {
        let socket = accept(&browser_listener).await;
        ws_state.handle_connection(socket).await;
    });

    let (mut browser, _) = connect_async(browser_url.as_str()).await.unwrap();

    let subscribe = ClientMessage::Subscribe {
        subscription: SubscriptionKey::trades("BTC"),
    };
    browser
        .send(Message::Text(serde_json::to_string(&subscribe).unwrap().into()))
        .await
        .unwrap();

    assert_eq!(
        expect_request(&mut exchange).await,
        SubscriptionRequest::subscribe(SubscriptionKey::trades("BTC"))
    );

    send(&mut exchange, &trades_frame("BTC", 9)).await;

    let mut update = None;
    while update.is_none() {
        let frame = timeout(WAIT, browser.next()).await.unwrap().unwrap().unwrap();
        let Message::Text(text) = frame else { continue };
        if let ServerMessage::Update {
            subscription,
            message,
        } = serde_json::from_str(text.as_str()).unwrap()
        {
            assert_eq!(subscription, SubscriptionKey::trades("BTC"));
            update = Some(message);
        }
    }
    assert!(matches!(update, Some(UpstreamMessage::Trades(_))));

    // Closing the browser releases its subscription upstream
    browser.close(None).await.unwrap();
    assert_eq!(
        expect_request(&mut exchange).await,
        SubscriptionRequest::unsubscribe(SubscriptionKey::trades("BTC"))
    );
    timeout(WAIT, server).await.unwrap().unwrap();

    multiplexer.shutdown().await;
}
