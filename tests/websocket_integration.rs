//! Integration tests for the WebSocket transport against a local server.
//!
//! Each test binds a `tokio-tungstenite` server on `127.0.0.1:0`, accepts one
//! connection, and answers frames with a per-test script.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use common::{init_tracing, TEST_TIMEOUT};
use jsonrpc_websockets::{
    Client, ClientConfig, ConnectionState, Transport, TransportEvent, WebSocketTransport,
};
use url::Url;

/// Start a one-connection server.
///
/// Every message the server reads is forwarded to the returned receiver, then
/// `script` decides what to write back.
async fn spawn_server<F>(script: F) -> (String, mpsc::UnboundedReceiver<Message>)
where
    F: Fn(&Message) -> Vec<Message> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("Accept failed");
        let mut ws = accept_async(stream).await.expect("Handshake failed");

        while let Some(Ok(message)) = ws.next().await {
            let replies = script(&message);
            let _ = seen_tx.send(message);
            for reply in replies {
                if ws.send(reply).await.is_err() {
                    return;
                }
            }
        }
    });

    (format!("ws://{}", addr), seen_rx)
}

/// Parse a text message as JSON, if it is one.
fn as_json(message: &Message) -> Option<Value> {
    match message {
        Message::Text(_) => serde_json::from_str(message.to_text().ok()?).ok(),
        _ => None,
    }
}

/// Answer every call by echoing `params.text` as the result.
fn echo_script(message: &Message) -> Vec<Message> {
    let Some(request) = as_json(message) else {
        return Vec::new();
    };
    match request.get("id") {
        Some(id) => {
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": request["params"]["text"]});
            vec![Message::Text(reply.to_string().into())]
        }
        None => Vec::new(),
    }
}

async fn wait_for_state(client: &Client, expected: ConnectionState) {
    timeout(TEST_TIMEOUT, async {
        while client.state() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Client never reached {:?}", expected));
}

/// Test: call and notify over a real socket.
#[tokio::test]
async fn test_call_and_notify_over_websocket() {
    init_tracing();
    let (url, mut seen) = spawn_server(echo_script).await;

    let client = Client::new(ClientConfig::default());
    client.connect(&url).await.expect("Should connect");
    assert_eq!(client.state(), ConnectionState::Connected);

    let result: Option<String> = timeout(TEST_TIMEOUT, client.call("echo", json!({"text": "hi"})))
        .await
        .expect("Test timed out")
        .expect("Call should succeed");
    assert_eq!(result.as_deref(), Some("hi"));

    client
        .notify("log", json!({"msg": "x"}))
        .await
        .expect("Notify should succeed");

    // Server saw the call first, then the notification without an id.
    let mut texts = Vec::new();
    while texts.len() < 2 {
        let message = timeout(TEST_TIMEOUT, seen.recv()).await.unwrap().unwrap();
        if let Some(value) = as_json(&message) {
            texts.push(value);
        }
    }
    assert_eq!(texts[0]["method"], "echo");
    assert_eq!(
        texts[1],
        json!({"jsonrpc": "2.0", "method": "log", "params": {"msg": "x"}})
    );

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

/// Test: binary frames are dropped, text frames are delivered.
#[tokio::test]
async fn test_binary_frames_are_not_delivered() {
    init_tracing();
    let (url, _seen) = spawn_server(|message| {
        let Some(request) = as_json(message) else {
            return Vec::new();
        };
        if request["method"] != "start" {
            return Vec::new();
        }
        let pushed = |n: u32| json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": n}});
        vec![
            Message::Binary(pushed(1).to_string().into_bytes().into()),
            Message::Text(pushed(2).to_string().into()),
        ]
    })
    .await;

    let client = Client::new(ClientConfig::default());
    client.connect(&url).await.unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    client.subscribe::<Value>("tick").await.unwrap();
    client
        .on("tick", move |params: Value| {
            let _ = seen_tx.send(params["n"].as_u64());
        })
        .await
        .unwrap();

    client.notify("start", json!({})).await.unwrap();

    let first = timeout(TEST_TIMEOUT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, Some(2), "binary frame leaked through");

    client.disconnect().await.unwrap();
}

/// Test: a close frame from the server ends the session once.
#[tokio::test]
async fn test_server_close_disconnects_client() {
    init_tracing();
    let (url, _seen) = spawn_server(|message| match as_json(message) {
        Some(request) if request["method"] == "bye" => vec![Message::Close(None)],
        _ => Vec::new(),
    })
    .await;

    let client = Client::new(ClientConfig::default());
    client.connect(&url).await.unwrap();

    client.notify("bye", json!({})).await.unwrap();
    wait_for_state(&client, ConnectionState::Disconnected).await;

    // Disconnecting after the session already ended is still fine.
    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client.notify("after", json!({})).await.unwrap_err();
    assert!(
        err.to_string().contains("Not connected"),
        "Unexpected error: {}",
        err
    );
}

/// Test: keepalive pings reach the server on the configured interval.
#[tokio::test]
async fn test_keepalive_pings_are_sent() {
    init_tracing();
    let (url, mut seen) = spawn_server(|_| Vec::new()).await;

    let config = ClientConfig::default().with_keepalive_interval(Duration::from_millis(50));
    let client = Client::new(config);
    client.connect(&url).await.unwrap();

    let mut pings = 0;
    while pings < 2 {
        let message = timeout(TEST_TIMEOUT, seen.recv())
            .await
            .expect("No keepalive ping within timeout")
            .expect("Server stopped");
        if matches!(message, Message::Ping(_)) {
            pings += 1;
        }
    }

    assert_eq!(client.state(), ConnectionState::Connected);
    client.disconnect().await.unwrap();
}

/// Test: client-initiated disconnect sends a close frame.
#[tokio::test]
async fn test_disconnect_sends_close_frame() {
    init_tracing();
    let (url, mut seen) = spawn_server(|_| Vec::new()).await;

    let client = Client::new(ClientConfig::default());
    client.connect(&url).await.unwrap();
    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    loop {
        match timeout(TEST_TIMEOUT, seen.recv()).await.expect("Test timed out") {
            Some(Message::Close(_)) | None => break,
            Some(_) => continue,
        }
    }
}

/// Test: connecting to a closed port fails without changing state.
#[tokio::test]
async fn test_connect_refused() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(ClientConfig::default());
    let result = client.connect(&format!("ws://{}", addr)).await;

    assert!(result.is_err());
    client.pending_calls().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

/// Test: a connect cancelled mid-handshake leaves the client reusable.
///
/// The first server accepts TCP but never answers the upgrade, so the
/// handshake only ends when the caller gives up.
#[tokio::test]
async fn test_cancelled_connect_can_reconnect() {
    init_tracing();
    let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_addr = stalled.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _) = stalled.accept().await.expect("Accept failed");
        std::future::pending::<()>().await;
    });

    let client = Client::new(ClientConfig::default());
    let attempt = timeout(
        Duration::from_millis(200),
        client.connect(&format!("ws://{}", stalled_addr)),
    )
    .await;
    assert!(attempt.is_err(), "handshake should still be pending");

    wait_for_state(&client, ConnectionState::Disconnected).await;

    let (url, _seen) = spawn_server(echo_script).await;
    client.connect(&url).await.expect("Reconnect should succeed");
    let result: Option<String> = timeout(TEST_TIMEOUT, client.call("echo", json!({"text": "again"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.as_deref(), Some("again"));

    client.disconnect().await.unwrap();
}

/// Collect every event a transport reports until its listener is released.
async fn drain_events(mut events: mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut seen = Vec::new();
    while let Some(event) = timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("Session never released its listener")
    {
        seen.push(event);
    }
    seen
}

/// Test: the server dropping TCP without a close frame ends the session once.
///
/// Run with a short keepalive so the loss is seen by a read or a ping,
/// whichever comes first; either way exactly one `Disconnected` follows.
#[tokio::test]
async fn test_dropped_stream_disconnects_once() {
    init_tracing();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = server.accept().await.expect("Accept failed");
        let ws = accept_async(stream).await.expect("Handshake failed");
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(ws);
    });

    let transport = WebSocketTransport::new(Duration::from_millis(20));
    let (tx, rx) = mpsc::unbounded_channel();
    let url = Url::parse(&format!("ws://{}", addr)).unwrap();
    transport.connect(url, Arc::new(tx)).await.expect("Should connect");

    let events = drain_events(rx).await;
    assert_eq!(
        events,
        vec![TransportEvent::Connected, TransportEvent::Disconnected]
    );

    // Nothing left to close; still reports nothing new.
    transport.disconnect().await;
}

/// Test: a zero keepalive interval sends no pings.
#[tokio::test]
async fn test_zero_keepalive_disables_pings() {
    init_tracing();
    let (url, mut seen) = spawn_server(|_| Vec::new()).await;

    let config = ClientConfig::default().with_keepalive_interval(Duration::ZERO);
    let client = Client::new(config);
    client.connect(&url).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    while let Ok(message) = seen.try_recv() {
        assert!(
            !matches!(message, Message::Ping(_)),
            "ping sent with keepalive disabled"
        );
    }

    client.disconnect().await.unwrap();
}
