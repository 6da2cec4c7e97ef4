#![allow(dead_code)]

//! Shared helpers for integration tests: a relay-backed server on an
//! ephemeral port plus a thin tokio-tungstenite client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use sockhub::api;
use sockhub::hub::{ConnectionHub, SubProtocol};
use sockhub::relay::RelayEvents;

pub type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Build an [`api::AppState`] backed by the relay application layer.
pub fn relay_state(supported: &[&str]) -> api::AppState {
    let shutdown = CancellationToken::new();
    let hub = ConnectionHub::new();
    api::AppState {
        hub: hub.clone(),
        events: Arc::new(RelayEvents::new(hub, shutdown.clone())),
        supported: Arc::new(supported.iter().copied().map(SubProtocol::new).collect()),
        shutdown,
    }
}

pub async fn start_server(state: api::AppState) -> SocketAddr {
    let app = api::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

pub async fn connect(addr: SocketAddr, path: &str) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("websocket connect failed");
    ws
}

/// Receive the next text message, skipping control frames.
pub async fn recv_text(ws: &mut WsClient) -> String {
    let deadline = Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {other:?}"),
        }
    }
}

/// Try to receive a text message, returning `None` if nothing arrives
/// within the timeout.
pub async fn try_recv_text(ws: &mut WsClient, timeout: Duration) -> Option<String> {
    match tokio::time::timeout(timeout, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(text.as_str().to_string()),
        _ => None,
    }
}

/// Consume the relay greeting, returning the assigned connection id.
pub async fn greeting_id(ws: &mut WsClient) -> String {
    let greeting = recv_text(ws).await;
    greeting
        .strip_prefix("connected as ")
        .unwrap_or_else(|| panic!("unexpected greeting: {greeting}"))
        .to_string()
}

/// Poll until `condition` holds, panicking after 5 seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
