//! HTTP/WebSocket transport layer in front of the connection hub.
//!
//! The handshake endpoint negotiates the subprotocol before committing the
//! upgrade, so a negotiation failure is a plain 400 and never creates a
//! connection. Once upgraded, the socket is handed to the hub, which owns
//! the rest of the connection's lifecycle.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::connection::ConnectionEvents;
use crate::hub::{
    negotiate, AcceptOptions, BroadcastSummary, ConnectionHub, Disconnect, Retired, SubProtocol,
    UpgradeRequest,
};
use crate::socket::{split_socket, CloseFrame, MessageSink};

#[derive(Clone)]
pub struct AppState {
    pub hub: ConnectionHub,
    /// Application callbacks shared by every accepted connection.
    pub events: Arc<dyn ConnectionEvents>,
    /// Subprotocols offered to clients, in preference order. Empty means
    /// connections are accepted without negotiation.
    pub supported: Arc<Vec<SubProtocol>>,
    /// Root token cancelled at server shutdown; each connection gets a
    /// child token.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/stats", get(stats))
        .route("/broadcast", post(broadcast))
        .route("/connections/{id}/send", post(send_to_connection))
        .route("/ws", get(ws_connect))
        .route("/ws/{key}", get(ws_connect_keyed))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct StatsResponse {
    connections: usize,
    ids: Vec<String>,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connections: state.hub.count(),
        ids: state.hub.ids(),
    })
}

#[derive(Deserialize)]
struct BroadcastRequest {
    message: String,
    key: Option<String>,
}

async fn broadcast(
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> Json<BroadcastSummary> {
    let summary = state
        .hub
        .broadcast(&req.message, req.key.as_deref(), &state.shutdown)
        .await;
    Json(summary)
}

#[derive(Serialize)]
struct SendResponse {
    delivered: bool,
}

async fn send_to_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    match state.hub.lookup(&id) {
        Some(conn) => {
            let outcome = conn.send_text(&body).await;
            Json(SendResponse {
                delivered: outcome.is_sent(),
            })
            .into_response()
        }
        None => (StatusCode::NOT_FOUND, format!("no connection with id {id}")).into_response(),
    }
}

async fn ws_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    serve_upgrade(state, headers, ws, None)
}

async fn ws_connect_keyed(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    serve_upgrade(state, headers, ws, Some(key))
}

/// Subprotocol names from `Sec-WebSocket-Protocol`, in client order.
fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn supported_slice(supported: &[SubProtocol]) -> Option<&[SubProtocol]> {
    if supported.is_empty() {
        None
    } else {
        Some(supported)
    }
}

fn serve_upgrade(
    state: AppState,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    key: Option<String>,
) -> Response {
    let requested = requested_protocols(&headers);
    let request = UpgradeRequest {
        is_upgrade: ws.is_ok(),
        requested_protocols: requested.clone(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => {
            return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
        }
    };

    // Negotiate before committing the upgrade so the handshake response can
    // carry the selected protocol.
    let selected = match negotiate(supported_slice(&state.supported), &requested) {
        Ok(selected) => selected,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let mut ws = ws.max_frame_size(state.hub.config().receive_buffer_size);
    if let Some(ref proto) = selected {
        ws = ws.protocols([proto.name().to_owned()]);
    }

    ws.on_upgrade(move |socket| handle_socket(state, socket, request, key))
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    request: UpgradeRequest,
    key: Option<String>,
) {
    let (sink, stream) = split_socket(socket);
    let cancel = state.shutdown.child_token();

    // Transport keep-alive: periodic pings until the connection ends.
    let pinger = {
        let sink = sink.clone();
        let cancel = cancel.clone();
        let period = state.hub.config().keep_alive_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if sink.send_ping().await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let options = AcceptOptions {
        id: None,
        key,
        supported: supported_slice(&state.supported).map(<[SubProtocol]>::to_vec),
    };
    let result = state
        .hub
        .accept(
            request,
            sink.clone(),
            stream,
            state.events.clone(),
            options,
            cancel.clone(),
        )
        .await;

    // A cancelled loop exits without a wire close; flush one so the client
    // sees a normal shutdown rather than a dropped TCP stream.
    if let Ok(Retired {
        disconnect: Disconnect::Cancelled,
        ..
    }) = &result
    {
        let _ = sink
            .send_close(CloseFrame::normal("server shutting down"))
            .await;
    }

    cancel.cancel();
    pinger.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn requested_protocols_splits_and_trims() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("v2, v1 ,,  v3"),
        );
        assert_eq!(requested_protocols(&headers), vec!["v2", "v1", "v3"]);
    }

    #[test]
    fn requested_protocols_merges_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("v1"),
        );
        headers.append(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("v2"),
        );
        assert_eq!(requested_protocols(&headers), vec!["v1", "v2"]);
    }

    #[test]
    fn requested_protocols_empty_without_header() {
        assert!(requested_protocols(&HeaderMap::new()).is_empty());
    }
}
