//! The connection hub: a concurrency-safe registry of live connections plus
//! the accept/negotiate/receive state machine that drives each one.
//!
//! Every accepted connection runs as one independent task; the registry is
//! the only shared state between them. A connection's failure is contained
//! to its own task: the registry and every other connection's loop keep
//! running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionEvents, SendOutcome};
use crate::socket::{CloseFrame, Frame, MessageSink, MessageStream, SocketError, UNSUPPORTED_DATA};

/// Per-frame receive cap applied by the transport layer at upgrade time.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;

/// Transport keep-alive ping interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(120);

/// A named application-level protocol variant offered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubProtocol {
    name: String,
}

impl SubProtocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Construction-time knobs for the hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum size of a single received frame, in bytes.
    pub receive_buffer_size: usize,
    /// Interval between server-initiated pings. Liveness is delegated to the
    /// transport layer; the hub itself enforces no timeouts.
    pub keep_alive_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            keep_alive_interval: DEFAULT_KEEP_ALIVE,
        }
    }
}

/// Admission input supplied by the hosting transport layer.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    /// Whether the inbound request is a websocket upgrade at all.
    pub is_upgrade: bool,
    /// Subprotocol names the client asked for, in client order.
    pub requested_protocols: Vec<String>,
}

/// Optional per-connection accept parameters.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Connection id; generated when absent. Duplicate ids replace the
    /// existing registry entry (add-or-update).
    pub id: Option<String>,
    /// Broadcast filter tag for this connection.
    pub key: Option<String>,
    /// Server-supported subprotocols, in preference order.
    pub supported: Option<Vec<SubProtocol>>,
}

/// Reasons an accept attempt ends before a connection is registered.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// Normal negative outcome: the request was not an upgrade.
    #[error("request is not a websocket upgrade")]
    NotAnUpgrade,
    /// The client requested subprotocols and none matched the supported
    /// list. No handle is created and no callback is invoked.
    #[error("no requested subprotocol is supported (requested: {requested:?})")]
    NegotiationRejected { requested: Vec<String> },
}

/// Why a connection's receive loop ended.
#[derive(Debug)]
pub enum Disconnect {
    /// The peer sent a close frame (echoed back if we were still open).
    ClosedByPeer(Option<CloseFrame>),
    /// The transport stream ended without a close frame.
    StreamEnded,
    /// A binary frame arrived; binary payloads are not supported.
    UnsupportedFrame,
    /// The transport failed while waiting for or parsing a frame.
    Transport(SocketError),
    /// Cancellation was observed before or during a receive wait.
    Cancelled,
}

/// Returned once a connection has been accepted, served, and retired.
#[derive(Debug)]
pub struct Retired {
    pub id: String,
    pub disconnect: Disconnect,
}

/// Counters for one broadcast call, for diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BroadcastSummary {
    /// Handles matching the key filter at snapshot time.
    pub targeted: usize,
    /// Sends that reached the transport.
    pub delivered: usize,
    /// Handles observed not-open and retired after the sends completed.
    pub pruned: usize,
}

/// Select a subprotocol from the server-supported list.
///
/// The supported list's order is the authoritative tie-break: the first
/// supported entry that appears anywhere in `requested` wins. An absent
/// supported list or an empty request negotiates no subprotocol; a
/// non-empty request with no match is a fatal negotiation failure.
pub fn negotiate(
    supported: Option<&[SubProtocol]>,
    requested: &[String],
) -> Result<Option<SubProtocol>, AcceptError> {
    let Some(supported) = supported else {
        return Ok(None);
    };
    if requested.is_empty() {
        return Ok(None);
    }
    for candidate in supported {
        if requested.iter().any(|r| r == candidate.name()) {
            return Ok(Some(candidate.clone()));
        }
    }
    Err(AcceptError::NegotiationRejected {
        requested: requested.to_vec(),
    })
}

/// Registry of live connections keyed by id.
///
/// Cloning is cheap; all clones share the same registry.
#[derive(Clone)]
pub struct ConnectionHub {
    connections: Arc<RwLock<HashMap<String, Arc<Connection>>>>,
    config: HubConfig,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    pub fn with_config(config: HubConfig) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Look up a connection by id.
    pub fn lookup(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Current registry size. Observational only; may be stale under
    /// concurrent mutation.
    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    /// Ids of all registered connections.
    pub fn ids(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    fn register(&self, conn: Arc<Connection>) {
        let replaced = self
            .connections
            .write()
            .insert(conn.id().to_string(), conn.clone());
        if replaced.is_some() {
            tracing::warn!(id = %conn.id(), "replacing existing registry entry with the same id");
        }
        tracing::debug!(id = %conn.id(), key = ?conn.key(), "connection registered");
    }

    /// Retire a connection: remove it from the registry and run its close
    /// callback.
    ///
    /// Removal is compare-and-remove keyed by handle identity, so retiring
    /// a handle that was already replaced by a duplicate-id insert leaves
    /// the newer entry alone. The close callback fires at most once per
    /// handle no matter how many retirement paths race.
    pub(crate) async fn retire(&self, conn: &Arc<Connection>) {
        let removed = {
            let mut map = self.connections.write();
            match map.get(conn.id()) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    map.remove(conn.id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::debug!(id = %conn.id(), "connection deregistered");
        }
        if conn.claim_retirement() {
            conn.events().clone().on_close(conn).await;
        }
    }

    /// Send `message` to every registered connection matching `key`.
    ///
    /// With no key, every connection is targeted; with a key, a connection
    /// is targeted when its own key is absent or equal. Sends run
    /// concurrently and the call returns only after every attempt has
    /// finished. Handles observed not-open at send time are retired after
    /// all sends complete.
    ///
    /// Cancellation is checked before each individual send; an arbitrary
    /// prefix of the sends may already have been delivered, with no
    /// rollback.
    pub async fn broadcast(
        &self,
        message: &str,
        key: Option<&str>,
        cancel: &CancellationToken,
    ) -> BroadcastSummary {
        let targets: Vec<Arc<Connection>> = {
            let map = self.connections.read();
            map.values()
                .filter(|conn| match (key, conn.key()) {
                    (None, _) => true,
                    (Some(_), None) => true,
                    (Some(wanted), Some(own)) => wanted == own,
                })
                .cloned()
                .collect()
        };
        let targeted = targets.len();

        let attempts = targets.into_iter().map(|conn| {
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return (conn, SendOutcome::Cancelled);
                }
                let outcome = conn.send_text(message).await;
                (conn, outcome)
            }
        });
        let outcomes = join_all(attempts).await;

        let mut delivered = 0;
        let mut stale = Vec::new();
        for (conn, outcome) in outcomes {
            if outcome.is_sent() {
                delivered += 1;
            } else if outcome.is_stale() {
                stale.push(conn);
            }
        }

        let pruned = stale.len();
        for conn in &stale {
            self.retire(conn).await;
        }

        let summary = BroadcastSummary {
            targeted,
            delivered,
            pruned,
        };
        tracing::debug!(?summary, key = ?key, "broadcast finished");
        summary
    }

    /// Accept one connection and drive its entire lifecycle: admission
    /// check, subprotocol negotiation, registration, the connected
    /// callback, the receive loop, and retirement.
    ///
    /// Returns only after the connection has been retired. Failures after
    /// registration are contained: they end this connection's loop and are
    /// reported through [`Retired::disconnect`], never propagated.
    pub async fn accept<S>(
        &self,
        request: UpgradeRequest,
        sink: Arc<dyn MessageSink>,
        mut stream: S,
        events: Arc<dyn ConnectionEvents>,
        options: AcceptOptions,
        cancel: CancellationToken,
    ) -> Result<Retired, AcceptError>
    where
        S: MessageStream,
    {
        if !request.is_upgrade {
            tracing::debug!("ignoring non-upgrade request");
            return Err(AcceptError::NotAnUpgrade);
        }

        let negotiated = negotiate(options.supported.as_deref(), &request.requested_protocols)
            .inspect_err(|e| tracing::info!(error = %e, "rejecting connection"))?;

        let conn = Arc::new(Connection::new(
            sink,
            events.clone(),
            options.id,
            options.key,
            negotiated.map(|p| p.name().to_owned()),
        ));
        self.register(conn.clone());
        tracing::info!(
            id = %conn.id(),
            subprotocol = ?conn.subprotocol(),
            "connection accepted"
        );

        // No message is dispatched until the connected callback completes.
        events.on_connected(&conn).await;

        let disconnect = self.receive_loop(&conn, &mut stream, &cancel).await;
        self.retire(&conn).await;
        tracing::info!(id = %conn.id(), disconnect = ?disconnect, "connection retired");

        Ok(Retired {
            id: conn.id().to_owned(),
            disconnect,
        })
    }

    /// Receive frames until the connection ends, dispatching each complete
    /// text message sequentially.
    async fn receive_loop<S>(
        &self,
        conn: &Arc<Connection>,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Disconnect
    where
        S: MessageStream,
    {
        loop {
            if cancel.is_cancelled() {
                return Disconnect::Cancelled;
            }
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Disconnect::Cancelled,
                frame = stream.next_frame() => frame,
            };
            match frame {
                Ok(Some(Frame::Text {
                    payload,
                    end_of_message: true,
                })) => {
                    let text = payload.trim_end_matches('\0');
                    conn.events().clone().on_message(conn, text.to_owned()).await;
                }
                Ok(Some(Frame::Text {
                    end_of_message: false,
                    ..
                })) => {
                    // Multi-frame messages are not reassembled.
                    tracing::trace!(id = %conn.id(), "dropping non-final fragment");
                }
                Ok(Some(Frame::Binary(_))) => {
                    tracing::warn!(id = %conn.id(), "binary frames are not supported");
                    let _ = conn
                        .close_with(CloseFrame {
                            code: UNSUPPORTED_DATA,
                            reason: "binary frames are not supported".to_owned(),
                        })
                        .await;
                    return Disconnect::UnsupportedFrame;
                }
                Ok(Some(Frame::Close(peer))) => {
                    if conn.is_open() {
                        let echo = peer.clone().unwrap_or_else(|| CloseFrame::normal(""));
                        let _ = conn.close_with(echo).await;
                    }
                    return Disconnect::ClosedByPeer(peer);
                }
                Ok(None) => return Disconnect::StreamEnded,
                Err(e) => {
                    tracing::debug!(id = %conn.id(), error = %e, "receive failed");
                    return Disconnect::Transport(e);
                }
            }
        }
    }
}
