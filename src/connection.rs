//! A handle to one live (or recently live) WebSocket connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::socket::{CloseFrame, MessageSink, SocketError, DEFAULT_CLOSE_REASON};

/// Lifecycle callbacks supplied by the application layer.
///
/// The hub awaits every callback: `on_connected` completes before the first
/// `on_message` for that connection, `on_message` calls are strictly
/// sequential per connection, and `on_close` fires exactly once at
/// retirement. A slow callback blocks only its own connection's progress.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    async fn on_connected(&self, conn: &Arc<Connection>);
    async fn on_message(&self, conn: &Arc<Connection>, text: String);
    async fn on_close(&self, conn: &Arc<Connection>);
}

/// Outcome of a best-effort send or close.
///
/// Failures never propagate as errors; they surface here as a typed value
/// that callers are free to discard.
#[derive(Debug)]
pub enum SendOutcome {
    /// The frame was handed to the transport.
    Sent,
    /// The connection was not open at send time.
    NotOpen,
    /// The transport reported a failure; the connection is treated as stale.
    Failed(SocketError),
    /// A cancellation was observed before the send was attempted.
    Cancelled,
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }

    /// Whether this outcome counts as evidence the connection is dead.
    pub(crate) fn is_stale(&self) -> bool {
        matches!(self, SendOutcome::NotOpen | SendOutcome::Failed(_))
    }
}

/// One registered connection: id, write half of the socket, negotiated
/// subprotocol, optional broadcast key, and the close callback captured at
/// creation.
///
/// The read half of the socket stays with the hub's accept loop; every write
/// path (loop, direct send, broadcast) goes through the shared sink.
pub struct Connection {
    id: String,
    sink: Arc<dyn MessageSink>,
    subprotocol: Option<String>,
    key: Option<String>,
    events: Arc<dyn ConnectionEvents>,
    retired: AtomicBool,
}

impl Connection {
    /// Pure construction; never fails. Generates a uuid-v4 id when the
    /// caller does not supply one.
    pub(crate) fn new(
        sink: Arc<dyn MessageSink>,
        events: Arc<dyn ConnectionEvents>,
        id: Option<String>,
        key: Option<String>,
        subprotocol: Option<String>,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            sink,
            subprotocol,
            key,
            events,
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subprotocol selected at accept time, if any. Immutable thereafter.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Opaque broadcast filter tag. Absent means "receives all broadcasts".
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }

    /// Best-effort: transmit `text` as one complete text frame if the
    /// connection is open. Transport failures are absorbed into the outcome.
    pub async fn send_text(&self, text: &str) -> SendOutcome {
        if !self.sink.is_open() {
            return SendOutcome::NotOpen;
        }
        match self.sink.send_text(text).await {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                tracing::debug!(id = %self.id, error = %e, "send failed");
                SendOutcome::Failed(e)
            }
        }
    }

    /// Best-effort normal closure. Uses a fixed server-initiated reason when
    /// the caller does not supply one.
    pub async fn close(&self, reason: Option<&str>) -> SendOutcome {
        self.close_with(CloseFrame::normal(reason.unwrap_or(DEFAULT_CLOSE_REASON)))
            .await
    }

    /// Transmit an arbitrary close frame (closure echo, unsupported-data).
    pub(crate) async fn close_with(&self, frame: CloseFrame) -> SendOutcome {
        if !self.sink.is_open() {
            return SendOutcome::NotOpen;
        }
        match self.sink.send_close(frame).await {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                tracing::debug!(id = %self.id, error = %e, "close failed");
                SendOutcome::Failed(e)
            }
        }
    }

    pub(crate) fn events(&self) -> &Arc<dyn ConnectionEvents> {
        &self.events
    }

    /// Claim the right to run this connection's close callback.
    ///
    /// Returns `true` for exactly one caller across the handle's lifetime,
    /// no matter how many retirement paths race.
    pub(crate) fn claim_retirement(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("subprotocol", &self.subprotocol)
            .field("key", &self.key)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::mock::socket_pair;
    use crate::socket::{Frame, NORMAL_CLOSURE};

    struct NoopEvents;

    #[async_trait]
    impl ConnectionEvents for NoopEvents {
        async fn on_connected(&self, _conn: &Arc<Connection>) {}
        async fn on_message(&self, _conn: &Arc<Connection>, _text: String) {}
        async fn on_close(&self, _conn: &Arc<Connection>) {}
    }

    fn test_connection(id: Option<&str>) -> (Arc<Connection>, Arc<crate::socket::mock::MockSink>) {
        let (sink, _stream, _feeder) = socket_pair();
        let conn = Arc::new(Connection::new(
            sink.clone(),
            Arc::new(NoopEvents),
            id.map(str::to_owned),
            None,
            None,
        ));
        (conn, sink)
    }

    #[tokio::test]
    async fn send_text_transmits_exact_payload_as_one_final_frame() {
        let (conn, sink) = test_connection(Some("c1"));
        assert!(conn.send_text("hello").await.is_sent());
        assert_eq!(
            sink.sent_frames(),
            vec![Frame::Text {
                payload: "hello".to_string(),
                end_of_message: true,
            }]
        );
    }

    #[tokio::test]
    async fn send_text_on_closed_connection_reports_not_open() {
        let (conn, sink) = test_connection(None);
        sink.set_open(false);
        assert!(matches!(conn.send_text("x").await, SendOutcome::NotOpen));
        assert!(sink.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn send_failure_is_absorbed_into_outcome() {
        let (conn, sink) = test_connection(None);
        sink.fail_sends();
        assert!(matches!(conn.send_text("x").await, SendOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn close_defaults_to_server_initiated_reason() {
        let (conn, sink) = test_connection(None);
        assert!(conn.close(None).await.is_sent());
        match sink.sent_frames().as_slice() {
            [Frame::Close(Some(frame))] => {
                assert_eq!(frame.code, NORMAL_CLOSURE);
                assert_eq!(frame.reason, DEFAULT_CLOSE_REASON);
            }
            other => panic!("expected a single close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_honors_caller_reason() {
        let (conn, sink) = test_connection(None);
        conn.close(Some("done")).await;
        match sink.sent_frames().as_slice() {
            [Frame::Close(Some(frame))] => assert_eq!(frame.reason, "done"),
            other => panic!("expected a single close frame, got {other:?}"),
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let (a, _) = test_connection(None);
        let (b, _) = test_connection(None);
        assert_ne!(a.id(), b.id());
        assert!(!a.id().is_empty());
    }

    #[test]
    fn retirement_is_claimed_exactly_once() {
        let (conn, _) = test_connection(Some("once"));
        assert!(conn.claim_retirement());
        assert!(!conn.claim_retirement());
        assert!(!conn.claim_retirement());
    }
}
