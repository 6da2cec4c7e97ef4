//! Bundled application layer: a message relay.
//!
//! Each inbound text message is broadcast back out to the sender's key
//! group. Connections without a key both send to and receive from every
//! group.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionEvents};
use crate::hub::ConnectionHub;

pub struct RelayEvents {
    hub: ConnectionHub,
    cancel: CancellationToken,
}

impl RelayEvents {
    pub fn new(hub: ConnectionHub, cancel: CancellationToken) -> Self {
        Self { hub, cancel }
    }
}

#[async_trait]
impl ConnectionEvents for RelayEvents {
    async fn on_connected(&self, conn: &Arc<Connection>) {
        tracing::info!(id = %conn.id(), key = ?conn.key(), "client joined");
        let _ = conn
            .send_text(&format!("connected as {}", conn.id()))
            .await;
    }

    async fn on_message(&self, conn: &Arc<Connection>, text: String) {
        self.hub.broadcast(&text, conn.key(), &self.cancel).await;
    }

    async fn on_close(&self, conn: &Arc<Connection>) {
        tracing::info!(id = %conn.id(), "client left");
    }
}
