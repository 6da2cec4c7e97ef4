//! sockhub - a WebSocket connection hub.
//!
//! Manages many concurrent full-duplex WebSocket connections against a
//! single server endpoint: per-connection subprotocol negotiation, a live
//! registry of open connections, sequential delivery of inbound text
//! messages to application callbacks, key-filtered broadcast with stale
//! connection pruning, and exactly-once teardown regardless of which side
//! or code path triggers it.
//!
//! The application layer plugs in through [`ConnectionEvents`]; the
//! bundled [`relay`] implementation turns the server into a key-grouped
//! message relay.

pub mod api;
pub mod config;
pub mod connection;
pub mod hub;
pub mod relay;
pub mod socket;

pub use connection::{Connection, ConnectionEvents, SendOutcome};
pub use hub::{AcceptOptions, ConnectionHub, HubConfig, SubProtocol, UpgradeRequest};
