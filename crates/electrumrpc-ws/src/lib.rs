//! electrumrpc-ws — WebSocket transport and client for Electrum servers.
//!
//! # Features
//! - Connection state machine with replayed state and lifecycle events
//! - Explicit reconnect, optionally to a different server
//! - Call correlation with timeouts and cancellation tokens
//! - Subscriptions re-issued after reconnect
//! - In-memory loopback dialer for tests

pub mod client;
pub mod config;
pub mod link;
pub mod memory;
pub mod transport;
pub mod ws;

pub use client::{ElectrumClient, Subscription};
pub use config::{ClientConfig, TransportConfig};
pub use link::{Dialer, Link, LinkEvent};
pub use memory::{MemoryDialer, MemoryListener, MemoryPeer};
pub use transport::WsTransport;
pub use ws::WsDialer;
