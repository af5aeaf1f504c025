//! Dialer abstraction: how `WsTransport` obtains a raw duplex connection.
//!
//! A `Link` is the split pair the session task drives: a sink of outbound
//! frames and a stream of inbound events. Keeping this seam narrow lets the
//! transport state machine run unchanged over tungstenite or over the
//! in-memory loopback used in tests.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};

use electrumrpc_core::error::TransportError;
use electrumrpc_core::transport::{CloseCode, OutboundFrame};

/// Write half of a link.
pub type LinkSink = Pin<Box<dyn Sink<OutboundFrame, Error = TransportError> + Send>>;

/// Read half of a link.
pub type LinkStream = Pin<Box<dyn Stream<Item = LinkEvent> + Send>>;

/// Something that happened on the read half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text or binary data frame.
    Frame(Bytes),
    /// The peer sent a close frame.
    Closed {
        code: CloseCode,
        reason: Option<String>,
    },
    /// The connection failed without a close handshake.
    Failed(String),
}

/// An established connection, split into its two halves.
pub struct Link {
    pub sink: LinkSink,
    pub stream: LinkStream,
}

/// Opens links to an endpoint.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> Result<Link, TransportError>;
}
