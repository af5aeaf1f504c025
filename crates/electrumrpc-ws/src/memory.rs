//! In-process loopback `Dialer`.
//!
//! Every successful dial hands a [`MemoryPeer`] to the paired
//! [`MemoryListener`]; the peer plays the server side of the connection.
//! Used by the test suite and handy for exercising client code without a
//! live Electrum server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use electrumrpc_core::error::TransportError;
use electrumrpc_core::transport::{CloseCode, OutboundFrame};

use crate::link::{Dialer, Link, LinkEvent};

/// Loopback dialer. Create with [`MemoryDialer::new`].
pub struct MemoryDialer {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicBool,
    dialed: Mutex<Vec<String>>,
}

/// Receives the server side of every connection the dialer opens.
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryDialer {
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let dialer = Self {
            accept_tx,
            refuse: AtomicBool::new(false),
            dialed: Mutex::new(Vec::new()),
        };
        (dialer, MemoryListener { accept_rx })
    }

    /// Make subsequent dials fail (`true`) or succeed (`false`).
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Every url dialed so far, in order.
    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, url: &str) -> Result<Link, TransportError> {
        if let Ok(mut dialed) = self.dialed.lock() {
            dialed.push(url.to_string());
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::SetupFailed(format!("{url}: connection refused")));
        }

        let (out_tx, out_rx) = fmpsc::unbounded::<OutboundFrame>();
        let (in_tx, in_rx) = fmpsc::unbounded::<LinkEvent>();
        let peer = MemoryPeer {
            url: url.to_string(),
            incoming: out_rx,
            outgoing: in_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::SetupFailed(format!("{url}: listener dropped")))?;

        Ok(Link {
            sink: Box::pin(out_tx.sink_map_err(|e| TransportError::Io(e.to_string()))),
            stream: Box::pin(in_rx),
        })
    }
}

impl MemoryListener {
    /// Wait for the next dialed connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

/// Server side of one loopback connection.
pub struct MemoryPeer {
    url: String,
    incoming: fmpsc::UnboundedReceiver<OutboundFrame>,
    outgoing: fmpsc::UnboundedSender<LinkEvent>,
}

impl MemoryPeer {
    /// The url the client dialed.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame written by the client; `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.incoming.next().await
    }

    /// Next JSON-RPC request written by the client, skipping non-text frames.
    pub async fn recv_request(&mut self) -> Option<Value> {
        loop {
            match self.recv().await? {
                OutboundFrame::Text(text) => match serde_json::from_str(&text) {
                    Ok(value) => return Some(value),
                    Err(e) => tracing::warn!(error = %e, "peer received non-JSON text frame"),
                },
                OutboundFrame::Close { .. } => return None,
                OutboundFrame::Binary(_) => {}
            }
        }
    }

    /// Push a text frame to the client. Returns `false` if the client side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing
            .unbounded_send(LinkEvent::Frame(Bytes::from(text.into())))
            .is_ok()
    }

    /// Push a JSON value to the client.
    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Reply to `request` with `result`.
    pub fn reply(&self, request: &Value, result: Value) -> bool {
        self.send_json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": result,
        }))
    }

    /// Close the connection from the server side.
    pub fn close(self, code: CloseCode, reason: Option<&str>) {
        let _ = self.outgoing.unbounded_send(LinkEvent::Closed {
            code,
            reason: reason.map(String::from),
        });
    }

    /// Drop the connection without a close handshake.
    pub fn fail(self, message: &str) {
        let _ = self
            .outgoing
            .unbounded_send(LinkEvent::Failed(message.to_string()));
    }
}
