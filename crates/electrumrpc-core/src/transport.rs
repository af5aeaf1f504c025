//! The `Transport` trait: the capability surface the client needs from a
//! persistent connection, independent of the socket library behind it.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::{broadcast, watch};

use crate::error::TransportError;
use crate::metrics::MetricsCollector;

/// Phase of the single physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// WebSocket close codes the client distinguishes (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    Unsupported,
    /// No close frame was received (1006).
    Abnormal,
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::Unsupported,
            1006 => Self::Abnormal,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Abnormal => 1006,
            CloseCode::Other(n) => n,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = u16::from(*self);
        match self {
            Self::Normal => write!(f, "{code} normal"),
            Self::GoingAway => write!(f, "{code} going away"),
            Self::ProtocolError => write!(f, "{code} protocol error"),
            Self::Unsupported => write!(f, "{code} unsupported"),
            Self::Abnormal => write!(f, "{code} abnormal"),
            Self::Other(_) => write!(f, "{code}"),
        }
    }
}

/// A connect or disconnect transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `is_reconnect` separates a resumed session from a fresh one.
    Connected { is_reconnect: bool },
    Disconnected {
        code: CloseCode,
        reason: Option<String>,
    },
}

/// A frame queued for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    Close {
        code: CloseCode,
        reason: Option<String>,
    },
}

impl OutboundFrame {
    /// Payload length in bytes (zero for close frames).
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
            Self::Close { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Sessions established so far. The live session, if any, is number `sessions`.
    pub sessions: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
}

/// Inbound frames of the current session. Ends after yielding the
/// termination error when the connection closes.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// The capability surface of one persistent connection.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; the client shares them across
/// Tokio tasks as `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the connection. No-op when already connected.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection with the given code and reason.
    async fn disconnect(&self, code: CloseCode, reason: Option<String>);

    /// Tear down and re-establish the connection, optionally against a new endpoint.
    async fn reconnect(&self, url: Option<String>) -> Result<(), TransportError>;

    /// Queue a frame for writing. Fails unless connected.
    async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Queue a text frame.
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.send(OutboundFrame::Text(text)).await
    }

    /// Queue a binary frame.
    async fn send_bytes(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.send(OutboundFrame::Binary(bytes)).await
    }

    /// Inbound frames, multiplexed over one underlying channel.
    fn messages(&self) -> MessageStream;

    /// Connect/disconnect transitions; no history is replayed.
    fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent>;

    /// Connection state; the current value is visible immediately.
    fn state_events(&self) -> watch::Receiver<ConnectionState>;

    /// Current connection state.
    fn state(&self) -> ConnectionState {
        *self.state_events().borrow()
    }

    /// Counters snapshot.
    fn diagnostics(&self) -> Diagnostics;

    /// Number of the most recently established session; `0` before the first.
    fn session(&self) -> u64 {
        self.diagnostics().sessions
    }

    /// Attach a metrics collector.
    fn set_metrics(&self, metrics: Arc<dyn MetricsCollector>);

    /// The endpoint this transport dials.
    fn url(&self) -> String;
}
