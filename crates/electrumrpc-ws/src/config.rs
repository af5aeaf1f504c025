//! Transport and client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for `WsTransport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Upper bound on dial + handshake.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long `disconnect` waits for the close frame to be written.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Outbound queue length; `send` suspends when it is full.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Inbound broadcast buffer per consumer.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    /// Lifecycle broadcast buffer per consumer.
    #[serde(default = "default_lifecycle_capacity")]
    pub lifecycle_capacity: usize,
}

fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_close_timeout_ms() -> u64 { 2_000 }
fn default_outbound_capacity() -> usize { 256 }
fn default_inbound_capacity() -> usize { 1_024 }
fn default_lifecycle_capacity() -> usize { 64 }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            outbound_capacity: default_outbound_capacity(),
            inbound_capacity: default_inbound_capacity(),
            lifecycle_capacity: default_lifecycle_capacity(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Configuration for `ElectrumClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-call timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Client name sent in `server.version`.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Protocol version requested in `server.version`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Re-issue every open subscription after a reconnect.
    #[serde(default = "bool_true")]
    pub resubscribe_on_reconnect: bool,
}

fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_client_name() -> String { "electrumrpc".into() }
fn default_protocol_version() -> String { "1.4".into() }
fn bool_true() -> bool { true }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            client_name: default_client_name(),
            protocol_version: default_protocol_version(),
            resubscribe_on_reconnect: true,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Same configuration with a different per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
