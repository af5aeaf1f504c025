//! Metrics hook for transports.
//!
//! The crate ships no exporter; attach a collector to forward the counters
//! to whatever backend the application uses.

use crate::transport::ConnectionState;

/// Receives transport events as they happen. Every method defaults to a no-op.
pub trait MetricsCollector: Send + Sync {
    fn frame_sent(&self, _bytes: usize) {}

    fn frame_received(&self, _bytes: usize) {}

    fn state_changed(&self, _state: ConnectionState) {}

    fn reconnect_attempted(&self) {}

    fn reconnect_succeeded(&self) {}
}

/// Collector that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {}
