//! electrumrpc-core — foundation types for Electrum protocol clients.
//!
//! # Overview
//!
//! Electrum servers answer calls and push subscription notifications over a
//! single persistent connection. This crate holds everything about that
//! exchange that does not depend on a socket library:
//!
//! - [`Transport`]: the async trait a connection implementation provides
//! - [`Request`] / [`RpcId`]: wire types
//! - [`classify`]: structural classification of inbound frames
//! - [`Router`]: correlation of replies and notifications to waiters
//! - [`ResultStore`] / [`Method`]: typed decoding per method path
//! - [`CallToken`]: one-shot cancellation
//! - [`Error`]: the error taxonomy every public call fails with

pub mod cancel;
pub mod classify;
pub mod error;
pub mod method;
pub mod metrics;
pub mod request;
pub mod router;
pub mod store;
pub mod transport;

pub use cancel::{ActionId, CallToken};
pub use classify::{classify, ResponseKind, ResultShape};
pub use error::{ClientError, CodingError, Error, RpcError, StorageError, TransportError};
pub use method::{BlockTip, HeaderTip, Method, MethodResult, Notification};
pub use metrics::{MetricsCollector, NoopMetrics};
pub use request::{JsonRpcError, Request, RpcId};
pub use router::{Delivery, Router, WaiterKey};
pub use store::ResultStore;
pub use transport::{
    CloseCode, ConnectionState, Diagnostics, LifecycleEvent, MessageStream, OutboundFrame,
    Transport,
};
