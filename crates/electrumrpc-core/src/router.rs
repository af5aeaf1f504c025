//! Request/subscription correlation table.
//!
//! Unary waiters are keyed by correlation id and resolved exactly once;
//! stream waiters are keyed by method path and receive every notification
//! published under it. Every mutation happens under one lock, and a waiter
//! is always removed from the table before its channel fires.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::classify::{classify, probe_id, ResponseKind, ResultShape};
use crate::error::{ClientError, Error, RpcError};
use crate::request::{JsonRpcError, RpcId};

/// Outcome delivered to a unary waiter: the result payload (absent only for
/// optional results) or the failure.
pub type UnaryOutcome = Result<Option<Value>, Error>;

/// Receiving half of a unary waiter.
pub type UnaryReceiver = oneshot::Receiver<UnaryOutcome>;

/// Receiving half of a stream waiter. Ends when the waiter is cancelled or
/// the transport is torn down.
pub type StreamReceiver = mpsc::UnboundedReceiver<Result<Value, Error>>;

/// Identifies a waiter for cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaiterKey {
    Unary(RpcId),
    Stream(String),
}

impl std::fmt::Display for WaiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(id) => write!(f, "request {id}"),
            Self::Stream(method) => write!(f, "stream {method}"),
        }
    }
}

/// What `handle` did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A unary waiter was resolved.
    Resolved(RpcId),
    /// A notification was published to a stream waiter.
    Published(String),
    /// A reply arrived for an id nobody is waiting on.
    Orphaned(RpcId),
    /// A notification arrived for a method path nobody is subscribed to.
    Dropped(String),
}

enum Reply {
    Value(Option<Value>),
    Empty,
    Failed(JsonRpcError),
}

struct UnaryWaiter {
    method: String,
    shape: ResultShape,
    generation: u64,
    tx: oneshot::Sender<UnaryOutcome>,
}

struct StreamWaiter {
    params: Value,
    tx: mpsc::UnboundedSender<Result<Value, Error>>,
}

#[derive(Default)]
struct RouterState {
    unary: HashMap<RpcId, UnaryWaiter>,
    streams: HashMap<String, StreamWaiter>,
    /// Stamped on every new unary waiter.
    generation: u64,
}

/// The correlation table shared by the client and its inbound pump.
#[derive(Default)]
pub struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in the reply to `id`.
    pub fn register_unary(
        &self,
        id: RpcId,
        method: impl Into<String>,
        shape: ResultShape,
    ) -> Result<UnaryReceiver, ClientError> {
        let mut state = self.lock();
        if state.unary.contains_key(&id) {
            return Err(ClientError::DuplicateHandler(WaiterKey::Unary(id).to_string()));
        }
        let (tx, rx) = oneshot::channel();
        let generation = state.generation;
        state.unary.insert(
            id,
            UnaryWaiter {
                method: method.into(),
                shape,
                generation,
                tx,
            },
        );
        Ok(rx)
    }

    /// Stamp waiters registered from now on with `generation`. Never moves
    /// backwards.
    pub fn set_generation(&self, generation: u64) {
        let mut state = self.lock();
        state.generation = state.generation.max(generation);
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Register interest in every notification published under `method`.
    ///
    /// `params` are kept so the subscription can be re-issued after a
    /// reconnect. A previous waiter whose receiver was dropped is replaced.
    pub fn register_stream(
        &self,
        method: impl Into<String>,
        params: Value,
    ) -> Result<StreamReceiver, ClientError> {
        let method = method.into();
        let mut state = self.lock();
        if let Some(existing) = state.streams.get(&method) {
            if !existing.tx.is_closed() {
                return Err(ClientError::DuplicateHandler(WaiterKey::Stream(method).to_string()));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.streams.insert(method, StreamWaiter { params, tx });
        Ok(rx)
    }

    /// Remove a waiter. A unary waiter is resolved with `Cancelled`; a
    /// stream waiter's channel is closed. Returns `false` if nothing was
    /// registered under `key`.
    pub fn cancel(&self, key: &WaiterKey) -> bool {
        match key {
            WaiterKey::Unary(id) => {
                let waiter = self.lock().unary.remove(id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.tx.send(Err(ClientError::Cancelled.into()));
                        true
                    }
                    None => false,
                }
            }
            WaiterKey::Stream(method) => self.lock().streams.remove(method).is_some(),
        }
    }

    /// Classify an inbound frame and deliver it to its waiter.
    ///
    /// Replies without a waiter and notifications without a subscriber are
    /// not errors: a reply can race a local cancel, and not every
    /// notification has a listener.
    pub fn handle(&self, frame: &[u8]) -> Result<Delivery, Error> {
        let mut state = self.lock();
        let classified = classify(frame, |id| {
            state
                .unary
                .get(id)
                .map(|w| w.shape)
                .unwrap_or(ResultShape::Optional)
        });

        let kind = match classified {
            Ok(kind) => kind,
            Err(err) => {
                let waiter = probe_id(frame).and_then(|id| state.unary.remove(&id));
                drop(state);
                if let Some(waiter) = waiter {
                    let _ = waiter.tx.send(Err(err.clone().into()));
                }
                return Err(err.into());
            }
        };

        let (id, reply) = match kind {
            ResponseKind::Subscription { method, params } => {
                let Some(waiter) = state.streams.get(&method) else {
                    tracing::debug!(method = %method, "notification without subscriber dropped");
                    return Ok(Delivery::Dropped(method));
                };
                if waiter.tx.send(Ok(params)).is_err() {
                    state.streams.remove(&method);
                    tracing::debug!(method = %method, "subscriber gone, stream waiter removed");
                    return Ok(Delivery::Dropped(method));
                }
                return Ok(Delivery::Published(method));
            }
            ResponseKind::Regular { id, result } => (id, Reply::Value(result)),
            ResponseKind::Empty { id } => (id, Reply::Empty),
            ResponseKind::Error { id, error } => (id, Reply::Failed(error)),
        };

        let Some(waiter) = state.unary.remove(&id) else {
            tracing::debug!(id = %id, "reply without waiter dropped");
            return Ok(Delivery::Orphaned(id));
        };
        drop(state);

        let outcome = match reply {
            Reply::Value(result) => Ok(result),
            Reply::Empty => Err(ClientError::EmptyResponse(id.clone()).into()),
            Reply::Failed(error) => Err(RpcError {
                id: id.clone(),
                method: waiter.method.clone(),
                code: error.code,
                message: error.message,
            }
            .into()),
        };
        let _ = waiter.tx.send(outcome);
        Ok(Delivery::Resolved(id))
    }

    /// Resolve every pending unary waiter with `err`. Stream waiters stay
    /// registered. Returns the number of waiters failed.
    pub fn fail_unaries(&self, err: Error) -> usize {
        let waiters: Vec<UnaryWaiter> = self.lock().unary.drain().map(|(_, w)| w).collect();
        Self::fail_all(waiters, err)
    }

    /// Resolve with `err` only the unary waiters stamped with a generation
    /// older than `generation`. Newer waiters stay registered.
    pub fn fail_unaries_before(&self, generation: u64, err: Error) -> usize {
        let waiters: Vec<UnaryWaiter> = {
            let mut state = self.lock();
            let stale: Vec<RpcId> = state
                .unary
                .iter()
                .filter(|(_, w)| w.generation < generation)
                .map(|(id, _)| id.clone())
                .collect();
            stale.iter().filter_map(|id| state.unary.remove(id)).collect()
        };
        Self::fail_all(waiters, err)
    }

    fn fail_all(waiters: Vec<UnaryWaiter>, err: Error) -> usize {
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(err.clone()));
        }
        if count > 0 {
            tracing::debug!(count, error = %err, "failed pending calls");
        }
        count
    }

    /// Remove every stream waiter, delivering `err` as the final item when
    /// given. Returns the number of streams closed.
    pub fn close_streams(&self, err: Option<Error>) -> usize {
        let waiters: Vec<StreamWaiter> = self.lock().streams.drain().map(|(_, w)| w).collect();
        let count = waiters.len();
        if let Some(err) = err {
            for waiter in &waiters {
                let _ = waiter.tx.send(Err(err.clone()));
            }
        }
        count
    }

    /// `(method, params)` of every open stream waiter.
    pub fn active_streams(&self) -> Vec<(String, Value)> {
        self.lock()
            .streams
            .iter()
            .filter(|(_, w)| !w.tx.is_closed())
            .map(|(method, w)| (method.clone(), w.params.clone()))
            .collect()
    }

    /// Number of unresolved unary waiters.
    pub fn pending_unaries(&self) -> usize {
        self.lock().unary.len()
    }

    /// Number of open stream waiters.
    pub fn open_streams(&self) -> usize {
        self.lock().streams.values().filter(|w| !w.tx.is_closed()).count()
    }

    /// Returns `true` if a stream waiter is registered and open for `method`.
    pub fn has_stream(&self, method: &str) -> bool {
        self.lock()
            .streams
            .get(method)
            .is_some_and(|w| !w.tx.is_closed())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Router")
            .field("unary", &state.unary.len())
            .field("streams", &state.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::CloseCode;
    use serde_json::json;
    use std::sync::Arc;

    fn closed() -> Error {
        TransportError::ConnectionClosed {
            code: CloseCode::GoingAway,
            reason: Some("test".into()),
        }
        .into()
    }

    #[test]
    fn duplicate_unary_registration_fails_until_resolved() {
        let router = Router::new();
        let _rx = router.register_unary("x".into(), "server.ping", ResultShape::Optional).unwrap();
        let err = router
            .register_unary("x".into(), "server.ping", ResultShape::Optional)
            .unwrap_err();
        assert!(matches!(err, ClientError::DuplicateHandler(_)));

        router.handle(br#"{"id":"x","result":null}"#).unwrap();
        assert!(router.register_unary("x".into(), "server.ping", ResultShape::Optional).is_ok());
    }

    #[test]
    fn registration_allowed_again_after_cancel() {
        let router = Router::new();
        let _rx = router.register_unary("c".into(), "m", ResultShape::Required).unwrap();
        assert!(router.cancel(&WaiterKey::Unary("c".into())));
        assert!(router.register_unary("c".into(), "m", ResultShape::Required).is_ok());
    }

    #[test]
    fn duplicate_stream_registration_fails() {
        let router = Router::new();
        let _rx = router.register_stream("blockchain.headers.subscribe", json!([])).unwrap();
        let err = router
            .register_stream("blockchain.headers.subscribe", json!([]))
            .unwrap_err();
        assert!(matches!(err, ClientError::DuplicateHandler(_)));
    }

    #[test]
    fn dropped_stream_receiver_can_be_replaced() {
        let router = Router::new();
        let rx = router.register_stream("m", json!([])).unwrap();
        drop(rx);
        assert!(!router.has_stream("m"));
        assert!(router.register_stream("m", json!([])).is_ok());
    }

    #[tokio::test]
    async fn resolves_unary_with_result() {
        let router = Router::new();
        let rx = router
            .register_unary("U1".into(), "blockchain.headers.get_tip", ResultShape::Required)
            .unwrap();
        let delivery = router
            .handle(br#"{"jsonrpc":"2.0","id":"U1","result":{"height":800000}}"#)
            .unwrap();
        assert_eq!(delivery, Delivery::Resolved("U1".into()));
        assert_eq!(rx.await.unwrap().unwrap(), Some(json!({"height": 800000})));
        assert_eq!(router.pending_unaries(), 0);
    }

    #[tokio::test]
    async fn rpc_error_is_tagged_with_method() {
        let router = Router::new();
        let rx = router
            .register_unary("e1".into(), "blockchain.transaction.get", ResultShape::Required)
            .unwrap();
        router
            .handle(br#"{"id":"e1","error":{"code":2,"message":"missing transaction"}}"#)
            .unwrap();
        match rx.await.unwrap().unwrap_err() {
            Error::Rpc(err) => {
                assert_eq!(err.id, RpcId::from("e1"));
                assert_eq!(err.method, "blockchain.transaction.get");
                assert_eq!(err.code, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_and_optional_null_follow_registered_shape() {
        let router = Router::new();
        let required = router.register_unary("U3".into(), "m", ResultShape::Required).unwrap();
        let optional = router.register_unary("U4".into(), "m", ResultShape::Optional).unwrap();
        router.handle(br#"{"id":"U3"}"#).unwrap();
        router.handle(br#"{"id":"U4"}"#).unwrap();

        assert_eq!(
            required.await.unwrap().unwrap_err(),
            Error::Client(ClientError::EmptyResponse("U3".into()))
        );
        assert_eq!(optional.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_reply_fails_its_waiter() {
        let router = Router::new();
        let rx = router.register_unary("bad".into(), "m", ResultShape::Required).unwrap();
        let err = router.handle(br#"{"id":"bad","error":"nope"}"#).unwrap_err();
        assert!(matches!(err, Error::Coding(_)));
        assert!(matches!(rx.await.unwrap(), Err(Error::Coding(_))));
    }

    #[test]
    fn orphaned_reply_and_unsubscribed_notification() {
        let router = Router::new();
        assert_eq!(
            router.handle(br#"{"id":"late","result":1}"#).unwrap(),
            Delivery::Orphaned("late".into())
        );
        assert_eq!(
            router.handle(br#"{"method":"m","params":[]}"#).unwrap(),
            Delivery::Dropped("m".into())
        );
    }

    #[tokio::test]
    async fn publishes_notifications_in_order() {
        let router = Router::new();
        let mut rx = router.register_stream("blockchain.headers.subscribe", json!([])).unwrap();
        for h in 1..=3 {
            let frame = json!({
                "jsonrpc": "2.0",
                "method": "blockchain.headers.subscribe",
                "params": [{"height": h, "hex": "00"}]
            });
            let delivery = router.handle(frame.to_string().as_bytes()).unwrap();
            assert_eq!(delivery, Delivery::Published("blockchain.headers.subscribe".into()));
        }
        for h in 1..=3 {
            let params = rx.recv().await.unwrap().unwrap();
            assert_eq!(params[0]["height"], h);
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let router = Router::new();
        let rx = router.register_unary("k".into(), "m", ResultShape::Required).unwrap();
        assert!(router.cancel(&WaiterKey::Unary("k".into())));
        assert!(!router.cancel(&WaiterKey::Unary("k".into())));
        assert_eq!(rx.await.unwrap().unwrap_err(), Error::Client(ClientError::Cancelled));

        let mut stream = router.register_stream("s", json!([])).unwrap();
        assert!(router.cancel(&WaiterKey::Stream("s".into())));
        assert!(!router.cancel(&WaiterKey::Stream("s".into())));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn fail_unaries_leaves_streams_open() {
        let router = Router::new();
        let unary = router.register_unary("U2".into(), "m", ResultShape::Required).unwrap();
        let mut stream = router.register_stream("blockchain.headers.subscribe", json!([])).unwrap();

        assert_eq!(router.fail_unaries(closed()), 1);
        assert_eq!(unary.await.unwrap().unwrap_err(), closed());
        assert_eq!(router.open_streams(), 1);

        router
            .handle(br#"{"method":"blockchain.headers.subscribe","params":[{"height":2,"hex":"00"}]}"#)
            .unwrap();
        assert_eq!(stream.recv().await.unwrap().unwrap()[0]["height"], 2);
    }

    #[tokio::test]
    async fn failing_older_generations_keeps_newer_waiters() {
        let router = Router::new();
        router.set_generation(1);
        let old = router.register_unary("old".into(), "m", ResultShape::Required).unwrap();
        router.set_generation(2);
        let new = router.register_unary("new".into(), "m", ResultShape::Required).unwrap();

        router.set_generation(1);
        assert_eq!(router.generation(), 2, "generation never moves backwards");

        assert_eq!(router.fail_unaries_before(2, closed()), 1);
        assert_eq!(old.await.unwrap().unwrap_err(), closed());
        assert_eq!(router.pending_unaries(), 1);

        router.handle(br#"{"id":"new","result":"ok"}"#).unwrap();
        assert_eq!(new.await.unwrap().unwrap(), Some(json!("ok")));
    }

    #[tokio::test]
    async fn close_streams_delivers_final_error() {
        let router = Router::new();
        let mut stream = router.register_stream("s", json!(["p"])).unwrap();
        assert_eq!(router.active_streams(), vec![("s".to_string(), json!(["p"]))]);
        assert_eq!(router.close_streams(Some(closed())), 1);
        assert_eq!(stream.recv().await.unwrap().unwrap_err(), closed());
        assert!(stream.recv().await.is_none());
        assert!(router.active_streams().is_empty());
    }

    #[test]
    fn racing_handle_and_cancel_resolve_exactly_once() {
        for round in 0..200 {
            let router = Arc::new(Router::new());
            let id = RpcId::from(format!("race-{round}"));
            let mut rx = router.register_unary(id.clone(), "m", ResultShape::Required).unwrap();
            let frame = json!({"id": id, "result": round}).to_string();

            let r1 = router.clone();
            let handler = std::thread::spawn(move || {
                matches!(r1.handle(frame.as_bytes()), Ok(Delivery::Resolved(_)))
            });
            let r2 = router.clone();
            let key = WaiterKey::Unary(id);
            let canceller = std::thread::spawn(move || r2.cancel(&key));

            let resolved = handler.join().unwrap();
            let cancelled = canceller.join().unwrap();
            assert!(resolved ^ cancelled, "round {round}: exactly one path must win");

            let outcome = rx.try_recv().unwrap();
            if cancelled {
                assert_eq!(outcome.unwrap_err(), Error::Client(ClientError::Cancelled));
            } else {
                assert_eq!(outcome.unwrap(), Some(json!(round)));
            }
        }
    }
}
