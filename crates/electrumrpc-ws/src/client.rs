//! Electrum client: unary calls, subscriptions, and the inbound pump that
//! feeds the router.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use electrumrpc_core::error::{ClientError, CodingError, Error, TransportError};
use electrumrpc_core::method::{self, Balance, HistoryItem, ServerVersion};
use electrumrpc_core::router::StreamReceiver;
use electrumrpc_core::transport::{
    CloseCode, ConnectionState, Diagnostics, LifecycleEvent, MessageStream, Transport,
};
use electrumrpc_core::{
    ActionId, BlockTip, CallToken, HeaderTip, Method, MethodResult, Notification, Request,
    ResultShape, ResultStore, Router, RpcId, WaiterKey,
};

use crate::config::{ClientConfig, TransportConfig};
use crate::transport::WsTransport;

struct Inner {
    transport: Arc<dyn Transport>,
    router: Arc<Router>,
    store: Arc<ResultStore>,
    config: ClientConfig,
}

/// Client for one Electrum server.
///
/// Owns a background pump that routes every inbound frame to the waiting
/// call or subscription. Dropping the client stops the pump.
pub struct ElectrumClient {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl ElectrumClient {
    /// Wrap `transport` and start the inbound pump. Does not connect.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let inner = Arc::new(Inner {
            transport,
            router: Arc::new(Router::new()),
            store: Arc::new(ResultStore::new()),
            config,
        });
        // Subscribe before spawning so nothing published after `new` returns is missed.
        let messages = inner.transport.messages();
        let lifecycle = inner.transport.lifecycle_events();
        let pump = tokio::spawn(run_pump(Arc::clone(&inner), messages, lifecycle));
        Self { inner, pump }
    }

    /// Connect to `url` over WebSocket.
    pub async fn connect_ws(
        url: impl Into<String>,
        transport_config: TransportConfig,
        config: ClientConfig,
    ) -> Result<Self, Error> {
        let transport = Arc::new(WsTransport::new(url, transport_config));
        let client = Self::new(transport, config);
        client.connect().await?;
        Ok(client)
    }

    // ── Connection ───────────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), Error> {
        Ok(self.inner.transport.connect().await?)
    }

    /// Close the connection. Pending calls fail; subscriptions stay open
    /// and are re-issued on the next reconnect.
    pub async fn disconnect(&self, code: CloseCode, reason: Option<String>) {
        self.inner.transport.disconnect(code, reason).await;
    }

    /// Reconnect, optionally to a different server.
    pub async fn reconnect(&self, url: Option<String>) -> Result<(), Error> {
        Ok(self.inner.transport.reconnect(url).await?)
    }

    /// Disconnect and close every subscription.
    pub async fn shutdown(&self) {
        self.inner.transport.disconnect(CloseCode::Normal, None).await;
        let closed = self.inner.router.close_streams(Some(
            TransportError::ConnectionClosed {
                code: CloseCode::Normal,
                reason: None,
            }
            .into(),
        ));
        tracing::info!(subscriptions = closed, "client shut down");
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.inner.transport.diagnostics()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Number of calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.router.pending_unaries()
    }

    /// Number of requests recorded for decoding.
    pub fn pending_requests(&self) -> usize {
        self.inner.store.pending()
    }

    // ── Unary calls ──────────────────────────────────────────────────────

    /// Call `method` and decode its non-null result into `T`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, Error> {
        self.call_with_token(method, params, &CallToken::new()).await
    }

    /// Like [`call`](Self::call), abandoned with `Cancelled` when `token` fires.
    pub async fn call_with_token<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        token: &CallToken,
    ) -> Result<T, Error> {
        ensure_unary(method)?;
        let request = Request::with_random_id(method, params);
        self.exchange(
            &request,
            |store, payload| store.decode(&request.id, payload),
            ResultShape::Required,
            token,
        )
        .await
    }

    /// Call `method`, accepting a null result as `None`.
    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, Error> {
        ensure_unary(method)?;
        let request = Request::with_random_id(method, params);
        self.exchange(
            &request,
            |store, payload| store.decode::<Option<T>>(&request.id, payload),
            ResultShape::Optional,
            &CallToken::new(),
        )
        .await
    }

    /// Call a catalogued method and decode through the method table.
    pub async fn request(&self, method: Method, params: Value) -> Result<MethodResult, Error> {
        if method.is_subscription() {
            return Err(ClientError::ProtocolMismatch {
                method: method.path().to_string(),
            }
            .into());
        }
        let request = Request::with_random_id(method.path(), params);
        self.exchange(
            &request,
            |store, payload| store.decode_typed(&request.id, payload),
            method.result_shape(),
            &CallToken::new(),
        )
        .await
    }

    /// Record the request, run it, decode the reply, and forget the request.
    async fn exchange<T>(
        &self,
        request: &Request,
        decode: impl FnOnce(&ResultStore, Option<Value>) -> Result<T, Error>,
        shape: ResultShape,
        token: &CallToken,
    ) -> Result<T, Error> {
        self.inner.store.store(request)?;
        let _recorded = RecordedRequest {
            store: &self.inner.store,
            id: &request.id,
        };
        match self.inner.roundtrip(request, shape, token).await {
            Ok(payload) => decode(&self.inner.store, payload),
            Err(e) => Err(e),
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    /// Subscribe to `method`. Returns the acknowledging reply and the
    /// stream of notifications pushed under the same path.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(Option<Value>, Subscription), Error> {
        let shape = match Method::from_path(method) {
            Ok(m) if !m.is_subscription() => {
                return Err(ClientError::ProtocolMismatch {
                    method: method.to_string(),
                }
                .into())
            }
            Ok(m) => m.result_shape(),
            Err(_) => ResultShape::Optional,
        };

        // The stream waiter goes in first so no notification that follows
        // the ack can be missed.
        let rx = self.inner.router.register_stream(method, params.clone())?;
        let request = Request::with_random_id(method, params);
        match self.inner.roundtrip(&request, shape, &CallToken::new()).await {
            Ok(ack) => {
                tracing::info!(method = %method, "subscribed");
                Ok((
                    ack,
                    Subscription {
                        method: method.to_string(),
                        rx,
                        store: Arc::clone(&self.inner.store),
                    },
                ))
            }
            Err(e) => {
                self.inner
                    .router
                    .cancel(&WaiterKey::Stream(method.to_string()));
                Err(e)
            }
        }
    }

    /// Stop delivering notifications for `method`. Returns `false` if no
    /// subscription was open.
    pub fn unsubscribe(&self, method: &str) -> bool {
        let removed = self
            .inner
            .router
            .cancel(&WaiterKey::Stream(method.to_string()));
        if removed {
            tracing::info!(method = %method, "unsubscribed");
        }
        removed
    }

    /// Paths with an open subscription.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .router
            .active_streams()
            .into_iter()
            .map(|(method, _)| method)
            .collect()
    }

    // ── Typed helpers ────────────────────────────────────────────────────

    /// Negotiate the protocol version.
    pub async fn server_version(&self) -> Result<ServerVersion, Error> {
        let params = json!([self.inner.config.client_name, self.inner.config.protocol_version]);
        match self.request(Method::ServerVersion, params).await? {
            MethodResult::ServerVersion(version) => Ok(version),
            other => Err(unexpected(Method::ServerVersion, &other)),
        }
    }

    pub async fn ping(&self) -> Result<(), Error> {
        self.call_optional::<Value>(Method::ServerPing.path(), json!([]))
            .await
            .map(|_| ())
    }

    pub async fn banner(&self) -> Result<String, Error> {
        self.call(Method::ServerBanner.path(), json!([])).await
    }

    /// Current chain tip with the header decoded.
    pub async fn block_tip(&self) -> Result<BlockTip, Error> {
        match self.request(Method::HeadersGetTip, json!([])).await? {
            MethodResult::Tip(tip) => Ok(BlockTip::try_from(tip)?),
            other => Err(unexpected(Method::HeadersGetTip, &other)),
        }
    }

    /// Subscribe to new chain tips. Returns the current tip.
    pub async fn subscribe_headers(&self) -> Result<(HeaderTip, Subscription), Error> {
        let path = Method::HeadersSubscribe.path();
        let (ack, subscription) = self.subscribe(path, json!([])).await?;
        match method::decode::<HeaderTip>(path, ack) {
            Ok(tip) => Ok((tip, subscription)),
            Err(e) => {
                self.unsubscribe(path);
                Err(e.into())
            }
        }
    }

    pub async fn balance(&self, script_hash: &str) -> Result<Balance, Error> {
        self.call(Method::ScriptHashGetBalance.path(), json!([script_hash]))
            .await
    }

    pub async fn history(&self, script_hash: &str) -> Result<Vec<HistoryItem>, Error> {
        self.call(Method::ScriptHashGetHistory.path(), json!([script_hash]))
            .await
    }

    /// Fee rate in BTC/kB to confirm within `blocks`; `-1` if the server
    /// cannot estimate.
    pub async fn estimate_fee(&self, blocks: u32) -> Result<f64, Error> {
        self.call(Method::EstimateFee.path(), json!([blocks])).await
    }

    /// Broadcast a raw transaction. Returns its txid.
    pub async fn broadcast_transaction(&self, raw_tx: &[u8]) -> Result<String, Error> {
        self.call(Method::TransactionBroadcast.path(), json!([hex::encode(raw_tx)]))
            .await
    }
}

impl Drop for ElectrumClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for ElectrumClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectrumClient")
            .field("url", &self.inner.transport.url())
            .field("state", &self.state())
            .field("router", &self.inner.router)
            .finish()
    }
}

impl Inner {
    /// Send `request` and wait for its reply, the timeout, or `token`.
    async fn roundtrip(
        &self,
        request: &Request,
        shape: ResultShape,
        token: &CallToken,
    ) -> Result<Option<Value>, Error> {
        if token.is_cancelled() {
            return Err(ClientError::Cancelled.into());
        }
        let text = request.to_text()?;
        // Stamp the waiter with the live session so a late termination of an
        // earlier session leaves it alone.
        self.router.set_generation(self.transport.session());
        let mut rx = self
            .router
            .register_unary(request.id.clone(), request.method.clone(), shape)?;
        let key = WaiterKey::Unary(request.id.clone());

        let router = Arc::clone(&self.router);
        let cancel_key = key.clone();
        let action = token.register(move || {
            router.cancel(&cancel_key);
        });
        let _guard = CallGuard {
            router: &self.router,
            key: &key,
            token,
            action,
        };

        if let Err(e) = self.transport.send_text(text).await {
            return Err(e.into());
        }
        tracing::debug!(id = %request.id, method = %request.method, "request sent");

        let timeout = self.config.request_timeout();
        tokio::select! {
            outcome = &mut rx => outcome.unwrap_or_else(|_| Err(ClientError::Cancelled.into())),
            _ = tokio::time::sleep(timeout) => {
                if !self.router.cancel(&key) {
                    // Resolved while the timer fired; the outcome is already queued.
                    return rx.await.unwrap_or_else(|_| Err(ClientError::Cancelled.into()));
                }
                tracing::warn!(id = %request.id, method = %request.method, "request timed out");
                Err(ClientError::Timeout(timeout).into())
            }
        }
    }

    /// Re-issue every open subscription on a fresh session.
    async fn resubscribe_all(&self) {
        for (method, params) in self.router.active_streams() {
            let shape = Method::from_path(&method)
                .map(|m| m.result_shape())
                .unwrap_or(ResultShape::Optional);
            let request = Request::with_random_id(method.as_str(), params);
            match self.roundtrip(&request, shape, &CallToken::new()).await {
                Ok(_) => tracing::info!(method = %method, "re-subscribed"),
                Err(e) => tracing::warn!(method = %method, error = %e, "re-subscribe failed"),
            }
        }
    }
}

async fn run_pump(
    inner: Arc<Inner>,
    mut messages: MessageStream,
    mut lifecycle: broadcast::Receiver<LifecycleEvent>,
) {
    loop {
        tokio::select! {
            biased;

            item = messages.next() => match item {
                Some(Ok(frame)) => {
                    if let Err(e) = inner.router.handle(&frame) {
                        tracing::warn!(error = %e, "discarding inbound frame");
                    }
                }
                Some(Err(e)) => {
                    fail_stale_calls(&inner, e.into());
                    messages = inner.transport.messages();
                }
                None => messages = inner.transport.messages(),
            },
            event = lifecycle.recv() => match event {
                Ok(LifecycleEvent::Disconnected { code, reason }) => {
                    let err = TransportError::ConnectionClosed { code, reason };
                    fail_stale_calls(&inner, err.into());
                }
                Ok(LifecycleEvent::Connected { is_reconnect: true })
                    if inner.config.resubscribe_on_reconnect =>
                {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move { inner.resubscribe_all().await });
                }
                Ok(LifecycleEvent::Connected { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "lifecycle events lagged");
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

/// Fail the calls a terminated session leaves behind. A termination observed
/// while a newer session is already live only reaches calls issued before it.
fn fail_stale_calls(inner: &Inner, err: Error) {
    if inner.transport.state() == ConnectionState::Connected {
        inner.router.fail_unaries_before(inner.transport.session(), err);
    } else {
        inner.router.fail_unaries(err);
    }
}

/// Forgets a recorded request when its call finishes or is dropped.
struct RecordedRequest<'a> {
    store: &'a ResultStore,
    id: &'a RpcId,
}

impl Drop for RecordedRequest<'_> {
    fn drop(&mut self) {
        self.store.evict(self.id);
    }
}

/// Withdraws a call's waiter and its cancel action when the call finishes
/// or is dropped.
struct CallGuard<'a> {
    router: &'a Router,
    key: &'a WaiterKey,
    token: &'a CallToken,
    action: ActionId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.router.cancel(self.key);
        self.token.unregister(self.action);
    }
}

fn ensure_unary(method: &str) -> Result<(), Error> {
    match Method::from_path(method) {
        Ok(m) if m.is_subscription() => Err(ClientError::ProtocolMismatch {
            method: method.to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

fn unexpected(method: Method, result: &MethodResult) -> Error {
    CodingError::UnexpectedFormat {
        method: Some(method.path().to_string()),
        payload: format!("{result:?}"),
    }
    .into()
}

/// Notifications pushed under one method path.
///
/// Ends after the subscription is cancelled, or after a final error item
/// when the client shuts down.
pub struct Subscription {
    method: String,
    rx: StreamReceiver,
    store: Arc<ResultStore>,
}

impl Subscription {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Next raw notification params.
    pub async fn next(&mut self) -> Option<Result<Value, Error>> {
        self.rx.recv().await
    }

    /// Next notification decoded through the method table.
    pub async fn next_notification(&mut self) -> Option<Result<Notification, Error>> {
        let params = match self.rx.recv().await? {
            Ok(params) => params,
            Err(e) => return Some(Err(e)),
        };
        Some(self.store.record_notification(&self.method, params))
    }

    /// Stop receiving. Buffered notifications can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl Stream for Subscription {
    type Item = Result<Value, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("method", &self.method)
            .finish()
    }
}
