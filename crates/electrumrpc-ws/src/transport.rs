//! `WsTransport`: the connection lifecycle state machine.
//!
//! ```text
//! idle ──connect──▶ connecting ──ok──▶ connected ──disconnect──▶ disconnected
//!                        │                 │  ▲                       │
//!                        └──setup failed───┼──┼────▶ disconnected     │
//!                                          ▼  │                       │
//!                                     reconnecting ◀──────reconnect───┘
//! ```
//!
//! One background task per live session owns the link. Control operations
//! (`connect`, `disconnect`, `reconnect`) are serialised through an async
//! mutex; every session carries an epoch so a task that outlives its session
//! can never tear down its successor. Retrying is left to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use electrumrpc_core::error::TransportError;
use electrumrpc_core::metrics::{MetricsCollector, NoopMetrics};
use electrumrpc_core::transport::{
    CloseCode, ConnectionState, Diagnostics, LifecycleEvent, MessageStream, OutboundFrame,
    Transport,
};

use crate::config::TransportConfig;
use crate::link::{Dialer, Link, LinkEvent};
use crate::ws::WsDialer;

/// Item of the shared inbound channel.
#[derive(Debug, Clone)]
enum Inbound {
    Frame(Bytes),
    Closed(TransportError),
}

/// Handle to the task driving one session.
struct Session {
    shutdown: oneshot::Sender<(CloseCode, Option<String>)>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Counters {
    sessions: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

struct Shared {
    dialer: Arc<dyn Dialer>,
    config: TransportConfig,
    url: Mutex<String>,
    state: watch::Sender<ConnectionState>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    /// Created on the first `messages()` call, dropped when the sequence terminates.
    inbound: Mutex<Option<broadcast::Sender<Inbound>>>,
    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    control: tokio::sync::Mutex<Option<Session>>,
    epoch: AtomicU64,
    last_close: Mutex<Option<(CloseCode, Option<String>)>>,
    counters: Counters,
    metrics: RwLock<Arc<dyn MetricsCollector>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// WebSocket transport for one Electrum server.
pub struct WsTransport {
    shared: Arc<Shared>,
}

impl WsTransport {
    /// Transport dialing `url` over WebSocket.
    pub fn new(url: impl Into<String>, config: TransportConfig) -> Self {
        Self::with_dialer(url, Arc::new(WsDialer), config)
    }

    /// Transport dialing through a custom `Dialer`.
    pub fn with_dialer(
        url: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        config: TransportConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (lifecycle, _) = broadcast::channel(config.lifecycle_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                dialer,
                config,
                url: Mutex::new(url.into()),
                state,
                lifecycle,
                inbound: Mutex::new(None),
                outbound: Mutex::new(None),
                control: tokio::sync::Mutex::new(None),
                epoch: AtomicU64::new(0),
                last_close: Mutex::new(None),
                counters: Counters::default(),
                metrics: RwLock::new(Arc::new(NoopMetrics)),
            }),
        }
    }

    /// Code and reason of the most recent close.
    pub fn last_close(&self) -> Option<(CloseCode, Option<String>)> {
        lock(&self.shared.last_close).clone()
    }
}

impl Shared {
    fn metrics(&self) -> Arc<dyn MetricsCollector> {
        match self.metrics.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next`. Returns `false` (and notifies nobody) if already there.
    fn set_state(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            tracing::debug!(state = %next, "transport state changed");
            self.metrics().state_changed(next);
        }
        changed
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine: lifecycle events are not replayed.
        let _ = self.lifecycle.send(event);
    }

    fn publish(&self, frame: Bytes) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        self.metrics().frame_received(frame.len());
        if let Some(tx) = lock(&self.inbound).as_ref() {
            let _ = tx.send(Inbound::Frame(frame));
        }
    }

    fn record_sent(&self, len: usize) {
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.metrics().frame_sent(len);
    }

    /// Deliver the termination error to every inbound consumer and drop the
    /// channel; the next `messages()` call creates a fresh one.
    fn terminate_inbound(&self, err: TransportError) {
        if let Some(tx) = lock(&self.inbound).take() {
            let _ = tx.send(Inbound::Closed(err));
        }
    }

    /// Transition to `Disconnected` from any live state. Emits the lifecycle
    /// event and terminates the inbound sequence exactly once per transition.
    fn mark_disconnected(&self, code: CloseCode, reason: Option<String>) -> bool {
        let changed = self.state.send_if_modified(|state| match state {
            ConnectionState::Idle | ConnectionState::Disconnected => false,
            _ => {
                *state = ConnectionState::Disconnected;
                true
            }
        });
        if !changed {
            return false;
        }
        self.metrics().state_changed(ConnectionState::Disconnected);
        lock(&self.outbound).take();
        *lock(&self.last_close) = Some((code, reason.clone()));

        tracing::info!(code = %code, reason = ?reason, "transport disconnected");
        self.terminate_inbound(TransportError::ConnectionClosed {
            code,
            reason: reason.clone(),
        });
        self.emit(LifecycleEvent::Disconnected { code, reason });
        true
    }

    /// Called by a session task when its link goes away.
    fn session_lost(&self, epoch: u64, code: CloseCode, reason: Option<String>) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        tracing::warn!(code = %code, reason = ?reason, "connection lost");
        self.mark_disconnected(code, reason);
    }

    async fn dial(&self, url: &str) -> Result<Link, TransportError> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.dialer.dial(url)).await {
            Ok(Ok(link)) => Ok(link),
            Ok(Err(TransportError::SetupFailed(reason))) => Err(TransportError::SetupFailed(reason)),
            Ok(Err(other)) => Err(TransportError::SetupFailed(other.to_string())),
            Err(_) => Err(TransportError::SetupFailed(format!(
                "{url}: handshake timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Install a new session on `link` and announce it.
    fn start_session(self: &Arc<Self>, link: Link, is_reconnect: bool) -> Session {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *lock(&self.outbound) = Some(out_tx);

        // Counted before the state flips so a Connected observer never sees the previous number.
        self.counters.sessions.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        self.emit(LifecycleEvent::Connected { is_reconnect });

        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            run_session(shared, epoch, link, out_rx, shutdown_rx).await;
        });
        Session {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Stop a session task, writing a close frame if it is still alive.
    async fn stop_session(&self, session: Session, code: CloseCode, reason: Option<String>) {
        // Invalidate the epoch first so the exiting task cannot report a loss.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.outbound).take();

        let Session { shutdown, mut task } = session;
        let _ = shutdown.send((code, reason));
        if tokio::time::timeout(self.config.close_timeout(), &mut task)
            .await
            .is_err()
        {
            tracing::warn!("session did not close in time, aborting");
            task.abort();
        }
    }
}

async fn run_session(
    shared: Arc<Shared>,
    epoch: u64,
    link: Link,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    mut shutdown: oneshot::Receiver<(CloseCode, Option<String>)>,
) {
    let Link {
        mut sink,
        mut stream,
    } = link;

    let (code, reason) = loop {
        tokio::select! {
            biased;

            request = &mut shutdown => {
                if let Ok((code, reason)) = request {
                    let _ = sink.send(OutboundFrame::Close { code, reason }).await;
                }
                let _ = sink.close().await;
                return;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.close().await;
                    return;
                };
                let len = frame.len();
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(error = %e, "write failed");
                    break (CloseCode::Abnormal, Some(e.to_string()));
                }
                shared.record_sent(len);
            }
            event = stream.next() => match event {
                Some(LinkEvent::Frame(bytes)) => shared.publish(bytes),
                Some(LinkEvent::Closed { code, reason }) => break (code, reason),
                Some(LinkEvent::Failed(e)) => {
                    tracing::warn!(error = %e, "read failed");
                    break (CloseCode::Abnormal, Some(e));
                }
                None => break (CloseCode::Abnormal, None),
            }
        }
    };

    shared.session_lost(epoch, code, reason);
}

/// Adapt a broadcast receiver to a stream that ends after the termination item.
fn inbound_stream(rx: broadcast::Receiver<Inbound>) -> MessageStream {
    Box::pin(stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(Inbound::Frame(frame)) => return Some((Ok(frame), Some(rx))),
                Ok(Inbound::Closed(err)) => return Some((Err(err), None)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "inbound consumer lagged, frames dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }))
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut control = self.shared.control.lock().await;
        if self.shared.current_state() == ConnectionState::Connected && control.is_some() {
            return Ok(());
        }
        if let Some(stale) = control.take() {
            self.shared.stop_session(stale, CloseCode::Abnormal, None).await;
        }

        self.shared.set_state(ConnectionState::Connecting);
        let url = self.url();
        tracing::info!(url = %url, "connecting");

        match self.shared.dial(&url).await {
            Ok(link) => {
                *control = Some(self.shared.start_session(link, false));
                tracing::info!(url = %url, "connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "connect failed");
                self.shared.mark_disconnected(CloseCode::Abnormal, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&self, code: CloseCode, reason: Option<String>) {
        let mut control = self.shared.control.lock().await;
        if let Some(session) = control.take() {
            self.shared.stop_session(session, code, reason.clone()).await;
        }
        self.shared.mark_disconnected(code, reason);
    }

    async fn reconnect(&self, url: Option<String>) -> Result<(), TransportError> {
        let mut control = self.shared.control.lock().await;
        self.shared.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics().reconnect_attempted();
        self.shared.set_state(ConnectionState::Reconnecting);

        let reason = Some("reconnecting".to_string());
        if let Some(session) = control.take() {
            self.shared
                .stop_session(session, CloseCode::GoingAway, reason.clone())
                .await;
        }
        self.shared.terminate_inbound(TransportError::ConnectionClosed {
            code: CloseCode::GoingAway,
            reason,
        });

        if let Some(url) = url {
            *lock(&self.shared.url) = url;
        }
        let url = self.url();
        tracing::info!(url = %url, "reconnecting");

        match self.shared.dial(&url).await {
            Ok(link) => {
                self.shared.counters.reconnect_successes.fetch_add(1, Ordering::Relaxed);
                self.shared.metrics().reconnect_succeeded();
                *control = Some(self.shared.start_session(link, true));
                tracing::info!(url = %url, "reconnected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "reconnect failed");
                self.shared.mark_disconnected(CloseCode::Abnormal, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if self.shared.current_state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let tx = lock(&self.shared.outbound)
            .clone()
            .ok_or(TransportError::NotConnected)?;
        tx.send(frame).await.map_err(|_| TransportError::NotConnected)
    }

    fn messages(&self) -> MessageStream {
        let rx = lock(&self.shared.inbound)
            .get_or_insert_with(|| broadcast::channel(self.shared.config.inbound_capacity.max(1)).0)
            .subscribe();
        inbound_stream(rx)
    }

    fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.lifecycle.subscribe()
    }

    fn state_events(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn diagnostics(&self) -> Diagnostics {
        let c = &self.shared.counters;
        Diagnostics {
            sessions: c.sessions.load(Ordering::SeqCst),
            reconnect_attempts: c.reconnect_attempts.load(Ordering::Relaxed),
            reconnect_successes: c.reconnect_successes.load(Ordering::Relaxed),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
        }
    }

    fn set_metrics(&self, metrics: Arc<dyn MetricsCollector>) {
        match self.shared.metrics.write() {
            Ok(mut slot) => *slot = metrics,
            Err(poisoned) => *poisoned.into_inner() = metrics,
        }
    }

    fn url(&self) -> String {
        lock(&self.shared.url).clone()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Ok(mut control) = self.shared.control.try_lock() {
            if let Some(session) = control.take() {
                session.task.abort();
            }
        }
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url())
            .field("state", &self.shared.current_state())
            .finish()
    }
}
