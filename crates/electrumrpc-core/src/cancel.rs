//! One-shot cancellation token.
//!
//! A `CallToken` collects cleanup actions and runs each of them exactly
//! once when cancelled. Clones share state, so the caller can keep one copy
//! and hand another to the call it wants to be able to abort.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

type Action = Box<dyn FnOnce() + Send>;

/// Handle to a registered action, used to withdraw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(u64);

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    next_id: u64,
    actions: Vec<(ActionId, Action)>,
}

#[derive(Default)]
struct TokenInner {
    state: Mutex<TokenState>,
    notify: Notify,
}

/// Cancellation handle shared between a caller and an in-flight call.
#[derive(Clone, Default)]
pub struct CallToken {
    inner: Arc<TokenInner>,
}

impl CallToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a cleanup action. Runs immediately if the token is
    /// already cancelled.
    pub fn register<F>(&self, action: F) -> ActionId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = {
            let mut state = self.lock();
            let id = ActionId(state.next_id);
            state.next_id += 1;
            if !state.cancelled {
                state.actions.push((id, Box::new(action)));
                return id;
            }
            id
        };
        action();
        id
    }

    /// Withdraw an action that has not run yet. Returns `false` if it
    /// already ran or was withdrawn.
    pub fn unregister(&self, id: ActionId) -> bool {
        let mut state = self.lock();
        let before = state.actions.len();
        state.actions.retain(|(action_id, _)| *action_id != id);
        state.actions.len() != before
    }

    /// Number of actions waiting for cancellation.
    pub fn pending_actions(&self) -> usize {
        self.lock().actions.len()
    }

    /// Cancel the token, running every registered action in registration
    /// order. Returns `false` if the token was already cancelled.
    pub fn cancel(&self) -> bool {
        let actions = {
            let mut state = self.lock();
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            std::mem::take(&mut state.actions)
        };
        // Actions run outside the lock: they may register further actions.
        for (_, action) in actions {
            action();
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CallToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CallToken")
            .field("cancelled", &state.cancelled)
            .field("actions", &state.actions.len())
            .finish()
    }
}
