//! Typed decode-and-cache layer between raw reply payloads and callers.
//!
//! The store remembers every outbound request until its reply has been
//! decoded, so a payload can always be decoded against the method that
//! produced it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, StorageError};
use crate::method::{self, Method, MethodResult, Notification};
use crate::request::{Request, RpcId};

#[derive(Default)]
struct StoreState {
    requests: HashMap<RpcId, Request>,
    results: HashMap<RpcId, MethodResult>,
    notifications: HashMap<String, Notification>,
}

/// Request records, decoded results and the latest notification per path.
#[derive(Default)]
pub struct ResultStore {
    state: Mutex<StoreState>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an outbound request. Fails if its id is still pending.
    pub fn store(&self, request: &Request) -> Result<(), StorageError> {
        let mut state = self.lock();
        if state.requests.contains_key(&request.id) {
            return Err(StorageError::RequestAlreadyExists(request.id.clone()));
        }
        state.requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    /// The request recorded under `id`.
    pub fn request(&self, id: &RpcId) -> Result<Request, StorageError> {
        self.lock()
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::RequestNotFound(id.clone()))
    }

    /// Decode the reply payload of request `id` into `T`.
    pub fn decode<T: DeserializeOwned>(&self, id: &RpcId, payload: Option<Value>) -> Result<T, Error> {
        let request = self.request(id)?;
        Ok(method::decode(&request.method, payload)?)
    }

    /// Decode the reply payload of request `id` through the method
    /// catalogue and cache the typed result.
    pub fn decode_typed(&self, id: &RpcId, payload: Option<Value>) -> Result<MethodResult, Error> {
        let request = self.request(id)?;
        let method = Method::from_path(&request.method)?;
        let result = method.decode_result(payload)?;

        let mut state = self.lock();
        if state.results.contains_key(id) {
            return Err(StorageError::ResultAlreadyExists(id.clone()).into());
        }
        state.results.insert(id.clone(), result.clone());
        Ok(result)
    }

    /// The cached typed result of request `id`.
    pub fn result(&self, id: &RpcId) -> Result<MethodResult, StorageError> {
        self.lock()
            .results
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ResultNotFound(id.clone()))
    }

    /// Decode a notification pushed under `method` and keep it as the latest
    /// one for that path.
    pub fn record_notification(&self, method: &str, params: Value) -> Result<Notification, Error> {
        let notification = Method::from_path(method)?.decode_notification(params)?;
        self.lock()
            .notifications
            .insert(method.to_string(), notification.clone());
        Ok(notification)
    }

    /// The most recent notification recorded under `method`.
    pub fn latest_notification(&self, method: &str) -> Result<Notification, StorageError> {
        self.lock()
            .notifications
            .get(method)
            .cloned()
            .ok_or_else(|| StorageError::NotificationNotFound(method.to_string()))
    }

    /// Forget request `id` and its cached result.
    pub fn evict(&self, id: &RpcId) {
        let mut state = self.lock();
        state.requests.remove(id);
        state.results.remove(id);
    }

    /// Number of requests awaiting decode.
    pub fn pending(&self) -> usize {
        self.lock().requests.len()
    }
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ResultStore")
            .field("requests", &state.requests.len())
            .field("results", &state.results.len())
            .field("notifications", &state.notifications.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodingError;
    use crate::method::{Balance, HeaderTip};
    use serde_json::json;

    #[test]
    fn store_rejects_reused_pending_id() {
        let store = ResultStore::new();
        let req = Request::new("r1", "server.banner", json!([]));
        store.store(&req).unwrap();
        assert_eq!(
            store.store(&req).unwrap_err(),
            StorageError::RequestAlreadyExists("r1".into())
        );
        store.evict(&req.id);
        assert!(store.store(&req).is_ok());
    }

    #[test]
    fn decode_before_store_is_not_found() {
        let store = ResultStore::new();
        let err = store.decode::<String>(&"ghost".into(), Some(json!("x"))).unwrap_err();
        assert_eq!(err, Error::Storage(StorageError::RequestNotFound("ghost".into())));
    }

    #[test]
    fn decode_into_caller_type() {
        let store = ResultStore::new();
        let req = Request::new("U1", "blockchain.headers.get_tip", json!([]));
        store.store(&req).unwrap();
        let tip: HeaderTip = store
            .decode(&req.id, Some(json!({"height": 800000, "hex": "00"})))
            .unwrap();
        assert_eq!(tip.height, 800_000);

        let optional: Option<HeaderTip> = store.decode(&req.id, None).unwrap();
        assert!(optional.is_none());
    }

    #[test]
    fn decode_mismatch_carries_method_path() {
        let store = ResultStore::new();
        let req = Request::new("b", "blockchain.scripthash.get_balance", json!(["aa"]));
        store.store(&req).unwrap();
        let err = store.decode::<Balance>(&req.id, Some(json!([1, 2]))).unwrap_err();
        match err {
            Error::Coding(CodingError::UnexpectedFormat { method, .. }) => {
                assert_eq!(method.as_deref(), Some("blockchain.scripthash.get_balance"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn typed_decode_dispatches_on_method_and_caches() {
        let store = ResultStore::new();
        let req = Request::new("bal", "blockchain.scripthash.get_balance", json!(["aa"]));
        store.store(&req).unwrap();
        assert_eq!(
            store.result(&req.id).unwrap_err(),
            StorageError::ResultNotFound("bal".into())
        );

        let payload = json!({"confirmed": 1000, "unconfirmed": -5});
        let r = store.decode_typed(&req.id, Some(payload.clone())).unwrap();
        let expected = MethodResult::Balance(Balance { confirmed: 1000, unconfirmed: -5 });
        assert_eq!(r, expected);
        assert_eq!(store.result(&req.id).unwrap(), expected);
        assert_eq!(
            store.decode_typed(&req.id, Some(payload)).unwrap_err(),
            Error::Storage(StorageError::ResultAlreadyExists("bal".into()))
        );

        store.evict(&req.id);
        assert!(store.result(&req.id).is_err());
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn typed_decode_rejects_unknown_method() {
        let store = ResultStore::new();
        let req = Request::new("u", "x.getTip", json!([]));
        store.store(&req).unwrap();
        assert_eq!(
            store.decode_typed(&req.id, Some(json!({}))).unwrap_err(),
            Error::Storage(StorageError::UnknownMethodPath("x.getTip".into()))
        );
    }

    #[test]
    fn notifications_keep_latest_per_path() {
        let store = ResultStore::new();
        let path = "blockchain.headers.subscribe";
        assert_eq!(
            store.latest_notification(path).unwrap_err(),
            StorageError::NotificationNotFound(path.into())
        );
        store
            .record_notification(path, json!([{"height": 1, "hex": "00"}]))
            .unwrap();
        store
            .record_notification(path, json!([{"height": 2, "hex": "01"}]))
            .unwrap();
        assert_eq!(
            store.latest_notification(path).unwrap(),
            Notification::Header(HeaderTip { height: 2, hex: "01".into() })
        );
    }
}
