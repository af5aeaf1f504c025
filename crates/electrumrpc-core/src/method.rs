//! Method catalogue: the total mapping from method path to result type.
//!
//! Every known method path maps to exactly one [`Method`] variant, and every
//! variant to exactly one [`MethodResult`] variant. Adding a method means
//! adding one arm to each `match` below; the compiler checks the rest.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::ResultShape;
use crate::error::{snippet, CodingError, StorageError};

/// A method of the Electrum protocol known to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    ServerVersion,
    ServerBanner,
    ServerPing,
    ServerFeatures,
    HeadersGetTip,
    HeadersSubscribe,
    BlockHeader,
    EstimateFee,
    RelayFee,
    ScriptHashGetBalance,
    ScriptHashGetHistory,
    ScriptHashListUnspent,
    ScriptHashSubscribe,
    TransactionBroadcast,
    TransactionGet,
    MempoolFeeHistogram,
}

impl Method {
    pub const ALL: [Method; 16] = [
        Method::ServerVersion,
        Method::ServerBanner,
        Method::ServerPing,
        Method::ServerFeatures,
        Method::HeadersGetTip,
        Method::HeadersSubscribe,
        Method::BlockHeader,
        Method::EstimateFee,
        Method::RelayFee,
        Method::ScriptHashGetBalance,
        Method::ScriptHashGetHistory,
        Method::ScriptHashListUnspent,
        Method::ScriptHashSubscribe,
        Method::TransactionBroadcast,
        Method::TransactionGet,
        Method::MempoolFeeHistogram,
    ];

    /// The wire method path.
    pub fn path(self) -> &'static str {
        match self {
            Self::ServerVersion => "server.version",
            Self::ServerBanner => "server.banner",
            Self::ServerPing => "server.ping",
            Self::ServerFeatures => "server.features",
            Self::HeadersGetTip => "blockchain.headers.get_tip",
            Self::HeadersSubscribe => "blockchain.headers.subscribe",
            Self::BlockHeader => "blockchain.block.header",
            Self::EstimateFee => "blockchain.estimatefee",
            Self::RelayFee => "blockchain.relayfee",
            Self::ScriptHashGetBalance => "blockchain.scripthash.get_balance",
            Self::ScriptHashGetHistory => "blockchain.scripthash.get_history",
            Self::ScriptHashListUnspent => "blockchain.scripthash.listunspent",
            Self::ScriptHashSubscribe => "blockchain.scripthash.subscribe",
            Self::TransactionBroadcast => "blockchain.transaction.broadcast",
            Self::TransactionGet => "blockchain.transaction.get",
            Self::MempoolFeeHistogram => "mempool.get_fee_histogram",
        }
    }

    /// Look up a method by wire path.
    pub fn from_path(path: &str) -> Result<Self, StorageError> {
        Self::ALL
            .into_iter()
            .find(|m| m.path() == path)
            .ok_or_else(|| StorageError::UnknownMethodPath(path.to_string()))
    }

    /// Whether the server also pushes notifications under this path.
    pub fn is_subscription(self) -> bool {
        matches!(self, Self::HeadersSubscribe | Self::ScriptHashSubscribe)
    }

    /// Whether `null` is a valid result for this method.
    pub fn result_shape(self) -> ResultShape {
        match self {
            Self::ServerPing | Self::ScriptHashSubscribe => ResultShape::Optional,
            _ => ResultShape::Required,
        }
    }

    /// Decode a reply payload into this method's result type.
    pub fn decode_result(self, payload: Option<Value>) -> Result<MethodResult, CodingError> {
        let path = self.path();
        Ok(match self {
            Self::ServerVersion => {
                let (software, protocol): (String, String) = decode(path, payload)?;
                MethodResult::ServerVersion(ServerVersion { software, protocol })
            }
            Self::ServerBanner => MethodResult::Banner(decode(path, payload)?),
            Self::ServerPing => {
                let _: Option<Value> = decode(path, payload)?;
                MethodResult::Pong
            }
            Self::ServerFeatures => MethodResult::Features(decode(path, payload)?),
            Self::HeadersGetTip => MethodResult::Tip(decode(path, payload)?),
            Self::HeadersSubscribe => MethodResult::Tip(decode(path, payload)?),
            Self::BlockHeader => MethodResult::Header(decode(path, payload)?),
            Self::EstimateFee => MethodResult::FeeRate(decode(path, payload)?),
            Self::RelayFee => MethodResult::FeeRate(decode(path, payload)?),
            Self::ScriptHashGetBalance => MethodResult::Balance(decode(path, payload)?),
            Self::ScriptHashGetHistory => MethodResult::History(decode(path, payload)?),
            Self::ScriptHashListUnspent => MethodResult::Unspent(decode(path, payload)?),
            Self::ScriptHashSubscribe => MethodResult::Status(decode(path, payload)?),
            Self::TransactionBroadcast => MethodResult::TxHash(decode(path, payload)?),
            Self::TransactionGet => MethodResult::RawTransaction(decode(path, payload)?),
            Self::MempoolFeeHistogram => MethodResult::FeeHistogram(decode(path, payload)?),
        })
    }

    /// Decode notification params pushed under this method path.
    pub fn decode_notification(self, params: Value) -> Result<Notification, CodingError> {
        let path = self.path();
        match self {
            Self::HeadersSubscribe => {
                let (tip,): (HeaderTip,) = decode(path, Some(params))?;
                Ok(Notification::Header(tip))
            }
            Self::ScriptHashSubscribe => {
                let (script_hash, status): (String, Option<String>) = decode(path, Some(params))?;
                Ok(Notification::ScriptHashStatus {
                    script_hash,
                    status,
                })
            }
            _ => Err(CodingError::UnexpectedFormat {
                method: Some(path.to_string()),
                payload: snippet(&params.to_string()),
            }),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

impl std::str::FromStr for Method {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_path(s)
    }
}

/// Decode `payload` into `T`, reporting the method path and a payload
/// snippet on mismatch.
pub fn decode<T: DeserializeOwned>(method: &str, payload: Option<Value>) -> Result<T, CodingError> {
    let value = payload.unwrap_or(Value::Null);
    serde_json::from_value::<T>(value.clone()).map_err(|e| CodingError::UnexpectedFormat {
        method: Some(method.to_string()),
        payload: snippet(&format!("{value} ({e})")),
    })
}

// ─── Result types ─────────────────────────────────────────────────────────────

/// `server.version` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub software: String,
    pub protocol: String,
}

/// `server.features` reply (fields this client reads; others are ignored).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFeatures {
    pub genesis_hash: String,
    pub hash_function: String,
    pub server_version: String,
    pub protocol_min: String,
    pub protocol_max: String,
    #[serde(default)]
    pub pruning: Option<u64>,
}

/// Chain tip as sent by `blockchain.headers.get_tip` and
/// `blockchain.headers.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTip {
    pub height: u64,
    pub hex: String,
}

/// Caller-facing chain tip with the header decoded to bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTip {
    pub height: u64,
    pub header: Vec<u8>,
}

impl TryFrom<HeaderTip> for BlockTip {
    type Error = CodingError;

    fn try_from(tip: HeaderTip) -> Result<Self, Self::Error> {
        let header = hex::decode(&tip.hex).map_err(|e| CodingError::Decode {
            method: Method::HeadersGetTip.path().to_string(),
            message: format!("header hex: {e}"),
        })?;
        Ok(Self {
            height: tip.height,
            header,
        })
    }
}

/// `blockchain.scripthash.get_balance` reply, in satoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

/// One entry of `blockchain.scripthash.get_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub tx_hash: String,
    /// 0 for unconfirmed, -1 for unconfirmed with unconfirmed parents.
    pub height: i64,
    #[serde(default)]
    pub fee: Option<u64>,
}

/// One entry of `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: i64,
    pub value: u64,
}

/// Typed result of any catalogued method.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodResult {
    ServerVersion(ServerVersion),
    Banner(String),
    Pong,
    Features(ServerFeatures),
    Tip(HeaderTip),
    Header(String),
    FeeRate(f64),
    Balance(Balance),
    History(Vec<HistoryItem>),
    Unspent(Vec<Utxo>),
    Status(Option<String>),
    TxHash(String),
    RawTransaction(String),
    FeeHistogram(Vec<(f64, u64)>),
}

/// Typed payload of a server push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Header(HeaderTip),
    ScriptHashStatus {
        script_hash: String,
        status: Option<String>,
    },
}
