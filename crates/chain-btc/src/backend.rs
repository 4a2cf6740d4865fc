//! Backend contracts consumed by the core.
//!
//! The full-node JSON-RPC client and the block-explorer HTTP client live
//! outside this crate; they only need to implement [`NodeClient`] and
//! [`ExplorerClient`]. Both are shared read-only across concurrent requests,
//! hence the `Send + Sync` bounds.

use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::RequestContext;
use crate::error::BtcError;

/// JSON-RPC method does not exist (e.g. node built without an index).
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
/// Invalid address or key, also returned for unknown block/tx ids.
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// Invalid, missing or duplicate parameter, returned for out-of-range heights.
pub const RPC_INVALID_PARAMETER: i64 = -8;
/// General error during transaction or block submission.
pub const RPC_VERIFY_ERROR: i64 = -25;
/// Transaction or block was rejected by network rules.
pub const RPC_VERIFY_REJECTED: i64 = -26;
/// Transaction already in chain.
pub const RPC_VERIFY_ALREADY_IN_CHAIN: i64 = -27;
/// Error parsing or validating structure in raw format.
pub const RPC_DESERIALIZATION_ERROR: i64 = -22;

/// Failure reported by a backend client.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("rpc error (code: {code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            BackendError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<BackendError> for BtcError {
    fn from(e: BackendError) -> Self {
        BtcError::BackendUnavailable(e.to_string())
    }
}

/// `getblockheader <hash> true` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcBlockHeader {
    pub hash: String,
    #[serde(default)]
    pub confirmations: i64,
    pub height: u64,
    pub version: i32,
    #[serde(rename = "merkleroot")]
    pub merkle_root: String,
    pub time: u64,
    pub nonce: u32,
    pub bits: String,
    #[serde(rename = "previousblockhash", default)]
    pub previous_block_hash: Option<String>,
    #[serde(rename = "nextblockhash", default)]
    pub next_block_hash: Option<String>,
}

/// Full-node backend.
pub trait NodeClient: Send + Sync {
    fn get_block_hash(&self, ctx: &RequestContext, height: u64)
        -> Result<BlockHash, BackendError>;

    fn get_block_header(
        &self,
        ctx: &RequestContext,
        hash: &BlockHash,
    ) -> Result<RpcBlockHeader, BackendError>;

    fn get_block_count(&self, ctx: &RequestContext) -> Result<u64, BackendError>;

    /// Untyped JSON-RPC call; returns the `result` member.
    fn raw_call(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: &[Value],
    ) -> Result<Value, BackendError>;
}

/// Unspent output as reported by the explorer API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerUtxo {
    pub txid: String,
    pub vout: u32,
    pub amount_sat: u64,
    /// Hex scriptPubKey; derived from the queried address when absent.
    #[serde(default)]
    pub script_pubkey: Option<String>,
    #[serde(default)]
    pub confirmations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAmount {
    pub address: Option<String>,
    pub amount_sat: u64,
}

/// Address history entry as reported by the explorer API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerTransaction {
    pub txid: String,
    pub block_height: Option<u64>,
    pub block_time: Option<u64>,
    pub fee_sat: u64,
    pub inputs: Vec<AddressAmount>,
    pub outputs: Vec<AddressAmount>,
}

/// Keyed block-explorer backend, indexed by address.
pub trait ExplorerClient: Send + Sync {
    fn address_utxos(
        &self,
        ctx: &RequestContext,
        address: &str,
    ) -> Result<Vec<ExplorerUtxo>, BackendError>;

    /// Newest first. `page` is zero-based.
    fn address_transactions(
        &self,
        ctx: &RequestContext,
        address: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ExplorerTransaction>, BackendError>;
}
