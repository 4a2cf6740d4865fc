//! Typed wrappers over [`NodeClient::raw_call`] for the node methods the core
//! relies on, with the response shapes Bitcoin Core returns.

use bitcoin::consensus::encode::deserialize;
use bitcoin::{Block, BlockHash};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::backend::{BackendError, NodeClient, RpcBlockHeader};
use crate::context::RequestContext;

/// `getblock <hash> 1` response: header fields plus transaction ids.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlock {
    #[serde(flatten)]
    pub header: RpcBlockHeader,
    pub tx: Vec<String>,
}

/// `getrawtransaction <txid> true` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRawTransaction {
    pub txid: String,
    pub hex: String,
    #[serde(rename = "blockhash", default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub confirmations: Option<u64>,
    #[serde(rename = "blocktime", default)]
    pub block_time: Option<u64>,
}

/// `estimatesmartfee` response. `feerate` is in BTC/kvB and absent when the
/// node has too little data.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcSmartFee {
    #[serde(rename = "feerate", default)]
    pub fee_rate_btc_kvb: Option<f64>,
    #[serde(default)]
    pub blocks: Option<u16>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// `getblockstats <height> ["feerate_percentiles"]` response, sat/vB at the
/// 10th, 25th, 50th, 75th and 90th percentile.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlockStats {
    pub feerate_percentiles: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcScanUnspent {
    pub txid: String,
    pub vout: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pubkey: String,
    /// BTC.
    pub amount: f64,
    #[serde(default)]
    pub height: u64,
}

/// `scantxoutset start [...]` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcScanTxOutSet {
    #[serde(default)]
    pub success: bool,
    pub height: u64,
    pub unspents: Vec<RpcScanUnspent>,
}

pub(crate) fn ensure_live(ctx: &RequestContext) -> Result<(), BackendError> {
    if ctx.is_cancelled() {
        return Err(BackendError::Cancelled);
    }
    if matches!(ctx.remaining(), Some(left) if left.is_zero()) {
        return Err(BackendError::Timeout);
    }
    Ok(())
}

/// Issue `method` and deserialize its result.
pub fn call<T: DeserializeOwned>(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    method: &str,
    params: &[Value],
) -> Result<T, BackendError> {
    ensure_live(ctx)?;
    debug!(method, "node rpc call");
    let value = node.raw_call(ctx, method, params)?;
    serde_json::from_value(value).map_err(|e| BackendError::Decode(format!("{method}: {e}")))
}

pub fn get_block_hash(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    height: u64,
) -> Result<BlockHash, BackendError> {
    ensure_live(ctx)?;
    node.get_block_hash(ctx, height)
}

pub fn get_block_header(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    hash: &BlockHash,
) -> Result<RpcBlockHeader, BackendError> {
    ensure_live(ctx)?;
    node.get_block_header(ctx, hash)
}

pub fn get_block_count(node: &dyn NodeClient, ctx: &RequestContext) -> Result<u64, BackendError> {
    ensure_live(ctx)?;
    node.get_block_count(ctx)
}

pub fn get_block(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    hash: &BlockHash,
) -> Result<RpcBlock, BackendError> {
    call(node, ctx, "getblock", &[json!(hash.to_string()), json!(1)])
}

/// `getblock <hash> 0`: every transaction body in one call, without
/// requiring the node's transaction index.
pub fn get_block_raw(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    hash: &BlockHash,
) -> Result<Block, BackendError> {
    let block_hex: String = call(node, ctx, "getblock", &[json!(hash.to_string()), json!(0)])?;
    let bytes = hex::decode(block_hex.trim())
        .map_err(|e| BackendError::Decode(format!("getblock: {e}")))?;
    deserialize(&bytes).map_err(|e| BackendError::Decode(format!("getblock: {e}")))
}

pub fn get_raw_transaction(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    txid: &str,
) -> Result<RpcRawTransaction, BackendError> {
    call(node, ctx, "getrawtransaction", &[json!(txid), json!(true)])
}

/// Returns the txid the node assigned.
pub fn send_raw_transaction(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    tx_hex: &str,
) -> Result<String, BackendError> {
    call(node, ctx, "sendrawtransaction", &[json!(tx_hex)])
}

pub fn estimate_smart_fee(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    target_blocks: u16,
) -> Result<RpcSmartFee, BackendError> {
    call(node, ctx, "estimatesmartfee", &[json!(target_blocks)])
}

pub fn get_block_stats(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    height: u64,
) -> Result<RpcBlockStats, BackendError> {
    call(
        node,
        ctx,
        "getblockstats",
        &[json!(height), json!(["feerate_percentiles"])],
    )
}

pub fn scan_tx_out_set(
    node: &dyn NodeClient,
    ctx: &RequestContext,
    address: &str,
) -> Result<RpcScanTxOutSet, BackendError> {
    call(
        node,
        ctx,
        "scantxoutset",
        &[json!("start"), json!([format!("addr({address})")])],
    )
}
