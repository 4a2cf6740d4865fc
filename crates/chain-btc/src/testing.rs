//! In-memory [`NodeClient`] and [`ExplorerClient`] doubles.
//!
//! Compiled for this crate's tests and for dependents enabling the
//! `test-util` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, CompactTarget, Transaction, TxMerkleNode};
use serde_json::{json, Value};

use crate::backend::{
    BackendError, ExplorerClient, ExplorerTransaction, ExplorerUtxo, NodeClient, RpcBlockHeader,
    RPC_INVALID_ADDRESS_OR_KEY, RPC_INVALID_PARAMETER, RPC_METHOD_NOT_FOUND,
};
use crate::context::RequestContext;

type Reply = Result<Value, (i64, String)>;

/// Deterministic block hash for test chains.
pub fn block_hash(height: u64) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&height.to_le_bytes());
    bytes[31] = 0xb1;
    BlockHash::from_byte_array(bytes)
}

#[derive(Default)]
pub struct MockNode {
    replies: Mutex<HashMap<String, Reply>>,
    hashes: Mutex<HashMap<u64, BlockHash>>,
    headers: Mutex<HashMap<BlockHash, RpcBlockHeader>>,
    tip: Mutex<u64>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    offline: AtomicBool,
}

fn key(method: &str, params: &[Value]) -> String {
    format!("{method} {}", Value::Array(params.to_vec()))
}

impl MockNode {
    /// Answer every call to `method` with `value`.
    pub fn respond(&self, method: &str, value: Value) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Ok(value));
    }

    /// Answer `method` called with exactly `params`.
    pub fn respond_to(&self, method: &str, params: &[Value], value: Value) {
        self.replies
            .lock()
            .unwrap()
            .insert(key(method, params), Ok(value));
    }

    pub fn fail(&self, method: &str, code: i64, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Err((code, message.to_string())));
    }

    /// Every subsequent call fails with a transport error.
    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Append a block at `height` holding `txs`, served by `getblock` at
    /// verbosity 1 and 0; it becomes the tip if it is the highest so far.
    pub fn add_block(&self, height: u64, txs: &[Transaction]) -> BlockHash {
        let hash = block_hash(height);
        let mut raw = Block {
            header: bitcoin::block::Header {
                version: bitcoin::block::Version::from_consensus(0x2000_0000),
                prev_blockhash: height
                    .checked_sub(1)
                    .map_or_else(BlockHash::all_zeros, block_hash),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_700_000_000 + height as u32 * 600,
                bits: CompactTarget::from_consensus(0x1d00_ffff),
                nonce: height as u32,
            },
            txdata: txs.to_vec(),
        };
        if let Some(root) = raw.compute_merkle_root() {
            raw.header.merkle_root = root;
        }

        let header = RpcBlockHeader {
            hash: hash.to_string(),
            confirmations: 1,
            height,
            version: raw.header.version.to_consensus(),
            merkle_root: raw.header.merkle_root.to_string(),
            time: u64::from(raw.header.time),
            nonce: raw.header.nonce,
            bits: format!("{:08x}", raw.header.bits.to_consensus()),
            previous_block_hash: height.checked_sub(1).map(|h| block_hash(h).to_string()),
            next_block_hash: None,
        };

        let txids: Vec<String> = txs.iter().map(|tx| tx.compute_txid().to_string()).collect();
        let mut block = serde_json::to_value(&header).unwrap();
        block["tx"] = json!(txids);
        block["nTx"] = json!(txids.len());
        self.respond_to("getblock", &[json!(hash.to_string()), json!(1)], block);
        self.respond_to(
            "getblock",
            &[json!(hash.to_string()), json!(0)],
            json!(hex::encode(serialize(&raw))),
        );

        self.hashes.lock().unwrap().insert(height, hash);
        self.headers.lock().unwrap().insert(hash, header);
        let mut tip = self.tip.lock().unwrap();
        *tip = (*tip).max(height);
        hash
    }

    /// Make `tx` retrievable through `getrawtransaction <txid> true`.
    pub fn add_transaction(&self, tx: &Transaction, block: Option<BlockHash>, confirmations: u64) {
        let txid = tx.compute_txid().to_string();
        let mut value = json!({
            "txid": txid,
            "hex": hex::encode(serialize(tx)),
        });
        if let Some(hash) = block {
            value["blockhash"] = json!(hash.to_string());
            value["confirmations"] = json!(confirmations);
            value["blocktime"] = json!(1_700_000_000u64);
        }
        self.respond_to("getrawtransaction", &[json!(txid), json!(true)], value);
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

impl NodeClient for MockNode {
    fn get_block_hash(&self, _ctx: &RequestContext, height: u64) -> Result<BlockHash, BackendError> {
        self.check_online()?;
        self.hashes
            .lock()
            .unwrap()
            .get(&height)
            .copied()
            .ok_or(BackendError::Rpc {
                code: RPC_INVALID_PARAMETER,
                message: "Block height out of range".into(),
            })
    }

    fn get_block_header(
        &self,
        _ctx: &RequestContext,
        hash: &BlockHash,
    ) -> Result<RpcBlockHeader, BackendError> {
        self.check_online()?;
        self.headers
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or(BackendError::Rpc {
                code: RPC_INVALID_ADDRESS_OR_KEY,
                message: "Block not found".into(),
            })
    }

    fn get_block_count(&self, _ctx: &RequestContext) -> Result<u64, BackendError> {
        self.check_online()?;
        Ok(*self.tip.lock().unwrap())
    }

    fn raw_call(
        &self,
        _ctx: &RequestContext,
        method: &str,
        params: &[Value],
    ) -> Result<Value, BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.to_vec()));
        self.check_online()?;

        let replies = self.replies.lock().unwrap();
        let reply = replies
            .get(&key(method, params))
            .or_else(|| replies.get(method))
            .cloned();
        match reply {
            Some(Ok(value)) => Ok(value),
            Some(Err((code, message))) => Err(BackendError::Rpc { code, message }),
            None => match method {
                "getblock" => Err(BackendError::Rpc {
                    code: RPC_INVALID_ADDRESS_OR_KEY,
                    message: "Block not found".into(),
                }),
                "getrawtransaction" => Err(BackendError::Rpc {
                    code: RPC_INVALID_ADDRESS_OR_KEY,
                    message: "No such mempool or blockchain transaction".into(),
                }),
                _ => Err(BackendError::Rpc {
                    code: RPC_METHOD_NOT_FOUND,
                    message: "Method not found".into(),
                }),
            },
        }
    }
}

#[derive(Default)]
pub struct MockExplorer {
    utxos: Mutex<HashMap<String, Vec<ExplorerUtxo>>>,
    history: Mutex<HashMap<String, Vec<ExplorerTransaction>>>,
    offline: AtomicBool,
}

impl MockExplorer {
    pub fn set_utxos(&self, address: &str, utxos: Vec<ExplorerUtxo>) {
        self.utxos
            .lock()
            .unwrap()
            .insert(address.to_string(), utxos);
    }

    pub fn set_history(&self, address: &str, txs: Vec<ExplorerTransaction>) {
        self.history
            .lock()
            .unwrap()
            .insert(address.to_string(), txs);
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Timeout);
        }
        Ok(())
    }
}

impl ExplorerClient for MockExplorer {
    fn address_utxos(
        &self,
        _ctx: &RequestContext,
        address: &str,
    ) -> Result<Vec<ExplorerUtxo>, BackendError> {
        self.check_online()?;
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    fn address_transactions(
        &self,
        _ctx: &RequestContext,
        address: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ExplorerTransaction>, BackendError> {
        self.check_online()?;
        let all = self
            .history
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default();
        Ok(all
            .into_iter()
            .skip(page as usize * limit as usize)
            .take(limit as usize)
            .collect())
    }
}
