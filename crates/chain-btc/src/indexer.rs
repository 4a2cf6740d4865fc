//! Block, header and transaction retrieval from the full node.

use std::collections::HashMap;

use bitcoin::{BlockHash, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{
    BackendError, NodeClient, RpcBlockHeader, RPC_DESERIALIZATION_ERROR,
    RPC_INVALID_ADDRESS_OR_KEY, RPC_INVALID_PARAMETER, RPC_VERIFY_ALREADY_IN_CHAIN,
    RPC_VERIFY_ERROR, RPC_VERIFY_REJECTED,
};
use crate::codec::{describe_transaction, parse_transaction, parse_transaction_hex, DecodedTransaction};
use crate::context::RequestContext;
use crate::error::BtcError;
use crate::network::BtcNetwork;
use crate::rpc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    /// `None` for the genesis block.
    pub parent_hash: Option<String>,
    pub merkle_root: String,
    pub height: u64,
    pub version: i32,
    pub timestamp: u64,
    /// Compact target, hex.
    pub bits: String,
    pub nonce: u32,
    pub confirmations: i64,
}

impl From<RpcBlockHeader> for BlockHeader {
    fn from(h: RpcBlockHeader) -> Self {
        Self {
            hash: h.hash,
            parent_hash: h.previous_block_hash,
            merkle_root: h.merkle_root,
            height: h.height,
            version: h.version,
            timestamp: h.time,
            bits: h.bits,
            nonce: h.nonce,
            confirmations: h.confirmations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub tx_ids: Vec<String>,
    /// Empty unless bodies were requested.
    pub transactions: Vec<DecodedTransaction>,
}

/// A transaction with its chain position, if mined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub transaction: DecodedTransaction,
    pub block_hash: Option<String>,
    pub block_time: Option<u64>,
    pub confirmations: u64,
    /// Hex.
    pub raw: String,
}

fn parse_block_hash(hash: &str) -> Result<BlockHash, BtcError> {
    hash.parse()
        .map_err(|e| BtcError::InvalidRequest(format!("invalid block hash {hash}: {e}")))
}

fn parse_txid(txid: &str) -> Result<Txid, BtcError> {
    txid.parse()
        .map_err(|e| BtcError::InvalidRequest(format!("invalid txid {txid}: {e}")))
}

/// Maps "unknown id" RPC codes to `not_found`, everything else to
/// [`BtcError::BackendUnavailable`].
fn lookup_error(e: BackendError, codes: &[i64], not_found: impl FnOnce() -> BtcError) -> BtcError {
    match e.rpc_code() {
        Some(code) if codes.contains(&code) => not_found(),
        _ => e.into(),
    }
}

pub struct BlockIndexer<'a> {
    node: &'a dyn NodeClient,
    network: BtcNetwork,
}

impl<'a> BlockIndexer<'a> {
    pub fn new(node: &'a dyn NodeClient, network: BtcNetwork) -> Self {
        Self { node, network }
    }

    fn hash_at(&self, ctx: &RequestContext, height: u64) -> Result<BlockHash, BtcError> {
        rpc::get_block_hash(self.node, ctx, height).map_err(|e| {
            lookup_error(e, &[RPC_INVALID_PARAMETER], || {
                BtcError::BlockNotFound(format!("height {height}"))
            })
        })
    }

    pub fn block_by_height(
        &self,
        ctx: &RequestContext,
        height: u64,
        with_transactions: bool,
    ) -> Result<Block, BtcError> {
        let hash = self.hash_at(ctx, height)?;
        self.block(ctx, &hash, with_transactions)
    }

    pub fn block_by_hash(
        &self,
        ctx: &RequestContext,
        hash: &str,
        with_transactions: bool,
    ) -> Result<Block, BtcError> {
        let hash = parse_block_hash(hash)?;
        self.block(ctx, &hash, with_transactions)
    }

    fn block(
        &self,
        ctx: &RequestContext,
        hash: &BlockHash,
        with_transactions: bool,
    ) -> Result<Block, BtcError> {
        let not_found = |e| {
            lookup_error(e, &[RPC_INVALID_ADDRESS_OR_KEY], || {
                BtcError::BlockNotFound(hash.to_string())
            })
        };
        let block = rpc::get_block(self.node, ctx, hash).map_err(not_found)?;

        let transactions = if with_transactions {
            rpc::get_block_raw(self.node, ctx, hash)
                .map_err(not_found)?
                .txdata
                .iter()
                .map(|tx| describe_transaction(tx, self.network))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Block {
            header: block.header.into(),
            tx_ids: block.tx,
            transactions,
        })
    }

    /// Header at `height`; height 0 means the current tip.
    pub fn header_by_height(&self, ctx: &RequestContext, height: u64) -> Result<BlockHeader, BtcError> {
        let height = if height == 0 {
            rpc::get_block_count(self.node, ctx)?
        } else {
            height
        };
        let hash = self.hash_at(ctx, height)?;
        self.header(ctx, &hash)
    }

    pub fn header_by_hash(&self, ctx: &RequestContext, hash: &str) -> Result<BlockHeader, BtcError> {
        let hash = parse_block_hash(hash)?;
        self.header(ctx, &hash)
    }

    fn header(&self, ctx: &RequestContext, hash: &BlockHash) -> Result<BlockHeader, BtcError> {
        rpc::get_block_header(self.node, ctx, hash)
            .map(BlockHeader::from)
            .map_err(|e| {
                lookup_error(e, &[RPC_INVALID_ADDRESS_OR_KEY], || {
                    BtcError::BlockNotFound(hash.to_string())
                })
            })
    }

    fn raw_transaction(&self, ctx: &RequestContext, txid: &str) -> Result<rpc::RpcRawTransaction, BtcError> {
        parse_txid(txid)?;
        rpc::get_raw_transaction(self.node, ctx, txid).map_err(|e| {
            lookup_error(e, &[RPC_INVALID_ADDRESS_OR_KEY], || {
                BtcError::TransactionNotFound(txid.to_string())
            })
        })
    }

    pub fn transaction(&self, ctx: &RequestContext, txid: &str) -> Result<TransactionInfo, BtcError> {
        let raw = self.raw_transaction(ctx, txid)?;
        let tx = parse_transaction_hex(&raw.hex)?;
        Ok(TransactionInfo {
            transaction: describe_transaction(&tx, self.network),
            block_hash: raw.block_hash,
            block_time: raw.block_time,
            confirmations: raw.confirmations.unwrap_or(0),
            raw: raw.hex,
        })
    }

    /// The output each input of `tx` spends, in input order.
    ///
    /// Each distinct funding transaction is fetched once.
    pub fn resolve_prevouts(&self, ctx: &RequestContext, tx: &Transaction) -> Result<Vec<TxOut>, BtcError> {
        let mut funding: HashMap<Txid, Transaction> = HashMap::new();
        let mut prevouts = Vec::with_capacity(tx.input.len());

        for (index, input) in tx.input.iter().enumerate() {
            let outpoint = input.previous_output;
            if outpoint.is_null() {
                return Err(BtcError::InvalidRequest(format!(
                    "input {index} is a coinbase input"
                )));
            }
            if !funding.contains_key(&outpoint.txid) {
                let raw = self.raw_transaction(ctx, &outpoint.txid.to_string())?;
                funding.insert(outpoint.txid, parse_transaction_hex(&raw.hex)?);
            }
            let output = funding
                .get(&outpoint.txid)
                .and_then(|parent| parent.output.get(outpoint.vout as usize))
                .ok_or_else(|| {
                    BtcError::InvalidRequest(format!(
                        "input {index} spends missing output {outpoint}"
                    ))
                })?;
            prevouts.push(output.clone());
        }
        Ok(prevouts)
    }

    /// Submit a signed transaction, returning its txid.
    ///
    /// The bytes are decoded locally first, so malformed data never reaches
    /// the node.
    pub fn broadcast(&self, ctx: &RequestContext, bytes: &[u8]) -> Result<String, BtcError> {
        let tx = parse_transaction(bytes)?;
        let txid = tx.compute_txid();
        match rpc::send_raw_transaction(self.node, ctx, &hex::encode(bytes)) {
            Ok(node_txid) => {
                info!(txid = %node_txid, "transaction broadcast");
                Ok(node_txid)
            }
            Err(BackendError::Rpc { code, message })
                if matches!(
                    code,
                    RPC_VERIFY_ERROR
                        | RPC_VERIFY_REJECTED
                        | RPC_VERIFY_ALREADY_IN_CHAIN
                        | RPC_DESERIALIZATION_ERROR
                ) =>
            {
                warn!(txid = %txid, code, reason = %message, "node rejected transaction");
                Err(BtcError::BroadcastRejected(message))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNode;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, Witness};
    use serde_json::json;

    fn funding_tx(values: &[u64]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([0x99; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: values
                .iter()
                .map(|v| TxOut {
                    value: Amount::from_sat(*v),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x00, 0x14, 0x01, 0x02]),
                })
                .collect(),
        }
    }

    fn spending(outpoints: &[(Txid, u32)]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: outpoints
                .iter()
                .map(|(txid, vout)| TxIn {
                    previous_output: OutPoint::new(*txid, *vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::default(),
                })
                .collect(),
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    #[test]
    fn block_by_height_and_hash_agree() {
        let node = MockNode::default();
        let tx = funding_tx(&[5_000]);
        let txid = tx.compute_txid().to_string();
        let hash = node.add_block(120, &[tx.clone()]);
        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);
        let ctx = RequestContext::background();

        let by_height = indexer.block_by_height(&ctx, 120, false).unwrap();
        let by_hash = indexer.block_by_hash(&ctx, &hash.to_string(), false).unwrap();
        assert_eq!(by_height, by_hash);
        assert_eq!(by_height.tx_ids, vec![txid.clone()]);
        assert!(by_height.transactions.is_empty());
        assert_eq!(by_height.header.height, 120);
        assert_eq!(by_height.header.parent_hash, Some(crate::testing::block_hash(119).to_string()));

        let full = indexer.block_by_hash(&ctx, &hash.to_string(), true).unwrap();
        assert_eq!(full.transactions.len(), 1);
        assert_eq!(full.transactions[0].txid, txid);
        // Bodies come from the serialized block, not the transaction index.
        assert_eq!(node.calls_to("getrawtransaction"), 0);
    }

    #[test]
    fn block_bodies_arrive_in_one_call() {
        let node = MockNode::default();
        let txs: Vec<Transaction> = (1..=4).map(|n| funding_tx(&[n * 1_000])).collect();
        let hash = node.add_block(9, &txs);
        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);

        let block = indexer
            .block_by_hash(&RequestContext::background(), &hash.to_string(), true)
            .unwrap();
        let decoded: Vec<&str> = block.transactions.iter().map(|t| t.txid.as_str()).collect();
        assert_eq!(decoded, block.tx_ids.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(node.calls_to("getblock"), 2);
        assert_eq!(node.calls_to("getrawtransaction"), 0);
    }

    #[test]
    fn undecodable_raw_block_is_backend_failure() {
        let node = MockNode::default();
        let hash = node.add_block(3, &[]);
        node.respond_to("getblock", &[json!(hash.to_string()), json!(0)], json!("00ff"));
        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);
        let err = indexer
            .block_by_hash(&RequestContext::background(), &hash.to_string(), true)
            .unwrap_err();
        assert!(matches!(err, BtcError::BackendUnavailable(_)), "{err}");
    }

    #[test]
    fn unknown_height_and_hash_are_block_not_found() {
        let node = MockNode::default();
        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);
        let ctx = RequestContext::background();

        assert!(matches!(
            indexer.block_by_height(&ctx, 5, false),
            Err(BtcError::BlockNotFound(_))
        ));
        let unknown = crate::testing::block_hash(5).to_string();
        assert!(matches!(
            indexer.block_by_hash(&ctx, &unknown, false),
            Err(BtcError::BlockNotFound(_))
        ));
        assert!(matches!(
            indexer.header_by_hash(&ctx, &unknown),
            Err(BtcError::BlockNotFound(_))
        ));
        assert!(matches!(
            indexer.block_by_hash(&ctx, "xyz", false),
            Err(BtcError::InvalidRequest(_))
        ));
    }

    #[test]
    fn header_height_zero_is_tip() {
        let node = MockNode::default();
        for h in 1..=3 {
            node.add_block(h, &[]);
        }
        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);
        let ctx = RequestContext::background();

        let tip = indexer.header_by_height(&ctx, 0).unwrap();
        assert_eq!(tip.height, 3);
        assert_eq!(indexer.header_by_height(&ctx, 2).unwrap().height, 2);
        assert_eq!(
            indexer.header_by_hash(&ctx, &tip.hash).unwrap(),
            tip
        );
    }

    #[test]
    fn transaction_lookup() {
        let node = MockNode::default();
        let tx = funding_tx(&[1_000, 2_000]);
        let hash = node.add_block(7, &[]);
        node.add_transaction(&tx, Some(hash), 4);
        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);
        let ctx = RequestContext::background();

        let info = indexer.transaction(&ctx, &tx.compute_txid().to_string()).unwrap();
        assert_eq!(info.confirmations, 4);
        assert_eq!(info.block_hash, Some(hash.to_string()));
        assert_eq!(info.transaction.outputs.len(), 2);

        let missing = hex::encode([0x55; 32]);
        assert!(matches!(
            indexer.transaction(&ctx, &missing),
            Err(BtcError::TransactionNotFound(_))
        ));
    }

    #[test]
    fn prevouts_resolved_once_per_funding_tx() {
        let node = MockNode::default();
        let parent = funding_tx(&[1_000, 2_000, 3_000]);
        node.add_transaction(&parent, None, 0);
        let parent_id = parent.compute_txid();
        let child = spending(&[(parent_id, 2), (parent_id, 0)]);

        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);
        let prevouts = indexer
            .resolve_prevouts(&RequestContext::background(), &child)
            .unwrap();
        assert_eq!(prevouts[0].value.to_sat(), 3_000);
        assert_eq!(prevouts[1].value.to_sat(), 1_000);
        assert_eq!(node.calls_to("getrawtransaction"), 1);

        let bad = spending(&[(parent_id, 9)]);
        assert!(matches!(
            indexer.resolve_prevouts(&RequestContext::background(), &bad),
            Err(BtcError::InvalidRequest(_))
        ));
    }

    #[test]
    fn broadcast_maps_node_outcomes() {
        let node = MockNode::default();
        let tx = funding_tx(&[1_000]);
        let bytes = bitcoin::consensus::encode::serialize(&tx);
        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);
        let ctx = RequestContext::background();

        node.respond("sendrawtransaction", serde_json::json!(tx.compute_txid().to_string()));
        assert_eq!(
            indexer.broadcast(&ctx, &bytes).unwrap(),
            tx.compute_txid().to_string()
        );

        node.fail("sendrawtransaction", RPC_VERIFY_REJECTED, "min relay fee not met");
        assert!(matches!(
            indexer.broadcast(&ctx, &bytes),
            Err(BtcError::BroadcastRejected(ref m)) if m.contains("min relay fee")
        ));

        node.fail("sendrawtransaction", -28, "Loading block index");
        assert!(matches!(
            indexer.broadcast(&ctx, &bytes),
            Err(BtcError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn broadcast_rejects_garbage_locally() {
        let node = MockNode::default();
        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);
        let err = indexer
            .broadcast(&RequestContext::background(), &[0x01, 0x02])
            .unwrap_err();
        assert!(matches!(err, BtcError::MalformedTransaction(_)));
        assert!(node.calls().is_empty());
    }

    #[test]
    fn offline_node_is_backend_unavailable() {
        let node = MockNode::default();
        node.go_offline();
        let indexer = BlockIndexer::new(&node, BtcNetwork::Regtest);
        assert!(matches!(
            indexer.header_by_height(&RequestContext::background(), 0),
            Err(BtcError::BackendUnavailable(_))
        ));
    }
}
