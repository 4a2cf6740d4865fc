//! Address-indexed UTXO lookup over the node and explorer backends.

use std::collections::HashSet;

use bitcoin::{Amount, ScriptBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::{self, BtcAddress};
use crate::backend::{BackendError, ExplorerClient, NodeClient, RPC_METHOD_NOT_FOUND};
use crate::context::RequestContext;
use crate::error::BtcError;
use crate::rpc;
use crate::utxo::Utxo;

/// A backend able to list the unspent outputs of an address.
pub trait UtxoSource {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when this backend keeps no index for addresses.
    fn unspent(
        &self,
        ctx: &RequestContext,
        address: &BtcAddress,
    ) -> Result<Option<Vec<Utxo>>, BackendError>;
}

/// UTXOs from the node's `scantxoutset`.
pub struct NodeUtxoSource<'a> {
    node: &'a dyn NodeClient,
}

impl<'a> NodeUtxoSource<'a> {
    pub fn new(node: &'a dyn NodeClient) -> Self {
        Self { node }
    }
}

impl UtxoSource for NodeUtxoSource<'_> {
    fn name(&self) -> &'static str {
        "node"
    }

    fn unspent(
        &self,
        ctx: &RequestContext,
        address: &BtcAddress,
    ) -> Result<Option<Vec<Utxo>>, BackendError> {
        let scan = match rpc::scan_tx_out_set(self.node, ctx, &address.encode()) {
            Ok(scan) => scan,
            Err(e) if e.rpc_code() == Some(RPC_METHOD_NOT_FOUND) => return Ok(None),
            Err(e) => return Err(e),
        };

        scan.unspents
            .into_iter()
            .map(|u| {
                let amount = Amount::from_btc(u.amount)
                    .map_err(|e| BackendError::Decode(format!("scantxoutset amount: {e}")))?;
                let script = hex::decode(&u.script_pubkey)
                    .map_err(|e| BackendError::Decode(format!("scantxoutset script: {e}")))?;
                let confirmations = if u.height == 0 {
                    0
                } else {
                    scan.height.saturating_sub(u.height) + 1
                };
                Ok(Utxo {
                    txid: u.txid,
                    vout: u.vout,
                    amount_sat: amount.to_sat(),
                    script_pubkey: ScriptBuf::from_bytes(script),
                    confirmations,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// UTXOs from the explorer's address index.
pub struct ExplorerUtxoSource<'a> {
    explorer: &'a dyn ExplorerClient,
}

impl<'a> ExplorerUtxoSource<'a> {
    pub fn new(explorer: &'a dyn ExplorerClient) -> Self {
        Self { explorer }
    }
}

impl UtxoSource for ExplorerUtxoSource<'_> {
    fn name(&self) -> &'static str {
        "explorer"
    }

    fn unspent(
        &self,
        ctx: &RequestContext,
        address: &BtcAddress,
    ) -> Result<Option<Vec<Utxo>>, BackendError> {
        rpc::ensure_live(ctx)?;
        let owner_script = address.script_pubkey();
        self.explorer
            .address_utxos(ctx, &address.encode())?
            .into_iter()
            .map(|u| {
                let script_pubkey = match u.script_pubkey {
                    Some(hex_script) => ScriptBuf::from_bytes(
                        hex::decode(&hex_script)
                            .map_err(|e| BackendError::Decode(format!("explorer script: {e}")))?,
                    ),
                    None => owner_script.clone(),
                };
                Ok(Utxo {
                    txid: u.txid,
                    vout: u.vout,
                    amount_sat: u.amount_sat,
                    script_pubkey,
                    confirmations: u.confirmations,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// Confirmed and unconfirmed totals for an address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed_sat: u64,
    pub unconfirmed_sat: u64,
}

impl Balance {
    /// Saturates; balances built by [`UtxoIndex::balance`] never do.
    pub fn total_sat(&self) -> u64 {
        self.confirmed_sat.saturating_add(self.unconfirmed_sat)
    }
}

/// Merges the unspent outputs reported by a primary and a fallback source.
///
/// Both are queried. The primary's outputs come first and win on duplicate
/// `(txid, vout)`; outputs only the fallback reports (the primary may lag in
/// indexing) are appended. One source failing yields the other's result; both
/// failing is [`BtcError::BackendUnavailable`].
pub struct UtxoIndex<'a> {
    primary: Box<dyn UtxoSource + 'a>,
    fallback: Box<dyn UtxoSource + 'a>,
}

impl<'a> UtxoIndex<'a> {
    /// Node first, explorer as fallback.
    pub fn new(node: &'a dyn NodeClient, explorer: &'a dyn ExplorerClient) -> Self {
        Self::with_sources(
            Box::new(NodeUtxoSource::new(node)),
            Box::new(ExplorerUtxoSource::new(explorer)),
        )
    }

    pub fn with_sources(
        primary: Box<dyn UtxoSource + 'a>,
        fallback: Box<dyn UtxoSource + 'a>,
    ) -> Self {
        Self { primary, fallback }
    }

    pub fn list_unspent(&self, ctx: &RequestContext, address: &str) -> Result<Vec<Utxo>, BtcError> {
        let address = address::decode(address)?;
        ctx.check()?;

        let primary = self.primary.unspent(ctx, &address);
        let fallback = self.fallback.unspent(ctx, &address);

        let (primary, fallback) = match (primary, fallback) {
            (Err(p), Err(f)) => {
                return Err(BtcError::BackendUnavailable(format!(
                    "{}: {p}; {}: {f}",
                    self.primary.name(),
                    self.fallback.name()
                )))
            }
            (Err(e), Ok(f)) => {
                warn!(source = self.primary.name(), error = %e, address = %address, "utxo source failed, using partial result");
                (None, f)
            }
            (Ok(p), Err(e)) => {
                warn!(source = self.fallback.name(), error = %e, address = %address, "utxo source failed, using partial result");
                (p, None)
            }
            (Ok(p), Ok(f)) => (p, f),
        };

        if primary.is_none() && fallback.is_none() {
            return Err(BtcError::BackendUnavailable(
                "no backend indexes unspent outputs by address".into(),
            ));
        }

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let mut from_fallback = 0usize;
        for utxo in primary.into_iter().flatten() {
            if seen.insert((utxo.txid.clone(), utxo.vout)) {
                merged.push(utxo);
            }
        }
        for utxo in fallback.into_iter().flatten() {
            if seen.insert((utxo.txid.clone(), utxo.vout)) {
                from_fallback += 1;
                merged.push(utxo);
            }
        }

        debug!(address = %address, count = merged.len(), from_fallback, "listed unspent outputs");
        Ok(merged)
    }

    /// Fails with [`BtcError::BackendUnavailable`] when the reported amounts
    /// do not fit in a `u64`.
    pub fn balance(&self, ctx: &RequestContext, address: &str) -> Result<Balance, BtcError> {
        let overflow = || {
            BtcError::BackendUnavailable(format!("inconsistent amounts reported for {address}"))
        };
        let mut balance = Balance::default();
        for u in self.list_unspent(ctx, address)? {
            let bucket = if u.confirmations > 0 {
                &mut balance.confirmed_sat
            } else {
                &mut balance.unconfirmed_sat
            };
            *bucket = bucket.checked_add(u.amount_sat).ok_or_else(overflow)?;
        }
        balance
            .confirmed_sat
            .checked_add(balance.unconfirmed_sat)
            .ok_or_else(overflow)?;
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExplorerUtxo;
    use crate::testing::{MockExplorer, MockNode};
    use serde_json::json;
    use std::time::Duration;

    const ADDR: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
    const SCRIPT: &str = "0014751e76e8199196d454941c45d1b3a323f1433bd6";

    fn txid(b: u8) -> String {
        hex::encode([b; 32])
    }

    fn node_with(unspents: serde_json::Value) -> MockNode {
        let node = MockNode::default();
        node.respond(
            "scantxoutset",
            json!({"success": true, "height": 800_000, "unspents": unspents}),
        );
        node
    }

    fn explorer_utxo(b: u8, vout: u32, amount_sat: u64, confirmations: u64) -> ExplorerUtxo {
        ExplorerUtxo {
            txid: txid(b),
            vout,
            amount_sat,
            script_pubkey: None,
            confirmations,
        }
    }

    #[test]
    fn node_result_wins_and_explorer_only_outputs_are_appended() {
        let node = node_with(json!([
            {"txid": txid(1), "vout": 0, "scriptPubKey": SCRIPT, "amount": 0.0005, "height": 799_991},
        ]));
        let explorer = MockExplorer::default();
        explorer.set_utxos(
            ADDR,
            vec![explorer_utxo(1, 0, 1, 3), explorer_utxo(2, 1, 7_000, 0)],
        );

        let index = UtxoIndex::new(&node, &explorer);
        let utxos = index.list_unspent(&RequestContext::background(), ADDR).unwrap();

        assert_eq!(utxos.len(), 2);
        assert_eq!(utxos[0].txid, txid(1));
        assert_eq!(utxos[0].amount_sat, 50_000);
        assert_eq!(utxos[0].confirmations, 10);
        assert_eq!(utxos[1].txid, txid(2));
        assert_eq!(utxos[1].script_pubkey.to_hex_string(), SCRIPT);
    }

    #[test]
    fn falls_back_to_explorer_without_node_index() {
        let node = MockNode::default();
        let explorer = MockExplorer::default();
        explorer.set_utxos(ADDR, vec![explorer_utxo(3, 0, 9_000, 2)]);

        let utxos = UtxoIndex::new(&node, &explorer)
            .list_unspent(&RequestContext::background(), ADDR)
            .unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].amount_sat, 9_000);
    }

    #[test]
    fn explorer_outage_keeps_node_result() {
        let node = node_with(json!([
            {"txid": txid(1), "vout": 0, "scriptPubKey": SCRIPT, "amount": 0.0001, "height": 0},
        ]));
        let explorer = MockExplorer::default();
        explorer.go_offline();

        let utxos = UtxoIndex::new(&node, &explorer)
            .list_unspent(&RequestContext::background(), ADDR)
            .unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].confirmations, 0);
    }

    #[test]
    fn both_backends_down_is_unavailable() {
        let node = MockNode::default();
        node.go_offline();
        let explorer = MockExplorer::default();
        explorer.go_offline();

        let err = UtxoIndex::new(&node, &explorer)
            .list_unspent(&RequestContext::background(), ADDR)
            .unwrap_err();
        assert!(matches!(err, BtcError::BackendUnavailable(ref m) if m.contains("node") && m.contains("explorer")));
    }

    #[test]
    fn undecodable_address_is_invalid() {
        let node = MockNode::default();
        let explorer = MockExplorer::default();
        let err = UtxoIndex::new(&node, &explorer)
            .list_unspent(&RequestContext::background(), "not-an-address")
            .unwrap_err();
        assert!(matches!(err, BtcError::InvalidAddress(_)));
        assert!(node.calls().is_empty());
    }

    #[test]
    fn balance_splits_confirmed_and_unconfirmed() {
        let node = node_with(json!([
            {"txid": txid(1), "vout": 0, "scriptPubKey": SCRIPT, "amount": 0.001, "height": 799_000},
            {"txid": txid(2), "vout": 0, "scriptPubKey": SCRIPT, "amount": 0.0002, "height": 0},
        ]));
        let explorer = MockExplorer::default();
        explorer.set_utxos(ADDR, vec![explorer_utxo(4, 0, 5_000, 0)]);

        let balance = UtxoIndex::new(&node, &explorer)
            .balance(&RequestContext::background(), ADDR)
            .unwrap();
        assert_eq!(balance.confirmed_sat, 100_000);
        assert_eq!(balance.unconfirmed_sat, 25_000);
        assert_eq!(balance.total_sat(), 125_000);
    }

    #[test]
    fn overflowing_amounts_are_inconsistent() {
        let huge = u64::MAX / 2 + 1;
        let node = MockNode::default();
        let explorer = MockExplorer::default();
        let index = UtxoIndex::new(&node, &explorer);

        explorer.set_utxos(ADDR, vec![explorer_utxo(1, 0, huge, 6), explorer_utxo(2, 0, huge, 6)]);
        let err = index.balance(&RequestContext::background(), ADDR).unwrap_err();
        assert!(matches!(err, BtcError::BackendUnavailable(ref m) if m.contains("inconsistent")));

        // Each bucket fits on its own; their total does not.
        explorer.set_utxos(ADDR, vec![explorer_utxo(1, 0, huge, 6), explorer_utxo(2, 0, huge, 0)]);
        let err = index.balance(&RequestContext::background(), ADDR).unwrap_err();
        assert!(matches!(err, BtcError::BackendUnavailable(_)));
    }

    #[test]
    fn explorer_source_honours_deadline() {
        let explorer = MockExplorer::default();
        explorer.set_utxos(ADDR, vec![explorer_utxo(1, 0, 1_000, 1)]);
        let address = address::decode(ADDR).unwrap();

        let expired = RequestContext::with_timeout(Duration::ZERO);
        let err = ExplorerUtxoSource::new(&explorer)
            .unspent(&expired, &address)
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout));

        let cancelled = RequestContext::background();
        cancelled.cancel();
        let err = ExplorerUtxoSource::new(&explorer)
            .unspent(&cancelled, &address)
            .unwrap_err();
        assert!(matches!(err, BackendError::Cancelled));
    }

    #[test]
    fn cancelled_request_makes_no_backend_calls() {
        let node = MockNode::default();
        let explorer = MockExplorer::default();
        let ctx = RequestContext::background();
        ctx.cancel();
        let err = UtxoIndex::new(&node, &explorer)
            .list_unspent(&ctx, ADDR)
            .unwrap_err();
        assert!(matches!(err, BtcError::BackendUnavailable(_)));
        assert!(node.calls().is_empty());
    }
}
