//! Transaction weight estimates and fee-rate estimation.

use bitcoin::{Amount, FeeRate, Script, Weight};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{BackendError, NodeClient};
use crate::context::RequestContext;
use crate::error::BtcError;
use crate::rpc;

/// Version + locktime + input/output counts (10 bytes) and the segwit
/// marker/flag, in weight units.
const TX_OVERHEAD_WU: u64 = 44;

/// Outpoint + empty scriptSig + sequence (41 bytes) plus a ~27 vbyte witness.
const P2WPKH_INPUT_WU: u64 = 272;
/// P2WPKH spend behind a 23-byte redeem script push.
const P2SH_P2WPKH_INPUT_WU: u64 = 364;
/// Key-path spend: 41 bytes plus a 64-byte Schnorr signature.
const P2TR_INPUT_WU: u64 = 230;
/// 148 bytes: DER signature + compressed key in scriptSig. Also used for
/// script types whose spend size is unknown.
const P2PKH_INPUT_WU: u64 = 592;

/// A P2WPKH output (31 bytes); used for change.
pub const DEFAULT_OUTPUT_WU: u64 = 124;

/// Largest confirmation target Bitcoin Core estimates for.
const MAX_TARGET_BLOCKS: u16 = 1008;

/// Estimated weight of spending an output locked by `script_pubkey`.
pub fn input_weight(script_pubkey: &Script) -> Weight {
    let wu = if script_pubkey.is_p2pkh() {
        P2PKH_INPUT_WU
    } else if script_pubkey.is_p2sh() {
        P2SH_P2WPKH_INPUT_WU
    } else if script_pubkey.is_p2wpkh() {
        P2WPKH_INPUT_WU
    } else if script_pubkey.is_p2tr() {
        P2TR_INPUT_WU
    } else {
        P2PKH_INPUT_WU
    };
    Weight::from_wu(wu)
}

/// Weight of an output carrying `script_pubkey`: amount, length prefix and script.
pub fn output_weight(script_pubkey: &Script) -> Weight {
    let len = script_pubkey.len() as u64;
    let prefix = if len < 0xfd { 1 } else { 3 };
    Weight::from_wu((8 + prefix + len) * 4)
}

/// Estimated weight of a transaction spending `inputs` into outputs of
/// combined weight `outputs`.
pub fn estimate_weight<'a>(inputs: impl IntoIterator<Item = &'a Script>, outputs: Weight) -> Weight {
    let inputs: u64 = inputs.into_iter().map(|s| input_weight(s).to_wu()).sum();
    Weight::from_wu(TX_OVERHEAD_WU + inputs + outputs.to_wu())
}

/// Fee in satoshis for `weight` at `fee_rate`, rounded up. Fails when the
/// product does not fit in a `u64`.
pub fn fee_for_weight(weight: Weight, fee_rate: FeeRate) -> Result<u64, BtcError> {
    fee_rate
        .fee_wu(weight)
        .map(Amount::to_sat)
        .ok_or_else(|| {
            BtcError::InvalidRequest(format!(
                "fee for {} wu at {} sat/kwu overflows",
                weight.to_wu(),
                fee_rate.to_sat_per_kwu()
            ))
        })
}

/// Fee for spending `inputs` into outputs of combined weight `outputs`.
pub fn estimate_fee<'a>(
    inputs: impl IntoIterator<Item = &'a Script>,
    outputs: Weight,
    fee_rate: FeeRate,
) -> Result<u64, BtcError> {
    fee_for_weight(estimate_weight(inputs, outputs), fee_rate)
}

/// Where a fee estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeSource {
    SmartFee,
    BlockStats,
    Floor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    pub fee_rate: FeeRate,
    pub target_blocks: u16,
    pub source: FeeSource,
}

impl FeeEstimate {
    pub fn sat_per_vb(&self) -> u64 {
        self.fee_rate.to_sat_per_vb_ceil()
    }
}

/// Derives a fee rate from the node, never below the configured floor.
pub struct FeeEstimator<'a> {
    node: &'a dyn NodeClient,
    floor: FeeRate,
}

impl<'a> FeeEstimator<'a> {
    /// The floor is raised to the 1 sat/vB relay minimum if set lower.
    pub fn new(node: &'a dyn NodeClient, floor: FeeRate) -> Self {
        Self {
            node,
            floor: floor.max(FeeRate::BROADCAST_MIN),
        }
    }

    pub fn floor(&self) -> FeeRate {
        self.floor
    }

    /// Estimate a fee rate for confirmation within `target_blocks`.
    ///
    /// Tries `estimatesmartfee`, then the tip block's fee-rate percentiles,
    /// then the floor. RPC-level refusals fall through to the next source;
    /// transport failures and cancellation propagate.
    pub fn estimate(&self, ctx: &RequestContext, target_blocks: u16) -> Result<FeeEstimate, BtcError> {
        let target = target_blocks.clamp(1, MAX_TARGET_BLOCKS);

        match rpc::estimate_smart_fee(self.node, ctx, target) {
            Ok(resp) => {
                if let Some(rate) = resp.fee_rate_btc_kvb.and_then(btc_per_kvb_to_rate) {
                    return Ok(self.clamp(rate, resp.blocks.unwrap_or(target), FeeSource::SmartFee));
                }
                debug!(target_blocks = target, errors = ?resp.errors, "node has no smart fee estimate");
            }
            Err(e) => fallthrough_or_fail(e, "estimatesmartfee")?,
        }

        match self.block_stats_rate(ctx, target) {
            Ok(Some(rate)) => return Ok(self.clamp(rate, target, FeeSource::BlockStats)),
            Ok(None) => debug!(target_blocks = target, "tip block has no fee-rate percentiles"),
            Err(e) => fallthrough_or_fail(e, "getblockstats")?,
        }

        Ok(FeeEstimate {
            fee_rate: self.floor,
            target_blocks: target,
            source: FeeSource::Floor,
        })
    }

    fn block_stats_rate(&self, ctx: &RequestContext, target: u16) -> Result<Option<FeeRate>, BackendError> {
        let tip = rpc::get_block_count(self.node, ctx)?;
        let stats = rpc::get_block_stats(self.node, ctx, tip)?;
        // p75 for the next couple of blocks, median within the hour, p25 beyond.
        let idx = match target {
            0..=2 => 3,
            3..=6 => 2,
            _ => 1,
        };
        Ok(stats
            .feerate_percentiles
            .get(idx)
            .copied()
            .filter(|sat_vb| *sat_vb > 0)
            .and_then(FeeRate::from_sat_per_vb))
    }

    fn clamp(&self, rate: FeeRate, target_blocks: u16, source: FeeSource) -> FeeEstimate {
        FeeEstimate {
            fee_rate: rate.max(self.floor),
            target_blocks,
            source,
        }
    }
}

fn btc_per_kvb_to_rate(btc_kvb: f64) -> Option<FeeRate> {
    let sat_kvb = Amount::from_btc(btc_kvb).ok()?.to_sat();
    // 1 kvB = 4 kwu
    let sat_kwu = sat_kvb / 4;
    (sat_kwu > 0).then(|| FeeRate::from_sat_per_kwu(sat_kwu))
}

fn fallthrough_or_fail(e: BackendError, method: &str) -> Result<(), BtcError> {
    match e {
        BackendError::Rpc { .. } | BackendError::Decode(_) => {
            warn!(method, error = %e, "fee source unavailable, falling back");
            Ok(())
        }
        other => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNode;
    use bitcoin::ScriptBuf;
    use serde_json::json;

    fn p2wpkh_script() -> ScriptBuf {
        ScriptBuf::from_bytes([vec![0x00, 0x14], vec![0xab; 20]].concat())
    }

    #[test]
    fn p2wpkh_weights_match_known_vsize() {
        // 1 input, 2 outputs: 11 + 68 + 62 = 141 vbytes
        let script = p2wpkh_script();
        let weight = estimate_weight([script.as_script()], Weight::from_wu(2 * DEFAULT_OUTPUT_WU));
        assert_eq!(weight.to_wu(), 141 * 4);
        assert_eq!(output_weight(&script).to_wu(), DEFAULT_OUTPUT_WU);
    }

    #[test]
    fn fee_scales_with_inputs() {
        let script = p2wpkh_script();
        let rate = FeeRate::from_sat_per_vb(10).unwrap();
        let outputs = Weight::from_wu(2 * DEFAULT_OUTPUT_WU);
        let fee_1 = estimate_fee([script.as_script()], outputs, rate).unwrap();
        let fee_2 = estimate_fee([script.as_script(), script.as_script()], outputs, rate).unwrap();
        assert_eq!(fee_1, 1410);
        assert_eq!(fee_2 - fee_1, 680);
    }

    #[test]
    fn fee_rounds_up() {
        // 836 wu at 239 sat/kwu = 199.804 sat
        assert_eq!(
            fee_for_weight(Weight::from_wu(836), FeeRate::from_sat_per_kwu(239)).unwrap(),
            200
        );
    }

    #[test]
    fn fee_overflow_is_an_error() {
        let rate = FeeRate::from_sat_per_vb(70_000_000_000_000_000).unwrap();
        let err = estimate_fee([p2wpkh_script().as_script()], Weight::from_wu(DEFAULT_OUTPUT_WU), rate)
            .unwrap_err();
        assert!(matches!(err, BtcError::InvalidRequest(_)), "{err}");
        assert!(fee_for_weight(Weight::MAX, FeeRate::from_sat_per_kwu(2)).is_err());
    }

    #[test]
    fn taproot_inputs_weigh_least() {
        let p2tr = ScriptBuf::from_bytes([vec![0x51, 0x20], vec![0xcd; 32]].concat());
        assert_eq!(input_weight(&p2tr).to_wu(), P2TR_INPUT_WU);
        assert!(input_weight(&p2tr) < input_weight(&p2wpkh_script()));
    }

    #[test]
    fn legacy_inputs_weigh_more() {
        let p2pkh = ScriptBuf::from_bytes(
            [vec![0x76, 0xa9, 0x14], vec![1; 20], vec![0x88, 0xac]].concat(),
        );
        assert!(input_weight(&p2pkh) > input_weight(&p2wpkh_script()));
    }

    #[test]
    fn smart_fee_is_preferred() {
        let node = MockNode::default();
        // 0.0002 BTC/kvB = 20 sat/vB
        node.respond("estimatesmartfee", json!({"feerate": 0.0002, "blocks": 2}));
        let est = FeeEstimator::new(&node, FeeRate::BROADCAST_MIN)
            .estimate(&RequestContext::background(), 2)
            .unwrap();
        assert_eq!(est.source, FeeSource::SmartFee);
        assert_eq!(est.sat_per_vb(), 20);
        assert_eq!(est.target_blocks, 2);
        assert_eq!(node.calls_to("getblockstats"), 0);
    }

    #[test]
    fn falls_back_to_block_stats() {
        let node = MockNode::default();
        node.add_block(500, &[]);
        node.respond(
            "estimatesmartfee",
            json!({"errors": ["Insufficient data or no feerate found"], "blocks": 0}),
        );
        node.respond("getblockstats", json!({"feerate_percentiles": [2, 4, 8, 16, 32]}));
        let est = FeeEstimator::new(&node, FeeRate::BROADCAST_MIN)
            .estimate(&RequestContext::background(), 6)
            .unwrap();
        assert_eq!(est.source, FeeSource::BlockStats);
        assert_eq!(est.sat_per_vb(), 8);
    }

    #[test]
    fn falls_back_to_floor_when_node_cannot_estimate() {
        let node = MockNode::default();
        node.fail("estimatesmartfee", -32601, "Method not found");
        let floor = FeeRate::from_sat_per_vb(3).unwrap();
        let est = FeeEstimator::new(&node, floor)
            .estimate(&RequestContext::background(), 6)
            .unwrap();
        assert_eq!(est.source, FeeSource::Floor);
        assert_eq!(est.fee_rate, floor);
    }

    #[test]
    fn estimate_never_below_floor() {
        let node = MockNode::default();
        node.respond("estimatesmartfee", json!({"feerate": 0.00001, "blocks": 1}));
        let floor = FeeRate::from_sat_per_vb(5).unwrap();
        let est = FeeEstimator::new(&node, floor)
            .estimate(&RequestContext::background(), 1)
            .unwrap();
        assert_eq!(est.fee_rate, floor);
    }

    #[test]
    fn zero_floor_is_raised_to_relay_minimum() {
        let node = MockNode::default();
        let estimator = FeeEstimator::new(&node, FeeRate::ZERO);
        assert_eq!(estimator.floor(), FeeRate::BROADCAST_MIN);
        node.fail("estimatesmartfee", -32601, "Method not found");
        let est = estimator.estimate(&RequestContext::background(), 3).unwrap();
        assert!(est.fee_rate > FeeRate::ZERO);
    }

    #[test]
    fn transport_failure_propagates() {
        let node = MockNode::default();
        node.go_offline();
        let err = FeeEstimator::new(&node, FeeRate::BROADCAST_MIN)
            .estimate(&RequestContext::background(), 3)
            .unwrap_err();
        assert!(matches!(err, BtcError::BackendUnavailable(_)));
    }
}
