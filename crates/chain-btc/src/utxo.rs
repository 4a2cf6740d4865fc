use bitcoin::{FeeRate, OutPoint, ScriptBuf, Txid, Weight};
use serde::{Deserialize, Serialize};

use crate::error::BtcError;
use crate::fee::{estimate_fee, DEFAULT_OUTPUT_WU};

/// Outputs below this many satoshis are never created.
pub const DUST_THRESHOLD_SAT: u64 = 546;

/// A single unspent transaction output (UTXO).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Transaction ID as a hex string (big-endian / display order).
    pub txid: String,
    /// Output index within the transaction.
    pub vout: u32,
    /// Value in satoshis.
    pub amount_sat: u64,
    /// The locking script (scriptPubKey).
    pub script_pubkey: ScriptBuf,
    /// Zero while the funding transaction is unconfirmed.
    pub confirmations: u64,
}

impl Utxo {
    pub fn outpoint(&self) -> Result<OutPoint, BtcError> {
        let txid: Txid = self
            .txid
            .parse()
            .map_err(|e| BtcError::InvalidRequest(format!("invalid txid {}: {e}", self.txid)))?;
        Ok(OutPoint::new(txid, self.vout))
    }
}

/// Result of UTXO selection.
#[derive(Debug, Clone)]
pub struct UtxoSelection {
    /// The selected UTXOs, in selection order.
    pub selected: Vec<Utxo>,
    /// Total value of the selected UTXOs in satoshis.
    pub total_sat: u64,
    /// Fee paid, including any surplus forfeited instead of creating dust.
    pub fee_sat: u64,
    /// Change to return, `None` if it would be dust.
    pub change_sat: Option<u64>,
}

/// Select UTXOs to pay `target_sat` into a single P2WPKH-sized output.
///
/// See [`select_utxos_for_outputs`].
pub fn select_utxos(
    utxos: &[Utxo],
    target_sat: u64,
    fee_rate: FeeRate,
) -> Result<UtxoSelection, BtcError> {
    select_utxos_for_outputs(utxos, target_sat, fee_rate, Weight::from_wu(DEFAULT_OUTPUT_WU))
}

/// Select UTXOs to cover `target_sat` plus the fee.
///
/// Largest-first: UTXOs are taken in descending value order and the fee is
/// recomputed after each one. The selection stops at the first prefix that
/// either pays for the recipient outputs (`recipient_weight`) plus a change
/// output above [`DUST_THRESHOLD_SAT`], or pays for the recipient outputs
/// alone, in which case the whole surplus goes to the fee.
pub fn select_utxos_for_outputs(
    utxos: &[Utxo],
    target_sat: u64,
    fee_rate: FeeRate,
    recipient_weight: Weight,
) -> Result<UtxoSelection, BtcError> {
    let with_change = recipient_weight + Weight::from_wu(DEFAULT_OUTPUT_WU);

    // Sort by value descending (largest first).
    let mut sorted: Vec<&Utxo> = utxos.iter().collect();
    sorted.sort_by(|a, b| b.amount_sat.cmp(&a.amount_sat));

    let mut selected: Vec<Utxo> = Vec::new();
    let mut total_sat: u64 = 0;
    let mut fee = estimate_fee(std::iter::empty(), recipient_weight, fee_rate)?;

    for utxo in sorted {
        selected.push(utxo.clone());
        total_sat = total_sat
            .checked_add(utxo.amount_sat)
            .ok_or_else(|| BtcError::InvalidRequest("UTXO amounts overflow".into()))?;

        let inputs = selected.iter().map(|u| u.script_pubkey.as_script());
        let fee_with_change = estimate_fee(inputs.clone(), with_change, fee_rate)?;
        fee = estimate_fee(inputs, recipient_weight, fee_rate)?;

        let Some(surplus) = total_sat.checked_sub(target_sat) else {
            continue;
        };
        if let Some(change) = surplus.checked_sub(fee_with_change) {
            if change > DUST_THRESHOLD_SAT {
                return Ok(UtxoSelection {
                    selected,
                    total_sat,
                    fee_sat: fee_with_change,
                    change_sat: Some(change),
                });
            }
        }
        if surplus >= fee {
            return Ok(UtxoSelection {
                selected,
                total_sat,
                fee_sat: surplus,
                change_sat: None,
            });
        }
    }

    Err(BtcError::InsufficientFunds {
        needed: target_sat.saturating_add(fee),
        available: total_sat,
    })
}
