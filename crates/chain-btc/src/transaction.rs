use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::script::ScriptBuf;
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{Amount, FeeRate, Script, Sequence, Transaction, TxIn, TxOut, Weight, Witness};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address;
use crate::error::BtcError;
use crate::fee::output_weight;
use crate::network::BtcNetwork;
use crate::utxo::{select_utxos_for_outputs, Utxo};

/// Locking script families the builder and verifier distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockKind {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    Other,
}

pub(crate) fn lock_kind(script: &Script) -> LockKind {
    if script.is_p2pkh() {
        LockKind::P2pkh
    } else if script.is_p2sh() {
        LockKind::P2sh
    } else if script.is_p2wpkh() {
        LockKind::P2wpkh
    } else if script.is_p2wsh() {
        LockKind::P2wsh
    } else if script.is_p2tr() {
        LockKind::P2tr
    } else {
        LockKind::Other
    }
}

/// An output to spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub utxo: Utxo,
    /// Defaults to `0xfffffffd` (replaceable, locktime enabled).
    #[serde(default)]
    pub sequence: Option<u32>,
    /// Redeem script for P2SH, witness script for P2WSH.
    #[serde(default)]
    pub spend_script: Option<ScriptBuf>,
}

impl TxInput {
    pub fn new(utxo: Utxo) -> Self {
        Self {
            utxo,
            sequence: None,
            spend_script: None,
        }
    }
}

/// Where an output pays to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    Address(String),
    Script(ScriptBuf),
}

impl OutputTarget {
    /// The locking script, checking that an address belongs to `network`.
    pub fn script_pubkey(&self, network: BtcNetwork) -> Result<ScriptBuf, BtcError> {
        match self {
            OutputTarget::Address(addr) => {
                let decoded = address::decode(addr)?;
                if !decoded.is_valid_for_network(network) {
                    return Err(BtcError::InvalidAddress(format!(
                        "{addr} is not a {network} address"
                    )));
                }
                Ok(decoded.script_pubkey())
            }
            OutputTarget::Script(script) => Ok(script.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub target: OutputTarget,
    pub amount_sat: u64,
}

impl TxOutput {
    pub fn to_address(address: impl Into<String>, amount_sat: u64) -> Self {
        Self {
            target: OutputTarget::Address(address.into()),
            amount_sat,
        }
    }
}

/// A transaction with empty unlocking data, plus what a signer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    /// The outputs being spent, in input order.
    pub prevouts: Vec<TxOut>,
    /// Redeem/witness script per input, in input order.
    pub spend_scripts: Vec<Option<ScriptBuf>>,
    /// Sum of prevout values minus sum of output values.
    pub fee_sat: u64,
}

impl UnsignedTransaction {
    /// Reassemble from a decoded transaction and the outputs it spends.
    pub fn from_parts(
        tx: Transaction,
        prevouts: Vec<TxOut>,
        spend_scripts: Vec<Option<ScriptBuf>>,
    ) -> Result<Self, BtcError> {
        if prevouts.len() != tx.input.len() {
            return Err(BtcError::InvalidRequest(format!(
                "{} prevouts for {} inputs",
                prevouts.len(),
                tx.input.len()
            )));
        }
        if spend_scripts.len() != tx.input.len() {
            return Err(BtcError::InvalidRequest(format!(
                "{} spend scripts for {} inputs",
                spend_scripts.len(),
                tx.input.len()
            )));
        }
        let fee_sat = fee_of(
            prevouts.iter().map(|o| o.value.to_sat()),
            tx.output.iter().map(|o| o.value.to_sat()),
        )?;
        Ok(Self {
            tx,
            prevouts,
            spend_scripts,
            fee_sat,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(&self.tx)
    }

    pub fn weight(&self) -> Weight {
        self.tx.weight()
    }
}

fn checked_sum(mut values: impl Iterator<Item = u64>) -> Result<u64, BtcError> {
    values
        .try_fold(0u64, |acc, v| acc.checked_add(v))
        .ok_or_else(|| BtcError::InvalidRequest("amount overflow".into()))
}

fn fee_of(
    inputs: impl Iterator<Item = u64>,
    outputs: impl Iterator<Item = u64>,
) -> Result<u64, BtcError> {
    let total_in = checked_sum(inputs)?;
    let total_out = checked_sum(outputs)?;
    total_in
        .checked_sub(total_out)
        .ok_or(BtcError::InsufficientFunds {
            needed: total_out,
            available: total_in,
        })
}

/// Build an unsigned transaction spending `inputs` into `outputs`.
///
/// Inputs and outputs keep the caller's order. The fee is whatever the
/// inputs leave over. Zero-value outputs are only accepted for
/// `OP_RETURN` data carriers.
pub fn build_unsigned(
    inputs: &[TxInput],
    outputs: &[TxOutput],
    lock_time: u32,
    network: BtcNetwork,
) -> Result<UnsignedTransaction, BtcError> {
    if inputs.is_empty() {
        return Err(BtcError::InvalidRequest("transaction has no inputs".into()));
    }
    if outputs.is_empty() {
        return Err(BtcError::InvalidRequest("transaction has no outputs".into()));
    }

    let mut tx_inputs = Vec::with_capacity(inputs.len());
    let mut prevouts = Vec::with_capacity(inputs.len());
    let mut spend_scripts = Vec::with_capacity(inputs.len());
    for input in inputs {
        tx_inputs.push(TxIn {
            previous_output: input.utxo.outpoint()?,
            script_sig: ScriptBuf::new(),
            sequence: input
                .sequence
                .map(Sequence)
                .unwrap_or(Sequence::ENABLE_RBF_NO_LOCKTIME),
            witness: Witness::default(),
        });
        prevouts.push(TxOut {
            value: Amount::from_sat(input.utxo.amount_sat),
            script_pubkey: input.utxo.script_pubkey.clone(),
        });
        spend_scripts.push(input.spend_script.clone());
    }

    let mut tx_outputs = Vec::with_capacity(outputs.len());
    for (index, output) in outputs.iter().enumerate() {
        let script_pubkey = output.target.script_pubkey(network)?;
        if output.amount_sat == 0 && !script_pubkey.is_op_return() {
            return Err(BtcError::InvalidRequest(format!(
                "output {index} has zero amount"
            )));
        }
        tx_outputs.push(TxOut {
            value: Amount::from_sat(output.amount_sat),
            script_pubkey,
        });
    }

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(lock_time),
        input: tx_inputs,
        output: tx_outputs,
    };

    let unsigned = UnsignedTransaction::from_parts(tx, prevouts, spend_scripts)?;
    debug!(
        inputs = unsigned.tx.input.len(),
        outputs = unsigned.tx.output.len(),
        fee_sat = unsigned.fee_sat,
        "built unsigned transaction"
    );
    Ok(unsigned)
}

/// Select from `utxos` to pay `payments` at `fee_rate` and build the result.
///
/// Change above the dust threshold goes to `change_address` as the last
/// output.
pub fn build_payment(
    utxos: &[Utxo],
    payments: &[TxOutput],
    change_address: &str,
    fee_rate: FeeRate,
    lock_time: u32,
    network: BtcNetwork,
) -> Result<UnsignedTransaction, BtcError> {
    if payments.is_empty() {
        return Err(BtcError::InvalidRequest("payment has no outputs".into()));
    }

    let mut recipient_weight = Weight::ZERO;
    for payment in payments {
        recipient_weight += output_weight(&payment.target.script_pubkey(network)?);
    }
    let target_sat = checked_sum(payments.iter().map(|p| p.amount_sat))?;
    let change_target = OutputTarget::Address(change_address.to_string());
    change_target.script_pubkey(network)?;

    let selection = select_utxos_for_outputs(utxos, target_sat, fee_rate, recipient_weight)?;

    let inputs: Vec<TxInput> = selection.selected.into_iter().map(TxInput::new).collect();
    let mut outputs = payments.to_vec();
    if let Some(change_sat) = selection.change_sat {
        outputs.push(TxOutput {
            target: change_target,
            amount_sat: change_sat,
        });
    }

    build_unsigned(&inputs, &outputs, lock_time, network)
}

fn sighash_error(index: usize) -> impl Fn(String) -> BtcError {
    move |e| BtcError::MalformedTransaction(format!("sighash for input {index}: {e}"))
}

/// ECDSA signature hash of input `index` spending `prevout`.
///
/// P2SH and P2WSH spends need `spend_script`, which must hash to the
/// prevout's commitment. A P2SH redeem script that is itself a P2WPKH
/// program is signed as nested segwit.
pub(crate) fn ecdsa_sighash(
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    prevout: &TxOut,
    spend_script: Option<&Script>,
    sighash_type: EcdsaSighashType,
) -> Result<[u8; 32], BtcError> {
    let script = prevout.script_pubkey.as_script();
    let err = sighash_error(index);
    let hash = match lock_kind(script) {
        LockKind::P2pkh => cache
            .legacy_signature_hash(index, script, sighash_type.to_u32())
            .map_err(|e| err(e.to_string()))?
            .to_byte_array(),
        LockKind::P2wpkh => cache
            .p2wpkh_signature_hash(index, script, prevout.value, sighash_type)
            .map_err(|e| err(e.to_string()))?
            .to_byte_array(),
        LockKind::P2sh => {
            let redeem = spend_script.ok_or_else(|| {
                BtcError::InvalidRequest(format!("input {index} needs its P2SH redeem script"))
            })?;
            if ScriptBuf::new_p2sh(&redeem.script_hash()) != prevout.script_pubkey {
                return Err(BtcError::ScriptMismatch {
                    input: index,
                    reason: "redeem script does not match the P2SH hash".into(),
                });
            }
            if redeem.is_p2wpkh() {
                cache
                    .p2wpkh_signature_hash(index, redeem, prevout.value, sighash_type)
                    .map_err(|e| err(e.to_string()))?
                    .to_byte_array()
            } else {
                cache
                    .legacy_signature_hash(index, redeem, sighash_type.to_u32())
                    .map_err(|e| err(e.to_string()))?
                    .to_byte_array()
            }
        }
        LockKind::P2wsh => {
            let witness_script = spend_script.ok_or_else(|| {
                BtcError::InvalidRequest(format!("input {index} needs its P2WSH witness script"))
            })?;
            if ScriptBuf::new_p2wsh(&witness_script.wscript_hash()) != prevout.script_pubkey {
                return Err(BtcError::ScriptMismatch {
                    input: index,
                    reason: "witness script does not match the P2WSH hash".into(),
                });
            }
            cache
                .p2wsh_signature_hash(index, witness_script, prevout.value, sighash_type)
                .map_err(|e| err(e.to_string()))?
                .to_byte_array()
        }
        LockKind::P2tr | LockKind::Other => {
            return Err(BtcError::UnsupportedFormat(format!(
                "input {index} is not spent with an ECDSA signature"
            )))
        }
    };
    Ok(hash)
}

/// BIP-341 key-path signature hash of input `index`.
pub(crate) fn taproot_key_sighash(
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    prevouts: &[TxOut],
    sighash_type: TapSighashType,
) -> Result<[u8; 32], BtcError> {
    cache
        .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), sighash_type)
        .map(|h| h.to_byte_array())
        .map_err(|e| sighash_error(index)(e.to_string()))
}

/// The digest the external signer signs for each input, in input order.
///
/// ECDSA inputs use `SIGHASH_ALL`; taproot inputs the default key-path
/// sighash. Outputs without a known spend form are rejected.
pub fn signature_hashes(unsigned: &UnsignedTransaction) -> Result<Vec<[u8; 32]>, BtcError> {
    let mut cache = SighashCache::new(&unsigned.tx);
    unsigned
        .prevouts
        .iter()
        .enumerate()
        .map(|(index, prevout)| {
            if lock_kind(&prevout.script_pubkey) == LockKind::P2tr {
                taproot_key_sighash(&mut cache, index, &unsigned.prevouts, TapSighashType::Default)
            } else {
                let spend_script = unsigned.spend_scripts.get(index).and_then(|s| s.as_deref());
                ecdsa_sighash(&mut cache, index, prevout, spend_script, EcdsaSighashType::All)
            }
        })
        .collect()
}
