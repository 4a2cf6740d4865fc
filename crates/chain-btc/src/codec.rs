//! Raw transaction decoding and signed-transaction assembly.

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::ecdsa::Signature as EcdsaSignature;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{ecdsa, taproot, Script, ScriptBuf, Transaction, Witness};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::{AddressFormat, BtcAddress};
use crate::error::BtcError;
use crate::network::BtcNetwork;
use crate::transaction::{lock_kind, LockKind, UnsignedTransaction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedInput {
    pub prev_txid: String,
    pub prev_vout: u32,
    pub sequence: u32,
    /// Hex.
    pub script_sig: String,
    /// Hex-encoded witness stack items.
    pub witness: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedOutput {
    pub amount_sat: u64,
    /// Hex.
    pub script_pubkey: String,
    /// Present when the script has a standard address form.
    pub address: Option<String>,
    pub format: Option<AddressFormat>,
}

/// Human-readable view of a raw transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    pub txid: String,
    pub wtxid: String,
    pub version: i32,
    pub lock_time: u32,
    /// Serialized size in bytes, witness included.
    pub size: usize,
    pub vsize: usize,
    pub weight: u64,
    pub segwit: bool,
    pub inputs: Vec<DecodedInput>,
    pub outputs: Vec<DecodedOutput>,
}

/// Parse consensus-encoded transaction bytes, legacy or segwit.
///
/// Truncated data, bad length prefixes and trailing bytes are all
/// [`BtcError::MalformedTransaction`].
pub fn parse_transaction(bytes: &[u8]) -> Result<Transaction, BtcError> {
    if bytes.is_empty() {
        return Err(BtcError::MalformedTransaction("empty input".into()));
    }
    deserialize(bytes).map_err(|e| BtcError::MalformedTransaction(e.to_string()))
}

pub fn parse_transaction_hex(tx_hex: &str) -> Result<Transaction, BtcError> {
    let bytes = hex::decode(tx_hex.trim())
        .map_err(|e| BtcError::MalformedTransaction(format!("invalid hex: {e}")))?;
    parse_transaction(&bytes)
}

pub fn describe_transaction(tx: &Transaction, network: BtcNetwork) -> DecodedTransaction {
    let inputs = tx
        .input
        .iter()
        .map(|input| DecodedInput {
            prev_txid: input.previous_output.txid.to_string(),
            prev_vout: input.previous_output.vout,
            sequence: input.sequence.0,
            script_sig: hex::encode(input.script_sig.as_bytes()),
            witness: input.witness.iter().map(hex::encode).collect(),
        })
        .collect();

    let outputs = tx
        .output
        .iter()
        .map(|output| {
            let address = BtcAddress::from_script(&output.script_pubkey, network).ok();
            DecodedOutput {
                amount_sat: output.value.to_sat(),
                script_pubkey: hex::encode(output.script_pubkey.as_bytes()),
                format: address.as_ref().map(BtcAddress::format),
                address: address.map(|a| a.encode()),
            }
        })
        .collect();

    DecodedTransaction {
        txid: tx.compute_txid().to_string(),
        wtxid: tx.compute_wtxid().to_string(),
        version: tx.version.0,
        lock_time: tx.lock_time.to_consensus_u32(),
        size: tx.total_size(),
        vsize: tx.vsize(),
        weight: tx.weight().to_wu(),
        segwit: tx.input.iter().any(|i| !i.witness.is_empty()),
        inputs,
        outputs,
    }
}

pub fn decode_transaction(bytes: &[u8], network: BtcNetwork) -> Result<DecodedTransaction, BtcError> {
    let tx = parse_transaction(bytes)?;
    Ok(describe_transaction(&tx, network))
}

/// Unlocking data for one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockingProof {
    ScriptSig(ScriptBuf),
    Witness(Vec<Vec<u8>>),
    /// P2SH-wrapped segwit: redeem script push plus witness.
    Nested {
        script_sig: ScriptBuf,
        witness: Vec<Vec<u8>>,
    },
}

/// A fully signed transaction and its consensus encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub bytes: Vec<u8>,
}

impl SignedTransaction {
    pub fn txid(&self) -> String {
        self.tx.compute_txid().to_string()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

/// Attach one unlocking proof per input.
///
/// The result is serialized with the segwit marker iff some input carries
/// a witness.
pub fn assemble(
    unsigned: &UnsignedTransaction,
    proofs: Vec<UnlockingProof>,
) -> Result<SignedTransaction, BtcError> {
    if proofs.len() != unsigned.tx.input.len() {
        return Err(BtcError::InvalidRequest(format!(
            "{} unlocking proofs for {} inputs",
            proofs.len(),
            unsigned.tx.input.len()
        )));
    }

    let mut tx = unsigned.tx.clone();
    for (input, proof) in tx.input.iter_mut().zip(proofs) {
        let (script_sig, witness) = match proof {
            UnlockingProof::ScriptSig(script) => (script, Witness::new()),
            UnlockingProof::Witness(stack) => (ScriptBuf::new(), Witness::from_slice(&stack)),
            UnlockingProof::Nested {
                script_sig,
                witness,
            } => (script_sig, Witness::from_slice(&witness)),
        };
        input.script_sig = script_sig;
        input.witness = witness;
    }

    let bytes = serialize(&tx);
    debug!(txid = %tx.compute_txid(), size = bytes.len(), "assembled signed transaction");
    Ok(SignedTransaction { tx, bytes })
}

fn push_script(items: &[&[u8]]) -> Result<ScriptBuf, BtcError> {
    let mut builder = Builder::new();
    for item in items {
        let push = PushBytesBuf::try_from(item.to_vec())
            .map_err(|e| BtcError::InvalidRequest(format!("script push too large: {e}")))?;
        builder = builder.push_slice(push);
    }
    Ok(builder.into_script())
}

/// Normalize an ECDSA signature to DER plus sighash byte.
///
/// Accepts bare DER (`SIGHASH_ALL` is appended), DER with a trailing
/// sighash byte, or 64-byte compact `r || s`.
fn ecdsa_signature_bytes(signature: &[u8]) -> Result<Vec<u8>, BtcError> {
    if let Ok(sig) = EcdsaSignature::from_der(signature) {
        return Ok(ecdsa::Signature::sighash_all(sig).to_vec());
    }
    if let Ok(sig) = ecdsa::Signature::from_slice(signature) {
        return Ok(sig.to_vec());
    }
    if signature.len() == 64 {
        if let Ok(sig) = EcdsaSignature::from_compact(signature) {
            return Ok(ecdsa::Signature {
                signature: sig,
                sighash_type: EcdsaSighashType::All,
            }
            .to_vec());
        }
    }
    Err(BtcError::InvalidRequest(
        "signature is neither DER nor compact ECDSA".into(),
    ))
}

fn require_public_key(public_key: Option<&[u8]>, compressed: bool) -> Result<&[u8], BtcError> {
    let key = public_key
        .ok_or_else(|| BtcError::InvalidRequest("public key required for ECDSA spend".into()))?;
    match key.len() {
        33 => Ok(key),
        65 if !compressed => Ok(key),
        n => Err(BtcError::InvalidRequest(format!(
            "unexpected public key length {n}"
        ))),
    }
}

/// Build the unlocking proof for a single-signature spend of `prevout_script`.
///
/// `spend_script` is the P2SH redeem script; only a P2WPKH redeem script
/// (nested segwit) has a single-signature proof. Taproot takes the 64 or 65
/// byte Schnorr signature and no key.
pub fn proof_from_signature(
    prevout_script: &Script,
    spend_script: Option<&Script>,
    signature: &[u8],
    public_key: Option<&[u8]>,
) -> Result<UnlockingProof, BtcError> {
    match lock_kind(prevout_script) {
        LockKind::P2pkh => {
            let key = require_public_key(public_key, false)?;
            let sig = ecdsa_signature_bytes(signature)?;
            Ok(UnlockingProof::ScriptSig(push_script(&[sig.as_slice(), key])?))
        }
        LockKind::P2wpkh => {
            let key = require_public_key(public_key, true)?;
            let sig = ecdsa_signature_bytes(signature)?;
            Ok(UnlockingProof::Witness(vec![sig, key.to_vec()]))
        }
        LockKind::P2sh => {
            let redeem = spend_script.ok_or_else(|| {
                BtcError::InvalidRequest("P2SH spend needs its redeem script".into())
            })?;
            if !redeem.is_p2wpkh() {
                return Err(BtcError::UnsupportedFormat(
                    "only P2SH-wrapped P2WPKH has a single-signature proof".into(),
                ));
            }
            let key = require_public_key(public_key, true)?;
            let sig = ecdsa_signature_bytes(signature)?;
            Ok(UnlockingProof::Nested {
                script_sig: push_script(&[redeem.as_bytes()])?,
                witness: vec![sig, key.to_vec()],
            })
        }
        LockKind::P2tr => {
            let sig = taproot::Signature::from_slice(signature)
                .map_err(|e| BtcError::InvalidRequest(format!("invalid schnorr signature: {e}")))?;
            Ok(UnlockingProof::Witness(vec![sig.to_vec()]))
        }
        LockKind::P2wsh | LockKind::Other => Err(BtcError::UnsupportedFormat(
            "script spends need a script interpreter".into(),
        )),
    }
}
