//! Signature verification for the standard single-key spend types.

use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::script::Instruction;
use bitcoin::secp256k1::{Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use bitcoin::sighash::SighashCache;
use bitcoin::{ecdsa, taproot, PublicKey, Script, Transaction, TxOut};
use tracing::debug;

use crate::error::BtcError;
use crate::transaction::{ecdsa_sighash, lock_kind, taproot_key_sighash, LockKind};

/// Taproot annex marker (BIP-341).
const ANNEX_TAG: u8 = 0x50;

fn mismatch(input: usize, reason: impl Into<String>) -> BtcError {
    BtcError::ScriptMismatch {
        input,
        reason: reason.into(),
    }
}

fn invalid(input: usize, reason: impl Into<String>) -> BtcError {
    BtcError::SignatureInvalid {
        input,
        reason: reason.into(),
    }
}

/// Data pushes of a push-only script; `None` if it contains an opcode.
fn pushes(script: &Script) -> Option<Vec<&[u8]>> {
    script
        .instructions()
        .map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes()),
            _ => None,
        })
        .collect()
}

struct Verifier<'a> {
    secp: Secp256k1<VerifyOnly>,
    tx: &'a Transaction,
    prevouts: &'a [TxOut],
    cache: SighashCache<&'a Transaction>,
}

impl<'a> Verifier<'a> {
    /// `[signature, pubkey]` spend of a key committed to by `key_hash`.
    fn check_key_spend(
        &mut self,
        index: usize,
        signature: &[u8],
        public_key: &[u8],
        key_hash: &[u8],
        spend_script: Option<&Script>,
        require_compressed: bool,
    ) -> Result<(), BtcError> {
        if hash160::Hash::hash(public_key).as_byte_array()[..] != *key_hash {
            return Err(mismatch(index, "public key does not hash to the committed key hash"));
        }
        let key = PublicKey::from_slice(public_key)
            .map_err(|e| mismatch(index, format!("invalid public key: {e}")))?;
        if require_compressed && !key.compressed {
            return Err(mismatch(index, "segwit spends require a compressed key"));
        }
        let sig = ecdsa::Signature::from_slice(signature)
            .map_err(|e| invalid(index, format!("undecodable ECDSA signature: {e}")))?;

        let sighash = ecdsa_sighash(
            &mut self.cache,
            index,
            &self.prevouts[index],
            spend_script,
            sig.sighash_type,
        )?;
        self.secp
            .verify_ecdsa(&Message::from_digest(sighash), &sig.signature, &key.inner)
            .map_err(|e| invalid(index, format!("ecdsa verification failed: {e}")))
    }

    fn check_input(&mut self, index: usize) -> Result<(), BtcError> {
        let (tx, prevouts) = (self.tx, self.prevouts);
        let input = &tx.input[index];
        let prevout_script = prevouts[index].script_pubkey.as_script();
        let witness: Vec<&[u8]> = input.witness.iter().collect();

        match lock_kind(prevout_script) {
            LockKind::P2pkh => {
                let items = pushes(&input.script_sig)
                    .ok_or_else(|| mismatch(index, "scriptSig is not push-only"))?;
                let &[signature, public_key] = items.as_slice() else {
                    return Err(mismatch(index, "P2PKH scriptSig must push a signature and a key"));
                };
                let key_hash = &prevout_script.as_bytes()[3..23];
                self.check_key_spend(index, signature, public_key, key_hash, None, false)
            }
            LockKind::P2wpkh => {
                if !input.script_sig.is_empty() {
                    return Err(mismatch(index, "native segwit input has a scriptSig"));
                }
                let &[signature, public_key] = witness.as_slice() else {
                    return Err(mismatch(index, "P2WPKH witness must hold a signature and a key"));
                };
                let key_hash = &prevout_script.as_bytes()[2..22];
                self.check_key_spend(index, signature, public_key, key_hash, None, true)
            }
            LockKind::P2sh => {
                let items = pushes(&input.script_sig)
                    .ok_or_else(|| mismatch(index, "scriptSig is not push-only"))?;
                let Some(&redeem_bytes) = items.last() else {
                    return Err(mismatch(index, "P2SH scriptSig is empty"));
                };
                let script_hash = &prevout_script.as_bytes()[2..22];
                if hash160::Hash::hash(redeem_bytes).as_byte_array()[..] != *script_hash {
                    return Err(mismatch(index, "redeem script does not match the P2SH hash"));
                }
                let redeem = Script::from_bytes(redeem_bytes);
                if !redeem.is_p2wpkh() || items.len() != 1 {
                    return Err(BtcError::UnsupportedFormat(format!(
                        "input {index}: P2SH script spends need a script interpreter"
                    )));
                }
                let &[signature, public_key] = witness.as_slice() else {
                    return Err(mismatch(index, "P2SH-P2WPKH witness must hold a signature and a key"));
                };
                let key_hash = &redeem.as_bytes()[2..22];
                self.check_key_spend(index, signature, public_key, key_hash, Some(redeem), true)
            }
            LockKind::P2wsh => {
                let Some(&witness_script) = witness.last() else {
                    return Err(mismatch(index, "P2WSH witness is empty"));
                };
                if sha256::Hash::hash(witness_script).as_byte_array()[..]
                    != prevout_script.as_bytes()[2..34]
                {
                    return Err(mismatch(index, "witness script does not match the P2WSH hash"));
                }
                Err(BtcError::UnsupportedFormat(format!(
                    "input {index}: P2WSH spends need a script interpreter"
                )))
            }
            LockKind::P2tr => {
                if !input.script_sig.is_empty() {
                    return Err(mismatch(index, "taproot input has a scriptSig"));
                }
                if witness.len() >= 2 && witness.last().is_some_and(|w| w.first() == Some(&ANNEX_TAG)) {
                    return Err(BtcError::UnsupportedFormat(format!(
                        "input {index}: taproot annex is not supported"
                    )));
                }
                let &[signature] = witness.as_slice() else {
                    return Err(BtcError::UnsupportedFormat(format!(
                        "input {index}: tapscript spends need a script interpreter"
                    )));
                };
                let output_key = XOnlyPublicKey::from_slice(&prevout_script.as_bytes()[2..34])
                    .map_err(|e| mismatch(index, format!("invalid taproot output key: {e}")))?;
                let sig = taproot::Signature::from_slice(signature)
                    .map_err(|e| invalid(index, format!("undecodable schnorr signature: {e}")))?;
                let sighash =
                    taproot_key_sighash(&mut self.cache, index, self.prevouts, sig.sighash_type)?;
                self.secp
                    .verify_schnorr(&sig.signature, &Message::from_digest(sighash), &output_key)
                    .map_err(|e| invalid(index, format!("schnorr verification failed: {e}")))
            }
            LockKind::Other => Err(BtcError::UnsupportedFormat(format!(
                "input {index}: non-standard locking script"
            ))),
        }
    }
}

/// Check every input's unlocking data against the output it spends.
///
/// `prevouts` must be in input order. Supports P2PKH, P2WPKH,
/// P2SH-P2WPKH and taproot key-path spends; anything needing a script
/// interpreter is [`BtcError::UnsupportedFormat`].
pub fn verify(tx: &Transaction, prevouts: &[TxOut]) -> Result<(), BtcError> {
    if tx.input.is_empty() {
        return Err(BtcError::MalformedTransaction("transaction has no inputs".into()));
    }
    if prevouts.len() != tx.input.len() {
        return Err(BtcError::InvalidRequest(format!(
            "{} prevouts for {} inputs",
            prevouts.len(),
            tx.input.len()
        )));
    }

    let mut verifier = Verifier {
        secp: Secp256k1::verification_only(),
        tx,
        prevouts,
        cache: SighashCache::new(tx),
    };
    for index in 0..tx.input.len() {
        verifier.check_input(index)?;
    }
    debug!(txid = %tx.compute_txid(), inputs = tx.input.len(), "transaction signatures verified");
    Ok(())
}
