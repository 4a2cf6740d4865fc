//! Bitcoin chain adaptor.
//!
//! [`ChainAdaptor`] routes each external operation to the `chain_btc` core
//! and wraps the outcome in an [`Envelope`]. It is the only layer that turns
//! typed errors into status/message responses.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

use std::sync::Arc;

use bitcoin::{Amount, FeeRate, ScriptBuf, TxOut};
use chain_btc::address::{self, AddressFormat, BtcAddress};
use chain_btc::backend::{ExplorerClient, NodeClient};
use chain_btc::codec::{
    self, assemble, parse_transaction_hex, proof_from_signature, DecodedTransaction,
};
use chain_btc::context::RequestContext;
use chain_btc::error::BtcError;
use chain_btc::fee::FeeEstimator;
use chain_btc::index::UtxoIndex;
use chain_btc::indexer::{Block, BlockHeader, BlockIndexer, TransactionInfo};
use chain_btc::transaction::{
    build_payment, build_unsigned, signature_hashes, OutputTarget, TxInput, TxOutput,
    UnsignedTransaction,
};
use chain_btc::utxo::Utxo;
use chain_btc::verify::verify;
use tracing::{debug, error};

use config::AdaptorConfig;
use error::AdaptorError;
use types::*;

/// Chain name accepted by [`ChainAdaptor::get_support_chains`].
pub const CHAIN_NAME: &str = "Bitcoin";

/// Page size for address history when the request leaves it at 0.
const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 200;

pub struct ChainAdaptor {
    node: Arc<dyn NodeClient>,
    explorer: Arc<dyn ExplorerClient>,
    config: AdaptorConfig,
}

impl ChainAdaptor {
    /// Fails if `config` does not validate.
    pub fn new(
        node: Arc<dyn NodeClient>,
        explorer: Arc<dyn ExplorerClient>,
        config: AdaptorConfig,
    ) -> Result<Self, AdaptorError> {
        config.validate().map_err(AdaptorError::Validation)?;
        Ok(Self {
            node,
            explorer,
            config,
        })
    }

    pub fn config(&self) -> &AdaptorConfig {
        &self.config
    }

    /// A fresh context bounded by the configured request timeout.
    pub fn context(&self) -> RequestContext {
        RequestContext::with_timeout(self.config.request_timeout())
    }

    fn indexer(&self) -> BlockIndexer<'_> {
        BlockIndexer::new(self.node.as_ref(), self.config.network)
    }

    fn utxo_index(&self) -> UtxoIndex<'_> {
        UtxoIndex::new(self.node.as_ref(), self.explorer.as_ref())
    }

    fn fee_estimator(&self) -> FeeEstimator<'_> {
        FeeEstimator::new(self.node.as_ref(), self.config.fee_floor())
    }

    /// Decode `address` and require it to belong to the configured network.
    fn checked_address(&self, address: &str) -> Result<BtcAddress, BtcError> {
        let decoded = address::decode(address)?;
        if !decoded.is_valid_for_network(self.config.network) {
            return Err(BtcError::InvalidAddress(format!(
                "{address} is not a {} address",
                self.config.network
            )));
        }
        Ok(decoded)
    }

    // ─── Chain and address operations ────────────────────────────────

    pub fn get_support_chains(&self, req: &SupportChainsRequest) -> Envelope<SupportChainsResponse> {
        let chain_ok =
            req.chain.eq_ignore_ascii_case(CHAIN_NAME) || req.chain.eq_ignore_ascii_case("btc");
        let network_ok = req.network.is_empty()
            || req
                .network
                .parse::<chain_btc::network::BtcNetwork>()
                .is_ok_and(|n| n == self.config.network);
        let support = chain_ok && network_ok;
        let msg = if support {
            "Support this chain"
        } else {
            "Unsupported chain"
        };
        Envelope::success(msg, SupportChainsResponse { support })
    }

    pub fn convert_address(&self, req: &ConvertAddressRequest) -> Envelope<ConvertAddressResponse> {
        let result = req.format.parse::<AddressFormat>().and_then(|format| {
            address::convert_address(&req.public_key, format, self.config.network)
        });
        respond(
            "convert address",
            result.map(|address| ConvertAddressResponse {
                address: address.encode(),
            }),
        )
    }

    /// An unknown `format` is an error; a malformed address is `valid: false`.
    pub fn valid_address(&self, req: &ValidAddressRequest) -> Envelope<ValidAddressResponse> {
        let result = req.format.parse::<AddressFormat>().map(|format| ValidAddressResponse {
            valid: address::validate_address(&req.address, format, self.config.network),
        });
        respond("valid address", result)
    }

    // ─── Fee and account operations ──────────────────────────────────

    pub fn get_fee(&self, ctx: &RequestContext, req: &FeeRequest) -> Envelope<FeeResponse> {
        let target = req
            .target_blocks
            .unwrap_or(self.config.fee.default_target_blocks);
        let result = self.fee_estimator().estimate(ctx, target).map(|est| FeeResponse {
            sat_per_vb: est.sat_per_vb(),
            sat_per_kwu: est.fee_rate.to_sat_per_kwu(),
            target_blocks: est.target_blocks,
            source: est.source,
        });
        respond("get fee", result)
    }

    pub fn get_account(&self, ctx: &RequestContext, req: &AccountRequest) -> Envelope<AccountResponse> {
        respond("get account", self.account(ctx, req))
    }

    fn account(&self, ctx: &RequestContext, req: &AccountRequest) -> Result<AccountResponse, BtcError> {
        let address = self.checked_address(&req.address)?.encode();
        let balance = self.utxo_index().balance(ctx, &address)?;
        Ok(AccountResponse {
            address,
            confirmed_sat: balance.confirmed_sat,
            unconfirmed_sat: balance.unconfirmed_sat,
            total_sat: balance.total_sat(),
        })
    }

    pub fn get_unspent_outputs(
        &self,
        ctx: &RequestContext,
        req: &UnspentOutputsRequest,
    ) -> Envelope<UnspentOutputsResponse> {
        let result = self
            .checked_address(&req.address)
            .and_then(|address| self.utxo_index().list_unspent(ctx, &address.encode()))
            .map(|utxos| UnspentOutputsResponse {
                utxos: utxos.into_iter().map(unspent_output).collect(),
            });
        respond("get unspent outputs", result)
    }

    // ─── Block operations ────────────────────────────────────────────

    pub fn get_block_by_number(&self, ctx: &RequestContext, req: &BlockNumberRequest) -> Envelope<Block> {
        let result = self
            .indexer()
            .block_by_height(ctx, req.height, req.with_transactions);
        respond("get block by number", result)
    }

    pub fn get_block_by_hash(&self, ctx: &RequestContext, req: &BlockHashRequest) -> Envelope<Block> {
        let result = self
            .indexer()
            .block_by_hash(ctx, &req.hash, req.with_transactions);
        respond("get block by hash", result)
    }

    pub fn get_block_header_by_number(
        &self,
        ctx: &RequestContext,
        req: &BlockHeaderNumberRequest,
    ) -> Envelope<BlockHeader> {
        respond(
            "get block header",
            self.indexer().header_by_height(ctx, req.height),
        )
    }

    pub fn get_block_header_by_hash(
        &self,
        ctx: &RequestContext,
        req: &BlockHeaderHashRequest,
    ) -> Envelope<BlockHeader> {
        respond("get block header", self.indexer().header_by_hash(ctx, &req.hash))
    }

    // ─── Transaction lookup and broadcast ────────────────────────────

    pub fn send_tx(&self, ctx: &RequestContext, req: &SendTxRequest) -> Envelope<SendTxResponse> {
        let result = raw_bytes(&req.raw_tx)
            .and_then(|bytes| self.indexer().broadcast(ctx, &bytes))
            .map(|txid| SendTxResponse { txid });
        respond("send tx", result)
    }

    pub fn get_tx_by_address(
        &self,
        ctx: &RequestContext,
        req: &TxAddressRequest,
    ) -> Envelope<TxAddressResponse> {
        respond("get tx by address", self.address_history(ctx, req))
    }

    fn address_history(
        &self,
        ctx: &RequestContext,
        req: &TxAddressRequest,
    ) -> Result<TxAddressResponse, BtcError> {
        let address = self.checked_address(&req.address)?.encode();
        let limit = match req.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        ctx.check()?;
        let transactions = self
            .explorer
            .address_transactions(ctx, &address, req.page, limit)?;
        debug!(address = %address, page = req.page, count = transactions.len(), "fetched address history");
        Ok(TxAddressResponse { transactions })
    }

    pub fn get_tx_by_hash(&self, ctx: &RequestContext, req: &TxHashRequest) -> Envelope<TransactionInfo> {
        respond("get tx by hash", self.indexer().transaction(ctx, &req.hash))
    }

    // ─── Transaction lifecycle ───────────────────────────────────────

    /// Explicit `inputs` are spent as given. Otherwise the UTXOs of
    /// `from_address` are selected to cover the outputs, with change back to
    /// `change_address` (or `from_address`).
    pub fn create_unsigned_transaction(
        &self,
        ctx: &RequestContext,
        req: &UnsignedTransactionRequest,
    ) -> Envelope<UnsignedTransactionResponse> {
        respond(
            "create unsigned transaction",
            self.create_unsigned(ctx, req),
        )
    }

    fn create_unsigned(
        &self,
        ctx: &RequestContext,
        req: &UnsignedTransactionRequest,
    ) -> Result<UnsignedTransactionResponse, BtcError> {
        let network = self.config.network;
        let outputs = req
            .outputs
            .iter()
            .map(output_from_spec)
            .collect::<Result<Vec<_>, _>>()?;

        let unsigned = if req.inputs.is_empty() {
            let from = req.from_address.as_deref().ok_or_else(|| {
                BtcError::InvalidRequest("either inputs or from_address is required".into())
            })?;
            let from = self.checked_address(from)?.encode();
            let change = req.change_address.as_deref().unwrap_or(&from);
            let fee_rate = self.request_fee_rate(ctx, req.fee_rate_sat_per_vb)?;
            let utxos = self.utxo_index().list_unspent(ctx, &from)?;
            build_payment(&utxos, &outputs, change, fee_rate, req.lock_time, network)?
        } else {
            let inputs = req
                .inputs
                .iter()
                .map(|spec| self.input_from_spec(spec))
                .collect::<Result<Vec<_>, _>>()?;
            build_unsigned(&inputs, &outputs, req.lock_time, network)?
        };

        let sign_hashes = signature_hashes(&unsigned)?
            .iter()
            .map(hex::encode)
            .collect();
        let prevouts = unsigned
            .prevouts
            .iter()
            .zip(&unsigned.spend_scripts)
            .map(|(prevout, spend_script)| PrevoutSpec {
                amount_sat: prevout.value.to_sat(),
                script_pubkey: hex::encode(prevout.script_pubkey.as_bytes()),
                spend_script: spend_script.as_ref().map(|s| hex::encode(s.as_bytes())),
            })
            .collect();

        Ok(UnsignedTransactionResponse {
            unsigned_tx: hex::encode(unsigned.to_bytes()),
            txid: unsigned.tx.compute_txid().to_string(),
            fee_sat: unsigned.fee_sat,
            sign_hashes,
            prevouts,
        })
    }

    /// The caller's rate (never below the floor) or a node estimate for the
    /// default target.
    fn request_fee_rate(&self, ctx: &RequestContext, sat_per_vb: Option<u64>) -> Result<FeeRate, BtcError> {
        match sat_per_vb {
            Some(rate) => FeeRate::from_sat_per_vb(rate)
                .map(|r| r.max(self.config.fee_floor()))
                .ok_or_else(|| BtcError::InvalidRequest(format!("fee rate {rate} sat/vB overflows"))),
            None => Ok(self
                .fee_estimator()
                .estimate(ctx, self.config.fee.default_target_blocks)?
                .fee_rate),
        }
    }

    fn input_from_spec(&self, spec: &InputSpec) -> Result<TxInput, BtcError> {
        let script_pubkey = match (&spec.script_pubkey, &spec.address) {
            (Some(script), _) => ScriptBuf::from_bytes(hex_field("script_pubkey", script)?),
            (None, Some(address)) => self.checked_address(address)?.script_pubkey(),
            (None, None) => {
                return Err(BtcError::InvalidRequest(format!(
                    "input {}:{} needs script_pubkey or address",
                    spec.txid, spec.vout
                )))
            }
        };
        let spend_script = spec
            .spend_script
            .as_deref()
            .map(|s| hex_field("spend_script", s).map(ScriptBuf::from_bytes))
            .transpose()?;
        Ok(TxInput {
            utxo: Utxo {
                txid: spec.txid.clone(),
                vout: spec.vout,
                amount_sat: spec.amount_sat,
                script_pubkey,
                confirmations: 0,
            },
            sequence: spec.sequence,
            spend_script,
        })
    }

    /// Attach one signature per input and check the result before
    /// returning it.
    pub fn build_signed_transaction(
        &self,
        ctx: &RequestContext,
        req: &SignedTransactionRequest,
    ) -> Envelope<SignedTransactionResponse> {
        respond("build signed transaction", self.build_signed(ctx, req))
    }

    fn build_signed(
        &self,
        ctx: &RequestContext,
        req: &SignedTransactionRequest,
    ) -> Result<SignedTransactionResponse, BtcError> {
        let tx = parse_transaction_hex(&req.unsigned_tx)?;
        let (prevouts, spend_scripts) = match &req.prevouts {
            Some(specs) => prevouts_from_specs(specs)?,
            None => {
                let prevouts = self.indexer().resolve_prevouts(ctx, &tx)?;
                let spend_scripts = vec![None; prevouts.len()];
                (prevouts, spend_scripts)
            }
        };
        let unsigned = UnsignedTransaction::from_parts(tx, prevouts, spend_scripts)?;

        if req.signatures.len() != unsigned.tx.input.len() {
            return Err(BtcError::InvalidRequest(format!(
                "{} signatures for {} inputs",
                req.signatures.len(),
                unsigned.tx.input.len()
            )));
        }

        let proofs = req
            .signatures
            .iter()
            .zip(unsigned.prevouts.iter().zip(&unsigned.spend_scripts))
            .map(|(sig, (prevout, spend_script))| {
                let signature = hex_field("signature", &sig.signature)?;
                let public_key = sig
                    .public_key
                    .as_deref()
                    .map(|k| hex_field("public_key", k))
                    .transpose()?;
                proof_from_signature(
                    &prevout.script_pubkey,
                    spend_script.as_deref(),
                    &signature,
                    public_key.as_deref(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let signed = assemble(&unsigned, proofs)?;
        verify(&signed.tx, &unsigned.prevouts)?;

        Ok(SignedTransactionResponse {
            signed_tx: signed.to_hex(),
            txid: signed.txid(),
        })
    }

    pub fn decode_transaction(&self, req: &DecodeTransactionRequest) -> Envelope<DecodedTransaction> {
        let result = raw_bytes(&req.raw_tx)
            .and_then(|bytes| codec::decode_transaction(&bytes, self.config.network));
        respond("decode transaction", result)
    }

    /// A failed check is an error envelope carrying the failure kind, never
    /// `verified: false` with a success code.
    pub fn verify_signed_transaction(
        &self,
        ctx: &RequestContext,
        req: &VerifyTransactionRequest,
    ) -> Envelope<VerifyTransactionResponse> {
        respond("verify signed transaction", self.verify_signed(ctx, req))
    }

    fn verify_signed(
        &self,
        ctx: &RequestContext,
        req: &VerifyTransactionRequest,
    ) -> Result<VerifyTransactionResponse, BtcError> {
        let tx = parse_transaction_hex(&req.raw_tx)?;
        let prevouts = match &req.prevouts {
            Some(specs) => prevouts_from_specs(specs)?.0,
            None => self.indexer().resolve_prevouts(ctx, &tx)?,
        };
        verify(&tx, &prevouts)?;
        Ok(VerifyTransactionResponse { verified: true })
    }
}

/// Wrap `result` in an envelope, logging failures.
fn respond<T>(operation: &'static str, result: Result<T, BtcError>) -> Envelope<T> {
    match result {
        Ok(payload) => Envelope::success(format!("{operation} success"), payload),
        Err(e) => {
            error!(operation, kind = ?e.kind(), error = %e, "request failed");
            Envelope::failure(&e)
        }
    }
}

fn hex_field(field: &str, value: &str) -> Result<Vec<u8>, BtcError> {
    hex::decode(value.trim())
        .map_err(|e| BtcError::InvalidRequest(format!("{field} is not valid hex: {e}")))
}

fn raw_bytes(raw_tx: &str) -> Result<Vec<u8>, BtcError> {
    hex::decode(raw_tx.trim())
        .map_err(|e| BtcError::MalformedTransaction(format!("invalid hex: {e}")))
}

fn output_from_spec(spec: &OutputSpec) -> Result<TxOutput, BtcError> {
    let target = match (&spec.address, &spec.script) {
        (Some(address), None) => OutputTarget::Address(address.clone()),
        (None, Some(script)) => OutputTarget::Script(ScriptBuf::from_bytes(hex_field("script", script)?)),
        _ => {
            return Err(BtcError::InvalidRequest(
                "each output needs exactly one of address or script".into(),
            ))
        }
    };
    Ok(TxOutput {
        target,
        amount_sat: spec.amount_sat,
    })
}

fn prevouts_from_specs(specs: &[PrevoutSpec]) -> Result<(Vec<TxOut>, Vec<Option<ScriptBuf>>), BtcError> {
    let mut prevouts = Vec::with_capacity(specs.len());
    let mut spend_scripts = Vec::with_capacity(specs.len());
    for spec in specs {
        prevouts.push(TxOut {
            value: Amount::from_sat(spec.amount_sat),
            script_pubkey: ScriptBuf::from_bytes(hex_field("script_pubkey", &spec.script_pubkey)?),
        });
        spend_scripts.push(
            spec.spend_script
                .as_deref()
                .map(|s| hex_field("spend_script", s).map(ScriptBuf::from_bytes))
                .transpose()?,
        );
    }
    Ok((prevouts, spend_scripts))
}

fn unspent_output(utxo: Utxo) -> UnspentOutput {
    UnspentOutput {
        script_pubkey: hex::encode(utxo.script_pubkey.as_bytes()),
        txid: utxo.txid,
        vout: utxo.vout,
        amount_sat: utxo.amount_sat,
        confirmations: utxo.confirmations,
    }
}
