use chain_btc::error::{BtcError, ErrorKind};
use chain_btc::fee::FeeSource;
use serde::{Deserialize, Serialize};

/// Outcome carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCode {
    Success,
    Error,
}

/// Response envelope: status, human-readable message and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: ReturnCode,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default = "Option::default")]
    pub payload: Option<T>,
}

impl<T> Envelope<T> {
    pub fn success(msg: impl Into<String>, payload: T) -> Self {
        Self {
            code: ReturnCode::Success,
            msg: msg.into(),
            error: None,
            payload: Some(payload),
        }
    }

    pub fn failure(err: &BtcError) -> Self {
        Self {
            code: ReturnCode::Error,
            msg: err.to_string(),
            error: Some(err.kind()),
            payload: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ReturnCode::Success
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportChainsRequest {
    pub chain: String,
    /// Empty means "any network".
    #[serde(default)]
    pub network: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportChainsResponse {
    pub support: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertAddressRequest {
    /// `p2pkh`, `p2sh`, `p2wpkh` or `p2tr`.
    pub format: String,
    /// Hex public key, or an address committing to a key hash.
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertAddressResponse {
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidAddressRequest {
    pub format: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidAddressResponse {
    pub valid: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRequest {
    #[serde(default)]
    pub target_blocks: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeResponse {
    pub sat_per_vb: u64,
    pub sat_per_kwu: u64,
    pub target_blocks: u16,
    pub source: FeeSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRequest {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResponse {
    pub address: String,
    pub confirmed_sat: u64,
    pub unconfirmed_sat: u64,
    pub total_sat: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutputsRequest {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub txid: String,
    pub vout: u32,
    pub amount_sat: u64,
    /// Hex.
    pub script_pubkey: String,
    pub confirmations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutputsResponse {
    pub utxos: Vec<UnspentOutput>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockNumberRequest {
    pub height: u64,
    /// Decode every transaction body instead of listing ids only.
    #[serde(default)]
    pub with_transactions: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashRequest {
    pub hash: String,
    #[serde(default)]
    pub with_transactions: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderNumberRequest {
    /// 0 selects the chain tip.
    #[serde(default)]
    pub height: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderHashRequest {
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTxRequest {
    /// Hex.
    pub raw_tx: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTxResponse {
    pub txid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAddressRequest {
    pub address: String,
    /// Zero-based.
    #[serde(default)]
    pub page: u32,
    /// 0 selects the default page size.
    #[serde(default)]
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAddressResponse {
    pub transactions: Vec<chain_btc::backend::ExplorerTransaction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHashRequest {
    pub hash: String,
}

/// An explicitly chosen input. The locking script is given directly or
/// derived from `address`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub txid: String,
    pub vout: u32,
    pub amount_sat: u64,
    #[serde(default)]
    pub script_pubkey: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub sequence: Option<u32>,
    /// Hex P2SH redeem script or P2WSH witness script.
    #[serde(default)]
    pub spend_script: Option<String>,
}

/// A payment to an address, or to a raw hex script (e.g. `OP_RETURN`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    pub amount_sat: u64,
}

/// The output an input spends, as the signer and verifier need it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrevoutSpec {
    pub amount_sat: u64,
    /// Hex.
    pub script_pubkey: String,
    #[serde(default)]
    pub spend_script: Option<String>,
}

/// Either `inputs` are given and used as-is (the fee is what they leave
/// over), or `from_address` is given and its UTXOs are selected to cover
/// `outputs` at the requested or estimated fee rate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransactionRequest {
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub from_address: Option<String>,
    pub outputs: Vec<OutputSpec>,
    /// Defaults to `from_address`.
    #[serde(default)]
    pub change_address: Option<String>,
    #[serde(default)]
    pub fee_rate_sat_per_vb: Option<u64>,
    #[serde(default)]
    pub lock_time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransactionResponse {
    /// Hex.
    pub unsigned_tx: String,
    pub txid: String,
    pub fee_sat: u64,
    /// Hex digest to sign, per input.
    pub sign_hashes: Vec<String>,
    /// Pass back unchanged when building the signed transaction.
    pub prevouts: Vec<PrevoutSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSpec {
    /// Hex. DER or compact ECDSA, or a 64/65-byte Schnorr signature.
    pub signature: String,
    /// Hex. Required for ECDSA spends.
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransactionRequest {
    pub unsigned_tx: String,
    pub signatures: Vec<SignatureSpec>,
    /// Fetched from the node when absent.
    #[serde(default)]
    pub prevouts: Option<Vec<PrevoutSpec>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransactionResponse {
    pub signed_tx: String,
    pub txid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeTransactionRequest {
    pub raw_tx: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyTransactionRequest {
    pub raw_tx: String,
    /// Fetched from the node when absent.
    #[serde(default)]
    pub prevouts: Option<Vec<PrevoutSpec>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyTransactionResponse {
    pub verified: bool,
}
