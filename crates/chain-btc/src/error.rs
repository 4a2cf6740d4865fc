use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bitcoin chain operation errors.
#[derive(Debug, Error)]
pub enum BtcError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(
        "insufficient funds: need {needed} sat, have {available} sat (short by {} sat)",
        needed.saturating_sub(*available)
    )]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("signature invalid on input {input}: {reason}")]
    SignatureInvalid { input: usize, reason: String },

    #[error("script mismatch on input {input}: {reason}")]
    ScriptMismatch { input: usize, reason: String },

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Flat discriminant of [`BtcError`], stable across the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidAddress,
    InsufficientFunds,
    MalformedTransaction,
    SignatureInvalid,
    ScriptMismatch,
    BlockNotFound,
    TransactionNotFound,
    BackendUnavailable,
    UnsupportedFormat,
    BroadcastRejected,
    InvalidRequest,
}

impl BtcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BtcError::InvalidAddress(_) => ErrorKind::InvalidAddress,
            BtcError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            BtcError::MalformedTransaction(_) => ErrorKind::MalformedTransaction,
            BtcError::SignatureInvalid { .. } => ErrorKind::SignatureInvalid,
            BtcError::ScriptMismatch { .. } => ErrorKind::ScriptMismatch,
            BtcError::BlockNotFound(_) => ErrorKind::BlockNotFound,
            BtcError::TransactionNotFound(_) => ErrorKind::TransactionNotFound,
            BtcError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            BtcError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            BtcError::BroadcastRejected(_) => ErrorKind::BroadcastRejected,
            BtcError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}
