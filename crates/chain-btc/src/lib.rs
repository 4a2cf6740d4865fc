//! Bitcoin UTXO chain support for the chain adaptor.
//!
//! Address codec, UTXO index, fee estimation, coin selection, transaction
//! building/assembly/verification and block retrieval over abstract node
//! and explorer backends.

pub mod address;
pub mod backend;
pub mod codec;
pub mod context;
pub mod error;
pub mod fee;
pub mod index;
pub mod indexer;
pub mod network;
pub mod rpc;
pub mod transaction;
pub mod utxo;
pub mod verify;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
