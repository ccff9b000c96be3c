//! Interfaces of the external collaborators the core consumes.
//!
//! Implementations live outside this crate (RPC clients, transaction
//! services, wallets). Futures are not `Send`: the core runs on one logical
//! thread and awaits collaborators cooperatively.

use crate::error::Result;
use crate::recovery::RecoveryModule;
use crate::transaction::EncodedTransaction;
use crate::types::{Account, Address, SafeTxHash};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Reads account and recovery-module state from the chain
#[async_trait(?Send)]
pub trait ChainReader {
    /// Current owners, threshold and nonce.
    ///
    /// Fails with `NetworkError` or `NotFound`.
    async fn get_account(&self, chain_id: u64, address: &Address) -> Result<Account>;

    /// Recovery modules enabled on the account with their queues
    async fn get_recovery_modules(
        &self,
        chain_id: u64,
        address: &Address,
    ) -> Result<Vec<RecoveryModule>>;
}

/// Finality status of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Submitted, not yet mined
    Pending,
    /// Mined and succeeded
    Executed,
    /// Mined and reverted
    Reverted(String),
    /// Not known to the chain yet
    NotFound,
}

/// Submits encoded transactions and reports their finality
#[async_trait(?Send)]
pub trait TransactionSubmitter {
    /// Submit for execution.
    ///
    /// Fails with `UserRejected`, `NetworkError` or `Reverted`.
    async fn submit(&self, transaction: &EncodedTransaction) -> Result<SafeTxHash>;

    /// Current finality status of a submitted transaction
    async fn status(&self, hash: &SafeTxHash) -> Result<ExecutionStatus>;
}

/// An owner signature over a transaction hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Signing owner
    pub signer: Address,
    /// Opaque signature bytes, hex encoded
    pub data: String,
}

/// Produces transaction hashes and owner signatures
#[async_trait(?Send)]
pub trait SignatureCollector {
    /// Hash identifying `transaction`
    fn transaction_hash(&self, transaction: &EncodedTransaction) -> Result<SafeTxHash>;

    /// Sign `hash` with the connected owner. Fails with `UserRejected`.
    async fn sign(&self, hash: &SafeTxHash) -> Result<Signature>;
}
