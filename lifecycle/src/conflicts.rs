//! Nonce conflict resolution.
//!
//! Pending transactions that share an account nonce are mutually exclusive:
//! at most one of them can ever execute. This module groups pending
//! transactions by nonce, computes the "will be replaced" relation while one
//! sibling is executing, and marks the losers `Replaced` once a winner
//! succeeds.

use crate::error::{LifecycleError, Result};
use crate::types::{Address, SafeTxHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle status of a pending transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    /// Collecting owner signatures
    AwaitingConfirmations,
    /// Threshold reached, ready to execute
    AwaitingExecution,
    /// Executed on-chain
    Success,
    /// Execution reverted or failed
    Failed,
    /// A sibling at the same nonce executed first
    Replaced,
}

impl TxStatus {
    /// Whether no further confirmation or execution is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Success | TxStatus::Replaced)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStatus::AwaitingConfirmations => "AWAITING_CONFIRMATIONS",
            TxStatus::AwaitingExecution => "AWAITING_EXECUTION",
            TxStatus::Success => "SUCCESS",
            TxStatus::Failed => "FAILED",
            TxStatus::Replaced => "REPLACED",
        };
        f.write_str(name)
    }
}

/// An unexecuted account transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Account nonce the transaction is bound to
    pub nonce: u64,
    /// Transaction hash
    pub safe_tx_hash: SafeTxHash,
    /// When it was proposed
    pub submitted_at: DateTime<Utc>,
    /// Owners that signed
    pub confirmations: BTreeSet<Address>,
    /// Signatures needed to execute
    pub confirmations_required: usize,
    /// Current status
    pub status: TxStatus,
}

impl PendingTransaction {
    /// Create a transaction with no confirmations
    pub fn new(
        nonce: u64,
        safe_tx_hash: SafeTxHash,
        submitted_at: DateTime<Utc>,
        confirmations_required: usize,
    ) -> Self {
        Self {
            nonce,
            safe_tx_hash,
            submitted_at,
            confirmations: BTreeSet::new(),
            confirmations_required,
            status: TxStatus::AwaitingConfirmations,
        }
    }

    /// Record a signature and update the status
    pub fn add_confirmation(&mut self, signer: Address) {
        self.confirmations.insert(signer);
        if self.status == TxStatus::AwaitingConfirmations
            && self.confirmations.len() >= self.confirmations_required
        {
            self.status = TxStatus::AwaitingExecution;
        }
    }
}

/// Pending transactions sharing one nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictGroup {
    /// Shared nonce
    pub nonce: u64,
    /// Members in first-seen order
    pub members: Vec<PendingTransaction>,
}

impl ConflictGroup {
    /// Whether `hash` is a member
    pub fn contains(&self, hash: &SafeTxHash) -> bool {
        self.member(hash).is_some()
    }

    /// Look up a member
    pub fn member(&self, hash: &SafeTxHash) -> Option<&PendingTransaction> {
        self.members.iter().find(|tx| &tx.safe_tx_hash == hash)
    }

    /// Whether more than one proposal competes for the nonce
    pub fn has_conflict(&self) -> bool {
        self.members.len() > 1
    }

    /// The member that executed, if any
    pub fn winner(&self) -> Option<&SafeTxHash> {
        self.members
            .iter()
            .find(|tx| tx.status == TxStatus::Success)
            .map(|tx| &tx.safe_tx_hash)
    }

    /// Mark `hash` executed and every sibling replaced.
    ///
    /// Returns the hashes that transitioned to `Replaced`. Repeating the call
    /// for the winner is a no-op; calling it for another member once a winner
    /// exists fails with `StaleTransaction`.
    pub fn on_executed(&mut self, hash: &SafeTxHash) -> Result<Vec<SafeTxHash>> {
        if !self.contains(hash) {
            return Err(LifecycleError::UnknownTransaction(hash.clone()));
        }

        match self.winner() {
            Some(winner) if winner == hash => return Ok(Vec::new()),
            Some(winner) => {
                warn!(
                    "Rejecting execution of {} at nonce {}: {} already won",
                    hash, self.nonce, winner
                );
                return Err(LifecycleError::StaleTransaction(hash.clone()));
            }
            None => {}
        }

        let mut replaced = Vec::new();
        for tx in &mut self.members {
            if &tx.safe_tx_hash == hash {
                tx.status = TxStatus::Success;
            } else if tx.status != TxStatus::Replaced {
                tx.status = TxStatus::Replaced;
                replaced.push(tx.safe_tx_hash.clone());
            }
        }

        if !replaced.is_empty() {
            info!(
                "Transaction {} executed at nonce {}, replacing {} sibling(s)",
                hash,
                self.nonce,
                replaced.len()
            );
        }

        Ok(replaced)
    }

    /// True if a different member of this group is currently executing
    pub fn will_be_replaced(&self, hash: &SafeTxHash, active: Option<&SafeTxHash>) -> bool {
        match active {
            Some(active) => active != hash && self.contains(active),
            None => false,
        }
    }

    /// Gate a confirmation or execution attempt on `hash`
    pub fn ensure_actionable(&self, hash: &SafeTxHash, active: Option<&SafeTxHash>) -> Result<()> {
        let tx = self
            .member(hash)
            .ok_or_else(|| LifecycleError::UnknownTransaction(hash.clone()))?;

        if tx.status.is_terminal() || self.winner().is_some() {
            return Err(LifecycleError::StaleTransaction(hash.clone()));
        }

        if let Some(active) = active.filter(|_| self.will_be_replaced(hash, active)) {
            return Err(LifecycleError::SiblingInFlight {
                hash: hash.clone(),
                active: active.clone(),
            });
        }

        Ok(())
    }
}

/// Group pending transactions by nonce, ascending, members in first-seen order
pub fn group_by_nonce(pending: &[PendingTransaction]) -> Vec<ConflictGroup> {
    let mut groups: BTreeMap<u64, Vec<PendingTransaction>> = BTreeMap::new();
    for tx in pending {
        groups.entry(tx.nonce).or_default().push(tx.clone());
    }

    groups
        .into_iter()
        .map(|(nonce, members)| ConflictGroup { nonce, members })
        .collect()
}

/// Nonces a pruned hash stays recognisable as stale after the account moves
/// past it
pub const RETIRED_NONCE_WINDOW: u64 = 64;

/// The latest known pending set of one account.
///
/// Groups are recomputed from the set on every query so decisions never act
/// on a stale grouping.
#[derive(Debug, Clone, Default)]
pub struct PendingPool {
    transactions: Vec<PendingTransaction>,
    active: Option<SafeTxHash>,
    retired: HashMap<SafeTxHash, u64>,
}

impl PendingPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction, merging confirmations if it is already known
    pub fn insert(&mut self, tx: PendingTransaction) {
        match self
            .transactions
            .iter_mut()
            .find(|existing| existing.safe_tx_hash == tx.safe_tx_hash)
        {
            Some(existing) => {
                for signer in tx.confirmations {
                    existing.add_confirmation(signer);
                }
            }
            None => {
                debug!("Tracking {} at nonce {}", tx.safe_tx_hash, tx.nonce);
                self.transactions.push(tx);
            }
        }
    }

    /// Look up a transaction
    pub fn get(&self, hash: &SafeTxHash) -> Option<&PendingTransaction> {
        self.transactions.iter().find(|tx| &tx.safe_tx_hash == hash)
    }

    /// All tracked transactions in insertion order
    pub fn transactions(&self) -> &[PendingTransaction] {
        &self.transactions
    }

    /// Transaction currently being executed
    pub fn active(&self) -> Option<&SafeTxHash> {
        self.active.as_ref()
    }

    /// Current conflict groups
    pub fn groups(&self) -> Vec<ConflictGroup> {
        group_by_nonce(&self.transactions)
    }

    fn lookup(&self, hash: &SafeTxHash) -> Result<ConflictGroup> {
        if self.retired.contains_key(hash) {
            return Err(LifecycleError::StaleTransaction(hash.clone()));
        }

        let nonce = self
            .get(hash)
            .map(|tx| tx.nonce)
            .ok_or_else(|| LifecycleError::UnknownTransaction(hash.clone()))?;

        let members = self
            .transactions
            .iter()
            .filter(|tx| tx.nonce == nonce)
            .cloned()
            .collect();
        Ok(ConflictGroup { nonce, members })
    }

    /// Conflict group containing `hash`
    pub fn group_of(&self, hash: &SafeTxHash) -> Result<ConflictGroup> {
        self.lookup(hash)
    }

    /// Whether a sibling of `hash` is currently executing
    pub fn will_be_replaced(&self, hash: &SafeTxHash) -> bool {
        self.lookup(hash)
            .map(|group| group.will_be_replaced(hash, self.active.as_ref()))
            .unwrap_or(false)
    }

    /// Check that `hash` may still be confirmed or executed
    pub fn ensure_actionable(&self, hash: &SafeTxHash) -> Result<()> {
        self.lookup(hash)?
            .ensure_actionable(hash, self.active.as_ref())
    }

    /// Record an owner signature
    pub fn confirm(&mut self, hash: &SafeTxHash, signer: Address) -> Result<&PendingTransaction> {
        self.ensure_actionable(hash)?;

        let tx = self
            .transactions
            .iter_mut()
            .find(|tx| &tx.safe_tx_hash == hash)
            .ok_or_else(|| LifecycleError::UnknownTransaction(hash.clone()))?;
        tx.add_confirmation(signer);
        debug!(
            "{} has {}/{} confirmations",
            hash,
            tx.confirmations.len(),
            tx.confirmations_required
        );
        Ok(tx)
    }

    /// Mark `hash` as the in-flight execution of its nonce.
    ///
    /// Fails with `InsufficientConfirmations` until the signature threshold
    /// is reached.
    pub fn begin_execution(&mut self, hash: &SafeTxHash) -> Result<()> {
        self.ensure_actionable(hash)?;

        if let Some(tx) = self
            .get(hash)
            .filter(|tx| tx.confirmations.len() < tx.confirmations_required)
        {
            return Err(LifecycleError::InsufficientConfirmations {
                hash: hash.clone(),
                have: tx.confirmations.len(),
                required: tx.confirmations_required,
            });
        }

        self.active = Some(hash.clone());
        Ok(())
    }

    /// Apply a successful execution; returns the replaced siblings
    pub fn mark_executed(&mut self, hash: &SafeTxHash) -> Result<Vec<SafeTxHash>> {
        let mut group = self.lookup(hash)?;
        let replaced = group.on_executed(hash)?;

        for member in group.members {
            if let Some(tx) = self
                .transactions
                .iter_mut()
                .find(|tx| tx.safe_tx_hash == member.safe_tx_hash)
            {
                tx.status = member.status;
            }
        }

        if self.active.as_ref().is_some_and(|active| {
            active == hash || replaced.contains(active)
        }) {
            self.active = None;
        }

        Ok(replaced)
    }

    /// Apply a reverted execution; siblings stay eligible
    pub fn mark_reverted(&mut self, hash: &SafeTxHash) -> Result<()> {
        let tx = self
            .transactions
            .iter_mut()
            .find(|tx| &tx.safe_tx_hash == hash)
            .ok_or_else(|| LifecycleError::UnknownTransaction(hash.clone()))?;

        if !tx.status.is_terminal() {
            tx.status = TxStatus::Failed;
        }
        if self.active.as_ref() == Some(hash) {
            self.active = None;
        }
        Ok(())
    }

    /// Stop treating `hash` as in flight without forgetting it
    pub fn abandon(&mut self, hash: &SafeTxHash) {
        if self.active.as_ref() == Some(hash) {
            debug!("Abandoning local tracking of {}", hash);
            self.active = None;
        }
    }

    /// Drop every transaction below the on-chain nonce; returns their hashes
    pub fn prune_executed(&mut self, account_nonce: u64) -> Vec<SafeTxHash> {
        let mut pruned = Vec::new();
        let mut retired = Vec::new();
        self.transactions.retain(|tx| {
            if tx.nonce < account_nonce {
                pruned.push(tx.safe_tx_hash.clone());
                retired.push((tx.safe_tx_hash.clone(), tx.nonce));
                false
            } else {
                true
            }
        });

        if self
            .active
            .as_ref()
            .is_some_and(|active| pruned.contains(active))
        {
            self.active = None;
        }
        self.retired.extend(retired);
        let floor = account_nonce.saturating_sub(RETIRED_NONCE_WINDOW);
        self.retired.retain(|_, nonce| *nonce >= floor);

        if !pruned.is_empty() {
            debug!(
                "Pruned {} transaction(s) below nonce {}",
                pruned.len(),
                account_nonce
            );
        }
        pruned
    }

    /// Recommended nonce for a new proposal
    pub fn next_nonce(&self, account_nonce: u64) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| tx.nonce >= account_nonce)
            .map(|tx| tx.nonce + 1)
            .max()
            .unwrap_or(account_nonce)
    }
}
