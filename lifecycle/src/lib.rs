//! Multisig Account Lifecycle Core
//!
//! This library holds the state logic behind managing a multisig account's
//! owners: planning owner-set changes as linked-list primitives, resolving
//! conflicts between pending transactions that share a nonce, tracking
//! time-gated recovery queues, and routing lifecycle events between them.
//!
//! # Features
//!
//! - **Owner-Set Mutation Planner**: minimal `swap`/`add`/`remove`/`changeThreshold` sequences
//! - **Nonce Conflict Resolver**: conflict groups, replacement and in-flight gating
//! - **Recovery Queue State Machine**: cool-down windows, gated skip/execute/cancel, reconciliation
//! - **Lifecycle Event Bus**: synchronous, snapshot-based publish/subscribe with fault isolation
//! - **Transaction Monitoring**: poll for finality with configurable timeouts
//! - **Retry Logic**: opt-in exponential backoff for transient network errors
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use safe_lifecycle::{Address, OwnerSet, planner};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let a = Address::parse("0x00000000000000000000000000000000000000aa")?;
//!     let b = Address::parse("0x00000000000000000000000000000000000000bb")?;
//!     let c = Address::parse("0x00000000000000000000000000000000000000cc")?;
//!
//!     let current = OwnerSet::new(vec![a.clone(), b.clone()], 1);
//!     let target = OwnerSet::new(vec![a, b, c], 2);
//!
//!     for operation in planner::plan(&current, &target)? {
//!         println!("{}", operation.method());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Examples
//!
//! ## Propose and execute an owner change
//!
//! ```rust,no_run
//! use safe_lifecycle::{
//!     ChainReader, LifecycleConfig, OwnerSet, SafeLifecycle, SignatureCollector,
//!     TransactionSubmitter,
//! };
//! use std::sync::Arc;
//!
//! # async fn run<R, S, C>(reader: R, submitter: S, collector: C, target: OwnerSet)
//! #     -> safe_lifecycle::Result<()>
//! # where R: ChainReader, S: TransactionSubmitter, C: SignatureCollector {
//! let account = "0x00000000000000000000000000000000000000aa".parse()?;
//! let config = Arc::new(LifecycleConfig::sepolia(account));
//! let mut lifecycle = SafeLifecycle::new(config, reader, submitter, collector)?;
//!
//! lifecycle.refresh().await?;
//! let pending = lifecycle.propose_owner_change(&target).await?;
//! let outcome = lifecycle.execute(&pending.safe_tx_hash).await?;
//! println!("{:?}", outcome.result);
//! # Ok(())
//! # }
//! ```
//!
//! ## Subscribe to lifecycle events
//!
//! ```rust,no_run
//! use safe_lifecycle::{EventBus, EventKind};
//!
//! let bus = EventBus::new();
//! let subscription = bus.subscribe(EventKind::Processed, |event| {
//!     println!("executed {}", event.subject());
//!     Ok(())
//! });
//! subscription.unsubscribe();
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod bus;
pub mod chain;
pub mod config;
pub mod conflicts;
pub mod error;
pub mod monitor;
pub mod planner;
pub mod recovery;
pub mod retry;
pub mod telemetry;
pub mod transaction;
pub mod types;

// Re-export commonly used types
pub use bus::{EventBus, EventKind, Fault, LifecycleEvent, Subscription};
pub use chain::{
    ChainReader, ExecutionStatus, Signature, SignatureCollector, TransactionSubmitter,
};
pub use config::{Chain, LifecycleConfig};
pub use conflicts::{group_by_nonce, ConflictGroup, PendingPool, PendingTransaction, TxStatus};
pub use error::{EventError, FailureKind, LifecycleError, Result};
pub use monitor::{MonitorOptions, MonitorResult, TransactionMonitor};
pub use planner::{plan, MutationOperation};
pub use recovery::{
    recovery_queue_state, ItemState, RecoveryAction, RecoveryModule, RecoveryOutcome,
    RecoveryQueueItem, RecoveryQueueMachine, RecoveryState, Resolution,
};
pub use retry::RetryStrategy;
pub use telemetry::{ReportOnce, TelemetryEvent};
pub use transaction::{EncodedTransaction, RecoveryCall, TransactionManager, TxData};
pub use types::{Account, AccountRef, Address, OwnerSet, SafeTxHash};

use chrono::Utc;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of driving a transaction to finality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Bus subject of the transaction
    pub subject: SafeTxHash,
    /// Identifier returned by the submitter
    pub receipt: SafeTxHash,
    /// Final status, or `Timeout` if tracking stopped first
    pub result: MonitorResult,
}

/// Lifecycle core for one account.
///
/// Combines the planner, pending pool, recovery machine and event bus with the
/// chain reader, submitter and signature collector. The account cache has a
/// single writer: [`SafeLifecycle::refresh`] fills it, a successful execution
/// clears it.
pub struct SafeLifecycle<R, S, C> {
    /// Configuration
    config: Arc<LifecycleConfig>,
    /// Chain reader
    reader: R,
    /// Transaction manager
    manager: TransactionManager<S, C>,
    /// Transaction monitor
    monitor: TransactionMonitor<S>,
    /// Opt-in retry for reads
    retry: RetryStrategy,
    /// Event bus
    bus: EventBus,
    /// Pending account transactions
    pool: PendingPool,
    /// Recovery queues, fed by the bus
    recovery: Rc<RefCell<RecoveryQueueMachine>>,
    subscriptions: Vec<Subscription>,
    /// Cached account state
    account: Option<Account>,
    /// Encoded account transactions by hash
    transactions: HashMap<SafeTxHash, EncodedTransaction>,
    telemetry: ReportOnce,
}

impl<R, S, C> SafeLifecycle<R, S, C>
where
    R: ChainReader,
    S: TransactionSubmitter,
    C: SignatureCollector,
{
    /// Create a new lifecycle core
    ///
    /// # Arguments
    ///
    /// * `config` - Lifecycle configuration
    /// * `reader` - Chain reader for account and recovery module state
    /// * `submitter` - Transaction submitter
    /// * `collector` - Signature collector of the connected owner
    pub fn new(
        config: Arc<LifecycleConfig>,
        reader: R,
        submitter: S,
        collector: C,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            "Initializing lifecycle core for {} on {:?}",
            config.account_ref(),
            config.chain
        );

        let bus = EventBus::new();
        let submitter = Rc::new(submitter);
        let manager = TransactionManager::new(submitter.clone(), collector, bus.clone());
        let monitor = TransactionMonitor::new(submitter, MonitorOptions::from_config(&config));
        let retry = RetryStrategy::from_config(&config);

        let recovery = Rc::new(RefCell::new(RecoveryQueueMachine::new()));
        let subscriptions = EventKind::ALL
            .iter()
            .map(|kind| {
                let machine = recovery.clone();
                bus.subscribe(*kind, move |event| {
                    machine
                        .try_borrow_mut()
                        .map_err(|_| anyhow::anyhow!("recovery machine is busy"))?
                        .handle_event(event);
                    Ok(())
                })
            })
            .collect();

        Ok(Self {
            config,
            reader,
            manager,
            monitor,
            retry,
            bus,
            pool: PendingPool::new(),
            recovery,
            subscriptions,
            account: None,
            transactions: HashMap::new(),
            telemetry: ReportOnce::new(),
        })
    }

    /// Get configuration
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Event bus shared by every component
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Transaction monitor
    pub fn monitor(&self) -> &TransactionMonitor<S> {
        &self.monitor
    }

    /// Pending account transactions
    pub fn pending_pool(&self) -> &PendingPool {
        &self.pool
    }

    async fn fetch(&self) -> Result<(Account, Vec<RecoveryModule>)> {
        let account = self.config.account_ref();
        futures::try_join!(
            self.reader.get_account(account.chain_id, &account.address),
            self.reader
                .get_recovery_modules(account.chain_id, &account.address),
        )
    }

    fn apply_refresh(&mut self, account: Account, modules: Vec<RecoveryModule>) -> &Account {
        let account_ref = self.config.account_ref();
        debug!(
            "Refreshed {}: nonce {}, {} owner(s), {} module(s)",
            account_ref,
            account.nonce,
            account.owners.len(),
            modules.len()
        );

        let pruned = self.pool.prune_executed(account.nonce);
        for hash in &pruned {
            self.transactions.remove(hash);
        }

        let mut recovery = self.recovery.borrow_mut();
        recovery.sync(&account_ref, modules);
        // Skip/cancel transactions pruned without dequeuing their item lost
        // their nonce to a sibling
        recovery.on_replaced(&pruned);
        drop(recovery);

        self.telemetry
            .report(TelemetryEvent::AccountLoaded, &account_ref);
        self.account.insert(account)
    }

    /// Re-read account and recovery module state from the chain.
    ///
    /// Transactions below the new nonce leave the pending pool and the
    /// recovery machine adopts the on-chain queues.
    pub async fn refresh(&mut self) -> Result<&Account> {
        let (account, modules) = self.fetch().await?;
        Ok(self.apply_refresh(account, modules))
    }

    /// [`SafeLifecycle::refresh`] with transient network errors retried
    pub async fn refresh_with_retry(&mut self) -> Result<&Account> {
        let strategy = self.retry.clone();
        let this = &*self;
        let (account, modules) = strategy.retry(|| this.fetch()).await?;
        Ok(self.apply_refresh(account, modules))
    }

    /// Cached account state
    pub fn account(&self) -> Result<&Account> {
        self.account.as_ref().ok_or(LifecycleError::AccountNotLoaded)
    }

    /// Plan the change from the cached owners to `target`
    pub fn plan_owner_change(&self, target: &OwnerSet) -> Result<Vec<MutationOperation>> {
        planner::plan(&self.account()?.owner_set(), target)
    }

    /// Plan, encode and propose an owner change at the next free nonce
    pub async fn propose_owner_change(
        &mut self,
        target: &OwnerSet,
    ) -> Result<PendingTransaction> {
        let account = self.account()?;
        let operations = planner::plan(&account.owner_set(), target)?;
        let nonce = self.pool.next_nonce(account.nonce);

        info!(
            "Owner change for {} needs {} operation(s) at nonce {}",
            account.address,
            operations.len(),
            nonce
        );

        let transaction =
            EncodedTransaction::owner_mutation(&account.address, nonce, operations)?;
        self.propose(transaction).await
    }

    /// Propose an account transaction and add it to the pending pool
    pub async fn propose(
        &mut self,
        transaction: EncodedTransaction,
    ) -> Result<PendingTransaction> {
        let threshold = self.account()?.threshold;
        let pending = self.manager.propose(&transaction, threshold).await?;

        self.pool.insert(pending.clone());
        self.transactions
            .insert(pending.safe_tx_hash.clone(), transaction);
        Ok(pending)
    }

    /// Add the connected owner's signature.
    ///
    /// Rejected with `StaleTransaction` or `SiblingInFlight` before any
    /// signature is requested.
    pub async fn confirm(&mut self, hash: &SafeTxHash) -> Result<PendingTransaction> {
        self.pool.ensure_actionable(hash)?;
        let signature = self.manager.confirm(hash).await?;
        self.pool.confirm(hash, signature.signer).cloned()
    }

    /// Submit a pending account transaction and wait for its outcome.
    ///
    /// Rejected with `StaleTransaction`, `SiblingInFlight` or
    /// `InsufficientConfirmations` before anything is submitted.
    ///
    /// A timeout stops local tracking only; report the outcome later with
    /// [`SafeLifecycle::record_outcome`].
    pub async fn execute(&mut self, hash: &SafeTxHash) -> Result<Execution> {
        self.pool.begin_execution(hash)?;

        let Some(transaction) = self.transactions.get(hash).cloned() else {
            self.pool.abandon(hash);
            return Err(LifecycleError::UnknownTransaction(hash.clone()));
        };
        self.submit(hash, &transaction).await
    }

    async fn submit(
        &mut self,
        subject: &SafeTxHash,
        transaction: &EncodedTransaction,
    ) -> Result<Execution> {
        let receipt = match self.manager.submit(subject, transaction).await {
            Ok(receipt) => receipt,
            Err(error) => {
                if self.pool.get(subject).is_some() {
                    match &error {
                        LifecycleError::Reverted { .. } => self.pool.mark_reverted(subject)?,
                        _ => self.pool.abandon(subject),
                    }
                }
                return Err(error);
            }
        };

        let options = self.monitor.options().clone();
        let result = match self.monitor.monitor(&receipt, &options).await {
            Ok(result) => result,
            Err(error) => {
                warn!("Lost track of {}: {}", subject, error);
                self.pool.abandon(subject);
                return Err(error);
            }
        };

        self.finish(subject, &result)?;
        Ok(Execution {
            subject: subject.clone(),
            receipt,
            result,
        })
    }

    fn finish(&mut self, subject: &SafeTxHash, result: &MonitorResult) -> Result<()> {
        match result {
            MonitorResult::Executed => {
                let replaced = if self.pool.get(subject).is_some() {
                    self.pool.mark_executed(subject)?
                } else {
                    Vec::new()
                };

                self.transactions.remove(subject);
                for hash in &replaced {
                    self.transactions.remove(hash);
                }
                if !replaced.is_empty() {
                    info!("{} replaced {} sibling(s)", subject, replaced.len());
                    self.recovery.borrow_mut().on_replaced(&replaced);
                }

                self.account = None;
                self.bus.publish(LifecycleEvent::Processed {
                    subject: subject.clone(),
                });
            }
            MonitorResult::Reverted(reason) => {
                if self.pool.get(subject).is_some() {
                    self.pool.mark_reverted(subject)?;
                }

                let error = LifecycleError::Reverted {
                    hash: subject.clone(),
                    reason: reason.clone(),
                };
                self.bus.publish(LifecycleEvent::Reverted {
                    subject: subject.clone(),
                    error: EventError::from(&error),
                });
            }
            MonitorResult::Timeout => self.pool.abandon(subject),
        }
        Ok(())
    }

    /// Apply a terminal outcome observed after local tracking stopped.
    ///
    /// An abandoned transaction can still execute on-chain and replace its
    /// siblings.
    pub fn record_outcome(&mut self, hash: &SafeTxHash, result: MonitorResult) -> Result<()> {
        if self.pool.get(hash).is_none() && !self.recovery.borrow().tracks(hash) {
            return Err(LifecycleError::UnknownTransaction(hash.clone()));
        }

        debug!("Recording outcome of {}: {:?}", hash, result);
        self.finish(hash, &result)
    }

    /// Stop tracking the in-flight execution of `hash`
    pub fn abandon(&mut self, hash: &SafeTxHash) {
        self.pool.abandon(hash);
    }

    /// Conflict groups of the pending pool, recomputed on every call
    pub fn pending_groups(&self) -> Vec<ConflictGroup> {
        self.pool.groups()
    }

    /// Whether a sibling of `hash` is executing
    pub fn will_be_replaced(&self, hash: &SafeTxHash) -> bool {
        self.pool.will_be_replaced(hash)
    }

    /// Recovery modules of the account as last synced
    pub fn recovery_modules(&self) -> Vec<RecoveryModule> {
        self.recovery
            .borrow()
            .modules_of(&self.config.account_ref())
            .into_iter()
            .cloned()
            .collect()
    }

    /// State of a recovery item now
    pub fn recovery_state(&self, module: &Address, queue_nonce: u64) -> Option<ItemState> {
        self.recovery
            .borrow()
            .item_state(module, queue_nonce, Utc::now())
    }

    /// Queue a recovery proposal on `module` as a guardian.
    ///
    /// Fails with `RecoveryInProgress` while another proposal for this account
    /// is mid-flight.
    pub async fn propose_recovery(
        &mut self,
        module: &Address,
        args: Vec<MutationOperation>,
    ) -> Result<Execution> {
        let account = self.config.account_ref();
        {
            let recovery = self.recovery.borrow();
            if let Some(hash) = recovery.proposal_in_progress(&account) {
                return Err(LifecycleError::RecoveryInProgress(hash.clone()));
            }
            if recovery.module(module).is_none() {
                return Err(LifecycleError::UnknownModule(module.clone()));
            }
        }

        let transaction = EncodedTransaction::recovery_proposal(module, args);
        let hash = self.manager.transaction_hash(&transaction)?;
        info!("Proposing recovery {} on module {}", hash, module);

        self.recovery
            .borrow_mut()
            .track_proposal(&account, hash.clone());
        self.submit(&hash, &transaction).await
    }

    async fn propose_recovery_action(
        &mut self,
        action: RecoveryAction,
    ) -> Result<PendingTransaction> {
        let nonce = self.pool.next_nonce(self.account()?.nonce);
        let transaction = EncodedTransaction::recovery_action(&action, nonce);
        let pending = self.propose(transaction).await?;

        self.recovery
            .borrow_mut()
            .track_action(pending.safe_tx_hash.clone(), action);
        Ok(pending)
    }

    /// Propose the account transaction skipping the expired head item
    pub async fn skip_expired_recovery(
        &mut self,
        module: &Address,
        queue_nonce: u64,
    ) -> Result<PendingTransaction> {
        let action = self
            .recovery
            .borrow()
            .prepare_skip(module, queue_nonce, Utc::now())?;
        self.propose_recovery_action(action).await
    }

    /// Propose the account transaction cancelling the head item
    pub async fn cancel_recovery(
        &mut self,
        module: &Address,
        queue_nonce: u64,
    ) -> Result<PendingTransaction> {
        let action = self
            .recovery
            .borrow()
            .prepare_cancel(module, queue_nonce, Utc::now())?;
        self.propose_recovery_action(action).await
    }

    /// Execute the executable head item through the module
    pub async fn execute_recovery(
        &mut self,
        module: &Address,
        queue_nonce: u64,
    ) -> Result<Execution> {
        let action = self
            .recovery
            .borrow()
            .prepare_execute(module, queue_nonce, Utc::now())?;

        let transaction = EncodedTransaction::recovery_action(&action, 0);
        let hash = self.manager.transaction_hash(&transaction)?;
        self.recovery
            .borrow_mut()
            .track_action(hash.clone(), action);
        self.submit(&hash, &transaction).await
    }

    /// Whether a recovery proposal for this account is mid-flight
    pub fn is_recovery_in_progress(&self) -> bool {
        self.recovery
            .borrow()
            .is_proposal_in_progress(&self.config.account_ref())
    }

    /// Drain recovery outcomes produced since the last call
    pub fn take_recovery_outcomes(&self) -> Vec<RecoveryOutcome> {
        self.recovery.borrow_mut().take_outcomes()
    }

    /// Record the connected wallet; a change resets report-once telemetry
    pub fn connect_wallet(&mut self, wallet: Option<Address>) {
        if self.telemetry.set_wallet(wallet.clone()) {
            debug!("Wallet changed to {:?}; telemetry flags reset", wallet);
        }
        self.recovery.borrow_mut().telemetry_mut().set_wallet(wallet);
    }
}

impl<R, S, C> Drop for SafeLifecycle<R, S, C> {
    fn drop(&mut self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }
}
