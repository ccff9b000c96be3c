//! Recovery queue state machine.
//!
//! A recovery module lets guardians queue owner/threshold changes behind a
//! cool-down. Each module keeps a FIFO keyed by `queue_nonce` and only ever
//! exposes its head item:
//!
//! - before `valid_from` the item is `Pending`,
//! - from `valid_from` until `expiry` it is `Executable`,
//! - from `expiry` on it is `Expired` and must be skipped before the queue can
//!   progress.
//!
//! Time-based states are derived on every query; the machine owns no timers.
//! Skip, cancel and execute are transactions in their own right, so they only
//! dequeue an item once the bus reports them `Processed` (or the chain reader
//! shows the queue nonce moved past it).
//!
//! The machine also tracks, per account, the one recovery proposal that may be
//! mid-flight. It is in progress from its `Processing` event until a terminal
//! event for it arrives or its hash shows up in an on-chain queue, whichever
//! comes first; later signals for the same hash are ignored so success is
//! reported at most once.

use crate::bus::LifecycleEvent;
use crate::error::{EventError, LifecycleError, Result};
use crate::planner::MutationOperation;
use crate::telemetry::{ReportOnce, TelemetryEvent};
use crate::types::{AccountRef, Address, SafeTxHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

/// A queued recovery proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryQueueItem {
    /// Module holding the queue
    pub module_address: Address,
    /// Hash of the proposal transaction
    pub recovery_tx_hash: SafeTxHash,
    /// Position in the module's queue
    pub queue_nonce: u64,
    /// Owner/threshold mutation applied on execution
    pub args: Vec<MutationOperation>,
    /// Start of the execution window
    pub valid_from: DateTime<Utc>,
    /// End of the execution window, if any
    pub expiry: Option<DateTime<Utc>>,
}

/// Time-derived state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecoveryState {
    /// Cool-down not over yet
    Pending,
    /// Inside the execution window
    Executable,
    /// Execution window closed
    Expired,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryState::Pending => "PENDING",
            RecoveryState::Executable => "EXECUTABLE",
            RecoveryState::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// State of `item` at `now`. Monotonic in `now`.
pub fn recovery_queue_state(item: &RecoveryQueueItem, now: DateTime<Utc>) -> RecoveryState {
    if now < item.valid_from {
        RecoveryState::Pending
    } else if item.expiry.is_some_and(|expiry| now >= expiry) {
        RecoveryState::Expired
    } else {
        RecoveryState::Executable
    }
}

/// On-chain state of a recovery module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryModule {
    /// Module address
    pub address: Address,
    /// Queue nonce of the next item to execute or skip
    pub queue_nonce: u64,
    /// Items not yet executed or skipped, in queue order
    pub queue: Vec<RecoveryQueueItem>,
}

impl RecoveryModule {
    /// The only item that may be executed or skipped
    pub fn head(&self) -> Option<&RecoveryQueueItem> {
        self.queue
            .iter()
            .find(|item| item.queue_nonce == self.queue_nonce)
    }

    /// Look up an item by queue nonce
    pub fn item(&self, queue_nonce: u64) -> Option<&RecoveryQueueItem> {
        self.queue.iter().find(|item| item.queue_nonce == queue_nonce)
    }

    /// Whether a proposal with `hash` is queued
    pub fn contains_proposal(&self, hash: &SafeTxHash) -> bool {
        self.queue.iter().any(|item| &item.recovery_tx_hash == hash)
    }

    fn dequeue_head(&mut self, queue_nonce: u64) -> bool {
        if self.queue_nonce != queue_nonce {
            return false;
        }
        self.queue.retain(|item| item.queue_nonce != queue_nonce);
        self.queue_nonce += 1;
        true
    }
}

/// How a queue item left the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// Executed; the account's owners changed
    Executed,
    /// Skipped after expiring
    Skipped,
    /// Cancelled by the account
    Cancelled,
    /// Dequeued on-chain by a transaction this machine never tracked
    External,
}

/// Live or terminal state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    /// Still queued
    Queued(RecoveryState),
    /// Left the queue
    Resolved(Resolution),
}

/// A queue transition awaiting its transaction's outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Skip an expired head
    Skip {
        /// Module address
        module: Address,
        /// Item being skipped
        queue_nonce: u64,
    },
    /// Execute an executable head
    Execute {
        /// Module address
        module: Address,
        /// Item being executed
        queue_nonce: u64,
        /// Mutation the item applies
        args: Vec<MutationOperation>,
    },
    /// Cancel a head that has not expired
    Cancel {
        /// Module address
        module: Address,
        /// Item being cancelled
        queue_nonce: u64,
    },
}

impl RecoveryAction {
    /// Module and queue nonce the action targets
    pub fn target(&self) -> (&Address, u64) {
        match self {
            RecoveryAction::Skip {
                module,
                queue_nonce,
            }
            | RecoveryAction::Execute {
                module,
                queue_nonce,
                ..
            }
            | RecoveryAction::Cancel {
                module,
                queue_nonce,
            } => (module, *queue_nonce),
        }
    }

    /// Resolution recorded when the action succeeds
    pub fn resolution(&self) -> Resolution {
        match self {
            RecoveryAction::Skip { .. } => Resolution::Skipped,
            RecoveryAction::Execute { .. } => Resolution::Executed,
            RecoveryAction::Cancel { .. } => Resolution::Cancelled,
        }
    }

    /// Whether the account executes the action (and it can be replaced)
    pub fn is_account_transaction(&self) -> bool {
        !matches!(self, RecoveryAction::Execute { .. })
    }
}

/// Result of consuming bus events or chain state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A proposal reached the on-chain queue
    ProposalQueued {
        /// Account being recovered
        account: AccountRef,
        /// Proposal hash
        hash: SafeTxHash,
    },
    /// A proposal failed or reverted
    ProposalFailed {
        /// Account being recovered
        account: AccountRef,
        /// Proposal hash
        hash: SafeTxHash,
        /// Failure details
        error: EventError,
    },
    /// An item left its module's queue
    Dequeued {
        /// Module address
        module: Address,
        /// Dequeued item
        queue_nonce: u64,
        /// How it left
        resolution: Resolution,
    },
    /// A skip/execute/cancel transaction failed
    ActionFailed {
        /// The action
        action: RecoveryAction,
        /// Its transaction hash
        hash: SafeTxHash,
        /// Failure details
        error: EventError,
    },
    /// A skip/cancel transaction was replaced by a sibling at its nonce
    ActionReplaced {
        /// The action
        action: RecoveryAction,
        /// Its transaction hash
        hash: SafeTxHash,
    },
}

#[derive(Debug, Clone)]
struct TrackedModule {
    account: AccountRef,
    module: RecoveryModule,
}

/// Recovery queues and in-flight recovery transactions of one or more accounts
#[derive(Debug, Default)]
pub struct RecoveryQueueMachine {
    modules: HashMap<Address, TrackedModule>,
    resolved: HashMap<(Address, u64), Resolution>,
    proposals: HashMap<SafeTxHash, AccountRef>,
    in_progress: HashMap<AccountRef, SafeTxHash>,
    actions: HashMap<SafeTxHash, RecoveryAction>,
    settled: HashSet<SafeTxHash>,
    outcomes: Vec<RecoveryOutcome>,
    telemetry: ReportOnce,
}

impl RecoveryQueueMachine {
    /// Create an empty machine
    pub fn new() -> Self {
        Self::default()
    }

    /// Report-once flags used by the machine
    pub fn telemetry_mut(&mut self) -> &mut ReportOnce {
        &mut self.telemetry
    }

    /// Known module state
    pub fn module(&self, address: &Address) -> Option<&RecoveryModule> {
        self.modules.get(address).map(|tracked| &tracked.module)
    }

    /// Modules of `account`
    pub fn modules_of(&self, account: &AccountRef) -> Vec<&RecoveryModule> {
        let mut modules: Vec<_> = self
            .modules
            .values()
            .filter(|tracked| &tracked.account == account)
            .map(|tracked| &tracked.module)
            .collect();
        modules.sort_by(|a, b| a.address.cmp(&b.address));
        modules
    }

    /// Head item of a module
    pub fn head(&self, module: &Address) -> Option<&RecoveryQueueItem> {
        self.module(module).and_then(RecoveryModule::head)
    }

    /// State of an item, queued or resolved
    pub fn item_state(
        &self,
        module: &Address,
        queue_nonce: u64,
        now: DateTime<Utc>,
    ) -> Option<ItemState> {
        if let Some(resolution) = self.resolved.get(&(module.clone(), queue_nonce)) {
            return Some(ItemState::Resolved(*resolution));
        }
        self.module(module)
            .and_then(|module| module.item(queue_nonce))
            .map(|item| ItemState::Queued(recovery_queue_state(item, now)))
    }

    /// Replace local module state with what the chain reader returned.
    ///
    /// The chain wins on any disagreement. Items the chain already dequeued
    /// resolve their pending action, and an in-progress proposal that is now
    /// queued on-chain is settled.
    pub fn sync(&mut self, account: &AccountRef, modules: Vec<RecoveryModule>) {
        if !modules.is_empty() {
            self.telemetry
                .report(TelemetryEvent::RecoveryModulesDetected, account);
        }

        let fresh: HashSet<Address> = modules.iter().map(|m| m.address.clone()).collect();
        self.modules
            .retain(|address, tracked| &tracked.account != account || fresh.contains(address));

        for module in modules {
            let previous_nonce = self
                .modules
                .get(&module.address)
                .map(|tracked| tracked.module.queue_nonce);

            let previous_items: Vec<u64> = self
                .modules
                .get(&module.address)
                .map(|tracked| tracked.module.queue.iter().map(|item| item.queue_nonce).collect())
                .unwrap_or_default();

            match previous_nonce {
                Some(local) if module.queue_nonce < local => warn!(
                    "Module {} queue nonce {} is behind local {}; adopting chain state",
                    module.address, module.queue_nonce, local
                ),
                Some(local) if module.queue_nonce > local => {
                    debug!(
                        "Module {} advanced on-chain from {} to {}",
                        module.address, local, module.queue_nonce
                    );
                    self.resolve_dequeued(&module.address, &previous_items, module.queue_nonce);
                }
                _ => {}
            }

            self.modules.insert(
                module.address.clone(),
                TrackedModule {
                    account: account.clone(),
                    module,
                },
            );
        }

        let queued: Vec<SafeTxHash> = self
            .proposals
            .iter()
            .filter(|(hash, owner)| {
                *owner == account
                    && !self.settled.contains(*hash)
                    && self.modules.values().any(|tracked| {
                        &tracked.account == account && tracked.module.contains_proposal(hash)
                    })
            })
            .map(|(hash, _)| hash.clone())
            .collect();

        for hash in queued {
            debug!("Proposal {} observed in on-chain queue", hash);
            self.settle_proposal(&hash, None);
        }
    }

    /// Settle items the chain already dequeued.
    ///
    /// The chain only reports that the queue nonce moved. An item with a
    /// pending local action is credited to that action; any other item the
    /// local queue held resolves as `External`.
    fn resolve_dequeued(&mut self, module: &Address, previous_items: &[u64], chain_nonce: u64) {
        let dequeued: Vec<(SafeTxHash, RecoveryAction)> = self
            .actions
            .iter()
            .filter(|(_, action)| {
                let (target, queue_nonce) = action.target();
                target == module && queue_nonce < chain_nonce
            })
            .map(|(hash, action)| (hash.clone(), action.clone()))
            .collect();

        for (hash, action) in dequeued {
            self.actions.remove(&hash);
            if self.settled.insert(hash) {
                let (target, queue_nonce) = action.target();
                self.record_resolution(target, queue_nonce, action.resolution());
            }
        }

        for &queue_nonce in previous_items.iter().filter(|nonce| **nonce < chain_nonce) {
            if !self.resolved.contains_key(&(module.clone(), queue_nonce)) {
                self.record_resolution(module, queue_nonce, Resolution::External);
            }
        }
    }

    fn record_resolution(&mut self, module: &Address, queue_nonce: u64, resolution: Resolution) {
        info!(
            "Recovery item {} of module {} {:?}",
            queue_nonce, module, resolution
        );

        self.resolved
            .insert((module.clone(), queue_nonce), resolution);
        self.outcomes.push(RecoveryOutcome::Dequeued {
            module: module.clone(),
            queue_nonce,
            resolution,
        });
    }

    fn validate(
        &self,
        module: &Address,
        queue_nonce: u64,
        now: DateTime<Utc>,
        allowed: &[RecoveryState],
    ) -> Result<&RecoveryQueueItem> {
        let tracked = self
            .module(module)
            .ok_or_else(|| LifecycleError::UnknownModule(module.clone()))?;

        let head = tracked.head();
        let item = head
            .filter(|item| item.queue_nonce == queue_nonce)
            .ok_or_else(|| LifecycleError::QueueNotAtHead {
                module: module.clone(),
                queue_nonce,
                head: head.map(|item| item.queue_nonce),
            })?;

        let state = recovery_queue_state(item, now);
        if !allowed.contains(&state) {
            return Err(LifecycleError::InvalidRecoveryState {
                module: module.clone(),
                queue_nonce,
                state: state.to_string(),
            });
        }

        Ok(item)
    }

    /// Check that the head `queue_nonce` may be skipped (it must be expired)
    pub fn prepare_skip(
        &self,
        module: &Address,
        queue_nonce: u64,
        now: DateTime<Utc>,
    ) -> Result<RecoveryAction> {
        self.validate(module, queue_nonce, now, &[RecoveryState::Expired])?;
        Ok(RecoveryAction::Skip {
            module: module.clone(),
            queue_nonce,
        })
    }

    /// Check that the head `queue_nonce` may be executed
    pub fn prepare_execute(
        &self,
        module: &Address,
        queue_nonce: u64,
        now: DateTime<Utc>,
    ) -> Result<RecoveryAction> {
        let item = self.validate(module, queue_nonce, now, &[RecoveryState::Executable])?;
        Ok(RecoveryAction::Execute {
            module: module.clone(),
            queue_nonce,
            args: item.args.clone(),
        })
    }

    /// Check that the head `queue_nonce` may be cancelled
    pub fn prepare_cancel(
        &self,
        module: &Address,
        queue_nonce: u64,
        now: DateTime<Utc>,
    ) -> Result<RecoveryAction> {
        self.validate(
            module,
            queue_nonce,
            now,
            &[RecoveryState::Pending, RecoveryState::Executable],
        )?;
        Ok(RecoveryAction::Cancel {
            module: module.clone(),
            queue_nonce,
        })
    }

    /// Register `hash` as a new recovery proposal for `account`
    pub fn track_proposal(&mut self, account: &AccountRef, hash: SafeTxHash) {
        self.proposals.insert(hash, account.clone());
    }

    /// Register the transaction carrying a skip/execute/cancel
    pub fn track_action(&mut self, hash: SafeTxHash, action: RecoveryAction) {
        self.actions.insert(hash, action);
    }

    /// In-flight proposal of `account`, if any
    pub fn proposal_in_progress(&self, account: &AccountRef) -> Option<&SafeTxHash> {
        self.in_progress.get(account)
    }

    /// Whether `account` has a proposal mid-flight
    pub fn is_proposal_in_progress(&self, account: &AccountRef) -> bool {
        self.in_progress.contains_key(account)
    }

    /// Whether `hash` is a recovery proposal or action this machine tracked
    pub fn tracks(&self, hash: &SafeTxHash) -> bool {
        self.proposals.contains_key(hash)
            || self.actions.contains_key(hash)
            || self.settled.contains(hash)
    }

    /// Consume a bus event
    pub fn handle_event(&mut self, event: &LifecycleEvent) {
        let hash = event.subject();

        if let Some(account) = self.proposals.get(hash).cloned() {
            match event {
                LifecycleEvent::Processing { .. } if !self.settled.contains(hash) => {
                    debug!("Recovery proposal {} in progress for {}", hash, account);
                    self.in_progress.insert(account, hash.clone());
                }
                LifecycleEvent::Processed { .. } => self.settle_proposal(hash, None),
                LifecycleEvent::Reverted { error, .. } | LifecycleEvent::Failed { error, .. } => {
                    self.settle_proposal(hash, Some(error.clone()))
                }
                _ => {}
            }
            return;
        }

        let Some(action) = self.actions.get(hash).cloned() else {
            return;
        };

        match event {
            LifecycleEvent::Processed { .. } => {
                self.actions.remove(hash);
                if !self.settled.insert(hash.clone()) {
                    return;
                }

                let (module, queue_nonce) = action.target();
                if let Some(tracked) = self.modules.get_mut(module) {
                    if !tracked.module.dequeue_head(queue_nonce) {
                        warn!(
                            "Module {} head moved before item {} resolved",
                            module, queue_nonce
                        );
                    }
                }
                self.record_resolution(module, queue_nonce, action.resolution());
            }
            LifecycleEvent::Reverted { error, .. } | LifecycleEvent::Failed { error, .. } => {
                self.actions.remove(hash);
                if self.settled.insert(hash.clone()) {
                    warn!("Recovery action {:?} failed: {}", action, error);
                    self.outcomes.push(RecoveryOutcome::ActionFailed {
                        action,
                        hash: hash.clone(),
                        error: error.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    fn settle_proposal(&mut self, hash: &SafeTxHash, error: Option<EventError>) {
        let Some(account) = self.proposals.get(hash).cloned() else {
            return;
        };

        if self.in_progress.get(&account) == Some(hash) {
            self.in_progress.remove(&account);
        }
        if !self.settled.insert(hash.clone()) {
            return;
        }

        match error {
            None => {
                info!("Recovery proposal {} queued for {}", hash, account);
                self.telemetry.report(TelemetryEvent::RecoveryProposed, hash);
                self.outcomes.push(RecoveryOutcome::ProposalQueued {
                    account,
                    hash: hash.clone(),
                });
            }
            Some(error) => {
                warn!("Recovery proposal {} failed: {}", hash, error);
                self.outcomes.push(RecoveryOutcome::ProposalFailed {
                    account,
                    hash: hash.clone(),
                    error,
                });
            }
        }
    }

    /// Drop skip/cancel actions whose account transaction lost its nonce to a
    /// sibling
    pub fn on_replaced(&mut self, hashes: &[SafeTxHash]) {
        for hash in hashes {
            let Some(action) = self.actions.remove(hash) else {
                continue;
            };
            if self.settled.insert(hash.clone()) {
                info!("Recovery action {:?} replaced at its nonce", action);
                self.outcomes.push(RecoveryOutcome::ActionReplaced {
                    action,
                    hash: hash.clone(),
                });
            }
        }
    }

    /// Drain outcomes produced since the last call
    pub fn take_outcomes(&mut self) -> Vec<RecoveryOutcome> {
        std::mem::take(&mut self.outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::types::addr;
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};
    use test_case::test_case;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn item(nonce: u64, valid_from: i64, expiry: Option<i64>) -> RecoveryQueueItem {
        RecoveryQueueItem {
            module_address: addr(50),
            recovery_tx_hash: SafeTxHash::new(format!("0xr{}", nonce)),
            queue_nonce: nonce,
            args: vec![MutationOperation::ChangeThreshold { threshold: 1 }],
            valid_from: t0() + Duration::seconds(valid_from),
            expiry: expiry.map(|secs| t0() + Duration::seconds(secs)),
        }
    }

    fn module(queue_nonce: u64, items: Vec<RecoveryQueueItem>) -> RecoveryModule {
        RecoveryModule {
            address: addr(50),
            queue_nonce,
            queue: items,
        }
    }

    fn account() -> AccountRef {
        AccountRef::new(1, addr(99))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn processed(hash: &SafeTxHash) -> LifecycleEvent {
        LifecycleEvent::Processed {
            subject: hash.clone(),
        }
    }

    fn failed(hash: &SafeTxHash) -> LifecycleEvent {
        LifecycleEvent::Failed {
            subject: hash.clone(),
            error: EventError::new(FailureKind::Network, "dropped"),
        }
    }

    #[test_case(0, RecoveryState::Pending ; "before valid from")]
    #[test_case(9, RecoveryState::Pending ; "just before valid from")]
    #[test_case(10, RecoveryState::Executable ; "at valid from")]
    #[test_case(15, RecoveryState::Executable ; "inside window")]
    #[test_case(20, RecoveryState::Expired ; "at expiry")]
    #[test_case(25, RecoveryState::Expired ; "after expiry")]
    fn test_queue_state_window(now: i64, expected: RecoveryState) {
        assert_eq!(recovery_queue_state(&item(0, 10, Some(20)), at(now)), expected);
    }

    #[test]
    fn test_state_is_monotonic() {
        let item = item(0, 10, Some(20));
        let mut previous = RecoveryState::Pending;
        for secs in -5..40 {
            let state = recovery_queue_state(&item, at(secs));
            assert!(state >= previous);
            previous = state;
        }
    }

    #[test]
    fn test_no_expiry_never_expires() {
        let item = item(0, 10, None);
        assert_eq!(
            recovery_queue_state(&item, at(10_000_000)),
            RecoveryState::Executable
        );
    }

    #[test]
    fn test_only_head_is_actionable() {
        let mut machine = RecoveryQueueMachine::new();
        machine.sync(
            &account(),
            vec![module(0, vec![item(0, 10, Some(20)), item(1, 10, Some(100))])],
        );

        assert_matches!(
            machine.prepare_execute(&addr(50), 1, at(15)),
            Err(LifecycleError::QueueNotAtHead { head: Some(0), .. })
        );
        assert!(machine.prepare_execute(&addr(50), 0, at(15)).is_ok());
        assert_matches!(
            machine.prepare_execute(&addr(50), 0, at(5)),
            Err(LifecycleError::InvalidRecoveryState { .. })
        );
        assert_matches!(
            machine.prepare_skip(&addr(50), 0, at(15)),
            Err(LifecycleError::InvalidRecoveryState { .. })
        );
        assert!(machine.prepare_skip(&addr(50), 0, at(20)).is_ok());
        assert!(machine.prepare_cancel(&addr(50), 0, at(5)).is_ok());
        assert_matches!(
            machine.prepare_cancel(&addr(50), 0, at(21)),
            Err(LifecycleError::InvalidRecoveryState { .. })
        );
        assert_matches!(
            machine.prepare_skip(&addr(51), 0, at(21)),
            Err(LifecycleError::UnknownModule(_))
        );
    }

    #[test]
    fn test_skip_dequeues_only_after_processed() {
        let mut machine = RecoveryQueueMachine::new();
        machine.sync(
            &account(),
            vec![module(0, vec![item(0, 10, Some(20)), item(1, 30, Some(100))])],
        );

        let action = machine.prepare_skip(&addr(50), 0, at(25)).unwrap();
        let hash = SafeTxHash::new("0xskip");
        machine.track_action(hash.clone(), action);

        assert_eq!(machine.head(&addr(50)).unwrap().queue_nonce, 0);
        machine.handle_event(&processed(&hash));

        assert_eq!(machine.head(&addr(50)).unwrap().queue_nonce, 1);
        assert_eq!(
            machine.item_state(&addr(50), 0, at(25)),
            Some(ItemState::Resolved(Resolution::Skipped))
        );
        assert_eq!(
            machine.item_state(&addr(50), 1, at(25)),
            Some(ItemState::Queued(RecoveryState::Pending))
        );

        // Duplicate terminal event changes nothing
        machine.handle_event(&processed(&hash));
        assert_eq!(machine.head(&addr(50)).unwrap().queue_nonce, 1);
        assert_eq!(machine.take_outcomes().len(), 1);
    }

    #[test]
    fn test_execute_resolution_via_chain_sync() {
        let mut machine = RecoveryQueueMachine::new();
        machine.sync(&account(), vec![module(0, vec![item(0, 10, None)])]);

        let action = machine.prepare_execute(&addr(50), 0, at(11)).unwrap();
        let hash = SafeTxHash::new("0xexec");
        machine.track_action(hash.clone(), action);

        // Chain indexing outpaces the event stream
        machine.sync(&account(), vec![module(1, vec![])]);
        assert_eq!(
            machine.take_outcomes(),
            vec![RecoveryOutcome::Dequeued {
                module: addr(50),
                queue_nonce: 0,
                resolution: Resolution::Executed,
            }]
        );

        machine.handle_event(&processed(&hash));
        assert!(machine.take_outcomes().is_empty());
    }

    #[test]
    fn test_untracked_dequeue_resolves_as_external() {
        let mut machine = RecoveryQueueMachine::new();
        machine.sync(
            &account(),
            vec![module(0, vec![item(0, 0, Some(1)), item(1, 0, None), item(2, 0, None)])],
        );
        let action = machine.prepare_skip(&addr(50), 0, at(5)).unwrap();
        let hash = SafeTxHash::new("0xskip");
        machine.track_action(hash.clone(), action);
        assert!(machine.tracks(&hash));

        machine.sync(&account(), vec![module(2, vec![item(2, 0, None)])]);

        assert_eq!(
            machine.item_state(&addr(50), 0, at(5)),
            Some(ItemState::Resolved(Resolution::Skipped))
        );
        assert_eq!(
            machine.item_state(&addr(50), 1, at(5)),
            Some(ItemState::Resolved(Resolution::External))
        );
        assert_eq!(
            machine.item_state(&addr(50), 2, at(5)),
            Some(ItemState::Queued(RecoveryState::Executable))
        );
        assert_eq!(machine.take_outcomes().len(), 2);
        assert!(machine.tracks(&hash));
        assert!(!machine.tracks(&SafeTxHash::new("0xother")));
    }

    #[test]
    fn test_failed_action_keeps_item() {
        let mut machine = RecoveryQueueMachine::new();
        machine.sync(&account(), vec![module(0, vec![item(0, 10, None)])]);
        let action = machine.prepare_execute(&addr(50), 0, at(11)).unwrap();
        let hash = SafeTxHash::new("0xexec");
        machine.track_action(hash.clone(), action);

        machine.handle_event(&failed(&hash));
        assert_matches!(
            machine.take_outcomes().as_slice(),
            [RecoveryOutcome::ActionFailed { .. }]
        );
        assert_eq!(machine.head(&addr(50)).unwrap().queue_nonce, 0);
    }

    #[test]
    fn test_replaced_skip_is_dropped() {
        let mut machine = RecoveryQueueMachine::new();
        machine.sync(&account(), vec![module(0, vec![item(0, 0, Some(1))])]);
        let action = machine.prepare_skip(&addr(50), 0, at(5)).unwrap();
        let hash = SafeTxHash::new("0xskip");
        machine.track_action(hash.clone(), action);

        machine.on_replaced(&[hash.clone(), SafeTxHash::new("0xother")]);
        assert_matches!(
            machine.take_outcomes().as_slice(),
            [RecoveryOutcome::ActionReplaced { .. }]
        );

        machine.handle_event(&processed(&hash));
        assert_eq!(machine.head(&addr(50)).unwrap().queue_nonce, 0);
    }

    #[test]
    fn test_proposal_in_progress_until_terminal_event() {
        let mut machine = RecoveryQueueMachine::new();
        let hash = SafeTxHash::new("0xr7");
        machine.track_proposal(&account(), hash.clone());
        assert!(!machine.is_proposal_in_progress(&account()));

        machine.handle_event(&LifecycleEvent::Processing {
            subject: hash.clone(),
        });
        assert_eq!(machine.proposal_in_progress(&account()), Some(&hash));

        machine.handle_event(&processed(&hash));
        assert!(!machine.is_proposal_in_progress(&account()));

        // Chain queue shows it later: no second success
        machine.sync(&account(), vec![module(0, vec![item(7, 10, None)])]);
        let outcomes = machine.take_outcomes();
        assert_eq!(
            outcomes,
            vec![RecoveryOutcome::ProposalQueued {
                account: account(),
                hash,
            }]
        );
    }

    #[test]
    fn test_queue_membership_clears_progress_first() {
        let mut machine = RecoveryQueueMachine::new();
        let hash = SafeTxHash::new("0xr3");
        machine.track_proposal(&account(), hash.clone());
        machine.handle_event(&LifecycleEvent::Processing {
            subject: hash.clone(),
        });

        machine.sync(&account(), vec![module(0, vec![item(3, 10, None)])]);
        assert!(!machine.is_proposal_in_progress(&account()));

        // Late events for the same hash are ignored, including failures
        machine.handle_event(&failed(&hash));
        machine.handle_event(&processed(&hash));
        machine.handle_event(&LifecycleEvent::Processing {
            subject: hash.clone(),
        });
        assert!(!machine.is_proposal_in_progress(&account()));

        let outcomes = machine.take_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_matches!(outcomes[0], RecoveryOutcome::ProposalQueued { .. });
    }

    #[test]
    fn test_failed_proposal_reported_once() {
        let mut machine = RecoveryQueueMachine::new();
        let hash = SafeTxHash::new("0xr1");
        machine.track_proposal(&account(), hash.clone());
        machine.handle_event(&LifecycleEvent::Processing {
            subject: hash.clone(),
        });

        machine.handle_event(&failed(&hash));
        machine.handle_event(&failed(&hash));

        assert!(!machine.is_proposal_in_progress(&account()));
        assert_matches!(
            machine.take_outcomes().as_slice(),
            [RecoveryOutcome::ProposalFailed { .. }]
        );
    }

    #[test]
    fn test_sync_drops_modules_no_longer_enabled() {
        let mut machine = RecoveryQueueMachine::new();
        machine.sync(&account(), vec![module(0, vec![])]);
        assert_eq!(machine.modules_of(&account()).len(), 1);

        machine.sync(&account(), vec![]);
        assert!(machine.modules_of(&account()).is_empty());
        assert!(machine.module(&addr(50)).is_none());
    }

    #[test]
    fn test_modules_detected_reported_once() {
        let mut machine = RecoveryQueueMachine::new();
        machine.sync(&account(), vec![module(0, vec![])]);
        machine.sync(&account(), vec![module(0, vec![])]);
        assert!(machine
            .telemetry_mut()
            .is_reported(TelemetryEvent::RecoveryModulesDetected, &account()));
    }
}
