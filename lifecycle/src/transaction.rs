//! Transaction encoding and submission.
//!
//! This module turns planned owner mutations and recovery actions into
//! [`EncodedTransaction`]s and drives them through the signature collector and
//! transaction submitter, publishing every step on the event bus.

use crate::bus::{EventBus, LifecycleEvent};
use crate::chain::{Signature, SignatureCollector, TransactionSubmitter};
use crate::conflicts::PendingTransaction;
use crate::error::{EventError, LifecycleError, Result};
use crate::planner::MutationOperation;
use crate::recovery::RecoveryAction;
use crate::types::{Address, SafeTxHash};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Call into a recovery module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum RecoveryCall {
    /// Guardian queues an owner/threshold change
    Propose {
        /// Mutation applied when the item executes
        args: Vec<MutationOperation>,
    },
    /// Anyone executes the head item once its cool-down has passed
    ExecuteNext {
        /// Mutation of the head item
        args: Vec<MutationOperation>,
    },
    /// Account moves the module's queue nonce, dropping items below it
    SetQueueNonce {
        /// New queue nonce
        queue_nonce: u64,
    },
}

/// Call data of an encoded transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "call", rename_all = "camelCase")]
pub enum TxData {
    /// One owner-registry primitive
    OwnerMutation(MutationOperation),
    /// Several primitives batched in plan order
    MultiSend(Vec<MutationOperation>),
    /// Recovery module call
    Recovery(RecoveryCall),
}

/// A transaction ready for hashing, signing and submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedTransaction {
    /// Call target
    pub to: Address,
    /// Account nonce for transactions executed by the account; `None` for
    /// direct module calls
    pub nonce: Option<u64>,
    /// Call data
    pub data: TxData,
}

impl EncodedTransaction {
    /// Encode a plan as an account transaction calling itself
    pub fn owner_mutation(
        account: &Address,
        nonce: u64,
        mut operations: Vec<MutationOperation>,
    ) -> Result<Self> {
        let data = match operations.len() {
            0 => {
                return Err(LifecycleError::InvalidTarget(
                    "Target equals current owners and threshold".to_string(),
                ))
            }
            1 => TxData::OwnerMutation(operations.remove(0)),
            _ => TxData::MultiSend(operations),
        };

        Ok(Self {
            to: account.clone(),
            nonce: Some(nonce),
            data,
        })
    }

    /// Guardian call queueing a recovery
    pub fn recovery_proposal(module: &Address, args: Vec<MutationOperation>) -> Self {
        Self {
            to: module.clone(),
            nonce: None,
            data: TxData::Recovery(RecoveryCall::Propose { args }),
        }
    }

    /// Call executing the module's head item
    pub fn recovery_execution(module: &Address, args: Vec<MutationOperation>) -> Self {
        Self {
            to: module.clone(),
            nonce: None,
            data: TxData::Recovery(RecoveryCall::ExecuteNext { args }),
        }
    }

    /// Account transaction moving a module's queue nonce (skip or cancel)
    pub fn set_queue_nonce(module: &Address, account_nonce: u64, queue_nonce: u64) -> Self {
        Self {
            to: module.clone(),
            nonce: Some(account_nonce),
            data: TxData::Recovery(RecoveryCall::SetQueueNonce { queue_nonce }),
        }
    }

    /// Encode a queue transition.
    ///
    /// Skip and cancel move the queue nonce past the head and are executed by
    /// the account at `account_nonce`; execute calls the module directly.
    pub fn recovery_action(action: &RecoveryAction, account_nonce: u64) -> Self {
        match action {
            RecoveryAction::Skip {
                module,
                queue_nonce,
            }
            | RecoveryAction::Cancel {
                module,
                queue_nonce,
            } => Self::set_queue_nonce(module, account_nonce, queue_nonce + 1),
            RecoveryAction::Execute { module, args, .. } => {
                Self::recovery_execution(module, args.clone())
            }
        }
    }

    /// Whether the account itself executes this transaction
    pub fn is_account_transaction(&self) -> bool {
        self.nonce.is_some()
    }

    /// JSON encoding handed to submitters
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Drives transactions through signing and submission
pub struct TransactionManager<S, C> {
    /// Transaction submitter, shared with the monitor
    submitter: Rc<S>,
    /// Signature collector
    collector: C,
    /// Bus receiving lifecycle events
    bus: EventBus,
}

impl<S, C> TransactionManager<S, C>
where
    S: TransactionSubmitter,
    C: SignatureCollector,
{
    /// Create a new transaction manager
    pub fn new(submitter: Rc<S>, collector: C, bus: EventBus) -> Self {
        Self {
            submitter,
            collector,
            bus,
        }
    }

    /// Transaction submitter
    pub fn submitter(&self) -> &Rc<S> {
        &self.submitter
    }

    /// Hash identifying `transaction`
    pub fn transaction_hash(&self, transaction: &EncodedTransaction) -> Result<SafeTxHash> {
        self.collector.transaction_hash(transaction)
    }

    fn fail(&self, subject: &SafeTxHash, error: LifecycleError) -> LifecycleError {
        let payload = EventError::from(&error);
        let event = match &error {
            LifecycleError::Reverted { .. } => LifecycleEvent::Reverted {
                subject: subject.clone(),
                error: payload,
            },
            _ => LifecycleEvent::Failed {
                subject: subject.clone(),
                error: payload,
            },
        };
        self.bus.publish(event);
        error
    }

    /// Propose an account transaction with the connected owner's signature
    pub async fn propose(
        &self,
        transaction: &EncodedTransaction,
        confirmations_required: usize,
    ) -> Result<PendingTransaction> {
        let nonce = transaction.nonce.ok_or_else(|| {
            LifecycleError::InvalidTarget("Only account transactions can be proposed".to_string())
        })?;
        let hash = self.transaction_hash(transaction)?;
        info!("Proposing {} at nonce {}", hash, nonce);

        let signature = match self.collector.sign(&hash).await {
            Ok(signature) => signature,
            Err(error) => return Err(self.fail(&hash, error)),
        };

        let mut pending =
            PendingTransaction::new(nonce, hash.clone(), Utc::now(), confirmations_required);
        pending.add_confirmation(signature.signer);

        self.bus.publish(LifecycleEvent::Propose { subject: hash });
        Ok(pending)
    }

    /// Add the connected owner's signature to a proposed transaction
    pub async fn confirm(&self, hash: &SafeTxHash) -> Result<Signature> {
        debug!("Collecting signature for {}", hash);

        let signature = match self.collector.sign(hash).await {
            Ok(signature) => signature,
            Err(error) => return Err(self.fail(hash, error)),
        };

        self.bus.publish(LifecycleEvent::ConfirmPropose {
            subject: hash.clone(),
            signer: signature.signer.clone(),
        });
        Ok(signature)
    }

    /// Submit `transaction` for execution under `subject`.
    ///
    /// Publishes `Processing` first; a submitter error is published as
    /// `Failed` (or `Reverted`) and returned unchanged.
    pub async fn submit(
        &self,
        subject: &SafeTxHash,
        transaction: &EncodedTransaction,
    ) -> Result<SafeTxHash> {
        info!("Submitting {} to {}", subject, transaction.to);
        self.bus.publish(LifecycleEvent::Processing {
            subject: subject.clone(),
        });

        match self.submitter.submit(transaction).await {
            Ok(receipt) => {
                debug!("{} accepted as {}", subject, receipt);
                Ok(receipt)
            }
            Err(error) => {
                warn!("Submission of {} failed: {}", subject, error);
                Err(self.fail(subject, error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::addr;

    fn swap() -> MutationOperation {
        MutationOperation::Swap {
            prev_owner: Address::sentinel(),
            old: addr(1),
            new: addr(2),
        }
    }

    #[test]
    fn test_single_operation_is_direct_call() {
        let tx = EncodedTransaction::owner_mutation(&addr(9), 3, vec![swap()]).unwrap();
        assert_eq!(tx.to, addr(9));
        assert_eq!(tx.nonce, Some(3));
        assert_eq!(tx.data, TxData::OwnerMutation(swap()));
        assert!(tx.is_account_transaction());
    }

    #[test]
    fn test_multiple_operations_are_batched() {
        let ops = vec![swap(), MutationOperation::ChangeThreshold { threshold: 2 }];
        let tx = EncodedTransaction::owner_mutation(&addr(9), 0, ops.clone()).unwrap();
        assert_eq!(tx.data, TxData::MultiSend(ops));
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert!(matches!(
            EncodedTransaction::owner_mutation(&addr(9), 0, vec![]),
            Err(LifecycleError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_recovery_calls() {
        let propose = EncodedTransaction::recovery_proposal(&addr(5), vec![swap()]);
        assert!(!propose.is_account_transaction());

        let skip = EncodedTransaction::set_queue_nonce(&addr(5), 12, 3);
        assert_eq!(skip.nonce, Some(12));
        assert_eq!(
            skip.data,
            TxData::Recovery(RecoveryCall::SetQueueNonce { queue_nonce: 3 })
        );
    }

    #[test]
    fn test_recovery_action_encoding() {
        let skip = RecoveryAction::Skip {
            module: addr(5),
            queue_nonce: 4,
        };
        let tx = EncodedTransaction::recovery_action(&skip, 9);
        assert_eq!(tx.nonce, Some(9));
        assert_eq!(
            tx.data,
            TxData::Recovery(RecoveryCall::SetQueueNonce { queue_nonce: 5 })
        );

        let execute = RecoveryAction::Execute {
            module: addr(5),
            queue_nonce: 4,
            args: vec![swap()],
        };
        let tx = EncodedTransaction::recovery_action(&execute, 9);
        assert!(!tx.is_account_transaction());
        assert_eq!(
            tx.data,
            TxData::Recovery(RecoveryCall::ExecuteNext { args: vec![swap()] })
        );
    }

    #[test]
    fn test_json_encoding() {
        let tx = EncodedTransaction::set_queue_nonce(&addr(5), 1, 2);
        let json: serde_json::Value = serde_json::from_str(&tx.to_json().unwrap()).unwrap();
        assert_eq!(json["nonce"], 1);
        assert_eq!(json["data"]["type"], "recovery");
        assert_eq!(json["data"]["call"]["method"], "setQueueNonce");
        assert_eq!(json["data"]["call"]["queue_nonce"], 2);
    }
}
