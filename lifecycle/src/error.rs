//! Error types for the lifecycle core.
//!
//! This module defines the error taxonomy shared by the pure components
//! (planner, conflict resolver, recovery queue) and the I/O flows that talk to
//! the chain reader, transaction submitter and signature collector.

use crate::types::{Address, SafeTxHash};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for lifecycle operations
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Target owners/threshold violate `1 <= threshold <= len(owners)`
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// The conflict group of this transaction was already resolved by a sibling
    #[error("Stale transaction: {0} was replaced by a sibling at the same nonce")]
    StaleTransaction(SafeTxHash),

    /// A sibling at the same nonce is already being executed
    #[error("Transaction {hash} blocked: sibling {active} is already executing")]
    SiblingInFlight {
        /// Transaction that was blocked
        hash: SafeTxHash,
        /// Sibling currently in flight
        active: SafeTxHash,
    },

    /// Execution attempted before the signature threshold was reached
    #[error("Transaction {hash} has {have}/{required} confirmations")]
    InsufficientConfirmations {
        /// Transaction that was blocked
        hash: SafeTxHash,
        /// Signatures collected so far
        have: usize,
        /// Signatures the account requires
        required: usize,
    },

    /// Skip/execute/cancel attempted on an item that is not the queue head
    #[error("Queue item {queue_nonce} of module {module} is not at head (head: {head:?})")]
    QueueNotAtHead {
        /// Recovery module address
        module: Address,
        /// Queue nonce of the requested item
        queue_nonce: u64,
        /// Queue nonce of the current head, if the queue is not empty
        head: Option<u64>,
    },

    /// The recovery item is at head but in the wrong time window
    #[error("Queue item {queue_nonce} of module {module} is {state}")]
    InvalidRecoveryState {
        /// Recovery module address
        module: Address,
        /// Queue nonce of the requested item
        queue_nonce: u64,
        /// Observed state
        state: String,
    },

    /// A recovery proposal for this account is already mid-flight
    #[error("Recovery proposal {0} is already in progress")]
    RecoveryInProgress(SafeTxHash),

    /// Transient failure from the chain reader or submitter
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The signer declined the request
    #[error("User rejected: {0}")]
    UserRejected(String),

    /// On-chain execution failed after submission succeeded
    #[error("Transaction {hash} reverted: {reason}")]
    Reverted {
        /// Reverted transaction
        hash: SafeTxHash,
        /// Revert reason reported by the chain
        reason: String,
    },

    /// Account or resource not found by the chain reader
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transaction is not in the pending pool
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(SafeTxHash),

    /// Recovery module is not known for this account
    #[error("Unknown recovery module: {0}")]
    UnknownModule(Address),

    /// The account cache is empty or invalidated; refresh first
    #[error("Account state not loaded")]
    AccountNotLoaded,

    /// Malformed address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Max retries exceeded
    #[error("Max retries ({0}) exceeded")]
    MaxRetriesExceeded(usize),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LifecycleError {
    /// Only transient network failures are safe to retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, LifecycleError::NetworkError(_))
    }

    /// Cloneable classification used on bus events
    pub fn kind(&self) -> FailureKind {
        match self {
            LifecycleError::InvalidTarget(_) => FailureKind::InvalidTarget,
            LifecycleError::StaleTransaction(_) | LifecycleError::SiblingInFlight { .. } => {
                FailureKind::StaleTransaction
            }
            LifecycleError::QueueNotAtHead { .. }
            | LifecycleError::InvalidRecoveryState { .. }
            | LifecycleError::RecoveryInProgress(_) => FailureKind::QueueNotAtHead,
            LifecycleError::NetworkError(_) | LifecycleError::MaxRetriesExceeded(_) => {
                FailureKind::Network
            }
            LifecycleError::UserRejected(_) => FailureKind::UserRejected,
            LifecycleError::Reverted { .. } => FailureKind::Reverted,
            _ => FailureKind::Other,
        }
    }
}

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Classification of a failure carried on `Failed`/`Reverted` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Planner precondition violated
    InvalidTarget,
    /// Conflict group already resolved or blocked
    StaleTransaction,
    /// Recovery queue ordering violated
    QueueNotAtHead,
    /// Transient network failure
    Network,
    /// Signer rejected
    UserRejected,
    /// Reverted on-chain
    Reverted,
    /// Anything else
    Other,
}

impl FailureKind {
    /// Whether the presentation layer should suggest a retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Network)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::InvalidTarget => "INVALID_TARGET",
            FailureKind::StaleTransaction => "STALE_TRANSACTION",
            FailureKind::QueueNotAtHead => "QUEUE_NOT_AT_HEAD",
            FailureKind::Network => "NETWORK",
            FailureKind::UserRejected => "USER_REJECTED",
            FailureKind::Reverted => "REVERTED",
            FailureKind::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// Error payload of a bus event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    /// Failure classification
    pub kind: FailureKind,
    /// Human readable message
    pub message: String,
}

impl EventError {
    /// Create an event error
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&LifecycleError> for EventError {
    fn from(error: &LifecycleError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Error context for retryable operations
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Number of attempts made
    pub attempts: usize,
    /// Last error encountered
    pub last_error: String,
    /// Total time spent waiting between attempts (in milliseconds)
    pub total_time_ms: u64,
}

impl RetryContext {
    /// Create a new retry context
    pub fn new() -> Self {
        Self {
            attempts: 0,
            last_error: String::new(),
            total_time_ms: 0,
        }
    }

    /// Record an attempt
    pub fn record_attempt(&mut self, error: &str, duration_ms: u64) {
        self.attempts += 1;
        self.last_error = error.to_string();
        self.total_time_ms += duration_ms;
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}
