//! Transaction monitoring and status tracking.
//!
//! This module polls the transaction submitter until a submitted transaction
//! is mined or reverted, or until the configured timeout elapses.

use crate::chain::{ExecutionStatus, TransactionSubmitter};
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, Result};
use crate::types::SafeTxHash;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Monitoring options
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Poll interval (in milliseconds)
    pub poll_interval_ms: u64,
    /// Timeout (in seconds)
    pub timeout_secs: u64,
}

impl MonitorOptions {
    /// Create from lifecycle config
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            poll_interval_ms: config.tx_poll_interval_ms,
            timeout_secs: config.tx_timeout_secs,
        }
    }

    /// Set custom poll interval
    pub fn with_poll_interval(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Transaction monitoring result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorResult {
    /// Transaction mined and succeeded
    Executed,
    /// Transaction mined and reverted
    Reverted(String),
    /// No final status before the timeout
    Timeout,
}

/// Polls the submitter for the finality of submitted transactions
pub struct TransactionMonitor<S> {
    /// Transaction submitter, shared with the transaction manager
    submitter: Rc<S>,
    /// Default options
    options: MonitorOptions,
}

impl<S: TransactionSubmitter> TransactionMonitor<S> {
    /// Create a new transaction monitor
    pub fn new(submitter: Rc<S>, options: MonitorOptions) -> Self {
        Self { submitter, options }
    }

    /// Default monitoring options
    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    /// Poll `receipt` until it is final or `options.timeout_secs` elapses.
    ///
    /// Transient network errors keep the loop polling; any other error is
    /// returned.
    pub async fn monitor(
        &self,
        receipt: &SafeTxHash,
        options: &MonitorOptions,
    ) -> Result<MonitorResult> {
        info!(
            "Monitoring transaction: {} (timeout: {}s)",
            receipt, options.timeout_secs
        );

        let start = Instant::now();
        let timeout = Duration::from_secs(options.timeout_secs);
        let poll_interval = Duration::from_millis(options.poll_interval_ms);

        loop {
            if start.elapsed() >= timeout {
                warn!("Transaction monitoring timed out: {}", receipt);
                return Ok(MonitorResult::Timeout);
            }

            match self.submitter.status(receipt).await {
                Ok(ExecutionStatus::Executed) => {
                    info!("Transaction executed: {}", receipt);
                    return Ok(MonitorResult::Executed);
                }
                Ok(ExecutionStatus::Reverted(reason)) => {
                    warn!("Transaction reverted: {} ({})", receipt, reason);
                    return Ok(MonitorResult::Reverted(reason));
                }
                Ok(ExecutionStatus::Pending) => {
                    debug!("Transaction still pending: {}", receipt);
                }
                Ok(ExecutionStatus::NotFound) => {
                    debug!("Transaction not yet indexed: {}", receipt);
                }
                Err(LifecycleError::NetworkError(e)) => {
                    debug!("Error fetching status of {}: {}", receipt, e);
                }
                Err(e) => return Err(e),
            }

            sleep(poll_interval).await;
        }
    }
}
