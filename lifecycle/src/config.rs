//! Configuration for the lifecycle core.
//!
//! This module provides the account being managed, chain presets and the
//! polling and retry settings used by the I/O flows.

use crate::error::{LifecycleError, Result};
use crate::types::{AccountRef, Address};
use serde::{Deserialize, Serialize};

/// Chain enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Chain {
    /// Ethereum mainnet
    Mainnet,
    /// Sepolia testnet
    Sepolia,
    /// Gnosis chain
    Gnosis,
    /// Custom chain with a user-defined id
    Custom,
}

impl Chain {
    /// Default chain id, `0` for custom chains
    pub fn default_chain_id(&self) -> u64 {
        match self {
            Chain::Mainnet => 1,
            Chain::Sepolia => 11_155_111,
            Chain::Gnosis => 100,
            Chain::Custom => 0,
        }
    }

    /// Default finality polling interval, roughly one block
    pub fn default_poll_interval_ms(&self) -> u64 {
        match self {
            Chain::Mainnet | Chain::Sepolia => 12_000,
            Chain::Gnosis => 5_000,
            Chain::Custom => 1_000,
        }
    }
}

/// Configuration for one managed account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Chain preset
    pub chain: Chain,

    /// Chain id
    pub chain_id: u64,

    /// Account address
    pub account: Address,

    /// Maximum number of retries for opt-in retried reads
    pub max_retries: usize,

    /// Initial retry delay (in milliseconds)
    pub retry_initial_delay_ms: u64,

    /// Maximum retry delay (in milliseconds)
    pub retry_max_delay_ms: u64,

    /// Retry backoff multiplier
    pub retry_multiplier: f64,

    /// Transaction polling interval (in milliseconds)
    pub tx_poll_interval_ms: u64,

    /// Transaction timeout (in seconds)
    pub tx_timeout_secs: u64,
}

impl LifecycleConfig {
    /// Create a new configuration for the specified chain
    pub fn new(chain: Chain, account: Address) -> Self {
        Self {
            chain,
            chain_id: chain.default_chain_id(),
            account,
            max_retries: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 5000,
            retry_multiplier: 2.0,
            tx_poll_interval_ms: chain.default_poll_interval_ms(),
            tx_timeout_secs: 300,
        }
    }

    /// Create configuration for mainnet
    pub fn mainnet(account: Address) -> Self {
        Self::new(Chain::Mainnet, account)
    }

    /// Create configuration for Sepolia
    pub fn sepolia(account: Address) -> Self {
        Self::new(Chain::Sepolia, account)
    }

    /// Create configuration for Gnosis chain
    pub fn gnosis(account: Address) -> Self {
        Self::new(Chain::Gnosis, account)
    }

    /// Create a custom chain configuration
    pub fn custom(chain_id: u64, account: Address) -> Result<Self> {
        if chain_id == 0 {
            return Err(LifecycleError::ConfigError(
                "Chain id cannot be zero".to_string(),
            ));
        }

        let mut config = Self::new(Chain::Custom, account);
        config.chain_id = chain_id;
        Ok(config)
    }

    /// Parse a JSON configuration and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set maximum retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set retry delays
    pub fn with_retry_config(
        mut self,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    ) -> Self {
        self.retry_initial_delay_ms = initial_delay_ms;
        self.retry_max_delay_ms = max_delay_ms;
        self.retry_multiplier = multiplier;
        self
    }

    /// Set transaction polling configuration
    pub fn with_tx_config(mut self, poll_interval_ms: u64, timeout_secs: u64) -> Self {
        self.tx_poll_interval_ms = poll_interval_ms;
        self.tx_timeout_secs = timeout_secs;
        self
    }

    /// Reference to the managed account
    pub fn account_ref(&self) -> AccountRef {
        AccountRef::new(self.chain_id, self.account.clone())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chain_id == 0 {
            return Err(LifecycleError::ConfigError(
                "Chain id cannot be zero".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(LifecycleError::ConfigError(
                "Max retries must be greater than 0".to_string(),
            ));
        }
        if self.retry_initial_delay_ms == 0 {
            return Err(LifecycleError::ConfigError(
                "Retry initial delay must be greater than 0".to_string(),
            ));
        }
        if self.retry_max_delay_ms < self.retry_initial_delay_ms {
            return Err(LifecycleError::ConfigError(
                "Retry max delay must not be below the initial delay".to_string(),
            ));
        }
        if self.retry_multiplier <= 1.0 {
            return Err(LifecycleError::ConfigError(
                "Retry multiplier must be greater than 1.0".to_string(),
            ));
        }
        if self.tx_poll_interval_ms == 0 {
            return Err(LifecycleError::ConfigError(
                "Transaction poll interval must be greater than 0".to_string(),
            ));
        }
        if self.tx_timeout_secs == 0 {
            return Err(LifecycleError::ConfigError(
                "Transaction timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
