//! Common types used across the lifecycle core.
//!
//! This module defines addresses, transaction hashes and the cached view of a
//! multisig account (owners, threshold, nonce).

use crate::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A 20-byte account address in `0x`-prefixed hex form.
///
/// Stored lower-cased, so equality and hashing ignore checksum casing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Head pointer of the on-chain owner linked list.
    pub const SENTINEL_HEX: &'static str = "0x0000000000000000000000000000000000000001";

    /// Parse and normalise an address
    pub fn parse(value: &str) -> Result<Self> {
        let hex = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .ok_or_else(|| LifecycleError::InvalidAddress(value.to_string()))?;

        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LifecycleError::InvalidAddress(value.to_string()));
        }

        Ok(Self(format!("0x{}", hex.to_ascii_lowercase())))
    }

    /// The sentinel owner used as `prev_owner` for the list head
    pub fn sentinel() -> Self {
        Self(Self::SENTINEL_HEX.to_string())
    }

    /// Whether this is the sentinel address
    pub fn is_sentinel(&self) -> bool {
        self.0 == Self::SENTINEL_HEX
    }

    /// Lower-cased hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = LifecycleError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash identifying a proposed transaction; the event bus subject key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SafeTxHash(String);

impl SafeTxHash {
    /// Create a hash from its hex form
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().to_ascii_lowercase())
    }

    /// Hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SafeTxHash {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SafeTxHash {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<SafeTxHash> for String {
    fn from(hash: SafeTxHash) -> Self {
        hash.0
    }
}

impl fmt::Display for SafeTxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a deployed account on a specific chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    /// Chain the account is deployed on
    pub chain_id: u64,
    /// Account contract address
    pub address: Address,
}

impl AccountRef {
    /// Create a new account reference
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self { chain_id, address }
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.address)
    }
}

/// Owners in contract linked-list order plus the signing threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSet {
    /// Owners, insertion order matching the on-chain list
    pub owners: Vec<Address>,
    /// Signatures required to execute
    pub threshold: usize,
}

impl OwnerSet {
    /// Create an owner set
    pub fn new(owners: Vec<Address>, threshold: usize) -> Self {
        Self { owners, threshold }
    }

    /// Check `1 <= threshold <= len(owners)` and that owners are distinct
    pub fn validate(&self) -> Result<()> {
        if self.owners.is_empty() {
            return Err(LifecycleError::InvalidTarget(
                "Owner set cannot be empty".to_string(),
            ));
        }
        if self.threshold == 0 || self.threshold > self.owners.len() {
            return Err(LifecycleError::InvalidTarget(format!(
                "Threshold {} outside [1, {}]",
                self.threshold,
                self.owners.len()
            )));
        }

        let mut seen = HashSet::with_capacity(self.owners.len());
        for owner in &self.owners {
            if owner.is_sentinel() {
                return Err(LifecycleError::InvalidTarget(
                    "Sentinel address cannot be an owner".to_string(),
                ));
            }
            if !seen.insert(owner) {
                return Err(LifecycleError::InvalidTarget(format!(
                    "Duplicate owner {}",
                    owner
                )));
            }
        }

        Ok(())
    }

    /// Whether `address` is an owner
    pub fn contains(&self, address: &Address) -> bool {
        self.owners.contains(address)
    }
}

/// Cached on-chain state of a multisig account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Chain the account lives on
    pub chain_id: u64,
    /// Account address
    pub address: Address,
    /// Owners in linked-list order
    pub owners: Vec<Address>,
    /// Signing threshold
    pub threshold: usize,
    /// Next nonce to be executed
    pub nonce: u64,
}

impl Account {
    /// Reference to this account
    pub fn account_ref(&self) -> AccountRef {
        AccountRef::new(self.chain_id, self.address.clone())
    }

    /// Owners and threshold as an [`OwnerSet`]
    pub fn owner_set(&self) -> OwnerSet {
        OwnerSet::new(self.owners.clone(), self.threshold)
    }
}

/// Test helper: deterministic address from a small integer
#[cfg(test)]
pub(crate) fn addr(n: u64) -> Address {
    Address::parse(&format!("0x{:040x}", n + 0x1000)).expect("valid test address")
}
