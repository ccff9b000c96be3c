//! Owner-set mutation planning.
//!
//! The account contract stores owners in a singly-linked list addressed by
//! "previous owner" pointers and only exposes single-step primitives: swap an
//! owner, add an owner together with a threshold, remove an owner together
//! with a threshold, and change the threshold alone. [`plan`] turns a
//! `(current, target)` pair into the shortest ordered sequence of those
//! primitives that never passes through an invalid intermediate state.
//!
//! `prev_owner` pointers are computed from an [`OwnerList`] simulation that is
//! updated after every emitted operation, never from the original input.

use crate::error::Result;
use crate::types::{Address, OwnerSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single owner-registry primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MutationOperation {
    /// Replace `old` with `new` in place
    Swap {
        /// Predecessor of `old` at execution time
        prev_owner: Address,
        /// Owner being replaced
        old: Address,
        /// Replacement owner
        new: Address,
    },
    /// Add `new` and set the threshold in the same call
    AddWithThreshold {
        /// Owner being added
        new: Address,
        /// Threshold after the addition
        threshold: usize,
    },
    /// Remove `old` and set the threshold in the same call
    RemoveWithThreshold {
        /// Predecessor of `old` at execution time
        prev_owner: Address,
        /// Owner being removed
        old: Address,
        /// Threshold after the removal
        threshold: usize,
    },
    /// Change the threshold only
    ChangeThreshold {
        /// New threshold
        threshold: usize,
    },
}

impl MutationOperation {
    /// Contract method name of the primitive
    pub fn method(&self) -> &'static str {
        match self {
            MutationOperation::Swap { .. } => "swapOwner",
            MutationOperation::AddWithThreshold { .. } => "addOwnerWithThreshold",
            MutationOperation::RemoveWithThreshold { .. } => "removeOwner",
            MutationOperation::ChangeThreshold { .. } => "changeThreshold",
        }
    }

    /// Threshold value the primitive sets, if any
    pub fn threshold(&self) -> Option<usize> {
        match self {
            MutationOperation::Swap { .. } => None,
            MutationOperation::AddWithThreshold { threshold, .. }
            | MutationOperation::RemoveWithThreshold { threshold, .. }
            | MutationOperation::ChangeThreshold { threshold } => Some(*threshold),
        }
    }
}

/// In-memory stand-in for the on-chain owner linked list.
///
/// Slots are indices into a vector; the predecessor of slot `i` is slot
/// `i - 1`, or the sentinel for slot `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerList {
    slots: Vec<Address>,
    threshold: usize,
}

impl OwnerList {
    /// Start a simulation from an owner set
    pub fn new(owners: &OwnerSet) -> Self {
        Self {
            slots: owners.owners.clone(),
            threshold: owners.threshold,
        }
    }

    /// Owners in list order
    pub fn owners(&self) -> &[Address] {
        &self.slots
    }

    /// Current threshold
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Number of owners
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn position(&self, owner: &Address) -> Option<usize> {
        self.slots.iter().position(|slot| slot == owner)
    }

    /// Predecessor pointer of `owner`, the sentinel for the head
    pub fn prev_owner(&self, owner: &Address) -> Option<Address> {
        let index = self.position(owner)?;
        Some(match index {
            0 => Address::sentinel(),
            i => self.slots[i - 1].clone(),
        })
    }

    /// Apply one primitive. Returns `false` if it would be rejected on-chain.
    pub fn apply(&mut self, operation: &MutationOperation) -> bool {
        match operation {
            MutationOperation::Swap {
                prev_owner,
                old,
                new,
            } => {
                if self.prev_owner(old).as_ref() != Some(prev_owner) || self.position(new).is_some()
                {
                    return false;
                }
                if let Some(index) = self.position(old) {
                    self.slots[index] = new.clone();
                }
                true
            }
            MutationOperation::AddWithThreshold { new, threshold } => {
                if self.position(new).is_some() {
                    return false;
                }
                // addOwnerWithThreshold links the new owner directly after the sentinel
                self.slots.insert(0, new.clone());
                self.set_threshold(*threshold)
            }
            MutationOperation::RemoveWithThreshold {
                prev_owner,
                old,
                threshold,
            } => {
                if self.prev_owner(old).as_ref() != Some(prev_owner) {
                    return false;
                }
                self.slots.retain(|slot| slot != old);
                self.set_threshold(*threshold)
            }
            MutationOperation::ChangeThreshold { threshold } => self.set_threshold(*threshold),
        }
    }

    fn set_threshold(&mut self, threshold: usize) -> bool {
        if threshold == 0 || threshold > self.slots.len() {
            return false;
        }
        self.threshold = threshold;
        true
    }
}

/// Order-preserving `left - right`
fn difference(left: &[Address], right: &[Address]) -> Vec<Address> {
    left.iter()
        .filter(|owner| !right.contains(owner))
        .cloned()
        .collect()
}

/// Plan the primitives that take `current` to `target`.
///
/// Fails with `InvalidTarget` if `target` is not a valid owner set. Pure and
/// deterministic.
pub fn plan(current: &OwnerSet, target: &OwnerSet) -> Result<Vec<MutationOperation>> {
    target.validate()?;

    let to_add = difference(&target.owners, &current.owners);
    let to_remove = difference(&current.owners, &target.owners);
    let mut change_threshold = target.threshold != current.threshold;

    let mut simulated = OwnerList::new(current);
    let mut operations = Vec::with_capacity(to_add.len().max(to_remove.len()) + 1);

    for i in 0..to_add.len().max(to_remove.len()) {
        let operation = match (to_add.get(i), to_remove.get(i)) {
            (Some(new), Some(old)) => MutationOperation::Swap {
                prev_owner: simulated
                    .prev_owner(old)
                    .unwrap_or_else(Address::sentinel),
                old: old.clone(),
                new: new.clone(),
            },
            (Some(new), None) => {
                change_threshold = false;
                MutationOperation::AddWithThreshold {
                    new: new.clone(),
                    threshold: target.threshold.min(simulated.len() + 1),
                }
            }
            (None, Some(old)) => {
                change_threshold = false;
                MutationOperation::RemoveWithThreshold {
                    prev_owner: simulated
                        .prev_owner(old)
                        .unwrap_or_else(Address::sentinel),
                    old: old.clone(),
                    threshold: target.threshold.min(simulated.len().saturating_sub(1)),
                }
            }
            (None, None) => break,
        };

        simulated.apply(&operation);
        operations.push(operation);
    }

    if change_threshold {
        operations.push(MutationOperation::ChangeThreshold {
            threshold: target.threshold,
        });
    }

    debug!(
        added = to_add.len(),
        removed = to_remove.len(),
        operations = operations.len(),
        "Planned owner mutation"
    );

    Ok(operations)
}
