//! Accumulators of validator messages keyed by sender.

use crate::{types::Address, Error};
use commonware_utils::hex;
use std::collections::{btree_map::Entry, BTreeMap};
use tracing::warn;

/// Messages of one kind, at most one per sender.
///
/// The first message from a sender is kept. Repeating the same message is a
/// no-op, while a different message from the same sender is rejected as
/// [Error::Equivocation] and does not replace the original.
#[derive(Clone, Debug)]
pub struct MessageSet<M> {
    messages: BTreeMap<Address, M>,
}

impl<M> Default for MessageSet<M> {
    fn default() -> Self {
        Self {
            messages: BTreeMap::new(),
        }
    }
}

impl<M: PartialEq> MessageSet<M> {
    /// Add `message` from `source`, returning whether the set grew.
    pub fn add(&mut self, source: Address, message: M) -> Result<bool, Error> {
        match self.messages.entry(source) {
            Entry::Vacant(entry) => {
                entry.insert(message);
                Ok(true)
            }
            Entry::Occupied(entry) => {
                if *entry.get() == message {
                    return Ok(false);
                }
                warn!(source = %hex(&source), "conflicting message from sender");
                Err(Error::Equivocation)
            }
        }
    }
}

impl<M> MessageSet<M> {
    /// Number of distinct senders.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns whether no message has been added.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Message from `source`, if any.
    pub fn get(&self, source: &Address) -> Option<&M> {
        self.messages.get(source)
    }

    /// Messages ordered by sender.
    pub fn values(&self) -> impl Iterator<Item = &M> {
        self.messages.values()
    }

    /// Senders in order.
    pub fn senders(&self) -> impl Iterator<Item = &Address> {
        self.messages.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_add() {
        let mut set = MessageSet::default();
        assert!(set.add([1; 20], "prepare").unwrap());
        assert!(!set.add([1; 20], "prepare").unwrap());
        assert_eq!(set.len(), 1);
        assert!(set.add([2; 20], "prepare").unwrap());
        assert_eq!(set.len(), 2);
        assert_eq!(set.senders().collect::<Vec<_>>(), vec![&[1; 20], &[2; 20]]);
    }

    #[test]
    fn test_first_write_wins() {
        let mut set = MessageSet::default();
        assert!(set.add([1; 20], "a").unwrap());
        assert!(matches!(set.add([1; 20], "b"), Err(Error::Equivocation)));
        assert_eq!(set.get(&[1; 20]), Some(&"a"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.values().collect::<Vec<_>>(), vec![&"a"]);
    }
}
