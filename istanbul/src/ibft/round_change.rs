//! ROUND-CHANGE messages collected for the current sequence.

use super::types::Message;
use crate::{message_set::MessageSet, Address, Error, Proposal};
use std::collections::BTreeMap;

/// ROUND-CHANGE messages indexed by target round.
pub struct RoundChangeSet<P: Proposal> {
    rounds: BTreeMap<u64, MessageSet<Message<P>>>,
}

impl<P: Proposal> Default for RoundChangeSet<P> {
    fn default() -> Self {
        Self {
            rounds: BTreeMap::new(),
        }
    }
}

impl<P: Proposal> RoundChangeSet<P> {
    /// Add a ROUND-CHANGE from `source` for `round`, returning the number of
    /// distinct senders for that round.
    pub fn add(
        &mut self,
        round: u64,
        source: Address,
        message: Message<P>,
    ) -> Result<usize, Error> {
        let messages = self.rounds.entry(round).or_default();
        messages.add(source, message)?;
        Ok(messages.len())
    }

    /// Drop rounds lower than `round` and rounds without messages.
    pub fn clear(&mut self, round: u64) {
        self.rounds
            .retain(|r, messages| *r >= round && !messages.is_empty());
    }

    /// Highest round with at least `threshold` messages.
    pub fn max_round(&self, threshold: usize) -> Option<u64> {
        self.rounds
            .iter()
            .rev()
            .find(|(_, messages)| messages.len() >= threshold)
            .map(|(r, _)| *r)
    }
}
