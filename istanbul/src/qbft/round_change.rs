//! ROUND-CHANGE messages collected for the current sequence.

use super::{
    justification::has_matching_round_change_and_prepares,
    types::{Prepare, RoundChange, Verified},
};
use crate::{message_set::MessageSet, Error, Proposal};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Highest prepared block reported for a round, with the PREPAREs proving it.
#[derive(Clone, Debug, PartialEq)]
pub struct HighestPrepared<P: Proposal> {
    pub round: u64,
    pub block: P,
    pub prepares: Vec<Verified<Prepare>>,
}

/// ROUND-CHANGE messages of one round.
struct Round<P: Proposal> {
    messages: MessageSet<Verified<RoundChange>>,
    highest: Option<HighestPrepared<P>>,
}

impl<P: Proposal> Default for Round<P> {
    fn default() -> Self {
        Self {
            messages: MessageSet::default(),
            highest: None,
        }
    }
}

/// ROUND-CHANGE messages indexed by target round.
pub struct RoundChangeSet<P: Proposal> {
    rounds: BTreeMap<u64, Round<P>>,
}

impl<P: Proposal> Default for RoundChangeSet<P> {
    fn default() -> Self {
        Self {
            rounds: BTreeMap::new(),
        }
    }
}

impl<P: Proposal> RoundChangeSet<P> {
    /// Ensure `round` is tracked.
    pub fn new_round(&mut self, round: u64) {
        self.rounds.entry(round).or_default();
    }

    /// Add a ROUND-CHANGE for `round`, returning whether it was new.
    ///
    /// If the message reports a prepared block proven by `prepares` and prepared in a
    /// higher round than any previously seen for `round`, it becomes the highest
    /// prepared block of `round`.
    pub fn add(
        &mut self,
        round: u64,
        message: Verified<RoundChange>,
        prepared_block: Option<P>,
        prepares: Vec<Verified<Prepare>>,
        quorum: usize,
    ) -> Result<bool, Error> {
        let entry = self.rounds.entry(round).or_default();
        let payload = message.payload().clone();
        let added = entry.messages.add(message.source, message)?;

        let (Some(prepared), Some(block)) = (payload.prepared, prepared_block) else {
            return Ok(added);
        };
        if prepares.is_empty() {
            return Ok(added);
        }
        if matches!(&entry.highest, Some(highest) if highest.round >= prepared.round) {
            return Ok(added);
        }
        if block.hash() != prepared.digest {
            debug!(round, "prepared block does not match prepared digest");
            return Ok(added);
        }
        match has_matching_round_change_and_prepares(&payload, &prepares, quorum) {
            Ok(()) => {
                entry.highest = Some(HighestPrepared {
                    round: prepared.round,
                    block,
                    prepares,
                });
            }
            Err(err) => debug!(?err, round, "prepared block not proven"),
        }
        Ok(added)
    }

    /// Number of distinct senders of ROUND-CHANGE messages for rounds greater than `round`.
    pub fn higher_round_messages(&self, round: u64) -> usize {
        let mut senders: BTreeSet<&crate::types::Address> = BTreeSet::new();
        for (_, entry) in self.rounds.range(round.saturating_add(1)..) {
            senders.extend(entry.messages.senders());
        }
        senders.len()
    }

    /// Number of ROUND-CHANGE messages for `round`.
    pub fn messages_for_round(&self, round: u64) -> usize {
        self.rounds.get(&round).map_or(0, |entry| entry.messages.len())
    }

    /// ROUND-CHANGE messages for `round`, ordered by sender.
    pub fn round_changes(&self, round: u64) -> Vec<Verified<RoundChange>> {
        self.rounds
            .get(&round)
            .map(|entry| entry.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Smallest tracked round greater than `round` (or `round` if there is none).
    pub fn min_round_above(&self, round: u64) -> u64 {
        self.rounds
            .range(round.saturating_add(1)..)
            .next()
            .map_or(round, |(r, _)| *r)
    }

    /// Drop rounds lower than `round` and rounds without messages.
    pub fn clear_lower_than(&mut self, round: u64) {
        self.rounds
            .retain(|r, entry| *r >= round && !entry.messages.is_empty());
    }

    /// Highest round with at least `threshold` messages.
    pub fn max_round(&self, threshold: usize) -> Option<u64> {
        self.rounds
            .iter()
            .rev()
            .find(|(_, entry)| entry.messages.len() >= threshold)
            .map(|(r, _)| *r)
    }

    /// Highest prepared block reported for `round`.
    pub fn highest_prepared(&self, round: u64) -> Option<&HighestPrepared<P>> {
        self.rounds.get(&round).and_then(|entry| entry.highest.as_ref())
    }
}
