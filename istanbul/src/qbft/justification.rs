//! Predicates deciding whether a re-proposal after a round change is safe.
//!
//! A PRE-PREPARE for a round greater than zero must be justified by a quorum of
//! ROUND-CHANGE messages for that round. If any of them reports a prepared block,
//! the proposal must be the block prepared in the highest reported round, proven by
//! a quorum of PREPAREs from that round.

use super::types::{Prepare, RoundChange, Verified};
use crate::{types::EMPTY_DIGEST, Address, Digest, Error};
use std::collections::BTreeSet;

/// Keep the first message of each sender.
fn distinct<'a, T, F>(messages: &'a [T], source: F) -> Vec<&'a T>
where
    F: Fn(&T) -> Address,
{
    let mut seen = BTreeSet::new();
    messages.iter().filter(|m| seen.insert(source(*m))).collect()
}

/// Returns whether a ROUND-CHANGE reports no prepared block.
fn is_unprepared(round_change: &RoundChange) -> bool {
    match round_change.prepared {
        None => true,
        Some(prepared) => prepared.round == 0 && prepared.digest == EMPTY_DIGEST,
    }
}

/// Check that a proposal with `digest` is justified by `round_changes` and `prepares`.
///
/// Messages are counted once per sender.
pub fn is_justified(
    digest: &Digest,
    round_changes: &[Verified<RoundChange>],
    prepares: &[Verified<Prepare>],
    quorum: usize,
) -> Result<(), Error> {
    let round_changes = distinct(round_changes, |m| m.source);
    let prepares = distinct(prepares, |m| m.source);
    if round_changes.len() < quorum {
        return Err(Error::Unjustified("fewer ROUND-CHANGE messages than quorum"));
    }
    if !prepares.is_empty() && prepares.len() < quorum {
        return Err(Error::Unjustified("fewer PREPARE messages than quorum"));
    }

    // All PREPAREs must vote for the proposal in the same round
    let Some(first) = prepares.first() else {
        let unprepared = round_changes
            .iter()
            .filter(|m| is_unprepared(m.payload()))
            .count();
        if unprepared < quorum {
            return Err(Error::Unjustified(
                "no quorum of ROUND-CHANGE messages without prepared block",
            ));
        }
        return Ok(());
    };
    let prepared_round = first.payload().view.round;
    if prepares
        .iter()
        .any(|m| m.payload().view.round != prepared_round || m.payload().digest != *digest)
    {
        return Err(Error::Unjustified(
            "PREPARE messages differ in round or do not match proposal",
        ));
    }

    // A quorum must have prepared nothing newer, and one must have prepared the proposal
    let mut lower_or_equal = 0;
    let mut matching = false;
    for round_change in round_changes {
        match round_change.payload().prepared {
            None => lower_or_equal += 1,
            Some(prepared) if prepared.round <= prepared_round => {
                lower_or_equal += 1;
                if prepared.round == prepared_round && prepared.digest == *digest {
                    matching = true;
                }
            }
            Some(_) => {}
        }
    }
    if lower_or_equal < quorum || !matching {
        return Err(Error::Unjustified(
            "no quorum of ROUND-CHANGE messages for prepared round and proposal",
        ));
    }
    Ok(())
}

/// Check that `prepares` prove the prepared round and digest reported by `round_change`.
pub fn has_matching_round_change_and_prepares(
    round_change: &RoundChange,
    prepares: &[Verified<Prepare>],
    quorum: usize,
) -> Result<(), Error> {
    let Some(prepared) = round_change.prepared else {
        return Err(Error::Unjustified("ROUND-CHANGE has no prepared block"));
    };
    let prepares = distinct(prepares, |m| m.source);
    if prepares.len() < quorum {
        return Err(Error::Unjustified("fewer PREPARE messages than quorum"));
    }
    for prepare in prepares {
        if prepare.payload().digest != prepared.digest {
            return Err(Error::Unjustified(
                "PREPARE digest does not match prepared digest",
            ));
        }
        if prepare.payload().view.round != prepared.round {
            return Err(Error::Unjustified(
                "PREPARE round does not match prepared round",
            ));
        }
    }
    Ok(())
}
