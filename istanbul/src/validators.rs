//! Ordered validator sets with deterministic proposer selection.

use crate::{types::Address, Error};
use bytes::Bytes;
use commonware_utils::hex;
use tracing::debug;

/// Rule used to select the proposer of a round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProposerPolicy {
    /// Rotate to the next validator after every block and every round change.
    #[default]
    RoundRobin,
    /// Keep the last proposer until a round change forces rotation.
    Sticky,
}

/// Formula used to compute the size of a quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumFormula {
    /// `2F + 1`.
    Legacy,
    /// `ceil(2N / 3)`.
    Ceil,
}

/// Ordered set of validator addresses.
///
/// Validators are sorted by address so every participant derives the same
/// index (and therefore the same proposer) for a given validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Address>,
    policy: ProposerPolicy,
    proposer: Option<Address>,
}

impl ValidatorSet {
    /// Create a new set from unordered (and possibly duplicated) addresses.
    ///
    /// The first validator (in sorted order) is selected as proposer until
    /// [ValidatorSet::calc_proposer] is called.
    pub fn new(mut validators: Vec<Address>, policy: ProposerPolicy) -> Self {
        validators.sort();
        validators.dedup();
        let proposer = validators.first().copied();
        Self {
            validators,
            policy,
            proposer,
        }
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Returns whether the set has no validators.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Validators in sorted order.
    pub fn list(&self) -> &[Address] {
        &self.validators
    }

    /// Proposer selection policy of the set.
    pub fn policy(&self) -> ProposerPolicy {
        self.policy
    }

    /// Maximum number of faulty validators tolerated: `floor((N - 1) / 3)`.
    pub fn f(&self) -> usize {
        self.validators.len().saturating_sub(1) / 3
    }

    /// Number of matching messages required to act.
    pub fn quorum(&self, formula: QuorumFormula) -> usize {
        match formula {
            QuorumFormula::Legacy => 2 * self.f() + 1,
            QuorumFormula::Ceil => (2 * self.validators.len()).div_ceil(3),
        }
    }

    /// Index and address of a validator, if present.
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Address)> {
        self.validators
            .binary_search(address)
            .ok()
            .map(|index| (index, &self.validators[index]))
    }

    /// Address of the validator at `index`, if present.
    pub fn get_by_index(&self, index: usize) -> Option<&Address> {
        self.validators.get(index)
    }

    /// Returns whether `address` is a member of the set.
    pub fn contains(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Currently selected proposer.
    pub fn proposer(&self) -> Option<&Address> {
        self.proposer.as_ref()
    }

    /// Returns whether `address` is the currently selected proposer.
    pub fn is_proposer(&self, address: &Address) -> bool {
        self.proposer.as_ref() == Some(address)
    }

    /// Select the proposer of `round` given the proposer of the last finalized block.
    pub fn calc_proposer(&mut self, last: Option<&Address>, round: u64) {
        self.proposer = self.select(last, round);
    }

    /// Proposer of `round` given the proposer of the last finalized block.
    ///
    /// This is a pure function of the sorted set, `last`, and `round`. A `last`
    /// proposer outside the set counts as index 0.
    pub fn select(&self, last: Option<&Address>, round: u64) -> Option<Address> {
        if self.validators.is_empty() {
            return None;
        }
        let n = self.validators.len() as u64;
        let seed = match last {
            None => round,
            Some(last) => {
                let offset = self
                    .get_by_address(last)
                    .map_or(0, |(index, _)| index as u64);
                match self.policy {
                    ProposerPolicy::RoundRobin => offset + round + 1,
                    ProposerPolicy::Sticky => offset + round,
                }
            }
        };
        Some(self.validators[(seed % n) as usize])
    }

    /// Add a validator, returning whether the set changed.
    pub fn add(&mut self, address: Address) -> bool {
        match self.validators.binary_search(&address) {
            Ok(_) => false,
            Err(index) => {
                self.validators.insert(index, address);
                true
            }
        }
    }

    /// Remove a validator, returning whether the set changed.
    pub fn remove(&mut self, address: &Address) -> bool {
        match self.validators.binary_search(address) {
            Ok(index) => {
                self.validators.remove(index);
                if self.proposer.as_ref() == Some(address) {
                    self.proposer = None;
                }
                true
            }
            Err(_) => false,
        }
    }
}

/// Verify that `seals` contain more than `F` distinct validator signatures over `data`.
///
/// `recover` returns the address that produced a seal. Signers are removed from a
/// copy of `validators` as they are counted, so a validator sealing twice (or a
/// signer outside the set) invalidates the whole collection.
pub fn verify_committed_seals<R>(
    validators: &ValidatorSet,
    data: &[u8],
    seals: &[Bytes],
    recover: R,
) -> Result<(), Error>
where
    R: Fn(&[u8], &[u8]) -> Result<Address, Error>,
{
    if seals.is_empty() {
        return Err(Error::EmptyCommittedSeals);
    }

    // Remove each signer as it is counted
    let mut remaining = validators.clone();
    let mut valid = 0;
    for seal in seals {
        let signer = recover(data, seal).map_err(|_| Error::InvalidCommittedSeals)?;
        if !remaining.remove(&signer) {
            debug!(signer = %hex(&signer), "seal from unknown or repeated signer");
            return Err(Error::InvalidCommittedSeals);
        }
        valid += 1;
    }
    if valid <= validators.f() {
        return Err(Error::InvalidCommittedSeals);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{recover, Signer};

    fn addresses(n: u8) -> Vec<Address> {
        (0..n).map(|i| [i + 1; 20]).collect()
    }

    #[test]
    fn test_quorum_arithmetic() {
        // (n, f, legacy, ceil)
        let cases = [
            (1, 0, 1, 1),
            (2, 0, 1, 2),
            (3, 0, 1, 2),
            (4, 1, 3, 3),
            (5, 1, 3, 4),
            (6, 1, 3, 4),
            (7, 2, 5, 5),
            (10, 3, 7, 7),
            (100, 33, 67, 67),
        ];
        for (n, f, legacy, ceil) in cases {
            let set = ValidatorSet::new(addresses(n), ProposerPolicy::RoundRobin);
            assert_eq!(set.f(), f, "n={n}");
            assert_eq!(set.quorum(QuorumFormula::Legacy), legacy, "n={n}");
            assert_eq!(set.quorum(QuorumFormula::Ceil), ceil, "n={n}");
            assert!(set.quorum(QuorumFormula::Ceil) <= set.len());
            assert!(set.quorum(QuorumFormula::Legacy) > 2 * set.f());
        }
    }

    #[test]
    fn test_sorted_and_deduplicated() {
        let set = ValidatorSet::new(
            vec![[3; 20], [1; 20], [2; 20], [1; 20]],
            ProposerPolicy::RoundRobin,
        );
        assert_eq!(set.list(), &[[1; 20], [2; 20], [3; 20]]);
        assert_eq!(set.proposer(), Some(&[1; 20]));
    }

    #[test]
    fn test_round_robin_proposer() {
        let mut set = ValidatorSet::new(addresses(4), ProposerPolicy::RoundRobin);
        let list = set.list().to_vec();

        // Without a last proposer, the round selects the index
        for round in 0..8 {
            set.calc_proposer(None, round);
            assert_eq!(set.proposer(), Some(&list[(round % 4) as usize]));
        }

        // With a last proposer, rotate past it
        for last in 0..4usize {
            for round in 0..8u64 {
                set.calc_proposer(Some(&list[last]), round);
                let expected = (last + 1 + round as usize) % 4;
                assert_eq!(set.proposer(), Some(&list[expected]));
                assert!(set.is_proposer(&list[expected]));
            }
        }

        // Unknown last proposer rotates past index 0
        for round in 0..8u64 {
            set.calc_proposer(Some(&[0xff; 20]), round);
            assert_eq!(set.proposer(), Some(&list[((round + 1) % 4) as usize]));
        }

        // Removing the last proposer keeps rotating from the front of the set
        let removed = list[3];
        assert!(set.remove(&removed));
        set.calc_proposer(Some(&removed), 0);
        assert_eq!(set.proposer(), Some(&list[1]));
    }

    #[test]
    fn test_sticky_proposer() {
        let mut set = ValidatorSet::new(addresses(4), ProposerPolicy::Sticky);
        let list = set.list().to_vec();
        set.calc_proposer(Some(&list[2]), 0);
        assert_eq!(set.proposer(), Some(&list[2]));
        set.calc_proposer(Some(&list[2]), 1);
        assert_eq!(set.proposer(), Some(&list[3]));
        set.calc_proposer(Some(&list[2]), 2);
        assert_eq!(set.proposer(), Some(&list[0]));
        set.calc_proposer(None, 3);
        assert_eq!(set.proposer(), Some(&list[3]));

        // Unknown last proposer sticks to index 0
        set.calc_proposer(Some(&[0xff; 20]), 0);
        assert_eq!(set.proposer(), Some(&list[0]));
        set.calc_proposer(Some(&[0xff; 20]), 1);
        assert_eq!(set.proposer(), Some(&list[1]));
    }

    #[test]
    fn test_proposer_determinism() {
        let a = ValidatorSet::new(addresses(7), ProposerPolicy::RoundRobin);
        let mut shuffled = addresses(7);
        shuffled.reverse();
        let b = ValidatorSet::new(shuffled, ProposerPolicy::RoundRobin);
        let last = [3; 20];
        for round in 0..20 {
            assert_eq!(a.select(Some(&last), round), a.select(Some(&last), round));
            assert_eq!(a.select(Some(&last), round), b.select(Some(&last), round));
        }
    }

    #[test]
    fn test_add_remove() {
        let mut set = ValidatorSet::new(addresses(3), ProposerPolicy::RoundRobin);
        assert!(!set.add([1; 20]));
        assert!(set.add([9; 20]));
        assert_eq!(set.len(), 4);
        assert_eq!(set.get_by_address(&[9; 20]), Some((3, &[9; 20])));
        assert!(set.remove(&[2; 20]));
        assert!(!set.remove(&[2; 20]));
        assert_eq!(set.get_by_address(&[2; 20]), None);
        assert_eq!(set.get_by_index(1), Some(&[3; 20]));
        assert_eq!(set.get_by_index(5), None);

        // Removing the proposer clears the selection
        assert!(set.remove(&[1; 20]));
        assert_eq!(set.proposer(), None);
    }

    #[test]
    fn test_copy_is_independent() {
        let set = ValidatorSet::new(addresses(4), ProposerPolicy::RoundRobin);
        let mut copy = set.clone();
        assert!(copy.remove(&[1; 20]));
        assert_eq!(set.len(), 4);
        assert_eq!(copy.len(), 3);
    }

    #[test]
    fn test_empty_set() {
        let mut set = ValidatorSet::new(Vec::new(), ProposerPolicy::RoundRobin);
        assert!(set.is_empty());
        assert_eq!(set.f(), 0);
        set.calc_proposer(None, 3);
        assert_eq!(set.proposer(), None);
    }

    #[test]
    fn test_verify_committed_seals() {
        let signers: Vec<_> = (0..4).map(Signer::from_seed).collect();
        let set = ValidatorSet::new(
            signers.iter().map(|s| s.address()).collect(),
            ProposerPolicy::RoundRobin,
        );
        let data = b"sealed";
        let seals: Vec<_> = signers.iter().map(|s| s.sign(data)).collect();

        // Quorum of seals
        assert!(verify_committed_seals(&set, data, &seals[..3], recover).is_ok());

        // Any order
        let reversed: Vec<_> = seals.iter().rev().cloned().collect();
        assert!(verify_committed_seals(&set, data, &reversed, recover).is_ok());

        // Empty
        assert!(matches!(
            verify_committed_seals(&set, data, &[], recover),
            Err(Error::EmptyCommittedSeals)
        ));

        // Not more than F
        assert!(matches!(
            verify_committed_seals(&set, data, &seals[..1], recover),
            Err(Error::InvalidCommittedSeals)
        ));

        // Repeated signer
        let repeated = vec![seals[0].clone(), seals[0].clone(), seals[1].clone()];
        assert!(matches!(
            verify_committed_seals(&set, data, &repeated, recover),
            Err(Error::InvalidCommittedSeals)
        ));

        // Signer outside the set
        let outsider = Signer::from_seed(99).sign(data);
        let foreign = vec![seals[0].clone(), outsider];
        assert!(matches!(
            verify_committed_seals(&set, data, &foreign, recover),
            Err(Error::InvalidCommittedSeals)
        ));

        // Seal over other data
        let wrong = vec![seals[0].clone(), signers[1].sign(b"other")];
        assert!(matches!(
            verify_committed_seals(&set, data, &wrong, recover),
            Err(Error::InvalidCommittedSeals)
        ));
    }
}
