//! Messages and requests received for a view the local node has not reached yet.

use crate::{
    types::{Address, Code, View},
    validators::ValidatorSet,
    Error, Proposal,
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap},
};

/// Replay order of a backlogged message (lowest first).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority {
    sequence: u64,
    round: u64,
    code: u8,
}

impl Priority {
    /// ROUND-CHANGE messages are only ordered by sequence. Other messages are
    /// ordered by view and then by [Code::priority].
    pub fn new(code: Code, view: View) -> Self {
        match code {
            Code::RoundChange => Self {
                sequence: view.sequence,
                round: 0,
                code: code.priority(),
            },
            _ => Self {
                sequence: view.sequence,
                round: view.round,
                code: code.priority(),
            },
        }
    }
}

struct Entry<M> {
    priority: Priority,
    index: u64,
    message: M,
}

impl<M> PartialEq for Entry<M> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.index == other.index
    }
}

impl<M> Eq for Entry<M> {}

impl<M> PartialOrd for Entry<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Entry<M> {
    // Reversed so the max-heap pops the lowest priority (and the oldest entry on ties)
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Future messages queued per sender.
pub struct Backlog<M> {
    queues: BTreeMap<Address, BinaryHeap<Entry<M>>>,
    max_per_sender: usize,
    next: u64,
}

impl<M> Backlog<M> {
    /// Create a backlog holding at most `max_per_sender` messages of each sender.
    pub fn new(max_per_sender: usize) -> Self {
        Self {
            queues: BTreeMap::new(),
            max_per_sender,
            next: 0,
        }
    }

    /// Queue `message` from `source`.
    ///
    /// When the queue of `source` is full, the message replayed last (the furthest
    /// in the future) is dropped and returned. This may be `message` itself.
    pub fn push(&mut self, source: Address, priority: Priority, message: M) -> Option<M> {
        let index = self.next;
        self.next += 1;
        let entry = Entry {
            priority,
            index,
            message,
        };
        let queue = self.queues.entry(source).or_default();
        if queue.len() < self.max_per_sender {
            queue.push(entry);
            return None;
        }

        // Entries compare in reverse, so the smallest is replayed last
        let mut entries = std::mem::take(queue).into_vec();
        entries.push(entry);
        let last = entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(i, _)| i)?;
        let dropped = entries.swap_remove(last);
        *queue = entries.into();
        Some(dropped.message)
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queues.values().map(BinaryHeap::len).sum()
    }

    /// Remove every message that `check` accepts, in replay order.
    ///
    /// Messages `check` rejects as [Error::FutureMessage] stay queued. They do not
    /// hold back later messages of the same sender, as a message of a lower priority
    /// (a PREPARE queued behind a COMMIT of the same view) may be current already.
    /// Messages rejected for any other reason are dropped, as are the queues of
    /// senders no longer in `validators`.
    pub fn drain<F>(&mut self, validators: &ValidatorSet, mut check: F) -> Vec<(Address, M)>
    where
        F: FnMut(&M) -> Result<(), Error>,
    {
        self.queues.retain(|source, _| validators.contains(source));

        let mut ready = Vec::new();
        for (source, queue) in self.queues.iter_mut() {
            let mut deferred = Vec::new();
            while let Some(entry) = queue.pop() {
                match check(&entry.message) {
                    Ok(()) => ready.push((*source, entry.message)),
                    Err(Error::FutureMessage) => deferred.push(entry),
                    Err(_) => {}
                }
            }
            queue.extend(deferred);
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        ready
    }
}

/// Proposal requests for a future sequence.
pub struct Requests<P: Proposal> {
    pending: BTreeMap<u64, Vec<P>>,
}

impl<P: Proposal> Default for Requests<P> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<P: Proposal> Requests<P> {
    /// Store a request for later.
    pub fn push(&mut self, proposal: P) {
        self.pending
            .entry(proposal.number())
            .or_default()
            .push(proposal);
    }

    /// Remove requests for `sequence` (returned) and for earlier sequences (dropped).
    pub fn take(&mut self, sequence: u64) -> Vec<P> {
        let later = self.pending.split_off(&sequence.saturating_add(1));
        let mut earlier = std::mem::replace(&mut self.pending, later);
        earlier.remove(&sequence).unwrap_or_default()
    }

    /// Number of stored requests.
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks::block::Block, validators::ProposerPolicy};

    fn validators() -> ValidatorSet {
        ValidatorSet::new(vec![[1; 20], [2; 20]], ProposerPolicy::RoundRobin)
    }

    #[test]
    fn test_replay_order() {
        let mut backlog = Backlog::new(16);
        let source = [1; 20];
        let entries = [
            (Code::Prepare, View::new(5, 0)),
            (Code::Commit, View::new(5, 0)),
            (Code::Preprepare, View::new(5, 0)),
            (Code::Preprepare, View::new(5, 1)),
            (Code::Prepare, View::new(4, 3)),
            (Code::RoundChange, View::new(5, 2)),
        ];
        for (code, view) in entries {
            backlog.push(source, Priority::new(code, view), (code, view));
        }
        let ready: Vec<_> = backlog
            .drain(&validators(), |_| Ok(()))
            .into_iter()
            .map(|(_, message)| message)
            .collect();
        assert_eq!(
            ready,
            vec![
                (Code::Prepare, View::new(4, 3)),
                (Code::RoundChange, View::new(5, 2)),
                (Code::Preprepare, View::new(5, 0)),
                (Code::Commit, View::new(5, 0)),
                (Code::Prepare, View::new(5, 0)),
                (Code::Preprepare, View::new(5, 1)),
            ]
        );
        assert_eq!(backlog.len(), 0);
    }

    #[test]
    fn test_future_does_not_block_sender() {
        let mut backlog = Backlog::new(16);
        let view = View::new(1, 0);
        backlog.push([1; 20], Priority::new(Code::Commit, view), (Code::Commit, view));
        backlog.push([1; 20], Priority::new(Code::Prepare, view), (Code::Prepare, view));

        // The COMMIT is replayed first but is not current yet
        let ready = backlog.drain(&validators(), |(code, _)| match code {
            Code::Commit => Err(Error::FutureMessage),
            _ => Ok(()),
        });
        assert_eq!(ready, vec![([1; 20], (Code::Prepare, view))]);
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn test_future_kept() {
        let mut backlog = Backlog::new(16);
        for round in 0..3 {
            let view = View::new(1, round);
            backlog.push([1; 20], Priority::new(Code::Prepare, view), view);
            backlog.push([2; 20], Priority::new(Code::Prepare, view), view);
        }

        // Only round 0 is current
        let ready = backlog.drain(&validators(), |view| match view.round {
            0 => Ok(()),
            _ => Err(Error::FutureMessage),
        });
        assert_eq!(ready.len(), 2);
        assert_eq!(backlog.len(), 4);

        // Round 1 is old, round 2 is current
        let ready = backlog.drain(&validators(), |view| match view.round {
            1 => Err(Error::OldMessage),
            _ => Ok(()),
        });
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|(_, view)| view.round == 2));
        assert_eq!(backlog.len(), 0);
    }

    #[test]
    fn test_unknown_sender_dropped() {
        let mut backlog = Backlog::new(16);
        let view = View::new(1, 0);
        backlog.push([9; 20], Priority::new(Code::Commit, view), view);
        assert_eq!(backlog.len(), 1);
        let ready = backlog.drain(&validators(), |_| Ok(()));
        assert!(ready.is_empty());
        assert_eq!(backlog.len(), 0);
    }

    #[test]
    fn test_sender_capacity() {
        let mut backlog = Backlog::new(3);
        let source = [1; 20];
        for sequence in [4, 2, 3] {
            let view = View::new(sequence, 0);
            assert!(backlog
                .push(source, Priority::new(Code::Prepare, view), sequence)
                .is_none());
        }

        // A nearer message evicts the furthest one
        let view = View::new(1, 0);
        let dropped = backlog.push(source, Priority::new(Code::Prepare, view), 1);
        assert_eq!(dropped, Some(4));

        // A further message is dropped itself
        let view = View::new(9, 0);
        let dropped = backlog.push(source, Priority::new(Code::Prepare, view), 9);
        assert_eq!(dropped, Some(9));

        // Other senders have their own capacity
        let view = View::new(9, 0);
        assert!(backlog
            .push([2; 20], Priority::new(Code::Prepare, view), 9)
            .is_none());
        assert_eq!(backlog.len(), 4);

        let ready: Vec<_> = backlog
            .drain(&validators(), |_| Ok(()))
            .into_iter()
            .map(|(_, sequence)| sequence)
            .collect();
        assert_eq!(ready, vec![1, 2, 3, 9]);
    }

    #[test]
    fn test_requests() {
        let mut requests = Requests::default();
        requests.push(Block::new(3, 0));
        requests.push(Block::new(5, 0));
        requests.push(Block::new(4, 0));
        requests.push(Block::new(4, 1));
        assert_eq!(requests.len(), 4);

        // Nothing for sequence 2
        assert!(requests.take(2).is_empty());
        assert_eq!(requests.len(), 4);

        // Sequence 4 drops 3 and keeps 5
        let ready = requests.take(4);
        assert_eq!(ready, vec![Block::new(4, 0), Block::new(4, 1)]);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests.take(5), vec![Block::new(5, 0)]);
    }
}
