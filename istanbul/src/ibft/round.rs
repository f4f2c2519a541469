//! Per-round state of an IBFT validator.

use super::types::{Message, Preprepare, Subject};
use crate::{message_set::MessageSet, types::View, Digest, Proposal};

/// Messages and progress of the current view.
pub struct RoundState<P: Proposal> {
    view: View,
    preprepare: Option<Preprepare<P>>,
    prepares: MessageSet<Message<P>>,
    commits: MessageSet<Message<P>>,
    locked_hash: Option<Digest>,
    pending_request: Option<P>,
}

impl<P: Proposal> RoundState<P> {
    /// State for the first round of a sequence.
    pub fn new(view: View) -> Self {
        Self {
            view,
            preprepare: None,
            prepares: MessageSet::default(),
            commits: MessageSet::default(),
            locked_hash: None,
            pending_request: None,
        }
    }

    /// State for `round` of the same sequence.
    ///
    /// The pending request is always carried over. The locked hash and the PRE-PREPARE
    /// it locks on are only carried over if `locked`.
    pub fn advance(self, round: u64, locked: bool) -> Self {
        let (locked_hash, preprepare) = if locked {
            (self.locked_hash, self.preprepare)
        } else {
            (None, None)
        };
        Self {
            view: View::new(self.view.sequence, round),
            preprepare,
            prepares: MessageSet::default(),
            commits: MessageSet::default(),
            locked_hash,
            pending_request: self.pending_request,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn sequence(&self) -> u64 {
        self.view.sequence
    }

    pub fn round(&self) -> u64 {
        self.view.round
    }

    pub fn set_preprepare(&mut self, preprepare: Preprepare<P>) {
        self.preprepare = Some(preprepare);
    }

    /// Proposal of the last accepted PRE-PREPARE.
    pub fn proposal(&self) -> Option<&P> {
        self.preprepare.as_ref().map(|p| &p.proposal)
    }

    /// Subject PREPAREs and COMMITs of the current view must match.
    pub fn subject(&self) -> Option<Subject> {
        self.proposal().map(|proposal| Subject {
            view: self.view,
            digest: proposal.hash(),
        })
    }

    pub fn prepares_mut(&mut self) -> &mut MessageSet<Message<P>> {
        &mut self.prepares
    }

    pub fn commits(&self) -> &MessageSet<Message<P>> {
        &self.commits
    }

    pub fn commits_mut(&mut self) -> &mut MessageSet<Message<P>> {
        &mut self.commits
    }

    /// Number of distinct validators that sent a PREPARE or a COMMIT.
    ///
    /// A COMMIT implies its sender prepared.
    pub fn prepare_or_commit_size(&self) -> usize {
        let extra = self
            .commits
            .senders()
            .filter(|sender| self.prepares.get(sender).is_none())
            .count();
        self.prepares.len() + extra
    }

    /// Lock on the accepted proposal.
    pub fn lock_hash(&mut self) {
        if let Some(digest) = self.proposal().map(Proposal::hash) {
            self.locked_hash = Some(digest);
        }
    }

    pub fn unlock_hash(&mut self) {
        self.locked_hash = None;
    }

    pub fn locked_hash(&self) -> Option<&Digest> {
        self.locked_hash.as_ref()
    }

    pub fn pending_request(&self) -> Option<&P> {
        self.pending_request.as_ref()
    }

    pub fn set_pending_request(&mut self, request: P) {
        self.pending_request = Some(request);
    }
}
