//! Per-round state of a QBFT validator.

use super::types::{Commit, Prepare, Preprepare, Verified};
use crate::{message_set::MessageSet, types::View, Digest, Proposal};

/// A block observed with a quorum of matching PREPAREs, and the PREPAREs that prove it.
///
/// A certificate survives round changes within a sequence and is attached to every
/// ROUND-CHANGE the validator sends.
#[derive(Clone, Debug, PartialEq)]
pub struct Certificate<P: Proposal> {
    pub round: u64,
    pub block: P,
    pub prepares: Vec<Verified<Prepare>>,
}

/// Messages and progress of the current view.
pub struct RoundState<P: Proposal> {
    view: View,
    preprepare: Option<Preprepare<P>>,
    prepares: MessageSet<Verified<Prepare>>,
    commits: MessageSet<Verified<Commit>>,
    certificate: Option<Certificate<P>>,
    pending_request: Option<P>,
    preprepare_sent: u64,
}

impl<P: Proposal> RoundState<P> {
    /// State for the first round of a sequence.
    pub fn new(view: View) -> Self {
        Self {
            view,
            preprepare: None,
            prepares: MessageSet::default(),
            commits: MessageSet::default(),
            certificate: None,
            pending_request: None,
            preprepare_sent: 0,
        }
    }

    /// State for `round` of the same sequence.
    ///
    /// The last accepted PRE-PREPARE, the certificate, and the pending request are
    /// carried over. Votes are not.
    pub fn advance(self, round: u64) -> Self {
        Self {
            view: View::new(self.view.sequence, round),
            preprepare: self.preprepare,
            prepares: MessageSet::default(),
            commits: MessageSet::default(),
            certificate: self.certificate,
            pending_request: self.pending_request,
            preprepare_sent: 0,
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

    pub fn preprepare(&self) -> Option<&Preprepare<P>> {
        self.preprepare.as_ref()
    }

    pub fn set_preprepare(&mut self, preprepare: Preprepare<P>) {
        self.preprepare = Some(preprepare);
    }

    /// Proposal of the last accepted PRE-PREPARE.
    pub fn proposal(&self) -> Option<&P> {
        self.preprepare.as_ref().map(|p| &p.proposal)
    }

    /// Returns whether `digest` is the hash of the last accepted proposal.
    pub fn is_proposal(&self, digest: &Digest) -> bool {
        self.proposal().is_some_and(|p| p.hash() == *digest)
    }

    pub fn prepares(&self) -> &MessageSet<Verified<Prepare>> {
        &self.prepares
    }

    pub fn prepares_mut(&mut self) -> &mut MessageSet<Verified<Prepare>> {
        &mut self.prepares
    }

    pub fn commits(&self) -> &MessageSet<Verified<Commit>> {
        &self.commits
    }

    pub fn commits_mut(&mut self) -> &mut MessageSet<Verified<Commit>> {
        &mut self.commits
    }

    pub fn certificate(&self) -> Option<&Certificate<P>> {
        self.certificate.as_ref()
    }

    pub fn set_certificate(&mut self, certificate: Certificate<P>) {
        self.certificate = Some(certificate);
    }

    pub fn pending_request(&self) -> Option<&P> {
        self.pending_request.as_ref()
    }

    pub fn set_pending_request(&mut self, request: P) {
        self.pending_request = Some(request);
    }

    /// Last round in which the local validator sent a PRE-PREPARE after a round change.
    pub fn preprepare_sent(&self) -> u64 {
        self.preprepare_sent
    }

    pub fn set_preprepare_sent(&mut self, round: u64) {
        self.preprepare_sent = round;
    }
}
