//! IBFT state machine.

use super::{
    round::RoundState,
    round_change::RoundChangeSet,
    types::{commit_seal_data, Message, Payload, Preprepare, Subject},
};
use crate::{
    backlog::{Backlog, Priority, Requests},
    config::Config,
    metrics::{Inbound, Metrics, Outbound},
    qbft::core::round_timeout,
    types::{Address, Code, Digest, State, View, EMPTY_DIGEST},
    validators::ValidatorSet,
    Backend, Error, Proposal,
};
use bytes::Bytes;
use commonware_codec::Encode;
use commonware_runtime::Clock;
use commonware_utils::hex;
use std::{
    collections::VecDeque,
    time::{Duration, SystemTime},
};
use tracing::{debug, info, warn};

/// Work produced while handling an event, processed before the handler returns.
enum Event<P: Proposal> {
    /// A stored request for the current sequence.
    Request(P),
    /// A message broadcast by the local validator.
    Local(Message<P>),
    /// A message from the backlog (or a delayed PRE-PREPARE) that may now be handled.
    Backlog(Message<P>),
}

/// Check whether a message for `view` with `code` can be handled now.
///
/// While waiting for a round change only ROUND-CHANGE messages are current.
fn check_message(
    code: Code,
    view: View,
    current: View,
    state: State,
    waiting_for_round_change: bool,
) -> Result<(), Error> {
    if code == Code::RoundChange {
        if view.sequence > current.sequence {
            return Err(Error::FutureMessage);
        }
        if view < current {
            return Err(Error::OldMessage);
        }
        return Ok(());
    }
    if view > current {
        return Err(Error::FutureMessage);
    }
    if view < current {
        return Err(Error::OldMessage);
    }
    if waiting_for_round_change {
        return Err(Error::FutureMessage);
    }
    if state == State::AcceptRequest && code > Code::Preprepare {
        return Err(Error::FutureMessage);
    }
    Ok(())
}

/// IBFT state machine of one validator.
///
/// A validator locks on a proposal once it has seen a quorum of PREPAREs (or COMMITs)
/// for it. A locked validator only prepares the locked proposal and, as proposer,
/// re-proposes it after a round change. The lock is released if the backend fails to
/// commit the proposal.
pub struct Core<E: Clock, B: Backend<P>, P: Proposal> {
    context: E,
    backend: B,
    config: Config,
    metrics: Metrics,

    address: Address,
    started: bool,
    state: State,
    validators: ValidatorSet,
    current: RoundState<P>,
    round_changes: RoundChangeSet<P>,
    waiting_for_round_change: bool,

    backlog: Backlog<Message<P>>,
    requests: Requests<P>,
    queue: VecDeque<Event<P>>,

    round_change_deadline: Option<SystemTime>,
    future_preprepare: Option<(SystemTime, Message<P>)>,
    consensus_start: Option<SystemTime>,
}

impl<E: Clock, B: Backend<P>, P: Proposal> Core<E, B, P> {
    pub fn new(context: E, backend: B, config: Config, metrics: Metrics) -> Self {
        let address = backend.address();
        let validators = backend.validators(None);
        let backlog = Backlog::new(config.backlog_size);
        Self {
            context,
            backend,
            config,
            metrics,

            address,
            started: false,
            state: State::AcceptRequest,
            validators,
            current: RoundState::new(View::default()),
            round_changes: RoundChangeSet::default(),
            waiting_for_round_change: false,

            backlog,
            requests: Requests::default(),
            queue: VecDeque::new(),

            round_change_deadline: None,
            future_preprepare: None,
            consensus_start: None,
        }
    }

    /// Enter the first round of the sequence following the last finalized proposal.
    pub fn start(&mut self) {
        info!(address = %hex(&self.address), "starting IBFT");
        self.start_new_round(0);
        self.process_queue();
    }

    /// Release the backend (used when switching to another protocol variant).
    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn view(&self) -> View {
        self.current.view()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Returns whether the local validator waits for a quorum of ROUND-CHANGE messages.
    pub fn is_waiting_for_round_change(&self) -> bool {
        self.waiting_for_round_change
    }

    /// Returns whether the local validator is the proposer of the current round.
    pub fn is_proposer(&self) -> bool {
        self.validators.is_proposer(&self.address)
    }

    /// Returns whether `digest` is the hash of the pending request.
    pub fn is_current_proposal(&self, digest: &Digest) -> bool {
        self.current
            .pending_request()
            .is_some_and(|request| request.hash() == *digest)
    }

    /// Earliest time at which [Core::handle_deadline] has work to do.
    pub fn next_deadline(&self) -> Option<SystemTime> {
        let future = self.future_preprepare.as_ref().map(|(deadline, _)| *deadline);
        match (self.round_change_deadline, future) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Handle a proposal request from the host.
    pub fn handle_request(&mut self, proposal: P) -> Result<(), Error> {
        let result = self.on_request(proposal);
        self.process_queue();
        result
    }

    /// Handle a message received from the network.
    ///
    /// A message that is handled successfully is gossiped to peers.
    pub fn handle_message(&mut self, code: Code, payload: Bytes) -> Result<(), Error> {
        let result = self.on_message(code, payload);
        if let Err(err) = &result {
            debug!(
                ?err,
                %code,
                sequence = self.current.sequence(),
                round = self.current.round(),
                "failed to handle message"
            );
        }
        self.process_queue();
        result
    }

    /// Handle the finalization of a proposal by the backend.
    pub fn handle_final_committed(&mut self) {
        debug!(
            sequence = self.current.sequence(),
            round = self.current.round(),
            "received final committed"
        );
        self.start_new_round(0);
        self.process_queue();
    }

    /// Handle the expiry of the round-change timer.
    pub fn handle_timeout(&mut self) {
        self.on_timeout();
        self.process_queue();
    }

    /// Fire every timer whose deadline has passed.
    pub fn handle_deadline(&mut self) {
        let now = self.context.current();
        if matches!(&self.future_preprepare, Some((deadline, _)) if *deadline <= now) {
            if let Some((_, message)) = self.future_preprepare.take() {
                debug!(view = %message.view(), "retrying future PRE-PREPARE");
                self.queue.push_back(Event::Backlog(message));
            }
        }
        if matches!(self.round_change_deadline, Some(deadline) if deadline <= now) {
            self.round_change_deadline = None;
            self.on_timeout();
        }
        self.process_queue();
    }

    fn quorum(&self) -> usize {
        self.validators
            .quorum(self.config.quorum_at(self.current.sequence()))
    }

    /// Returns whether the round is locked on a proposal not known to be bad.
    fn is_hash_locked(&self) -> bool {
        self.current
            .locked_hash()
            .is_some_and(|digest| !self.backend.has_bad_proposal(digest))
    }

    fn process_queue(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            match event {
                Event::Request(proposal) => {
                    if let Err(err) = self.on_request(proposal) {
                        debug!(?err, "failed to handle stored request");
                    }
                }
                Event::Local(message) => {
                    if let Err(err) = self.handle_checked(message) {
                        debug!(?err, "failed to handle own message");
                    }
                }
                Event::Backlog(message) => {
                    let code = message.code();
                    let payload = message.encode().freeze();
                    match self.handle_checked(message) {
                        Ok(()) => self.backend.gossip(&self.validators, code, payload),
                        Err(err) => debug!(?err, %code, "failed to handle backlogged message"),
                    }
                }
            }
        }
    }

    fn on_request(&mut self, proposal: P) -> Result<(), Error> {
        let number = proposal.number();
        let sequence = self.current.sequence();
        if number < sequence {
            debug!(number, sequence, "ignoring old request");
            return Err(Error::OldMessage);
        }
        if number > sequence {
            debug!(number, sequence, "storing future request");
            self.requests.push(proposal);
            return Err(Error::FutureMessage);
        }

        self.current.set_pending_request(proposal.clone());
        if self.state == State::AcceptRequest {
            self.send_preprepare(proposal);
        }
        Ok(())
    }

    fn on_message(&mut self, code: Code, payload: Bytes) -> Result<(), Error> {
        let message = match Message::<P>::decode(code, payload.clone()) {
            Ok(message) => message,
            Err(err) => {
                self.metrics.invalid.inc();
                return Err(err);
            }
        };

        // The signer must be a validator and the sender named by the message
        let verified = message.verify(|data, signature| {
            let signer = self.backend.recover(data, signature)?;
            if !self.validators.contains(&signer) {
                return Err(Error::UnauthorizedAddress);
            }
            Ok(signer)
        });
        if let Err(err) = verified {
            self.metrics.invalid.inc();
            return Err(err);
        }
        self.metrics
            .inbound
            .get_or_create(&Inbound::new(&message.address, code))
            .inc();

        self.handle_checked(message)?;
        self.backend.gossip(&self.validators, code, payload);
        Ok(())
    }

    fn handle_checked(&mut self, message: Message<P>) -> Result<(), Error> {
        let code = message.code();
        let check = check_message(
            code,
            message.view(),
            self.current.view(),
            self.state,
            self.waiting_for_round_change,
        );
        match check {
            Ok(()) => {}
            Err(Error::FutureMessage) => {
                self.store_backlog(message);
                return Err(Error::FutureMessage);
            }
            Err(Error::OldMessage) => {
                if let Payload::Preprepare(preprepare) = &message.payload {
                    return self.handle_old_preprepare(message.address, preprepare);
                }
                return Err(Error::OldMessage);
            }
            Err(err) => return Err(err),
        }

        match &message.payload {
            Payload::Preprepare(preprepare) => self.handle_preprepare(&message, preprepare),
            Payload::Prepare(subject) => self.handle_prepare(&message, subject),
            Payload::Commit(subject) => self.handle_commit(&message, subject),
            Payload::RoundChange(subject) => self.handle_round_change(&message, subject),
        }
    }

    fn store_backlog(&mut self, message: Message<P>) {
        let source = message.address;
        if source == self.address {
            warn!(view = %message.view(), "ignoring backlog from self");
            return;
        }
        debug!(
            source = %hex(&source),
            view = %message.view(),
            code = %message.code(),
            "storing future message"
        );
        let priority = Priority::new(message.code(), message.view());
        if let Some(dropped) = self.backlog.push(source, priority, message) {
            debug!(
                source = %hex(&source),
                view = %dropped.view(),
                code = %dropped.code(),
                "backlog full, dropping message"
            );
        }
        self.metrics.backlog.set(self.backlog.len() as i64);
    }

    fn process_backlog(&mut self) {
        let current = self.current.view();
        let state = self.state;
        let waiting = self.waiting_for_round_change;
        let ready = self.backlog.drain(&self.validators, |message| {
            check_message(message.code(), message.view(), current, state, waiting)
        });
        self.metrics.backlog.set(self.backlog.len() as i64);
        for (_, message) in ready {
            self.queue.push_back(Event::Backlog(message));
        }
    }

    fn process_requests(&mut self) {
        for proposal in self.requests.take(self.current.sequence()) {
            self.queue.push_back(Event::Request(proposal));
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(
                sequence = self.current.sequence(),
                round = self.current.round(),
                old = %self.state,
                new = %state,
                "changed state"
            );
            self.state = state;
        }
        if state == State::AcceptRequest {
            self.process_requests();
        }
        self.process_backlog();
    }

    fn new_round_change_timer(&mut self) {
        self.round_change_deadline = None;
        self.future_preprepare = None;
        let base = self.config.request_timeout_at(self.current.sequence());
        let timeout = round_timeout(base, self.current.round());
        self.round_change_deadline = self.context.current().checked_add(timeout);
        debug!(
            sequence = self.current.sequence(),
            round = self.current.round(),
            ?timeout,
            "started round-change timer"
        );
    }

    fn schedule_future_preprepare(&mut self, delay: Duration, message: Message<P>) {
        self.future_preprepare = self
            .context
            .current()
            .checked_add(delay)
            .map(|deadline| (deadline, message));
    }

    /// Sign and broadcast `payload`, then deliver it to the local validator.
    fn broadcast(&mut self, payload: Payload<P>, committed_seal: Bytes) {
        let code = payload.code();
        let message = Message::new(payload, self.address, committed_seal);
        let backend = &mut self.backend;
        let message = match message.sign(|data| backend.sign(data)) {
            Ok(message) => message,
            Err(err) => {
                warn!(?err, %code, "failed to sign message");
                return;
            }
        };
        self.backend
            .broadcast(&self.validators, code, message.encode().freeze());
        self.metrics
            .outbound
            .get_or_create(&Outbound::new(code))
            .inc();
        self.queue.push_back(Event::Local(message));
    }

    fn start_new_round(&mut self, round: u64) {
        let (last, last_proposer) = self.backend.last_proposal();
        let round_change = if !self.started {
            debug!("starting at the initial round");
            false
        } else if last.number() >= self.current.sequence() {
            if let Some(start) = self.consensus_start.take() {
                if let Ok(elapsed) = self.context.current().duration_since(start) {
                    self.metrics.consensus_latency.observe(elapsed.as_secs_f64());
                }
            }
            debug!(
                number = last.number(),
                sequence = self.current.sequence(),
                "catching up to last proposal"
            );
            false
        } else if last.number().checked_add(1) == Some(self.current.sequence()) {
            if round == 0 {
                return;
            }
            if round < self.current.round() {
                warn!(
                    round,
                    current = self.current.round(),
                    "next round is lower than current round"
                );
                return;
            }
            true
        } else {
            warn!(
                number = last.number(),
                sequence = self.current.sequence(),
                "last proposal is behind current sequence"
            );
            return;
        };
        self.started = true;

        let view = if round_change {
            View::new(self.current.sequence(), round)
        } else {
            self.validators = self.backend.validators(Some(&last));
            View::new(last.number() + 1, 0)
        };
        self.round_changes = RoundChangeSet::default();
        self.update_round_state(view, round_change);
        if round_change {
            self.metrics.round_changes.inc();
        }
        self.validators.calc_proposer(last_proposer.as_ref(), view.round);
        self.waiting_for_round_change = false;
        self.metrics.sequence.set(view.sequence as i64);
        self.metrics.round.set(view.round as i64);
        self.set_state(State::AcceptRequest);

        // The proposer of a new round re-proposes the locked proposal (or its request)
        if round_change && self.is_proposer() {
            let proposal = if self.is_hash_locked() {
                self.current.proposal().cloned()
            } else {
                self.current.pending_request().cloned()
            };
            if let Some(proposal) = proposal {
                self.send_preprepare(proposal);
            }
        }
        self.new_round_change_timer();

        info!(
            sequence = view.sequence,
            round = view.round,
            proposer = ?self.validators.proposer().map(|p| hex(p)),
            is_proposer = self.is_proposer(),
            validators = self.validators.len(),
            "started new round"
        );
    }

    fn update_round_state(&mut self, view: View, round_change: bool) {
        if round_change {
            let locked = self.is_hash_locked();
            let current = std::mem::replace(&mut self.current, RoundState::new(View::default()));
            self.current = current.advance(view.round, locked);
        } else {
            self.current = RoundState::new(view);
        }
    }

    /// Move to `view` without a quorum and wait for ROUND-CHANGE messages.
    fn catch_up_round(&mut self, view: View) {
        debug!(%view, "catching up round");
        self.waiting_for_round_change = true;
        self.update_round_state(view, true);
        self.metrics.round.set(view.round as i64);
        self.round_changes.clear(view.round);
        self.new_round_change_timer();
    }

    fn on_timeout(&mut self) {
        warn!(
            sequence = self.current.sequence(),
            round = self.current.round(),
            "round timed out"
        );

        // Follow F+1 validators to a higher round
        if !self.waiting_for_round_change {
            if let Some(round) = self.round_changes.max_round(self.validators.f() + 1) {
                if round > self.current.round() {
                    self.send_round_change(round);
                    return;
                }
            }
        }

        let (last, _) = self.backend.last_proposal();
        if last.number() >= self.current.sequence() {
            self.start_new_round(0);
        } else {
            self.send_next_round_change();
        }
    }

    fn send_preprepare(&mut self, proposal: P) {
        if proposal.number() != self.current.sequence() || !self.is_proposer() {
            return;
        }
        let view = self.current.view();
        debug!(
            sequence = view.sequence,
            round = view.round,
            hash = %hex(&proposal.hash()),
            "broadcasting PRE-PREPARE"
        );
        self.broadcast(
            Payload::Preprepare(Preprepare { view, proposal }),
            Bytes::new(),
        );
    }

    /// Answer a PRE-PREPARE for the last finalized proposal with a COMMIT, so a proposer
    /// that missed the final COMMITs can still finish.
    fn handle_old_preprepare(
        &mut self,
        source: Address,
        preprepare: &Preprepare<P>,
    ) -> Result<(), Error> {
        let (last, last_proposer) = self.backend.last_proposal();
        if preprepare.view.sequence != last.number()
            || preprepare.proposal.hash() != last.hash()
            || last_proposer != Some(source)
        {
            return Err(Error::OldMessage);
        }
        debug!(
            view = %preprepare.view,
            source = %hex(&source),
            "answering old PRE-PREPARE with COMMIT"
        );
        self.broadcast_commit(Subject {
            view: preprepare.view,
            digest: last.hash(),
        });
        Ok(())
    }

    fn handle_preprepare(
        &mut self,
        message: &Message<P>,
        preprepare: &Preprepare<P>,
    ) -> Result<(), Error> {
        if !self.validators.is_proposer(&message.address) {
            warn!(
                source = %hex(&message.address),
                view = %preprepare.view,
                "ignoring PRE-PREPARE from non-proposer"
            );
            return Err(Error::NotFromProposer);
        }

        let digest = preprepare.proposal.hash();
        if self.backend.has_bad_proposal(&digest) {
            warn!(
                view = %preprepare.view,
                hash = %hex(&digest),
                "PRE-PREPARE carries a bad proposal"
            );
            self.send_next_round_change();
            return Err(Error::InvalidProposal("known bad proposal".into()));
        }
        if let Err(err) = self.backend.verify(&preprepare.proposal) {
            match &err {
                Error::FutureBlock(delay) => {
                    info!(?delay, view = %preprepare.view, "PRE-PREPARE proposal is in the future");
                    self.schedule_future_preprepare(*delay, message.clone());
                }
                _ => {
                    warn!(?err, view = %preprepare.view, "invalid PRE-PREPARE proposal");
                    self.send_next_round_change();
                }
            }
            return Err(err);
        }

        if self.state != State::AcceptRequest {
            return Ok(());
        }
        if self.is_hash_locked() {
            if self.current.locked_hash() == Some(&digest) {
                // Already prepared: commit right away
                self.accept_preprepare(preprepare);
                self.set_state(State::Prepared);
                self.send_commit();
            } else {
                warn!(view = %preprepare.view, "PRE-PREPARE does not match locked proposal");
                self.send_next_round_change();
            }
        } else {
            self.accept_preprepare(preprepare);
            self.set_state(State::Preprepared);
            self.send_prepare();
        }
        Ok(())
    }

    fn accept_preprepare(&mut self, preprepare: &Preprepare<P>) {
        debug!(
            view = %preprepare.view,
            hash = %hex(&preprepare.proposal.hash()),
            "accepted PRE-PREPARE"
        );
        self.consensus_start = Some(self.context.current());
        self.current.set_preprepare(preprepare.clone());
    }

    /// Check that `subject` refers to the current view and proposal.
    fn verify_subject(&self, source: &Address, subject: &Subject) -> Result<(), Error> {
        if self.current.subject().as_ref() != Some(subject) {
            warn!(
                source = %hex(source),
                view = %subject.view,
                "inconsistent subject"
            );
            return Err(Error::InconsistentSubject);
        }
        Ok(())
    }

    fn send_prepare(&mut self) {
        let Some(subject) = self.current.subject() else {
            return;
        };
        debug!(view = %subject.view, "broadcasting PREPARE");
        self.broadcast(Payload::Prepare(subject), Bytes::new());
    }

    fn handle_prepare(&mut self, message: &Message<P>, subject: &Subject) -> Result<(), Error> {
        self.verify_subject(&message.address, subject)?;
        self.current
            .prepares_mut()
            .add(message.address, message.clone())?;

        // A locked validator moves on as soon as a PREPARE for its lock arrives
        let locked = self.is_hash_locked() && self.current.locked_hash() == Some(&subject.digest);
        let count = self.current.prepare_or_commit_size();
        if (locked || count >= self.quorum()) && self.state < State::Prepared {
            info!(view = %subject.view, count, "received quorum of PREPARE");
            self.current.lock_hash();
            self.set_state(State::Prepared);
            self.send_commit();
        }
        Ok(())
    }

    fn send_commit(&mut self) {
        let Some(subject) = self.current.subject() else {
            return;
        };
        self.broadcast_commit(subject);
    }

    fn broadcast_commit(&mut self, subject: Subject) {
        let seal = match self.backend.sign(&commit_seal_data(&subject.digest)) {
            Ok(seal) => seal,
            Err(err) => {
                warn!(?err, "failed to create commit seal");
                return;
            }
        };
        debug!(view = %subject.view, "broadcasting COMMIT");
        self.broadcast(Payload::Commit(subject), seal);
    }

    fn handle_commit(&mut self, message: &Message<P>, subject: &Subject) -> Result<(), Error> {
        self.verify_subject(&message.address, subject)?;

        // The seal must be produced by the sender of the COMMIT
        let data = commit_seal_data(&subject.digest);
        match self.backend.recover(&data, &message.committed_seal) {
            Ok(signer) if signer == message.address => {}
            _ => return Err(Error::InvalidCommittedSeals),
        }
        self.current
            .commits_mut()
            .add(message.address, message.clone())?;

        let count = self.current.commits().len();
        if count >= self.quorum() && self.state < State::Committed {
            info!(view = %subject.view, count, "received quorum of COMMIT");
            self.current.lock_hash();
            self.commit();
        }
        Ok(())
    }

    fn commit(&mut self) {
        self.set_state(State::Committed);
        let Some(proposal) = self.current.proposal().cloned() else {
            return;
        };
        let seals = self
            .current
            .commits()
            .values()
            .map(|commit| commit.committed_seal.clone())
            .collect();
        let round = self.current.round();
        match self.backend.commit(&proposal, seals, round) {
            Ok(()) => {
                self.metrics.commits.inc();
                info!(
                    number = proposal.number(),
                    hash = %hex(&proposal.hash()),
                    round,
                    "committed proposal"
                );
            }
            Err(Error::AlreadyKnown) => {
                debug!(number = proposal.number(), "proposal already committed");
            }
            Err(err) => {
                warn!(?err, number = proposal.number(), "failed to commit proposal");
                self.current.unlock_hash();
                self.send_next_round_change();
            }
        }
    }

    fn send_next_round_change(&mut self) {
        self.send_round_change(self.current.round() + 1);
    }

    fn send_round_change(&mut self, round: u64) {
        let current = self.current.view();
        if current.round >= round {
            warn!(round, current = current.round, "ignoring round change to past round");
            return;
        }
        self.catch_up_round(View::new(current.sequence, round));
        let view = self.current.view();
        info!(sequence = view.sequence, round, "broadcasting ROUND-CHANGE");
        self.broadcast(
            Payload::RoundChange(Subject {
                view,
                digest: EMPTY_DIGEST,
            }),
            Bytes::new(),
        );
    }

    fn handle_round_change(
        &mut self,
        message: &Message<P>,
        subject: &Subject,
    ) -> Result<(), Error> {
        let current = self.current.view();
        let round = subject.view.round;
        let count = self
            .round_changes
            .add(round, message.address, message.clone())?;
        debug!(
            sequence = subject.view.sequence,
            round,
            source = %hex(&message.address),
            count,
            "handled ROUND-CHANGE"
        );

        // F+1 ROUND-CHANGE messages: catch up if we are behind
        if self.waiting_for_round_change && count == self.validators.f() + 1 {
            if current.round < round {
                self.send_round_change(round);
            }
            return Ok(());
        }

        // Quorum of ROUND-CHANGE messages: start the round
        if count == self.quorum() && (self.waiting_for_round_change || current.round < round) {
            info!(round, "received quorum of ROUND-CHANGE");
            self.start_new_round(round);
            return Ok(());
        }

        // Only ROUND-CHANGE messages for the current round are relayed
        if current.round < round {
            return Err(Error::Ignored);
        }
        Ok(())
    }
}
