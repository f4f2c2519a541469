//! QBFT state machine.

use super::{
    justification::is_justified,
    round::{Certificate, RoundState},
    round_change::RoundChangeSet,
    types::{
        commit_seal_data, Authenticated, Commit, Message, Prepare, Prepared, Preprepare,
        RoundChange, Signed, Verified,
    },
};
use crate::{
    backlog::{Backlog, Priority, Requests},
    config::Config,
    metrics::{Inbound, Metrics, Outbound},
    types::{Address, Code, Digest, State, View},
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
    Local(Authenticated<P>),
    /// A message from the backlog (or a delayed PRE-PREPARE) that may now be handled.
    Backlog(Authenticated<P>),
}

/// Check whether a message for `view` with `code` can be handled now.
fn check_message(code: Code, view: View, current: View, state: State) -> Result<(), Error> {
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
    match state {
        State::AcceptRequest if code > Code::Preprepare => Err(Error::FutureMessage),
        State::Preprepared if code < Code::Prepare => Err(Error::InvalidMessage),
        State::Preprepared if code > Code::Prepare => Err(Error::FutureMessage),
        State::Prepared if code < Code::Commit => Err(Error::InvalidMessage),
        State::Committed => Err(Error::InvalidMessage),
        _ => Ok(()),
    }
}

/// Round-change timeout of `round`: `base * 2^round`.
pub(crate) fn round_timeout(base: Duration, round: u64) -> Duration {
    let factor = u32::try_from(round)
        .ok()
        .and_then(|round| 1u32.checked_shl(round))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// QBFT state machine of one validator.
///
/// The core is synchronous and must be driven by a single consumer. Each `handle_*`
/// method processes its event and all the work that follows from it (including the
/// delivery of the validator's own broadcasts) before returning.
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

    backlog: Backlog<Authenticated<P>>,
    requests: Requests<P>,
    queue: VecDeque<Event<P>>,

    round_change_deadline: Option<SystemTime>,
    future_preprepare: Option<(SystemTime, Authenticated<P>)>,
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
        info!(address = %hex(&self.address), "starting QBFT");
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
        self.stop_timers();
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

    /// Recover the signer of `signature` and check it belongs to the validator set.
    fn recover(&self, data: &[u8], signature: &[u8]) -> Result<Address, Error> {
        let signer = self.backend.recover(data, signature)?;
        if !self.validators.contains(&signer) {
            return Err(Error::UnauthorizedAddress);
        }
        Ok(signer)
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
                    let payload = message.to_message().encode().freeze();
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
            self.new_round_change_timer();

            // Proposals after a round change must be justified by ROUND-CHANGE messages
            if self.current.round() == 0 {
                self.send_preprepare(proposal, Vec::new(), Vec::new());
            }
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
        let message = match message.verify(|data, signature| self.recover(data, signature)) {
            Ok(message) => message,
            Err(err) => {
                self.metrics.invalid.inc();
                return Err(err);
            }
        };
        self.metrics
            .inbound
            .get_or_create(&Inbound::new(&message.source(), code))
            .inc();

        self.handle_checked(message)?;
        self.backend.gossip(&self.validators, code, payload);
        Ok(())
    }

    fn handle_checked(&mut self, message: Authenticated<P>) -> Result<(), Error> {
        let code = message.code();
        let view = message.view();
        if let Err(err) = check_message(code, view, self.current.view(), self.state) {
            if matches!(err, Error::FutureMessage) {
                self.store_backlog(message);
            }
            return Err(err);
        }
        self.deliver(message)
    }

    fn store_backlog(&mut self, message: Authenticated<P>) {
        let source = message.source();
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
        let ready = self.backlog.drain(&self.validators, |message| {
            check_message(message.code(), message.view(), current, state)
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

    fn deliver(&mut self, message: Authenticated<P>) -> Result<(), Error> {
        match &message {
            Authenticated::Preprepare {
                preprepare,
                round_changes,
                prepares,
            } => {
                let result = self.handle_preprepare(preprepare, round_changes, prepares);
                if let Err(Error::FutureBlock(delay)) = &result {
                    self.schedule_future_preprepare(*delay, message.clone());
                }
                result
            }
            Authenticated::Prepare(prepare) => self.handle_prepare(prepare),
            Authenticated::Commit(commit) => self.handle_commit(commit),
            Authenticated::RoundChange {
                round_change,
                prepared_block,
                justification,
            } => self.handle_round_change(round_change, prepared_block.as_ref(), justification),
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

    fn stop_timers(&mut self) {
        self.round_change_deadline = None;
        self.future_preprepare = None;
    }

    fn new_round_change_timer(&mut self) {
        self.stop_timers();
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

    fn schedule_future_preprepare(&mut self, delay: Duration, message: Authenticated<P>) {
        self.future_preprepare = self
            .context
            .current()
            .checked_add(delay)
            .map(|deadline| (deadline, message));
    }

    fn broadcast(&mut self, message: Authenticated<P>) {
        let code = message.code();
        let payload = message.to_message().encode().freeze();
        self.backend.broadcast(&self.validators, code, payload);
        self.metrics
            .outbound
            .get_or_create(&Outbound::new(code))
            .inc();
        self.queue.push_back(Event::Local(message));
    }

    fn sign<T: super::types::Payload>(&mut self, payload: T) -> Option<Verified<T>> {
        let backend = &mut self.backend;
        match Signed::sign(payload, |data| backend.sign(data)) {
            Ok(signed) => Some(Verified {
                source: self.address,
                signed,
            }),
            Err(err) => {
                warn!(?err, code = %T::CODE, "failed to sign message");
                None
            }
        }
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

        if round_change {
            let current = std::mem::replace(&mut self.current, RoundState::new(View::default()));
            self.current = current.advance(round);
            self.metrics.round_changes.inc();
        } else {
            self.current = RoundState::new(View::new(last.number() + 1, 0));
            self.validators = self.backend.validators(Some(&last));
            self.stop_timers();
        }
        let view = self.current.view();
        self.validators.calc_proposer(last_proposer.as_ref(), view.round);
        self.metrics.sequence.set(view.sequence as i64);
        self.metrics.round.set(view.round as i64);
        self.set_state(State::AcceptRequest);

        if view.round == 0 {
            self.round_changes = RoundChangeSet::default();
        } else {
            self.round_changes.clear_lower_than(view.round);
        }
        self.round_changes.new_round(view.round);
        if view.round > 0 {
            self.new_round_change_timer();
        }

        info!(
            sequence = view.sequence,
            round = view.round,
            proposer = ?self.validators.proposer().map(|p| hex(p)),
            is_proposer = self.is_proposer(),
            validators = self.validators.len(),
            "started new round"
        );
    }

    fn on_timeout(&mut self) {
        let sequence = self.current.sequence();
        let next = self.current.round() + 1;
        warn!(sequence, round = self.current.round(), "round timed out");
        self.start_new_round(next);

        // A timeout that caught up to a new sequence does not request a round change
        if self.current.sequence() == sequence {
            self.broadcast_round_change(next);
        }
    }

    fn send_preprepare(
        &mut self,
        proposal: P,
        round_changes: Vec<Verified<RoundChange>>,
        prepares: Vec<Verified<Prepare>>,
    ) {
        if proposal.number() != self.current.sequence() || !self.is_proposer() {
            return;
        }
        let view = self.current.view();
        debug!(
            sequence = view.sequence,
            round = view.round,
            number = proposal.number(),
            hash = %hex(&proposal.hash()),
            justifications = round_changes.len(),
            "broadcasting PRE-PREPARE"
        );
        let Some(preprepare) = self.sign(Preprepare { view, proposal }) else {
            return;
        };
        self.broadcast(Authenticated::Preprepare {
            preprepare,
            round_changes,
            prepares,
        });
        self.current.set_preprepare_sent(view.round);
    }

    fn handle_preprepare(
        &mut self,
        preprepare: &Verified<Preprepare<P>>,
        round_changes: &[Verified<RoundChange>],
        prepares: &[Verified<Prepare>],
    ) -> Result<(), Error> {
        let payload = preprepare.payload();
        if !self.validators.is_proposer(&preprepare.source) {
            warn!(
                source = %hex(&preprepare.source),
                view = %payload.view,
                "ignoring PRE-PREPARE from non-proposer"
            );
            return Err(Error::NotFromProposer);
        }

        if payload.view.round > 0 {
            // Only evidence for this view from validators counts
            let round_changes: Vec<_> = round_changes
                .iter()
                .filter(|rc| rc.payload().view == payload.view)
                .cloned()
                .collect();
            let prepares: Vec<_> = prepares
                .iter()
                .filter(|p| p.payload().view.sequence == payload.view.sequence)
                .cloned()
                .collect();
            if let Err(err) = is_justified(
                &payload.proposal.hash(),
                &round_changes,
                &prepares,
                self.quorum(),
            ) {
                warn!(?err, view = %payload.view, "invalid PRE-PREPARE justification");
                return Err(Error::InvalidPreparedBlock);
            }
        }

        if let Err(err) = self.backend.verify(&payload.proposal) {
            match &err {
                Error::FutureBlock(delay) => {
                    info!(?delay, view = %payload.view, "PRE-PREPARE proposal is in the future");
                }
                _ => warn!(?err, view = %payload.view, "invalid PRE-PREPARE proposal"),
            }
            return Err(err);
        }

        if self.state == State::AcceptRequest {
            debug!(
                view = %payload.view,
                hash = %hex(&payload.proposal.hash()),
                "accepted PRE-PREPARE"
            );
            self.new_round_change_timer();
            self.consensus_start = Some(self.context.current());
            self.current.set_preprepare(payload.clone());
            self.set_state(State::Preprepared);
            self.broadcast_prepare();
        }
        Ok(())
    }

    fn broadcast_prepare(&mut self) {
        let Some(digest) = self.current.proposal().map(Proposal::hash) else {
            return;
        };
        let view = self.current.view();
        debug!(sequence = view.sequence, round = view.round, "broadcasting PREPARE");
        if let Some(prepare) = self.sign(Prepare { view, digest }) {
            self.broadcast(Authenticated::Prepare(prepare));
        }
    }

    fn handle_prepare(&mut self, prepare: &Verified<Prepare>) -> Result<(), Error> {
        let payload = prepare.payload();
        if !self.current.is_proposal(&payload.digest) {
            warn!(
                source = %hex(&prepare.source),
                view = %payload.view,
                "PREPARE does not match proposal"
            );
            return Err(Error::InvalidMessage);
        }
        self.current
            .prepares_mut()
            .add(prepare.source, prepare.clone())?;

        let count = self.current.prepares().len();
        let quorum = self.quorum();
        if count >= quorum && self.state < State::Prepared {
            let Some(block) = self.current.proposal().cloned() else {
                return Ok(());
            };
            info!(
                sequence = payload.view.sequence,
                round = payload.view.round,
                count,
                quorum,
                "received quorum of PREPARE"
            );
            let certificate = Certificate {
                round: self.current.round(),
                block,
                prepares: self.current.prepares().values().cloned().collect(),
            };
            self.current.set_certificate(certificate);
            self.set_state(State::Prepared);
            self.broadcast_commit();
        }
        Ok(())
    }

    fn broadcast_commit(&mut self) {
        let Some(digest) = self.current.proposal().map(Proposal::hash) else {
            return;
        };
        let view = self.current.view();
        let seal = match self.backend.sign(&commit_seal_data(&digest, view.round)) {
            Ok(seal) => seal,
            Err(err) => {
                warn!(?err, "failed to create commit seal");
                return;
            }
        };
        debug!(sequence = view.sequence, round = view.round, "broadcasting COMMIT");
        if let Some(commit) = self.sign(Commit { view, digest, seal }) {
            self.broadcast(Authenticated::Commit(commit));
        }
    }

    fn handle_commit(&mut self, commit: &Verified<Commit>) -> Result<(), Error> {
        let payload = commit.payload();
        if !self.current.is_proposal(&payload.digest) {
            warn!(
                source = %hex(&commit.source),
                view = %payload.view,
                "COMMIT does not match proposal"
            );
            return Err(Error::InvalidMessage);
        }

        // The seal must be produced by the sender of the COMMIT
        let data = commit_seal_data(&payload.digest, payload.view.round);
        match self.backend.recover(&data, &payload.seal) {
            Ok(signer) if signer == commit.source => {}
            _ => return Err(Error::InvalidCommittedSeals),
        }
        self.current
            .commits_mut()
            .add(commit.source, commit.clone())?;

        let count = self.current.commits().len();
        let quorum = self.quorum();
        if count >= quorum {
            info!(
                sequence = payload.view.sequence,
                round = payload.view.round,
                count,
                quorum,
                "received quorum of COMMIT"
            );
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
            .map(|commit| commit.payload().seal.clone())
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
                self.broadcast_round_change(round + 1);
            }
        }
    }

    fn broadcast_round_change(&mut self, round: u64) {
        let current = self.current.view();
        if current.round > round {
            warn!(round, current = current.round, "ignoring round change to past round");
            return;
        }
        let certificate = self.current.certificate().cloned();
        let prepared = certificate.as_ref().map(|c| Prepared {
            round: c.round,
            digest: c.block.hash(),
        });
        let view = View::new(current.sequence, round);
        info!(
            sequence = view.sequence,
            round,
            prepared = ?prepared.map(|p| p.round),
            "broadcasting ROUND-CHANGE"
        );
        let Some(round_change) = self.sign(RoundChange { view, prepared }) else {
            return;
        };
        let (prepared_block, justification) = match certificate {
            Some(certificate) => (Some(certificate.block), certificate.prepares),
            None => (None, Vec::new()),
        };
        self.broadcast(Authenticated::RoundChange {
            round_change,
            prepared_block,
            justification,
        });
    }

    fn handle_round_change(
        &mut self,
        round_change: &Verified<RoundChange>,
        prepared_block: Option<&P>,
        justification: &[Verified<Prepare>],
    ) -> Result<(), Error> {
        let payload = round_change.payload();
        let current_round = self.current.round();
        let quorum = self.quorum();

        if payload.view.round >= current_round {
            let (block, prepares) = match (payload.prepared, prepared_block) {
                (Some(_), Some(block)) if !justification.is_empty() => {
                    (Some(block.clone()), justification.to_vec())
                }
                _ => (None, Vec::new()),
            };
            if let Err(err) = self.round_changes.add(
                payload.view.round,
                round_change.clone(),
                block,
                prepares,
                quorum,
            ) {
                warn!(?err, source = %hex(&round_change.source), "failed to add ROUND-CHANGE");
                return Err(err);
            }
        }

        let higher = self.round_changes.higher_round_messages(current_round);
        let current = self.round_changes.messages_for_round(current_round);
        debug!(
            sequence = payload.view.sequence,
            round = payload.view.round,
            source = %hex(&round_change.source),
            higher,
            current,
            "handled ROUND-CHANGE"
        );

        if higher == self.validators.f() + 1 {
            let round = self.round_changes.min_round_above(current_round);
            info!(
                round,
                f = self.validators.f(),
                "received F+1 ROUND-CHANGE for higher rounds"
            );
            self.start_new_round(round);
            self.broadcast_round_change(round);
        } else if current >= quorum
            && self.is_proposer()
            && self.current.preprepare_sent() < current_round
        {
            info!(round = current_round, "received quorum of ROUND-CHANGE");
            let highest = self.round_changes.highest_prepared(current_round).cloned();
            let (proposal, prepares) = match highest {
                Some(highest) => (Some(highest.block), highest.prepares),
                None => (self.current.pending_request().cloned(), Vec::new()),
            };
            let Some(proposal) = proposal else {
                debug!(round = current_round, "no proposal to justify");
                return Ok(());
            };
            let round_changes = self.round_changes.round_changes(current_round);
            if let Err(err) = is_justified(&proposal.hash(), &round_changes, &prepares, quorum) {
                warn!(?err, round = current_round, "ROUND-CHANGE quorum does not justify proposal");
                return Ok(());
            }
            self.send_preprepare(proposal, round_changes, prepares);
        }
        Ok(())
    }
}
