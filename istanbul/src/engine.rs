//! Actor that drives a consensus state machine.
//!
//! Host requests, network messages, finalization notices, and timer expiries are
//! serialized through a single loop, so the state machine never observes concurrent
//! events. After each finalized block the engine checks which protocol variant the
//! next sequence uses and swaps state machines at the fork height.

use crate::{
    config::{Algorithm, Config},
    ibft,
    ingress::{Mailbox, Message},
    metrics::Metrics,
    qbft,
    types::{Digest, View},
    Backend, Proposal,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{channel::mpsc, future::Either, StreamExt};
use std::time::SystemTime;
use tracing::{debug, info};

/// State machine of the protocol variant in effect.
enum Variant<E: Clock, B: Backend<P>, P: Proposal> {
    Ibft(ibft::Core<E, B, P>),
    Qbft(qbft::Core<E, B, P>),
}

impl<E: Clock, B: Backend<P>, P: Proposal> Variant<E, B, P> {
    fn new(context: E, backend: B, config: Config, metrics: Metrics) -> Self {
        let (last, _) = backend.last_proposal();
        match config.algorithm_at(last.number() + 1) {
            Algorithm::Ibft => Self::Ibft(ibft::Core::new(context, backend, config, metrics)),
            Algorithm::Qbft => Self::Qbft(qbft::Core::new(context, backend, config, metrics)),
        }
    }

    fn algorithm(&self) -> Algorithm {
        match self {
            Self::Ibft(_) => Algorithm::Ibft,
            Self::Qbft(_) => Algorithm::Qbft,
        }
    }

    fn backend(&self) -> &B {
        match self {
            Self::Ibft(core) => core.backend(),
            Self::Qbft(core) => core.backend(),
        }
    }

    fn into_backend(self) -> B {
        match self {
            Self::Ibft(core) => core.into_backend(),
            Self::Qbft(core) => core.into_backend(),
        }
    }

    fn view(&self) -> View {
        match self {
            Self::Ibft(core) => core.view(),
            Self::Qbft(core) => core.view(),
        }
    }

    fn start(&mut self) {
        match self {
            Self::Ibft(core) => core.start(),
            Self::Qbft(core) => core.start(),
        }
    }

    fn next_deadline(&self) -> Option<SystemTime> {
        match self {
            Self::Ibft(core) => core.next_deadline(),
            Self::Qbft(core) => core.next_deadline(),
        }
    }

    fn handle_deadline(&mut self) {
        match self {
            Self::Ibft(core) => core.handle_deadline(),
            Self::Qbft(core) => core.handle_deadline(),
        }
    }

    fn handle_message(&mut self, message: Message<P>) {
        match message {
            Message::Request(proposal) => {
                let result = match self {
                    Self::Ibft(core) => core.handle_request(proposal),
                    Self::Qbft(core) => core.handle_request(proposal),
                };
                if let Err(err) = result {
                    debug!(?err, "request not proposed");
                }
            }
            Message::Message { code, payload } => {
                let result = match self {
                    Self::Ibft(core) => core.handle_message(code, payload),
                    Self::Qbft(core) => core.handle_message(code, payload),
                };
                if let Err(err) = result {
                    debug!(?err, %code, "message not handled");
                }
            }
            Message::FinalCommitted => match self {
                Self::Ibft(core) => core.handle_final_committed(),
                Self::Qbft(core) => core.handle_final_committed(),
            },
            Message::IsProposer { response } => {
                let _ = response.send(self.is_proposer());
            }
            Message::IsCurrentProposal { digest, response } => {
                let _ = response.send(self.is_current_proposal(&digest));
            }
            Message::Stop => {}
        }
    }

    fn is_proposer(&self) -> bool {
        match self {
            Self::Ibft(core) => core.is_proposer(),
            Self::Qbft(core) => core.is_proposer(),
        }
    }

    fn is_current_proposal(&self, digest: &Digest) -> bool {
        match self {
            Self::Ibft(core) => core.is_current_proposal(digest),
            Self::Qbft(core) => core.is_current_proposal(digest),
        }
    }
}

/// Instance of Istanbul BFT consensus for one validator.
pub struct Engine<E: Clock + Spawner + RuntimeMetrics, B: Backend<P>, P: Proposal> {
    context: E,
    config: Config,
    metrics: Metrics,

    core: Variant<E, B, P>,
    mailbox: mpsc::Receiver<Message<P>>,
}

impl<E: Clock + Spawner + RuntimeMetrics, B: Backend<P>, P: Proposal> Engine<E, B, P> {
    /// Create a new engine and the [Mailbox] used to drive it.
    ///
    /// The protocol variant is selected by the sequence following the backend's last
    /// finalized proposal.
    pub fn new(context: E, backend: B, config: Config) -> (Self, Mailbox<P>) {
        config.assert();
        let metrics = Metrics::init(&context);
        let core = Variant::new(context.clone(), backend, config.clone(), metrics.clone());
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        (
            Self {
                context,
                config,
                metrics,

                core,
                mailbox,
            },
            Mailbox::new(sender),
        )
    }

    /// Start the engine.
    ///
    /// The engine runs until [Mailbox::stop] is called or every [Mailbox] is dropped.
    pub fn start(self) -> Handle<()> {
        let context = self.context.clone();
        context.spawn(|_| self.run())
    }

    async fn run(self) {
        let Self {
            context,
            config,
            metrics,
            mut core,
            mut mailbox,
        } = self;
        info!(algorithm = ?core.algorithm(), "starting engine");
        core.start();
        loop {
            let deadline = match core.next_deadline() {
                Some(deadline) => Either::Left(context.sleep_until(deadline)),
                None => Either::Right(futures::future::pending()),
            };
            select! {
                _ = deadline => {
                    core.handle_deadline();
                },
                message = mailbox.next() => {
                    let Some(message) = message else {
                        debug!("mailbox closed");
                        break;
                    };
                    match message {
                        Message::Stop => break,
                        Message::FinalCommitted => {
                            core = final_committed(&context, &config, &metrics, core);
                        }
                        message => core.handle_message(message),
                    }
                },
            }
        }
        info!(view = %core.view(), "stopped engine");
    }
}

/// Handle a finalized proposal, switching variants if the next sequence uses another one.
fn final_committed<E: Clock, B: Backend<P>, P: Proposal>(
    context: &E,
    config: &Config,
    metrics: &Metrics,
    mut core: Variant<E, B, P>,
) -> Variant<E, B, P> {
    let (last, _) = core.backend().last_proposal();
    let algorithm = config.algorithm_at(last.number() + 1);
    if algorithm == core.algorithm() {
        core.handle_message(Message::FinalCommitted);
        return core;
    }

    info!(
        sequence = last.number() + 1,
        from = ?core.algorithm(),
        to = ?algorithm,
        "switching protocol variant"
    );
    let backend = core.into_backend();
    let mut core = Variant::new(context.clone(), backend, config.clone(), metrics.clone());
    core.start();
    core
}
