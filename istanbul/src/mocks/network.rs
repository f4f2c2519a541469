use super::{
    backend::{Backend, Event},
    block::Block,
};
use crate::{ibft, metrics::Metrics, qbft, signature::Signer, Address, Code, Config, Error};
use crate::{ProposerPolicy, ValidatorSet};
use bytes::Bytes;
use commonware_runtime::{deterministic, Metrics as _};
use futures::channel::mpsc;
use std::collections::BTreeSet;

/// A state machine driven by the lock-step [Network].
pub trait Node {
    fn address(&self) -> Address;
    fn start(&mut self);
    fn request(&mut self, block: Block);
    fn message(&mut self, code: Code, payload: Bytes) -> Result<(), Error>;
    fn final_committed(&mut self);
    fn timeout(&mut self);
}

impl Node for qbft::Core<deterministic::Context, Backend, Block> {
    fn address(&self) -> Address {
        self.address()
    }

    fn start(&mut self) {
        self.start()
    }

    fn request(&mut self, block: Block) {
        let _ = self.handle_request(block);
    }

    fn message(&mut self, code: Code, payload: Bytes) -> Result<(), Error> {
        self.handle_message(code, payload)
    }

    fn final_committed(&mut self) {
        self.handle_final_committed()
    }

    fn timeout(&mut self) {
        self.handle_timeout()
    }
}

impl Node for ibft::Core<deterministic::Context, Backend, Block> {
    fn address(&self) -> Address {
        self.address()
    }

    fn start(&mut self) {
        self.start()
    }

    fn request(&mut self, block: Block) {
        let _ = self.handle_request(block);
    }

    fn message(&mut self, code: Code, payload: Bytes) -> Result<(), Error> {
        self.handle_message(code, payload)
    }

    fn final_committed(&mut self) {
        self.handle_final_committed()
    }

    fn timeout(&mut self) {
        self.handle_timeout()
    }
}

/// Signers and backends of `n` validators sharing one event channel.
pub fn backends(
    n: u64,
    config: &Config,
) -> (Vec<Signer>, Vec<Backend>, mpsc::UnboundedReceiver<Event>) {
    let signers: Vec<_> = (0..n).map(Signer::from_seed).collect();
    let validators = ValidatorSet::new(
        signers.iter().map(Signer::address).collect(),
        ProposerPolicy::RoundRobin,
    );

    // Order validators the way the set does so node `i` has validator index `i`
    let mut signers = signers;
    signers.sort_by_key(Signer::address);
    let (sender, receiver) = mpsc::unbounded();
    let backends = signers
        .iter()
        .map(|signer| {
            Backend::new(
                signer.clone(),
                validators.clone(),
                config.clone(),
                sender.clone(),
            )
        })
        .collect();
    (signers, backends, receiver)
}

/// Delivers broadcasts between nodes, one message at a time, until the network is quiet.
pub struct Network<N: Node> {
    pub nodes: Vec<N>,
    pub offline: BTreeSet<Address>,
    pub committed: Vec<(Address, Block, u64)>,
    pub errors: Vec<(Address, Code, Error)>,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl<N: Node> Network<N> {
    pub fn new(nodes: Vec<N>, receiver: mpsc::UnboundedReceiver<Event>) -> Self {
        Self {
            nodes,
            offline: BTreeSet::new(),
            committed: Vec::new(),
            errors: Vec::new(),
            receiver,
        }
    }

    /// Start every node and deliver the resulting messages.
    pub fn start(&mut self) {
        for node in &mut self.nodes {
            node.start();
        }
        self.run();
    }

    /// Send `block` to every online node as a request and deliver the resulting messages.
    pub fn request(&mut self, block: &Block) {
        for node in &mut self.nodes {
            if self.offline.contains(&node.address()) {
                continue;
            }
            node.request(block.clone());
        }
        self.run();
    }

    /// Expire the round timer of every online node and deliver the resulting messages.
    pub fn timeout(&mut self) {
        for node in &mut self.nodes {
            if self.offline.contains(&node.address()) {
                continue;
            }
            node.timeout();
        }
        self.run();
    }

    /// Deliver pending events until none are left.
    pub fn run(&mut self) {
        while let Ok(Some(event)) = self.receiver.try_next() {
            match event {
                Event::Broadcast {
                    from,
                    code,
                    payload,
                } => {
                    if self.offline.contains(&from) {
                        continue;
                    }
                    for node in &mut self.nodes {
                        let address = node.address();
                        if address == from || self.offline.contains(&address) {
                            continue;
                        }
                        if let Err(err) = node.message(code, payload.clone()) {
                            self.errors.push((address, code, err));
                        }
                    }
                }
                Event::Gossip { .. } => {}
                Event::Committed {
                    validator,
                    block,
                    round,
                    ..
                } => {
                    self.committed.push((validator, block, round));
                    if let Some(node) = self.nodes.iter_mut().find(|n| n.address() == validator) {
                        node.final_committed();
                    }
                }
            }
        }
    }

    /// Number of nodes that committed a block at `height`.
    pub fn committed_at(&self, height: u64) -> Vec<&Block> {
        self.committed
            .iter()
            .filter(|(_, block, _)| crate::Proposal::number(block) == height)
            .map(|(_, block, _)| block)
            .collect()
    }
}

/// Build a QBFT network of `n` validators.
pub fn qbft_network(
    context: &deterministic::Context,
    n: u64,
    config: Config,
) -> Network<qbft::Core<deterministic::Context, Backend, Block>> {
    let (_, backends, receiver) = backends(n, &config);
    let nodes = backends
        .into_iter()
        .enumerate()
        .map(|(i, backend)| {
            let context = context.with_label(&format!("validator_{i}"));
            let metrics = Metrics::init(&context);
            qbft::Core::new(context, backend, config.clone(), metrics)
        })
        .collect();
    Network::new(nodes, receiver)
}

/// Build an IBFT network of `n` validators.
pub fn ibft_network(
    context: &deterministic::Context,
    n: u64,
    config: Config,
) -> Network<ibft::Core<deterministic::Context, Backend, Block>> {
    let (_, backends, receiver) = backends(n, &config);
    let nodes = backends
        .into_iter()
        .enumerate()
        .map(|(i, backend)| {
            let context = context.with_label(&format!("validator_{i}"));
            let metrics = Metrics::init(&context);
            ibft::Core::new(context, backend, config.clone(), metrics)
        })
        .collect();
    Network::new(nodes, receiver)
}
