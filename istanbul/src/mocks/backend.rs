use super::block::Block;
use crate::{
    config::{Algorithm, Config},
    ibft, qbft,
    signature::{recover, Signer},
    validators::verify_committed_seals,
    Address, Code, Digest, Error, Proposal, ValidatorSet,
};
use bytes::Bytes;
use futures::channel::mpsc;
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Side effects of a [Backend] observed by the test harness.
#[derive(Clone, Debug)]
pub enum Event {
    Broadcast {
        from: Address,
        code: Code,
        payload: Bytes,
    },
    Gossip {
        from: Address,
        code: Code,
        payload: Bytes,
    },
    Committed {
        validator: Address,
        block: Block,
        seals: Vec<Bytes>,
        round: u64,
    },
}

/// Misbehavior injected into a [Backend].
#[derive(Default)]
pub struct Faults {
    /// Proposals reported as known bad.
    pub bad: BTreeSet<Digest>,
    /// Proposals rejected by verification.
    pub invalid: BTreeSet<Digest>,
    /// Delay returned (once) by the next verification.
    pub future: Option<Duration>,
    /// Number of upcoming commits to reject.
    pub fail_commits: usize,
}

/// Finalized blocks and the address of their proposer (starting at genesis).
pub type Chain = Arc<Mutex<Vec<(Block, Option<Address>)>>>;

/// A backend that keeps its chain in memory and reports side effects on a channel.
pub struct Backend {
    signer: Signer,
    validators: ValidatorSet,
    config: Config,
    chain: Chain,
    faults: Arc<Mutex<Faults>>,
    events: mpsc::UnboundedSender<Event>,
}

impl Backend {
    pub fn new(
        signer: Signer,
        validators: ValidatorSet,
        config: Config,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            signer,
            validators,
            config,
            chain: Arc::new(Mutex::new(vec![(Block::new(0, 0), None)])),
            faults: Arc::new(Mutex::new(Faults::default())),
            events,
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain.clone()
    }

    pub fn faults(&self) -> Arc<Mutex<Faults>> {
        self.faults.clone()
    }

    fn last(&self) -> (Block, Option<Address>) {
        let chain = self.chain.lock().unwrap();
        chain.last().cloned().unwrap()
    }
}

impl crate::Backend<Block> for Backend {
    fn address(&self) -> Address {
        self.signer.address()
    }

    fn validators(&self, _: Option<&Block>) -> ValidatorSet {
        self.validators.clone()
    }

    fn last_proposal(&self) -> (Block, Option<Address>) {
        self.last()
    }

    fn sign(&mut self, data: &[u8]) -> Result<Bytes, Error> {
        Ok(self.signer.sign(data))
    }

    fn recover(&self, data: &[u8], signature: &[u8]) -> Result<Address, Error> {
        recover(data, signature)
    }

    fn broadcast(&mut self, _: &ValidatorSet, code: Code, payload: Bytes) {
        let _ = self.events.unbounded_send(Event::Broadcast {
            from: self.signer.address(),
            code,
            payload,
        });
    }

    fn gossip(&mut self, _: &ValidatorSet, code: Code, payload: Bytes) {
        let _ = self.events.unbounded_send(Event::Gossip {
            from: self.signer.address(),
            code,
            payload,
        });
    }

    fn verify(&mut self, proposal: &Block) -> Result<(), Error> {
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.invalid.contains(&proposal.hash()) {
                return Err(Error::InvalidProposal("rejected by test".into()));
            }
            if let Some(delay) = faults.future.take() {
                return Err(Error::FutureBlock(delay));
            }
        }
        let (last, _) = self.last();
        if proposal.number() != last.number() + 1 {
            return Err(Error::UnknownAncestor);
        }
        Ok(())
    }

    fn commit(&mut self, proposal: &Block, seals: Vec<Bytes>, round: u64) -> Result<(), Error> {
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.fail_commits > 0 {
                faults.fail_commits -= 1;
                return Err(Error::UnknownBlock);
            }
        }
        let (last, last_proposer) = self.last();
        if proposal.number() <= last.number() {
            return Err(Error::AlreadyKnown);
        }
        if proposal.number() != last.number() + 1 {
            return Err(Error::UnknownAncestor);
        }
        let data = match self.config.algorithm_at(proposal.number()) {
            Algorithm::Qbft => qbft::types::commit_seal_data(&proposal.hash(), round),
            Algorithm::Ibft => ibft::types::commit_seal_data(&proposal.hash()),
        };
        verify_committed_seals(&self.validators, &data, &seals, recover)?;

        let proposer = self.validators.select(last_proposer.as_ref(), round);
        self.chain
            .lock()
            .unwrap()
            .push((proposal.clone(), proposer));
        let _ = self.events.unbounded_send(Event::Committed {
            validator: self.signer.address(),
            block: proposal.clone(),
            seals,
            round,
        });
        Ok(())
    }

    fn has_bad_proposal(&self, digest: &Digest) -> bool {
        self.faults.lock().unwrap().bad.contains(digest)
    }
}
