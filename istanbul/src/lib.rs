//! Finalize blocks with Istanbul BFT in a permissioned validator set.
//!
//! # Overview
//!
//! Validators agree, one block height at a time, on the next block of a chain. Each height
//! (the _sequence_) is attempted in numbered _rounds_. In each round a deterministically
//! selected proposer broadcasts a PRE-PREPARE carrying its block, validators answer with
//! PREPARE and, once a quorum of PREPAREs is observed, with COMMIT. A quorum of COMMITs
//! finalizes the block: the collected commit seals are handed to the [Backend], which
//! persists the block and later reports it as final. If a round does not finish before its
//! timer expires, validators broadcast ROUND-CHANGE and move to the next round.
//!
//! Two variants are provided:
//!
//! * [ibft]: the original protocol, which locks on a prepared block and re-proposes the
//!   locked block after a round change.
//! * [qbft]: the revised protocol, in which ROUND-CHANGE messages carry the sender's
//!   prepared round and block (with the PREPAREs that prove it) and a re-proposal must be
//!   justified by a quorum of such messages.
//!
//! Both state machines are synchronous and owned by a single consumer. The [engine] wraps
//! them in an actor that serializes host requests, network messages, and timer expiries
//! through one mailbox and switches between variants at the configured fork height.
//!
//! # Status
//!
//! `commonware-istanbul` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use bytes::Bytes;
use commonware_codec::{EncodeSize, Read, Write};
use std::{fmt::Debug, time::Duration};
use thiserror::Error;

mod backlog;
pub mod config;
pub mod engine;
pub mod ibft;
pub mod ingress;
pub mod message_set;
mod metrics;
pub mod qbft;
pub mod signature;
pub mod types;
pub mod validators;

#[cfg(test)]
pub mod mocks;

pub use config::{Algorithm, Config, Transition};
pub use engine::Engine;
pub use ingress::Mailbox;
pub use types::{Address, Code, Digest, State, View};
pub use validators::{ProposerPolicy, ValidatorSet};

/// Errors that can occur while processing consensus events.
///
/// No error is fatal: the offending event is dropped and the state machine
/// keeps running.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid message")]
    InvalidMessage,
    #[error("future message")]
    FutureMessage,
    #[error("old message")]
    OldMessage,
    #[error("message not from proposer")]
    NotFromProposer,
    #[error("invalid signer")]
    InvalidSigner,
    #[error("unauthorized address")]
    UnauthorizedAddress,
    #[error("inconsistent subject")]
    InconsistentSubject,
    #[error("invalid prepared block")]
    InvalidPreparedBlock,
    #[error("invalid committed seals")]
    InvalidCommittedSeals,
    #[error("empty committed seals")]
    EmptyCommittedSeals,
    #[error("message ignored")]
    Ignored,
    #[error("conflicting message from sender")]
    Equivocation,
    #[error("unknown message code: {0}")]
    UnknownCode(u8),
    #[error("failed to decode {0} message: {1}")]
    FailedDecode(Code, commonware_codec::Error),
    #[error("unjustified proposal: {0}")]
    Unjustified(&'static str),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("failed to sign: {0}")]
    Sign(String),
    #[error("future block: retry in {0:?}")]
    FutureBlock(Duration),
    #[error("block already known")]
    AlreadyKnown,
    #[error("unknown ancestor")]
    UnknownAncestor,
    #[error("unknown block")]
    UnknownBlock,
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),
}

/// A block (or block-like value) that validators agree on.
///
/// The state machines only read the height and the hash of a proposal. Everything
/// else is interpreted by the [Backend].
pub trait Proposal:
    Clone + Debug + PartialEq + Send + Sync + 'static + Write + EncodeSize + Read<Cfg = ()>
{
    /// Height of the proposal.
    fn number(&self) -> u64;

    /// Hash of the proposal, referenced by PREPARE, COMMIT, and ROUND-CHANGE messages.
    fn hash(&self) -> Digest;
}

/// Chain integration consumed by the state machines.
///
/// All methods are called from the consensus loop and must not block for long.
pub trait Backend<P: Proposal>: Send + 'static {
    /// Address of the local validator.
    fn address(&self) -> Address;

    /// Validator set in effect after `proposal` (or at genesis if `None`).
    fn validators(&self, proposal: Option<&P>) -> ValidatorSet;

    /// Last finalized proposal and the address of its proposer (if any).
    fn last_proposal(&self) -> (P, Option<Address>);

    /// Sign `data` with the local validator key.
    fn sign(&mut self, data: &[u8]) -> Result<Bytes, Error>;

    /// Recover the address that produced `signature` over `data`.
    fn recover(&self, data: &[u8], signature: &[u8]) -> Result<Address, Error>;

    /// Send `payload` to every other validator in `validators`.
    ///
    /// The state machine delivers its own broadcasts to itself.
    fn broadcast(&mut self, validators: &ValidatorSet, code: Code, payload: Bytes);

    /// Relay `payload`, received from the network and successfully processed, to peers
    /// that have not seen it yet.
    fn gossip(&mut self, validators: &ValidatorSet, code: Code, payload: Bytes);

    /// Verify the contents of a proposal.
    ///
    /// [Error::FutureBlock] signals the proposal may become valid after the provided
    /// delay and is retried once.
    fn verify(&mut self, proposal: &P) -> Result<(), Error>;

    /// Finalize `proposal` with the collected commit `seals`.
    ///
    /// [Error::AlreadyKnown] is treated as success.
    fn commit(&mut self, proposal: &P, seals: Vec<Bytes>, round: u64) -> Result<(), Error>;

    /// Returns whether a proposal with `digest` is known to be bad.
    fn has_bad_proposal(&self, digest: &Digest) -> bool;
}
