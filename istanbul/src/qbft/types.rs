//! Messages exchanged by QBFT validators.
//!
//! Every message carries a signed payload. PRE-PREPARE and ROUND-CHANGE
//! additionally piggy-back unsigned evidence (other validators' signed
//! payloads and, for ROUND-CHANGE, the prepared block itself).

use crate::{
    types::{Address, Code, Digest, View, MAX_JUSTIFICATIONS, MAX_SIGNATURE_LENGTH},
    Error, Proposal,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Decode, EncodeSize, Error as CodecError, Read, ReadExt, Write};

/// A payload signed by a validator.
pub trait Payload: Clone + PartialEq + Write + EncodeSize + Read<Cfg = ()> {
    /// Code of the message carrying the payload.
    const CODE: Code;

    /// View the payload refers to.
    fn view(&self) -> View;
}

/// Data a validator signs for `payload`: the message code followed by the encoded payload.
pub fn signing_data<T: Payload>(payload: &T) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + payload.encode_size());
    data.push(T::CODE.into());
    payload.write(&mut data);
    data
}

/// Data a validator seals when committing `digest` in `round`.
pub fn commit_seal_data(digest: &Digest, round: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(digest.len() + 8);
    data.extend_from_slice(digest);
    data.extend_from_slice(&round.to_be_bytes());
    data
}

/// Proposal of a block for a view.
#[derive(Clone, Debug, PartialEq)]
pub struct Preprepare<P: Proposal> {
    pub view: View,
    pub proposal: P,
}

impl<P: Proposal> Payload for Preprepare<P> {
    const CODE: Code = Code::Preprepare;

    fn view(&self) -> View {
        self.view
    }
}

impl<P: Proposal> Write for Preprepare<P> {
    fn write(&self, writer: &mut impl BufMut) {
        self.view.write(writer);
        self.proposal.write(writer);
    }
}

impl<P: Proposal> EncodeSize for Preprepare<P> {
    fn encode_size(&self) -> usize {
        self.view.encode_size() + self.proposal.encode_size()
    }
}

impl<P: Proposal> Read for Preprepare<P> {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let view = View::read(reader)?;
        let proposal = P::read_cfg(reader, &())?;
        Ok(Self { view, proposal })
    }
}

/// Vote that a proposal is valid for a view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prepare {
    pub view: View,
    pub digest: Digest,
}

impl Payload for Prepare {
    const CODE: Code = Code::Prepare;

    fn view(&self) -> View {
        self.view
    }
}

impl Write for Prepare {
    fn write(&self, writer: &mut impl BufMut) {
        self.view.write(writer);
        self.digest.write(writer);
    }
}

impl EncodeSize for Prepare {
    fn encode_size(&self) -> usize {
        self.view.encode_size() + self.digest.encode_size()
    }
}

impl Read for Prepare {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let view = View::read(reader)?;
        let digest = Digest::read(reader)?;
        Ok(Self { view, digest })
    }
}

/// Vote to finalize a proposal, carrying the sender's commit seal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub view: View,
    pub digest: Digest,
    pub seal: Bytes,
}

impl Payload for Commit {
    const CODE: Code = Code::Commit;

    fn view(&self) -> View {
        self.view
    }
}

impl Write for Commit {
    fn write(&self, writer: &mut impl BufMut) {
        self.view.write(writer);
        self.digest.write(writer);
        self.seal.write(writer);
    }
}

impl EncodeSize for Commit {
    fn encode_size(&self) -> usize {
        self.view.encode_size() + self.digest.encode_size() + self.seal.encode_size()
    }
}

impl Read for Commit {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let view = View::read(reader)?;
        let digest = Digest::read(reader)?;
        let seal = Bytes::read_cfg(reader, &(..=MAX_SIGNATURE_LENGTH).into())?;
        Ok(Self { view, digest, seal })
    }
}

/// Round and digest a validator observed a quorum of PREPAREs for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prepared {
    pub round: u64,
    pub digest: Digest,
}

impl Write for Prepared {
    fn write(&self, writer: &mut impl BufMut) {
        self.round.write(writer);
        self.digest.write(writer);
    }
}

impl EncodeSize for Prepared {
    fn encode_size(&self) -> usize {
        self.round.encode_size() + self.digest.encode_size()
    }
}

impl Read for Prepared {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let round = u64::read(reader)?;
        let digest = Digest::read(reader)?;
        Ok(Self { round, digest })
    }
}

/// Request to move to a round, carrying the sender's prepared state (if any).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundChange {
    pub view: View,
    pub prepared: Option<Prepared>,
}

impl Payload for RoundChange {
    const CODE: Code = Code::RoundChange;

    fn view(&self) -> View {
        self.view
    }
}

impl Write for RoundChange {
    fn write(&self, writer: &mut impl BufMut) {
        self.view.write(writer);
        self.prepared.write(writer);
    }
}

impl EncodeSize for RoundChange {
    fn encode_size(&self) -> usize {
        self.view.encode_size() + self.prepared.encode_size()
    }
}

impl Read for RoundChange {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let view = View::read(reader)?;
        let prepared = Option::<Prepared>::read(reader)?;
        Ok(Self { view, prepared })
    }
}

/// A payload and the signature over its [signing_data].
#[derive(Clone, Debug, PartialEq)]
pub struct Signed<T: Payload> {
    pub payload: T,
    pub signature: Bytes,
}

impl<T: Payload> Signed<T> {
    /// Sign `payload` with `sign`.
    pub fn sign<F>(payload: T, sign: F) -> Result<Self, Error>
    where
        F: FnOnce(&[u8]) -> Result<Bytes, Error>,
    {
        let signature = sign(&signing_data(&payload))?;
        Ok(Self { payload, signature })
    }

    /// Verify the signature with `verify`, which returns the signer.
    pub fn verify<F>(self, verify: F) -> Result<Verified<T>, Error>
    where
        F: Fn(&[u8], &[u8]) -> Result<Address, Error>,
    {
        let source = verify(&signing_data(&self.payload), &self.signature)?;
        Ok(Verified {
            source,
            signed: self,
        })
    }
}

impl<T: Payload> Write for Signed<T> {
    fn write(&self, writer: &mut impl BufMut) {
        self.payload.write(writer);
        self.signature.write(writer);
    }
}

impl<T: Payload> EncodeSize for Signed<T> {
    fn encode_size(&self) -> usize {
        self.payload.encode_size() + self.signature.encode_size()
    }
}

impl<T: Payload> Read for Signed<T> {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let payload = T::read(reader)?;
        let signature = Bytes::read_cfg(reader, &(..=MAX_SIGNATURE_LENGTH).into())?;
        Ok(Self { payload, signature })
    }
}

/// A signed payload whose signer has been recovered.
#[derive(Clone, Debug, PartialEq)]
pub struct Verified<T: Payload> {
    pub source: Address,
    pub signed: Signed<T>,
}

impl<T: Payload> Verified<T> {
    pub fn payload(&self) -> &T {
        &self.signed.payload
    }
}

/// Evidence attached to a PRE-PREPARE for a round greater than zero.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Justification {
    pub round_changes: Vec<Signed<RoundChange>>,
    pub prepares: Vec<Signed<Prepare>>,
}

impl Write for Justification {
    fn write(&self, writer: &mut impl BufMut) {
        self.round_changes.write(writer);
        self.prepares.write(writer);
    }
}

impl EncodeSize for Justification {
    fn encode_size(&self) -> usize {
        self.round_changes.encode_size() + self.prepares.encode_size()
    }
}

impl Read for Justification {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let round_changes = Vec::read_cfg(reader, &((..=MAX_JUSTIFICATIONS).into(), ()))?;
        let prepares = Vec::read_cfg(reader, &((..=MAX_JUSTIFICATIONS).into(), ()))?;
        Ok(Self {
            round_changes,
            prepares,
        })
    }
}

/// A QBFT message as carried on the wire.
///
/// The [Code] of a message is transmitted alongside its payload and is not
/// part of the encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum Message<P: Proposal> {
    Preprepare {
        preprepare: Signed<Preprepare<P>>,
        justification: Justification,
    },
    Prepare(Signed<Prepare>),
    Commit(Signed<Commit>),
    RoundChange {
        round_change: Signed<RoundChange>,
        prepared_block: Option<P>,
        justification: Vec<Signed<Prepare>>,
    },
}

impl<P: Proposal> Message<P> {
    /// Code of the message.
    pub fn code(&self) -> Code {
        match self {
            Self::Preprepare { .. } => Code::Preprepare,
            Self::Prepare(_) => Code::Prepare,
            Self::Commit(_) => Code::Commit,
            Self::RoundChange { .. } => Code::RoundChange,
        }
    }

    /// View of the signed payload.
    pub fn view(&self) -> View {
        match self {
            Self::Preprepare { preprepare, .. } => preprepare.payload.view,
            Self::Prepare(prepare) => prepare.payload.view,
            Self::Commit(commit) => commit.payload.view,
            Self::RoundChange { round_change, .. } => round_change.payload.view,
        }
    }

    /// Decode a message with `code` that must consume all of `payload`.
    pub fn decode(code: Code, payload: Bytes) -> Result<Self, Error> {
        Self::decode_cfg(payload, &code).map_err(|err| Error::FailedDecode(code, err))
    }

    /// Verify the signature of the message and of all piggy-backed payloads.
    pub fn verify<F>(self, verify: F) -> Result<Authenticated<P>, Error>
    where
        F: Fn(&[u8], &[u8]) -> Result<Address, Error>,
    {
        match self {
            Self::Preprepare {
                preprepare,
                justification,
            } => {
                let preprepare = preprepare.verify(&verify)?;
                let round_changes = justification
                    .round_changes
                    .into_iter()
                    .map(|rc| rc.verify(&verify))
                    .collect::<Result<Vec<_>, _>>()?;
                let prepares = justification
                    .prepares
                    .into_iter()
                    .map(|prepare| prepare.verify(&verify))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Authenticated::Preprepare {
                    preprepare,
                    round_changes,
                    prepares,
                })
            }
            Self::Prepare(prepare) => Ok(Authenticated::Prepare(prepare.verify(&verify)?)),
            Self::Commit(commit) => Ok(Authenticated::Commit(commit.verify(&verify)?)),
            Self::RoundChange {
                round_change,
                prepared_block,
                justification,
            } => {
                let round_change = round_change.verify(&verify)?;
                let justification = justification
                    .into_iter()
                    .map(|prepare| prepare.verify(&verify))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Authenticated::RoundChange {
                    round_change,
                    prepared_block,
                    justification,
                })
            }
        }
    }
}

impl<P: Proposal> Write for Message<P> {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Preprepare {
                preprepare,
                justification,
            } => {
                preprepare.write(writer);
                justification.write(writer);
            }
            Self::Prepare(prepare) => prepare.write(writer),
            Self::Commit(commit) => commit.write(writer),
            Self::RoundChange {
                round_change,
                prepared_block,
                justification,
            } => {
                round_change.write(writer);
                prepared_block.write(writer);
                justification.write(writer);
            }
        }
    }
}

impl<P: Proposal> EncodeSize for Message<P> {
    fn encode_size(&self) -> usize {
        match self {
            Self::Preprepare {
                preprepare,
                justification,
            } => preprepare.encode_size() + justification.encode_size(),
            Self::Prepare(prepare) => prepare.encode_size(),
            Self::Commit(commit) => commit.encode_size(),
            Self::RoundChange {
                round_change,
                prepared_block,
                justification,
            } => {
                round_change.encode_size()
                    + prepared_block.encode_size()
                    + justification.encode_size()
            }
        }
    }
}

impl<P: Proposal> Read for Message<P> {
    type Cfg = Code;

    fn read_cfg(reader: &mut impl Buf, code: &Code) -> Result<Self, CodecError> {
        match *code {
            Code::Preprepare => {
                let preprepare = Signed::read(reader)?;
                let justification = Justification::read(reader)?;
                Ok(Self::Preprepare {
                    preprepare,
                    justification,
                })
            }
            Code::Prepare => Ok(Self::Prepare(Signed::read(reader)?)),
            Code::Commit => Ok(Self::Commit(Signed::read(reader)?)),
            Code::RoundChange => {
                let round_change = Signed::read(reader)?;
                let prepared_block = Option::<P>::read_cfg(reader, &())?;
                let justification =
                    Vec::read_cfg(reader, &((..=MAX_JUSTIFICATIONS).into(), ()))?;
                Ok(Self::RoundChange {
                    round_change,
                    prepared_block,
                    justification,
                })
            }
        }
    }
}

/// A QBFT message whose signatures (including piggy-backed ones) have been verified.
#[derive(Clone, Debug, PartialEq)]
pub enum Authenticated<P: Proposal> {
    Preprepare {
        preprepare: Verified<Preprepare<P>>,
        round_changes: Vec<Verified<RoundChange>>,
        prepares: Vec<Verified<Prepare>>,
    },
    Prepare(Verified<Prepare>),
    Commit(Verified<Commit>),
    RoundChange {
        round_change: Verified<RoundChange>,
        prepared_block: Option<P>,
        justification: Vec<Verified<Prepare>>,
    },
}

impl<P: Proposal> Authenticated<P> {
    /// Code of the message.
    pub fn code(&self) -> Code {
        match self {
            Self::Preprepare { .. } => Code::Preprepare,
            Self::Prepare(_) => Code::Prepare,
            Self::Commit(_) => Code::Commit,
            Self::RoundChange { .. } => Code::RoundChange,
        }
    }

    /// View of the signed payload.
    pub fn view(&self) -> View {
        match self {
            Self::Preprepare { preprepare, .. } => preprepare.payload().view,
            Self::Prepare(prepare) => prepare.payload().view,
            Self::Commit(commit) => commit.payload().view,
            Self::RoundChange { round_change, .. } => round_change.payload().view,
        }
    }

    /// Signer of the message.
    pub fn source(&self) -> Address {
        match self {
            Self::Preprepare { preprepare, .. } => preprepare.source,
            Self::Prepare(prepare) => prepare.source,
            Self::Commit(commit) => commit.source,
            Self::RoundChange { round_change, .. } => round_change.source,
        }
    }

    /// Strip recovered signers, returning the wire form.
    pub fn to_message(&self) -> Message<P> {
        match self {
            Self::Preprepare {
                preprepare,
                round_changes,
                prepares,
            } => Message::Preprepare {
                preprepare: preprepare.signed.clone(),
                justification: Justification {
                    round_changes: round_changes.iter().map(|v| v.signed.clone()).collect(),
                    prepares: prepares.iter().map(|v| v.signed.clone()).collect(),
                },
            },
            Self::Prepare(prepare) => Message::Prepare(prepare.signed.clone()),
            Self::Commit(commit) => Message::Commit(commit.signed.clone()),
            Self::RoundChange {
                round_change,
                prepared_block,
                justification,
            } => Message::RoundChange {
                round_change: round_change.signed.clone(),
                prepared_block: prepared_block.clone(),
                justification: justification.iter().map(|v| v.signed.clone()).collect(),
            },
        }
    }
}
