//! Messages exchanged by IBFT validators.
//!
//! Every message is an envelope around one payload. The envelope names the sender,
//! carries the committed seal of a COMMIT, and is signed as a whole.

use crate::{
    types::{Address, Code, Digest, View, MAX_SIGNATURE_LENGTH},
    Error, Proposal,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{
    Decode, EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write,
};

/// Data a validator seals when committing `digest`.
pub fn commit_seal_data(digest: &Digest) -> Vec<u8> {
    let mut data = Vec::with_capacity(digest.len() + 1);
    data.extend_from_slice(digest);
    data.push(Code::Commit.into());
    data
}

/// Proposal of a block for a view.
#[derive(Clone, Debug, PartialEq)]
pub struct Preprepare<P: Proposal> {
    pub view: View,
    pub proposal: P,
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

/// View and digest a PREPARE, COMMIT, or ROUND-CHANGE refers to.
///
/// ROUND-CHANGE subjects carry the empty digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subject {
    pub view: View,
    pub digest: Digest,
}

impl Write for Subject {
    fn write(&self, writer: &mut impl BufMut) {
        self.view.write(writer);
        self.digest.write(writer);
    }
}

impl EncodeSize for Subject {
    fn encode_size(&self) -> usize {
        self.view.encode_size() + Digest::SIZE
    }
}

impl Read for Subject {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let view = View::read(reader)?;
        let digest = Digest::read(reader)?;
        Ok(Self { view, digest })
    }
}

/// Content of an IBFT message.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload<P: Proposal> {
    Preprepare(Preprepare<P>),
    Prepare(Subject),
    Commit(Subject),
    RoundChange(Subject),
}

impl<P: Proposal> Payload<P> {
    pub fn code(&self) -> Code {
        match self {
            Self::Preprepare(_) => Code::Preprepare,
            Self::Prepare(_) => Code::Prepare,
            Self::Commit(_) => Code::Commit,
            Self::RoundChange(_) => Code::RoundChange,
        }
    }

    pub fn view(&self) -> View {
        match self {
            Self::Preprepare(preprepare) => preprepare.view,
            Self::Prepare(subject) | Self::Commit(subject) | Self::RoundChange(subject) => {
                subject.view
            }
        }
    }

    fn read(code: Code, reader: &mut impl Buf) -> Result<Self, CodecError> {
        match code {
            Code::Preprepare => Ok(Self::Preprepare(Preprepare::read(reader)?)),
            Code::Prepare => Ok(Self::Prepare(Subject::read(reader)?)),
            Code::Commit => Ok(Self::Commit(Subject::read(reader)?)),
            Code::RoundChange => Ok(Self::RoundChange(Subject::read(reader)?)),
        }
    }
}

impl<P: Proposal> Write for Payload<P> {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Preprepare(preprepare) => preprepare.write(writer),
            Self::Prepare(subject) | Self::Commit(subject) | Self::RoundChange(subject) => {
                subject.write(writer)
            }
        }
    }
}

impl<P: Proposal> EncodeSize for Payload<P> {
    fn encode_size(&self) -> usize {
        match self {
            Self::Preprepare(preprepare) => preprepare.encode_size(),
            Self::Prepare(subject) | Self::Commit(subject) | Self::RoundChange(subject) => {
                subject.encode_size()
            }
        }
    }
}

/// An IBFT message as carried on the wire.
///
/// The [Code] of a message is transmitted alongside its encoding. The signature
/// covers the code, the payload, the address, and the committed seal.
#[derive(Clone, Debug, PartialEq)]
pub struct Message<P: Proposal> {
    pub payload: Payload<P>,
    pub address: Address,
    pub committed_seal: Bytes,
    pub signature: Bytes,
}

impl<P: Proposal> Message<P> {
    /// Unsigned message from `address`.
    pub fn new(payload: Payload<P>, address: Address, committed_seal: Bytes) -> Self {
        Self {
            payload,
            address,
            committed_seal,
            signature: Bytes::new(),
        }
    }

    pub fn code(&self) -> Code {
        self.payload.code()
    }

    pub fn view(&self) -> View {
        self.payload.view()
    }

    /// Data covered by the signature.
    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.encode_size());
        data.push(self.code().into());
        self.payload.write(&mut data);
        data.put_slice(&self.address);
        self.committed_seal.write(&mut data);
        data
    }

    /// Sign the message with `sign`.
    pub fn sign<F>(mut self, sign: F) -> Result<Self, Error>
    where
        F: FnOnce(&[u8]) -> Result<Bytes, Error>,
    {
        self.signature = sign(&self.signing_data())?;
        Ok(self)
    }

    /// Recover the signer with `recover` and check it is the sender named by the message.
    pub fn verify<F>(&self, recover: F) -> Result<Address, Error>
    where
        F: FnOnce(&[u8], &[u8]) -> Result<Address, Error>,
    {
        let signer = recover(&self.signing_data(), &self.signature)?;
        if signer != self.address {
            return Err(Error::InvalidSigner);
        }
        Ok(signer)
    }

    /// Decode a message with `code` that must consume all of `payload`.
    pub fn decode(code: Code, payload: Bytes) -> Result<Self, Error> {
        Self::decode_cfg(payload, &code).map_err(|err| Error::FailedDecode(code, err))
    }
}

impl<P: Proposal> Read for Message<P> {
    type Cfg = Code;

    fn read_cfg(reader: &mut impl Buf, code: &Code) -> Result<Self, CodecError> {
        let payload = Payload::read(*code, reader)?;
        let address = Address::read(reader)?;
        let committed_seal = Bytes::read_cfg(reader, &(..=MAX_SIGNATURE_LENGTH).into())?;
        let signature = Bytes::read_cfg(reader, &(..=MAX_SIGNATURE_LENGTH).into())?;
        Ok(Self {
            payload,
            address,
            committed_seal,
            signature,
        })
    }
}

impl<P: Proposal> Write for Message<P> {
    fn write(&self, writer: &mut impl BufMut) {
        self.payload.write(writer);
        writer.put_slice(&self.address);
        self.committed_seal.write(writer);
        self.signature.write(writer);
    }
}

impl<P: Proposal> EncodeSize for Message<P> {
    fn encode_size(&self) -> usize {
        self.payload.encode_size()
            + self.address.len()
            + self.committed_seal.encode_size()
            + self.signature.encode_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::block::Block,
        signature::{recover, Signer},
        types::EMPTY_DIGEST,
    };
    use commonware_codec::Encode;

    fn signed(signer: &Signer, payload: Payload<Block>, seal: Bytes) -> Message<Block> {
        Message::new(payload, signer.address(), seal)
            .sign(|data| Ok(signer.sign(data)))
            .unwrap()
    }

    #[test]
    fn test_codec() {
        let signer = Signer::from_seed(1);
        let block = Block::new(3, 1);
        let messages = [
            signed(
                &signer,
                Payload::Preprepare(Preprepare {
                    view: View::new(3, 0),
                    proposal: block.clone(),
                }),
                Bytes::new(),
            ),
            signed(
                &signer,
                Payload::Commit(Subject {
                    view: View::new(3, 0),
                    digest: block.hash(),
                }),
                signer.sign(&commit_seal_data(&block.hash())),
            ),
            signed(
                &signer,
                Payload::RoundChange(Subject {
                    view: View::new(3, 1),
                    digest: EMPTY_DIGEST,
                }),
                Bytes::new(),
            ),
        ];
        for message in messages {
            let encoded = message.encode().freeze();
            assert_eq!(encoded.len(), message.encode_size());
            let decoded = Message::<Block>::decode(message.code(), encoded).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(decoded.verify(recover).unwrap(), signer.address());
        }
    }

    #[test]
    fn test_signer_must_match_address() {
        let signer = Signer::from_seed(1);
        let other = Signer::from_seed(2);
        let subject = Subject {
            view: View::new(1, 0),
            digest: [3; 32],
        };

        // Signed by someone other than the named sender
        let message =
            Message::<Block>::new(Payload::Prepare(subject), other.address(), Bytes::new())
                .sign(|data| Ok(signer.sign(data)))
                .unwrap();
        assert!(matches!(message.verify(recover), Err(Error::InvalidSigner)));

        // Committed seal is covered by the signature
        let mut message = signed(
            &signer,
            Payload::Commit(subject),
            signer.sign(&commit_seal_data(&subject.digest)),
        );
        message.committed_seal = other.sign(&commit_seal_data(&subject.digest));
        assert!(message.verify(recover).is_err());
    }

    #[test]
    fn test_decode_errors() {
        let signer = Signer::from_seed(1);
        let message = signed(
            &signer,
            Payload::Prepare(Subject {
                view: View::new(1, 0),
                digest: [3; 32],
            }),
            Bytes::new(),
        );
        let encoded = message.encode().freeze();
        assert!(matches!(
            Message::<Block>::decode(Code::Prepare, encoded.slice(..encoded.len() - 2)),
            Err(Error::FailedDecode(Code::Prepare, _))
        ));
        let mut extended = encoded.to_vec();
        extended.extend_from_slice(&[0, 0]);
        assert!(matches!(
            Message::<Block>::decode(Code::Prepare, Bytes::from(extended)),
            Err(Error::FailedDecode(Code::Prepare, CodecError::ExtraData(2)))
        ));
    }

    #[test]
    fn test_commit_seal_data() {
        let data = commit_seal_data(&[5; 32]);
        assert_eq!(data.len(), 33);
        assert_eq!(data[32], u8::from(Code::Commit));
    }
}
