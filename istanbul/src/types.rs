//! Primitive types shared by the IBFT and QBFT state machines.

use crate::Error;
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use std::fmt;

/// Length of an [Address] in bytes.
pub const ADDRESS_LENGTH: usize = 20;

/// Length of a [Digest] in bytes.
pub const DIGEST_LENGTH: usize = 32;

/// Identity of a validator.
pub type Address = [u8; ADDRESS_LENGTH];

/// Hash of a proposal.
pub type Digest = [u8; DIGEST_LENGTH];

/// Digest carried by messages that do not reference a proposal.
pub const EMPTY_DIGEST: Digest = [0; DIGEST_LENGTH];

/// Maximum length of a signature accepted from the wire.
pub const MAX_SIGNATURE_LENGTH: usize = 256;

/// Maximum number of piggy-backed messages accepted from the wire.
pub const MAX_JUSTIFICATIONS: usize = 1024;

/// Code of a consensus message.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Code {
    Preprepare = 0,
    Prepare = 1,
    Commit = 2,
    RoundChange = 3,
}

impl Code {
    /// Order in which backlogged messages of the same view are replayed.
    ///
    /// PRE-PREPARE is replayed before COMMIT, which is replayed before PREPARE.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Preprepare => 1,
            Self::Commit => 2,
            Self::Prepare => 3,
            Self::RoundChange => 0,
        }
    }
}

impl TryFrom<u8> for Code {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Preprepare),
            1 => Ok(Self::Prepare),
            2 => Ok(Self::Commit),
            3 => Ok(Self::RoundChange),
            code => Err(Error::UnknownCode(code)),
        }
    }
}

impl From<Code> for u8 {
    fn from(code: Code) -> Self {
        code as u8
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preprepare => "PRE-PREPARE",
            Self::Prepare => "PREPARE",
            Self::Commit => "COMMIT",
            Self::RoundChange => "ROUND-CHANGE",
        };
        f.write_str(name)
    }
}

/// Position of the protocol: the block height being agreed upon and the
/// attempt number within that height.
///
/// Views are ordered by sequence first, then by round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct View {
    pub sequence: u64,
    pub round: u64,
}

impl View {
    pub fn new(sequence: u64, round: u64) -> Self {
        Self { sequence, round }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{sequence: {}, round: {}}}", self.sequence, self.round)
    }
}

impl Write for View {
    fn write(&self, writer: &mut impl BufMut) {
        self.sequence.write(writer);
        self.round.write(writer);
    }
}

impl EncodeSize for View {
    fn encode_size(&self) -> usize {
        self.sequence.encode_size() + self.round.encode_size()
    }
}

impl Read for View {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let sequence = u64::read(reader)?;
        let round = u64::read(reader)?;
        Ok(Self { sequence, round })
    }
}

/// Progress of the local node within the current round.
///
/// States only move forward within a round. They reset to
/// [State::AcceptRequest] on a round change or a new sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    AcceptRequest,
    Preprepared,
    Prepared,
    Committed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AcceptRequest => "Accept request",
            Self::Preprepared => "Preprepared",
            Self::Prepared => "Prepared",
            Self::Committed => "Committed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use commonware_codec::{Decode, DecodeExt, Encode};

    #[test]
    fn test_view_order() {
        assert!(View::new(1, 5) < View::new(2, 0));
        assert!(View::new(2, 0) < View::new(2, 1));
        assert_eq!(View::new(3, 3), View::new(3, 3));
    }

    #[test]
    fn test_state_order() {
        assert!(State::AcceptRequest < State::Preprepared);
        assert!(State::Preprepared < State::Prepared);
        assert!(State::Prepared < State::Committed);
    }

    #[test]
    fn test_code_priority() {
        let mut codes = [Code::Prepare, Code::Commit, Code::Preprepare];
        codes.sort_by_key(Code::priority);
        assert_eq!(codes, [Code::Preprepare, Code::Commit, Code::Prepare]);
        assert!(matches!(Code::try_from(4), Err(Error::UnknownCode(4))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut encoded = View::new(7, 2).encode();
        encoded.put_u8(0);
        assert!(matches!(
            View::decode(encoded.freeze()),
            Err(CodecError::ExtraData(1))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = View::new(7, 2).encode().freeze();
        assert!(matches!(
            View::decode(encoded.slice(..10)),
            Err(CodecError::EndOfBuffer)
        ));
    }

    #[test]
    fn test_signature_length_bound() {
        let cfg = (..=MAX_SIGNATURE_LENGTH).into();
        let signature = Bytes::from(vec![7u8; MAX_SIGNATURE_LENGTH]);
        let encoded = signature.encode().freeze();
        assert_eq!(Bytes::decode_cfg(encoded, &cfg).unwrap(), signature);

        let oversized = Bytes::from(vec![7u8; MAX_SIGNATURE_LENGTH + 1]);
        assert!(Bytes::decode_cfg(oversized.encode().freeze(), &cfg).is_err());
    }
}
