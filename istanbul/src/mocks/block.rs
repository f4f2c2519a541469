use crate::{Digest, Proposal};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use sha2::{Digest as _, Sha256};

/// A block identified by its height and an arbitrary salt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    number: u64,
    salt: u64,
    hash: Digest,
}

impl Block {
    pub fn new(number: u64, salt: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(number.to_be_bytes());
        hasher.update(salt.to_be_bytes());
        Self {
            number,
            salt,
            hash: hasher.finalize().into(),
        }
    }

    pub fn salt(&self) -> u64 {
        self.salt
    }
}

impl Proposal for Block {
    fn number(&self) -> u64 {
        self.number
    }

    fn hash(&self) -> Digest {
        self.hash
    }
}

impl Write for Block {
    fn write(&self, writer: &mut impl BufMut) {
        self.number.write(writer);
        self.salt.write(writer);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        self.number.encode_size() + self.salt.encode_size()
    }
}

impl Read for Block {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let number = u64::read(reader)?;
        let salt = u64::read(reader)?;
        Ok(Self::new(number, salt))
    }
}
