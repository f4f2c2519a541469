//! Recoverable ed25519 signatures.
//!
//! Validators are identified by the first 20 bytes of the SHA-256 hash of their
//! ed25519 public key. Because ed25519 does not support key recovery, a signature
//! is encoded as `public key ∥ signature` so the signer's address can be derived
//! (and checked) from the signature alone.

use crate::{types::Address, Error};
use bytes::{BufMut, Bytes, BytesMut};
use ed25519_consensus::{Signature, SigningKey, VerificationKey};
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use sha2::{Digest as _, Sha256};

/// Length of an ed25519 public key.
const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of an ed25519 signature.
const SIGNATURE_BYTES: usize = 64;

/// Length of a recoverable signature.
pub const SIGNATURE_LENGTH: usize = PUBLIC_KEY_LENGTH + SIGNATURE_BYTES;

/// Derive the address of a public key.
pub fn address(key: &VerificationKey) -> Address {
    let hash = Sha256::digest(key.as_bytes());
    let mut address = Address::default();
    let len = address.len();
    address.copy_from_slice(&hash[..len]);
    address
}

/// Produces recoverable signatures with an ed25519 key.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
    address: Address,
}

impl Signer {
    /// Generate a new signer from `rng`.
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_key(SigningKey::new(rng))
    }

    /// Deterministically derive a signer from `seed`.
    ///
    /// This is useful for tests and local networks. Never use it with real funds.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::new(&mut rng)
    }

    /// Create a signer from an existing key.
    pub fn from_key(key: SigningKey) -> Self {
        let address = address(&key.verification_key());
        Self { key, address }
    }

    /// Address of the signer.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign `data`, returning `public key ∥ signature`.
    pub fn sign(&self, data: &[u8]) -> Bytes {
        let signature = self.key.sign(data);
        let mut buf = BytesMut::with_capacity(SIGNATURE_LENGTH);
        buf.put_slice(self.key.verification_key().as_bytes());
        buf.put_slice(&signature.to_bytes());
        buf.freeze()
    }
}

/// Recover the address that produced `signature` over `data`.
pub fn recover(data: &[u8], signature: &[u8]) -> Result<Address, Error> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(Error::InvalidSignature);
    }
    let (key, signature) = signature.split_at(PUBLIC_KEY_LENGTH);
    let key: [u8; PUBLIC_KEY_LENGTH] = key.try_into().map_err(|_| Error::InvalidSignature)?;
    let key = VerificationKey::try_from(key).map_err(|_| Error::InvalidSignature)?;
    let signature: [u8; SIGNATURE_BYTES] =
        signature.try_into().map_err(|_| Error::InvalidSignature)?;
    key.verify(&Signature::from(signature), data)
        .map_err(|_| Error::InvalidSignature)?;
    Ok(address(&key))
}
