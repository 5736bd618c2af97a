//! Key abstractions used by the envelope transform.
//!
//! An asymmetric key pair is split in two halves: the [`PublicKey`] that
//! anyone may hold (verify + encrypt-to) and the [`PrivateKey`] that only
//! its owner holds (sign + decrypt). Message bodies are encrypted under a
//! [`SymmetricKey`], which is itself carried encrypted to the receiver.

use std::fmt;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Public half of an identity: verifies signatures and encrypts key material.
pub trait PublicKey: Send + Sync {
    /// `true` only if `signature` is a valid signature over `data`.
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;

    /// Encrypt a (short) payload so only the private half can read it.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Private half of an identity.
pub trait PrivateKey: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// Message-body key. Cheap to clone behind an `Arc` and shared through the
/// key cache.
pub trait SymmetricKey: Send + Sync + fmt::Debug {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// Raw key material, as carried inside a sealed message.
    fn to_bytes(&self) -> Zeroizing<Vec<u8>>;
}

/// Creates symmetric keys: fresh ones for sealing, decoded ones for unsealing.
pub trait SymmetricKeyFactory: Send + Sync {
    fn generate(&self) -> Arc<dyn SymmetricKey>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn SymmetricKey>, CryptoError>;
}
