//! XChaCha20-Poly1305 with a random nonce carried in front of the output.
//!
//! Output layout is `nonce (24) ‖ ciphertext ‖ tag (16)`. Message bodies are
//! bound to [`CONTENT_AAD`]; sealed-box key wrapping passes its own AAD.

use std::fmt;
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::keys::{SymmetricKey, SymmetricKeyFactory};

const NONCE_LEN: usize = 24;
pub const CONTENT_AAD: &[u8] = b"sg-content-v1";

fn cipher(key: &[u8; 32]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(key.into())
}

pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let sealed = cipher(key)
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;
    Ok([nonce.as_slice(), &sealed].concat())
}

/// Fails with [`CryptoError::AeadDecrypt`] on short input, a wrong key, a
/// different `aad`, or any modified byte.
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    cipher(key)
        .decrypt(XNonce::from_slice(nonce), Payload { msg: sealed, aad })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AeadDecrypt)
}

// ── ContentKey ───────────────────────────────────────────────────────────────

/// Default message-body key: 32 random bytes, zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("Content key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(key))
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

impl SymmetricKey for ContentKey {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt(&self.0, plaintext, CONTENT_AAD)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        decrypt(&self.0, ciphertext, CONTENT_AAD)
    }

    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.0.to_vec())
    }
}

/// Factory for [`ContentKey`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentKeyFactory;

impl SymmetricKeyFactory for ContentKeyFactory {
    fn generate(&self) -> Arc<dyn SymmetricKey> {
        Arc::new(ContentKey::generate())
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn SymmetricKey>, CryptoError> {
        Ok(Arc::new(ContentKey::from_slice(bytes)?))
    }
}
