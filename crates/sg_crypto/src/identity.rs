//! Default identity key material
//!
//! An identity is two key pairs bound together:
//! - Ed25519 for message signatures,
//! - X25519 for sealing symmetric keys to the identity ("sealed box").
//!
//! Sealed box wire format:
//!   [ ephemeral X25519 public (32) | nonce (24) | ciphertext + tag ]
//!
//! The wrapping key is HKDF-SHA256(DH(eph, recipient), salt = eph_pub ‖
//! recipient_pub, info = "sg-seal-v1"). The ephemeral public key is also
//! bound as AEAD associated data.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::aead;
use crate::error::CryptoError;
use crate::kdf;
use crate::keys::{PrivateKey, PublicKey};

const SEAL_INFO: &[u8] = b"sg-seal-v1";
const EPHEMERAL_LEN: usize = 32;

// ── Public half ──────────────────────────────────────────────────────────────

/// Public keys of an identity, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityPublicKey {
    #[serde(with = "b64_32")]
    pub signing: [u8; 32],
    #[serde(with = "b64_32")]
    pub encryption: [u8; 32],
}

impl IdentityPublicKey {
    /// Human-readable fingerprint: BLAKE3 over both public keys, truncated
    /// to 20 bytes, hex-encoded in groups of 4.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.signing);
        hasher.update(&self.encryption);
        let hex = hex::encode(&hasher.finalize().as_bytes()[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl PublicKey for IdentityPublicKey {
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.signing) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        vk.verify_strict(data, &sig).is_ok()
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let recipient = X25519Public::from(self.encryption);
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_pub = X25519Public::from(&ephemeral);

        let shared = ephemeral.diffie_hellman(&recipient);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey("Low-order recipient key".into()));
        }

        let wrap_key = derive_seal_key(shared.as_bytes(), ephemeral_pub.as_bytes(), &self.encryption)?;
        let sealed = aead::encrypt(&wrap_key, plaintext, ephemeral_pub.as_bytes())?;

        let mut out = Vec::with_capacity(EPHEMERAL_LEN + sealed.len());
        out.extend_from_slice(ephemeral_pub.as_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

// ── Private half ─────────────────────────────────────────────────────────────

/// Long-term identity key pair. Both secrets are zeroized on drop by their
/// respective crates.
pub struct IdentityKeyPair {
    signing: SigningKey,
    encryption: StaticSecret,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            encryption: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            signing: self.signing.verifying_key().to_bytes(),
            encryption: X25519Public::from(&self.encryption).to_bytes(),
        }
    }

    /// Export secret material for local persistence.
    pub fn to_secret(&self) -> IdentitySecret {
        IdentitySecret {
            signing: URL_SAFE_NO_PAD.encode(self.signing.to_bytes()),
            encryption: URL_SAFE_NO_PAD.encode(self.encryption.to_bytes()),
        }
    }

    pub fn from_secret(secret: &IdentitySecret) -> Result<Self, CryptoError> {
        let signing = decode_32(&secret.signing)?;
        let encryption = decode_32(&secret.encryption)?;
        Ok(Self {
            signing: SigningKey::from_bytes(&signing),
            encryption: StaticSecret::from(*encryption),
        })
    }
}

impl PrivateKey for IdentityKeyPair {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.signing.sign(data).to_bytes().to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if ciphertext.len() <= EPHEMERAL_LEN {
            return Err(CryptoError::AeadDecrypt);
        }
        let (eph_bytes, sealed) = ciphertext.split_at(EPHEMERAL_LEN);
        let mut eph = [0u8; 32];
        eph.copy_from_slice(eph_bytes);

        let shared = self.encryption.diffie_hellman(&X25519Public::from(eph));
        if !shared.was_contributory() {
            return Err(CryptoError::AeadDecrypt);
        }

        let own_pub = X25519Public::from(&self.encryption).to_bytes();
        let wrap_key = derive_seal_key(shared.as_bytes(), &eph, &own_pub)?;
        aead::decrypt(&wrap_key, sealed, &eph)
    }
}

/// Serialisable form of an identity's secrets. Handle with care.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentitySecret {
    pub signing: String,
    pub encryption: String,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn derive_seal_key(dh: &[u8], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);
    kdf::derive_wrap_key(dh, &salt, SEAL_INFO)
}

fn decode_32(s: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let bytes = Zeroizing::new(URL_SAFE_NO_PAD.decode(s)?);
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKey(format!(
            "Key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&bytes);
    Ok(out)
}

mod b64_32 {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = URL_SAFE_NO_PAD.decode(s.as_bytes()).map_err(D::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected 32 bytes, got {}", bytes.len())))
    }
}
