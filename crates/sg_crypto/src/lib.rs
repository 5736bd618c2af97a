//! sg_crypto: key abstractions and primitives for the Stargate transport
//!
//! The transport never talks to a concrete algorithm directly. It signs,
//! verifies, encrypts and decrypts through the traits in [`keys`], so the
//! application can plug in whatever key material it manages.
//!
//! # Module layout
//! - `keys`      : `PublicKey` / `PrivateKey` / `SymmetricKey` traits
//! - `aead`      : XChaCha20-Poly1305 helpers and the default `ContentKey`
//! - `identity`  : default Ed25519 + X25519 identity key pair
//! - `kdf`       : HKDF-SHA256 expansion
//! - `key_cache` : sharded (sender, receiver) → symmetric key cache
//! - `error`     : unified error type

pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod key_cache;
pub mod keys;

pub use aead::{ContentKey, ContentKeyFactory};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, IdentityPublicKey};
pub use key_cache::{CacheHit, KeyCache, KeyReusePolicy};
pub use keys::{PrivateKey, PublicKey, SymmetricKey, SymmetricKeyFactory};
