use thiserror::Error;

use sg_crypto::CryptoError;

use crate::id::Id;

#[derive(Debug, Error)]
pub enum ProtoError {
    /// The receiver's (or sender's, when opening) public key is unknown.
    #[error("No public key available for {0}")]
    KeyUnavailable(Id),

    #[error("No private key available for {0}")]
    SigningKeyUnavailable(Id),

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Malformed content: {0}")]
    MalformedContent(String),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl ProtoError {
    /// Missing keys may show up later (directory refresh, login). Everything
    /// else means the message itself is bad and must be dropped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtoError::KeyUnavailable(_) | ProtoError::SigningKeyUnavailable(_)
        )
    }
}
