//! Envelope transform: seal / certify / open / unseal.
//!
//! Pure functions of message + key material, no I/O. The only side effect is
//! on the [`KeyCache`]: successful seal/unseal refresh the direction's
//! last-used marker, and an attached key learned on unseal is cached so the
//! sender may omit it next time.
//!
//! Key attachment rules on seal:
//! - fresh key → always attached, sealed to the receiver's public key;
//! - reused key not yet confirmed → attached again, since the message that
//!   first carried it may still be queued behind this one or may never
//!   arrive;
//! - reused confirmed key, one-to-one → omitted;
//! - reused key, group message → attached (each member is a separate
//!   receiver and may not have seen the key yet).
//!
//! A seal that attaches an unconfirmed key yields a [`KeyStamp`]. The caller
//! confirms the stamp once the receiver acknowledges the message, or retires
//! it when the message is given up.

use std::sync::Arc;

use sg_crypto::{
    ContentKeyFactory, KeyCache, KeyReusePolicy, PrivateKey, PublicKey, SymmetricKey,
    SymmetricKeyFactory,
};
use tracing::debug;

use crate::content::Content;
use crate::envelope::{CertifiedMessage, PlainMessage, SealedMessage};
use crate::error::ProtoError;
use crate::id::Id;

/// Resolves key material for identities. Implemented by the application.
pub trait KeyDirectory: Send + Sync {
    /// Public key of any known identity (contact, relay, or local user).
    fn public_key(&self, id: &Id) -> Option<Arc<dyn PublicKey>>;

    /// Private key of a locally owned identity.
    fn private_key(&self, id: &Id) -> Option<Arc<dyn PrivateKey>>;
}

/// Identifies the cached key an outbound message carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStamp {
    pub sender: Id,
    pub direction: Id,
    pub generation: u64,
}

// ── Stages ───────────────────────────────────────────────────────────────────

pub fn seal(
    plain: &PlainMessage,
    keys: &dyn KeyDirectory,
    cache: &KeyCache<Id>,
    factory: &dyn SymmetricKeyFactory,
) -> Result<SealedMessage, ProtoError> {
    seal_stamped(plain, keys, cache, factory).map(|(sealed, _)| sealed)
}

/// [`seal`], also returning the stamp of an attached unconfirmed key.
pub fn seal_stamped(
    plain: &PlainMessage,
    keys: &dyn KeyDirectory,
    cache: &KeyCache<Id>,
    factory: &dyn SymmetricKeyFactory,
) -> Result<(SealedMessage, Option<KeyStamp>), ProtoError> {
    let envelope = &plain.envelope;
    let direction = envelope.direction();

    let hit = cache.lookup(&envelope.sender, direction);
    let confirmed = hit.as_ref().is_some_and(|hit| hit.confirmed);
    let (key, cached_generation) = match hit {
        Some(hit) => (hit.key, Some(hit.generation)),
        None => (factory.generate(), None),
    };

    let attached = if !confirmed || envelope.group.is_some() {
        let receiver_key = keys
            .public_key(&envelope.receiver)
            .ok_or_else(|| ProtoError::KeyUnavailable(envelope.receiver.clone()))?;
        Some(receiver_key.encrypt(&key.to_bytes())?)
    } else {
        None
    };

    let body = serde_json::to_vec(&plain.content)?;
    let data = key.encrypt(&body)?;

    let generation = match cached_generation {
        Some(generation) => {
            cache.touch(&envelope.sender, direction);
            generation
        }
        None => cache.put(&envelope.sender, direction, key),
    };
    let stamp = (!confirmed).then(|| KeyStamp {
        sender: envelope.sender.clone(),
        direction: direction.clone(),
        generation,
    });

    let sealed = SealedMessage {
        envelope: envelope.clone(),
        data,
        key: attached,
    };
    Ok((sealed, stamp))
}

pub fn certify(sealed: SealedMessage, keys: &dyn KeyDirectory) -> Result<CertifiedMessage, ProtoError> {
    let sender = &sealed.envelope.sender;
    let signer = keys
        .private_key(sender)
        .ok_or_else(|| ProtoError::SigningKeyUnavailable(sender.clone()))?;
    let signature = signer.sign(&sealed.data)?;
    Ok(CertifiedMessage { sealed, signature })
}

pub fn open(certified: &CertifiedMessage, keys: &dyn KeyDirectory) -> Result<SealedMessage, ProtoError> {
    let sender = &certified.envelope().sender;
    let verifier = keys
        .public_key(sender)
        .ok_or_else(|| ProtoError::KeyUnavailable(sender.clone()))?;
    if !verifier.verify(&certified.sealed.data, &certified.signature) {
        return Err(ProtoError::VerificationFailed);
    }
    Ok(certified.sealed.clone())
}

pub fn unseal(
    sealed: &SealedMessage,
    keys: &dyn KeyDirectory,
    cache: &KeyCache<Id>,
    factory: &dyn SymmetricKeyFactory,
) -> Result<PlainMessage, ProtoError> {
    let envelope = &sealed.envelope;
    let direction = envelope.direction();

    let key: Arc<dyn SymmetricKey> = match &sealed.key {
        Some(wrapped) => {
            let own = keys.private_key(&envelope.receiver).ok_or_else(|| {
                debug!(receiver = %envelope.receiver, "no private key to open attached key");
                ProtoError::DecryptionFailed
            })?;
            let raw = own.decrypt(wrapped).map_err(|err| {
                debug!(error = %err, sender = %envelope.sender, "attached key did not decrypt");
                ProtoError::DecryptionFailed
            })?;
            factory.from_bytes(&raw).map_err(|err| {
                debug!(error = %err, sender = %envelope.sender, "attached key malformed");
                ProtoError::DecryptionFailed
            })?
        }
        None => cache.get(&envelope.sender, direction).ok_or_else(|| {
            debug!(sender = %envelope.sender, direction = %direction, "no cached key for direction");
            ProtoError::DecryptionFailed
        })?,
    };

    let body = key.decrypt(&sealed.data).map_err(|err| {
        debug!(error = %err, sender = %envelope.sender, "content did not decrypt");
        ProtoError::DecryptionFailed
    })?;
    let content: Content = serde_json::from_slice(&body)
        .map_err(|err| ProtoError::MalformedContent(err.to_string()))?;

    if sealed.key.is_some() {
        cache.put(&envelope.sender, direction, key);
    } else {
        cache.touch(&envelope.sender, direction);
    }

    Ok(PlainMessage {
        envelope: envelope.clone(),
        content,
    })
}

// ── Packer ───────────────────────────────────────────────────────────────────

/// Bundles the key directory, key cache and key factory so callers can run
/// the whole outbound (seal + certify) or inbound (open + unseal) pipeline.
#[derive(Clone)]
pub struct Packer {
    keys: Arc<dyn KeyDirectory>,
    cache: Arc<KeyCache<Id>>,
    factory: Arc<dyn SymmetricKeyFactory>,
}

impl Packer {
    pub fn new(keys: Arc<dyn KeyDirectory>, policy: KeyReusePolicy) -> Self {
        Self::with_factory(keys, Arc::new(KeyCache::new(policy)), Arc::new(ContentKeyFactory))
    }

    pub fn with_factory(
        keys: Arc<dyn KeyDirectory>,
        cache: Arc<KeyCache<Id>>,
        factory: Arc<dyn SymmetricKeyFactory>,
    ) -> Self {
        Self { keys, cache, factory }
    }

    pub fn keys(&self) -> &Arc<dyn KeyDirectory> {
        &self.keys
    }

    pub fn cache(&self) -> &Arc<KeyCache<Id>> {
        &self.cache
    }

    pub fn seal(&self, plain: &PlainMessage) -> Result<SealedMessage, ProtoError> {
        seal(plain, self.keys.as_ref(), &self.cache, self.factory.as_ref())
    }

    pub fn certify(&self, sealed: SealedMessage) -> Result<CertifiedMessage, ProtoError> {
        certify(sealed, self.keys.as_ref())
    }

    pub fn open(&self, certified: &CertifiedMessage) -> Result<SealedMessage, ProtoError> {
        open(certified, self.keys.as_ref())
    }

    pub fn unseal(&self, sealed: &SealedMessage) -> Result<PlainMessage, ProtoError> {
        unseal(sealed, self.keys.as_ref(), &self.cache, self.factory.as_ref())
    }

    /// seal + certify
    pub fn pack(&self, plain: &PlainMessage) -> Result<CertifiedMessage, ProtoError> {
        let sealed = self.seal(plain)?;
        self.certify(sealed)
    }

    /// [`pack`](Self::pack), also returning the stamp of an attached
    /// unconfirmed key.
    pub fn pack_stamped(
        &self,
        plain: &PlainMessage,
    ) -> Result<(CertifiedMessage, Option<KeyStamp>), ProtoError> {
        let (sealed, stamp) =
            seal_stamped(plain, self.keys.as_ref(), &self.cache, self.factory.as_ref())?;
        Ok((self.certify(sealed)?, stamp))
    }

    /// The receiver acknowledged a message carrying the stamped key; later
    /// seals in that direction may omit it.
    pub fn confirm(&self, stamp: &KeyStamp) -> bool {
        self.cache.confirm(&stamp.sender, &stamp.direction, stamp.generation)
    }

    /// A message carrying the stamped key was given up. Drops the key unless
    /// it has been confirmed meanwhile, so the next seal starts fresh.
    pub fn retire(&self, stamp: &KeyStamp) -> bool {
        self.cache.retire(&stamp.sender, &stamp.direction, stamp.generation)
    }

    /// open + unseal
    pub fn unpack(&self, certified: &CertifiedMessage) -> Result<PlainMessage, ProtoError> {
        let sealed = self.open(certified)?;
        self.unseal(&sealed)
    }
}
