//! In-memory key directory.
//!
//! Holds contacts' public keys and the locally owned identities. Suitable for
//! tests and the CLI; applications with their own key storage implement
//! [`KeyDirectory`] directly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sg_crypto::{IdentityKeyPair, IdentityPublicKey, PrivateKey, PublicKey};

use crate::id::Id;
use crate::transform::KeyDirectory;

#[derive(Default)]
pub struct Keyring {
    contacts: RwLock<HashMap<Id, Arc<IdentityPublicKey>>>,
    identities: RwLock<HashMap<Id, Arc<IdentityKeyPair>>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_contact(&self, id: Id, key: IdentityPublicKey) {
        self.contacts.write().insert(id, Arc::new(key));
    }

    /// Register a local identity. Its public half becomes resolvable too.
    pub fn add_identity(&self, id: Id, pair: IdentityKeyPair) {
        self.contacts.write().insert(id.clone(), Arc::new(pair.public_key()));
        self.identities.write().insert(id, Arc::new(pair));
    }

    pub fn remove_contact(&self, id: &Id) -> bool {
        self.contacts.write().remove(id).is_some()
    }

    pub fn contact(&self, id: &Id) -> Option<IdentityPublicKey> {
        self.contacts.read().get(id).map(|k| (**k).clone())
    }

    pub fn contacts(&self) -> Vec<(Id, IdentityPublicKey)> {
        let contacts = self.contacts.read();
        let mut out: Vec<_> = contacts
            .iter()
            .map(|(id, key)| (id.clone(), (**key).clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl KeyDirectory for Keyring {
    fn public_key(&self, id: &Id) -> Option<Arc<dyn PublicKey>> {
        self.contacts
            .read()
            .get(id)
            .map(|k| Arc::clone(k) as Arc<dyn PublicKey>)
    }

    fn private_key(&self, id: &Id) -> Option<Arc<dyn PrivateKey>> {
        self.identities
            .read()
            .get(id)
            .map(|k| Arc::clone(k) as Arc<dyn PrivateKey>)
    }
}
