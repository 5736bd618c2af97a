//! JSON files for identities and keyrings.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sg_crypto::identity::IdentitySecret;
use sg_crypto::{IdentityKeyPair, IdentityPublicKey};
use sg_proto::{Id, Keyring};
use tracing::warn;

/// A local identity together with its secrets.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityFile {
    pub id: Id,
    pub public: IdentityPublicKey,
    pub secret: IdentitySecret,
}

impl IdentityFile {
    pub fn generate(id: Id) -> Self {
        let pair = IdentityKeyPair::generate();
        Self {
            id,
            public: pair.public_key(),
            secret: pair.to_secret(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: Self = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if file.key_pair()?.public_key() != file.public {
            return Err(anyhow!("{}: public key does not match secret", path.display()));
        }
        Ok(file)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))?;
        restrict_file_permissions(path);
        Ok(())
    }

    pub fn key_pair(&self) -> Result<IdentityKeyPair> {
        Ok(IdentityKeyPair::from_secret(&self.secret)?)
    }

    pub fn public_entry(&self) -> PublicEntry {
        PublicEntry {
            id: self.id.clone(),
            public: self.public.clone(),
        }
    }
}

/// The shareable half of an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicEntry {
    pub id: Id,
    pub public: IdentityPublicKey,
}

impl PublicEntry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }
}

/// Known peers, keyed by id. A missing file reads as empty.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyringFile {
    #[serde(default)]
    pub contacts: BTreeMap<Id, IdentityPublicKey>,
}

impl KeyringFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Returns the key previously stored under the same id, if any.
    pub fn insert(&mut self, entry: PublicEntry) -> Option<IdentityPublicKey> {
        self.contacts.insert(entry.id, entry.public)
    }

    /// In-memory keyring holding every contact plus the local identity.
    pub fn into_keyring(self, identity: &IdentityFile) -> Result<Keyring> {
        let keyring = Keyring::new();
        for (id, key) in self.contacts {
            keyring.add_contact(id, key);
        }
        keyring.add_identity(identity.id.clone(), identity.key_pair()?);
        Ok(keyring)
    }
}

fn restrict_file_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_proto::KeyDirectory;

    #[test]
    fn identity_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.json");
        let identity = IdentityFile::generate("alice".into());
        identity.save(&path).unwrap();

        let loaded = IdentityFile::load(&path).unwrap();
        assert_eq!(loaded.id, Id::from("alice"));
        assert_eq!(loaded.public, identity.public);
        assert_eq!(loaded.key_pair().unwrap().public_key(), identity.public);
    }

    #[test]
    fn mismatched_identity_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.json");
        let mut identity = IdentityFile::generate("alice".into());
        identity.public = IdentityFile::generate("other".into()).public;
        identity.save(&path).unwrap();

        assert!(IdentityFile::load(&path).is_err());
    }

    #[test]
    fn keyring_file_collects_contacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        assert!(KeyringFile::load(&path).unwrap().contacts.is_empty());

        let bob = IdentityFile::generate("bob".into());
        let mut ring = KeyringFile::load(&path).unwrap();
        assert!(ring.insert(bob.public_entry()).is_none());
        ring.save(&path).unwrap();

        let alice = IdentityFile::generate("alice".into());
        let keyring = KeyringFile::load(&path).unwrap().into_keyring(&alice).unwrap();
        assert_eq!(keyring.contact(&"bob".into()), Some(bob.public.clone()));
        assert!(keyring.private_key(&"alice".into()).is_some());
        assert!(keyring.private_key(&"bob".into()).is_none());
    }
}
