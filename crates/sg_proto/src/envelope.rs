//! Envelope and the three message forms.
//!
//! Wire document (one `CertifiedMessage`):
//!
//! ```json
//! {
//!   "sender": "alice", "receiver": "bob", "time": 1700000000,
//!   "group": "friends",            // optional
//!   "data": "<base64 ciphertext>",
//!   "key": "<base64 sealed key>",  // optional, absent when a cached key is reused
//!   "signature": "<base64 signature over data>"
//! }
//! ```

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::content::Content;
use crate::id::Id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Id,
    pub receiver: Id,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Id>,
}

impl Envelope {
    /// New envelope stamped with the current time (second precision, as on
    /// the wire).
    pub fn new(sender: Id, receiver: Id) -> Self {
        Self {
            sender,
            receiver,
            time: Utc::now().trunc_subsecs(0),
            group: None,
        }
    }

    pub fn with_group(mut self, group: Id) -> Self {
        self.group = Some(group);
        self
    }

    /// The key-cache direction partner: the group for group messages,
    /// otherwise the receiver.
    pub fn direction(&self) -> &Id {
        self.group.as_ref().unwrap_or(&self.receiver)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlainMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub content: Content,
}

impl PlainMessage {
    pub fn new(envelope: Envelope, content: Content) -> Self {
        Self { envelope, content }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub key: Option<Vec<u8>>,
}

impl SealedMessage {
    pub fn group_tag(&self) -> Option<&Id> {
        self.envelope.group.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedMessage {
    #[serde(flatten)]
    pub sealed: SealedMessage,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl CertifiedMessage {
    pub fn envelope(&self) -> &Envelope {
        &self.sealed.envelope
    }

    /// Base64 of the signature: the token that correlates this message with
    /// its delivery receipt.
    pub fn receipt_token(&self) -> String {
        STANDARD.encode(&self.signature)
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(D::Error::custom)
    }
}

mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(D::Error::custom))
            .transpose()
    }
}
