//! sg_proto: message forms, wire codec and the envelope transform
//!
//! A message travels through three forms:
//!
//! ```text
//! PlainMessage --seal--> SealedMessage --certify--> CertifiedMessage  (wire)
//! PlainMessage <-unseal- SealedMessage <--open----- CertifiedMessage
//! ```
//!
//! Only `CertifiedMessage` is ever serialised onto the wire.
//!
//! # Modules
//! - `id`        : opaque endpoint identifier
//! - `envelope`  : envelope + the three message forms
//! - `content`   : structured payloads (text, handshake, receipt, app)
//! - `codec`     : JSON document codec and length framing
//! - `transform` : seal / certify / open / unseal and the `Packer` context
//! - `keyring`   : in-memory `KeyDirectory`
//! - `error`     : protocol error taxonomy

pub mod codec;
pub mod content;
pub mod envelope;
pub mod error;
pub mod id;
pub mod keyring;
pub mod transform;

pub use content::{Content, HandshakeCommand, HandshakeMessage};
pub use envelope::{CertifiedMessage, Envelope, PlainMessage, SealedMessage};
pub use error::ProtoError;
pub use id::Id;
pub use keyring::Keyring;
pub use transform::{KeyDirectory, KeyStamp, Packer};
