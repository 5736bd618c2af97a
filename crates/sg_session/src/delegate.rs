//! Callbacks from the session driver into the application.

use sg_proto::{CertifiedMessage, PlainMessage};

use crate::state::SessionState;

/// Why an outbound message is being handed back for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreReason {
    /// The gate refused the write.
    WriteFailed,
    /// Sent, but never acknowledged within the expiry window.
    Expired,
    /// Still queued when the driver was closed.
    Unsent,
}

/// Implemented by the application. Calls arrive from the driver loop and the
/// sealing workers, so implementations must be cheap and thread-safe.
pub trait SessionDelegate: Send + Sync {
    /// The gate reached `Connected`.
    fn on_connected(&self) {}

    fn on_state_changed(&self, _from: SessionState, _to: SessionState) {}

    /// An inbound message was verified and decrypted.
    fn dispatch_decrypted(&self, message: PlainMessage);

    /// Store-for-later: an outbound message could not be delivered. The
    /// application may queue it again with `SessionDriver::send_certified`.
    fn store_message(&self, message: &CertifiedMessage, reason: StoreReason);

    /// Persist a plain message. Outgoing messages carry the receipt token
    /// that a later acknowledgement will quote; incoming ones carry `None`.
    fn save_message(&self, _message: &PlainMessage, _receipt: Option<&str>) -> bool {
        true
    }

    /// The relay acknowledged delivery of the message with this receipt token.
    fn on_delivered(&self, _receipt: &str) {}
}
