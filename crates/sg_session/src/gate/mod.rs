//! Relay connection gate.
//!
//! A `Gate` owns exactly one physical connection to the relay. It moves
//! opaque packets in and out and reports connectivity through
//! [`GateStatus`]; it never looks inside the packets.
//!
//! Status transitions: `Init → Connecting → Connected`, or `→ Error` from
//! either. `Connected → Error` may happen at any time.

use bytes::Bytes;
use serde::Serialize;

use crate::error::GateError;

mod transport;

pub use transport::TransportGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Init,
    Connecting,
    Connected,
    Error,
}

pub trait Gate: Send {
    /// Start connecting. Must not block on the network.
    fn open(&mut self) -> Result<(), GateError>;

    /// Release the connection. Safe to call in any state, repeatedly.
    fn close(&mut self);

    fn status(&self) -> GateStatus;

    /// Deliver pending inbound packets to `dispatch`. Non-blocking; returns
    /// `false` when there was nothing to do.
    fn pump_once(&mut self, dispatch: &mut dyn FnMut(Bytes)) -> bool;

    /// Queue one packet for transmission. `false` means the connection is
    /// not usable; the failure shows up as a status change, not a retry.
    fn write(&mut self, payload: &[u8]) -> bool;

    /// Drop the current connection and start a new one.
    fn reconnect(&mut self) -> Result<(), GateError> {
        self.close();
        self.open()
    }
}
