//! sg_session: the client side of a Stargate relay session
//!
//! `SessionDriver` ties everything together: it pumps the relay `Gate`,
//! walks the session state machine (connect → handshake → run, with a
//! reconnect loop through `Error`), and drains the `DeliveryQueue` while
//! the session is running. Outgoing messages are sealed on a worker pool so
//! `send_message` never blocks.
//!
//! # Modules
//! - `config`   : `SessionConfig` (JSON file / environment)
//! - `queue`    : outbound delivery queue with claim / expiry semantics
//! - `gate`     : `Gate` trait and the tokio TCP/UDP `TransportGate`
//! - `state`    : session states, `Session`, pure transition function
//! - `delegate` : callbacks into the application
//! - `pool`     : sealing worker pool
//! - `driver`   : `SessionDriver` (tick loop)
//! - `error`    : `GateError` / `SessionError`

pub mod config;
pub mod delegate;
pub mod driver;
pub mod error;
pub mod gate;
pub mod pool;
pub mod queue;
pub mod state;

pub use config::{KeyReuseConfig, SessionConfig, TransportKind};
pub use delegate::{SessionDelegate, StoreReason};
pub use driver::SessionDriver;
pub use error::{GateError, SessionError};
pub use gate::{Gate, GateStatus, TransportGate};
pub use queue::{DeliveryQueue, DeliveryState, Purged, QueueItem};
pub use state::{next_state, Conditions, Session, SessionState};
