use std::time::Duration;

use sg_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Could not resolve relay address {0}")]
    Resolve(String),

    #[error("Invalid relay address: {0}")]
    InvalidRemote(String),

    #[error("Relay closed the connection")]
    Disconnected,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),
}
