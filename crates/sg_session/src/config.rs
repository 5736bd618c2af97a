//! Session configuration.
//!
//! Loaded from a JSON file (all fields optional, defaults below) and then
//! overlaid with environment variables:
//!
//! | Variable          | Field        |
//! |-------------------|--------------|
//! | `SG_RELAY_HOST`   | `relay_host` |
//! | `SG_RELAY_PORT`   | `relay_port` |
//! | `SG_RELAY_ID`     | `relay_id`   |
//! | `SG_TRANSPORT`    | `transport`  |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sg_crypto::KeyReusePolicy;
use sg_proto::Id;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// TCP, length-framed packets.
    Stream,
    /// UDP, one packet per datagram.
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KeyReuseConfig {
    UntilInvalidated,
    MaxAge { secs: u64 },
    Never,
}

impl KeyReuseConfig {
    pub fn policy(self) -> KeyReusePolicy {
        match self {
            KeyReuseConfig::UntilInvalidated => KeyReusePolicy::UntilInvalidated,
            KeyReuseConfig::MaxAge { secs } => KeyReusePolicy::MaxAge(Duration::from_secs(secs)),
            KeyReuseConfig::Never => KeyReusePolicy::Never,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub relay_host: String,
    pub relay_port: u16,
    /// Identity of the relay node; handshakes are addressed to it.
    pub relay_id: Id,
    pub transport: TransportKind,
    pub connect_timeout_ms: u64,
    /// Minimum spacing between two connection attempts.
    pub reconnect_interval_ms: u64,
    /// Driver sleep when a tick did no work.
    pub idle_sleep_ms: u64,
    /// Grace period before a sent-but-unacknowledged or failed message is
    /// given up on.
    pub expiry_secs: u64,
    pub handshake_timeout_secs: u64,
    pub sealing_workers: usize,
    pub max_frame_len: usize,
    pub key_reuse: KeyReuseConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_host: "127.0.0.1".into(),
            relay_port: 9394,
            relay_id: Id::from("relay"),
            transport: TransportKind::Stream,
            connect_timeout_ms: 5_000,
            reconnect_interval_ms: 1_000,
            idle_sleep_ms: 128,
            expiry_secs: 600,
            handshake_timeout_secs: 120,
            sealing_workers: 2,
            max_frame_len: 1024 * 1024,
            key_reuse: KeyReuseConfig::UntilInvalidated,
        }
    }
}

impl SessionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `SG_*` environment variables.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::default().apply_env()
    }

    pub fn apply_env(self) -> Result<Self, SessionError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    pub fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SessionError> {
        if let Some(host) = lookup("SG_RELAY_HOST") {
            self.relay_host = host;
        }
        if let Some(port) = lookup("SG_RELAY_PORT") {
            self.relay_port = port
                .parse()
                .map_err(|_| SessionError::Config(format!("SG_RELAY_PORT: not a port: {port}")))?;
        }
        if let Some(id) = lookup("SG_RELAY_ID") {
            self.relay_id = Id::new(id);
        }
        if let Some(transport) = lookup("SG_TRANSPORT") {
            self.transport = match transport.as_str() {
                "stream" | "tcp" => TransportKind::Stream,
                "datagram" | "udp" => TransportKind::Datagram,
                other => {
                    return Err(SessionError::Config(format!(
                        "SG_TRANSPORT: unknown transport {other}"
                    )))
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.relay_host.is_empty() {
            return Err(SessionError::Config("relay_host is empty".into()));
        }
        if self.relay_id.as_str().is_empty() {
            return Err(SessionError::Config("relay_id is empty".into()));
        }
        if self.idle_sleep_ms == 0 {
            return Err(SessionError::Config("idle_sleep_ms must be positive".into()));
        }
        if self.sealing_workers == 0 {
            return Err(SessionError::Config("sealing_workers must be positive".into()));
        }
        if self.max_frame_len == 0 {
            return Err(SessionError::Config("max_frame_len must be positive".into()));
        }
        Ok(())
    }

    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_secs as i64)
    }

    pub fn handshake_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.handshake_timeout_secs as i64)
    }
}
