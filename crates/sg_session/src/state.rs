//! Session state machine.
//!
//! The state is a plain enum and transitions come from the pure function
//! [`next_state`], evaluated once per driver tick; the first matching row
//! wins. Side effects of entering a state (sending a handshake, reconnecting
//! the gate) are performed by the driver.
//!
//! | From        | To          | Condition                                   |
//! |-------------|-------------|---------------------------------------------|
//! | Default     | Connecting  | identity selected, gate Connecting/Connected |
//! | Default     | Error       | identity selected, gate Error               |
//! | Connecting  | Connected   | gate Connected                              |
//! | Connecting  | Error       | gate Error                                  |
//! | Connected   | Handshaking | identity selected                           |
//! | Connected   | Error       | gate not Connected                          |
//! | Handshaking | Running     | relay accepted the session                  |
//! | Handshaking | Error       | gate not Connected                          |
//! | Handshaking | Connected   | handshake timed out or identity changed     |
//! | Running     | Error       | gate not Connected                          |
//! | Running     | Default     | session cleared (login / logout)            |
//! | Error       | Default     | gate not Error                              |

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sg_proto::Id;

use crate::gate::GateStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Default,
    Connecting,
    Connected,
    Handshaking,
    Running,
    Error,
}

/// Everything a transition may depend on, captured at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conditions {
    pub identity_selected: bool,
    pub gate: GateStatus,
    pub accepted: bool,
    /// The current handshake should be abandoned and started over.
    pub handshake_stale: bool,
}

pub fn next_state(state: SessionState, c: &Conditions) -> Option<SessionState> {
    use SessionState::*;

    let gate_up = c.gate == GateStatus::Connected;
    match state {
        Default if c.identity_selected && matches!(c.gate, GateStatus::Connecting | GateStatus::Connected) => {
            Some(Connecting)
        }
        Default if c.identity_selected && c.gate == GateStatus::Error => Some(Error),
        Connecting if gate_up => Some(Connected),
        Connecting if c.gate == GateStatus::Error => Some(Error),
        Connected if !gate_up => Some(Error),
        Connected if c.identity_selected => Some(Handshaking),
        Handshaking if c.accepted => Some(Running),
        Handshaking if !gate_up => Some(Error),
        Handshaking if c.handshake_stale => Some(Connected),
        Running if !gate_up => Some(Error),
        Running if !c.accepted => Some(Default),
        Error if c.gate != GateStatus::Error => Some(Default),
        _ => None,
    }
}

/// Session owned by the driver.
#[derive(Debug, Clone)]
pub struct Session {
    identity: Option<Id>,
    session_key: Option<String>,
    accepted: bool,
    state: SessionState,
    entered_at: DateTime<Utc>,
    /// Identity the in-flight handshake was started for.
    handshake_for: Option<Id>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            identity: None,
            session_key: None,
            accepted: false,
            state: SessionState::Default,
            entered_at: Utc::now(),
            handshake_for: None,
        }
    }

    pub fn identity(&self) -> Option<&Id> {
        self.identity.as_ref()
    }

    pub fn session_key(&self) -> Option<&str> {
        self.session_key.as_deref()
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    /// Switch the local identity. Drops the session token and acceptance so
    /// the state machine starts a new handshake.
    pub fn login(&mut self, identity: Id) {
        self.identity = Some(identity);
        self.clear_session();
    }

    pub fn logout(&mut self) {
        self.identity = None;
        self.clear_session();
    }

    fn clear_session(&mut self) {
        self.session_key = None;
        self.accepted = false;
    }

    pub fn conditions(&self, gate: GateStatus, now: DateTime<Utc>, handshake_timeout: Duration) -> Conditions {
        let handshake_stale = self.state == SessionState::Handshaking
            && (now - self.entered_at > handshake_timeout || self.handshake_for != self.identity);
        Conditions {
            identity_selected: self.identity.is_some(),
            gate,
            accepted: self.accepted,
            handshake_stale,
        }
    }

    pub fn enter(&mut self, next: SessionState, now: DateTime<Utc>) {
        if next == SessionState::Handshaking {
            self.accepted = false;
            self.handshake_for = self.identity.clone();
        }
        self.state = next;
        self.entered_at = now;
    }

    /// Relay challenge with a new token. Only meaningful while handshaking
    /// an unaccepted session; returns whether the handshake must be resent.
    pub fn challenge(&mut self, token: String) -> bool {
        if self.state != SessionState::Handshaking || self.accepted {
            return false;
        }
        self.session_key = Some(token);
        true
    }

    /// Relay accepted the session. Returns `false` when no handshake is in
    /// progress.
    pub fn accept(&mut self, token: Option<String>) -> bool {
        if self.state != SessionState::Handshaking || self.accepted {
            return false;
        }
        self.accepted = true;
        if token.is_some() {
            self.session_key = token;
        }
        true
    }
}
