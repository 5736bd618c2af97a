//! Structured message payloads (what gets encrypted into `data`).
//!
//! Serialised as JSON objects tagged by `type`:
//!
//! ```json
//! {"type":"text","text":"hi"}
//! {"type":"handshake","message":"again","sessionKey":"k-123"}
//! {"type":"receipt","signature":"base64..."}
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Handshake(HandshakeCommand),
    /// Delivery acknowledgement for the message whose signature is given.
    Receipt {
        signature: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Anything the transport does not interpret; routed to the application.
    Application {
        app: String,
        body: serde_json::Value,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn receipt(signature: impl Into<String>) -> Self {
        Content::Receipt {
            signature: signature.into(),
            text: None,
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Content::Handshake(_) | Content::Receipt { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeMessage {
    /// Client announces readiness, optionally carrying a session token.
    Start,
    /// Relay challenge: resend `Start` with the enclosed token.
    Again,
    /// Relay accepted the session.
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeCommand {
    pub message: HandshakeMessage,
    #[serde(rename = "sessionKey", default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

impl HandshakeCommand {
    pub fn start(session_key: Option<String>) -> Self {
        Self {
            message: HandshakeMessage::Start,
            session_key,
        }
    }

    pub fn again(session_key: impl Into<String>) -> Self {
        Self {
            message: HandshakeMessage::Again,
            session_key: Some(session_key.into()),
        }
    }

    pub fn accepted(session_key: Option<String>) -> Self {
        Self {
            message: HandshakeMessage::Accepted,
            session_key,
        }
    }
}
