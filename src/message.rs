//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// One relayed unit of chat content
///
/// Shared shape of `send_message` and `receive_message`. The server relays
/// envelopes verbatim and never persists them beyond immediate delivery
/// (or a short half-open hold, see [`crate::pair::Pair`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Client-generated identifier, unique within a pair's lifetime
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Audio payload (data URL or reference)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Image payload (data URL or reference)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Video payload (data URL or reference)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    /// Identifier of the message this one replies to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Client-formatted timestamp string, passed through untouched
    pub timestamp: String,
    /// Client-side content flag, passed through verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_nsfw: Option<bool>,
}

impl Envelope {
    /// Boundary validation: reject before the relay ever sees it
    ///
    /// An envelope needs a non-empty id, a non-empty timestamp, and at
    /// least one payload field.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.id.trim().is_empty() {
            return Err(AppError::MalformedEnvelope("missing id".into()));
        }
        if self.timestamp.trim().is_empty() {
            return Err(AppError::MalformedEnvelope("missing timestamp".into()));
        }
        let has_payload = [&self.text, &self.audio, &self.image, &self.video]
            .iter()
            .any(|p| p.as_deref().is_some_and(|s| !s.is_empty()));
        if !has_payload {
            return Err(AppError::MalformedEnvelope("no payload".into()));
        }
        Ok(())
    }
}

/// Client → Server message
///
/// All messages from client to server. Uses tagged enum with snake_case naming.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame after the handshake; replays a durable session token
    /// to resume, or omits it to mint a fresh session
    Hello {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Enter the waiting pool / request a match
    FindPartner {
        display_name: String,
        #[serde(default)]
        attribute: Option<String>,
    },
    /// Relay an envelope to the partner
    SendMessage {
        #[serde(flatten)]
        envelope: Envelope,
    },
    /// Typing-state signal (true while composing)
    Typing { typing: bool },
    /// Attach or remove (null) an emoji reaction on a relayed message
    SendReaction {
        message_id: String,
        reaction: Option<String>,
    },
    /// Read-receipt for a relayed message
    MarkRead { message_id: String },
    /// Toggle this side's read-receipt flag
    SetReadReceipts { enabled: bool },
    /// Explicit end-of-chat
    DisconnectPartner,
}

/// Server → Client message
///
/// All messages from server to client. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Hello acknowledged; echoes the durable session token
    Connected { session_id: String },
    /// This session rebound within the grace period with its pair intact
    SessionRestored,
    /// The partner's transport rebound within the grace period
    PartnerConnected,
    /// The partner's transport dropped; pair held half-open
    #[serde(rename = "partner_reconnecting_server")]
    PartnerReconnecting,
    /// Pairing succeeded; carries the other side's name and attribute
    Matched {
        partner_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        partner_attribute: Option<String>,
    },
    /// Relayed envelope
    ReceiveMessage {
        #[serde(flatten)]
        envelope: Envelope,
    },
    /// Relayed typing-state
    PartnerTyping { typing: bool },
    /// Relayed reaction
    ReceiveReaction {
        message_id: String,
        reaction: Option<String>,
    },
    /// Relayed read-receipt
    MessageReadByPartner { message_id: String },
    /// Terminal notice; the chat is over
    PartnerDisconnected,
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Waiting pool or pair map at capacity; retry later
    PoolFull,
    /// Malformed frame or envelope
    InvalidMessage,
    /// Relay-family message from an unpaired session
    NotPaired,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let (code, message) = match &err {
            AppError::AtCapacity => (
                ErrorCode::PoolFull,
                "Server is at capacity, try again shortly".to_string(),
            ),
            AppError::NotPaired => (ErrorCode::NotPaired, "You are not paired".to_string()),
            AppError::MalformedEnvelope(why) => {
                (ErrorCode::InvalidMessage, format!("Malformed message: {}", why))
            }
            AppError::Json(e) => {
                (ErrorCode::InvalidMessage, format!("Invalid message format: {}", e))
            }
            // Fatal errors are not typically converted (connection closes)
            _ => (ErrorCode::InvalidMessage, "Internal error".to_string()),
        };
        ServerMessage::Error { code, message }
    }
}
