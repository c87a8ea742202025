//! Basic type definitions for the matchmaking server
//!
//! Provides newtype wrappers for type safety:
//! - `SessionId`: durable, reconnectable session token
//! - `PairId`: UUID-based identifier for an active pair
//! - `MessageId`: client-generated, opaque message identifier

use uuid::Uuid;

/// Longest session token the server accepts from a client.
pub const MAX_SESSION_TOKEN_LEN: usize = 128;

/// Durable session identifier (newtype pattern)
///
/// An opaque token the client persists and replays on reconnect.
/// Usually server-minted (UUID v4), but any reasonable client-supplied
/// token is honored for session resumption.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    /// Mint a new random session token
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a client-supplied token, rejecting empty or oversized ones
    pub fn from_token(token: String) -> Option<Self> {
        let token = token.trim().to_string();
        if token.is_empty() || token.len() > MAX_SESSION_TOKEN_LEN {
            None
        } else {
            Some(Self(token))
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique pair identifier (newtype pattern)
///
/// Server-internal; never exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairId(pub Uuid);

impl PairId {
    /// Create a new random pair ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PairId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PairId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated message identifier
///
/// Unique within a pair's lifetime by client contract; used for
/// reply-linking, reactions and read-receipt correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
