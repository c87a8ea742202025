//! Session record and per-session state machine
//!
//! A session is the durable chat identity behind a reconnectable token.
//! It outlives any single transport connection: the connection slot is
//! nullable and a grace-period epoch tracks pending eviction timers.

use tokio::sync::mpsc;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::{PairId, SessionId};

/// Per-session lifecycle state
///
/// Partner-gone / reconnecting views are derived from the pair's own
/// state, not duplicated here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not searching, not paired
    Idle,
    /// In the waiting pool
    Searching,
    /// In an active or half-open pair
    Paired(PairId),
}

/// A durable session, bound to at most one live transport at a time
#[derive(Debug)]
pub struct Session {
    /// Durable, reconnectable token
    pub id: SessionId,
    /// Self-asserted display name, set on each search
    pub display_name: Option<String>,
    /// Optional matching attribute (field/profession)
    pub attribute: Option<String>,
    /// Live transport channel; None while disconnected within grace
    sender: Option<mpsc::Sender<ServerMessage>>,
    /// Lifecycle state
    state: SessionState,
    /// Bumped on every unbind/bind; stale grace timers carry an old epoch
    pub grace_epoch: u64,
}

impl Session {
    /// Create a new session bound to the given transport channel
    pub fn new(id: SessionId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            display_name: None,
            attribute: None,
            sender: Some(sender),
            state: SessionState::Idle,
            grace_epoch: 0,
        }
    }

    /// Associate a live transport with this session
    ///
    /// Cancels any pending grace timer by bumping the epoch. If a
    /// transport was already bound (stale duplicate), it is replaced;
    /// the old channel simply closes.
    pub fn bind(&mut self, sender: mpsc::Sender<ServerMessage>) {
        self.grace_epoch += 1;
        self.sender = Some(sender);
    }

    /// Drop the transport association and start a new grace epoch
    ///
    /// Returns the epoch the caller's grace timer must carry.
    pub fn unbind(&mut self) -> u64 {
        self.grace_epoch += 1;
        self.sender = None;
        self.grace_epoch
    }

    /// Whether a live transport is currently bound
    pub fn is_connected(&self) -> bool {
        self.sender.is_some()
    }

    /// Whether this exact channel is the bound transport
    ///
    /// Lets a replaced connection's teardown be told apart from the
    /// live one's: only the current channel's close may unbind.
    pub fn is_bound_to(&self, sender: &mpsc::Sender<ServerMessage>) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|current| current.same_channel(sender))
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The pair this session belongs to, if any
    pub fn pair_id(&self) -> Option<PairId> {
        match self.state {
            SessionState::Paired(pair_id) => Some(pair_id),
            _ => None,
        }
    }

    /// `idle → searching`; refreshes name/attribute for this search
    ///
    /// Rejected while paired: the caller must tear the pair down first.
    pub fn start_search(&mut self, display_name: String, attribute: Option<String>) -> bool {
        match self.state {
            SessionState::Idle | SessionState::Searching => {
                self.display_name = Some(display_name);
                self.attribute = attribute.filter(|a| !a.is_empty());
                self.state = SessionState::Searching;
                true
            }
            SessionState::Paired(_) => false,
        }
    }

    /// `searching → paired`
    pub fn enter_pair(&mut self, pair_id: PairId) -> bool {
        match self.state {
            SessionState::Searching => {
                self.state = SessionState::Paired(pair_id);
                true
            }
            _ => false,
        }
    }

    /// `paired → idle`; no-op result if not in the named pair
    pub fn leave_pair(&mut self, pair_id: PairId) -> bool {
        match self.state {
            SessionState::Paired(current) if current == pair_id => {
                self.state = SessionState::Idle;
                true
            }
            _ => false,
        }
    }

    /// Cancel a pending search without pairing
    pub fn stop_search(&mut self) {
        if self.state == SessionState::Searching {
            self.state = SessionState::Idle;
        }
    }

    /// Best-effort, non-blocking delivery to this session's transport
    ///
    /// The central actor must never await a peer's transport, so this
    /// uses `try_send`. A full buffer means the receiver is not keeping
    /// up; the caller decides whether the message is droppable.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        match &self.sender {
            Some(sender) => sender.try_send(msg).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::ChannelFull,
                mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
            }),
            None => Err(SendError::ChannelClosed),
        }
    }

    /// Display name for protocol events; "Stranger" before any search
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Stranger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Session, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (Session::new(SessionId::generate(), tx), rx)
    }

    #[tokio::test]
    async fn test_new_session_is_idle_and_connected() {
        let (session, _rx) = session();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.is_connected());
        assert_eq!(session.display_name(), "Stranger");
    }

    #[tokio::test]
    async fn test_search_transitions() {
        let (mut session, _rx) = session();
        assert!(session.start_search("Alice".to_string(), Some("Legal".to_string())));
        assert_eq!(session.state(), SessionState::Searching);
        assert_eq!(session.display_name(), "Alice");
        assert_eq!(session.attribute.as_deref(), Some("Legal"));

        let pair_id = PairId::new();
        assert!(session.enter_pair(pair_id));
        assert_eq!(session.pair_id(), Some(pair_id));

        // Searching again while paired is rejected
        assert!(!session.start_search("Alice".to_string(), None));

        assert!(session.leave_pair(pair_id));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_enter_pair_requires_searching() {
        let (mut session, _rx) = session();
        assert!(!session.enter_pair(PairId::new()));
    }

    #[tokio::test]
    async fn test_leave_pair_checks_identity() {
        let (mut session, _rx) = session();
        session.start_search("Alice".to_string(), None);
        let pair_id = PairId::new();
        session.enter_pair(pair_id);

        assert!(!session.leave_pair(PairId::new()));
        assert_eq!(session.pair_id(), Some(pair_id));
    }

    #[tokio::test]
    async fn test_empty_attribute_treated_as_none() {
        let (mut session, _rx) = session();
        session.start_search("Alice".to_string(), Some(String::new()));
        assert!(session.attribute.is_none());
    }

    #[tokio::test]
    async fn test_is_bound_to_tracks_current_channel() {
        let (tx, _rx) = mpsc::channel(8);
        let mut session = Session::new(SessionId::generate(), tx.clone());
        assert!(session.is_bound_to(&tx));

        let (tx2, _rx2) = mpsc::channel(8);
        session.bind(tx2.clone());
        assert!(!session.is_bound_to(&tx));
        assert!(session.is_bound_to(&tx2));
    }

    #[tokio::test]
    async fn test_unbind_bumps_epoch_and_drops_sender() {
        let (mut session, _rx) = session();
        let epoch = session.unbind();
        assert!(!session.is_connected());
        assert_eq!(epoch, session.grace_epoch);
        assert!(session.send(ServerMessage::PartnerDisconnected).is_err());

        let (tx2, mut rx2) = mpsc::channel(8);
        session.bind(tx2);
        assert!(session.is_connected());
        assert_ne!(epoch, session.grace_epoch);
        assert!(session.send(ServerMessage::PartnerConnected).is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
