//! ChatServer actor implementation
//!
//! The central actor owning all shared state: the session registry, the
//! waiting pool, and the map of active pairs. Uses the Actor pattern
//! with mpsc channels for message passing, which gives every Session
//! and Pair mutation single-writer discipline and makes matching atomic
//! with respect to the pool. Delivery to peers is non-blocking
//! (`try_send` into per-connection channels), so a slow receiver never
//! stalls the actor or unrelated pairs.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, SendError};
use crate::message::{Envelope, ServerMessage};
use crate::pair::Pair;
use crate::pool::WaitingPool;
use crate::session::{Session, SessionState};
use crate::types::{MessageId, PairId, SessionId};

/// Commands sent from connection handlers (and grace timers) to the actor
#[derive(Debug)]
pub enum ServerCommand {
    /// A transport bound itself to a session (new or resumed)
    Connect {
        session_id: SessionId,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// A transport closed; carries its channel so a stale handler for a
    /// replaced connection cannot unbind the live one
    Disconnect {
        session_id: SessionId,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// A grace timer fired; ignored unless the epoch is still current
    GraceExpired { session_id: SessionId, epoch: u64 },
    /// Enter the waiting pool / request a match
    FindPartner {
        session_id: SessionId,
        display_name: String,
        attribute: Option<String>,
    },
    /// Relay an envelope to the partner
    SendMessage {
        session_id: SessionId,
        envelope: Envelope,
    },
    /// Typing-state signal
    Typing { session_id: SessionId, typing: bool },
    /// Attach or remove an emoji reaction
    SendReaction {
        session_id: SessionId,
        message_id: String,
        reaction: Option<String>,
    },
    /// Read-receipt
    MarkRead {
        session_id: SessionId,
        message_id: String,
    },
    /// Toggle this side's read-receipt flag
    SetReadReceipts {
        session_id: SessionId,
        enabled: bool,
    },
    /// Explicit end-of-chat
    DisconnectPartner { session_id: SessionId },
}

/// The central matchmaking and relay actor
pub struct ChatServer {
    config: Config,
    /// All known sessions, connected or within grace: SessionId -> Session
    sessions: HashMap<SessionId, Session>,
    /// Active and half-open pairs: PairId -> Pair
    pairs: HashMap<PairId, Pair>,
    /// Sessions seeking a partner
    pool: WaitingPool,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
    /// Handle back to ourselves, for grace timers
    self_tx: mpsc::Sender<ServerCommand>,
}

impl ChatServer {
    /// Create a new server actor
    ///
    /// `self_tx` must be a sender for the same channel as `receiver`;
    /// grace timers post their expiry through it.
    pub fn new(
        config: Config,
        receiver: mpsc::Receiver<ServerCommand>,
        self_tx: mpsc::Sender<ServerCommand>,
    ) -> Self {
        let pool = WaitingPool::new(config.pool_capacity);
        Self {
            config,
            sessions: HashMap::new(),
            pairs: HashMap::new(),
            pool,
            receiver,
            self_tx,
        }
    }

    /// Run the server event loop
    ///
    /// Continuously receives and processes commands until all senders
    /// (including our own grace-timer handle) are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Connect { session_id, sender } => {
                self.handle_connect(session_id, sender);
            }
            ServerCommand::Disconnect { session_id, sender } => {
                self.handle_disconnect(session_id, sender);
            }
            ServerCommand::GraceExpired { session_id, epoch } => {
                self.handle_grace_expired(session_id, epoch);
            }
            ServerCommand::FindPartner {
                session_id,
                display_name,
                attribute,
            } => {
                self.handle_find_partner(session_id, display_name, attribute);
            }
            ServerCommand::SendMessage {
                session_id,
                envelope,
            } => {
                self.handle_send_message(session_id, envelope);
            }
            ServerCommand::Typing { session_id, typing } => {
                self.handle_typing(session_id, typing);
            }
            ServerCommand::SendReaction {
                session_id,
                message_id,
                reaction,
            } => {
                self.handle_send_reaction(session_id, message_id, reaction);
            }
            ServerCommand::MarkRead {
                session_id,
                message_id,
            } => {
                self.handle_mark_read(session_id, message_id);
            }
            ServerCommand::SetReadReceipts {
                session_id,
                enabled,
            } => {
                self.handle_set_read_receipts(session_id, enabled);
            }
            ServerCommand::DisconnectPartner { session_id } => {
                self.handle_disconnect_partner(session_id);
            }
        }
    }

    /// Bind a transport to a new or resumed session
    fn handle_connect(&mut self, session_id: SessionId, sender: mpsc::Sender<ServerMessage>) {
        match self.sessions.get_mut(&session_id) {
            Some(session) => {
                // Resume: cancel any grace timer and replace the transport
                session.bind(sender);
                let _ = session.send(ServerMessage::Connected {
                    session_id: session_id.0.clone(),
                });
                let pair_id = session.pair_id();
                info!("Session {} resumed", session_id);
                if let Some(pair_id) = pair_id {
                    self.restore_pair(pair_id, &session_id);
                }
            }
            None => {
                let session = Session::new(session_id.clone(), sender);
                let _ = session.send(ServerMessage::Connected {
                    session_id: session_id.0.clone(),
                });
                self.sessions.insert(session_id.clone(), session);
                info!("Session {} created", session_id);
                debug!(
                    "Sessions: {}, pairs: {}, waiting: {}",
                    self.sessions.len(),
                    self.pairs.len(),
                    self.pool.len()
                );
            }
        }
    }

    /// `half_open → paired` on rebind within the grace period
    ///
    /// A rebind onto a still-active pair (the old transport was simply
    /// replaced) also gets a restore notice, but there is nothing held
    /// to flush and the partner never saw a drop, so they hear nothing.
    fn restore_pair(&mut self, pair_id: PairId, session_id: &SessionId) {
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        let was_half_open = pair.rejoin(session_id);
        let held = if was_half_open {
            pair.take_held(session_id)
        } else {
            Vec::new()
        };
        let partner_id = if was_half_open {
            pair.partner_of(session_id).cloned()
        } else {
            None
        };

        if let Some(session) = self.sessions.get(session_id) {
            let _ = session.send(ServerMessage::SessionRestored);
            for envelope in held {
                if session
                    .send(ServerMessage::ReceiveMessage { envelope })
                    .is_err()
                {
                    warn!("Failed to flush held envelope to {}", session_id);
                }
            }
        }
        if let Some(partner) = partner_id.and_then(|p| self.sessions.get(&p)) {
            let _ = partner.send(ServerMessage::PartnerConnected);
        }
        info!("Pair {} restored by {}", pair_id, session_id);
    }

    /// Transport closed: start the grace period, never evict immediately
    fn handle_disconnect(&mut self, session_id: SessionId, sender: mpsc::Sender<ServerMessage>) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if !session.is_bound_to(&sender) {
            debug!("Stale disconnect for session {}, ignoring", session_id);
            return;
        }
        let epoch = session.unbind();
        let pair_id = session.pair_id();
        info!(
            "Session {} disconnected, holding for {:?}",
            session_id, self.config.grace_period
        );

        if let Some(pair_id) = pair_id {
            let mut partner_id = None;
            let mut beyond_saving = false;
            if let Some(pair) = self.pairs.get_mut(&pair_id) {
                if pair.mark_gone(&session_id) {
                    partner_id = pair.partner_of(&session_id).cloned();
                } else {
                    // Other side was already gone; nobody left to wait for
                    beyond_saving = true;
                }
            }
            if beyond_saving {
                self.close_pair(pair_id, None);
            } else if let Some(partner) = partner_id.and_then(|p| self.sessions.get(&p)) {
                let _ = partner.send(ServerMessage::PartnerReconnecting);
            }
        }

        let tx = self.self_tx.clone();
        let grace = self.config.grace_period;
        let expired_session = session_id;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx
                .send(ServerCommand::GraceExpired {
                    session_id: expired_session,
                    epoch,
                })
                .await;
        });
    }

    /// Grace timer fired with no rebind: final teardown
    fn handle_grace_expired(&mut self, session_id: SessionId, epoch: u64) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        if session.is_connected() || session.grace_epoch != epoch {
            // Rebound in the meantime; this timer is stale
            return;
        }
        let pair_id = session.pair_id();
        self.pool.remove(&session_id);
        if let Some(pair_id) = pair_id {
            self.close_pair(pair_id, Some(&session_id));
        }
        self.sessions.remove(&session_id);
        info!("Session {} evicted after grace period", session_id);
    }

    /// Enter the waiting pool or pair up immediately
    ///
    /// Matching never fails with an error: no candidate just means the
    /// requester waits. Capacity exhaustion is the one recoverable
    /// rejection.
    fn handle_find_partner(
        &mut self,
        session_id: SessionId,
        display_name: String,
        attribute: Option<String>,
    ) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        if !session.is_connected() {
            debug!("find_partner from unbound session {}", session_id);
            return;
        }
        // A search while paired is a skip: tear the old pair down first
        if let Some(pair_id) = session.pair_id() {
            info!("Session {} skipped pair {}", session_id, pair_id);
            self.close_pair(pair_id, Some(&session_id));
        }

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if !session.start_search(display_name, attribute) {
            warn!(
                "Session {} cannot search from state {:?}",
                session_id,
                session.state()
            );
            return;
        }
        let attribute = session.attribute.clone();

        if self.pairs.len() >= self.config.pair_capacity {
            session.stop_search();
            let _ = session.send(ServerMessage::from(AppError::AtCapacity));
            warn!("Pair map at capacity, rejecting search from {}", session_id);
            return;
        }

        // Atomic with respect to the pool: the actor is the only writer,
        // so no two requesters can claim the same entry. Candidates whose
        // transport is down (mid-reconnect) are skipped, not consumed.
        let sessions = &self.sessions;
        let candidate = self.pool.take_match_for(&session_id, attribute.as_deref(), |sid| {
            sessions.get(sid).is_some_and(|s| s.is_connected())
        });

        match candidate {
            Some(entry) => {
                self.pool.remove(&session_id);
                self.create_pair(session_id, entry.session);
            }
            None => match self.pool.enqueue(session_id.clone(), attribute) {
                Ok(()) => {
                    info!("Session {} waiting ({} in pool)", session_id, self.pool.len());
                }
                Err(err) => {
                    if let Some(session) = self.sessions.get_mut(&session_id) {
                        session.stop_search();
                        let _ = session.send(err.into());
                    }
                    warn!("Waiting pool at capacity, rejecting {}", session_id);
                }
            },
        }
    }

    /// Pair two searching sessions and notify both sides
    fn create_pair(&mut self, requester: SessionId, candidate: SessionId) {
        // Check both sides before committing; with a single writer there
        // is no interleaving between check and commit
        let searching = |id: &SessionId| {
            matches!(
                self.sessions.get(id).map(|s| s.state()),
                Some(SessionState::Searching)
            )
        };
        if !searching(&requester) || !searching(&candidate) {
            warn!(
                "Match between {} and {} aborted: inconsistent state",
                requester, candidate
            );
            // Put the requester back to waiting rather than dropping them
            if let Some(session) = self.sessions.get(&requester) {
                let attribute = session.attribute.clone();
                let _ = self.pool.enqueue(requester, attribute);
            }
            return;
        }

        let pair_id = PairId::new();
        let profile = |id: &SessionId| match self.sessions.get(id) {
            Some(s) => (s.display_name().to_string(), s.attribute.clone()),
            None => ("Stranger".to_string(), None),
        };
        let (requester_name, requester_attr) = profile(&requester);
        let (candidate_name, candidate_attr) = profile(&candidate);

        for id in [&requester, &candidate] {
            if let Some(session) = self.sessions.get_mut(id) {
                let _ = session.enter_pair(pair_id);
            }
        }
        self.pairs.insert(
            pair_id,
            Pair::new(pair_id, requester.clone(), candidate.clone()),
        );

        // Each side sees the other's name and attribute
        if let Some(session) = self.sessions.get(&requester) {
            let _ = session.send(ServerMessage::Matched {
                partner_name: candidate_name,
                partner_attribute: candidate_attr,
            });
        }
        if let Some(session) = self.sessions.get(&candidate) {
            let _ = session.send(ServerMessage::Matched {
                partner_name: requester_name,
                partner_attribute: requester_attr,
            });
        }
        info!("Matched {} with {} (pair {})", requester, candidate, pair_id);
    }

    /// Relay an envelope to the partner, preserving per-direction order
    fn handle_send_message(&mut self, session_id: SessionId, envelope: Envelope) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let Some(pair_id) = session.pair_id() else {
            // Protocol misuse; never surfaced to anyone else
            debug!("send_message from unpaired session {}, dropped", session_id);
            let _ = session.send(ServerMessage::from(AppError::NotPaired));
            return;
        };
        // Boundary validation: the relay never sees a malformed envelope
        if let Err(err) = envelope.validate() {
            warn!("Malformed envelope from {}: {}", session_id, err);
            let _ = session.send(err.into());
            return;
        }

        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        let Some(partner_id) = pair.partner_of(&session_id).cloned() else {
            return;
        };
        pair.record_relayed(&session_id, MessageId(envelope.id.clone()));
        let stopped_typing = pair.set_typing(&session_id, false);

        if pair.is_gone(&partner_id) {
            debug!(
                "Partner {} absent, holding envelope {} for reconnect",
                partner_id, envelope.id
            );
            pair.hold_for(&partner_id, envelope);
            return;
        }

        let Some(partner) = self.sessions.get(&partner_id) else {
            return;
        };
        if stopped_typing {
            let _ = partner.send(ServerMessage::PartnerTyping { typing: false });
        }
        match partner.send(ServerMessage::ReceiveMessage {
            envelope: envelope.clone(),
        }) {
            Ok(()) => {}
            Err(SendError::ChannelFull) => {
                warn!(
                    "Partner {} backlogged, dropping envelope {}",
                    partner_id, envelope.id
                );
            }
            Err(SendError::ChannelClosed) => {
                // Transport died before the disconnect reached us
                pair.hold_for(&partner_id, envelope);
            }
        }
    }

    /// Relay a typing signal: latest-wins, droppable under load
    fn handle_typing(&mut self, session_id: SessionId, typing: bool) {
        let Some(pair_id) = self.pair_of(&session_id) else {
            return;
        };
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        if !pair.set_typing(&session_id, typing) {
            // Unchanged; nothing to relay
            return;
        }
        let partner_id = pair.partner_of(&session_id).cloned();
        if let Some(partner) = partner_id.and_then(|p| self.sessions.get(&p)) {
            // Stale typing signals may be dropped
            let _ = partner.send(ServerMessage::PartnerTyping { typing });
        }
    }

    /// Relay a reaction; unknown targets are ignored, not errors
    fn handle_send_reaction(
        &mut self,
        session_id: SessionId,
        message_id: String,
        reaction: Option<String>,
    ) {
        let Some(pair_id) = self.pair_of(&session_id) else {
            debug!("send_reaction from unpaired session {}, dropped", session_id);
            return;
        };
        let Some(pair) = self.pairs.get(&pair_id) else {
            return;
        };
        let Some(partner_id) = pair.partner_of(&session_id).cloned() else {
            return;
        };
        // Reactions target a message relayed in the opposite direction
        let target = MessageId(message_id.clone());
        if !pair.was_relayed_by(&partner_id, &target) {
            debug!("Reaction to unknown message {} ignored", message_id);
            return;
        }
        if let Some(partner) = self.sessions.get(&partner_id) {
            let _ = partner.send(ServerMessage::ReceiveReaction {
                message_id,
                reaction,
            });
        }
    }

    /// Record a read position and relay the receipt
    fn handle_mark_read(&mut self, session_id: SessionId, message_id: String) {
        let Some(pair_id) = self.pair_of(&session_id) else {
            debug!("mark_read from unpaired session {}, dropped", session_id);
            return;
        };
        let Some(pair) = self.pairs.get_mut(&pair_id) else {
            return;
        };
        let Some(partner_id) = pair.partner_of(&session_id).cloned() else {
            return;
        };
        let target = MessageId(message_id.clone());
        if !pair.was_relayed_by(&partner_id, &target) {
            debug!("Read-receipt for unknown message {} ignored", message_id);
            return;
        }
        pair.mark_read(&session_id, target);
        // Suppressed when the reading side has receipts off
        if !pair.read_receipts_enabled(&session_id) {
            return;
        }
        if let Some(partner) = self.sessions.get(&partner_id) {
            let _ = partner.send(ServerMessage::MessageReadByPartner { message_id });
        }
    }

    /// Toggle the read-receipt flag on the current pair
    fn handle_set_read_receipts(&mut self, session_id: SessionId, enabled: bool) {
        let Some(pair_id) = self.pair_of(&session_id) else {
            return;
        };
        if let Some(pair) = self.pairs.get_mut(&pair_id) {
            pair.set_read_receipts(&session_id, enabled);
        }
    }

    /// Explicit end-of-chat; idempotent by construction
    ///
    /// A second call finds the session already idle and does nothing,
    /// so the partner is never notified twice.
    fn handle_disconnect_partner(&mut self, session_id: SessionId) {
        let Some(pair_id) = self.pair_of(&session_id) else {
            debug!("disconnect_partner from unpaired session {}", session_id);
            return;
        };
        info!("Session {} ended pair {}", session_id, pair_id);
        self.close_pair(pair_id, Some(&session_id));
    }

    /// Tear a pair down and notify the remaining side exactly once
    ///
    /// `ended_by` is the side that caused the teardown (explicit end or
    /// grace expiry); it gets no notification. Removing the pair from
    /// the map first is what makes double teardown impossible.
    fn close_pair(&mut self, pair_id: PairId, ended_by: Option<&SessionId>) {
        let Some(pair) = self.pairs.remove(&pair_id) else {
            return;
        };
        let (a, b) = pair.members();
        for member in [a.clone(), b.clone()] {
            if let Some(session) = self.sessions.get_mut(&member) {
                session.leave_pair(pair_id);
                if Some(&member) != ended_by && session.is_connected() {
                    let _ = session.send(ServerMessage::PartnerDisconnected);
                }
            }
        }
        debug!("Pair {} closed", pair_id);
    }

    /// Helper: the pair a session currently belongs to
    fn pair_of(&self, session_id: &SessionId) -> Option<PairId> {
        self.sessions.get(session_id).and_then(|s| s.pair_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_WAIT: Duration = Duration::from_secs(1);

    fn test_config() -> Config {
        Config {
            grace_period: Duration::from_secs(5),
            ..Config::default()
        }
    }

    fn start_server(config: Config) -> mpsc::Sender<ServerCommand> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(ChatServer::new(config, cmd_rx, cmd_tx.clone()).run());
        cmd_tx
    }

    /// A fake connected client: a command handle plus the channel the
    /// server delivers into, standing in for the WebSocket tasks.
    struct TestClient {
        cmd: mpsc::Sender<ServerCommand>,
        id: SessionId,
        tx: mpsc::Sender<ServerMessage>,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestClient {
        async fn connect(cmd: &mpsc::Sender<ServerCommand>, id: SessionId) -> Self {
            let (tx, rx) = mpsc::channel(64);
            cmd.send(ServerCommand::Connect {
                session_id: id.clone(),
                sender: tx.clone(),
            })
            .await
            .unwrap();
            let mut client = Self {
                cmd: cmd.clone(),
                id,
                tx,
                rx,
            };
            // Every bind is acked first
            match client.recv().await {
                ServerMessage::Connected { session_id } => assert_eq!(session_id, client.id.0),
                other => panic!("expected connected, got {:?}", other),
            }
            client
        }

        async fn recv(&mut self) -> ServerMessage {
            timeout(RECV_WAIT, self.rx.recv())
                .await
                .expect("no message within wait window")
                .expect("server channel closed")
        }

        async fn assert_silent(&mut self) {
            if let Ok(msg) = timeout(Duration::from_millis(100), self.rx.recv()).await {
                panic!("expected silence, got {:?}", msg);
            }
        }

        async fn find_partner(&self, name: &str, attribute: Option<&str>) {
            self.cmd
                .send(ServerCommand::FindPartner {
                    session_id: self.id.clone(),
                    display_name: name.to_string(),
                    attribute: attribute.map(str::to_string),
                })
                .await
                .unwrap();
        }

        async fn send_text(&self, id: &str, text: &str) {
            self.cmd
                .send(ServerCommand::SendMessage {
                    session_id: self.id.clone(),
                    envelope: envelope(id, text),
                })
                .await
                .unwrap();
        }

        /// Simulate the transport closing without evicting the session
        async fn drop_transport(&self) {
            self.cmd
                .send(ServerCommand::Disconnect {
                    session_id: self.id.clone(),
                    sender: self.tx.clone(),
                })
                .await
                .unwrap();
        }
    }

    fn envelope(id: &str, text: &str) -> Envelope {
        Envelope {
            id: id.to_string(),
            text: Some(text.to_string()),
            audio: None,
            image: None,
            video: None,
            reply_to: None,
            timestamp: "10:21 PM".to_string(),
            is_nsfw: None,
        }
    }

    async fn matched_pair(cmd: &mpsc::Sender<ServerCommand>) -> (TestClient, TestClient) {
        let mut x = TestClient::connect(cmd, SessionId::generate()).await;
        let mut y = TestClient::connect(cmd, SessionId::generate()).await;
        x.find_partner("Alice", Some("Legal")).await;
        y.find_partner("Bob", Some("Legal")).await;
        assert!(matches!(x.recv().await, ServerMessage::Matched { .. }));
        assert!(matches!(y.recv().await, ServerMessage::Matched { .. }));
        (x, y)
    }

    #[tokio::test]
    async fn test_same_attribute_match_end_to_end() {
        let cmd = start_server(test_config());
        let mut x = TestClient::connect(&cmd, SessionId::generate()).await;
        let mut y = TestClient::connect(&cmd, SessionId::generate()).await;

        x.find_partner("Alice", Some("Legal")).await;
        y.find_partner("Bob", Some("Legal")).await;

        match x.recv().await {
            ServerMessage::Matched {
                partner_name,
                partner_attribute,
            } => {
                assert_eq!(partner_name, "Bob");
                assert_eq!(partner_attribute.as_deref(), Some("Legal"));
            }
            other => panic!("expected matched, got {:?}", other),
        }
        match y.recv().await {
            ServerMessage::Matched { partner_name, .. } => assert_eq!(partner_name, "Alice"),
            other => panic!("expected matched, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attribute_preferred_over_earlier_waiter() {
        let cmd = start_server(test_config());
        let mut early = TestClient::connect(&cmd, SessionId::generate()).await;
        let mut same_field = TestClient::connect(&cmd, SessionId::generate()).await;
        let mut requester = TestClient::connect(&cmd, SessionId::generate()).await;

        early.find_partner("Early", Some("Education")).await;
        same_field.find_partner("Sam", Some("Legal")).await;
        requester.find_partner("Rita", Some("Legal")).await;

        match requester.recv().await {
            ServerMessage::Matched { partner_name, .. } => assert_eq!(partner_name, "Sam"),
            other => panic!("expected matched, got {:?}", other),
        }
        assert!(matches!(
            same_field.recv().await,
            ServerMessage::Matched { .. }
        ));
        early.assert_silent().await;
    }

    #[tokio::test]
    async fn test_no_candidate_means_waiting_not_error() {
        let cmd = start_server(test_config());
        let mut alone = TestClient::connect(&cmd, SessionId::generate()).await;
        alone.find_partner("Alone", None).await;
        alone.assert_silent().await;
    }

    #[tokio::test]
    async fn test_relay_preserves_order() {
        let cmd = start_server(test_config());
        let (x, mut y) = matched_pair(&cmd).await;

        x.send_text("m1", "first").await;
        x.send_text("m2", "second").await;
        x.send_text("m3", "third").await;

        for expected in ["m1", "m2", "m3"] {
            match y.recv().await {
                ServerMessage::ReceiveMessage { envelope } => assert_eq!(envelope.id, expected),
                other => panic!("expected receive_message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_relay_from_unpaired_not_surfaced_to_others() {
        let cmd = start_server(test_config());
        let mut x = TestClient::connect(&cmd, SessionId::generate()).await;
        x.send_text("m1", "hello?").await;
        // Sender gets an informational error, nothing crashes
        assert!(matches!(x.recv().await, ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_malformed_envelope_rejected_at_boundary() {
        let cmd = start_server(test_config());
        let (x, mut y) = matched_pair(&cmd).await;

        let mut bad = envelope("m1", "hi");
        bad.text = None; // no payload at all
        x.cmd
            .send(ServerCommand::SendMessage {
                session_id: x.id.clone(),
                envelope: bad,
            })
            .await
            .unwrap();

        let mut x = x;
        assert!(matches!(x.recv().await, ServerMessage::Error { .. }));
        y.assert_silent().await;
    }

    #[tokio::test]
    async fn test_typing_relay_and_cleared_by_message() {
        let cmd = start_server(test_config());
        let (x, mut y) = matched_pair(&cmd).await;

        x.cmd
            .send(ServerCommand::Typing {
                session_id: x.id.clone(),
                typing: true,
            })
            .await
            .unwrap();
        assert!(matches!(
            y.recv().await,
            ServerMessage::PartnerTyping { typing: true }
        ));

        // Repeated identical signal is not re-relayed
        x.cmd
            .send(ServerCommand::Typing {
                session_id: x.id.clone(),
                typing: true,
            })
            .await
            .unwrap();

        // A message implicitly clears typing before delivery
        x.send_text("m1", "done typing").await;
        assert!(matches!(
            y.recv().await,
            ServerMessage::PartnerTyping { typing: false }
        ));
        assert!(matches!(
            y.recv().await,
            ServerMessage::ReceiveMessage { .. }
        ));
    }

    #[tokio::test]
    async fn test_reaction_correlation() {
        let cmd = start_server(test_config());
        let (mut x, y) = matched_pair(&cmd).await;

        y.send_text("m1", "react to me").await;
        assert!(matches!(
            x.recv().await,
            ServerMessage::ReceiveMessage { .. }
        ));

        // X reacts to Y's message: Y receives it
        x.cmd
            .send(ServerCommand::SendReaction {
                session_id: x.id.clone(),
                message_id: "m1".to_string(),
                reaction: Some("❤️".to_string()),
            })
            .await
            .unwrap();
        let mut y = y;
        match y.recv().await {
            ServerMessage::ReceiveReaction {
                message_id,
                reaction,
            } => {
                assert_eq!(message_id, "m1");
                assert_eq!(reaction.as_deref(), Some("❤️"));
            }
            other => panic!("expected receive_reaction, got {:?}", other),
        }

        // Unknown target is ignored, not an error
        x.cmd
            .send(ServerCommand::SendReaction {
                session_id: x.id.clone(),
                message_id: "nope".to_string(),
                reaction: Some("👍".to_string()),
            })
            .await
            .unwrap();
        y.assert_silent().await;
        x.assert_silent().await;
    }

    #[tokio::test]
    async fn test_read_receipt_flow_and_suppression() {
        let cmd = start_server(test_config());
        let (mut x, mut y) = matched_pair(&cmd).await;

        y.send_text("m1", "read me").await;
        assert!(matches!(
            x.recv().await,
            ServerMessage::ReceiveMessage { .. }
        ));

        x.cmd
            .send(ServerCommand::MarkRead {
                session_id: x.id.clone(),
                message_id: "m1".to_string(),
            })
            .await
            .unwrap();
        match y.recv().await {
            ServerMessage::MessageReadByPartner { message_id } => assert_eq!(message_id, "m1"),
            other => panic!("expected message_read_by_partner, got {:?}", other),
        }

        // X turns receipts off: further reads stay private
        x.cmd
            .send(ServerCommand::SetReadReceipts {
                session_id: x.id.clone(),
                enabled: false,
            })
            .await
            .unwrap();
        y.send_text("m2", "read me too").await;
        assert!(matches!(
            x.recv().await,
            ServerMessage::ReceiveMessage { .. }
        ));
        x.cmd
            .send(ServerCommand::MarkRead {
                session_id: x.id.clone(),
                message_id: "m2".to_string(),
            })
            .await
            .unwrap();
        y.assert_silent().await;
    }

    #[tokio::test]
    async fn test_explicit_disconnect_is_idempotent() {
        let cmd = start_server(test_config());
        let (x, mut y) = matched_pair(&cmd).await;

        x.cmd
            .send(ServerCommand::DisconnectPartner {
                session_id: x.id.clone(),
            })
            .await
            .unwrap();
        assert!(matches!(y.recv().await, ServerMessage::PartnerDisconnected));

        // Second call: no second notification
        x.cmd
            .send(ServerCommand::DisconnectPartner {
                session_id: x.id.clone(),
            })
            .await
            .unwrap();
        y.assert_silent().await;
        let mut x = x;
        x.assert_silent().await;
    }

    #[tokio::test]
    async fn test_skip_while_paired_tears_down_first() {
        let cmd = start_server(test_config());
        let (x, mut y) = matched_pair(&cmd).await;

        // Searching again while paired ends the current chat for Y
        x.find_partner("Alice", None).await;
        assert!(matches!(y.recv().await, ServerMessage::PartnerDisconnected));
        let mut x = x;
        x.assert_silent().await; // no candidate yet, X just waits
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_restores_pair() {
        let cmd = start_server(test_config());
        let (x, mut y) = matched_pair(&cmd).await;
        let x_id = x.id.clone();

        x.drop_transport().await;
        assert!(matches!(y.recv().await, ServerMessage::PartnerReconnecting));

        // Y keeps talking; envelopes are held for X
        y.send_text("m1", "still there?").await;
        y.send_text("m2", "hello?").await;

        // X rebinds the same session within grace
        let mut x2 = TestClient::connect(&cmd, x_id).await;
        assert!(matches!(x2.recv().await, ServerMessage::SessionRestored));
        assert!(matches!(y.recv().await, ServerMessage::PartnerConnected));

        // Held envelopes arrive in order
        for expected in ["m1", "m2"] {
            match x2.recv().await {
                ServerMessage::ReceiveMessage { envelope } => assert_eq!(envelope.id, expected),
                other => panic!("expected receive_message, got {:?}", other),
            }
        }

        // The pair (and its state) survived: relay still works
        x2.send_text("m3", "back").await;
        match y.recv().await {
            ServerMessage::ReceiveMessage { envelope } => assert_eq!(envelope.id, "m3"),
            other => panic!("expected receive_message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rebind_onto_active_pair_still_restores() {
        // Fast reconnect: the new transport binds before the server ever
        // sees the old one close
        let cmd = start_server(test_config());
        let (x, mut y) = matched_pair(&cmd).await;
        let x_id = x.id.clone();

        let mut x2 = TestClient::connect(&cmd, x_id).await;
        assert!(matches!(x2.recv().await, ServerMessage::SessionRestored));
        // Partner never saw a drop, so hears nothing
        y.assert_silent().await;

        // The old transport's teardown must not unbind the new one
        x.drop_transport().await;
        y.assert_silent().await;
        x2.send_text("m1", "still here").await;
        assert!(matches!(
            y.recv().await,
            ServerMessage::ReceiveMessage { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_tears_down_exactly_once() {
        let config = test_config();
        let grace = config.grace_period;
        let cmd = start_server(config);
        let (x, mut y) = matched_pair(&cmd).await;
        let x_id = x.id.clone();

        x.drop_transport().await;
        assert!(matches!(y.recv().await, ServerMessage::PartnerReconnecting));

        tokio::time::sleep(grace + Duration::from_secs(1)).await;

        assert!(matches!(y.recv().await, ServerMessage::PartnerDisconnected));
        y.assert_silent().await;

        // The session was evicted: the token now mints a fresh session,
        // so no restore and no pair
        let mut x2 = TestClient::connect(&cmd, x_id).await;
        x2.assert_silent().await;
        x2.send_text("m1", "anyone?").await;
        assert!(matches!(x2.recv().await, ServerMessage::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_cancels_grace_timer() {
        let config = test_config();
        let grace = config.grace_period;
        let cmd = start_server(config);
        let (x, mut y) = matched_pair(&cmd).await;
        let x_id = x.id.clone();

        x.drop_transport().await;
        assert!(matches!(y.recv().await, ServerMessage::PartnerReconnecting));

        let mut x2 = TestClient::connect(&cmd, x_id).await;
        assert!(matches!(x2.recv().await, ServerMessage::SessionRestored));
        assert!(matches!(y.recv().await, ServerMessage::PartnerConnected));

        // The stale timer fires but must be a no-op
        tokio::time::sleep(grace + Duration::from_secs(1)).await;
        y.assert_silent().await;
        x2.assert_silent().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_capacity_rejected_with_retry_signal() {
        let config = Config {
            pool_capacity: 1,
            ..test_config()
        };
        let cmd = start_server(config);

        // First searcher fills the pool, then drops (stays pooled in grace
        // but is no longer an eligible candidate)
        let first = TestClient::connect(&cmd, SessionId::generate()).await;
        first.find_partner("First", None).await;
        first.drop_transport().await;

        let mut second = TestClient::connect(&cmd, SessionId::generate()).await;
        second.find_partner("Second", None).await;
        match second.recv().await {
            ServerMessage::Error { code, .. } => {
                assert!(matches!(code, crate::message::ErrorCode::PoolFull))
            }
            other => panic!("expected pool_full error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_waiting_pool_entry_consumed_once() {
        // Two requesters racing for one waiter: exactly one match
        let cmd = start_server(test_config());
        let mut waiter = TestClient::connect(&cmd, SessionId::generate()).await;
        let mut a = TestClient::connect(&cmd, SessionId::generate()).await;
        let mut b = TestClient::connect(&cmd, SessionId::generate()).await;

        waiter.find_partner("Waiter", None).await;
        a.find_partner("A", None).await;
        b.find_partner("B", None).await;

        assert!(matches!(waiter.recv().await, ServerMessage::Matched { .. }));
        // One of A/B matched the waiter; the other is still waiting
        let a_msg = timeout(Duration::from_millis(200), a.rx.recv()).await;
        let b_msg = timeout(Duration::from_millis(200), b.rx.recv()).await;
        assert!(a_msg.is_ok() ^ b_msg.is_ok(), "exactly one should match");
    }
}
