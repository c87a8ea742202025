//! Pair record and per-pair state machine
//!
//! A pair is an active chat relationship between exactly two sessions.
//! Its state machine is what separates an internet blip from a user
//! leaving: `active → half_open` when one side's transport drops,
//! `half_open → active` on rebind within the grace period, torn down
//! (removed from the pair map) on explicit disconnect or grace expiry.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use tracing::warn;

use crate::message::Envelope;
use crate::types::{MessageId, PairId, SessionId};

/// Envelopes held for an absent side before the oldest is dropped
pub const PENDING_CAP: usize = 64;

/// Relayed-id correlation window per direction
const RELAYED_IDS_CAP: usize = 4096;

/// Per-pair lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairState {
    /// Both sides have (or recently had) live transports
    Active,
    /// One side's transport dropped; session still within grace
    HalfOpen { gone: SessionId },
}

/// Per-side bookkeeping, owned exclusively by the pair record
#[derive(Debug, Default)]
struct Side {
    /// Last message id this side marked read
    last_read: Option<MessageId>,
    /// Currently typing flag
    typing: bool,
    /// Whether this side emits read receipts
    read_receipts: bool,
    /// Ids of envelopes this side has sent, for reaction/receipt correlation
    relayed: HashSet<MessageId>,
    /// Envelopes addressed to this side, held while it is absent
    pending: VecDeque<Envelope>,
}

/// An active 1:1 chat between two sessions
#[derive(Debug)]
pub struct Pair {
    /// Pair identifier, server-internal
    pub id: PairId,
    /// The two member sessions (unordered)
    members: [SessionId; 2],
    sides: [Side; 2],
    state: PairState,
    /// Pair creation time
    pub created_at: Instant,
}

impl Pair {
    /// Create an active pair between two distinct sessions
    pub fn new(id: PairId, a: SessionId, b: SessionId) -> Self {
        debug_assert_ne!(a, b, "a pair needs two distinct sessions");
        let read_receipts_on = || Side {
            read_receipts: true,
            ..Side::default()
        };
        Self {
            id,
            members: [a, b],
            sides: [read_receipts_on(), read_receipts_on()],
            state: PairState::Active,
            created_at: Instant::now(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> &PairState {
        &self.state
    }

    /// Both member sessions
    pub fn members(&self) -> (&SessionId, &SessionId) {
        (&self.members[0], &self.members[1])
    }

    /// Whether the given session belongs to this pair
    pub fn contains(&self, session: &SessionId) -> bool {
        self.members.iter().any(|m| m == session)
    }

    /// The other member for a given session
    pub fn partner_of(&self, session: &SessionId) -> Option<&SessionId> {
        match self.index_of(session) {
            Some(i) => Some(&self.members[1 - i]),
            None => None,
        }
    }

    /// `active → half_open`: one side's transport dropped
    ///
    /// Rejected unless currently active (a second drop while already
    /// half-open means the pair is beyond saving; the caller tears it
    /// down instead).
    pub fn mark_gone(&mut self, session: &SessionId) -> bool {
        if !self.contains(session) || self.state != PairState::Active {
            return false;
        }
        self.state = PairState::HalfOpen {
            gone: session.clone(),
        };
        true
    }

    /// `half_open → active`: the gone side rebound within grace
    pub fn rejoin(&mut self, session: &SessionId) -> bool {
        match &self.state {
            PairState::HalfOpen { gone } if gone == session => {
                self.state = PairState::Active;
                true
            }
            _ => false,
        }
    }

    /// Whether this session is the absent side of a half-open pair
    pub fn is_gone(&self, session: &SessionId) -> bool {
        matches!(&self.state, PairState::HalfOpen { gone } if gone == session)
    }

    /// Record an envelope id relayed from `from`, for later correlation
    pub fn record_relayed(&mut self, from: &SessionId, id: MessageId) {
        let Some(i) = self.index_of(from) else {
            return;
        };
        let side = &mut self.sides[i];
        if side.relayed.len() < RELAYED_IDS_CAP {
            side.relayed.insert(id);
        }
    }

    /// Whether `from` has relayed an envelope with this id
    pub fn was_relayed_by(&self, from: &SessionId, id: &MessageId) -> bool {
        self.index_of(from)
            .is_some_and(|i| self.sides[i].relayed.contains(id))
    }

    /// Set a side's typing flag; returns true if the flag changed
    pub fn set_typing(&mut self, session: &SessionId, typing: bool) -> bool {
        let Some(i) = self.index_of(session) else {
            return false;
        };
        let changed = self.sides[i].typing != typing;
        self.sides[i].typing = typing;
        changed
    }

    /// Whether a side is currently typing
    pub fn is_typing(&self, session: &SessionId) -> bool {
        self.index_of(session).is_some_and(|i| self.sides[i].typing)
    }

    /// Toggle a side's read-receipt flag
    pub fn set_read_receipts(&mut self, session: &SessionId, enabled: bool) {
        if let Some(i) = self.index_of(session) {
            self.sides[i].read_receipts = enabled;
        }
    }

    /// Whether a side emits read receipts
    pub fn read_receipts_enabled(&self, session: &SessionId) -> bool {
        self.index_of(session)
            .is_some_and(|i| self.sides[i].read_receipts)
    }

    /// Record a side's read position
    pub fn mark_read(&mut self, session: &SessionId, id: MessageId) {
        if let Some(i) = self.index_of(session) {
            self.sides[i].last_read = Some(id);
        }
    }

    /// A side's last read position
    pub fn last_read(&self, session: &SessionId) -> Option<&MessageId> {
        self.index_of(session)
            .and_then(|i| self.sides[i].last_read.as_ref())
    }

    /// Hold an envelope for an absent side, bounded
    ///
    /// Drops the oldest held envelope on overflow. At-least-once on
    /// reconnect, nothing more.
    pub fn hold_for(&mut self, session: &SessionId, envelope: Envelope) {
        let Some(i) = self.index_of(session) else {
            return;
        };
        let pending = &mut self.sides[i].pending;
        if pending.len() >= PENDING_CAP {
            if let Some(dropped) = pending.pop_front() {
                warn!(
                    "Pair {} hold buffer full, dropping envelope {} for {}",
                    self.id, dropped.id, session
                );
            }
        }
        pending.push_back(envelope);
    }

    /// Drain envelopes held for a side, in arrival order
    pub fn take_held(&mut self, session: &SessionId) -> Vec<Envelope> {
        match self.index_of(session) {
            Some(i) => self.sides[i].pending.drain(..).collect(),
            None => Vec::new(),
        }
    }

    fn index_of(&self, session: &SessionId) -> Option<usize> {
        self.members.iter().position(|m| m == session)
    }
}
