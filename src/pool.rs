//! Waiting pool
//!
//! The set of sessions currently seeking a partner, in enqueue order.
//! Exposes ordered scan/removal primitives only; the matching preference
//! policy (attribute-first, then any) lives in the server's match path.

use std::time::Instant;

use crate::error::AppError;
use crate::types::SessionId;

/// One session waiting for a partner
#[derive(Debug)]
pub struct WaitingEntry {
    /// The waiting session
    pub session: SessionId,
    /// Optional matching attribute (field/profession)
    pub attribute: Option<String>,
    /// When the session first entered the pool
    pub enqueued_at: Instant,
}

/// FIFO pool of sessions seeking a partner
///
/// A session appears at most once. Re-enqueueing updates the attribute
/// in place but keeps the original position and timestamp, so repeated
/// searches cannot starve earlier waiters.
#[derive(Debug)]
pub struct WaitingPool {
    entries: Vec<WaitingEntry>,
    capacity: usize,
}

impl WaitingPool {
    /// Create a pool bounded at `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Number of waiting sessions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the session is currently waiting
    pub fn contains(&self, session: &SessionId) -> bool {
        self.entries.iter().any(|e| &e.session == session)
    }

    /// Add a session to the pool, or refresh its attribute if present
    pub fn enqueue(
        &mut self,
        session: SessionId,
        attribute: Option<String>,
    ) -> Result<(), AppError> {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.session == session) {
            existing.attribute = attribute;
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(AppError::AtCapacity);
        }
        self.entries.push(WaitingEntry {
            session,
            attribute,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Remove and return the best candidate for a requester
    ///
    /// Two-pass FIFO scan: first the earliest entry whose attribute
    /// equals the requester's (when given), then the earliest entry of
    /// any attribute. The requester's own entry is never a candidate,
    /// and entries failing `eligible` (e.g. sessions mid-reconnect) are
    /// skipped without being removed.
    pub fn take_match_for<F>(
        &mut self,
        requester: &SessionId,
        attribute: Option<&str>,
        eligible: F,
    ) -> Option<WaitingEntry>
    where
        F: Fn(&SessionId) -> bool,
    {
        let considered =
            |e: &WaitingEntry| &e.session != requester && eligible(&e.session);
        let position = attribute
            .and_then(|wanted| {
                self.entries
                    .iter()
                    .position(|e| considered(e) && e.attribute.as_deref() == Some(wanted))
            })
            .or_else(|| self.entries.iter().position(considered));
        position.map(|i| self.entries.remove(i))
    }

    /// Cancel a pending search; returns true if an entry was removed
    pub fn remove(&mut self, session: &SessionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.session != session);
        self.entries.len() != before
    }
}
