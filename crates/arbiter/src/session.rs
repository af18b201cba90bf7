//! Session tracker: reverse index from a connected client to what it holds.
//!
//! Pure bookkeeping. The arbiter mutates it in the same `&mut` step as the
//! ledger, so a grant appears here at the instant the count is incremented and
//! disappears at the instant it is decremented or cancelled.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::bridge::protocol::{RequestId, SessionId};
use crate::ledger::QuotaKey;

/// How many finished (released or cancelled) request ids a session remembers.
pub const FINISHED_CAPACITY: usize = 4096;

/// What one request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub key: QuotaKey,
    pub weight: u32,
}

impl Claim {
    pub fn new(key: QuotaKey, weight: u32) -> Self {
        Self { key, weight }
    }
}

/// Where a request id stands within one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Pending(Claim),
    Held(Claim),
    /// Released earlier; a second release is a double release.
    Retired(Claim),
    /// Cancelled (or rejected) while it was still waiting.
    Withdrawn(Claim),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Released,
    Withdrawn,
}

/// One live client connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    opened_at: DateTime<Utc>,
    held: HashMap<RequestId, Claim>,
    pending: HashMap<RequestId, Claim>,
    finished: HashMap<RequestId, (Finish, Claim)>,
    /// Eviction order for `finished`; holds each id at most once.
    finished_order: VecDeque<RequestId>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            opened_at: Utc::now(),
            held: HashMap::new(),
            pending: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn state(&self, request_id: RequestId) -> RequestState {
        if let Some(claim) = self.held.get(&request_id) {
            return RequestState::Held(claim.clone());
        }
        if let Some(claim) = self.pending.get(&request_id) {
            return RequestState::Pending(claim.clone());
        }
        match self.finished.get(&request_id) {
            Some((Finish::Released, claim)) => RequestState::Retired(claim.clone()),
            Some((Finish::Withdrawn, claim)) => RequestState::Withdrawn(claim.clone()),
            None => RequestState::Unknown,
        }
    }

    /// Held or pending.
    pub fn is_live(&self, request_id: RequestId) -> bool {
        self.held.contains_key(&request_id) || self.pending.contains_key(&request_id)
    }

    pub fn held(&self) -> impl Iterator<Item = (RequestId, &Claim)> {
        self.held.iter().map(|(id, claim)| (*id, claim))
    }

    pub fn record_pending(&mut self, request_id: RequestId, claim: Claim) {
        self.forget(request_id);
        self.pending.insert(request_id, claim);
    }

    pub fn record_grant(&mut self, request_id: RequestId, claim: Claim) {
        self.forget(request_id);
        self.pending.remove(&request_id);
        self.held.insert(request_id, claim);
    }

    /// Move a pending request to held. Returns false if it was not pending.
    pub fn promote(&mut self, request_id: RequestId) -> bool {
        match self.pending.remove(&request_id) {
            Some(claim) => {
                self.held.insert(request_id, claim);
                true
            }
            None => false,
        }
    }

    /// Drop a pending request, remembering that it was withdrawn.
    pub fn withdraw(&mut self, request_id: RequestId) -> Option<Claim> {
        let claim = self.pending.remove(&request_id)?;
        self.remember(request_id, Finish::Withdrawn, claim.clone());
        Some(claim)
    }

    /// Move a held grant to the retired set.
    pub fn retire(&mut self, request_id: RequestId) -> Option<Claim> {
        let claim = self.held.remove(&request_id)?;
        self.remember(request_id, Finish::Released, claim.clone());
        Some(claim)
    }

    /// Consume the session, yielding (held, pending) for teardown.
    pub fn into_parts(self) -> (HashMap<RequestId, Claim>, HashMap<RequestId, Claim>) {
        (self.held, self.pending)
    }

    fn remember(&mut self, request_id: RequestId, finish: Finish, claim: Claim) {
        self.forget(request_id);
        while self.finished_order.len() >= FINISHED_CAPACITY {
            let Some(oldest) = self.finished_order.pop_front() else {
                break;
            };
            self.finished.remove(&oldest);
        }
        self.finished.insert(request_id, (finish, claim));
        self.finished_order.push_back(request_id);
    }

    /// Reusing an id clears what we remembered about its previous life.
    fn forget(&mut self, request_id: RequestId) {
        if self.finished.remove(&request_id).is_some() {
            self.finished_order.retain(|id| *id != request_id);
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: HashMap<SessionId, Session>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Returns false if it already exists.
    pub fn open(&mut self, id: SessionId) -> bool {
        if self.sessions.contains_key(&id) {
            return false;
        }
        self.sessions.insert(id, Session::new(id));
        true
    }

    /// Remove a session. Only the first call for an id returns it.
    pub fn close(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim() -> Claim {
        Claim::new(QuotaKey::new("hostA", "read"), 1)
    }

    #[test]
    fn request_moves_pending_held_retired() {
        let mut session = Session::new(SessionId::new());
        let id = RequestId::new(1);

        assert_eq!(session.state(id), RequestState::Unknown);

        session.record_pending(id, claim());
        assert_eq!(session.state(id), RequestState::Pending(claim()));
        assert!(session.is_live(id));

        assert!(session.promote(id));
        assert_eq!(session.state(id), RequestState::Held(claim()));

        assert_eq!(session.retire(id), Some(claim()));
        assert_eq!(session.state(id), RequestState::Retired(claim()));
        assert!(!session.is_live(id));

        assert_eq!(session.retire(id), None);
    }

    #[test]
    fn withdrawn_request_is_remembered() {
        let mut session = Session::new(SessionId::new());
        let id = RequestId::new(2);

        session.record_pending(id, claim());
        assert_eq!(session.withdraw(id), Some(claim()));
        assert_eq!(session.state(id), RequestState::Withdrawn(claim()));
        assert_eq!(session.withdraw(id), None);
    }

    #[test]
    fn promote_requires_pending() {
        let mut session = Session::new(SessionId::new());
        assert!(!session.promote(RequestId::new(1)));
        assert_eq!(session.held().count(), 0);
    }

    #[test]
    fn reusing_a_retired_id_forgets_it() {
        let mut session = Session::new(SessionId::new());
        let id = RequestId::new(1);

        session.record_grant(id, claim());
        session.retire(id);
        session.record_grant(id, claim());

        assert_eq!(session.state(id), RequestState::Held(claim()));
        assert!(session.finished_order.is_empty());
    }

    #[test]
    fn finished_memory_is_bounded() {
        let mut session = Session::new(SessionId::new());
        for n in 0..(FINISHED_CAPACITY as u64 + 10) {
            let id = RequestId::new(n);
            session.record_grant(id, claim());
            session.retire(id);
        }

        assert_eq!(session.finished.len(), FINISHED_CAPACITY);
        assert_eq!(session.state(RequestId::new(0)), RequestState::Unknown);
        assert_eq!(
            session.state(RequestId::new(FINISHED_CAPACITY as u64 + 9)),
            RequestState::Retired(claim())
        );
    }

    #[test]
    fn reused_id_is_not_evicted_by_its_stale_entry() {
        let mut session = Session::new(SessionId::new());
        let reused = RequestId::new(0);

        session.record_grant(reused, claim());
        session.retire(reused);
        session.record_grant(reused, claim());

        // Fill the memory, retiring the reused id last.
        for n in 1..FINISHED_CAPACITY as u64 {
            let id = RequestId::new(n);
            session.record_grant(id, claim());
            session.retire(id);
        }
        session.retire(reused);
        assert_eq!(session.finished.len(), FINISHED_CAPACITY);

        let extra = RequestId::new(FINISHED_CAPACITY as u64);
        session.record_grant(extra, claim());
        session.retire(extra);

        assert_eq!(session.state(reused), RequestState::Retired(claim()));
        assert_eq!(session.state(RequestId::new(1)), RequestState::Unknown);
        assert_eq!(session.finished.len(), session.finished_order.len());
    }

    #[test]
    fn tracker_close_is_once_only() {
        let mut tracker = SessionTracker::new();
        let id = SessionId::new();

        assert!(tracker.open(id));
        assert!(!tracker.open(id));
        assert_eq!(tracker.len(), 1);

        assert!(tracker.close(id).is_some());
        assert!(tracker.close(id).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn into_parts_yields_held_and_pending() {
        let mut session = Session::new(SessionId::new());
        session.record_grant(RequestId::new(1), claim());
        session.record_pending(RequestId::new(2), claim());
        session.record_grant(RequestId::new(3), claim());
        session.retire(RequestId::new(3));

        let (held, pending) = session.into_parts();
        assert_eq!(held.len(), 1);
        assert_eq!(pending.len(), 1);
        assert!(held.contains_key(&RequestId::new(1)));
        assert!(pending.contains_key(&RequestId::new(2)));
    }
}
