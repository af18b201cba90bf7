//! Admission arbiter: the scheduling core.
//!
//! Owns the ledger, the per-(resource, class) wait queues and the session
//! tracker. Every operation is a synchronous `&mut self` step, so capacity
//! checks, increments and session bookkeeping happen atomically with respect
//! to each other. The async service in [`crate::service`] is the only caller
//! in production.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::num::NonZeroU32;
use std::time::Instant;

use crate::bridge::protocol::{
    EntryStats, OperationClass, RequestId, ResourceKey, SessionId, UNIT_WEIGHT,
};
use crate::config::QuotaConfig;
use crate::error::ArbiterError;
use crate::ledger::{Ledger, QuotaKey};
use crate::session::{Claim, RequestState, Session, SessionTracker};

/// Capacity held on behalf of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub key: QuotaKey,
    pub weight: u32,
}

/// An acquire waiting for capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub key: QuotaKey,
    pub weight: u32,
    pub enqueued_at: Instant,
}

impl PendingRequest {
    fn to_grant(&self) -> Grant {
        Grant {
            request_id: self.request_id,
            session_id: self.session_id,
            key: self.key.clone(),
            weight: self.weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted(Grant),
    /// 1-based position in the wait queue at the time of enqueueing.
    Queued { position: usize },
}

/// A withdrawn waiter, plus whoever its departure unblocked.
#[derive(Debug, PartialEq, Eq)]
pub struct Cancelled {
    pub request: PendingRequest,
    pub granted: Vec<Grant>,
}

/// What tearing down a session did.
#[derive(Debug, Default)]
pub struct Disconnected {
    pub released: usize,
    pub cancelled: usize,
    /// Waiters of other sessions admitted by the freed capacity.
    pub granted: Vec<Grant>,
}

/// What changing the quota table did to the wait queues.
#[derive(Debug, Default)]
pub struct Reconfigured {
    pub granted: Vec<Grant>,
    /// Waiters whose weight exceeds the new limit. They have been withdrawn
    /// from their sessions and must be told.
    pub rejected: Vec<PendingRequest>,
}

pub struct Arbiter {
    ledger: Ledger,
    queues: HashMap<QuotaKey, VecDeque<PendingRequest>>,
    sessions: SessionTracker,
}

impl Arbiter {
    pub fn new(quotas: QuotaConfig) -> Self {
        Self {
            ledger: Ledger::new(quotas),
            queues: HashMap::new(),
            sessions: SessionTracker::new(),
        }
    }

    /// Register a session. Returns false if the id is already registered.
    pub fn open_session(&mut self, session_id: SessionId) -> bool {
        self.sessions.open(session_id)
    }

    pub fn session(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Single-unit acquire.
    pub fn acquire(
        &mut self,
        session_id: SessionId,
        request_id: RequestId,
        key: QuotaKey,
    ) -> Result<Admission, ArbiterError> {
        self.acquire_weighted(session_id, request_id, key, UNIT_WEIGHT)
    }

    /// Grant immediately if `weight` units fit and nobody is waiting, else
    /// enqueue. A weight above a finite limit is rejected outright.
    pub fn acquire_weighted(
        &mut self,
        session_id: SessionId,
        request_id: RequestId,
        key: QuotaKey,
        weight: NonZeroU32,
    ) -> Result<Admission, ArbiterError> {
        let weight = weight.get();
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Err(ArbiterError::UnknownSession {
                session: session_id,
            });
        };
        if session.is_live(request_id) {
            return Err(ArbiterError::DuplicateRequest { request_id });
        }
        if !self.ledger.can_ever_fit(&key, weight) {
            return Err(ArbiterError::Unsatisfiable {
                request_id,
                limit: self.ledger.limit(&key),
                key,
                weight,
            });
        }

        let nobody_waiting = self.queues.get(&key).is_none_or(VecDeque::is_empty);
        if nobody_waiting && self.ledger.try_increment(&key, weight) {
            session.record_grant(request_id, Claim::new(key.clone(), weight));
            tracing::debug!(
                session = %session_id,
                %request_id,
                %key,
                weight,
                "Granted immediately"
            );
            return Ok(Admission::Granted(Grant {
                request_id,
                session_id,
                key,
                weight,
            }));
        }

        session.record_pending(request_id, Claim::new(key.clone(), weight));
        let queue = self.queues.entry(key.clone()).or_default();
        queue.push_back(PendingRequest {
            request_id,
            session_id,
            key: key.clone(),
            weight,
            enqueued_at: Instant::now(),
        });
        let position = queue.len();
        tracing::debug!(session = %session_id, %request_id, %key, weight, position, "Queued");
        Ok(Admission::Queued { position })
    }

    /// Return a held grant and admit waiters the freed capacity allows.
    pub fn release(
        &mut self,
        session_id: SessionId,
        request_id: RequestId,
    ) -> Result<Vec<Grant>, ArbiterError> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Err(ArbiterError::UnknownSession {
                session: session_id,
            });
        };

        match session.state(request_id) {
            RequestState::Held(claim) => {
                session.retire(request_id);
                self.return_capacity(&claim);
                tracing::debug!(session = %session_id, %request_id, key = %claim.key, "Released");
                Ok(self.pump(&claim.key))
            }
            RequestState::Retired(claim) => Err(ArbiterError::CapacityUnderflow {
                resource: claim.key.resource,
                class: claim.key.class,
            }),
            RequestState::Pending(_) | RequestState::Withdrawn(_) | RequestState::Unknown => {
                Err(ArbiterError::UnknownGrant { request_id })
            }
        }
    }

    /// Withdraw a request that is still waiting.
    pub fn cancel(
        &mut self,
        session_id: SessionId,
        request_id: RequestId,
    ) -> Result<Cancelled, ArbiterError> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Err(ArbiterError::UnknownSession {
                session: session_id,
            });
        };

        let key = match session.state(request_id) {
            RequestState::Pending(claim) => claim.key,
            RequestState::Held(_) | RequestState::Retired(_) | RequestState::Withdrawn(_) => {
                return Err(ArbiterError::NotFound { request_id });
            }
            RequestState::Unknown => return Err(ArbiterError::UnknownGrant { request_id }),
        };
        session.withdraw(request_id);

        let removed = self.queues.get_mut(&key).and_then(|queue| {
            let index = queue
                .iter()
                .position(|p| p.session_id == session_id && p.request_id == request_id)?;
            queue.remove(index)
        });
        if self.queues.get(&key).is_some_and(VecDeque::is_empty) {
            self.queues.remove(&key);
        }

        match removed {
            Some(request) => {
                tracing::debug!(session = %session_id, %request_id, %key, "Cancelled");
                // A heavy head may have been holding back lighter waiters.
                let granted = self.pump(&key);
                Ok(Cancelled { request, granted })
            }
            None => {
                debug_assert!(false, "pending request {request_id} missing from queue {key}");
                tracing::error!(
                    session = %session_id,
                    %request_id,
                    %key,
                    "Bug: pending request missing from its wait queue"
                );
                Err(ArbiterError::NotFound { request_id })
            }
        }
    }

    /// Cancel everything the session is waiting for, then release everything
    /// it holds. Only the first call for a session does anything.
    pub fn disconnect(&mut self, session_id: SessionId) -> Option<Disconnected> {
        let session = self.sessions.close(session_id)?;
        let connected_for = chrono::Utc::now() - session.opened_at();
        let (held, pending) = session.into_parts();

        let mut touched: BTreeSet<QuotaKey> = BTreeSet::new();
        for Claim { key, .. } in pending.values() {
            if touched.insert(key.clone())
                && let Some(queue) = self.queues.get_mut(key)
            {
                queue.retain(|p| p.session_id != session_id);
                if queue.is_empty() {
                    self.queues.remove(key);
                }
            }
        }
        for claim in held.values() {
            self.return_capacity(claim);
            touched.insert(claim.key.clone());
        }

        let mut granted = Vec::new();
        for key in &touched {
            granted.extend(self.pump(key));
        }

        tracing::debug!(
            session = %session_id,
            released = held.len(),
            cancelled = pending.len(),
            admitted = granted.len(),
            total_in_flight = self.ledger.total_in_flight(),
            connected_secs = connected_for.num_seconds(),
            "Session cleaned up"
        );
        Some(Disconnected {
            released: held.len(),
            cancelled: pending.len(),
            granted,
        })
    }

    /// Set one ceiling. Waiters a lower limit can never admit are rejected;
    /// waiters a higher limit allows are granted.
    pub fn configure(
        &mut self,
        resource: ResourceKey,
        class: OperationClass,
        limit: u32,
    ) -> Reconfigured {
        let key = QuotaKey {
            resource: resource.clone(),
            class: class.clone(),
        };
        self.ledger.configure(resource, class, limit);
        Reconfigured {
            rejected: self.evict_unsatisfiable(&key),
            granted: self.pump(&key),
        }
    }

    /// Swap the whole quota table and re-run admission on every queue.
    pub fn replace_quotas(&mut self, quotas: QuotaConfig) -> Reconfigured {
        self.ledger.replace_quotas(quotas);
        let keys: BTreeSet<QuotaKey> = self.queues.keys().cloned().collect();
        let mut outcome = Reconfigured::default();
        for key in &keys {
            outcome.rejected.extend(self.evict_unsatisfiable(key));
            outcome.granted.extend(self.pump(key));
        }
        outcome
    }

    pub fn quotas(&self) -> &QuotaConfig {
        self.ledger.quotas()
    }

    pub fn in_flight(&self, key: &QuotaKey) -> u32 {
        self.ledger.in_flight(key)
    }

    pub fn queued(&self, key: &QuotaKey) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }

    /// Accounting for every (resource, class) with holders or waiters, sorted.
    pub fn stats(&self) -> Vec<EntryStats> {
        let mut active: BTreeMap<&QuotaKey, u32> = self.ledger.entries().collect();
        for key in self.queues.keys() {
            active.entry(key).or_insert(0);
        }

        active
            .into_iter()
            .map(|(key, in_flight)| {
                let queue = self.queues.get(key);
                let oldest_wait_ms = queue.and_then(VecDeque::front).map(|head| {
                    u64::try_from(head.enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX)
                });
                EntryStats {
                    resource: key.resource.clone(),
                    class: key.class.clone(),
                    limit: self.ledger.limit(key),
                    in_flight,
                    queued: queue.map_or(0, VecDeque::len),
                    oldest_wait_ms,
                }
            })
            .collect()
    }

    fn return_capacity(&mut self, claim: &Claim) {
        if let Err(err) = self.ledger.decrement(&claim.key, claim.weight) {
            let key = &claim.key;
            debug_assert!(false, "held grant on {key} had no ledger count");
            tracing::error!(
                %key,
                weight = claim.weight,
                error = %err,
                "Bug: held grant had no ledger count"
            );
        }
    }

    /// Drop waiters on `key` whose weight no longer fits under its limit.
    fn evict_unsatisfiable(&mut self, key: &QuotaKey) -> Vec<PendingRequest> {
        let Some(queue) = self.queues.get_mut(key) else {
            return Vec::new();
        };
        let (keep, evicted): (VecDeque<_>, VecDeque<_>) = queue
            .drain(..)
            .partition(|waiter| self.ledger.can_ever_fit(key, waiter.weight));
        *queue = keep;
        if queue.is_empty() {
            self.queues.remove(key);
        }

        for waiter in &evicted {
            if let Some(session) = self.sessions.get_mut(waiter.session_id) {
                session.withdraw(waiter.request_id);
            }
            tracing::info!(
                session = %waiter.session_id,
                request_id = %waiter.request_id,
                %key,
                weight = waiter.weight,
                limit = self.ledger.limit(key),
                "Waiter can no longer be admitted"
            );
        }
        evicted.into()
    }

    /// Grant waiters from the head of the queue while the head fits. A head
    /// that does not fit blocks everyone behind it.
    fn pump(&mut self, key: &QuotaKey) -> Vec<Grant> {
        let mut granted = Vec::new();
        let Some(queue) = self.queues.get_mut(key) else {
            return granted;
        };

        while let Some(head) = queue.front()
            && self.ledger.has_capacity(key, head.weight)
        {
            let Some(waiter) = queue.pop_front() else {
                break;
            };
            let promoted = self
                .sessions
                .get_mut(waiter.session_id)
                .is_some_and(|session| session.promote(waiter.request_id));
            if !promoted {
                debug_assert!(false, "queued request {} has no session", waiter.request_id);
                tracing::error!(
                    session = %waiter.session_id,
                    request_id = %waiter.request_id,
                    %key,
                    "Bug: queued request without a pending entry in its session"
                );
                continue;
            }
            self.ledger.increment(key, waiter.weight);
            tracing::debug!(
                session = %waiter.session_id,
                request_id = %waiter.request_id,
                %key,
                weight = waiter.weight,
                waited_ms = u64::try_from(waiter.enqueued_at.elapsed().as_millis())
                    .unwrap_or(u64::MAX),
                "Granted from queue"
            );
            granted.push(waiter.to_grant());
        }

        if queue.is_empty() {
            self.queues.remove(key);
        }
        granted
    }
}
