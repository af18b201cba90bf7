//! ArbiterService: the single serialization point for admission events.
//!
//! One task owns the [`Arbiter`] and processes events from an unbounded
//! channel one at a time. Connections never touch arbiter state directly:
//! they submit events through a [`SessionGuard`] and receive responses on a
//! per-session outbound channel that the task fills without awaiting, so a
//! slow or stalled socket cannot hold up anyone else's admission.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::arbiter::{Admission, Arbiter, Grant, PendingRequest, Reconfigured};
use crate::bridge::codec::MalformedMessage;
use crate::bridge::protocol::{
    ClientMessage, EntryStats, ErrorKind, RequestId, ServerMessage, SessionId,
};
use crate::config::QuotaConfig;
use crate::error::ArbiterError;
use crate::ledger::QuotaKey;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("arbiter service has stopped")]
    Stopped,
}

enum Event {
    Connect {
        session: SessionId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    Message {
        session: SessionId,
        message: ClientMessage,
    },
    Reject {
        session: SessionId,
        malformed: MalformedMessage,
    },
    Disconnect {
        session: SessionId,
    },
    Stats {
        reply: oneshot::Sender<Vec<EntryStats>>,
    },
    Quotas {
        reply: oneshot::Sender<QuotaConfig>,
    },
}

/// Cloneable handle to a running arbiter task.
///
/// The task exits once every handle and every [`SessionGuard`] is gone.
#[derive(Clone)]
pub struct ArbiterHandle {
    events: mpsc::UnboundedSender<Event>,
}

/// Start the arbiter task.
pub fn spawn_arbiter(quotas: QuotaConfig) -> (ArbiterHandle, JoinHandle<()>) {
    let (events, events_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_event_loop(Arbiter::new(quotas), events_rx));
    (ArbiterHandle { events }, task)
}

impl ArbiterHandle {
    /// Register a new session. Responses for it arrive on the returned receiver.
    pub fn open_session(
        &self,
    ) -> Result<(SessionGuard, mpsc::UnboundedReceiver<ServerMessage>), ServiceError> {
        let session = SessionId::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.events
            .send(Event::Connect { session, outbound })
            .map_err(|_| ServiceError::Stopped)?;

        let guard = SessionGuard {
            session,
            events: self.events.clone(),
        };
        Ok((guard, outbound_rx))
    }

    pub async fn stats(&self) -> Result<Vec<EntryStats>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Stats { reply })
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn quotas(&self) -> Result<QuotaConfig, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Quotas { reply })
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }
}

/// A connection's membership in the arbiter.
///
/// Dropping the guard sends exactly one disconnect, which releases every
/// grant and cancels every pending request the session still has. This holds
/// however the connection ends: clean close, I/O error, or task abort.
pub struct SessionGuard {
    session: SessionId,
    events: mpsc::UnboundedSender<Event>,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.session
    }

    pub fn submit(&self, message: ClientMessage) -> Result<(), ServiceError> {
        self.events
            .send(Event::Message {
                session: self.session,
                message,
            })
            .map_err(|_| ServiceError::Stopped)
    }

    /// Report a frame that could not be decoded.
    pub fn reject(&self, malformed: MalformedMessage) -> Result<(), ServiceError> {
        self.events
            .send(Event::Reject {
                session: self.session,
                malformed,
            })
            .map_err(|_| ServiceError::Stopped)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // If the task is gone there is no state left to clean up.
        let _ = self.events.send(Event::Disconnect {
            session: self.session,
        });
    }
}

type Outbound = HashMap<SessionId, mpsc::UnboundedSender<ServerMessage>>;

async fn run_event_loop(mut arbiter: Arbiter, mut events_rx: mpsc::UnboundedReceiver<Event>) {
    let mut outbound: Outbound = HashMap::new();

    while let Some(event) = events_rx.recv().await {
        match event {
            Event::Connect {
                session,
                outbound: tx,
            } => {
                if !arbiter.open_session(session) {
                    debug_assert!(false, "session {session} registered twice");
                    tracing::error!(%session, "Bug: session registered twice");
                    continue;
                }
                outbound.insert(session, tx);
                tracing::debug!(%session, sessions = arbiter.session_count(), "Session opened");
            }
            Event::Message { session, message } => {
                handle_message(&mut arbiter, &outbound, session, message);
            }
            Event::Reject { session, malformed } => {
                tracing::warn!(
                    %session,
                    request_id = ?malformed.request_id,
                    reason = %malformed.reason,
                    "Malformed message"
                );
                deliver(
                    &outbound,
                    session,
                    ServerMessage::Error {
                        request_id: malformed.request_id,
                        kind: ErrorKind::MalformedMessage,
                        message: malformed.reason,
                    },
                );
            }
            Event::Disconnect { session } => {
                outbound.remove(&session);
                if let Some(outcome) = arbiter.disconnect(session) {
                    if outcome.released > 0 || outcome.cancelled > 0 {
                        tracing::info!(
                            %session,
                            released = outcome.released,
                            cancelled = outcome.cancelled,
                            "Reclaimed capacity from disconnected session"
                        );
                    }
                    deliver_grants(&outbound, outcome.granted);
                }
            }
            Event::Stats { reply } => {
                let _ = reply.send(arbiter.stats());
            }
            Event::Quotas { reply } => {
                let _ = reply.send(arbiter.quotas().clone());
            }
        }
    }

    tracing::debug!("Arbiter event loop exiting");
}

fn handle_message(
    arbiter: &mut Arbiter,
    outbound: &Outbound,
    session: SessionId,
    message: ClientMessage,
) {
    let request_id = message.request_id();
    tracing::trace!(%session, %request_id, kind = message.kind(), "Client message");

    match message {
        ClientMessage::Acquire {
            request_id,
            resource,
            class,
            weight,
        } => match arbiter.acquire_weighted(
            session,
            request_id,
            QuotaKey { resource, class },
            weight,
        ) {
            Ok(Admission::Granted(grant)) => deliver_grants(outbound, vec![grant]),
            Ok(Admission::Queued { .. }) => {}
            Err(err) => reply_error(outbound, session, request_id, err),
        },
        ClientMessage::Release { request_id } => match arbiter.release(session, request_id) {
            Ok(granted) => {
                deliver(outbound, session, ServerMessage::Ack { request_id });
                deliver_grants(outbound, granted);
            }
            Err(err) => reply_error(outbound, session, request_id, err),
        },
        ClientMessage::Cancel { request_id } => match arbiter.cancel(session, request_id) {
            Ok(cancelled) => {
                deliver(outbound, session, ServerMessage::Ack { request_id });
                deliver_grants(outbound, cancelled.granted);
            }
            Err(err) => reply_error(outbound, session, request_id, err),
        },
        ClientMessage::ReadConfig { request_id } => {
            let config = arbiter.quotas().clone();
            deliver(outbound, session, ServerMessage::Config { request_id, config });
        }
        ClientMessage::Configure { request_id, config } => {
            tracing::info!(%session, "Quota table replaced");
            let Reconfigured { granted, rejected } = arbiter.replace_quotas(config);
            let config = arbiter.quotas().clone();
            deliver(outbound, session, ServerMessage::Config { request_id, config });
            deliver_grants(outbound, granted);
            reject_waiters(arbiter, outbound, rejected);
        }
        ClientMessage::Stats { request_id } => {
            let entries = arbiter.stats();
            deliver(outbound, session, ServerMessage::Stats { request_id, entries });
        }
    }
}

fn reply_error(
    outbound: &Outbound,
    session: SessionId,
    request_id: RequestId,
    err: ArbiterError,
) {
    if err.is_expected() {
        tracing::debug!(%session, %request_id, error = %err, "Request rejected");
    } else {
        tracing::warn!(%session, %request_id, error = %err, "Request rejected");
    }
    deliver(
        outbound,
        session,
        ServerMessage::Error {
            request_id: Some(request_id),
            kind: err.kind(),
            message: err.to_string(),
        },
    );
}

/// Tell waiters evicted by a quota change that they will never be granted.
fn reject_waiters(arbiter: &Arbiter, outbound: &Outbound, rejected: Vec<PendingRequest>) {
    for waiter in rejected {
        let err = ArbiterError::Unsatisfiable {
            request_id: waiter.request_id,
            limit: arbiter.quotas().limit_for(&waiter.key.resource, &waiter.key.class),
            key: waiter.key,
            weight: waiter.weight,
        };
        deliver(
            outbound,
            waiter.session_id,
            ServerMessage::Error {
                request_id: Some(waiter.request_id),
                kind: err.kind(),
                message: err.to_string(),
            },
        );
    }
}

fn deliver_grants(outbound: &Outbound, grants: Vec<Grant>) {
    for grant in grants {
        deliver(
            outbound,
            grant.session_id,
            ServerMessage::Grant {
                request_id: grant.request_id,
            },
        );
    }
}

fn deliver(outbound: &Outbound, session: SessionId, message: ServerMessage) {
    let Some(tx) = outbound.get(&session) else {
        tracing::debug!(%session, "Dropping message for closed session");
        return;
    };
    // A closed writer means the disconnect event is already queued behind us;
    // the grant is reclaimed when it arrives.
    if tx.send(message).is_err() {
        tracing::debug!(%session, "Session writer gone");
    }
}
