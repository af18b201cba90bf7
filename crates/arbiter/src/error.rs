//! Errors raised by the ledger and the arbiter.
//!
//! All of these are local to the request that caused them; none aborts the
//! arbiter or affects another session's accounting.

use crate::bridge::protocol::{ErrorKind, OperationClass, RequestId, ResourceKey, SessionId};
use crate::ledger::QuotaKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArbiterError {
    #[error("capacity underflow on {resource}/{class}: grant already released")]
    CapacityUnderflow {
        resource: ResourceKey,
        class: OperationClass,
    },

    #[error("request {request_id} is not a grant held by this session")]
    UnknownGrant { request_id: RequestId },

    #[error("request {request_id} is no longer pending")]
    NotFound { request_id: RequestId },

    #[error("request {request_id} is already in use by this session")]
    DuplicateRequest { request_id: RequestId },

    #[error("session {session} is not registered")]
    UnknownSession { session: SessionId },

    #[error("request {request_id} asks for {weight} units but {key} allows at most {limit}")]
    Unsatisfiable {
        request_id: RequestId,
        key: QuotaKey,
        weight: u32,
        limit: u32,
    },
}

impl ArbiterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityUnderflow { .. } => ErrorKind::CapacityUnderflow,
            Self::UnknownGrant { .. } => ErrorKind::UnknownGrant,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::DuplicateRequest { .. } => ErrorKind::DuplicateRequest,
            Self::UnknownSession { .. } => ErrorKind::UnknownSession,
            Self::Unsatisfiable { .. } => ErrorKind::Unsatisfiable,
        }
    }

    /// Whether this error is an expected race rather than client misuse.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
