//! Wire protocol types for client-arbiter communication.
//!
//! One logical request per frame. Every client message carries a
//! client-chosen `request_id`; every server message echoes it so the client
//! can route responses to the caller waiting on them.

use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::config::QuotaConfig;

/// Identifier of one connected client, assigned by the server on accept.
///
/// UUID v4 so log lines from different connections never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen request token, scoped to the session that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contended backend instance, typically a host or host:port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A category of operation sharing one quota ("read", "write", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationClass(String);

impl OperationClass {
    pub fn new(class: impl Into<String>) -> Self {
        Self(class.into())
    }

    pub fn read() -> Self {
        Self::new("read")
    }

    pub fn write() -> Self {
        Self::new("write")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationClass {
    fn from(class: &str) -> Self {
        Self::new(class)
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages from client to arbiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for `weight` units of capacity (one when omitted). Answered by
    /// `Grant` (possibly much later) or `Error`.
    Acquire {
        request_id: RequestId,
        resource: ResourceKey,
        class: OperationClass,
        #[serde(default = "unit_weight", skip_serializing_if = "is_unit_weight")]
        weight: NonZeroU32,
    },

    /// Return the grant issued for `request_id`.
    Release { request_id: RequestId },

    /// Withdraw an acquire that has not been granted yet.
    Cancel { request_id: RequestId },

    ReadConfig { request_id: RequestId },

    /// Replace the quota table. Already-granted capacity is never revoked.
    Configure {
        request_id: RequestId,
        config: QuotaConfig,
    },

    Stats { request_id: RequestId },
}

/// Weight of an acquire that does not name one.
pub const UNIT_WEIGHT: NonZeroU32 = NonZeroU32::MIN;

fn unit_weight() -> NonZeroU32 {
    UNIT_WEIGHT
}

fn is_unit_weight(weight: &NonZeroU32) -> bool {
    *weight == UNIT_WEIGHT
}

impl ClientMessage {
    /// Single-unit acquire.
    pub fn acquire(
        request_id: RequestId,
        resource: impl Into<ResourceKey>,
        class: impl Into<OperationClass>,
    ) -> Self {
        Self::Acquire {
            request_id,
            resource: resource.into(),
            class: class.into(),
            weight: UNIT_WEIGHT,
        }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Acquire { request_id, .. }
            | Self::Release { request_id }
            | Self::Cancel { request_id }
            | Self::ReadConfig { request_id }
            | Self::Configure { request_id, .. }
            | Self::Stats { request_id } => *request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Acquire { .. } => "acquire",
            Self::Release { .. } => "release",
            Self::Cancel { .. } => "cancel",
            Self::ReadConfig { .. } => "read_config",
            Self::Configure { .. } => "configure",
            Self::Stats { .. } => "stats",
        }
    }
}

/// Messages from arbiter to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Capacity is held on behalf of the acquire with this id.
    Grant { request_id: RequestId },

    /// Release or cancel accepted.
    Ack { request_id: RequestId },

    /// Request rejected. `request_id` is null when the frame was too broken to recover it.
    Error {
        request_id: Option<RequestId>,
        kind: ErrorKind,
        message: String,
    },

    /// Current quota table (answer to `read_config` and `configure`).
    Config {
        request_id: RequestId,
        config: QuotaConfig,
    },

    Stats {
        request_id: RequestId,
        entries: Vec<EntryStats>,
    },
}

impl ServerMessage {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Grant { request_id }
            | Self::Ack { request_id }
            | Self::Config { request_id, .. }
            | Self::Stats { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
        }
    }
}

/// Client-visible error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Double release: the grant was already returned.
    CapacityUnderflow,
    /// The request id does not name a grant or request owned by this session.
    UnknownGrant,
    /// Cancel raced a grant (or an earlier cancel). Expected, non-fatal.
    NotFound,
    /// The request id is already in use by a live request of this session.
    DuplicateRequest,
    /// The session is not registered with the arbiter.
    UnknownSession,
    /// The acquire asks for more than the configured limit and can never be granted.
    Unsatisfiable,
    /// The frame could not be decoded into a client message.
    MalformedMessage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapacityUnderflow => "capacity_underflow",
            Self::UnknownGrant => "unknown_grant",
            Self::NotFound => "not_found",
            Self::DuplicateRequest => "duplicate_request",
            Self::UnknownSession => "unknown_session",
            Self::Unsatisfiable => "unsatisfiable",
            Self::MalformedMessage => "malformed_message",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time accounting for one (resource, class) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStats {
    pub resource: ResourceKey,
    pub class: OperationClass,
    /// Configured ceiling; 0 means unlimited.
    pub limit: u32,
    pub in_flight: u32,
    pub queued: usize,
    /// How long the head of the wait queue has been waiting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_wait_ms: Option<u64>,
}
