//! arbiter: admission control for overload-sensitive shared backends.

mod arbiter;
mod error;
mod ledger;
mod session;

pub mod bridge;
pub mod client;
pub mod config;
pub mod service;
pub mod transport;

pub use arbiter::{Admission, Arbiter, Cancelled, Disconnected, Grant, PendingRequest, Reconfigured};
pub use bridge::protocol::{
    ClientMessage, EntryStats, ErrorKind, OperationClass, RequestId, ResourceKey, ServerMessage,
    SessionId, UNIT_WEIGHT,
};
pub use client::{AccessPermit, ArbiterClient, ClientError};
pub use config::{ConfigError, QuotaConfig};
pub use error::ArbiterError;
pub use ledger::{Ledger, QuotaKey};
pub use service::{ArbiterHandle, ServiceError, SessionGuard, spawn_arbiter};
pub use session::{Claim, RequestState, Session, SessionTracker};

pub const ARBITER_VERSION: &str = env!("CARGO_PKG_VERSION");
