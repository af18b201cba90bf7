//! Transport layer for the arbiter.
//!
//! Length-prefixed JSON over TCP. Session identity is the connection.

pub mod tcp;

pub use tcp::{ServerConfig, serve, serve_listener, shutdown_signal};
