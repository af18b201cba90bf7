//! Wire bridge between clients and the arbiter.
//!
//! - **protocol**: message types and identifiers
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
