//! RESP (Redis Serialization Protocol) implementation.
//!
//! Client side of RESP2: request encoding, reply framing, and the typed
//! `Reply` the rest of the harness works with.

pub mod parser;
mod reply;

pub use reply::Reply;
