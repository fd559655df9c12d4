//! Wire protocol implementations.
//!
//! - `resp`: Redis RESP protocol, the only protocol the harness speaks

pub mod resp;
