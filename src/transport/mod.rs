//! Bindings that carry protocol frames between clients and a protocol server.

pub mod sse;
pub mod stdio;
pub mod streamable;
