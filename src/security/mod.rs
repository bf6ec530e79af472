//! Request admission: host normalization, per-client rate limiting and response hardening.

pub mod headers;
pub mod host;
pub mod rate_limit;
