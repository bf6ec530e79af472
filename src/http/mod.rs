//! HTTP surface: the `/mcp`, `/sse` and `/health` endpoints.

pub mod handlers;
