//! Tool handlers
//!
//! Thin glue between MCP tool calls and the mail provider.

pub mod tools;
