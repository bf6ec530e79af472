//! Model Context Protocol (MCP) server handling and JSON-RPC implementations
//!
//! Provides the protocol server handed to each transport, plus JSON-RPC envelope helpers.

pub mod rpc;
pub mod server;
