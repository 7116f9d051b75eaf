//! memkeep-mcp: MCP (Model Context Protocol) server for memkeep.
//!
//! Exposes the memory engine as six MCP tools over stdio or streamable HTTP.

pub mod server;
pub mod tools;

pub use server::{MemoryServer, serve_http, serve_stdio};
pub use tools::MemoryTools;
