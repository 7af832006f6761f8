//! MCP tools exposed by the containerize-assist engine (spec §6).

pub mod containerize;
pub mod session;
pub mod system;
