//! MCP tool server (C8): wire protocol, tool dispatcher, stdio and HTTP
//! transports for the containerize-and-deploy engine.

pub mod dispatcher;
pub mod protocol;
pub mod server;
pub mod tools;

pub use dispatcher::{get_all_tools, execute_tool, AppState, McpTool};
