//! Unity MCP Bridge
//!
//! Connects tool-calling clients to a running Unity Editor over a local TCP bridge.
//! The editor side hosts a `BridgeServer` that dispatches framed JSON requests to registered
//! tools; the client side uses a `DiscoveryClient` that finds the editor through the project's
//! port record and reconnects on its own whenever a Domain Reload restarts the server.

pub mod bridge_messages;
pub mod bridge_server;
pub mod builtin_tools;
pub mod config;
pub mod discovery_client;
pub mod frame_codec;
pub mod fs_utils;
pub mod lock_coordinator;
pub mod logging;
pub mod mcp_server;
pub mod pending_call_table;
pub mod tool_dispatcher;
pub mod unity_project_manager;

#[cfg(test)]
mod test_utils;

pub use bridge_messages::{BridgeError, ErrorBody, ErrorKind, Request, Response};
pub use bridge_server::{BridgeServer, ServerState};
pub use config::{ClientConfig, PortPolicy, ServerConfig};
pub use discovery_client::{ClientState, DiscoveryClient, DiscoveryContext, DiscoveryTarget};
pub use lock_coordinator::{LockCoordinator, LockMarker};
pub use tool_dispatcher::{Tool, ToolDispatcher, ToolError, ToolRegistry};
pub use unity_project_manager::{PortRecord, UnityProjectManager};
