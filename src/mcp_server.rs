use crate::bridge_messages::{ErrorBody, ErrorKind, LIST_TOOLS_METHOD};
use crate::discovery_client::{ClientState, DiscoveryClient};
use log::info;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::*,
    schemars, tool, tool_handler, tool_router,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ExecuteToolRequest {
    #[schemars(description = "Name of the editor tool to run, as listed by list_unity_tools")]
    pub tool: String,
    #[schemars(description = "Parameters passed to the tool as a JSON object")]
    pub params: Option<Value>,
    #[schemars(
        description = "Optional timeout in seconds. The call fails with a Timeout error when the editor does not answer in time."
    )]
    pub timeout_seconds: Option<u64>,
}

/// MCP server that forwards tool calls to the Unity bridge
#[derive(Clone)]
pub struct UnityBridgeMcpServer {
    client: Arc<DiscoveryClient>,
    tool_router: ToolRouter<UnityBridgeMcpServer>,
}

#[tool_router]
impl UnityBridgeMcpServer {
    pub fn new(client: Arc<DiscoveryClient>) -> Self {
        Self {
            client,
            tool_router: Self::tool_router(),
        }
    }

    pub fn client(&self) -> &Arc<DiscoveryClient> {
        &self.client
    }

    /// Run a tool in the Unity Editor
    #[tool(
        description = "Run a tool inside the Unity Editor and return its result. Waits for the editor to come back if it is compiling or reloading scripts."
    )]
    async fn execute_unity_tool(
        &self,
        Parameters(ExecuteToolRequest {
            tool,
            params,
            timeout_seconds,
        }): Parameters<ExecuteToolRequest>,
    ) -> Result<CallToolResult, McpError> {
        let timeout = timeout_seconds.map(Duration::from_secs);
        let params = params.unwrap_or(Value::Null);
        info!("Executing Unity tool '{}'", tool);

        match self.client.call(&tool, params, timeout).await {
            Ok(result) => Ok(CallToolResult::success(vec![Content::text(result.to_string())])),
            Err(error) => error_to_result(error),
        }
    }

    /// List the tools registered in the Unity Editor
    #[tool(description = "List the tools the Unity Editor exposes, with whether each may run in parallel.")]
    async fn list_unity_tools(&self) -> Result<CallToolResult, McpError> {
        match self.client.call(LIST_TOOLS_METHOD, Value::Null, None).await {
            Ok(result) => Ok(CallToolResult::success(vec![Content::text(result.to_string())])),
            Err(error) => error_to_result(error),
        }
    }

    /// Report the state of the connection to the editor
    #[tool(description = "Report whether the Unity Editor is reachable and on which port.")]
    async fn get_bridge_status(&self) -> Result<CallToolResult, McpError> {
        let (state, port) = match self.client.state() {
            ClientState::Idle => ("idle", None),
            ClientState::Discovering => ("discovering", None),
            ClientState::Connected { port } => ("connected", Some(port)),
            ClientState::Reconnecting => ("reconnecting", None),
            ClientState::Shutdown => ("shutdown", None),
        };

        let status = json!({
            "state": state,
            "port": port,
            "target": self.client.target().to_string(),
            "last_reachable_port": self.client.context().last_reachable_port(self.client.target()),
            "pending_calls": self.client.pending_count(),
            "last_failure": self.client.last_failure(),
        });
        Ok(CallToolResult::success(vec![Content::text(status.to_string())]))
    }
}

/// Caller mistakes become protocol errors, everything else is reported to the assistant as a
/// failed tool result carrying the error kind
fn error_to_result(error: ErrorBody) -> Result<CallToolResult, McpError> {
    let data = serde_json::to_value(&error).ok();
    match error.kind {
        ErrorKind::UnknownTool | ErrorKind::InvalidParams => {
            Err(McpError::invalid_params(error.to_string(), data))
        }
        _ => Ok(CallToolResult::error(vec![Content::text(
            data.map(|data| data.to_string()).unwrap_or_else(|| error.to_string()),
        )])),
    }
}

#[tool_handler]
impl ServerHandler for UnityBridgeMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Bridge to a running Unity Editor. Use list_unity_tools to see what the editor offers and execute_unity_tool to run a tool."
                    .into(),
            ),
        }
    }
}
