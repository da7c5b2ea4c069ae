use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::tool_dispatcher::{RegistryError, Tool, ToolDispatcher, ToolError, ToolRegistry};

/// Liveness check, safe to run alongside anything
pub struct PingTool;

#[async_trait]
impl Tool for PingTool {
    fn name(&self) -> &str {
        "ping"
    }

    fn allow_parallel(&self) -> bool {
        true
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn execute(&self, _params: Value, _cancel: CancellationToken) -> Result<Value, ToolError> {
        Ok(json!({
            "pong": true,
            "processId": std::process::id(),
            "timestamp": chrono::Utc::now(),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EchoParams {
    message: Value,
    /// Simulated work before answering
    #[serde(default)]
    delay_ms: u64,
}

/// Returns its `message` parameter, optionally after `delayMs`
///
/// Not parallel-safe, so overlapping calls queue up like a real editor operation would.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, params: Value, cancel: CancellationToken) -> Result<Value, ToolError> {
        let EchoParams { message, delay_ms } = serde_json::from_value(params)?;

        if delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            }
        }
        Ok(json!({ "message": message }))
    }
}

/// Registry holding the built-in tools
pub fn builtin_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(PingTool)?.register(EchoTool)?;
    Ok(registry)
}

/// Dispatcher serving only the built-in tools
pub fn builtin_dispatcher() -> Result<ToolDispatcher, RegistryError> {
    Ok(builtin_registry()?.build())
}
