//! Routes requests to registered tools
//!
//! Each tool declares whether it may run concurrently with itself. Calls to a tool that does not
//! allow parallel execution are serialized per tool name, while different tools still run
//! concurrently.
//!
//! Queue positions are taken by `ToolDispatcher::admit`, which is synchronous, so calls to a
//! serialized tool start in the order they were admitted no matter how the tasks running them
//! are scheduled.
//!
//! Cancellation is cooperative. At the deadline the dispatcher cancels the tool's token, answers
//! with `Timeout` and releases the tool's lock. A tool that never checks its token keeps running
//! in the background until it finishes on its own; its eventual result is discarded.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::bridge_messages::{ErrorBody, ErrorKind, LIST_TOOLS_METHOD, Request, RequestId, Response};
use crate::config::DEFAULT_TOOL_TIMEOUT_SECS;
use crate::{debug_log, warn_log};

/// An editor operation that can be invoked by name
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique method name of the tool
    fn name(&self) -> &str;

    /// Whether several calls of this tool may run at the same time
    fn allow_parallel(&self) -> bool {
        false
    }

    /// Deadline used when a request doesn't carry one
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS)
    }

    /// Runs the tool
    ///
    /// Long-running tools should check `cancel` between steps and return
    /// `ToolError::Cancelled` once it fires.
    async fn execute(&self, params: Value, cancel: CancellationToken) -> Result<Value, ToolError>;
}

/// Errors a tool can report
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
    #[error("Cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn invalid_params(message: impl Display) -> Self {
        ToolError::InvalidParams(message.to_string())
    }

    pub fn failed(message: impl Display) -> Self {
        ToolError::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(error: serde_json::Error) -> Self {
        ToolError::InvalidParams(error.to_string())
    }
}

/// Static description of a registered tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRegistration {
    pub name: String,
    pub allow_parallel: bool,
    pub default_timeout: Duration,
}

impl ToolRegistration {
    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "allowParallel": self.allow_parallel,
            "defaultTimeoutMs": self.default_timeout.as_millis() as u64,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),
    #[error("Tool name '{0}' is reserved")]
    ReservedName(String),
}

/// Collects tools before the server starts
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool, names must be unique
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<&mut Self, RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    /// Adds a shared tool, names must be unique
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<&mut Self, RegistryError> {
        let name = tool.name();
        if name.starts_with("$/") {
            return Err(RegistryError::ReservedName(name.to_string()));
        }
        if self.tools.iter().any(|existing| existing.name() == name) {
            return Err(RegistryError::DuplicateTool(name.to_string()));
        }
        self.tools.push(tool);
        Ok(self)
    }

    /// Freezes the registry into a dispatcher
    pub fn build(self) -> ToolDispatcher {
        let tools = self
            .tools
            .into_iter()
            .map(|tool| {
                let registration = ToolRegistration {
                    name: tool.name().to_string(),
                    allow_parallel: tool.allow_parallel(),
                    default_timeout: tool.default_timeout(),
                };
                let gate = (!registration.allow_parallel).then(ToolQueue::default);
                (
                    registration.name.clone(),
                    RegisteredTool {
                        tool,
                        registration,
                        gate,
                    },
                )
            })
            .collect();
        ToolDispatcher { tools }
    }
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    registration: ToolRegistration,
    /// Orders the calls of a tool that doesn't allow parallel execution
    gate: Option<ToolQueue>,
}

/// FIFO of calls to one serialized tool
///
/// Every admitted call chains onto the previous one: it may start once the call before it has
/// dropped its `Turn`.
#[derive(Default)]
struct ToolQueue {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ToolQueue {
    fn enqueue(&self) -> Turn {
        let (release, next) = oneshot::channel();
        let previous = match self.tail.lock() {
            Ok(mut tail) => tail.replace(next),
            Err(poisoned) => poisoned.into_inner().replace(next),
        };
        Turn {
            previous,
            release: Some(release),
        }
    }
}

/// Place of one call in a `ToolQueue`, the next call starts when this is dropped
struct Turn {
    /// Finishes when the call before this one is done, `None` once it has
    previous: Option<oneshot::Receiver<()>>,
    release: Option<oneshot::Sender<()>>,
}

impl Turn {
    async fn wait(&mut self) {
        if let Some(previous) = self.previous.as_mut() {
            // Only ever dropped, never sent on
            let _ = previous.await;
        }
        self.previous = None;
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        // Gave up before its turn: the next call still has to wait for the one before us
        if let (Some(previous), Some(release)) = (self.previous.take(), self.release.take()) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = previous.await;
                    drop(release);
                });
            }
        }
    }
}

/// A request that holds its place in line, produced by `ToolDispatcher::admit`
pub struct Admission {
    id: RequestId,
    call: Result<AdmittedCall, Response>,
}

struct AdmittedCall {
    name: String,
    tool: Arc<dyn Tool>,
    params: Value,
    timeout: Duration,
    deadline: Instant,
    turn: Option<Turn>,
}

/// Dispatches requests to tools, immutable once built
pub struct ToolDispatcher {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolDispatcher {
    /// Registrations of all tools, sorted by name
    pub fn registrations(&self) -> Vec<ToolRegistration> {
        let mut registrations: Vec<ToolRegistration> = self
            .tools
            .values()
            .map(|entry| entry.registration.clone())
            .collect();
        registrations.sort_by(|a, b| a.name.cmp(&b.name));
        registrations
    }

    /// Registration of a single tool
    pub fn registration(&self, name: &str) -> Option<&ToolRegistration> {
        self.tools.get(name).map(|entry| &entry.registration)
    }

    /// Runs the request and produces its response, never fails
    ///
    /// `cancel` is owned by the caller (the connection); cancelling it aborts the wait and yields
    /// a `Cancelled` response.
    pub async fn dispatch(&self, request: Request, cancel: CancellationToken) -> Response {
        self.admit(request).run(cancel).await
    }

    /// Resolves the request and takes its place in the tool's queue
    ///
    /// Calls admitted one after another start in that order. The deadline starts counting here,
    /// so it covers time spent queueing behind other calls of the same tool.
    pub fn admit(&self, request: Request) -> Admission {
        let id = request.id;

        if request.method == LIST_TOOLS_METHOD {
            let tools: Vec<Value> = self.registrations().iter().map(ToolRegistration::to_json).collect();
            return Admission {
                id,
                call: Err(Response::success(id, json!({ "tools": tools }))),
            };
        }

        let Some(entry) = self.tools.get(&request.method) else {
            return Admission {
                id,
                call: Err(Response::error(
                    id,
                    ErrorBody::new(
                        ErrorKind::UnknownTool,
                        format!("Unknown tool '{}'", request.method),
                    ),
                )),
            };
        };

        let timeout = request.timeout().unwrap_or(entry.registration.default_timeout);
        Admission {
            id,
            call: Ok(AdmittedCall {
                name: entry.registration.name.clone(),
                tool: Arc::clone(&entry.tool),
                params: request.params,
                timeout,
                deadline: Instant::now() + timeout,
                turn: entry.gate.as_ref().map(ToolQueue::enqueue),
            }),
        }
    }
}

impl Admission {
    /// Request this admission answers
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the call's turn, runs it and produces its response, never fails
    pub async fn run(self, cancel: CancellationToken) -> Response {
        let id = self.id;
        let AdmittedCall {
            name,
            tool,
            params,
            timeout,
            deadline,
            mut turn,
        } = match self.call {
            Ok(call) => call,
            Err(response) => return response,
        };

        // Held until the response is produced, the next call of the tool starts after that
        if let Some(turn) = turn.as_mut() {
            tokio::select! {
                _ = turn.wait() => {}
                _ = sleep_until(deadline) => {
                    warn_log!("Request {} timed out after {:?} waiting for tool '{}'", id, timeout, name);
                    return Response::error(id, timeout_error(&name, timeout));
                }
                _ = cancel.cancelled() => {
                    return Response::error(id, cancelled_error(&name));
                }
            }
        }

        debug_log!("Executing tool '{}' for request {}", name, id);

        let token = cancel.child_token();
        let execution_token = token.clone();
        let mut execution = tokio::spawn(async move { tool.execute(params, execution_token).await });

        let response = tokio::select! {
            biased;
            joined = &mut execution => match joined {
                Ok(Ok(result)) => Response::success(id, result),
                Ok(Err(ToolError::InvalidParams(message))) => {
                    Response::error(id, ErrorBody::new(ErrorKind::InvalidParams, message))
                }
                Ok(Err(ToolError::Failed(message))) => {
                    Response::error(id, ErrorBody::new(ErrorKind::ToolFailed, message))
                }
                Ok(Err(ToolError::Cancelled)) => Response::error(id, cancelled_error(&name)),
                Err(join_error) => {
                    warn_log!("Tool '{}' crashed while handling request {}: {}", name, id, join_error);
                    Response::error(
                        id,
                        ErrorBody::new(ErrorKind::ToolFailed, format!("Tool '{}' panicked", name)),
                    )
                }
            },
            _ = sleep_until(deadline) => {
                token.cancel();
                warn_log!(
                    "Request {} to tool '{}' timed out after {:?}, execution abandoned",
                    id, name, timeout
                );
                watch_abandoned(name.clone(), id, execution);
                Response::error(id, timeout_error(&name, timeout))
            }
            _ = cancel.cancelled() => {
                token.cancel();
                debug_log!("Request {} to tool '{}' cancelled", id, name);
                watch_abandoned(name.clone(), id, execution);
                Response::error(id, cancelled_error(&name))
            }
        };
        drop(turn);
        response
    }
}

/// Logs when an abandoned execution eventually finishes, its result goes nowhere
fn watch_abandoned(
    name: String,
    id: u64,
    execution: tokio::task::JoinHandle<Result<Value, ToolError>>,
) {
    tokio::spawn(async move {
        let _ = execution.await;
        debug_log!("Abandoned execution of '{}' for request {} finished", name, id);
    });
}

fn timeout_error(name: &str, timeout: Duration) -> ErrorBody {
    ErrorBody::new(
        ErrorKind::Timeout,
        format!("Tool '{}' did not finish within {:?}", name, timeout),
    )
    .with_data(json!({ "timeoutMs": timeout.as_millis() as u64 }))
}

fn cancelled_error(name: &str) -> ErrorBody {
    ErrorBody::new(ErrorKind::Cancelled, format!("Call to tool '{}' was cancelled", name))
}

#[cfg(test)]
#[path = "tool_dispatcher_tests.rs"]
mod tool_dispatcher_tests;
