use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::tool_dispatcher::{Tool, ToolError};

/// Initializes stdout logging once per test binary
#[ctor::ctor]
fn init_test_logging() {
    crate::logging::init_logging();
}

/// Creates a throw-away directory laid out like a Unity project
pub fn create_test_project() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp project directory");
    std::fs::create_dir_all(dir.path().join("Assets")).expect("Failed to create Assets");
    std::fs::create_dir_all(dir.path().join("Packages")).expect("Failed to create Packages");
    std::fs::create_dir_all(dir.path().join("ProjectSettings")).expect("Failed to create ProjectSettings");
    std::fs::write(
        dir.path().join("ProjectSettings").join("ProjectVersion.txt"),
        "m_EditorVersion: 6000.0.51f1\n",
    )
    .expect("Failed to write ProjectVersion.txt");
    dir
}

/// Counters shared between a probe tool and the test observing it
#[derive(Default)]
pub struct ProbeStats {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl ProbeStats {
    fn enter(&self, tag: &str) {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("start:{}", tag));
    }

    fn leave(&self, tag: &str, outcome: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("{}:{}", outcome, tag));
    }

    /// Highest number of concurrent executions observed
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Number of executions started
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ordered start/end events, e.g. `start:a`, `end:a`
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

/// Tool that sleeps for a fixed delay and records how many calls overlap
///
/// Returns `{"tool": name, "tag": params.tag}`. Honours cancellation.
pub struct ProbeTool {
    name: String,
    parallel: bool,
    delay: Duration,
    stats: Arc<ProbeStats>,
}

impl ProbeTool {
    pub fn new(name: &str, parallel: bool, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            parallel,
            delay,
            stats: Arc::new(ProbeStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ProbeStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Tool for ProbeTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn allow_parallel(&self) -> bool {
        self.parallel
    }

    async fn execute(&self, params: Value, cancel: CancellationToken) -> Result<Value, ToolError> {
        let tag = params
            .get("tag")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.stats.enter(&tag);

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {
                self.stats.leave(&tag, "end");
                Ok(json!({ "tool": self.name, "tag": tag }))
            }
            _ = cancel.cancelled() => {
                self.stats.leave(&tag, "cancelled");
                Err(ToolError::Cancelled)
            }
        }
    }
}

/// Tool that ignores cancellation and sets a flag when it finally finishes
pub struct StubbornTool {
    delay: Duration,
    finished: Arc<AtomicBool>,
}

impl StubbornTool {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }
}

#[async_trait]
impl Tool for StubbornTool {
    fn name(&self) -> &str {
        "stubborn"
    }

    async fn execute(&self, _params: Value, _cancel: CancellationToken) -> Result<Value, ToolError> {
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(json!("done"))
    }
}

/// Tool that always fails with a fixed message
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn allow_parallel(&self) -> bool {
        true
    }

    async fn execute(&self, _params: Value, _cancel: CancellationToken) -> Result<Value, ToolError> {
        Err(ToolError::failed("editor exploded"))
    }
}

/// Tool that adds two integers, rejects anything else
pub struct AddTool;

#[derive(serde::Deserialize)]
struct AddParams {
    a: i64,
    b: i64,
}

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn allow_parallel(&self) -> bool {
        true
    }

    async fn execute(&self, params: Value, _cancel: CancellationToken) -> Result<Value, ToolError> {
        let AddParams { a, b } = serde_json::from_value(params)?;
        Ok(json!(a + b))
    }
}

/// Tool that panics
pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "panic"
    }

    fn allow_parallel(&self) -> bool {
        true
    }

    async fn execute(&self, _params: Value, _cancel: CancellationToken) -> Result<Value, ToolError> {
        panic!("tool bug");
    }
}

/// Dispatcher with the tools used by the server and client tests
///
/// `ping` (parallel, 10 ms), `slow` (parallel, 300 ms), `compile` (serialized, 200 ms),
/// `fail` and `add`.
pub fn test_dispatcher() -> crate::tool_dispatcher::ToolDispatcher {
    test_dispatcher_with_compile_stats().0
}

/// Same as `test_dispatcher`, also handing out the event log of `compile`
pub fn test_dispatcher_with_compile_stats() -> (crate::tool_dispatcher::ToolDispatcher, Arc<ProbeStats>) {
    let compile = ProbeTool::new("compile", false, Duration::from_millis(200));
    let compile_stats = compile.stats();
    let mut registry = crate::tool_dispatcher::ToolRegistry::new();
    registry
        .register(ProbeTool::new("ping", true, Duration::from_millis(10)))
        .unwrap()
        .register(ProbeTool::new("slow", true, Duration::from_millis(300)))
        .unwrap()
        .register(compile)
        .unwrap()
        .register(FailingTool)
        .unwrap()
        .register(AddTool)
        .unwrap();
    (registry.build(), compile_stats)
}

/// Server configuration with short timings for tests
pub fn test_server_config(project_path: &std::path::Path) -> crate::config::ServerConfig {
    let mut config = crate::config::ServerConfig::new(project_path);
    config.bind_attempts = 2;
    config.bind_backoff = Duration::from_millis(10);
    config.drain_timeout = Duration::from_millis(200);
    config
}

/// Client configuration with short timings for tests
pub fn test_client_config() -> crate::config::ClientConfig {
    crate::config::ClientConfig {
        poll_interval: Duration::from_millis(50),
        reconnect_grace: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        default_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}
