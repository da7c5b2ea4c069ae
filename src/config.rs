use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame_codec::MAX_MESSAGE_SIZE;

// Timing constants for the discovery client

/// Interval between connection attempts while no Unity instance is reachable
///
/// Fixed, without backoff, so reconnect cadence stays predictable for callers.
pub const DISCOVERY_POLL_INTERVAL_MILLIS: u64 = 1000;

/// Delay before the first reconnect attempt after a connection drops, gives a Domain Reload
/// time to finish before we start knocking
pub const RECONNECT_GRACE_MILLIS: u64 = 2000;

/// Timeout for a single TCP connect attempt
pub const CONNECT_TIMEOUT_MILLIS: u64 = 2000;

/// Deadline applied to calls that don't specify one
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

// Timing constants for the bridge server

/// Deadline applied to tool executions when neither the request nor the tool specify one
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// Time given to connections to flush queued responses when the server drains
pub const DRAIN_TIMEOUT_MILLIS: u64 = 1000;

/// Number of attempts to bind the listen socket before giving up
pub const BIND_ATTEMPTS: u32 = 5;

/// Initial delay between bind attempts, doubled after every failure
pub const BIND_BACKOFF_MILLIS: u64 = 200;

/// Outgoing frames queued per connection before producers wait for the socket
pub const FRAME_QUEUE_CAPACITY: usize = 64;

/// Age after which a lock marker is considered abandoned regardless of its owner
pub const STALE_MARKER_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

// Environment variables

/// Fallback project path when none is given on the command line
pub const ENV_PROJECT_PATH: &str = "UNITY_PROJECT_PATH";

/// Explicit bridge port, bypasses the port record
pub const ENV_PORT: &str = "UNITY_BRIDGE_PORT";

/// Default call deadline in seconds
pub const ENV_TIMEOUT_SECS: &str = "UNITY_BRIDGE_TIMEOUT_SECS";

/// How the bridge server chooses its listen port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPolicy {
    /// Let the OS pick a free port
    Ephemeral,
    /// Bind exactly this port, failing if it is taken
    Fixed(u16),
    /// Try this port first (with retries), fall back to an ephemeral one
    Preferred(u16),
}

/// Configuration of the bridge server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub project_path: PathBuf,
    pub port: PortPolicy,
    pub bind_attempts: u32,
    pub bind_backoff: Duration,
    pub max_message_size: usize,
    pub drain_timeout: Duration,
}

impl ServerConfig {
    /// Creates the default configuration for a project
    pub fn new<P: AsRef<Path>>(project_path: P) -> Self {
        Self {
            project_path: project_path.as_ref().to_path_buf(),
            port: PortPolicy::Ephemeral,
            bind_attempts: BIND_ATTEMPTS,
            bind_backoff: Duration::from_millis(BIND_BACKOFF_MILLIS),
            max_message_size: MAX_MESSAGE_SIZE,
            drain_timeout: Duration::from_millis(DRAIN_TIMEOUT_MILLIS),
        }
    }

    /// Creates the configuration for a project, with a fixed port if `UNITY_BRIDGE_PORT` is set
    pub fn from_env<P: AsRef<Path>>(project_path: P) -> Self {
        Self::from_lookup(project_path, |key| std::env::var(key).ok())
    }

    fn from_lookup<P: AsRef<Path>>(project_path: P, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new(project_path);
        if let Some(port) = lookup(ENV_PORT).and_then(|value| value.trim().parse::<u16>().ok()) {
            config.port = PortPolicy::Fixed(port);
        }
        config
    }

    /// Sets the port policy
    pub fn with_port(mut self, port: PortPolicy) -> Self {
        self.port = port;
        self
    }
}

/// Configuration of the discovery client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub poll_interval: Duration,
    pub reconnect_grace: Duration,
    pub connect_timeout: Duration,
    pub default_timeout: Duration,
    pub max_message_size: usize,
    /// Hold off connecting while the project has live lock markers
    pub respect_lock_markers: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DISCOVERY_POLL_INTERVAL_MILLIS),
            reconnect_grace: Duration::from_millis(RECONNECT_GRACE_MILLIS),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MILLIS),
            default_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            max_message_size: MAX_MESSAGE_SIZE,
            respect_lock_markers: true,
        }
    }
}

impl ClientConfig {
    /// Default configuration with `UNITY_BRIDGE_TIMEOUT_SECS` applied
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS).and_then(|value| value.trim().parse::<u64>().ok()) {
            config.default_timeout = Duration::from_secs(secs);
        }
        config
    }
}
