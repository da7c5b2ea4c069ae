use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::bridge_messages::{BridgeError, ErrorBody, ErrorKind, Request, RequestId, Response};
use crate::config::{ClientConfig, FRAME_QUEUE_CAPACITY, STALE_MARKER_GRACE_PERIOD};
use crate::frame_codec::{FrameReader, decode_message, encode_message, write_encoded};
use crate::lock_coordinator::LockCoordinator;
use crate::pending_call_table::PendingCallTable;
use crate::unity_project_manager::UnityProjectManager;
use crate::{debug_log, info_log, warn_log};

/// What the client connects to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DiscoveryTarget {
    /// A known port on the loopback interface
    Port(u16),
    /// A Unity project whose port record tells the port
    ProjectPath(PathBuf),
}

impl std::fmt::Display for DiscoveryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryTarget::Port(port) => write!(f, "port {}", port),
            DiscoveryTarget::ProjectPath(path) => write!(f, "project {}", path.display()),
        }
    }
}

/// Lifecycle states of the discovery client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Discovering,
    Connected { port: u16 },
    Reconnecting,
    Shutdown,
}

/// Cache of the last port each target was reachable on
///
/// Constructed explicitly and shared between clients that want to see each other's results.
#[derive(Debug, Default)]
pub struct DiscoveryContext {
    reachable: Mutex<HashMap<DiscoveryTarget, u16>>,
}

impl DiscoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last port the target was reachable on
    pub fn last_reachable_port(&self, target: &DiscoveryTarget) -> Option<u16> {
        self.reachable
            .lock()
            .ok()
            .and_then(|reachable| reachable.get(target).copied())
    }

    pub fn remember(&self, target: &DiscoveryTarget, port: u16) {
        if let Ok(mut reachable) = self.reachable.lock() {
            reachable.insert(target.clone(), port);
        }
    }

    /// Forgets the cached port of a target
    pub fn invalidate(&self, target: &DiscoveryTarget) {
        if let Ok(mut reachable) = self.reachable.lock() {
            reachable.remove(target);
        }
    }

    /// Forgets every cached port
    pub fn invalidate_all(&self) {
        if let Ok(mut reachable) = self.reachable.lock() {
            reachable.clear();
        }
    }
}

struct Shared {
    target: DiscoveryTarget,
    config: ClientConfig,
    context: Arc<DiscoveryContext>,
    pending: PendingCallTable,
    /// Queue of the live connection's writer task, `None` while disconnected
    ///
    /// Frames are written by that task alone, so a caller giving up never leaves half a frame
    /// on the socket.
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    state: watch::Sender<ClientState>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    /// Why the last discovery attempt failed, reported to callers that give up waiting
    last_failure: Mutex<Option<String>>,
}

impl Shared {
    fn set_state(&self, new_state: ClientState) {
        let old_state = self.state.send_replace(new_state);
        if old_state != new_state {
            debug_log!("Discovery client {:?} -> {:?} ({})", old_state, new_state, self.target);
        }
    }

    /// Records a failed attempt, returns true if the reason changed since the previous one
    fn record_failure(&self, reason: String) -> bool {
        let Ok(mut last) = self.last_failure.lock() else {
            return true;
        };
        let changed = last.as_deref() != Some(reason.as_str());
        *last = Some(reason);
        changed
    }

    fn last_failure(&self) -> Option<String> {
        self.last_failure.lock().ok().and_then(|last| last.clone())
    }

    fn set_outgoing(&self, outgoing: Option<mpsc::Sender<Vec<u8>>>) {
        match self.outgoing.lock() {
            Ok(mut slot) => *slot = outgoing,
            Err(poisoned) => *poisoned.into_inner() = outgoing,
        }
    }

    /// Tells the server to stop working on a request, best effort and without waiting
    fn notify_cancel(&self, target: RequestId) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = match encode_message(&Request::cancel(id, target), self.config.max_message_size) {
            Ok(frame) => frame,
            Err(e) => {
                debug_log!("Could not encode cancellation for request {}: {}", target, e);
                return;
            }
        };
        let outgoing = self.outgoing.lock().ok().and_then(|slot| slot.as_ref().cloned());
        match outgoing {
            Some(outgoing) => {
                if let Err(e) = outgoing.try_send(frame) {
                    debug_log!("Could not send cancellation for request {}: {}", target, e);
                }
            }
            None => debug_log!("Not connected, cancellation for request {} not sent", target),
        }
    }
}

/// Client side of the bridge, survives Domain Reloads by reconnecting on its own
///
/// A supervisor task keeps looking for the editor: it resolves the port (directly or through the
/// project's port record), connects, and reads responses until the connection drops. Every call
/// pending at that moment fails with `ConnectionLost`; the supervisor then waits a short grace
/// delay and starts over.
pub struct DiscoveryClient {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// A request that has been written and awaits its response
pub struct CallHandle {
    id: RequestId,
    receiver: oneshot::Receiver<Response>,
    deadline: Instant,
    timeout: Duration,
    shared: Arc<Shared>,
}

impl CallHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the response or the deadline
    ///
    /// On timeout the pending entry is dropped, the server is asked to cancel, and a late response
    /// is discarded when it arrives.
    pub async fn response(self) -> Result<Value, ErrorBody> {
        let CallHandle {
            id,
            mut receiver,
            deadline,
            timeout,
            shared,
        } = self;

        match timeout_at(deadline, &mut receiver).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(ErrorBody::new(
                ErrorKind::ConnectionLost,
                format!("Request {} was dropped", id),
            )),
            Err(_) => {
                if shared.pending.remove(id) {
                    warn_log!("Request {} timed out after {:?}", id, timeout);
                    shared.notify_cancel(id);
                    return Err(timeout_error(id, timeout));
                }
                // Completed in the same instant the deadline fired
                match receiver.await {
                    Ok(response) => response.into_result(),
                    Err(_) => Err(timeout_error(id, timeout)),
                }
            }
        }
    }
}

impl DiscoveryClient {
    /// Starts discovering the target in the background with a private context
    pub fn start(target: DiscoveryTarget, config: ClientConfig) -> Self {
        Self::with_context(target, config, Arc::new(DiscoveryContext::new()))
    }

    /// Starts discovering the target in the background, sharing the given context
    pub fn with_context(target: DiscoveryTarget, config: ClientConfig, context: Arc<DiscoveryContext>) -> Self {
        let (state, _state_receiver) = watch::channel(ClientState::Idle);
        let shared = Arc::new(Shared {
            target,
            config,
            context,
            pending: PendingCallTable::new(),
            outgoing: Mutex::new(None),
            state,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            last_failure: Mutex::new(None),
        });

        info_log!("Starting discovery of Unity bridge at {}", shared.target);
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared)));
        Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn target(&self) -> &DiscoveryTarget {
        &self.shared.target
    }

    pub fn context(&self) -> &Arc<DiscoveryContext> {
        &self.shared.context
    }

    /// Current state
    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    /// Gets a receiver that observes state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Reason the last connection attempt failed, if any
    pub fn last_failure(&self) -> Option<String> {
        self.shared.last_failure()
    }

    /// Waits until the client is connected, returns the port
    pub async fn wait_connected(&self, wait: Duration) -> Result<u16, ErrorBody> {
        wait_for_connection(&self.shared, Instant::now() + wait).await
    }

    /// Calls a method and waits for its result
    ///
    /// `call_timeout` defaults to the configured call timeout and covers waiting for a connection
    /// too. The server gets the same deadline.
    pub async fn call(&self, method: &str, params: Value, call_timeout: Option<Duration>) -> Result<Value, ErrorBody> {
        self.send_request(method, params, call_timeout).await?.response().await
    }

    /// Writes a request and returns a handle to await its response
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        call_timeout: Option<Duration>,
    ) -> Result<CallHandle, ErrorBody> {
        let call_timeout = call_timeout.unwrap_or(self.shared.config.default_timeout);
        let deadline = Instant::now() + call_timeout;
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(id, method, params).with_timeout(call_timeout);
        let frame = encode_message(&request, self.shared.config.max_message_size).map_err(ErrorBody::from)?;

        loop {
            wait_for_connection(&self.shared, deadline).await?;

            // Registering under the slot lock means a disconnect either happens before we see
            // the queue or fails this entry together with the rest of the table
            let connection = match self.shared.outgoing.lock() {
                Ok(slot) => slot
                    .as_ref()
                    .map(|outgoing| (outgoing.clone(), self.shared.pending.register(id))),
                Err(_) => {
                    return Err(ErrorBody::new(
                        ErrorKind::ConnectionLost,
                        "Connection state is unavailable",
                    ));
                }
            };
            let Some((outgoing, registered)) = connection else {
                // Disconnect in progress, the state change follows shortly
                tokio::task::yield_now().await;
                continue;
            };
            let receiver = registered.map_err(|e| ErrorBody::new(ErrorKind::InvalidParams, e.to_string()))?;

            // Waiting for queue space is safe to abandon, nothing reaches the socket until the
            // writer task takes the frame
            let queued = match timeout_at(deadline, outgoing.send(frame)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(BridgeError::ConnectionLost(
                    "Connection to the Unity bridge was lost".to_string(),
                )),
                Err(_) => Err(BridgeError::Timeout(format!("Sending request {} timed out", id))),
            };

            if let Err(e) = queued {
                self.shared.pending.remove(id);
                warn_log!("Failed to send request {} ({}): {}", id, method, e);
                return Err(ErrorBody::from(e));
            }

            debug_log!("Sent request {} ({})", id, method);
            return Ok(CallHandle {
                id,
                receiver,
                deadline,
                timeout: call_timeout,
                shared: Arc::clone(&self.shared),
            });
        }
    }

    /// Cancels a pending request
    ///
    /// The caller gets a `Cancelled` error right away. The server is asked to stop the tool, which
    /// it may or may not manage to do. Returns false if the request was no longer pending.
    pub async fn cancel(&self, id: RequestId) -> bool {
        let cancelled = self
            .shared
            .pending
            .fail(id, ErrorBody::new(ErrorKind::Cancelled, "Request cancelled by caller"));
        if cancelled {
            info_log!("Cancelled request {}", id);
            self.shared.notify_cancel(id);
        }
        cancelled
    }

    /// Stops the client, failing every pending call
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let supervisor = self.supervisor.lock().ok().and_then(|mut supervisor| supervisor.take());
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn_log!("Discovery supervisor ended abnormally: {}", e);
            }
        }
        self.shared.pending.fail_all(ErrorKind::ConnectionLost, "Client shut down");
        self.shared.set_state(ClientState::Shutdown);
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn wait_for_connection(shared: &Shared, deadline: Instant) -> Result<u16, ErrorBody> {
    let mut state = shared.state.subscribe();
    loop {
        match *state.borrow_and_update() {
            ClientState::Connected { port } => return Ok(port),
            ClientState::Shutdown => return Err(BridgeError::Shutdown.into()),
            _ => {}
        }

        match timeout_at(deadline, state.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(BridgeError::Shutdown.into()),
            Err(_) => {
                let reason = shared.last_failure().unwrap_or_else(|| "still searching".to_string());
                return Err(ErrorBody::new(
                    ErrorKind::DiscoveryError,
                    format!("No reachable Unity instance at {}: {}", shared.target, reason),
                ));
            }
        }
    }
}

/// Discovery and reconnect loop, runs until shutdown
async fn supervise(shared: Arc<Shared>) {
    let mut reconnecting = false;

    let locks = match (&shared.target, shared.config.respect_lock_markers) {
        (DiscoveryTarget::ProjectPath(path), true) => {
            Some(LockCoordinator::for_project(&UnityProjectManager::new(path)))
        }
        _ => None,
    };

    while !shared.shutdown.is_cancelled() {
        shared.set_state(if reconnecting {
            ClientState::Reconnecting
        } else {
            ClientState::Discovering
        });

        if let Some(locks) = &locks {
            let live = locks.live_markers();
            if !live.is_empty() {
                let reason = format!("Editor is busy ({:?})", live);
                if shared.record_failure(reason.clone()) {
                    info_log!("Unity bridge at {} not reachable yet: {}", shared.target, reason);
                }
                // Markers stop blocking at the latest once they go stale
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    cleared = locks.wait_until_clear(&live, STALE_MARKER_GRACE_PERIOD, shared.config.poll_interval) => {
                        if let Err(e) = cleared {
                            debug_log!("Still waiting for the editor at {}: {}", shared.target, e);
                        }
                    }
                }
                continue;
            }
        }

        let (stream, port) = match connect_once(&shared).await {
            Ok(connected) => connected,
            Err(e) => {
                let reason = e.to_string();
                if shared.record_failure(reason.clone()) {
                    info_log!("Unity bridge at {} not reachable yet: {}", shared.target, reason);
                } else {
                    debug_log!("Unity bridge at {} still not reachable: {}", shared.target, reason);
                }
                if !pause(&shared, shared.config.poll_interval).await {
                    break;
                }
                continue;
            }
        };

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let closed = CancellationToken::new();
        let (outgoing, frames) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let writer = tokio::spawn(write_frames(write_half, frames, closed.clone()));
        shared.set_outgoing(Some(outgoing));
        shared.context.remember(&shared.target, port);
        if let Ok(mut last) = shared.last_failure.lock() {
            *last = None;
        }
        info_log!("Connected to Unity bridge on port {}", port);
        shared.set_state(ClientState::Connected { port });

        read_responses(&shared, read_half, &closed).await;

        // Clear the queue first so no new request registers against a dead connection
        shared.set_outgoing(None);
        closed.cancel();
        if let Err(e) = writer.await {
            warn_log!("Request writer ended abnormally: {}", e);
        }
        shared.context.invalidate(&shared.target);
        let failed = shared
            .pending
            .fail_all(ErrorKind::ConnectionLost, "Connection to the Unity bridge was lost");
        if shared.shutdown.is_cancelled() {
            break;
        }
        warn_log!(
            "Lost connection to Unity bridge on port {}, {} pending calls failed",
            port,
            failed
        );

        reconnecting = true;
        shared.set_state(ClientState::Reconnecting);
        // Give a Domain Reload time to tear the old server down before looking again
        if !pause(&shared, shared.config.reconnect_grace).await {
            break;
        }
    }

    shared.set_state(ClientState::Shutdown);
    debug_log!("Discovery supervisor for {} stopped", shared.target);
}

/// Sleeps unless shut down first, returns false on shutdown
async fn pause(shared: &Shared, duration: Duration) -> bool {
    tokio::select! {
        _ = shared.shutdown.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

async fn connect_once(shared: &Shared) -> Result<(TcpStream, u16), BridgeError> {
    let port = match &shared.target {
        DiscoveryTarget::Port(port) => *port,
        DiscoveryTarget::ProjectPath(path) => UnityProjectManager::new(path).resolve_port()?,
    };

    let stream = match timeout(
        shared.config.connect_timeout,
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(BridgeError::DiscoveryError(format!(
                "Connecting to port {} failed: {}",
                port, e
            )));
        }
        Err(_) => {
            return Err(BridgeError::DiscoveryError(format!(
                "Connecting to port {} timed out",
                port
            )));
        }
    };
    Ok((stream, port))
}

/// Writes queued frames in order until the connection closes
///
/// A failed write leaves the stream in an unknown state, so it closes the connection.
async fn write_frames(mut write_half: OwnedWriteHalf, mut frames: mpsc::Receiver<Vec<u8>>, closed: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = closed.cancelled() => break,
            written = write_encoded(&mut write_half, &frame) => written,
        };
        if let Err(e) = written {
            warn_log!("Writing to Unity bridge failed, closing the connection: {}", e);
            closed.cancel();
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Completes pending calls from incoming responses until the connection ends
async fn read_responses(shared: &Shared, read_half: OwnedReadHalf, closed: &CancellationToken) {
    let mut reader = FrameReader::with_max_size(read_half, shared.config.max_message_size);
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = closed.cancelled() => return,
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Some(payload)) => match decode_message::<Response>(&payload) {
                Ok(response) => {
                    let id = response.id;
                    if !shared.pending.complete(response) {
                        debug_log!("Discarding response {} nobody is waiting for", id);
                    }
                }
                Err(e) => warn_log!("Dropping malformed response: {}", e),
            },
            Ok(None) => {
                info_log!("Unity bridge closed the connection");
                return;
            }
            Err(e) => {
                warn_log!("Reading from Unity bridge failed: {}", e);
                return;
            }
        }
    }
}

fn timeout_error(id: RequestId, timeout: Duration) -> ErrorBody {
    ErrorBody::new(
        ErrorKind::Timeout,
        format!("Request {} timed out after {:?}", id, timeout),
    )
    .with_data(json!({ "timeoutMs": timeout.as_millis() as u64 }))
}

#[cfg(test)]
#[path = "discovery_client_tests.rs"]
mod discovery_client_tests;
