use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::bridge_messages::{BridgeError, ErrorBody, ErrorKind, Request, RequestId, Response};
use crate::config::{FRAME_QUEUE_CAPACITY, PortPolicy, ServerConfig};
use crate::frame_codec::{FrameReader, decode_message, encode_message, write_encoded};
use crate::lock_coordinator::{LockCoordinator, LockMarker};
use crate::tool_dispatcher::ToolDispatcher;
use crate::unity_project_manager::{PortRecord, UnityProjectManager};
use crate::{debug_log, error_log, info_log, warn_log};

/// Lifecycle states of the bridge server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Listening { port: u16 },
    Draining,
}

/// Snapshot of a live client connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
}

struct ConnectionSlot {
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    last_activity: Arc<Mutex<Instant>>,
    task: JoinHandle<()>,
}

type ConnectionMap = Arc<Mutex<HashMap<u64, ConnectionSlot>>>;

struct RunningServer {
    port: u16,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Everything a connection task needs, cloned into each one
#[derive(Clone)]
struct ConnectionContext {
    dispatcher: Arc<ToolDispatcher>,
    connections: ConnectionMap,
    next_connection_id: Arc<AtomicU64>,
    max_message_size: usize,
    drain_timeout: Duration,
}

/// TCP server hosted by the editor that exposes the registered tools
///
/// The server has to come back after every Domain Reload: `begin_domain_reload` closes all
/// connections and marks the reload on disk, `finish_domain_reload` starts listening again and
/// rewrites the port record, possibly with a different port.
pub struct BridgeServer {
    config: ServerConfig,
    project: UnityProjectManager,
    locks: LockCoordinator,
    dispatcher: Arc<ToolDispatcher>,
    state: Arc<Mutex<ServerState>>,
    state_sender: broadcast::Sender<ServerState>,
    connections: ConnectionMap,
    next_connection_id: Arc<AtomicU64>,
    running: Option<RunningServer>,
    /// Port of the previous listen cycle, tried first after a reload
    previous_port: Option<u16>,
}

impl BridgeServer {
    /// Creates a stopped server for the configured project
    pub fn new(config: ServerConfig, dispatcher: ToolDispatcher) -> Self {
        let project = UnityProjectManager::new(&config.project_path);
        let locks = LockCoordinator::for_project(&project);
        let (state_sender, _state_receiver) = broadcast::channel(64);

        Self {
            config,
            project,
            locks,
            dispatcher: Arc::new(dispatcher),
            state: Arc::new(Mutex::new(ServerState::Stopped)),
            state_sender,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            running: None,
            previous_port: None,
        }
    }

    /// Gets a receiver for state transitions
    pub fn subscribe_state(&self) -> broadcast::Receiver<ServerState> {
        self.state_sender.subscribe()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        if let Ok(state) = self.state.lock() {
            *state
        } else {
            ServerState::Stopped
        }
    }

    /// Port the server is listening on, if listening
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|running| running.port)
    }

    /// Snapshot of live connections
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let Ok(connections) = self.connections.lock() else {
            return Vec::new();
        };
        let mut infos: Vec<ConnectionInfo> = connections
            .iter()
            .map(|(id, slot)| ConnectionInfo {
                id: *id,
                peer: slot.peer,
                connected_at: slot.connected_at,
                last_activity: slot
                    .last_activity
                    .lock()
                    .map(|instant| *instant)
                    .unwrap_or_else(|_| Instant::now()),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn project(&self) -> &UnityProjectManager {
        &self.project
    }

    pub fn lock_coordinator(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    /// Binds the listen socket, publishes the port record and starts accepting connections
    ///
    /// Returns the port. Calling it while already listening returns the current port.
    pub async fn start(&mut self) -> Result<u16, BridgeError> {
        if let Some(running) = &self.running {
            return Ok(running.port);
        }

        match self.locks.clear_stale() {
            Ok(cleared) if !cleared.is_empty() => {
                info_log!("Cleared stale lock markers at startup: {:?}", cleared)
            }
            Ok(_) => {}
            Err(e) => warn_log!("Failed to clear stale lock markers: {}", e),
        }

        self.set_state(ServerState::Starting);
        if let Err(e) = self.locks.acquire(LockMarker::ServerStarting) {
            self.set_state(ServerState::Stopped);
            return Err(e.into());
        }

        let result = self.bind_and_publish().await;

        if let Err(e) = self.locks.release(LockMarker::ServerStarting) {
            warn_log!("Failed to release server-starting marker: {}", e);
        }

        let (listener, port) = match result {
            Ok(bound) => bound,
            Err(e) => {
                error_log!("Bridge server failed to start: {}", e);
                self.set_state(ServerState::Stopped);
                return Err(e);
            }
        };

        // A reload is over once the server listens again
        if let Err(e) = self.locks.release(LockMarker::DomainReload) {
            warn_log!("Failed to release domain-reload marker: {}", e);
        }

        let shutdown = CancellationToken::new();
        let context = ConnectionContext {
            dispatcher: Arc::clone(&self.dispatcher),
            connections: Arc::clone(&self.connections),
            next_connection_id: Arc::clone(&self.next_connection_id),
            max_message_size: self.config.max_message_size,
            drain_timeout: self.config.drain_timeout,
        };
        let accept_task = tokio::spawn(Self::accept_loop(listener, shutdown.clone(), context));

        self.running = Some(RunningServer {
            port,
            shutdown,
            accept_task,
        });
        self.previous_port = Some(port);
        self.set_state(ServerState::Listening { port });
        info_log!("Bridge server listening on 127.0.0.1:{}", port);
        Ok(port)
    }

    /// Closes every connection ahead of a Domain Reload
    ///
    /// The reload marker stays on disk until `finish_domain_reload` (or `start`) succeeds, so
    /// clients wait instead of reconnecting to a server that is about to disappear.
    pub async fn begin_domain_reload(&mut self) -> Result<(), BridgeError> {
        info_log!("Domain reload starting, draining bridge server");
        self.locks.acquire(LockMarker::DomainReload)?;
        self.drain().await;
        Ok(())
    }

    /// Starts listening again after a Domain Reload
    pub async fn finish_domain_reload(&mut self) -> Result<u16, BridgeError> {
        info_log!("Domain reload finished, restarting bridge server");
        self.start().await
    }

    /// Marks script compilation on disk so clients hold off connecting
    pub fn set_compiling(&self, compiling: bool) -> Result<(), BridgeError> {
        if compiling {
            self.locks.acquire(LockMarker::Compiling)?;
        } else {
            self.locks.release(LockMarker::Compiling)?;
        }
        Ok(())
    }

    /// Shuts the server down for good and withdraws the port record
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        self.drain().await;
        self.project.remove_port_record()?;
        self.locks.release(LockMarker::DomainReload)?;
        self.locks.release(LockMarker::ServerStarting)?;
        info_log!("Bridge server stopped");
        Ok(())
    }

    async fn drain(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        self.set_state(ServerState::Draining);
        running.shutdown.cancel();
        if let Err(e) = running.accept_task.await {
            warn_log!("Accept loop ended abnormally: {}", e);
        }

        let slots: Vec<(u64, ConnectionSlot)> = match self.connections.lock() {
            Ok(mut connections) => connections.drain().collect(),
            Err(_) => Vec::new(),
        };
        debug_log!("Draining {} connections", slots.len());

        // Each connection flushes within drain_timeout itself, the extra margin covers scheduling
        let wait = self.config.drain_timeout * 2;
        for (id, mut slot) in slots {
            if timeout(wait, &mut slot.task).await.is_err() {
                warn_log!("Connection {} did not close in time, aborting it", id);
                slot.task.abort();
            }
        }

        self.set_state(ServerState::Stopped);
    }

    async fn bind_and_publish(&mut self) -> Result<(TcpListener, u16), BridgeError> {
        let listener = self.bind_listener().await?;
        let port = listener.local_addr()?.port();

        let record = PortRecord::for_current_process(port, self.project.project_path());
        self.project.write_port_record(&record)?;
        Ok((listener, port))
    }

    async fn bind_listener(&self) -> Result<TcpListener, BridgeError> {
        match self.config.port {
            PortPolicy::Fixed(port) => TcpListener::bind((Ipv4Addr::LOCALHOST, port))
                .await
                .map_err(|source| BridgeError::BindFailed { port, source }),
            PortPolicy::Preferred(port) => {
                match self.bind_with_retry(port, self.config.bind_attempts).await {
                    Ok(listener) => Ok(listener),
                    Err(e) => {
                        warn_log!("Preferred port unavailable ({}), using an ephemeral port", e);
                        self.bind_with_retry(0, self.config.bind_attempts).await
                    }
                }
            }
            PortPolicy::Ephemeral => {
                // Keeping the port across a reload saves clients a record lookup, but any port will do
                if let Some(previous) = self.previous_port {
                    if let Ok(listener) = TcpListener::bind((Ipv4Addr::LOCALHOST, previous)).await {
                        return Ok(listener);
                    }
                    debug_log!("Previous port {} unavailable, picking a new one", previous);
                }
                self.bind_with_retry(0, self.config.bind_attempts).await
            }
        }
    }

    async fn bind_with_retry(&self, port: u16, attempts: u32) -> Result<TcpListener, BridgeError> {
        let attempts = attempts.max(1);
        let mut backoff = self.config.bind_backoff;
        let mut attempt = 1;
        loop {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => return Ok(listener),
                Err(source) if attempt >= attempts => {
                    return Err(BridgeError::BindFailed { port, source });
                }
                Err(e) => {
                    warn_log!(
                        "Bind attempt {}/{} on port {} failed: {}, retrying in {:?}",
                        attempt,
                        attempts,
                        port,
                        e,
                        backoff
                    );
                    sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }

    fn set_state(&self, new_state: ServerState) {
        if let Ok(mut state) = self.state.lock() {
            if *state == new_state {
                return;
            }
            debug_log!("Bridge server state {:?} -> {:?}", *state, new_state);
            *state = new_state;
        }
        // No subscribers is fine
        let _ = self.state_sender.send(new_state);
    }

    async fn accept_loop(listener: TcpListener, shutdown: CancellationToken, context: ConnectionContext) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => Self::spawn_connection(stream, peer, shutdown.child_token(), &context),
                    Err(e) => {
                        // Typically out of file descriptors, keep serving existing connections
                        error_log!("Failed to accept connection: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug_log!("Accept loop stopped");
    }

    fn spawn_connection(
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
        context: &ConnectionContext,
    ) {
        let id = context.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        info_log!("Accepted connection {} from {}", id, peer);

        // Holding the map lock across the spawn keeps the task from deregistering before it is registered
        let Ok(mut connections) = context.connections.lock() else {
            return;
        };
        let task = tokio::spawn(Self::handle_connection(
            id,
            stream,
            token,
            Arc::clone(&last_activity),
            context.clone(),
        ));
        connections.insert(
            id,
            ConnectionSlot {
                peer,
                connected_at: Utc::now(),
                last_activity,
                task,
            },
        );
    }

    async fn handle_connection(
        id: u64,
        stream: TcpStream,
        token: CancellationToken,
        last_activity: Arc<Mutex<Instant>>,
        context: ConnectionContext,
    ) {
        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();
        let (frame_sender, mut frame_receiver) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE_CAPACITY);

        let writer_token = token.clone();
        let mut writer = tokio::spawn(async move {
            while let Some(frame) = frame_receiver.recv().await {
                if let Err(e) = write_encoded(&mut write_half, &frame).await {
                    debug_log!("Write failed on connection {}: {}", id, e);
                    writer_token.cancel();
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let in_flight: Arc<Mutex<HashMap<RequestId, CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut reader = FrameReader::with_max_size(read_half, context.max_message_size);

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = reader.next_frame() => frame,
            };

            match frame {
                Ok(Some(payload)) => {
                    if let Ok(mut instant) = last_activity.lock() {
                        *instant = Instant::now();
                    }
                    Self::handle_payload(&payload, &token, &in_flight, &frame_sender, &context);
                }
                Ok(None) => {
                    debug_log!("Connection {} closed by peer", id);
                    break;
                }
                Err(BridgeError::FramingError(reason)) => {
                    warn_log!("Framing error on connection {}, closing it: {}", id, reason);
                    break;
                }
                Err(e) => {
                    debug_log!("Read failed on connection {}: {}", id, e);
                    break;
                }
            }
        }

        // Stop in-flight tools, then let already queued responses go out before closing. Dispatch
        // tasks still waiting for queue space give up once the writer is gone.
        token.cancel();
        drop(frame_sender);
        if timeout(context.drain_timeout, &mut writer).await.is_err() {
            warn_log!("Connection {} did not flush in time", id);
            writer.abort();
        }

        if let Ok(mut connections) = context.connections.lock() {
            connections.remove(&id);
        }
        info_log!("Connection {} closed", id);
    }

    fn handle_payload(
        payload: &[u8],
        token: &CancellationToken,
        in_flight: &Arc<Mutex<HashMap<RequestId, CancellationToken>>>,
        frame_sender: &mpsc::Sender<Vec<u8>>,
        context: &ConnectionContext,
    ) {
        let request = match decode_message::<Request>(payload) {
            Ok(request) => request,
            Err(e) => {
                let id = serde_json::from_slice::<Value>(payload)
                    .ok()
                    .and_then(|value| value.get("id").and_then(Value::as_u64));
                match id {
                    Some(id) => {
                        let error = ErrorBody::new(ErrorKind::InvalidParams, format!("Malformed request: {}", e));
                        Self::reply_now(Response::error(id, error), frame_sender, context.max_message_size);
                    }
                    None => warn_log!("Dropping malformed request without id: {}", e),
                }
                return;
            }
        };

        if request.is_cancel() {
            if let Some(target) = request.cancel_target() {
                if let Ok(in_flight) = in_flight.lock() {
                    if let Some(request_token) = in_flight.get(&target) {
                        debug_log!("Cancelling request {} on client request", target);
                        request_token.cancel();
                    }
                }
            }
            return;
        }

        let id = request.id;
        let request_token = token.child_token();
        let duplicate = match in_flight.lock() {
            Ok(mut in_flight) => match in_flight.entry(id) {
                Entry::Occupied(_) => true,
                Entry::Vacant(slot) => {
                    slot.insert(request_token.clone());
                    false
                }
            },
            Err(_) => false,
        };
        if duplicate {
            warn_log!("Rejecting request {}: id is already in flight", id);
            let error = ErrorBody::new(
                ErrorKind::InvalidParams,
                format!("Request id {} is already in flight on this connection", id),
            );
            Self::reply_now(Response::error(id, error), frame_sender, context.max_message_size);
            return;
        }

        // Taking the tool's queue slot here, on the reader, keeps arrival order
        let admission = context.dispatcher.admit(request);
        let in_flight = Arc::clone(in_flight);
        let frame_sender = frame_sender.clone();
        let max_message_size = context.max_message_size;
        tokio::spawn(async move {
            let response = admission.run(request_token).await;
            if let Ok(mut in_flight) = in_flight.lock() {
                in_flight.remove(&id);
            }
            let Some(frame) = Self::encode_response(&response, max_message_size) else {
                return;
            };
            // The writer is gone when the connection is closing, the response is abandoned then
            let _ = frame_sender.send(frame).await;
        });
    }

    /// Queues a response produced on the reader itself, which must not wait for the socket
    fn reply_now(response: Response, frame_sender: &mpsc::Sender<Vec<u8>>, max_message_size: usize) {
        let Some(frame) = Self::encode_response(&response, max_message_size) else {
            return;
        };
        if let Err(e) = frame_sender.try_send(frame) {
            warn_log!("Dropping response {}: {}", response.id, e);
        }
    }

    fn encode_response(response: &Response, max_message_size: usize) -> Option<Vec<u8>> {
        match encode_message(response, max_message_size) {
            Ok(frame) => Some(frame),
            Err(e) => {
                error_log!("Failed to encode response {}: {}", response.id, e);
                let fallback = Response::error(
                    response.id,
                    ErrorBody::new(ErrorKind::ToolFailed, format!("Response could not be sent: {}", e)),
                );
                encode_message(&fallback, max_message_size).ok()
            }
        }
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
        }
    }
}

#[cfg(test)]
#[path = "bridge_server_tests.rs"]
mod bridge_server_tests;
