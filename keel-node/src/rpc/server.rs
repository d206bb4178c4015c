// RPC Server Module
//
// INTENTION:
// Accept TCP peers on the manager's reactor and route their requests to the server
// connections of exposed services. Each peer is a session with one reader task and
// one writer task; responses and notifications for a session are queued to its
// writer, so they can be produced from any thread.
//
// ARCHITECTURAL PRINCIPLES:
// 1. Connection Table - requests are routed by their "service" key, nothing else
// 2. Bounded Peers - at most `max_connections` sessions, extra peers are closed
// 3. Deferred Answers - a connection answers now or later; the server never waits

use anyhow::Context;
use dashmap::DashMap;
use keel_common::logging::{Component, Logger};
use keel_common::{log_debug, log_error, log_info, log_warn};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use super::connection::{RemoteRequest, ServerConnection, SessionId};
use super::protocol::{
    encode_frame, Notify, Request, Response, ERROR_CONNECTION_NOT_FOUND, ERROR_INVALID_PARAMS, ERROR_PARSE,
};
use crate::config::RpcServerConfig;

struct ServerShared {
    logger: Arc<Logger>,
    max_connections: usize,
    connections: DashMap<String, Arc<ServerConnection>>,
    sessions: DashMap<SessionId, mpsc::UnboundedSender<String>>,
    next_session: AtomicU64,
}

impl ServerShared {
    fn send<T: serde::Serialize>(&self, session_id: SessionId, message: &T) -> bool {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                log_error!(self.logger, "Failed to encode frame: {}", e);
                return false;
            }
        };
        match self.sessions.get(&session_id) {
            Some(session) => session.send(frame).is_ok(),
            None => {
                log_debug!(self.logger, "Session {} is gone", session_id);
                false
            }
        }
    }

    fn handle_line(&self, session_id: SessionId, line: &str) -> Option<Response> {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                log_warn!(self.logger, "Session {} sent an unparsable request: {}", session_id, e);
                return Some(Response::error("", ERROR_PARSE, format!("Parse error: {e}")));
            }
        };

        if !(request.params.is_object() || request.params.is_null()) {
            return Some(Response::error(
                request.id,
                ERROR_INVALID_PARAMS,
                "Params must be a JSON object",
            ));
        }

        let connection = self
            .connections
            .get(&request.service)
            .map(|entry| entry.value().clone());
        let Some(connection) = connection else {
            return Some(Response::error(
                request.id,
                ERROR_CONNECTION_NOT_FOUND,
                format!("Connection(`{}`) not found", request.service),
            ));
        };

        log_debug!(
            self.logger,
            "Session {} calls `{}/{}`",
            session_id,
            request.service,
            request.method
        );
        connection.on_request(RemoteRequest {
            session_id,
            request_id: request.id,
            method: request.method,
            params: request.params,
        })
    }

    fn open_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, stop: watch::Receiver<bool>) {
        if self.sessions.len() >= self.max_connections {
            log_warn!(
                self.logger,
                "Rejecting {}: {} connections already open",
                peer,
                self.max_connections
            );
            return;
        }

        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (outgoing, queued) = mpsc::unbounded_channel::<String>();
        self.sessions.insert(session_id, outgoing);
        log_info!(self.logger, "Session {} opened from {}", session_id, peer);

        tokio::spawn(write_loop(writer, queued));
        let shared = self.clone();
        tokio::spawn(async move {
            shared.read_loop(session_id, reader, stop).await;
            shared.close_session(session_id);
        });
    }

    async fn read_loop(&self, session_id: SessionId, reader: OwnedReadHalf, mut stop: watch::Receiver<bool>) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Some(response) = self.handle_line(session_id, &line) {
                            self.send(session_id, &response);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log_debug!(self.logger, "Session {} read failed: {}", session_id, e);
                        break;
                    }
                },
            }
        }
    }

    fn close_session(&self, session_id: SessionId) {
        if self.sessions.remove(&session_id).is_none() {
            return;
        }
        for connection in self.connections.iter() {
            connection.on_session_closed(session_id);
        }
        log_info!(self.logger, "Session {} closed", session_id);
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queued: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = queued.recv().await {
        if writer.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// TCP listener serving newline-delimited JSON requests
pub struct RpcServer {
    config: RpcServerConfig,
    reactor: Handle,
    shared: Arc<ServerShared>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, reactor: Handle, logger: &Logger) -> Self {
        let logger = Arc::new(logger.with_component(Component::Rpc).with_scope("server"));
        Self {
            shared: Arc::new(ServerShared {
                logger,
                max_connections: config.max_connections,
                connections: DashMap::new(),
                sessions: DashMap::new(),
                next_session: AtomicU64::new(1),
            }),
            config,
            reactor,
            stop: Mutex::new(None),
            local_addr: RwLock::new(None),
        }
    }

    /// Bind the listener and start accepting. Must not be called from the reactor thread.
    pub fn start(&self, timeout: Duration) -> bool {
        let mut stop_slot = self.stop.lock();
        if stop_slot.is_some() {
            return true;
        }

        let (ready, bound) = std_mpsc::sync_channel::<Result<SocketAddr, String>>(1);
        let (stop, stopped) = watch::channel(false);
        let shared = self.shared.clone();
        let port = self.config.listen_port;

        self.reactor.spawn(async move {
            match bind_listener(port).await {
                Ok((listener, addr)) => {
                    let _ = ready.send(Ok(addr));
                    accept_loop(shared, listener, stopped).await;
                }
                Err(e) => {
                    let _ = ready.send(Err(format!("{e:#}")));
                }
            }
        });

        match bound.recv_timeout(timeout) {
            Ok(Ok(addr)) => {
                *self.local_addr.write() = Some(addr);
                *stop_slot = Some(stop);
                log_info!(self.shared.logger, "Listening on {} ({})", addr, self.config);
                true
            }
            Ok(Err(e)) => {
                log_error!(self.shared.logger, "{}", e);
                false
            }
            Err(_) => {
                let _ = stop.send(true);
                log_error!(
                    self.shared.logger,
                    "Timed out after {}ms binding port {}",
                    timeout.as_millis(),
                    port
                );
                false
            }
        }
    }

    /// Stop accepting and close every session
    pub fn stop(&self) {
        let Some(stop) = self.stop.lock().take() else {
            return;
        };
        let _ = stop.send(true);
        let sessions: Vec<SessionId> = self.shared.sessions.iter().map(|entry| *entry.key()).collect();
        for session_id in sessions {
            self.shared.close_session(session_id);
        }
        *self.local_addr.write() = None;
        log_info!(self.shared.logger, "Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.stop.lock().is_some()
    }

    /// Address actually bound, useful when listening on port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Route requests for `connection.name()` to this connection
    pub fn add_connection(&self, connection: Arc<ServerConnection>) -> bool {
        let name = connection.name().to_string();
        if let Some(existing) = self.shared.connections.get(&name) {
            return Arc::ptr_eq(existing.value(), &connection);
        }

        let responder_shared: Weak<ServerShared> = Arc::downgrade(&self.shared);
        connection.set_responder(Some(Box::new(move |session_id: SessionId, response: Response| {
            responder_shared
                .upgrade()
                .map(|shared| shared.send(session_id, &response))
                .unwrap_or(false)
        })));
        let notifier_shared: Weak<ServerShared> = Arc::downgrade(&self.shared);
        connection.set_notifier(Some(Box::new(move |session_id: SessionId, notify: Notify| {
            notifier_shared
                .upgrade()
                .map(|shared| shared.send(session_id, &notify))
                .unwrap_or(false)
        })));

        self.shared.connections.insert(name.clone(), connection);
        log_debug!(self.shared.logger, "Added connection `{}`", name);
        true
    }

    pub fn remove_connection(&self, name: &str) -> bool {
        match self.shared.connections.remove(name) {
            Some((_, connection)) => {
                connection.set_responder(None);
                connection.set_notifier(None);
                log_debug!(self.shared.logger, "Removed connection `{}`", name);
                true
            }
            None => false,
        }
    }

    pub fn has_connection(&self, name: &str) -> bool {
        self.shared.connections.contains_key(name)
    }

    pub fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn bind_listener(port: u16) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind 0.0.0.0:{port}"))?;
    let addr = listener
        .local_addr()
        .context("Failed to read the bound address")?;
    Ok((listener, addr))
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => shared.open_session(stream, peer, stop.clone()),
                Err(e) => log_warn!(shared.logger, "Accept failed: {}", e),
            },
        }
    }
    log_debug!(shared.logger, "Listener closed");
}
