// RPC Client Module
//
// INTENTION:
// Call functions of services exposed by a remote manager and receive their events.
// Network I/O runs on the manager's reactor; callers block on a per-request channel
// with their own timeout, so the client is usable from any non-reactor thread.

use anyhow::{anyhow, Context};
use dashmap::DashMap;
use keel_common::logging::{Component, Logger};
use keel_common::types::FunctionResult;
use keel_common::{log_debug, log_error, log_info, log_warn, ServiceError};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::protocol::{
    encode_frame, Incoming, Notify, Request, Response, ERROR_FUNCTION_FAILED, SUBSCRIBE_EVENT_METHOD,
    SUBSCRIBE_EVENT_PARAM, UNSUBSCRIBE_EVENTS_METHOD, UNSUBSCRIBE_EVENTS_PARAM,
};
use crate::config::RpcClientConfig;
use crate::services::function_registry::panic_message;

/// Callback for remote events: (event name, event data object)
pub type EventCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct ClientShared {
    logger: Arc<Logger>,
    pending: DashMap<String, std_mpsc::SyncSender<Response>>,
    callbacks: DashMap<String, EventCallback>,
    outgoing: RwLock<Option<mpsc::UnboundedSender<String>>>,
}

impl ClientShared {
    fn fail_pending(&self, message: &str) {
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((id, waiter)) = self.pending.remove(&id) {
                let _ = waiter.try_send(Response::error(id, ERROR_FUNCTION_FAILED, message));
            }
        }
    }

    fn on_frame(&self, line: &str) {
        match serde_json::from_str::<Incoming>(line) {
            Ok(Incoming::Response(response)) => match self.pending.remove(&response.id) {
                Some((_, waiter)) => {
                    let _ = waiter.try_send(response);
                }
                None => log_debug!(self.logger, "Dropping late response `{}`", response.id),
            },
            Ok(Incoming::Notify(notify)) => self.on_notify(notify),
            Err(e) => log_warn!(self.logger, "Unparsable frame from server: {}", e),
        }
    }

    fn on_notify(&self, notify: Notify) {
        for subscription_id in &notify.subscription_ids {
            let callback = self
                .callbacks
                .get(subscription_id)
                .map(|entry| entry.value().clone());
            let Some(callback) = callback else {
                continue;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(&notify.event, &notify.data)));
            if let Err(panic) = outcome {
                log_error!(
                    self.logger,
                    "Callback of `{}` panicked: {}",
                    notify.event,
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    /// Pump frames until EOF or `stop`, then clear `outgoing` unless a newer
    /// connection already replaced it
    async fn read_loop(
        &self,
        reader: OwnedReadHalf,
        own_outgoing: mpsc::UnboundedSender<String>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            self.on_frame(&line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log_debug!(self.logger, "Read failed: {}", e);
                        break;
                    }
                },
            }
        }
        {
            let mut outgoing = self.outgoing.write();
            if outgoing
                .as_ref()
                .map(|current| current.same_channel(&own_outgoing))
                .unwrap_or(false)
            {
                *outgoing = None;
            }
        }
        self.fail_pending("Connection closed");
    }
}

async fn open_stream(address: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| anyhow!("Connecting to {address} timed out"))?
        .with_context(|| format!("Failed to connect to {address}"))?;
    stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
    Ok(stream)
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queued: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = queued.recv().await {
        if writer.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Line-JSON client for a remote manager's RPC server
pub struct RpcClient {
    config: RpcClientConfig,
    reactor: Handle,
    shared: Arc<ClientShared>,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig, reactor: Handle, logger: &Logger) -> Self {
        Self {
            config,
            reactor,
            shared: Arc::new(ClientShared {
                logger: Arc::new(logger.with_component(Component::Rpc).with_scope("client")),
                pending: DashMap::new(),
                callbacks: DashMap::new(),
                outgoing: RwLock::new(None),
            }),
            stop: Mutex::new(None),
        }
    }

    /// Budget used by callers that have no timeout of their own
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    /// Connect to `host:port`. Must not be called from the reactor thread.
    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let mut stop_slot = self.stop.lock();
        if stop_slot.is_some() && self.is_connected() {
            log_debug!(self.shared.logger, "Already connected");
            return true;
        }

        let (ready, connected) = std_mpsc::sync_channel::<Result<(), String>>(1);
        let (stop, stopped) = watch::channel(false);
        let (outgoing, queued) = mpsc::unbounded_channel::<String>();
        let shared = self.shared.clone();
        let address = format!("{host}:{port}");
        let target = address.clone();

        self.reactor.spawn(async move {
            let stream = match open_stream(&target, timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready.send(Err(format!("{e:#}")));
                    return;
                }
            };
            let (reader, writer) = stream.into_split();
            tokio::spawn(write_loop(writer, queued));
            *shared.outgoing.write() = Some(outgoing.clone());
            let _ = ready.send(Ok(()));
            shared.read_loop(reader, outgoing, stopped).await;
        });

        match connected.recv_timeout(timeout) {
            Ok(Ok(())) => {
                *stop_slot = Some(stop);
                log_info!(self.shared.logger, "Connected to {}", address);
                true
            }
            Ok(Err(e)) => {
                log_warn!(self.shared.logger, "{}", e);
                false
            }
            Err(_) => {
                let _ = stop.send(true);
                log_warn!(
                    self.shared.logger,
                    "Timed out after {}ms connecting to {}",
                    timeout.as_millis(),
                    address
                );
                false
            }
        }
    }

    /// Close the connection and fail every pending request
    pub fn disconnect(&self) {
        let Some(stop) = self.stop.lock().take() else {
            return;
        };
        let _ = stop.send(true);
        *self.shared.outgoing.write() = None;
        self.shared.fail_pending("Connection closed");
        self.shared.callbacks.clear();
        log_info!(self.shared.logger, "Disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outgoing.read().is_some()
    }

    /// Send one request and wait for its response
    pub fn request(&self, service: &str, method: &str, params: Value, timeout: Duration) -> Result<Response, ServiceError> {
        let id = Uuid::new_v4().to_string();
        let frame = encode_frame(&Request {
            id: id.clone(),
            service: service.to_string(),
            method: method.to_string(),
            params,
        })
        .map_err(|e| ServiceError::Validation(format!("Invalid request: {e}")))?;

        let (waiter, answer) = std_mpsc::sync_channel::<Response>(1);
        self.shared.pending.insert(id.clone(), waiter);

        let sent = self
            .shared
            .outgoing
            .read()
            .as_ref()
            .map(|outgoing| outgoing.send(frame).is_ok())
            .unwrap_or(false);
        if !sent {
            self.shared.pending.remove(&id);
            return Err(ServiceError::Transport("Not connected".to_string()));
        }

        match answer.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                self.shared.pending.remove(&id);
                Err(ServiceError::Timeout(format!(
                    "Timeout after {}ms",
                    timeout.as_millis()
                )))
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                Err(ServiceError::Transport("Connection closed".to_string()))
            }
        }
    }

    /// Call `function` of the remote `service`
    pub fn call_function(&self, service: &str, function: &str, params: Value, timeout: Duration) -> FunctionResult {
        match self.request(service, function, params, timeout) {
            Ok(response) => response.into_function_result(),
            Err(e) => e.into(),
        }
    }

    /// Subscribe to a remote event. Returns the subscription id.
    pub fn subscribe_event<F>(
        &self,
        service: &str,
        event: &str,
        callback: F,
        timeout: Duration,
    ) -> Result<String, ServiceError>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let params = json!({ SUBSCRIBE_EVENT_PARAM: event });
        let response = self.request(service, SUBSCRIBE_EVENT_METHOD, params, timeout)?;
        if let Some(error) = response.error {
            return Err(ServiceError::Transport(error.message));
        }
        let Some(Value::String(subscription_id)) = response.result else {
            return Err(ServiceError::Transport("Invalid subscription id".to_string()));
        };
        self.shared
            .callbacks
            .insert(subscription_id.clone(), Arc::new(callback));
        log_debug!(self.shared.logger, "Subscribed to `{}/{}`", service, event);
        Ok(subscription_id)
    }

    /// Drop subscriptions by id. Returns the ids the server removed.
    pub fn unsubscribe_events(
        &self,
        service: &str,
        subscription_ids: &[String],
        timeout: Duration,
    ) -> Result<Vec<String>, ServiceError> {
        for id in subscription_ids {
            self.shared.callbacks.remove(id);
        }
        let params = json!({ UNSUBSCRIBE_EVENTS_PARAM: subscription_ids });
        let response = self.request(service, UNSUBSCRIBE_EVENTS_METHOD, params, timeout)?;
        if let Some(error) = response.error {
            return Err(ServiceError::Transport(error.message));
        }
        let removed = match response.result {
            Some(Value::Array(ids)) => ids
                .into_iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        Ok(removed)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
