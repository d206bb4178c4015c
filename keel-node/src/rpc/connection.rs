// Server Connection Module
//
// INTENTION:
// The RPC-facing side of one service. A connection is identified by its service name
// and is built from that service's registries. The server routes requests to it; the
// connection answers the built-in subscription methods itself and hands everything else
// to the request handler its ServiceBase installed. Event notifications for remote
// peers leave through the notifier the server installed.
//
// A connection is only active while its service runs.

use arc_swap::ArcSwapOption;
use keel_common::logging::{Component, Logger};
use keel_common::types::EventItemMap;
use keel_common::{log_debug, log_warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::protocol::{
    Notify, Response, ERROR_CONNECTION_INACTIVE, ERROR_FUNCTION_FAILED, ERROR_INVALID_PARAMS,
    SUBSCRIBE_EVENT_METHOD, SUBSCRIBE_EVENT_PARAM, UNSUBSCRIBE_EVENTS_METHOD,
    UNSUBSCRIBE_EVENTS_PARAM,
};
use crate::services::event_registry::EventRegistry;
use crate::services::function_registry::FunctionRegistry;

/// Identifier of a TCP peer session on the server
pub type SessionId = u64;

/// A remote function call routed to a connection
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub session_id: SessionId,
    pub request_id: String,
    pub method: String,
    pub params: Value,
}

/// Installed by the ServiceBase; must not block (it runs on the reactor)
pub type RequestHandler = Box<dyn Fn(RemoteRequest) + Send + Sync>;

/// Installed by the server to send a response to a peer
pub type Responder = Box<dyn Fn(SessionId, Response) -> bool + Send + Sync>;

/// Installed by the server to send a notification to a peer
pub type Notifier = Box<dyn Fn(SessionId, Notify) -> bool + Send + Sync>;

pub struct ServerConnection {
    name: String,
    logger: Arc<Logger>,
    functions: Arc<FunctionRegistry>,
    events: Arc<EventRegistry>,
    active: AtomicBool,
    request_handler: ArcSwapOption<RequestHandler>,
    responder: ArcSwapOption<Responder>,
    notifier: ArcSwapOption<Notifier>,
    session_subscriptions: Mutex<HashMap<SessionId, HashSet<String>>>,
}

impl ServerConnection {
    pub fn new(
        name: &str,
        functions: Arc<FunctionRegistry>,
        events: Arc<EventRegistry>,
        logger: &Logger,
    ) -> Self {
        Self {
            name: name.to_string(),
            logger: Arc::new(logger.with_component(Component::Rpc)),
            functions,
            events,
            active: AtomicBool::new(false),
            request_handler: ArcSwapOption::empty(),
            responder: ArcSwapOption::empty(),
            notifier: ArcSwapOption::empty(),
            session_subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Connection id: the service name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn activate(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        log_debug!(self.logger, "Connection `{}` active: {}", self.name, active);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_request_handler(&self, handler: Option<RequestHandler>) {
        self.request_handler.store(handler.map(Arc::new));
    }

    pub fn set_responder(&self, responder: Option<Responder>) {
        self.responder.store(responder.map(Arc::new));
    }

    pub fn set_notifier(&self, notifier: Option<Notifier>) {
        self.notifier.store(notifier.map(Arc::new));
    }

    /// Route a request. `Some` is an immediate answer; `None` means the
    /// request handler will answer later through `respond`.
    pub fn on_request(&self, request: RemoteRequest) -> Option<Response> {
        let id = request.request_id.clone();
        if !self.is_active() {
            return Some(Response::error(
                id,
                ERROR_CONNECTION_INACTIVE,
                format!("Connection(`{}`) not active", self.name),
            ));
        }

        let method = request.method.clone();
        match method.as_str() {
            SUBSCRIBE_EVENT_METHOD => Some(self.subscribe(request)),
            UNSUBSCRIBE_EVENTS_METHOD => Some(self.unsubscribe(request)),
            method => {
                if !self.functions.contains(method) {
                    return Some(Response::error(
                        id,
                        ERROR_FUNCTION_FAILED,
                        format!("Function `{method}` not found"),
                    ));
                }
                let Some(handler) = self.request_handler.load_full() else {
                    return Some(Response::error(
                        id,
                        ERROR_FUNCTION_FAILED,
                        format!("Connection(`{}`) has no request handler", self.name),
                    ));
                };
                (**handler)(request);
                None
            }
        }
    }

    fn subscribe(&self, request: RemoteRequest) -> Response {
        let Some(event_name) = request
            .params
            .get(SUBSCRIBE_EVENT_PARAM)
            .and_then(Value::as_str)
        else {
            return Response::error(
                request.request_id,
                ERROR_INVALID_PARAMS,
                format!("Missing required parameter: `{SUBSCRIBE_EVENT_PARAM}`"),
            );
        };

        match self.events.on_rpc_subscribe(event_name) {
            Ok(subscription_id) => {
                self.session_subscriptions
                    .lock()
                    .entry(request.session_id)
                    .or_default()
                    .insert(subscription_id.clone());
                log_debug!(
                    self.logger,
                    "Session {} subscribed to `{}` as {}",
                    request.session_id,
                    event_name,
                    subscription_id
                );
                Response::ok(request.request_id, Some(Value::String(subscription_id)))
            }
            Err(e) => Response::error(request.request_id, ERROR_FUNCTION_FAILED, e.to_string()),
        }
    }

    fn unsubscribe(&self, request: RemoteRequest) -> Response {
        let Some(ids) = request
            .params
            .get(UNSUBSCRIBE_EVENTS_PARAM)
            .and_then(Value::as_array)
        else {
            return Response::error(
                request.request_id,
                ERROR_INVALID_PARAMS,
                format!("Missing required parameter: `{UNSUBSCRIBE_EVENTS_PARAM}`"),
            );
        };

        let ids: HashSet<String> = ids
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        self.events.on_rpc_unsubscribe(&ids);
        if let Some(owned) = self.session_subscriptions.lock().get_mut(&request.session_id) {
            owned.retain(|id| !ids.contains(id));
        }

        let mut removed: Vec<String> = ids.into_iter().collect();
        removed.sort();
        Response::ok(
            request.request_id,
            Some(Value::Array(removed.into_iter().map(Value::String).collect())),
        )
    }

    /// Send a deferred response
    pub fn respond(&self, session_id: SessionId, response: Response) -> bool {
        match self.responder.load_full() {
            Some(responder) => (**responder)(session_id, response),
            None => {
                log_warn!(self.logger, "Connection `{}` has no responder", self.name);
                false
            }
        }
    }

    /// Forward an event to every peer subscribed to it
    pub fn notify_event(&self, event_name: &str, items: &EventItemMap) -> bool {
        let wanted = self.events.rpc_subscriptions(event_name);
        if wanted.is_empty() {
            return true;
        }
        let Some(notifier) = self.notifier.load_full() else {
            log_warn!(self.logger, "Connection `{}` has no notifier", self.name);
            return false;
        };

        let targets: Vec<(SessionId, Vec<String>)> = self
            .session_subscriptions
            .lock()
            .iter()
            .filter_map(|(session_id, owned)| {
                let mut ids: Vec<String> = owned.intersection(&wanted).cloned().collect();
                if ids.is_empty() {
                    return None;
                }
                ids.sort();
                Some((*session_id, ids))
            })
            .collect();

        let mut all_sent = true;
        for (session_id, ids) in targets {
            let notify = Notify::from_items(event_name, items, ids);
            if !(**notifier)(session_id, notify) {
                log_warn!(self.logger, "Failed to notify session {} of `{}`", session_id, event_name);
                all_sent = false;
            }
        }
        all_sent
    }

    /// Drop everything a closed peer subscribed to
    pub fn on_session_closed(&self, session_id: SessionId) {
        let owned = self.session_subscriptions.lock().remove(&session_id);
        if let Some(owned) = owned {
            if !owned.is_empty() {
                self.events.on_rpc_unsubscribe(&owned);
            }
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}
