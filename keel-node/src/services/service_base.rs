// Service Base Module
//
// INTENTION:
// Generic lifecycle, dispatch and RPC-exposure logic shared by every service. A
// ServiceBase wraps one `Service` implementation and owns its registries, its task
// scheduler (owned or shared) and its optional server connection.
//
// ARCHITECTURAL PRINCIPLES:
// 1. Two-tier locking - a reentrant state lock serializes init/deinit/start/stop; a
//    separate shared/exclusive lock guards the registry, scheduler and connection
//    pointers. Dispatch only ever takes the shared side, and never holds it while a
//    queued task runs.
// 2. Ordered groups - "call", "event" and "request" groups per service run serially,
//    so concurrent callers observe calls and events in submission order.
// 3. Inline fast paths - functions that carry raw buffers or do not require a running
//    service execute on the caller's thread and bypass the groups.
// 4. Explicit results - failures surface as a failed FunctionResult or `false`;
//    transitions that fail part-way are rolled back.

use keel_common::logging::{Component, Logger};
use keel_common::types::{EventItemMap, EventSchema, FunctionResult, FunctionSchema};
use keel_common::{log_debug, log_error, log_info, log_warn, ServiceError};
use parking_lot::{ReentrantMutex, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::DEFAULT_STOP_DRAIN_TIMEOUT_MS;
use crate::rpc::connection::{RemoteRequest, ServerConnection};
use crate::rpc::protocol::{Response, ERROR_FUNCTION_FAILED};
use crate::scheduler::{GroupConfig, TaskScheduler};
use crate::services::abstract_service::{Service, ServiceAttributes, ServiceContext, ServiceState};
use crate::services::event_registry::{EventRegistry, EventSubscription};
use crate::services::function_future::{function_promise, FunctionFuture};
use crate::services::function_registry::{FunctionHandlerMap, FunctionParameters, FunctionRegistry};
use crate::services::rollback::RollbackGuard;

/// Names of the scheduler groups owned by one service
#[derive(Debug, Clone)]
pub struct ServiceGroups {
    pub call: String,
    pub event: String,
    pub request: String,
}

impl ServiceGroups {
    fn new(service_name: &str) -> Self {
        Self {
            call: format!("{service_name}/call"),
            event: format!("{service_name}/event"),
            request: format!("{service_name}/request"),
        }
    }

    fn all(&self) -> [&str; 3] {
        [&self.call, &self.event, &self.request]
    }
}

#[derive(Default)]
struct ServiceResources {
    scheduler: Option<Arc<TaskScheduler>>,
    owns_scheduler: bool,
    functions: Option<Arc<FunctionRegistry>>,
    events: Option<Arc<EventRegistry>>,
    connection: Option<Arc<ServerConnection>>,
}

pub struct ServiceBase {
    service: Arc<dyn Service>,
    attributes: ServiceAttributes,
    logger: Arc<Logger>,
    groups: ServiceGroups,
    state_lock: ReentrantMutex<()>,
    state: RwLock<ServiceState>,
    resources: RwLock<ServiceResources>,
    drain_timeout: Duration,
    self_ref: Weak<ServiceBase>,
}

impl ServiceBase {
    pub fn new(service: Arc<dyn Service>, logger: &Logger) -> Arc<Self> {
        let attributes = service.attributes().clone();
        let logger = Arc::new(
            logger
                .with_component(Component::Service)
                .with_scope(attributes.name.clone()),
        );
        let groups = ServiceGroups::new(&attributes.name);
        Arc::new_cyclic(|self_ref| Self {
            service,
            attributes,
            logger,
            groups,
            state_lock: ReentrantMutex::new(()),
            state: RwLock::new(ServiceState::Uninitialized),
            resources: RwLock::new(ServiceResources::default()),
            drain_timeout: Duration::from_millis(DEFAULT_STOP_DRAIN_TIMEOUT_MS),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.attributes.name
    }

    pub fn attributes(&self) -> &ServiceAttributes {
        &self.attributes
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn groups(&self) -> &ServiceGroups {
        &self.groups
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn is_initialized(&self) -> bool {
        self.state().is_initialized()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn context(&self) -> ServiceContext {
        ServiceContext::new(self.name(), self.logger.clone(), self.self_ref.clone())
    }

    pub fn task_scheduler(&self) -> Option<Arc<TaskScheduler>> {
        self.resources.read().scheduler.clone()
    }

    pub fn server_connection(&self) -> Option<Arc<ServerConnection>> {
        self.resources.read().connection.clone()
    }

    /// Registered function schemas, empty before `init`
    pub fn function_schemas(&self) -> Vec<FunctionSchema> {
        self.resources
            .read()
            .functions
            .as_ref()
            .map(|functions| functions.schemas())
            .unwrap_or_default()
    }

    /// Registered event schemas, empty before `init`
    pub fn event_schemas(&self) -> Vec<EventSchema> {
        self.resources
            .read()
            .events
            .as_ref()
            .map(|events| events.schemas())
            .unwrap_or_default()
    }

    /// Initialize the service.
    ///
    /// A service with its own scheduler config starts a private scheduler; otherwise
    /// `scheduler` must be provided. Idempotent.
    pub fn init(&self, scheduler: Option<Arc<TaskScheduler>>) -> bool {
        let _transition = self.state_lock.lock();
        if self.is_initialized() {
            log_debug!(self.logger, "Already initialized");
            return true;
        }

        let (scheduler, owns_scheduler) = match &self.attributes.scheduler_config {
            Some(config) => {
                let own = Arc::new(TaskScheduler::new(&self.logger));
                if !own.start(config) {
                    log_error!(self.logger, "Failed to start own task scheduler");
                    return false;
                }
                (own, true)
            }
            None => match scheduler {
                Some(shared) => (shared, false),
                None => {
                    log_error!(self.logger, "No task scheduler configured or provided");
                    return false;
                }
            },
        };

        *self.resources.write() = ServiceResources {
            scheduler: Some(scheduler),
            owns_scheduler,
            functions: Some(Arc::new(FunctionRegistry::new(&self.logger))),
            events: Some(Arc::new(EventRegistry::new(&self.logger))),
            connection: None,
        };
        *self.state.write() = ServiceState::Initialized;
        let release_guard = RollbackGuard::new(|| self.release_resources());

        let context = self.context();
        if !self.service.on_init(&context) {
            log_error!(self.logger, "on_init failed");
            return false;
        }
        let deinit_guard = RollbackGuard::new(|| self.service.on_deinit(&context));

        let function_schemas = self.service.function_schemas();
        let handlers = self.service.clone().function_handlers(&context);
        if !self.register_functions(function_schemas, handlers) {
            log_error!(self.logger, "Failed to register functions");
            return false;
        }
        if !self.register_events(self.service.event_schemas()) {
            log_error!(self.logger, "Failed to register events");
            return false;
        }

        deinit_guard.dismiss();
        release_guard.dismiss();
        log_info!(self.logger, "Initialized");
        true
    }

    /// Stop (if running), run `on_deinit` and release registries, scheduler and connection
    pub fn deinit(&self) {
        let _transition = self.state_lock.lock();
        if !self.is_initialized() {
            log_debug!(self.logger, "Not initialized");
            return;
        }

        if self.is_running() {
            self.stop();
        }
        self.service.on_deinit(&self.context());
        self.release_resources();
        log_info!(self.logger, "Deinitialized");
    }

    fn release_resources(&self) {
        let resources = std::mem::take(&mut *self.resources.write());
        *self.state.write() = ServiceState::Uninitialized;

        if let Some(connection) = resources.connection {
            connection.activate(false);
            connection.set_request_handler(None);
        }
        if let Some(functions) = resources.functions {
            functions.clear();
        }
        if let Some(events) = resources.events {
            events.clear();
        }
        if resources.owns_scheduler {
            if let Some(scheduler) = resources.scheduler {
                scheduler.stop();
            }
        }
    }

    /// Configure the service's groups and run `on_start`
    pub fn start(&self) -> bool {
        let _transition = self.state_lock.lock();
        if !self.is_initialized() {
            log_error!(self.logger, "Cannot start: not initialized");
            return false;
        }
        if self.is_running() {
            log_debug!(self.logger, "Already running");
            return true;
        }

        let Some(scheduler) = self.task_scheduler() else {
            log_error!(self.logger, "Cannot start: no task scheduler");
            return false;
        };
        for group in self.groups.all() {
            if !scheduler.configure_group(group, GroupConfig::serial()) {
                log_error!(self.logger, "Failed to configure group `{}`", group);
                return false;
            }
        }

        let previous = self.state();
        *self.state.write() = ServiceState::Running;
        let state_guard = RollbackGuard::new(|| *self.state.write() = previous);

        if !self.service.on_start(&self.context()) {
            log_error!(self.logger, "on_start failed");
            return false;
        }
        state_guard.dismiss();

        if let Some(connection) = self.server_connection() {
            connection.activate(true);
            self.install_request_handler(&connection);
        }
        log_info!(self.logger, "Started");
        true
    }

    /// Run `on_stop`, deactivate the RPC connection and drain the service's groups
    pub fn stop(&self) {
        let _transition = self.state_lock.lock();
        if !self.is_running() {
            log_debug!(self.logger, "Not running");
            return;
        }

        self.service.on_stop(&self.context());
        *self.state.write() = ServiceState::Stopped;

        if let Some(connection) = self.server_connection() {
            connection.activate(false);
            connection.set_request_handler(None);
        }

        if let Some(scheduler) = self.task_scheduler() {
            if scheduler.is_current_thread() {
                log_debug!(self.logger, "Stopping from a scheduler task, not draining");
            } else {
                for group in self.groups.all() {
                    if !scheduler.wait_group(group, self.drain_timeout) {
                        log_warn!(
                            self.logger,
                            "Timed out after {}ms draining group `{}`",
                            self.drain_timeout.as_millis(),
                            group
                        );
                    }
                }
            }
        }
        log_info!(self.logger, "Stopped");
    }

    /// Register functions; every schema needs a handler of the same name.
    /// Nothing is registered if any entry fails.
    pub fn register_functions(&self, schemas: Vec<FunctionSchema>, handlers: FunctionHandlerMap) -> bool {
        let resources = self.resources.write();
        let Some(functions) = resources.functions.as_ref() else {
            log_warn!(self.logger, "Cannot register functions: not initialized");
            return false;
        };

        let mut added: Vec<String> = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let name = schema.name.clone();
            let registered = match handlers.get(&name) {
                Some(handler) => functions.add(schema, handler.clone()),
                None => {
                    log_error!(self.logger, "No handler for function `{}`", name);
                    false
                }
            };
            if !registered {
                for name in &added {
                    functions.remove(name);
                }
                return false;
            }
            added.push(name);
        }
        true
    }

    pub fn unregister_functions(&self, names: &[&str]) -> bool {
        let resources = self.resources.write();
        let Some(functions) = resources.functions.as_ref() else {
            log_warn!(self.logger, "Cannot unregister functions: not initialized");
            return false;
        };
        for name in names {
            if !functions.remove(name) {
                log_debug!(self.logger, "Function `{}` was not registered", name);
            }
        }
        true
    }

    /// Register events. Nothing is registered if any entry fails.
    pub fn register_events(&self, schemas: Vec<EventSchema>) -> bool {
        let resources = self.resources.write();
        let Some(events) = resources.events.as_ref() else {
            log_warn!(self.logger, "Cannot register events: not initialized");
            return false;
        };

        let mut added: Vec<String> = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let name = schema.name.clone();
            if !events.add(schema) {
                for name in &added {
                    events.remove(name);
                }
                return false;
            }
            added.push(name);
        }
        true
    }

    pub fn unregister_events(&self, names: &[&str]) -> bool {
        let resources = self.resources.write();
        let Some(events) = resources.events.as_ref() else {
            log_warn!(self.logger, "Cannot unregister events: not initialized");
            return false;
        };
        for name in names {
            if !events.remove(name) {
                log_debug!(self.logger, "Event `{}` was not registered", name);
            }
        }
        true
    }

    /// Call a function and get a future of its result.
    ///
    /// Raw-buffer functions and functions that do not require a running service run
    /// inline before this returns. Everything else is queued on the "call" group.
    pub fn call_function_async(&self, name: &str, params: impl Into<FunctionParameters>) -> FunctionFuture {
        let (promise, future) = function_promise();

        let (functions, scheduler) = {
            let resources = self.resources.read();
            (resources.functions.clone(), resources.scheduler.clone())
        };
        let Some(functions) = functions else {
            promise.set(ServiceError::NotInitialized(self.name().to_string()).into());
            return future;
        };
        let Some(schema) = functions.schema(name) else {
            promise.set(ServiceError::UnknownFunction(name.to_string()).into());
            return future;
        };
        let params = match params.into().into_map(&schema) {
            Ok(params) => params,
            Err(e) => {
                promise.set(e.into());
                return future;
            }
        };

        let action_logger = self.logger.with_action_path(format!("{}/{}", self.name(), name));
        if schema.has_raw_buffer || !schema.require_running {
            log_debug!(action_logger, "Calling inline");
            promise.set(functions.call(name, params));
            return future;
        }

        if !self.is_running() {
            promise.set(
                ServiceError::NotRunning {
                    service: self.name().to_string(),
                    function: name.to_string(),
                }
                .into(),
            );
            return future;
        }
        let Some(scheduler) = scheduler else {
            promise.set(ServiceError::NotInitialized(self.name().to_string()).into());
            return future;
        };

        let task_promise = promise.clone();
        let function_name = name.to_string();
        let posted = scheduler.post(
            Box::new(move || {
                task_promise.set(functions.call(&function_name, params));
            }),
            Some(&self.groups.call),
        );
        match posted {
            Some(task_id) => log_debug!(action_logger, "Queued as task {}", task_id),
            None => {
                log_warn!(action_logger, "Failed to queue call");
                promise.set(ServiceError::Scheduler(format!("Failed to schedule call to `{name}`")).into());
            }
        }
        future
    }

    /// Call a function and block for at most `timeout`
    pub fn call_function_sync(
        &self,
        name: &str,
        params: impl Into<FunctionParameters>,
        timeout: Duration,
    ) -> FunctionResult {
        self.call_function_async(name, params).wait(timeout)
    }

    /// Validate and publish an event.
    ///
    /// A connected RPC peer is notified first; local slots then run inline for raw
    /// buffers, otherwise on the "event" group (`dispatch` when `use_dispatch`).
    pub fn publish_event(&self, name: &str, items: EventItemMap, use_dispatch: bool) -> bool {
        let (events, scheduler, connection) = {
            let resources = self.resources.read();
            (
                resources.events.clone(),
                resources.scheduler.clone(),
                resources.connection.clone(),
            )
        };
        let Some(events) = events else {
            log_warn!(self.logger, "Cannot publish `{}`: not initialized", name);
            return false;
        };
        let Some(schema) = events.schema(name) else {
            log_warn!(self.logger, "Cannot publish unknown event `{}`", name);
            return false;
        };
        if let Err(e) = events.validate_items(&schema, &items) {
            log_warn!(self.logger, "Cannot publish `{}`: {}", name, e);
            return false;
        }
        if !self.is_running() {
            log_warn!(self.logger, "Cannot publish `{}`: not running", name);
            return false;
        }

        let event_logger = self.logger.with_event_path(format!("{}/{}", self.name(), name));
        if let Some(connection) = connection.filter(|c| c.is_active()) {
            if !connection.notify_event(name, &items) {
                log_warn!(event_logger, "Failed to forward to RPC peers");
            }
        }
        log_debug!(event_logger, "Publishing {} items", items.len());

        if schema.has_raw_buffer {
            return events.emit(name, &items);
        }
        let Some(scheduler) = scheduler else {
            return false;
        };

        let event_name = name.to_string();
        let task = Box::new(move || {
            events.emit(&event_name, &items);
        });
        let group = Some(self.groups.event.as_str());
        let posted = if use_dispatch {
            scheduler.dispatch(task, group)
        } else {
            scheduler.post(task, group)
        };
        posted.is_some()
    }

    /// Attach a local slot to one of this service's events
    pub fn subscribe_event<F>(&self, name: &str, slot: F) -> Result<EventSubscription, ServiceError>
    where
        F: Fn(&str, &EventItemMap) + Send + Sync + 'static,
    {
        let events = self
            .resources
            .read()
            .events
            .clone()
            .ok_or_else(|| ServiceError::NotInitialized(self.name().to_string()))?;
        events.subscribe(name, Arc::new(slot))
    }

    /// Create (or return) this service's RPC connection.
    ///
    /// A running service activates it right away and installs its request handler.
    pub fn connect_to_server(&self) -> Option<Arc<ServerConnection>> {
        let connection = {
            let mut resources = self.resources.write();
            if let Some(existing) = resources.connection.as_ref() {
                return Some(existing.clone());
            }
            let (Some(functions), Some(events)) = (resources.functions.clone(), resources.events.clone())
            else {
                log_warn!(self.logger, "Cannot connect to server: not initialized");
                return None;
            };
            let connection = Arc::new(ServerConnection::new(self.name(), functions, events, &self.logger));
            resources.connection = Some(connection.clone());
            connection
        };

        if self.is_running() {
            connection.activate(true);
            self.install_request_handler(&connection);
        }
        log_debug!(self.logger, "Connected to server");
        Some(connection)
    }

    pub fn disconnect_from_server(&self) {
        let connection = self.resources.write().connection.take();
        if let Some(connection) = connection {
            connection.activate(false);
            connection.set_request_handler(None);
            log_debug!(self.logger, "Disconnected from server");
        }
    }

    fn install_request_handler(&self, connection: &Arc<ServerConnection>) {
        let base = self.self_ref.clone();
        let weak_connection = Arc::downgrade(connection);
        connection.set_request_handler(Some(Box::new(move |request: RemoteRequest| {
            if let (Some(base), Some(connection)) = (base.upgrade(), weak_connection.upgrade()) {
                base.handle_remote_request(&connection, request);
            }
        })));
    }

    // Runs on the reactor: only queue the work
    fn handle_remote_request(&self, connection: &Arc<ServerConnection>, request: RemoteRequest) {
        let (scheduler, functions) = {
            let resources = self.resources.read();
            (resources.scheduler.clone(), resources.functions.clone())
        };
        let (Some(scheduler), Some(functions)) = (scheduler, functions) else {
            connection.respond(
                request.session_id,
                Response::error(
                    request.request_id,
                    ERROR_FUNCTION_FAILED,
                    ServiceError::NotInitialized(self.name().to_string()).to_string(),
                ),
            );
            return;
        };

        let session_id = request.session_id;
        let request_id = request.request_id.clone();
        let weak_connection = Arc::downgrade(connection);
        let logger = self.logger.clone();
        let posted = scheduler.post(
            Box::new(move || {
                let result = invoke_remote(&functions, &request.method, request.params);
                let response = Response::from_function_result(request.request_id, result);
                if let Some(connection) = weak_connection.upgrade() {
                    if !connection.respond(request.session_id, response) {
                        log_warn!(logger, "Failed to respond to `{}`", request.method);
                    }
                }
            }),
            Some(&self.groups.request),
        );
        if posted.is_none() {
            connection.respond(
                session_id,
                Response::error(request_id, ERROR_FUNCTION_FAILED, "Failed to schedule request"),
            );
        }
    }
}

fn invoke_remote(functions: &FunctionRegistry, method: &str, params: Value) -> FunctionResult {
    let Some(schema) = functions.schema(method) else {
        return ServiceError::UnknownFunction(method.to_string()).into();
    };
    match FunctionParameters::Json(params).into_map(&schema) {
        Ok(params) => functions.call(method, params),
        Err(e) => e.into(),
    }
}

impl Drop for ServiceBase {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.deinit();
        }
    }
}

impl std::fmt::Debug for ServiceBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBase")
            .field("name", &self.attributes.name)
            .field("dependencies", &self.attributes.dependencies)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::services::function_registry::HandlerResult;
    use keel_common::params;
    use keel_common::types::{EventItemSchema, FunctionParameterMap, FunctionValue, ParameterSchema, ValueType};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_millis(1000);

    struct EchoService {
        attributes: ServiceAttributes,
        starts: AtomicUsize,
        refuse_start: bool,
    }

    impl EchoService {
        fn new(refuse_start: bool) -> Arc<Self> {
            Arc::new(Self {
                attributes: ServiceAttributes::new("Echo"),
                starts: AtomicUsize::new(0),
                refuse_start,
            })
        }
    }

    impl Service for EchoService {
        fn attributes(&self) -> &ServiceAttributes {
            &self.attributes
        }

        fn on_start(&self, _context: &ServiceContext) -> bool {
            self.starts.fetch_add(1, Ordering::SeqCst);
            !self.refuse_start
        }

        fn function_schemas(&self) -> Vec<FunctionSchema> {
            vec![
                FunctionSchema::new("echo").with_parameter(ParameterSchema::new("text", ValueType::String)),
                FunctionSchema::new("version").with_require_running(false),
            ]
        }

        fn event_schemas(&self) -> Vec<EventSchema> {
            vec![EventSchema::new("echoed").with_item(EventItemSchema::new("text", ValueType::String))]
        }

        fn function_handlers(self: Arc<Self>, context: &ServiceContext) -> FunctionHandlerMap {
            let mut handlers = FunctionHandlerMap::new();
            let publisher = context.clone();
            handlers.insert(
                "echo".to_string(),
                Arc::new(move |params: FunctionParameterMap| -> HandlerResult {
                    let text = params.get("text").cloned().unwrap_or(FunctionValue::from(""));
                    publisher.publish_event_with("echoed", params!("text" => text.clone()), true);
                    Ok(Some(text))
                }),
            );
            handlers.insert(
                "version".to_string(),
                Arc::new(|_: FunctionParameterMap| -> HandlerResult { Ok(Some(FunctionValue::from("1.0"))) }),
            );
            handlers
        }
    }

    fn shared_scheduler() -> Arc<TaskScheduler> {
        let scheduler = Arc::new(TaskScheduler::new(&Logger::new_root(Component::Test, "svc-test")));
        assert!(scheduler.start(&SchedulerConfig::default()));
        scheduler
    }

    #[test]
    fn test_lifecycle_and_dispatch() {
        let scheduler = shared_scheduler();
        let base = ServiceBase::new(EchoService::new(false), &Logger::new_root(Component::Test, "svc-test"));

        let result = base.call_function_sync("version", (), WAIT);
        assert_eq!(result.error_message, "Service `Echo` is not initialized");

        assert!(base.init(Some(scheduler.clone())));
        assert_eq!(base.state(), ServiceState::Initialized);
        assert_eq!(base.function_schemas().len(), 2);

        // Not-running functions work before start, the others do not
        let result = base.call_function_sync("version", (), WAIT);
        assert_eq!(result.data, Some(FunctionValue::from("1.0")));
        let result = base.call_function_sync("echo", params!("text" => "hi"), WAIT);
        assert!(!result.success);
        assert!(result.error_message.contains("is not running"));

        assert!(base.start());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let subscription = base
            .subscribe_event("echoed", move |_, items| {
                if let Some(text) = items.get("text").and_then(|v| v.as_str()) {
                    sink.lock().push(text.to_string());
                }
            })
            .unwrap();

        let result = base.call_function_sync("echo", vec![FunctionValue::from("hi")], WAIT);
        assert_eq!(result.data, Some(FunctionValue::from("hi")));
        let result = base.call_function_sync("missing", (), WAIT);
        assert_eq!(result.error_message, "Function `missing` not found");

        assert!(scheduler.wait_all(WAIT));
        assert_eq!(*received.lock(), vec!["hi".to_string()]);
        assert!(subscription.is_connected());

        base.stop();
        assert_eq!(base.state(), ServiceState::Stopped);
        assert!(!base.publish_event("echoed", params!("text" => "late"), false));

        base.deinit();
        assert_eq!(base.state(), ServiceState::Uninitialized);
        assert!(base.function_schemas().is_empty());
        assert!(!subscription.is_connected());
        scheduler.stop();
    }

    #[test]
    fn test_failed_start_reverts_state() {
        let scheduler = shared_scheduler();
        let service = EchoService::new(true);
        let base = ServiceBase::new(service.clone(), &Logger::new_root(Component::Test, "svc-test"));

        assert!(base.init(Some(scheduler.clone())));
        assert!(!base.start());
        assert_eq!(base.state(), ServiceState::Initialized);
        assert_eq!(service.starts.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[test]
    fn test_init_requires_a_scheduler() {
        let base = ServiceBase::new(EchoService::new(false), &Logger::new_root(Component::Test, "svc-test"));
        assert!(!base.init(None));
        assert_eq!(base.state(), ServiceState::Uninitialized);
    }

    #[test]
    fn test_publish_rejects_invalid_items() {
        let scheduler = shared_scheduler();
        let base = ServiceBase::new(EchoService::new(false), &Logger::new_root(Component::Test, "svc-test"));
        assert!(base.init(Some(scheduler.clone())));
        assert!(base.start());

        assert!(!base.publish_event("echoed", params!("text" => 7), false));
        assert!(!base.publish_event("echoed", EventItemMap::new(), false));
        assert!(!base.publish_event("unknown", params!("text" => "x"), false));
        assert!(base.publish_event("echoed", params!("text" => "x"), false));

        base.deinit();
        scheduler.stop();
    }
}
