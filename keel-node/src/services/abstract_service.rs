// Abstract Service Definition
//
// INTENTION:
// Define the capability every concrete service implements. A service declares its
// identity and dependencies, its function and event schemas, the handlers behind its
// functions, and lifecycle hooks. Everything generic (registries, scheduling, RPC
// exposure, the init/start/stop/deinit state machine) lives in `ServiceBase`.
//
// ARCHITECTURAL PRINCIPLES:
// 1. Declarative Contract - schemas and handlers are declared, registration is automatic
// 2. Lifecycle Hooks - on_init/on_start may refuse, on_stop/on_deinit may not
// 3. Context Access - hooks and handlers reach their ServiceBase through a ServiceContext
// 4. No Self-Registration - services are enumerated by an explicit factory table

use keel_common::logging::Logger;
use keel_common::types::{EventItemMap, EventSchema, FunctionSchema};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::config::SchedulerConfig;
use crate::scheduler::TaskScheduler;
use crate::services::function_registry::FunctionHandlerMap;
use crate::services::service_base::ServiceBase;

/// Immutable identity of a service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAttributes {
    /// Unique key of the service
    pub name: String,
    /// Services that must be running while this one runs, in bind order
    pub dependencies: Vec<String>,
    /// When set the service owns a scheduler; otherwise one must be handed to `init`
    pub scheduler_config: Option<SchedulerConfig>,
}

impl ServiceAttributes {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            scheduler_config: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = Some(config);
        self
    }
}

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

impl ServiceState {
    pub fn is_initialized(&self) -> bool {
        !matches!(self, ServiceState::Uninitialized)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Uninitialized => write!(f, "Uninitialized"),
            ServiceState::Initialized => write!(f, "Initialized"),
            ServiceState::Running => write!(f, "Running"),
            ServiceState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Handle given to hooks and handlers to reach their own ServiceBase
#[derive(Clone)]
pub struct ServiceContext {
    service_name: String,
    logger: Arc<Logger>,
    base: Weak<ServiceBase>,
}

impl ServiceContext {
    pub(crate) fn new(service_name: &str, logger: Arc<Logger>, base: Weak<ServiceBase>) -> Self {
        Self {
            service_name: service_name.to_string(),
            logger,
            base,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Queue an event on the service's "event" group
    pub fn publish_event(&self, name: &str, items: EventItemMap) -> bool {
        self.publish_event_with(name, items, false)
    }

    /// Publish an event, running slots inline when already on the scheduler if `use_dispatch`
    pub fn publish_event_with(&self, name: &str, items: EventItemMap, use_dispatch: bool) -> bool {
        match self.base.upgrade() {
            Some(base) => base.publish_event(name, items, use_dispatch),
            None => false,
        }
    }

    pub fn task_scheduler(&self) -> Option<Arc<TaskScheduler>> {
        self.base.upgrade().and_then(|base| base.task_scheduler())
    }

    pub fn is_running(&self) -> bool {
        self.base
            .upgrade()
            .map(|base| base.is_running())
            .unwrap_or(false)
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("service_name", &self.service_name)
            .finish()
    }
}

/// Capability implemented by every concrete service
pub trait Service: Send + Sync {
    fn attributes(&self) -> &ServiceAttributes;

    fn name(&self) -> &str {
        &self.attributes().name
    }

    /// Called during `init`, before schemas are registered
    fn on_init(&self, _context: &ServiceContext) -> bool {
        true
    }

    /// Called during `deinit`, after the service was stopped
    fn on_deinit(&self, _context: &ServiceContext) {}

    /// Called during `start`, once the service's groups exist
    fn on_start(&self, _context: &ServiceContext) -> bool {
        true
    }

    /// Called during `stop`, before pending work is drained
    fn on_stop(&self, _context: &ServiceContext) {}

    fn function_schemas(&self) -> Vec<FunctionSchema> {
        Vec::new()
    }

    fn event_schemas(&self) -> Vec<EventSchema> {
        Vec::new()
    }

    /// Handlers for the declared functions, keyed by function name
    fn function_handlers(self: Arc<Self>, _context: &ServiceContext) -> FunctionHandlerMap {
        FunctionHandlerMap::new()
    }
}
