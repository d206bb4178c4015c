// Service Manager Module
//
// INTENTION:
// Own every service of a process: instantiate them from an explicit factory table,
// add them in dependency order, and start/stop them on demand through
// reference-counted bindings. The manager also owns the I/O reactor, the RPC server
// and the bookkeeping of RPC clients.
//
// ARCHITECTURAL PRINCIPLES:
// 1. Explicit Root - a ServiceManager is constructed and passed around, never global
// 2. Bindings Drive Lifecycle - the first binding starts a service, the last stops it
// 3. No Blocking Under Lock - start/stop run with the service map unlocked and are
//    revalidated afterwards
// 4. Partial Progress - cycles and failed services are logged, the rest still come up

pub mod reactor;
pub mod topology;
pub(crate) mod transition;

use keel_common::logging::{Component, Logger};
use keel_common::types::FunctionResult;
use keel_common::{log_debug, log_error, log_info, log_warn, ServiceError};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::config::{ManagerConfig, ManagerStartConfig, RpcClientConfig, RpcServerConfig};
use crate::rpc::{RpcClient, RpcServer};
use crate::scheduler::TaskScheduler;
use crate::services::{Service, ServiceBase, ServiceBinding, ServiceFactoryTable};

pub use reactor::Reactor;
pub use topology::{sort_services, TopologyOutcome};
use transition::{Prepared, Removal, TransitionMap};

struct ServiceEntry {
    base: Arc<ServiceBase>,
    ref_count: usize,
}

enum BindOutcome {
    Bound(Arc<ServiceBase>),
    Vanished { base: Arc<ServiceBase>, started: bool },
    Failed,
}

enum UnbindOutcome {
    Released,
    Stopped,
    NotBound,
    Missing,
}

#[derive(Default)]
struct RpcState {
    server: Option<Arc<RpcServer>>,
    clients: Vec<Weak<RpcClient>>,
}

pub struct ServiceManager {
    logger: Arc<Logger>,
    config: ManagerConfig,
    factories: ServiceFactoryTable,
    scheduler: Arc<TaskScheduler>,
    services: TransitionMap<ServiceEntry>,
    add_order: Mutex<Vec<String>>,
    init_lock: Mutex<bool>,
    reactor: Reactor,
    rpc: RwLock<RpcState>,
    self_ref: Weak<ServiceManager>,
}

impl ServiceManager {
    pub fn new(factories: ServiceFactoryTable, config: ManagerConfig) -> Arc<Self> {
        if let Some(logging) = &config.logging {
            logging.apply();
        }
        let logger = Arc::new(Logger::new_root(Component::Manager, &config.node_id));
        let scheduler = Arc::new(TaskScheduler::new(&logger));
        let reactor = Reactor::new(Arc::new(logger.with_scope("reactor")));

        Arc::new_cyclic(|self_ref| Self {
            logger,
            config,
            factories,
            scheduler,
            services: TransitionMap::new(),
            add_order: Mutex::new(Vec::new()),
            init_lock: Mutex::new(false),
            reactor,
            rpc: RwLock::new(RpcState::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Scheduler shared by every service without its own
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    fn ensure_scheduler(&self) -> bool {
        self.scheduler.is_running() || self.scheduler.start(&self.config.scheduler)
    }

    /// Instantiate every factory and add the services in dependency order.
    ///
    /// Returns `false` when a cycle was found or a service failed to initialize;
    /// every service that could be added still is. Idempotent.
    pub fn init(&self) -> bool {
        let mut initialized = self.init_lock.lock();
        if *initialized {
            log_debug!(self.logger, "Already initialized");
            return true;
        }
        if !self.ensure_scheduler() {
            log_error!(self.logger, "Failed to start the task scheduler");
            return false;
        }

        let mut instances: HashMap<String, Arc<dyn Service>> = HashMap::with_capacity(self.factories.len());
        let mut graph: Vec<(String, Vec<String>)> = Vec::with_capacity(self.factories.len());
        for (factory_name, factory) in self.factories.iter() {
            let service = factory();
            let name = service.name().to_string();
            if name != factory_name {
                log_warn!(
                    self.logger,
                    "Factory `{}` produced service `{}`, using the service name",
                    factory_name,
                    name
                );
            }
            if instances.contains_key(&name) {
                log_error!(self.logger, "Duplicate service `{}`, skipping", name);
                continue;
            }
            graph.push((name.clone(), service.attributes().dependencies.clone()));
            instances.insert(name, service);
        }

        let outcome = sort_services(&graph, &self.logger);
        let mut all_added = true;
        if let TopologyOutcome::CycleDetected { involved, .. } = &outcome {
            log_error!(self.logger, "{}", ServiceError::CycleDetected(involved.clone()));
            all_added = false;
        }
        for name in outcome.resolved() {
            if let Some(service) = instances.remove(name) {
                if !self.add_service(service) {
                    all_added = false;
                }
            }
        }

        *initialized = true;
        log_info!(
            self.logger,
            "Initialized {} of {} services",
            self.add_order.lock().len(),
            graph.len()
        );
        all_added
    }

    /// Stop the reactor, remove every service in reverse add order and stop the scheduler.
    /// Services still bound are stopped anyway.
    pub fn deinit(&self) {
        let mut initialized = self.init_lock.lock();
        self.stop();

        let names: Vec<String> = self.add_order.lock().iter().rev().cloned().collect();
        for name in names {
            match self.services.remove_if(&name, |_| true) {
                Removal::Removed(entry) => {
                    if entry.ref_count > 0 {
                        log_warn!(
                            self.logger,
                            "Service `{}` still has {} bindings, stopping it anyway",
                            name,
                            entry.ref_count
                        );
                    }
                    entry.base.deinit();
                }
                Removal::Refused | Removal::Missing => {}
            }
        }
        self.add_order.lock().clear();

        self.scheduler.stop();
        if *initialized {
            log_info!(self.logger, "Deinitialized");
        }
        *initialized = false;
    }

    /// Register and initialize a service. Adding a known name is a no-op.
    pub fn add_service(&self, service: Arc<dyn Service>) -> bool {
        let name = service.name().to_string();
        if self.services.contains(&name) {
            log_debug!(self.logger, "Service `{}` already added", name);
            return true;
        }
        if !self.ensure_scheduler() {
            log_error!(self.logger, "Cannot add `{}`: task scheduler not running", name);
            return false;
        }

        let base = ServiceBase::new(service, &self.logger);
        if !base.init(Some(self.scheduler.clone())) {
            log_error!(self.logger, "Failed to initialize service `{}`", name);
            return false;
        }
        if !self.services.insert(
            &name,
            ServiceEntry {
                base: base.clone(),
                ref_count: 0,
            },
        ) {
            // Lost a race against another add of the same name
            base.deinit();
            return true;
        }
        self.add_order.lock().push(name.clone());
        log_info!(self.logger, "Added service `{}`", name);
        true
    }

    /// Deinitialize and forget a service. Refused while the service is bound.
    pub fn remove_service(&self, name: &str) -> bool {
        match self.services.remove_if(name, |entry| entry.ref_count == 0) {
            Removal::Removed(entry) => {
                self.add_order.lock().retain(|added| added != name);
                self.detach_connection(name);
                entry.base.deinit();
                log_info!(self.logger, "Removed service `{}`", name);
                true
            }
            Removal::Refused => {
                log_warn!(self.logger, "Cannot remove `{}` while it is bound", name);
                false
            }
            Removal::Missing => {
                log_debug!(self.logger, "Service `{}` not found", name);
                true
            }
        }
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<ServiceBase>> {
        self.services.read(name, |entry| entry.base.clone())
    }

    /// Names of all services, in add order
    pub fn service_names(&self) -> Vec<String> {
        self.add_order.lock().clone()
    }

    /// Live bindings to a service, `None` for unknown names
    pub fn reference_count(&self, name: &str) -> Option<usize> {
        self.services.read(name, |entry| entry.ref_count)
    }

    /// Bind a service and, first, its dependencies. The service starts on its first
    /// binding. Returns an invalid binding if it or any dependency cannot be bound.
    pub fn bind(&self, name: &str) -> ServiceBinding {
        self.bind_chain(name, &mut Vec::new())
    }

    fn bind_chain(&self, name: &str, chain: &mut Vec<String>) -> ServiceBinding {
        if chain.iter().any(|bound| bound == name) {
            let mut involved = chain.clone();
            involved.push(name.to_string());
            log_error!(self.logger, "{}", ServiceError::CycleDetected(involved));
            return ServiceBinding::invalid();
        }
        let Some(dependencies) = self
            .services
            .read(name, |entry| entry.base.attributes().dependencies.clone())
        else {
            log_warn!(self.logger, "{}", ServiceError::UnknownService(name.to_string()));
            return ServiceBinding::invalid();
        };

        chain.push(name.to_string());
        let mut acquired = Vec::with_capacity(dependencies.len());
        for dependency in &dependencies {
            let binding = self.bind_chain(dependency, chain);
            if !binding.is_valid() {
                log_error!(
                    self.logger,
                    "{}",
                    ServiceError::DependencyFailure {
                        service: name.to_string(),
                        dependency: dependency.clone(),
                    }
                );
                chain.pop();
                release_in_reverse(acquired);
                return ServiceBinding::invalid();
            }
            acquired.push(binding);
        }
        chain.pop();

        // The RPC connection table is updated inside the busy window of the key, so
        // a racing unbind cannot detach what this bind re-attached
        let outcome = self.services.optimistic_transition(
            name,
            |entry: Option<&mut ServiceEntry>| match entry {
                None => Prepared::Commit(BindOutcome::Failed),
                Some(entry) if entry.ref_count > 0 || entry.base.is_running() => {
                    entry.ref_count += 1;
                    Prepared::Commit(BindOutcome::Bound(entry.base.clone()))
                }
                Some(entry) => Prepared::Blocking(entry.base.clone()),
            },
            |base: Arc<ServiceBase>| {
                let started = base.start();
                if started {
                    self.reattach_connection(&base);
                }
                (base, started)
            },
            |entry: Option<&mut ServiceEntry>, (base, started): (Arc<ServiceBase>, bool)| match entry {
                Some(entry) if started => {
                    entry.ref_count += 1;
                    BindOutcome::Bound(base)
                }
                Some(_) => BindOutcome::Failed,
                None => BindOutcome::Vanished { base, started },
            },
        );

        let base = match outcome {
            BindOutcome::Bound(base) => base,
            BindOutcome::Vanished { base, started } => {
                log_warn!(self.logger, "Service `{}` was removed while starting", name);
                if started {
                    base.stop();
                    self.detach_connection(name);
                }
                release_in_reverse(acquired);
                return ServiceBinding::invalid();
            }
            BindOutcome::Failed => {
                log_error!(self.logger, "Failed to start service `{}`", name);
                release_in_reverse(acquired);
                return ServiceBinding::invalid();
            }
        };

        log_debug!(self.logger, "Bound `{}`", name);
        let manager = self.self_ref.clone();
        let unbind_name = name.to_string();
        ServiceBinding::new(
            base,
            Box::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.unbind(&unbind_name);
                }
            }),
            acquired,
        )
    }

    /// Drop one binding reference. The last one stops the service and takes its
    /// connection out of the RPC server. Normally called by `ServiceBinding::release`.
    pub fn unbind(&self, name: &str) -> bool {
        let outcome = self.services.optimistic_transition(
            name,
            |entry: Option<&mut ServiceEntry>| match entry {
                None => Prepared::Commit(UnbindOutcome::Missing),
                Some(entry) if entry.ref_count == 0 => Prepared::Commit(UnbindOutcome::NotBound),
                Some(entry) => {
                    let should_stop = entry.ref_count == 1 && entry.base.is_running();
                    entry.ref_count -= 1;
                    if should_stop {
                        Prepared::Blocking(entry.base.clone())
                    } else {
                        Prepared::Commit(UnbindOutcome::Released)
                    }
                }
            },
            |base: Arc<ServiceBase>| {
                base.stop();
                self.detach_connection(base.name());
            },
            |_: Option<&mut ServiceEntry>, ()| UnbindOutcome::Stopped,
        );

        match outcome {
            UnbindOutcome::Released => true,
            UnbindOutcome::Stopped => {
                log_debug!(self.logger, "Unbound and stopped `{}`", name);
                true
            }
            UnbindOutcome::NotBound => {
                log_warn!(self.logger, "Service `{}` is not bound", name);
                false
            }
            UnbindOutcome::Missing => {
                log_warn!(self.logger, "{}", ServiceError::UnknownService(name.to_string()));
                false
            }
        }
    }

    /// Start the I/O reactor used by RPC
    pub fn start(&self, config: ManagerStartConfig) -> bool {
        self.reactor.start(&config)
    }

    /// Stop the RPC server and the reactor
    pub fn stop(&self) {
        self.stop_rpc_server();
        let clients = std::mem::take(&mut self.rpc.write().clients);
        for client in clients.iter().filter_map(Weak::upgrade) {
            client.disconnect();
        }
        self.reactor.stop();
    }

    pub fn is_initialized(&self) -> bool {
        *self.init_lock.lock()
    }

    pub fn is_started(&self) -> bool {
        self.reactor.is_running()
    }

    pub fn start_rpc_server(&self, config: RpcServerConfig, timeout: Duration) -> bool {
        let Some(handle) = self.reactor.handle() else {
            log_error!(self.logger, "Cannot start RPC server: manager not started");
            return false;
        };
        if self.rpc.read().server.is_some() {
            log_debug!(self.logger, "RPC server already running");
            return true;
        }

        let server = Arc::new(RpcServer::new(config, handle, &self.logger));
        if !server.start(timeout) {
            return false;
        }
        let mut rpc = self.rpc.write();
        if rpc.server.is_some() {
            server.stop();
            return true;
        }
        rpc.server = Some(server);
        true
    }

    pub fn stop_rpc_server(&self) {
        let server = self.rpc.write().server.take();
        if let Some(server) = server {
            server.stop();
        }
    }

    pub fn rpc_server(&self) -> Option<Arc<RpcServer>> {
        self.rpc.read().server.clone()
    }

    /// Expose services through the RPC server; all services when `names` is empty.
    /// On failure every connection made by this call is undone.
    pub fn connect_rpc_server_to_services(&self, names: &[&str]) -> bool {
        let Some(server) = self.rpc_server() else {
            log_error!(self.logger, "Cannot connect services: RPC server not started");
            return false;
        };

        let targets = self.resolve_targets(names);
        let mut connected: Vec<Arc<ServiceBase>> = Vec::with_capacity(targets.len());
        for name in &targets {
            let Some(base) = self.get_service(name) else {
                log_error!(self.logger, "{}", ServiceError::UnknownService(name.clone()));
                rollback_connections(&server, connected);
                return false;
            };
            let Some(connection) = base.connect_to_server() else {
                log_error!(self.logger, "Service `{}` cannot connect to the RPC server", name);
                rollback_connections(&server, connected);
                return false;
            };
            if !server.add_connection(connection) {
                log_error!(self.logger, "RPC server refused the connection of `{}`", name);
                base.disconnect_from_server();
                rollback_connections(&server, connected);
                return false;
            }
            connected.push(base);
        }
        log_info!(self.logger, "Exposed {} services over RPC", connected.len());
        true
    }

    /// Withdraw services from the RPC server; all services when `names` is empty
    pub fn disconnect_rpc_server_from_services(&self, names: &[&str]) -> bool {
        let server = self.rpc_server();
        for name in self.resolve_targets(names) {
            if let Some(server) = &server {
                server.remove_connection(&name);
            }
            if let Some(base) = self.get_service(&name) {
                base.disconnect_from_server();
            }
        }
        true
    }

    fn resolve_targets(&self, names: &[&str]) -> Vec<String> {
        if names.is_empty() {
            self.service_names()
        } else {
            names.iter().map(|name| name.to_string()).collect()
        }
    }

    fn reattach_connection(&self, base: &ServiceBase) {
        if let (Some(server), Some(connection)) = (self.rpc_server(), base.server_connection()) {
            if !server.add_connection(connection) {
                log_warn!(self.logger, "Failed to re-expose `{}` over RPC", base.name());
            }
        }
    }

    fn detach_connection(&self, name: &str) {
        if let Some(server) = self.rpc_server() {
            server.remove_connection(name);
        }
    }

    /// Create a client bound to the manager's reactor
    pub fn new_rpc_client(&self, config: RpcClientConfig) -> Option<Arc<RpcClient>> {
        let Some(handle) = self.reactor.handle() else {
            log_error!(self.logger, "Cannot create RPC client: manager not started");
            return None;
        };
        let client = Arc::new(RpcClient::new(config, handle, &self.logger));
        let mut rpc = self.rpc.write();
        rpc.clients.retain(|client| client.strong_count() > 0);
        rpc.clients.push(Arc::downgrade(&client));
        Some(client)
    }

    /// Connect, call and disconnect within one end-to-end `timeout`
    pub fn call_rpc_function_sync(
        &self,
        host: &str,
        service: &str,
        function: &str,
        params: Value,
        timeout: Duration,
        port: u16,
    ) -> FunctionResult {
        let begin = Instant::now();
        let Some(client) = self.new_rpc_client(RpcClientConfig::default()) else {
            return FunctionResult::fail("Manager is not started");
        };
        if !client.connect(host, port, timeout) {
            return FunctionResult::fail(format!("Failed to connect to RPC server: {host}:{port}"));
        }

        let elapsed = begin.elapsed();
        let remaining = timeout.saturating_sub(elapsed);
        if remaining.is_zero() {
            client.disconnect();
            return FunctionResult::fail(format!(
                "Timeout after connection, elapsed: {}ms",
                elapsed.as_millis()
            ));
        }

        let result = client.call_function(service, function, params, remaining);
        client.disconnect();
        result
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        self.deinit();
    }
}

fn release_in_reverse(mut bindings: Vec<ServiceBinding>) {
    while let Some(mut binding) = bindings.pop() {
        binding.release();
    }
}

fn rollback_connections(server: &RpcServer, connected: Vec<Arc<ServiceBase>>) {
    for base in connected.into_iter().rev() {
        server.remove_connection(base.name());
        base.disconnect_from_server();
    }
}
