// Configuration Module
//
// Configuration records for the Keel runtime:
//
// - **Scheduler configuration**: worker threads backing a `TaskScheduler`
// - **Manager configuration**: root id, shared scheduler and logging of a `ServiceManager`
// - **RPC configuration**: listener and client settings
//
// ## Examples
//
// ```rust
// use keel_node::config::{ManagerConfig, SchedulerConfig, WorkerConfig};
//
// let config = ManagerConfig::new("device-1")
//     .with_scheduler(SchedulerConfig::new().with_worker(WorkerConfig::new("svc-worker")));
// ```

use std::fmt;
use std::time::Duration;

pub use keel_common::logging::{LogLevel, LoggingConfig};

/// Default TCP port of the RPC server
pub const DEFAULT_RPC_PORT: u16 = 65500;
/// Default number of simultaneous RPC peers
pub const DEFAULT_RPC_MAX_CONNECTIONS: usize = 5;
/// Default budget of a single RPC request
pub const DEFAULT_RPC_REQUEST_TIMEOUT_MS: u64 = 1000;
/// Default reactor poll interval
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
/// How long `ServiceBase::stop` waits for a service's groups to drain
pub const DEFAULT_STOP_DRAIN_TIMEOUT_MS: u64 = 500;

/// One worker thread of a scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub name: String,
    /// Stack size in bytes, `None` keeps the runtime default
    pub stack_size: Option<usize>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stack_size: None,
        }
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }
}

/// Start configuration of a `TaskScheduler`
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub workers: Vec<WorkerConfig>,
    /// Upper bound of threads used to run (possibly blocking) task bodies
    pub max_blocking_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: vec![WorkerConfig::new("keel-worker")],
            max_blocking_threads: 64,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn with_max_blocking_threads(mut self, max: usize) -> Self {
        self.max_blocking_threads = max.max(1);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len().max(1)
    }

    /// Name used for runtime threads, taken from the first worker
    pub fn thread_name(&self) -> String {
        self.workers
            .first()
            .map(|w| w.name.clone())
            .unwrap_or_else(|| "keel-worker".to_string())
    }

    /// Largest configured stack size
    pub fn stack_size(&self) -> Option<usize> {
        self.workers.iter().filter_map(|w| w.stack_size).max()
    }
}

impl fmt::Display for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SchedulerConfig(workers={}, thread_name={}, max_blocking_threads={})",
            self.worker_count(),
            self.thread_name(),
            self.max_blocking_threads
        )
    }
}

/// Construction configuration of a `ServiceManager`
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root id printed in every log line of this manager
    pub node_id: String,
    /// Shared scheduler handed to services without their own
    pub scheduler: SchedulerConfig,
    pub logging: Option<LoggingConfig>,
}

impl ManagerConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            scheduler: SchedulerConfig::default(),
            logging: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_logging_config(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }
}

impl fmt::Display for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagerConfig(node_id={}, {})", self.node_id, self.scheduler)
    }
}

/// Start configuration of the manager's I/O reactor
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerStartConfig {
    pub poll_interval: Duration,
}

impl Default for ManagerStartConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl ManagerStartConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// RPC server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RpcServerConfig {
    pub listen_port: u16,
    pub max_connections: usize,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_RPC_PORT,
            max_connections: DEFAULT_RPC_MAX_CONNECTIONS,
        }
    }
}

impl RpcServerConfig {
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

impl fmt::Display for RpcServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RpcServerConfig(port={}, max_connections={})",
            self.listen_port, self.max_connections
        )
    }
}

/// RPC client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RpcClientConfig {
    /// Budget for requests issued without an explicit timeout
    pub request_timeout_ms: u64,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_RPC_REQUEST_TIMEOUT_MS,
        }
    }
}
