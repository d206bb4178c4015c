// Keel Node
//
// In-process service orchestration: services declare typed functions and events,
// a ServiceManager adds them in dependency order and starts them on demand through
// reference-counted bindings, and an RPC server/client pair exposes them to other
// processes.

pub mod config;
pub mod manager;
pub mod rpc;
pub mod scheduler;
pub mod services;

pub use config::{
    ManagerConfig, ManagerStartConfig, RpcClientConfig, RpcServerConfig, SchedulerConfig,
    WorkerConfig,
};
pub use manager::{ServiceManager, TopologyOutcome};
pub use rpc::{RpcClient, RpcServer, ServerConnection};
pub use scheduler::{GroupConfig, TaskId, TaskScheduler};
pub use services::{
    EventSubscription, FunctionFuture, FunctionHandlerMap, FunctionParameters, HandlerResult,
    Service, ServiceAttributes, ServiceBase, ServiceBinding, ServiceContext, ServiceFactoryTable,
    ServiceState,
};

// Re-export common macros for convenience
pub use keel_common::params;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
