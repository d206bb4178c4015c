// Test utilities for Keel crates
//
// This crate provides test-specific functionality that should not be available
// in production builds: fixture services, manager setup helpers and a runner for
// scripted call sequences. All functions in this crate are for testing only.

pub mod fixtures;
pub mod runner;

use keel_common::logging::{LogLevel, LoggingConfig};
use keel_node::config::{ManagerConfig, SchedulerConfig, WorkerConfig};
use keel_node::services::{Service, ServiceFactoryTable};
use std::sync::Arc;

pub use fixtures::counter_service::{CounterService, CHANGED_EVENT, COUNTER_SERVICE_NAME};
pub use fixtures::lifecycle_probe::{new_journal, Journal, LifecycleProbe};
pub use fixtures::math_service::{MathService, COMPUTED_EVENT, MATH_SERVICE_NAME};
pub use fixtures::wifi_service::{AccessPoint, WifiService, CONNECT_AP_CHANGED_EVENT, WIFI_SERVICE_NAME};
pub use runner::{LocalTestItem, LocalTestRunner, ResultValidator, RunTestsConfig};

/// Install the log backend once for a test binary. `RUST_LOG` is not consulted;
/// set `KEEL_TEST_DEBUG=1` to see debug records.
pub fn init_test_logging() {
    let level = if std::env::var_os("KEEL_TEST_DEBUG").is_some() {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    };
    LoggingConfig::new().with_default_level(level).apply();
}

/// Manager configuration with a small shared scheduler, suitable for tests
pub fn create_test_manager_config(node_id: &str) -> ManagerConfig {
    ManagerConfig::new(node_id).with_scheduler(
        SchedulerConfig::new()
            .with_worker(WorkerConfig::new(format!("{node_id}-worker")))
            .with_worker(WorkerConfig::new(format!("{node_id}-worker")))
            .with_max_blocking_threads(16),
    )
}

/// Factory table returning the given instances, keyed by their names
pub fn create_test_factory_table(services: Vec<Arc<dyn Service>>) -> ServiceFactoryTable {
    services
        .into_iter()
        .fold(ServiceFactoryTable::new(), |table, service| {
            let name = service.name().to_string();
            table.with_factory(name, move || service.clone())
        })
}
