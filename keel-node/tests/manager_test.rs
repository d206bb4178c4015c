// Tests for the ServiceManager
//
// These tests verify that the manager adds services in dependency order, starts and
// stops them through reference-counted bindings, and keeps its bookkeeping consistent
// under concurrent binds.

use keel_node::services::{Service, ServiceState};
use keel_node::{ServiceFactoryTable, ServiceManager};
use keel_test_utils::{
    create_test_factory_table, create_test_manager_config, init_test_logging, new_journal,
    LifecycleProbe, MathService, MATH_SERVICE_NAME,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn no_dependencies() -> Vec<String> {
    Vec::new()
}

fn probe_table(probes: &[&Arc<LifecycleProbe>]) -> ServiceFactoryTable {
    create_test_factory_table(
        probes
            .iter()
            .map(|probe| Arc::clone(probe) as Arc<dyn Service>)
            .collect(),
    )
}

/// Test that init adds every factory's service, dependencies first
///
/// INTENTION: Factories are registered in an order that contradicts the dependency
/// graph; init must still add (and initialize) the dependency before its dependent.
#[test]
fn test_init_adds_services_in_dependency_order() {
    init_test_logging();
    let journal = new_journal();
    let b = Arc::new(LifecycleProbe::new("B", ["A"], journal.clone()));
    let a = Arc::new(LifecycleProbe::new("A", no_dependencies(), journal.clone()));

    let manager = ServiceManager::new(
        probe_table(&[&b, &a]),
        create_test_manager_config("init-order"),
    );
    assert!(!manager.is_initialized());
    assert!(manager.init());
    assert!(manager.is_initialized());
    assert!(manager.init(), "init is idempotent");

    assert_eq!(manager.service_names(), vec!["A".to_string(), "B".to_string()]);
    assert_eq!(*journal.lock(), vec!["A:init".to_string(), "B:init".to_string()]);
    assert_eq!(a.init_count(), 1);
    assert_eq!(manager.reference_count("A"), Some(0));
    assert_eq!(manager.reference_count("missing"), None);

    let service = manager.get_service("B").unwrap();
    assert_eq!(service.state(), ServiceState::Initialized);

    manager.deinit();
    assert!(!manager.is_initialized());
    assert!(manager.service_names().is_empty());
    assert_eq!(a.deinit_count(), 1);
    assert_eq!(b.deinit_count(), 1);
    let journal = journal.lock();
    assert_eq!(&journal[2..], &["B:deinit".to_string(), "A:deinit".to_string()]);
}

/// Test that a dependency cycle is reported and only the acyclic part comes up
#[test]
fn test_init_with_cycle_adds_only_resolved_services() {
    init_test_logging();
    let journal = new_journal();
    let x = Arc::new(LifecycleProbe::new("X", ["Z"], journal.clone()));
    let y = Arc::new(LifecycleProbe::new("Y", ["X"], journal.clone()));
    let z = Arc::new(LifecycleProbe::new("Z", ["Y"], journal.clone()));
    let free = Arc::new(LifecycleProbe::new("Free", no_dependencies(), journal.clone()));

    let manager = ServiceManager::new(
        probe_table(&[&x, &y, &z, &free]),
        create_test_manager_config("cycle"),
    );
    assert!(!manager.init());
    assert_eq!(manager.service_names(), vec!["Free".to_string()]);
    assert!(manager.get_service("X").is_none());
    assert!(!manager.bind("X").is_valid());
    assert!(manager.bind("Free").is_valid());
    assert_eq!(x.init_count(), 0);
    assert_eq!(free.start_count(), 1);
}

/// Test manual add/remove and the refusal to remove a bound service
#[test]
fn test_add_and_remove_service() {
    init_test_logging();
    let manager = ServiceManager::new(ServiceFactoryTable::new(), create_test_manager_config("add-remove"));

    assert!(manager.add_service(MathService::new()));
    assert!(manager.add_service(MathService::new()), "adding a known name is a no-op");
    assert_eq!(manager.service_names(), vec![MATH_SERVICE_NAME.to_string()]);

    let binding = manager.bind(MATH_SERVICE_NAME);
    assert!(binding.is_valid());
    assert_eq!(binding.name(), Some(MATH_SERVICE_NAME));
    assert_eq!(manager.reference_count(MATH_SERVICE_NAME), Some(1));
    assert!(!manager.remove_service(MATH_SERVICE_NAME));

    drop(binding);
    assert_eq!(manager.reference_count(MATH_SERVICE_NAME), Some(0));
    assert!(manager.remove_service(MATH_SERVICE_NAME));
    assert!(manager.remove_service(MATH_SERVICE_NAME), "removing an unknown name succeeds");
    assert!(manager.service_names().is_empty());
    assert!(!manager.bind(MATH_SERVICE_NAME).is_valid());
}

/// Test that binding starts dependencies first and releasing stops them last
///
/// INTENTION: Binding B (which depends on A) must start A then B; releasing the
/// binding must stop B then A. A second binding shares the running instances.
#[test]
fn test_binding_starts_and_stops_dependency_chain() {
    init_test_logging();
    let journal = new_journal();
    let a = Arc::new(LifecycleProbe::new("A", no_dependencies(), journal.clone()));
    let b = Arc::new(LifecycleProbe::new("B", ["A"], journal.clone()));
    let manager = ServiceManager::new(
        probe_table(&[&a, &b]),
        create_test_manager_config("binding"),
    );
    assert!(manager.init());
    journal.lock().clear();

    let first = manager.bind("B");
    assert!(first.is_valid());
    assert!(manager.get_service("A").unwrap().is_running());
    assert!(manager.get_service("B").unwrap().is_running());
    assert_eq!(*journal.lock(), vec!["A:start".to_string(), "B:start".to_string()]);

    let second = manager.bind("B");
    assert!(second.is_valid());
    assert_eq!(b.start_count(), 1);
    assert_eq!(manager.reference_count("B"), Some(2));
    assert_eq!(manager.reference_count("A"), Some(2));

    drop(first);
    assert!(manager.get_service("B").unwrap().is_running());
    assert_eq!(b.stop_count(), 0);

    drop(second);
    assert_eq!(manager.get_service("B").unwrap().state(), ServiceState::Stopped);
    assert_eq!(manager.get_service("A").unwrap().state(), ServiceState::Stopped);
    assert_eq!(
        *journal.lock(),
        vec![
            "A:start".to_string(),
            "B:start".to_string(),
            "B:stop".to_string(),
            "A:stop".to_string(),
        ]
    );

    // A stopped service starts again on its next binding
    let again = manager.bind("B");
    assert!(again.is_valid());
    assert_eq!(a.start_count(), 2);
}

/// Test that a failing dependency leaves nothing running
#[test]
fn test_failed_dependency_releases_acquired_bindings() {
    init_test_logging();
    let journal = new_journal();
    let a = Arc::new(LifecycleProbe::new("A", no_dependencies(), journal.clone()));
    let broken = Arc::new(LifecycleProbe::new("Broken", no_dependencies(), journal.clone()));
    let top = Arc::new(LifecycleProbe::new("Top", ["A", "Broken"], journal.clone()));
    let orphan = Arc::new(LifecycleProbe::new("Orphan", ["Nowhere"], journal.clone()));
    broken.fail_start(true);

    let manager = ServiceManager::new(
        probe_table(&[&a, &broken, &top, &orphan]),
        create_test_manager_config("dependency-failure"),
    );
    assert!(manager.init());

    assert!(!manager.bind("Top").is_valid());
    assert_eq!(a.start_count(), 1);
    assert_eq!(a.stop_count(), 1);
    assert_eq!(top.start_count(), 0);
    assert_eq!(manager.reference_count("A"), Some(0));
    assert_eq!(manager.reference_count("Top"), Some(0));

    assert!(!manager.bind("Orphan").is_valid());
    assert_eq!(orphan.start_count(), 0);

    broken.fail_start(false);
    assert!(manager.bind("Top").is_valid());
}

/// Test that concurrent binds start a service exactly once
///
/// INTENTION: Many threads bind a slow-starting service at the same moment. Only
/// one start may run; every thread must come back with a valid binding and the
/// reference count must match the number of live bindings.
#[test]
fn test_concurrent_bind_starts_once() {
    init_test_logging();
    let journal = new_journal();
    let slow = Arc::new(
        LifecycleProbe::new("Slow", no_dependencies(), journal.clone()).with_start_delay(Duration::from_millis(50)),
    );
    let manager = ServiceManager::new(
        probe_table(&[&slow]),
        create_test_manager_config("concurrent-bind"),
    );
    assert!(manager.init());

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                manager.bind("Slow")
            })
        })
        .collect();
    let bindings: Vec<_> = workers.into_iter().map(|worker| worker.join().unwrap()).collect();

    assert!(bindings.iter().all(|binding| binding.is_valid()));
    assert_eq!(slow.start_count(), 1);
    assert_eq!(manager.reference_count("Slow"), Some(threads));

    drop(bindings);
    assert_eq!(manager.reference_count("Slow"), Some(0));
    assert_eq!(slow.stop_count(), 1);
    assert!(!manager.unbind("Slow"), "unbinding an unbound service is refused");
}

/// Test that deinit stops services that are still bound
#[test]
fn test_deinit_stops_bound_services() {
    init_test_logging();
    let journal = new_journal();
    let probe = Arc::new(LifecycleProbe::new("Held", no_dependencies(), journal.clone()));
    let manager = ServiceManager::new(
        probe_table(&[&probe]),
        create_test_manager_config("deinit-bound"),
    );
    assert!(manager.init());

    let binding = manager.bind("Held");
    assert!(binding.is_valid());
    manager.deinit();
    assert_eq!(probe.stop_count(), 1);
    assert_eq!(probe.deinit_count(), 1);

    // The late release finds nothing to unbind and must not panic
    drop(binding);
    assert_eq!(probe.stop_count(), 1);
}
