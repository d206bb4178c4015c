// Lifecycle probe: a service that only records what happens to it.
//
// Every hook appends "{name}:{hook}" to a journal shared between probes, so a
// test can assert the order in which the manager started and stopped a graph.

use keel_common::types::{FunctionParameterMap, FunctionSchema, FunctionValue};
use keel_node::services::{
    FunctionHandlerMap, HandlerResult, Service, ServiceAttributes, ServiceContext,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Hook journal shared between probes
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn new_journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

#[derive(Default)]
struct HookCounters {
    init: AtomicUsize,
    start: AtomicUsize,
    stop: AtomicUsize,
    deinit: AtomicUsize,
}

pub struct LifecycleProbe {
    attributes: ServiceAttributes,
    journal: Journal,
    counters: HookCounters,
    start_delay: Option<Duration>,
    fail_start: AtomicBool,
}

impl LifecycleProbe {
    pub fn new<I, S>(name: &str, dependencies: I, journal: Journal) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attributes: ServiceAttributes::new(name).with_dependencies(dependencies),
            journal,
            counters: HookCounters::default(),
            start_delay: None,
            fail_start: AtomicBool::new(false),
        }
    }

    /// Make `on_start` block for `delay`, widening race windows
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn init_count(&self) -> usize {
        self.counters.init.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.counters.start.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.counters.stop.load(Ordering::SeqCst)
    }

    pub fn deinit_count(&self) -> usize {
        self.counters.deinit.load(Ordering::SeqCst)
    }

    fn record(&self, hook: &str) {
        self.journal
            .lock()
            .push(format!("{}:{}", self.attributes.name, hook));
    }
}

impl Service for LifecycleProbe {
    fn attributes(&self) -> &ServiceAttributes {
        &self.attributes
    }

    fn on_init(&self, _context: &ServiceContext) -> bool {
        self.counters.init.fetch_add(1, Ordering::SeqCst);
        self.record("init");
        true
    }

    fn on_deinit(&self, _context: &ServiceContext) {
        self.counters.deinit.fetch_add(1, Ordering::SeqCst);
        self.record("deinit");
    }

    fn on_start(&self, _context: &ServiceContext) -> bool {
        if let Some(delay) = self.start_delay {
            thread::sleep(delay);
        }
        if self.fail_start.load(Ordering::SeqCst) {
            self.record("start-failed");
            return false;
        }
        self.counters.start.fetch_add(1, Ordering::SeqCst);
        self.record("start");
        true
    }

    fn on_stop(&self, _context: &ServiceContext) {
        self.counters.stop.fetch_add(1, Ordering::SeqCst);
        self.record("stop");
    }

    fn function_schemas(&self) -> Vec<FunctionSchema> {
        vec![FunctionSchema::new("ping")]
    }

    fn function_handlers(self: Arc<Self>, context: &ServiceContext) -> FunctionHandlerMap {
        let mut handlers = FunctionHandlerMap::new();
        let name = context.service_name().to_string();
        handlers.insert(
            "ping".to_string(),
            Arc::new(move |_: FunctionParameterMap| -> HandlerResult {
                Ok(Some(FunctionValue::from(format!("{name}:pong"))))
            }),
        );
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_journals_hooks_in_call_order() {
        let journal = new_journal();
        let probe = LifecycleProbe::new("A", Vec::<String>::new(), journal.clone());
        probe.record("init");
        probe.record("start");
        assert_eq!(*journal.lock(), vec!["A:init".to_string(), "A:start".to_string()]);
    }
}
