// Local Test Runner
//
// INTENTION:
// Drive a scripted sequence of calls against one service of a manager, the way a
// device test app exercises a service without any RPC peer. Each item is posted on
// a private scheduler at its accumulated offset (the start delays and run durations
// of every earlier item plus its own start delay), called synchronously with its own
// timeout, and judged by an optional validator.

use anyhow::{bail, ensure, Context};
use keel_common::logging::{Component, Logger};
use keel_common::types::{FunctionResult, FunctionValue};
use keel_common::{log_error, log_info};
use keel_node::config::{SchedulerConfig, WorkerConfig};
use keel_node::services::ServiceBase;
use keel_node::{ServiceManager, TaskScheduler};
use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Judges the data returned by a successful call
pub type ResultValidator = Arc<dyn Fn(&FunctionValue) -> bool + Send + Sync>;

const DEFAULT_START_DELAY_MS: u64 = 100;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 100;
const DEFAULT_RUN_DURATION_MS: u64 = 200;
const DEFAULT_EXTRA_TIMEOUT_MS: u64 = 1000;

/// One scripted call
#[derive(Clone)]
pub struct LocalTestItem {
    pub name: String,
    pub method: String,
    pub params: Map<String, Value>,
    pub validator: Option<ResultValidator>,
    /// Pause before this item, counted from the end of the previous item's run window
    pub start_delay_ms: u64,
    pub call_timeout_ms: u64,
    /// Time reserved for this item before the next one starts; keep it above the call timeout
    pub run_duration_ms: u64,
}

impl LocalTestItem {
    pub fn new(name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            params: Map::new(),
            validator: None,
            start_delay_ms: DEFAULT_START_DELAY_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            run_duration_ms: DEFAULT_RUN_DURATION_MS,
        }
    }

    /// Use the entries of a JSON object as parameters; anything else is ignored
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(params) = params {
            self.params = params;
        }
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&FunctionValue) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_start_delay_ms(mut self, delay: u64) -> Self {
        self.start_delay_ms = delay;
        self
    }

    pub fn with_call_timeout_ms(mut self, timeout: u64) -> Self {
        self.call_timeout_ms = timeout;
        self
    }

    pub fn with_run_duration_ms(mut self, duration: u64) -> Self {
        self.run_duration_ms = duration;
        self
    }

    /// Judge a call result: failures fail, data is checked by the validator if any
    pub fn judge(&self, result: &FunctionResult) -> Result<(), String> {
        if !result.success {
            return Err(result.error_message.clone());
        }
        match (&result.data, &self.validator) {
            (Some(data), Some(validator)) if !validator(data) => Err("Validation failed".to_string()),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for LocalTestItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTestItem")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("params", &self.params)
            .field("has_validator", &self.validator.is_some())
            .field("start_delay_ms", &self.start_delay_ms)
            .field("call_timeout_ms", &self.call_timeout_ms)
            .field("run_duration_ms", &self.run_duration_ms)
            .finish()
    }
}

/// Where and how long to run a sequence
#[derive(Debug, Clone)]
pub struct RunTestsConfig {
    pub service_name: String,
    /// Scheduler the items are posted on, separate from the service's own
    pub scheduler: SchedulerConfig,
    /// Slack added to the sum of every item's delay and run window
    pub extra_timeout_ms: u64,
}

impl RunTestsConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            scheduler: SchedulerConfig::new()
                .with_worker(WorkerConfig::new("keel-test-runner").with_stack_size(256 * 1024)),
            extra_timeout_ms: DEFAULT_EXTRA_TIMEOUT_MS,
        }
    }

    pub fn with_extra_timeout_ms(mut self, timeout: u64) -> Self {
        self.extra_timeout_ms = timeout;
        self
    }
}

#[derive(Default)]
struct Progress {
    results: Vec<bool>,
    completed: usize,
}

/// Runs scripted call sequences and keeps the per-item verdicts of the last run
pub struct LocalTestRunner {
    logger: Arc<Logger>,
    results: Mutex<Vec<bool>>,
}

impl LocalTestRunner {
    pub fn new() -> Self {
        Self {
            logger: Arc::new(Logger::new_root(Component::Test, "local-runner")),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Run `items` against `service_name` with default settings
    pub fn run(&self, manager: &ServiceManager, service_name: &str, items: &[LocalTestItem]) -> anyhow::Result<bool> {
        self.run_tests(manager, &RunTestsConfig::new(service_name), items)
    }

    /// Bind the service, run every item at its offset and report whether all passed.
    ///
    /// Setup problems are errors; failing items are not, they show up as `false`
    /// here and in `results`.
    pub fn run_tests(
        &self,
        manager: &ServiceManager,
        config: &RunTestsConfig,
        items: &[LocalTestItem],
    ) -> anyhow::Result<bool> {
        ensure!(manager.is_initialized(), "Service manager not initialized");

        let binding = manager.bind(&config.service_name);
        ensure!(binding.is_valid(), "Failed to bind service `{}`", config.service_name);
        let service = binding
            .service()
            .cloned()
            .with_context(|| format!("Binding of `{}` holds no service", config.service_name))?;

        let scheduler = Arc::new(TaskScheduler::new(&self.logger));
        ensure!(scheduler.start(&config.scheduler), "Failed to start the runner scheduler");

        // Fresh per run: items of an earlier run that overran its budget must not
        // report into this one
        let run_progress = Arc::new((
            Mutex::new(Progress {
                results: vec![false; items.len()],
                completed: 0,
            }),
            Condvar::new(),
        ));

        let mut offset = 0u64;
        for (index, item) in items.iter().enumerate() {
            offset += item.start_delay_ms;
            log_info!(self.logger, "Scheduling test[{}] `{}` at {}ms", index, item.name, offset);

            let task_service = service.clone();
            let task_item = item.clone();
            let logger = self.logger.clone();
            let progress = run_progress.clone();
            let posted = scheduler.post_delayed(
                Box::new(move || {
                    let passed = execute_item(index, &task_service, &task_item, &logger);
                    let (state, completed) = &*progress;
                    let mut state = state.lock();
                    if let Some(slot) = state.results.get_mut(index) {
                        *slot = passed;
                    }
                    state.completed += 1;
                    completed.notify_all();
                }),
                Duration::from_millis(offset),
            );
            if posted.is_none() {
                scheduler.stop();
                bail!("Failed to schedule test[{}] `{}`", index, item.name);
            }
            offset += item.run_duration_ms;
        }

        let budget = Duration::from_millis(offset + config.extra_timeout_ms);
        log_info!(self.logger, "Waiting up to {}ms for {} tests", budget.as_millis(), items.len());
        let deadline = Instant::now() + budget;
        let (completed, failed, results) = {
            let (state, completed) = &*run_progress;
            let mut state = state.lock();
            while state.completed < items.len() {
                if completed.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            let failed = state.results.iter().filter(|passed| !**passed).count();
            (state.completed, failed, state.results.clone())
        };
        *self.results.lock() = results;
        scheduler.stop();
        drop(binding);

        log_info!(
            self.logger,
            "Test sequence finished: total={}, completed={}, failed={}",
            items.len(),
            completed,
            failed
        );
        Ok(completed == items.len() && failed == 0)
    }

    /// Verdict of each item of the last run, in item order
    pub fn results(&self) -> Vec<bool> {
        self.results.lock().clone()
    }
}

impl Default for LocalTestRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn execute_item(index: usize, service: &ServiceBase, item: &LocalTestItem, logger: &Logger) -> bool {
    let result = service.call_function_sync(
        &item.method,
        Value::Object(item.params.clone()),
        Duration::from_millis(item.call_timeout_ms),
    );
    match item.judge(&result) {
        Ok(()) => {
            log_info!(logger, "Test[{}] PASSED: {}", index, item.name);
            true
        }
        Err(reason) => {
            log_error!(logger, "Test[{}] FAILED: {} - {}", index, item.name, reason);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_judge_applies_validator_only_to_data() {
        let item = LocalTestItem::new("positive", "add")
            .with_params(json!({"a": 1, "b": 2}))
            .with_validator(|value| value.as_f64().map(|n| n > 0.0).unwrap_or(false));
        assert_eq!(item.params.len(), 2);

        assert!(item.judge(&FunctionResult::ok(Some(FunctionValue::from(3.0)))).is_ok());
        assert!(item.judge(&FunctionResult::ok(None)).is_ok());
        assert_eq!(
            item.judge(&FunctionResult::ok(Some(FunctionValue::from(-1.0)))),
            Err("Validation failed".to_string())
        );
        assert_eq!(
            item.judge(&FunctionResult::fail("Division by zero")),
            Err("Division by zero".to_string())
        );
    }

    #[test]
    fn test_non_object_params_are_ignored() {
        let item = LocalTestItem::new("noop", "get_value").with_params(json!([1, 2]));
        assert!(item.params.is_empty());
        assert_eq!(item.run_duration_ms, DEFAULT_RUN_DURATION_MS);
    }
}
