// Counter fixture.
//
// Records every increment in call order so tests can check that queued calls run
// in submission order. Also carries a raw-buffer function (always inline), a
// function usable while stopped, and a deliberately slow function for timeouts.

use keel_common::params;
use keel_common::types::{
    EventItemSchema, EventSchema, FunctionParameterMap, FunctionSchema, FunctionValue,
    ParameterSchema, ValueType,
};
use keel_node::services::{
    FunctionHandlerMap, HandlerResult, Service, ServiceAttributes, ServiceContext,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use super::number;

pub const COUNTER_SERVICE_NAME: &str = "Counter";
pub const CHANGED_EVENT: &str = "changed";

#[derive(Default)]
struct CounterState {
    value: f64,
    history: Vec<f64>,
}

pub struct CounterService {
    attributes: ServiceAttributes,
    state: Mutex<CounterState>,
    checksum_thread: Mutex<Option<ThreadId>>,
}

impl CounterService {
    pub fn new() -> Arc<Self> {
        Self::with_attributes(ServiceAttributes::new(COUNTER_SERVICE_NAME))
    }

    pub fn with_attributes(attributes: ServiceAttributes) -> Arc<Self> {
        Arc::new(Self {
            attributes,
            state: Mutex::new(CounterState::default()),
            checksum_thread: Mutex::new(None),
        })
    }

    pub fn value(&self) -> f64 {
        self.state.lock().value
    }

    /// Amounts in the order the increments executed
    pub fn history(&self) -> Vec<f64> {
        self.state.lock().history.clone()
    }

    /// Thread that ran the last `checksum` call
    pub fn checksum_thread(&self) -> Option<ThreadId> {
        *self.checksum_thread.lock()
    }
}

impl Service for CounterService {
    fn attributes(&self) -> &ServiceAttributes {
        &self.attributes
    }

    fn function_schemas(&self) -> Vec<FunctionSchema> {
        vec![
            FunctionSchema::new("increment")
                .with_parameter(ParameterSchema::new("amount", ValueType::Number).with_default(1)),
            FunctionSchema::new("get_history"),
            FunctionSchema::new("get_value").with_require_running(false),
            FunctionSchema::new("reset"),
            FunctionSchema::new("checksum")
                .with_parameter(ParameterSchema::new("data", ValueType::RawBuffer)),
            FunctionSchema::new("slow")
                .with_parameter(ParameterSchema::new("delay_ms", ValueType::Number)),
        ]
    }

    fn event_schemas(&self) -> Vec<EventSchema> {
        vec![EventSchema::new(CHANGED_EVENT).with_item(EventItemSchema::new("value", ValueType::Number))]
    }

    fn function_handlers(self: Arc<Self>, context: &ServiceContext) -> FunctionHandlerMap {
        let mut handlers = FunctionHandlerMap::new();

        let counter = self.clone();
        let publisher = context.clone();
        handlers.insert(
            "increment".to_string(),
            Arc::new(move |params: FunctionParameterMap| -> HandlerResult {
                let amount = number(&params, "amount")?;
                let value = {
                    let mut state = counter.state.lock();
                    state.value += amount;
                    state.history.push(amount);
                    state.value
                };
                publisher.publish_event(CHANGED_EVENT, params!("value" => value));
                Ok(Some(FunctionValue::from(value)))
            }),
        );

        let counter = self.clone();
        handlers.insert(
            "get_history".to_string(),
            Arc::new(move |_: FunctionParameterMap| -> HandlerResult {
                let history: Vec<Value> = counter.history().into_iter().map(Value::from).collect();
                Ok(Some(FunctionValue::from(history)))
            }),
        );

        let counter = self.clone();
        handlers.insert(
            "get_value".to_string(),
            Arc::new(move |_: FunctionParameterMap| -> HandlerResult {
                Ok(Some(FunctionValue::from(counter.value())))
            }),
        );

        let counter = self.clone();
        handlers.insert(
            "reset".to_string(),
            Arc::new(move |_: FunctionParameterMap| -> HandlerResult {
                *counter.state.lock() = CounterState::default();
                Ok(Some(FunctionValue::from(true)))
            }),
        );

        let counter = self;
        handlers.insert(
            "checksum".to_string(),
            Arc::new(move |params: FunctionParameterMap| -> HandlerResult {
                *counter.checksum_thread.lock() = Some(thread::current().id());
                let data = params
                    .get("data")
                    .and_then(FunctionValue::as_bytes)
                    .ok_or_else(|| "Parameter `data` must be a raw buffer".to_string())?;
                let sum: u64 = data.iter().map(|byte| u64::from(*byte)).sum();
                Ok(Some(FunctionValue::from(sum)))
            }),
        );

        handlers.insert(
            "slow".to_string(),
            Arc::new(|params: FunctionParameterMap| -> HandlerResult {
                let delay = number(&params, "delay_ms")?;
                thread::sleep(Duration::from_millis(delay.max(0.0) as u64));
                Ok(Some(FunctionValue::from(delay)))
            }),
        );

        handlers
    }
}
