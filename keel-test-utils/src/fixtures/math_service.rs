// Math fixture: four arithmetic functions and a "computed" event per call.

use keel_common::params;
use keel_common::types::{
    EventItemSchema, EventSchema, FunctionParameterMap, FunctionSchema, FunctionValue,
    ParameterSchema, ValueType,
};
use keel_node::services::{
    FunctionHandlerMap, HandlerResult, Service, ServiceAttributes, ServiceContext,
};
use std::sync::Arc;

use super::number;

pub const MATH_SERVICE_NAME: &str = "Math";
pub const COMPUTED_EVENT: &str = "computed";

pub struct MathService {
    attributes: ServiceAttributes,
}

impl MathService {
    pub fn new() -> Arc<Self> {
        Self::with_attributes(ServiceAttributes::new(MATH_SERVICE_NAME))
    }

    pub fn with_attributes(attributes: ServiceAttributes) -> Arc<Self> {
        Arc::new(Self { attributes })
    }
}

fn binary(name: &str, description: &str) -> FunctionSchema {
    FunctionSchema::new(name)
        .with_description(description)
        .with_parameter(ParameterSchema::new("a", ValueType::Number))
        .with_parameter(ParameterSchema::new("b", ValueType::Number))
}

impl Service for MathService {
    fn attributes(&self) -> &ServiceAttributes {
        &self.attributes
    }

    fn function_schemas(&self) -> Vec<FunctionSchema> {
        vec![
            binary("add", "a + b"),
            binary("subtract", "a - b"),
            binary("multiply", "a * b"),
            binary("divide", "a / b, fails when b is zero"),
        ]
    }

    fn event_schemas(&self) -> Vec<EventSchema> {
        vec![EventSchema::new(COMPUTED_EVENT)
            .with_item(EventItemSchema::new("operation", ValueType::String))
            .with_item(EventItemSchema::new("result", ValueType::Number))]
    }

    fn function_handlers(self: Arc<Self>, context: &ServiceContext) -> FunctionHandlerMap {
        let operations: [(&'static str, fn(f64, f64) -> Result<f64, String>); 4] = [
            ("add", |a, b| Ok(a + b)),
            ("subtract", |a, b| Ok(a - b)),
            ("multiply", |a, b| Ok(a * b)),
            ("divide", |a, b| {
                if b == 0.0 {
                    Err("Division by zero".to_string())
                } else {
                    Ok(a / b)
                }
            }),
        ];

        let mut handlers = FunctionHandlerMap::new();
        for (name, operation) in operations {
            let context = context.clone();
            handlers.insert(
                name.to_string(),
                Arc::new(move |params: FunctionParameterMap| -> HandlerResult {
                    let result = operation(number(&params, "a")?, number(&params, "b")?)?;
                    context.publish_event(COMPUTED_EVENT, params!("operation" => name, "result" => result));
                    Ok(Some(FunctionValue::from(result)))
                }),
            );
        }
        handlers
    }
}
