// Function Registry Module
//
// INTENTION:
// Per-service table of callable functions: name -> (schema, handler). The registry
// converts the accepted parameter forms into a name -> value map, validates that map
// against the schema and invokes the handler. It never decides *where* a call runs;
// scheduling is the ServiceBase's job.
//
// Validation order is fixed: missing required parameters, then defaults are filled,
// then declared types are checked, then undeclared parameters are rejected.

use dashmap::DashMap;
use keel_common::logging::{Component, Logger};
use keel_common::types::{FunctionParameterMap, FunctionResult, FunctionSchema, FunctionValue};
use keel_common::{log_debug, log_warn, ServiceError};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// What a handler hands back: optional data, or an error message
pub type HandlerResult = std::result::Result<Option<FunctionValue>, String>;

/// Handler body of a service function. Receives validated parameters.
pub type FunctionHandler = Arc<dyn Fn(FunctionParameterMap) -> HandlerResult + Send + Sync>;

/// Handlers declared by a service, keyed by function name
pub type FunctionHandlerMap = HashMap<String, FunctionHandler>;

/// The forms in which call parameters are accepted
#[derive(Debug, Clone)]
pub enum FunctionParameters {
    /// Already keyed by parameter name
    Map(FunctionParameterMap),
    /// Positional, mapped onto the schema's parameter order
    Values(Vec<FunctionValue>),
    /// A JSON object
    Json(Value),
    /// JSON text holding an object
    JsonText(String),
}

impl Default for FunctionParameters {
    fn default() -> Self {
        FunctionParameters::Map(FunctionParameterMap::new())
    }
}

impl From<FunctionParameterMap> for FunctionParameters {
    fn from(map: FunctionParameterMap) -> Self {
        FunctionParameters::Map(map)
    }
}

impl From<Vec<FunctionValue>> for FunctionParameters {
    fn from(values: Vec<FunctionValue>) -> Self {
        FunctionParameters::Values(values)
    }
}

impl From<Value> for FunctionParameters {
    fn from(value: Value) -> Self {
        FunctionParameters::Json(value)
    }
}

impl From<&str> for FunctionParameters {
    fn from(text: &str) -> Self {
        FunctionParameters::JsonText(text.to_string())
    }
}

impl From<()> for FunctionParameters {
    fn from(_: ()) -> Self {
        FunctionParameters::default()
    }
}

impl FunctionParameters {
    /// Turn any accepted form into a name -> value map using the schema.
    ///
    /// Positional values are truncated to the shorter of the two lists.
    pub fn into_map(self, schema: &FunctionSchema) -> Result<FunctionParameterMap, ServiceError> {
        match self {
            FunctionParameters::Map(map) => Ok(map),
            FunctionParameters::Values(values) => Ok(schema
                .parameters
                .iter()
                .zip(values)
                .map(|(parameter, value)| (parameter.name.clone(), value))
                .collect()),
            FunctionParameters::JsonText(text) => {
                let value: Value = serde_json::from_str(&text)?;
                FunctionParameters::Json(value).into_map(schema)
            }
            FunctionParameters::Json(Value::Null) => Ok(FunctionParameterMap::new()),
            FunctionParameters::Json(Value::Object(object)) => {
                let mut map = FunctionParameterMap::with_capacity(object.len());
                for (name, value) in object {
                    let converted = match schema.parameter(&name) {
                        Some(parameter) => FunctionValue::from_json_as(value, parameter.value_type),
                        None => FunctionValue::from_json(value),
                    };
                    let converted = converted.map_err(|e| {
                        ServiceError::Validation(format!("Invalid value for parameter `{name}`: {e}"))
                    })?;
                    map.insert(name, converted);
                }
                Ok(map)
            }
            FunctionParameters::Json(other) => Err(ServiceError::Validation(format!(
                "Parameters must be a JSON object, got `{other}`"
            ))),
        }
    }
}

#[derive(Clone)]
struct FunctionEntry {
    schema: FunctionSchema,
    handler: FunctionHandler,
}

/// Name -> (schema, handler) table of one service
pub struct FunctionRegistry {
    logger: Arc<Logger>,
    functions: DashMap<String, FunctionEntry>,
}

impl FunctionRegistry {
    pub fn new(logger: &Logger) -> Self {
        Self {
            logger: Arc::new(logger.with_component(Component::Registry)),
            functions: DashMap::new(),
        }
    }

    /// Register a function. Fails on a duplicate name.
    pub fn add(&self, schema: FunctionSchema, handler: FunctionHandler) -> bool {
        if self.functions.contains_key(&schema.name) {
            log_warn!(self.logger, "Function `{}` already registered", schema.name);
            return false;
        }
        log_debug!(self.logger, "Registered function `{}`", schema.name);
        self.functions
            .insert(schema.name.clone(), FunctionEntry { schema, handler });
        true
    }

    pub fn remove(&self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    pub fn clear(&self) {
        self.functions.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn schema(&self, name: &str) -> Option<FunctionSchema> {
        self.functions.get(name).map(|entry| entry.schema.clone())
    }

    /// All schemas, sorted by name
    pub fn schemas(&self) -> Vec<FunctionSchema> {
        let mut schemas: Vec<FunctionSchema> = self
            .functions
            .iter()
            .map(|entry| entry.schema.clone())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Validate `params` against `schema`, filling defaults in place
    pub fn validate_parameters(
        schema: &FunctionSchema,
        params: &mut FunctionParameterMap,
    ) -> Result<(), ServiceError> {
        for parameter in &schema.parameters {
            if params.contains_key(&parameter.name) {
                continue;
            }
            match &parameter.default_value {
                Some(default) => {
                    params.insert(parameter.name.clone(), default.clone());
                }
                None => {
                    return Err(ServiceError::Validation(format!(
                        "Missing required parameter: `{}`",
                        parameter.name
                    )))
                }
            }
        }

        for parameter in &schema.parameters {
            if let Some(value) = params.get(&parameter.name) {
                if value.value_type() != parameter.value_type {
                    return Err(ServiceError::Validation(format!(
                        "Invalid type for parameter `{}`: expected `{}`, but got `{}`",
                        parameter.name,
                        parameter.value_type,
                        value.value_type()
                    )));
                }
            }
        }

        let mut unknown: Vec<&String> = params
            .keys()
            .filter(|name| schema.parameter(name).is_none())
            .collect();
        unknown.sort();
        if let Some(name) = unknown.first() {
            return Err(ServiceError::Validation(format!("Unknown parameter: `{name}`")));
        }

        Ok(())
    }

    /// Validate and invoke a function on the calling thread
    pub fn call(&self, name: &str, params: FunctionParameterMap) -> FunctionResult {
        let Some(entry) = self.functions.get(name).map(|entry| entry.clone()) else {
            return ServiceError::UnknownFunction(name.to_string()).into();
        };

        let mut params = params;
        if let Err(e) = Self::validate_parameters(&entry.schema, &mut params) {
            log_warn!(self.logger, "Call to `{}` rejected: {}", name, e);
            return e.into();
        }

        match catch_unwind(AssertUnwindSafe(|| (entry.handler)(params))) {
            Ok(Ok(data)) => FunctionResult::ok(data),
            Ok(Err(message)) => FunctionResult::fail(message),
            Err(panic) => {
                let error = ServiceError::HandlerFailed {
                    function: name.to_string(),
                    reason: panic_message(panic.as_ref()),
                };
                log_warn!(self.logger, "{}", error);
                error.into()
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::params;
    use keel_common::types::{ParameterSchema, ValueType};
    use serde_json::json;

    fn registry() -> FunctionRegistry {
        let logger = Logger::new_root(Component::Manager, "registry-test");
        FunctionRegistry::new(&logger)
    }

    fn connect_schema() -> FunctionSchema {
        FunctionSchema::new("connect")
            .with_parameter(ParameterSchema::new("ssid", ValueType::String))
            .with_parameter(ParameterSchema::new("password", ValueType::String).with_default(""))
            .with_parameter(ParameterSchema::new("retries", ValueType::Number).with_default(3))
    }

    fn echo_handler() -> FunctionHandler {
        Arc::new(|params: FunctionParameterMap| -> HandlerResult {
            let mut object = serde_json::Map::new();
            for (name, value) in params {
                object.insert(name, value.to_json());
            }
            Ok(Some(FunctionValue::Object(object)))
        })
    }

    #[test]
    fn test_validation_order_and_defaults() {
        let schema = connect_schema();

        let mut missing = params!("retries" => "many");
        let err = FunctionRegistry::validate_parameters(&schema, &mut missing).unwrap_err();
        assert_eq!(err.to_string(), "Missing required parameter: `ssid`");

        let mut wrong_type = params!("ssid" => "office", "retries" => "many");
        let err = FunctionRegistry::validate_parameters(&schema, &mut wrong_type).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid type for parameter `retries`: expected `Number`, but got `String`"
        );

        let mut unknown = params!("ssid" => "office", "channel" => 6);
        let err = FunctionRegistry::validate_parameters(&schema, &mut unknown).unwrap_err();
        assert_eq!(err.to_string(), "Unknown parameter: `channel`");

        let mut ok = params!("ssid" => "office");
        FunctionRegistry::validate_parameters(&schema, &mut ok).unwrap();
        assert_eq!(ok.get("password"), Some(&FunctionValue::from("")));
        assert_eq!(ok.get("retries"), Some(&FunctionValue::Number(3.0)));
    }

    #[test]
    fn test_positional_values_map_in_schema_order() {
        let schema = connect_schema();

        let map = FunctionParameters::from(vec![FunctionValue::from("office"), FunctionValue::from("secret")])
            .into_map(&schema)
            .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["ssid"], FunctionValue::from("office"));
        assert_eq!(map["password"], FunctionValue::from("secret"));

        // Extra positional values beyond the schema are dropped
        let map = FunctionParameters::from(vec![
            FunctionValue::from("a"),
            FunctionValue::from("b"),
            FunctionValue::from(1),
            FunctionValue::from(true),
        ])
        .into_map(&schema)
        .unwrap();
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_json_parameters() {
        let schema = connect_schema();

        let map = FunctionParameters::from(json!({"ssid": "office", "retries": 5}))
            .into_map(&schema)
            .unwrap();
        assert_eq!(map["retries"], FunctionValue::Number(5.0));

        let err = FunctionParameters::from("{not json").into_map(&schema).unwrap_err();
        assert!(err.to_string().starts_with("Invalid JSON"));

        let err = FunctionParameters::from(json!([1, 2])).into_map(&schema).unwrap_err();
        assert!(err.to_string().contains("JSON object"));

        let err = FunctionParameters::from(json!({"ssid": null})).into_map(&schema).unwrap_err();
        assert!(err.to_string().contains("`ssid`"));
    }

    #[test]
    fn test_call_runs_handler_and_reports_errors() {
        let registry = registry();
        assert!(registry.add(connect_schema(), echo_handler()));
        assert!(!registry.add(connect_schema(), echo_handler()));

        let result = registry.call("connect", params!("ssid" => "office"));
        assert!(result.success, "{}", result.error_message);
        let data = result.data.unwrap();
        assert_eq!(data.as_object().unwrap()["retries"], json!(3.0));

        let result = registry.call("disconnect", params!());
        assert_eq!(result.error_message, "Function `disconnect` not found");

        registry.add(
            FunctionSchema::new("fails"),
            Arc::new(|_: FunctionParameterMap| -> HandlerResult { Err("radio is off".to_string()) }),
        );
        assert_eq!(registry.call("fails", params!()).error_message, "radio is off");

        registry.add(FunctionSchema::new("panics"), Arc::new(|_: FunctionParameterMap| -> HandlerResult { panic!("boom") }));
        let result = registry.call("panics", params!());
        assert!(!result.success);
        assert!(result.error_message.contains("handler failed"));
        assert!(result.error_message.contains("boom"));
    }
}
