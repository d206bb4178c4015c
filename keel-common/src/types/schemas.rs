// Schema definitions for service functions and events
//
// This module defines the declared contracts services publish for the things they
// expose: callable functions (with ordered, typed parameters) and publishable events
// (with ordered, typed items). Registries validate every call and publication
// against these schemas.

use serde::{Deserialize, Serialize};

use super::value::{FunctionValue, ValueType};

/// One parameter of a function.
///
/// A parameter without a default value is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub name: String,
    pub description: String,
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<FunctionValue>,
}

impl ParameterSchema {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            value_type,
            default_value: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default(mut self, value: impl Into<FunctionValue>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn is_required(&self) -> bool {
        self.default_value.is_none()
    }
}

/// Declared contract of a callable function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSchema>,
    /// Calls are queued on the service's "call" group and need a running service
    pub require_running: bool,
    /// Calls carry a raw buffer and always execute inline on the caller's thread
    pub has_raw_buffer: bool,
}

impl FunctionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: Vec::new(),
            require_running: true,
            has_raw_buffer: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a parameter. A `RawBuffer` parameter marks the whole function as raw.
    pub fn with_parameter(mut self, parameter: ParameterSchema) -> Self {
        if parameter.value_type == ValueType::RawBuffer {
            self.has_raw_buffer = true;
        }
        self.parameters.push(parameter);
        self
    }

    pub fn with_require_running(mut self, require_running: bool) -> Self {
        self.require_running = require_running;
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSchema> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// One item carried by an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventItemSchema {
    pub name: String,
    pub description: String,
    pub value_type: ValueType,
}

impl EventItemSchema {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            value_type,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Declared contract of a publishable event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSchema {
    pub name: String,
    pub description: String,
    pub items: Vec<EventItemSchema>,
    /// Events carrying a raw buffer are emitted inline, never through the "event" group
    pub has_raw_buffer: bool,
}

impl EventSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            items: Vec::new(),
            has_raw_buffer: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_item(mut self, item: EventItemSchema) -> Self {
        if item.value_type == ValueType::RawBuffer {
            self.has_raw_buffer = true;
        }
        self.items.push(item);
        self
    }

    pub fn item(&self, name: &str) -> Option<&EventItemSchema> {
        self.items.iter().find(|i| i.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_buffer_parameter_marks_schema() {
        let schema = FunctionSchema::new("write")
            .with_parameter(ParameterSchema::new("offset", ValueType::Number).with_default(0))
            .with_parameter(ParameterSchema::new("data", ValueType::RawBuffer));

        assert!(schema.has_raw_buffer);
        assert!(schema.require_running);
        assert!(!schema.parameter("offset").unwrap().is_required());
        assert!(schema.parameter("data").unwrap().is_required());

        let event = EventSchema::new("frame").with_item(EventItemSchema::new("pixels", ValueType::RawBuffer));
        assert!(event.has_raw_buffer);
    }

    #[test]
    fn test_schema_json_shape() {
        let schema = FunctionSchema::new("set_connect_ap")
            .with_parameter(ParameterSchema::new("ssid", ValueType::String));
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["parameters"][0]["value_type"], "String");
        assert!(json["parameters"][0].get("default_value").is_none());
    }
}
