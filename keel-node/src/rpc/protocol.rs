// RPC Protocol Module
//
// INTENTION:
// Logical messages exchanged between an RPC client and the server, and their line
// framing. Every message is one JSON object terminated by a newline.
//
// - Request:  {"id", "service", "method", "params"}   (service = connection id)
// - Response: {"id", "result"} or {"id", "error": {"code", "message"}}
// - Notify:   {"event", "data", "subscription_ids"}

use keel_common::types::{EventItemMap, FunctionResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Built-in method subscribing the caller's peer to an event
pub const SUBSCRIBE_EVENT_METHOD: &str = "$subscribe_event";
/// Parameter of `$subscribe_event`
pub const SUBSCRIBE_EVENT_PARAM: &str = "event_name";
/// Built-in method dropping subscriptions by id
pub const UNSUBSCRIBE_EVENTS_METHOD: &str = "$unsubscribe_events";
/// Parameter of `$unsubscribe_events`
pub const UNSUBSCRIBE_EVENTS_PARAM: &str = "subscription_ids";

/// The function itself failed
pub const ERROR_FUNCTION_FAILED: i32 = -1;
/// Unparsable request
pub const ERROR_PARSE: i32 = -32700;
/// Parameters are not an object or do not fit the method
pub const ERROR_INVALID_PARAMS: i32 = -32602;
/// No connection registered under the requested service
pub const ERROR_CONNECTION_NOT_FOUND: i32 = -32001;
/// The service's connection exists but its service is not running
pub const ERROR_CONNECTION_INACTIVE: i32 = -32002;

/// Check whether a method name is one of the built-ins handled by every connection
pub fn is_builtin_method(method: &str) -> bool {
    method.starts_with('$')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: impl Into<String>, result: Option<Value>) -> Self {
        Self {
            id: id.into(),
            result,
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Build a response from the outcome of a local function call
    pub fn from_function_result(id: impl Into<String>, result: FunctionResult) -> Self {
        if result.success {
            Self::ok(id, result.data.map(|data| data.to_json()))
        } else {
            Self::error(id, ERROR_FUNCTION_FAILED, result.error_message)
        }
    }

    /// Turn a response back into a function result on the client side
    pub fn into_function_result(self) -> FunctionResult {
        match self.error {
            Some(error) => FunctionResult::fail(error.message),
            None => match self.result {
                None | Some(Value::Null) => FunctionResult::ok(None),
                Some(value) => match keel_common::types::FunctionValue::from_json(value) {
                    Ok(data) => FunctionResult::ok(Some(data)),
                    Err(e) => FunctionResult::fail(format!("Invalid result: {e}")),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notify {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub subscription_ids: Vec<String>,
}

impl Notify {
    pub fn from_items(event: &str, items: &EventItemMap, subscription_ids: Vec<String>) -> Self {
        let data: Map<String, Value> = items
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        Self {
            event: event.to_string(),
            data: Value::Object(data),
            subscription_ids,
        }
    }
}

/// Anything a client can receive
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Response(Response),
    Notify(Notify),
}

/// Serialize a message as one newline-terminated frame
pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut frame = serde_json::to_string(message)?;
    frame.push('\n');
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::params;
    use keel_common::types::FunctionValue;
    use serde_json::json;

    #[test]
    fn test_response_shapes() {
        let ok = Response::from_function_result("r1", FunctionResult::ok(Some(FunctionValue::from("office"))));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"id": "r1", "result": "office"}));

        let failed = Response::from_function_result("r2", FunctionResult::fail("radio is off"));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"id": "r2", "error": {"code": -1, "message": "radio is off"}})
        );

        assert_eq!(
            ok.into_function_result().data,
            Some(FunctionValue::from("office"))
        );
        assert_eq!(failed.into_function_result().error_message, "radio is off");
    }

    #[test]
    fn test_incoming_distinguishes_response_and_notify() {
        let response: Incoming = serde_json::from_str(r#"{"id":"r1","result":true}"#).unwrap();
        assert!(matches!(response, Incoming::Response(_)));

        let notify = Notify::from_items("connected", &params!("ssid" => "office"), vec!["s1".into()]);
        let frame = encode_frame(&notify).unwrap();
        assert!(frame.ends_with('\n'));
        let incoming: Incoming = serde_json::from_str(frame.trim_end()).unwrap();
        match incoming {
            Incoming::Notify(notify) => {
                assert_eq!(notify.event, "connected");
                assert_eq!(notify.data, json!({"ssid": "office"}));
                assert_eq!(notify.subscription_ids, vec!["s1".to_string()]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_request_params_default_to_null() {
        let request: Request =
            serde_json::from_str(r#"{"id":"r1","service":"Wifi","method":"get_connect_ap"}"#).unwrap();
        assert_eq!(request.params, Value::Null);
        assert!(is_builtin_method(SUBSCRIBE_EVENT_METHOD));
        assert!(!is_builtin_method(&request.method));
    }
}
