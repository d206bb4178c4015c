use serde::{Deserialize, Serialize};

use super::value::FunctionValue;
use crate::errors::ServiceError;

/// Outcome of a single function call.
///
/// Created fresh per call and handed back by value; never shared between calls.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<FunctionValue>,
    #[serde(default)]
    pub error_message: String,
}

impl FunctionResult {
    pub fn ok(data: Option<FunctionValue>) -> Self {
        Self {
            success: true,
            data,
            error_message: String::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&FunctionValue> {
        self.data.as_ref()
    }
}

impl From<ServiceError> for FunctionResult {
    fn from(error: ServiceError) -> Self {
        FunctionResult::fail(error.to_string())
    }
}

impl From<Result<Option<FunctionValue>, ServiceError>> for FunctionResult {
    fn from(result: Result<Option<FunctionValue>, ServiceError>) -> Self {
        match result {
            Ok(data) => FunctionResult::ok(data),
            Err(e) => e.into(),
        }
    }
}
