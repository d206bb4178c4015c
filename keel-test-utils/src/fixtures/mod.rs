// Test fixtures
//
// Small services exercising the framework from the outside: arithmetic, ordered
// counting, lifecycle journaling and a WiFi mock exposed over RPC.

pub mod counter_service;
pub mod lifecycle_probe;
pub mod math_service;
pub mod wifi_service;

use keel_common::types::{FunctionParameterMap, FunctionValue};

pub(crate) fn number(params: &FunctionParameterMap, name: &str) -> Result<f64, String> {
    params
        .get(name)
        .and_then(FunctionValue::as_f64)
        .ok_or_else(|| format!("Parameter `{name}` must be a number"))
}

pub(crate) fn text<'a>(params: &'a FunctionParameterMap, name: &str) -> Result<&'a str, String> {
    params
        .get(name)
        .and_then(FunctionValue::as_str)
        .ok_or_else(|| format!("Parameter `{name}` must be a string"))
}
