//! Keel Common
//!
//! Common types and utilities shared by the Keel service framework.
//!
//! This crate provides:
//! - Component-based structured logging with a root id carried through child loggers
//! - Typed function values, function/event schemas and call results
//! - The error taxonomy used across service dispatch and RPC

pub mod errors;
pub mod logging;
pub mod macros;
pub mod types;

pub use errors::{Result, ServiceError};
pub use logging::{Component, LogLevel, Logger, LoggingConfig};
pub use types::{
    EventItemMap, EventItemSchema, EventSchema, FunctionParameterMap, FunctionResult,
    FunctionSchema, FunctionValue, ParameterSchema, ValueType,
};
