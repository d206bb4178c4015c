use thiserror::Error;

/// Error taxonomy for service dispatch, lifecycle and RPC.
///
/// These never cross the public API as panics: dispatch paths turn them into a failed
/// `FunctionResult` whose message is the `Display` form below.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Service `{0}` is not initialized")]
    NotInitialized(String),

    #[error("Function `{function}` requires running, but service `{service}` is not running")]
    NotRunning { service: String, function: String },

    #[error("Function `{0}` not found")]
    UnknownFunction(String),

    #[error("Event `{0}` not found")]
    UnknownEvent(String),

    #[error("Service `{0}` not found")]
    UnknownService(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Timeout(String),

    #[error("Failed to bind dependency `{dependency}` of service `{service}`")]
    DependencyFailure { service: String, dependency: String },

    #[error("Circular dependency detected among services: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Function `{function}` handler failed: {reason}")]
    HandlerFailed { function: String, reason: String },

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Validation(format!("Invalid JSON: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
