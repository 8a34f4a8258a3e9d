use thiserror::Error;

/// Main error type for the RiskGate system
#[derive(Error, Debug)]
pub enum RgError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Data fetch error: {0}")]
    DataFetch(#[from] DataFetchError),

    #[error("Submission rejected: {reason}")]
    SubmissionRejected { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Shared-store connectivity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Store unreachable: {message}")]
    Unreachable { message: String },

    #[error("Connection retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Operation failed on store: {operation}, error: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("Connection manager is closed")]
    Closed,
}

/// Load-balancer routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Load balancer is not running")]
    NotRunning,

    #[error("No workers available")]
    NoWorkers,

    #[error("All workers saturated, request {request_id} rejected after {attempts} attempts")]
    Saturated { request_id: String, attempts: u32 },
}

/// Market-signal fetch errors. Absorbed by the limits engine, never surfaced
/// to submitters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataFetchError {
    #[error("Signal source {source_name} unavailable: {message}")]
    SourceUnavailable { source_name: String, message: String },

    #[error("Signal fetch rejected: circuit '{breaker}' is open")]
    CircuitOpen { breaker: String },
}

/// Result type alias for RiskGate operations
pub type RgResult<T> = Result<T, RgError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::RgError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::RgError::Config(format!($($arg)*))
    };
}
