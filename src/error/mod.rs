// src/error/mod.rs
//! Error taxonomy for the governance layer.
//!
//! Every request either resolves with a value or fails with one of these
//! variants. The type is `Clone` because deduplicated waiters all receive the
//! same outcome.

use thiserror::Error;

pub const RATE_LIMIT_STATUS: u16 = 429;
pub const RATE_LIMIT_CODE: &str = "RATE_LIMIT_EXCEEDED";
pub const RATE_LIMIT_ERROR_TYPE: &str = "rate_limit_error";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GovernorError {
    /// Failure surfaced by the caller-supplied executor
    #[error("API Error{}: {message}", status_suffix(.status))]
    Api {
        status: Option<u16>,
        code: Option<String>,
        error_type: Option<String>,
        message: String,
    },

    /// Rate-limit retries used up
    #[error("Max retries ({attempts}) exceeded for {endpoint}: {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    /// The batch died before producing per-item results
    #[error("Batch Failure [{batch}]: {message}")]
    BatchFailure { batch: String, message: String },

    /// Shutdown rejected the request
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl From<serde_json::Error> for GovernorError {
    fn from(err: serde_json::Error) -> Self {
        GovernorError::Serialization(err.to_string())
    }
}

impl GovernorError {
    /// Plain executor failure with no classification hints.
    pub fn api(message: impl Into<String>) -> Self {
        GovernorError::Api {
            status: None,
            code: None,
            error_type: None,
            message: message.into(),
        }
    }

    /// Executor failure carrying an HTTP status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        GovernorError::Api {
            status: Some(status),
            code: None,
            error_type: None,
            message: message.into(),
        }
    }

    /// Executor failure that the limiter will treat as a quota rejection.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        GovernorError::Api {
            status: Some(RATE_LIMIT_STATUS),
            code: Some(RATE_LIMIT_CODE.to_string()),
            error_type: Some(RATE_LIMIT_ERROR_TYPE.to_string()),
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        GovernorError::Cancelled(reason.into())
    }

    /// True when the executor reported a quota rejection: status 429, code
    /// `RATE_LIMIT_EXCEEDED` or type `rate_limit_error`. Any one is enough.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            GovernorError::Api {
                status,
                code,
                error_type,
                ..
            } => {
                *status == Some(RATE_LIMIT_STATUS)
                    || code.as_deref() == Some(RATE_LIMIT_CODE)
                    || error_type.as_deref() == Some(RATE_LIMIT_ERROR_TYPE)
            }
            _ => false,
        }
    }

    pub fn categorize(&self) -> ErrorCategory {
        match self {
            e @ GovernorError::Api { .. } if e.is_rate_limit() => ErrorCategory::RateLimit,
            GovernorError::Api { .. } => ErrorCategory::Executor,
            GovernorError::RetriesExhausted { .. } => ErrorCategory::RateLimit,
            GovernorError::BatchFailure { .. } => ErrorCategory::Batch,
            GovernorError::Cancelled(_) => ErrorCategory::Shutdown,
            GovernorError::Config(_) => ErrorCategory::Configuration,
            GovernorError::Serialization(_) => ErrorCategory::Data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    RateLimit,
    Executor,
    Batch,
    Shutdown,
    Configuration,
    Data,
}

pub type Result<T> = std::result::Result<T, GovernorError>;
