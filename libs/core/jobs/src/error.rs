//! Broker error types and error categorization
//!
//! Two families of errors live here:
//! - [`JobsError`]: everything the broker and its drivers can report. Each
//!   variant maps onto an [`ErrorKind`] so control-plane callers get a
//!   structured `{kind, message}` pair.
//! - [`HandlerError`]: failures reported by whoever executed a job. Its
//!   [`ErrorCategory`] decides between requeue and dead-letter.

use serde::Serialize;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Category of a job execution failure, used for the retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary failure - requeue with backoff while attempts remain
    Transient,
    /// Unrecoverable failure - dead-letter immediately
    Permanent,
    /// Downstream rate limit - requeue with a longer delay
    RateLimited,
}

impl ErrorCategory {
    /// Multiplier applied to the backoff delay for this category
    pub fn delay_factor(&self) -> u32 {
        match self {
            ErrorCategory::Transient => 1,
            ErrorCategory::Permanent => 0,
            ErrorCategory::RateLimited => 5,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }
}

/// Machine-readable error kind exposed through the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Connection,
    Decode,
    Encode,
    InvalidDelay,
    NoSuchPipeline,
    PipelineExists,
    DuplicateJob,
    NoSuchDriver,
    NotRunning,
    Storage,
    Closed,
    Internal,
}

/// Broker and driver errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobsError {
    /// Missing or malformed pipeline/driver configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend unreachable or the connection was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed message body
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    /// Requested delay exceeds what the backend supports
    #[error("maximum possible delay is {max} seconds, got {requested}")]
    InvalidDelay { requested: u64, max: u64 },

    #[error("no such pipeline: {0}")]
    NoSuchPipeline(String),

    #[error("pipeline already declared: {0}")]
    PipelineExists(String),

    /// A job with this id is already queued or in flight
    #[error("job already stored: {0}")]
    DuplicateJob(String),

    #[error("no driver registered for `{0}`")]
    NoSuchDriver(String),

    /// The consumer has not opened its backend resources (yet or anymore)
    #[error("pipeline is not running: {0}")]
    NotRunning(String),

    /// Local durable storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// The queue or broker has been shut down
    #[error("broker closed")]
    Closed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobsError {
    pub fn config(message: impl Into<String>) -> Self {
        JobsError::Config(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        JobsError::Connection(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        JobsError::Storage(message.into())
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobsError::Config(_) => ErrorKind::Config,
            JobsError::Connection(_) => ErrorKind::Connection,
            JobsError::Decode(_) => ErrorKind::Decode,
            JobsError::Encode(_) => ErrorKind::Encode,
            JobsError::InvalidDelay { .. } => ErrorKind::InvalidDelay,
            JobsError::NoSuchPipeline(_) => ErrorKind::NoSuchPipeline,
            JobsError::PipelineExists(_) => ErrorKind::PipelineExists,
            JobsError::DuplicateJob(_) => ErrorKind::DuplicateJob,
            JobsError::NoSuchDriver(_) => ErrorKind::NoSuchDriver,
            JobsError::NotRunning(_) => ErrorKind::NotRunning,
            JobsError::Storage(_) => ErrorKind::Storage,
            JobsError::Closed => ErrorKind::Closed,
            JobsError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error means the backend connection must be rebuilt
    pub fn is_connection(&self) -> bool {
        matches!(self, JobsError::Connection(_))
    }

    /// Structured form for control-plane responses
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for JobsError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            JobsError::Encode(err.to_string())
        } else {
            JobsError::Decode(err.to_string())
        }
    }
}

/// Serialized error returned by the control API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Failure reported by a job handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{category} failure: {message}")]
pub struct HandlerError {
    pub message: String,
    pub category: ErrorCategory,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::RateLimited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(JobsError::config("x").kind(), ErrorKind::Config);
        assert_eq!(
            JobsError::InvalidDelay {
                requested: 1000,
                max: 900
            }
            .kind(),
            ErrorKind::InvalidDelay
        );
        assert_eq!(JobsError::Closed.kind(), ErrorKind::Closed);
        assert_eq!(
            JobsError::DuplicateJob("a".into()).kind().as_ref(),
            "duplicate_job"
        );
        assert!(JobsError::connection("reset").is_connection());
        assert!(!JobsError::storage("disk").is_connection());
    }

    #[test]
    fn test_invalid_delay_message() {
        let err = JobsError::InvalidDelay {
            requested: 1000,
            max: 900,
        };
        assert_eq!(
            err.to_string(),
            "maximum possible delay is 900 seconds, got 1000"
        );
    }

    #[test]
    fn test_error_body_is_structured() {
        let body = JobsError::NoSuchPipeline("emails".into()).to_body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "no_such_pipeline");
        assert_eq!(json["message"], "no such pipeline: emails");
    }

    #[test]
    fn test_serde_json_errors_are_decode_errors() {
        let err: JobsError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_handler_error_categories() {
        assert!(HandlerError::transient("x").category.is_retryable());
        assert!(HandlerError::rate_limited("x").category.is_retryable());
        assert!(!HandlerError::permanent("x").category.is_retryable());
        assert_eq!(ErrorCategory::RateLimited.delay_factor(), 5);
        assert_eq!(HandlerError::permanent("bad").to_string(), "permanent failure: bad");
    }
}
