//! Error types for jmx-collector
//!
//! Each layer owns its error enum; [`ClassifiedError`] is the only error that
//! crosses the task-processor boundary.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Filter 컴파일 에러
#[derive(Error, Debug)]
pub enum FilterError {
    /// 정규식 패턴 컴파일 실패
    #[error("Invalid regex pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// 지원되지 않는 regex 문법
    #[error("Unsupported regex syntax in pattern '{pattern}': {feature}")]
    UnsupportedSyntax { pattern: String, feature: String },
}

/// Connection collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// HTTP 클라이언트 초기화 실패
    #[error("Failed to initialize client: {0}")]
    ClientInit(String),

    /// I/O failure while talking to the target
    #[error("I/O error: {0}")]
    Io(String),

    /// 타임아웃
    /// The value is the configured timeout in milliseconds, if known.
    #[error("Request timed out{}", .0.map(|ms| format!(" after {}ms", ms)).unwrap_or_default())]
    Timeout(Option<u64>),

    /// 인증 실패
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Bean을 찾을 수 없음
    #[error("Bean not found: {0}")]
    BeanNotFound(String),

    /// Attribute could not be read from an existing bean
    #[error("Attribute '{attribute}' unavailable on {bean}: {message}")]
    AttributeUnavailable {
        bean: String,
        attribute: String,
        message: String,
    },

    /// 잘못된 bean 이름
    #[error("Invalid bean name: {0}")]
    InvalidBeanName(String),

    /// Malformed response from the target
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection was closed by the collector
    #[error("Connection closed")]
    Closed,
}

impl ConnectionError {
    /// Whether the failure means the target itself is unreachable.
    ///
    /// Fatal errors break the instance; the others only affect one bean or
    /// attribute.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::ClientInit(_)
                | ConnectionError::Io(_)
                | ConnectionError::Timeout(_)
                | ConnectionError::Authentication(_)
                | ConnectionError::Closed
        )
    }
}

impl From<reqwest::Error> for ConnectionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest doesn't expose the configured timeout duration
            ConnectionError::Timeout(None)
        } else if err.is_decode() {
            ConnectionError::Protocol(err.to_string())
        } else {
            ConnectionError::Io(err.to_string())
        }
    }
}

/// Errors raised while turning a live value into metric values
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Value cannot be coerced to a number
    #[error("Cannot convert value of '{attribute}' to a number: {value}")]
    NumberFormat { attribute: String, value: String },

    /// A sub-attribute selected at match time is gone from the live value
    #[error("Sub-attribute '{path}' missing from '{attribute}'")]
    MissingPath { attribute: String, path: String },

    /// The live value no longer has the shape the attribute was classified with
    #[error("Unexpected value for '{attribute}': expected {expected}")]
    UnexpectedShape {
        attribute: String,
        expected: &'static str,
    },

    /// Collaborator failure during the fetch
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl ExtractError {
    /// Whether the error must break the whole instance instead of one attribute
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExtractError::Connection(e) if e.is_fatal())
    }
}

/// Instance lifecycle errors
#[derive(Error, Debug)]
pub enum InstanceError {
    /// Collaborator failure
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Configuration filter could not be compiled
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// Attribute extraction failure that cannot be confined to the attribute
    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    /// `collect` called before a successful `init`
    #[error("Instance {0} is not initialized")]
    NotInitialized(String),
}

/// Task processor failures that are not attributable to a single task
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Every worker is busy; the pool must be rebuilt before submitting
    #[error("Worker pool '{pool}' exhausted: {active} of {size} workers busy")]
    PoolExhausted {
        pool: String,
        active: usize,
        size: usize,
    },

    /// The processor failed for another reason
    #[error("Task processor failed: {0}")]
    Internal(String),
}

/// Uniform error carried by a task status
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedError {
    /// An attribute extraction failed; the instance stays alive
    #[error("Attribute extraction failed: {0}")]
    TransientAttribute(String),

    /// Bean or attribute listing failed
    #[error("Connection error: {0}")]
    ConnectionIo(String),

    /// The batch deadline passed before the task finished
    #[error("Task did not finish within {0:?}")]
    ScheduleTimeout(Duration),

    /// The target rejected the credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The collection completed without producing a single metric
    #[error("No metrics returned")]
    NoMetrics,

    /// The processor itself failed
    #[error("Internal scheduler error: {0}")]
    InternalScheduler(String),
}

impl ClassifiedError {
    /// Whether the failing instance moves to the broken set
    pub fn marks_broken(&self) -> bool {
        matches!(
            self,
            ClassifiedError::ConnectionIo(_)
                | ClassifiedError::ScheduleTimeout(_)
                | ClassifiedError::Authentication(_)
                | ClassifiedError::NoMetrics
        )
    }

    /// Message surfaced in service checks
    pub fn user_message(&self, instance: &str) -> String {
        match self {
            ClassifiedError::Authentication(_) => format!(
                "Unable to authenticate to instance {}: check the configured credentials",
                instance
            ),
            ClassifiedError::ScheduleTimeout(timeout) => format!(
                "Instance {} did not answer within {}s",
                instance,
                timeout.as_secs()
            ),
            ClassifiedError::NoMetrics => format!("Instance {} didn't return any metrics", instance),
            other => format!("Instance {}: {}", instance, other),
        }
    }
}

impl From<&InstanceError> for ClassifiedError {
    fn from(err: &InstanceError) -> Self {
        match err {
            InstanceError::Connection(ConnectionError::Authentication(msg)) => {
                ClassifiedError::Authentication(msg.clone())
            }
            InstanceError::Connection(e) => ClassifiedError::ConnectionIo(e.to_string()),
            InstanceError::Extract(e) => ClassifiedError::from(e),
            // filters are validated at load time; reaching this goes through recovery
            InstanceError::Filter(e) => ClassifiedError::ConnectionIo(e.to_string()),
            InstanceError::NotInitialized(name) => {
                ClassifiedError::ConnectionIo(format!("instance {} is not initialized", name))
            }
        }
    }
}

impl From<&ExtractError> for ClassifiedError {
    fn from(err: &ExtractError) -> Self {
        match err {
            ExtractError::Connection(ConnectionError::Authentication(msg)) => {
                ClassifiedError::Authentication(msg.clone())
            }
            e if e.is_fatal() => ClassifiedError::ConnectionIo(e.to_string()),
            e => ClassifiedError::TransientAttribute(e.to_string()),
        }
    }
}

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// No collection has completed yet
    #[error("No collection has completed yet")]
    NotReady,

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, public_message, log_message) = match self {
            AppError::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error",
                e.to_string(),
            ),
            AppError::NotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No collection has completed yet",
                "metrics requested before first iteration".to_string(),
            ),
            AppError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error", e),
        };

        tracing::error!(status = %status, error = %log_message, "Request failed");

        (status, public_message).into_response()
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;
