//! Error types for webhook delivery operations.
//!
//! Every failure of a single delivery is classified here, and
//! [`DeliveryError::is_retryable`] is the only place that decides whether a
//! failure is worth another attempt.

use std::{fmt, time::Duration};

use bastion_core::CoreError;
use thiserror::Error;

use crate::url_guard::UrlValidationError;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failures of webhook delivery and of the machinery around it.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Destination URL failed SSRF validation.
    #[error("unsafe destination: {0}")]
    UnsafeUrl(#[from] UrlValidationError),

    /// Connection could not be established or broke mid-request.
    #[error("network error: {message}")]
    Network {
        /// Transport error description
        message: String,
    },

    /// Request did not complete within the delivery timeout.
    #[error("request timed out after {}s", timeout.as_secs())]
    Timeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Receiver answered 429.
    #[error("rate limited by receiver")]
    RateLimited {
        /// Seconds from a `Retry-After` header, if any
        retry_after_seconds: Option<u64>,
    },

    /// Receiver answered 5xx.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// Response status
        status_code: u16,
    },

    /// Receiver answered 4xx other than 429.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// Response status
        status_code: u16,
    },

    /// Receiver answered with a redirect, which is never followed.
    #[error("redirect not followed: HTTP {status_code}")]
    Redirect {
        /// Response status
        status_code: u16,
        /// `Location` header, if present
        location: Option<String>,
    },

    /// Receiver answered with a status outside 2xx-5xx.
    #[error("unexpected status: HTTP {status_code}")]
    UnexpectedStatus {
        /// Response status
        status_code: u16,
    },

    /// Payload could not be serialized or signed.
    #[error("payload error: {message}")]
    Payload {
        /// Error description
        message: String,
    },

    /// Delivery records could not be read or written.
    #[error("storage error: {message}")]
    Storage {
        /// Error description
        message: String,
    },

    /// Job queue operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Error description
        message: String,
    },

    /// Invalid delivery configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Error description
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {}s", timeout.as_secs())]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker index
        worker_id: usize,
        /// Join error description
        error: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a payload error.
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload { message: message.into() }
    }

    /// Classifies a non-2xx response status.
    pub fn from_status(
        status_code: u16,
        retry_after_seconds: Option<u64>,
        location: Option<String>,
    ) -> Self {
        match status_code {
            429 => Self::RateLimited { retry_after_seconds },
            500..=599 => Self::ServerError { status_code },
            400..=499 => Self::ClientError { status_code },
            300..=399 => Self::Redirect { status_code, location },
            _ => Self::UnexpectedStatus { status_code },
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Transport failures, timeouts, 5xx and 429 are transient. Unsafe URLs,
    /// other 4xx, redirects and unexpected statuses are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::ServerError { .. }
            | Self::Storage { .. }
            | Self::Queue { .. } => true,

            Self::UnsafeUrl(_)
            | Self::ClientError { .. }
            | Self::Redirect { .. }
            | Self::UnexpectedStatus { .. }
            | Self::Payload { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }

    /// HTTP status carried by the error, if a response was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ServerError { status_code }
            | Self::ClientError { status_code }
            | Self::Redirect { status_code, .. }
            | Self::UnexpectedStatus { status_code } => Some(*status_code),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::storage(err.to_string())
    }
}

/// Coarse failure category for logs and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Rejected by SSRF validation.
    Validation,
    /// Transport or timeout.
    Network,
    /// Receiver rejected the request.
    Client,
    /// Receiver failed or throttled.
    Server,
    /// Storage or queue.
    Infrastructure,
    /// Configuration, payload or worker lifecycle.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::UnsafeUrl(_) => Self::Validation,
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. }
            | DeliveryError::Redirect { .. }
            | DeliveryError::UnexpectedStatus { .. } => Self::Client,
            DeliveryError::ServerError { .. } | DeliveryError::RateLimited { .. } => Self::Server,
            DeliveryError::Storage { .. } | DeliveryError::Queue { .. } => Self::Infrastructure,
            DeliveryError::Payload { .. }
            | DeliveryError::Configuration { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Client => "client",
            Self::Server => "server",
            Self::Infrastructure => "infrastructure",
            Self::Internal => "internal",
        })
    }
}
