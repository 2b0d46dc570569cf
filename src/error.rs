//! Error types for the interview core.
//!
//! Each error variant carries a stable error code (SCREAMING_SNAKE_CASE)
//! that is included in the Display output and accessible via [`ApiError::code()`].
//! Codes are part of the public API contract and will not change.
//!
//! Errors also carry the metadata the UI needs to present a failure: a
//! human-readable message, an optional HTTP status, optional raw details and
//! whether the failure is worth retrying.

use std::time::Duration;

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// The request never produced a response (DNS, connect, reset).
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";

    /// An attempt exceeded its time bound and was aborted.
    pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";

    /// The backend answered with a non-success status.
    pub const HTTP_ERROR: &str = "HTTP_ERROR";

    /// The backend answered with a payload that could not be decoded.
    pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";

    /// A streamed response reported an error or broke off.
    pub const STREAM_FAILED: &str = "STREAM_FAILED";

    /// The caller supplied input that cannot be sent.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

    /// Audio playback could not start or ended abnormally.
    pub const PLAYBACK_FAILED: &str = "PLAYBACK_FAILED";

    /// The operation was cancelled by its owner.
    pub const CANCELLED: &str = "CANCELLED";

    /// Invalid or unreadable configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
}

/// User-facing messages shown for each failure class.
pub mod user_messages {
    pub const NETWORK_ERROR: &str = "Network error occurred. Please check your connection.";
    pub const API_UNAVAILABLE: &str =
        "Backend API is currently unavailable. Please try again later.";
    pub const INVALID_RESPONSE: &str = "Received invalid response from server.";
    pub const MODEL_NOT_AVAILABLE: &str = "The selected AI model is not available.";
    pub const AUTHENTICATION_ERROR: &str = "Authentication failed. Please log in again.";
    pub const RATE_LIMIT_ERROR: &str =
        "Too many requests. Please wait a moment before trying again.";
    pub const UNKNOWN_ERROR: &str = "An unexpected error occurred. Please try again.";
    pub const SPEECH_ERROR: &str = "Failed to generate speech. Please try again.";
}

/// HTTP status reported for client-side timeouts.
pub const TIMEOUT_STATUS: u16 = 408;

/// Errors produced by transport, generation and speech operations.
///
/// The Display impl formats as `[CODE] message`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No response was received.
    #[error("[{}] {message}", error_codes::NETWORK_ERROR)]
    Network {
        message: String,
        details: Option<String>,
    },

    /// The attempt was aborted after its time bound elapsed.
    #[error("[{}] {message}", error_codes::TIMEOUT_ERROR)]
    Timeout { message: String, elapsed_ms: u64 },

    /// The backend returned a non-success status.
    #[error("[{}] {message} (status {status})", error_codes::HTTP_ERROR)]
    Http {
        status: u16,
        message: String,
        details: Option<String>,
    },

    /// The backend payload could not be decoded.
    #[error("[{}] {message}", error_codes::INVALID_RESPONSE)]
    InvalidResponse {
        message: String,
        details: Option<String>,
    },

    /// The stream carried an error payload or broke off mid-way.
    #[error("[{}] {message}", error_codes::STREAM_FAILED)]
    Stream {
        message: String,
        details: Option<String>,
    },

    /// The request was rejected before being sent.
    #[error("[{code}] {0}", code = error_codes::INVALID_REQUEST)]
    InvalidRequest(String),

    /// Audio playback failed.
    #[error("[{code}] {0}", code = error_codes::PLAYBACK_FAILED)]
    Playback(String),

    /// The operation was cancelled.
    #[error("[{code}] {0}", code = error_codes::CANCELLED)]
    Cancelled(String),

    /// Configuration could not be loaded or is out of range.
    #[error("[{code}] {0}", code = error_codes::CONFIG_INVALID)]
    Config(String),
}

impl ApiError {
    /// Classify a non-success HTTP status, keeping the response body as details.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = match status {
            400 => user_messages::INVALID_RESPONSE,
            401 => user_messages::AUTHENTICATION_ERROR,
            404 => user_messages::MODEL_NOT_AVAILABLE,
            429 => user_messages::RATE_LIMIT_ERROR,
            500 | 502 | 503 | 504 => user_messages::API_UNAVAILABLE,
            _ => user_messages::UNKNOWN_ERROR,
        };
        let details = if body.trim().is_empty() {
            None
        } else {
            Some(body.trim().to_owned())
        };
        Self::Http {
            status,
            message: message.to_owned(),
            details,
        }
    }

    /// Classify a reqwest failure that happened before a status was available.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::timeout(Duration::ZERO);
        }
        if err.is_decode() {
            return Self::InvalidResponse {
                message: user_messages::INVALID_RESPONSE.to_owned(),
                details: Some(err.to_string()),
            };
        }
        if err.is_body() {
            return Self::Stream {
                message: user_messages::NETWORK_ERROR.to_owned(),
                details: Some(err.to_string()),
            };
        }
        Self::Network {
            message: user_messages::NETWORK_ERROR.to_owned(),
            details: Some(err.to_string()),
        }
    }

    /// Timeout raised after `elapsed` without a response.
    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout {
            message: user_messages::NETWORK_ERROR.to_owned(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Payload decoding failure.
    pub fn invalid_response(details: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: user_messages::INVALID_RESPONSE.to_owned(),
            details: Some(details.into()),
        }
    }

    /// Error reported by the backend inside a stream.
    pub fn stream(details: impl Into<String>) -> Self {
        Self::Stream {
            message: user_messages::UNKNOWN_ERROR.to_owned(),
            details: Some(details.into()),
        }
    }

    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => error_codes::NETWORK_ERROR,
            Self::Timeout { .. } => error_codes::TIMEOUT_ERROR,
            Self::Http { .. } => error_codes::HTTP_ERROR,
            Self::InvalidResponse { .. } => error_codes::INVALID_RESPONSE,
            Self::Stream { .. } => error_codes::STREAM_FAILED,
            Self::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            Self::Playback(_) => error_codes::PLAYBACK_FAILED,
            Self::Cancelled(_) => error_codes::CANCELLED,
            Self::Config(_) => error_codes::CONFIG_INVALID,
        }
    }

    /// Returns the human-readable message without the code prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Network { message, .. }
            | Self::Timeout { message, .. }
            | Self::Http { message, .. }
            | Self::InvalidResponse { message, .. }
            | Self::Stream { message, .. } => message,
            Self::InvalidRequest(m)
            | Self::Playback(m)
            | Self::Cancelled(m)
            | Self::Config(m) => m,
        }
    }

    /// HTTP status associated with the failure. Timeouts report 408.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Timeout { .. } => Some(TIMEOUT_STATUS),
            _ => None,
        }
    }

    /// Raw details (response body, transport error text) when available.
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Network { details, .. }
            | Self::Http { details, .. }
            | Self::InvalidResponse { details, .. }
            | Self::Stream { details, .. } => details.as_deref(),
            Self::Timeout { .. } => Some("Request timeout"),
            _ => None,
        }
    }

    /// Returns true if this error represents a transient failure that can be retried.
    ///
    /// Retryable: network failures, timeouts, stream interruptions, and
    /// statuses 408, 429 and 5xx. Everything else fails immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Stream { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::InvalidResponse { .. }
            | Self::InvalidRequest(_)
            | Self::Playback(_)
            | Self::Cancelled(_)
            | Self::Config(_) => false,
        }
    }

    /// Whether the error came from the owner cancelling the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Convenience alias for crate results.
pub type Result<T> = std::result::Result<T, ApiError>;
