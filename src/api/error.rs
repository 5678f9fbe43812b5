//! Error types for API requests and the device authorization flow.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("HTTP error {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    DecodingError(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Malformed data: {0}")]
    MalformedData(String),

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("Companion registration failed: {0}")]
    RegistrationFailed(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..MAX_ERROR_BODY_LENGTH],
                body.len()
            )
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => ApiError::NotAuthenticated,
            s => ApiError::HttpError {
                status: s,
                message: Self::truncate_body(body),
            },
        }
    }
}

/// Classification of a 400 response from the token endpoint while polling
/// the device authorization grant. Never escapes the poll loop except as
/// `Fatal`, which surfaces as an `ApiError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFlowError {
    /// `authorization_pending` - the user has not approved yet, keep polling
    /// at the same interval.
    Pending,

    /// `slow_down` - keep polling, but wait longer between attempts.
    SlowDown,

    /// The proof was rejected for being outside the server's acceptance
    /// window. Carries the corrected clock offset (server unix seconds minus
    /// device unix seconds); retry immediately with it applied.
    ClockSkewRetry(i64),

    /// Terminal failure (`expired_token`, `access_denied`, unparsable body,
    /// or anything else unrecognized).
    Fatal(String),
}
