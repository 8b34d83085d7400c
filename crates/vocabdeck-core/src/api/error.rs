use serde::Deserialize;
use thiserror::Error;

/// Default message when a 401 body carries none
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please login again.";

/// Default message when a 403 body carries none
pub const ACCESS_DENIED_MESSAGE: &str = "Access denied. Your session may have been invalidated.";

/// Default message for any other error status
pub const GENERIC_ERROR_MESSAGE: &str = "An error occurred";

pub const NETWORK_ERROR_MESSAGE: &str = "Network error. Please check your connection.";

pub const UNEXPECTED_ERROR_MESSAGE: &str = "An unexpected error occurred.";

/// Maximum length for error messages taken from response bodies
const MAX_ERROR_MESSAGE_LENGTH: usize = 500;

/// Every failed API call is classified into exactly one of these, once,
/// by the client. Callers match on the variant; they never re-classify.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// HTTP 401. The stored credential has already been purged and
    /// `SessionExpired` emitted by the time the caller sees this.
    #[error("{0}")]
    Authentication(String),

    /// HTTP 403. Same side effects as `Authentication`.
    #[error("{0}")]
    Permission(String),

    /// Any other error status. No side effects.
    #[error("{message}")]
    Request { status: u16, message: String },

    /// The request was sent but no response arrived (includes timeouts).
    #[error("{}", NETWORK_ERROR_MESSAGE)]
    Network,

    /// The request could not be built or sent, or a success body could not be decoded.
    #[error("{}", UNEXPECTED_ERROR_MESSAGE)]
    Unexpected,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl ApiError {
    /// True for the two kinds that end the session.
    pub fn is_session_ending(&self) -> bool {
        matches!(self, ApiError::Authentication(_) | ApiError::Permission(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Authentication(_) => Some(401),
            ApiError::Permission(_) => Some(403),
            ApiError::Request { status, .. } => Some(*status),
            ApiError::Network | ApiError::Unexpected => None,
        }
    }

    /// Classify an error status. `body` is the raw response text.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = non_empty(parsed.message);
        match status.as_u16() {
            401 => ApiError::Authentication(message.unwrap_or_else(|| SESSION_EXPIRED_MESSAGE.to_string())),
            403 => ApiError::Permission(message.unwrap_or_else(|| ACCESS_DENIED_MESSAGE.to_string())),
            code => ApiError::Request {
                status: code,
                message: message
                    .or_else(|| non_empty(parsed.error))
                    .unwrap_or_else(|| GENERIC_ERROR_MESSAGE.to_string()),
            },
        }
    }

    /// Classify a transport-level failure from reqwest.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_builder() {
            ApiError::Unexpected
        } else {
            ApiError::Network
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| truncate(s.trim()))
        .filter(|s| !s.is_empty())
}

/// Truncate a server-supplied message to avoid carrying excessive data
fn truncate(s: &str) -> String {
    if s.len() <= MAX_ERROR_MESSAGE_LENGTH {
        return s.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LENGTH;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
