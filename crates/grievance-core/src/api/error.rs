use std::borrow::Cow;
use std::fmt;

use reqwest::StatusCode;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Machine-readable error code carried by every [`ApiError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// No response reached the client (offline, DNS, refused, timeout).
    Network,
    /// The token refresh itself failed; the session is gone.
    TokenExpired,
    /// Error status without a server-supplied code.
    Http(u16),
    /// Code supplied by the server in the error body.
    Server(String),
    /// The request could not be built (bad header value, unreadable body).
    InvalidRequest,
    /// A success response whose body did not match the expected type.
    InvalidResponse,
}

impl ErrorCode {
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            ErrorCode::Network => Cow::Borrowed("NETWORK_ERROR"),
            ErrorCode::TokenExpired => Cow::Borrowed("TOKEN_EXPIRED"),
            ErrorCode::Http(status) => Cow::Owned(format!("HTTP_{}", status)),
            ErrorCode::Server(code) => Cow::Borrowed(code),
            ErrorCode::InvalidRequest => Cow::Borrowed("INVALID_REQUEST"),
            ErrorCode::InvalidResponse => Cow::Borrowed("INVALID_RESPONSE"),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

/// Normalized failure returned by every [`SessionClient`](super::SessionClient) call.
///
/// Serializes to `{success: false, code, message, status?, errors?}` so front
/// ends can render it without knowing where it came from.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} ({code})")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub status: Option<u16>,
    pub errors: Option<Value>,
}

impl Serialize for ApiError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = 3 + usize::from(self.status.is_some()) + usize::from(self.errors.is_some());
        let mut state = serializer.serialize_struct("ApiError", len)?;
        state.serialize_field("success", &false)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if let Some(status) = self.status {
            state.serialize_field("status", &status)?;
        }
        if let Some(ref errors) = self.errors {
            state.serialize_field("errors", errors)?;
        }
        state.end()
    }
}

impl ApiError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Network,
            message: message.into(),
            status: None,
            errors: None,
        }
    }

    pub fn token_expired(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::TokenExpired,
            message: message.into(),
            status: Some(StatusCode::UNAUTHORIZED.as_u16()),
            errors: None,
        }
    }

    pub fn invalid_request(err: impl fmt::Display) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: err.to_string(),
            status: None,
            errors: None,
        }
    }

    pub fn invalid_response(status: StatusCode, err: impl fmt::Display) -> Self {
        Self {
            code: ErrorCode::InvalidResponse,
            message: format!("Unexpected response from server: {}", err),
            status: Some(status.as_u16()),
            errors: None,
        }
    }

    /// Map a transport failure (no response at all) to `NETWORK_ERROR`.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("Request timed out. Please try again.")
        } else if err.is_connect() {
            Self::network("Unable to reach the server. Please check your connection.")
        } else {
            Self::network(format!("Network error: {}", err))
        }
    }

    /// Normalize an error response, preferring the server's own code and message.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        let details = parsed.as_ref().map(ServerError::extract).unwrap_or_default();

        let code = details
            .code
            .map(ErrorCode::Server)
            .unwrap_or(ErrorCode::Http(status.as_u16()));

        let message = details.message.unwrap_or_else(|| {
            let trimmed = body.trim();
            if parsed.is_none() && !trimmed.is_empty() {
                Self::truncate_body(trimmed)
            } else {
                format!(
                    "Request failed with status {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )
            }
        });

        Self {
            code,
            message,
            status: Some(status.as_u16()),
            errors: details.errors,
        }
    }

    pub fn is_network(&self) -> bool {
        self.code == ErrorCode::Network
    }

    pub fn is_token_expired(&self) -> bool {
        self.code == ErrorCode::TokenExpired
    }

    /// JSON rendering of the normalized shape.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }
}

/// Code, message and field errors pulled out of a server error body.
#[derive(Debug, Default)]
struct ServerError {
    code: Option<String>,
    message: Option<String>,
    errors: Option<Value>,
}

impl ServerError {
    /// Accepts `{code, message, errors}`, `{error: {code, message}}` and
    /// `{error: "text"}`.
    fn extract(body: &Value) -> Self {
        let nested = body.get("error");

        let code = body
            .get("code")
            .or_else(|| nested.and_then(|e| e.get("code")))
            .and_then(non_empty_str);

        let message = body
            .get("message")
            .or_else(|| nested.and_then(|e| e.get("message")))
            .or(nested)
            .and_then(non_empty_str);

        let errors = body.get("errors").filter(|e| !e.is_null()).cloned();

        Self { code, message, errors }
    }
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
