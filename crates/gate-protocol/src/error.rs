//! Typed error values shared across the gateway.
//!
//! The code set is closed and the strings are wire-stable.  Handlers raise
//! `GatewayError` directly; anything that is not already typed is rewritten
//! to `INTERNAL_ERROR` before it reaches the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Frozen wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    UnknownOperation,
    ValidationError,
    NotFound,
    AlreadyExists,
    Conflict,
    Unauthorized,
    Forbidden,
    RateLimited,
    Backpressure,
    InternalError,
    BucketNotDefined,
    QueryNotDefined,
    RulesNotAvailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::UnknownOperation => "UNKNOWN_OPERATION",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Backpressure => "BACKPRESSURE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::BucketNotDefined => "BUCKET_NOT_DEFINED",
            ErrorCode::QueryNotDefined => "QUERY_NOT_DEFINED",
            ErrorCode::RulesNotAvailable => "RULES_NOT_AVAILABLE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed gateway error: code, human-readable message, optional details.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        GatewayError {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::new(ErrorCode::ValidationError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        GatewayError::new(ErrorCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        GatewayError::new(ErrorCode::AlreadyExists, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        GatewayError::new(ErrorCode::Conflict, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        GatewayError::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        GatewayError::new(ErrorCode::Forbidden, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_ms: u64) -> Self {
        GatewayError::new(ErrorCode::RateLimited, message)
            .with_details(json!({ "retryAfterMs": retry_after_ms }))
    }

    pub fn bucket_not_defined(bucket: &str) -> Self {
        GatewayError::new(
            ErrorCode::BucketNotDefined,
            format!("bucket `{bucket}` is not defined"),
        )
    }

    pub fn query_not_defined(query: &str) -> Self {
        GatewayError::new(
            ErrorCode::QueryNotDefined,
            format!("query `{query}` is not defined"),
        )
    }

    pub fn rules_not_available() -> Self {
        GatewayError::new(
            ErrorCode::RulesNotAvailable,
            "the rules engine is not available",
        )
    }

    /// Rewrite for non-typed failures.  The original detail stays out of the
    /// message; callers decide whether `details` survives to the wire.
    pub fn internal(source: impl std::fmt::Display) -> Self {
        GatewayError::new(ErrorCode::InternalError, "internal error")
            .with_details(json!({ "source": source.to_string() }))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::internal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_to_frozen_strings() {
        let cases = [
            (ErrorCode::ParseError, "PARSE_ERROR"),
            (ErrorCode::InvalidRequest, "INVALID_REQUEST"),
            (ErrorCode::UnknownOperation, "UNKNOWN_OPERATION"),
            (ErrorCode::ValidationError, "VALIDATION_ERROR"),
            (ErrorCode::NotFound, "NOT_FOUND"),
            (ErrorCode::AlreadyExists, "ALREADY_EXISTS"),
            (ErrorCode::Conflict, "CONFLICT"),
            (ErrorCode::Unauthorized, "UNAUTHORIZED"),
            (ErrorCode::Forbidden, "FORBIDDEN"),
            (ErrorCode::RateLimited, "RATE_LIMITED"),
            (ErrorCode::Backpressure, "BACKPRESSURE"),
            (ErrorCode::InternalError, "INTERNAL_ERROR"),
            (ErrorCode::BucketNotDefined, "BUCKET_NOT_DEFINED"),
            (ErrorCode::QueryNotDefined, "QUERY_NOT_DEFINED"),
            (ErrorCode::RulesNotAvailable, "RULES_NOT_AVAILABLE"),
        ];
        for (code, wire) in cases {
            assert_eq!(code.as_str(), wire);
            assert_eq!(serde_json::to_value(code).unwrap(), wire);
        }
    }

    #[test]
    fn rate_limited_carries_retry_after_details() {
        let err = GatewayError::rate_limited("too many requests", 250);
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert_eq!(err.details.unwrap()["retryAfterMs"], 250);
    }

    #[test]
    fn internal_error_message_stays_generic() {
        let err = GatewayError::internal("secret backend detail");
        assert_eq!(err.message, "internal error");
        assert_eq!(err.details.unwrap()["source"], "secret backend detail");
    }
}
