//! Structured error types and the normalized error records surfaced to consumers.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Error taxonomy for programmatic handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Matching configuration absent or inaccessible; blocks the operation.
    #[serde(rename = "CONFIGURATION_ERROR")]
    Configuration,
    /// Missing or invalid submission fields; rejected before any remote call.
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    /// Insufficient permission on an object or field.
    #[serde(rename = "ACCESS_ERROR")]
    Access,
    /// Failure reported by the external record or batch store.
    #[serde(rename = "REMOTE_EXECUTION_ERROR")]
    RemoteExecution,
    /// Job completed with per-record errors. Non-fatal.
    #[serde(rename = "PARTIAL_RESULT_ERROR")]
    PartialResult,
    /// Engine bug or storage failure.
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Configuration => "ConfigurationError",
            ErrorCode::Validation => "ValidationError",
            ErrorCode::Access => "AccessError",
            ErrorCode::RemoteExecution => "RemoteExecutionError",
            ErrorCode::PartialResult => "PartialResultError",
            ErrorCode::Internal => "InternalError",
        }
    }

    /// Whether the error leaves the affected operation usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorCode::PartialResult)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured engine error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    /// Field names the error refers to (missing required fields, denied fields).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fields: Vec::new(),
            details: None,
        }
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Configuration, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn missing_fields(fields: &[String]) -> Self {
        Self::new(
            ErrorCode::Validation,
            format!("Missing required field values: {}", fields.join(", ")),
        )
        .with_fields(fields.iter().cloned())
    }

    pub fn access(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Access, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RemoteExecution, message)
    }

    pub fn partial(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PartialResult, message)
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Internal, err.to_string())
    }

    pub fn is_validation(&self) -> bool {
        self.code == ErrorCode::Validation
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine_err) => engine_err,
            Err(err) => EngineError::internal(err),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Normalized, display-safe form of an error, kept in the store's bounded error list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub id: String,
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

impl ErrorRecord {
    /// Normalize an error, redacting sensitive substrings from message and details.
    pub fn from_error(err: &EngineError, timestamp: i64) -> Self {
        let mut details = err.details.as_deref().map(redact);
        if !err.fields.is_empty() && details.is_none() {
            details = Some(format!("fields: {}", err.fields.join(", ")));
        }
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code: err.code,
            message: redact(&err.message),
            details,
            timestamp,
        }
    }
}

static BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*").expect("bearer pattern")
});

static SECRET_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(password|passwd|pwd|access_token|refresh_token|token|api_key|apikey|secret|key)\s*[=:]\s*("[^"]*"|'[^']*'|[^\s,;&]+)"#,
    )
    .expect("secret pattern")
});

static OPAQUE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z0-9]{24,}\b").expect("opaque id pattern"));

/// Redact bearer tokens, secret key/value pairs and long opaque identifiers.
pub fn redact(text: &str) -> String {
    let text = BEARER.replace_all(text, "Bearer [REDACTED]");
    let text = SECRET_PAIR.replace_all(&text, "${1}=[REDACTED]");
    let text = OPAQUE_ID.replace_all(&text, "[ID]");
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_names_every_field() {
        let err = EngineError::missing_fields(&["Name".to_string(), "Phone".to_string()]);
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.fields, vec!["Name", "Phone"]);
        assert!(err.message.contains("Name, Phone"));
    }

    #[test]
    fn test_redacts_bearer_tokens() {
        let out = redact("request failed: Authorization: Bearer abc.def-123");
        assert!(out.contains("Bearer [REDACTED]"));
        assert!(!out.contains("abc.def-123"));
    }

    #[test]
    fn test_redacts_secret_pairs() {
        let out = redact("login failed password=hunter2, token: 'xyz'");
        assert!(out.contains("password=[REDACTED]"));
        assert!(out.contains("token=[REDACTED]"));
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("xyz"));
    }

    #[test]
    fn test_redacts_long_opaque_ids() {
        let out = redact("session 00D5g000004ZxYzEAKabcdef12 expired");
        assert_eq!(out, "session [ID] expired");
        // Short record ids survive.
        assert_eq!(redact("record 001A expired"), "record 001A expired");
    }

    #[test]
    fn test_error_record_redacts_and_keeps_code() {
        let err = EngineError::remote("merge failed: api_key=supersecret")
            .with_details("Bearer abcdef");
        let record = ErrorRecord::from_error(&err, 42);
        assert_eq!(record.code, ErrorCode::RemoteExecution);
        assert_eq!(record.timestamp, 42);
        assert!(!record.message.contains("supersecret"));
        assert_eq!(record.details.as_deref(), Some("Bearer [REDACTED]"));
        assert!(!record.id.is_empty());
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_engine_error() {
        let err: anyhow::Error = EngineError::access("denied").into();
        let back = EngineError::from(err);
        assert_eq!(back.code, ErrorCode::Access);

        let other = EngineError::from(anyhow::anyhow!("disk full"));
        assert_eq!(other.code, ErrorCode::Internal);
    }

    #[test]
    fn test_partial_result_is_not_fatal() {
        assert!(!ErrorCode::PartialResult.is_fatal());
        assert!(ErrorCode::RemoteExecution.is_fatal());
    }
}
