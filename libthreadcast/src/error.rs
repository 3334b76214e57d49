//! Error types for Threadcast

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::{Target, TargetResult};

pub type Result<T> = std::result::Result<T, ThreadcastError>;

#[derive(Error, Debug)]
pub enum ThreadcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ThreadcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ThreadcastError::InvalidInput(_) => 3,
            ThreadcastError::Platform(PlatformError::Authentication(_)) => 2,
            ThreadcastError::Platform(_) => 1,
            ThreadcastError::Config(_) => 1,
            ThreadcastError::Database(_) => 1,
        }
    }

    /// The platform error behind this error, if any
    pub fn as_platform(&self) -> Option<&PlatformError> {
        match self {
            ThreadcastError::Platform(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stored document is not valid JSON: {0}")]
    Document(#[from] serde_json::Error),
}

/// Errors raised while talking to a platform
///
/// Every variant carries enough context to be surfaced per target without
/// aborting sibling targets.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("{0} not configured")]
    NotConfigured(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request failed with HTTP {status}: {message}")]
    Request {
        status: u16,
        message: String,
        body: Option<String>,
    },

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// The connection was never established, so nothing reached the platform
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The request may have reached the platform (timeouts, resets, bad bodies)
    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl PlatformError {
    /// HTTP-style status associated with this error class
    pub fn status_hint(&self) -> u16 {
        match self {
            PlatformError::Validation(_) => 400,
            PlatformError::NotConfigured(_) => 503,
            PlatformError::Authentication(_) => 401,
            PlatformError::Request { status, .. } => *status,
            PlatformError::RateLimit(_) => 429,
            PlatformError::Connect(_)
            | PlatformError::Network(_)
            | PlatformError::MalformedResponse(_) => 500,
        }
    }

    /// Errors that are safe to retry
    ///
    /// Only failures where the platform provably did not create anything:
    /// a refused connection or a rate limit. A `Network` error may hide a
    /// post that was created, so retrying it could publish twice.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Connect(_) | PlatformError::RateLimit(_))
    }

    /// Build the error for a non-success HTTP response
    ///
    /// 401/403 become authentication failures and 429 becomes a rate limit,
    /// everything else keeps its status and the raw body for diagnostics.
    pub fn from_status(context: &str, status: u16, body: &str) -> Self {
        let body = body.trim();
        match status {
            401 | 403 => PlatformError::Authentication(format!(
                "{} rejected credentials (HTTP {}): {}",
                context, status, body
            )),
            429 => PlatformError::RateLimit(format!(
                "{} rate limit exceeded: {}. Wait before trying again.",
                context, body
            )),
            _ => PlatformError::Request {
                status,
                message: format!("{} returned HTTP {}", context, status),
                body: if body.is_empty() {
                    None
                } else {
                    Some(body.to_string())
                },
            },
        }
    }
}

/// Error reported for a single target, or for a whole rejected request
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl ApiError {
    /// A request-level validation failure (HTTP 400)
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            target: None,
            message: message.into(),
            raw_body: None,
        }
    }

    /// Attribute the error to one target
    pub fn for_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// The target was requested but nothing is configured for it (HTTP 503)
    pub fn not_configured(target: Target) -> Self {
        Self {
            status: 503,
            target: Some(target),
            message: format!("{} not configured", target),
            raw_body: None,
        }
    }

    /// Convert a library error raised while publishing to `target`
    ///
    /// Transport failures are logged in full and surfaced with a sanitized
    /// message.
    pub fn from_error(target: Target, error: &ThreadcastError) -> Self {
        match error {
            ThreadcastError::Platform(platform_error) => Self::from_platform(target, platform_error),
            other => {
                tracing::warn!(target_name = %target, error = %other, "internal error while publishing");
                Self {
                    status: 500,
                    target: Some(target),
                    message: format!("{}: internal error", target),
                    raw_body: None,
                }
            }
        }
    }

    /// Convert a platform error raised while publishing to `target`
    pub fn from_platform(target: Target, error: &PlatformError) -> Self {
        let status = error.status_hint();
        match error {
            PlatformError::Connect(detail)
            | PlatformError::Network(detail)
            | PlatformError::MalformedResponse(detail) => {
                tracing::warn!(target_name = %target, detail = %detail, "transport failure");
                Self {
                    status,
                    target: Some(target),
                    message: format!("{}: error communicating with platform", target),
                    raw_body: None,
                }
            }
            PlatformError::Request { body, .. } => Self {
                status,
                target: Some(target),
                message: format!("{}: {}", target, error),
                raw_body: body.clone(),
            },
            _ => Self {
                status,
                target: Some(target),
                message: format!("{}: {}", target, error),
                raw_body: None,
            },
        }
    }

    /// A task that panicked or was cancelled before reporting an outcome
    pub fn task_aborted(target: Target, reason: &str) -> Self {
        Self {
            status: 500,
            target: Some(target),
            message: format!("{}: publishing task aborted ({})", target, reason),
            raw_body: None,
        }
    }
}

/// Failure side of a composite broadcast
///
/// Carries every target's outcome, successes included, so partial success
/// stays visible to the caller.
#[derive(Error, Debug, Clone, Serialize)]
#[error("broadcast failed for {failed} of {total} target(s) (HTTP {status})")]
pub struct CompositeError {
    pub status: u16,
    pub failed: usize,
    pub total: usize,
    pub outcomes: BTreeMap<Target, TargetResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = ThreadcastError::InvalidInput("Empty content".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = ThreadcastError::Platform(PlatformError::Authentication("bad".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_errors() {
        let network = ThreadcastError::Platform(PlatformError::Network("timeout".to_string()));
        assert_eq!(network.exit_code(), 1);

        let config = ThreadcastError::Config(ConfigError::MissingField("feed.base_url".to_string()));
        assert_eq!(config.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting() {
        let error = ThreadcastError::Platform(PlatformError::Validation("too long".to_string()));
        assert_eq!(
            error.to_string(),
            "Platform error: Content validation failed: too long"
        );

        let error = ThreadcastError::Config(ConfigError::MissingField("bluesky.handle".to_string()));
        assert_eq!(
            error.to_string(),
            "Configuration error: Missing required field: bluesky.handle"
        );
    }

    #[test]
    fn test_status_hints_follow_taxonomy() {
        assert_eq!(PlatformError::Validation("x".into()).status_hint(), 400);
        assert_eq!(PlatformError::NotConfigured("x".into()).status_hint(), 503);
        assert_eq!(PlatformError::Network("x".into()).status_hint(), 500);
        assert_eq!(PlatformError::Connect("x".into()).status_hint(), 500);
        assert_eq!(PlatformError::MalformedResponse("x".into()).status_hint(), 500);
        assert_eq!(PlatformError::RateLimit("x".into()).status_hint(), 429);
        let request = PlatformError::Request {
            status: 422,
            message: "unprocessable".into(),
            body: None,
        };
        assert_eq!(request.status_hint(), 422);
    }

    #[test]
    fn test_transient_classification() {
        assert!(PlatformError::Connect("x".into()).is_transient());
        assert!(PlatformError::RateLimit("x".into()).is_transient());
        // a timeout may still have created the post
        assert!(!PlatformError::Network("timed out".into()).is_transient());
        assert!(!PlatformError::MalformedResponse("x".into()).is_transient());
        assert!(!PlatformError::Authentication("x".into()).is_transient());
        assert!(!PlatformError::Validation("x".into()).is_transient());
    }

    #[test]
    fn test_from_status_mapping() {
        match PlatformError::from_status("Mastodon", 401, "invalid token") {
            PlatformError::Authentication(msg) => assert!(msg.contains("Mastodon")),
            other => panic!("Expected Authentication, got {:?}", other),
        }

        match PlatformError::from_status("Mastodon", 429, "") {
            PlatformError::RateLimit(_) => {}
            other => panic!("Expected RateLimit, got {:?}", other),
        }

        match PlatformError::from_status("Bluesky", 400, "{\"error\":\"InvalidRequest\"}") {
            PlatformError::Request { status, body, .. } => {
                assert_eq!(status, 400);
                assert_eq!(body.as_deref(), Some("{\"error\":\"InvalidRequest\"}"));
            }
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_api_error_keeps_raw_body_for_request_errors() {
        let error = PlatformError::Request {
            status: 422,
            message: "Mastodon returned HTTP 422".into(),
            body: Some("{\"error\":\"Validation failed\"}".into()),
        };
        let api = ApiError::from_platform(Target::Mastodon, &error);
        assert_eq!(api.status, 422);
        assert_eq!(api.target, Some(Target::Mastodon));
        assert_eq!(api.raw_body.as_deref(), Some("{\"error\":\"Validation failed\"}"));
    }

    #[test]
    fn test_api_error_sanitizes_transport_detail() {
        let error = PlatformError::Network("dns error: no record for pds.internal.example".into());
        let api = ApiError::from_platform(Target::Bluesky, &error);
        assert_eq!(api.status, 500);
        assert!(!api.message.contains("pds.internal.example"));
        assert!(api.message.starts_with("bluesky"));
    }

    #[test]
    fn test_not_configured_error() {
        let api = ApiError::not_configured(Target::LinkedIn);
        assert_eq!(api.status, 503);
        assert_eq!(api.message, "linkedin not configured");
    }

    #[test]
    fn test_platform_error_clone() {
        let original = PlatformError::Network("Connection failed".to_string());
        let cloned = original.clone();
        assert_eq!(original.to_string(), cloned.to_string());
    }
}
