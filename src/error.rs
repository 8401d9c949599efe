//! Error types for the hub transport
//!
//! Per-layer errors live next to their layer (`TransportError` in the
//! transport module, `EngineError` at the engine boundary, `ConfigError` in
//! config). This module holds the authentication error taxonomy, the
//! top-level error the public API surfaces, and log sanitization that keeps
//! SAS credentials out of error text.

use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::transport::amqp::TransportError;

/// Authentication errors from the claims-based-security exchange
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication rejected with status {status}: {description}")]
    Rejected { status: i32, description: String },

    #[error("Timed out waiting for authentication after {waited_ms} ms")]
    Timeout { waited_ms: u64 },

    #[error("SAS token expired")]
    TokenExpired,

    #[error("Token source error")]
    TokenSource(#[from] ConfigError),
}

impl AuthError {
    /// Build from a CBS response status code and description.
    pub fn from_status(status: i32, description: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            description: sanitize_error_message(&description.into()),
        }
    }

    /// Whether retrying authentication can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            // 401/403 need a new credential, not a retry
            AuthError::Rejected { status, .. } => *status != 401 && *status != 403,
            AuthError::Timeout { .. } => true,
            AuthError::TokenExpired => false,
            AuthError::TokenSource(_) => false,
        }
    }
}

/// Top-level error for hub transport operations
#[derive(Debug, Error)]
pub enum HublinkError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl HublinkError {
    /// Whether the reconnection loop may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            HublinkError::Transport(e) => e.is_retryable(),
            HublinkError::Auth(e) => e.is_retryable(),
            HublinkError::Config(_) => false,
            HublinkError::Engine(_) => true,
        }
    }
}

/// Sanitize error messages so credentials never reach logs or callbacks
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    // Scrub SAS signature and generic secret patterns
    sanitized = regex::Regex::new(r"(?i)(sig|signature|password|token|key|secret)[=:]\s*[^\s&]+")
        .unwrap()
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    // Scrub full SharedAccessSignature values wherever they appear
    sanitized = regex::Regex::new(r"SharedAccessSignature\s+\S+")
        .unwrap()
        .replace_all(&sanitized, "SharedAccessSignature ***")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        // Back off to a char boundary so multibyte text cannot split
        let mut max_content_len = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(max_content_len) {
            max_content_len -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..max_content_len], truncate_suffix);
    }

    sanitized
}

/// Result type for hub transport operations
pub type HublinkResult<T> = Result<T, HublinkError>;
