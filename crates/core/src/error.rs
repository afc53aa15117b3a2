//! Error types for quire operations.
//!
//! This module defines the main error type [`QuireError`] which represents
//! every failure the engine can surface: configuration problems in a source,
//! network failures, sandboxed script failures, and unusable response bodies.
//!
//! Variants are grouped into four kinds (see [`ErrorKind`]) so boundary
//! handlers can decide what is fatal and what is recoverable without matching
//! on every variant.
//!
//! # Example
//!
//! ```rust
//! use quire_core::{ErrorKind, QuireError};
//!
//! let err = QuireError::NoHost { url: "/list?page=1".to_string() };
//! assert_eq!(err.kind(), ErrorKind::Configuration);
//! assert!(err.to_string().contains("/list?page=1"));
//! ```

use thiserror::Error;

/// Coarse classification of a [`QuireError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing rules, unresolved relative host, unknown or disabled source. Fatal.
    Configuration,
    /// Non-success response, timeout or transport failure. Fatal per attempt.
    Network,
    /// Sandbox throw or timeout. Recoverable at field granularity.
    Script,
    /// Body is neither valid JSON nor usable markup.
    Parse,
}

/// Main error type for rule evaluation and content acquisition.
#[derive(Error, Debug)]
pub enum QuireError {
    /// No source definition exists for the requested id.
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// The source exists but is switched off.
    #[error("Source is disabled: {0}")]
    DisabledSource(String),

    /// A rule required for the requested endpoint is not configured.
    ///
    /// `kind` names the rule set (`bookInfo`, `toc`, `content`) and `field`
    /// the rule inside it.
    #[error("Missing rule {kind}.{field}")]
    MissingRule { kind: &'static str, field: &'static str },

    /// A relative URL was requested but the source exposes no host list.
    #[error("No host available to resolve relative URL: {url}")]
    NoHost { url: String },

    /// A source definition or engine setting is malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid URL provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// HTTP transport errors from reqwest.
    #[cfg(feature = "fetch")]
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// Request timeout.
    #[error("Request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// A sandboxed script threw or ran past its deadline.
    #[error("Script error: {message}")]
    ScriptError { message: String },

    /// A response body could not be interpreted.
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// File system errors while loading source definitions.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuireError {
    /// Builds a [`QuireError::ScriptError`] from any displayable message.
    pub fn script(message: impl Into<String>) -> Self {
        QuireError::ScriptError { message: message.into() }
    }

    /// Classifies this error into the engine's four error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuireError::UnknownSource(_)
            | QuireError::DisabledSource(_)
            | QuireError::MissingRule { .. }
            | QuireError::NoHost { .. }
            | QuireError::ConfigError(_)
            | QuireError::InvalidUrl(_)
            | QuireError::Io(_) => ErrorKind::Configuration,
            #[cfg(feature = "fetch")]
            QuireError::HttpError(_) => ErrorKind::Network,
            QuireError::Status { .. } | QuireError::Timeout { .. } => ErrorKind::Network,
            QuireError::ScriptError { .. } => ErrorKind::Script,
            QuireError::ParseError(_) => ErrorKind::Parse,
        }
    }

    /// Whether the pipeline may substitute a fallback and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Script | ErrorKind::Parse)
    }
}

/// Result type alias for QuireError.
pub type Result<T> = std::result::Result<T, QuireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QuireError::InvalidUrl("not a url".to_string());
        assert!(err.to_string().contains("Invalid URL"));
    }

    #[test]
    fn test_missing_rule_names_field() {
        let err = QuireError::MissingRule { kind: "toc", field: "chapterList" };
        assert_eq!(err.to_string(), "Missing rule toc.chapterList");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_timeout_error() {
        let err = QuireError::Timeout { timeout_ms: 3000 };
        assert!(err.to_string().contains("3000"));
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_script_error_is_recoverable() {
        let err = QuireError::script("ReferenceError: foo is not defined");
        assert_eq!(err.kind(), ErrorKind::Script);
        assert!(err.is_recoverable());
    }
}
