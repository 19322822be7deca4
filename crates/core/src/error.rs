//! Error types for apidrive
//!
//! Three families matter to a script author:
//! - [`ExpectationError`]: an expectation did not hold. Reported as a normal
//!   script result, not as an infrastructure failure.
//! - [`ContextError`]: unknown actor or stash key. A script-authoring mistake.
//! - [`ArgumentError`]: a malformed declaration.
//!
//! Everything else (transport, IO, parse failures) is infrastructure.

use std::fmt;
use thiserror::Error;

/// Result type alias using the apidrive [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// apidrive error types
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Expectation(#[from] ExpectationError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when this error is an expectation failure rather than an
    /// infrastructure or authoring problem.
    pub fn is_expectation(&self) -> bool {
        matches!(self, Error::Expectation(_))
    }
}

/// Script-authoring mistakes found while resolving the context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Alias not found: {0}")]
    UnknownActor(String),

    #[error("Name '{0}' not found in stash")]
    UnknownStashKey(String),

    #[error("Failed to destash keypath '{keypath}': {segment} is undefined")]
    MissingKeypath { keypath: String, segment: String },

    #[error("Stash value '{key}' failed to resolve: {reason}")]
    Unresolved { key: String, reason: String },
}

/// Malformed declarations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid argument: {0}")]
pub struct ArgumentError(pub String);

/// Stable failure categories for [`ExpectationError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    StatusFailure,
    TextComparisonFailure,
    JsonExpressionFailure,
    PredicateFailure,
    SucceededUnexpectedly,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::StatusFailure => "Status Failure",
            FailureKind::TextComparisonFailure => "Text Comparison Failure",
            FailureKind::JsonExpressionFailure => "JSON Expression Failure",
            FailureKind::PredicateFailure => "Predicate Failure",
            FailureKind::SucceededUnexpectedly => "Predicate Succeeded Unexpectedly",
        };
        f.write_str(name)
    }
}

/// An expectation that did not hold.
///
/// `origin` is the declaration site of the expectation, captured when the
/// script was written, never the location of the retry loop.
#[derive(Error, Debug, Clone, serde::Serialize, serde::Deserialize)]
#[error("{kind}: {message}\n  declared at {origin}{}", diff_suffix(.diff))]
pub struct ExpectationError {
    pub kind: FailureKind,
    pub message: String,
    pub diff: Option<String>,
    pub origin: String,
}

fn diff_suffix(diff: &Option<String>) -> String {
    match diff {
        Some(d) => format!("\n(expression diffed against actual follows)\n{}", d),
        None => String::new(),
    }
}

impl ExpectationError {
    pub fn new(kind: FailureKind, message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diff: None,
            origin: origin.into(),
        }
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = Some(diff.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expectation_error_display_carries_origin() {
        let err = ExpectationError::new(
            FailureKind::StatusFailure,
            "Expected HTTP status code of 200 but got 404",
            "tests/login.rs:12:5",
        );
        let rendered = err.to_string();
        assert!(rendered.starts_with("Status Failure"));
        assert!(rendered.contains("tests/login.rs:12:5"));
        assert!(!rendered.contains("diffed"));
    }

    #[test]
    fn test_context_errors_are_distinct() {
        let unknown = ContextError::UnknownStashKey("user".into());
        let missing = ContextError::MissingKeypath {
            keypath: "user.address.zip".into(),
            segment: "address".into(),
        };
        assert_ne!(unknown, missing);
        assert_eq!(unknown.to_string(), "Name 'user' not found in stash");
        assert!(missing.to_string().contains("address is undefined"));
    }
}
