//! Error taxonomy shared by the action loop and the rule evaluator.
//!
//! Errors local to one action or one rule are contained by the caller and turned
//! into structured results. Only [`BrowserError::Fatal`] and an exhausted
//! [`ModelError`] end a run.

use thiserror::Error;

/// Failure reported by the browser control adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    /// Navigation timeout, stale element, detached frame. Surfaced to the model.
    #[error("transient browser error: {0}")]
    Transient(String),

    /// The browser or its connection is gone. Terminates the session.
    #[error("fatal browser error: {0}")]
    Fatal(String),

    /// The page rejected a selector as syntactically invalid.
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },
}

impl BrowserError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrowserError::Fatal(_))
    }
}

/// Failure reported by the vision-language model adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// Connection reset, timeout, 429 or 5xx. Retried with backoff.
    #[error("model transport error: {0}")]
    Transport(String),

    /// Bad credentials, malformed request, unparseable response. Never retried.
    #[error("model rejected request: {0}")]
    Rejected(String),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Transport(_))
    }
}

/// Element Capture failure. A miss is recorded on the step and never aborts it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CaptureError {
    #[error("no element at point ({x:.1}, {y:.1})")]
    NoElementAtPoint { x: f64, y: f64 },

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// A model call that could not be turned into an [`crate::types::Action`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionParseError {
    #[error("unsupported action: {0}")]
    Unsupported(String),

    #[error("action '{action}' is missing argument '{argument}'")]
    MissingArgument {
        action: String,
        argument: &'static str,
    },

    #[error("action '{action}' has invalid argument '{argument}'")]
    InvalidArgument {
        action: String,
        argument: &'static str,
    },
}

/// Per-rule resolution failure during co-browse evaluation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule not authored")]
    NotAuthored,

    #[error("invalid regex: {0}")]
    InvalidRegex(String),

    /// Needs another rule that did not resolve.
    #[error("depends on unresolved rule '{0}'")]
    Unresolved(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Rejected session configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid configuration: {reason}")]
pub struct ConfigError {
    pub reason: String,
}

impl ConfigError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
