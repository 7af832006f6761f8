//! Coordinator-level error type and the tool-facing coded error (spec §7).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::{ClassifiableError, ErrorCategory};

/// Errors raised by the coordinator itself, as opposed to errors produced by
/// the closures it drives (those travel as `anyhow::Error`, matching
/// `kftray-portforward::error::Error`'s `Other(#[from] anyhow::Error)`
/// catch-all idiom).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("circuit open for operation `{op_tag}`")]
    CircuitOpen { op_tag: String },

    #[error("cancelled")]
    Cancelled,

    #[error("unknown op_tag `{0}` (no policy registered and no default)")]
    UnknownOpTag(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClassifiableError for CoordinatorError {
    fn structured_category(&self) -> Option<ErrorCategory> {
        match self {
            CoordinatorError::CircuitOpen { .. } => Some(ErrorCategory::Temporary),
            CoordinatorError::Cancelled => Some(ErrorCategory::Internal),
            CoordinatorError::UnknownOpTag(_) => Some(ErrorCategory::Internal),
            CoordinatorError::Other(_) => None,
        }
    }

    fn structured_retryable(&self) -> Option<bool> {
        match self {
            CoordinatorError::CircuitOpen { .. } => Some(false),
            CoordinatorError::Cancelled => Some(false),
            _ => None,
        }
    }

    fn message(&self) -> String {
        self.to_string()
    }
}

/// The code/category/message/suggestion quadruple carried by every
/// tool-facing failure (spec §7). Built from a [`crate::classifier::Classification`]
/// plus whatever operation name wrapped the underlying error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub suggestion: Vec<String>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, category: ErrorCategory, message: impl Into<String>) -> Self {
        ToolError {
            code: code.into(),
            category,
            message: message.into(),
            suggestion: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion.push(suggestion.into());
        self
    }

    /// Wrap an error surfaced from `operation` the way spec §7 requires:
    /// `"{operation}: {cause}"`, classified once at construction time.
    pub fn wrap(operation: &str, error: &anyhow::Error, category: ErrorCategory) -> Self {
        ToolError::new("operation_failed", category, format!("{operation}: {error}"))
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ToolError {}
