//! Error taxonomy for page generation.
//!
//! Failures fall into two policies:
//! - `GenerationError` is fatal to the page being generated and is returned to the caller.
//! - `Degradable` marks best-effort stages (extraction, summarization) whose failure
//!   only costs coherence; their reason is logged and never reaches the error channel.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the generative backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("backend returned status {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend misconfigured: {0}")]
    Config(String),
}

impl LlmError {
    /// Whether a second attempt might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Backend { .. } | LlmError::Timeout(_) | LlmError::Transport(_)
        )
    }
}

/// Machine-distinguishable category of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller asked for something the book's state forbids. No backend call was made.
    ContractViolation,
    /// The generative backend failed or timed out on a critical call.
    Backend,
    /// Reading or writing a record failed.
    Storage,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("page {requested} requested but the next page is {expected}")]
    OutOfOrder { expected: u32, requested: u32 },

    #[error("book is already complete with {target} pages")]
    AlreadyComplete { target: u32 },

    #[error("invalid outline: {0}")]
    InvalidOutline(String),

    #[error("invalid book state: {0}")]
    InvalidState(String),

    #[error("backend returned an empty page {index}")]
    EmptyPage { index: u32 },

    #[error(transparent)]
    Backend(#[from] LlmError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::OutOfOrder { .. }
            | GenerationError::AlreadyComplete { .. }
            | GenerationError::InvalidState(_) => ErrorKind::ContractViolation,
            GenerationError::InvalidOutline(_)
            | GenerationError::EmptyPage { .. }
            | GenerationError::Backend(_) => ErrorKind::Backend,
            GenerationError::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// Outcome of a best-effort stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Degradable<T> {
    Fresh(T),
    Degraded { fallback: T, reason: String },
}

impl<T> Degradable<T> {
    pub fn degraded(fallback: T, reason: impl Into<String>) -> Self {
        Degradable::Degraded {
            fallback,
            reason: reason.into(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Degradable::Degraded { .. })
    }

    pub fn into_inner(self) -> T {
        match self {
            Degradable::Fresh(value) => value,
            Degradable::Degraded { fallback, .. } => fallback,
        }
    }
}
