//! Typed error taxonomy for the engine (spec §7).
//!
//! The teacher's HTTP edge stayed on bare `anyhow::Result`; this crate's
//! `api.rs` instead converts `GraphRagError` directly to a `StatusCode` at
//! each handler boundary, so callers elsewhere can distinguish retryable
//! failures from fatal ones instead of matching on error strings.

use std::fmt;
use thiserror::Error;

/// Coarse error classification. Mirrors the taxonomy in spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid config value or unrecognized enum; caller should fall back to a default.
    Config,
    /// Deadlock, 5xx, timeout — safe to retry with backoff.
    Transient,
    /// Schema/constraint violation, auth failure — never retry.
    Fatal,
    /// LLM provider error (retryable or not, see `retryable`).
    Llm,
    /// Malformed NDJSON or similar line-oriented parse failure.
    Parse,
    /// `has_vector` / dual-key inconsistency that should never happen.
    Consistency,
    /// Backup/restore checksum mismatch.
    Integrity,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Llm => "llm",
            ErrorKind::Parse => "parse",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Integrity => "integrity",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The engine's error type.
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct GraphRagError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
    /// Whether a caller should retry this operation (only meaningful for
    /// `Transient` and `Llm`; always `false` otherwise).
    pub retryable: bool,
}

impl GraphRagError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(kind, ErrorKind::Transient);
        Self {
            kind,
            message: message.into(),
            source: None,
            retryable,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn llm(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::Llm, message).retryable(retryable)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Consistency, format!("UNEXPECTED: {}", message.into()))
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }
}

impl From<serde_json::Error> for GraphRagError {
    fn from(err: serde_json::Error) -> Self {
        GraphRagError::parse(format!("JSON error: {err}")).with_source(err)
    }
}

impl From<std::io::Error> for GraphRagError {
    fn from(err: std::io::Error) -> Self {
        GraphRagError::fatal(format!("I/O error: {err}")).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, GraphRagError>;
