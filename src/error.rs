//! Error types for each layer of the gate.
//!
//! [`GateError`] is fatal and aborts an invocation before a decision is made.
//! [`AnalysisError`] and [`CacheError`] are recoverable. Analysis failures are
//! collected into the [`GateReport`](crate::gate::GateReport) and mark it
//! degraded; cache errors become cache warnings and force a full analysis.

use std::path::PathBuf;

/// Fatal errors. Surfaced directly to the caller.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("not a version-controlled tree: {}", .0.display())]
    NotAVersionedTree(PathBuf),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for GateError {
    fn from(e: toml::de::Error) -> Self {
        GateError::ConfigInvalid(e.to_string())
    }
}

impl From<globset::Error> for GateError {
    fn from(e: globset::Error) -> Self {
        GateError::ConfigInvalid(e.to_string())
    }
}

/// Per-task analysis failure. The invocation continues without the result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("timeout")]
    Timeout,

    #[error("crashed: {0}")]
    Crashed(String),

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("not configured")]
    NotConfigured,

    #[error("failed to start: {0}")]
    Spawn(String),
}

/// The durable cache could not be read or written.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("unsupported cache version {0}")]
    Version(u32),
}

pub type Result<T, E = GateError> = std::result::Result<T, E>;
