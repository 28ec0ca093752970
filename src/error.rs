//! Error types for the engine.
//!
//! Per-iteration failures ([`IterationError`]) are recorded as samples and never
//! stop a virtual user or the run. Only [`RunError`] values are fatal: a failed
//! setup hook or an unusable HTTP client means no iteration could produce a
//! meaningful result. A breached threshold is not an error at all; it is a
//! reported outcome on the final summary.

use std::time::Duration;

use thiserror::Error;

/// A user-supplied hook (setup/teardown) can fail with any error type.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a single HTTP call, as classified by the request executor.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request did not complete within its timeout.
    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Connection or protocol failure below the HTTP status level.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Failure of one iteration of the scenario action.
///
/// These are recorded against the `iterations` series and the virtual user
/// moves on to its next iteration.
#[derive(Debug, Error)]
pub enum IterationError {
    #[error(transparent)]
    Request(#[from] RequestError),

    /// A named check did not hold and the author chose to fail the iteration.
    #[error("check failed: {0}")]
    CheckFailed(String),

    /// Anything else the iteration function wants to surface.
    #[error("{0}")]
    Other(String),
}

/// Fatal, run-level failures.
#[derive(Debug, Error)]
pub enum RunError {
    /// The one-time setup hook failed; the run aborts before any virtual user
    /// starts.
    #[error("setup failed: {0}")]
    Setup(#[source] HookError),

    /// The shared HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    /// Invalid run configuration (e.g. a malformed default header).
    #[error("invalid run configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Failures inside an executor's own machinery.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A background task (governor or controller) could not be joined.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A threshold expression that could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThresholdParseError {
    #[error("empty threshold expression")]
    Empty,

    #[error("unknown aggregation in threshold expression: {0:?}")]
    UnknownAggregation(String),

    #[error("missing comparison operator in threshold expression: {0:?}")]
    MissingOperator(String),

    #[error("invalid bound in threshold expression: {0:?}")]
    InvalidBound(String),

    #[error("invalid metric selector: {0:?}")]
    InvalidSelector(String),
}

/// Failure while rendering or writing a report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
}
