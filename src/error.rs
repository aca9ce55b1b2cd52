//! Error handling for the engine
//!
//! Engine-level failures (graph construction, branch selection, forking,
//! polling timeouts) use `EngineError`. Task bodies return `anyhow::Result`,
//! so an `EngineError` raised inside a task stays downcastable from the
//! `anyhow::Error` the scheduler records.

use crate::task::{TaskId, TaskKind};
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// IO errors (pipes, config and plan files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task graph construction errors
    #[error("Graph error: {0}")]
    Graph(String),

    /// A task selected a successor path its node does not have
    #[error("Task '{task}' selected path {index} but only {available} path list(s) exist")]
    PathOutOfRange {
        task: TaskId,
        index: usize,
        available: usize,
    },

    /// No executor is registered for a task kind
    #[error("No executor registered for task kind '{0}'")]
    UnknownKind(TaskKind),

    /// A polled resource never reached the desired status
    #[error("Timed out waiting for status '{expected}' (last observed '{observed}')")]
    Timeout { observed: String, expected: String },

    /// Branch forking errors
    #[error("Fork error: {0}")]
    Fork(String),

    /// Errno from process management calls
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Scheduler or registry state errors
    #[error("State error: {0}")]
    State(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a graph error
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph(msg.into())
    }

    /// Create a fork error
    pub fn fork(msg: impl Into<String>) -> Self {
        Self::Fork(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a timeout error from the last observed and the expected status
    pub fn timeout(observed: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::Timeout {
            observed: observed.into(),
            expected: expected.into(),
        }
    }

    /// True for errors caused by a malformed graph or an invalid branch choice
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Graph(_) | Self::PathOutOfRange { .. } | Self::UnknownKind(_)
        )
    }
}
