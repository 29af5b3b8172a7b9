//! Error types and exit codes for semfora-scheduler

use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;

use crate::schema::Diagnostic;

/// Main error type for scheduler, index and storage operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Compilation database error: {message}")]
    CompileDatabase { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Shard codec error: {0}")]
    Shard(#[from] bincode::Error),

    #[error("Task failed: {0}")]
    Task(#[from] TaskError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert error to an exit code for the CLI:
    /// - 0: Success
    /// - 1: File not found / IO error
    /// - 2: Configuration or compilation database problem
    /// - 3: Build failure
    /// - 4: Cancelled or timed out
    /// - 5: Corrupt persisted data
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::FileNotFound { .. } | Self::Io(_) => ExitCode::from(1),
            Self::CompileDatabase { .. } | Self::ConfigError { .. } | Self::Toml(_) => {
                ExitCode::from(2)
            }
            Self::Json(_) | Self::Pattern(_) => ExitCode::from(2),
            Self::Task(TaskError::BuildFailure { .. }) => ExitCode::from(3),
            Self::Task(_) => ExitCode::from(4),
            Self::Shard(_) => ExitCode::from(5),
        }
    }
}

/// Result type alias for semfora-scheduler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure delivered to the requester of a scheduled task.
///
/// Every request resolves exactly once, either with its value or with one of
/// these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The compiler invocation failed; diagnostics were also published.
    #[error("build failed for {}", path.display())]
    BuildFailure {
        path: PathBuf,
        diagnostics: Vec<Diagnostic>,
    },

    /// Superseded by an edit, removed, or explicitly cancelled.
    #[error("task cancelled: {reason}")]
    Cancelled { reason: String },

    /// Operation on an untracked file or otherwise malformed request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The requester's deadline passed while the task was still queued.
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },
}

impl TaskError {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
