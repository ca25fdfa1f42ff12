//! Error types for the Scaleway control plane.

use thiserror::Error;

use crate::backend::BackendError;
use crate::runner::RunnerError;

/// Errors raised by the `scw`-backed control plane.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayError {
    /// Raised when the adapter configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a provisioning request is missing a required field.
    #[error("invalid provisioning request: {0}")]
    Validation(String),
    /// Raised when `scw` returns a non-zero exit status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed (typically `scw`).
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when JSON output from the CLI cannot be parsed.
    #[error("failed to parse {resource} output: {message}")]
    Parse {
        /// Resource type being parsed (for example `servers`).
        resource: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when command execution fails.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl From<BackendError> for ScalewayError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}
