//! Tracing subscriber setup for the provider binary.
//!
//! Standard output carries response documents only, so log events go to the
//! provider log file when a log directory is configured and to stderr
//! otherwise.

use std::env;
use std::fs::File;
use std::io;
use std::sync::Mutex;

use camino::Utf8Path;
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::context::ProviderContext;

/// Environment variable holding a filter directive that overrides the
/// configured log level.
pub const LOG_FILTER_ENV: &str = "HOSTPROV_LOG";

/// Errors raised while installing the subscriber.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LoggingError {
    /// Raised when the filter directive does not parse.
    #[error("invalid log filter {filter:?}: {message}")]
    Filter {
        /// Directive that failed to parse.
        filter: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when the log file cannot be opened.
    #[error("failed to open log file {path}: {message}")]
    Open {
        /// Log file path.
        path: String,
        /// Operating system error message.
        message: String,
    },
    /// Raised when a global subscriber is already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Builds the event filter from [`LOG_FILTER_ENV`], falling back to
/// `default_level`.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] when the chosen directive is invalid.
pub fn filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directive = env::var(LOG_FILTER_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_level.to_owned());
    EnvFilter::try_new(&directive).map_err(|err| LoggingError::Filter {
        filter: directive,
        message: err.to_string(),
    })
}

/// Installs the global subscriber for one invocation.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid, the log file cannot
/// be opened, or a subscriber is already installed.
pub fn init(context: &ProviderContext, default_level: &str) -> Result<(), LoggingError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(default_level)?)
        .with_target(false);
    let installed = match context.log_path() {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(open_append(&path)?))
            .try_init(),
        None => builder.with_writer(io::stderr).try_init(),
    };
    installed.map_err(|err| LoggingError::Install(err.to_string()))
}

fn open_append(path: &Utf8Path) -> Result<File, LoggingError> {
    let open_error = |message: String| LoggingError::Open {
        path: path.to_string(),
        message,
    };
    let parent = path
        .parent()
        .ok_or_else(|| open_error(String::from("path has no parent directory")))?;
    let name = path
        .file_name()
        .ok_or_else(|| open_error(String::from("path has no file name")))?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| open_error(err.to_string()))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| open_error(err.to_string()))?;
    let file = dir
        .open_with(name, OpenOptions::new().create(true).append(true))
        .map_err(|err| open_error(err.to_string()))?;
    Ok(file.into_std())
}
