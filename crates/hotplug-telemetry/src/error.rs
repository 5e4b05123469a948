//! Errors raised while installing the log subscriber.

use std::path::PathBuf;

use thiserror::Error;

/// Why logging could not be set up.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// `[logging].format` names no known format.
    #[error("unknown log format '{0}' (expected pretty, compact, json or full)")]
    UnknownFormat(String),

    /// The level or a per-target directive does not parse as a filter.
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter {
        /// The offending level or directive.
        filter: String,
        /// Parser message.
        message: String,
    },

    /// A file target without a file name component.
    #[error("log file path has no file name: {}", .0.display())]
    InvalidLogPath(PathBuf),

    /// The directory for a file target could not be created.
    #[error("cannot create log directory {}: {source}", path.display())]
    LogDirectory {
        /// Directory that was being created.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Another subscriber already owns the global dispatcher.
    #[error("global log subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Result alias for logging setup.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
