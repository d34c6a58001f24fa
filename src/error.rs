use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::cli::CliError;

/// Unified error type for the image builder.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Cli(CliError),
    /// Rejected configuration value. Callers usually warn and keep the prior value.
    Config(String),
    /// Corrupted partition/clone metadata or a module that fails verification.
    Invariant {
        message: String,
        backtrace: Option<Backtrace>,
    },
    Codegen {
        message: String,
        backtrace: Option<Backtrace>,
    },
    /// A single artifact could not be written.
    Output {
        artifact: PathBuf,
        source: io::Error,
    },
    Serialization(String),
}

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Construct a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Construct a fatal invariant violation.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
            backtrace: capture_backtrace(),
        }
    }

    /// Construct a code generation error.
    pub fn codegen(message: impl Into<String>) -> Self {
        Self::Codegen {
            message: message.into(),
            backtrace: capture_backtrace(),
        }
    }

    pub fn output(artifact: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Output {
            artifact: artifact.into(),
            source,
        }
    }

    /// Invariant violations are never recovered from.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Invariant { .. })
    }

    /// Return the captured backtrace, if any.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            Error::Codegen { backtrace, .. } | Error::Invariant { backtrace, .. } => {
                backtrace.as_ref()
            }
            _ => None,
        }
    }
}

fn capture_backtrace() -> Option<Backtrace> {
    if cfg!(debug_assertions) {
        Some(Backtrace::force_capture())
    } else {
        None
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Cli(err) => write!(f, "{err}"),
            Error::Config(message) => write!(f, "configuration error: {message}"),
            Error::Invariant { message, .. } => write!(f, "invariant violation: {message}"),
            Error::Codegen { message, .. } => write!(f, "codegen error: {message}"),
            Error::Output { artifact, source } => {
                write!(f, "failed to write '{}': {source}", artifact.display())
            }
            Error::Serialization(message) => write!(f, "serialization error: {message}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Cli(err) => Some(err),
            Error::Output { source, .. } => Some(source),
            Error::Config(_)
            | Error::Invariant { .. }
            | Error::Codegen { .. }
            | Error::Serialization(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<CliError> for Error {
    fn from(error: CliError) -> Self {
        Error::Cli(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::Config(error.to_string())
    }
}
