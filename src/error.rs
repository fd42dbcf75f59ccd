use std::path::PathBuf;

use thiserror::Error;

/// All errors that can surface from building, persisting or querying an
/// index. Errors are synchronous; nothing inside the engine retries.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration: unknown key, bad enum value, or a vector
    /// whose dimension does not match the index.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state: {message}")]
    State { message: String },

    /// I/O failure with context.
    #[error("I/O error at {path:?}: {context} ({source})")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
        context: String,
    },

    /// Malformed or incompatible model file.
    #[error("malformed model: {message}")]
    Format { message: String },

    /// Model buffer allocation failure.
    #[error("failed to allocate model buffer ({megabytes} MB)")]
    Alloc { megabytes: u64 },
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Error::State {
            message: message.into(),
        }
    }

    pub(crate) fn format(message: impl Into<String>) -> Self {
        Error::Format {
            message: message.into(),
        }
    }

    /// Closure adapter for `map_err` on I/O operations.
    pub(crate) fn io_err(
        path: impl Into<PathBuf>,
        context: impl Into<String>,
    ) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Error::Io {
            source,
            path: path.into(),
            context: context.into(),
        }
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
