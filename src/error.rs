//! Crate-wide error type and result alias.
//!
//! Every failure in the library maps onto one of a small set of kinds.
//! Transport problems (`Connection`, `Protocol`, `Closed`) are always fatal
//! for the coupled run; there is no retry path. `Usage` marks violated
//! preconditions at the call site, `Configuration` marks rejected setups at
//! configure time, and `Numerical` marks breakdowns inside the acceleration
//! algebra. After any error the library stays in a state where
//! `finalize` is still safe to call.

use thiserror::Error;

/// Error kinds surfaced by the library.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration, unknown identifiers, contradictory options.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A precondition of the public API was violated.
    #[error("usage error: {0}")]
    Usage(String),

    /// The transport failed to connect or broke mid-run.
    #[error("connection error: {0}")]
    Connection(String),

    /// Matched send/receive disagreed on type or length, or a required
    /// action was not acknowledged.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation on a channel that was already closed.
    #[error("channel is closed")]
    Closed,

    /// Numerical breakdown: singular system beyond the filter's reach,
    /// non-finite residual, or an interface shape the method cannot handle.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A documented but unsupported capability was requested.
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

impl Error {
    /// Shorthand for a [`Error::Configuration`] with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Shorthand for a [`Error::Usage`] with a formatted message.
    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }
}
