//! The crate-wide error type.
//!
//! Modeled as a plain enum with constructor helpers so call sites read as
//! `Error::illegal_state("...")` and per-run transient failures stay
//! distinguishable from fatal configuration errors.

use std::{fmt, io};

/// Anything that can go wrong while setting up or driving a fuzzing campaign.
#[derive(Debug)]
pub enum Error {
    /// Filesystem or pipe error outside a PUT run.
    File(io::Error),
    /// Pipe I/O failed while driving a single execution. Recoverable: the
    /// run is skipped, the fork server stays alive.
    PutIo(io::Error),
    /// The component was asked to do something its state does not allow.
    IllegalState(String),
    /// Bad user input (CLI, target binary, sanitizer options).
    IllegalArgument(String),
    /// A blocking operation did not complete in time.
    Timeout(String),
    /// A matrix factorization did not converge. The caller retries later.
    NotFactorizable(String),
    /// An interrupt asked everyone to unwind.
    ShuttingDown,
    /// Catch-all.
    Unknown(String),
}

impl Error {
    #[must_use]
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }

    #[must_use]
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Error::IllegalArgument(msg.into())
    }

    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    #[must_use]
    pub fn not_factorizable(msg: impl Into<String>) -> Self {
        Error::NotFactorizable(msg.into())
    }

    #[must_use]
    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    #[must_use]
    pub fn put_io(err: io::Error) -> Self {
        Error::PutIo(err)
    }

    /// Whether skipping the current execution is enough to recover.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::PutIo(_) | Error::Timeout(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::File(err) => write!(f, "file error: {err}"),
            Error::PutIo(err) => write!(f, "PUT I/O error: {err}"),
            Error::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Error::IllegalArgument(msg) => write!(f, "illegal argument: {msg}"),
            Error::Timeout(msg) => write!(f, "timeout: {msg}"),
            Error::NotFactorizable(msg) => write!(f, "factorization failed: {msg}"),
            Error::ShuttingDown => write!(f, "shutting down"),
            Error::Unknown(msg) => write!(f, "unknown error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::File(err) | Error::PutIo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::File(err)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::File(io::Error::from_raw_os_error(err as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(Error::put_io(io::Error::new(io::ErrorKind::BrokenPipe, "x")).is_transient());
        assert!(Error::timeout("slow").is_transient());
        assert!(!Error::illegal_state("nope").is_transient());
    }
}
