//! Error types for lowmemd.

use thiserror::Error;

/// Result type alias using lowmemd's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lowmemd operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A `/proc` or cgroup file could not be parsed.
    #[error("parse error in {file}: {reason}")]
    Parse {
        /// File the malformed content came from.
        file: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// A control packet was malformed.
    #[error("bad control packet: {0}")]
    BadPacket(String),

    /// Initialization of a required component failed.
    #[error("initialization failed: {0}")]
    Init(String),

    /// An optional kernel feature is not available.
    #[error("kernel feature unavailable: {0}")]
    Unsupported(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
