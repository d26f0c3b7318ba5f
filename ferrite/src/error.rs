use std::io;

use thiserror::Error;

/// Failure kinds surfaced by the crate. Precondition violations are not
/// represented here; those panic.
#[derive(Debug, Error)]
pub enum Error {
    /// An operating system call failed.
    #[error("system error: {0}")]
    System(#[from] io::Error),

    /// Malformed input: an HTTP request line or header, codec bytes or a
    /// WebSocket frame that cannot be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Input that decodes but violates the protocol, such as a mis-ordered
    /// continuation frame or an oversize message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Allocation or capacity exhaustion, such as a bounded sink that
    /// cannot grow any further.
    #[error("resource error: {0}")]
    Resource(String),
}

impl Error {
    #[inline]
    pub fn parse<S: Into<String>>(message: S) -> Error {
        Error::Parse(message.into())
    }

    #[inline]
    pub fn protocol<S: Into<String>>(message: S) -> Error {
        Error::Protocol(message.into())
    }

    #[inline]
    pub fn resource<S: Into<String>>(message: S) -> Error {
        Error::Resource(message.into())
    }

    /// The errno-style code for system errors, if any.
    #[inline]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::System(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Error {
        Error::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
