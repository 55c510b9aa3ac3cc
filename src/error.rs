use std::io;

use thiserror::Error;

use crate::uri::UriError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the transfer engine and the server cache.
///
/// An application electing to stop a transfer is not an error, see
/// [`crate::transfer::Outcome::Stopped`].
#[derive(Debug, Error)]
pub enum Error {
    /// Unusable settings, e.g. secure transport without trust material. No network I/O was
    /// attempted.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unable to resolve host {0}")]
    UnreachableHost(String),

    #[error("unable to connect to {host}: {source}")]
    ConnectFailed {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Response header missing or malformed, or framing that does not fit the fragment buffer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Send or receive failure in the middle of a transfer.
    #[error("transfer failed: {0}")]
    TransferIo(#[source] io::Error),

    #[error("storage error: {0}")]
    Storage(#[source] io::Error),

    #[error(transparent)]
    Uri(#[from] UriError),
}

impl Error {
    /// Only mid-transfer I/O failures may be recovered by reconnecting and resuming.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransferIo(_))
    }

    /// OS error code of the underlying transport failure, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::ConnectFailed { source, .. } => source.raw_os_error(),
            Error::TransferIo(source) | Error::Storage(source) => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn not_connected() -> Self {
        Error::TransferIo(io::Error::new(
            io::ErrorKind::NotConnected,
            "client is not connected",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transfer_io_is_retryable() {
        assert!(Error::TransferIo(io::Error::from(io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(!Error::Protocol("bad header".to_string()).is_retryable());
        assert!(!Error::UnreachableHost("example.invalid".to_string()).is_retryable());
        assert!(!Error::Storage(io::Error::from(io::ErrorKind::NotFound)).is_retryable());
    }

    #[test]
    fn code_of_os_error() {
        let err = Error::TransferIo(io::Error::from_raw_os_error(104));
        assert_eq!(err.code(), Some(104));
        assert_eq!(Error::InvalidConfig("x".to_string()).code(), None);
    }
}
