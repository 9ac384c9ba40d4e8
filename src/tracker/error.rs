use thiserror::Error;

/// Why a single announce attempt failed.
///
/// Every variant is recoverable from the caller's point of view: try the
/// next announce URL, or the same one again later.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Network failure, timeout, or non-success HTTP status.
    #[error("tracker unreachable: {0}")]
    Unreachable(String),

    /// The tracker answered with something we could not parse.
    #[error("tracker protocol error: {0}")]
    Protocol(String),

    /// The tracker answered with a failure reason.
    #[error("tracker rejected announce: {0}")]
    Rejected(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        TrackerError::Unreachable(err.to_string())
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        TrackerError::Unreachable(err.to_string())
    }
}

impl From<crate::bencode::BencodeError> for TrackerError {
    fn from(err: crate::bencode::BencodeError) -> Self {
        TrackerError::Protocol(err.to_string())
    }
}
