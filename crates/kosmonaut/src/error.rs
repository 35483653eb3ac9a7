//! Client-side errors.

use webrocket_proto::{ProtocolError, Status};

/// Anything that can go wrong while talking to the broker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The broker replied with an `ER` frame.
    #[error("{0}")]
    Status(Status),

    /// The URL is not a valid `wr://token@host:port/vhost` address.
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    /// The request did not complete within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The broker replied with something this client does not understand.
    #[error("unknown server error")]
    UnknownResponse,

    /// A `TR` payload that is not a single-key event object.
    #[error("invalid message format")]
    InvalidMessage,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The wire status attached to this error, if it came from the broker.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Status(status) => Some(*status),
            _ => None,
        }
    }

    /// Numeric code for broker-reported errors.
    pub fn code(&self) -> Option<u16> {
        self.status().map(Status::code)
    }
}
