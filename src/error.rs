//! Unified error handling for the broker engine.
//!
//! Engine operations fail with [`EngineError`]; the backend dispatcher maps
//! each variant onto the wire status taxonomy, the admin surface maps the
//! same variants onto HTTP codes. Storage failures have their own error type
//! so persistence problems stay distinguishable from validation.

use thiserror::Error;
use webrocket_proto::Status;

/// Errors produced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("vhost already exists: {0}")]
    VhostExists(String),

    #[error("vhost not found: {0}")]
    VhostNotFound(String),

    #[error("invalid channel name: {0}")]
    InvalidChannelName(String),

    #[error("channel already exists: {0}")]
    ChannelExists(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("invalid permission pattern: {0}")]
    InvalidPattern(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("bad request")]
    BadRequest,

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// The backend wire status for this error.
    pub fn status(&self) -> Status {
        match self {
            EngineError::InvalidPath(_)
            | EngineError::InvalidChannelName(_)
            | EngineError::InvalidPattern(_) => Status::InvalidChannelName,
            EngineError::VhostNotFound(_) | EngineError::ChannelNotFound(_) => {
                Status::ChannelNotFound
            }
            EngineError::VhostExists(_) | EngineError::ChannelExists(_) => Status::BadRequest,
            EngineError::Unauthorized => Status::Unauthorized,
            EngineError::Forbidden => Status::Forbidden,
            EngineError::BadRequest => Status::BadRequest,
            EngineError::Storage(_) => Status::InternalError,
        }
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt bucket record: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("storage directory already locked: {0}")]
    Locked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            EngineError::InvalidChannelName("===".into()).status().code(),
            451
        );
        assert_eq!(
            EngineError::ChannelNotFound("x".into()).status().code(),
            454
        );
        assert_eq!(EngineError::Unauthorized.status().code(), 402);
        assert_eq!(EngineError::Forbidden.status().code(), 403);
        assert_eq!(EngineError::BadRequest.status().code(), 400);
    }

    #[test]
    fn test_messages_name_the_subject() {
        let err = EngineError::VhostExists("/hello".into());
        assert_eq!(err.to_string(), "vhost already exists: /hello");
        let err = EngineError::InvalidChannelName("===".into());
        assert_eq!(err.to_string(), "invalid channel name: ===");
    }
}
