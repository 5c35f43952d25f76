//! Error types for the IRC client engine

use thiserror::Error;

/// Main error type for the IRC client engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resolve error: {0}")]
    Resolve(String),

    #[error("No connection with id {0}")]
    UnknownConnection(crate::ConnectionId),

    #[error("No group with id {0}")]
    UnknownGroup(crate::GroupId),

    #[error("Group {0} has no members")]
    EmptyGroup(crate::GroupId),

    #[error("Generic error: {0}")]
    Generic(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Generic(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}
