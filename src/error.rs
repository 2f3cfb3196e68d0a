use std::error::Error;
use std::fmt;

/// Failures surfaced by the conversation store and the message exchange.
/// Each variant maps to one HTTP status at the API boundary.
#[derive(Debug)]
pub enum ChatError {
    Validation(String),
    Unauthorized(String),
    NotFound(String),
    CannotDeleteDefault(String),
    Persistence(String),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ChatError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ChatError::NotFound(what) => write!(f, "{} not found", what),
            ChatError::CannotDeleteDefault(name) => {
                write!(f, "model '{}' is the current default and cannot be deleted", name)
            }
            ChatError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
        }
    }
}

impl Error for ChatError {}

impl From<tokio_postgres::Error> for ChatError {
    fn from(err: tokio_postgres::Error) -> Self {
        ChatError::Persistence(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for ChatError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        ChatError::Persistence(format!("connection pool error: {}", err))
    }
}

impl From<deadpool_postgres::BuildError> for ChatError {
    fn from(err: deadpool_postgres::BuildError) -> Self {
        ChatError::Persistence(format!("failed to build connection pool: {}", err))
    }
}
