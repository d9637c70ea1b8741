use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        // Every Redis failure mode reaching the caller means the directory
        // could not complete the operation; the caller cannot act on the
        // distinction between a refused connection and a broken pipe.
        Self::StoreUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
