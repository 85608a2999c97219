mod path;
mod provider;
mod resource;

pub use path::*;
pub use provider::*;
pub use resource::*;

use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("lock wait timed out: {0}")]
    Timeout(String),
    #[error("operation interrupted: {0}")]
    Interrupted(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

pub type CacheReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;
pub type CacheWriter = Pin<Box<dyn AsyncWrite + Send + Unpin>>;

/// Identity of the ambient execution context. Operations that stack locks or
/// coalesce transaction commits are keyed by this id, so a stream must be
/// closed by the same context that opened it.
pub fn context_id() -> String {
    match tokio::task::try_id() {
        Some(id) => format!("task-{}", id),
        None => format!("{:?}", std::thread::current().id()),
    }
}
