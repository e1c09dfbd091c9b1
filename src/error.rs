// src/error.rs
use crate::key::KeyError;
use crate::store::StoreError;
use crate::stream::StreamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackplaneError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("state store: {0}")]
    Store(#[from] StoreError),

    #[error("disconnect stream: {0}")]
    Stream(#[from] StreamError),

    /// The registry could not be reached after re-activation attempts.
    #[error("registry '{0}' is unavailable")]
    Unavailable(String),
}

pub type Result<T, E = BackplaneError> = std::result::Result<T, E>;
