//! Crate-root error type, composed from each component's own error enum,
//! mirroring the teacher's `Error::transparent` chain
//! (`src/error.rs` wrapping `Common`/`Crypto`/`Dids`/`Dwn`).

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error(transparent)]
    Cid(#[from] crate::cid::Error),

    #[error(transparent)]
    Store(#[from] crate::store::Error),

    #[error(transparent)]
    Jws(#[from] crate::jws::Error),

    #[error(transparent)]
    Protocol(#[from] crate::authorize::Error),

    #[error(transparent)]
    Permissions(#[from] crate::permissions::Error),

    #[error(transparent)]
    Validation(#[from] crate::validator::Error),

    #[error(transparent)]
    Records(#[from] crate::records::Error),

    #[error(transparent)]
    Protocols(#[from] crate::protocols::Error),

    #[error(transparent)]
    Messages(#[from] crate::messages::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("mutually exclusive fields: {0} and {1}")]
    MutuallyExclusive(&'static str, &'static str),

    #[error("{0} requires {1}")]
    MutuallyInclusive(&'static str, &'static str),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    /// Maps to the status taxonomy every dispatcher reply carries: a
    /// small closed set of codes, not a full HTTP vocabulary.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Unauthorized(_) => 401,
            Error::Unsupported(_) => 501,
            Error::InvalidArgument(_)
            | Error::MutuallyExclusive(..)
            | Error::MutuallyInclusive(..)
            | Error::Validation(_)
            | Error::Json(_) => 400,
            Error::Jws(e) => e.status_code(),
            Error::Protocol(e) => e.status_code(),
            Error::Permissions(e) => e.status_code(),
            Error::Records(e) => e.status_code(),
            Error::Protocols(e) => e.status_code(),
            Error::Messages(e) => e.status_code(),
            Error::Store(_) | Error::Cid(_) => 500,
        }
    }
}
