use thiserror::Error;

/// Errors raised by model construction, data feeding, and persistence.
///
/// All variants are configuration-time or load-time faults and are raised
/// immediately to the caller; nothing here is retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent configuration, e.g. mismatched replicate
    /// counts between a reader and the model it feeds.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A named resource (model file, registry entry, activation, storage
    /// field) could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// Weight transplant with `must_exist` hit a destination layer with no
    /// source counterpart.
    #[error("missing layer: {0}")]
    MissingLayer(String),

    /// A structural expectation about an architecture or tensor was
    /// violated, e.g. no convolutional layer when introspecting a model.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
