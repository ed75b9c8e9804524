use thiserror::Error;

use crate::collector::CollectError;
use crate::config::ConfigError;
use crate::crypto::EncryptionError;
use crate::level::LevelError;
use crate::payload::SerializationError;
use crate::publisher::PublishError;

/// Crate-level error returned by [`Client`](crate::Client) operations.
#[derive(Debug, Error)]
pub enum SentryStrError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Level(#[from] LevelError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Collect(#[from] CollectError),
}

pub type Result<T> = std::result::Result<T, SentryStrError>;
