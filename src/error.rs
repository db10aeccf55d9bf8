//! Forwarder Error types

use thiserror::Error;

use crate::config::StorageError;

#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// Serialized as the display string for UI consumers
impl serde::Serialize for ForwarderError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
