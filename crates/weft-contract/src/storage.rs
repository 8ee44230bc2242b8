//! Key-value storage seam used by snapshot persistence.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("quota exceeded writing {key}: need {needed} bytes, limit {limit}")]
    QuotaExceeded {
        key: String,
        needed: usize,
        limit: usize,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// String-valued key-value store, the shape of browser local storage.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read a value. Missing keys yield `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Delete a value. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<(), KvError>;
}
