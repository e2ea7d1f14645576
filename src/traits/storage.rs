// SPDX-License-Identifier: MIT OR Apache-2.0

use async_trait::async_trait;
use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError};

/// Application-provided key-value store for all data the core persists.
///
/// Requirements:
/// - `store` and `delete` are write-through: the data must be durable before
///   the call returns. The core never batches or defers writes.
/// - Keys are opaque byte strings; the core namespaces and versions them.
///
/// The core relies on write ordering for its consistency guarantees: it never
/// returns a plaintext or ciphertext whose corresponding state change has not
/// been stored.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Loads the value stored under a key, `None` if there is none.
    async fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores a value under a key, overwriting any previous value.
    async fn store(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError>;

    /// Deletes the value stored under a key. Deleting a missing key is not an
    /// error.
    async fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;

    /// Returns all keys starting with the given prefix.
    async fn list_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StorageError>;
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// Failure inside the application's storage implementation.
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
