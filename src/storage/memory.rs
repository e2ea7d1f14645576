// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::traits::{Storage, StorageError};

/// In-memory storage implementation.
///
/// Intended for tests and ephemeral setups; real applications provide a
/// durable store. Clones share the same underlying map, mirroring how a
/// persistent store would be observed by a reloaded session manager.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    values: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, StorageError> {
        self.values
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock is poisoned".to_string()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn store(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.lock()?.insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StorageError> {
        Ok(self
            .lock()?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::traits::Storage;

    use super::MemoryStorage;

    #[tokio::test]
    async fn store_load_delete() {
        let mut storage = MemoryStorage::new();

        assert!(storage.load(b"a").await.unwrap().is_none());

        storage.store(b"a", vec![1]).await.unwrap();
        storage.store(b"a/b", vec![2]).await.unwrap();
        storage.store(b"c", vec![3]).await.unwrap();

        assert_eq!(storage.load(b"a").await.unwrap(), Some(vec![1]));
        assert_eq!(
            storage.list_prefix(b"a").await.unwrap(),
            vec![b"a".to_vec(), b"a/b".to_vec()]
        );

        storage.delete(b"a").await.unwrap();
        assert!(storage.load(b"a").await.unwrap().is_none());

        // Deleting a missing key is fine.
        storage.delete(b"a").await.unwrap();
    }

    #[tokio::test]
    async fn clones_share_the_map() {
        let mut storage = MemoryStorage::new();
        let observer = storage.clone();

        storage.store(b"key", vec![42]).await.unwrap();
        assert_eq!(observer.load(b"key").await.unwrap(), Some(vec![42]));
    }
}
