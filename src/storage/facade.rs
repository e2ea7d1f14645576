// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cbor::{decode_cbor, encode_cbor};
use crate::crypto::identity::{IdentityKey, IdentityKeyPair};
use crate::device::{DeviceId, DeviceRecord};
use crate::session::Session;
use crate::traits::{Storage, StorageError};

/// Key layout of the versioned storage namespace.
mod keys {
    use crate::crypto::identity::IdentityKey;
    use crate::device::DeviceId;

    pub fn identity_key_pair() -> String {
        "v1/identity/key_pair".to_string()
    }

    pub fn own_device_id() -> String {
        "v1/own_device_id".to_string()
    }

    pub fn rotation_period() -> String {
        "v1/config/signed_pre_key_rotation_period".to_string()
    }

    pub fn device_list(bare_jid: &str) -> String {
        format!("v1/devices/{bare_jid}/list")
    }

    pub fn device_record(bare_jid: &str, device_id: DeviceId) -> String {
        format!("v1/devices/{bare_jid}/{device_id}/record")
    }

    pub fn device_prefix(bare_jid: &str) -> String {
        format!("v1/devices/{bare_jid}/")
    }

    pub fn trust(bare_jid: &str, identity_key: &IdentityKey) -> String {
        format!("v1/trust/{bare_jid}/{}", identity_key.to_hex())
    }

    pub fn trust_prefix(bare_jid: &str) -> String {
        format!("v1/trust/{bare_jid}/")
    }

    pub fn session(namespace: &str, bare_jid: &str, device_id: DeviceId) -> String {
        format!("v1/sessions/{namespace}/{bare_jid}/{device_id}")
    }

    pub fn session_prefix(namespace: &str, bare_jid: &str) -> String {
        format!("v1/sessions/{namespace}/{bare_jid}/")
    }

    pub fn backend_state(namespace: &str) -> String {
        format!("v1/backends/{namespace}/state")
    }

    pub fn queue(namespace: &str) -> String {
        format!("v1/queue/{namespace}")
    }
}

/// Typed, write-through views over the opaque key-value store.
pub(crate) struct StorageFacade {
    store: Box<dyn Storage>,
}

impl StorageFacade {
    pub fn new(store: Box<dyn Storage>) -> Self {
        Self { store }
    }

    async fn load_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.store.load(key.as_bytes()).await? {
            Some(bytes) => Ok(Some(decode_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_value<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = encode_cbor(value)?;
        self.store.store(key.as_bytes(), bytes).await
    }

    async fn delete_prefix(&mut self, prefix: &str) -> Result<(), StorageError> {
        for key in self.store.list_prefix(prefix.as_bytes()).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    pub async fn load_identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, StorageError> {
        self.load_value(&keys::identity_key_pair()).await
    }

    pub async fn store_identity_key_pair(
        &mut self,
        identity: &IdentityKeyPair,
    ) -> Result<(), StorageError> {
        self.store_value(&keys::identity_key_pair(), identity).await
    }

    pub async fn load_own_device_id(&self) -> Result<Option<DeviceId>, StorageError> {
        self.load_value(&keys::own_device_id()).await
    }

    pub async fn store_own_device_id(&mut self, device_id: DeviceId) -> Result<(), StorageError> {
        self.store_value(&keys::own_device_id(), &device_id).await
    }

    pub async fn load_rotation_period(&self) -> Result<Option<u64>, StorageError> {
        self.load_value(&keys::rotation_period()).await
    }

    pub async fn store_rotation_period(&mut self, period: u64) -> Result<(), StorageError> {
        self.store_value(&keys::rotation_period(), &period).await
    }

    pub async fn load_device_list(&self, bare_jid: &str) -> Result<BTreeSet<DeviceId>, StorageError> {
        Ok(self
            .load_value(&keys::device_list(bare_jid))
            .await?
            .unwrap_or_default())
    }

    pub async fn store_device_list(
        &mut self,
        bare_jid: &str,
        device_list: &BTreeSet<DeviceId>,
    ) -> Result<(), StorageError> {
        self.store_value(&keys::device_list(bare_jid), device_list)
            .await
    }

    pub async fn load_device_record(
        &self,
        bare_jid: &str,
        device_id: DeviceId,
    ) -> Result<Option<DeviceRecord>, StorageError> {
        self.load_value(&keys::device_record(bare_jid, device_id))
            .await
    }

    pub async fn store_device_record(
        &mut self,
        bare_jid: &str,
        device_id: DeviceId,
        record: &DeviceRecord,
    ) -> Result<(), StorageError> {
        self.store_value(&keys::device_record(bare_jid, device_id), record)
            .await
    }

    pub async fn load_trust(
        &self,
        bare_jid: &str,
        identity_key: &IdentityKey,
    ) -> Result<Option<String>, StorageError> {
        self.load_value(&keys::trust(bare_jid, identity_key)).await
    }

    pub async fn store_trust(
        &mut self,
        bare_jid: &str,
        identity_key: &IdentityKey,
        trust_level: &str,
    ) -> Result<(), StorageError> {
        self.store_value(&keys::trust(bare_jid, identity_key), &trust_level.to_string())
            .await
    }

    pub async fn delete_trust(&mut self, bare_jid: &str) -> Result<(), StorageError> {
        self.delete_prefix(&keys::trust_prefix(bare_jid)).await
    }

    pub async fn load_session(
        &self,
        namespace: &str,
        bare_jid: &str,
        device_id: DeviceId,
    ) -> Result<Option<Session>, StorageError> {
        self.load_value(&keys::session(namespace, bare_jid, device_id))
            .await
    }

    pub async fn store_session(&mut self, session: &Session) -> Result<(), StorageError> {
        self.store_value(
            &keys::session(session.namespace(), session.bare_jid(), session.device_id()),
            session,
        )
        .await
    }

    pub async fn load_backend_state(&self, namespace: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.load(keys::backend_state(namespace).as_bytes()).await
    }

    pub async fn store_backend_state(
        &mut self,
        namespace: &str,
        state: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.store
            .store(keys::backend_state(namespace).as_bytes(), state)
            .await
    }

    pub async fn load_queue(
        &self,
        namespace: &str,
    ) -> Result<BTreeMap<String, BTreeSet<DeviceId>>, StorageError> {
        Ok(self
            .load_value(&keys::queue(namespace))
            .await?
            .unwrap_or_default())
    }

    pub async fn store_queue(
        &mut self,
        namespace: &str,
        queue: &BTreeMap<String, BTreeSet<DeviceId>>,
    ) -> Result<(), StorageError> {
        self.store_value(&keys::queue(namespace), queue).await
    }

    pub async fn delete_queue(&mut self, namespace: &str) -> Result<(), StorageError> {
        self.store.delete(keys::queue(namespace).as_bytes()).await
    }

    /// Removes all data keyed by a bare JID: device records and list, trust
    /// entries, sessions for every loaded backend and pending response
    /// queues. The identity key pair is untouched.
    pub async fn purge_bare_jid(
        &mut self,
        bare_jid: &str,
        namespaces: &[String],
    ) -> Result<(), StorageError> {
        self.delete_prefix(&keys::device_prefix(bare_jid)).await?;
        self.delete_prefix(&keys::trust_prefix(bare_jid)).await?;

        for namespace in namespaces {
            self.delete_prefix(&keys::session_prefix(namespace, bare_jid))
                .await?;

            let mut queue = self.load_queue(namespace).await?;
            if queue.remove(bare_jid).is_some() {
                self.store_queue(namespace, &queue).await?;
            }
        }

        Ok(())
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::collections::BTreeSet;

    use crate::crypto::Rng;
    use crate::crypto::identity::IdentityKeyPair;
    use crate::device::DeviceRecord;
    use crate::session::{Initiation, Session};
    use crate::storage::MemoryStorage;

    use super::StorageFacade;

    fn facade() -> StorageFacade {
        StorageFacade::new(Box::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn identity_round_trip() {
        let mut facade = facade();
        let rng = Rng::from_seed([1; 32]);

        assert!(facade.load_identity_key_pair().await.unwrap().is_none());

        let identity = IdentityKeyPair::generate(&rng).unwrap();
        facade.store_identity_key_pair(&identity).await.unwrap();

        let loaded = facade.load_identity_key_pair().await.unwrap().unwrap();
        assert_eq!(loaded.identity_key(), identity.identity_key());
        assert!(loaded.is_seed());
    }

    #[tokio::test]
    async fn purge_removes_account_data_but_not_identity() {
        let mut facade = facade();
        let rng = Rng::from_seed([2; 32]);

        let identity = IdentityKeyPair::generate(&rng).unwrap();
        facade.store_identity_key_pair(&identity).await.unwrap();

        let bare_jid = "bob@example.org";
        let identity_key = identity.identity_key();

        facade
            .store_device_list(bare_jid, &BTreeSet::from([5]))
            .await
            .unwrap();
        facade
            .store_device_record(bare_jid, 5, &DeviceRecord::first_seen("ns:test", None))
            .await
            .unwrap();
        facade
            .store_trust(bare_jid, &identity_key, "trusted")
            .await
            .unwrap();
        facade
            .store_session(&Session::new(
                "ns:test".to_string(),
                bare_jid.to_string(),
                5,
                Initiation::Active,
                identity_key,
                None,
                None,
                vec![1, 2, 3],
            ))
            .await
            .unwrap();

        facade
            .purge_bare_jid(bare_jid, &["ns:test".to_string()])
            .await
            .unwrap();

        assert!(facade.load_device_list(bare_jid).await.unwrap().is_empty());
        assert!(facade
            .load_device_record(bare_jid, 5)
            .await
            .unwrap()
            .is_none());
        assert!(facade
            .load_trust(bare_jid, &identity_key)
            .await
            .unwrap()
            .is_none());
        assert!(facade
            .load_session("ns:test", bare_jid, 5)
            .await
            .unwrap()
            .is_none());
        assert!(facade.load_identity_key_pair().await.unwrap().is_some());
    }
}
