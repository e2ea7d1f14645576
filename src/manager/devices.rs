// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device-list registry: merging per-backend device lists per bare JID and
//! serving device information to the application and the dispatch flows.
use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, warn};

use crate::bundle::Bundle;
use crate::device::{DeviceId, DeviceInformation, DeviceRecord};
use crate::manager::SessionManager;
use crate::traits::{StorageError, TransportError};

#[derive(Debug, Error)]
pub enum DeviceListError {
    #[error("the backend handling the namespace {0} is not currently loaded")]
    UnknownNamespace(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl<P> SessionManager<P> {
    /// Processes a device-list update for one backend, e.g. after receiving
    /// a PEP notification: listed devices become active for the namespace,
    /// previously listed but now absent devices become inactive.
    ///
    /// If the update is for the own account and misses the own device, the
    /// device is appended and the corrected list uploaded.
    pub async fn update_device_list(
        &mut self,
        namespace: &str,
        bare_jid: &str,
        device_list: &[(DeviceId, Option<String>)],
    ) -> Result<(), DeviceListError> {
        debug!(
            namespace = %namespace,
            bare_jid = %bare_jid,
            devices = device_list.len(),
            "processing device list update"
        );

        if self.backend_index(namespace).is_none() {
            return Err(DeviceListError::UnknownNamespace(namespace.to_string()));
        }

        let listed_ids: BTreeSet<DeviceId> =
            device_list.iter().map(|(device_id, _)| *device_id).collect();
        let known_ids = self.storage.load_device_list(bare_jid).await?;

        // Own list reconciliation: this device must stay announced.
        let mut effective = device_list.to_vec();
        if bare_jid == self.own_bare_jid && !listed_ids.contains(&self.own_device_id) {
            warn!("own device id missing from the published device list, republishing");
            let label = match self
                .storage
                .load_device_record(bare_jid, self.own_device_id)
                .await?
            {
                Some(record) => record.label,
                None => self.config.own_device_label.clone(),
            };
            effective.push((self.own_device_id, label));
            self.transport
                .upload_device_list(namespace, bare_jid, &effective)
                .await?;
        }

        let effective_ids: BTreeSet<DeviceId> =
            effective.iter().map(|(device_id, _)| *device_id).collect();

        // Devices on the list: create or update their records.
        for (device_id, label) in &effective {
            match self.storage.load_device_record(bare_jid, *device_id).await? {
                None => {
                    let record = DeviceRecord::first_seen(namespace, label.clone());
                    self.storage
                        .store_device_record(bare_jid, *device_id, &record)
                        .await?;
                }
                Some(mut record) => {
                    if record.observe(namespace, true, label.as_deref()) {
                        self.storage
                            .store_device_record(bare_jid, *device_id, &record)
                            .await?;
                    }
                }
            }
        }

        // Previously known devices missing from this list: inactive for the
        // namespace. Records, sessions and keys are retained.
        for device_id in known_ids.difference(&effective_ids) {
            if let Some(mut record) = self.storage.load_device_record(bare_jid, *device_id).await? {
                if record.observe(namespace, false, None) {
                    self.storage
                        .store_device_record(bare_jid, *device_id, &record)
                        .await?;
                }
            }
        }

        // Update the cached list of known devices last, for consistency.
        let union: BTreeSet<DeviceId> = known_ids.union(&effective_ids).copied().collect();
        if union != known_ids {
            self.storage.store_device_list(bare_jid, &union).await?;
        }

        debug!("device list update processed");
        Ok(())
    }

    /// Downloads the current device list for one backend and processes it
    /// like a received update.
    pub async fn refresh_device_list(
        &mut self,
        namespace: &str,
        bare_jid: &str,
    ) -> Result<(), DeviceListError> {
        debug!(namespace = %namespace, bare_jid = %bare_jid, "refreshing device list");

        if self.backend_index(namespace).is_none() {
            return Err(DeviceListError::UnknownNamespace(namespace.to_string()));
        }

        let device_list = self
            .transport
            .download_device_list(namespace, bare_jid)
            .await?;
        self.update_device_list(namespace, bare_jid, &device_list)
            .await
    }

    /// Information about all cached devices of an account, regardless of
    /// backend.
    ///
    /// Devices whose identity key is not known yet have their bundle
    /// downloaded to learn it; a device none of whose bundles can be fetched
    /// is left out of the result.
    pub async fn get_device_information(
        &mut self,
        bare_jid: &str,
    ) -> Result<Vec<DeviceInformation>, StorageError> {
        Ok(self.device_information_with_bundles(bare_jid).await?.0)
    }

    /// Like [`get_device_information`](Self::get_device_information) but
    /// also returns the bundles downloaded along the way, so the encryption
    /// flow can reuse them for session building instead of fetching twice.
    pub(crate) async fn device_information_with_bundles(
        &mut self,
        bare_jid: &str,
    ) -> Result<(Vec<DeviceInformation>, Vec<Bundle>), StorageError> {
        let device_ids = self.storage.load_device_list(bare_jid).await?;

        let mut devices = Vec::new();
        let mut bundle_cache = Vec::new();

        for device_id in device_ids {
            let Some(mut record) = self.storage.load_device_record(bare_jid, device_id).await?
            else {
                continue;
            };

            let identity_key = match record.identity_key {
                Some(identity_key) => identity_key,
                None => {
                    // The identity key is learned from any downloadable
                    // bundle of the device.
                    let mut learned = None;
                    for namespace in record.namespaces.clone() {
                        match self
                            .transport
                            .download_bundle(&namespace, bare_jid, device_id)
                            .await
                        {
                            Ok(bundle) => {
                                learned = Some(*bundle.identity_key());
                                bundle_cache.push(bundle);
                                break;
                            }
                            Err(err) => {
                                warn!(
                                    namespace = %namespace,
                                    bare_jid = %bare_jid,
                                    device_id,
                                    error = %err,
                                    "bundle download for identity key discovery failed"
                                );
                            }
                        }
                    }

                    match learned {
                        Some(identity_key) => {
                            record.identity_key = Some(identity_key);
                            self.storage
                                .store_device_record(bare_jid, device_id, &record)
                                .await?;
                            identity_key
                        }
                        None => {
                            warn!(
                                bare_jid = %bare_jid,
                                device_id,
                                "leaving device out, no bundle to assign an identity key from"
                            );
                            continue;
                        }
                    }
                }
            };

            let trust_level = self
                .storage
                .load_trust(bare_jid, &identity_key)
                .await?
                .unwrap_or_else(|| self.config.default_trust_level.clone());

            devices.push(DeviceInformation {
                bare_jid: bare_jid.to_string(),
                device_id,
                namespaces: record.namespaces,
                active: record.active,
                label: record.label,
                identity_key,
                trust_level,
            });
        }

        Ok((devices, bundle_cache))
    }

    /// Information about this device and about the other devices of the own
    /// account.
    pub async fn get_own_device_information(
        &mut self,
    ) -> Result<(DeviceInformation, Vec<DeviceInformation>), StorageError> {
        let own_bare_jid = self.own_bare_jid.clone();
        let devices = self.get_device_information(&own_bare_jid).await?;

        let own = devices
            .iter()
            .find(|device| device.device_id == self.own_device_id)
            .cloned()
            .ok_or_else(|| StorageError::Backend("own device record is missing".to_string()))?;
        let others = devices
            .into_iter()
            .filter(|device| device.device_id != self.own_device_id)
            .collect();

        Ok((own, others))
    }

    /// Replaces the label of this device and republishes the device lists
    /// of all loaded backends with the new label.
    pub async fn set_own_label(&mut self, label: Option<String>) -> Result<(), DeviceListError> {
        debug!(label = ?label, "updating own device label");

        let own_bare_jid = self.own_bare_jid.clone();
        if let Some(mut record) = self
            .storage
            .load_device_record(&own_bare_jid, self.own_device_id)
            .await?
        {
            record.label = label.clone();
            self.storage
                .store_device_record(&own_bare_jid, self.own_device_id, &record)
                .await?;
        }

        for namespace in self.namespaces() {
            let mut device_list = self
                .transport
                .download_device_list(&namespace, &own_bare_jid)
                .await?;
            match device_list
                .iter_mut()
                .find(|(device_id, _)| *device_id == self.own_device_id)
            {
                Some(entry) => entry.1 = label.clone(),
                None => device_list.push((self.own_device_id, label.clone())),
            }
            self.transport
                .upload_device_list(&namespace, &own_bare_jid, &device_list)
                .await?;
        }

        Ok(())
    }
}
