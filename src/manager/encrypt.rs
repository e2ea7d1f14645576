// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encryption fan-out: choose recipient devices, filter by trust, build
//! missing sessions from downloaded bundles, encrypt per device.
use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, warn};

use crate::bundle::Bundle;
use crate::device::DeviceInformation;
use crate::manager::SessionManager;
use crate::message::{EncryptFailureReason, EncryptedMessage, EncryptionFailure};
use crate::session::Session;
use crate::traits::{BackendError, StorageError, TransportError};
use crate::trust::{TrustError, TrustLevel};

#[derive(Debug, Error)]
pub enum EncryptError {
    /// The backend priority list named a namespace no loaded backend handles.
    #[error("the backend handling the namespace {0} is not currently loaded")]
    UnknownNamespace(String),

    /// One or more recipient devices still evaluate to undecided trust.
    /// Resolve all listed devices via [`set_trust`](SessionManager::set_trust)
    /// and retry.
    #[error("the trust of {} device(s) has not been decided on", .0.len())]
    StillUndecided(Vec<DeviceInformation>),

    /// None of the devices of these recipients qualified for encryption.
    #[error("no eligible devices for recipient(s): {0:?}")]
    NoEligibleDevices(Vec<String>),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Session state could not be persisted; the operation is aborted and no
    /// message is returned, since it would not be reproducible on the remote
    /// side.
    #[error("failed to commit session state: {0}")]
    StorageCommitFailed(#[source] StorageError),
}

impl<P> SessionManager<P> {
    /// Encrypts a plaintext for all active, trusted devices of the given
    /// recipients, plus the other devices of the own account.
    ///
    /// Per device, the backend used is the first entry of `backend_priority`
    /// (default: backend load order) that the device is active on and whose
    /// remote bundle is available, i.e. an existing session or a fetchable
    /// bundle; a bundle that cannot be fetched falls through to the next
    /// supported backend. Missing sessions are built transparently from
    /// downloaded bundles.
    ///
    /// Per-device problems (bundle downloads, key agreements) do not fail
    /// the operation, they are bucketed and returned next to the message.
    /// The returned message is *not* transmitted by the core; all session
    /// state it depends on is committed before it is handed out.
    pub async fn encrypt(
        &mut self,
        recipients: &[String],
        plaintext: &P,
        backend_priority: Option<&[String]>,
    ) -> Result<(EncryptedMessage, Vec<EncryptionFailure>), EncryptError> {
        let loaded = self.namespaces();
        let priority: Vec<String> = match backend_priority {
            Some(priority) => {
                for namespace in priority {
                    if !loaded.contains(namespace) {
                        return Err(EncryptError::UnknownNamespace(namespace.clone()));
                    }
                }
                priority.to_vec()
            }
            None => loaded,
        };

        debug!(
            recipients = ?recipients,
            priority = ?priority,
            "encrypting for recipients"
        );

        // The own account is an implicit recipient: other own devices must
        // be able to read the message too.
        let mut bare_jids: BTreeSet<String> = recipients.iter().cloned().collect();
        bare_jids.insert(self.own_bare_jid.clone());

        let mut failures: Vec<EncryptionFailure> = Vec::new();

        // Gather device information, downloading bundles along the way for
        // devices whose identity key is not known yet. Devices for which
        // that download fails are reported per device.
        let mut devices: Vec<DeviceInformation> = Vec::new();
        let mut bundle_cache: Vec<Bundle> = Vec::new();
        for bare_jid in &bare_jids {
            let known_ids = self.storage.load_device_list(bare_jid).await?;
            let (jid_devices, bundles) = self.device_information_with_bundles(bare_jid).await?;

            for device_id in &known_ids {
                if !jid_devices
                    .iter()
                    .any(|device| device.device_id == *device_id)
                {
                    failures.push(EncryptionFailure {
                        bare_jid: bare_jid.clone(),
                        device_id: *device_id,
                        namespace: None,
                        reason: EncryptFailureReason::BundleDownloadFailed(
                            "identity key unknown and no bundle could be downloaded".to_string(),
                        ),
                    });
                }
            }

            devices.extend(jid_devices);
            bundle_cache.extend(bundles);
        }

        // Determine the candidate backends per device, in priority order.
        // Inactive devices are simply not recipients; active devices no
        // loaded backend covers are reported.
        let mut targets: Vec<(DeviceInformation, Vec<String>)> = Vec::new();
        for device in devices {
            if device.bare_jid == self.own_bare_jid && device.device_id == self.own_device_id {
                continue;
            }

            let supported = device.supported_namespaces(&priority);
            if supported.is_empty() {
                if device.active.values().any(|active| *active) {
                    failures.push(EncryptionFailure {
                        bare_jid: device.bare_jid.clone(),
                        device_id: device.device_id,
                        namespace: None,
                        reason: EncryptFailureReason::NoEligibleBackend,
                    });
                }
                continue;
            }
            targets.push((device, supported));
        }

        // Trust gate: fail fast while any device is undecided, so the
        // application can resolve all decisions in bulk and retry. Devices
        // with distrusted identity keys are dropped silently.
        let mut undecided: Vec<DeviceInformation> = Vec::new();
        let mut eligible: Vec<(DeviceInformation, Vec<String>)> = Vec::new();
        for (device, supported) in targets {
            let level = self
                .trust_callback
                .evaluate(&device.bare_jid, &device.identity_key, &device.trust_level)
                .await?;
            match level {
                TrustLevel::Undecided => undecided.push(device),
                TrustLevel::Distrusted => {
                    debug!(
                        bare_jid = %device.bare_jid,
                        device_id = device.device_id,
                        "dropping distrusted device from the recipient set"
                    );
                }
                TrustLevel::Trusted => eligible.push((device, supported)),
            }
        }

        if !undecided.is_empty() {
            return Err(EncryptError::StillUndecided(undecided));
        }

        // Settle on one backend per device: the first supported namespace
        // with an existing session or a fetchable bundle. A bundle that
        // cannot be fetched falls through to the next supported backend and
        // only becomes the device's failure once every candidate is
        // exhausted. A failed key agreement, in contrast, is terminal for
        // the device in this operation; a later operation may retry against
        // a fresh bundle.
        let mut by_namespace: BTreeMap<String, Vec<(DeviceInformation, Session)>> = BTreeMap::new();
        'devices: for (device, supported) in eligible {
            let mut first_failure: Option<EncryptionFailure> = None;

            for namespace in supported {
                if let Some(session) = self
                    .storage
                    .load_session(&namespace, &device.bare_jid, device.device_id)
                    .await?
                {
                    by_namespace
                        .entry(namespace)
                        .or_default()
                        .push((device, session));
                    continue 'devices;
                }

                let bundle = match take_cached_bundle(&mut bundle_cache, &namespace, &device) {
                    Some(bundle) => bundle,
                    None => match self
                        .transport
                        .download_bundle(&namespace, &device.bare_jid, device.device_id)
                        .await
                    {
                        Ok(bundle) => bundle,
                        Err(err) => {
                            debug!(
                                namespace = %namespace,
                                bare_jid = %device.bare_jid,
                                device_id = device.device_id,
                                error = %err,
                                "bundle not fetchable, trying the next supported backend"
                            );
                            if first_failure.is_none() {
                                let reason = match err {
                                    TransportError::BundleNotFound => {
                                        EncryptFailureReason::BundleNotFound
                                    }
                                    other => EncryptFailureReason::BundleDownloadFailed(
                                        other.to_string(),
                                    ),
                                };
                                first_failure = Some(EncryptionFailure {
                                    bare_jid: device.bare_jid.clone(),
                                    device_id: device.device_id,
                                    namespace: Some(namespace.clone()),
                                    reason,
                                });
                            }
                            continue;
                        }
                    },
                };

                let Some(index) = self.backend_index(&namespace) else {
                    continue;
                };
                match self.backends[index]
                    .build_active_session(&device.bare_jid, device.device_id, &bundle)
                    .await
                {
                    Ok(session) => {
                        by_namespace
                            .entry(namespace)
                            .or_default()
                            .push((device, session));
                        continue 'devices;
                    }
                    Err(err) => {
                        warn!(
                            bare_jid = %device.bare_jid,
                            device_id = device.device_id,
                            error = %err,
                            "session building failed"
                        );
                        failures.push(EncryptionFailure {
                            bare_jid: device.bare_jid.clone(),
                            device_id: device.device_id,
                            namespace: Some(namespace.clone()),
                            reason: failure_reason(err),
                        });
                        continue 'devices;
                    }
                }
            }

            // Every supported backend was tried and none had a fetchable
            // bundle.
            if let Some(failure) = first_failure {
                failures.push(failure);
            }
        }

        // Encrypt per backend, serializing the plaintext once per namespace.
        // Sessions are only persisted once the whole fan-out is done.
        let mut message = EncryptedMessage::new(self.own_bare_jid.clone(), self.own_device_id);
        let mut pending_sessions: Vec<Session> = Vec::new();
        let mut reached_jids: BTreeSet<String> = BTreeSet::new();

        for i in 0..self.backends.len() {
            let namespace = self.backends[i].namespace().to_string();
            let Some(backend_devices) = by_namespace.remove(&namespace) else {
                continue;
            };

            let serialized = self.backends[i].serialize_plaintext(plaintext)?;

            for (device, mut session) in backend_devices {
                match self.backends[i].encrypt(&mut session, &serialized).await {
                    Ok(device_message) => {
                        message.insert(&namespace, device.device_id, device_message);
                        pending_sessions.push(session);
                        reached_jids.insert(device.bare_jid.clone());
                    }
                    Err(err) => {
                        warn!(
                            bare_jid = %device.bare_jid,
                            device_id = device.device_id,
                            error = %err,
                            "per-device encryption failed"
                        );
                        failures.push(EncryptionFailure {
                            bare_jid: device.bare_jid.clone(),
                            device_id: device.device_id,
                            namespace: Some(namespace.clone()),
                            reason: failure_reason(err),
                        });
                    }
                }
            }
        }

        // Recipients (other than the own account) that end up with zero
        // reachable devices fail the whole operation before anything is
        // committed.
        let lacking: Vec<String> = bare_jids
            .iter()
            .filter(|bare_jid| {
                bare_jid.as_str() != self.own_bare_jid && !reached_jids.contains(*bare_jid)
            })
            .cloned()
            .collect();
        if !lacking.is_empty() {
            return Err(EncryptError::NoEligibleDevices(lacking));
        }

        // Commit every mutated session, then hand out the message.
        for session in &pending_sessions {
            self.storage
                .store_session(session)
                .await
                .map_err(EncryptError::StorageCommitFailed)?;
        }

        debug!(
            devices = message.device_count(),
            failures = failures.len(),
            "message encrypted"
        );

        Ok((message, failures))
    }
}

fn failure_reason(err: BackendError) -> EncryptFailureReason {
    match err {
        BackendError::SessionBroken(reason) => EncryptFailureReason::SessionBroken(reason),
        other => EncryptFailureReason::KeyExchangeFailed(other.to_string()),
    }
}

fn take_cached_bundle(
    cache: &mut Vec<Bundle>,
    namespace: &str,
    device: &DeviceInformation,
) -> Option<Bundle> {
    let position = cache.iter().position(|bundle| {
        bundle.namespace() == namespace
            && bundle.bare_jid() == device.bare_jid
            && bundle.device_id() == device.device_id
    })?;
    Some(cache.remove(position))
}
