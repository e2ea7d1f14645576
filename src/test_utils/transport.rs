// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::bundle::Bundle;
use crate::device::DeviceId;
use crate::message::DeviceMessage;
use crate::traits::{Transport, TransportError};

/// In-memory stand-in for the PEP nodes and message routing, shared between
/// any number of session managers via [`Clone`].
#[derive(Clone, Default)]
pub struct TestTransport {
    pep: Arc<Mutex<TestPep>>,
}

/// The observable state behind a [`TestTransport`].
#[derive(Default)]
pub struct TestPep {
    /// Published device lists, keyed by `(namespace, bare JID)`.
    pub device_lists: BTreeMap<(String, String), Vec<(DeviceId, Option<String>)>>,

    /// Published bundles, keyed by `(namespace, bare JID, device id)`.
    pub bundles: BTreeMap<(String, String, DeviceId), Bundle>,

    /// Every empty message handed to the transport, in sending order.
    pub empty_messages: Vec<(String, String, DeviceId, DeviceMessage)>,

    /// Devices whose bundle downloads fail with an injected error.
    pub failing_bundle_downloads: BTreeSet<(String, String, DeviceId)>,

    /// Namespaces whose bundle uploads fail with an injected error.
    pub failing_bundle_uploads: BTreeSet<String>,

    pub bundle_downloads: usize,
    pub bundle_uploads: usize,
    pub device_list_uploads: usize,
}

impl TestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to the shared state, for assertions and fault injection.
    pub fn pep(&self) -> MutexGuard<'_, TestPep> {
        self.pep.lock().expect("test pep lock is not poisoned")
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn download_device_list(
        &self,
        namespace: &str,
        bare_jid: &str,
    ) -> Result<Vec<(DeviceId, Option<String>)>, TransportError> {
        Ok(self
            .pep()
            .device_lists
            .get(&(namespace.to_string(), bare_jid.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn upload_device_list(
        &self,
        namespace: &str,
        bare_jid: &str,
        device_list: &[(DeviceId, Option<String>)],
    ) -> Result<(), TransportError> {
        let mut pep = self.pep();
        pep.device_list_uploads += 1;
        pep.device_lists.insert(
            (namespace.to_string(), bare_jid.to_string()),
            device_list.to_vec(),
        );
        Ok(())
    }

    async fn download_bundle(
        &self,
        namespace: &str,
        bare_jid: &str,
        device_id: DeviceId,
    ) -> Result<Bundle, TransportError> {
        let key = (namespace.to_string(), bare_jid.to_string(), device_id);
        let mut pep = self.pep();
        pep.bundle_downloads += 1;
        if pep.failing_bundle_downloads.contains(&key) {
            return Err(TransportError::BundleDownloadFailed(
                "injected failure".to_string(),
            ));
        }
        pep.bundles
            .get(&key)
            .cloned()
            .ok_or(TransportError::BundleNotFound)
    }

    async fn upload_bundle(&self, namespace: &str, bundle: &Bundle) -> Result<(), TransportError> {
        let mut pep = self.pep();
        if pep.failing_bundle_uploads.contains(namespace) {
            return Err(TransportError::BundleUploadFailed(
                "injected failure".to_string(),
            ));
        }
        pep.bundle_uploads += 1;
        pep.bundles.insert(
            (
                namespace.to_string(),
                bundle.bare_jid().to_string(),
                bundle.device_id(),
            ),
            bundle.clone(),
        );
        Ok(())
    }

    async fn send_empty_message(
        &self,
        namespace: &str,
        bare_jid: &str,
        device_id: DeviceId,
        message: &DeviceMessage,
    ) -> Result<(), TransportError> {
        self.pep().empty_messages.push((
            namespace.to_string(),
            bare_jid.to_string(),
            device_id,
            message.clone(),
        ));
        Ok(())
    }
}
