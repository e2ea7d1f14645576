// SPDX-License-Identifier: MIT OR Apache-2.0

use async_trait::async_trait;
use thiserror::Error;

use crate::bundle::Bundle;
use crate::crypto::identity::IdentityKey;
use crate::device::DeviceId;
use crate::message::DeviceMessage;
use crate::trust::{TrustError, TrustLevel};

/// Application callbacks for everything that crosses the network: PEP node
/// access for device lists and bundles, and sending of the empty messages
/// used for handshake completion and staleness prevention.
///
/// The core performs no retries through this interface except the bundle
/// publication backoff. Callbacks may impose their own timeouts; a timeout
/// surfaces as the respective error and is handled like any other failure of
/// that callback.
#[async_trait]
pub trait Transport: Send {
    /// Downloads the device list of an account for one backend namespace.
    async fn download_device_list(
        &self,
        namespace: &str,
        bare_jid: &str,
    ) -> Result<Vec<(DeviceId, Option<String>)>, TransportError>;

    /// Uploads the device list for this account, overwriting the published one.
    async fn upload_device_list(
        &self,
        namespace: &str,
        bare_jid: &str,
        device_list: &[(DeviceId, Option<String>)],
    ) -> Result<(), TransportError>;

    /// Downloads the bundle of a specific device.
    ///
    /// Must distinguish [`TransportError::BundleNotFound`] (the node exists
    /// but holds no bundle, or does not exist) from download failures.
    async fn download_bundle(
        &self,
        namespace: &str,
        bare_jid: &str,
        device_id: DeviceId,
    ) -> Result<Bundle, TransportError>;

    /// Uploads this device's bundle, overwriting any previously published data.
    async fn upload_bundle(&self, namespace: &str, bundle: &Bundle) -> Result<(), TransportError>;

    /// Sends an empty OMEMO message carrying nothing but key material.
    async fn send_empty_message(
        &self,
        namespace: &str,
        bare_jid: &str,
        device_id: DeviceId,
        message: &DeviceMessage,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device list download failed: {0}")]
    DeviceListDownloadFailed(String),

    #[error("device list upload failed: {0}")]
    DeviceListUploadFailed(String),

    #[error("bundle download failed: {0}")]
    BundleDownloadFailed(String),

    #[error("no bundle published for this device")]
    BundleNotFound,

    #[error("bundle upload failed: {0}")]
    BundleUploadFailed(String),

    #[error("message sending failed: {0}")]
    MessageSendingFailed(String),
}

/// Translation of application-defined trust levels to the three core levels.
///
/// The core stores custom trust levels as opaque strings and consults this
/// callback whenever encryption or decryption needs a decision.
#[async_trait]
pub trait TrustCallback: Send {
    async fn evaluate(
        &self,
        bare_jid: &str,
        identity_key: &IdentityKey,
        custom_level: &str,
    ) -> Result<TrustLevel, TrustError>;
}
