// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session manager: the single owner of all process-wide OMEMO state.
//!
//! One [`SessionManager`] composes any number of per-version backends into a
//! coherent whole: it owns the identity key they share, the device-list
//! caches, trust, the own bundle lifecycle and message dispatch. Multiple
//! instances must not share a storage namespace.
//!
//! All public operations are `async fn(&mut self, ...)`; the core is
//! single-threaded cooperative and suspends only at storage accesses,
//! application callbacks and backend primitives. Taking the manager by
//! unique reference serializes whole operations, which covers the
//! per-JID critical sections the consistency guarantees rely on.
//!
//! The manager starts in catch-up mode and stays there until
//! [`finish_catch_up`](SessionManager::finish_catch_up) is called: while
//! catching up, used one-time pre keys are retained (so replayed initial
//! messages still decrypt), signed pre key rotation is deferred and
//! staleness/handshake responses are queued instead of sent.
mod decrypt;
mod devices;
mod encrypt;
mod maintenance;
#[cfg(all(test, feature = "memory"))]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bundle::MAX_ONE_TIME_PRE_KEYS;
use crate::crypto::identity::{IdentityKey, IdentityKeyPair};
use crate::crypto::{Rng, RngError};
use crate::device::{DEVICE_ID_MAX, DEVICE_ID_MIN, DeviceId, DeviceInformation, DeviceRecord};
use crate::session::Session;
use crate::storage::facade::StorageFacade;
use crate::traits::{
    Backend, BackendError, Storage, StorageError, Transport, TransportError, TrustCallback,
};

pub use decrypt::DecryptError;
pub use devices::DeviceListError;
pub use encrypt::EncryptError;
pub use maintenance::MaintenanceError;

/// Receiving chain length at which a session counts as stale and an empty
/// message is due to forward the ratchet.
pub const STALENESS_MAGIC_NUMBER: u64 = 53;

/// Bounds for the sampled default signed pre key rotation period: 7 days.
const ROTATION_PERIOD_MIN: u64 = 7 * 24 * 60 * 60;

/// Upper bound for the sampled default rotation period: 30 days.
const ROTATION_PERIOD_MAX: u64 = 30 * 24 * 60 * 60;

/// Initial delay for bundle publication retries, in seconds.
const PUBLISH_BACKOFF_INITIAL: u64 = 1;

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH!")
        .as_secs()
}

/// How decryption treats messages from devices whose trust is still undecided.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum UndecidedDecryptPolicy {
    /// Decrypt and flag the result as
    /// [`from_undecided`](crate::message::DecryptedMessage::from_undecided).
    #[default]
    AllowFlagged,

    /// Fail with [`DecryptError::StillUndecided`].
    Reject,
}

/// Configuration supplied once at [`SessionManager::create`].
#[derive(Clone, Debug)]
pub struct SessionManagerConfig {
    /// Maximum number of skipped message keys kept per session.
    pub max_skipped_message_keys_per_session: u64,

    /// Maximum number of message keys a single message may skip. Defaults to
    /// the per-session maximum. Zero is only allowed when the per-session
    /// maximum is zero too.
    pub max_skipped_message_keys_per_message: Option<u64>,

    /// Signed pre key rotation period in seconds. Without an explicit value
    /// a period is sampled uniformly from 7 to 30 days at first creation and
    /// stored.
    pub signed_pre_key_rotation_period: Option<u64>,

    /// Remaining one-time pre keys at or below which the supply is refilled
    /// to 100. Allowed range 25 to 100; the default of 99 effectively
    /// replaces every used pre key right away.
    pub pre_key_refill_threshold: usize,

    /// Custom trust level assigned to newly encountered identity keys. The
    /// trust callback should evaluate it to undecided.
    pub default_trust_level: String,

    pub undecided_decrypt_policy: UndecidedDecryptPolicy,

    /// Label for this device, if any backend supports labels.
    pub own_device_label: Option<String>,
}

impl SessionManagerConfig {
    pub fn new(default_trust_level: impl Into<String>) -> Self {
        Self {
            max_skipped_message_keys_per_session: 1000,
            max_skipped_message_keys_per_message: None,
            signed_pre_key_rotation_period: None,
            pre_key_refill_threshold: 99,
            default_trust_level: default_trust_level.into(),
            undecided_decrypt_policy: UndecidedDecryptPolicy::default(),
            own_device_label: None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(25..=MAX_ONE_TIME_PRE_KEYS).contains(&self.pre_key_refill_threshold) {
            return Err(ConfigError::PreKeyRefillThresholdOutOfRange(
                self.pre_key_refill_threshold,
            ));
        }

        if let Some(per_message) = self.max_skipped_message_keys_per_message {
            if per_message == 0 && self.max_skipped_message_keys_per_session != 0 {
                return Err(ConfigError::SkippedKeysPerMessageZero);
            }
            if per_message > self.max_skipped_message_keys_per_session {
                return Err(ConfigError::SkippedKeysPerMessageExceedsSession {
                    per_message,
                    per_session: self.max_skipped_message_keys_per_session,
                });
            }
        }

        Ok(())
    }

    pub(crate) fn max_skipped_per_message(&self) -> u64 {
        self.max_skipped_message_keys_per_message
            .unwrap_or(self.max_skipped_message_keys_per_session)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("pre key refill threshold {0} outside the allowed range of 25 to 100")]
    PreKeyRefillThresholdOutOfRange(usize),

    #[error("max skipped message keys per message cannot be zero while the per-session limit is non-zero")]
    SkippedKeysPerMessageZero,

    #[error("max skipped message keys per message ({per_message}) exceeds the per-session limit ({per_session})")]
    SkippedKeysPerMessageExceedsSession { per_message: u64, per_session: u64 },
}

/// Outcome details of [`SessionManager::create`].
#[derive(Clone, Debug, Default)]
pub struct CreateReport {
    /// Whether this was the first run against the given storage.
    pub first_run: bool,

    /// Whether a historical identity key had to be regenerated because a
    /// loaded backend required the Ed25519 seed form. Regeneration resets
    /// all trust decisions for the own account.
    pub identity_key_regenerated: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CatchUpState {
    Active,
    Inactive,
}

/// Backoff schedule of one backend's pending bundle publication. An entry
/// in the publish map is the raised modified bit; a confirmed upload
/// removes it.
#[derive(Clone, Debug)]
struct PublishState {
    retry_delay: u64,
    next_attempt: u64,
}

/// The core of the library. See the [module documentation](self) for an
/// overview.
pub struct SessionManager<P> {
    backends: Vec<Box<dyn Backend<P>>>,
    storage: StorageFacade,
    transport: Box<dyn Transport>,
    trust_callback: Box<dyn TrustCallback>,
    own_bare_jid: String,
    own_device_id: DeviceId,
    config: SessionManagerConfig,
    rotation_period: u64,
    catch_up: CatchUpState,
    publish: BTreeMap<String, PublishState>,
}

impl<P> SessionManager<P> {
    /// Loads or creates all OMEMO state: the identity key shared by all
    /// backends, a collision-free device id, the backends' own bundles and
    /// the own device list entries.
    ///
    /// Backends are initialised one after the other and every step persists
    /// before the next begins, so a failed creation can simply be retried.
    /// Newly added backends get their bundle published and the own device
    /// list refreshed; namespaces that were active before but are no longer
    /// loaded are marked inactive on the own device record.
    ///
    /// The manager starts in catch-up mode; call
    /// [`finish_catch_up`](Self::finish_catch_up) once any history
    /// synchronization is done.
    pub async fn create(
        backends: Vec<Box<dyn Backend<P>>>,
        storage: Box<dyn Storage>,
        transport: Box<dyn Transport>,
        trust_callback: Box<dyn TrustCallback>,
        own_bare_jid: impl Into<String>,
        config: SessionManagerConfig,
    ) -> Result<(Self, CreateReport), CreateError> {
        let own_bare_jid = own_bare_jid.into();
        config.validate()?;

        let mut seen = BTreeSet::new();
        for backend in &backends {
            if !seen.insert(backend.namespace().to_string()) {
                return Err(CreateError::DuplicateNamespace(
                    backend.namespace().to_string(),
                ));
            }
        }

        debug!(
            bare_jid = %own_bare_jid,
            namespaces = ?seen,
            "preparing session manager"
        );

        let mut storage = StorageFacade::new(storage);
        let rng = Rng::default();
        let now = current_timestamp();
        let mut report = CreateReport::default();

        // Identity key: load, or generate on first boot. A stored
        // Curve25519-only key meeting a backend that requires the Ed25519
        // seed is regenerated, which resets the own account's trust.
        let identity = match storage.load_identity_key_pair().await? {
            Some(pair) => {
                let incompatible = backends
                    .iter()
                    .any(|backend| !pair.supports(backend.identity_key_format()));
                if incompatible {
                    warn!(
                        "stored identity key cannot serve all loaded backends, regenerating; \
                         all trust decisions for the own account are reset"
                    );
                    let fresh = IdentityKeyPair::generate(&rng)?;
                    storage.store_identity_key_pair(&fresh).await?;
                    storage.delete_trust(&own_bare_jid).await?;
                    report.identity_key_regenerated = true;
                    fresh
                } else {
                    pair
                }
            }
            None => {
                info!("generating identity key");
                let fresh = IdentityKeyPair::generate(&rng)?;
                storage.store_identity_key_pair(&fresh).await?;
                fresh
            }
        };

        // Own device id: load, or draw a fresh 31-bit id avoiding every id
        // currently advertised for this account on any loaded backend.
        let own_device_id = match storage.load_own_device_id().await? {
            Some(device_id) => device_id,
            None => {
                info!("first run");
                report.first_run = true;

                let mut taken = BTreeSet::new();
                for backend in &backends {
                    let list = transport
                        .download_device_list(backend.namespace(), &own_bare_jid)
                        .await?;
                    taken.extend(list.into_iter().map(|(device_id, _)| device_id));
                }

                let device_id = loop {
                    let raw = u32::from_le_bytes(rng.random_array()?);
                    let candidate = DEVICE_ID_MIN + raw % (DEVICE_ID_MAX - DEVICE_ID_MIN + 1);
                    if !taken.contains(&candidate) {
                        break candidate;
                    }
                };
                debug!(device_id, "generated own device id");

                let record = DeviceRecord {
                    namespaces: seen.clone(),
                    active: seen.iter().map(|ns| (ns.clone(), true)).collect(),
                    label: config.own_device_label.clone(),
                    identity_key: Some(identity.identity_key()),
                };
                storage
                    .store_device_record(&own_bare_jid, device_id, &record)
                    .await?;
                storage
                    .store_device_list(&own_bare_jid, &BTreeSet::from([device_id]))
                    .await?;
                // The trust level of the own identity key is never checked,
                // but a value keeps the storage access paths uniform.
                storage
                    .store_trust(
                        &own_bare_jid,
                        &identity.identity_key(),
                        &config.default_trust_level,
                    )
                    .await?;
                storage.store_own_device_id(device_id).await?;

                device_id
            }
        };

        // Reconcile the own device record with the loaded backend set.
        if !report.first_run {
            if let Some(mut record) = storage
                .load_device_record(&own_bare_jid, own_device_id)
                .await?
            {
                let mut changed = false;
                for namespace in &seen {
                    changed |= record.observe(namespace, true, None);
                }
                for namespace in record.namespaces.clone() {
                    if !seen.contains(&namespace) {
                        info!(namespace = %namespace, "backend no longer loaded, marking own device inactive");
                        changed |= record.observe(&namespace, false, None);
                    }
                }
                if report.identity_key_regenerated {
                    record.identity_key = Some(identity.identity_key());
                    storage
                        .store_trust(
                            &own_bare_jid,
                            &identity.identity_key(),
                            &config.default_trust_level,
                        )
                        .await?;
                    changed = true;
                }
                if changed {
                    storage
                        .store_device_record(&own_bare_jid, own_device_id, &record)
                        .await?;
                }
            }
        }

        // Rotation period: explicit configuration wins, otherwise the
        // period sampled and stored at first creation.
        let rotation_period = match config.signed_pre_key_rotation_period {
            Some(period) => period,
            None => match storage.load_rotation_period().await? {
                Some(period) => period,
                None => {
                    let period = rng.random_range(ROTATION_PERIOD_MIN, ROTATION_PERIOD_MAX)?;
                    storage.store_rotation_period(period).await?;
                    period
                }
            },
        };

        // Initialise the backends. Fresh backends (first run or newly
        // added) get a full set of one-time pre keys and a bundle
        // publication; every backend's state is persisted before the next
        // one is touched.
        let mut backends = backends;
        let mut fresh_namespaces = Vec::new();
        for backend in backends.iter_mut() {
            let namespace = backend.namespace().to_string();
            let state = storage.load_backend_state(&namespace).await?;
            let fresh = state.is_none();

            backend
                .load_or_create(&identity, state.as_deref(), now)
                .await?;

            if fresh {
                backend.generate_pre_keys(MAX_ONE_TIME_PRE_KEYS).await?;
                fresh_namespaces.push(namespace.clone());
            }

            let state = backend.serialize_state()?;
            storage.store_backend_state(&namespace, state).await?;
        }

        let mut manager = Self {
            backends,
            storage,
            transport,
            trust_callback,
            own_bare_jid: own_bare_jid.clone(),
            own_device_id,
            config,
            rotation_period,
            catch_up: CatchUpState::Active,
            publish: BTreeMap::new(),
        };

        // Publish the bundles of fresh backends and announce this device on
        // their device lists. Publication failures go into the backoff
        // schedule and are retried by maintenance.
        for namespace in &fresh_namespaces {
            manager.mark_bundle_modified(namespace, now);
        }
        manager.try_publish_pending(now).await;
        for namespace in fresh_namespaces {
            manager.refresh_device_list(&namespace, &own_bare_jid).await?;
        }

        info!("session manager prepared, starting in catch-up mode");

        Ok((manager, report))
    }

    /// The own bare JID this manager was created for.
    pub fn own_bare_jid(&self) -> &str {
        &self.own_bare_jid
    }

    /// The device id generated for this installation.
    pub fn own_device_id(&self) -> DeviceId {
        self.own_device_id
    }

    /// Namespaces of all loaded backends, in priority order.
    pub fn namespaces(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|backend| backend.namespace().to_string())
            .collect()
    }

    pub(crate) fn backend_index(&self, namespace: &str) -> Option<usize> {
        self.backends
            .iter()
            .position(|backend| backend.namespace() == namespace)
    }

    /// Whether the manager is currently in catch-up mode.
    pub fn catching_up(&self) -> bool {
        self.catch_up == CatchUpState::Active
    }

    /// Enters catch-up mode: used one-time pre keys are retained, signed
    /// pre key rotation is deferred and staleness/handshake responses are
    /// queued. Call before replaying history, e.g. from a MAM archive.
    /// The manager already starts in this mode after [`create`](Self::create).
    pub fn start_catch_up(&mut self) {
        info!("entering catch-up mode");
        self.catch_up = CatchUpState::Active;
    }

    /// Leaves catch-up mode: purges the one-time pre keys that were only
    /// retained for replays, runs the deferred signed pre key rotation and
    /// sends the queued empty messages, at most one per session.
    pub async fn finish_catch_up(&mut self) -> Result<(), CatchUpError> {
        self.finish_catch_up_at(current_timestamp()).await
    }

    /// [`finish_catch_up`](Self::finish_catch_up) against an explicit clock.
    pub async fn finish_catch_up_at(&mut self, now: u64) -> Result<(), CatchUpError> {
        info!("leaving catch-up mode");
        self.catch_up = CatchUpState::Inactive;

        // Used pre keys that were retained for replay tolerance are gone now.
        for i in 0..self.backends.len() {
            let namespace = self.backends[i].namespace().to_string();
            self.backends[i].delete_hidden_pre_keys();
            let state = self.backends[i].serialize_state()?;
            self.storage.store_backend_state(&namespace, state).await?;
        }

        // Process the deferred signed pre key rotation.
        self.maintenance_at(now).await?;

        // Flush queued staleness and handshake responses.
        let namespaces = self.namespaces();
        for namespace in namespaces {
            let queue = self.storage.load_queue(&namespace).await?;
            if queue.is_empty() {
                continue;
            }

            let Some(index) = self.backend_index(&namespace) else {
                continue;
            };

            let mut remaining: BTreeMap<String, BTreeSet<DeviceId>> = BTreeMap::new();
            for (bare_jid, device_ids) in queue {
                for device_id in device_ids {
                    let session = self
                        .storage
                        .load_session(&namespace, &bare_jid, device_id)
                        .await?;
                    match session {
                        None => {
                            // The session may have been purged after the
                            // response was queued.
                            warn!(
                                bare_jid = %bare_jid,
                                device_id,
                                "dropping queued empty message, session no longer exists"
                            );
                        }
                        Some(mut session) => {
                            if let Err(err) =
                                self.send_session_empty_message(index, &mut session).await
                            {
                                warn!(
                                    bare_jid = %bare_jid,
                                    device_id,
                                    error = %err,
                                    "queued empty message could not be sent, keeping it queued"
                                );
                                remaining
                                    .entry(bare_jid.clone())
                                    .or_default()
                                    .insert(device_id);
                            }
                        }
                    }
                }
            }

            if remaining.is_empty() {
                self.storage.delete_queue(&namespace).await?;
            } else {
                self.storage.store_queue(&namespace, &remaining).await?;
            }
        }

        debug!("catch-up mode exited");
        Ok(())
    }

    /// Encrypts an empty message over the given session and hands it to the
    /// application for sending. Empty messages bypass trust.
    pub(crate) async fn send_session_empty_message(
        &mut self,
        backend_index: usize,
        session: &mut Session,
    ) -> Result<(), EmptySendError> {
        let namespace = session.namespace().to_string();
        let bare_jid = session.bare_jid().to_string();
        let device_id = session.device_id();

        debug!(
            namespace = %namespace,
            bare_jid = %bare_jid,
            device_id,
            "sending empty message"
        );

        let message = self.backends[backend_index].encrypt(session, &[]).await?;
        self.transport
            .send_empty_message(&namespace, &bare_jid, device_id, &message)
            .await?;
        self.storage.store_session(session).await?;

        Ok(())
    }

    /// Restores a backend to a previously serialized state after a failed
    /// persistence attempt, so in-memory and committed state agree again.
    pub(crate) fn restore_backend_state(&mut self, backend_index: usize, snapshot: &[u8]) {
        if let Err(err) = self.backends[backend_index].restore_state(snapshot) {
            warn!(error = %err, "failed to restore backend state");
        }
    }

    /// Sets the custom trust level for an identity key, overwriting any
    /// previous level.
    pub async fn set_trust(
        &mut self,
        bare_jid: &str,
        identity_key: &IdentityKey,
        trust_level: &str,
    ) -> Result<(), StorageError> {
        debug!(
            bare_jid = %bare_jid,
            identity_key = %identity_key,
            trust_level,
            "setting trust level"
        );
        self.storage
            .store_trust(bare_jid, identity_key, trust_level)
            .await
    }

    /// Deletes all data corresponding to an account: device records and
    /// list, trust entries and sessions across all loaded backends. The
    /// identity key is untouched.
    pub async fn purge_bare_jid(&mut self, bare_jid: &str) -> Result<(), StorageError> {
        warn!(bare_jid = %bare_jid, "purging bare JID");
        let namespaces = self.namespaces();
        self.storage.purge_bare_jid(bare_jid, &namespaces).await
    }

    /// Sending chain lengths of all sessions with a device, per namespace.
    /// `None` means no session exists for that backend. Useful for external
    /// staleness introspection.
    pub async fn get_sending_chain_length(
        &self,
        device: &DeviceInformation,
    ) -> Result<BTreeMap<String, Option<u64>>, StorageError> {
        let mut lengths = BTreeMap::new();
        for backend in &self.backends {
            let namespace = backend.namespace();
            if !device.namespaces.contains(namespace) {
                continue;
            }
            let session = self
                .storage
                .load_session(namespace, &device.bare_jid, device.device_id)
                .await?;
            lengths.insert(
                namespace.to_string(),
                session.map(|session| session.sending_chain_length()),
            );
        }
        Ok(lengths)
    }
}

#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("multiple backends handle the namespace {0}")]
    DuplicateNamespace(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

impl From<DeviceListError> for CreateError {
    fn from(err: DeviceListError) -> Self {
        match err {
            DeviceListError::Storage(err) => CreateError::Storage(err),
            DeviceListError::Transport(err) => CreateError::Transport(err),
            DeviceListError::UnknownNamespace(namespace) => {
                // Refreshes during create only target loaded namespaces.
                CreateError::DuplicateNamespace(namespace)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CatchUpError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<MaintenanceError> for CatchUpError {
    fn from(err: MaintenanceError) -> Self {
        match err {
            MaintenanceError::Storage(err) => CatchUpError::Storage(err),
            MaintenanceError::Backend(err) => CatchUpError::Backend(err),
        }
    }
}

/// Failure while producing or delivering an empty message.
#[derive(Debug, Error)]
pub(crate) enum EmptySendError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

