// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decryption routing: sender resolution, trust gating, passive session
//! building with replay tolerance, pre key management and the automated
//! staleness/handshake responses.
use thiserror::Error;
use tracing::{debug, warn};

use crate::bundle::MAX_ONE_TIME_PRE_KEYS;
use crate::device::DeviceId;
use crate::manager::{
    STALENESS_MAGIC_NUMBER, SessionManager, UndecidedDecryptPolicy, current_timestamp,
};
use crate::message::{DecryptedMessage, IncomingMessage};
use crate::session::{Initiation, Session};
use crate::traits::{BackendError, StorageError, TransportError};
use crate::trust::{TrustError, TrustLevel};

use super::DeviceListError;

#[derive(Debug, Error)]
pub enum DecryptError {
    /// The backend handling the message's namespace is not loaded.
    #[error("the backend handling the namespace {0} is not currently loaded")]
    UnknownNamespace(String),

    /// No public information about the sending device could be found, even
    /// after refreshing the sender's device list.
    #[error("unknown sending device {device_id} of {bare_jid}")]
    SenderNotFound { bare_jid: String, device_id: DeviceId },

    /// The sender's identity key is explicitly distrusted.
    #[error("the identity key of sending device {device_id} of {bare_jid} is distrusted")]
    SenderDistrusted { bare_jid: String, device_id: DeviceId },

    /// The sender's trust is undecided and the configured policy rejects
    /// decryption from undecided devices.
    #[error("the trust of sending device {device_id} of {bare_jid} is still undecided")]
    StillUndecided { bare_jid: String, device_id: DeviceId },

    /// No session exists with the sending device and the message carries no
    /// key exchange to build one.
    #[error("no session with the sending device and no key exchange included")]
    NoSession,

    /// The message repeats a key exchange whose one-time pre key is gone.
    /// Suppressed during catch-up (the pre key is retained there); fatal
    /// otherwise.
    #[error("repeated pre-key message, the one-time pre key was already consumed")]
    DuplicatedPreKeyMessage,

    /// Public data of the sender contradicts itself, e.g. the key exchange
    /// carries a different identity key than the sender's bundle.
    #[error("inconsistent public data for the sending device: {0}")]
    PublicDataInconsistency(String),

    #[error(transparent)]
    Backend(BackendError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Post-decryption session state could not be persisted. The plaintext
    /// is withheld: this is the only acceptable way a forward-secret
    /// message is lost, since returning it would leave no committed record
    /// of the consumed message key.
    #[error("failed to commit session state after decryption: {0}")]
    StorageCommitFailed(#[source] StorageError),
}

impl From<BackendError> for DecryptError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NoSession => DecryptError::NoSession,
            BackendError::DuplicatedPreKeyMessage => DecryptError::DuplicatedPreKeyMessage,
            other => DecryptError::Backend(other),
        }
    }
}

impl From<DeviceListError> for DecryptError {
    fn from(err: DeviceListError) -> Self {
        match err {
            DeviceListError::Storage(err) => DecryptError::Storage(err),
            DeviceListError::Transport(err) => DecryptError::Transport(err),
            DeviceListError::UnknownNamespace(namespace) => {
                DecryptError::UnknownNamespace(namespace)
            }
        }
    }
}

impl<P> SessionManager<P> {
    /// Decrypts one incoming message addressed to this device.
    ///
    /// Pre-key messages transparently build a passive session; repeats of
    /// the same initial message are tolerated during catch-up. Successful
    /// decryption may trigger automated empty messages (handshake
    /// completion, staleness prevention), which are queued while catch-up
    /// is active.
    ///
    /// The plaintext is only returned once the advanced session state has
    /// been committed to storage.
    pub async fn decrypt(
        &mut self,
        message: &IncomingMessage,
    ) -> Result<DecryptedMessage<P>, DecryptError> {
        let namespace = message.namespace.clone();
        let index = self
            .backend_index(&namespace)
            .ok_or_else(|| DecryptError::UnknownNamespace(namespace.clone()))?;

        debug!(
            namespace = %namespace,
            bare_jid = %message.bare_jid,
            device_id = message.device_id,
            pre_key = message.header.key_exchange().is_some(),
            "decrypting message"
        );

        // Resolve the sending device, refreshing the device list once if it
        // is not cached. PEP subscriptions should make this unnecessary, but
        // races happen.
        let mut device = self
            .get_device_information(&message.bare_jid)
            .await?
            .into_iter()
            .find(|device| device.device_id == message.device_id);
        if device.is_none() {
            warn!("sending device not cached, refreshing its device list");
            self.refresh_device_list(&namespace, &message.bare_jid)
                .await?;
            device = self
                .get_device_information(&message.bare_jid)
                .await?
                .into_iter()
                .find(|device| device.device_id == message.device_id);
        }
        let device = device.ok_or_else(|| DecryptError::SenderNotFound {
            bare_jid: message.bare_jid.clone(),
            device_id: message.device_id,
        })?;

        // Trust gate. Explicit distrust always fails; undecided follows the
        // configured policy.
        let mut from_undecided = false;
        match self
            .trust_callback
            .evaluate(&device.bare_jid, &device.identity_key, &device.trust_level)
            .await?
        {
            TrustLevel::Distrusted => {
                return Err(DecryptError::SenderDistrusted {
                    bare_jid: message.bare_jid.clone(),
                    device_id: message.device_id,
                });
            }
            TrustLevel::Undecided => match self.config.undecided_decrypt_policy {
                UndecidedDecryptPolicy::Reject => {
                    return Err(DecryptError::StillUndecided {
                        bare_jid: message.bare_jid.clone(),
                        device_id: message.device_id,
                    });
                }
                UndecidedDecryptPolicy::AllowFlagged => from_undecided = true,
            },
            TrustLevel::Trusted => {}
        }

        // Session handling: passive building for pre-key messages, plain
        // ratchet decryption otherwise.
        let was_key_exchange = message.header.key_exchange().is_some();
        let (mut session, serialized) = match message.header.key_exchange() {
            Some(key_exchange) => {
                if key_exchange.identity_key != device.identity_key {
                    return Err(DecryptError::PublicDataInconsistency(
                        "the identity key of the key exchange does not match the identity key \
                         known for the sending device"
                            .to_string(),
                    ));
                }

                let existing = self
                    .storage
                    .load_session(&namespace, &message.bare_jid, message.device_id)
                    .await?;

                let replays_existing = existing.as_ref().is_some_and(|session| {
                    session.initiation() == Initiation::Passive
                        && session
                            .key_exchange()
                            .is_some_and(|known| known.builds_same_session(key_exchange))
                });

                if replays_existing {
                    // A historical copy of the initial message. The one-time
                    // pre key is still around during catch-up, so the same
                    // session can be rebuilt and the embedded message
                    // decrypted again without touching the stored state.
                    debug!("pre-key message replays the stored session");
                    let (_, serialized) = self.backends[index]
                        .build_passive_session(
                            &message.bare_jid,
                            message.device_id,
                            key_exchange,
                            &message.header,
                            &message.ciphertext,
                        )
                        .await?;

                    let plaintext = if serialized.is_empty() {
                        None
                    } else {
                        Some(
                            self.backends[index]
                                .deserialize_plaintext(&serialized)
                                .map_err(DecryptError::Backend)?,
                        )
                    };
                    return Ok(DecryptedMessage {
                        plaintext,
                        device,
                        from_undecided,
                    });
                }

                if existing.is_some() {
                    warn!("key exchange replaces the existing session");
                }

                self.backends[index]
                    .build_passive_session(
                        &message.bare_jid,
                        message.device_id,
                        key_exchange,
                        &message.header,
                        &message.ciphertext,
                    )
                    .await?
            }
            None => {
                let mut session = self
                    .storage
                    .load_session(&namespace, &message.bare_jid, message.device_id)
                    .await?
                    .ok_or(DecryptError::NoSession)?;

                let serialized = self.backends[index]
                    .decrypt(
                        &mut session,
                        &message.header,
                        &message.ciphertext,
                        self.config.max_skipped_message_keys_per_session,
                        self.config.max_skipped_per_message(),
                    )
                    .await?;

                // The peer demonstrably completed the handshake.
                if session.initiation() == Initiation::Active && !session.confirmed() {
                    debug!("actively built session confirmed by the peer");
                    session.confirm();
                }

                (session, serialized)
            }
        };

        let plaintext = if serialized.is_empty() {
            None
        } else {
            Some(
                self.backends[index]
                    .deserialize_plaintext(&serialized)
                    .map_err(DecryptError::Backend)?,
            )
        };

        // Commit the advanced ratchet state before anything leaves this
        // function. Never hand out a plaintext whose message key consumption
        // is not durable.
        self.storage
            .store_session(&session)
            .await
            .map_err(DecryptError::StorageCommitFailed)?;

        // Pre key bookkeeping: during catch-up the used pre key is only
        // hidden from the bundle so historical replays keep decrypting;
        // otherwise it is deleted for good. Either way the bundle changed
        // and is due for republication, refilling the supply first if the
        // threshold is reached.
        //
        // The session commit above is the point of no return for this
        // message. Bookkeeping failures are rolled back in memory, logged
        // and repaired by later operations; they never discard a plaintext
        // whose ratchet movement is already durable.
        if was_key_exchange {
            if let Err(err) = self.pre_key_bookkeeping(index, &namespace, &session).await {
                warn!(
                    error = %err,
                    "pre key bookkeeping after decryption failed, bundle left unchanged"
                );
            }
        }

        // Handshake completion and staleness prevention: answer with an
        // empty message, deferred to the end of catch-up while it is active.
        let response_due =
            was_key_exchange || session.receiving_chain_length() >= STALENESS_MAGIC_NUMBER;
        if response_due {
            if self.catching_up() {
                self.queue_empty_message(&namespace, &session).await?;
            } else if let Err(err) = self.send_session_empty_message(index, &mut session).await {
                warn!(
                    error = %err,
                    "empty message could not be sent, queueing it for the next catch-up end"
                );
                self.queue_empty_message(&namespace, &session).await?;
            }
        }

        debug!("post-decryption tasks completed");

        Ok(DecryptedMessage {
            plaintext,
            device,
            from_undecided,
        })
    }

    /// Hides or deletes the one-time pre key consumed by a passively built
    /// session, refills the supply and schedules the bundle republication.
    /// When persistence fails the in-memory backend state is rolled back to
    /// the snapshot so the next operation starts from the committed state.
    async fn pre_key_bookkeeping(
        &mut self,
        index: usize,
        namespace: &str,
        session: &Session,
    ) -> Result<(), BookkeepingError> {
        let snapshot = self.backends[index].serialize_state()?;

        let changed = if self.catching_up() {
            debug!("hiding used one-time pre key");
            self.backends[index].hide_pre_key(session)
        } else {
            debug!("deleting used one-time pre key");
            self.backends[index].delete_pre_key(session)
        };
        if !changed {
            return Ok(());
        }

        let visible = self.backends[index].visible_pre_key_count();
        if visible < MAX_ONE_TIME_PRE_KEYS && visible <= self.config.pre_key_refill_threshold {
            debug!(visible, "replenishing one-time pre keys");
            if let Err(err) = self.backends[index]
                .generate_pre_keys(MAX_ONE_TIME_PRE_KEYS - visible)
                .await
            {
                self.restore_backend_state(index, &snapshot);
                return Err(err.into());
            }
        }

        let state = match self.backends[index].serialize_state() {
            Ok(state) => state,
            Err(err) => {
                self.restore_backend_state(index, &snapshot);
                return Err(err.into());
            }
        };
        if let Err(err) = self.storage.store_backend_state(namespace, state).await {
            self.restore_backend_state(index, &snapshot);
            return Err(err.into());
        }

        let now = current_timestamp();
        self.mark_bundle_modified(namespace, now);
        self.try_publish_pending(now).await;

        Ok(())
    }

    async fn queue_empty_message(
        &mut self,
        namespace: &str,
        session: &Session,
    ) -> Result<(), StorageError> {
        let mut queue = self.storage.load_queue(namespace).await?;
        queue
            .entry(session.bare_jid().to_string())
            .or_default()
            .insert(session.device_id());
        self.storage.store_queue(namespace, &queue).await
    }
}

/// Failure of the post-decryption bundle bookkeeping. Never fails the
/// decryption that triggered it.
#[derive(Debug, Error)]
enum BookkeepingError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
