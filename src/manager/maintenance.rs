// SPDX-License-Identifier: MIT OR Apache-2.0

//! Own bundle lifecycle: signed pre key rotation, one-time pre key
//! replenishment and bundle publication with backoff.
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bundle::MAX_ONE_TIME_PRE_KEYS;
use crate::manager::{PUBLISH_BACKOFF_INITIAL, PublishState, SessionManager, current_timestamp};
use crate::traits::{BackendError, StorageError};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl<P> SessionManager<P> {
    /// Periodic upkeep of the own bundles. Idempotent; applications should
    /// call this regularly (once a minute is plenty).
    ///
    /// Covers, per backend:
    /// - signed pre key rotation once the rotation period elapsed, deferred
    ///   while catch-up is active,
    /// - dropping the pre-rotation signed pre key after it was retained for
    ///   one further period,
    /// - replenishing one-time pre keys to 100 when the supply reached the
    ///   refill threshold,
    /// - retrying pending bundle publications on their backoff schedule.
    pub async fn maintenance(&mut self) -> Result<(), MaintenanceError> {
        self.maintenance_at(current_timestamp()).await
    }

    /// [`maintenance`](Self::maintenance) against an explicit clock.
    pub async fn maintenance_at(&mut self, now: u64) -> Result<(), MaintenanceError> {
        for i in 0..self.backends.len() {
            let namespace = self.backends[i].namespace().to_string();
            let snapshot = self.backends[i].serialize_state()?;
            let mut changed = false;

            let rotated_at = self.backends[i].signed_pre_key_rotated_at();
            if now.saturating_sub(rotated_at) >= self.rotation_period {
                if self.catching_up() {
                    debug!(
                        namespace = %namespace,
                        "signed pre key rotation due but deferred, catch-up is active"
                    );
                } else {
                    info!(namespace = %namespace, "rotating signed pre key");
                    self.backends[i].rotate_signed_pre_key(now).await?;
                    changed = true;
                }
            }

            if self.backends[i].drop_expired_signed_pre_key(now, self.rotation_period) {
                debug!(namespace = %namespace, "dropped expired previous signed pre key");
                changed = true;
            }

            let visible = self.backends[i].visible_pre_key_count();
            if visible < MAX_ONE_TIME_PRE_KEYS && visible <= self.config.pre_key_refill_threshold {
                debug!(namespace = %namespace, visible, "replenishing one-time pre keys");
                self.backends[i]
                    .generate_pre_keys(MAX_ONE_TIME_PRE_KEYS - visible)
                    .await?;
                changed = true;
            }

            if changed {
                let state = self.backends[i].serialize_state()?;
                if let Err(err) = self.storage.store_backend_state(&namespace, state).await {
                    // Drop the un-persisted changes so memory and storage
                    // agree; the next maintenance run starts over.
                    self.restore_backend_state(i, &snapshot);
                    return Err(err.into());
                }
                self.mark_bundle_modified(&namespace, now);
            }
        }

        self.try_publish_pending(now).await;
        Ok(())
    }

    /// Namespaces whose bundle changed and still awaits a confirmed upload.
    pub fn pending_bundle_publications(&self) -> Vec<String> {
        self.publish.keys().cloned().collect()
    }

    /// Raises the modified bit for a backend's bundle. The next publication
    /// attempt happens immediately unless a backoff from an earlier failure
    /// is already in place.
    pub(crate) fn mark_bundle_modified(&mut self, namespace: &str, now: u64) {
        self.publish
            .entry(namespace.to_string())
            .or_insert(PublishState {
                retry_delay: PUBLISH_BACKOFF_INITIAL,
                next_attempt: now,
            });
    }

    /// Attempts every due bundle publication. A successful upload is the
    /// application's confirmation and clears the modified bit; failures
    /// double the retry delay, bounded by the rotation period.
    pub(crate) async fn try_publish_pending(&mut self, now: u64) {
        let due: Vec<String> = self
            .publish
            .iter()
            .filter(|(_, state)| state.next_attempt <= now)
            .map(|(namespace, _)| namespace.clone())
            .collect();

        for namespace in due {
            let Some(index) = self.backend_index(&namespace) else {
                continue;
            };

            let outcome = match self.backends[index].bundle(&self.own_bare_jid, self.own_device_id)
            {
                Ok(bundle) => self.transport.upload_bundle(&namespace, &bundle).await,
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "could not assemble bundle for publication");
                    Err(crate::traits::TransportError::BundleUploadFailed(
                        err.to_string(),
                    ))
                }
            };

            match outcome {
                Ok(()) => {
                    info!(namespace = %namespace, "bundle published");
                    self.publish.remove(&namespace);
                }
                Err(err) => {
                    let Some(state) = self.publish.get_mut(&namespace) else {
                        continue;
                    };
                    state.next_attempt = now + state.retry_delay;
                    state.retry_delay = (state.retry_delay * 2).min(self.rotation_period.max(1));
                    warn!(
                        namespace = %namespace,
                        error = %err,
                        retry_in = state.next_attempt - now,
                        "bundle publication failed, backing off"
                    );
                }
            }
        }
    }
}
