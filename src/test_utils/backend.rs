// SPDX-License-Identifier: MIT OR Apache-2.0

//! A complete, deterministic [`Backend`] implementation.
//!
//! `ChainBackend` does real X3DH session establishment against bundles
//! (X25519 agreements, XEdDSA-signed pre keys) and encrypts with
//! HKDF-SHA256 symmetric chains and ChaCha20-Poly1305, so two session
//! managers wired through a [`TestTransport`](crate::test_utils::TestTransport)
//! genuinely interoperate. What it deliberately lacks compared to a
//! production backend is a DH ratchet step and a store for skipped message
//! keys: skipped keys are derived and thrown away, so out-of-order delivery
//! of *earlier* messages does not decrypt.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bundle::{Bundle, OneTimePreKey, PreKeyId, SignedPreKey};
use crate::cbor::{decode_cbor, encode_cbor};
use crate::crypto::aead::{aead_decrypt, aead_encrypt};
use crate::crypto::hkdf::hkdf;
use crate::crypto::identity::{IdentityKey, IdentityKeyFormat, IdentityKeyPair};
use crate::crypto::x25519::SecretKey;
use crate::crypto::xeddsa::{XSignature, xeddsa_sign};
use crate::crypto::{Rng, Secret};
use crate::device::DeviceId;
use crate::message::{DeviceMessage, KeyExchange, MessageHeader};
use crate::session::{Initiation, Session};
use crate::traits::{Backend, BackendError};

const X3DH_INFO: &[u8] = b"omemo-core chain backend x3dh";

const MESSAGE_KEY_INFO: &[u8] = b"omemo-core chain backend message key";

const CHAIN_STEP_INFO: &[u8] = b"omemo-core chain backend chain step";

pub struct ChainBackend {
    namespace: String,
    identity_key_format: IdentityKeyFormat,
    rng: Rng,
    state: Option<State>,
}

#[derive(Clone, Serialize, Deserialize)]
struct State {
    identity_secret: SecretKey,
    identity_key: IdentityKey,
    signed_pre_key: SignedPreKeySecret,
    previous_signed_pre_key: Option<SignedPreKeySecret>,
    one_time_pre_keys: Vec<OneTimePreKeySecret>,
    next_pre_key_id: PreKeyId,
}

#[derive(Clone, Serialize, Deserialize)]
struct SignedPreKeySecret {
    id: PreKeyId,
    secret: SecretKey,
    signature: XSignature,
    rotated_at: u64,
}

impl SignedPreKeySecret {
    fn public(&self) -> SignedPreKey {
        SignedPreKey::new(
            self.id,
            self.secret.public_key(),
            self.signature,
            self.rotated_at,
        )
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct OneTimePreKeySecret {
    id: PreKeyId,
    secret: SecretKey,
    hidden: bool,
}

/// Symmetric chain pair; the serialized form lives in the session's opaque
/// ratchet blob.
#[derive(Clone, Serialize, Deserialize)]
struct Ratchet {
    sending: Secret<32>,
    receiving: Secret<32>,
}

impl ChainBackend {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            identity_key_format: IdentityKeyFormat::Flexible,
            rng: Rng::default(),
            state: None,
        }
    }

    pub fn with_identity_key_format(mut self, format: IdentityKeyFormat) -> Self {
        self.identity_key_format = format;
        self
    }

    pub fn with_seeded_rng(mut self, seed: [u8; 32]) -> Self {
        self.rng = Rng::from_seed(seed);
        self
    }

    fn state(&self) -> Result<&State, BackendError> {
        self.state
            .as_ref()
            .ok_or_else(|| BackendError::State("backend was never loaded".to_string()))
    }

    fn generate_signed_pre_key(
        identity_secret: &SecretKey,
        id: PreKeyId,
        now: u64,
        rng: &Rng,
    ) -> Result<SignedPreKeySecret, BackendError> {
        let secret = SecretKey::from_bytes(rng.random_array().map_err(crypto_error)?);
        let signature = xeddsa_sign(secret.public_key().as_bytes(), identity_secret, rng)
            .map_err(crypto_error)?;
        Ok(SignedPreKeySecret {
            id,
            secret,
            signature,
            rotated_at: now,
        })
    }
}

#[async_trait]
impl Backend<Vec<u8>> for ChainBackend {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn identity_key_format(&self) -> IdentityKeyFormat {
        self.identity_key_format
    }

    async fn load_or_create(
        &mut self,
        identity: &IdentityKeyPair,
        state: Option<&[u8]>,
        now: u64,
    ) -> Result<(), BackendError> {
        if self.identity_key_format == IdentityKeyFormat::Ed && !identity.is_seed() {
            return Err(BackendError::IdentityKeyFormatIncompatible);
        }

        match state {
            Some(bytes) => {
                self.state =
                    Some(decode_cbor(bytes).map_err(|err| BackendError::State(err.to_string()))?);
            }
            None => {
                let identity_secret = identity.secret_scalar();
                let signed_pre_key =
                    Self::generate_signed_pre_key(&identity_secret, 1, now, &self.rng)?;
                self.state = Some(State {
                    identity_secret,
                    identity_key: identity.identity_key(),
                    signed_pre_key,
                    previous_signed_pre_key: None,
                    one_time_pre_keys: Vec::new(),
                    next_pre_key_id: 2,
                });
            }
        }

        Ok(())
    }

    fn serialize_state(&self) -> Result<Vec<u8>, BackendError> {
        encode_cbor(self.state()?).map_err(|err| BackendError::State(err.to_string()))
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), BackendError> {
        self.state = Some(decode_cbor(state).map_err(|err| BackendError::State(err.to_string()))?);
        Ok(())
    }

    fn bundle(&self, bare_jid: &str, device_id: DeviceId) -> Result<Bundle, BackendError> {
        let state = self.state()?;
        Ok(Bundle::new(
            self.namespace.clone(),
            bare_jid.to_string(),
            device_id,
            state.identity_key,
            state.signed_pre_key.public(),
            state
                .previous_signed_pre_key
                .as_ref()
                .map(SignedPreKeySecret::public),
            state
                .one_time_pre_keys
                .iter()
                .filter(|pre_key| !pre_key.hidden)
                .map(|pre_key| OneTimePreKey::new(pre_key.id, pre_key.secret.public_key()))
                .collect(),
        ))
    }

    fn signed_pre_key_rotated_at(&self) -> u64 {
        self.state
            .as_ref()
            .map(|state| state.signed_pre_key.rotated_at)
            .unwrap_or(0)
    }

    async fn rotate_signed_pre_key(&mut self, now: u64) -> Result<(), BackendError> {
        let Some(state) = self.state.as_mut() else {
            return Err(BackendError::State("backend was never loaded".to_string()));
        };
        let id = state.next_pre_key_id;
        state.next_pre_key_id += 1;
        let fresh = Self::generate_signed_pre_key(&state.identity_secret, id, now, &self.rng)?;
        state.previous_signed_pre_key =
            Some(std::mem::replace(&mut state.signed_pre_key, fresh));
        Ok(())
    }

    fn drop_expired_signed_pre_key(&mut self, now: u64, retention_period: u64) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        if state.previous_signed_pre_key.is_some()
            && now.saturating_sub(state.signed_pre_key.rotated_at) >= retention_period
        {
            state.previous_signed_pre_key = None;
            true
        } else {
            false
        }
    }

    fn visible_pre_key_count(&self) -> usize {
        self.state
            .as_ref()
            .map(|state| {
                state
                    .one_time_pre_keys
                    .iter()
                    .filter(|pre_key| !pre_key.hidden)
                    .count()
            })
            .unwrap_or(0)
    }

    async fn generate_pre_keys(&mut self, count: usize) -> Result<(), BackendError> {
        let Some(state) = self.state.as_mut() else {
            return Err(BackendError::State("backend was never loaded".to_string()));
        };
        for _ in 0..count {
            let id = state.next_pre_key_id;
            state.next_pre_key_id += 1;
            let secret = SecretKey::from_bytes(self.rng.random_array().map_err(crypto_error)?);
            state.one_time_pre_keys.push(OneTimePreKeySecret {
                id,
                secret,
                hidden: false,
            });
        }
        Ok(())
    }

    fn hide_pre_key(&mut self, session: &Session) -> bool {
        let Some(id) = session.associated_pre_key() else {
            return false;
        };
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        match state
            .one_time_pre_keys
            .iter_mut()
            .find(|pre_key| pre_key.id == id && !pre_key.hidden)
        {
            Some(pre_key) => {
                pre_key.hidden = true;
                true
            }
            None => false,
        }
    }

    fn delete_pre_key(&mut self, session: &Session) -> bool {
        let Some(id) = session.associated_pre_key() else {
            return false;
        };
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        match state
            .one_time_pre_keys
            .iter()
            .position(|pre_key| pre_key.id == id)
        {
            Some(position) => {
                state.one_time_pre_keys.remove(position);
                true
            }
            None => false,
        }
    }

    fn delete_hidden_pre_keys(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.one_time_pre_keys.retain(|pre_key| !pre_key.hidden);
        }
    }

    async fn build_active_session(
        &mut self,
        bare_jid: &str,
        device_id: DeviceId,
        bundle: &Bundle,
    ) -> Result<Session, BackendError> {
        bundle
            .verify()
            .map_err(|err| BackendError::BundleCorrupted(err.to_string()))?;

        let state = self.state()?;
        let their_identity = bundle
            .identity_key()
            .to_montgomery()
            .map_err(|err| BackendError::BundleCorrupted(err.to_string()))?;
        let signed_pre_key = bundle.signed_pre_key();
        let one_time_pre_key = bundle.one_time_pre_keys().first();

        let ephemeral = SecretKey::from_bytes(self.rng.random_array().map_err(crypto_error)?);

        let mut input_key_material = Vec::with_capacity(128);
        input_key_material.extend_from_slice(
            &state
                .identity_secret
                .calculate_agreement(signed_pre_key.public_key())
                .map_err(crypto_error)?,
        );
        input_key_material.extend_from_slice(
            &ephemeral
                .calculate_agreement(&their_identity)
                .map_err(crypto_error)?,
        );
        input_key_material.extend_from_slice(
            &ephemeral
                .calculate_agreement(signed_pre_key.public_key())
                .map_err(crypto_error)?,
        );
        if let Some(pre_key) = one_time_pre_key {
            input_key_material.extend_from_slice(
                &ephemeral
                    .calculate_agreement(pre_key.public_key())
                    .map_err(crypto_error)?,
            );
        }

        let ratchet = derive_chains(&input_key_material, Initiation::Active)?;
        let key_exchange = KeyExchange {
            identity_key: state.identity_key,
            ephemeral_key: ephemeral.public_key(),
            signed_pre_key_id: signed_pre_key.id(),
            pre_key_id: one_time_pre_key.map(OneTimePreKey::id),
        };

        Ok(Session::new(
            self.namespace.clone(),
            bare_jid.to_string(),
            device_id,
            Initiation::Active,
            *bundle.identity_key(),
            Some(key_exchange),
            None,
            encode_ratchet(&ratchet)?,
        ))
    }

    async fn build_passive_session(
        &mut self,
        bare_jid: &str,
        device_id: DeviceId,
        key_exchange: &KeyExchange,
        header: &MessageHeader,
        ciphertext: &[u8],
    ) -> Result<(Session, Vec<u8>), BackendError> {
        let state = self.state()?;

        let signed_pre_key = if state.signed_pre_key.id == key_exchange.signed_pre_key_id {
            &state.signed_pre_key
        } else {
            state
                .previous_signed_pre_key
                .as_ref()
                .filter(|pre_key| pre_key.id == key_exchange.signed_pre_key_id)
                .ok_or_else(|| {
                    BackendError::KeyExchangeFailed(
                        "unknown signed pre key referenced".to_string(),
                    )
                })?
        };

        // Hidden pre keys are deliberately included: catch-up retains used
        // pre keys exactly so that replayed initial messages keep working.
        let one_time_pre_key = match key_exchange.pre_key_id {
            Some(id) => Some(
                state
                    .one_time_pre_keys
                    .iter()
                    .find(|pre_key| pre_key.id == id)
                    .ok_or(BackendError::DuplicatedPreKeyMessage)?,
            ),
            None => None,
        };

        let their_identity = key_exchange
            .identity_key
            .to_montgomery()
            .map_err(crypto_error)?;

        let mut input_key_material = Vec::with_capacity(128);
        input_key_material.extend_from_slice(
            &signed_pre_key
                .secret
                .calculate_agreement(&their_identity)
                .map_err(crypto_error)?,
        );
        input_key_material.extend_from_slice(
            &state
                .identity_secret
                .calculate_agreement(&key_exchange.ephemeral_key)
                .map_err(crypto_error)?,
        );
        input_key_material.extend_from_slice(
            &signed_pre_key
                .secret
                .calculate_agreement(&key_exchange.ephemeral_key)
                .map_err(crypto_error)?,
        );
        if let Some(pre_key) = one_time_pre_key {
            input_key_material.extend_from_slice(
                &pre_key
                    .secret
                    .calculate_agreement(&key_exchange.ephemeral_key)
                    .map_err(crypto_error)?,
            );
        }

        let ratchet = derive_chains(&input_key_material, Initiation::Passive)?;
        let mut session = Session::new(
            self.namespace.clone(),
            bare_jid.to_string(),
            device_id,
            Initiation::Passive,
            key_exchange.identity_key,
            Some(key_exchange.clone()),
            key_exchange.pre_key_id,
            encode_ratchet(&ratchet)?,
        );

        let plaintext = ratchet_decrypt(
            &self.namespace,
            &mut session,
            header,
            ciphertext,
            u64::MAX,
            u64::MAX,
        )?;

        Ok((session, plaintext))
    }

    async fn encrypt(
        &mut self,
        session: &mut Session,
        plaintext: &[u8],
    ) -> Result<DeviceMessage, BackendError> {
        let mut ratchet = decode_ratchet(session.ratchet())?;

        let counter = session.sending_chain_length();
        let (message_key, next) = step_chain(&ratchet.sending)?;
        ratchet.sending = next;

        let ciphertext = aead_encrypt(
            &message_key,
            nonce_for(counter),
            plaintext,
            self.namespace.as_bytes(),
        )
        .map_err(|err| BackendError::SessionBroken(err.to_string()))?;

        let key_exchange = if session.initiation() == Initiation::Active && !session.confirmed() {
            session.key_exchange().cloned()
        } else {
            None
        };
        let header = MessageHeader::new(counter, key_exchange, Vec::new());

        session.record_sent_message();
        session.set_ratchet(encode_ratchet(&ratchet)?);

        Ok(DeviceMessage::new(header, ciphertext))
    }

    async fn decrypt(
        &mut self,
        session: &mut Session,
        header: &MessageHeader,
        ciphertext: &[u8],
        max_skipped_per_session: u64,
        max_skipped_per_message: u64,
    ) -> Result<Vec<u8>, BackendError> {
        ratchet_decrypt(
            &self.namespace,
            session,
            header,
            ciphertext,
            max_skipped_per_session,
            max_skipped_per_message,
        )
    }

    fn serialize_plaintext(&self, plaintext: &Vec<u8>) -> Result<Vec<u8>, BackendError> {
        Ok(plaintext.clone())
    }

    fn deserialize_plaintext(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
        Ok(bytes.to_vec())
    }
}

fn crypto_error(err: impl std::fmt::Display) -> BackendError {
    BackendError::KeyExchangeFailed(err.to_string())
}

fn derive_chains(
    input_key_material: &[u8],
    initiation: Initiation,
) -> Result<Ratchet, BackendError> {
    let output: [u8; 64] =
        hkdf(None, input_key_material, X3DH_INFO).map_err(crypto_error)?;
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&output[..32]);
    second.copy_from_slice(&output[32..]);

    // The initiator sends on the first chain, the responder on the second.
    Ok(match initiation {
        Initiation::Active => Ratchet {
            sending: Secret::from_bytes(first),
            receiving: Secret::from_bytes(second),
        },
        Initiation::Passive => Ratchet {
            sending: Secret::from_bytes(second),
            receiving: Secret::from_bytes(first),
        },
    })
}

fn step_chain(chain: &Secret<32>) -> Result<([u8; 32], Secret<32>), BackendError> {
    let message_key: [u8; 32] =
        hkdf(None, chain.as_bytes(), MESSAGE_KEY_INFO).map_err(crypto_error)?;
    let next: [u8; 32] = hkdf(None, chain.as_bytes(), CHAIN_STEP_INFO).map_err(crypto_error)?;
    Ok((message_key, Secret::from_bytes(next)))
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn encode_ratchet(ratchet: &Ratchet) -> Result<Vec<u8>, BackendError> {
    encode_cbor(ratchet).map_err(|err| BackendError::State(err.to_string()))
}

fn decode_ratchet(bytes: &[u8]) -> Result<Ratchet, BackendError> {
    decode_cbor(bytes).map_err(|err| BackendError::State(err.to_string()))
}

fn ratchet_decrypt(
    namespace: &str,
    session: &mut Session,
    header: &MessageHeader,
    ciphertext: &[u8],
    _max_skipped_per_session: u64,
    max_skipped_per_message: u64,
) -> Result<Vec<u8>, BackendError> {
    let mut ratchet = decode_ratchet(session.ratchet())?;

    let expected = session.receiving_chain_length();
    if header.counter() < expected {
        return Err(BackendError::SessionBroken(
            "message counter behind the receiving chain".to_string(),
        ));
    }

    let skipped = header.counter() - expected;
    if skipped > max_skipped_per_message {
        return Err(BackendError::TooManySkippedMessageKeys {
            skipped,
            allowed: max_skipped_per_message,
        });
    }

    // Skipped message keys are derived and discarded; this backend keeps no
    // skipped-key store.
    let mut chain = ratchet.receiving.clone();
    for _ in 0..skipped {
        let (_, next) = step_chain(&chain)?;
        chain = next;
    }
    let (message_key, next) = step_chain(&chain)?;
    ratchet.receiving = next;

    let plaintext = aead_decrypt(
        &message_key,
        nonce_for(header.counter()),
        ciphertext,
        namespace.as_bytes(),
    )
    .map_err(|err| BackendError::SessionBroken(err.to_string()))?;

    session.record_received_message(header.counter() + 1);
    session.set_ratchet(encode_ratchet(&ratchet)?);

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::crypto::identity::IdentityKeyPair;
    use crate::session::Initiation;
    use crate::traits::{Backend, BackendError};

    use super::ChainBackend;

    const NS: &str = "ns:chain:0";

    async fn loaded_backend(seed: u8) -> (ChainBackend, IdentityKeyPair) {
        let rng = Rng::from_seed([seed; 32]);
        let identity = IdentityKeyPair::generate(&rng).unwrap();
        let mut backend = ChainBackend::new(NS).with_seeded_rng([seed.wrapping_add(1); 32]);
        backend.load_or_create(&identity, None, 1_000).await.unwrap();
        backend.generate_pre_keys(10).await.unwrap();
        (backend, identity)
    }

    #[tokio::test]
    async fn active_and_passive_sessions_interoperate() {
        let (mut alice, _) = loaded_backend(1).await;
        let (mut bob, _) = loaded_backend(2).await;

        let bob_bundle = bob.bundle("bob@example.org", 2).unwrap();
        let mut alice_session = alice
            .build_active_session("bob@example.org", 2, &bob_bundle)
            .await
            .unwrap();
        assert_eq!(alice_session.initiation(), Initiation::Active);

        let message = alice
            .encrypt(&mut alice_session, b"hello over the chain")
            .await
            .unwrap();
        assert!(message.is_pre_key());

        let key_exchange = message.header().key_exchange().unwrap().clone();
        let (mut bob_session, plaintext) = bob
            .build_passive_session(
                "alice@example.org",
                1,
                &key_exchange,
                message.header(),
                message.ciphertext(),
            )
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello over the chain");
        assert_eq!(bob_session.receiving_chain_length(), 1);

        // The reply decrypts on the initiator side.
        let reply = bob.encrypt(&mut bob_session, b"hi back").await.unwrap();
        assert!(!reply.is_pre_key());
        let plaintext = alice
            .decrypt(&mut alice_session, reply.header(), reply.ciphertext(), 1000, 1000)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hi back");
    }

    #[tokio::test]
    async fn skipped_messages_within_limits_decrypt() {
        let (mut alice, _) = loaded_backend(3).await;
        let (mut bob, _) = loaded_backend(4).await;

        let bob_bundle = bob.bundle("bob@example.org", 2).unwrap();
        let mut alice_session = alice
            .build_active_session("bob@example.org", 2, &bob_bundle)
            .await
            .unwrap();

        // Two messages get lost, the third arrives.
        let _ = alice.encrypt(&mut alice_session, b"one").await.unwrap();
        let _ = alice.encrypt(&mut alice_session, b"two").await.unwrap();
        let third = alice.encrypt(&mut alice_session, b"three").await.unwrap();

        let key_exchange = third.header().key_exchange().unwrap().clone();
        let (bob_session, plaintext) = bob
            .build_passive_session(
                "alice@example.org",
                1,
                &key_exchange,
                third.header(),
                third.ciphertext(),
            )
            .await
            .unwrap();
        assert_eq!(plaintext, b"three");
        assert_eq!(bob_session.receiving_chain_length(), 3);
    }

    #[tokio::test]
    async fn consumed_pre_key_is_rejected() {
        let (mut alice, _) = loaded_backend(5).await;
        let (mut bob, _) = loaded_backend(6).await;

        let bob_bundle = bob.bundle("bob@example.org", 2).unwrap();
        let mut alice_session = alice
            .build_active_session("bob@example.org", 2, &bob_bundle)
            .await
            .unwrap();
        let message = alice.encrypt(&mut alice_session, b"first").await.unwrap();
        let key_exchange = message.header().key_exchange().unwrap().clone();

        let (bob_session, _) = bob
            .build_passive_session(
                "alice@example.org",
                1,
                &key_exchange,
                message.header(),
                message.ciphertext(),
            )
            .await
            .unwrap();

        // After deletion, the same pre-key message no longer builds.
        assert!(bob.delete_pre_key(&bob_session));
        let result = bob
            .build_passive_session(
                "alice@example.org",
                1,
                &key_exchange,
                message.header(),
                message.ciphertext(),
            )
            .await;
        assert!(matches!(result, Err(BackendError::DuplicatedPreKeyMessage)));
    }

    #[tokio::test]
    async fn hidden_pre_keys_still_build_sessions() {
        let (mut alice, _) = loaded_backend(7).await;
        let (mut bob, _) = loaded_backend(8).await;

        let bob_bundle = bob.bundle("bob@example.org", 2).unwrap();
        let visible_before = bob.visible_pre_key_count();

        let mut alice_session = alice
            .build_active_session("bob@example.org", 2, &bob_bundle)
            .await
            .unwrap();
        let message = alice.encrypt(&mut alice_session, b"first").await.unwrap();
        let key_exchange = message.header().key_exchange().unwrap().clone();

        let (bob_session, _) = bob
            .build_passive_session(
                "alice@example.org",
                1,
                &key_exchange,
                message.header(),
                message.ciphertext(),
            )
            .await
            .unwrap();

        assert!(bob.hide_pre_key(&bob_session));
        assert_eq!(bob.visible_pre_key_count(), visible_before - 1);

        // A replay of the initial message still decrypts.
        let (_, plaintext) = bob
            .build_passive_session(
                "alice@example.org",
                1,
                &key_exchange,
                message.header(),
                message.ciphertext(),
            )
            .await
            .unwrap();
        assert_eq!(plaintext, b"first");

        bob.delete_hidden_pre_keys();
        let result = bob
            .build_passive_session(
                "alice@example.org",
                1,
                &key_exchange,
                message.header(),
                message.ciphertext(),
            )
            .await;
        assert!(matches!(result, Err(BackendError::DuplicatedPreKeyMessage)));
    }

    #[tokio::test]
    async fn state_round_trips() {
        let (backend, identity) = loaded_backend(9).await;
        let state = backend.serialize_state().unwrap();

        let mut reloaded = ChainBackend::new(NS);
        reloaded
            .load_or_create(&identity, Some(&state), 2_000)
            .await
            .unwrap();

        assert_eq!(
            reloaded.visible_pre_key_count(),
            backend.visible_pre_key_count()
        );
        assert_eq!(
            reloaded.bundle("alice@example.org", 1).unwrap(),
            backend.bundle("alice@example.org", 1).unwrap()
        );
    }
}
