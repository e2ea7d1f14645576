// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scenario tests driving complete session managers against each other over
//! the in-memory test transport.
use crate::crypto::Rng;
use crate::crypto::identity::{IdentityKeyFormat, IdentityKeyPair};
use crate::device::DeviceId;
use crate::manager::{
    CreateReport, EncryptError, SessionManager, SessionManagerConfig,
};
use crate::message::{EncryptFailureReason, EncryptedMessage, IncomingMessage};
use crate::storage::MemoryStorage;
use crate::storage::facade::StorageFacade;
use crate::test_utils::{ChainBackend, TestTransport, TestTrustCallback};
use crate::traits::Backend;

const NS: &str = "ns:omemo:test";
const NS_2: &str = "ns:omemo:test:2";
const ALICE: &str = "alice@example.org";
const BOB: &str = "bob@example.org";
const CAROL: &str = "carol@example.org";

const ROTATION_PERIOD: u64 = 1_000;

async fn new_manager(
    bare_jid: &str,
    transport: &TestTransport,
    trust: &TestTrustCallback,
    seed: u8,
) -> (SessionManager<Vec<u8>>, CreateReport) {
    let backend = ChainBackend::new(NS).with_seeded_rng([seed; 32]);
    let mut config = SessionManagerConfig::new("undecided");
    config.signed_pre_key_rotation_period = Some(ROTATION_PERIOD);

    SessionManager::create(
        vec![Box::new(backend) as Box<dyn Backend<Vec<u8>>>],
        Box::new(MemoryStorage::new()),
        Box::new(transport.clone()),
        Box::new(trust.clone()),
        bare_jid,
        config,
    )
    .await
    .unwrap()
}

async fn new_dual_manager(
    bare_jid: &str,
    transport: &TestTransport,
    trust: &TestTrustCallback,
    seed_a: u8,
    seed_b: u8,
) -> (SessionManager<Vec<u8>>, CreateReport) {
    let mut config = SessionManagerConfig::new("undecided");
    config.signed_pre_key_rotation_period = Some(ROTATION_PERIOD);

    SessionManager::create(
        vec![
            Box::new(ChainBackend::new(NS).with_seeded_rng([seed_a; 32]))
                as Box<dyn Backend<Vec<u8>>>,
            Box::new(ChainBackend::new(NS_2).with_seeded_rng([seed_b; 32]))
                as Box<dyn Backend<Vec<u8>>>,
        ],
        Box::new(MemoryStorage::new()),
        Box::new(transport.clone()),
        Box::new(trust.clone()),
        bare_jid,
        config,
    )
    .await
    .unwrap()
}

fn incoming_for(
    message: &EncryptedMessage,
    namespace: &str,
    device_id: DeviceId,
) -> IncomingMessage {
    let device_message = message
        .device_message(namespace, device_id)
        .expect("message contains an entry for the device");
    IncomingMessage {
        namespace: namespace.to_string(),
        bare_jid: message.bare_jid().to_string(),
        device_id: message.device_id(),
        header: device_message.header().clone(),
        ciphertext: device_message.ciphertext().to_vec(),
    }
}

async fn trust_all(
    manager: &mut SessionManager<Vec<u8>>,
    bare_jid: &str,
) -> Vec<(DeviceId, crate::crypto::identity::IdentityKey)> {
    let devices = manager.get_device_information(bare_jid).await.unwrap();
    let mut trusted = Vec::new();
    for device in devices {
        manager
            .set_trust(bare_jid, &device.identity_key, "trusted")
            .await
            .unwrap();
        trusted.push((device.device_id, device.identity_key));
    }
    trusted
}

#[tokio::test]
async fn fresh_install_and_self_send() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    let (mut alice_a, report) = new_manager(ALICE, &transport, &trust, 1).await;
    assert!(report.first_run);
    assert!(!report.identity_key_regenerated);

    // No other device of the own account exists: the message is valid but
    // carries zero per-device entries.
    let (message, failures) = alice_a
        .encrypt(&[ALICE.to_string()], &b"hello".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(message.device_count(), 0);
    assert!(failures.is_empty());

    // A second own device appears.
    let (mut alice_b, _) = new_manager(ALICE, &transport, &trust, 2).await;
    let second_device_id = alice_b.own_device_id();
    assert_ne!(second_device_id, alice_a.own_device_id());

    alice_a.refresh_device_list(NS, ALICE).await.unwrap();
    trust_all(&mut alice_a, ALICE).await;

    let (message, failures) = alice_a
        .encrypt(&[ALICE.to_string()], &b"hello".to_vec(), None)
        .await
        .unwrap();
    assert!(failures.is_empty());
    assert_eq!(message.device_count(), 1);

    let incoming = incoming_for(&message, NS, second_device_id);
    let decrypted = alice_b.decrypt(&incoming).await.unwrap();
    assert_eq!(decrypted.plaintext, Some(b"hello".to_vec()));
    assert_eq!(decrypted.device.device_id, alice_a.own_device_id());
    // The second device never decided on the first device's key.
    assert!(decrypted.from_undecided);
}

#[tokio::test]
async fn signed_pre_key_rotation_is_deferred_by_catch_up() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    let (mut alice, _) = new_manager(ALICE, &transport, &trust, 3).await;
    let own_device_id = alice.own_device_id();
    let bundle_key = (NS.to_string(), ALICE.to_string(), own_device_id);

    let (rotated_at, uploads_before) = {
        let pep = transport.pep();
        let bundle = pep.bundles.get(&bundle_key).expect("bundle was published");
        (bundle.signed_pre_key().rotated_at(), pep.bundle_uploads)
    };

    // Clock advances well beyond the rotation period while catch-up is
    // still active: maintenance must not rotate or republish.
    let later = rotated_at + ROTATION_PERIOD + 500;
    alice.maintenance_at(later).await.unwrap();
    {
        let pep = transport.pep();
        let bundle = pep.bundles.get(&bundle_key).unwrap();
        assert_eq!(bundle.signed_pre_key().rotated_at(), rotated_at);
        assert_eq!(pep.bundle_uploads, uploads_before);
    }
    assert!(alice.pending_bundle_publications().is_empty());

    // Ending catch-up runs the deferred rotation and republishes.
    alice.finish_catch_up_at(later).await.unwrap();
    {
        let pep = transport.pep();
        let bundle = pep.bundles.get(&bundle_key).unwrap();
        assert_eq!(bundle.signed_pre_key().rotated_at(), later);
        // The pre-rotation key is retained for delayed messages.
        let previous = bundle.previous_signed_pre_key().unwrap();
        assert_eq!(previous.rotated_at(), rotated_at);
        assert_eq!(pep.bundle_uploads, uploads_before + 1);
    }
    assert!(alice.pending_bundle_publications().is_empty());
}

#[tokio::test]
async fn stale_session_answered_once_after_catch_up() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    let (mut alice, _) = new_manager(ALICE, &transport, &trust, 4).await;
    let (mut bob, _) = new_manager(BOB, &transport, &trust, 5).await;
    let bob_device_id = bob.own_device_id();

    alice.refresh_device_list(NS, BOB).await.unwrap();
    trust_all(&mut alice, BOB).await;

    // 54 messages; only the last one reaches Bob, carrying counter 53.
    let mut last = None;
    for _ in 0..54 {
        let (message, failures) = alice
            .encrypt(&[BOB.to_string()], &b"ping".to_vec(), None)
            .await
            .unwrap();
        assert!(failures.is_empty());
        last = Some(message);
    }
    let incoming = incoming_for(&last.unwrap(), NS, bob_device_id);

    let sent_before = transport.pep().empty_messages.len();
    let decrypted = bob.decrypt(&incoming).await.unwrap();
    assert_eq!(decrypted.plaintext, Some(b"ping".to_vec()));
    // Catch-up is active: the staleness response is deferred.
    assert_eq!(transport.pep().empty_messages.len(), sent_before);

    bob.finish_catch_up().await.unwrap();
    let sent_after = transport.pep().empty_messages.len();
    assert_eq!(sent_after, sent_before + 1);
    let (namespace, bare_jid, device_id, message) =
        transport.pep().empty_messages.last().unwrap().clone();
    assert_eq!(namespace, NS);
    assert_eq!(bare_jid, ALICE);
    assert_eq!(device_id, alice.own_device_id());
    assert!(message.ciphertext().len() < 64);

    // The queue is drained: ending catch-up again sends nothing.
    bob.start_catch_up();
    bob.finish_catch_up().await.unwrap();
    assert_eq!(transport.pep().empty_messages.len(), sent_after);
}

#[tokio::test]
async fn undecided_recipients_fail_fast_and_resolve_in_bulk() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    let (mut alice, _) = new_manager(ALICE, &transport, &trust, 6).await;
    let (_bob_1, _) = new_manager(BOB, &transport, &trust, 7).await;
    let (_bob_2, _) = new_manager(BOB, &transport, &trust, 8).await;
    let (_bob_3, _) = new_manager(BOB, &transport, &trust, 9).await;

    alice.refresh_device_list(NS, BOB).await.unwrap();

    let result = alice
        .encrypt(&[BOB.to_string()], &b"hi".to_vec(), None)
        .await;
    match result {
        Err(EncryptError::StillUndecided(devices)) => {
            assert_eq!(devices.len(), 3);
            assert!(devices.iter().all(|device| device.bare_jid == BOB));
        }
        other => panic!("expected StillUndecided, got {other:?}"),
    }

    // Bulk resolution, then the retry succeeds for all three devices.
    let trusted = trust_all(&mut alice, BOB).await;
    assert_eq!(trusted.len(), 3);

    let (message, failures) = alice
        .encrypt(&[BOB.to_string()], &b"hi".to_vec(), None)
        .await
        .unwrap();
    assert!(failures.is_empty());
    assert_eq!(message.device_count(), 3);
}

#[tokio::test]
async fn bundle_download_failure_mid_fan_out() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    let (mut alice, _) = new_manager(ALICE, &transport, &trust, 10).await;
    let (bob_1, _) = new_manager(BOB, &transport, &trust, 11).await;
    let (bob_2, _) = new_manager(BOB, &transport, &trust, 12).await;
    let (_carol_1, _) = new_manager(CAROL, &transport, &trust, 13).await;
    let (_carol_2, _) = new_manager(CAROL, &transport, &trust, 14).await;
    let unreachable = bob_2.own_device_id();

    transport.pep().failing_bundle_downloads.insert((
        NS.to_string(),
        BOB.to_string(),
        unreachable,
    ));

    alice.refresh_device_list(NS, BOB).await.unwrap();
    alice.refresh_device_list(NS, CAROL).await.unwrap();
    trust_all(&mut alice, BOB).await;
    trust_all(&mut alice, CAROL).await;

    let recipients = vec![BOB.to_string(), CAROL.to_string()];
    let (message, failures) = alice
        .encrypt(&recipients, &b"fan out".to_vec(), None)
        .await
        .unwrap();

    assert_eq!(message.device_count(), 3);
    assert!(message.device_message(NS, bob_1.own_device_id()).is_some());
    assert!(message.device_message(NS, unreachable).is_none());

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].bare_jid, BOB);
    assert_eq!(failures[0].device_id, unreachable);
    assert!(matches!(
        failures[0].reason,
        EncryptFailureReason::BundleDownloadFailed(_)
    ));

    // The three established sessions were committed: a second fan-out only
    // attempts the one bundle download that keeps failing.
    let downloads_before = transport.pep().bundle_downloads;
    let (message, failures) = alice
        .encrypt(&recipients, &b"fan out".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(message.device_count(), 3);
    assert_eq!(failures.len(), 1);
    assert_eq!(transport.pep().bundle_downloads, downloads_before + 1);
}

#[tokio::test]
async fn unfetchable_bundle_falls_through_to_next_supported_backend() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    let (mut alice, _) = new_dual_manager(ALICE, &transport, &trust, 20, 21).await;
    let (mut bob, _) = new_dual_manager(BOB, &transport, &trust, 22, 23).await;
    let bob_device_id = bob.own_device_id();

    alice.refresh_device_list(NS, BOB).await.unwrap();
    alice.refresh_device_list(NS_2, BOB).await.unwrap();
    trust_all(&mut alice, BOB).await;

    // The top-priority backend's bundle cannot be fetched; the device is
    // still reachable through the second backend it supports.
    transport.pep().failing_bundle_downloads.insert((
        NS.to_string(),
        BOB.to_string(),
        bob_device_id,
    ));

    let (message, failures) = alice
        .encrypt(&[BOB.to_string()], &b"fallback".to_vec(), None)
        .await
        .unwrap();
    assert!(failures.is_empty());
    assert_eq!(message.device_count(), 1);
    assert!(message.device_message(NS, bob_device_id).is_none());
    assert!(message.device_message(NS_2, bob_device_id).is_some());

    let incoming = incoming_for(&message, NS_2, bob_device_id);
    let decrypted = bob.decrypt(&incoming).await.unwrap();
    assert_eq!(decrypted.plaintext, Some(b"fallback".to_vec()));

    // With every supported backend unfetchable, the device is terminally
    // unreachable; as the only device of the recipient, the whole operation
    // fails.
    alice.purge_bare_jid(BOB).await.unwrap();
    alice.refresh_device_list(NS, BOB).await.unwrap();
    alice.refresh_device_list(NS_2, BOB).await.unwrap();
    trust_all(&mut alice, BOB).await;
    transport.pep().failing_bundle_downloads.insert((
        NS_2.to_string(),
        BOB.to_string(),
        bob_device_id,
    ));

    let result = alice
        .encrypt(&[BOB.to_string()], &b"unreachable".to_vec(), None)
        .await;
    match result {
        Err(EncryptError::NoEligibleDevices(bare_jids)) => {
            assert_eq!(bare_jids, vec![BOB.to_string()]);
        }
        other => panic!("expected NoEligibleDevices, got {other:?}"),
    }
}

#[tokio::test]
async fn historical_identity_key_is_regenerated_for_ed_backends() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    // A historical installation that only ever stored the Curve25519
    // private scalar, with a trust decision attached to the old identity.
    let rng = Rng::from_seed([42; 32]);
    let original = IdentityKeyPair::generate(&rng).unwrap();
    let legacy = IdentityKeyPair::from_scalar(*original.secret_scalar().as_bytes());
    let old_identity_key = legacy.identity_key();

    let memory = MemoryStorage::new();
    {
        let mut facade = StorageFacade::new(Box::new(memory.clone()));
        facade.store_identity_key_pair(&legacy).await.unwrap();
        facade
            .store_trust(ALICE, &old_identity_key, "trusted")
            .await
            .unwrap();
    }

    let backend = ChainBackend::new(NS)
        .with_seeded_rng([15; 32])
        .with_identity_key_format(IdentityKeyFormat::Ed);
    let mut config = SessionManagerConfig::new("undecided");
    config.signed_pre_key_rotation_period = Some(ROTATION_PERIOD);

    let (manager, report) = SessionManager::create(
        vec![Box::new(backend) as Box<dyn Backend<Vec<u8>>>],
        Box::new(memory.clone()),
        Box::new(transport.clone()),
        Box::new(trust.clone()),
        ALICE,
        config,
    )
    .await
    .unwrap();

    assert!(report.identity_key_regenerated);

    // The trust decisions attached to the old identity are gone.
    let facade = StorageFacade::new(Box::new(memory.clone()));
    assert!(facade
        .load_trust(ALICE, &old_identity_key)
        .await
        .unwrap()
        .is_none());

    // The published bundle carries a fresh seed-based identity key.
    let pep = transport.pep();
    let bundle = pep
        .bundles
        .get(&(NS.to_string(), ALICE.to_string(), manager.own_device_id()))
        .unwrap();
    assert_ne!(*bundle.identity_key(), old_identity_key);
    assert!(bundle.verify().is_ok());
}

#[tokio::test]
async fn distrusted_devices_are_dropped_silently() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    let (mut alice, _) = new_manager(ALICE, &transport, &trust, 16).await;
    let (_bob, _) = new_manager(BOB, &transport, &trust, 17).await;

    alice.refresh_device_list(NS, BOB).await.unwrap();
    for device in alice.get_device_information(BOB).await.unwrap() {
        alice
            .set_trust(BOB, &device.identity_key, "distrusted")
            .await
            .unwrap();
    }

    // The only device of the recipient is distrusted: it is dropped without
    // a per-device failure, leaving the recipient without devices.
    let result = alice
        .encrypt(&[BOB.to_string()], &b"secret".to_vec(), None)
        .await;
    match result {
        Err(EncryptError::NoEligibleDevices(bare_jids)) => {
            assert_eq!(bare_jids, vec![BOB.to_string()]);
        }
        other => panic!("expected NoEligibleDevices, got {other:?}"),
    }
}

#[tokio::test]
async fn config_bounds_are_enforced() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    let mut config = SessionManagerConfig::new("undecided");
    config.pre_key_refill_threshold = 24;

    let result = SessionManager::create(
        vec![Box::new(ChainBackend::new(NS)) as Box<dyn Backend<Vec<u8>>>],
        Box::new(MemoryStorage::new()),
        Box::new(transport.clone()),
        Box::new(trust.clone()),
        ALICE,
        config,
    )
    .await;
    assert!(matches!(result, Err(crate::manager::CreateError::Config(_))));

    let mut config = SessionManagerConfig::new("undecided");
    config.max_skipped_message_keys_per_message = Some(0);

    let result = SessionManager::create(
        vec![Box::new(ChainBackend::new(NS)) as Box<dyn Backend<Vec<u8>>>],
        Box::new(MemoryStorage::new()),
        Box::new(transport.clone()),
        Box::new(trust.clone()),
        ALICE,
        config,
    )
    .await;
    assert!(matches!(result, Err(crate::manager::CreateError::Config(_))));
}

#[tokio::test]
async fn purge_removes_peer_data() {
    let transport = TestTransport::new();
    let trust = TestTrustCallback::new();

    let (mut alice, _) = new_manager(ALICE, &transport, &trust, 18).await;
    let (mut bob, _) = new_manager(BOB, &transport, &trust, 19).await;

    alice.refresh_device_list(NS, BOB).await.unwrap();
    trust_all(&mut alice, BOB).await;
    let (message, _) = alice
        .encrypt(&[BOB.to_string()], &b"hello bob".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(message.device_count(), 1);

    let incoming = incoming_for(&message, NS, bob.own_device_id());
    assert!(bob.decrypt(&incoming).await.is_ok());

    alice.purge_bare_jid(BOB).await.unwrap();
    assert!(alice.get_device_information(BOB).await.unwrap().is_empty());

    // With all records gone, encrypting to the purged account starts from
    // scratch: the device list has to be fetched again first.
    let result = alice
        .encrypt(&[BOB.to_string()], &b"again".to_vec(), None)
        .await;
    assert!(matches!(result, Err(EncryptError::NoEligibleDevices(_))));
}
