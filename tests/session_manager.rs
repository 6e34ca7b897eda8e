//! Integration tests for `SessionManager` driving the concrete scenarios and universal
//! invariants of spec section 8, end to end through `encrypt`/`decrypt` against the in-memory
//! `support::delegate::Network`.
//!
//! S6 (OTPK release timing) is exercised at the unit level instead, in
//! `src/x3dh.rs`'s `default_policy_release_bound_via_decide_release`: `SessionManager` has no
//! clock-injection point (`now_unix()` reads the wall clock directly), so driving the 24-hour
//! span through the full `encrypt`/`decrypt` path isn't practical here.

mod support;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use protocol::backend::current::CurrentBackend;
use protocol::backend::legacy::LegacyBackend;
use protocol::error::SessionManagerError;
use protocol::{SessionManager, SessionManagerConfig};

use support::delegate::{Network, RecordingDelegate};
use support::memory_storage::MemoryStorage;

const NAMESPACE: &str = "urn:xmpp:omemo:2";
const LEGACY_NAMESPACE: &str = "eu.siacs.conversations.axolotl";

/// Installs a `tracing` subscriber the first time any test calls one of the `spawn*` helpers
/// below, the same `tracing_subscriber::fmt()...try_init()` pattern the teacher's
/// `native/server/src/main.rs` uses, so `tracing::info!`/`debug!`/`warn!` calls inside
/// `SessionManager` show up under `cargo test -- --nocapture`. A later call on an
/// already-initialized process is a harmless no-op.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn spawn(network: &Arc<Network>, bare_jid: &str) -> SessionManager<MemoryStorage, RecordingDelegate> {
    init_tracing();
    SessionManager::create(
        MemoryStorage::new(),
        RecordingDelegate::new(network.clone(), bare_jid),
        vec![Box::new(CurrentBackend)],
        bare_jid.to_string(),
        None,
        SessionManagerConfig::default(),
    )
    .await
    .expect("creating an account against fresh in-memory storage always succeeds")
}

async fn spawn_with_backends(network: &Arc<Network>, bare_jid: &str, backends: Vec<Box<dyn protocol::backend::Backend>>) -> SessionManager<MemoryStorage, RecordingDelegate> {
    init_tracing();
    SessionManager::create(MemoryStorage::new(), RecordingDelegate::new(network.clone(), bare_jid), backends, bare_jid.to_string(), None, SessionManagerConfig::default())
        .await
        .expect("creating an account against fresh in-memory storage always succeeds")
}

async fn spawn_never_trusting(network: &Arc<Network>, bare_jid: &str) -> SessionManager<MemoryStorage, RecordingDelegate> {
    init_tracing();
    SessionManager::create(
        MemoryStorage::new(),
        RecordingDelegate::new_never_trusting(network.clone(), bare_jid),
        vec![Box::new(CurrentBackend)],
        bare_jid.to_string(),
        None,
        SessionManagerConfig::default(),
    )
    .await
    .expect("creating an account against fresh in-memory storage always succeeds")
}

fn recipients(bare_jids: &[&str]) -> BTreeSet<String> {
    bare_jids.iter().map(|s| s.to_string()).collect()
}

fn plaintext(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut map = BTreeMap::new();
    map.insert(NAMESPACE.to_string(), bytes.to_vec());
    map
}

fn priority() -> Vec<String> {
    vec![NAMESPACE.to_string()]
}

/// Runs the S1 handshake between two already-spawned accounts and drains Bob's automatic
/// acknowledgement, leaving both sides with a confirmed session. Shared by the later scenarios
/// that need a working session pair rather than a fresh handshake to exercise.
async fn establish_session(network: &Arc<Network>, alice: &mut SessionManager<MemoryStorage, RecordingDelegate>, bob: &mut SessionManager<MemoryStorage, RecordingDelegate>) {
    let outcome = alice.encrypt(&recipients(&["bob@example.org"]), &plaintext(b"hi"), &priority()).await.expect("handshake message always has an eligible recipient");
    let message = outcome.messages.get(NAMESPACE).cloned().expect("one message for the only configured backend");
    bob.decrypt(&message).await.expect("bob decrypts the initiating pre-key message");
    let mut ack_inbox = network.drain_inbox("alice@example.org");
    let ack = ack_inbox.pop().expect("bob schedules a handshake-completion message");
    alice.decrypt(&ack).await.expect("alice decrypts bob's handshake acknowledgement");
}

// S1. Initial handshake.
#[tokio::test]
async fn initial_handshake_delivers_plaintext_and_an_automatic_acknowledgement() {
    let network = Network::new();
    let mut alice = spawn(&network, "alice@example.org").await;
    let mut bob = spawn(&network, "bob@example.org").await;

    let outcome = alice.encrypt(&recipients(&["bob@example.org"]), &plaintext(b"Hello, Bob!"), &priority()).await.expect("bob is a trusted, reachable recipient");
    assert!(outcome.device_errors.is_empty());
    let message = outcome.messages.get(NAMESPACE).cloned().expect("one message for the only configured backend");

    let decrypted = bob.decrypt(&message).await.expect("bob can decrypt alice's first message");
    assert_eq!(decrypted.plaintext.as_deref(), Some(&b"Hello, Bob!"[..]));
    assert!(decrypted.fresh_session);
    assert_eq!(decrypted.sender_bare_jid, "alice@example.org");
    assert_eq!(decrypted.sender_device_id, alice.get_own_device_information().await.unwrap()[0].device_id);

    let mut alice_inbox = network.drain_inbox("alice@example.org");
    assert_eq!(alice_inbox.len(), 1, "bob schedules exactly one handshake-completion message");
    let ack = alice_inbox.remove(0);

    let ack_outcome = alice.decrypt(&ack).await.expect("alice decrypts bob's handshake acknowledgement");
    assert!(ack_outcome.plaintext.is_none());
    assert!(!ack_outcome.fresh_session, "alice already had a session with bob from sending the first message");
}

// S2. Key-transport / empty-payload scenario.
#[tokio::test]
async fn stripped_payload_message_decrypts_and_the_session_stays_usable() {
    let network = Network::new();
    let mut alice = spawn(&network, "alice@example.org").await;
    let mut bob = spawn(&network, "bob@example.org").await;
    establish_session(&network, &mut alice, &mut bob).await;

    let zero_payload = vec![0u8; 32];
    let outcome = alice.encrypt(&recipients(&["bob@example.org"]), &plaintext(&zero_payload), &priority()).await.unwrap();
    let mut message = outcome.messages.get(NAMESPACE).cloned().unwrap();
    message.payload_ciphertext = None;
    message.payload_nonce = None;

    let decrypted = bob.decrypt(&message).await.expect("a message with no payload element still authenticates via the ratchet submessage alone");
    assert!(decrypted.plaintext.is_none());

    for i in 0..2 {
        let text = format!("ordinary message {i}");
        let outcome = alice.encrypt(&recipients(&["bob@example.org"]), &plaintext(text.as_bytes()), &priority()).await.unwrap();
        let message = outcome.messages.get(NAMESPACE).cloned().unwrap();
        let decrypted = bob.decrypt(&message).await.unwrap_or_else(|err| panic!("round trip {i} after the stripped-payload message failed: {err}"));
        assert_eq!(decrypted.plaintext.as_deref(), Some(text.as_bytes()));
    }
}

// S3. Out-of-order delivery.
#[tokio::test]
async fn out_of_order_delivery_all_decrypt() {
    let network = Network::new();
    let mut alice = spawn(&network, "alice@example.org").await;
    let mut bob = spawn(&network, "bob@example.org").await;
    establish_session(&network, &mut alice, &mut bob).await;

    let mut messages = Vec::new();
    for i in 1..=5 {
        let text = format!("m{i}");
        let outcome = alice.encrypt(&recipients(&["bob@example.org"]), &plaintext(text.as_bytes()), &priority()).await.unwrap();
        messages.push((text, outcome.messages.get(NAMESPACE).cloned().unwrap()));
    }

    for index in [2usize, 4, 0, 1, 3] {
        let (text, message) = &messages[index];
        let decrypted = bob.decrypt(message).await.unwrap_or_else(|err| panic!("{text} failed to decrypt out of order: {err}"));
        assert_eq!(decrypted.plaintext.as_deref(), Some(text.as_bytes()));
    }
}

// S4. Replay rejection.
#[tokio::test]
async fn replayed_message_is_rejected_and_later_messages_still_decrypt() {
    let network = Network::new();
    let mut alice = spawn(&network, "alice@example.org").await;
    let mut bob = spawn(&network, "bob@example.org").await;
    establish_session(&network, &mut alice, &mut bob).await;

    let mut messages = Vec::new();
    for i in 1..=5 {
        let text = format!("m{i}");
        let outcome = alice.encrypt(&recipients(&["bob@example.org"]), &plaintext(text.as_bytes()), &priority()).await.unwrap();
        messages.push((text, outcome.messages.get(NAMESPACE).cloned().unwrap()));
    }

    for (text, message) in &messages[..3] {
        let decrypted = bob.decrypt(message).await.unwrap();
        assert_eq!(decrypted.plaintext.as_deref(), Some(text.as_bytes()));
    }

    let replay = bob.decrypt(&messages[2].1).await;
    assert!(matches!(replay, Err(SessionManagerError::Ratchet(_))), "a replayed message key must be rejected, not silently accepted");

    for (text, message) in &messages[3..] {
        let decrypted = bob.decrypt(message).await.unwrap_or_else(|err| panic!("{text} should still decrypt after the rejected replay: {err}"));
        assert_eq!(decrypted.plaintext.as_deref(), Some(text.as_bytes()));
    }
}

// S5. Trust gate.
#[tokio::test]
async fn undecided_trust_blocks_encryption_with_still_undecided() {
    let network = Network::new();
    // Alice's embedder never resolves a pending trust decision, modelling a recipient whose
    // `_evaluate_custom_trust_level`/`_make_trust_decision` leave it Undecided.
    let mut alice = spawn_never_trusting(&network, "alice@example.org").await;
    let _bob = spawn(&network, "bob@example.org").await;
    let _carol = spawn(&network, "carol@example.org").await;

    // `resolve_trust` runs before any session is touched, so a rejected send never creates or
    // persists ratchet state for either recipient.
    let result = alice.encrypt(&recipients(&["bob@example.org", "carol@example.org"]), &plaintext(b"group hello"), &priority()).await;
    assert!(matches!(result, Err(SessionManagerError::StillUndecided(_))), "an undecided device must block the whole send");
}

// Universal invariant: fan-out correctness.
#[tokio::test]
async fn fan_out_produces_one_decryptable_submessage_per_recipient_device() {
    let network = Network::new();
    let mut alice = spawn(&network, "alice@example.org").await;
    let mut bob = spawn(&network, "bob@example.org").await;
    let mut carol = spawn(&network, "carol@example.org").await;

    let outcome = alice
        .encrypt(&recipients(&["bob@example.org", "carol@example.org"]), &plaintext(b"group hello"), &priority())
        .await
        .expect("both recipients are trusted by default and reachable");
    assert!(outcome.device_errors.is_empty());
    let message = outcome.messages.get(NAMESPACE).cloned().unwrap();

    let bob_device_id = bob.get_own_device_information().await.unwrap()[0].device_id;
    let carol_device_id = carol.get_own_device_information().await.unwrap()[0].device_id;

    assert!(message.submessage_for("bob@example.org", bob_device_id).is_some());
    assert!(message.submessage_for("carol@example.org", carol_device_id).is_some());
    assert_eq!(message.submessages.len(), 2, "exactly one submessage per eligible device, no more");

    let bob_decrypted = bob.decrypt(&message).await.unwrap();
    assert_eq!(bob_decrypted.plaintext.as_deref(), Some(&b"group hello"[..]));
    let carol_decrypted = carol.decrypt(&message).await.unwrap();
    assert_eq!(carol_decrypted.plaintext.as_deref(), Some(&b"group hello"[..]));
}

// Universal invariant: device list consistency.
#[tokio::test]
async fn own_device_is_present_and_active_in_the_own_device_list_after_create() {
    let network = Network::new();
    let mut alice = spawn(&network, "alice@example.org").await;

    let own = alice.get_own_device_information().await.unwrap();
    assert_eq!(own.len(), 1);
    assert!(own[0].active, "the device that just created the account must be active in its own device list");
    assert!(own[0].namespaces.contains(NAMESPACE));
}

// Universal invariant: a recipient with no eligible device fails per-recipient, not silently.
#[tokio::test]
async fn unknown_recipient_fails_with_no_eligible_devices() {
    let network = Network::new();
    let mut alice = spawn(&network, "alice@example.org").await;

    let result = alice.encrypt(&recipients(&["ghost@example.org"]), &plaintext(b"hello?"), &priority()).await;
    match result {
        Err(SessionManagerError::NoEligibleDevices(missing)) => {
            assert!(missing.contains("ghost@example.org"));
        }
        other => panic!("expected NoEligibleDevices, got {other:?}"),
    }
}

// Spec section 3: "[the Bundle] ... republished on SPK rotation or OTPK refill."
#[tokio::test]
async fn maintenance_rotates_an_overdue_spk_and_republishes_the_bundle() {
    init_tracing();
    let network = Network::new();
    let mut config = SessionManagerConfig::default();
    config.signed_pre_key_rotation_period_secs = 0;
    let mut alice = SessionManager::create(
        MemoryStorage::new(),
        RecordingDelegate::new(network.clone(), "alice@example.org"),
        vec![Box::new(CurrentBackend)],
        "alice@example.org".to_string(),
        None,
        config,
    )
    .await
    .unwrap();

    let own_device_id = alice.get_own_device_information().await.unwrap()[0].device_id;
    let before = network.bundle(NAMESPACE, "alice@example.org", own_device_id).expect("create() publishes the initial bundle");
    assert_eq!(before.signed_prekey.id, 0, "the freshly created spk has id 0");

    // SPK rotation is deferred while history-sync mode is active (spec section 4.2); leave it so
    // maintenance can actually rotate.
    alice.after_history_sync();
    alice.perform_maintenance().await.expect("maintenance does not fail against healthy in-memory storage");

    let after = network.bundle(NAMESPACE, "alice@example.org", own_device_id).expect("bundle is still present");
    assert_eq!(after.signed_prekey.id, 1, "an overdue spk is rotated and the bundle republished with the new id");
    assert!(after.verify().is_ok(), "the rotated spk's signature must still verify against the account identity key");
}

// Running maintenance again immediately after a rotation must be a no-op: the freshly rotated
// spk is not yet overdue, and the otpk pool was never drawn down below the refill threshold.
#[tokio::test]
async fn maintenance_is_idempotent_once_nothing_is_due() {
    let network = Network::new();
    let mut alice = spawn(&network, "alice@example.org").await;
    let own_device_id = alice.get_own_device_information().await.unwrap()[0].device_id;

    alice.perform_maintenance().await.unwrap();
    let first = network.bundle(NAMESPACE, "alice@example.org", own_device_id).unwrap();

    alice.perform_maintenance().await.unwrap();
    let second = network.bundle(NAMESPACE, "alice@example.org", own_device_id).unwrap();

    assert_eq!(first.signed_prekey.id, second.signed_prekey.id, "nothing was due, so the spk must not rotate again");
}

// Open Question 3 (SPEC_FULL.md section 3): both backend generations MUST be supported if the
// host loads both. Alice loads both; Bob can only speak the current generation, Carol only the
// legacy one, so `encrypt` must pick a different backend per device in the same call and each
// recipient must be able to decrypt the message addressed to it.
#[tokio::test]
async fn both_backend_generations_coexist_and_fan_out_independently() {
    let network = Network::new();
    let mut alice = spawn_with_backends(&network, "alice@example.org", vec![Box::new(CurrentBackend), Box::new(LegacyBackend)]).await;
    let mut bob = spawn_with_backends(&network, "bob@example.org", vec![Box::new(CurrentBackend)]).await;
    let mut carol = spawn_with_backends(&network, "carol@example.org", vec![Box::new(LegacyBackend)]).await;

    let mut plaintexts = BTreeMap::new();
    plaintexts.insert(NAMESPACE.to_string(), b"hello via current".to_vec());
    plaintexts.insert(LEGACY_NAMESPACE.to_string(), b"hello via legacy".to_vec());
    let backend_priority = vec![NAMESPACE.to_string(), LEGACY_NAMESPACE.to_string()];

    let outcome = alice
        .encrypt(&recipients(&["bob@example.org", "carol@example.org"]), &plaintexts, &backend_priority)
        .await
        .expect("bob and carol are each reachable on one of alice's two loaded backends");
    assert!(outcome.device_errors.is_empty());
    assert_eq!(outcome.messages.len(), 2, "one message per backend namespace actually used");

    let current_message = outcome.messages.get(NAMESPACE).expect("bob's device only supports the current namespace");
    let legacy_message = outcome.messages.get(LEGACY_NAMESPACE).expect("carol's device only supports the legacy namespace");

    let bob_decrypted = bob.decrypt(current_message).await.expect("bob decrypts the message addressed to his namespace");
    assert_eq!(bob_decrypted.plaintext.as_deref(), Some(&b"hello via current"[..]));

    let carol_decrypted = carol.decrypt(legacy_message).await.expect("carol decrypts the message addressed to her namespace");
    assert_eq!(carol_decrypted.plaintext.as_deref(), Some(&b"hello via legacy"[..]));
}
