//! The Double Ratchet: root chain, sending/receiving symmetric chains, the DH step, and the
//! skipped-message-key store (spec section 4.3).
//!
//! Grounded in the canonical Double Ratchet algorithm as restated by spec section 4.3, and in
//! `other_examples/.../protocol-src-ratchet.rs.rs` for the Rust struct shape (own DH key pair,
//! `Option<other_dh>`, chain keys, a skipped-key map). That example keys its skipped-key map by
//! `n_messages_sent` rather than the receiving counter — a bug this implementation does not
//! repeat; skipped keys are indexed by `(dh_pub, n_r)` as spec section 3 requires. Authentication
//! is a separate step performed by the caller via [`crate::wire`]: `decrypt` derives message key
//! material on a private clone of the ratchet state and only commits the clone back if the
//! caller's MAC check (via [`commit`](DecryptAttempt::commit)) succeeds, satisfying spec section
//! 4.3's "authentication failure ⇒ ... session NOT mutated".

use std::collections::{HashMap, VecDeque};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::aead;
use crate::backend::Backend;
use crate::error::RatchetError;
use crate::kdf::{self, MessageKeys};
use crate::wire::{self, RatchetMessage, Version};

/// Default per-session skipped-key bound (spec section 4.3).
pub const DEFAULT_MAX_PER_SESSION_SKIPPED: usize = 1000;

#[derive(Clone)]
struct SkippedKeys {
    seeds: HashMap<([u8; 32], u32), [u8; 32]>,
    order: VecDeque<([u8; 32], u32)>,
    max_per_session: usize,
}

impl SkippedKeys {
    fn new(max_per_session: usize) -> Self {
        Self { seeds: HashMap::new(), order: VecDeque::new(), max_per_session }
    }

    fn insert(&mut self, dh_pub: [u8; 32], n: u32, seed: [u8; 32]) {
        if self.seeds.insert((dh_pub, n), seed).is_none() {
            self.order.push_back((dh_pub, n));
        }
        while self.order.len() > self.max_per_session {
            if let Some(oldest) = self.order.pop_front() {
                self.seeds.remove(&oldest);
            }
        }
    }

    fn take(&mut self, dh_pub: &[u8; 32], n: u32) -> Option<[u8; 32]> {
        let key = (*dh_pub, n);
        let seed = self.seeds.remove(&key)?;
        self.order.retain(|entry| entry != &key);
        Some(seed)
    }

    fn entries(&self) -> Vec<([u8; 32], u32, [u8; 32])> {
        self.order.iter().map(|(dh_pub, n)| (*dh_pub, *n, self.seeds[&(*dh_pub, *n)])).collect()
    }
}

/// Per-(namespace, bare_jid, device_id) Double Ratchet session state (spec section 3's
/// `Session` entity, minus the parts [`crate::session::Session`] owns at a higher level).
#[derive(Clone)]
pub struct DoubleRatchet {
    root_key: [u8; 32],
    own_dh_secret: X25519StaticSecret,
    own_dh_public: X25519PublicKey,
    other_dh: Option<[u8; 32]>,
    sending_chain_key: Option<[u8; 32]>,
    n_s: u32,
    receiving_chain_key: Option<[u8; 32]>,
    n_r: u32,
    prev_sending_n: u32,
    skipped: SkippedKeys,
    max_per_message: usize,
    associated_data: Vec<u8>,
    root_info: &'static [u8],
    message_info: &'static [u8],
}

/// The persistable snapshot of a [`DoubleRatchet`] (spec section 4.7: "Persisted state layout
/// ... backend-scoped subpaths for X3DH state and per-peer sessions (keys are backend's
/// responsibility; opaque to the core)"). Backend-derived constants are not included; see
/// [`DoubleRatchet::export`].
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredRatchet {
    root_key: [u8; 32],
    own_dh_secret: [u8; 32],
    other_dh: Option<[u8; 32]>,
    sending_chain_key: Option<[u8; 32]>,
    n_s: u32,
    receiving_chain_key: Option<[u8; 32]>,
    n_r: u32,
    prev_sending_n: u32,
    skipped_seeds: Vec<([u8; 32], u32, [u8; 32])>,
    max_per_session: usize,
    max_per_message: usize,
    associated_data: Vec<u8>,
}

impl DoubleRatchet {
    /// Initializes the active (initiating) side: `SK` becomes the root key, `other_dh_public` is
    /// the peer's signed pre key used as the initial remote DH public (spec section 4.2,
    /// "Initiates the Double Ratchet with SK as root key, other's SPK as the initial remote DH
    /// public, and AD").
    pub fn init_active(
        sk: [u8; 32],
        other_dh_public: [u8; 32],
        associated_data: Vec<u8>,
        backend: &dyn Backend,
        max_per_session: usize,
        max_per_message: usize,
    ) -> Self {
        let own_dh_secret = X25519StaticSecret::random_from_rng(rand_core::OsRng);
        let own_dh_public = X25519PublicKey::from(&own_dh_secret);
        let dh_out = own_dh_secret.diffie_hellman(&X25519PublicKey::from(other_dh_public));
        let (root_key, sending_chain_key) = kdf::kdf_root(&sk, dh_out.as_bytes(), backend.root_chain_info());

        Self {
            root_key,
            own_dh_secret,
            own_dh_public,
            other_dh: Some(other_dh_public),
            sending_chain_key: Some(sending_chain_key),
            n_s: 0,
            receiving_chain_key: None,
            n_r: 0,
            prev_sending_n: 0,
            skipped: SkippedKeys::new(max_per_session),
            max_per_message,
            associated_data,
            root_info: backend.root_chain_info(),
            message_info: backend.message_keys_info(),
        }
    }

    /// Initializes the passive (responding) side: `SK` becomes the root key, `own_dh` (this
    /// device's own signed pre key pair) is the initial local DH key (spec section 4.2,
    /// "Returns a passive Double Ratchet with SK as root key, own SPK as the initial local DH
    /// key, and AD").
    pub fn init_passive(
        sk: [u8; 32],
        own_dh_secret: X25519StaticSecret,
        associated_data: Vec<u8>,
        backend: &dyn Backend,
        max_per_session: usize,
        max_per_message: usize,
    ) -> Self {
        let own_dh_public = X25519PublicKey::from(&own_dh_secret);
        Self {
            root_key: sk,
            own_dh_secret,
            own_dh_public,
            other_dh: None,
            sending_chain_key: None,
            n_s: 0,
            receiving_chain_key: None,
            n_r: 0,
            prev_sending_n: 0,
            skipped: SkippedKeys::new(max_per_session),
            max_per_message,
            associated_data,
            root_info: backend.root_chain_info(),
            message_info: backend.message_keys_info(),
        }
    }

    /// Encrypts `plaintext`, advancing the sending chain and returning the fully wire-framed
    /// message (header + ciphertext + MAC), spec section 4.3's `Encrypt`.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        ik_sender: &VerifyingKey,
        ik_receiver: &VerifyingKey,
        version: Version,
    ) -> Vec<u8> {
        let chain_key = self.sending_chain_key.expect(
            "a sending chain always exists: init_active seeds one, and receiving a message always derives one via the DH step before encrypt can be called again",
        );
        let mk_seed = kdf::kdf_message_key_seed(&chain_key);
        self.sending_chain_key = Some(kdf::kdf_chain_key(&chain_key));

        let header_n = self.n_s;
        self.n_s += 1;

        let keys = kdf::expand_message_keys(&mk_seed, self.message_info);
        let ciphertext = aead::cbc_encrypt(&keys.encryption_key, &keys.iv, plaintext);

        let message = RatchetMessage {
            dh_ratchet_key: *self.own_dh_public.as_bytes(),
            n: header_n,
            pn: self.prev_sending_n,
            ciphertext,
        };
        wire::encode_ratchet_message(version, &message, ik_sender, ik_receiver, &keys.mac_key)
    }

    /// Decrypts a wire-framed message. State is mutated only if both the version check and the
    /// MAC verification succeed; any failure leaves `self` exactly as it was (spec section 4.3,
    /// "session NOT mutated").
    pub fn decrypt(
        &mut self,
        wire_bytes: &[u8],
        ik_sender: &VerifyingKey,
        ik_receiver: &VerifyingKey,
        expected_version: Version,
    ) -> Result<Vec<u8>, RatchetError> {
        let decoded = wire::decode_ratchet_message(wire_bytes)?;
        wire::check_version(decoded.version, expected_version)?;

        let mut trial = self.clone();
        let keys = trial.derive_decrypt_keys(&decoded.message)?;

        if !wire::verify_ratchet_mac(&decoded, &keys.mac_key, ik_sender, ik_receiver) {
            return Err(RatchetError::AuthenticationFailed);
        }

        let plaintext = aead::cbc_decrypt(&keys.encryption_key, &keys.iv, &decoded.message.ciphertext)?;

        *self = trial;
        Ok(plaintext)
    }

    /// Derives the message key material for an incoming header, performing the DH step and/or
    /// skipped-key bookkeeping as needed. Called on a scratch clone so the caller can discard all
    /// of this on MAC failure.
    fn derive_decrypt_keys(&mut self, message: &RatchetMessage) -> Result<MessageKeys, RatchetError> {
        if let Some(seed) = self.skipped.take(&message.dh_ratchet_key, message.n) {
            return Ok(kdf::expand_message_keys(&seed, self.message_info));
        }

        if self.other_dh != Some(message.dh_ratchet_key) {
            self.skip_message_keys(message.pn)?;
            self.dh_ratchet_step(message.dh_ratchet_key);
        }

        self.skip_message_keys(message.n)?;

        let chain_key = self.receiving_chain_key.expect("skip_message_keys establishes a receiving chain before returning");
        let mk_seed = kdf::kdf_message_key_seed(&chain_key);
        self.receiving_chain_key = Some(kdf::kdf_chain_key(&chain_key));
        self.n_r = message.n + 1;

        Ok(kdf::expand_message_keys(&mk_seed, self.message_info))
    }

    /// Advances the receiving chain up to (but not including) `until`, stashing each skipped
    /// message key seed for later out-of-order delivery (spec section 4.3 step 2).
    fn skip_message_keys(&mut self, until: u32) -> Result<(), RatchetError> {
        let requested = until.saturating_sub(self.n_r);
        if requested as usize > self.max_per_message {
            return Err(RatchetError::TooManySkippedMessages { requested, bound: self.max_per_message as u32 });
        }

        let Some(mut chain_key) = self.receiving_chain_key else { return Ok(()) };
        let dh_pub = self.other_dh.expect("a receiving chain only exists once other_dh has been set by a prior DH step");

        while self.n_r < until {
            let mk_seed = kdf::kdf_message_key_seed(&chain_key);
            self.skipped.insert(dh_pub, self.n_r, mk_seed);
            chain_key = kdf::kdf_chain_key(&chain_key);
            self.n_r += 1;
        }
        self.receiving_chain_key = Some(chain_key);
        Ok(())
    }

    /// The DH ratchet step: replaces `other_dh`, derives a fresh receiving chain from the
    /// now-stale local DH key, then generates a new local DH key pair and derives a fresh sending
    /// chain from it (spec section 4.3 step 1).
    fn dh_ratchet_step(&mut self, other_dh_public: [u8; 32]) {
        self.prev_sending_n = self.n_s;
        self.n_s = 0;
        self.n_r = 0;
        self.other_dh = Some(other_dh_public);

        let other_point = X25519PublicKey::from(other_dh_public);

        let dh_out_recv = self.own_dh_secret.diffie_hellman(&other_point);
        let (root_key, receiving_chain_key) = kdf::kdf_root(&self.root_key, dh_out_recv.as_bytes(), self.root_info);
        self.root_key = root_key;
        self.receiving_chain_key = Some(receiving_chain_key);

        self.own_dh_secret = X25519StaticSecret::random_from_rng(rand_core::OsRng);
        self.own_dh_public = X25519PublicKey::from(&self.own_dh_secret);

        let dh_out_send = self.own_dh_secret.diffie_hellman(&other_point);
        let (root_key, sending_chain_key) = kdf::kdf_root(&self.root_key, dh_out_send.as_bytes(), self.root_info);
        self.root_key = root_key;
        self.sending_chain_key = Some(sending_chain_key);
    }

    /// Exports the persistable parts of this ratchet's state. `root_info`/`message_info` are not
    /// included: they are a deterministic function of the backend and are re-supplied by
    /// [`import`](Self::import) rather than round-tripped, so a stored session stays valid across
    /// backend constant changes picked up by a crate upgrade.
    pub fn export(&self) -> StoredRatchet {
        StoredRatchet {
            root_key: self.root_key,
            own_dh_secret: self.own_dh_secret.to_bytes(),
            other_dh: self.other_dh,
            sending_chain_key: self.sending_chain_key,
            n_s: self.n_s,
            receiving_chain_key: self.receiving_chain_key,
            n_r: self.n_r,
            prev_sending_n: self.prev_sending_n,
            skipped_seeds: self.skipped.entries(),
            max_per_session: self.skipped.max_per_session,
            max_per_message: self.max_per_message,
            associated_data: self.associated_data.clone(),
        }
    }

    pub fn import(stored: StoredRatchet, backend: &dyn Backend) -> Self {
        let own_dh_secret = X25519StaticSecret::from(stored.own_dh_secret);
        let own_dh_public = X25519PublicKey::from(&own_dh_secret);
        let mut skipped = SkippedKeys::new(stored.max_per_session);
        for (dh_pub, n, seed) in stored.skipped_seeds {
            skipped.insert(dh_pub, n, seed);
        }
        Self {
            root_key: stored.root_key,
            own_dh_secret,
            own_dh_public,
            other_dh: stored.other_dh,
            sending_chain_key: stored.sending_chain_key,
            n_s: stored.n_s,
            receiving_chain_key: stored.receiving_chain_key,
            n_r: stored.n_r,
            prev_sending_n: stored.prev_sending_n,
            skipped,
            max_per_message: stored.max_per_message,
            associated_data: stored.associated_data,
            root_info: backend.root_chain_info(),
            message_info: backend.message_keys_info(),
        }
    }

    pub fn own_dh_public(&self) -> [u8; 32] {
        *self.own_dh_public.as_bytes()
    }

    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    /// Number of messages received on the current receiving chain; used by
    /// [`crate::session_manager::SessionManager`] to decide whether a heartbeat is due.
    pub fn received_on_current_chain(&self) -> u32 {
        self.n_r
    }
}
