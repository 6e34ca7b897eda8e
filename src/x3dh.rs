//! Per-backend X3DH state: this device's own signed pre key / one-time pre key pool, the active
//! and passive halves of the key agreement, and the one-time pre key binding/consumption state
//! machine (spec section 4.2).
//!
//! Grounded in `original_source/omemo/x3dhdoubleratchet.py` (`initSessionActive`/
//! `initSessionPassive`, the `__bound_otpks`/`__pre_key_messages` binding tables, `respondedTo`,
//! `__decideBoundOTPK`) and the teacher's `src/main.rs` `x3dh_initiate_send`/`x3dh_initiate_recv`
//! prototype (corrected to the full 32-byte `F` domain separator, see [`crate::kdf`]).

use std::collections::{BTreeMap, HashMap};

use ed25519_dalek::VerifyingKey;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::backend::Backend;
use crate::bundle::{Bundle, SignedPreKeyPublic};
use crate::error::X3dhError;
use crate::identity::{ed25519_public_to_x25519, IdentityKeyPair};
use crate::kdf;
use crate::otpk_policy::{OtpkPolicy, PreKeyMessageEvent};
use crate::storage::{self, Storage};
use crate::wire;

/// Target and minimum pool sizes from spec section 4.2: refill towards 100, trigger a refill
/// once the pool drops below `pre_key_refill_threshold` (default 99), never configure that
/// threshold below 25.
pub const OTPK_POOL_TARGET_SIZE: usize = 100;
pub const OTPK_POOL_MINIMUM_SIZE: usize = 25;
pub const DEFAULT_SIGNED_PRE_KEY_ROTATION_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_PRE_KEY_REFILL_THRESHOLD: usize = 99;

#[derive(Clone, Serialize, Deserialize)]
struct StoredSignedPreKey {
    id: u32,
    secret: [u8; 32],
    signature: [u8; 64],
    created: u64,
}

impl StoredSignedPreKey {
    fn public(&self) -> X25519PublicKey {
        X25519PublicKey::from(&X25519StaticSecret::from(self.secret))
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct BoundOtpk {
    otpk_id: u32,
    events: Vec<PreKeyMessageEvent>,
}

/// The X3DH state a single backend maintains for this device: the current and retained signed
/// pre keys, the one-time pre key pool, and the per-sender-device OTPK binding table (spec
/// section 3, "OTPK binding").
#[derive(Clone, Serialize, Deserialize)]
pub struct X3dhState {
    spk: StoredSignedPreKey,
    retained_spks: Vec<StoredSignedPreKey>,
    available_otpks: BTreeMap<u32, [u8; 32]>,
    used_otpks: HashMap<u32, [u8; 32]>,
    bound: HashMap<(String, u32), BoundOtpk>,
    hidden_during_sync: Vec<(String, u32)>,
    next_otpk_id: u32,
    next_spk_id: u32,
}

fn storage_key(namespace: &str, suffix: &str) -> String {
    format!("/x3dh/{namespace}/{suffix}")
}

fn generate_spk(identity: &IdentityKeyPair, id: u32, now: u64) -> StoredSignedPreKey {
    let secret = X25519StaticSecret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret);
    let encoded = wire::encode_x25519_key(public.as_bytes());
    // XEdDSA SPK signatures are produced with the sign bit forced, so a verifier holding only
    // the identity key's X25519 form can still validate them (spec section 4.1).
    let signature = identity.sign(&encoded, Some(false));
    StoredSignedPreKey { id, secret: secret.to_bytes(), signature: signature.to_bytes(), created: now }
}

fn generate_otpks(start_id: u32, count: usize) -> (u32, BTreeMap<u32, [u8; 32]>) {
    let mut otpks = BTreeMap::new();
    let mut id = start_id;
    for _ in 0..count {
        let secret = X25519StaticSecret::random_from_rng(OsRng);
        otpks.insert(id, secret.to_bytes());
        id += 1;
    }
    (id, otpks)
}

impl X3dhState {
    /// Loads this backend's X3DH state from storage, generating a fresh signed pre key and a
    /// full one-time pre key pool if none exists yet (spec section 4.7's `create`: "for each
    /// backend in the given order, loads or creates its X3DH state").
    pub async fn load_or_create<S: Storage>(
        storage: &S,
        namespace: &str,
        identity: &IdentityKeyPair,
        now: u64,
    ) -> Result<Self, X3dhError> {
        if let Some(state) = storage::load_bincode::<_, Self>(storage, &storage_key(namespace, "state"))
            .await
            .map_err(|err| X3dhError::Identity(crate::error::IdentityError::Storage(Box::new(err))))?
        {
            return Ok(state);
        }

        let spk = generate_spk(identity, 0, now);
        let (next_otpk_id, available_otpks) = generate_otpks(0, OTPK_POOL_TARGET_SIZE);
        let state = Self {
            spk,
            retained_spks: Vec::new(),
            available_otpks,
            used_otpks: HashMap::new(),
            bound: HashMap::new(),
            hidden_during_sync: Vec::new(),
            next_otpk_id,
            next_spk_id: 1,
        };
        state.persist(storage, namespace).await?;
        Ok(state)
    }

    pub async fn persist<S: Storage>(&self, storage: &S, namespace: &str) -> Result<(), X3dhError> {
        storage::store_bincode(storage, &storage_key(namespace, "state"), self)
            .await
            .map_err(|err| X3dhError::Identity(crate::error::IdentityError::Storage(Box::new(err))))
    }

    /// Builds the publicly-advertised bundle, excluding any OTPK currently bound to a peer (spec
    /// section 4.2: an OTPK is hidden from the public bundle immediately upon being bound, not
    /// only once released).
    pub fn public_bundle(&self, identity: &IdentityKeyPair, bare_jid: &str, device_id: u32, namespace: &str) -> Bundle {
        Bundle {
            namespace: namespace.to_string(),
            bare_jid: bare_jid.to_string(),
            device_id,
            identity_key: identity.identity_key().to_bytes(),
            signed_prekey: SignedPreKeyPublic {
                id: self.spk.id,
                public: *self.spk.public().as_bytes(),
                signature: self.spk.signature,
            },
            one_time_prekeys: self.available_otpks.clone(),
        }
    }

    /// Rotates the signed pre key if `rotation_period` has elapsed since it was created, moving
    /// the previous one into the one-rotation-period retention set. Deferred while history sync
    /// is active (spec section 4.2).
    pub fn rotate_spk_if_due(&mut self, identity: &IdentityKeyPair, now: u64, rotation_period: u64, history_sync_active: bool) -> bool {
        if history_sync_active || now.saturating_sub(self.spk.created) < rotation_period {
            return false;
        }
        let new_spk = generate_spk(identity, self.next_spk_id, now);
        self.next_spk_id += 1;
        let old_spk = std::mem::replace(&mut self.spk, new_spk);
        self.retained_spks.retain(|spk| now.saturating_sub(spk.created) < rotation_period);
        self.retained_spks.push(old_spk);
        true
    }

    /// Tops the one-time pre key pool back up to [`OTPK_POOL_TARGET_SIZE`] once it drops below
    /// `refill_threshold`.
    pub fn refill_otpks_if_needed(&mut self, refill_threshold: usize) -> bool {
        if self.available_otpks.len() >= refill_threshold {
            return false;
        }
        let (next_id, fresh) = generate_otpks(self.next_otpk_id, OTPK_POOL_TARGET_SIZE - self.available_otpks.len());
        self.next_otpk_id = next_id;
        self.available_otpks.extend(fresh);
        true
    }

    fn find_spk(&self, id: u32) -> Option<&StoredSignedPreKey> {
        if self.spk.id == id {
            Some(&self.spk)
        } else {
            self.retained_spks.iter().find(|spk| spk.id == id)
        }
    }

    /// The active (initiator) half of X3DH (spec section 4.2): verifies `other_bundle`, picks a
    /// one-time pre key, computes `SK`/`AD`, and returns the key-exchange payload the wire
    /// format's pre-key message carries.
    pub fn init_session_active(
        &self,
        identity: &IdentityKeyPair,
        other_bundle: &Bundle,
        backend: &dyn Backend,
    ) -> Result<(KeyExchange, [u8; 32], Vec<u8>), X3dhError> {
        other_bundle.verify()?;

        let (otpk_id, otpk_pub) = other_bundle.pick_otpk().ok_or(X3dhError::MissingSignedPreKey)?;

        let ik_a = identity.identity_key();
        let ik_b = VerifyingKey::from_bytes(&other_bundle.identity_key).map_err(|_| X3dhError::InvalidSpkSignature)?;
        let spk_b = X25519PublicKey::from(other_bundle.signed_prekey.public);
        let otpk_b = X25519PublicKey::from(otpk_pub);

        let ek_a = X25519StaticSecret::random_from_rng(OsRng);
        let ek_a_public = X25519PublicKey::from(&ek_a);

        let dh1 = identity.diffie_hellman_x25519(&spk_b);
        let dh2 = ek_a.diffie_hellman(&ed25519_public_to_x25519(&ik_b));
        let dh3 = ek_a.diffie_hellman(&spk_b);
        let dh4 = ek_a.diffie_hellman(&otpk_b);

        let mut concat = Vec::with_capacity(32 * 4);
        concat.extend_from_slice(&dh1);
        concat.extend_from_slice(&dh2);
        concat.extend_from_slice(&dh3);
        concat.extend_from_slice(&dh4);

        let sk = kdf::x3dh_kdf(&concat, backend.x3dh_info());
        let ad = [ik_a.to_bytes(), ik_b.to_bytes()].concat();

        let kex = KeyExchange {
            spk_id: other_bundle.signed_prekey.id,
            otpk_id,
            ephemeral_key: *ek_a_public.as_bytes(),
            identity_key: ik_a,
        };

        Ok((kex, sk, ad))
    }

    /// The passive (responder) half of X3DH (spec section 4.2): resolves the referenced SPK and
    /// OTPK, maintains the OTPK binding table, and computes `SK`/`AD` symmetrically with
    /// [`init_session_active`].
    pub fn init_session_passive(
        &mut self,
        identity: &IdentityKeyPair,
        kex: &KeyExchange,
        sender_bare_jid: &str,
        sender_device_id: u32,
        backend: &dyn Backend,
        from_storage: bool,
        now: u64,
    ) -> Result<([u8; 32], Vec<u8>, X25519StaticSecret), X3dhError> {
        let spk = self.find_spk(kex.spk_id).ok_or(X3dhError::MissingSignedPreKey)?;
        let spk_secret = X25519StaticSecret::from(spk.secret);

        let otpk_secret = self.bind_otpk(sender_bare_jid, sender_device_id, kex.otpk_id, now, from_storage)?;

        let ik_b = identity.identity_key();
        let ik_a = kex.identity_key;
        let ek_a = X25519PublicKey::from(kex.ephemeral_key);

        let dh1 = spk_secret.diffie_hellman(&ed25519_public_to_x25519(&ik_a));
        let dh2 = identity.diffie_hellman_x25519(&ek_a);
        let dh3 = spk_secret.diffie_hellman(&ek_a);
        let dh4 = otpk_secret.diffie_hellman(&ek_a);

        let mut concat = Vec::with_capacity(32 * 4);
        concat.extend_from_slice(&dh1);
        concat.extend_from_slice(&dh2);
        concat.extend_from_slice(&dh3);
        concat.extend_from_slice(&dh4);

        let sk = kdf::x3dh_kdf(&concat, backend.x3dh_info());
        let ad = [ik_a.to_bytes(), ik_b.to_bytes()].concat();

        Ok((sk, ad, spk_secret))
    }

    /// Binds `otpk_id` to `(bare_jid, device_id)`, handling the three cases of spec section 4.2:
    /// no prior binding (bind fresh), a binding to the same id (reuse, append a new event for a
    /// duplicate/retried pre-key message), or a binding to a different id (release the old one,
    /// bind the new one).
    fn bind_otpk(
        &mut self,
        bare_jid: &str,
        device_id: u32,
        otpk_id: u32,
        now: u64,
        from_storage: bool,
    ) -> Result<X25519StaticSecret, X3dhError> {
        let key = (bare_jid.to_string(), device_id);

        if let Some(existing) = self.bound.get(&key) {
            if existing.otpk_id == otpk_id {
                let secret = *self.used_otpks.get(&otpk_id).ok_or(X3dhError::MissingSignedPreKey)?;
                self.bound.get_mut(&key).unwrap().events.push(PreKeyMessageEvent::new(now, from_storage));
                return Ok(X25519StaticSecret::from(secret));
            }
            self.release_binding(bare_jid, device_id);
        }

        let secret = self.available_otpks.remove(&otpk_id).ok_or(X3dhError::MissingSignedPreKey)?;
        self.used_otpks.insert(otpk_id, secret);
        self.bound.insert(key, BoundOtpk { otpk_id, events: vec![PreKeyMessageEvent::new(now, from_storage)] });
        Ok(X25519StaticSecret::from(secret))
    }

    /// Records a reply sent to a device with an active OTPK binding, feeding the default policy's
    /// "at least two answers" rule (spec section 4.2).
    pub fn record_response(&mut self, bare_jid: &str, device_id: u32, now: u64) {
        if let Some(bound) = self.bound.get_mut(&(bare_jid.to_string(), device_id)) {
            if let Some(last) = bound.events.last_mut() {
                last.answers.push(now);
            }
        }
    }

    /// Evaluates `policy` for a bound OTPK and releases it if the policy says to. Deferred while
    /// history sync is active (spec section 4.7's `before_history_sync`).
    pub fn decide_release(&mut self, bare_jid: &str, device_id: u32, policy: &dyn OtpkPolicy, history_sync_active: bool) {
        let key = (bare_jid.to_string(), device_id);
        let Some(bound) = self.bound.get(&key) else { return };

        if policy.keep(&bound.events) {
            return;
        }

        if history_sync_active {
            if !self.hidden_during_sync.contains(&key) {
                self.hidden_during_sync.push(key);
            }
            return;
        }

        self.release_binding(bare_jid, device_id);
    }

    /// Releases an OTPK binding outright: a non-pre-key message from a still-bound device (spec
    /// section 4.2's third bullet) calls this directly.
    pub fn release_binding(&mut self, bare_jid: &str, device_id: u32) {
        if let Some(bound) = self.bound.remove(&(bare_jid.to_string(), device_id)) {
            self.used_otpks.remove(&bound.otpk_id);
        }
    }

    /// Re-evaluates every binding retained during history sync once it ends (spec section 4.7's
    /// `after_history_sync`): a binding only held back because sync was active is released now
    /// unless the policy, re-run against whatever events accumulated in the meantime, still says
    /// to keep it.
    pub fn after_history_sync(&mut self, policy: &dyn OtpkPolicy) {
        for (bare_jid, device_id) in std::mem::take(&mut self.hidden_during_sync) {
            let keep = self
                .bound
                .get(&(bare_jid.clone(), device_id))
                .is_some_and(|bound| policy.keep(&bound.events));
            if !keep {
                self.release_binding(&bare_jid, device_id);
            }
        }
    }

    pub fn has_bound_otpk(&self, bare_jid: &str, device_id: u32) -> bool {
        self.bound.contains_key(&(bare_jid.to_string(), device_id))
    }
}

/// The key-exchange payload carried by a pre-key message's header (spec section 4.2's
/// `session_init_payload`): enough for the responder to reconstruct `SK`/`AD` without the
/// initiator needing to send the full SPK/OTPK public keys again.
#[derive(Clone, Debug)]
pub struct KeyExchange {
    pub spk_id: u32,
    pub otpk_id: u32,
    pub ephemeral_key: [u8; 32],
    pub identity_key: VerifyingKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::current::CurrentBackend;
    use crate::otpk_policy::DefaultOtpkPolicy;
    use crate::storage::tests::MemoryStorage;

    async fn fresh_identity() -> IdentityKeyPair {
        let storage = MemoryStorage::default();
        IdentityKeyPair::get(&storage).await.unwrap()
    }

    #[tokio::test]
    async fn active_and_passive_agree_on_the_same_shared_secret() {
        let backend = CurrentBackend;
        let alice = fresh_identity().await;
        let bob = fresh_identity().await;

        let bob_storage = MemoryStorage::default();
        let mut bob_state = X3dhState::load_or_create(&bob_storage, backend.namespace(), &bob, 0).await.unwrap();
        let bundle = bob_state.public_bundle(&bob, "bob@example.org", 1, backend.namespace());

        let (kex, sk_alice, ad_alice) = bob_state.init_session_active(&alice, &bundle, &backend).unwrap();

        let (sk_bob, ad_bob, _spk_secret) = bob_state
            .init_session_passive(&bob, &kex, "alice@example.org", 7, &backend, false, 0)
            .unwrap();

        assert_eq!(sk_alice, sk_bob);
        assert_eq!(ad_alice, ad_bob);
    }

    #[tokio::test]
    async fn rebinding_releases_the_previous_otpk() {
        let backend = CurrentBackend;
        let alice = fresh_identity().await;
        let bob = fresh_identity().await;

        let bob_storage = MemoryStorage::default();
        let mut bob_state = X3dhState::load_or_create(&bob_storage, backend.namespace(), &bob, 0).await.unwrap();
        let bundle1 = bob_state.public_bundle(&bob, "bob@example.org", 1, backend.namespace());

        let (kex1, _, _) = bob_state.init_session_active(&alice, &bundle1, &backend).unwrap();
        let otpk_id_1 = kex1.otpk_id;
        bob_state.init_session_passive(&bob, &kex1, "alice@example.org", 7, &backend, false, 0).unwrap();
        assert!(!bob_state.available_otpks.contains_key(&otpk_id_1));

        let bundle2 = bob_state.public_bundle(&bob, "bob@example.org", 1, backend.namespace());
        let (kex2, _, _) = bob_state.init_session_active(&alice, &bundle2, &backend).unwrap();
        assert_ne!(kex2.otpk_id, otpk_id_1);
        bob_state.init_session_passive(&bob, &kex2, "alice@example.org", 7, &backend, false, 1).unwrap();

        assert!(!bob_state.bound.contains_key(&("alice@example.org".to_string(), 7)) || bob_state.bound[&("alice@example.org".to_string(), 7)].otpk_id == kex2.otpk_id);
        assert!(!bob_state.used_otpks.contains_key(&otpk_id_1));
    }

    #[tokio::test]
    async fn default_policy_release_bound_via_decide_release() {
        let backend = CurrentBackend;
        let alice = fresh_identity().await;
        let bob = fresh_identity().await;
        let bob_storage = MemoryStorage::default();
        let mut bob_state = X3dhState::load_or_create(&bob_storage, backend.namespace(), &bob, 0).await.unwrap();
        let bundle = bob_state.public_bundle(&bob, "bob@example.org", 1, backend.namespace());

        let (kex, _, _) = bob_state.init_session_active(&alice, &bundle, &backend).unwrap();
        bob_state.init_session_passive(&bob, &kex, "alice@example.org", 7, &backend, false, 0).unwrap();

        bob_state.record_response("alice@example.org", 7, 0);
        bob_state.record_response("alice@example.org", 7, 25 * 3600);
        bob_state.decide_release("alice@example.org", 7, &DefaultOtpkPolicy, false);

        assert!(!bob_state.has_bound_otpk("alice@example.org", 7));
    }
}
