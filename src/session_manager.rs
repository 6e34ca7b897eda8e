//! `SessionManager`: the per-account orchestrator tying identity, X3DH, the Double Ratchet, and
//! the embedder-supplied transport/storage capabilities together (spec section 4.7).
//!
//! Grounded in `original_source/omemo/session_manager.py` (`SessionManager.create`,
//! `encryptMessage`, `decryptMessage`, `newDeviceList`, `setTrust`, `beforeHistorySync`/
//! `afterHistorySync`, `HEARTBEAT_MESSAGE_TRIGGER`) and the teacher's server-side storage-backend
//! style (map errors at the boundary, log and continue on auto-response failures) this module
//! follows throughout.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::bundle::Bundle;
use crate::error::SessionManagerError;
use crate::identity::IdentityKeyPair;
use crate::message::{BackendMessage, ContentKey};
use crate::otpk_policy::{DefaultOtpkPolicy, OtpkPolicy};
use crate::ratchet::{DEFAULT_MAX_PER_SESSION_SKIPPED, DoubleRatchet};
use crate::session::{self, Session};
use crate::storage::{self, Storage};
use crate::trust::{DeviceInformation, TrustLevel};
use crate::wire::Version;
use crate::x3dh::{self, X3dhState};

/// Minimum receiving-chain progress before an empty heartbeat message is scheduled, forcing a DH
/// step so neither side's receiving chain grows unbounded between replies (spec section 4.7).
pub const HEARTBEAT_MESSAGE_TRIGGER: u32 = 53;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock is after 1970").as_secs()
}

/// Tunables collected from spec section 4.7's `create` parameter list.
#[derive(Clone, Debug)]
pub struct SessionManagerConfig {
    pub undecided_trust_level_name: String,
    pub decrypt_when_undecided: bool,
    pub max_num_per_session_skipped_keys: usize,
    pub max_num_per_message_skipped_keys: usize,
    pub signed_pre_key_rotation_period_secs: u64,
    pub pre_key_refill_threshold: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            undecided_trust_level_name: "undecided".to_string(),
            decrypt_when_undecided: true,
            max_num_per_session_skipped_keys: DEFAULT_MAX_PER_SESSION_SKIPPED,
            max_num_per_message_skipped_keys: DEFAULT_MAX_PER_SESSION_SKIPPED,
            signed_pre_key_rotation_period_secs: x3dh::DEFAULT_SIGNED_PRE_KEY_ROTATION_PERIOD_SECS,
            pre_key_refill_threshold: x3dh::DEFAULT_PRE_KEY_REFILL_THRESHOLD,
        }
    }
}

impl SessionManagerConfig {
    fn validate(&self) -> Result<(), SessionManagerError> {
        if self.pre_key_refill_threshold < x3dh::OTPK_POOL_MINIMUM_SIZE {
            return Err(SessionManagerError::InvalidConfig(format!(
                "pre_key_refill_threshold must be at least {}, got {}",
                x3dh::OTPK_POOL_MINIMUM_SIZE,
                self.pre_key_refill_threshold
            )));
        }
        if self.max_num_per_message_skipped_keys > self.max_num_per_session_skipped_keys {
            return Err(SessionManagerError::InvalidConfig(
                "max_num_per_message_skipped_keys cannot exceed max_num_per_session_skipped_keys".to_string(),
            ));
        }
        Ok(())
    }
}

/// The embedder-supplied operations of spec section 6: transport, PubSub-like bundle/device-list
/// storage, and trust policy hooks this crate cannot implement itself.
#[async_trait]
pub trait SessionDelegate: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn upload_bundle(&self, bundle: &Bundle) -> Result<(), Self::Error>;
    async fn download_bundle(&self, namespace: &str, bare_jid: &str, device_id: u32) -> Result<Bundle, Self::Error>;
    async fn delete_bundle(&self, namespace: &str, device_id: u32) -> Result<(), Self::Error>;
    async fn upload_device_list(&self, namespace: &str, device_list: &BTreeMap<u32, Option<String>>) -> Result<(), Self::Error>;
    async fn download_device_list(&self, namespace: &str, bare_jid: &str) -> Result<BTreeMap<u32, Option<String>>, Self::Error>;
    /// Sends an automatically-generated message (heartbeat, handshake response, session re-init
    /// request). Failures here are logged, not surfaced (spec section 7).
    async fn send_message(&self, namespace: &str, bare_jid: &str, message: &BackendMessage) -> Result<(), Self::Error>;
    /// Maps an embedder-defined `trust_level_name` to one of the three core trust levels. Only
    /// the embedder knows the vocabulary of names it stores (spec.md section 3: `trust_level_name`
    /// is opaque to this crate); a name the embedder does not recognize is reported as `Err`.
    async fn evaluate_custom_trust_level(&self, bare_jid: &str, identity_key: &[u8; 32], trust_level_name: &str) -> Result<TrustLevel, Self::Error>;
    /// Called with the still-undecided `(bare_jid, device_id)` set; expected to call
    /// [`SessionManager::set_trust`] for each device it reaches a decision on.
    async fn make_trust_decision(&self, undecided: &BTreeSet<(String, u32)>, identifier: &str) -> Result<(), Self::Error>;
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct DeviceMeta {
    identity_key: Option<[u8; 32]>,
    active: bool,
    last_used: u64,
}

struct BackendEntry {
    backend: Box<dyn Backend>,
    x3dh: X3dhState,
}

/// Key into [`SessionManager::sessions`].
type SessionKey = (String, String, u32);

/// The result of [`SessionManager::encrypt`]: zero or one assembled message per namespace that
/// had at least one eligible target device, plus per-device errors for devices that could not be
/// reached (spec section 4.7 step 7: "per-device encryption errors").
#[derive(Debug)]
pub struct EncryptOutcome {
    pub messages: BTreeMap<String, BackendMessage>,
    pub device_errors: BTreeMap<(String, u32), SessionManagerError>,
}

/// The result of [`SessionManager::decrypt`]: the plaintext (`None` for a pure key-transport or
/// empty auto-message), the sender's device information, and whether this decrypt completed a
/// fresh handshake (useful for embedders who want to log session establishment).
#[derive(Debug)]
pub struct DecryptOutcome {
    pub plaintext: Option<Vec<u8>>,
    pub sender_bare_jid: String,
    pub sender_device_id: u32,
    pub fresh_session: bool,
}

pub struct SessionManager<S: Storage, D: SessionDelegate> {
    storage: S,
    delegate: D,
    config: SessionManagerConfig,
    otpk_policy: Box<dyn OtpkPolicy>,
    identity: IdentityKeyPair,
    own_bare_jid: String,
    own_device_id: u32,
    own_label: Option<String>,
    backends: Vec<BackendEntry>,
    device_lists: HashMap<(String, String), BTreeMap<u32, Option<String>>>,
    device_meta: HashMap<(String, String, u32), DeviceMeta>,
    trust: HashMap<(String, [u8; 32]), String>,
    sessions: HashMap<SessionKey, Session>,
    history_sync_active: bool,
}

impl<S: Storage, D: SessionDelegate> SessionManager<S, D> {
    /// Loads or creates every backend's X3DH state, in order, uploading each bundle and only then
    /// updating the device list for that backend — spec section 4.7: "The device-list update is
    /// the LAST step per backend so failure midway does not advertise an inconsistent device."
    pub async fn create(
        storage: S,
        delegate: D,
        backends: Vec<Box<dyn Backend>>,
        own_bare_jid: String,
        initial_own_label: Option<String>,
        config: SessionManagerConfig,
    ) -> Result<Self, SessionManagerError> {
        config.validate()?;

        let identity = IdentityKeyPair::get(&storage).await?;
        let now = now_unix();

        let own_device_id = match storage.load_int("/SessionManager/own_device_id").await.map_err(SessionManagerError::storage)? {
            Some(id) => id as u32,
            None => {
                let id = rand_device_id();
                storage.store_int("/SessionManager/own_device_id", id as i64).await.map_err(SessionManagerError::storage)?;
                id
            }
        };

        let mut manager = Self {
            storage,
            delegate,
            config,
            otpk_policy: Box::new(DefaultOtpkPolicy),
            identity,
            own_bare_jid,
            own_device_id,
            own_label: initial_own_label,
            backends: Vec::new(),
            device_lists: HashMap::new(),
            device_meta: HashMap::new(),
            trust: HashMap::new(),
            sessions: HashMap::new(),
            history_sync_active: true,
        };

        for backend in backends {
            let namespace = backend.namespace().to_string();
            let mut x3dh = X3dhState::load_or_create(&manager.storage, &namespace, &manager.identity, now).await?;
            x3dh.refill_otpks_if_needed(manager.config.pre_key_refill_threshold);
            x3dh.persist(&manager.storage, &namespace).await?;

            let bundle = x3dh.public_bundle(&manager.identity, &manager.own_bare_jid, manager.own_device_id, &namespace);
            manager.delegate.upload_bundle(&bundle).await.map_err(|err| {
                tracing::warn!(%namespace, error = %err, "bundle upload failed");
                SessionManagerError::BundleUploadFailed
            })?;

            manager.backends.push(BackendEntry { backend, x3dh });

            // Routed through `update_device_list` (rather than inserted directly) so the own
            // device is also recorded as active in `device_meta`, same as any other device
            // learned via a device-list update.
            let downloaded = manager.delegate.download_device_list(&namespace, &manager.own_bare_jid).await.unwrap_or_default();
            let own_bare_jid = manager.own_bare_jid.clone();
            manager.update_device_list(&namespace, &own_bare_jid, downloaded).await?;

            tracing::info!(%namespace, device_id = manager.own_device_id, "backend initialized");
        }

        Ok(manager)
    }

    fn backend_entry(&self, namespace: &str) -> Result<&BackendEntry, SessionManagerError> {
        self.backends
            .iter()
            .find(|entry| entry.backend.namespace() == namespace)
            .ok_or_else(|| SessionManagerError::UnknownNamespace(namespace.to_string()))
    }

    fn backend_entry_mut(&mut self, namespace: &str) -> Result<&mut BackendEntry, SessionManagerError> {
        self.backends
            .iter_mut()
            .find(|entry| entry.backend.namespace() == namespace)
            .ok_or_else(|| SessionManagerError::UnknownNamespace(namespace.to_string()))
    }

    async fn persist_session(&self, key: &SessionKey) -> Result<(), SessionManagerError> {
        if let Some(session) = self.sessions.get(key) {
            let storage_key = format!("/sessions/{}/{}/{}", key.0, key.1, key.2);
            storage::store_bincode(&self.storage, &storage_key, &session.export()).await.map_err(SessionManagerError::storage)?;
        }
        Ok(())
    }

    async fn load_session(&self, namespace: &str, bare_jid: &str, device_id: u32) -> Result<Option<Session>, SessionManagerError> {
        let storage_key = format!("/sessions/{namespace}/{bare_jid}/{device_id}");
        let stored: Option<session::StoredSession> = storage::load_bincode(&self.storage, &storage_key).await.map_err(SessionManagerError::storage)?;
        let backend = self.backend_entry(namespace)?;
        Ok(stored.map(|stored| Session::import(stored, backend.backend.as_ref())))
    }

    /// Reconciles a freshly downloaded or pushed device list for `(namespace, bare_jid)`. Own
    /// device missing (or the whole list empty) triggers immediate republication (spec section
    /// 4.7 and the Open Question in SPEC_FULL.md section 9 treating an empty own list the same
    /// way).
    pub async fn update_device_list(&mut self, namespace: &str, bare_jid: &str, mut device_list: BTreeMap<u32, Option<String>>) -> Result<(), SessionManagerError> {
        let now = now_unix();
        let is_own = bare_jid == self.own_bare_jid;

        if is_own && (device_list.is_empty() || !device_list.contains_key(&self.own_device_id)) {
            device_list.insert(self.own_device_id, self.own_label.clone());
            self.delegate
                .upload_device_list(namespace, &device_list)
                .await
                .map_err(|_| SessionManagerError::DeviceListUploadFailed)?;
        }

        let key = (namespace.to_string(), bare_jid.to_string());
        let previous = self.device_lists.get(&key).cloned().unwrap_or_default();
        for (device_id, _) in previous.iter() {
            if !device_list.contains_key(device_id) {
                let meta = self.device_meta.entry((namespace.to_string(), bare_jid.to_string(), *device_id)).or_default();
                meta.active = false;
            }
        }
        for device_id in device_list.keys() {
            let meta = self.device_meta.entry((namespace.to_string(), bare_jid.to_string(), *device_id)).or_default();
            if !meta.active {
                meta.active = true;
                meta.last_used = now;
            }
        }

        self.device_lists.insert(key, device_list);
        Ok(())
    }

    /// Rotates any signed pre key whose rotation period has elapsed and tops up any one-time pre
    /// key pool that has dropped below its refill threshold, republishing the bundle for any
    /// backend where either happened (spec section 3: a `Bundle` is "republished on SPK rotation
    /// or OTPK refill"). Deferred per-backend while history sync is active. Called automatically
    /// at the start of [`encrypt`](Self::encrypt); embedders that want rotation to happen even
    /// when idle may also call it directly on their own schedule.
    pub async fn perform_maintenance(&mut self) -> Result<(), SessionManagerError> {
        let now = now_unix();
        let namespaces: Vec<String> = self.backends.iter().map(|entry| entry.backend.namespace().to_string()).collect();

        let rotation_period = self.config.signed_pre_key_rotation_period_secs;
        let refill_threshold = self.config.pre_key_refill_threshold;
        let history_sync_active = self.history_sync_active;

        for namespace in namespaces {
            // Disjoint field access (not routed through `backend_entry_mut`, which borrows all of
            // `self`): `self.backends` is mutated while `self.identity`/`self.storage`/
            // `self.own_bare_jid`/`self.own_device_id` are read, which the borrow checker accepts
            // because they are distinct fields of `self`.
            let entry = self
                .backends
                .iter_mut()
                .find(|entry| entry.backend.namespace() == namespace.as_str())
                .ok_or_else(|| SessionManagerError::UnknownNamespace(namespace.clone()))?;
            let rotated = entry.x3dh.rotate_spk_if_due(&self.identity, now, rotation_period, history_sync_active);
            let refilled = entry.x3dh.refill_otpks_if_needed(refill_threshold);

            if !rotated && !refilled {
                continue;
            }

            entry.x3dh.persist(&self.storage, &namespace).await?;
            let bundle = entry.x3dh.public_bundle(&self.identity, &self.own_bare_jid, self.own_device_id, &namespace);
            if let Err(err) = self.delegate.upload_bundle(&bundle).await {
                tracing::warn!(%namespace, error = %err, "bundle republication failed after spk rotation or otpk refill");
            } else {
                tracing::info!(%namespace, rotated, refilled, "bundle republished");
            }
        }

        Ok(())
    }

    pub async fn refresh_device_list(&mut self, namespace: &str, bare_jid: &str) -> Result<(), SessionManagerError> {
        let device_list = self
            .delegate
            .download_device_list(namespace, bare_jid)
            .await
            .map_err(|_| SessionManagerError::DeviceListDownloadFailed)?;
        self.update_device_list(namespace, bare_jid, device_list).await
    }

    pub fn set_trust(&mut self, bare_jid: &str, identity_key: [u8; 32], trust_level_name: &str) {
        self.trust.insert((bare_jid.to_string(), identity_key), trust_level_name.to_string());
    }

    /// Discards every known session for `bare_jid` and schedules an empty message to each device
    /// so the peer re-initiates passively (spec section 4.7).
    pub async fn replace_sessions(&mut self, bare_jid: &str) -> Result<(), SessionManagerError> {
        let keys: Vec<SessionKey> = self.sessions.keys().filter(|(_, jid, _)| jid == bare_jid).cloned().collect();
        for key in &keys {
            self.sessions.remove(key);
            let storage_key = format!("/sessions/{}/{}/{}", key.0, key.1, key.2);
            self.storage.delete(&storage_key).await.map_err(SessionManagerError::storage)?;
            let empty = BackendMessage {
                namespace: key.0.clone(),
                sender_bare_jid: self.own_bare_jid.clone(),
                sender_device_id: self.own_device_id,
                payload_ciphertext: None,
                payload_nonce: None,
                submessages: BTreeMap::new(),
            };
            if let Err(err) = self.delegate.send_message(&key.0, &key.1, &empty).await {
                tracing::warn!(error = %err, "session re-init notification failed to send");
            }
        }
        Ok(())
    }

    pub async fn purge_bare_jid(&mut self, bare_jid: &str) -> Result<(), SessionManagerError> {
        self.sessions.retain(|(_, jid, _), _| jid != bare_jid);
        self.device_lists.retain(|(_, jid), _| jid != bare_jid);
        self.device_meta.retain(|(_, jid, _), _| jid != bare_jid);
        self.trust.retain(|(jid, _), _| jid != bare_jid);
        Ok(())
    }

    /// Deletes this device's own bundle, removes it from the backend's device list, and drops
    /// the backend's X3DH state and every session under that namespace (spec section 4.7).
    pub async fn purge_backend(&mut self, namespace: &str) -> Result<(), SessionManagerError> {
        self.backend_entry(namespace)?;

        self.delegate
            .delete_bundle(namespace, self.own_device_id)
            .await
            .map_err(|_| SessionManagerError::BundleDeletionFailed)?;

        if let Some(list) = self.device_lists.get_mut(&(namespace.to_string(), self.own_bare_jid.clone())) {
            list.remove(&self.own_device_id);
            let snapshot = list.clone();
            self.delegate
                .upload_device_list(namespace, &snapshot)
                .await
                .map_err(|_| SessionManagerError::DeviceListUploadFailed)?;
        }

        self.sessions.retain(|(ns, _, _), _| ns != namespace);
        self.backends.retain(|entry| entry.backend.namespace() != namespace);
        Ok(())
    }

    pub async fn set_own_label(&mut self, label: Option<String>) -> Result<(), SessionManagerError> {
        self.own_label = label.clone();
        for entry in &self.backends {
            if !entry.backend.supports_labels() {
                continue;
            }
            let namespace = entry.backend.namespace().to_string();
            if let Some(list) = self.device_lists.get_mut(&(namespace.clone(), self.own_bare_jid.clone())) {
                list.insert(self.own_device_id, label.clone());
                let snapshot = list.clone();
                self.delegate
                    .upload_device_list(&namespace, &snapshot)
                    .await
                    .map_err(|_| SessionManagerError::DeviceListUploadFailed)?;
            }
        }
        Ok(())
    }

    fn build_device_information(&self, bare_jid: &str) -> Vec<DeviceInformation> {
        let mut by_device: BTreeMap<u32, DeviceInformation> = BTreeMap::new();

        for entry in &self.backends {
            let namespace = entry.backend.namespace();
            let Some(list) = self.device_lists.get(&(namespace.to_string(), bare_jid.to_string())) else { continue };

            for (device_id, label) in list {
                let meta = self.device_meta.get(&(namespace.to_string(), bare_jid.to_string(), *device_id)).cloned().unwrap_or_default();
                let Some(identity_key) = meta.identity_key else { continue };
                let trust_level_name = self
                    .trust
                    .get(&(bare_jid.to_string(), identity_key))
                    .cloned()
                    .unwrap_or_else(|| self.config.undecided_trust_level_name.clone());

                let info = by_device.entry(*device_id).or_insert_with(|| DeviceInformation {
                    namespaces: Default::default(),
                    bare_jid: bare_jid.to_string(),
                    device_id: *device_id,
                    identity_key,
                    trust_level_name: trust_level_name.clone(),
                    active: meta.active,
                    last_used: meta.last_used,
                    label: label.clone(),
                });
                info.namespaces.insert(namespace.to_string());
            }
        }

        by_device.into_values().collect()
    }

    pub async fn get_device_information(&mut self, bare_jid: &str) -> Result<Vec<DeviceInformation>, SessionManagerError> {
        let needs_refresh = self.backends.iter().all(|entry| !self.device_lists.contains_key(&(entry.backend.namespace().to_string(), bare_jid.to_string())));
        if needs_refresh {
            let namespaces: Vec<String> = self.backends.iter().map(|entry| entry.backend.namespace().to_string()).collect();
            for namespace in namespaces {
                let _ = self.refresh_device_list(&namespace, bare_jid).await;
            }
        }

        // A device list entry carries no identity key, only a device id and label; a device seen
        // only through the device list (never through a decrypted key exchange) needs its bundle
        // fetched before it can be named as eligible for encryption (spec section 4.7 step 6).
        let namespaces: Vec<String> = self.backends.iter().map(|entry| entry.backend.namespace().to_string()).collect();
        for namespace in namespaces {
            let device_ids: Vec<u32> = self
                .device_lists
                .get(&(namespace.clone(), bare_jid.to_string()))
                .map(|list| list.keys().copied().collect())
                .unwrap_or_default();
            for device_id in device_ids {
                if self.device_identity_key(&namespace, bare_jid, device_id).is_none() {
                    let _ = self.resolve_device_identity_key(&namespace, bare_jid, device_id).await;
                }
            }
        }

        Ok(self.build_device_information(bare_jid))
    }

    /// Learns and verifies a device's identity key from its published bundle. Used to discover a
    /// device that has only ever been seen in a device list, before any message has been
    /// exchanged with it directly.
    async fn resolve_device_identity_key(&mut self, namespace: &str, bare_jid: &str, device_id: u32) -> Option<[u8; 32]> {
        let bundle = self.delegate.download_bundle(namespace, bare_jid, device_id).await.ok()?;
        if bundle.verify().is_err() {
            tracing::warn!(%namespace, %bare_jid, device_id, "rejected bundle with invalid signed pre key signature");
            return None;
        }
        let identity_key = bundle.identity_key;
        self.device_meta.entry((namespace.to_string(), bare_jid.to_string(), device_id)).or_default().identity_key = Some(identity_key);
        Some(identity_key)
    }

    pub async fn get_own_device_information(&mut self) -> Result<Vec<DeviceInformation>, SessionManagerError> {
        let own = self.own_bare_jid.clone();
        self.get_device_information(&own).await
    }

    /// Enters history-synchronization mode: OTPK release, SPK rotation, and `last_used` updates
    /// are deferred or suppressed until [`after_history_sync`](Self::after_history_sync).
    pub fn before_history_sync(&mut self) {
        self.history_sync_active = true;
    }

    pub fn after_history_sync(&mut self) {
        self.history_sync_active = false;
        for entry in &mut self.backends {
            entry.x3dh.after_history_sync(self.otpk_policy.as_ref());
        }
    }

    /// Spec section 4.7 step 4: "After [`_make_trust_decision`] returns, re-read trust; if any
    /// device still Undecided, fail." Both checks below must consult the live `self.trust` table
    /// rather than the `DeviceInformation` snapshot captured before the decision was made, or a
    /// delegate that actually decides trust would still be reported as still-undecided.
    async fn resolve_trust(&mut self, devices: &[DeviceInformation], identifier: &str) -> Result<(), SessionManagerError> {
        let mut undecided = BTreeSet::new();
        for device in devices {
            if self.trust_level_for(&device.bare_jid, &device.identity_key).await? == TrustLevel::Undecided {
                undecided.insert((device.bare_jid.clone(), device.device_id));
            }
        }
        if undecided.is_empty() {
            return Ok(());
        }

        self.delegate.make_trust_decision(&undecided, identifier).await.map_err(|_| SessionManagerError::TrustDecisionFailed)?;

        let mut still_undecided = BTreeSet::new();
        for device in devices {
            if undecided.contains(&(device.bare_jid.clone(), device.device_id))
                && self.trust_level_for(&device.bare_jid, &device.identity_key).await? == TrustLevel::Undecided
            {
                still_undecided.insert((device.bare_jid.clone(), device.device_id));
            }
        }

        if !still_undecided.is_empty() {
            return Err(SessionManagerError::StillUndecided(still_undecided));
        }
        Ok(())
    }

    /// Resolves a device's trust level by looking up its stored custom trust-level name in the
    /// live `self.trust` table (falling back to the configured undecided name if no trust has
    /// ever been recorded) and asking the embedder's `evaluate_custom_trust_level` to classify it
    /// — `trust_level_name` is an opaque, embedder-defined string (spec.md section 3); only the
    /// embedder can say what it means.
    async fn trust_level_for(&self, bare_jid: &str, identity_key: &[u8; 32]) -> Result<TrustLevel, SessionManagerError> {
        let name = self
            .trust
            .get(&(bare_jid.to_string(), *identity_key))
            .cloned()
            .unwrap_or_else(|| self.config.undecided_trust_level_name.clone());
        self.delegate
            .evaluate_custom_trust_level(bare_jid, identity_key, &name)
            .await
            .map_err(|_| SessionManagerError::UnknownTrustLevel(name))
    }

    fn pick_backend_for_device(&self, device: &DeviceInformation, priority_order: &[String]) -> Option<String> {
        priority_order.iter().find(|namespace| device.namespaces.contains(*namespace)).cloned()
    }

    async fn ensure_session(&mut self, namespace: &str, bare_jid: &str, device_id: u32, identity_key: [u8; 32]) -> Result<(), SessionManagerError> {
        let key = (namespace.to_string(), bare_jid.to_string(), device_id);
        if self.sessions.contains_key(&key) {
            return Ok(());
        }
        if let Some(loaded) = self.load_session(namespace, bare_jid, device_id).await? {
            self.sessions.insert(key, loaded);
            return Ok(());
        }

        let bundle = self
            .delegate
            .download_bundle(namespace, bare_jid, device_id)
            .await
            .map_err(|_| SessionManagerError::BundleDownloadFailed)?;
        if bundle.identity_key != identity_key {
            return Err(SessionManagerError::X3dh(crate::error::X3dhError::InvalidSpkSignature));
        }

        let entry = self.backend_entry(namespace)?;
        let (kex, sk, ad) = entry.x3dh.init_session_active(&self.identity, &bundle, entry.backend.as_ref())?;
        let ratchet = DoubleRatchet::init_active(
            sk,
            bundle.signed_prekey.public,
            ad,
            entry.backend.as_ref(),
            self.config.max_num_per_session_skipped_keys,
            self.config.max_num_per_message_skipped_keys,
        );
        self.sessions.insert(key, Session::from_active(ratchet, &kex));
        Ok(())
    }

    /// Builds an auto-generated message to `(bare_jid, device_id)` that carries no bulk payload
    /// but does carry one real ratchet submessage, so the recipient's own `decrypt` can actually
    /// process it instead of failing `submessage_for` on an empty map. Used for the
    /// handshake-completion acknowledgement, the heartbeat, and the session re-init request (spec
    /// section 4.7's "empty message" is empty of payload, not of ratchet content).
    ///
    /// If no session exists yet with the target device, one is established via active X3DH first
    /// — the resulting message doubles as a fresh initiating message, same as `encrypt` would
    /// build for an ordinary send.
    async fn build_auto_message(&mut self, namespace: &str, bare_jid: &str, device_id: u32) -> Result<BackendMessage, SessionManagerError> {
        let key = (namespace.to_string(), bare_jid.to_string(), device_id);

        if !self.sessions.contains_key(&key) {
            if let Some(loaded) = self.load_session(namespace, bare_jid, device_id).await? {
                self.sessions.insert(key.clone(), loaded);
            }
        }

        if !self.sessions.contains_key(&key) {
            let identity_key = match self.device_identity_key(namespace, bare_jid, device_id) {
                Some(identity_key) => identity_key,
                None => self.resolve_device_identity_key(namespace, bare_jid, device_id).await.ok_or(SessionManagerError::BundleDownloadFailed)?,
            };
            self.ensure_session(namespace, bare_jid, device_id, identity_key).await?;
        }

        let identity_key = self.device_identity_key(namespace, bare_jid, device_id).ok_or(SessionManagerError::BundleDownloadFailed)?;
        let ik_receiver = VerifyingKey::from_bytes(&identity_key).map_err(|_| crate::error::WireFormatError::MalformedKey)?;
        let version = self.backend_entry(namespace)?.backend.wire_version();

        let content_key = ContentKey::generate();
        let session = self.sessions.get_mut(&key).expect("a session was just loaded or established above");
        let wire_bytes = session.encrypt(&content_key.to_bytes(), &self.identity.identity_key(), &ik_receiver, version);
        self.persist_session(&key).await?;

        let mut submessages = BTreeMap::new();
        submessages.insert((bare_jid.to_string(), device_id), wire_bytes);

        Ok(BackendMessage {
            namespace: namespace.to_string(),
            sender_bare_jid: self.own_bare_jid.clone(),
            sender_device_id: self.own_device_id,
            payload_ciphertext: None,
            payload_nonce: None,
            submessages,
        })
    }

    /// Encrypts `plaintext_by_namespace` for `bare_jids`, fanning out per device per the
    /// algorithm of spec section 4.7 step 6.
    pub async fn encrypt(
        &mut self,
        bare_jids: &BTreeSet<String>,
        plaintext_by_namespace: &BTreeMap<String, Vec<u8>>,
        backend_priority_order: &[String],
    ) -> Result<EncryptOutcome, SessionManagerError> {
        self.perform_maintenance().await?;

        let mut recipients = bare_jids.clone();
        recipients.insert(self.own_bare_jid.clone());

        let mut eligible: Vec<DeviceInformation> = Vec::new();
        for bare_jid in &recipients {
            let devices = self.get_device_information(bare_jid).await?;
            for device in devices {
                if bare_jid == &self.own_bare_jid && device.device_id == self.own_device_id {
                    continue;
                }
                if !device.active {
                    continue;
                }
                if self.pick_backend_for_device(&device, backend_priority_order).is_none() {
                    continue;
                }
                eligible.push(device);
            }
        }

        self.resolve_trust(&eligible, bare_jids.iter().cloned().collect::<Vec<_>>().join(",").as_str()).await?;

        let mut still_eligible = Vec::new();
        for device in eligible {
            if self.trust_level_for(&device.bare_jid, &device.identity_key).await? != TrustLevel::Distrusted {
                still_eligible.push(device);
            }
        }
        let eligible = still_eligible;

        let mut missing = BTreeSet::new();
        for bare_jid in bare_jids {
            if !eligible.iter().any(|device| &device.bare_jid == bare_jid) {
                missing.insert(bare_jid.clone());
            }
        }
        if !missing.is_empty() {
            return Err(SessionManagerError::NoEligibleDevices(missing));
        }

        let mut by_backend: BTreeMap<String, Vec<DeviceInformation>> = BTreeMap::new();
        for device in eligible {
            if let Some(namespace) = self.pick_backend_for_device(&device, backend_priority_order) {
                by_backend.entry(namespace).or_default().push(device);
            }
        }

        let mut messages = BTreeMap::new();
        let mut device_errors = BTreeMap::new();
        let now = now_unix();

        for (namespace, devices) in by_backend {
            let Some(plaintext) = plaintext_by_namespace.get(&namespace) else { continue };
            let content_key = ContentKey::generate();
            let version = self.backend_entry(&namespace)?.backend.wire_version();
            let mut submessages = BTreeMap::new();

            for device in &devices {
                if let Err(err) = self.ensure_session(&namespace, &device.bare_jid, device.device_id, device.identity_key).await {
                    device_errors.insert((device.bare_jid.clone(), device.device_id), err);
                    continue;
                }

                let key = (namespace.clone(), device.bare_jid.clone(), device.device_id);
                let ik_receiver = match VerifyingKey::from_bytes(&device.identity_key) {
                    Ok(key) => key,
                    Err(_) => {
                        device_errors.insert((device.bare_jid.clone(), device.device_id), SessionManagerError::X3dh(crate::error::X3dhError::InvalidSpkSignature));
                        continue;
                    }
                };
                let session = self.sessions.get_mut(&key).expect("ensure_session just populated this entry");
                let was_pending = session.is_pending_confirmation();
                let wire_bytes = session.encrypt(&content_key.to_bytes(), &self.identity.identity_key(), &ik_receiver, version);
                submessages.insert((device.bare_jid.clone(), device.device_id), wire_bytes);
                self.persist_session(&key).await?;

                if was_pending {
                    let entry = self.backend_entry_mut(&namespace)?;
                    entry.x3dh.record_response(&device.bare_jid, device.device_id, now);
                }
            }

            if submessages.is_empty() {
                continue;
            }

            let aad = self.identity.identity_key().to_bytes();
            let payload_ciphertext = Some(content_key.seal(plaintext, &aad));

            messages.insert(
                namespace.clone(),
                BackendMessage {
                    namespace,
                    sender_bare_jid: self.own_bare_jid.clone(),
                    sender_device_id: self.own_device_id,
                    payload_ciphertext,
                    payload_nonce: Some(content_key.nonce),
                    submessages,
                },
            );
        }

        Ok(EncryptOutcome { messages, device_errors })
    }

    /// Decrypts an incoming [`BackendMessage`] addressed to this device, per spec section 4.7's
    /// `decrypt` algorithm: key-exchange handling, trust gating, heartbeat scheduling, and OTPK
    /// release all happen inside this one call.
    pub async fn decrypt(&mut self, message: &BackendMessage) -> Result<DecryptOutcome, SessionManagerError> {
        let namespace = message.namespace.clone();
        let version = self.backend_entry(&namespace)?.backend.wire_version();

        let Some(submessage) = message.submessage_for(&self.own_bare_jid, self.own_device_id) else {
            return Err(SessionManagerError::WireFormat(crate::error::WireFormatError::Truncated));
        };

        let key = (namespace.clone(), message.sender_bare_jid.clone(), message.sender_device_id);
        let ik_sender_bytes = self.device_identity_key(&namespace, &message.sender_bare_jid, message.sender_device_id);

        let mut fresh_session = false;

        if !self.sessions.contains_key(&key) {
            if let Some(loaded) = self.load_session(&namespace, &message.sender_bare_jid, message.sender_device_id).await? {
                self.sessions.insert(key.clone(), loaded);
            }
        }

        if !self.sessions.contains_key(&key) {
            match session::peel_key_exchange(version, submessage) {
                Ok((kex, inner)) => {
                    let identity_key = kex.identity_key.to_bytes();
                    self.device_meta
                        .entry((namespace.clone(), message.sender_bare_jid.clone(), message.sender_device_id))
                        .or_default()
                        .identity_key = Some(identity_key);

                    let now = now_unix();
                    let entry = self.backend_entry_mut(&namespace)?;
                    let (sk, ad, spk_secret) =
                        entry
                            .x3dh
                            .init_session_passive(&self.identity, &kex, &message.sender_bare_jid, message.sender_device_id, entry.backend.as_ref(), false, now)?;
                    let ratchet = DoubleRatchet::init_passive(sk, spk_secret, ad, entry.backend.as_ref(), self.config.max_num_per_session_skipped_keys, self.config.max_num_per_message_skipped_keys);
                    self.sessions.insert(key.clone(), Session::from_passive(ratchet));
                    fresh_session = true;

                    let ik_sender = VerifyingKey::from_bytes(&identity_key).map_err(|_| crate::error::WireFormatError::MalformedKey)?;
                    let plaintext = self.decrypt_with_session(&key, &inner, &ik_sender, version).await?;

                    if !self.history_sync_active {
                        let entry = self.backend_entry_mut(&namespace)?;
                        entry.x3dh.decide_release(&message.sender_bare_jid, message.sender_device_id, self.otpk_policy.as_ref(), false);
                    }

                    match self.build_auto_message(&namespace, &message.sender_bare_jid, message.sender_device_id).await {
                        Ok(ack) => {
                            if let Err(err) = self.delegate.send_message(&namespace, &message.sender_bare_jid, &ack).await {
                                tracing::warn!(error = %err, "handshake completion response failed to send");
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "failed to build handshake completion response"),
                    }

                    return Ok(self.finish_decrypt(message, plaintext, fresh_session).await?);
                }
                Err(_) => {
                    match self.build_auto_message(&namespace, &message.sender_bare_jid, message.sender_device_id).await {
                        Ok(request) => {
                            if let Err(err) = self.delegate.send_message(&namespace, &message.sender_bare_jid, &request).await {
                                tracing::warn!(error = %err, "session re-init request failed to send");
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "failed to build session re-init request"),
                    }
                    return Err(SessionManagerError::Ratchet(crate::error::RatchetError::AuthenticationFailed));
                }
            }
        }

        let trust_level = match ik_sender_bytes {
            Some(identity_key) => self.trust_level_for(&message.sender_bare_jid, &identity_key).await?,
            None => TrustLevel::Undecided,
        };
        if trust_level == TrustLevel::Distrusted {
            return Err(SessionManagerError::TrustDecisionFailed);
        }
        if trust_level == TrustLevel::Undecided && !self.config.decrypt_when_undecided {
            return Err(SessionManagerError::StillUndecided(BTreeSet::from([(message.sender_bare_jid.clone(), message.sender_device_id)])));
        }

        let ik_sender_bytes = ik_sender_bytes.ok_or(SessionManagerError::X3dh(crate::error::X3dhError::MissingSignedPreKey))?;
        let ik_sender = VerifyingKey::from_bytes(&ik_sender_bytes).map_err(|_| crate::error::WireFormatError::MalformedKey)?;

        let plaintext = self.decrypt_with_session(&key, submessage, &ik_sender, version).await?;

        if !self.history_sync_active {
            let entry = self.backend_entry_mut(&namespace)?;
            entry.x3dh.release_binding(&message.sender_bare_jid, message.sender_device_id);
        }

        self.finish_decrypt(message, plaintext, fresh_session).await
    }

    fn device_identity_key(&self, namespace: &str, bare_jid: &str, device_id: u32) -> Option<[u8; 32]> {
        self.device_meta.get(&(namespace.to_string(), bare_jid.to_string(), device_id)).and_then(|meta| meta.identity_key)
    }

    /// Decrypts `submessage` through the ratchet session at `key`, returning the recovered
    /// content-key bytes (spec section 4.7 step 8: "the submessage plaintext is the content key
    /// material, not the message body itself").
    async fn decrypt_with_session(&mut self, key: &SessionKey, submessage: &[u8], ik_sender: &VerifyingKey, version: Version) -> Result<Vec<u8>, SessionManagerError> {
        let session = self.sessions.get_mut(key).expect("caller ensured a session exists for this key");
        let plaintext = session.decrypt(submessage, ik_sender, &self.identity.identity_key(), version)?;
        self.persist_session(key).await?;
        Ok(plaintext)
    }

    /// Opens the shared bulk payload (if any) using the recovered content key, schedules a
    /// heartbeat if the receiving chain has advanced far enough, and updates `last_used`.
    async fn finish_decrypt(&mut self, message: &BackendMessage, content_key_bytes: Vec<u8>, fresh_session: bool) -> Result<DecryptOutcome, SessionManagerError> {
        let key = (message.namespace.clone(), message.sender_bare_jid.clone(), message.sender_device_id);
        let now = now_unix();

        if !self.history_sync_active {
            self.device_meta.entry(key.clone()).or_default().last_used = now;
        }

        let needs_heartbeat = self.sessions.get(&key).map(|session| session.received_on_current_chain() >= HEARTBEAT_MESSAGE_TRIGGER).unwrap_or(false);
        if needs_heartbeat {
            match self.build_auto_message(&key.0, &key.1, key.2).await {
                Ok(heartbeat) => {
                    if let Err(err) = self.delegate.send_message(&key.0, &key.1, &heartbeat).await {
                        tracing::warn!(error = %err, "heartbeat failed to send");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to build heartbeat"),
            }
        }

        let plaintext = match (&message.payload_ciphertext, message.payload_nonce) {
            (Some(ciphertext), Some(nonce)) => {
                let content_key = ContentKey::from_parts(&content_key_bytes, nonce)?;
                // The payload was sealed with the *sender's* identity key as AAD (see
                // `ContentKey::seal`'s call site in `encrypt`), so it must be opened with the
                // same bytes, not this device's own identity key.
                let aad = self
                    .device_identity_key(&message.namespace, &message.sender_bare_jid, message.sender_device_id)
                    .ok_or(SessionManagerError::X3dh(crate::error::X3dhError::MissingSignedPreKey))?;
                Some(content_key.open(ciphertext, &aad)?)
            }
            _ => None,
        };

        Ok(DecryptOutcome {
            plaintext,
            sender_bare_jid: message.sender_bare_jid.clone(),
            sender_device_id: message.sender_device_id,
            fresh_session,
        })
    }
}

fn rand_device_id() -> u32 {
    use rand_core::RngCore;
    rand_core::OsRng.next_u32()
}
