//! A `SessionDelegate` that plays every network-facing role (bundle storage, device-list
//! storage, message transport, trust policy) against a small shared [`Network`], so a test can
//! wire up several simulated accounts without touching any real transport.
//!
//! Grounded in `original_source/examples/sessions.py`: a shared bundle dict keyed by
//! `(bare_jid, device_id)`, device lists fetched per-`bare_jid`, and `CustomSessionManager`'s
//! queued auto-sent messages standing in for the example's deferred-message dict.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use protocol::bundle::Bundle;
use protocol::message::BackendMessage;
use protocol::session_manager::SessionDelegate;
use protocol::trust::TrustLevel;

#[derive(Debug, thiserror::Error)]
pub enum DelegateError {
    #[error("no bundle published for {bare_jid}/{device_id}")]
    BundleNotFound { bare_jid: String, device_id: u32 },
}

/// The shared state every [`RecordingDelegate`] in a test reads and writes: published bundles,
/// device lists, and per-recipient inboxes of automatically-sent messages (heartbeats, handshake
/// completions, session re-init requests).
#[derive(Default)]
pub struct Network {
    bundles: Mutex<HashMap<(String, String, u32), Bundle>>,
    device_lists: Mutex<HashMap<(String, String), BTreeMap<u32, Option<String>>>>,
    inboxes: Mutex<HashMap<String, Vec<BackendMessage>>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pops every message auto-sent to `bare_jid` so far, oldest first.
    pub fn drain_inbox(&self, bare_jid: &str) -> Vec<BackendMessage> {
        self.inboxes.lock().unwrap().remove(bare_jid).unwrap_or_default()
    }

    /// Reads back a published bundle, for tests asserting on SPK rotation/OTPK refill
    /// republication.
    pub fn bundle(&self, namespace: &str, bare_jid: &str, device_id: u32) -> Option<Bundle> {
        self.bundles.lock().unwrap().get(&(namespace.to_string(), bare_jid.to_string(), device_id)).cloned()
    }
}

/// A `SessionDelegate` bound to one simulated account (`own_bare_jid`) acting against a shared
/// [`Network`]. `auto_trust` models the embedder's `_evaluate_custom_trust_level` hook: `true`
/// trusts any undecided device outright (the common case for these tests), `false` always
/// reports `Undecided` with no further decision ever arriving (spec scenario S5).
pub struct RecordingDelegate {
    network: Arc<Network>,
    own_bare_jid: String,
    auto_trust: bool,
    pub trust_decision_requests: Mutex<Vec<BTreeSet<(String, u32)>>>,
}

impl RecordingDelegate {
    pub fn new(network: Arc<Network>, own_bare_jid: impl Into<String>) -> Self {
        Self { network, own_bare_jid: own_bare_jid.into(), auto_trust: true, trust_decision_requests: Mutex::new(Vec::new()) }
    }

    /// A delegate that never resolves a pending trust decision, for testing the trust gate.
    pub fn new_never_trusting(network: Arc<Network>, own_bare_jid: impl Into<String>) -> Self {
        Self { network, own_bare_jid: own_bare_jid.into(), auto_trust: false, trust_decision_requests: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl SessionDelegate for RecordingDelegate {
    type Error = DelegateError;

    async fn upload_bundle(&self, bundle: &Bundle) -> Result<(), Self::Error> {
        self.network.bundles.lock().unwrap().insert((bundle.namespace.clone(), bundle.bare_jid.clone(), bundle.device_id), bundle.clone());
        Ok(())
    }

    async fn download_bundle(&self, namespace: &str, bare_jid: &str, device_id: u32) -> Result<Bundle, Self::Error> {
        self.network
            .bundles
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), bare_jid.to_string(), device_id))
            .cloned()
            .ok_or_else(|| DelegateError::BundleNotFound { bare_jid: bare_jid.to_string(), device_id })
    }

    async fn delete_bundle(&self, namespace: &str, device_id: u32) -> Result<(), Self::Error> {
        let own_bare_jid = self.own_bare_jid.clone();
        self.network.bundles.lock().unwrap().retain(|(ns, jid, id), _| !(ns == namespace && jid == &own_bare_jid && *id == device_id));
        Ok(())
    }

    async fn upload_device_list(&self, namespace: &str, device_list: &BTreeMap<u32, Option<String>>) -> Result<(), Self::Error> {
        self.network.device_lists.lock().unwrap().insert((namespace.to_string(), self.own_bare_jid.clone()), device_list.clone());
        Ok(())
    }

    async fn download_device_list(&self, namespace: &str, bare_jid: &str) -> Result<BTreeMap<u32, Option<String>>, Self::Error> {
        Ok(self.network.device_lists.lock().unwrap().get(&(namespace.to_string(), bare_jid.to_string())).cloned().unwrap_or_default())
    }

    async fn send_message(&self, _namespace: &str, bare_jid: &str, message: &BackendMessage) -> Result<(), Self::Error> {
        self.network.inboxes.lock().unwrap().entry(bare_jid.to_string()).or_default().push(message.clone());
        Ok(())
    }

    async fn evaluate_custom_trust_level(&self, _bare_jid: &str, _identity_key: &[u8; 32], trust_level_name: &str) -> Result<TrustLevel, Self::Error> {
        Ok(if trust_level_name == "trusted" {
            TrustLevel::Trusted
        } else if trust_level_name == "distrusted" {
            TrustLevel::Distrusted
        } else if self.auto_trust {
            TrustLevel::Trusted
        } else {
            TrustLevel::Undecided
        })
    }

    async fn make_trust_decision(&self, undecided: &BTreeSet<(String, u32)>, _identifier: &str) -> Result<(), Self::Error> {
        self.trust_decision_requests.lock().unwrap().push(undecided.clone());
        Ok(())
    }
}
