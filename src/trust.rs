//! Trust levels and reconciled device information, grounded in
//! `original_source/omemo/types.py`'s `TrustLevel`/`DeviceInformation`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The three core trust levels a host-defined custom trust level name is evaluated to (spec
/// section 3, "TrustLevel"). `_evaluate_custom_trust_level` on [`crate::session_manager::SessionDelegate`]
/// is the embedder hook that maps a stored `trust_level_name` to one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    Trusted,
    Distrusted,
    Undecided,
}

/// Reconciled view of a single device across every backend it is known in, matching spec
/// section 3's `DeviceInformation` entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub namespaces: BTreeSet<String>,
    pub bare_jid: String,
    pub device_id: u32,
    pub identity_key: [u8; 32],
    pub trust_level_name: String,
    pub active: bool,
    pub last_used: u64,
    pub label: Option<String>,
}
