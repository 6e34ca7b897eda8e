//! A `Backend` binds a namespace, X3DH/ratchet KDF parameterization, and wire protocol version
//! together (spec section 4.5). Multiple backends coexist under one [`crate::identity::IdentityKeyPair`];
//! the [`crate::session_manager::SessionManager`] dispatches by namespace on receive and by
//! caller-supplied priority order on send.
//!
//! Grounded in `original_source/omemo/backend.py` (the abstract base every concrete protocol
//! version implements) and `original_source/omemo/backends/signal/wireformat.py` for the legacy
//! constants. SPEC_FULL.md section 9 resolves the spec's Open Question that backend KDF
//! salts/info strings vary by generation: two concrete parameterizations ship
//! ([`legacy::LegacyBackend`], [`current::CurrentBackend`]), both loadable at once.

pub mod current;
pub mod legacy;

use crate::wire::Version;

/// A concrete OMEMO-family protocol version: a namespace identifier, the HKDF info strings its
/// X3DH and Double Ratchet KDF steps use, and the wire protocol version it speaks.
pub trait Backend: Send + Sync {
    /// The protocol namespace this backend answers to, e.g. `urn:xmpp:omemo:2`. Device lists,
    /// bundles, and incoming messages are all scoped to a namespace.
    fn namespace(&self) -> &'static str;

    /// The wire protocol version this backend expects; messages with a different version are
    /// rejected (spec section 4.4).
    fn wire_version(&self) -> Version;

    /// HKDF info string for the X3DH agreement KDF that derives the initial root key `SK`.
    fn x3dh_info(&self) -> &'static [u8];

    /// HKDF info string for the Double Ratchet's root-chain KDF step (spec section 4.3).
    fn root_chain_info(&self) -> &'static [u8];

    /// HKDF info string for deriving per-message encryption/MAC/IV material from a message key
    /// seed (spec section 4.3, "WhisperMessageKeys").
    fn message_keys_info(&self) -> &'static [u8];

    /// Whether this backend's device list entries carry an optional device label (spec section
    /// 4.7's `set_own_label`: "backends that support labels").
    fn supports_labels(&self) -> bool {
        true
    }
}
