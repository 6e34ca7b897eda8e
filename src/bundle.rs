//! The publicly-advertised pre-key bundle for a single device, used by the initiator side of
//! X3DH to start a session without the responder being online.
//!
//! Grounded in `original_source/omemo/bundle.py` (abstract field surface) and
//! `original_source/omemo/extendedpublicbundle.py`; the core treats a bundle as opaque aside
//! from the fields spec section 4.6 names, so this is a plain data type rather than a trait.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::X3dhError;
use crate::identity::IdentityKeyPair;
use crate::wire;

/// A signed pre key and its metadata, as carried in a [`Bundle`].
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub public: [u8; 32],
    pub signature: [u8; 64],
}

/// `Bundle(namespace, bare_jid, device_id, identity_key, signed_prekey, signed_prekey_signature,
/// signed_prekey_id, one_time_prekeys[id→pub])` from spec section 3.
#[derive(Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub namespace: String,
    pub bare_jid: String,
    pub device_id: u32,
    pub identity_key: [u8; 32],
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekeys: BTreeMap<u32, [u8; 32]>,
}

impl Bundle {
    /// Verifies `signed_prekey_signature` against `identity_key` over the signed pre key's wire
    /// encoding, as spec section 3 requires. Bundles failing this check MUST be rejected before
    /// any other use (spec section 8, "Bundle authenticity").
    pub fn verify(&self) -> Result<(), X3dhError> {
        let identity_key = VerifyingKey::from_bytes(&self.identity_key)
            .map_err(|_| X3dhError::InvalidSpkSignature)?;
        let signature = Signature::from_bytes(&self.signed_prekey.signature);
        let encoded = wire::encode_x25519_key(&self.signed_prekey.public);
        if IdentityKeyPair::verify(&encoded, &signature, &identity_key) {
            Ok(())
        } else {
            Err(X3dhError::InvalidSpkSignature)
        }
    }

    /// Looks up a one-time pre key by id, for the active side of X3DH picking which OTPK to
    /// consume.
    pub fn find_otpk(&self, id: u32) -> Option<&[u8; 32]> {
        self.one_time_prekeys.get(&id)
    }

    /// Picks an arbitrary available one-time pre key, per spec section 4.2's "require the bundle
    /// to contain an OTPK; pick one OTPK". The lowest id is picked for determinism in tests; any
    /// available OTPK is equally valid cryptographically.
    pub fn pick_otpk(&self) -> Option<(u32, [u8; 32])> {
        self.one_time_prekeys.iter().next().map(|(id, key)| (*id, *key))
    }
}
