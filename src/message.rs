//! The per-message content-key envelope and the assembled backend message (spec section 4.7
//! step 6: "Generate a per-message content key ... Assemble the backend message containing the
//! shared payload and per-device submessages").
//!
//! Grounded in `original_source/omemo/session_manager.py`'s `encryptMessage` (one symmetric key
//! per outgoing message, wrapped per-device via the ratchet, with the bulk payload encrypted once
//! under that key) and the teacher's `chacha20poly1305` payload-encryption step, generalized here
//! to the AES-256-GCM the current backend generation specifies (see DESIGN.md).

use std::collections::BTreeMap;

use crate::aead;
use crate::error::SessionManagerError;

/// The symmetric key shared by every per-device submessage of one outgoing message, used to
/// encrypt the bulk payload exactly once regardless of recipient count.
pub struct ContentKey {
    pub key: [u8; 32],
    pub nonce: [u8; 12],
}

impl ContentKey {
    pub fn generate() -> Self {
        use rand_core::RngCore;
        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        rand_core::OsRng.fill_bytes(&mut key);
        rand_core::OsRng.fill_bytes(&mut nonce);
        Self { key, nonce }
    }

    /// The 32-byte key each device's ratchet session encrypts as its submessage plaintext. The
    /// nonce travels alongside the payload in cleartext (spec section 4.7: "the IV is not
    /// recipient-specific and need not be confidential"), so only the key needs per-device
    /// wrapping.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key
    }

    /// Reconstructs a `ContentKey` from a ratchet-decrypted key and the cleartext nonce carried
    /// by the backend message.
    pub fn from_parts(key_bytes: &[u8], nonce: [u8; 12]) -> Result<Self, SessionManagerError> {
        if key_bytes.len() != 32 {
            return Err(SessionManagerError::WireFormat(crate::error::WireFormatError::Truncated));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Ok(Self { key, nonce })
    }

    /// `aad` binds the payload to the backend message it travels with (spec section 2's "AEAD
    /// material for the payload"); callers pass the sender's identity key bytes.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        aead::gcm_encrypt(&self.key, &self.nonce, plaintext, aad)
            .expect("a freshly generated key/nonce pair always encrypts successfully")
    }

    pub fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SessionManagerError> {
        aead::gcm_decrypt(&self.key, &self.nonce, ciphertext, aad)
            .map_err(|_| SessionManagerError::Ratchet(crate::error::RatchetError::AuthenticationFailed))
    }
}

/// An assembled message for a single backend: a per-device ratchet submessage (carrying the
/// content key, plain or wrapped in a pre-key message) for every target device, plus the shared
/// bulk payload. `payload_ciphertext` is `None` for pure key-transport messages (spec scenario
/// S2, "strip the externally-visible payload element").
#[derive(Clone, Debug)]
pub struct BackendMessage {
    pub namespace: String,
    pub sender_bare_jid: String,
    pub sender_device_id: u32,
    pub payload_ciphertext: Option<Vec<u8>>,
    pub payload_nonce: Option<[u8; 12]>,
    pub submessages: BTreeMap<(String, u32), Vec<u8>>,
}

impl BackendMessage {
    pub fn submessage_for(&self, bare_jid: &str, device_id: u32) -> Option<&Vec<u8>> {
        self.submessages.get(&(bare_jid.to_string(), device_id))
    }
}
