//! A `Session` wraps one device's [`DoubleRatchet`] together with the bookkeeping needed to keep
//! wrapping outgoing messages in a pre-key (X3DH key-exchange) envelope until the peer's first
//! reply confirms they have processed the handshake.
//!
//! Grounded in `original_source/omemo/x3dhdoubleratchet.py`'s `Session` (the `initiation` field
//! distinguishing an unconfirmed active session from a confirmed/passive one) and the Signal
//! wire format's convention that a pre-key message is resent on every outgoing message until the
//! handshake is known to have landed, since the initiator cannot tell whether an earlier pre-key
//! message was lost or is merely slow.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::error::{RatchetError, WireFormatError};
use crate::ratchet::{DoubleRatchet, StoredRatchet};
use crate::wire::{self, PreKeyMessage, Version};
use crate::x3dh::KeyExchange;

/// The persistable snapshot of a [`Session`] (spec section 3: "Session ... persisted only at
/// well-defined barriers").
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredSession {
    ratchet: StoredRatchet,
    pending_key_exchange: Option<StoredKeyExchange>,
}

/// A stored, serializable key-exchange header: the same fields as [`KeyExchange`], kept here
/// because `VerifyingKey` round-trips through bincode as raw bytes rather than directly.
#[derive(Clone, Serialize, Deserialize)]
struct StoredKeyExchange {
    spk_id: u32,
    otpk_id: u32,
    ephemeral_key: [u8; 32],
    identity_key: [u8; 32],
}

impl From<&KeyExchange> for StoredKeyExchange {
    fn from(kex: &KeyExchange) -> Self {
        Self { spk_id: kex.spk_id, otpk_id: kex.otpk_id, ephemeral_key: kex.ephemeral_key, identity_key: kex.identity_key.to_bytes() }
    }
}

/// Per-(namespace, bare_jid, device_id) session state (spec section 3's `Session` entity): the
/// Double Ratchet plus, for an as-yet-unconfirmed active session, the key-exchange header that
/// must still accompany every outgoing message.
pub struct Session {
    ratchet: DoubleRatchet,
    pending_key_exchange: Option<StoredKeyExchange>,
}

impl Session {
    pub fn from_active(ratchet: DoubleRatchet, key_exchange: &KeyExchange) -> Self {
        Self { ratchet, pending_key_exchange: Some(StoredKeyExchange::from(key_exchange)) }
    }

    pub fn from_passive(ratchet: DoubleRatchet) -> Self {
        Self { ratchet, pending_key_exchange: None }
    }

    /// Whether this session still needs the key-exchange header on outgoing messages, i.e. no
    /// reply from the peer has been decrypted yet.
    pub fn is_pending_confirmation(&self) -> bool {
        self.pending_key_exchange.is_some()
    }

    pub fn own_dh_public(&self) -> [u8; 32] {
        self.ratchet.own_dh_public()
    }

    pub fn received_on_current_chain(&self) -> u32 {
        self.ratchet.received_on_current_chain()
    }

    pub fn export(&self) -> StoredSession {
        StoredSession { ratchet: self.ratchet.export(), pending_key_exchange: self.pending_key_exchange.clone() }
    }

    pub fn import(stored: StoredSession, backend: &dyn crate::backend::Backend) -> Self {
        Self { ratchet: DoubleRatchet::import(stored.ratchet, backend), pending_key_exchange: stored.pending_key_exchange }
    }

    /// Encrypts `plaintext`, wrapping it in a pre-key message if this session is still awaiting
    /// confirmation.
    pub fn encrypt(&mut self, plaintext: &[u8], ik_sender: &VerifyingKey, ik_receiver: &VerifyingKey, version: Version) -> Vec<u8> {
        let inner = self.ratchet.encrypt(plaintext, ik_sender, ik_receiver, version);

        match &self.pending_key_exchange {
            None => inner,
            Some(kex) => wire::encode_pre_key_message(
                version,
                &PreKeyMessage {
                    registration_id: 0,
                    otpk_id: kex.otpk_id,
                    spk_id: kex.spk_id,
                    ephemeral_key: kex.ephemeral_key,
                    identity_key: kex.identity_key,
                    inner,
                },
            ),
        }
    }

    /// Decrypts a plain (non-pre-key) ratchet message. A successful decrypt confirms the peer has
    /// moved on and this session no longer needs to send key-exchange headers.
    pub fn decrypt(&mut self, wire_bytes: &[u8], ik_sender: &VerifyingKey, ik_receiver: &VerifyingKey, expected_version: Version) -> Result<Vec<u8>, RatchetError> {
        let plaintext = self.ratchet.decrypt(wire_bytes, ik_sender, ik_receiver, expected_version)?;
        self.pending_key_exchange = None;
        Ok(plaintext)
    }
}

/// Splits an incoming wire message into its key-exchange header and the inner ratchet message
/// bytes, without attempting decryption. Used by the session manager to decide whether to perform
/// X3DH passive initiation before handing the inner bytes to a [`Session`].
///
/// A pre-key message and a plain ratchet message share the same leading version byte, so the two
/// framings cannot be distinguished by content alone; the session manager decides which framing
/// to attempt based on whether it already has a session for the sender device (spec section
/// 4.7's `decrypt`: "if the message carries a key-exchange header ... BEFORE attempting ratchet
/// decryption").
pub fn peel_key_exchange(expected_version: Version, bytes: &[u8]) -> Result<(KeyExchange, Vec<u8>), WireFormatError> {
    let (version, message) = wire::decode_pre_key_message(bytes)?;
    wire::check_version(version, expected_version)?;
    let identity_key = ed25519_dalek::VerifyingKey::from_bytes(&message.identity_key).map_err(|_| WireFormatError::MalformedKey)?;
    let kex = KeyExchange {
        spk_id: message.spk_id,
        otpk_id: message.otpk_id,
        ephemeral_key: message.ephemeral_key,
        identity_key,
    };
    Ok((kex, message.inner))
}
