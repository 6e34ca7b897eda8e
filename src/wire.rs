//! Bit-exact wire framing for ratchet messages and pre-key messages (spec sections 4.4 and 6).
//!
//! Grounded in `original_source/omemo/backends/signal/wireformat.py`: the version nibble
//! packing, `KEY_TYPE_25519 = 5` key type byte, `MAC_SIZE = 8`, and the two-step MAC
//! calculation/verification (the MAC is computed over `IK_sender || IK_receiver || version ||
//! payload` and checked in a separate step once the ratchet has derived the right MAC key).

use ed25519_dalek::VerifyingKey;

use crate::aead;
use crate::error::WireFormatError;

/// 1-byte Curve25519 key type tag used by every key encoding on the wire (spec section 6).
const KEY_TYPE_25519: u8 = 0x05;
const ENCODED_KEY_LEN: usize = 33;
const MAC_SIZE: usize = 8;

/// `(major << 4) | minor` protocol version, compared bit-exactly against a backend's expected
/// value (spec section 4.4: "rejected if either differs from the backend's expected values").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn to_byte(self) -> u8 {
        (self.major << 4) | (self.minor & 0x0F)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self { major: (byte >> 4) & 0x0F, minor: byte & 0x0F }
    }
}

/// Encodes a raw X25519/Ed25519 public key as `type_byte || 32 raw bytes` (spec section 6).
pub fn encode_x25519_key(key: &[u8; 32]) -> [u8; ENCODED_KEY_LEN] {
    let mut out = [0u8; ENCODED_KEY_LEN];
    out[0] = KEY_TYPE_25519;
    out[1..].copy_from_slice(key);
    out
}

/// Decodes a 33-byte encoded key, checking the type byte.
pub fn decode_x25519_key(bytes: &[u8]) -> Result<[u8; 32], WireFormatError> {
    if bytes.len() != ENCODED_KEY_LEN {
        return Err(WireFormatError::MalformedKey);
    }
    if bytes[0] != KEY_TYPE_25519 {
        return Err(WireFormatError::UnknownKeyType(bytes[0]));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes[1..]);
    Ok(key)
}

/// Checks an incoming version byte against a backend's expected version. Spec section 6: lower
/// is rejected as legacy, higher is rejected as unknown; only an exact match is accepted (the
/// spec's stated rationale is that no minor-version evolution is defined yet within this crate's
/// backends, so "forward compatible" tolerance within a minor version has nothing to tolerate).
pub fn check_version(actual: Version, expected: Version) -> Result<(), WireFormatError> {
    if actual.major < expected.major || (actual.major == expected.major && actual.minor < expected.minor) {
        return Err(WireFormatError::LegacyVersion { major: actual.major, minor: actual.minor });
    }
    if actual.major > expected.major || (actual.major == expected.major && actual.minor > expected.minor) {
        return Err(WireFormatError::UnknownVersion {
            major: actual.major,
            minor: actual.minor,
            max_major: expected.major,
            max_minor: expected.minor,
        });
    }
    Ok(())
}

/// A framed Double Ratchet message: `(header, ciphertext)` from spec section 4.3's `Encrypt`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetMessage {
    pub dh_ratchet_key: [u8; 32],
    pub n: u32,
    pub pn: u32,
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODED_KEY_LEN + 4 + 4 + 4 + self.ciphertext.len());
        out.extend_from_slice(&encode_x25519_key(&self.dh_ratchet_key));
        out.extend_from_slice(&self.n.to_be_bytes());
        out.extend_from_slice(&self.pn.to_be_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self, WireFormatError> {
        if bytes.len() < ENCODED_KEY_LEN + 12 {
            return Err(WireFormatError::Truncated);
        }
        let dh_ratchet_key = decode_x25519_key(&bytes[..ENCODED_KEY_LEN])?;
        let mut offset = ENCODED_KEY_LEN;
        let n = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let pn = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let ciphertext_len = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if bytes.len() != offset + ciphertext_len {
            return Err(WireFormatError::Truncated);
        }
        let ciphertext = bytes[offset..].to_vec();
        Ok(Self { dh_ratchet_key, n, pn, ciphertext })
    }
}

/// Encodes a ratchet message with its version byte and truncated MAC, per spec section 4.4/6.
/// `mac_key` is the MAC key the ratchet derived for this specific message (from the current or a
/// skipped chain entry); the caller is responsible for picking the right one.
pub fn encode_ratchet_message(
    version: Version,
    message: &RatchetMessage,
    ik_sender: &VerifyingKey,
    ik_receiver: &VerifyingKey,
    mac_key: &[u8; 32],
) -> Vec<u8> {
    let mut framed = Vec::new();
    framed.push(version.to_byte());
    framed.extend_from_slice(&message.encode_payload());

    let mut mac_input = Vec::with_capacity(64 + framed.len());
    mac_input.extend_from_slice(ik_sender.as_bytes());
    mac_input.extend_from_slice(ik_receiver.as_bytes());
    mac_input.extend_from_slice(&framed);
    let mac = aead::truncated_mac(mac_key, &mac_input);

    framed.extend_from_slice(&mac);
    framed
}

/// A ratchet message parsed from the wire but not yet MAC-verified: the ratchet must first
/// derive the candidate MAC key (from its current receiving chain or a skipped-key entry)
/// before [`verify_ratchet_mac`] can be called, per spec section 4.4.
pub struct DecodedRatchetMessage {
    pub version: Version,
    pub message: RatchetMessage,
    mac: [u8; MAC_SIZE],
    authenticated_prefix: Vec<u8>,
}

/// Parses the version byte, payload fields, and trailing MAC, without verifying the MAC.
pub fn decode_ratchet_message(bytes: &[u8]) -> Result<DecodedRatchetMessage, WireFormatError> {
    if bytes.len() < 1 + MAC_SIZE {
        return Err(WireFormatError::Truncated);
    }
    let (framed, mac_bytes) = bytes.split_at(bytes.len() - MAC_SIZE);
    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(mac_bytes);

    let version = Version::from_byte(framed[0]);
    let message = RatchetMessage::decode_payload(&framed[1..])?;

    Ok(DecodedRatchetMessage { version, message, mac, authenticated_prefix: framed.to_vec() })
}

/// Completes MAC verification for a [`DecodedRatchetMessage`] once the ratchet has produced the
/// candidate `mac_key`.
pub fn verify_ratchet_mac(
    decoded: &DecodedRatchetMessage,
    mac_key: &[u8; 32],
    ik_sender: &VerifyingKey,
    ik_receiver: &VerifyingKey,
) -> bool {
    let mut mac_input = Vec::with_capacity(64 + decoded.authenticated_prefix.len());
    mac_input.extend_from_slice(ik_sender.as_bytes());
    mac_input.extend_from_slice(ik_receiver.as_bytes());
    mac_input.extend_from_slice(&decoded.authenticated_prefix);
    let expected = aead::truncated_mac(mac_key, &mac_input);
    aead::verify_mac(&expected, &decoded.mac)
}

/// A pre-key (X3DH key-exchange) message wrapping an inner ratchet message, per spec section 6.
#[derive(Clone, Debug)]
pub struct PreKeyMessage {
    pub registration_id: u32,
    pub otpk_id: u32,
    pub spk_id: u32,
    pub ephemeral_key: [u8; 32],
    pub identity_key: [u8; 32],
    pub inner: Vec<u8>,
}

pub fn encode_pre_key_message(version: Version, message: &PreKeyMessage) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(version.to_byte());
    out.extend_from_slice(&message.registration_id.to_be_bytes());
    out.extend_from_slice(&message.otpk_id.to_be_bytes());
    out.extend_from_slice(&message.spk_id.to_be_bytes());
    out.extend_from_slice(&encode_x25519_key(&message.ephemeral_key));
    out.extend_from_slice(&encode_x25519_key(&message.identity_key));
    out.extend_from_slice(&(message.inner.len() as u32).to_be_bytes());
    out.extend_from_slice(&message.inner);
    out
}

pub fn decode_pre_key_message(bytes: &[u8]) -> Result<(Version, PreKeyMessage), WireFormatError> {
    let header_len = 1 + 4 + 4 + 4 + ENCODED_KEY_LEN + ENCODED_KEY_LEN + 4;
    if bytes.len() < header_len {
        return Err(WireFormatError::Truncated);
    }
    let version = Version::from_byte(bytes[0]);
    let mut offset = 1;
    let registration_id = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let otpk_id = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let spk_id = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let ephemeral_key = decode_x25519_key(&bytes[offset..offset + ENCODED_KEY_LEN])?;
    offset += ENCODED_KEY_LEN;
    let identity_key = decode_x25519_key(&bytes[offset..offset + ENCODED_KEY_LEN])?;
    offset += ENCODED_KEY_LEN;
    let inner_len = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
    offset += 4;
    if bytes.len() != offset + inner_len {
        return Err(WireFormatError::Truncated);
    }
    let inner = bytes[offset..].to_vec();

    Ok((
        version,
        PreKeyMessage { registration_id, otpk_id, spk_id, ephemeral_key, identity_key, inner },
    ))
}
