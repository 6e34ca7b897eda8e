//! The two authenticated-encryption constructions the crate uses: AES-CBC + truncated
//! HMAC-SHA256 for ratchet messages (spec section 4.3/4.4), and AES-256-GCM for the outer
//! content-key-encrypted payload (spec section 2).
//!
//! Grounded in the teacher's `src/main.rs` `encrypt_data`/`decrypt_data` pair, generalized from
//! ChaCha20-Poly1305 to AES-256-GCM to match the payload AEAD the specification calls for.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AeadError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Encrypts `plaintext` with AES-256-CBC (PKCS7 padding), as used for ratchet message bodies.
pub fn cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts an AES-256-CBC (PKCS7 padded) ciphertext produced by [`cbc_encrypt`].
pub fn cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, AeadError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| AeadError::InvalidPadding)
}

/// `HMAC-SHA256(mac_key, data)` truncated to 8 bytes, the ratchet-message MAC construction.
pub fn truncated_mac(mac_key: &[u8], data: &[u8]) -> [u8; 8] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("HMAC accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut truncated = [0u8; 8];
    truncated.copy_from_slice(&full[..8]);
    truncated
}

/// Constant-time comparison of a computed MAC against the one carried on the wire.
pub fn verify_mac(expected: &[u8; 8], actual: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    actual.len() == expected.len() && bool::from(expected.ct_eq(actual))
}

/// Encrypts `plaintext` with AES-256-GCM, the payload AEAD layered on top of a per-message
/// content key shared identically across every recipient device.
pub fn gcm_encrypt(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| AeadError::AuthenticationFailed)
}

/// Decrypts and authenticates an AES-256-GCM payload produced by [`gcm_encrypt`].
pub fn gcm_decrypt(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| AeadError::AuthenticationFailed)
}
