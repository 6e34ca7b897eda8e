//! KDF chains shared by X3DH and the Double Ratchet.
//!
//! Grounded in the teacher's `src/main.rs` `kdf()` prototype, corrected: the teacher built its
//! `0xFF` domain-separator prefix as a two-element array (`[0xFF, 32]`) rather than 32 bytes of
//! `0xFF`. The X3DH specification requires the full 32-byte prefix so that, on curves without
//! contributory behavior guarantees, an attacker who can force a missing one-time pre-key cannot
//! downgrade the key agreement's security.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// The 32-byte, all-`0xFF` domain separator prepended to the X3DH DH concatenation.
pub const X3DH_F: [u8; 32] = [0xFF; 32];

/// `HKDF-SHA256(salt = 0x00×32, ikm = F || DH1 || .. || DHn, info)`, producing a 32-byte shared
/// secret `SK` as specified for X3DH.
pub fn x3dh_kdf(dh_concat: &[u8], info: &[u8]) -> [u8; 32] {
    let salt = [0u8; 32];
    let mut ikm = Vec::with_capacity(X3DH_F.len() + dh_concat.len());
    ikm.extend_from_slice(&X3DH_F);
    ikm.extend_from_slice(dh_concat);

    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .expect("32 is a valid HKDF-SHA256 output length");
    okm
}

/// Double Ratchet root-chain KDF step: `HKDF-SHA256(salt = root_key, ikm = dh_out, info)`,
/// producing a fresh 32-byte root key and 32-byte chain key.
pub fn kdf_root(root_key: &[u8; 32], dh_out: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_out);
    let mut okm = [0u8; 64];
    hk.expand(info, &mut okm)
        .expect("64 is a valid HKDF-SHA256 output length");

    let mut new_root = [0u8; 32];
    let mut new_chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    new_chain.copy_from_slice(&okm[32..]);
    (new_root, new_chain)
}

type HmacSha256 = Hmac<Sha256>;

/// Symmetric-chain KDF step: derives the next chain key as `HMAC-SHA256(chain_key, 0x02)`.
pub fn kdf_chain_key(chain_key: &[u8; 32]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(chain_key).expect("HMAC accepts any key length");
    mac.update(&[0x02]);
    let out = mac.finalize().into_bytes();
    let mut result = [0u8; 32];
    result.copy_from_slice(&out);
    result
}

/// Symmetric-chain KDF step: derives the message key seed as `HMAC-SHA256(chain_key, 0x01)`.
pub fn kdf_message_key_seed(chain_key: &[u8; 32]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(chain_key).expect("HMAC accepts any key length");
    mac.update(&[0x01]);
    let out = mac.finalize().into_bytes();
    let mut result = [0u8; 32];
    result.copy_from_slice(&out);
    result
}

/// Message keys derived from a ratchet message-key seed: an encryption key, a MAC key, and an IV,
/// expanded via `HKDF-SHA256(salt = 0x00×32, ikm = mk_seed, info)` into 32 + 32 + 16 = 80 bytes.
pub struct MessageKeys {
    pub encryption_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub iv: [u8; 16],
}

pub fn expand_message_keys(mk_seed: &[u8; 32], info: &[u8]) -> MessageKeys {
    let salt = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(Some(&salt), mk_seed);
    let mut okm = [0u8; 80];
    hk.expand(info, &mut okm)
        .expect("80 is a valid HKDF-SHA256 output length");

    let mut encryption_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    let mut iv = [0u8; 16];
    encryption_key.copy_from_slice(&okm[0..32]);
    mac_key.copy_from_slice(&okm[32..64]);
    iv.copy_from_slice(&okm[64..80]);
    MessageKeys { encryption_key, mac_key, iv }
}
