//! The identity key pair shared by every backend: one Ed25519-compatible signing key that is
//! also usable, via the birational equivalence of Edwards25519 and Curve25519, for X25519
//! Diffie-Hellman.
//!
//! Grounded in `original_source/omemo/identity_key_pair.py`: storage under `/ik/is_seed` and
//! `/ik/key`, the `sign`/`verify`/`diffie_hellman` surface, and the `enforce_ed25519_pub_sign`
//! XEdDSA knob used when the signer's public key sign bit must be forced to a specific value so
//! a verifier who only knows the X25519 (Montgomery) form can unambiguously reconstruct the
//! Edwards point.

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha512};

use crate::error::IdentityError;
use crate::storage::Storage;

#[derive(Clone)]
enum KeyMaterial {
    /// A 32-byte random seed; the standard Ed25519 signing key derivation applies.
    Seed([u8; 32]),
    /// A raw Curve25519 scalar with no corresponding seed (e.g. after sign-bit enforcement
    /// negates the derived scalar, or when the key pair originates from an existing X25519
    /// identity rather than a freshly generated seed).
    Scalar(Scalar),
}

/// The identity key pair associated with this device, shared by all backends.
pub struct IdentityKeyPair {
    key: KeyMaterial,
}

fn clamp_scalar_bytes(bytes: &mut [u8; 32]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

fn scalar_from_seed(seed: &[u8; 32]) -> Scalar {
    let hash = Sha512::digest(seed);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hash[..32]);
    clamp_scalar_bytes(&mut bytes);
    Scalar::from_bytes_mod_order(bytes)
}

fn edwards_point_from_scalar(scalar: &Scalar) -> curve25519_dalek::edwards::EdwardsPoint {
    scalar * ED25519_BASEPOINT_TABLE
}

fn sign_bit(point: &curve25519_dalek::edwards::EdwardsPoint) -> bool {
    let bytes = point.compress().to_bytes();
    (bytes[31] >> 7) & 1 == 1
}

/// Negates the scalar if needed so that its Edwards public key has the requested sign bit.
/// Negation flips the Edwards point's x-coordinate sign, which is exactly the encoded sign bit,
/// while leaving the birationally-equivalent Montgomery u-coordinate (and therefore every X25519
/// Diffie-Hellman result) unchanged.
fn force_sign(scalar: Scalar, want_sign: bool) -> Scalar {
    let point = edwards_point_from_scalar(&scalar);
    if sign_bit(&point) == want_sign {
        scalar
    } else {
        -scalar
    }
}

fn verifying_key_from_scalar(scalar: &Scalar) -> VerifyingKey {
    let point = edwards_point_from_scalar(scalar);
    VerifyingKey::from_bytes(&point.compress().to_bytes())
        .expect("a point on the curve always encodes to a valid Ed25519 public key")
}

fn edwards_pub_to_montgomery(key: &VerifyingKey) -> MontgomeryPoint {
    CompressedEdwardsY(key.to_bytes())
        .decompress()
        .expect("a previously validated Ed25519 public key decompresses")
        .to_montgomery()
}

/// Signs with a raw scalar directly, without going through the standard seed-based Ed25519
/// nonce derivation (there may be no seed, e.g. after [`force_sign`] negates it). The resulting
/// signature still satisfies the standard Ed25519 verification equation `sB = R + H(R,A,M)A`;
/// only the nonce `r` is derived differently.
fn sign_with_scalar(scalar: &Scalar, message: &[u8]) -> Signature {
    let public_point = edwards_point_from_scalar(scalar);
    let public_bytes = public_point.compress().to_bytes();

    let mut nonce_input = Vec::with_capacity(32 + message.len());
    nonce_input.extend_from_slice(&scalar.to_bytes());
    nonce_input.extend_from_slice(message);
    let mut nonce_wide = [0u8; 64];
    nonce_wide.copy_from_slice(&Sha512::digest(&nonce_input));
    let r = Scalar::from_bytes_mod_order_wide(&nonce_wide);

    let r_bytes = edwards_point_from_scalar(&r).compress().to_bytes();

    let mut k_input = Vec::with_capacity(32 + 32 + message.len());
    k_input.extend_from_slice(&r_bytes);
    k_input.extend_from_slice(&public_bytes);
    k_input.extend_from_slice(message);
    let mut k_wide = [0u8; 64];
    k_wide.copy_from_slice(&Sha512::digest(&k_input));
    let k = Scalar::from_bytes_mod_order_wide(&k_wide);

    let s = r + k * scalar;

    let mut sig_bytes = [0u8; 64];
    sig_bytes[..32].copy_from_slice(&r_bytes);
    sig_bytes[32..].copy_from_slice(&s.to_bytes());
    Signature::from_bytes(&sig_bytes)
}

/// Converts an Ed25519 public key to its birationally-equivalent X25519 (Montgomery) form, the
/// representation X3DH's Diffie-Hellman steps operate on.
pub fn ed25519_public_to_x25519(key: &VerifyingKey) -> x25519_dalek::PublicKey {
    x25519_dalek::PublicKey::from(edwards_pub_to_montgomery(key).to_bytes())
}

impl IdentityKeyPair {
    fn scalar(&self) -> Scalar {
        match &self.key {
            KeyMaterial::Seed(seed) => scalar_from_seed(seed),
            KeyMaterial::Scalar(scalar) => *scalar,
        }
    }

    /// The public part of the identity key pair, in Ed25519 format.
    pub fn identity_key(&self) -> VerifyingKey {
        match &self.key {
            KeyMaterial::Seed(seed) => SigningKey::from_bytes(seed).verifying_key(),
            KeyMaterial::Scalar(scalar) => verifying_key_from_scalar(scalar),
        }
    }

    /// Loads the identity key pair from storage, generating and persisting a new one if none
    /// exists yet. There is only one identity key pair per device; every call with the same
    /// storage backend returns the same key material.
    pub async fn get<S: Storage>(storage: &S) -> Result<Self, IdentityError> {
        let is_seed = storage
            .load_bool("/ik/is_seed")
            .await
            .map_err(|err| IdentityError::Storage(Box::new(err)))?;

        let is_seed = match is_seed {
            Some(is_seed) => is_seed,
            None => {
                tracing::info!("no identity key in storage, generating one");
                let mut seed = [0u8; 32];
                OsRng.fill_bytes(&mut seed);
                storage
                    .store_bool("/ik/is_seed", true)
                    .await
                    .map_err(|err| IdentityError::Storage(Box::new(err)))?;
                storage
                    .store_bytes("/ik/key", &seed)
                    .await
                    .map_err(|err| IdentityError::Storage(Box::new(err)))?;
                true
            }
        };

        let key_bytes = storage
            .load_bytes("/ik/key")
            .await
            .map_err(|err| IdentityError::Storage(Box::new(err)))?
            .expect("is_seed and key are written together and never deleted independently");
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key_bytes);

        let key = if is_seed {
            KeyMaterial::Seed(bytes)
        } else {
            KeyMaterial::Scalar(Scalar::from_bytes_mod_order(bytes))
        };

        Ok(Self { key })
    }

    /// Signs `message`. If `enforce_ed25519_pub_sign` is `Some`, the signature is produced
    /// against a (possibly negated) scalar whose Edwards public key has the requested sign bit,
    /// used when the verifier reconstructs this identity key's Edwards form from its Montgomery
    /// (X25519) encoding and needs the sign bit pinned down. Pass `None` when the ordinary,
    /// already-published `identity_key()` is what verifiers will check against.
    pub fn sign(&self, message: &[u8], enforce_ed25519_pub_sign: Option<bool>) -> Signature {
        match enforce_ed25519_pub_sign {
            None => match &self.key {
                KeyMaterial::Seed(seed) => SigningKey::from_bytes(seed).sign(message),
                KeyMaterial::Scalar(scalar) => sign_with_scalar(scalar, message),
            },
            Some(want_sign) => {
                let scalar = match &self.key {
                    KeyMaterial::Seed(seed) => scalar_from_seed(seed),
                    KeyMaterial::Scalar(scalar) => *scalar,
                };
                sign_with_scalar(&force_sign(scalar, want_sign), message)
            }
        }
    }

    /// Verifies a signature against an identity key's Ed25519 public form.
    pub fn verify(message: &[u8], signature: &Signature, identity_key: &VerifyingKey) -> bool {
        identity_key.verify(message, signature).is_ok()
    }

    /// Performs X25519-compatible Diffie-Hellman key agreement against another party's Ed25519
    /// identity key, converting it to its Montgomery form first.
    pub fn diffie_hellman(&self, other_identity_key: &VerifyingKey) -> [u8; 32] {
        let other_montgomery = edwards_pub_to_montgomery(other_identity_key);
        (self.scalar() * other_montgomery).to_bytes()
    }

    /// Performs X25519 Diffie-Hellman key agreement against a key that is already in raw X25519
    /// (Montgomery) form, e.g. a signed pre key or one-time pre key from an X3DH bundle. Used for
    /// the `DH(IK, SPK)`/`DH(IK, OTPK)` terms of the X3DH key agreement, where this identity key
    /// pair plays the Diffie-Hellman role rather than the signing role.
    pub fn diffie_hellman_x25519(&self, other: &x25519_dalek::PublicKey) -> [u8; 32] {
        let other_point = MontgomeryPoint(*other.as_bytes());
        (self.scalar() * other_point).to_bytes()
    }
}
