//! Per-subsystem error enums and the top-level orchestration error.

use std::collections::BTreeSet;

/// Failures from [`crate::identity`].
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("malformed Ed25519 public key bytes")]
    MalformedPublicKey,
    #[error("malformed signature bytes")]
    MalformedSignature,
    #[error("storage error while loading identity key pair")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Failures from [`crate::x3dh`].
#[derive(Debug, thiserror::Error)]
pub enum X3dhError {
    #[error("signed pre key signature did not verify")]
    InvalidSpkSignature,
    #[error("bundle is missing a signed pre key")]
    MissingSignedPreKey,
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    WireFormat(#[from] WireFormatError),
}

/// Failures from [`crate::ratchet`].
#[derive(Debug, thiserror::Error)]
pub enum RatchetError {
    #[error("message authentication failed")]
    AuthenticationFailed,
    #[error("message counter {n} for chain {dh_pub:?} was already used or skipped beyond the allowed window")]
    MessageKeyUnavailable { dh_pub: Vec<u8>, n: u32 },
    #[error("refusing to skip {requested} message keys, which exceeds the configured per-message bound {bound}")]
    TooManySkippedMessages { requested: u32, bound: u32 },
    #[error("skipped-key store would exceed the configured per-session bound {bound}")]
    TooManySkippedKeysStored { bound: usize },
    #[error(transparent)]
    Aead(#[from] AeadError),
    #[error(transparent)]
    WireFormat(#[from] WireFormatError),
}

/// Failures from [`crate::aead`].
#[derive(Debug, thiserror::Error)]
pub enum AeadError {
    #[error("ciphertext authentication failed")]
    AuthenticationFailed,
    #[error("ciphertext length is not a multiple of the block size")]
    InvalidPadding,
    #[error("key or nonce had an unexpected length")]
    InvalidKeyMaterial,
}

/// Failures from [`crate::wire`].
#[derive(Debug, thiserror::Error)]
pub enum WireFormatError {
    #[error("wire message is shorter than the minimum valid length")]
    Truncated,
    #[error("unsupported protocol version {major}.{minor}, this implementation understands up to {max_major}.{max_minor}")]
    UnknownVersion { major: u8, minor: u8, max_major: u8, max_minor: u8 },
    #[error("wire message uses a protocol version older than this session was established with")]
    LegacyVersion { major: u8, minor: u8 },
    #[error("unsupported public key type byte {0:#x}")]
    UnknownKeyType(u8),
    #[error("public key field had an invalid length")]
    MalformedKey,
    #[error("message authentication code did not match")]
    MacMismatch,
}

/// The kinds of failure [`crate::session_manager::SessionManager`] can report, matching the
/// taxonomy of spec section 7. Lower layers fold into this type via `#[from]` so orchestration
/// code can use `?` throughout.
#[derive(Debug, thiserror::Error)]
pub enum SessionManagerError {
    #[error("invalid session manager configuration: {0}")]
    InvalidConfig(String),
    #[error("could not interact with the XMPP layer: {0}")]
    XmppInteractionFailed(String),
    #[error("trust level {0:?} is not known to this session manager")]
    UnknownTrustLevel(String),
    #[error("a trust decision could not be made for one or more recipient devices")]
    TrustDecisionFailed,
    #[error("trust for one or more recipient devices is still undecided")]
    StillUndecided(BTreeSet<(String, u32)>),
    #[error("no eligible devices were found for recipients {0:?}")]
    NoEligibleDevices(BTreeSet<String>),
    #[error("namespace {0} is not configured with a backend")]
    UnknownNamespace(String),
    #[error("uploading this device's bundle failed")]
    BundleUploadFailed,
    #[error("downloading a bundle failed")]
    BundleDownloadFailed,
    #[error("deleting this device's bundle failed")]
    BundleDeletionFailed,
    #[error("uploading this device's device list failed")]
    DeviceListUploadFailed,
    #[error("downloading a device list failed")]
    DeviceListDownloadFailed,
    #[error("sending a message failed")]
    MessageSendingFailed,
    #[error(transparent)]
    X3dh(#[from] X3dhError),
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
    #[error(transparent)]
    WireFormat(#[from] WireFormatError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SessionManagerError {
    /// Box up a caller-supplied `Storage::Error` into the concrete orchestration error.
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        SessionManagerError::Storage(Box::new(err))
    }
}
