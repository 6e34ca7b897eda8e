//! Multi-backend OMEMO-family X3DH + Double Ratchet session core.
//!
//! This crate implements the cryptographic and session-management layers of the OMEMO family of
//! end-to-end encryption protocols (legacy `eu.siacs.conversations.axolotl` and current
//! `urn:xmpp:omemo:2`): X3DH asynchronous key agreement, the Double Ratchet, wire framing, and a
//! [`session_manager::SessionManager`] that ties them together behind a small embedder-supplied
//! transport/storage interface. It does not speak XMPP itself; see
//! [`session_manager::SessionDelegate`] for the boundary.

pub mod aead;
pub mod backend;
pub mod bundle;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod message;
pub mod otpk_policy;
pub mod ratchet;
pub mod session;
pub mod session_manager;
pub mod storage;
pub mod trust;
pub mod wire;
pub mod x3dh;

pub use error::SessionManagerError;
pub use identity::IdentityKeyPair;
pub use session_manager::{SessionDelegate, SessionManager, SessionManagerConfig};
pub use storage::Storage;
pub use trust::{DeviceInformation, TrustLevel};
