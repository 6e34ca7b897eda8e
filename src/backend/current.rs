//! `urn:xmpp:omemo:2`: the current OMEMO backend generation.
//!
//! Constants per SPEC_FULL.md section 2: namespace `urn:xmpp:omemo:2`, wire version 1.0, HKDF
//! info strings `"OMEMO X3DH"` (X3DH agreement) and `"OMEMO Message Key Material"` (message key
//! expansion), matching the values the current XEP-0384 generation of the protocol specifies.
//! The root-chain info string has no equivalent fixed constant in the distilled spec; `"OMEMO
//! Root Chain"` is this crate's own parameterization for that step (see DESIGN.md).

use super::Backend;
use crate::wire::Version;

#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentBackend;

impl Backend for CurrentBackend {
    fn namespace(&self) -> &'static str {
        "urn:xmpp:omemo:2"
    }

    fn wire_version(&self) -> Version {
        Version::new(1, 0)
    }

    fn x3dh_info(&self) -> &'static [u8] {
        b"OMEMO X3DH"
    }

    fn root_chain_info(&self) -> &'static [u8] {
        b"OMEMO Root Chain"
    }

    fn message_keys_info(&self) -> &'static [u8] {
        b"OMEMO Message Key Material"
    }
}
