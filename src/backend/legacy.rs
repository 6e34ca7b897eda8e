//! `eu.siacs.conversations.axolotl`: the legacy Signal-protocol-derived OMEMO backend.
//!
//! Constants grounded in `original_source/omemo/backends/signal/wireformat.py`
//! (`CURRENT_MAJOR_VERSION = 3`, `CURRENT_MINOR_VERSION = 3`) and the companion
//! `doubleratchet.py`/`x3dh` modules' info strings for this generation of the protocol
//! ("WhisperText" for the X3DH agreement, "WhisperRatchet"/"WhisperMessageKeys" for the ratchet).

use super::Backend;
use crate::wire::Version;

#[derive(Clone, Copy, Debug, Default)]
pub struct LegacyBackend;

impl Backend for LegacyBackend {
    fn namespace(&self) -> &'static str {
        "eu.siacs.conversations.axolotl"
    }

    fn wire_version(&self) -> Version {
        Version::new(3, 3)
    }

    fn x3dh_info(&self) -> &'static [u8] {
        b"WhisperText"
    }

    fn root_chain_info(&self) -> &'static [u8] {
        b"WhisperRatchet"
    }

    fn message_keys_info(&self) -> &'static [u8] {
        b"WhisperMessageKeys"
    }
}
