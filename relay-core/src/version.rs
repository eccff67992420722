use crate::errors::PacketKind;
use crate::{RelayError, Result};

use std::cmp::Ordering;

/// Record layouts the connected firmware was built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolVersions {
    pub health: u8,
    pub can: u8,
    pub can_health: u8,
}

impl ProtocolVersions {
    /// Firmware that doesn't answer with exactly three bytes predates
    /// versioning altogether.
    pub fn from_response(buf: &[u8]) -> Self {
        match buf {
            [health, can, can_health] => Self {
                health: *health,
                can: *can,
                can_health: *can_health,
            },
            _ => Self::default(),
        }
    }
}

/// Refuse to talk about a record unless both sides agree on its layout
pub fn ensure_version(kind: PacketKind, advertised: u8, expected: u8) -> Result<()> {
    match advertised.cmp(&expected) {
        Ordering::Less => Err(RelayError::FirmwareOutdated(kind, advertised, expected)),
        Ordering::Greater => Err(RelayError::LibraryOutdated(kind, advertised, expected)),
        Ordering::Equal => Ok(()),
    }
}
