//! Fixed little-endian health records returned by the device.

use core::fmt;

use getset::CopyGetters;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthDecodeError {
    Truncated { expected: usize, got: usize },
    InvalidErrorCode(u8),
}

impl fmt::Display for HealthDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { expected, got } => {
                write!(f, "health record truncated: expected {} bytes, got {}", expected, got)
            }
            Self::InvalidErrorCode(code) => write!(f, "invalid last error code {}", code),
        }
    }
}

/// Little-endian cursor over a record; callers check the total size up front.
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8], expected: usize) -> Result<Self, HealthDecodeError> {
        if buf.len() < expected {
            return Err(HealthDecodeError::Truncated {
                expected,
                got: buf.len(),
            });
        }
        Ok(Self { buf, pos: 0 })
    }

    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        u32::from_le_bytes(raw)
    }

    fn flag(&mut self) -> bool {
        self.u8() != 0
    }

    fn error_code(&mut self) -> Result<LastErrorCode, HealthDecodeError> {
        let raw = self.u8();
        LastErrorCode::try_from(raw).map_err(|_| HealthDecodeError::InvalidErrorCode(raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, CopyGetters)]
pub struct Health {
    #[getset(get_copy = "pub")]
    uptime: u32,
}

impl Health {
    pub const SIZE: usize = 4;

    pub fn from_bytes(buf: &[u8]) -> Result<Self, HealthDecodeError> {
        let mut f = Fields::new(buf, Self::SIZE)?;
        Ok(Self { uptime: f.u32() })
    }
}

/// CAN controller last error code (LEC)
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    num_enum::TryFromPrimitive,
    num_enum::IntoPrimitive,
)]
pub enum LastErrorCode {
    NoError = 0,
    Stuff = 1,
    Form = 2,
    Ack = 3,
    Bit1 = 4,
    Bit0 = 5,
    Crc = 6,
    NoChange = 7,
}

impl LastErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoError => "No error",
            Self::Stuff => "Stuff error",
            Self::Form => "Form error",
            Self::Ack => "AckError",
            Self::Bit1 => "Bit1Error",
            Self::Bit0 => "Bit0Error",
            Self::Crc => "CRCError",
            Self::NoChange => "NoChange",
        }
    }
}

impl fmt::Display for LastErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-bus controller state, as reported by request 0xc2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct CanHealth {
    bus_off: bool,
    bus_off_cnt: u32,
    error_warning: bool,
    error_passive: bool,
    last_error: LastErrorCode,
    last_stored_error: LastErrorCode,
    /// CAN-FD data phase only
    last_data_error: LastErrorCode,
    last_data_stored_error: LastErrorCode,
    receive_error_cnt: u8,
    transmit_error_cnt: u8,
    total_error_cnt: u32,
    total_tx_lost_cnt: u32,
    total_rx_lost_cnt: u32,
    total_tx_cnt: u32,
    total_rx_cnt: u32,
    total_fwd_cnt: u32,
    total_tx_checksum_error_cnt: u32,
    /// kbps
    can_speed: u16,
    can_data_speed: u16,
    canfd_enabled: bool,
    brs_enabled: bool,
    canfd_non_iso: bool,
}

impl CanHealth {
    pub const SIZE: usize = 48;

    pub fn from_bytes(buf: &[u8]) -> Result<Self, HealthDecodeError> {
        let mut f = Fields::new(buf, Self::SIZE)?;
        Ok(Self {
            bus_off: f.flag(),
            bus_off_cnt: f.u32(),
            error_warning: f.flag(),
            error_passive: f.flag(),
            last_error: f.error_code()?,
            last_stored_error: f.error_code()?,
            last_data_error: f.error_code()?,
            last_data_stored_error: f.error_code()?,
            receive_error_cnt: f.u8(),
            transmit_error_cnt: f.u8(),
            total_error_cnt: f.u32(),
            total_tx_lost_cnt: f.u32(),
            total_rx_lost_cnt: f.u32(),
            total_tx_cnt: f.u32(),
            total_rx_cnt: f.u32(),
            total_fwd_cnt: f.u32(),
            total_tx_checksum_error_cnt: f.u32(),
            can_speed: f.u16(),
            can_data_speed: f.u16(),
            canfd_enabled: f.flag(),
            brs_enabled: f.flag(),
            canfd_non_iso: f.flag(),
        })
    }
}
