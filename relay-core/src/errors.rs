use quick_error::quick_error;

use std::fmt;

/// Which versioned record a protocol check was guarding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Health,
    Can,
    CanHealth,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PacketKind::Health => "health packet",
            PacketKind::Can => "CAN packet",
            PacketKind::CanHealth => "CAN health packet",
        })
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum RelayError {
        RusbError(err: rusb::Error) {
            from()
            source(err)
            display("USB transfer failed: {}", err)
        }
        IoError(err: std::io::Error) {
            from()
            source(err)
            display("I/O error: {}", err)
        }
        HealthError(err: relay_common::HealthDecodeError) {
            from()
            display("{}", err)
        }
        NoDeviceError {
            display("no matching device found")
        }
        NotConnectedError {
            display("session is not connected")
        }
        InvalidDataLength(len: usize) {
            display("CAN payload of {} bytes has no data length code", len)
        }
        InvalidBus(bus: u16) {
            display("bus {} does not fit the packet header", bus)
        }
        InvalidAddress(address: u32) {
            display("address {:#x} is wider than 29 bits", address)
        }
        Checksum(offset: usize) {
            display("CAN packet checksum incorrect at offset {}", offset)
        }
        FirmwareOutdated(kind: PacketKind, advertised: u8, expected: u8) {
            display("device firmware has outdated {} definition (v{} < v{}), reflash the firmware", kind, advertised, expected)
        }
        LibraryOutdated(kind: PacketKind, advertised: u8, expected: u8) {
            display("library has outdated {} definition (v{} > v{}), upgrade the library", kind, advertised, expected)
        }
        UnknownHardwareType(hw_type: u8) {
            display("unknown hardware type {:#04x}", hw_type)
        }
        UnknownMcu(sector_count: usize) {
            display("unknown MCU with {} flash sectors", sector_count)
        }
        ShortResponse(expected: usize, got: usize) {
            display("expected {} bytes from the device, got {}", expected, got)
        }
        InvalidSerial(serial: String) {
            display("invalid serial {:?}", serial)
        }
        SerialSignatureError {
            display("provisioned serial failed its integrity check")
        }
        FlasherNotPresent {
            display("flasher not present, device is not in bootstub mode")
        }
        BinaryTooSmall {
            display("binary too small, no sector to erase")
        }
        BinaryTooLarge {
            display("binary too large, risk of overwriting the provisioning chunk")
        }
        NotInBootstub {
            display("device did not come back in bootstub mode")
        }
        SignatureUnavailable {
            display("firmware image is too short to carry a signature")
        }
        DfuStatusTimeout {
            display("DFU device stayed busy")
        }
        ReconnectFailed(attempts: u32) {
            display("reconnect failed after {} attempts", attempts)
        }
        Cancelled {
            display("operation cancelled")
        }
    }
}

impl RelayError {
    /// Transfer errors worth retrying on the CAN endpoints
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::RusbError(rusb::Error::Io) | RelayError::RusbError(rusb::Error::Overflow)
        )
    }
}
