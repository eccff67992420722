#![cfg_attr(not(test), no_std)]

pub mod health;

pub use health::{CanHealth, Health, HealthDecodeError, LastErrorCode};

// device parameters
pub const VENDOR_ID: u16 = 0xbbaa;
pub const APP_PRODUCT_ID: u16 = 0xddcf;
pub const BOOTSTUB_PRODUCT_ID: u16 = 0xddef;

/// ST system bootloader, used when the bootstub itself is broken
pub const DFU_VENDOR_ID: u16 = 0x0483;
pub const DFU_PRODUCT_ID: u16 = 0xdf11;
pub const DFU_SERIAL_DESCRIPTOR: u8 = 3;

pub const CAN_IN_ENDPOINT: u8 = 0x81;
pub const FLASH_OUT_ENDPOINT: u8 = 0x02;
pub const CAN_OUT_ENDPOINT: u8 = 0x03;

pub const USB_PACKET_MAX_SIZE: usize = 0x40;
pub const SERIAL_LEN: usize = 24;

// must match the firmware exactly
pub const HEALTH_PACKET_VERSION: u8 = 1;
pub const CAN_PACKET_VERSION: u8 = 4;
pub const CAN_HEALTH_PACKET_VERSION: u8 = 4;
pub const LEGACY_CAN_PACKET_VERSION: u8 = 1;

pub const HW_TYPE_UNKNOWN: u8 = 0x00;
pub const HW_TYPE_V1: u8 = 0x01;
pub const HW_TYPE_V2: u8 = 0x02;

/// bcdDevice value used before the hardware type was encoded there
pub const LEGACY_BCD_PLACEHOLDER: u16 = 0x2300;

/// What an old bootstub answers to a hardware type query it doesn't implement
pub const MISSING_HW_TYPE_SIGNATURE: [u8; 8] = [0xff, 0x00, 0xc1, 0x3e, 0xde, 0xad, 0xd0, 0x0d];
pub const FLASHER_SIGNATURE: [u8; 4] = [0xde, 0xad, 0xd0, 0x0d];

pub const DLC_TO_LEN: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Data length code for a payload length, if the length is one the bus can carry
pub fn len_to_dlc(len: usize) -> Option<u8> {
    DLC_TO_LEN.iter().position(|&l| l == len).map(|dlc| dlc as u8)
}

#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    num_enum::TryFromPrimitive,
    num_enum::IntoPrimitive,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
)]
pub enum UsbRequests {
    DevicePower = 0xa0,
    HarnessOrientation = 0xa1,
    Ignition = 0xa2,
    MicrosecondTimer = 0xa8,
    FlasherPresent = 0xb0,
    FlashUnlock = 0xb1,
    FlashErase = 0xb2,
    PhonePower = 0xb3,
    ResetCommunications = 0xc0,
    HardwareType = 0xc1,
    CanHealth = 0xc2,
    Uid = 0xc3,
    Serial = 0xd0,
    EnterBootMode = 0xd1,
    Health = 0xd2,
    SignaturePart1 = 0xd3,
    SignaturePart2 = 0xd4,
    Version = 0xd6,
    Reset = 0xd8,
    ObdMode = 0xdb,
    PacketVersions = 0xdd,
    CanSpeed = 0xde,
    DebugRead = 0xe0,
    CanLoopback = 0xe5,
    CanClear = 0xf1,
    CanForwarding = 0xf3,
    CanEnable = 0xf4,
    GreenLed = 0xf7,
    CanDataSpeed = 0xf9,
    CanFdNonIso = 0xfc,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
pub enum HarnessOrientation {
    None = 0,
    Normal = 1,
    Flipped = 2,
}
