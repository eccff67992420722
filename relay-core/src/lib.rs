//! Host side driver for the USB CAN relay.
//!
//! [`DeviceSession`] owns one connection; flashing, DFU recovery and
//! reconnecting all hang off it. Everything talks to USB through the
//! [`UsbBus`]/[`Transport`] traits, [`RusbBus`] being the real one.

pub mod codec;
pub mod config;
pub mod dfu;
pub mod errors;
pub mod flash;
pub mod mcu;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod version;

#[cfg(test)]
mod testing;

pub use codec::{CanFrame, PacketFormat, WireCodec};
pub use config::{init_logging, CancelToken, LogConfig, RetryPolicy, SessionConfig, Timeouts};
pub use dfu::{derive_dfu_serial, DfuRecovery};
pub use errors::{PacketKind, RelayError};
pub use flash::{flash_static, FlashJob};
pub use mcu::{McuConfig, McuType};
pub use session::{DeviceIdentity, DeviceSession, ProvisionedSerial, ResetKind};
pub use transport::{DeviceInfo, DeviceMode, RusbBus, Transport, UsbBus, UsbHandle};
pub use version::ProtocolVersions;

pub use relay_common::{CanHealth, HarnessOrientation, Health, LastErrorCode};

pub type Result<T> = std::result::Result<T, RelayError>;
