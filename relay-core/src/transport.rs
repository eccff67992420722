//! USB access seam: everything above this module only talks to [`Transport`]
//! and [`UsbBus`], so the protocol logic runs against real hardware through
//! `rusb` or against a scripted device in tests.

use crate::Result;

use relay_common::{
    APP_PRODUCT_ID, BOOTSTUB_PRODUCT_ID, DFU_PRODUCT_ID, DFU_SERIAL_DESCRIPTOR, DFU_VENDOR_ID,
    VENDOR_ID,
};

use rusb::UsbContext;

use std::time::Duration;

pub const REQUEST_IN: u8 = 0xc0; // vendor | device | in
pub const REQUEST_OUT: u8 = 0x40; // vendor | device | out
pub const DFU_REQUEST_IN: u8 = 0xa1; // class | interface | in
pub const DFU_REQUEST_OUT: u8 = 0x21; // class | interface | out

/// The subset of `rusb::DeviceHandle` the driver needs
pub trait Transport {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn read_string_descriptor(&self, index: u8) -> rusb::Result<String>;
}

/// Which personality a device enumerated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    Application,
    Bootstub,
    Dfu,
}

impl DeviceMode {
    pub fn from_ids(vendor_id: u16, product_id: u16) -> Option<Self> {
        match (vendor_id, product_id) {
            (VENDOR_ID, APP_PRODUCT_ID) => Some(DeviceMode::Application),
            (VENDOR_ID, BOOTSTUB_PRODUCT_ID) => Some(DeviceMode::Bootstub),
            (DFU_VENDOR_ID, DFU_PRODUCT_ID) => Some(DeviceMode::Dfu),
            _ => None,
        }
    }
}

/// Enumeration result, enough to pick a device and open it later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub mode: DeviceMode,
    /// iSerialNumber for our own modes, string descriptor 3 in DFU mode
    pub serial: Option<String>,
    pub bcd_device: u16,
    pub bus_number: u8,
    pub address: u8,
}

pub trait UsbBus {
    type Handle: Transport;

    /// All attached devices in one of the known modes
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    fn open(&self, device: &DeviceInfo, claim: bool) -> Result<Self::Handle>;
}

/// Opened device, optionally holding interface 0
pub struct UsbHandle {
    handle: rusb::DeviceHandle<rusb::Context>,
    claimed: bool,
}

impl Transport for UsbHandle {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .write_control(request_type, request, value, index, buf, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, buf, timeout)
    }

    fn read_string_descriptor(&self, index: u8) -> rusb::Result<String> {
        self.handle.read_string_descriptor_ascii(index)
    }
}

impl Drop for UsbHandle {
    fn drop(&mut self) {
        if self.claimed {
            let _ = self.handle.release_interface(0);
        }
    }
}

/// `bcdDevice` back in its raw form; rusb only hands out the decoded version.
/// Nibbles above 9 do not survive the decode: raw `0x0A00` comes back as
/// `0x1000`. The hardware type byte only ever holds 1 or 2.
fn raw_bcd(version: rusb::Version) -> u16 {
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16) << 4)
        | version.sub_minor() as u16
}

/// libusb backed bus
pub struct RusbBus {
    context: rusb::Context,
}

impl RusbBus {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: rusb::Context::new()?,
        })
    }

    fn read_serial(
        device: &rusb::Device<rusb::Context>,
        desc: &rusb::DeviceDescriptor,
        mode: DeviceMode,
    ) -> rusb::Result<String> {
        let handle = device.open()?;
        match mode {
            DeviceMode::Dfu => handle.read_string_descriptor_ascii(DFU_SERIAL_DESCRIPTOR),
            _ => handle.read_serial_number_string_ascii(desc),
        }
    }
}

impl UsbBus for RusbBus {
    type Handle = UsbHandle;

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut found = Vec::new();
        for device in self.context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            let mode = match DeviceMode::from_ids(desc.vendor_id(), desc.product_id()) {
                Some(mode) => mode,
                None => continue,
            };
            let serial = match Self::read_serial(&device, &desc, mode) {
                Ok(serial) => Some(serial),
                Err(e) => {
                    log::debug!("skipping {:?} device without readable serial: {}", mode, e);
                    continue;
                }
            };
            found.push(DeviceInfo {
                mode,
                serial,
                bcd_device: raw_bcd(desc.device_version()),
                bus_number: device.bus_number(),
                address: device.address(),
            });
        }
        Ok(found)
    }

    fn open(&self, info: &DeviceInfo, claim: bool) -> Result<UsbHandle> {
        let device = self
            .context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == info.bus_number && d.address() == info.address)
            .ok_or(crate::RelayError::NoDeviceError)?;

        let handle = device.open()?;
        if claim {
            // not supported everywhere, the claim below reports real problems
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(0)?;
        }

        log::debug!("opened {:?} device {:?}", info.mode, info.serial);
        Ok(UsbHandle {
            handle,
            claimed: claim,
        })
    }
}
