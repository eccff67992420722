//! Recovery through the ST system bootloader (DfuSe), for when the bootstub
//! itself can no longer be trusted.

use crate::config::Timeouts;
use crate::mcu::McuType;
use crate::transport::{DeviceMode, Transport, UsbBus, DFU_REQUEST_IN, DFU_REQUEST_OUT};
use crate::{RelayError, Result};

use relay_common::SERIAL_LEN;

use std::path::Path;
use std::time::{Duration, Instant};

pub(crate) const DFU_DNLOAD: u8 = 1;
pub(crate) const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

const STATE_UPLOAD_IDLE: u8 = 0x9;
const STATE_ERROR: u8 = 0xa;

// DfuSe commands, sent as the payload of a block 0 download
const CMD_SET_ADDRESS: u8 = 0x21;
const CMD_ERASE: u8 = 0x41;

const STATUS_LEN: usize = 6;
const MAX_STRING_DESCRIPTORS: u8 = 20;
const INTERNAL_FLASH: &str = "@Internal Flash";

/// Serial the ST bootloader reports for the unit with application serial
/// `serial`. Both are derived from the same MCU unique id.
pub fn derive_dfu_serial(serial: &str, mcu: McuType) -> Result<String> {
    let invalid = || RelayError::InvalidSerial(serial.to_owned());
    if serial.len() != SERIAL_LEN {
        return Err(invalid());
    }
    let raw = hex::decode(serial).map_err(|_| invalid())?;
    let w: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    let offset = match mcu {
        McuType::F4 => 0xa,
        McuType::H7 => 0,
    };
    let words = [
        w[1].wrapping_add(w[5]),
        w[0].wrapping_add(w[4]).wrapping_add(offset),
        w[3],
    ];
    let packed: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    Ok(hex::encode_upper(packed))
}

/// Serials of all attached devices in DFU mode
pub fn list_dfu_serials<B: UsbBus>(bus: &B) -> Result<Vec<String>> {
    let mut serials: Vec<String> = Vec::new();
    for device in bus.devices()? {
        if device.mode != DeviceMode::Dfu {
            continue;
        }
        if let Some(serial) = device.serial {
            if !serials.contains(&serial) {
                serials.push(serial);
            }
        }
    }
    Ok(serials)
}

/// Sector count advertised in an "@Internal Flash  /0x08000000/04*016Kg,..."
/// interface string
fn sector_count(desc: &str) -> Option<usize> {
    desc.split('/')
        .nth(2)?
        .split(',')
        .map(|group| group.split('*').next()?.trim().parse::<usize>().ok())
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout: Duration,
    pub state: u8,
}

impl DfuStatus {
    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < STATUS_LEN {
            return Err(RelayError::ShortResponse(STATUS_LEN, buf.len()));
        }
        let poll_ms = u32::from_le_bytes([buf[1], buf[2], buf[3], 0]);
        Ok(Self {
            status: buf[0],
            poll_timeout: Duration::from_millis(poll_ms as u64),
            state: buf[4],
        })
    }
}

/// An open device in DFU mode
pub struct DfuRecovery<T: Transport> {
    handle: T,
    mcu: McuType,
    timeouts: Timeouts,
}

impl<T: Transport> DfuRecovery<T> {
    /// Open the DFU device with the given serial, or the first one found
    pub fn open<B>(bus: &B, dfu_serial: Option<&str>, timeouts: Timeouts) -> Result<Self>
    where
        B: UsbBus<Handle = T>,
    {
        let device = bus
            .devices()?
            .into_iter()
            .find(|d| {
                d.mode == DeviceMode::Dfu
                    && d.serial.is_some()
                    && (dfu_serial.is_none() || d.serial.as_deref() == dfu_serial)
            })
            .ok_or(RelayError::NoDeviceError)?;
        Self::from_handle(bus.open(&device, true)?, timeouts)
    }

    pub fn from_handle(handle: T, timeouts: Timeouts) -> Result<Self> {
        let mcu = Self::detect_mcu(&handle)?;
        log::debug!("DFU device is {:?}", mcu);
        Ok(Self {
            handle,
            mcu,
            timeouts,
        })
    }

    fn detect_mcu(handle: &T) -> Result<McuType> {
        let desc = (0..MAX_STRING_DESCRIPTORS)
            .filter_map(|i| handle.read_string_descriptor(i).ok())
            .find(|desc| desc.starts_with(INTERNAL_FLASH))
            .ok_or(RelayError::UnknownMcu(0))?;
        McuType::from_sector_count(sector_count(&desc).unwrap_or(0))
    }

    pub fn mcu(&self) -> McuType {
        self.mcu
    }

    fn download(&self, block: u16, data: &[u8]) -> Result<()> {
        self.handle.write_control(
            DFU_REQUEST_OUT,
            DFU_DNLOAD,
            block,
            0,
            data,
            self.timeouts.control,
        )?;
        Ok(())
    }

    pub fn status(&self) -> Result<DfuStatus> {
        let mut buf = [0_u8; STATUS_LEN];
        let n = self.handle.read_control(
            DFU_REQUEST_IN,
            DFU_GETSTATUS,
            0,
            0,
            &mut buf,
            self.timeouts.control,
        )?;
        DfuStatus::from_bytes(&buf[..n])
    }

    /// Poll until the bootloader has nothing left to do
    fn wait_idle(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeouts.flash;
        loop {
            let stat = self.status()?;
            if stat.poll_timeout.is_zero() {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(RelayError::DfuStatusTimeout);
            }
            std::thread::sleep(stat.poll_timeout);
        }
    }

    pub fn clear_status(&self) -> Result<()> {
        match self.status()?.state {
            STATE_ERROR => {
                self.handle.write_control(
                    DFU_REQUEST_OUT,
                    DFU_CLRSTATUS,
                    0,
                    0,
                    &[],
                    self.timeouts.control,
                )?;
            }
            STATE_UPLOAD_IDLE => {
                self.handle.write_control(
                    DFU_REQUEST_OUT,
                    DFU_ABORT,
                    0,
                    0,
                    &[],
                    self.timeouts.control,
                )?;
                self.wait_idle()?;
            }
            _ => {}
        }
        self.status()?;
        Ok(())
    }

    pub fn erase(&self, address: u32) -> Result<()> {
        let mut cmd = vec![CMD_ERASE];
        cmd.extend_from_slice(&address.to_le_bytes());
        self.download(0, &cmd)?;
        self.wait_idle()
    }

    fn set_address(&self, address: u32) -> Result<()> {
        let mut cmd = vec![CMD_SET_ADDRESS];
        cmd.extend_from_slice(&address.to_le_bytes());
        self.download(0, &cmd)?;
        self.wait_idle()
    }

    /// Write `data` starting at `address`, one padded block at a time
    pub fn program(&self, address: u32, data: &[u8]) -> Result<()> {
        self.set_address(address)?;

        let block_size = data.len().min(self.mcu.config().block_size());
        if block_size == 0 {
            return Ok(());
        }
        for (i, chunk) in data.chunks(block_size).enumerate() {
            let mut block = chunk.to_vec();
            block.resize(block_size, 0xff);
            log::debug!("programming block {} with length {}", i, block.len());
            self.download(2 + i as u16, &block)?;
            self.wait_idle()?;
        }
        Ok(())
    }

    /// Wipe the bootstub and the start of the application, then write a
    /// fresh bootstub
    pub fn program_bootstub(&self, code: &[u8]) -> Result<()> {
        let config = self.mcu.config();
        self.clear_status()?;
        self.erase(config.bootstub_address())?;
        self.erase(config.app_address())?;
        self.program(config.bootstub_address(), code)
    }

    /// Leave DFU mode and start executing at `address`. The device drops
    /// off the bus while answering the leave request, so transfer errors
    /// from that point on are ignored.
    pub fn jump(&self, address: u32) -> Result<()> {
        self.clear_status()?;
        self.set_address(address)?;
        let leave = self
            .download(2, &[])
            .and_then(|_| self.status().map(|_| ()));
        if let Err(e) = leave {
            log::debug!("DFU: jump dropped the device: {}", e);
        }
        Ok(())
    }

    /// Reprogram the bootstub image from `firmware_dir` and start it
    pub fn recover(&self, firmware_dir: &Path) -> Result<()> {
        let path = firmware_dir.join(self.mcu.config().bootstub_fn());
        let code = std::fs::read(&path)?;
        log::warn!("DFU: recovering {:?} with {}", self.mcu, path.display());
        self.program_bootstub(&code)?;
        self.jump(self.mcu.config().bootstub_address())
    }
}
