//! Reflashing the application through the bootstub.

use crate::config::Timeouts;
use crate::mcu::{McuConfig, McuType};
use crate::session::{control_read, control_write, DeviceSession, ResetKind};
use crate::transport::{Transport, UsbBus};
use crate::{RelayError, Result};

use getset::{CopyGetters, Getters};

use relay_common::{UsbRequests, FLASHER_SIGNATURE, FLASH_OUT_ENDPOINT};

use std::borrow::Cow;
use std::ops::RangeInclusive;
use std::path::Path;

const FLASH_STEP: usize = 0x10;
/// Sectors from here on hold the provisioning chunk
const RESERVED_SECTOR: usize = 7;
pub const SIGNATURE_LEN: usize = 128;

/// One flash attempt: the image and the sectors it needs.
/// Sector 0 holds the bootstub and is never touched.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct FlashJob<'a> {
    #[getset(get = "pub")]
    config: &'static McuConfig,
    #[getset(get_copy = "pub")]
    code: &'a [u8],
    #[getset(get_copy = "pub")]
    last_sector: usize,
}

impl<'a> FlashJob<'a> {
    pub fn new(config: &'static McuConfig, code: &'a [u8]) -> Result<Self> {
        if code.is_empty() {
            return Err(RelayError::BinaryTooSmall);
        }

        let mut covered = 0_usize;
        let last_sector = config.sector_sizes()[1..]
            .iter()
            .position(|&size| {
                covered += size as usize;
                covered > code.len()
            })
            .map(|i| i + 1)
            .ok_or(RelayError::BinaryTooLarge)?;

        if last_sector >= RESERVED_SECTOR {
            return Err(RelayError::BinaryTooLarge);
        }

        Ok(Self {
            config,
            code,
            last_sector,
        })
    }

    pub fn sectors(&self) -> RangeInclusive<usize> {
        1..=self.last_sector
    }
}

/// The bootstub answers the flasher check with a fixed signature
pub fn flasher_present<T: Transport>(handle: &T, timeouts: &Timeouts) -> Result<bool> {
    let fr = control_read(handle, UsbRequests::FlasherPresent, 0, 0, 0xc, timeouts.control)?;
    Ok(fr.get(4..8) == Some(&FLASHER_SIGNATURE[..]))
}

/// Write `code` over the application sectors of a device sitting in its
/// bootstub. The device resets at the end and drops off the bus.
pub fn flash_static<T: Transport>(
    handle: &T,
    code: &[u8],
    mcu: McuType,
    timeouts: &Timeouts,
) -> Result<()> {
    let job = FlashJob::new(mcu.config(), code)?;
    if !flasher_present(handle, timeouts)? {
        return Err(RelayError::FlasherNotPresent);
    }

    log::warn!("flash: unlocking");
    control_write(handle, UsbRequests::FlashUnlock, 0, 0, timeouts.control)?;

    log::warn!("flash: erasing sectors 1 - {}", job.last_sector());
    for sector in job.sectors() {
        control_write(handle, UsbRequests::FlashErase, sector as u16, 0, timeouts.flash)?;
    }

    log::warn!("flash: flashing {} bytes", code.len());
    for chunk in code.chunks(FLASH_STEP) {
        let mut tx = chunk;
        while !tx.is_empty() {
            let n = handle.write_bulk(FLASH_OUT_ENDPOINT, tx, timeouts.flash)?;
            tx = &tx[n..];
        }
    }

    log::warn!("flash: resetting");
    if let Err(e) = control_write(handle, UsbRequests::Reset, 0, 0, timeouts.reset) {
        log::debug!("flash: reset dropped the device as expected: {}", e);
    }
    Ok(())
}

/// The trailing signature block of an application image
pub fn signature_from_firmware(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let image = std::fs::read(path)?;
    if image.len() < SIGNATURE_LEN {
        return Err(RelayError::SignatureUnavailable);
    }
    Ok(image[image.len() - SIGNATURE_LEN..].to_vec())
}

impl<B: UsbBus> DeviceSession<B> {
    fn app_image_path(&self) -> Result<std::path::PathBuf> {
        let mcu = self.connected_identity()?.mcu();
        Ok(self.config().firmware_dir().join(mcu.config().app_fn()))
    }

    /// Flash the application, taking the device through its bootstub.
    /// Without `code` the image is read from the firmware directory.
    pub fn flash(&mut self, code: Option<&[u8]>, reconnect: bool) -> Result<()> {
        let code = match code {
            Some(code) => Cow::Borrowed(code),
            None => Cow::Owned(std::fs::read(self.app_image_path()?)?),
        };
        match self.version() {
            Ok(version) => log::debug!("flash: main version is {}", version),
            Err(e) => log::debug!("flash: main version unavailable: {}", e),
        }

        if !self.connected_identity()?.is_bootstub() {
            self.reset(ResetKind::Bootstub)?;
            self.reconnect()?;
        }
        let identity = self.connected_identity()?;
        if !identity.is_bootstub() {
            return Err(RelayError::NotInBootstub);
        }
        let mcu = identity.mcu();

        flash_static(self.handle()?, &code, mcu, &self.config().timeouts())?;

        if reconnect {
            self.reconnect()?;
        } else {
            self.close();
        }
        Ok(())
    }

    /// Whether the running application matches the image on disk
    pub fn up_to_date(&self) -> Result<bool> {
        let current = self.signature()?;
        let expected = signature_from_firmware(self.app_image_path()?)?;
        Ok(current == expected)
    }
}
