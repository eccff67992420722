//! Getting back to a working session after the device drops off the bus,
//! whether from a reset we asked for or because it got stuck in DFU mode.

use crate::dfu::{list_dfu_serials, DfuRecovery};
use crate::session::{DeviceSession, ResetKind};
use crate::transport::UsbBus;
use crate::{RelayError, Result};

use std::time::{Duration, Instant};

impl<B: UsbBus> DeviceSession<B> {
    /// Close, let the device settle, then try to connect again. A device
    /// that shows up in DFU mode instead is reprogrammed with a fresh
    /// bootstub between attempts.
    pub fn reconnect(&mut self) -> Result<()> {
        let retry = self.config().retry();
        if self.is_connected() {
            self.close();
            std::thread::sleep(retry.settle);
        }

        for attempt in 1..=retry.attempts {
            self.check_cancel()?;
            match self.connect(false) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!("reconnecting, attempt {} failed: {}", attempt, e);
                    if let Err(e) = self.recover_from_dfu() {
                        log::debug!("no DFU recovery: {}", e);
                    }
                    std::thread::sleep(retry.interval);
                }
            }
        }
        Err(RelayError::ReconnectFailed(retry.attempts))
    }

    fn recover_from_dfu(&self) -> Result<()> {
        let dfu_serial = self.dfu_serial()?;
        let timeouts = self.config().timeouts();
        let dfu = DfuRecovery::open(self.bus(), Some(dfu_serial.as_str()), timeouts)?;
        dfu.recover(self.config().firmware_dir())
    }

    /// Reset and wait for the device to come back. Nothing comes back from
    /// the bootloader reset, so that one just closes the session.
    pub fn reset_and_reconnect(&mut self, kind: ResetKind) -> Result<()> {
        self.reset(kind)?;
        match kind {
            ResetKind::Bootloader => {
                self.close();
                Ok(())
            }
            _ => self.reconnect(),
        }
    }

    fn wait_until(
        &self,
        what: &str,
        timeout: Option<Duration>,
        mut present: impl FnMut(&B) -> Result<bool>,
    ) -> Result<bool> {
        let start = Instant::now();
        loop {
            if present(self.bus())? {
                return Ok(true);
            }
            self.check_cancel()?;
            if timeout.map_or(false, |t| start.elapsed() >= t) {
                return Ok(false);
            }
            log::debug!("waiting for {}...", what);
            std::thread::sleep(self.config().retry().poll_interval);
        }
    }

    /// Poll for a DFU device, a specific one if `dfu_serial` is given.
    /// `Ok(false)` once `timeout` passes.
    pub fn wait_for_dfu(&self, dfu_serial: Option<&str>, timeout: Option<Duration>) -> Result<bool> {
        self.wait_until("DFU", timeout, |bus| {
            let serials = list_dfu_serials(bus)?;
            Ok(match dfu_serial {
                Some(serial) => serials.iter().any(|s| s == serial),
                None => !serials.is_empty(),
            })
        })
    }

    /// Poll for a device in application or bootstub mode
    pub fn wait_for_device(&self, serial: Option<&str>, timeout: Option<Duration>) -> Result<bool> {
        self.wait_until("device", timeout, |bus| {
            let serials = Self::list(bus)?;
            Ok(match serial {
                Some(serial) => serials.iter().any(|s| s == serial),
                None => !serials.is_empty(),
            })
        })
    }

    /// Full recovery: drop into the ST bootloader, rewrite the bootstub,
    /// then flash the application over it. `Ok(false)` if the device never
    /// showed up in DFU mode within `timeout`.
    pub fn recover_with_timeout(&mut self, timeout: Option<Duration>, reset: bool) -> Result<bool> {
        let dfu_serial = self.dfu_serial()?;

        if reset {
            self.reset_and_reconnect(ResetKind::Bootstub)?;
            self.reset_and_reconnect(ResetKind::Bootloader)?;
        } else {
            self.close();
        }

        if !self.wait_for_dfu(Some(dfu_serial.as_str()), timeout)? {
            log::warn!("{} never showed up in DFU mode", dfu_serial);
            return Ok(false);
        }

        DfuRecovery::open(self.bus(), Some(dfu_serial.as_str()), self.config().timeouts())?
            .recover(self.config().firmware_dir())?;

        self.connect(true)?;
        self.flash(None, true)?;
        Ok(true)
    }
}
