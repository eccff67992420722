use crate::codec::{CanFrame, PacketFormat};
use crate::config::SessionConfig;
use crate::errors::PacketKind;
use crate::mcu::McuType;
use crate::transport::{DeviceInfo, DeviceMode, Transport, UsbBus, REQUEST_IN, REQUEST_OUT};
use crate::version::{ensure_version, ProtocolVersions};
use crate::{dfu, RelayError, Result};

use getset::{CopyGetters, Getters};

use relay_common::{
    CanHealth, HarnessOrientation, Health, UsbRequests, CAN_HEALTH_PACKET_VERSION,
    CAN_IN_ENDPOINT, CAN_OUT_ENDPOINT, HEALTH_PACKET_VERSION, LEGACY_BCD_PLACEHOLDER,
    MISSING_HW_TYPE_SIGNATURE, SERIAL_LEN, USB_PACKET_MAX_SIZE,
};

use sha1::{Digest, Sha1};

use std::time::Duration;

const CAN_RECV_BATCH: usize = 16384;
const PROVISION_CHUNK_LEN: usize = 0x20;
const PROVISION_HASHED_LEN: usize = 0x1c;

pub(crate) fn control_read<T: Transport>(
    handle: &T,
    request: UsbRequests,
    value: u16,
    index: u16,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; len];
    let n = handle.read_control(REQUEST_IN, request.into(), value, index, &mut buf, timeout)?;
    buf.truncate(n);
    Ok(buf)
}

pub(crate) fn control_write<T: Transport>(
    handle: &T,
    request: UsbRequests,
    value: u16,
    index: u16,
    timeout: Duration,
) -> Result<()> {
    handle.write_control(REQUEST_OUT, request.into(), value, index, &[], timeout)?;
    Ok(())
}

/// Requests older firmware doesn't implement stall; treat that as no answer
fn optional(answer: Result<Vec<u8>>) -> Result<Vec<u8>> {
    match answer {
        Err(RelayError::RusbError(rusb::Error::Pipe)) => Ok(Vec::new()),
        other => other,
    }
}

fn exact(buf: Vec<u8>, expected: usize) -> Result<Vec<u8>> {
    if buf.len() < expected {
        return Err(RelayError::ShortResponse(expected, buf.len()));
    }
    Ok(buf)
}

/// How to leave the running firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Normal,
    /// restart into the bootstub so the application can be reflashed
    Bootstub,
    /// restart into the ST system bootloader (DFU)
    Bootloader,
}

impl ResetKind {
    fn request(self) -> (UsbRequests, u16) {
        match self {
            ResetKind::Normal => (UsbRequests::Reset, 0),
            ResetKind::Bootstub => (UsbRequests::EnterBootMode, 1),
            ResetKind::Bootloader => (UsbRequests::EnterBootMode, 0),
        }
    }
}

/// What we learned about the device while connecting
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct DeviceIdentity {
    #[getset(get_copy = "pub")]
    mode: DeviceMode,
    #[getset(get = "pub")]
    serial: String,
    #[getset(get_copy = "pub")]
    mcu: McuType,
    /// hardware type some bootstubs put in bcdDevice
    #[getset(get_copy = "pub")]
    legacy_hw_type: Option<u8>,
}

impl DeviceIdentity {
    pub fn is_bootstub(&self) -> bool {
        self.mode == DeviceMode::Bootstub
    }
}

/// Provisioning data, only returned once its hash checks out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedSerial {
    pub dongle_id: String,
    pub secret: String,
}

/// Work out the MCU family from whatever this firmware generation offers.
///
/// Current firmware answers the hardware type query with a single byte.
/// Bootstubs from before that query existed answer with a fixed signature
/// instead, and some of them put the hardware type in bcdDevice. The oldest
/// ones offer neither; those only ever shipped on F4 hardware.
pub fn detect_mcu(response: &[u8], bootstub: bool, legacy_hw_type: Option<u8>) -> Result<McuType> {
    if let [hw_type] = response {
        return McuType::from_hw_type(*hw_type);
    }

    let missing_endpoint = bootstub && response.starts_with(&MISSING_HW_TYPE_SIGNATURE);
    match legacy_hw_type {
        Some(hw_type) if missing_endpoint => McuType::from_hw_type(hw_type),
        _ => Ok(McuType::F4),
    }
}

/// Connection to one device in application or bootstub mode
#[derive(Getters, CopyGetters)]
pub struct DeviceSession<B: UsbBus> {
    #[getset(get = "pub")]
    bus: B,
    handle: Option<B::Handle>,

    #[getset(get = "pub")]
    config: SessionConfig,

    #[getset(get = "pub")]
    identity: Option<DeviceIdentity>,

    #[getset(get_copy = "pub")]
    versions: ProtocolVersions,

    #[getset(get_copy = "pub")]
    packet_format: PacketFormat,

    rx_leftover: Vec<u8>,

    /// survives disconnects so a device stuck in DFU can still be found
    last_known: Option<(String, McuType)>,
}

impl<B: UsbBus> DeviceSession<B> {
    /// Connect to the first matching device and reset its CAN comms
    pub fn new(bus: B, config: SessionConfig) -> Result<Self> {
        let mut session = Self {
            bus,
            handle: None,
            config,
            identity: None,
            versions: ProtocolVersions::default(),
            packet_format: PacketFormat::Checksummed,
            rx_leftover: Vec::new(),
            last_known: None,
        };
        session.connect(false)?;
        session.can_reset_communications()?;
        Ok(session)
    }

    /// Serials of all attached devices in application or bootstub mode
    pub fn list(bus: &B) -> Result<Vec<String>> {
        let mut serials: Vec<String> = Vec::new();
        for device in bus.devices()? {
            if device.mode == DeviceMode::Dfu {
                continue;
            }
            match device.serial {
                Some(serial) if serial.len() == SERIAL_LEN => {
                    if !serials.contains(&serial) {
                        serials.push(serial);
                    }
                }
                other => log::warn!("found device with invalid serial: {:?}", other),
            }
        }
        Ok(serials)
    }

    fn find_device(&self) -> Result<Option<DeviceInfo>> {
        let wanted = self.config.serial().as_deref();
        Ok(self.bus.devices()?.into_iter().find(|d| {
            d.mode != DeviceMode::Dfu
                && d.serial.is_some()
                && (wanted.is_none() || d.serial.as_deref() == wanted)
        }))
    }

    pub(crate) fn check_cancel(&self) -> Result<()> {
        if self.config.cancel().is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        Ok(())
    }

    /// Open the device, optionally polling until one shows up
    pub fn connect(&mut self, wait: bool) -> Result<()> {
        self.close();

        let device = loop {
            if let Some(device) = self.find_device()? {
                break device;
            }
            if !wait {
                return Err(RelayError::NoDeviceError);
            }
            self.check_cancel()?;
            std::thread::sleep(self.config.retry().poll_interval);
        };

        let handle = self.bus.open(&device, self.config.claim())?;
        let timeout = self.config.timeouts().control;
        let bootstub = device.mode == DeviceMode::Bootstub;

        // bcdDevice wasn't always the hardware type, ignore the old constant
        let legacy_hw_type = (device.bcd_device != LEGACY_BCD_PLACEHOLDER)
            .then(|| (device.bcd_device >> 8) as u8);

        let hw_response = optional(control_read(
            &handle,
            UsbRequests::HardwareType,
            0,
            0,
            USB_PACKET_MAX_SIZE,
            timeout,
        ))?;
        let mcu = detect_mcu(&hw_response, bootstub, legacy_hw_type)?;

        let versions = ProtocolVersions::from_response(&optional(control_read(
            &handle,
            UsbRequests::PacketVersions,
            0,
            0,
            3,
            timeout,
        ))?);

        let serial = device.serial.unwrap_or_default();
        self.packet_format = self
            .config
            .packet_format()
            .unwrap_or_else(|| PacketFormat::for_can_version(versions.can));
        self.versions = versions;
        self.config.set_serial(Some(serial.clone()));
        self.last_known = Some((serial.clone(), mcu));
        self.identity = Some(DeviceIdentity {
            mode: device.mode,
            serial,
            mcu,
            legacy_hw_type,
        });
        self.handle = Some(handle);

        log::debug!(
            "connected: {:?} {:?}, {:?}, {:?}",
            device.mode,
            self.config.serial(),
            mcu,
            versions
        );
        Ok(())
    }

    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            log::debug!("closed {:?}", self.config.serial());
        }
        self.identity = None;
        self.versions = ProtocolVersions::default();
        self.packet_format = PacketFormat::Checksummed;
        self.rx_leftover.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn handle(&self) -> Result<&B::Handle> {
        self.handle.as_ref().ok_or(RelayError::NotConnectedError)
    }

    pub(crate) fn connected_identity(&self) -> Result<&DeviceIdentity> {
        self.identity.as_ref().ok_or(RelayError::NotConnectedError)
    }

    /// Serial and MCU of the last device we talked to
    pub fn last_known(&self) -> Option<(&str, McuType)> {
        self.last_known.as_ref().map(|(s, m)| (s.as_str(), *m))
    }

    /// Serial the device will show in DFU mode
    pub fn dfu_serial(&self) -> Result<String> {
        let (serial, mcu) = self.last_known().ok_or(RelayError::NotConnectedError)?;
        dfu::derive_dfu_serial(serial, mcu)
    }

    fn read(&self, request: UsbRequests, value: u16, index: u16, len: usize) -> Result<Vec<u8>> {
        control_read(
            self.handle()?,
            request,
            value,
            index,
            len,
            self.config.timeouts().control,
        )
    }

    fn write(&self, request: UsbRequests, value: u16, index: u16) -> Result<()> {
        control_write(
            self.handle()?,
            request,
            value,
            index,
            self.config.timeouts().control,
        )
    }

    /// Issue a reset. The device drops off the bus before answering, so
    /// the resulting transfer error is expected and dropped.
    pub fn reset(&self, kind: ResetKind) -> Result<()> {
        let (request, value) = kind.request();
        if let Err(e) = control_write(
            self.handle()?,
            request,
            value,
            0,
            self.config.timeouts().reset,
        ) {
            log::debug!("reset {:?}: ignoring {}", kind, e);
        }
        Ok(())
    }

    // ******************* health *******************

    pub fn health(&self) -> Result<Health> {
        ensure_version(PacketKind::Health, self.versions.health, HEALTH_PACKET_VERSION)?;
        let dat = self.read(UsbRequests::Health, 0, 0, Health::SIZE)?;
        Ok(Health::from_bytes(&dat)?)
    }

    pub fn can_health(&self, bus: u16) -> Result<CanHealth> {
        ensure_version(
            PacketKind::CanHealth,
            self.versions.can_health,
            CAN_HEALTH_PACKET_VERSION,
        )?;
        let dat = self.read(UsbRequests::CanHealth, bus, 0, CanHealth::SIZE)?;
        Ok(CanHealth::from_bytes(&dat)?)
    }

    // ******************* can *******************

    pub fn can_reset_communications(&self) -> Result<()> {
        self.write(UsbRequests::ResetCommunications, 0, 0)
    }

    /// Drop a queue on the device: a bus number clears that bus's TX queue,
    /// 0xffff the shared RX queue.
    pub fn can_clear(&self, bus: u16) -> Result<()> {
        self.write(UsbRequests::CanClear, bus, 0)
    }

    /// Send frames, riding out congestion: partial writes resubmit the
    /// unsent tail and I/O or overflow errors retry until cancelled.
    pub fn can_send_many(&self, frames: &[CanFrame]) -> Result<()> {
        ensure_version(
            PacketKind::Can,
            self.versions.can,
            self.packet_format.packet_version(),
        )?;
        let chunks = self.packet_format.encode(frames)?;
        let handle = self.handle()?;
        let timeout = self.config.timeouts().can_send;

        if self.config.log().trace_frames {
            for frame in frames {
                log::trace!("  W {:#x} bus {}: {}", frame.address, frame.bus, hex::encode(&frame.data));
            }
        }

        for chunk in &chunks {
            let mut tx = &chunk[..];
            while !tx.is_empty() {
                self.check_cancel()?;
                match handle.write_bulk(CAN_OUT_ENDPOINT, tx, timeout) {
                    Ok(n) => {
                        tx = &tx[n..];
                        if !tx.is_empty() {
                            log::error!("CAN: partial send, retrying");
                        }
                    }
                    Err(e) => {
                        let e = RelayError::from(e);
                        if !e.is_transient() {
                            return Err(e);
                        }
                        log::error!("CAN: bad send, retrying");
                    }
                }
            }
        }
        Ok(())
    }

    pub fn can_send(&self, address: u32, data: &[u8], bus: u16) -> Result<()> {
        self.can_send_many(&[CanFrame::new(address, bus, data)?])
    }

    /// One bulk read worth of frames. A packet split across reads is held
    /// back until the rest arrives. A read that fails its checksum is
    /// dropped; [`Self::discard_rx_buffer`] also drops the held back bytes.
    pub fn can_recv(&mut self) -> Result<Vec<CanFrame>> {
        ensure_version(
            PacketKind::Can,
            self.versions.can,
            self.packet_format.packet_version(),
        )?;
        let timeouts = self.config.timeouts();
        let backoff = self.config.retry().recv_backoff;

        let mut buf = vec![0_u8; CAN_RECV_BATCH];
        let n = loop {
            self.check_cancel()?;
            match self.handle()?.read_bulk(CAN_IN_ENDPOINT, &mut buf, timeouts.can_recv) {
                Ok(n) => break n,
                Err(rusb::Error::Timeout) => break 0,
                Err(e) => {
                    let e = RelayError::from(e);
                    if !e.is_transient() {
                        return Err(e);
                    }
                    log::error!("CAN: bad recv, retrying");
                    std::thread::sleep(backoff);
                }
            }
        };

        // a corrupt batch is dropped, the previous leftover stays
        let mut pending = self.rx_leftover.clone();
        pending.extend_from_slice(&buf[..n]);
        let (frames, leftover) = self.packet_format.decode(&pending)?;
        self.rx_leftover = leftover;

        if self.config.log().trace_frames {
            for frame in &frames {
                log::trace!("  R {:#x} bus {}: {}", frame.address, frame.bus, hex::encode(&frame.data));
            }
        }
        Ok(frames)
    }

    pub fn discard_rx_buffer(&mut self) {
        if !self.rx_leftover.is_empty() {
            log::warn!("discarding {} buffered CAN bytes", self.rx_leftover.len());
        }
        self.rx_leftover.clear();
    }

    // ******************* control *******************

    pub fn version(&self) -> Result<String> {
        let dat = self.read(UsbRequests::Version, 0, 0, USB_PACKET_MAX_SIZE)?;
        Ok(String::from_utf8_lossy(&dat)
            .trim_end_matches('\0')
            .to_owned())
    }

    /// The 128 byte signature of the running application
    pub fn signature(&self) -> Result<Vec<u8>> {
        let mut sig = exact(
            self.read(UsbRequests::SignaturePart1, 0, 0, USB_PACKET_MAX_SIZE)?,
            USB_PACKET_MAX_SIZE,
        )?;
        sig.extend(exact(
            self.read(UsbRequests::SignaturePart2, 0, 0, USB_PACKET_MAX_SIZE)?,
            USB_PACKET_MAX_SIZE,
        )?);
        Ok(sig)
    }

    pub fn provisioned_serial(&self) -> Result<ProvisionedSerial> {
        let dat = exact(
            self.read(UsbRequests::Serial, 0, 0, PROVISION_CHUNK_LEN)?,
            PROVISION_CHUNK_LEN,
        )?;
        let digest = Sha1::digest(&dat[..PROVISION_HASHED_LEN]);
        if dat[PROVISION_HASHED_LEN..PROVISION_CHUNK_LEN] != digest[..4] {
            return Err(RelayError::SerialSignatureError);
        }

        let text = |range: std::ops::Range<usize>| {
            String::from_utf8(dat[range].to_vec())
                .map_err(|_| RelayError::InvalidSerial(hex::encode(&dat[..PROVISION_HASHED_LEN])))
        };
        Ok(ProvisionedSerial {
            dongle_id: text(0..0x10)?,
            secret: text(0x10..0x1a)?,
        })
    }

    pub fn secret(&self) -> Result<Vec<u8>> {
        exact(self.read(UsbRequests::Serial, 1, 0, 0x10)?, 0x10)
    }

    /// MCU unique id, hex encoded
    pub fn uid(&self) -> Result<String> {
        Ok(hex::encode(exact(self.read(UsbRequests::Uid, 0, 0, 12)?, 12)?))
    }

    pub fn microsecond_timer(&self) -> Result<u32> {
        let dat = exact(self.read(UsbRequests::MicrosecondTimer, 0, 0, 4)?, 4)?;
        Ok(u32::from_le_bytes([dat[0], dat[1], dat[2], dat[3]]))
    }

    /// Drain the firmware's debug console
    pub fn debug_read(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            self.check_cancel()?;
            let dat = self.read(UsbRequests::DebugRead, 0, 0, USB_PACKET_MAX_SIZE)?;
            if dat.is_empty() {
                return Ok(out);
            }
            out.extend(dat);
        }
    }

    // ******************* configuration *******************

    pub fn set_obd(&self, obd: bool) -> Result<()> {
        self.write(UsbRequests::ObdMode, obd as u16, 0)
    }

    /// Loopback on all buses
    pub fn set_can_loopback(&self, enable: bool) -> Result<()> {
        self.write(UsbRequests::CanLoopback, enable as u16, 0)
    }

    /// Transceiver enable pin
    pub fn set_can_enable(&self, bus: u16, enable: bool) -> Result<()> {
        self.write(UsbRequests::CanEnable, bus, enable as u16)
    }

    pub fn set_can_speed_kbps(&self, bus: u16, speed: f32) -> Result<()> {
        self.write(UsbRequests::CanSpeed, bus, (speed * 10.0).round() as u16)
    }

    pub fn set_can_data_speed_kbps(&self, bus: u16, speed: f32) -> Result<()> {
        self.write(UsbRequests::CanDataSpeed, bus, (speed * 10.0).round() as u16)
    }

    pub fn set_canfd_non_iso(&self, bus: u16, non_iso: bool) -> Result<()> {
        self.write(UsbRequests::CanFdNonIso, bus, non_iso as u16)
    }

    pub fn set_phone_power(&self, enabled: bool) -> Result<()> {
        self.write(UsbRequests::PhonePower, enabled as u16, 0)
    }

    pub fn set_green_led(&self, enabled: bool) -> Result<()> {
        self.write(UsbRequests::GreenLed, enabled as u16, 0)
    }

    pub fn set_harness_orientation(&self, orientation: HarnessOrientation) -> Result<()> {
        self.write(UsbRequests::HarnessOrientation, u8::from(orientation) as u16, 0)
    }

    pub fn set_ignition(&self, enabled: bool) -> Result<()> {
        self.write(UsbRequests::Ignition, enabled as u16, 0)
    }

    pub fn set_device_power(&self, enabled: bool) -> Result<()> {
        self.write(UsbRequests::DevicePower, enabled as u16, 0)
    }

    /// Forward everything received on `from_bus` to `to_bus`
    pub fn set_can_forwarding(&self, from_bus: u16, to_bus: u16) -> Result<()> {
        self.write(UsbRequests::CanForwarding, from_bus, to_bus)
    }
}
