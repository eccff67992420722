//! Scripted stand-in for the USB stack. A `MockBus` holds the devices that
//! are currently attached; control writes can swap that set to mimic a
//! device resetting into another mode.

use crate::transport::{DeviceInfo, DeviceMode, Transport, UsbBus};
use crate::{RelayError, Result};

use relay_common::UsbRequests;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

pub(crate) const SERIAL: &str = "0123456789abcdef01234567";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    ControlRead { request: u8, value: u16, index: u16 },
    ControlWrite { request: u8, value: u16, index: u16, data: Vec<u8> },
    BulkRead { endpoint: u8 },
    BulkWrite { endpoint: u8, data: Vec<u8> },
}

#[derive(Default)]
struct State {
    answers: HashMap<(u8, u16), VecDeque<rusb::Result<Vec<u8>>>>,
    write_errors: HashMap<(u8, u16), rusb::Error>,
    transitions: HashMap<(u8, u16), Vec<DeviceInfo>>,
    bulk_in: VecDeque<rusb::Result<Vec<u8>>>,
    bulk_out: VecDeque<rusb::Result<usize>>,
    strings: HashMap<u8, String>,
    calls: Vec<Call>,
    present: Option<Rc<RefCell<Vec<DeviceInfo>>>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport(Rc<RefCell<State>>);

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that answers the connect handshake
    pub fn device(hw_type: u8) -> Self {
        Self::with_versions(hw_type, [1, 4, 4])
    }

    pub fn with_versions(hw_type: u8, versions: [u8; 3]) -> Self {
        let t = Self::new();
        t.answer(UsbRequests::HardwareType, 0, &[hw_type]);
        t.answer(UsbRequests::PacketVersions, 0, &versions);
        t
    }

    /// Queue an answer for a control read. The last queued answer repeats.
    pub fn answer(&self, request: impl Into<u8>, value: u16, data: &[u8]) {
        self.answer_with(request, value, Ok(data.to_vec()));
    }

    pub fn answer_with(&self, request: impl Into<u8>, value: u16, answer: rusb::Result<Vec<u8>>) {
        self.0
            .borrow_mut()
            .answers
            .entry((request.into(), value))
            .or_default()
            .push_back(answer);
    }

    pub fn fail_write(&self, request: impl Into<u8>, value: u16, err: rusb::Error) {
        self.0
            .borrow_mut()
            .write_errors
            .insert((request.into(), value), err);
    }

    /// Replace the attached devices when this control write arrives
    pub fn on_write(&self, request: impl Into<u8>, value: u16, devices: Vec<DeviceInfo>) {
        self.0
            .borrow_mut()
            .transitions
            .insert((request.into(), value), devices);
    }

    pub fn push_bulk_in(&self, answer: rusb::Result<Vec<u8>>) {
        self.0.borrow_mut().bulk_in.push_back(answer);
    }

    /// Bulk writes accept everything unless scripted otherwise
    pub fn push_bulk_out(&self, answer: rusb::Result<usize>) {
        self.0.borrow_mut().bulk_out.push_back(answer);
    }

    pub fn set_string(&self, index: u8, value: &str) {
        self.0.borrow_mut().strings.insert(index, value.to_owned());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.borrow().calls.clone()
    }

    pub fn writes(&self, request: impl Into<u8>) -> Vec<u16> {
        let request = request.into();
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ControlWrite { request: r, value, .. } if r == request => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn bulk_writes(&self, endpoint: u8) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::BulkWrite { endpoint: e, data } if e == endpoint => Some(data),
                _ => None,
            })
            .collect()
    }

    fn next_answer(&self, request: u8, value: u16) -> rusb::Result<Vec<u8>> {
        let mut state = self.0.borrow_mut();
        match state.answers.get_mut(&(request, value)) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Err(rusb::Error::Pipe)),
            Some(queue) => queue.front().cloned().unwrap_or(Err(rusb::Error::Pipe)),
            // unsupported requests stall
            None => Err(rusb::Error::Pipe),
        }
    }
}

impl Transport for MockTransport {
    fn read_control(
        &self,
        _request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.0.borrow_mut().calls.push(Call::ControlRead {
            request,
            value,
            index,
        });
        let data = self.next_answer(request, value)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn write_control(
        &self,
        _request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::ControlWrite {
            request,
            value,
            index,
            data: buf.to_vec(),
        });
        if let Some(devices) = state.transitions.get(&(request, value)).cloned() {
            if let Some(present) = &state.present {
                *present.borrow_mut() = devices;
            }
        }
        match state.write_errors.get(&(request, value)) {
            Some(err) => Err(*err),
            None => Ok(buf.len()),
        }
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::BulkRead { endpoint });
        let data = state.bulk_in.pop_front().unwrap_or(Err(rusb::Error::Timeout))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.0.borrow_mut();
        let answer = state.bulk_out.pop_front().unwrap_or(Ok(buf.len()));
        let written = match answer {
            Ok(n) => n.min(buf.len()),
            Err(e) => {
                state.calls.push(Call::BulkWrite {
                    endpoint,
                    data: Vec::new(),
                });
                return Err(e);
            }
        };
        state.calls.push(Call::BulkWrite {
            endpoint,
            data: buf[..written].to_vec(),
        });
        Ok(written)
    }

    fn read_string_descriptor(&self, index: u8) -> rusb::Result<String> {
        self.0
            .borrow()
            .strings
            .get(&index)
            .cloned()
            .ok_or(rusb::Error::Pipe)
    }
}

#[derive(Clone)]
pub(crate) struct MockBus {
    present: Rc<RefCell<Vec<DeviceInfo>>>,
    /// scans that come back empty before the attached devices show up
    hidden_scans: Rc<RefCell<usize>>,
    pub device: MockTransport,
    pub dfu: MockTransport,
    opened: Rc<RefCell<Vec<(DeviceMode, bool)>>>,
}

impl MockBus {
    pub fn new(devices: Vec<DeviceInfo>, device: MockTransport, dfu: MockTransport) -> Self {
        let present = Rc::new(RefCell::new(devices));
        device.0.borrow_mut().present = Some(present.clone());
        dfu.0.borrow_mut().present = Some(present.clone());
        Self {
            present,
            hidden_scans: Rc::new(RefCell::new(0)),
            device,
            dfu,
            opened: Rc::default(),
        }
    }

    pub fn with_app(device: MockTransport) -> Self {
        Self::new(vec![app_device(SERIAL)], device, MockTransport::new())
    }

    pub fn hide_for(&self, scans: usize) {
        *self.hidden_scans.borrow_mut() = scans;
    }

    pub fn set_present(&self, devices: Vec<DeviceInfo>) {
        *self.present.borrow_mut() = devices;
    }

    pub fn opened(&self) -> Vec<(DeviceMode, bool)> {
        self.opened.borrow().clone()
    }
}

impl UsbBus for MockBus {
    type Handle = MockTransport;

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut hidden = self.hidden_scans.borrow_mut();
        if *hidden > 0 {
            *hidden -= 1;
            return Ok(Vec::new());
        }
        Ok(self.present.borrow().clone())
    }

    fn open(&self, device: &DeviceInfo, claim: bool) -> Result<MockTransport> {
        if !self.present.borrow().contains(device) {
            return Err(RelayError::NoDeviceError);
        }
        self.opened.borrow_mut().push((device.mode, claim));
        Ok(match device.mode {
            DeviceMode::Dfu => self.dfu.clone(),
            _ => self.device.clone(),
        })
    }
}

fn device_info(mode: DeviceMode, serial: &str, bcd_device: u16, address: u8) -> DeviceInfo {
    DeviceInfo {
        mode,
        serial: Some(serial.to_owned()),
        bcd_device,
        bus_number: 1,
        address,
    }
}

pub(crate) fn app_device(serial: &str) -> DeviceInfo {
    device_info(DeviceMode::Application, serial, 0x2300, 4)
}

pub(crate) fn bootstub_device(serial: &str, bcd_device: u16) -> DeviceInfo {
    device_info(DeviceMode::Bootstub, serial, bcd_device, 5)
}

pub(crate) fn dfu_device(serial: &str) -> DeviceInfo {
    device_info(DeviceMode::Dfu, serial, 0x2200, 6)
}
