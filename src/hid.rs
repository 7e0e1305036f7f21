//! HID class support for both roles
//!
//! [`HidHost`] is a [`HostClassDriver`] for HID devices attached to the host
//! port: it negotiates idle rate and report protocol, fetches the report
//! descriptor, and turns boot-protocol interrupt payloads into typed
//! [`HidEvent`]s. [`HidDevice`] is an [`InterfaceHandler`] serving a HID
//! interface in device role: it answers the class requests, keeps the current
//! input report snapshot, and accepts output reports (keyboard LED state)
//! from the upstream host.
//!
//! Together they form the two ends of a HID bridge: reports flow host → up,
//! LED state flows back down via [`HidHost::set_keyboard_leds`] or
//! [`crate::UsbCore::forward_class_control`].

use arrayvec::ArrayVec;
use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

use crate::debug;
use crate::descriptor::TYPE_HID_REPORT;
use crate::event::{ControlResponse, InterfaceHandler};
use crate::hal::{DataStage, UsbHardware};
use crate::host::{AttachedDevice, HostClassDriver};
use crate::types::{SetupPacket, UsbError};

const GET_REPORT: u8 = 0x01;
const GET_IDLE: u8 = 0x02;
const GET_PROTOCOL: u8 = 0x03;
const SET_REPORT: u8 = 0x09;
const SET_IDLE: u8 = 0x0A;
const SET_PROTOCOL: u8 = 0x0B;

/// Boot interface protocol numbers (bInterfaceProtocol)
pub const BOOT_PROTOCOL_KEYBOARD: u8 = 1;
pub const BOOT_PROTOCOL_MOUSE: u8 = 2;

const REPORT_DESCRIPTOR_CAPACITY: usize = 256;

#[repr(u8)]
enum ReportType {
    Input = 0x01,
    Output = 0x02,
}

/// A boot-protocol mouse report
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MouseReport {
    pub buttons: u8,
    pub dx: i8,
    pub dy: i8,
    pub wheel: i8,
}

/// A boot-protocol keyboard report
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyboardReport {
    pub modifier: u8,
    pub keys: [u8; 6],
}

/// Events produced by [`HidHost`], consumed via [`HidHost::take_event`]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HidEvent {
    /// A HID device was bound to this driver
    Attached,
    /// The bound device went away
    Removed,
    Mouse(MouseReport),
    Keyboard(KeyboardReport),
}

#[derive(Clone, Copy)]
struct BoundHidDevice {
    interface: u8,
    protocol: u8,
    endpoint: u8,
    endpoint_out: Option<u8>,
}

/// Host-side HID class driver
///
/// Register with `register_host_class_handler(3, 0, 0)` to take any HID
/// device, or with a specific boot triple to be choosier.
pub struct HidHost {
    bound: Option<BoundHidDevice>,
    event: Option<HidEvent>,
    report_descriptor: ArrayVec<u8, REPORT_DESCRIPTOR_CAPACITY>,
}

impl Default for HidHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HidHost {
    pub fn new() -> Self {
        Self {
            bound: None,
            event: None,
            report_descriptor: ArrayVec::new(),
        }
    }

    /// Consume the most recent event, leaving none behind.
    ///
    /// Poll this from the application loop after every `task()` tick.
    pub fn take_event(&mut self) -> Option<HidEvent> {
        self.event.take()
    }

    /// The report descriptor fetched from the bound device (may be truncated
    /// to the local capacity)
    pub fn report_descriptor(&self) -> &[u8] {
        &self.report_descriptor
    }

    /// Interface number of the bound device, if any
    pub fn bound_interface(&self) -> Option<u8> {
        self.bound.as_ref().map(|bound| bound.interface)
    }

    /// Push keyboard LED state to the bound device.
    ///
    /// Sends `SET_REPORT(output, report id 0)` with one byte on the bound
    /// interface.
    pub fn set_keyboard_leds<B: UsbHardware>(
        &mut self,
        hw: &mut B,
        leds: u8,
    ) -> Result<(), UsbError> {
        let bound = self.bound.as_ref().ok_or(UsbError::NotReady)?;
        let setup = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            SET_REPORT,
            (ReportType::Output as u16) << 8,
            bound.interface as u16,
            1,
        );
        hw.host_control(&setup, DataStage::Out(&[leds]))?;
        Ok(())
    }

    /// Write a report to the bound device's interrupt OUT endpoint.
    ///
    /// Fails with `NotFound` when the device has no interrupt OUT endpoint
    /// (most boot keyboards take output reports over the control pipe
    /// instead, see [`set_keyboard_leds`](Self::set_keyboard_leds)).
    pub fn send_output_report<B: UsbHardware>(
        &mut self,
        hw: &mut B,
        data: &[u8],
    ) -> Result<usize, UsbError> {
        let bound = self.bound.as_ref().ok_or(UsbError::NotReady)?;
        let endpoint = bound.endpoint_out.ok_or(UsbError::NotFound)?;
        Ok(hw.host_interrupt_out(endpoint, data)?)
    }

    fn parse_report(&mut self, data: &[u8]) {
        let Some(bound) = self.bound.as_ref() else {
            return;
        };
        match bound.protocol {
            BOOT_PROTOCOL_MOUSE if data.len() >= 3 => {
                self.event = Some(HidEvent::Mouse(MouseReport {
                    buttons: data[0],
                    dx: data[1] as i8,
                    dy: data[2] as i8,
                    wheel: data.get(3).copied().unwrap_or(0) as i8,
                }));
            }
            BOOT_PROTOCOL_KEYBOARD if data.len() >= 8 => {
                let mut keys = [0u8; 6];
                keys.copy_from_slice(&data[2..8]);
                self.event = Some(HidEvent::Keyboard(KeyboardReport {
                    modifier: data[0],
                    keys,
                }));
            }
            _ => {
                debug::trace!("unparsed report of {} bytes", data.len());
            }
        }
    }
}

impl<B: UsbHardware> HostClassDriver<B> for HidHost {
    fn matches(&self, class: u8, _subclass: u8, _protocol: u8) -> bool {
        class == 3
    }

    fn attached(&mut self, device: &AttachedDevice, hw: &mut B) {
        let interface = device.hid_interface.unwrap_or(0);
        let bound = BoundHidDevice {
            interface,
            protocol: device.handler_protocol,
            endpoint: device.interrupt_in.unwrap_or(0),
            endpoint_out: device.interrupt_out,
        };

        // Idle and protocol negotiation is best-effort; plenty of devices
        // refuse one or the other.
        let set_idle = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            SET_IDLE,
            0,
            interface as u16,
            0,
        );
        if let Err(error) = hw.host_control(&set_idle, DataStage::None) {
            debug::trace!("SET_IDLE refused ({:?})", error);
        }
        let set_protocol = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            SET_PROTOCOL,
            1, // report protocol
            interface as u16,
            0,
        );
        if let Err(error) = hw.host_control(&set_protocol, DataStage::None) {
            debug::trace!("SET_PROTOCOL refused ({:?})", error);
        }

        let get_report_descriptor = SetupPacket::new(
            UsbDirection::In,
            RequestType::Standard,
            Recipient::Interface,
            usb_device::control::Request::GET_DESCRIPTOR,
            (TYPE_HID_REPORT as u16) << 8,
            interface as u16,
            REPORT_DESCRIPTOR_CAPACITY as u16,
        );
        let mut buffer = [0u8; REPORT_DESCRIPTOR_CAPACITY];
        self.report_descriptor.clear();
        match hw.host_control(&get_report_descriptor, DataStage::In(&mut buffer)) {
            Ok(n) => {
                let _ = self.report_descriptor.try_extend_from_slice(&buffer[..n]);
                debug::info!("fetched {} byte report descriptor", n);
            }
            Err(error) => {
                debug::warn!("report descriptor fetch failed ({:?})", error);
            }
        }

        self.bound = Some(bound);
        self.event = Some(HidEvent::Attached);
    }

    fn detached(&mut self, _device: &AttachedDevice) {
        if self.bound.take().is_some() {
            self.event = Some(HidEvent::Removed);
            self.report_descriptor.clear();
        }
    }

    fn control(&mut self, setup: &SetupPacket, data: &[u8], hw: &mut B) -> bool {
        let Some(bound) = self.bound.as_ref() else {
            return false;
        };
        // forwarded output reports (LED state from the device role)
        if setup.request == SET_REPORT && matches!(setup.request_kind(), RequestType::Class) {
            let forwarded = SetupPacket::new(
                UsbDirection::Out,
                RequestType::Class,
                Recipient::Interface,
                SET_REPORT,
                setup.value,
                bound.interface as u16,
                data.len() as u16,
            );
            return match hw.host_control(&forwarded, DataStage::Out(data)) {
                Ok(_) => true,
                Err(error) => {
                    debug::warn!("forwarded SET_REPORT failed ({:?})", error);
                    false
                }
            };
        }
        false
    }

    fn data(&mut self, endpoint: u8, data: &[u8]) {
        if self
            .bound
            .as_ref()
            .is_some_and(|bound| bound.endpoint == endpoint)
        {
            self.parse_report(data);
        }
    }
}

/// Device-side HID interface handler
///
/// Owns the per-interface HID state: the current input report snapshot, the
/// idle rate, the protocol selection, and the last output report received
/// from the upstream host.
pub struct HidDevice {
    interface: u8,
    endpoint_in: u8,
    protocol: u8,
    protocol_mode: u8,
    idle_rate: u8,
    input_report: [u8; 8],
    input_len: usize,
    output_report: Option<u8>,
}

impl HidDevice {
    /// A boot-protocol keyboard function (8-byte input reports)
    pub fn keyboard(interface: u8, endpoint_in: u8) -> Self {
        Self::new(interface, endpoint_in, BOOT_PROTOCOL_KEYBOARD, 8)
    }

    /// A boot-protocol mouse function (3-byte input reports)
    pub fn mouse(interface: u8, endpoint_in: u8) -> Self {
        Self::new(interface, endpoint_in, BOOT_PROTOCOL_MOUSE, 3)
    }

    fn new(interface: u8, endpoint_in: u8, protocol: u8, input_len: usize) -> Self {
        Self {
            interface,
            endpoint_in,
            protocol,
            // report protocol until the host negotiates otherwise
            protocol_mode: 1,
            idle_rate: 0,
            input_report: [0; 8],
            input_len,
            output_report: None,
        }
    }

    /// The boot protocol this function implements
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// The interrupt IN endpoint address of this function
    pub fn endpoint_in(&self) -> u8 {
        self.endpoint_in
    }

    /// The last output report received from the host (keyboard LED state),
    /// clearing it.
    pub fn take_output_report(&mut self) -> Option<u8> {
        self.output_report.take()
    }

    /// Send an input report to the upstream host.
    ///
    /// The report also becomes the snapshot served to `GET_REPORT`.
    pub fn send_report<B: UsbHardware>(
        &mut self,
        hw: &mut B,
        data: &[u8],
    ) -> Result<usize, UsbError> {
        let n = data.len().min(self.input_report.len());
        self.input_report[..n].copy_from_slice(&data[..n]);
        self.input_len = n;
        Ok(hw.device_interrupt_in(self.endpoint_in, data)?)
    }

    /// Send a boot mouse report
    pub fn send_mouse_report<B: UsbHardware>(
        &mut self,
        hw: &mut B,
        dx: i8,
        dy: i8,
        buttons: u8,
    ) -> Result<usize, UsbError> {
        let report = [buttons, dx as u8, dy as u8];
        self.send_report(hw, &report)
    }

    /// Send a boot keyboard report
    pub fn send_keyboard_report<B: UsbHardware>(
        &mut self,
        hw: &mut B,
        modifier: u8,
        keys: [u8; 6],
    ) -> Result<usize, UsbError> {
        let mut report = [0u8; 8];
        report[0] = modifier;
        report[2..].copy_from_slice(&keys);
        self.send_report(hw, &report)
    }
}

impl InterfaceHandler for HidDevice {
    fn interface(&self) -> u8 {
        self.interface
    }

    fn control_request(
        &mut self,
        setup: &SetupPacket,
        data: &[u8],
        response: &mut ControlResponse<'_>,
    ) -> bool {
        match setup.request {
            GET_REPORT => {
                // current snapshot; zero-filled if nothing was sent yet
                response.write(&self.input_report[..self.input_len]).is_ok()
            }
            SET_REPORT => {
                if let Some(first) = data.first() {
                    self.output_report = Some(*first);
                }
                true
            }
            SET_IDLE => {
                // report-ID granularity collapses to "all"
                self.idle_rate = (setup.value >> 8) as u8;
                true
            }
            GET_IDLE => response.write(&[self.idle_rate]).is_ok(),
            SET_PROTOCOL => {
                self.protocol_mode = setup.value as u8;
                debug::info!(
                    "interface {} protocol set to {}",
                    self.interface,
                    self.protocol_mode
                );
                true
            }
            GET_PROTOCOL => response.write(&[self.protocol_mode]).is_ok(),
            _ => {
                debug::info!("unhandled HID request {:#x}", setup.request);
                false
            }
        }
    }
}

/// Report descriptor for a boot-protocol mouse (buttons, X, Y)
pub const BOOT_MOUSE_REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xA1, 0x01, // Collection (Application)
    0x09, 0x01, //   Usage (Pointer)
    0xA1, 0x00, //   Collection (Physical)
    0x05, 0x09, //     Usage Page (Button)
    0x19, 0x01, //     Usage Minimum (Button 1)
    0x29, 0x03, //     Usage Maximum (Button 3)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x95, 0x03, //     Report Count (3)
    0x75, 0x01, //     Report Size (1)
    0x81, 0x02, //     Input (Data, Variable, Absolute)
    0x95, 0x01, //     Report Count (1)
    0x75, 0x05, //     Report Size (5)
    0x81, 0x03, //     Input (Constant)
    0x05, 0x01, //     Usage Page (Generic Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x15, 0x81, //     Logical Minimum (-127)
    0x25, 0x7F, //     Logical Maximum (127)
    0x75, 0x08, //     Report Size (8)
    0x95, 0x02, //     Report Count (2)
    0x81, 0x06, //     Input (Data, Variable, Relative)
    0xC0, //   End Collection
    0xC0, // End Collection
];

/// Report descriptor for a boot-protocol keyboard
pub const BOOT_KEYBOARD_REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0xE0, //   Usage Minimum (Keyboard LeftControl)
    0x29, 0xE7, //   Usage Maximum (Keyboard Right GUI)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x03, //   Input (Constant)
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x65, //   Logical Maximum (101)
    0x19, 0x00, //   Usage Minimum (Reserved)
    0x29, 0x65, //   Usage Maximum (Keyboard Application)
    0x81, 0x00, //   Input (Data, Array)
    0xC0, // End Collection
];

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::mocks::ScriptedHw;

    fn get_report_setup(interface: u8, length: u16) -> SetupPacket {
        SetupPacket::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Interface,
            GET_REPORT,
            (ReportType::Input as u16) << 8,
            interface as u16,
            length,
        )
    }

    #[test]
    fn test_get_report_zero_filled_snapshot() {
        let mut device = HidDevice::keyboard(1, 0x82);
        let mut buffer = [0xFFu8; 16];
        let mut response = ControlResponse::new(&mut buffer);
        assert!(device.control_request(&get_report_setup(1, 8), &[], &mut response));
        assert_eq!(response.len(), 8);
        assert_eq!(&buffer[..8], &[0; 8]);
    }

    #[test]
    fn test_set_report_stores_output() {
        let mut device = HidDevice::keyboard(1, 0x82);
        let setup = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            SET_REPORT,
            (ReportType::Output as u16) << 8,
            1,
            1,
        );
        let mut empty: [u8; 0] = [];
        let mut response = ControlResponse::new(&mut empty);
        assert!(device.control_request(&setup, &[0x02], &mut response));
        assert_eq!(device.take_output_report(), Some(0x02));
        assert_eq!(device.take_output_report(), None);
    }

    #[test]
    fn test_idle_and_protocol_roundtrip() {
        let mut device = HidDevice::mouse(0, 0x81);
        let mut empty: [u8; 0] = [];
        let mut response = ControlResponse::new(&mut empty);

        let set_idle = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            SET_IDLE,
            0x7F00,
            0,
            0,
        );
        assert!(device.control_request(&set_idle, &[], &mut response));

        let mut buffer = [0u8; 1];
        let mut response = ControlResponse::new(&mut buffer);
        let get_idle = SetupPacket::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Interface,
            GET_IDLE,
            0,
            0,
            1,
        );
        assert!(device.control_request(&get_idle, &[], &mut response));
        assert_eq!(buffer[0], 0x7F);

        let set_protocol = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            SET_PROTOCOL,
            0,
            0,
            0,
        );
        let mut empty: [u8; 0] = [];
        let mut response = ControlResponse::new(&mut empty);
        assert!(device.control_request(&set_protocol, &[], &mut response));
        let mut buffer = [0xAAu8; 1];
        let mut response = ControlResponse::new(&mut buffer);
        let get_protocol = SetupPacket::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Interface,
            GET_PROTOCOL,
            0,
            0,
            1,
        );
        assert!(device.control_request(&get_protocol, &[], &mut response));
        assert_eq!(buffer[0], 0);
    }

    #[test]
    fn test_snapshot_follows_sent_reports() {
        let mut hw = ScriptedHw::new();
        let mut device = HidDevice::keyboard(1, 0x82);
        device
            .send_keyboard_report(&mut hw, 0x02, [0x04, 0, 0, 0, 0, 0])
            .unwrap();

        let mut buffer = [0u8; 8];
        let mut response = ControlResponse::new(&mut buffer);
        assert!(device.control_request(&get_report_setup(1, 8), &[], &mut response));
        assert_eq!(&buffer[..8], &[0x02, 0, 0x04, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_mouse_report_parsing() {
        let mut host = HidHost::new();
        host.bound = Some(BoundHidDevice {
            interface: 0,
            protocol: BOOT_PROTOCOL_MOUSE,
            endpoint: 0x81,
            endpoint_out: None,
        });
        <HidHost as HostClassDriver<ScriptedHw>>::data(&mut host, 0x81, &[0x01, 0x05, 0xFB, 0x01]);
        assert_eq!(
            host.take_event(),
            Some(HidEvent::Mouse(MouseReport {
                buttons: 1,
                dx: 5,
                dy: -5,
                wheel: 1,
            }))
        );
        // reports for other endpoints are ignored
        <HidHost as HostClassDriver<ScriptedHw>>::data(&mut host, 0x82, &[0x01, 0x05, 0xFB]);
        assert_eq!(host.take_event(), None);
    }

    #[test]
    fn test_keyboard_report_parsing() {
        let mut host = HidHost::new();
        host.bound = Some(BoundHidDevice {
            interface: 1,
            protocol: BOOT_PROTOCOL_KEYBOARD,
            endpoint: 0x82,
            endpoint_out: None,
        });
        <HidHost as HostClassDriver<ScriptedHw>>::data(
            &mut host,
            0x82,
            &[0x02, 0x00, 0x1B, 0, 0, 0, 0, 0],
        );
        assert_eq!(
            host.take_event(),
            Some(HidEvent::Keyboard(KeyboardReport {
                modifier: 0x02,
                keys: [0x1B, 0, 0, 0, 0, 0],
            }))
        );
    }

    #[test]
    fn test_set_keyboard_leds_wire_format() {
        let mut hw = ScriptedHw::new();
        hw.control_script.push_back(Ok(std::vec::Vec::new()));
        let mut host = HidHost::new();
        host.bound = Some(BoundHidDevice {
            interface: 3,
            protocol: BOOT_PROTOCOL_KEYBOARD,
            endpoint: 0x82,
            endpoint_out: None,
        });
        host.set_keyboard_leds(&mut hw, 0x02).unwrap();

        let calls = hw.host_control_calls();
        assert_eq!(calls.len(), 1);
        let (setup, data) = &calls[0];
        assert_eq!(setup.request_type, 0x21);
        assert_eq!(setup.request, 0x09);
        assert_eq!(setup.value, 0x0200);
        assert_eq!(setup.index, 3);
        assert_eq!(setup.length, 1);
        assert_eq!(data.as_slice(), &[0x02]);
    }
}
