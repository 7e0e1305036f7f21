//! Device-side control request dispatcher
//!
//! Every SETUP packet the device-role hardware receives lands here. Standard
//! (Chapter 9) requests are answered from the descriptor store and the
//! interface registry. Class and vendor requests are routed to the interface
//! handler owning the addressed interface, with a bounded asynchronous
//! response protocol: a handler may defer its answer, in which case it is
//! re-polled every [`crate::UsbCore::task`] tick until it completes or the
//! control timeout expires and the request is answered with a STALL.
//!
//! At most one class/vendor request is in flight at any time; EP0 setup
//! packets are processed strictly in arrival order.

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

use crate::debug;
use crate::descriptor::{TYPE_CONFIGURATION, TYPE_DEVICE, TYPE_HID_REPORT, TYPE_STRING};
use crate::event::{self, ControlResponse, InterfaceHandler, UsbEvent};
use crate::hal::{Duration, Instant, UsbHardware};
use crate::types::{SetupPacket, UsbError};
use crate::UsbCore;

/// Capacity of the EP0 data stage buffer
pub const CONTROL_BUFFER_CAPACITY: usize = 512;

/// Default deadline for asynchronous control responses
const CONTROL_TIMEOUT_MILLIS: u64 = 1000;

/// A class/vendor request waiting for its handler's response
#[derive(Clone, Copy)]
struct PendingControl {
    setup: SetupPacket,
    interface: u8,
    deadline: Instant,
}

/// Device-side state owned by [`crate::UsbCore`]
pub(crate) struct DeviceState {
    /// Value stored by the last `SET_CONFIGURATION`
    pub(crate) configuration: u8,
    /// Whether an upstream host is currently driving the port
    pub(crate) host_connected: bool,
    pending: Option<PendingControl>,
    pub(crate) control_timeout: Duration,
    ctrl_buf: [u8; CONTROL_BUFFER_CAPACITY],
}

impl DeviceState {
    pub(crate) fn new() -> Self {
        Self {
            configuration: 0,
            host_connected: false,
            pending: None,
            control_timeout: Duration::millis(CONTROL_TIMEOUT_MILLIS),
            ctrl_buf: [0; CONTROL_BUFFER_CAPACITY],
        }
    }

    pub(crate) fn reset(&mut self) {
        self.configuration = 0;
        self.host_connected = false;
        self.pending = None;
    }
}

impl<B: UsbHardware> UsbCore<B> {
    /// Send an IN data stage (truncated to the host's `wLength`), then
    /// complete the zero-length OUT status stage.
    fn ep0_send(hw: &mut B, data: &[u8], requested: u16) -> Result<(), UsbError> {
        let n = data.len().min(requested as usize);
        hw.device_send_ep0(&data[..n])?;
        hw.device_recv_ep0(&mut [])?;
        Ok(())
    }

    /// Complete a no-data or OUT request with a zero-length IN status packet.
    fn ep0_status(hw: &mut B) -> Result<(), UsbError> {
        hw.device_send_ep0(&[])?;
        Ok(())
    }

    fn ep0_stall(hw: &mut B) {
        // best effort; if even the stall fails there is nothing left to do
        let _ = hw.device_endpoint_stall(0, true);
    }

    /// Refuse the current request on the wire and report why.
    fn reject(&mut self, error: UsbError) -> Result<(), UsbError> {
        Self::ep0_stall(&mut self.hw);
        Err(error)
    }

    /// Entry point for every SETUP packet received in device role.
    pub(crate) fn device_on_setup(
        &mut self,
        setup: SetupPacket,
        handlers: &mut [&mut dyn InterfaceHandler],
    ) -> Result<(), UsbError> {
        if self.device.pending.take().is_some() {
            // the host moved on; the previous request is dead
            debug::warn!("setup received while a control request was pending");
        }
        debug::trace!(
            "setup: request_type={:#x} request={:#x} value={:#x} index={} length={}",
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );
        match setup.request_kind() {
            RequestType::Standard => self.standard_request(&setup),
            RequestType::Class | RequestType::Vendor => self.class_request(setup, handlers),
            RequestType::Reserved => self.reject(UsbError::InvalidParam),
        }
    }

    fn standard_request(&mut self, setup: &SetupPacket) -> Result<(), UsbError> {
        match setup.request {
            Request::GET_DESCRIPTOR => self.get_descriptor(setup),
            // the hardware latches the new address itself
            Request::SET_ADDRESS => Self::ep0_status(&mut self.hw),
            Request::SET_CONFIGURATION => {
                let value = setup.value as u8;
                self.device.configuration = value;
                debug::info!("configuration set to {}", value);
                if let Some(callback) = self.configuration_callback {
                    callback(value);
                }
                Self::ep0_status(&mut self.hw)
            }
            Request::SET_INTERFACE => {
                let interface = setup.index as u8;
                let alternate = setup.value as u8;
                let Some(entry) = self.registry.find_mut(interface) else {
                    return self.reject(UsbError::NotFound);
                };
                entry.descriptor.alternate_setting = alternate;
                if let Some(callback) = self.interface_callback {
                    callback(interface, alternate);
                }
                Self::ep0_status(&mut self.hw)
            }
            Request::GET_CONFIGURATION => {
                let configuration = [self.device.configuration];
                Self::ep0_send(&mut self.hw, &configuration, setup.length)
            }
            Request::GET_INTERFACE => {
                let interface = setup.index as u8;
                let Some(entry) = self.registry.get_interface(interface) else {
                    return self.reject(UsbError::NotFound);
                };
                let alternate = [entry.descriptor.alternate_setting];
                Self::ep0_send(&mut self.hw, &alternate, setup.length)
            }
            // self-powered and remote-wakeup status are not modelled
            Request::GET_STATUS => Self::ep0_send(&mut self.hw, &[0, 0], setup.length),
            Request::CLEAR_FEATURE | Request::SET_FEATURE => Self::ep0_status(&mut self.hw),
            _ => self.reject(UsbError::InvalidParam),
        }
    }

    fn get_descriptor(&mut self, setup: &SetupPacket) -> Result<(), UsbError> {
        let descriptor_type = (setup.value >> 8) as u8;
        let index = (setup.value & 0xFF) as u8;
        match descriptor_type {
            TYPE_DEVICE => {
                if self.store.device.is_empty() {
                    return self.reject(UsbError::NotReady);
                }
                Self::ep0_send(&mut self.hw, &self.store.device, setup.length)
            }
            TYPE_CONFIGURATION => {
                // assembled fresh from the registry, so descriptor and
                // registry state can never disagree
                let configuration = match self.registry.assemble_configuration() {
                    Ok(bytes) => bytes,
                    Err(error) => return self.reject(error),
                };
                Self::ep0_send(&mut self.hw, &configuration, setup.length)
            }
            TYPE_STRING => match self.store.string(index) {
                Some(bytes) => Self::ep0_send(&mut self.hw, bytes, setup.length),
                None => self.reject(UsbError::NotFound),
            },
            TYPE_HID_REPORT => {
                let interface = setup.index as u8;
                match self
                    .registry
                    .get_interface(interface)
                    .and_then(|entry| entry.report_descriptor())
                {
                    Some(bytes) => Self::ep0_send(&mut self.hw, bytes, setup.length),
                    None => self.reject(UsbError::NotFound),
                }
            }
            _ => self.reject(UsbError::InvalidParam),
        }
    }

    fn class_request(
        &mut self,
        setup: SetupPacket,
        handlers: &mut [&mut dyn InterfaceHandler],
    ) -> Result<(), UsbError> {
        let interface = if matches!(setup.recipient(), Recipient::Interface) {
            (setup.index & 0xFF) as u8
        } else {
            0
        };
        if self.registry.get_interface(interface).is_none() {
            debug::info!("class request for unknown interface {}", interface);
            return self.reject(UsbError::NotFound);
        }

        // OUT data stage arrives before the handler sees the request
        let mut out_len = 0usize;
        if matches!(setup.direction(), UsbDirection::Out) && setup.length > 0 {
            if setup.length as usize > CONTROL_BUFFER_CAPACITY {
                return self.reject(UsbError::BufferOverflow);
            }
            out_len = match self
                .hw
                .device_recv_ep0(&mut self.device.ctrl_buf[..setup.length as usize])
            {
                Ok(n) => n,
                Err(error) => return self.reject(error.into()),
            };
        }

        let verdict;
        let response_len;
        if matches!(setup.direction(), UsbDirection::In) {
            let mut response = ControlResponse::new(&mut self.device.ctrl_buf);
            verdict = event::notify_with_response(handlers, interface, &setup, &[], &mut response);
            response_len = response.len();
        } else {
            let mut empty: [u8; 0] = [];
            let mut response = ControlResponse::new(&mut empty);
            verdict = event::notify_with_response(
                handlers,
                interface,
                &setup,
                &self.device.ctrl_buf[..out_len],
                &mut response,
            );
            response_len = 0;
        }

        match verdict {
            None => self.reject(UsbError::NotFound),
            Some(true) => self.finish_control(&setup, response_len),
            Some(false) => {
                self.device.pending = Some(PendingControl {
                    setup,
                    interface,
                    deadline: self.hw.now() + self.device.control_timeout,
                });
                self.events.push(UsbEvent::ControlRequest { setup });
                Ok(())
            }
        }
    }

    /// Complete the data and status stages once a response is available.
    fn finish_control(&mut self, setup: &SetupPacket, response_len: usize) -> Result<(), UsbError> {
        if matches!(setup.direction(), UsbDirection::In) && setup.length > 0 {
            let n = response_len.min(setup.length as usize);
            match self.hw.device_send_ep0(&self.device.ctrl_buf[..n]) {
                Ok(_) => {
                    self.hw.device_recv_ep0(&mut [])?;
                    Ok(())
                }
                Err(error) => self.reject(error.into()),
            }
        } else {
            Self::ep0_status(&mut self.hw)
        }
    }

    /// Drive the asynchronous response protocol.
    ///
    /// Called every task tick: re-polls the owning handler, and converts an
    /// expired deadline into a STALL so the upstream host is not left waiting.
    pub(crate) fn device_poll(
        &mut self,
        handlers: &mut [&mut dyn InterfaceHandler],
    ) -> Result<(), UsbError> {
        let Some(pending) = self.device.pending else {
            return Ok(());
        };
        let (ready, response_len) = {
            let mut response = ControlResponse::new(&mut self.device.ctrl_buf);
            let ready = handlers
                .iter_mut()
                .find(|handler| handler.interface() == pending.interface)
                .map(|handler| handler.poll_response(&pending.setup, &mut response))
                .unwrap_or(false);
            (ready, response.len())
        };
        if ready {
            self.device.pending = None;
            self.finish_control(&pending.setup, response_len)
        } else if self.hw.now() >= pending.deadline {
            self.device.pending = None;
            debug::warn!(
                "control request {:#x} timed out, stalling",
                pending.setup.request
            );
            Self::ep0_stall(&mut self.hw);
            Err(UsbError::TransferTimeout)
        } else {
            Ok(())
        }
    }

    /// Read a device-role OUT endpoint and hand the payload to the owning
    /// interface handler.
    pub(crate) fn device_endpoint_data(
        &mut self,
        endpoint: u8,
        handlers: &mut [&mut dyn InterfaceHandler],
    ) {
        let mut buffer = [0u8; 64];
        let n = match self.hw.device_interrupt_out(endpoint, &mut buffer) {
            Ok(0) => return,
            Ok(n) => n,
            Err(error) => {
                debug::trace!("endpoint {:#x} read failed ({:?})", endpoint, error);
                return;
            }
        };
        let Some(interface) = self.registry.interface_for_endpoint(endpoint) else {
            debug::info!("data on unrouted endpoint {:#x}", endpoint);
            return;
        };
        event::notify(
            handlers,
            interface,
            &UsbEvent::EndpointData { endpoint },
            &buffer[..n],
        );
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::hid::HidDevice;
    use crate::mocks::{HwCall, ScriptedHw};
    use crate::registry::HandlerKind;
    use crate::UsbCore;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::vec;
    use std::vec::Vec;

    const DEVICE: [u8; 18] = [
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x5E, 0x04, 0x8E, 0x02, 0x00, 0x01, 0x01,
        0x02, 0x03, 0x01,
    ];

    const LANGUAGE_IDS: [u8; 4] = [4, 3, 0x09, 0x04];

    const CONFIG: [u8; 34] = [
        9, 2, 34, 0, 1, 1, 0, 0x80, 50, // configuration
        9, 4, 0, 0, 1, 3, 1, 1, 0, // interface
        9, 0x21, 0x11, 0x01, 0, 1, 0x22, 0, 0, // hid
        7, 5, 0x81, 3, 8, 0, 10, // endpoint
    ];

    fn keyboard_core() -> UsbCore<ScriptedHw> {
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();
        core.update_device_descriptors(&DEVICE, &CONFIG, &[&LANGUAGE_IDS], None)
            .unwrap();
        core.add_interface(0, 3, 1, 1, HandlerKind::Hid).unwrap();
        core.configure_endpoint(0, 0x81, 3, 8, 10).unwrap();
        core.register_control_handler(0).unwrap();
        core.hw_mut().calls.clear();
        core
    }

    fn standard_in(request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
        SetupPacket::new(
            UsbDirection::In,
            RequestType::Standard,
            Recipient::Device,
            request,
            value,
            index,
            length,
        )
    }

    fn run_setup(core: &mut UsbCore<ScriptedHw>, setup: SetupPacket) {
        run_setup_with(core, setup, &mut []);
    }

    fn run_setup_with(
        core: &mut UsbCore<ScriptedHw>,
        setup: SetupPacket,
        handlers: &mut [&mut dyn InterfaceHandler],
    ) {
        core.hw_mut()
            .push_event(crate::hal::RawEvent::SetupReceived(setup));
        core.task(&mut [], handlers).unwrap();
    }

    #[test]
    fn test_get_device_descriptor() {
        let mut core = keyboard_core();
        run_setup(
            &mut core,
            standard_in(Request::GET_DESCRIPTOR, (TYPE_DEVICE as u16) << 8, 0, 18),
        );
        assert_eq!(core.hw().ep0_sends(), vec![DEVICE.to_vec()]);
        // zero-length OUT status follows the data stage
        assert!(core
            .hw()
            .calls
            .iter()
            .any(|call| matches!(call, HwCall::DeviceRecvEp0 { length: 0 })));
    }

    #[test]
    fn test_get_device_descriptor_truncated_to_wlength() {
        let mut core = keyboard_core();
        run_setup(
            &mut core,
            standard_in(Request::GET_DESCRIPTOR, (TYPE_DEVICE as u16) << 8, 0, 8),
        );
        assert_eq!(core.hw().ep0_sends(), vec![DEVICE[..8].to_vec()]);
    }

    #[test]
    fn test_get_configuration_descriptor_is_assembled() {
        let mut core = keyboard_core();
        run_setup(
            &mut core,
            standard_in(
                Request::GET_DESCRIPTOR,
                (TYPE_CONFIGURATION as u16) << 8,
                0,
                512,
            ),
        );
        let sends = core.hw().ep0_sends();
        assert_eq!(sends.len(), 1);
        let tree = &sends[0];
        // one interface with a HID descriptor and one endpoint
        assert_eq!(tree.len(), 9 + 9 + 9 + 7);
        assert_eq!(tree[4], 1);
        let header = crate::descriptor::parse_configuration_header(tree).unwrap();
        assert_eq!(header.total_length as usize, tree.len());
    }

    #[test]
    fn test_get_string_descriptor() {
        let mut core = keyboard_core();
        run_setup(
            &mut core,
            standard_in(Request::GET_DESCRIPTOR, ((TYPE_STRING as u16) << 8) | 0, 0, 255),
        );
        assert_eq!(core.hw().ep0_sends(), vec![LANGUAGE_IDS.to_vec()]);

        // absent index answers with a STALL
        run_setup(
            &mut core,
            standard_in(Request::GET_DESCRIPTOR, ((TYPE_STRING as u16) << 8) | 5, 0, 255),
        );
        assert_eq!(core.hw().ep0_stall_count(), 1);
    }

    #[test]
    fn test_get_hid_report_descriptor() {
        let mut core = keyboard_core();
        core.update_hid_report_descriptor(0, crate::hid::BOOT_KEYBOARD_REPORT_DESCRIPTOR)
            .unwrap();
        core.hw_mut().calls.clear();

        let mut setup = standard_in(
            Request::GET_DESCRIPTOR,
            (TYPE_HID_REPORT as u16) << 8,
            0,
            512,
        );
        setup.request_type = 0x81; // recipient interface
        run_setup(&mut core, setup);
        assert_eq!(
            core.hw().ep0_sends(),
            vec![crate::hid::BOOT_KEYBOARD_REPORT_DESCRIPTOR.to_vec()]
        );
    }

    #[test]
    fn test_set_and_get_configuration() {
        static LAST_CONFIG: AtomicU8 = AtomicU8::new(0xFF);
        fn record(value: u8) {
            LAST_CONFIG.store(value, Ordering::SeqCst);
        }

        let mut core = keyboard_core();
        core.set_configuration_callback(record);

        let set = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SET_CONFIGURATION,
            1,
            0,
            0,
        );
        run_setup(&mut core, set);
        assert_eq!(core.configuration(), 1);
        assert_eq!(LAST_CONFIG.load(Ordering::SeqCst), 1);
        // zero-length IN status
        assert_eq!(core.hw().ep0_sends(), vec![Vec::new()]);

        run_setup(&mut core, standard_in(Request::GET_CONFIGURATION, 0, 0, 1));
        assert_eq!(core.hw().ep0_sends(), vec![Vec::new(), vec![1]]);
    }

    #[test]
    fn test_set_and_get_interface() {
        let mut core = keyboard_core();
        let set = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Standard,
            Recipient::Interface,
            Request::SET_INTERFACE,
            2,
            0,
            0,
        );
        run_setup(&mut core, set);

        let mut get = standard_in(Request::GET_INTERFACE, 0, 0, 1);
        get.request_type = 0x81;
        run_setup(&mut core, get);
        assert_eq!(core.hw().ep0_sends(), vec![Vec::new(), vec![2]]);

        // unknown interface stalls
        let mut bad = standard_in(Request::GET_INTERFACE, 0, 5, 1);
        bad.request_type = 0x81;
        run_setup(&mut core, bad);
        assert_eq!(core.hw().ep0_stall_count(), 1);
    }

    #[test]
    fn test_get_status_and_features() {
        let mut core = keyboard_core();
        run_setup(&mut core, standard_in(Request::GET_STATUS, 0, 0, 2));
        assert_eq!(core.hw().ep0_sends(), vec![vec![0, 0]]);

        let clear = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::CLEAR_FEATURE,
            1,
            0,
            0,
        );
        run_setup(&mut core, clear);
        assert_eq!(core.hw().ep0_sends(), vec![vec![0, 0], Vec::new()]);
    }

    #[test]
    fn test_unknown_standard_request_stalls() {
        let mut core = keyboard_core();
        run_setup(&mut core, standard_in(0x42, 0, 0, 0));
        assert_eq!(core.hw().ep0_stall_count(), 1);
    }

    #[test]
    fn test_class_request_unknown_interface_stalls() {
        let mut core = keyboard_core();
        let setup = SetupPacket::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Interface,
            0x01,
            0x0100,
            7, // no such interface
            8,
        );
        let mut device = HidDevice::keyboard(0, 0x81);
        let mut handlers: [&mut dyn InterfaceHandler; 1] = [&mut device];
        run_setup_with(&mut core, setup, &mut handlers);
        assert_eq!(core.hw().ep0_stall_count(), 1);
        assert!(core.hw().ep0_sends().is_empty());
    }

    #[test]
    fn test_synchronous_class_request() {
        let mut core = keyboard_core();
        let get_report = SetupPacket::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Interface,
            0x01,
            0x0100,
            0,
            8,
        );
        let mut device = HidDevice::keyboard(0, 0x81);
        let mut handlers: [&mut dyn InterfaceHandler; 1] = [&mut device];
        run_setup_with(&mut core, get_report, &mut handlers);
        assert_eq!(core.hw().ep0_sends(), vec![vec![0u8; 8]]);
        assert_eq!(core.hw().ep0_stall_count(), 0);
    }

    struct NeverReady;

    impl InterfaceHandler for NeverReady {
        fn interface(&self) -> u8 {
            0
        }
        fn control_request(
            &mut self,
            _setup: &SetupPacket,
            _data: &[u8],
            _response: &mut ControlResponse<'_>,
        ) -> bool {
            false
        }
    }

    #[test]
    fn test_async_request_times_out_with_stall() {
        let mut core = keyboard_core();
        let setup = SetupPacket::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Interface,
            0x20,
            0,
            0,
            4,
        );
        let mut handler = NeverReady;
        let mut handlers: [&mut dyn InterfaceHandler; 1] = [&mut handler];
        run_setup_with(&mut core, setup, &mut handlers);
        // pending, nothing sent, nothing stalled yet
        assert!(core.hw().ep0_sends().is_empty());
        assert_eq!(core.hw().ep0_stall_count(), 0);

        core.hw_mut().advance_ms(500);
        core.task(&mut [], &mut handlers).unwrap();
        assert_eq!(core.hw().ep0_stall_count(), 0);

        core.hw_mut().advance_ms(600);
        core.task(&mut [], &mut handlers).unwrap();
        assert_eq!(core.hw().ep0_stall_count(), 1);

        // the dispatcher accepts the next request normally
        run_setup_with(
            &mut core,
            standard_in(Request::GET_STATUS, 0, 0, 2),
            &mut handlers,
        );
        assert_eq!(core.hw().ep0_sends(), vec![vec![0, 0]]);
    }

    struct ReadyOnPoll {
        polls_left: u8,
    }

    impl InterfaceHandler for ReadyOnPoll {
        fn interface(&self) -> u8 {
            0
        }
        fn control_request(
            &mut self,
            _setup: &SetupPacket,
            _data: &[u8],
            _response: &mut ControlResponse<'_>,
        ) -> bool {
            false
        }
        fn poll_response(
            &mut self,
            _setup: &SetupPacket,
            response: &mut ControlResponse<'_>,
        ) -> bool {
            if self.polls_left > 0 {
                self.polls_left -= 1;
                return false;
            }
            response.write(&[0xAA, 0xBB]).unwrap();
            true
        }
    }

    #[test]
    fn test_async_request_completes_on_poll() {
        let mut core = keyboard_core();
        let setup = SetupPacket::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Interface,
            0x20,
            0,
            0,
            2,
        );
        let mut handler = ReadyOnPoll { polls_left: 2 };
        let mut handlers: [&mut dyn InterfaceHandler; 1] = [&mut handler];
        run_setup_with(&mut core, setup, &mut handlers);
        assert!(core.hw().ep0_sends().is_empty());

        for _ in 0..3 {
            core.hw_mut().advance_ms(10);
            core.task(&mut [], &mut handlers).unwrap();
        }
        assert_eq!(core.hw().ep0_sends(), vec![vec![0xAA, 0xBB]]);
        assert_eq!(core.hw().ep0_stall_count(), 0);
    }
}
