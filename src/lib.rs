//! Dual-role USB stack core
//!
//! This crate is the protocol and coordination layer of a dual-role USB
//! stack: one [`UsbCore`] simultaneously drives a downstream device through
//! enumeration (host role) and serves a composite function to an upstream
//! host (device role). Everything hardware-specific lives behind the
//! [`hal::UsbHardware`] trait; everything class-specific lives behind the
//! [`host::HostClassDriver`] and [`event::InterfaceHandler`] traits, of which
//! the [`hid`] module provides the HID implementations.
//!
//! The core is single-threaded and cooperative: the application calls
//! [`UsbCore::task`] from its main loop (or an interrupt bottom half) often
//! enough to satisfy the control timeout budget, customarily once per
//! millisecond. Hardware interrupts never run core code; they only record
//! events which `task` drains through [`hal::UsbHardware::poll_event`].
//!
//! The reference use case is a bidirectional HID bridge: reports from a
//! physical keyboard or mouse on the host port are echoed upstream, and
//! keyboard LED state flows back down.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

mod debug;
pub mod descriptor;
pub mod device;
pub mod event;
pub mod hal;
pub mod hid;
pub mod host;
#[cfg(feature = "std")]
pub mod mocks;
pub mod registry;
pub mod types;

use arrayvec::ArrayVec;

use device::DeviceState;
use event::EventQueue;
use host::HostState;
use registry::{InterfaceRegistry, MAX_STRING_DESCRIPTORS};

pub use event::{ControlResponse, InterfaceHandler, UsbEvent};
pub use hal::{DataStage, HalError, RawEvent, UsbHardware};
pub use host::{AttachedDevice, EnumerationState, HostClassDriver};
pub use registry::HandlerKind;
pub use types::{ConnectionSpeed, SetupPacket, UsbError};

/// Capacity of the stored device descriptor bytes
const DEVICE_DESCRIPTOR_CAPACITY: usize = 64;
/// Capacity of one stored string descriptor
const STRING_DESCRIPTOR_CAPACITY: usize = 64;

/// Descriptor bytes served in device role
pub(crate) struct DescriptorStore {
    pub(crate) device: ArrayVec<u8, DEVICE_DESCRIPTOR_CAPACITY>,
    strings: [Option<ArrayVec<u8, STRING_DESCRIPTOR_CAPACITY>>; MAX_STRING_DESCRIPTORS],
}

impl DescriptorStore {
    fn new() -> Self {
        Self {
            device: ArrayVec::new(),
            strings: Default::default(),
        }
    }

    fn clear(&mut self) {
        self.device.clear();
        self.strings = Default::default();
    }

    pub(crate) fn string(&self, index: u8) -> Option<&[u8]> {
        self.strings
            .get(index as usize)?
            .as_ref()
            .map(|bytes| bytes.as_slice())
    }
}

/// The dual-role USB core
///
/// Owns the hardware, the interface registry, and the state of both roles.
/// All entry points take `&mut self`: one context, one thread of execution.
/// Tests simply create as many cores as they need.
pub struct UsbCore<B> {
    hw: B,
    registry: InterfaceRegistry,
    host: HostState,
    device: DeviceState,
    events: EventQueue,
    store: DescriptorStore,
    initialized: bool,
    configuration_callback: Option<fn(u8)>,
    interface_callback: Option<fn(u8, u8)>,
}

impl<B: UsbHardware> UsbCore<B> {
    pub fn new(hw: B) -> Self {
        Self {
            hw,
            registry: InterfaceRegistry::new(),
            host: HostState::new(),
            device: DeviceState::new(),
            events: EventQueue::new(),
            store: DescriptorStore::new(),
            initialized: false,
            configuration_callback: None,
            interface_callback: None,
        }
    }

    /// Bring up both roles. Idempotent.
    pub fn init(&mut self) -> Result<(), UsbError> {
        if self.initialized {
            return Ok(());
        }
        self.hw.enable_host();
        self.hw.enable_device();
        self.initialized = true;
        debug::info!("usb core initialized");
        Ok(())
    }

    /// Tear everything down: registry, descriptor store, both role states.
    pub fn deinit(&mut self) {
        self.registry.clear();
        self.store.clear();
        self.host.reset();
        self.device.reset();
        self.events.clear();
        self.initialized = false;
        debug::info!("usb core deinitialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Push a fresh descriptor set for the device role.
    ///
    /// The descriptors are validated before anything is handed to the
    /// hardware; on any failure the previously pushed descriptors remain in
    /// effect.
    pub fn update_device_descriptors(
        &mut self,
        device: &[u8],
        configuration: &[u8],
        strings: &[&[u8]],
        hid_report: Option<&[u8]>,
    ) -> Result<(), UsbError> {
        if !self.initialized {
            return Err(UsbError::NotReady);
        }
        descriptor::parse_device(device)?;
        descriptor::parse_configuration_header(configuration)?;
        if device.len() > DEVICE_DESCRIPTOR_CAPACITY {
            return Err(UsbError::BufferOverflow);
        }
        if strings.len() > MAX_STRING_DESCRIPTORS {
            return Err(UsbError::InvalidParam);
        }
        if strings
            .iter()
            .any(|bytes| bytes.len() > STRING_DESCRIPTOR_CAPACITY)
        {
            return Err(UsbError::BufferOverflow);
        }

        self.hw.set_descriptors(device, configuration)?;
        for (index, bytes) in strings.iter().enumerate() {
            self.hw.set_string_descriptor(index as u8, bytes)?;
        }
        if let Some(report) = hid_report {
            self.hw.set_hid_report_descriptor(report)?;
        }

        self.store.device.clear();
        let _ = self.store.device.try_extend_from_slice(device);
        self.store.strings = Default::default();
        for (index, bytes) in strings.iter().enumerate() {
            let mut stored = ArrayVec::new();
            let _ = stored.try_extend_from_slice(bytes);
            self.store.strings[index] = Some(stored);
        }
        debug::info!("device descriptors updated");
        Ok(())
    }

    /// Register a device-role interface at runtime.
    ///
    /// Follow with [`configure_endpoint`](Self::configure_endpoint) and, for
    /// HID, [`update_hid_report_descriptor`](Self::update_hid_report_descriptor),
    /// then [`trigger_reset`](Self::trigger_reset) so the upstream host picks
    /// up the new configuration.
    pub fn add_interface(
        &mut self,
        number: u8,
        class: u8,
        subclass: u8,
        protocol: u8,
        handler: HandlerKind,
    ) -> Result<(), UsbError> {
        if !self.initialized {
            return Err(UsbError::NotReady);
        }
        let descriptor = descriptor::InterfaceDescriptor {
            interface_number: number,
            alternate_setting: 0,
            num_endpoints: 0,
            interface_class: class,
            interface_sub_class: subclass,
            interface_protocol: protocol,
            interface_index: 0,
        };
        self.registry.add_interface(descriptor, handler)?;
        if let Err(error) = self
            .hw
            .device_configure_interface(number, class, subclass, protocol)
        {
            // soft error; the registry entry stays and descriptor assembly
            // still reflects the interface
            debug::warn!("hardware interface configuration failed ({:?})", error);
        }
        debug::info!(
            "added interface {} (class {} subclass {} protocol {})",
            number,
            class,
            subclass,
            protocol
        );
        self.events.push(UsbEvent::InterfaceEnabled(number));
        Ok(())
    }

    /// Remove a device-role interface.
    pub fn remove_interface(&mut self, number: u8) -> Result<(), UsbError> {
        self.registry.remove_interface(number)?;
        self.events.push(UsbEvent::InterfaceDisabled(number));
        debug::info!("removed interface {}", number);
        Ok(())
    }

    /// Add or update an endpoint on a device-role interface.
    pub fn configure_endpoint(
        &mut self,
        interface: u8,
        address: u8,
        attributes: u8,
        max_packet_size: u16,
        interval: u8,
    ) -> Result<(), UsbError> {
        self.registry
            .configure_endpoint(interface, address, attributes, max_packet_size, interval)?;
        if let Err(error) = self.hw.device_configure_endpoint(
            interface,
            address,
            attributes,
            max_packet_size,
            interval,
        ) {
            debug::warn!("hardware endpoint configuration failed ({:?})", error);
        }
        if let Err(error) = self.hw.device_endpoint_enable(address, true) {
            debug::warn!("hardware endpoint enable failed ({:?})", error);
        }
        Ok(())
    }

    /// Record that class requests for `interface` have an owner.
    ///
    /// The handler object itself is passed to [`task`](Self::task).
    pub fn register_control_handler(&mut self, interface: u8) -> Result<(), UsbError> {
        self.registry.register_control_handler(interface)
    }

    /// Store the HID report descriptor for an interface and push it to the
    /// hardware.
    pub fn update_hid_report_descriptor(
        &mut self,
        interface: u8,
        bytes: &[u8],
    ) -> Result<(), UsbError> {
        self.registry.set_report_descriptor(interface, bytes)?;
        if let Err(error) = self.hw.set_hid_report_descriptor(bytes) {
            debug::warn!("hardware report descriptor update failed ({:?})", error);
        }
        Ok(())
    }

    /// Force the upstream host to re-enumerate the device role.
    pub fn trigger_reset(&mut self) -> Result<(), UsbError> {
        debug::info!("triggering device-role reset");
        Ok(self.hw.device_reset()?)
    }

    /// Register a host-role class handler for a class triple (0 in subclass
    /// or protocol is a wildcard).
    ///
    /// Returns the slot the driver object must occupy in the driver slice
    /// passed to [`task`](Self::task).
    pub fn register_host_class_handler(
        &mut self,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Result<usize, UsbError> {
        self.registry
            .register_host_class_handler(class, subclass, protocol)
    }

    /// Deactivate a host-role class handler (exact triple match).
    pub fn unregister_host_class_handler(
        &mut self,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Result<(), UsbError> {
        self.registry
            .unregister_host_class_handler(class, subclass, protocol)
    }

    /// Read-only view of a registered interface.
    pub fn get_interface(&self, number: u8) -> Option<&registry::InterfaceEntry> {
        self.registry.get_interface(number)
    }

    /// Read-only view of a registered endpoint.
    pub fn get_endpoint(&self, interface: u8, address: u8) -> Option<&registry::EndpointRecord> {
        self.registry.get_endpoint(interface, address)
    }

    /// The registry itself, for lookups and descriptor assembly.
    pub fn registry(&self) -> &InterfaceRegistry {
        &self.registry
    }

    /// Callback invoked when the upstream host selects a configuration.
    pub fn set_configuration_callback(&mut self, callback: fn(u8)) {
        self.configuration_callback = Some(callback);
    }

    /// Callback invoked when the upstream host selects an alternate setting.
    pub fn set_interface_callback(&mut self, callback: fn(u8, u8)) {
        self.interface_callback = Some(callback);
    }

    /// Configuration value stored by the last `SET_CONFIGURATION`.
    pub fn configuration(&self) -> u8 {
        self.device.configuration
    }

    /// Whether an upstream host is currently connected to the device role.
    pub fn host_connected(&self) -> bool {
        self.device.host_connected
    }

    /// Enumeration progress of the host role.
    pub fn enumeration_state(&self) -> EnumerationState {
        self.host.state
    }

    /// The enumerated downstream device, if any.
    pub fn attached_device(&self) -> Option<&AttachedDevice> {
        self.host.device.as_ref()
    }

    /// Access the hardware, e.g. for driver methods that issue transfers.
    pub fn hw_mut(&mut self) -> &mut B {
        &mut self.hw
    }

    pub fn hw(&self) -> &B {
        &self.hw
    }

    /// Drive both roles.
    ///
    /// Call this from the main loop, frequently enough to satisfy the 1 s
    /// control-response budget; a 1 ms cadence is customary. `drivers` holds
    /// the host-role class drivers in registration-slot order; `handlers`
    /// holds the device-role interface handlers.
    pub fn task(
        &mut self,
        drivers: &mut [&mut dyn HostClassDriver<B>],
        handlers: &mut [&mut dyn InterfaceHandler],
    ) -> Result<(), UsbError> {
        if !self.initialized {
            return Err(UsbError::NotReady);
        }

        while let Some(event) = self.hw.poll_event() {
            match event {
                RawEvent::Attached(_) | RawEvent::Detached => {
                    self.host_handle_event(&event, drivers)
                }
                RawEvent::HostConnected => {
                    debug::info!("upstream host connected");
                    self.device.host_connected = true;
                    self.events.push(UsbEvent::HostConnected);
                }
                RawEvent::HostDisconnected => {
                    debug::info!("upstream host disconnected");
                    self.device.host_connected = false;
                    self.events.push(UsbEvent::HostDisconnected);
                }
                RawEvent::SetupReceived(setup) => {
                    if let Err(error) = self.device_on_setup(setup, handlers) {
                        debug::warn!("control request rejected ({:?})", error);
                    }
                }
                RawEvent::EndpointData { endpoint } => {
                    self.device_endpoint_data(endpoint, handlers)
                }
                RawEvent::ConfigurationChanged(value) => {
                    self.device.configuration = value;
                    if let Some(callback) = self.configuration_callback {
                        callback(value);
                    }
                }
                RawEvent::InterfaceChanged {
                    interface,
                    alternate,
                } => {
                    if let Some(entry) = self.registry.find_mut(interface) {
                        entry.descriptor.alternate_setting = alternate;
                    }
                    if let Some(callback) = self.interface_callback {
                        callback(interface, alternate);
                    }
                }
            }
        }

        self.host_poll(drivers);
        if let Err(error) = self.device_poll(handlers) {
            debug::warn!("pending control request failed ({:?})", error);
        }

        while let Some(event) = self.events.pop() {
            match event {
                UsbEvent::InterfaceEnabled(number) | UsbEvent::InterfaceDisabled(number) => {
                    event::notify(handlers, number, &event, &[]);
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::hid::{HidDevice, HidHost};
    use crate::mocks::{HwCall, ScriptedHw};
    use crate::types::ConnectionSpeed;
    use std::vec;
    use std::vec::Vec;
    use usb_device::control::{Recipient, RequestType};
    use usb_device::UsbDirection;

    const DEVICE: [u8; 18] = [
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x5E, 0x04, 0x8E, 0x02, 0x00, 0x01, 0x01,
        0x02, 0x03, 0x01,
    ];

    // "Mouse" as a string descriptor
    const PRODUCT_STRING: [u8; 12] = [12, 3, b'M', 0, b'o', 0, b'u', 0, b's', 0, b'e', 0];

    const MOUSE_TREE: [u8; 34] = [
        9, 2, 34, 0, 1, 1, 0, 0x80, 50, // configuration
        9, 4, 0, 0, 1, 3, 0, 2, 0, // interface (HID boot mouse)
        9, 0x21, 0x11, 0x01, 0, 1, 0x22, 52, 0, // hid
        7, 5, 0x81, 3, 8, 0, 10, // interrupt IN endpoint
    ];

    fn run_ticks(
        core: &mut UsbCore<ScriptedHw>,
        drivers: &mut [&mut dyn HostClassDriver<ScriptedHw>],
        ticks: usize,
    ) {
        for _ in 0..ticks {
            core.task(drivers, &mut []).unwrap();
            core.hw_mut().advance_ms(5);
        }
    }

    fn script_mouse_enumeration(hw: &mut ScriptedHw) {
        hw.control_script = [
            Ok(DEVICE[..8].to_vec()),      // GET_DESCRIPTOR(DEVICE, 8)
            Ok(Vec::new()),                // SET_ADDRESS(1)
            Ok(DEVICE.to_vec()),           // GET_DESCRIPTOR(DEVICE, 18)
            Ok(PRODUCT_STRING.to_vec()),   // GET_DESCRIPTOR(STRING, 2)
            Ok(MOUSE_TREE[..9].to_vec()),  // GET_DESCRIPTOR(CONFIG, 9)
            Ok(MOUSE_TREE.to_vec()),       // GET_DESCRIPTOR(CONFIG, 34)
            Ok(Vec::new()),                // SET_CONFIGURATION(1)
            Ok(Vec::new()),                // SET_IDLE
            Ok(Vec::new()),                // SET_PROTOCOL
            Ok(vec![0x05, 0x01]),          // GET_DESCRIPTOR(HID_REPORT)
        ]
        .into_iter()
        .collect();
    }

    #[test]
    fn test_init_is_idempotent() {
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();
        core.init().unwrap();
        assert_eq!(
            core.hw().calls,
            vec![HwCall::EnableHost, HwCall::EnableDevice]
        );
    }

    #[test]
    fn test_task_requires_init() {
        let mut core = UsbCore::new(ScriptedHw::new());
        assert_eq!(core.task(&mut [], &mut []), Err(UsbError::NotReady));
    }

    #[test]
    fn test_enumerate_mouse() {
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();
        let slot = core.register_host_class_handler(3, 0, 0).unwrap();
        assert_eq!(slot, 0);

        let mut hid = HidHost::new();
        script_mouse_enumeration(core.hw_mut());
        core.hw_mut()
            .push_event(hal::RawEvent::Attached(ConnectionSpeed::Full));

        {
            let mut drivers: [&mut dyn HostClassDriver<ScriptedHw>; 1] = [&mut hid];
            run_ticks(&mut core, &mut drivers, 8);
        }

        assert_eq!(core.enumeration_state(), EnumerationState::Complete);
        let device = core.attached_device().unwrap();
        assert_eq!(device.address, 1);
        assert_eq!(device.vendor_id, 0x045E);
        assert_eq!(device.product_id, 0x028E);
        assert_eq!(device.hid_interface, Some(0));
        assert_eq!(device.interrupt_in, Some(0x81));
        assert_eq!(device.interval, 10);
        assert_eq!(device.product_name(), "Mouse");
        assert!(device.is_hid());

        assert_eq!(hid.take_event(), Some(crate::hid::HidEvent::Attached));
        assert_eq!(hid.report_descriptor(), &[0x05, 0x01]);

        // the enumerator issued SET_CONFIGURATION only after a successful
        // SET_ADDRESS and a full configuration fetch
        let requests: Vec<u8> = core
            .hw()
            .host_control_calls()
            .iter()
            .map(|(setup, _)| setup.request)
            .collect();
        assert_eq!(requests, vec![6, 5, 6, 6, 6, 6, 9, 0x0A, 0x0B, 6]);

        // interrupt data now flows to the driver
        core.hw_mut()
            .interrupt_in_script
            .push_back(Ok(vec![0x01, 0x05, 0xFB]));
        {
            let mut drivers: [&mut dyn HostClassDriver<ScriptedHw>; 1] = [&mut hid];
            run_ticks(&mut core, &mut drivers, 1);
        }
        assert_eq!(
            hid.take_event(),
            Some(crate::hid::HidEvent::Mouse(crate::hid::MouseReport {
                buttons: 1,
                dx: 5,
                dy: -5,
                wheel: 0,
            }))
        );
    }

    #[test]
    fn test_enumeration_retries_then_gives_up() {
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();
        core.hw_mut()
            .push_event(hal::RawEvent::Attached(ConnectionSpeed::Low));
        // empty control script: every request times out

        run_ticks(&mut core, &mut [], 5);

        assert_eq!(core.enumeration_state(), EnumerationState::Idle);
        assert!(core.attached_device().is_none());
        // three attempts at the first request, nothing further
        assert_eq!(core.hw().host_control_calls().len(), 3);
    }

    #[test]
    fn test_detach_reaches_driver() {
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();
        core.register_host_class_handler(3, 0, 0).unwrap();

        let mut hid = HidHost::new();
        script_mouse_enumeration(core.hw_mut());
        core.hw_mut()
            .push_event(hal::RawEvent::Attached(ConnectionSpeed::Full));
        {
            let mut drivers: [&mut dyn HostClassDriver<ScriptedHw>; 1] = [&mut hid];
            run_ticks(&mut core, &mut drivers, 8);
        }
        assert_eq!(hid.take_event(), Some(crate::hid::HidEvent::Attached));

        core.hw_mut().push_event(hal::RawEvent::Detached);
        {
            let mut drivers: [&mut dyn HostClassDriver<ScriptedHw>; 1] = [&mut hid];
            run_ticks(&mut core, &mut drivers, 1);
        }
        assert_eq!(core.enumeration_state(), EnumerationState::Idle);
        assert!(core.attached_device().is_none());
        assert_eq!(hid.take_event(), Some(crate::hid::HidEvent::Removed));
    }

    #[test]
    fn test_oversized_configuration_aborts() {
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();

        let mut huge_header = MOUSE_TREE[..9].to_vec();
        huge_header[2] = 0xFF;
        huge_header[3] = 0x02; // wTotalLength = 767
        core.hw_mut().control_script = [
            Ok(DEVICE[..8].to_vec()),
            Ok(Vec::new()),
            Ok(DEVICE.to_vec()),
            Ok(PRODUCT_STRING.to_vec()),
            Ok(huge_header),
        ]
        .into_iter()
        .collect();
        core.hw_mut()
            .push_event(hal::RawEvent::Attached(ConnectionSpeed::Full));

        run_ticks(&mut core, &mut [], 8);

        assert_eq!(core.enumeration_state(), EnumerationState::Idle);
        assert!(core.attached_device().is_none());
    }

    #[test]
    fn test_update_descriptors_validates_before_hardware() {
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();
        assert_eq!(
            core.update_device_descriptors(&DEVICE[..10], &MOUSE_TREE, &[], None),
            Err(UsbError::Parse)
        );
        // nothing reached the hardware
        assert!(!core
            .hw()
            .calls
            .iter()
            .any(|call| matches!(call, HwCall::SetDescriptors { .. })));
    }

    #[test]
    fn test_update_descriptors_failure_keeps_previous() {
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();
        core.update_device_descriptors(&DEVICE, &MOUSE_TREE, &[&PRODUCT_STRING], None)
            .unwrap();

        core.hw_mut().set_descriptor_result = Err(HalError::NotReady);
        let mut other = DEVICE;
        other[8] = 0xFF;
        assert_eq!(
            core.update_device_descriptors(&other, &MOUSE_TREE, &[], None),
            Err(UsbError::NotReady)
        );

        // the old descriptor is still served
        core.hw_mut().set_descriptor_result = Ok(());
        let setup = SetupPacket::new(
            UsbDirection::In,
            RequestType::Standard,
            Recipient::Device,
            usb_device::control::Request::GET_DESCRIPTOR,
            (descriptor::TYPE_DEVICE as u16) << 8,
            0,
            18,
        );
        core.hw_mut().push_event(hal::RawEvent::SetupReceived(setup));
        run_ticks(&mut core, &mut [], 1);
        assert_eq!(core.hw().ep0_sends(), vec![DEVICE.to_vec()]);
    }

    #[test]
    fn test_add_interface_notifies_handler() {
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();
        core.add_interface(1, 3, 1, 1, HandlerKind::Hid).unwrap();
        core.configure_endpoint(1, 0x82, 3, 8, 10).unwrap();
        core.register_control_handler(1).unwrap();

        assert!(core
            .hw()
            .calls
            .iter()
            .any(|call| matches!(
                call,
                HwCall::ConfigureInterface {
                    interface: 1,
                    class: 3,
                    subclass: 1,
                    protocol: 1
                }
            )));

        struct Observer {
            enabled: bool,
        }
        impl InterfaceHandler for Observer {
            fn interface(&self) -> u8 {
                1
            }
            fn control_request(
                &mut self,
                _setup: &SetupPacket,
                _data: &[u8],
                _response: &mut ControlResponse<'_>,
            ) -> bool {
                true
            }
            fn enabled(&mut self) {
                self.enabled = true;
            }
        }
        let mut observer = Observer { enabled: false };
        let mut handlers: [&mut dyn InterfaceHandler; 1] = [&mut observer];
        core.task(&mut [], &mut handlers).unwrap();
        assert!(observer.enabled);
    }

    #[test]
    fn test_led_forwarding_bridge() {
        // Device role presents a keyboard; host role drives a physical one.
        let mut core = UsbCore::new(ScriptedHw::new());
        core.init().unwrap();
        core.register_host_class_handler(3, 0, 0).unwrap();
        core.add_interface(0, 3, 1, 1, HandlerKind::Hid).unwrap();
        core.configure_endpoint(0, 0x81, 3, 8, 10).unwrap();
        core.register_control_handler(0).unwrap();

        let mut hid_host = HidHost::new();
        let mut hid_device = HidDevice::keyboard(0, 0x81);

        // enumerate the physical keyboard downstream
        let mut keyboard_tree = MOUSE_TREE;
        keyboard_tree[16] = 1; // bInterfaceProtocol = keyboard
        core.hw_mut().control_script = [
            Ok(DEVICE[..8].to_vec()),
            Ok(Vec::new()),
            Ok(DEVICE.to_vec()),
            Ok(PRODUCT_STRING.to_vec()),
            Ok(keyboard_tree[..9].to_vec()),
            Ok(keyboard_tree.to_vec()),
            Ok(Vec::new()),
            Ok(Vec::new()),
            Ok(Vec::new()),
            Ok(vec![0x05, 0x01]),
        ]
        .into_iter()
        .collect();
        core.hw_mut()
            .push_event(hal::RawEvent::Attached(ConnectionSpeed::Full));
        {
            let mut drivers: [&mut dyn HostClassDriver<ScriptedHw>; 1] = [&mut hid_host];
            let mut handlers: [&mut dyn InterfaceHandler; 1] = [&mut hid_device];
            for _ in 0..8 {
                core.task(&mut drivers, &mut handlers).unwrap();
                core.hw_mut().advance_ms(5);
            }
        }
        assert_eq!(core.enumeration_state(), EnumerationState::Complete);
        core.hw_mut().calls.clear();

        // upstream host sets the keyboard LEDs on our device role
        let set_report = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            0x09,
            0x0200,
            0,
            1,
        );
        core.hw_mut().ep0_out_script.push_back(vec![0x02]);
        core.hw_mut()
            .push_event(hal::RawEvent::SetupReceived(set_report));
        {
            let mut drivers: [&mut dyn HostClassDriver<ScriptedHw>; 1] = [&mut hid_host];
            let mut handlers: [&mut dyn InterfaceHandler; 1] = [&mut hid_device];
            core.task(&mut drivers, &mut handlers).unwrap();
        }

        // exactly one device-side control receive of the LED byte
        let receives: Vec<usize> = core
            .hw()
            .calls
            .iter()
            .filter_map(|call| match call {
                HwCall::DeviceRecvEp0 { length } if *length > 0 => Some(*length),
                _ => None,
            })
            .collect();
        assert_eq!(receives, vec![1]);

        // the bridge forwards the LED state downstream
        let leds = hid_device.take_output_report().unwrap();
        assert_eq!(leds, 0x02);
        core.hw_mut().control_script.push_back(Ok(Vec::new()));
        {
            let mut drivers: [&mut dyn HostClassDriver<ScriptedHw>; 1] = [&mut hid_host];
            let forwarded = core
                .forward_class_control(&mut drivers, &set_report, &[leds])
                .unwrap();
            assert!(forwarded);
        }

        let controls = core.hw().host_control_calls();
        assert_eq!(controls.len(), 1);
        let (setup, data) = &controls[0];
        assert_eq!(setup.request_type, 0x21);
        assert_eq!(setup.request, 0x09);
        assert_eq!(setup.value, 0x0200);
        assert_eq!(setup.length, 1);
        assert_eq!(data.as_slice(), &[0x02]);
    }
}
