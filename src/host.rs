//! Host-side enumeration and class driver dispatch
//!
//! The host side drives exactly one downstream device (single-port host)
//! through enumeration, then hands it to a class driver registered in the
//! [`crate::registry::InterfaceRegistry`].
//!
//! Enumeration is a state machine advanced by [`crate::UsbCore::task`], one
//! control request per tick: reset → short device descriptor (to learn the
//! EP0 packet size) → `SET_ADDRESS` → full device descriptor → configuration
//! header → full configuration tree → `SET_CONFIGURATION`. Each request has a
//! retry budget of three; exhaustion abandons the device until it is
//! re-attached.

use arrayvec::ArrayVec;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

use crate::debug;
use crate::descriptor::{self, TypedDescriptor, TYPE_CONFIGURATION, TYPE_DEVICE, TYPE_STRING};
use crate::hal::{DataStage, HalError, Instant, RawEvent, UsbHardware};
use crate::registry::CONFIG_BUFFER_CAPACITY;
use crate::types::{ConnectionSpeed, SetupPacket, TransferType, UsbError};
use crate::UsbCore;
use crate::UsbEvent;

/// How long a device may take to settle after `SET_ADDRESS`
const ADDRESS_RECOVERY_MILLIS: u64 = 2;
/// Retry budget per enumeration step
const MAX_RETRIES: u8 = 3;
/// Capacity of the recorded product string
const PRODUCT_NAME_CAPACITY: usize = 32;

/// A class driver for devices attached to the host port
///
/// Drivers are passed to [`crate::UsbCore::task`] as a slice of trait
/// objects. The slice position of each driver must be the slot returned by
/// [`crate::UsbCore::register_host_class_handler`] for its class triple: the
/// registry stores triples and slots, never driver references, so a driver
/// and the registry cannot form a cycle.
pub trait HostClassDriver<B: UsbHardware> {
    /// Final say on whether this driver takes the device.
    ///
    /// The registry's triple matching (with 0-wildcards) selects the driver;
    /// this hook lets it veto a device it cannot actually serve.
    fn matches(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        let _ = (class, subclass, protocol);
        true
    }

    /// A device matching this driver's triple finished enumeration.
    fn attached(&mut self, device: &AttachedDevice, hw: &mut B);

    /// The device was detached (or enumeration restarted).
    fn detached(&mut self, device: &AttachedDevice);

    /// Perform a class control request on the downstream device.
    ///
    /// Used by the application to forward control traffic to the attached
    /// device, e.g. pushing keyboard LED state through a HID bridge. Returns
    /// whether the driver performed the request.
    fn control(&mut self, setup: &SetupPacket, data: &[u8], hw: &mut B) -> bool {
        let _ = (setup, data, hw);
        false
    }

    /// Data arrived on one of the device's interrupt IN endpoints.
    fn data(&mut self, endpoint: u8, data: &[u8]);
}

/// Enumeration progress of the downstream port
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnumerationState {
    /// No device attached (or enumeration given up)
    Idle,
    /// Fetching the first 8 descriptor bytes to learn the EP0 packet size
    GetDeviceDescShort,
    /// Assigning the bus address
    SetAddress,
    /// Fetching the full 18-byte device descriptor
    GetDeviceDescFull,
    /// Fetching the 9-byte configuration header
    GetConfigDescHeader,
    /// Fetching the full configuration tree
    GetConfigDescFull,
    /// Selecting configuration 1
    SetConfiguration,
    /// Enumeration finished, the bound class driver is being polled
    Complete,
}

/// Everything the host side knows about the attached device
#[derive(Clone, Debug)]
pub struct AttachedDevice {
    /// Assigned bus address
    pub address: u8,
    /// Speed reported at attach time
    pub speed: ConnectionSpeed,
    /// EP0 maximum packet size
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device-level class triple
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub num_configurations: u8,
    /// First HID interface found in the configuration tree
    pub hid_interface: Option<u8>,
    /// Interrupt IN endpoint of that interface (address incl. direction bit)
    pub interrupt_in: Option<u8>,
    /// Interrupt OUT endpoint of that interface, when it has one
    pub interrupt_out: Option<u8>,
    /// Polling interval of the interrupt IN endpoint
    pub interval: u8,
    /// Triple used for the class-handler lookup: the HID interface's triple
    /// when one was found, the device-level triple otherwise
    pub handler_class: u8,
    pub handler_subclass: u8,
    pub handler_protocol: u8,
    product_name: ArrayVec<u8, PRODUCT_NAME_CAPACITY>,
}

impl AttachedDevice {
    fn new(speed: ConnectionSpeed) -> Self {
        Self {
            address: 0,
            speed,
            max_packet_size: 8,
            vendor_id: 0,
            product_id: 0,
            device_class: 0,
            device_sub_class: 0,
            device_protocol: 0,
            num_configurations: 0,
            hid_interface: None,
            interrupt_in: None,
            interrupt_out: None,
            interval: 0,
            handler_class: 0,
            handler_subclass: 0,
            handler_protocol: 0,
            product_name: ArrayVec::new(),
        }
    }

    /// Whether the device exposes HID function (device level or interface level)
    pub fn is_hid(&self) -> bool {
        self.device_class == 3 || self.hid_interface.is_some()
    }

    /// Product string fetched during enumeration (empty if the device has
    /// none or the fetch failed)
    pub fn product_name(&self) -> &str {
        core::str::from_utf8(&self.product_name).unwrap_or("")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for AttachedDevice {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "AttachedDevice(addr={}, vid={:#x}, pid={:#x})",
            self.address,
            self.vendor_id,
            self.product_id,
        )
    }
}

/// Host-side state owned by [`crate::UsbCore`]
pub(crate) struct HostState {
    pub(crate) state: EnumerationState,
    retries: u8,
    recovery_until: Option<Instant>,
    config_total: u16,
    pub(crate) device: Option<AttachedDevice>,
    pub(crate) handler_slot: Option<usize>,
}

impl HostState {
    pub(crate) fn new() -> Self {
        Self {
            state: EnumerationState::Idle,
            retries: 0,
            recovery_until: None,
            config_total: 0,
            device: None,
            handler_slot: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }
}

fn get_descriptor_setup(descriptor_type: u8, index: u8, windex: u16, length: u16) -> SetupPacket {
    SetupPacket::new(
        UsbDirection::In,
        RequestType::Standard,
        Recipient::Device,
        Request::GET_DESCRIPTOR,
        ((descriptor_type as u16) << 8) | index as u16,
        windex,
        length,
    )
}

impl<B: UsbHardware> UsbCore<B> {
    pub(crate) fn host_handle_event(
        &mut self,
        event: &RawEvent,
        drivers: &mut [&mut dyn HostClassDriver<B>],
    ) {
        match event {
            RawEvent::Attached(speed) => {
                if !matches!(self.host.state, EnumerationState::Idle) {
                    // stale episode, e.g. a glitchy cable
                    self.host_detach(drivers);
                }
                debug::info!("device attached at {:?} speed", speed);
                self.hw.reset_bus();
                self.host.device = Some(AttachedDevice::new(*speed));
                self.host.state = EnumerationState::GetDeviceDescShort;
                self.host.retries = 0;
            }
            RawEvent::Detached => self.host_detach(drivers),
            _ => {}
        }
    }

    pub(crate) fn host_detach(&mut self, drivers: &mut [&mut dyn HostClassDriver<B>]) {
        if let Some(device) = self.host.device.take() {
            debug::info!("device detached");
            if let Some(slot) = self.host.handler_slot.take() {
                if let Some(driver) = drivers.get_mut(slot) {
                    driver.detached(&device);
                }
            }
            self.events.push(UsbEvent::DeviceDetached);
        }
        self.host.state = EnumerationState::Idle;
        self.host.retries = 0;
        self.host.recovery_until = None;
    }

    pub(crate) fn host_poll(&mut self, drivers: &mut [&mut dyn HostClassDriver<B>]) {
        match self.host.state {
            EnumerationState::Idle => {}
            EnumerationState::GetDeviceDescShort => self.step_device_desc_short(),
            EnumerationState::SetAddress => self.step_set_address(),
            EnumerationState::GetDeviceDescFull => self.step_device_desc_full(),
            EnumerationState::GetConfigDescHeader => self.step_config_header(),
            EnumerationState::GetConfigDescFull => self.step_config_full(),
            EnumerationState::SetConfiguration => self.step_set_configuration(drivers),
            EnumerationState::Complete => self.step_complete(drivers),
        }
    }

    /// Forward a class control request to the bound class driver.
    ///
    /// Returns `Ok(true)` when the driver performed the request downstream.
    pub fn forward_class_control(
        &mut self,
        drivers: &mut [&mut dyn HostClassDriver<B>],
        setup: &SetupPacket,
        data: &[u8],
    ) -> Result<bool, UsbError> {
        if !matches!(self.host.state, EnumerationState::Complete) {
            return Err(UsbError::NotReady);
        }
        let slot = self.host.handler_slot.ok_or(UsbError::NotFound)?;
        let driver = drivers.get_mut(slot).ok_or(UsbError::NotFound)?;
        Ok(driver.control(setup, data, &mut self.hw))
    }

    fn advance(&mut self, state: EnumerationState) {
        debug::trace!("enumeration -> {:?}", state);
        self.host.state = state;
        self.host.retries = 0;
    }

    /// A request failed; retry it next tick, or give up after the budget.
    fn enum_failure(&mut self, what: &str, error: HalError) {
        self.host.retries += 1;
        debug::warn!(
            "enumeration: {} failed ({:?}), attempt {}",
            what,
            error,
            self.host.retries
        );
        if self.host.retries >= MAX_RETRIES {
            self.enum_abort(what);
        }
    }

    /// Unrecoverable failure; the device stays dormant until re-attached.
    fn enum_abort(&mut self, what: &str) {
        debug::warn!("enumeration abandoned ({})", what);
        self.host.device = None;
        self.host.state = EnumerationState::Idle;
        self.host.retries = 0;
        self.host.recovery_until = None;
    }

    fn step_device_desc_short(&mut self) {
        let setup = get_descriptor_setup(TYPE_DEVICE, 0, 0, 8);
        let mut buffer = [0u8; 8];
        match self.hw.host_control(&setup, DataStage::In(&mut buffer)) {
            Ok(n) if n >= 8 => {
                if let Some(device) = self.host.device.as_mut() {
                    device.max_packet_size = buffer[7];
                }
                self.advance(EnumerationState::SetAddress);
            }
            Ok(_) => self.enum_failure("short device descriptor", HalError::BufferOverflow),
            Err(error) => self.enum_failure("short device descriptor", error),
        }
    }

    fn step_set_address(&mut self) {
        let setup = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SET_ADDRESS,
            1,
            0,
            0,
        );
        match self.hw.host_control(&setup, DataStage::None) {
            Ok(_) => {
                if let Some(device) = self.host.device.as_mut() {
                    device.address = 1;
                }
                // give the device its recovery time before addressing it
                self.host.recovery_until =
                    Some(self.hw.now() + crate::hal::Duration::millis(ADDRESS_RECOVERY_MILLIS));
                self.advance(EnumerationState::GetDeviceDescFull);
            }
            Err(error) => self.enum_failure("set address", error),
        }
    }

    fn step_device_desc_full(&mut self) {
        if let Some(until) = self.host.recovery_until {
            if self.hw.now() < until {
                return;
            }
            self.host.recovery_until = None;
        }
        let setup = get_descriptor_setup(TYPE_DEVICE, 0, 0, 18);
        let mut buffer = [0u8; 18];
        match self.hw.host_control(&setup, DataStage::In(&mut buffer)) {
            Ok(n) => match descriptor::parse_device(&buffer[..n]) {
                Ok(parsed) => {
                    if let Some(device) = self.host.device.as_mut() {
                        device.vendor_id = parsed.id_vendor;
                        device.product_id = parsed.id_product;
                        device.device_class = parsed.device_class;
                        device.device_sub_class = parsed.device_sub_class;
                        device.device_protocol = parsed.device_protocol;
                        device.num_configurations = parsed.num_configurations;
                        device.handler_class = parsed.device_class;
                        device.handler_subclass = parsed.device_sub_class;
                        device.handler_protocol = parsed.device_protocol;
                    }
                    if parsed.product_index != 0 {
                        self.fetch_product_string(parsed.product_index);
                    }
                    self.advance(EnumerationState::GetConfigDescHeader);
                }
                Err(_) => self.enum_abort("device descriptor parse"),
            },
            Err(error) => self.enum_failure("device descriptor", error),
        }
    }

    /// Best-effort fetch of the product string; failure is not fatal.
    fn fetch_product_string(&mut self, index: u8) {
        let setup = get_descriptor_setup(TYPE_STRING, index, 0x0409, 64);
        let mut buffer = [0u8; 64];
        match self.hw.host_control(&setup, DataStage::In(&mut buffer)) {
            Ok(n) if n >= 2 => {
                if let Some(device) = self.host.device.as_mut() {
                    device.product_name.clear();
                    // UTF-16LE payload; keep the ASCII subset
                    let end = n.min(buffer[0] as usize).max(2);
                    let payload = &buffer[2..end];
                    for pair in payload.chunks_exact(2) {
                        if pair[1] == 0 && pair[0] < 0x80 {
                            if device.product_name.try_push(pair[0]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(error) => {
                debug::trace!("product string fetch failed ({:?})", error);
            }
        }
    }

    fn step_config_header(&mut self) {
        let setup = get_descriptor_setup(TYPE_CONFIGURATION, 0, 0, 9);
        let mut buffer = [0u8; 9];
        match self.hw.host_control(&setup, DataStage::In(&mut buffer)) {
            Ok(n) => match descriptor::parse_configuration_header(&buffer[..n]) {
                Ok(header) => {
                    if header.total_length as usize > CONFIG_BUFFER_CAPACITY {
                        debug::warn!(
                            "configuration tree of {} bytes exceeds buffer",
                            header.total_length
                        );
                        self.enum_abort("configuration too large");
                        return;
                    }
                    self.host.config_total = header.total_length;
                    self.advance(EnumerationState::GetConfigDescFull);
                }
                Err(_) => self.enum_abort("configuration header parse"),
            },
            Err(error) => self.enum_failure("configuration header", error),
        }
    }

    fn step_config_full(&mut self) {
        let total = self.host.config_total;
        let setup = get_descriptor_setup(TYPE_CONFIGURATION, 0, 0, total);
        let mut buffer = [0u8; CONFIG_BUFFER_CAPACITY];
        match self
            .hw
            .host_control(&setup, DataStage::In(&mut buffer[..total as usize]))
        {
            Ok(n) => {
                if self.record_configuration(&buffer[..n]) {
                    self.advance(EnumerationState::SetConfiguration);
                } else {
                    self.enum_abort("configuration tree parse");
                }
            }
            Err(error) => self.enum_failure("configuration tree", error),
        }
    }

    /// Walk the configuration tree, recording the first HID interface and its
    /// interrupt IN endpoint.
    fn record_configuration(&mut self, tree: &[u8]) -> bool {
        let Some(device) = self.host.device.as_mut() else {
            return false;
        };
        let mut in_hid_interface = false;
        for entry in descriptor::walk_configuration(tree) {
            match entry {
                Ok(TypedDescriptor::Interface(interface)) => {
                    if interface.interface_class == 3 && device.hid_interface.is_none() {
                        device.hid_interface = Some(interface.interface_number);
                        device.handler_class = interface.interface_class;
                        device.handler_subclass = interface.interface_sub_class;
                        device.handler_protocol = interface.interface_protocol;
                        in_hid_interface = true;
                    } else {
                        in_hid_interface = false;
                    }
                }
                Ok(TypedDescriptor::Endpoint(endpoint)) => {
                    if in_hid_interface
                        && matches!(
                            endpoint.attributes.transfer_type(),
                            TransferType::Interrupt
                        )
                    {
                        if matches!(endpoint.address.direction(), UsbDirection::In) {
                            if device.interrupt_in.is_none() {
                                device.interrupt_in = Some(endpoint.address.raw());
                                device.interval = endpoint.interval;
                            }
                        } else if device.interrupt_out.is_none() {
                            device.interrupt_out = Some(endpoint.address.raw());
                        }
                    }
                }
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        true
    }

    fn step_set_configuration(&mut self, drivers: &mut [&mut dyn HostClassDriver<B>]) {
        let setup = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SET_CONFIGURATION,
            1,
            0,
            0,
        );
        match self.hw.host_control(&setup, DataStage::None) {
            Ok(_) => {
                self.advance(EnumerationState::Complete);
                self.events.push(UsbEvent::DeviceAttached);
                self.bind_class_driver(drivers);
            }
            Err(error) => self.enum_failure("set configuration", error),
        }
    }

    fn bind_class_driver(&mut self, drivers: &mut [&mut dyn HostClassDriver<B>]) {
        let Some(device) = self.host.device.clone() else {
            return;
        };
        let (class, subclass, protocol) = (
            device.handler_class,
            device.handler_subclass,
            device.handler_protocol,
        );
        let Some(slot) = self
            .registry
            .find_host_handler(class, subclass, protocol)
            .map(|entry| entry.slot)
        else {
            debug::info!(
                "no class driver for class {} subclass {} protocol {}",
                class,
                subclass,
                protocol
            );
            return;
        };
        let Some(driver) = drivers.get_mut(slot) else {
            debug::warn!("class driver slot {} not present in driver slice", slot);
            return;
        };
        if !driver.matches(class, subclass, protocol) {
            debug::info!("class driver declined the device");
            return;
        }
        self.host.handler_slot = Some(slot);
        driver.attached(&device, &mut self.hw);
    }

    fn step_complete(&mut self, drivers: &mut [&mut dyn HostClassDriver<B>]) {
        let Some(device) = self.host.device.as_ref() else {
            return;
        };
        let Some(endpoint) = device.interrupt_in else {
            return;
        };
        let Some(slot) = self.host.handler_slot else {
            return;
        };
        let mut buffer = [0u8; 64];
        match self.hw.host_interrupt_in(endpoint, &mut buffer) {
            Ok(0) => {}
            Ok(n) => {
                if let Some(driver) = drivers.get_mut(slot) {
                    driver.data(endpoint, &buffer[..n]);
                }
            }
            // NAK-shaped conditions; the endpoint simply had nothing for us
            Err(HalError::TransferTimeout) => {}
            Err(error) => {
                debug::trace!("interrupt poll failed ({:?})", error);
            }
        }
    }
}
