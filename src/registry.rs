//! Runtime registry of device-mode interfaces and host-mode class handlers
//!
//! The registry is the shared heart of both roles: the device-side control
//! dispatcher consults it to route class requests and to assemble the
//! composite configuration descriptor, the host-side enumerator consults it
//! to find a class driver for a freshly enumerated device.
//!
//! All storage is fixed-capacity and owned by the registry. Lookups hand out
//! borrows which the borrow checker ties to the registry, so no entry can be
//! held across a mutation.

use arrayvec::ArrayVec;

use crate::debug;
use crate::descriptor::{InterfaceDescriptor, TYPE_CONFIGURATION, TYPE_ENDPOINT, TYPE_HID, TYPE_HID_REPORT, TYPE_INTERFACE};
use crate::types::UsbError;

/// Maximum number of device-mode interfaces
pub const MAX_INTERFACES: usize = 8;
/// Maximum number of endpoints per interface
pub const MAX_ENDPOINTS_PER_INTERFACE: usize = 16;
/// Maximum number of host-mode class handler slots
pub const MAX_HOST_CLASS_HANDLERS: usize = 8;
/// Maximum number of string descriptors
pub const MAX_STRING_DESCRIPTORS: usize = 10;
/// Capacity of an assembled configuration descriptor
pub const CONFIG_BUFFER_CAPACITY: usize = 512;
/// Capacity of a stored HID report descriptor
pub const REPORT_DESCRIPTOR_CAPACITY: usize = 256;

/// Tags the kind of handler serving an interface
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandlerKind {
    /// No handler assigned
    None,
    /// HID class handler
    Hid,
    /// Application-specific handler
    Custom,
}

/// One endpoint of a registered interface
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointRecord {
    /// Endpoint address including the direction bit
    pub address: u8,
    /// Attribute byte (transfer type in the low two bits)
    pub attributes: u8,
    /// Maximum packet size
    pub max_packet_size: u16,
    /// Polling interval in milliseconds
    pub interval: u8,
    /// Whether this record is in use
    pub configured: bool,
}

/// A registered device-mode interface with its endpoints
#[derive(Clone, Debug)]
pub struct InterfaceEntry {
    /// The interface descriptor as it will appear in the configuration tree
    pub descriptor: InterfaceDescriptor,
    /// Kind of handler serving this interface
    pub handler: HandlerKind,
    /// Whether a control-request handler has been registered
    pub has_control_handler: bool,
    endpoints: [EndpointRecord; MAX_ENDPOINTS_PER_INTERFACE],
    report_descriptor: ArrayVec<u8, REPORT_DESCRIPTOR_CAPACITY>,
}

impl InterfaceEntry {
    fn new(descriptor: InterfaceDescriptor, handler: HandlerKind) -> Self {
        Self {
            descriptor,
            handler,
            has_control_handler: false,
            endpoints: [EndpointRecord::default(); MAX_ENDPOINTS_PER_INTERFACE],
            report_descriptor: ArrayVec::new(),
        }
    }

    /// The configured endpoints of this interface, in configuration order
    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointRecord> {
        self.endpoints.iter().filter(|endpoint| endpoint.configured)
    }

    /// Look up one endpoint by address
    pub fn endpoint(&self, address: u8) -> Option<&EndpointRecord> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.configured && endpoint.address == address)
    }

    /// The HID report descriptor stored for this interface, if any
    pub fn report_descriptor(&self) -> Option<&[u8]> {
        if self.report_descriptor.is_empty() {
            None
        } else {
            Some(&self.report_descriptor)
        }
    }
}

/// One entry of the host-mode class handler table
///
/// `slot` is the position of the corresponding driver object in the slice the
/// application passes to [`crate::UsbCore::task`]: handlers keep their slot
/// for the lifetime of the table, removal only clears `active`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostHandlerEntry {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub slot: usize,
    pub active: bool,
}

/// Registry of device-mode interfaces and host-mode class handlers
pub struct InterfaceRegistry {
    interfaces: [Option<InterfaceEntry>; MAX_INTERFACES],
    handlers: [Option<HostHandlerEntry>; MAX_HOST_CLASS_HANDLERS],
    handler_count: usize,
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self {
            interfaces: Default::default(),
            handlers: Default::default(),
            handler_count: 0,
        }
    }

    /// Drop all interfaces and handlers
    pub fn clear(&mut self) {
        self.interfaces = Default::default();
        self.handlers = Default::default();
        self.handler_count = 0;
    }

    /// Register a device-mode interface.
    ///
    /// The interface number in `descriptor` must be unique among registered
    /// interfaces.
    pub fn add_interface(
        &mut self,
        descriptor: InterfaceDescriptor,
        handler: HandlerKind,
    ) -> Result<(), UsbError> {
        if self.find(descriptor.interface_number).is_some() {
            debug::info!(
                "interface {} already registered",
                descriptor.interface_number
            );
            return Err(UsbError::AlreadyExists);
        }
        let slot = self
            .interfaces
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(UsbError::NoMemory)?;
        *slot = Some(InterfaceEntry::new(descriptor, handler));
        Ok(())
    }

    /// Remove a device-mode interface and free its storage
    pub fn remove_interface(&mut self, number: u8) -> Result<(), UsbError> {
        let slot = self
            .interfaces
            .iter_mut()
            .find(|slot| {
                slot.as_ref()
                    .is_some_and(|entry| entry.descriptor.interface_number == number)
            })
            .ok_or(UsbError::NotFound)?;
        *slot = None;
        Ok(())
    }

    /// Insert or update an endpoint record on a registered interface
    pub fn configure_endpoint(
        &mut self,
        interface: u8,
        address: u8,
        attributes: u8,
        max_packet_size: u16,
        interval: u8,
    ) -> Result<(), UsbError> {
        let entry = self.find_mut(interface).ok_or(UsbError::NotFound)?;
        let record = match entry
            .endpoints
            .iter_mut()
            .find(|endpoint| endpoint.configured && endpoint.address == address)
        {
            Some(record) => record,
            None => entry
                .endpoints
                .iter_mut()
                .find(|endpoint| !endpoint.configured)
                .ok_or(UsbError::NoMemory)?,
        };
        *record = EndpointRecord {
            address,
            attributes,
            max_packet_size,
            interval,
            configured: true,
        };
        Ok(())
    }

    /// Mark an interface as having a control-request handler.
    ///
    /// The handler object itself is passed to [`crate::UsbCore::task`]; the
    /// registry only records that class requests for this interface have an
    /// owner.
    pub fn register_control_handler(&mut self, interface: u8) -> Result<(), UsbError> {
        let entry = self.find_mut(interface).ok_or(UsbError::NotFound)?;
        entry.has_control_handler = true;
        Ok(())
    }

    /// Store the HID report descriptor for an interface
    pub fn set_report_descriptor(&mut self, interface: u8, bytes: &[u8]) -> Result<(), UsbError> {
        let entry = self.find_mut(interface).ok_or(UsbError::NotFound)?;
        entry.report_descriptor.clear();
        entry
            .report_descriptor
            .try_extend_from_slice(bytes)
            .map_err(|_| UsbError::BufferOverflow)?;
        Ok(())
    }

    /// Read-only lookup of an interface by number
    pub fn get_interface(&self, number: u8) -> Option<&InterfaceEntry> {
        self.find(number)
    }

    /// Read-only lookup of an endpoint record
    pub fn get_endpoint(&self, interface: u8, address: u8) -> Option<&EndpointRecord> {
        self.find(interface)?.endpoint(address)
    }

    /// Find which interface owns the given endpoint address
    pub fn interface_for_endpoint(&self, address: u8) -> Option<u8> {
        self.interfaces().find_map(|entry| {
            entry
                .endpoint(address)
                .map(|_| entry.descriptor.interface_number)
        })
    }

    /// The registered interfaces, in registration (slot) order
    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceEntry> {
        self.interfaces.iter().flatten()
    }

    pub(crate) fn find_mut(&mut self, number: u8) -> Option<&mut InterfaceEntry> {
        self.interfaces
            .iter_mut()
            .flatten()
            .find(|entry| entry.descriptor.interface_number == number)
    }

    fn find(&self, number: u8) -> Option<&InterfaceEntry> {
        self.interfaces
            .iter()
            .flatten()
            .find(|entry| entry.descriptor.interface_number == number)
    }

    /// Register a host-mode class handler for a `(class, subclass, protocol)`
    /// triple.
    ///
    /// A subclass or protocol of 0 acts as a wildcard during lookup. Returns
    /// the slot the corresponding driver must occupy in the driver slice
    /// passed to [`crate::UsbCore::task`].
    pub fn register_host_class_handler(
        &mut self,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Result<usize, UsbError> {
        let exists = self.handlers.iter().flatten().any(|entry| {
            entry.active
                && entry.class == class
                && entry.subclass == subclass
                && entry.protocol == protocol
        });
        if exists {
            return Err(UsbError::AlreadyExists);
        }
        if self.handler_count >= MAX_HOST_CLASS_HANDLERS {
            return Err(UsbError::NoMemory);
        }
        let slot = self.handler_count;
        self.handlers[slot] = Some(HostHandlerEntry {
            class,
            subclass,
            protocol,
            slot,
            active: true,
        });
        self.handler_count += 1;
        debug::info!(
            "registered host handler for class {} subclass {} protocol {}",
            class,
            subclass,
            protocol
        );
        Ok(slot)
    }

    /// Deactivate a host-mode class handler.
    ///
    /// The triple must match a registration exactly. The slot is not reused;
    /// later registrations get fresh slots so driver indices stay stable.
    pub fn unregister_host_class_handler(
        &mut self,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Result<(), UsbError> {
        let entry = self
            .handlers
            .iter_mut()
            .flatten()
            .find(|entry| {
                entry.active
                    && entry.class == class
                    && entry.subclass == subclass
                    && entry.protocol == protocol
            })
            .ok_or(UsbError::NotFound)?;
        entry.active = false;
        Ok(())
    }

    /// Find the host handler for a class triple.
    ///
    /// Two passes over the table, preserving registration order: the first
    /// demands equality on all three fields, the second matches on class with
    /// 0 in the registered subclass or protocol standing for "any". The first
    /// match wins.
    pub fn find_host_handler(
        &self,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Option<&HostHandlerEntry> {
        let exact = self.handlers.iter().flatten().find(|entry| {
            entry.active
                && entry.class == class
                && entry.subclass == subclass
                && entry.protocol == protocol
        });
        if exact.is_some() {
            return exact;
        }
        self.handlers.iter().flatten().find(|entry| {
            entry.active
                && entry.class == class
                && (entry.subclass == 0 || entry.subclass == subclass)
                && (entry.protocol == 0 || entry.protocol == protocol)
        })
    }

    /// Assemble the composite configuration descriptor from the registry.
    ///
    /// Emits the 9-byte configuration header, then for every registered
    /// interface a 9-byte interface descriptor, a 9-byte HID descriptor when
    /// the interface class is HID, and one 7-byte endpoint descriptor per
    /// configured endpoint. `wTotalLength` and `bNumInterfaces` are patched
    /// in after layout. The emitted endpoint count always matches the
    /// `bNumEndpoints` field.
    pub fn assemble_configuration(
        &self,
    ) -> Result<ArrayVec<u8, CONFIG_BUFFER_CAPACITY>, UsbError> {
        let mut buffer: ArrayVec<u8, CONFIG_BUFFER_CAPACITY> = ArrayVec::new();
        buffer
            .try_extend_from_slice(&[9, TYPE_CONFIGURATION, 0, 0, 0, 1, 0, 0x80, 50])
            .map_err(|_| UsbError::BufferOverflow)?;

        let mut num_interfaces = 0u8;
        for entry in self.interfaces() {
            num_interfaces += 1;
            let descriptor = &entry.descriptor;
            let num_endpoints = entry.endpoints().count() as u8;
            buffer
                .try_extend_from_slice(&[
                    9,
                    TYPE_INTERFACE,
                    descriptor.interface_number,
                    descriptor.alternate_setting,
                    num_endpoints,
                    descriptor.interface_class,
                    descriptor.interface_sub_class,
                    descriptor.interface_protocol,
                    descriptor.interface_index,
                ])
                .map_err(|_| UsbError::BufferOverflow)?;

            if descriptor.interface_class == 3 {
                let report_length =
                    entry.report_descriptor().map_or(0, |bytes| bytes.len()) as u16;
                let report_length = report_length.to_le_bytes();
                buffer
                    .try_extend_from_slice(&[
                        9,
                        TYPE_HID,
                        0x11,
                        0x01, // HID 1.11
                        0,
                        1,
                        TYPE_HID_REPORT,
                        report_length[0],
                        report_length[1],
                    ])
                    .map_err(|_| UsbError::BufferOverflow)?;
            }

            for endpoint in entry.endpoints() {
                let max_packet_size = endpoint.max_packet_size.to_le_bytes();
                buffer
                    .try_extend_from_slice(&[
                        7,
                        TYPE_ENDPOINT,
                        endpoint.address,
                        endpoint.attributes,
                        max_packet_size[0],
                        max_packet_size[1],
                        endpoint.interval,
                    ])
                    .map_err(|_| UsbError::BufferOverflow)?;
            }
        }

        let total_length = (buffer.len() as u16).to_le_bytes();
        buffer[2] = total_length[0];
        buffer[3] = total_length[1];
        buffer[4] = num_interfaces;
        Ok(buffer)
    }
}
