//! Standard descriptor types and their codec
//!
//! Representations of the USB descriptors the core deals with, parsers to
//! recover them from raw bytes, and serialization for the few places where
//! the core produces descriptor bytes itself.
//!
//! Every descriptor opens with the same two bytes: its own length, then a
//! type code. [`parse::any_descriptor`] peels that framing off a buffer as a
//! [`Descriptor`]; the `parse` module's body parsers then interpret the
//! remainder per type.
//!
//! A configuration descriptor is never alone on the wire: its interfaces,
//! their endpoints and any class-specific descriptors follow it back to
//! back, each with the same framing. [`walk_configuration`] iterates over
//! such a tree, classifying each entry as a [`TypedDescriptor`].

use crate::types::{Bcd16, TransferType, UsbError};
use usb_device::UsbDirection;

/// Type code of a [`DeviceDescriptor`]
pub const TYPE_DEVICE: u8 = 1;
/// Type code of a [`ConfigurationDescriptor`]
pub const TYPE_CONFIGURATION: u8 = 2;
/// Type code of a string descriptor
pub const TYPE_STRING: u8 = 3;
/// Type code of an [`InterfaceDescriptor`]
pub const TYPE_INTERFACE: u8 = 4;
/// Type code of an [`EndpointDescriptor`]
pub const TYPE_ENDPOINT: u8 = 5;
/// Type code of a [`HidDescriptor`]
pub const TYPE_HID: u8 = 0x21;
/// Type code of a HID *report* descriptor, as used in `GET_DESCRIPTOR` requests
pub const TYPE_HID_REPORT: u8 = 0x22;

/// The length/type framing every descriptor starts with
pub struct Descriptor<'a> {
    /// Value of the leading length byte; counts the two framing bytes too
    pub length: u8,
    /// Second byte of the framing: one of the `TYPE_*` constants for
    /// standard descriptors, class- or vendor-defined otherwise
    pub descriptor_type: u8,
    /// The bytes after the framing. Normally `length - 2` of them; fewer if
    /// the host asked for a short read or the transfer was cut off.
    pub data: &'a [u8],
}

/// The one-per-device descriptor: identity and device-wide properties
///
/// Served whole in answer to `GET_DESCRIPTOR(DEVICE)`. The enumerator also
/// fetches just its first 8 bytes early, because `max_packet_size` is needed
/// before any longer control read is safe.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceDescriptor {
    /// USB release the device claims compliance with, packed BCD
    /// (2.00 is `0x0200`)
    pub usb_release: Bcd16,

    /// Device-level class code. Zero defers classing to the interfaces,
    /// which is what composite HID devices do; 0xFF is vendor-defined.
    pub device_class: u8,

    /// Subclass, meaningful only under `device_class`
    pub device_sub_class: u8,

    /// Protocol, meaningful only under the class/subclass pair
    pub device_protocol: u8,

    /// Packet size of the control endpoint: 8, 16, 32 or 64
    pub max_packet_size: u8,

    /// Vendor ID, assigned by the USB-IF
    pub id_vendor: u16,

    /// Product ID, chosen by the vendor
    pub id_product: u16,

    /// Device revision, packed BCD like `usb_release`
    pub device_release: Bcd16,

    /// String descriptor index of the manufacturer name, 0 when absent
    pub manufacturer_index: u8,

    /// String descriptor index of the product name, 0 when absent
    pub product_index: u8,

    /// String descriptor index of the serial number, 0 when absent
    pub serial_number_index: u8,

    /// How many configurations the device offers (nearly always 1)
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Serialize into the 18-byte wire representation.
    ///
    /// `parse_device` followed by `to_bytes` reproduces the input bytes.
    pub fn to_bytes(&self) -> [u8; 18] {
        let usb_release = self.usb_release.to_raw().to_le_bytes();
        let id_vendor = self.id_vendor.to_le_bytes();
        let id_product = self.id_product.to_le_bytes();
        let device_release = self.device_release.to_raw().to_le_bytes();
        [
            18,
            TYPE_DEVICE,
            usb_release[0],
            usb_release[1],
            self.device_class,
            self.device_sub_class,
            self.device_protocol,
            self.max_packet_size,
            id_vendor[0],
            id_vendor[1],
            id_product[0],
            id_product[1],
            device_release[0],
            device_release[1],
            self.manufacturer_index,
            self.product_index,
            self.serial_number_index,
            self.num_configurations,
        ]
    }
}

/// Root of one configuration tree
///
/// `value` is what a host passes to `SET_CONFIGURATION` to pick this
/// configuration; `total_length` tells it how many bytes to request to get
/// the whole tree in one read.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationDescriptor {
    /// Byte length of the whole tree: this header plus every interface,
    /// endpoint and class-specific descriptor under it
    pub total_length: u16,

    /// How many interfaces the tree contains
    pub num_interfaces: u8,

    /// Selector accepted by `SET_CONFIGURATION`
    pub value: u8,

    /// String descriptor index naming this configuration, 0 when absent
    pub index: u8,

    /// Power and wakeup flags
    pub attributes: ConfigurationAttributes,

    /// Bus current budget in 2 mA steps (50 means 100 mA)
    pub max_power: u8,
}

/// Flag bits of a [`ConfigurationDescriptor`]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationAttributes(u8);

impl ConfigurationAttributes {
    /// Set when the configuration powers itself rather than drawing from
    /// the bus
    pub fn self_powered(&self) -> bool {
        (self.0 >> 6) & 1 == 1
    }

    /// Set when the device can wake a suspended host
    pub fn remote_wakeup(&self) -> bool {
        (self.0 >> 5) & 1 == 1
    }
}

/// One interface of a configuration
///
/// Appears only inside a configuration tree, never as the answer to a
/// direct `GET_DESCRIPTOR`. The registry stores one of these per registered
/// device-role interface and emits it back out during assembly.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceDescriptor {
    /// Zero-based interface number, the key used throughout the registry
    pub interface_number: u8,

    /// Alternate setting selected by `SET_INTERFACE` (0 is the default)
    pub alternate_setting: u8,

    /// How many endpoints the interface uses, EP0 not counted
    pub num_endpoints: u8,

    /// Class code: 3 for HID, 0xFF for vendor-defined
    pub interface_class: u8,

    /// Subclass under `interface_class` (for HID, 1 marks boot capability)
    pub interface_sub_class: u8,

    /// Protocol under the class/subclass pair (for boot HID, 1 is keyboard
    /// and 2 is mouse)
    pub interface_protocol: u8,

    /// String descriptor index naming this interface, 0 when absent
    pub interface_index: u8,
}

/// One endpoint of an interface
///
/// Carries what a host needs to schedule the endpoint: transfer type,
/// packet size and polling cadence.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    /// Endpoint address, direction bit included
    pub address: EndpointAddress,

    /// Attribute bits; the transfer type lives in the low two
    pub attributes: EndpointAttributes,

    /// Largest packet the endpoint exchanges in this configuration
    pub max_packet_size: u16,

    /// Polling cadence in 1 ms frames
    pub interval: u8,
}

/// The address byte of an [`EndpointDescriptor`]
///
/// Bit 7 is the direction (set for IN), the low nibble is the endpoint
/// number.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    /// Endpoint number without the direction bit (1 to 15)
    pub fn number(&self) -> u8 {
        self.0 & 0x0F
    }

    /// Which way data flows on this endpoint
    pub fn direction(&self) -> UsbDirection {
        self.0.into()
    }

    /// The full address byte, including the direction bit
    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// The attribute byte of an [`EndpointDescriptor`]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointAttributes(u8);

impl EndpointAttributes {
    pub fn transfer_type(&self) -> TransferType {
        match self.0 & 0b11 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    /// The raw attribute byte
    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// The HID class descriptor, interleaved after its interface descriptor in the
/// configuration tree.
///
/// It announces the length of the report descriptor, which is fetched
/// separately with `GET_DESCRIPTOR(HID_REPORT)`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HidDescriptor {
    /// HID specification release (i.e. 1.11 is 111H)
    pub hid_release: Bcd16,

    /// Country code of localized hardware, 0 when not localized
    pub country_code: u8,

    /// Number of class descriptors that follow (at least 1, the report descriptor)
    pub num_descriptors: u8,

    /// Type of the first subordinate descriptor (0x22 for a report descriptor)
    pub report_descriptor_type: u8,

    /// Length in bytes of the report descriptor
    pub report_descriptor_length: u16,
}

/// One entry of a configuration descriptor tree
///
/// Produced by [`walk_configuration`]. Types the walker does not recognise are
/// surfaced as [`TypedDescriptor::Unknown`] rather than treated as errors, so
/// class-specific descriptors of other classes pass through untouched.
#[derive(Debug, PartialEq)]
pub enum TypedDescriptor<'a> {
    Device(DeviceDescriptor),
    Configuration(ConfigurationDescriptor),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    Hid(HidDescriptor),
    Unknown { descriptor_type: u8, data: &'a [u8] },
}

/// Parse a device descriptor from its wire representation.
///
/// Succeeds exactly when `bytes` holds at least 18 bytes, `bytes[0] == 18` and
/// `bytes[1] == 0x01`. Trailing bytes are ignored.
pub fn parse_device(bytes: &[u8]) -> Result<DeviceDescriptor, UsbError> {
    let (_, descriptor) = parse::device(bytes).map_err(|_| UsbError::Parse)?;
    Ok(descriptor)
}

/// Parse the 9-byte header of a configuration descriptor.
///
/// Requires `bytes.len() >= 9` and `bytes[1] == 0x02`; the rest of the tree
/// (if present) is ignored here, use [`walk_configuration`] for it.
pub fn parse_configuration_header(bytes: &[u8]) -> Result<ConfigurationDescriptor, UsbError> {
    let (_, descriptor) = parse::configuration(bytes).map_err(|_| UsbError::Parse)?;
    Ok(descriptor)
}

/// Iterate over a full configuration descriptor tree.
///
/// The walk advances by each descriptor's length byte. It ends cleanly at the
/// end of the buffer; a zero length byte or a descriptor overrunning the
/// buffer yields a parse error and stops the iteration. The iterator borrows
/// the buffer, so walking is restartable by calling this again.
pub fn walk_configuration(bytes: &[u8]) -> ConfigurationWalk<'_> {
    ConfigurationWalk {
        rest: bytes,
        failed: false,
    }
}

/// Iterator over a configuration descriptor tree, created by [`walk_configuration`]
pub struct ConfigurationWalk<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for ConfigurationWalk<'a> {
    type Item = Result<TypedDescriptor<'a>, UsbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        let (rest, descriptor) = match parse::any_descriptor(self.rest) {
            Ok(result) => result,
            Err(_) => {
                self.failed = true;
                return Some(Err(UsbError::Parse));
            }
        };
        self.rest = rest;
        let typed = match descriptor.descriptor_type {
            TYPE_DEVICE => parse::device_descriptor(descriptor.data)
                .map(|(_, d)| TypedDescriptor::Device(d))
                .ok(),
            TYPE_CONFIGURATION => parse::configuration_descriptor(descriptor.data)
                .map(|(_, d)| TypedDescriptor::Configuration(d))
                .ok(),
            TYPE_INTERFACE => parse::interface_descriptor(descriptor.data)
                .map(|(_, d)| TypedDescriptor::Interface(d))
                .ok(),
            TYPE_ENDPOINT => parse::endpoint_descriptor(descriptor.data)
                .map(|(_, d)| TypedDescriptor::Endpoint(d))
                .ok(),
            TYPE_HID => parse::hid_descriptor(descriptor.data)
                .map(|(_, d)| TypedDescriptor::Hid(d))
                .ok(),
            other => Some(TypedDescriptor::Unknown {
                descriptor_type: other,
                data: descriptor.data,
            }),
        };
        match typed {
            Some(descriptor) => Some(Ok(descriptor)),
            None => {
                self.failed = true;
                Some(Err(UsbError::Parse))
            }
        }
    }
}

pub mod parse {
    use nom::bytes::streaming::take;
    use nom::combinator::verify;
    use nom::number::streaming::{le_u16, u8};
    use nom::IResult;

    use super::*;

    /// Split the length/type framing off the front of `input`.
    ///
    /// Hand the returned [`Descriptor::data`] to the body parser matching
    /// its type. A length byte below 2 (which could never cover the framing
    /// itself) is rejected here, so the walk cannot loop in place.
    pub fn any_descriptor(input: &[u8]) -> IResult<&[u8], Descriptor<'_>> {
        let (input, length) = verify(u8, |&length| length >= 2)(input)?;
        let (input, descriptor_type) = u8(input)?;
        let (input, data) = take((length - 2) as usize)(input)?;
        Ok((
            input,
            Descriptor {
                length,
                descriptor_type,
                data,
            },
        ))
    }

    /// Parse a whole device descriptor, checking its framing first
    pub fn device(input: &[u8]) -> IResult<&[u8], DeviceDescriptor> {
        let (input, _) = verify(u8, |&length| length == 18)(input)?;
        let (input, _) = verify(u8, |&descriptor_type| descriptor_type == TYPE_DEVICE)(input)?;
        device_descriptor(input)
    }

    /// Body of a device descriptor (framing already split off)
    pub fn device_descriptor(input: &[u8]) -> IResult<&[u8], DeviceDescriptor> {
        let (input, usb_release) = bcd_16(input)?;
        let (input, device_class) = u8(input)?;
        let (input, device_sub_class) = u8(input)?;
        let (input, device_protocol) = u8(input)?;
        let (input, max_packet_size) = u8(input)?;
        let (input, id_vendor) = le_u16(input)?;
        let (input, id_product) = le_u16(input)?;
        let (input, device_release) = bcd_16(input)?;
        let (input, manufacturer_index) = u8(input)?;
        let (input, product_index) = u8(input)?;
        let (input, serial_number_index) = u8(input)?;
        let (input, num_configurations) = u8(input)?;
        Ok((
            input,
            DeviceDescriptor {
                usb_release,
                device_class,
                device_sub_class,
                device_protocol,
                max_packet_size,
                id_vendor,
                id_product,
                device_release,
                manufacturer_index,
                product_index,
                serial_number_index,
                num_configurations,
            },
        ))
    }

    /// Parse a whole configuration header, checking its framing first
    pub fn configuration(input: &[u8]) -> IResult<&[u8], ConfigurationDescriptor> {
        let (input, _) = verify(u8, |&length| length == 9)(input)?;
        let (input, _) =
            verify(u8, |&descriptor_type| descriptor_type == TYPE_CONFIGURATION)(input)?;
        configuration_descriptor(input)
    }

    /// Body of a configuration header (framing already split off)
    pub fn configuration_descriptor(input: &[u8]) -> IResult<&[u8], ConfigurationDescriptor> {
        let (input, total_length) = le_u16(input)?;
        let (input, num_interfaces) = u8(input)?;
        let (input, value) = u8(input)?;
        let (input, index) = u8(input)?;
        let (input, attributes) = u8(input)?;
        let (input, max_power) = u8(input)?;
        Ok((
            input,
            ConfigurationDescriptor {
                total_length,
                num_interfaces,
                value,
                index,
                attributes: ConfigurationAttributes(attributes),
                max_power,
            },
        ))
    }

    /// Body of an interface descriptor (framing already split off)
    pub fn interface_descriptor(input: &[u8]) -> IResult<&[u8], InterfaceDescriptor> {
        let (input, interface_number) = u8(input)?;
        let (input, alternate_setting) = u8(input)?;
        let (input, num_endpoints) = u8(input)?;
        let (input, interface_class) = u8(input)?;
        let (input, interface_sub_class) = u8(input)?;
        let (input, interface_protocol) = u8(input)?;
        let (input, interface_index) = u8(input)?;
        Ok((
            input,
            InterfaceDescriptor {
                interface_number,
                alternate_setting,
                num_endpoints,
                interface_class,
                interface_sub_class,
                interface_protocol,
                interface_index,
            },
        ))
    }

    /// Body of an endpoint descriptor (framing already split off)
    pub fn endpoint_descriptor(input: &[u8]) -> IResult<&[u8], EndpointDescriptor> {
        let (input, address) = u8(input)?;
        let (input, attributes) = u8(input)?;
        let (input, max_packet_size) = le_u16(input)?;
        let (input, interval) = u8(input)?;
        Ok((
            input,
            EndpointDescriptor {
                address: EndpointAddress(address),
                attributes: EndpointAttributes(attributes),
                max_packet_size,
                interval,
            },
        ))
    }

    /// Body of a HID class descriptor (framing already split off)
    pub fn hid_descriptor(input: &[u8]) -> IResult<&[u8], HidDescriptor> {
        let (input, hid_release) = bcd_16(input)?;
        let (input, country_code) = u8(input)?;
        let (input, num_descriptors) = u8(input)?;
        let (input, report_descriptor_type) = u8(input)?;
        let (input, report_descriptor_length) = le_u16(input)?;
        Ok((
            input,
            HidDescriptor {
                hid_release,
                country_code,
                num_descriptors,
                report_descriptor_type,
                report_descriptor_length,
            },
        ))
    }

    /// Read a little-endian 16-bit field that must hold packed decimal
    /// digits.
    ///
    /// Fails when any nibble is above 9; see [`Bcd16`].
    pub fn bcd_16(input: &[u8]) -> IResult<&[u8], Bcd16> {
        let (input, raw) = verify(le_u16, |&raw| Bcd16::is_valid(raw))(input)?;
        Ok((input, Bcd16(raw)))
    }
}
