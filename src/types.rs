//! Wire-level vocabulary shared by both roles, and the crate error type
//!

use usb_device::{
    control::{Recipient, RequestType},
    UsbDirection,
};

/// Four decimal digits packed into 16 bits
///
/// USB descriptors encode revision numbers this way: release 2.10 travels on
/// the wire as `0x0210`. Parsers reject values whose nibbles are not digits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bcd16(pub(crate) u16);

impl Bcd16 {
    /// Unpack the digits, most significant first.
    pub fn to_digits(self) -> [u8; 4] {
        let mut digits = [0u8; 4];
        for (position, digit) in digits.iter_mut().enumerate() {
            *digit = ((self.0 >> (12 - 4 * position)) & 0xF) as u8;
        }
        digits
    }

    /// Raw value, as it appears on the wire
    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub(crate) fn is_valid(value: u16) -> bool {
        let mut rest = value;
        for _ in 0..4 {
            if rest & 0xF > 9 {
                return false;
            }
            rest >>= 4;
        }
        true
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Bcd16 {
    fn format(&self, fmt: defmt::Formatter) {
        let [thousands, hundreds, tens, ones] = self.to_digits();
        defmt::write!(fmt, "{}{}{}{}", thousands, hundreds, tens, ones)
    }
}

/// Bus speed signalled when a port connects
///
/// Only the USB 1.x speeds appear here: the downstream port this stack
/// drives does not perform the high-speed chirp handshake.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionSpeed {
    /// 1.5 Mbit/s, the classic keyboard and mouse rate
    Low,
    /// 12 Mbit/s
    Full,
}

/// Transfer type carried in the low two bits of an endpoint attribute byte
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// The 8-byte header that starts every control transfer
///
/// Built with [`SetupPacket::new`] when acting as host, recovered from wire
/// bytes with [`SetupPacket::parse`] when acting as device. The fields are
/// public so [`crate::hal::UsbHardware`] implementations can serialize them,
/// but they are meant to be read, not mutated in place.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Construct a setup packet for a control transfer
    ///
    /// `direction`, `request_type` and `recipient` are packed into the
    /// `bmRequestType` byte. `request` and `value` mean whatever the
    /// governing document says they mean: USB 2.0 chapter 9 for standard
    /// requests, the class specification for class requests, the vendor's
    /// datasheet for vendor requests. `index` names the addressed interface
    /// or endpoint when the recipient is one of those, and `length` is the
    /// byte count of the data stage that follows (0 for no-data requests).
    pub fn new(
        direction: UsbDirection,
        request_type: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: (recipient as u8) | ((request_type as u8) << 5) | (direction as u8),
            request,
            value,
            index,
            length,
        }
    }

    /// Parse a setup packet from its 8-byte wire representation
    ///
    /// Multi-byte fields are little-endian on the wire.
    pub fn parse(bytes: &[u8]) -> Result<Self, UsbError> {
        if bytes.len() < 8 {
            return Err(UsbError::Parse);
        }
        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    /// Wire representation of this packet
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction of the data stage (bit 7 of `bmRequestType`)
    pub fn direction(&self) -> UsbDirection {
        self.request_type.into()
    }

    /// Kind of request (bits 6-5 of `bmRequestType`)
    pub fn request_kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    /// Recipient of the request (bits 4-0 of `bmRequestType`)
    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0b11111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }
}

/// Error type shared by all public entry points
///
/// `InvalidParam`, `NotFound`, `AlreadyExists` and `NoMemory` are immediate
/// answers to registry and configuration calls. The transfer-shaped variants
/// (`TransferTimeout`, `Stall`, `BufferOverflow`) are produced when a hardware
/// operation fails; the enumerator counts them against its retry budget, the
/// device dispatcher answers them with a STALL on the wire.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Caller violated an API precondition
    InvalidParam,
    /// Lookup miss
    NotFound,
    /// Unique-key collision in a registry
    AlreadyExists,
    /// Registry full or descriptor buffer exhausted
    NoMemory,
    /// Operation attempted before initialization, or before enumeration completed
    NotReady,
    /// The hardware timed out performing a transfer
    TransferTimeout,
    /// The peer refused the request
    Stall,
    /// Descriptor payload exceeds local capacity
    BufferOverflow,
    /// Malformed descriptor data
    Parse,
    /// An internal invariant did not hold
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb_device::control::Request;

    #[test]
    fn test_setup_new() {
        // GET_DESCRIPTOR(DEVICE) as issued by the enumerator
        let packet = SetupPacket::new(
            UsbDirection::In,
            RequestType::Standard,
            Recipient::Device,
            Request::GET_DESCRIPTOR,
            0x0100,
            0,
            18,
        );
        assert_eq!(packet.request_type, 0x80);
        assert_eq!(packet.request, 0x06);
        assert_eq!(packet.value, 0x0100);
        assert_eq!(packet.index, 0);
        assert_eq!(packet.length, 18);
    }

    #[test]
    fn test_setup_roundtrip() {
        let packet = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            0x09,
            0x0200,
            1,
            1,
        );
        assert_eq!(packet.request_type, 0x21);
        let bytes = packet.to_bytes();
        assert_eq!(bytes, [0x21, 0x09, 0x00, 0x02, 0x01, 0x00, 0x01, 0x00]);
        assert_eq!(SetupPacket::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_setup_decomposition() {
        let packet = SetupPacket::parse(&[0xA1, 0x01, 0x00, 0x01, 0x02, 0x00, 0x08, 0x00]).unwrap();
        assert!(matches!(packet.direction(), UsbDirection::In));
        assert!(matches!(packet.request_kind(), RequestType::Class));
        assert!(matches!(packet.recipient(), Recipient::Interface));
        assert_eq!(packet.index, 2);
    }

    #[test]
    fn test_setup_parse_short() {
        assert_eq!(SetupPacket::parse(&[0x80, 0x06]), Err(UsbError::Parse));
    }

    #[test]
    fn test_bcd_digits() {
        assert_eq!(Bcd16(0x0210).to_digits(), [0, 2, 1, 0]);
        assert_eq!(Bcd16(0x9081).to_digits(), [9, 0, 8, 1]);
    }

    #[test]
    fn test_bcd_is_valid() {
        assert!(Bcd16::is_valid(0x0200));
        assert!(Bcd16::is_valid(0x9999));
        // a nibble above 9 anywhere spoils the value
        assert!(!Bcd16::is_valid(0xA000));
        assert!(!Bcd16::is_valid(0x00B0));
        assert!(!Bcd16::is_valid(0x0F09));
    }
}
