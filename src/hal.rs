//! Interface for dual-role USB hardware
//!
//! In order to use this crate on a given board, there must be a
//! [`UsbHardware`] implementation specific to that board.
//!
//! The trait covers both roles: the host-side controller driving the
//! downstream port, and the device-side controller facing the upstream host.
//! Boards with two controllers implement both halves on one type; a
//! single-role board may leave the other half returning
//! [`HalError::NotReady`].

use crate::types::{ConnectionSpeed, SetupPacket};

/// Milliseconds since an arbitrary epoch
pub type Instant = fugit::TimerInstantU64<1000>;
/// Millisecond duration, used for timeouts and recovery delays
pub type Duration = fugit::TimerDurationU64<1000>;

/// Data stage of a host-side control transfer
pub enum DataStage<'a> {
    /// Device-to-host data stage: received bytes land in the buffer
    In(&'a mut [u8]),
    /// Host-to-device data stage: the bytes to send
    Out(&'a [u8]),
    /// No data stage
    None,
}

/// Error taxonomy for hardware operations
///
/// The core never panics on any of these; each is converted into a
/// [`crate::UsbError`] and reported up the stack.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HalError {
    /// The controller is not in a state to perform the operation
    NotReady,
    /// The transfer did not complete within the hardware timeout
    TransferTimeout,
    /// The peer answered with a STALL handshake
    Stall,
    /// The endpoint address is not usable in this role or configuration
    InvalidEndpoint,
    /// The payload did not fit the hardware buffer
    BufferOverflow,
}

impl From<HalError> for crate::types::UsbError {
    fn from(value: HalError) -> Self {
        match value {
            HalError::NotReady => crate::types::UsbError::NotReady,
            HalError::TransferTimeout => crate::types::UsbError::TransferTimeout,
            HalError::Stall => crate::types::UsbError::Stall,
            HalError::InvalidEndpoint => crate::types::UsbError::InvalidParam,
            HalError::BufferOverflow => crate::types::UsbError::BufferOverflow,
        }
    }
}

/// Raw event reported by the hardware
///
/// The hardware ISR must not call into the core; it only records what
/// happened, and the recorded events are drained through
/// [`UsbHardware::poll_event`] from the polling context.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RawEvent {
    /// A device was attached to the downstream (host-role) port
    Attached(ConnectionSpeed),
    /// The downstream device is no longer attached
    Detached,
    /// An upstream host started driving the device-role port
    HostConnected,
    /// The upstream host went away (bus unpowered or suspended)
    HostDisconnected,
    /// A SETUP packet arrived on the device-role control endpoint
    SetupReceived(SetupPacket),
    /// Data is pending on a device-role OUT endpoint
    EndpointData { endpoint: u8 },
    /// The hardware completed a SET_CONFIGURATION internally
    ConfigurationChanged(u8),
    /// The hardware completed a SET_INTERFACE internally
    InterfaceChanged { interface: u8, alternate: u8 },
}

/// Interface for dual-role USB hardware
///
/// Host-side transfers are synchronous from the core's point of view: each
/// call performs the whole transfer (or fails) before returning, bounded by a
/// timeout internal to the implementation (customarily 5 s for control
/// transfers and 1 s for interrupt transfers). The core never re-enters the
/// hardware from within one of these calls.
pub trait UsbHardware {
    /// Drive a RESET condition on the downstream bus.
    fn reset_bus(&mut self);

    /// Enable the host-role controller.
    ///
    /// After this call the controller must detect attach/detach on the
    /// downstream port and report them through [`UsbHardware::poll_event`].
    fn enable_host(&mut self);

    /// Enable the device-role controller.
    ///
    /// After this call the controller must report upstream connection state
    /// and SETUP packets through [`UsbHardware::poll_event`].
    fn enable_device(&mut self);

    /// Perform a control transfer on the downstream port.
    ///
    /// Returns the number of bytes transferred in the data stage (0 for
    /// no-data requests).
    fn host_control(&mut self, setup: &SetupPacket, data: DataStage<'_>)
        -> Result<usize, HalError>;

    /// Poll an interrupt IN endpoint of the downstream device.
    ///
    /// `endpoint` is the endpoint address including the direction bit.
    /// Returns `Ok(0)` when the device had nothing to send (NAK).
    fn host_interrupt_in(&mut self, endpoint: u8, buffer: &mut [u8]) -> Result<usize, HalError>;

    /// Write to an interrupt OUT endpoint of the downstream device.
    fn host_interrupt_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, HalError>;

    /// Send bytes on the device-role control endpoint (IN data or status stage).
    ///
    /// An empty slice sends a zero-length packet.
    fn device_send_ep0(&mut self, data: &[u8]) -> Result<usize, HalError>;

    /// Receive bytes on the device-role control endpoint (OUT data or status stage).
    ///
    /// An empty buffer receives a zero-length packet.
    fn device_recv_ep0(&mut self, buffer: &mut [u8]) -> Result<usize, HalError>;

    /// Queue an interrupt IN transfer towards the upstream host.
    fn device_interrupt_in(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, HalError>;

    /// Read pending data from a device-role interrupt OUT endpoint.
    fn device_interrupt_out(&mut self, endpoint: u8, buffer: &mut [u8])
        -> Result<usize, HalError>;

    /// Hand the device and configuration descriptor bytes to the controller.
    fn set_descriptors(&mut self, device: &[u8], configuration: &[u8]) -> Result<(), HalError>;

    /// Hand the HID report descriptor bytes to the controller.
    fn set_hid_report_descriptor(&mut self, data: &[u8]) -> Result<(), HalError>;

    /// Hand a string descriptor to the controller.
    fn set_string_descriptor(&mut self, index: u8, data: &[u8]) -> Result<(), HalError>;

    /// Declare a device-role interface to the controller.
    fn device_configure_interface(
        &mut self,
        interface: u8,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Result<(), HalError>;

    /// Declare a device-role endpoint to the controller.
    ///
    /// `address` includes the direction bit.
    fn device_configure_endpoint(
        &mut self,
        interface: u8,
        address: u8,
        attributes: u8,
        max_packet_size: u16,
        interval: u8,
    ) -> Result<(), HalError>;

    /// Enable or disable a device-role endpoint.
    fn device_endpoint_enable(&mut self, address: u8, enabled: bool) -> Result<(), HalError>;

    /// Set or clear the STALL condition on a device-role endpoint.
    ///
    /// Address 0 stalls the control endpoint, which is how the core refuses
    /// requests it cannot serve.
    fn device_endpoint_stall(&mut self, address: u8, stalled: bool) -> Result<(), HalError>;

    /// Disconnect and reconnect the device-role port.
    ///
    /// The upstream host observes a detach and re-enumerates, picking up any
    /// changed descriptors.
    fn device_reset(&mut self) -> Result<(), HalError>;

    /// Fetch the next pending hardware event, if any.
    ///
    /// This is called repeatedly from [`crate::UsbCore::task`]; the
    /// implementation drains whatever its ISR recorded since the last call.
    fn poll_event(&mut self) -> Option<RawEvent>;

    /// Current time, used for recovery delays and control-response deadlines.
    fn now(&self) -> Instant;
}
