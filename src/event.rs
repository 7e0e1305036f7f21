//! Event delivery between the hardware, the core, and interface handlers
//!
//! This is not a general pub/sub bus. It covers exactly two delivery shapes:
//!
//! 1. fire-and-forget notification of at most one matching handler
//!    ([`notify`]), used for interface-enabled/disabled and endpoint data;
//! 2. request/response delivery of a control request to the handler owning
//!    an interface ([`notify_with_response`]), with a bounded asynchronous
//!    completion protocol driven by the device dispatcher.
//!
//! Handlers are trait objects passed into [`crate::UsbCore::task`] each tick;
//! nothing here stores a handler, so re-entrant delivery cannot happen.

use crate::types::{SetupPacket, UsbError};

/// Events delivered through the core
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbEvent {
    /// A downstream device completed enumeration (host role)
    DeviceAttached,
    /// The downstream device went away (host role)
    DeviceDetached,
    /// An upstream host connected (device role)
    HostConnected,
    /// The upstream host disconnected (device role)
    HostDisconnected,
    /// A device-mode interface was registered
    InterfaceEnabled(u8),
    /// A device-mode interface was removed
    InterfaceDisabled(u8),
    /// Data arrived on a device-mode OUT endpoint
    EndpointData { endpoint: u8 },
    /// A class or vendor control request arrived
    ControlRequest { setup: SetupPacket },
}

pub(crate) const EVENT_QUEUE_DEPTH: usize = 16;

/// Fixed-size FIFO between event producers and the polling context.
///
/// Overflow drops the newest event; the queue is drained every
/// [`crate::UsbCore::task`] tick, so sustained overflow means the application
/// is not calling `task` often enough.
pub(crate) struct EventQueue {
    slots: [Option<UsbEvent>; EVENT_QUEUE_DEPTH],
    head: usize,
    len: usize,
}

impl EventQueue {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [None; EVENT_QUEUE_DEPTH],
            head: 0,
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, event: UsbEvent) -> bool {
        if self.len == EVENT_QUEUE_DEPTH {
            return false;
        }
        let tail = (self.head + self.len) % EVENT_QUEUE_DEPTH;
        self.slots[tail] = Some(event);
        self.len += 1;
        true
    }

    pub(crate) fn pop(&mut self) -> Option<UsbEvent> {
        if self.len == 0 {
            return None;
        }
        let event = self.slots[self.head].take();
        self.head = (self.head + 1) % EVENT_QUEUE_DEPTH;
        self.len -= 1;
        event
    }

    pub(crate) fn clear(&mut self) {
        self.slots = [None; EVENT_QUEUE_DEPTH];
        self.head = 0;
        self.len = 0;
    }
}

/// Response channel handed to an interface handler for a control request
///
/// For IN requests the handler writes the response payload through
/// [`ControlResponse::write`]; the dispatcher truncates it to the host's
/// `wLength` when sending. OUT and no-data requests need no response payload.
pub struct ControlResponse<'a> {
    buffer: &'a mut [u8],
    len: usize,
}

impl<'a> ControlResponse<'a> {
    pub(crate) fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, len: 0 }
    }

    /// Copy the response payload into the transfer buffer.
    ///
    /// Replaces anything written before. Fails with `BufferOverflow` if the
    /// payload exceeds the control buffer capacity.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), UsbError> {
        if bytes.len() > self.buffer.len() {
            return Err(UsbError::BufferOverflow);
        }
        self.buffer[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A device-mode interface handler
///
/// Implementations own all per-interface state (current report, idle rate,
/// ...). They are passed to [`crate::UsbCore::task`] as trait objects; the
/// core routes events to the handler whose [`interface`](Self::interface)
/// matches.
pub trait InterfaceHandler {
    /// The interface number this handler serves
    fn interface(&self) -> u8;

    /// A class or vendor control request arrived for this interface.
    ///
    /// `data` holds the OUT data stage payload (empty for IN and no-data
    /// requests). For IN requests the handler places its answer in
    /// `response`.
    ///
    /// Return `true` to complete the request immediately. Return `false` to
    /// answer later: the dispatcher then calls
    /// [`poll_response`](Self::poll_response) every tick until it reports
    /// completion or the control timeout expires (at which point the request
    /// is answered with a STALL).
    fn control_request(
        &mut self,
        setup: &SetupPacket,
        data: &[u8],
        response: &mut ControlResponse<'_>,
    ) -> bool;

    /// Poll an in-flight asynchronous control request.
    ///
    /// Only called after [`control_request`](Self::control_request) returned
    /// `false`, once per [`crate::UsbCore::task`] tick.
    fn poll_response(&mut self, setup: &SetupPacket, response: &mut ControlResponse<'_>) -> bool {
        let _ = (setup, response);
        false
    }

    /// The interface was registered with the core
    fn enabled(&mut self) {}

    /// The interface was removed from the core
    fn disabled(&mut self) {}

    /// Data arrived on one of this interface's OUT endpoints
    fn endpoint_data(&mut self, endpoint: u8, data: &[u8]) {
        let _ = (endpoint, data);
    }
}

/// Deliver an event to at most one matching handler.
///
/// Returns whether a handler matched.
pub(crate) fn notify(
    handlers: &mut [&mut dyn InterfaceHandler],
    interface: u8,
    event: &UsbEvent,
    data: &[u8],
) -> bool {
    let Some(handler) = handlers
        .iter_mut()
        .find(|handler| handler.interface() == interface)
    else {
        return false;
    };
    match event {
        UsbEvent::InterfaceEnabled(_) => handler.enabled(),
        UsbEvent::InterfaceDisabled(_) => handler.disabled(),
        UsbEvent::EndpointData { endpoint } => handler.endpoint_data(*endpoint, data),
        _ => return false,
    }
    true
}

/// Deliver a control request to the handler owning `interface`.
///
/// Returns `None` when no handler claims the interface, otherwise the
/// handler's verdict: `Some(true)` for synchronous completion, `Some(false)`
/// for an asynchronous response to be polled.
pub(crate) fn notify_with_response(
    handlers: &mut [&mut dyn InterfaceHandler],
    interface: u8,
    setup: &SetupPacket,
    data: &[u8],
    response: &mut ControlResponse<'_>,
) -> Option<bool> {
    handlers
        .iter_mut()
        .find(|handler| handler.interface() == interface)
        .map(|handler| handler.control_request(setup, data, response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_queue_fifo() {
        let mut queue = EventQueue::new();
        assert!(queue.pop().is_none());
        assert!(queue.push(UsbEvent::InterfaceEnabled(1)));
        assert!(queue.push(UsbEvent::InterfaceEnabled(2)));
        assert_eq!(queue.pop(), Some(UsbEvent::InterfaceEnabled(1)));
        assert_eq!(queue.pop(), Some(UsbEvent::InterfaceEnabled(2)));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_event_queue_overflow() {
        let mut queue = EventQueue::new();
        for n in 0..EVENT_QUEUE_DEPTH {
            assert!(queue.push(UsbEvent::InterfaceEnabled(n as u8)));
        }
        assert!(!queue.push(UsbEvent::HostConnected));
        assert_eq!(queue.pop(), Some(UsbEvent::InterfaceEnabled(0)));
        assert!(queue.push(UsbEvent::HostConnected));
    }

    #[test]
    fn test_control_response_write() {
        let mut buffer = [0u8; 4];
        let mut response = ControlResponse::new(&mut buffer);
        assert!(response.is_empty());
        response.write(&[1, 2, 3]).unwrap();
        assert_eq!(response.len(), 3);
        assert_eq!(
            response.write(&[0; 5]),
            Err(UsbError::BufferOverflow)
        );
        // a failed write leaves the previous payload length in place
        assert_eq!(response.len(), 3);
    }

    struct Recorder {
        interface: u8,
        enabled: usize,
        endpoint_bytes: usize,
    }

    impl InterfaceHandler for Recorder {
        fn interface(&self) -> u8 {
            self.interface
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
            self.enabled += 1;
        }
        fn endpoint_data(&mut self, _endpoint: u8, data: &[u8]) {
            self.endpoint_bytes += data.len();
        }
    }

    #[test]
    fn test_notify_matches_one_handler() {
        let mut first = Recorder {
            interface: 0,
            enabled: 0,
            endpoint_bytes: 0,
        };
        let mut second = Recorder {
            interface: 1,
            enabled: 0,
            endpoint_bytes: 0,
        };
        let mut handlers: [&mut dyn InterfaceHandler; 2] = [&mut first, &mut second];

        assert!(notify(
            &mut handlers,
            1,
            &UsbEvent::InterfaceEnabled(1),
            &[]
        ));
        assert!(notify(
            &mut handlers,
            1,
            &UsbEvent::EndpointData { endpoint: 0x02 },
            &[1, 2, 3]
        ));
        assert!(!notify(
            &mut handlers,
            7,
            &UsbEvent::InterfaceEnabled(7),
            &[]
        ));

        assert_eq!(first.enabled, 0);
        assert_eq!(second.enabled, 1);
        assert_eq!(second.endpoint_bytes, 3);
    }
}
