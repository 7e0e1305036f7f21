//! Scripted mock hardware for tests
//!
//! [`ScriptedHw`] implements [`UsbHardware`] against canned responses: tests
//! queue up control-transfer results and hardware events, run the core, then
//! assert on the recorded call trace. The clock is manual, so timeout
//! behaviour is tested without waiting.

use std::collections::VecDeque;
use std::vec::Vec;

use crate::hal::{DataStage, Duration, HalError, Instant, RawEvent, UsbHardware};
use crate::types::SetupPacket;

/// One recorded hardware call
#[derive(Clone, Debug, PartialEq)]
pub enum HwCall {
    ResetBus,
    EnableHost,
    EnableDevice,
    HostControl {
        setup: SetupPacket,
        data: Vec<u8>,
    },
    HostInterruptIn {
        endpoint: u8,
    },
    HostInterruptOut {
        endpoint: u8,
        data: Vec<u8>,
    },
    DeviceSendEp0(Vec<u8>),
    DeviceRecvEp0 {
        length: usize,
    },
    DeviceInterruptIn {
        endpoint: u8,
        data: Vec<u8>,
    },
    DeviceInterruptOut {
        endpoint: u8,
    },
    SetDescriptors {
        device: Vec<u8>,
        configuration: Vec<u8>,
    },
    SetHidReportDescriptor(Vec<u8>),
    SetStringDescriptor(u8),
    ConfigureInterface {
        interface: u8,
        class: u8,
        subclass: u8,
        protocol: u8,
    },
    ConfigureEndpoint {
        interface: u8,
        address: u8,
    },
    EndpointEnable {
        address: u8,
        enabled: bool,
    },
    EndpointStall {
        address: u8,
        stalled: bool,
    },
    DeviceReset,
}

/// Mock [`UsbHardware`] driven by scripts
pub struct ScriptedHw {
    /// Every hardware call, in order
    pub calls: Vec<HwCall>,
    /// Events returned from `poll_event`, front first
    pub events: VecDeque<RawEvent>,
    /// Responses for `host_control`, front first. An empty script answers
    /// `TransferTimeout`.
    pub control_script: VecDeque<Result<Vec<u8>, HalError>>,
    /// Responses for `host_interrupt_in`, front first. An empty script
    /// answers `Ok(0)` (NAK).
    pub interrupt_in_script: VecDeque<Result<Vec<u8>, HalError>>,
    /// Payloads delivered by `device_recv_ep0` for non-empty buffers
    pub ep0_out_script: VecDeque<Vec<u8>>,
    /// Payloads delivered by `device_interrupt_out`
    pub interrupt_out_script: VecDeque<Vec<u8>>,
    /// Result of descriptor-push operations
    pub set_descriptor_result: Result<(), HalError>,
    /// The manual clock
    pub now: Instant,
}

impl Default for ScriptedHw {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedHw {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            events: VecDeque::new(),
            control_script: VecDeque::new(),
            interrupt_in_script: VecDeque::new(),
            ep0_out_script: VecDeque::new(),
            interrupt_out_script: VecDeque::new(),
            set_descriptor_result: Ok(()),
            now: Instant::from_ticks(0),
        }
    }

    pub fn push_event(&mut self, event: RawEvent) {
        self.events.push_back(event);
    }

    pub fn advance_ms(&mut self, millis: u64) {
        self.now = self.now + Duration::millis(millis);
    }

    /// All `host_control` calls with their OUT payloads
    pub fn host_control_calls(&self) -> Vec<(SetupPacket, Vec<u8>)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                HwCall::HostControl { setup, data } => Some((*setup, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// All payloads sent on the device-role control endpoint
    pub fn ep0_sends(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                HwCall::DeviceSendEp0(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of times EP0 was stalled
    pub fn ep0_stall_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    HwCall::EndpointStall {
                        address: 0,
                        stalled: true
                    }
                )
            })
            .count()
    }
}

impl UsbHardware for ScriptedHw {
    fn reset_bus(&mut self) {
        self.calls.push(HwCall::ResetBus);
    }

    fn enable_host(&mut self) {
        self.calls.push(HwCall::EnableHost);
    }

    fn enable_device(&mut self) {
        self.calls.push(HwCall::EnableDevice);
    }

    fn host_control(
        &mut self,
        setup: &SetupPacket,
        data: DataStage<'_>,
    ) -> Result<usize, HalError> {
        let out_payload = match &data {
            DataStage::Out(bytes) => bytes.to_vec(),
            _ => Vec::new(),
        };
        self.calls.push(HwCall::HostControl {
            setup: *setup,
            data: out_payload,
        });
        match self.control_script.pop_front() {
            None => Err(HalError::TransferTimeout),
            Some(Err(error)) => Err(error),
            Some(Ok(response)) => match data {
                DataStage::In(buffer) => {
                    let n = response.len().min(buffer.len());
                    buffer[..n].copy_from_slice(&response[..n]);
                    Ok(n)
                }
                DataStage::Out(bytes) => Ok(bytes.len()),
                DataStage::None => Ok(0),
            },
        }
    }

    fn host_interrupt_in(&mut self, endpoint: u8, buffer: &mut [u8]) -> Result<usize, HalError> {
        self.calls.push(HwCall::HostInterruptIn { endpoint });
        match self.interrupt_in_script.pop_front() {
            None => Ok(0),
            Some(Err(error)) => Err(error),
            Some(Ok(response)) => {
                let n = response.len().min(buffer.len());
                buffer[..n].copy_from_slice(&response[..n]);
                Ok(n)
            }
        }
    }

    fn host_interrupt_out(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, HalError> {
        self.calls.push(HwCall::HostInterruptOut {
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn device_send_ep0(&mut self, data: &[u8]) -> Result<usize, HalError> {
        self.calls.push(HwCall::DeviceSendEp0(data.to_vec()));
        Ok(data.len())
    }

    fn device_recv_ep0(&mut self, buffer: &mut [u8]) -> Result<usize, HalError> {
        self.calls.push(HwCall::DeviceRecvEp0 {
            length: buffer.len(),
        });
        if buffer.is_empty() {
            // zero-length status stage
            return Ok(0);
        }
        match self.ep0_out_script.pop_front() {
            None => Ok(0),
            Some(payload) => {
                let n = payload.len().min(buffer.len());
                buffer[..n].copy_from_slice(&payload[..n]);
                Ok(n)
            }
        }
    }

    fn device_interrupt_in(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, HalError> {
        self.calls.push(HwCall::DeviceInterruptIn {
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn device_interrupt_out(&mut self, endpoint: u8, buffer: &mut [u8]) -> Result<usize, HalError> {
        self.calls.push(HwCall::DeviceInterruptOut { endpoint });
        match self.interrupt_out_script.pop_front() {
            None => Ok(0),
            Some(payload) => {
                let n = payload.len().min(buffer.len());
                buffer[..n].copy_from_slice(&payload[..n]);
                Ok(n)
            }
        }
    }

    fn set_descriptors(&mut self, device: &[u8], configuration: &[u8]) -> Result<(), HalError> {
        self.calls.push(HwCall::SetDescriptors {
            device: device.to_vec(),
            configuration: configuration.to_vec(),
        });
        self.set_descriptor_result
    }

    fn set_hid_report_descriptor(&mut self, data: &[u8]) -> Result<(), HalError> {
        self.calls.push(HwCall::SetHidReportDescriptor(data.to_vec()));
        self.set_descriptor_result
    }

    fn set_string_descriptor(&mut self, index: u8, _data: &[u8]) -> Result<(), HalError> {
        self.calls.push(HwCall::SetStringDescriptor(index));
        self.set_descriptor_result
    }

    fn device_configure_interface(
        &mut self,
        interface: u8,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Result<(), HalError> {
        self.calls.push(HwCall::ConfigureInterface {
            interface,
            class,
            subclass,
            protocol,
        });
        Ok(())
    }

    fn device_configure_endpoint(
        &mut self,
        interface: u8,
        address: u8,
        _attributes: u8,
        _max_packet_size: u16,
        _interval: u8,
    ) -> Result<(), HalError> {
        self.calls
            .push(HwCall::ConfigureEndpoint { interface, address });
        Ok(())
    }

    fn device_endpoint_enable(&mut self, address: u8, enabled: bool) -> Result<(), HalError> {
        self.calls.push(HwCall::EndpointEnable { address, enabled });
        Ok(())
    }

    fn device_endpoint_stall(&mut self, address: u8, stalled: bool) -> Result<(), HalError> {
        self.calls.push(HwCall::EndpointStall { address, stalled });
        Ok(())
    }

    fn device_reset(&mut self) -> Result<(), HalError> {
        self.calls.push(HwCall::DeviceReset);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<RawEvent> {
        self.events.pop_front()
    }

    fn now(&self) -> Instant {
        self.now
    }
}
