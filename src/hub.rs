//! External hub class driver (USB class 0x09).
//!
//! A [`HubDriver`] instance is registered in the client-driver table like
//! any other class driver. For each enumerated hub it fetches the hub
//! descriptor, powers the ports, then polls the status-change interrupt
//! endpoint; per-port connect/reset sequences feed freshly enabled ports
//! back into the host's enumeration machine. All class-specific requests of
//! one hub reuse a single pending-request slot, so at most one is
//! outstanding per hub at any time.

use tracing::{debug, trace, warn};

use crate::client::{ClientDriver, DeviceStatus, DriverEvent, DriverOwner, HostServices};
use crate::usb::{
    SetupPacket, UsbSpeed, DESC_ENDPOINT, DESC_HUB, DESC_INTERFACE, CLASS_HUB,
    REQ_CLEAR_FEATURE, REQ_GET_DESCRIPTOR, REQ_GET_STATUS, REQ_SET_FEATURE,
    SETUP_DEVICE_TO_HOST, SETUP_HOST_TO_DEVICE, SETUP_RECIPIENT_DEVICE, SETUP_RECIPIENT_OTHER,
    SETUP_TYPE_CLASS,
};

/// Bounded hub instance table; one tier of external hubs.
pub const MAX_HUBS: usize = 2;

// Hub class feature selectors (USB 2.0 table 11-17).
const FEAT_PORT_ENABLE: u16 = 1;
const FEAT_PORT_RESET: u16 = 4;
const FEAT_PORT_POWER: u16 = 8;
const FEAT_C_PORT_CONNECTION: u16 = 16;
const FEAT_C_PORT_RESET: u16 = 20;

bitflags::bitflags! {
    /// wPortStatus bits of GET_STATUS(port).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PortStatus: u16 {
        const CONNECTION   = 1 << 0;
        const ENABLE       = 1 << 1;
        const SUSPEND      = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET        = 1 << 4;
        const POWER        = 1 << 8;
        const LOW_SPEED    = 1 << 9;
        const HIGH_SPEED   = 1 << 10;
    }

    /// wPortChange bits of GET_STATUS(port).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PortChange: u16 {
        const CONNECTION   = 1 << 0;
        const ENABLE       = 1 << 1;
        const SUSPEND      = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET        = 1 << 4;
    }
}

/// Per-hub state machine position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HubState {
    WaitHubDescriptor,
    /// One SET_FEATURE(PORT_POWER) per port, walking 1..=num_ports.
    WaitPortPower,
    /// Issue the status-change interrupt IN read from the poll loop.
    RequestStatusChange,
    WaitStatusChange,
    WaitPortStatus,
    WaitPortReset,
    WaitClearResetChange,
    WaitClearConnectChange,
    /// Unsupported-device path: the port is being disabled.
    WaitClearPortEnable,
    /// A class request is staged in the pending slot, to be issued from the
    /// poll loop.
    RequestCommand,
    WaitCommand,
    /// Hand the current port to the host's enumeration entry point.
    RequestAttachDevice,
    WaitDeviceEnumerated,
}

/// Bookkeeping for one enumerated hub.
struct HubInstance {
    address: u8,
    driver_id: u8,
    num_ports: u8,
    /// Status-change interrupt IN endpoint and its max packet size.
    interrupt_ep: u8,
    interrupt_max_packet: u16,
    state: HubState,
    /// The single reusable class-request slot: the SETUP packet and the
    /// state to enter once it completes.
    pending: Option<(SetupPacket, HubState)>,
    /// Aggregated status-change bitmap (bit N = port N).
    change_bitmap: u32,
    current_port: u8,
    port_status: PortStatus,
    port_change: PortChange,
    /// Power-on-to-power-good delay from the hub descriptor, in ms.
    power_good_ms: u16,
    /// Countdown holding off port polling after a reset.
    wait_timer_ms: u16,
    /// Device address occupying each port, index 0 unused.
    port_device: Vec<u8>,
}

impl HubInstance {
    fn set_feature(&mut self, feature: u16, port: u16, next: HubState) {
        self.stage_request(REQ_SET_FEATURE, feature, port, 0, next);
    }

    fn clear_feature(&mut self, feature: u16, port: u16, next: HubState) {
        self.stage_request(REQ_CLEAR_FEATURE, feature, port, 0, next);
    }

    fn get_status(&mut self, port: u16, next: HubState) {
        self.stage_request(REQ_GET_STATUS, 0, port, 4, next);
    }

    /// Stages one class request in the pending slot. Recipient is the hub
    /// itself for port 0, otherwise the port.
    fn stage_request(&mut self, request: u8, value: u16, port: u16, length: u16, next: HubState) {
        let direction = if request == REQ_GET_STATUS {
            SETUP_DEVICE_TO_HOST
        } else {
            SETUP_HOST_TO_DEVICE
        };
        let recipient = if port == 0 {
            SETUP_RECIPIENT_DEVICE
        } else {
            SETUP_RECIPIENT_OTHER
        };
        self.pending = Some((
            SetupPacket {
                request_type: direction | SETUP_TYPE_CLASS | recipient,
                request,
                value,
                index: port,
                length,
            },
            next,
        ));
        self.state = HubState::RequestCommand;
    }
}

/// Assembles the little-endian status-change bitmap out of the interrupt
/// endpoint's payload (up to 31 ports in 4 bytes).
fn assemble_change_bitmap(data: &[u8]) -> u32 {
    data.iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | (u32::from(b) << (8 * i)))
}

/// Walks a configuration descriptor for the hub interface's interrupt IN
/// endpoint. Returns (endpoint address, max packet size).
fn find_status_change_endpoint(config: &[u8]) -> Option<(u8, u16)> {
    let mut index = 0usize;
    let mut in_hub_interface = false;
    while index + 2 <= config.len() {
        let len = config[index] as usize;
        if len == 0 || index + len > config.len() {
            return None;
        }
        match config[index + 1] {
            DESC_INTERFACE if len >= 9 => {
                in_hub_interface = config[index + 5] == CLASS_HUB;
            }
            DESC_ENDPOINT if in_hub_interface && len >= 7 => {
                let address = config[index + 2];
                let attributes = config[index + 3];
                if attributes & 0x03 == 0x03 && address & 0x80 != 0 {
                    let max_packet = u16::from_le_bytes([config[index + 4], config[index + 5]]);
                    return Some((address, max_packet));
                }
            }
            _ => {}
        }
        index += len;
    }
    None
}

/// The hub class driver. Registered once; services every enumerated hub up
/// to [`MAX_HUBS`].
#[derive(Default)]
pub struct HubDriver {
    instances: Vec<HubInstance>,
}

impl HubDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn instance_mut(&mut self, address: u8) -> Option<&mut HubInstance> {
        self.instances.iter_mut().find(|i| i.address == address)
    }

    fn on_transfer(
        &mut self,
        services: &mut dyn HostServices,
        address: u8,
        data: &[u8],
    ) -> bool {
        let Some(hub) = self.instance_mut(address) else {
            return true;
        };

        // WaitCommand re-dispatches into the follow-up state with the same
        // completion, so a staged request's result is handled in one pass.
        loop {
            match hub.state {
                HubState::WaitHubDescriptor => {
                    if data.len() < 6 {
                        warn!(address, "short hub descriptor");
                        hub.state = HubState::RequestStatusChange;
                        return true;
                    }
                    hub.num_ports = data[2];
                    // bPwrOn2PwrGood is in 2 ms units; slow hubs under-report,
                    // so anything below 50 is rounded up before doubling.
                    hub.power_good_ms = u16::from(data[5].max(50)) * 2;
                    hub.port_device = vec![0; hub.num_ports as usize + 1];
                    debug!(address, ports = hub.num_ports, "hub descriptor read");
                    if hub.num_ports > 0 {
                        hub.current_port = 1;
                        hub.set_feature(FEAT_PORT_POWER, 1, HubState::WaitPortPower);
                    } else {
                        hub.state = HubState::RequestStatusChange;
                    }
                    return true;
                }

                HubState::WaitPortPower => {
                    hub.current_port += 1;
                    if hub.current_port <= hub.num_ports {
                        let port = u16::from(hub.current_port);
                        hub.set_feature(FEAT_PORT_POWER, port, HubState::WaitPortPower);
                    } else {
                        hub.state = HubState::RequestStatusChange;
                    }
                    return true;
                }

                HubState::WaitStatusChange => {
                    hub.change_bitmap = assemble_change_bitmap(data);
                    trace!(address, bitmap = hub.change_bitmap, "status change");
                    self::scan_changes(hub);
                    return true;
                }

                HubState::WaitPortStatus => {
                    if data.len() < 4 {
                        hub.state = HubState::RequestStatusChange;
                        return true;
                    }
                    hub.port_status =
                        PortStatus::from_bits_truncate(u16::from_le_bytes([data[0], data[1]]));
                    hub.port_change =
                        PortChange::from_bits_truncate(u16::from_le_bytes([data[2], data[3]]));
                    self::handle_port_status(hub);
                    return true;
                }

                HubState::WaitPortReset => {
                    // Reset signalling started; hold off until the hub's
                    // power-good time before polling the result.
                    let port = u16::from(hub.current_port);
                    hub.get_status(port, HubState::WaitPortStatus);
                    hub.wait_timer_ms = hub.power_good_ms;
                    return true;
                }

                HubState::WaitClearResetChange => {
                    let port = u16::from(hub.current_port);
                    hub.clear_feature(
                        FEAT_C_PORT_CONNECTION,
                        port,
                        HubState::WaitClearConnectChange,
                    );
                    return true;
                }

                HubState::WaitClearConnectChange => {
                    let live = PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::POWER;
                    if hub.port_status.contains(live) {
                        hub.state = HubState::RequestAttachDevice;
                    } else {
                        // The port lost its device: detach whatever occupied
                        // it and resume watching for changes.
                        let port = hub.current_port as usize;
                        let gone = hub.port_device.get(port).copied().unwrap_or(0);
                        let hub_address = hub.address;
                        if let Some(entry) = hub.port_device.get_mut(port) {
                            *entry = 0;
                        }
                        hub.state = HubState::RequestStatusChange;
                        services.detach_on_hub(hub_address, gone);
                    }
                    return true;
                }

                HubState::WaitClearPortEnable => {
                    debug!(
                        address,
                        port = hub.current_port,
                        "port disabled after unsupported device"
                    );
                    let port = hub.current_port as usize;
                    if let Some(entry) = hub.port_device.get_mut(port) {
                        *entry = 0;
                    }
                    hub.state = HubState::RequestStatusChange;
                    return true;
                }

                HubState::WaitCommand => {
                    let Some((_, next)) = hub.pending.take() else {
                        hub.state = HubState::RequestStatusChange;
                        return true;
                    };
                    hub.state = next;
                    // Fall through so the follow-up state sees this
                    // completion's data.
                    continue;
                }

                _ => return true,
            }
        }
    }
}

/// Picks the lowest changed port out of the bitmap and requests its status;
/// ports without a changed bit are untouched this cycle.
fn scan_changes(hub: &mut HubInstance) {
    hub.current_port = 0;
    for port in 1..=hub.num_ports {
        let bit = 1u32 << port;
        if hub.change_bitmap & bit != 0 {
            hub.change_bitmap ^= bit;
            hub.current_port = port;
            break;
        }
    }
    if hub.current_port > 0 {
        let port = u16::from(hub.current_port);
        hub.get_status(port, HubState::WaitPortStatus);
    } else {
        hub.state = HubState::RequestStatusChange;
    }
}

/// The per-port decision tree on a fresh GET_STATUS(port) result.
fn handle_port_status(hub: &mut HubInstance) {
    let status = hub.port_status;
    let change = hub.port_change;
    let port = u16::from(hub.current_port);

    let gate = PortStatus::CONNECTION
        | PortStatus::ENABLE
        | PortStatus::SUSPEND
        | PortStatus::RESET
        | PortStatus::POWER;
    let masked = status & gate;

    if status.contains(PortStatus::RESET) {
        // Reset still signalling; poll again.
        hub.get_status(port, HubState::WaitPortStatus);
    } else if masked == PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::POWER {
        let reset_done = change.contains(PortChange::CONNECTION | PortChange::RESET)
            && !change.contains(PortChange::ENABLE)
            && !change.contains(PortChange::SUSPEND);
        if hub.wait_timer_ms == 0 && reset_done {
            // Enabled after the reset we requested: acknowledge the change
            // bits, then hand the port over for enumeration.
            hub.clear_feature(FEAT_C_PORT_RESET, port, HubState::WaitClearResetChange);
        } else {
            hub.get_status(port, HubState::WaitPortStatus);
        }
    } else if masked == PortStatus::CONNECTION | PortStatus::POWER {
        if change.contains(PortChange::CONNECTION) {
            // Newly connected but not yet enabled: reset it.
            hub.set_feature(FEAT_PORT_RESET, port, HubState::WaitPortReset);
        } else {
            hub.get_status(port, HubState::WaitPortStatus);
        }
    } else if masked == PortStatus::POWER {
        if change.contains(PortChange::CONNECTION) {
            // Disconnected: acknowledge, then notify the detach.
            hub.clear_feature(FEAT_C_PORT_CONNECTION, port, HubState::WaitClearConnectChange);
        } else {
            hub.state = HubState::RequestStatusChange;
        }
    } else {
        hub.state = HubState::RequestStatusChange;
    }
}

impl ClientDriver for HubDriver {
    fn initialize(
        &mut self,
        services: &mut dyn HostServices,
        address: u8,
        _flags: u32,
        driver_id: u8,
    ) -> bool {
        if self.instance_mut(address).is_some() {
            return true;
        }
        if self.instances.len() >= MAX_HUBS {
            warn!(address, "hub table full");
            return false;
        }

        let Some(config) = services.configuration_descriptor(address) else {
            return false;
        };
        let Some((interrupt_ep, interrupt_max_packet)) = find_status_change_endpoint(config)
        else {
            warn!(address, "hub has no status-change endpoint");
            return false;
        };

        // Hub descriptor header first; the port count and power-good time
        // live in the first 8 bytes.
        let setup = SetupPacket {
            request_type: SETUP_DEVICE_TO_HOST | SETUP_TYPE_CLASS | SETUP_RECIPIENT_DEVICE,
            request: REQ_GET_DESCRIPTOR,
            value: u16::from(DESC_HUB) << 8,
            index: 0,
            length: 8,
        };
        if services
            .issue_control(address, setup, None, DriverOwner::Client(driver_id))
            .is_err()
        {
            return false;
        }

        debug!(address, endpoint = interrupt_ep, "hub attached");
        self.instances.push(HubInstance {
            address,
            driver_id,
            num_ports: 0,
            interrupt_ep,
            interrupt_max_packet,
            state: HubState::WaitHubDescriptor,
            pending: None,
            change_bitmap: 0,
            current_port: 0,
            port_status: PortStatus::default(),
            port_change: PortChange::default(),
            power_good_ms: 100,
            wait_timer_ms: 0,
            port_device: Vec::new(),
        });
        true
    }

    fn event(
        &mut self,
        services: &mut dyn HostServices,
        address: u8,
        event: &DriverEvent<'_>,
    ) -> bool {
        match event {
            DriverEvent::TransferComplete { data, .. } => {
                self.on_transfer(services, address, data)
            }
            DriverEvent::BusError { endpoint, .. } => {
                // Clear the latch and fall back to watching for changes;
                // the next poll re-issues the read.
                let _ = services.clear_endpoint_errors(address, *endpoint);
                if let Some(hub) = self.instance_mut(address) {
                    hub.state = HubState::RequestStatusChange;
                }
                true
            }
            DriverEvent::PortDeviceFailed { .. } => {
                let Some(hub) = self.instance_mut(address) else {
                    return true;
                };
                let port = u16::from(hub.current_port);
                hub.clear_feature(FEAT_PORT_ENABLE, port, HubState::WaitClearPortEnable);
                true
            }
            DriverEvent::Detach => {
                self.instances.retain(|i| i.address != address);
                true
            }
            _ => true,
        }
    }

    fn poll(&mut self, services: &mut dyn HostServices) {
        for hub in &mut self.instances {
            if hub.wait_timer_ms != 0 {
                continue;
            }
            match hub.state {
                HubState::RequestStatusChange => {
                    let len = usize::from(hub.interrupt_max_packet).clamp(1, 4);
                    if services
                        .interrupt_in(hub.address, hub.interrupt_ep, len)
                        .is_ok()
                    {
                        hub.state = HubState::WaitStatusChange;
                    }
                }
                HubState::RequestCommand => {
                    let Some((setup, _)) = hub.pending else {
                        hub.state = HubState::RequestStatusChange;
                        continue;
                    };
                    if services
                        .issue_control(
                            hub.address,
                            setup,
                            None,
                            DriverOwner::Client(hub.driver_id),
                        )
                        .is_ok()
                    {
                        hub.state = HubState::WaitCommand;
                    }
                }
                HubState::RequestAttachDevice => {
                    let speed = if hub.port_status.contains(PortStatus::LOW_SPEED) {
                        UsbSpeed::Low
                    } else {
                        UsbSpeed::Full
                    };
                    if services.attach_on_hub(hub.address, hub.current_port, speed) {
                        hub.state = HubState::WaitDeviceEnumerated;
                    }
                }
                HubState::WaitDeviceEnumerated => {
                    if let DeviceStatus::Running { address } = services.device_status() {
                        let port = hub.current_port as usize;
                        if let Some(entry) = hub.port_device.get_mut(port) {
                            *entry = address;
                        }
                        debug!(
                            hub = hub.address,
                            port = hub.current_port,
                            device = address,
                            "downstream device enumerated"
                        );
                        hub.state = HubState::RequestStatusChange;
                    }
                }
                _ => {}
            }
        }
    }

    fn tick_1ms(&mut self) {
        for hub in &mut self.instances {
            hub.wait_timer_ms = hub.wait_timer_ms.saturating_sub(1);
        }
    }
}
