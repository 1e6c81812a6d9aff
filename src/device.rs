//! Attached-device bookkeeping: the bounded address table and the owned
//! descriptor/interface/endpoint tree built during configuration.
//!
//! Ownership is strictly tree-shaped: a [`DeviceSlot`] owns its descriptor
//! blobs and its [`InterfaceRecord`]s, an interface owns its alternate
//! settings, a setting owns its endpoints. Clearing a slot drops the whole
//! subtree, so nothing survives a detach.

use tracing::debug;

use crate::client::DriverOwner;
use crate::error::EndpointFault;
use crate::transfer::TransferPhase;
use crate::usb::{TransferType, UsbSpeed};

/// Device address slots: slot 0 stages the not-yet-addressed device, slots
/// 1..=3 hold addressed devices (address == slot index).
pub const MAX_DEVICES: usize = 4;

/// One endpoint of the attached device, created while parsing a
/// configuration descriptor and owned by its alternate setting. All transfer
/// progress bookkeeping lives here; only the transaction engine mutates it
/// while a transfer is in flight.
#[derive(Debug)]
pub struct EndpointRecord {
    /// `bEndpointAddress`, direction bit included.
    pub address: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,

    /// Polling interval in frames, and the free-running countdown. The
    /// `interval_elapsed` latch is set for the frame in which the countdown
    /// reaches zero and reloads.
    pub interval: u16,
    pub interval_count: u16,
    pub interval_elapsed: bool,

    pub phase: TransferPhase,
    /// Next data-toggle value (false = DATA0).
    pub toggle: bool,
    /// Whether the hardware should verify received toggles. Disabled for
    /// isochronous endpoints.
    pub toggle_check: bool,

    /// Bytes moved so far in the current transfer.
    pub transferred: usize,
    /// Byte budget of the current transfer.
    pub budget: usize,
    /// SETUP stage bytes for a control transfer.
    pub setup: [u8; 8],

    pub naks: u16,
    /// NAK budget; `None` retries indefinitely.
    pub nak_limit: Option<u16>,
    /// Consecutive bus-fault count for the current transaction.
    pub errors: u8,

    pub complete: bool,
    pub successful: bool,
    pub stalled: bool,
    pub errored: bool,
    pub user_abort: bool,
    /// Set when the last attempt this frame was NAK'd; cleared each SOF so
    /// a NAK is retried at most once per frame.
    pub last_nak: bool,
    pub fault: Option<EndpointFault>,

    pub owner: DriverOwner,
    /// Staging buffer for the data stage of the current transfer.
    pub buffer: Vec<u8>,
}

impl EndpointRecord {
    pub fn new(
        address: u8,
        transfer_type: TransferType,
        max_packet_size: u16,
        interval: u16,
        owner: DriverOwner,
    ) -> Self {
        Self {
            address,
            transfer_type,
            max_packet_size,
            interval,
            interval_count: interval,
            interval_elapsed: false,
            phase: TransferPhase::Idle,
            toggle: false,
            toggle_check: true,
            transferred: 0,
            budget: 0,
            setup: [0; 8],
            naks: 0,
            nak_limit: None,
            errors: 0,
            // Starts complete so preprocessing loops see a free endpoint.
            complete: true,
            successful: false,
            stalled: false,
            errored: false,
            user_abort: false,
            last_nak: false,
            fault: None,
            owner,
            buffer: Vec::new(),
        }
    }

    /// The control endpoint the host keeps for itself, re-initialized on
    /// every attach.
    pub fn control0(nak_limit: u16) -> Self {
        let mut ep = Self::new(
            0,
            TransferType::Control,
            crate::usb::EP0_DEFAULT_MAX_PACKET,
            0,
            DriverOwner::Host,
        );
        // Catch devices that NAK forever during enumeration.
        ep.nak_limit = Some(nak_limit);
        ep
    }

    pub fn direction_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    /// Arms the record for a fresh transfer. The complete flag is left for
    /// the caller to clear last, after every other field is consistent.
    pub fn reset_for_transfer(&mut self, budget: usize) {
        self.transferred = 0;
        self.budget = budget;
        self.naks = 0;
        self.errors = 0;
        self.successful = false;
        self.user_abort = false;
        self.last_nak = false;
        self.fault = None;
    }

    /// Clears the stalled/error latches after the owning driver has dealt
    /// with the condition. Internal state only; the device is not contacted.
    pub fn clear_errors(&mut self) {
        self.stalled = false;
        self.errored = false;
        self.fault = None;
    }
}

/// One alternate setting of an interface, owning its endpoint records.
#[derive(Debug, Default)]
pub struct AltSetting {
    pub alternate: u8,
    pub endpoints: Vec<EndpointRecord>,
}

/// One interface of the selected configuration. Aggregates every alternate
/// setting seen in the descriptor; exactly one is current.
#[derive(Debug)]
pub struct InterfaceRecord {
    pub number: u8,
    /// Client driver resolved for this interface at parse time.
    pub driver: u8,
    pub settings: Vec<AltSetting>,
    pub current_setting: usize,
}

impl InterfaceRecord {
    pub fn current(&self) -> &AltSetting {
        &self.settings[self.current_setting]
    }

    pub fn current_mut(&mut self) -> &mut AltSetting {
        &mut self.settings[self.current_setting]
    }
}

/// One raw configuration descriptor retrieved during enumeration, newest
/// pushed to the front of the slot's list.
#[derive(Debug)]
pub struct ConfigurationNode {
    pub configuration_value: u8,
    pub raw: Vec<u8>,
}

/// Driver-selection flags resolved from the targeted peripheral list before
/// addressing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DriverSelection {
    /// Whole-device client driver; set when the device matched the TPL at
    /// device level. Bypasses per-interface matching.
    pub device_driver: Option<u8>,
    /// EP0-only custom driver riding alongside per-interface drivers.
    pub ep0_driver: Option<u8>,
    /// Configuration value forced by the TPL entry, if any.
    pub forced_configuration: Option<u8>,
}

/// Everything known about one attached device.
#[derive(Debug, Default)]
pub struct DeviceSlot {
    /// Assigned bus address; 0 while staged or free.
    pub address: u8,
    pub speed: UsbSpeed,
    /// Upstream hub address, 0 for the root port.
    pub hub_address: u8,
    /// Port number on the upstream hub, 0 for the root port.
    pub hub_port: u8,

    /// Raw device descriptor, owned. Empty until retrieved.
    pub device_descriptor: Vec<u8>,
    /// Configuration descriptors, newest first. Rebuilt from empty on every
    /// (re)enumeration.
    pub configurations: Vec<ConfigurationNode>,
    /// Index into `configurations` of the selected configuration.
    pub selected_configuration: Option<usize>,
    /// `bConfigurationValue` of the selected configuration.
    pub configuration_value: u8,
    /// Max power of the selected configuration, in 2 mA units.
    pub configuration_power_2ma: u8,

    pub interfaces: Vec<InterfaceRecord>,
    pub drivers: DriverSelection,
}

impl DeviceSlot {
    pub fn in_use(&self) -> bool {
        self.address != 0
    }

    pub fn selected_configuration(&self) -> Option<&ConfigurationNode> {
        self.configurations.get(self.selected_configuration?)
    }

    /// Looks up an endpoint by full `bEndpointAddress` in the current
    /// alternate setting of each interface.
    pub fn find_endpoint(&self, endpoint: u8) -> Option<&EndpointRecord> {
        self.interfaces
            .iter()
            .flat_map(|i| i.current().endpoints.iter())
            .find(|ep| ep.address == endpoint)
    }

    pub fn find_endpoint_mut(&mut self, endpoint: u8) -> Option<&mut EndpointRecord> {
        self.interfaces
            .iter_mut()
            .flat_map(|i| i.current_mut().endpoints.iter_mut())
            .find(|ep| ep.address == endpoint)
    }

    /// Resets the data toggle of every endpoint in every setting, as
    /// required after SET_CONFIGURATION and SET_INTERFACE.
    pub fn reset_all_toggles(&mut self) {
        for interface in &mut self.interfaces {
            for setting in &mut interface.settings {
                for ep in &mut setting.endpoints {
                    ep.toggle = false;
                }
            }
        }
    }

    /// Validates a SET_INTERFACE request: the interface exists, no endpoint
    /// of the current setting is mid-transfer, and the requested alternate
    /// exists. On success the current setting is switched.
    pub fn switch_alt_setting(&mut self, interface_number: u16, alternate: u16) -> bool {
        let Some(interface) = self
            .interfaces
            .iter_mut()
            .find(|i| u16::from(i.number) == interface_number)
        else {
            return false;
        };
        if interface
            .current()
            .endpoints
            .iter()
            .any(|ep| !ep.complete)
        {
            return false;
        }
        let Some(idx) = interface
            .settings
            .iter()
            .position(|s| u16::from(s.alternate) == alternate)
        else {
            return false;
        };
        interface.current_setting = idx;
        true
    }

    /// Ticks the interval countdown of every interrupt endpoint in the
    /// current settings, called once per frame. Also clears the per-frame
    /// NAK latch.
    pub fn decrement_intervals(&mut self) {
        for interface in &mut self.interfaces {
            for ep in interface.current_mut().endpoints.iter_mut() {
                if matches!(
                    ep.transfer_type,
                    TransferType::Interrupt | TransferType::Isochronous
                ) {
                    if ep.interval_count != 0 {
                        ep.interval_count -= 1;
                    }
                    ep.interval_elapsed = false;
                    if ep.interval_count == 0 {
                        ep.interval_count = ep.interval.max(1);
                        ep.interval_elapsed = true;
                    }
                }
                ep.last_nak = false;
            }
        }
    }
}

/// The bounded table of device slots.
#[derive(Debug, Default)]
pub struct DeviceTable {
    slots: [DeviceSlot; MAX_DEVICES],
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pre-address staging slot.
    pub fn staging(&self) -> &DeviceSlot {
        &self.slots[0]
    }

    pub fn staging_mut(&mut self) -> &mut DeviceSlot {
        &mut self.slots[0]
    }

    pub fn get(&self, address: u8) -> Option<&DeviceSlot> {
        let slot = self.slots.get(address as usize)?;
        (address != 0 && slot.in_use()).then_some(slot)
    }

    pub fn get_mut(&mut self, address: u8) -> Option<&mut DeviceSlot> {
        let slot = self.slots.get_mut(address as usize)?;
        (address != 0 && slot.in_use()).then_some(slot)
    }

    /// Reserves the lowest free address. The slot stays unoccupied until
    /// [`DeviceTable::promote`] moves the staged device in.
    pub fn claim_address(&self) -> Option<u8> {
        (1..MAX_DEVICES).find(|&i| !self.slots[i].in_use()).map(|i| i as u8)
    }

    /// Moves the staged device into its permanent slot after SET_ADDRESS
    /// completed. Descriptor ownership transfers; the staging slot is left
    /// cleared.
    pub fn promote(&mut self, address: u8) {
        debug_assert!((1..MAX_DEVICES).contains(&(address as usize)));
        let mut staged = std::mem::take(&mut self.slots[0]);
        staged.address = address;
        debug!(address, "device promoted out of staging slot");
        self.slots[address as usize] = staged;
    }

    /// Fully resets one slot, dropping all owned descriptor state.
    pub fn clear(&mut self, address: u8) {
        if let Some(slot) = self.slots.get_mut(address as usize) {
            *slot = DeviceSlot::default();
        }
    }

    pub fn clear_all(&mut self) {
        for slot in &mut self.slots {
            *slot = DeviceSlot::default();
        }
    }

    /// Addresses of every device currently occupying a slot, highest first
    /// (detach notifications walk newest devices first).
    pub fn occupied_addresses(&self) -> Vec<u8> {
        (1..MAX_DEVICES)
            .rev()
            .filter(|&i| self.slots[i].in_use())
            .map(|i| i as u8)
            .collect()
    }

    /// Per-frame interval service across every attached device.
    pub fn decrement_intervals(&mut self) {
        for i in 1..MAX_DEVICES {
            self.slots[i].decrement_intervals();
        }
    }
}
