//! The host context and the top-level enumeration state machine.
//!
//! [`UsbHost`] owns the HAL, the device table, the transaction engine and
//! the registered client drivers. Interrupt glue calls the `isr_*` entry
//! points; the application calls [`UsbHost::poll`] from its main loop and
//! [`UsbHost::tick_1ms`] from a millisecond tick. The enumeration machine
//! advances only when the control transfer matching its current phase
//! completes, or when an attach/detach override lands in the mailbox.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::client::{
    find_device_level_driver, ClientDriver, DeviceStatus, DriverEntry, DriverEvent, DriverOwner,
    EventHook, HostServices, TplEntry,
};
use crate::config::HostConfig;
use crate::device::{DeviceTable, EndpointRecord};
use crate::error::{HoldReason, RequestError};
use crate::hal::{HostBus, IrqSource};
use crate::parse::parse_configuration;
use crate::transfer::{CompletedTransfer, EngineCtx, TransferEngine, TransferRef};
use crate::usb::{
    DeviceDescriptor, Direction, SetupPacket, TransferType, UsbSpeed, DESC_CONFIGURATION,
    DESC_DEVICE, FEATURE_ENDPOINT_HALT, REQ_CLEAR_FEATURE, REQ_SET_INTERFACE,
    DEVICE_DESCRIPTOR_LEN,
};

/// Phase shared by every "send one command, wait, act on the result" state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandPhase {
    Send,
    Wait,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DetachedPhase {
    Initialize,
    WaitForPower,
    TurnOnPower,
    WaitForDevice,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SettlePhase {
    Start,
    Wait,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResetPhase {
    Assert,
    Wait,
    Recover,
    RecoverWait,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachedPhase {
    Settle(SettlePhase),
    ResetDevice(ResetPhase),
    GetDeviceDescriptorSize(CommandPhase),
    GetDeviceDescriptor(CommandPhase),
    ValidateVidPid,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfiguringPhase {
    InitConfiguration,
    GetConfigDescriptorSize(CommandPhase),
    GetConfigDescriptor(CommandPhase),
    SelectConfiguration,
    /// The application may hold the machine here before SET_CONFIGURATION.
    ApplicationHold,
    SetConfiguration(CommandPhase),
    InitClientDrivers,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResumePhase {
    Suspend,
    Resume,
    ResumeWait,
    Recover,
    RecoverWait,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunningPhase {
    Normal,
    SuspendResume(ResumePhase),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HoldingPhase {
    Init,
    Hold,
}

/// Top-level host state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostState {
    Detached(DetachedPhase),
    Attached(AttachedPhase),
    Addressing(CommandPhase),
    Configuring(ConfiguringPhase),
    Running(RunningPhase),
    Holding(HoldingPhase),
}

/// Outcome of polling the EP0 completion flags for the current command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CommandResult {
    Pending,
    Success,
    Failed,
}

/// Driver notifications queued for delivery outside re-entrant contexts.
#[derive(Clone, Copy, Debug)]
struct PendingNotice {
    driver: u8,
    address: u8,
    kind: NoticeKind,
}

#[derive(Clone, Copy, Debug)]
enum NoticeKind {
    Detach,
    PortDeviceFailed { device_address: u8 },
    Suspend,
    Resume,
}

/// Everything the host owns apart from the driver table. Split out so
/// driver callbacks can borrow it as `&mut dyn HostServices` while the
/// driver itself is borrowed from the table.
pub struct HostCore<B: HostBus> {
    bus: B,
    config: HostConfig,
    tpl: Vec<TplEntry>,
    hook: Box<dyn EventHook>,

    state: HostState,
    /// Single-slot override mailbox written from interrupt context; last
    /// write wins, applied at the top of the next poll.
    override_state: Option<HostState>,
    hold_reason: HoldReason,

    devices: DeviceTable,
    ep0: EndpointRecord,
    engine: TransferEngine,

    command_tries: u8,
    enumeration_tries: u8,
    /// Configuration descriptors still to fetch, counting down to 1.
    config_countdown: u8,
    /// `bLength` learned from the short device-descriptor read.
    device_desc_len: u8,
    /// (`bConfigurationValue`, `wTotalLength`) learned from the short
    /// configuration-descriptor read.
    pending_config: (u8, u16),
    /// Address reserved by SET_ADDRESS until the device is promoted.
    reserved_address: u8,
    /// Device currently serviced by the machine; 0 while staging.
    current_address: u8,
    /// One-shot millisecond countdown for the current wait state.
    timer: Option<u16>,
    root_power_good: bool,

    notices: VecDeque<PendingNotice>,
}

/// The USB host stack.
pub struct UsbHost<B: HostBus> {
    core: HostCore<B>,
    drivers: Vec<DriverEntry>,
}

impl<B: HostBus> UsbHost<B> {
    pub fn new(bus: B, config: HostConfig) -> Self {
        let ep0 = EndpointRecord::control0(config.control_nak_limit);
        let engine = TransferEngine::new(&config);
        Self {
            core: HostCore {
                bus,
                config,
                tpl: Vec::new(),
                hook: Box::new(crate::client::DefaultHook),
                state: HostState::Detached(DetachedPhase::Initialize),
                override_state: None,
                hold_reason: HoldReason::Unspecified,
                devices: DeviceTable::new(),
                ep0,
                engine,
                command_tries: config.command_retries,
                enumeration_tries: config.enumeration_retries,
                config_countdown: 0,
                device_desc_len: 0,
                pending_config: (0, 0),
                reserved_address: 0,
                current_address: 0,
                timer: None,
                root_power_good: true,
                notices: VecDeque::new(),
            },
            drivers: Vec::new(),
        }
    }

    /// Installs the targeted peripheral list.
    pub fn set_tpl(&mut self, tpl: Vec<TplEntry>) {
        self.core.tpl = tpl;
    }

    /// Installs the application policy hook.
    pub fn set_hook(&mut self, hook: Box<dyn EventHook>) {
        self.core.hook = hook;
    }

    /// Registers a client driver and returns its table index for TPL
    /// entries.
    pub fn add_driver(&mut self, entry: DriverEntry) -> u8 {
        self.drivers.push(entry);
        (self.drivers.len() - 1) as u8
    }

    pub fn state(&self) -> HostState {
        self.core.state
    }

    pub fn bus(&self) -> &B {
        &self.core.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.core.bus
    }

    /// Bookkeeping for an enumerated device.
    pub fn device_info(&self, address: u8) -> Option<&crate::device::DeviceSlot> {
        self.core.devices.get(address)
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.core.device_status()
    }

    pub fn services(&mut self) -> &mut dyn HostServices {
        &mut self.core
    }

    // ---- interrupt entry points -------------------------------------------------

    /// Attach interrupt: latches a jump into the ATTACHED state, applied at
    /// the next poll.
    pub fn isr_attach(&mut self) {
        self.core.bus.irq_control(IrqSource::ATTACH, false);
        if self.core.state == HostState::Detached(DetachedPhase::WaitForDevice) {
            self.core.override_state =
                Some(HostState::Attached(AttachedPhase::Settle(SettlePhase::Start)));
        }
    }

    /// Detach interrupt: unconditionally forces the DETACHED state at the
    /// next poll.
    pub fn isr_detach(&mut self) {
        self.core.bus.irq_control(IrqSource::DETACH, false);
        self.core.override_state = Some(HostState::Detached(DetachedPhase::Initialize));
    }

    /// Start-of-frame interrupt: re-enters the transaction engine.
    pub fn isr_sof(&mut self) {
        let core = &mut self.core;
        let mut ctx = EngineCtx {
            bus: &mut core.bus,
            devices: &mut core.devices,
            ep0: &mut core.ep0,
        };
        core.engine.on_sof(&mut ctx);
    }

    /// Transfer-done interrupt (also services the error interrupt; the HAL
    /// reports faults through the same outcome read).
    pub fn isr_transfer_complete(&mut self) {
        let core = &mut self.core;
        let mut ctx = EngineCtx {
            bus: &mut core.bus,
            devices: &mut core.devices,
            ep0: &mut core.ep0,
        };
        core.engine.on_transfer_complete(&mut ctx);
    }

    /// Millisecond tick: drives the settle/reset/resume timers and each
    /// driver's internal timers.
    pub fn tick_1ms(&mut self) {
        if let Some(remaining) = self.core.timer {
            let remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                self.core.timer = None;
                self.timer_fired();
            } else {
                self.core.timer = Some(remaining);
            }
        }
        for entry in &mut self.drivers {
            entry.driver.tick_1ms();
        }
    }

    fn timer_fired(&mut self) {
        use HostState::*;
        self.core.state = match self.core.state {
            Attached(AttachedPhase::Settle(SettlePhase::Wait)) => {
                Attached(AttachedPhase::Settle(SettlePhase::Done))
            }
            Attached(AttachedPhase::ResetDevice(ResetPhase::Wait)) => {
                Attached(AttachedPhase::ResetDevice(ResetPhase::Recover))
            }
            Attached(AttachedPhase::ResetDevice(ResetPhase::RecoverWait)) => {
                Attached(AttachedPhase::ResetDevice(ResetPhase::Done))
            }
            Running(RunningPhase::SuspendResume(ResumePhase::ResumeWait)) => {
                Running(RunningPhase::SuspendResume(ResumePhase::Recover))
            }
            Running(RunningPhase::SuspendResume(ResumePhase::RecoverWait)) => {
                Running(RunningPhase::SuspendResume(ResumePhase::Done))
            }
            other => other,
        };
    }

    // ---- cooperative task ------------------------------------------------------

    /// Runs one iteration of the host task: applies the interrupt override,
    /// routes completed transfers to their drivers, advances the
    /// enumeration machine and polls the drivers.
    pub fn poll(&mut self) {
        self.dispatch_completions();

        if let Some(next) = self.core.override_state.take() {
            debug!(?next, "interrupt override applied");
            self.core.state = next;
            self.core.timer = None;
        }

        self.step_state();
        self.dispatch_notices();
        self.poll_drivers();
    }

    fn dispatch_completions(&mut self) {
        while let Some(done) = self.core.engine.take_completion() {
            match done.owner {
                // The enumeration machine reads EP0 flags directly.
                DriverOwner::Host => {}
                DriverOwner::Client(idx) => self.deliver_completion(idx, done),
            }
        }
    }

    fn deliver_completion(&mut self, idx: u8, done: CompletedTransfer) {
        let Some(entry) = self.drivers.get_mut(idx as usize) else {
            warn!(driver = idx, "completion for unregistered driver");
            return;
        };
        let event = match done.fault {
            None => DriverEvent::TransferComplete {
                endpoint: done.endpoint,
                data: &done.data,
            },
            Some(fault) => DriverEvent::BusError {
                endpoint: done.endpoint,
                fault,
            },
        };
        entry.driver.event(&mut self.core, done.address, &event);
    }

    fn dispatch_notices(&mut self) {
        while let Some(notice) = self.core.notices.pop_front() {
            let Some(entry) = self.drivers.get_mut(notice.driver as usize) else {
                continue;
            };
            let event = match notice.kind {
                NoticeKind::Detach => DriverEvent::Detach,
                NoticeKind::PortDeviceFailed { device_address } => {
                    DriverEvent::PortDeviceFailed { device_address }
                }
                NoticeKind::Suspend => DriverEvent::Suspend,
                NoticeKind::Resume => DriverEvent::Resume,
            };
            entry.driver.event(&mut self.core, notice.address, &event);
        }
    }

    fn poll_drivers(&mut self) {
        for entry in &mut self.drivers {
            entry.driver.poll(&mut self.core);
        }
    }

    // ---- state machine ---------------------------------------------------------

    fn step_state(&mut self) {
        use HostState::*;
        match self.core.state {
            Detached(phase) => self.step_detached(phase),
            Attached(phase) => self.step_attached(phase),
            Addressing(phase) => self.step_addressing(phase),
            Configuring(phase) => self.step_configuring(phase),
            Running(phase) => self.step_running(phase),
            Holding(phase) => self.step_holding(phase),
        }
    }

    fn step_detached(&mut self, phase: DetachedPhase) {
        match phase {
            DetachedPhase::Initialize => {
                debug!("host detached, reinitializing");
                self.notify_detach_all();
                let core = &mut self.core;
                core.hook.release_power(0);
                core.bus.port_power(false);
                core.bus.enable_sof(false);
                core.bus.irq_control(IrqSource::all(), false);
                core.engine.reset();
                core.devices.clear_all();
                core.ep0 = EndpointRecord::control0(core.config.control_nak_limit);
                core.enumeration_tries = core.config.enumeration_retries;
                core.command_tries = core.config.command_retries;
                core.current_address = 0;
                core.reserved_address = 0;
                core.timer = None;
                core.state = HostState::Detached(DetachedPhase::WaitForPower);
            }
            DetachedPhase::WaitForPower => {
                if self.core.root_power_good {
                    self.core.state = HostState::Detached(DetachedPhase::TurnOnPower);
                }
            }
            DetachedPhase::TurnOnPower => {
                let core = &mut self.core;
                // 100 mA initial budget, in the hook's 2 mA units.
                if core.hook.request_power(0, 50) {
                    core.bus.port_power(true);
                    core.bus.irq_control(IrqSource::ATTACH, true);
                    core.bus.irq_control(IrqSource::TIMER_1MS, true);
                    core.state = HostState::Detached(DetachedPhase::WaitForDevice);
                } else {
                    core.root_power_good = false;
                    core.state = HostState::Detached(DetachedPhase::WaitForPower);
                }
            }
            DetachedPhase::WaitForDevice => {
                // Attach interrupt jumps out of here via the mailbox.
            }
        }
    }

    fn step_attached(&mut self, phase: AttachedPhase) {
        use AttachedPhase::*;
        match phase {
            Settle(SettlePhase::Start) => {
                let core = &mut self.core;
                core.bus.irq_control(IrqSource::DETACH, true);
                core.timer = Some(core.config.settle_ms);
                core.state = HostState::Attached(Settle(SettlePhase::Wait));
            }
            Settle(SettlePhase::Wait) => {}
            Settle(SettlePhase::Done) => {
                self.core.state = HostState::Attached(ResetDevice(ResetPhase::Assert));
            }

            ResetDevice(ResetPhase::Assert) => {
                let core = &mut self.core;
                debug!("asserting bus reset");
                core.command_tries = core.config.command_retries;
                // The device under enumeration lives in the staging slot.
                core.current_address = 0;
                core.engine.reset();
                core.devices.staging_mut().speed = core.bus.attached_speed();
                core.bus.assert_reset(true);
                core.timer = Some(core.config.reset_ms);
                core.state = HostState::Attached(ResetDevice(ResetPhase::Wait));
            }
            ResetDevice(ResetPhase::Wait) => {}
            ResetDevice(ResetPhase::Recover) => {
                let core = &mut self.core;
                core.bus.assert_reset(false);
                core.bus.enable_sof(true);
                core.timer = Some(core.config.reset_recovery_ms);
                core.state = HostState::Attached(ResetDevice(ResetPhase::RecoverWait));
            }
            ResetDevice(ResetPhase::RecoverWait) => {}
            ResetDevice(ResetPhase::Done) => {
                let core = &mut self.core;
                core.bus.irq_control(
                    IrqSource::TRANSFER | IrqSource::SOF | IrqSource::ERROR,
                    true,
                );
                core.state =
                    HostState::Attached(GetDeviceDescriptorSize(CommandPhase::Send));
            }

            GetDeviceDescriptorSize(CommandPhase::Send) => {
                let core = &mut self.core;
                core.devices.staging_mut().device_descriptor.clear();
                core.send_host_command(
                    0,
                    SetupPacket::get_descriptor(DESC_DEVICE, 0, 8),
                    None,
                );
                core.state =
                    HostState::Attached(GetDeviceDescriptorSize(CommandPhase::Wait));
            }
            GetDeviceDescriptorSize(CommandPhase::Wait) => self.wait_command(
                HostState::Attached(GetDeviceDescriptorSize(CommandPhase::Done)),
                HostState::Attached(GetDeviceDescriptorSize(CommandPhase::Send)),
            ),
            GetDeviceDescriptorSize(CommandPhase::Done) => {
                let core = &mut self.core;
                let Some((length, _class, max_packet0)) =
                    DeviceDescriptor::peek(&core.ep0.buffer[..core.ep0.transferred.min(8)])
                        .filter(|&(len, _, mps)| len as usize >= DEVICE_DESCRIPTOR_LEN && mps != 0)
                else {
                    self.check_command_retries();
                    return;
                };
                core.device_desc_len = length;
                // From here on EP0 runs at the device's negotiated packet
                // size; the shared data buffer grows with it.
                core.ep0.max_packet_size = u16::from(max_packet0);
                core.command_tries = core.config.command_retries;
                core.state = HostState::Attached(GetDeviceDescriptor(CommandPhase::Send));
            }

            GetDeviceDescriptor(CommandPhase::Send) => {
                let core = &mut self.core;
                let len = u16::from(core.device_desc_len);
                core.send_host_command(
                    0,
                    SetupPacket::get_descriptor(DESC_DEVICE, 0, len),
                    None,
                );
                core.state = HostState::Attached(GetDeviceDescriptor(CommandPhase::Wait));
            }
            GetDeviceDescriptor(CommandPhase::Wait) => self.wait_command(
                HostState::Attached(GetDeviceDescriptor(CommandPhase::Done)),
                HostState::Attached(GetDeviceDescriptor(CommandPhase::Send)),
            ),
            GetDeviceDescriptor(CommandPhase::Done) => {
                let core = &mut self.core;
                if core.ep0.transferred < DEVICE_DESCRIPTOR_LEN {
                    self.check_command_retries();
                    return;
                }
                let raw = core.ep0.buffer[..core.ep0.transferred].to_vec();
                core.devices.staging_mut().device_descriptor = raw;
                core.command_tries = core.config.command_retries;
                core.state = HostState::Attached(ValidateVidPid);
            }

            ValidateVidPid => {
                let core = &mut self.core;
                if let Some(desc) = DeviceDescriptor::parse(&core.devices.staging().device_descriptor)
                {
                    let matched = find_device_level_driver(&core.tpl, &desc, core.hook.as_mut());
                    let staging = core.devices.staging_mut();
                    staging.drivers.device_driver = matched.device_driver;
                    staging.drivers.ep0_driver = matched.ep0_driver;
                    staging.drivers.forced_configuration = matched.forced_configuration;
                }
                // Every device gets an address; unsupported ones hold later,
                // once configuration selection has actually failed.
                core.state = HostState::Addressing(CommandPhase::Send);
            }
        }
    }

    fn step_addressing(&mut self, phase: CommandPhase) {
        match phase {
            CommandPhase::Send => {
                let Some(address) = self.core.devices.claim_address() else {
                    // All slots taken.
                    self.configuring_error(HoldReason::OutOfMemory);
                    return;
                };
                let core = &mut self.core;
                core.reserved_address = address;
                debug!(address, "assigning device address");
                core.send_host_command(0, SetupPacket::set_address(address), None);
                core.state = HostState::Addressing(CommandPhase::Wait);
            }
            CommandPhase::Wait => self.wait_command(
                HostState::Addressing(CommandPhase::Done),
                HostState::Addressing(CommandPhase::Send),
            ),
            CommandPhase::Done => {
                let core = &mut self.core;
                let address = core.reserved_address;
                core.devices.promote(address);
                core.current_address = address;
                core.reserved_address = 0;
                core.command_tries = core.config.command_retries;
                core.state = HostState::Configuring(ConfiguringPhase::InitConfiguration);
            }
        }
    }

    fn step_configuring(&mut self, phase: ConfiguringPhase) {
        use ConfiguringPhase::*;
        match phase {
            InitConfiguration => {
                let core = &mut self.core;
                let address = core.current_address;
                let Some(dev) = core.devices.get_mut(address) else {
                    self.configuring_error(HoldReason::Unspecified);
                    return;
                };
                let count = DeviceDescriptor::parse(&dev.device_descriptor)
                    .map(|d| d.num_configurations)
                    .unwrap_or(0);
                // Descriptors are requested highest to lowest so the lowest
                // lands at the front of the list.
                dev.configurations.clear();
                dev.selected_configuration = None;
                core.config_countdown = count;
                if count == 0 {
                    self.configuring_error(HoldReason::ClientInitFailed);
                } else {
                    self.core.state =
                        HostState::Configuring(GetConfigDescriptorSize(CommandPhase::Send));
                }
            }

            GetConfigDescriptorSize(CommandPhase::Send) => {
                let core = &mut self.core;
                let index = core.config_countdown - 1;
                core.send_host_command(
                    core.current_address,
                    SetupPacket::get_descriptor(DESC_CONFIGURATION, index, 8),
                    None,
                );
                core.state = HostState::Configuring(GetConfigDescriptorSize(CommandPhase::Wait));
            }
            GetConfigDescriptorSize(CommandPhase::Wait) => self.wait_command(
                HostState::Configuring(GetConfigDescriptorSize(CommandPhase::Done)),
                HostState::Configuring(GetConfigDescriptorSize(CommandPhase::Send)),
            ),
            GetConfigDescriptorSize(CommandPhase::Done) => {
                let core = &mut self.core;
                let buf = &core.ep0.buffer[..core.ep0.transferred.min(8)];
                if buf.len() < 8 || buf[1] != DESC_CONFIGURATION {
                    self.check_command_retries();
                    return;
                }
                let total = u16::from_le_bytes([buf[2], buf[3]]);
                core.pending_config = (buf[5], total.max(8));
                core.command_tries = core.config.command_retries;
                core.state = HostState::Configuring(GetConfigDescriptor(CommandPhase::Send));
            }

            GetConfigDescriptor(CommandPhase::Send) => {
                let core = &mut self.core;
                let total = core.pending_config.1;
                core.send_host_command(
                    core.current_address,
                    SetupPacket::get_descriptor(
                        DESC_CONFIGURATION,
                        core.config_countdown - 1,
                        total,
                    ),
                    None,
                );
                core.state = HostState::Configuring(GetConfigDescriptor(CommandPhase::Wait));
            }
            GetConfigDescriptor(CommandPhase::Wait) => self.wait_command(
                HostState::Configuring(GetConfigDescriptor(CommandPhase::Done)),
                HostState::Configuring(GetConfigDescriptor(CommandPhase::Send)),
            ),
            GetConfigDescriptor(CommandPhase::Done) => {
                let core = &mut self.core;
                let raw = core.ep0.buffer[..core.ep0.transferred].to_vec();
                let (value, _) = core.pending_config;
                let address = core.current_address;
                let Some(dev) = core.devices.get_mut(address) else {
                    self.configuring_error(HoldReason::Unspecified);
                    return;
                };
                dev.configurations.insert(
                    0,
                    crate::device::ConfigurationNode {
                        configuration_value: value,
                        raw,
                    },
                );
                core.command_tries = core.config.command_retries;
                core.config_countdown -= 1;
                core.state = if core.config_countdown > 0 {
                    HostState::Configuring(GetConfigDescriptorSize(CommandPhase::Send))
                } else {
                    HostState::Configuring(SelectConfiguration)
                };
            }

            SelectConfiguration => self.select_configuration(),

            ApplicationHold => {
                let address = self.core.current_address;
                if !self.core.hook.hold_before_configuration(address) {
                    self.core.state =
                        HostState::Configuring(SetConfiguration(CommandPhase::Send));
                }
            }

            SetConfiguration(CommandPhase::Send) => {
                let core = &mut self.core;
                let address = core.current_address;
                let value = core
                    .devices
                    .get(address)
                    .map(|d| d.configuration_value)
                    .unwrap_or(0);
                core.send_host_command(address, SetupPacket::set_configuration(value), None);
                core.state = HostState::Configuring(SetConfiguration(CommandPhase::Wait));
            }
            SetConfiguration(CommandPhase::Wait) => self.wait_command(
                HostState::Configuring(SetConfiguration(CommandPhase::Done)),
                HostState::Configuring(SetConfiguration(CommandPhase::Send)),
            ),
            SetConfiguration(CommandPhase::Done) => {
                let core = &mut self.core;
                if let Some(dev) = core.devices.get_mut(core.current_address) {
                    dev.reset_all_toggles();
                }
                core.command_tries = core.config.command_retries;
                core.state = HostState::Configuring(InitClientDrivers);
            }

            InitClientDrivers => self.init_client_drivers(),
        }
    }

    fn select_configuration(&mut self) {
        let core = &mut self.core;
        let address = core.current_address;
        let Some(dev) = core.devices.get_mut(address) else {
            self.configuring_error(HoldReason::Unspecified);
            return;
        };
        dev.interfaces.clear();

        let Some(desc) = DeviceDescriptor::parse(&dev.device_descriptor) else {
            self.configuring_error(HoldReason::UnsupportedDevice);
            return;
        };
        let selection = dev.drivers;
        let forced = selection.forced_configuration;

        // The node list is taken out so the parser can borrow the TPL and
        // hook without touching the device slot.
        let nodes = std::mem::take(&mut dev.configurations);
        let mut chosen = None;
        for (idx, node) in nodes.iter().enumerate() {
            if let Some(value) = forced {
                if node.configuration_value != value {
                    continue;
                }
            }
            match parse_configuration(&node.raw, &desc, &selection, &core.tpl, core.hook.as_mut())
            {
                Ok(parsed) => {
                    chosen = Some((idx, parsed));
                    break;
                }
                Err(err) => {
                    trace!(configuration = node.configuration_value, %err, "configuration rejected");
                    if forced.is_some() {
                        break;
                    }
                }
            }
        }

        let dev = core
            .devices
            .get_mut(address)
            .expect("slot checked above");
        dev.configurations = nodes;

        match chosen {
            Some((idx, parsed)) => {
                debug!(
                    address,
                    configuration = parsed.configuration_value,
                    interfaces = parsed.interfaces.len(),
                    "configuration selected"
                );
                dev.selected_configuration = Some(idx);
                dev.configuration_value = parsed.configuration_value;
                dev.configuration_power_2ma = parsed.max_power_2ma;
                dev.interfaces = parsed.interfaces;
                core.state = HostState::Configuring(ConfiguringPhase::ApplicationHold);
            }
            None => self.configuring_error(HoldReason::UnsupportedDevice),
        }
    }

    fn init_client_drivers(&mut self) {
        let address = self.core.current_address;

        // The running state is entered first: driver initializers may issue
        // control transfers, which the request API only accepts while
        // running.
        self.core.state = HostState::Running(RunningPhase::Normal);

        let Some(dev) = self.core.devices.get(address) else {
            self.configuring_error(HoldReason::Unspecified);
            return;
        };
        let mut targets: Vec<u8> = match dev.drivers.device_driver {
            Some(driver) => vec![driver],
            None => dev.interfaces.iter().map(|i| i.driver).collect(),
        };
        if let Some(ep0_driver) = dev.drivers.ep0_driver {
            targets.push(ep0_driver);
        }

        for idx in targets {
            let ok = match self.drivers.get_mut(idx as usize) {
                Some(entry) => {
                    let flags = entry.init_flags;
                    entry.driver.initialize(&mut self.core, address, flags, idx)
                }
                None => false,
            };
            if !ok {
                warn!(address, driver = idx, "client driver failed to initialize");
                self.configuring_error(HoldReason::ClientInitFailed);
                return;
            }
        }
        debug!(address, "device running");
    }

    fn step_running(&mut self, phase: RunningPhase) {
        use ResumePhase::*;
        match phase {
            RunningPhase::Normal => {}
            RunningPhase::SuspendResume(Suspend) => {
                // Parked until the application calls resume().
            }
            RunningPhase::SuspendResume(Resume) => {
                let core = &mut self.core;
                core.bus.signal_resume(true);
                core.timer = Some(core.config.resume_ms);
                core.state = HostState::Running(RunningPhase::SuspendResume(ResumeWait));
            }
            RunningPhase::SuspendResume(ResumeWait) => {}
            RunningPhase::SuspendResume(Recover) => {
                let core = &mut self.core;
                core.bus.signal_resume(false);
                core.bus.enable_sof(true);
                core.timer = Some(core.config.resume_recovery_ms);
                core.state = HostState::Running(RunningPhase::SuspendResume(RecoverWait));
            }
            RunningPhase::SuspendResume(RecoverWait) => {}
            RunningPhase::SuspendResume(Done) => {
                self.core.notify_device(self.core.current_address, NoticeKind::Resume);
                self.core.state = HostState::Running(RunningPhase::Normal);
            }
        }
    }

    fn step_holding(&mut self, phase: HoldingPhase) {
        match phase {
            HoldingPhase::Init => {
                let core = &mut self.core;
                // Quiet the bus; only detach can free us.
                core.bus.enable_sof(false);
                core.bus.irq_control(IrqSource::all(), false);
                core.bus.irq_control(IrqSource::DETACH, true);
                let address = core.current_address;
                let reason = core.hold_reason;
                warn!(address, %reason, "device held");
                core.hook.enumeration_failed(address, reason);
                core.state = HostState::Holding(HoldingPhase::Hold);
            }
            HoldingPhase::Hold => {}
        }
    }

    /// Polls the EP0 flags for the in-flight enumeration command.
    fn wait_command(&mut self, on_success: HostState, retry_state: HostState) {
        match self.core.command_result() {
            CommandResult::Pending => {}
            CommandResult::Success => self.core.state = on_success,
            CommandResult::Failed => {
                self.check_command_retries_to(retry_state);
            }
        }
    }

    /// NAK/STALL/fault on an enumeration command: retry the command, then
    /// restart enumeration from the reset, then give up and hold.
    fn check_command_retries(&mut self) {
        let retry_state = self.core.state;
        self.check_command_retries_to(Self::command_send_state(retry_state));
    }

    fn check_command_retries_to(&mut self, retry_state: HostState) {
        let core = &mut self.core;
        // A stall here does not require application intervention.
        core.ep0.clear_errors();

        core.command_tries = core.command_tries.saturating_sub(1);
        if core.command_tries != 0 {
            core.state = retry_state;
            return;
        }

        core.enumeration_tries = core.enumeration_tries.saturating_sub(1);
        if core.enumeration_tries != 0 {
            debug!(
                remaining = core.enumeration_tries,
                "command retries exhausted, restarting enumeration"
            );
            core.state = HostState::Attached(AttachedPhase::ResetDevice(ResetPhase::Assert));
        } else {
            core.hold_reason = HoldReason::CannotEnumerate;
            core.state = HostState::Holding(HoldingPhase::Init);
        }
    }

    /// Maps a Wait/Done state back to its Send state for command retry.
    fn command_send_state(state: HostState) -> HostState {
        use HostState::*;
        match state {
            Attached(AttachedPhase::GetDeviceDescriptorSize(_)) => {
                Attached(AttachedPhase::GetDeviceDescriptorSize(CommandPhase::Send))
            }
            Attached(AttachedPhase::GetDeviceDescriptor(_)) => {
                Attached(AttachedPhase::GetDeviceDescriptor(CommandPhase::Send))
            }
            Addressing(_) => Addressing(CommandPhase::Send),
            Configuring(ConfiguringPhase::GetConfigDescriptorSize(_)) => {
                Configuring(ConfiguringPhase::GetConfigDescriptorSize(CommandPhase::Send))
            }
            Configuring(ConfiguringPhase::GetConfigDescriptor(_)) => {
                Configuring(ConfiguringPhase::GetConfigDescriptor(CommandPhase::Send))
            }
            Configuring(ConfiguringPhase::SetConfiguration(_)) => {
                Configuring(ConfiguringPhase::SetConfiguration(CommandPhase::Send))
            }
            other => other,
        }
    }

    /// Routes a configuration-stage failure: a root device holds the host,
    /// a hub-mounted device is detached alone and its port disabled.
    fn configuring_error(&mut self, reason: HoldReason) {
        let address = self.core.current_address;
        let hub = if address == 0 {
            self.core.devices.staging().hub_address
        } else {
            self.core
                .devices
                .get(address)
                .map(|d| d.hub_address)
                .unwrap_or(0)
        };
        if hub == 0 {
            self.core.hold_reason = reason;
            self.core.state = HostState::Holding(HoldingPhase::Init);
        } else {
            debug!(address, hub, %reason, "hub-mounted device failed, detaching port");
            self.core.detach_on_hub(hub, address);
            self.core.state = HostState::Running(RunningPhase::Normal);
        }
    }

    fn notify_detach_all(&mut self) {
        for address in self.core.devices.occupied_addresses() {
            self.core.notify_device(address, NoticeKind::Detach);
        }
        // Deliver before the slots are cleared by the caller.
        self.dispatch_notices();
    }

    // ---- application requests --------------------------------------------------

    /// Suspends the attached device by idling the bus.
    pub fn suspend(&mut self) -> Result<(), RequestError> {
        if self.core.state != HostState::Running(RunningPhase::Normal) {
            return Err(RequestError::InvalidState);
        }
        self.core.bus.enable_sof(false);
        self.core
            .notify_device(self.core.current_address, NoticeKind::Suspend);
        self.core.state =
            HostState::Running(RunningPhase::SuspendResume(ResumePhase::Suspend));
        Ok(())
    }

    /// Resumes a suspended device.
    pub fn resume(&mut self) -> Result<(), RequestError> {
        if self.core.state
            != HostState::Running(RunningPhase::SuspendResume(ResumePhase::Suspend))
        {
            return Err(RequestError::InvalidState);
        }
        self.core.state =
            HostState::Running(RunningPhase::SuspendResume(ResumePhase::Resume));
        Ok(())
    }

    /// Shuts down all bus activity, detaching every device.
    pub fn shutdown(&mut self) {
        self.notify_detach_all();
        self.core.bus.port_power(false);
        self.core.devices.clear_all();
        self.core.engine.reset();
        self.core.state = HostState::Detached(DetachedPhase::Initialize);
    }
}

impl<B: HostBus> HostCore<B> {
    /// Queues an enumeration command on EP0, owned by the host itself.
    fn send_host_command(&mut self, address: u8, setup: SetupPacket, data_out: Option<&[u8]>) {
        self.ep0.owner = DriverOwner::Host;
        self.engine.start_control(
            &mut self.ep0,
            TransferRef::Control0 { address },
            setup,
            data_out,
        );
    }

    fn command_result(&self) -> CommandResult {
        if !self.ep0.complete {
            CommandResult::Pending
        } else if self.ep0.successful {
            CommandResult::Success
        } else {
            CommandResult::Failed
        }
    }

    fn device_status(&self) -> DeviceStatus {
        match self.state {
            HostState::Detached(_) => DeviceStatus::Detached,
            HostState::Running(RunningPhase::Normal) => DeviceStatus::Running {
                address: self.current_address,
            },
            HostState::Running(_) => DeviceStatus::Suspended {
                address: self.current_address,
            },
            HostState::Holding(_) => DeviceStatus::Holding(self.hold_reason),
            _ => DeviceStatus::Enumerating,
        }
    }

    /// Queues a notice for every driver bound to `address`.
    fn notify_device(&mut self, address: u8, kind: NoticeKind) {
        let Some(dev) = self.devices.get(address) else {
            return;
        };
        match dev.drivers.device_driver {
            Some(driver) => self.notices.push_back(PendingNotice {
                driver,
                address,
                kind,
            }),
            None => {
                for interface in &dev.interfaces {
                    self.notices.push_back(PendingNotice {
                        driver: interface.driver,
                        address,
                        kind,
                    });
                }
            }
        }
        if let Some(driver) = dev.drivers.ep0_driver {
            self.notices.push_back(PendingNotice {
                driver,
                address,
                kind,
            });
        }
    }
}

impl<B: HostBus> HostServices for HostCore<B> {
    fn issue_control(
        &mut self,
        address: u8,
        setup: SetupPacket,
        data_out: Option<&[u8]>,
        owner: DriverOwner,
    ) -> Result<(), RequestError> {
        if !matches!(self.state, HostState::Running(_)) {
            return Err(RequestError::InvalidState);
        }
        if self.devices.get(address).is_none() {
            return Err(RequestError::UnknownDevice);
        }
        if !self.ep0.complete {
            return Err(RequestError::Busy);
        }

        // SET_INTERFACE switches the current alternate setting; the request
        // is refused if the setting is unknown or a transfer is still in
        // flight on the interface.
        if setup.request == REQ_SET_INTERFACE && setup.request_type & 0x7F == 0x01 {
            let dev = self.devices.get_mut(address).expect("checked above");
            if !dev.switch_alt_setting(setup.index, setup.value) {
                return Err(RequestError::IllegalRequest);
            }
            dev.reset_all_toggles();
        }

        // CLEAR_FEATURE(ENDPOINT_HALT) resets the endpoint's data toggle.
        if setup.request == REQ_CLEAR_FEATURE
            && setup.value == FEATURE_ENDPOINT_HALT
            && setup.request_type & 0x60 == 0
        {
            let dev = self.devices.get_mut(address).expect("checked above");
            let endpoint = setup.index as u8;
            if endpoint == 0 {
                dev.reset_all_toggles();
            } else if let Some(ep) = dev.find_endpoint_mut(endpoint) {
                ep.toggle = false;
            }
        }

        self.ep0.owner = owner;
        self.engine.start_control(
            &mut self.ep0,
            TransferRef::Control0 { address },
            setup,
            data_out,
        );
        Ok(())
    }

    fn interrupt_in(&mut self, address: u8, endpoint: u8, len: usize) -> Result<(), RequestError> {
        self.start_interrupt(address, endpoint, Direction::In, len, &[])
    }

    fn interrupt_out(
        &mut self,
        address: u8,
        endpoint: u8,
        data: &[u8],
    ) -> Result<(), RequestError> {
        self.start_interrupt(address, endpoint, Direction::Out, data.len(), data)
    }

    fn attach_on_hub(&mut self, hub_address: u8, port: u8, speed: UsbSpeed) -> bool {
        if self.state != HostState::Running(RunningPhase::Normal) {
            return false;
        }
        debug!(hub = hub_address, port, ?speed, "hub port handed to enumeration");
        self.current_address = 0;
        let staging = self.devices.staging_mut();
        staging.hub_address = hub_address;
        staging.hub_port = port;
        staging.speed = speed;
        // Hub ports are reset and settled by the hub driver; enumeration
        // picks up at the first descriptor read.
        self.override_state = Some(HostState::Attached(AttachedPhase::GetDeviceDescriptorSize(
            CommandPhase::Send,
        )));
        true
    }

    fn detach_on_hub(&mut self, hub_address: u8, device_address: u8) {
        if device_address > 0 {
            self.notify_device(device_address, NoticeKind::Detach);
            self.devices.clear(device_address);
            if self.current_address == device_address {
                self.current_address = 0;
            }
        } else {
            // The device never left the staging slot; scrub it so the next
            // attach starts clean.
            self.devices.clear(0);
        }
        if hub_address > 0 {
            if let Some(hub) = self.devices.get(hub_address) {
                let driver = hub
                    .drivers
                    .device_driver
                    .or_else(|| hub.interfaces.first().map(|i| i.driver));
                if let Some(driver) = driver {
                    self.notices.push_back(PendingNotice {
                        driver,
                        address: hub_address,
                        kind: NoticeKind::PortDeviceFailed { device_address },
                    });
                }
            }
        }
    }

    fn device_status(&self) -> DeviceStatus {
        HostCore::device_status(self)
    }

    fn configuration_descriptor(&self, address: u8) -> Option<&[u8]> {
        let dev = self.devices.get(address)?;
        dev.selected_configuration().map(|c| c.raw.as_slice())
    }

    fn device_descriptor(&self, address: u8) -> Option<DeviceDescriptor> {
        DeviceDescriptor::parse(&self.devices.get(address)?.device_descriptor)
    }

    fn device_has_device_level_driver(&self, address: u8) -> bool {
        self.devices
            .get(address)
            .map(|d| d.drivers.device_driver.is_some())
            .unwrap_or(false)
    }

    fn clear_endpoint_errors(&mut self, address: u8, endpoint: u8) -> Result<(), RequestError> {
        if endpoint == 0 {
            self.ep0.clear_errors();
            return Ok(());
        }
        let dev = self
            .devices
            .get_mut(address)
            .ok_or(RequestError::UnknownDevice)?;
        let ep = dev
            .find_endpoint_mut(endpoint)
            .ok_or(RequestError::EndpointNotFound)?;
        ep.clear_errors();
        Ok(())
    }

    fn terminate_transfer(&mut self, address: u8, endpoint: u8) -> Result<(), RequestError> {
        if endpoint == 0 {
            let refr = TransferRef::Control0 { address };
            self.engine.terminate(&mut self.ep0, refr);
            return Ok(());
        }
        let dev = self
            .devices
            .get_mut(address)
            .ok_or(RequestError::UnknownDevice)?;
        let ep = dev
            .find_endpoint_mut(endpoint)
            .ok_or(RequestError::EndpointNotFound)?;
        self.engine
            .terminate(ep, TransferRef::Endpoint { address, endpoint });
        Ok(())
    }
}

impl<B: HostBus> HostCore<B> {
    fn start_interrupt(
        &mut self,
        address: u8,
        endpoint: u8,
        direction: Direction,
        len: usize,
        data: &[u8],
    ) -> Result<(), RequestError> {
        if !matches!(self.state, HostState::Running(_)) {
            return Err(RequestError::InvalidState);
        }
        let dev = self
            .devices
            .get_mut(address)
            .ok_or(RequestError::UnknownDevice)?;
        let ep = dev
            .find_endpoint_mut(endpoint)
            .ok_or(RequestError::EndpointNotFound)?;

        if ep.transfer_type == TransferType::Control {
            return Err(RequestError::IllegalEndpointType);
        }
        let ep_in = ep.direction_in();
        if (direction == Direction::In) != ep_in {
            return Err(RequestError::IllegalDirection);
        }
        if ep.stalled {
            return Err(RequestError::Stalled);
        }
        if ep.errored {
            return Err(RequestError::EndpointError);
        }
        if !ep.complete {
            return Err(RequestError::Busy);
        }

        let refr = TransferRef::Endpoint { address, endpoint };
        match direction {
            Direction::In => self.engine.start_interrupt_in(ep, refr, len),
            Direction::Out => self.engine.start_interrupt_out(ep, refr, data),
        }
        Ok(())
    }
}
