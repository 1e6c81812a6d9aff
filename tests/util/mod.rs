//! Shared test harness: a simulated bus implementing `HostBus` backed by
//! emulated device models, plus the device models the suites enumerate.

#![allow(dead_code)]

use std::collections::VecDeque;

use picohost::hal::{BusFault, HostBus, IrqSource, TokenOutcome, TokenRequest};
use picohost::usb::{DataToggle, SetupPacket, Token, UsbSpeed};
use picohost::{HostConfig, HostState, UsbHost};

/// Handshake a device model returns for SETUP/OUT tokens.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutResult {
    Ack,
    Nak,
    Stall,
    Timeout,
}

/// Response a device model returns for IN tokens.
#[derive(Debug)]
pub enum InResult {
    Data(Vec<u8>),
    Nak,
    Stall,
    Timeout,
}

/// One emulated USB device hanging off the simulated bus.
pub trait EmulatedDevice {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
    fn reset(&mut self);
    fn address(&self) -> u8;
    fn speed(&self) -> UsbSpeed {
        UsbSpeed::Full
    }
    fn handle_setup(&mut self, setup: SetupPacket) -> OutResult;
    fn handle_in(&mut self, endpoint: u8, max_len: usize) -> InResult;
    fn handle_out(&mut self, endpoint: u8, data: &[u8]) -> OutResult;
    /// Millisecond tick for internal timers (port resets etc.).
    fn tick(&mut self) {}
    /// Topology routing: a hub resolves downstream addresses here.
    fn route_mut(&mut self, _address: u8) -> Option<&mut dyn EmulatedDevice> {
        None
    }
}

/// One token the host put on the wire, kept for assertions.
#[derive(Clone, Copy, Debug)]
pub struct TokenLog {
    pub frame: u32,
    pub token: Token,
    pub address: u8,
    pub endpoint: u8,
    pub toggle: DataToggle,
}

struct PendingToken {
    req: TokenRequest,
    data: Vec<u8>,
}

/// A `HostBus` over one root-attached [`EmulatedDevice`]. Tokens are
/// latched by `submit` and executed by [`SimBus::service_token`], after
/// which the harness raises the transfer-complete interrupt.
pub struct SimBus {
    pub root: Option<Box<dyn EmulatedDevice>>,
    pending: Option<PendingToken>,
    outcome: TokenOutcome,
    received: Vec<u8>,

    pub frame: u32,
    pub log: Vec<TokenLog>,
    pub reset_asserts: u32,
    pub reset_on: bool,
    pub sof_on: bool,
    pub powered: bool,
    pub resume_on: bool,
    pub irq_enabled: IrqSource,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            root: None,
            pending: None,
            outcome: TokenOutcome::Nak,
            received: Vec::new(),
            frame: 0,
            log: Vec::new(),
            reset_asserts: 0,
            reset_on: false,
            sof_on: false,
            powered: false,
            resume_on: false,
            irq_enabled: IrqSource::empty(),
        }
    }

    pub fn attach(&mut self, mut device: Box<dyn EmulatedDevice>) {
        device.reset();
        self.root = Some(device);
    }

    pub fn detach(&mut self) {
        self.root = None;
    }

    /// Executes the latched token against the attached device, storing the
    /// outcome for the host's completion read. Returns false when nothing
    /// was pending.
    pub fn service_token(&mut self) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        let req = pending.req;

        let Some(device) = self.target_mut(req.address) else {
            self.outcome = TokenOutcome::Fault(BusFault::BusTimeout);
            return true;
        };

        self.outcome = match req.token {
            Token::Setup => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&pending.data[..8]);
                match device.handle_setup(SetupPacket::from_bytes(bytes)) {
                    OutResult::Ack => TokenOutcome::Ack { bytes: 8 },
                    OutResult::Nak => TokenOutcome::Nak,
                    OutResult::Stall => TokenOutcome::Stall,
                    OutResult::Timeout => TokenOutcome::Fault(BusFault::BusTimeout),
                }
            }
            Token::Out => match device.handle_out(req.endpoint, &pending.data) {
                OutResult::Ack => TokenOutcome::Ack {
                    bytes: pending.data.len(),
                },
                OutResult::Nak => TokenOutcome::Nak,
                OutResult::Stall => TokenOutcome::Stall,
                OutResult::Timeout => TokenOutcome::Fault(BusFault::BusTimeout),
            },
            Token::In => match device.handle_in(req.endpoint, req.packet_size) {
                InResult::Data(mut data) => {
                    data.truncate(req.packet_size);
                    let bytes = data.len();
                    self.received = data;
                    TokenOutcome::Ack { bytes }
                }
                InResult::Nak => TokenOutcome::Nak,
                InResult::Stall => TokenOutcome::Stall,
                InResult::Timeout => TokenOutcome::Fault(BusFault::BusTimeout),
            },
        };
        true
    }

    fn target_mut(&mut self, address: u8) -> Option<&mut dyn EmulatedDevice> {
        let root = self.root.as_mut()?;
        if root.address() == address {
            return Some(root.as_mut());
        }
        root.route_mut(address)
    }

    /// IN tokens the host issued to `endpoint`, per assertion convenience.
    pub fn in_tokens_to(&self, endpoint: u8) -> Vec<&TokenLog> {
        self.log
            .iter()
            .filter(|t| t.token == Token::In && t.endpoint == endpoint)
            .collect()
    }
}

impl HostBus for SimBus {
    fn submit(&mut self, req: &TokenRequest, data: &[u8]) {
        self.log.push(TokenLog {
            frame: self.frame,
            token: req.token,
            address: req.address,
            endpoint: req.endpoint,
            toggle: req.toggle,
        });
        self.pending = Some(PendingToken {
            req: *req,
            data: data.to_vec(),
        });
    }

    fn outcome(&mut self) -> TokenOutcome {
        self.outcome
    }

    fn copy_received(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.received.len());
        buf[..len].copy_from_slice(&self.received[..len]);
        len
    }

    fn assert_reset(&mut self, on: bool) {
        if on && !self.reset_on {
            self.reset_asserts += 1;
            if let Some(device) = self.root.as_mut() {
                device.reset();
            }
        }
        self.reset_on = on;
    }

    fn signal_resume(&mut self, on: bool) {
        self.resume_on = on;
    }

    fn enable_sof(&mut self, on: bool) {
        self.sof_on = on;
    }

    fn port_power(&mut self, on: bool) {
        self.powered = on;
    }

    fn attached_speed(&self) -> UsbSpeed {
        self.root.as_ref().map(|d| d.speed()).unwrap_or_default()
    }

    fn irq_control(&mut self, source: IrqSource, enabled: bool) {
        if enabled {
            self.irq_enabled |= source;
        } else {
            self.irq_enabled &= !source;
        }
    }
}

// ---------------------------------------------------------------------------
// harness helpers

/// Runs one millisecond/frame of bus time: timer tick, SOF service, token
/// execution, then the cooperative host task.
pub fn run_frame(host: &mut UsbHost<SimBus>) {
    host.bus_mut().frame += 1;
    if let Some(root) = host.bus_mut().root.as_mut() {
        root.tick();
    }
    host.tick_1ms();
    host.isr_sof();
    // Drain every transaction the engine chains within this frame.
    for _ in 0..64 {
        if host.bus_mut().service_token() {
            host.isr_transfer_complete();
        } else {
            break;
        }
    }
    host.poll();
}

/// Runs frames until `pred` holds, panicking after `max_frames`.
pub fn run_until(
    host: &mut UsbHost<SimBus>,
    max_frames: u32,
    mut pred: impl FnMut(&mut UsbHost<SimBus>) -> bool,
) {
    for _ in 0..max_frames {
        if pred(host) {
            return;
        }
        run_frame(host);
    }
    panic!(
        "condition not reached within {max_frames} frames (state: {:?})",
        host.state()
    );
}

/// Brings the host to the wait-for-device state, attaches `device`, and
/// raises the attach interrupt.
pub fn attach_device(host: &mut UsbHost<SimBus>, device: Box<dyn EmulatedDevice>) {
    run_until(host, 50, |h| {
        h.state() == HostState::Detached(picohost::host::DetachedPhase::WaitForDevice)
    });
    host.bus_mut().attach(device);
    host.isr_attach();
}

pub fn default_host() -> UsbHost<SimBus> {
    UsbHost::new(SimBus::new(), HostConfig::default())
}

// ---------------------------------------------------------------------------
// EP0 default-control-pipe model, shared by the device models.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Ep0Stage {
    Idle,
    DataIn,
    DataOut,
    StatusIn,
    StatusOut,
}

pub struct Ep0Model {
    stage: Ep0Stage,
    setup: Option<SetupPacket>,
    in_data: Vec<u8>,
    in_offset: usize,
    out_expected: usize,
    out_data: Vec<u8>,
    stalled: bool,
    nak_data: bool,
}

impl Ep0Model {
    pub fn new() -> Self {
        Self {
            stage: Ep0Stage::Idle,
            setup: None,
            in_data: Vec::new(),
            in_offset: 0,
            out_expected: 0,
            out_data: Vec::new(),
            stalled: false,
            nak_data: false,
        }
    }

    fn begin(&mut self, setup: SetupPacket) {
        self.setup = Some(setup);
        self.in_data.clear();
        self.in_offset = 0;
        self.out_expected = 0;
        self.out_data.clear();
        self.stalled = false;
        self.nak_data = false;

        if setup.length == 0 {
            self.stage = Ep0Stage::StatusIn;
        } else if setup.is_in() {
            self.stage = Ep0Stage::DataIn;
        } else {
            self.stage = Ep0Stage::DataOut;
            self.out_expected = setup.length as usize;
        }
    }
}

/// What a device model does with one decoded SETUP.
pub enum SetupAction {
    /// Respond with this data in the IN stage (truncated to wLength).
    Reply(Vec<u8>),
    /// Accept a no-data or OUT request.
    Accept,
    /// NAK the data stage indefinitely.
    NakData,
    Stall,
}

impl Ep0Model {
    /// Drives the SETUP stage. `action` is the device's decoded response.
    pub fn setup(&mut self, setup: SetupPacket, action: SetupAction) -> OutResult {
        self.begin(setup);
        match action {
            SetupAction::Reply(mut data) => {
                data.truncate(setup.length as usize);
                self.in_data = data;
            }
            SetupAction::Accept => {}
            SetupAction::NakData => self.nak_data = true,
            SetupAction::Stall => self.stalled = true,
        }
        OutResult::Ack
    }

    /// IN token on endpoint 0. `on_status` runs when a status stage
    /// completes (pending address/configuration take effect there).
    pub fn token_in(&mut self, max_len: usize, on_status: impl FnOnce()) -> InResult {
        if self.stalled {
            return InResult::Stall;
        }
        match self.stage {
            Ep0Stage::DataIn => {
                if self.nak_data {
                    return InResult::Nak;
                }
                let remaining = self.in_data.len() - self.in_offset;
                let len = remaining.min(max_len);
                let chunk = self.in_data[self.in_offset..self.in_offset + len].to_vec();
                self.in_offset += len;
                if self.in_offset >= self.in_data.len() {
                    self.stage = Ep0Stage::StatusOut;
                }
                InResult::Data(chunk)
            }
            Ep0Stage::StatusIn => {
                self.stage = Ep0Stage::Idle;
                self.setup = None;
                on_status();
                InResult::Data(Vec::new())
            }
            _ => InResult::Nak,
        }
    }

    /// OUT token on endpoint 0.
    pub fn token_out(&mut self, data: &[u8], on_status: impl FnOnce()) -> OutResult {
        if self.stalled {
            return OutResult::Stall;
        }
        match self.stage {
            Ep0Stage::DataOut => {
                if self.nak_data {
                    return OutResult::Nak;
                }
                self.out_data.extend_from_slice(data);
                if self.out_data.len() >= self.out_expected {
                    self.stage = Ep0Stage::StatusIn;
                }
                OutResult::Ack
            }
            Ep0Stage::StatusOut => {
                self.stage = Ep0Stage::Idle;
                self.setup = None;
                on_status();
                OutResult::Ack
            }
            _ => OutResult::Nak,
        }
    }
}

// ---------------------------------------------------------------------------
// A scriptable single-function device (HID keyboard shaped by default).

pub struct SimDevice {
    pub device_descriptor: Vec<u8>,
    pub config_descriptors: Vec<Vec<u8>>,
    address: u8,
    pending_address: Option<u8>,
    configuration: u8,
    pending_configuration: Option<u8>,
    ep0: Ep0Model,
    /// Reports waiting on the interrupt IN endpoint; empty queue NAKs.
    pub reports: VecDeque<Vec<u8>>,
    /// Requests whose data stage is NAK'd forever.
    pub nak_request: Option<u8>,
    /// Requests that stall.
    pub stall_request: Option<u8>,
    /// Stall the interrupt endpoint outright.
    pub stall_endpoint: bool,
    pub speed: UsbSpeed,
    /// IN polls seen on the interrupt endpoint.
    pub interrupt_polls: u32,
}

pub const KEYBOARD_VID: u16 = 0x04D8;
pub const KEYBOARD_PID: u16 = 0x0055;

/// 18-byte device descriptor of a full-speed HID-class keyboard with one
/// configuration and an 8-byte EP0.
pub fn keyboard_device_descriptor() -> Vec<u8> {
    let mut raw = vec![
        0x12, 0x01, 0x10, 0x01, // bLength, DEVICE, bcdUSB 1.10
        0x00, 0x00, 0x00, 0x08, // class/subclass/protocol at interface level, mps0 8
        0, 0, 0, 0, // vid/pid packed below
        0x00, 0x01, // bcdDevice
        0x01, 0x02, 0x00, 0x01, // strings, one configuration
    ];
    raw[8..10].copy_from_slice(&KEYBOARD_VID.to_le_bytes());
    raw[10..12].copy_from_slice(&KEYBOARD_PID.to_le_bytes());
    raw
}

/// Boot-keyboard configuration: one interface (3/1/1), one interrupt IN
/// endpoint 0x81, max packet 8, 10 ms polling interval.
pub fn keyboard_config_descriptor() -> Vec<u8> {
    let mut raw = vec![
        0x09, 0x02, 0, 0, 0x01, 0x01, 0x00, 0xA0, 50, // configuration
        0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00, // boot keyboard interface
        0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 63, 0x00, // HID descriptor
        0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A, // interrupt IN, 8 bytes, 10 ms
    ];
    let total = raw.len() as u16;
    raw[2..4].copy_from_slice(&total.to_le_bytes());
    raw
}

impl SimDevice {
    pub fn keyboard() -> Self {
        Self {
            device_descriptor: keyboard_device_descriptor(),
            config_descriptors: vec![keyboard_config_descriptor()],
            address: 0,
            pending_address: None,
            configuration: 0,
            pending_configuration: None,
            ep0: Ep0Model::new(),
            reports: VecDeque::new(),
            nak_request: None,
            stall_request: None,
            stall_endpoint: false,
            speed: UsbSpeed::Full,
            interrupt_polls: 0,
        }
    }

    fn decode(&mut self, setup: SetupPacket) -> SetupAction {
        use picohost::usb::*;

        if self.nak_request == Some(setup.request) {
            return SetupAction::NakData;
        }
        if self.stall_request == Some(setup.request) {
            return SetupAction::Stall;
        }

        match (setup.request_type, setup.request) {
            (0x80, REQ_GET_DESCRIPTOR) => match (setup.value >> 8) as u8 {
                DESC_DEVICE => SetupAction::Reply(self.device_descriptor.clone()),
                DESC_CONFIGURATION => {
                    let index = (setup.value & 0xFF) as usize;
                    match self.config_descriptors.get(index) {
                        Some(raw) => SetupAction::Reply(raw.clone()),
                        None => SetupAction::Stall,
                    }
                }
                _ => SetupAction::Stall,
            },
            (0x80, REQ_GET_STATUS) => SetupAction::Reply(vec![0, 0]),
            (0x00, REQ_SET_ADDRESS) => {
                self.pending_address = Some((setup.value & 0x7F) as u8);
                SetupAction::Accept
            }
            (0x00, REQ_SET_CONFIGURATION) => {
                self.pending_configuration = Some((setup.value & 0xFF) as u8);
                SetupAction::Accept
            }
            // HID class requests the keyboard driver may issue.
            (0x21, _) => SetupAction::Accept,
            (0xA1, _) => SetupAction::Reply(vec![0; setup.length as usize]),
            _ => SetupAction::Stall,
        }
    }

    fn finalize(&mut self) {
        if let Some(address) = self.pending_address.take() {
            self.address = address;
        }
        if let Some(configuration) = self.pending_configuration.take() {
            self.configuration = configuration;
        }
    }
}

impl EmulatedDevice for SimDevice {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn reset(&mut self) {
        self.address = 0;
        self.pending_address = None;
        self.configuration = 0;
        self.pending_configuration = None;
        self.ep0 = Ep0Model::new();
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn speed(&self) -> UsbSpeed {
        self.speed
    }

    fn handle_setup(&mut self, setup: SetupPacket) -> OutResult {
        let action = self.decode(setup);
        self.ep0.setup(setup, action)
    }

    fn handle_in(&mut self, endpoint: u8, max_len: usize) -> InResult {
        if endpoint == 0 {
            let pending_address = &mut self.pending_address;
            let pending_configuration = &mut self.pending_configuration;
            let address = &mut self.address;
            let configuration = &mut self.configuration;
            return self.ep0.token_in(max_len, || {
                if let Some(a) = pending_address.take() {
                    *address = a;
                }
                if let Some(c) = pending_configuration.take() {
                    *configuration = c;
                }
            });
        }
        if endpoint == 1 {
            self.interrupt_polls += 1;
            if self.stall_endpoint {
                return InResult::Stall;
            }
            if self.configuration == 0 {
                return InResult::Nak;
            }
            return match self.reports.pop_front() {
                Some(report) => InResult::Data(report),
                None => InResult::Nak,
            };
        }
        InResult::Stall
    }

    fn handle_out(&mut self, endpoint: u8, data: &[u8]) -> OutResult {
        if endpoint != 0 {
            return OutResult::Stall;
        }
        let pending_address = &mut self.pending_address;
        let pending_configuration = &mut self.pending_configuration;
        let address = &mut self.address;
        let configuration = &mut self.configuration;
        self.ep0.token_out(data, || {
            if let Some(a) = pending_address.take() {
                *address = a;
            }
            if let Some(c) = pending_configuration.take() {
                *configuration = c;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// An emulated external hub with downstream ports.

const HUB_STATUS_CONNECTION: u16 = 1 << 0;
const HUB_STATUS_ENABLE: u16 = 1 << 1;
const HUB_STATUS_RESET: u16 = 1 << 4;
const HUB_STATUS_POWER: u16 = 1 << 8;
const HUB_STATUS_LOW_SPEED: u16 = 1 << 9;

const HUB_CHANGE_CONNECTION: u16 = 1 << 0;
const HUB_CHANGE_ENABLE: u16 = 1 << 1;
const HUB_CHANGE_RESET: u16 = 1 << 4;

pub struct SimHubPort {
    pub device: Option<Box<dyn EmulatedDevice>>,
    pub connected: bool,
    pub connect_change: bool,
    pub enabled: bool,
    pub enable_change: bool,
    pub powered: bool,
    pub resetting: bool,
    pub reset_change: bool,
    reset_countdown: u8,
}

impl SimHubPort {
    fn new() -> Self {
        Self {
            device: None,
            connected: false,
            connect_change: false,
            enabled: false,
            enable_change: false,
            powered: false,
            resetting: false,
            reset_change: false,
            reset_countdown: 0,
        }
    }

    fn status(&self) -> u16 {
        let mut v = 0;
        if self.connected {
            v |= HUB_STATUS_CONNECTION;
        }
        if self.enabled {
            v |= HUB_STATUS_ENABLE;
        }
        if self.resetting {
            v |= HUB_STATUS_RESET;
        }
        if self.powered {
            v |= HUB_STATUS_POWER;
        }
        if let Some(device) = &self.device {
            if device.speed() == UsbSpeed::Low {
                v |= HUB_STATUS_LOW_SPEED;
            }
        }
        v
    }

    fn change(&self) -> u16 {
        let mut v = 0;
        if self.connect_change {
            v |= HUB_CHANGE_CONNECTION;
        }
        if self.enable_change {
            v |= HUB_CHANGE_ENABLE;
        }
        if self.reset_change {
            v |= HUB_CHANGE_RESET;
        }
        v
    }

    fn has_change(&self) -> bool {
        self.connect_change || self.enable_change || self.reset_change
    }

    fn tick(&mut self) {
        if self.resetting {
            self.reset_countdown = self.reset_countdown.saturating_sub(1);
            if self.reset_countdown == 0 {
                self.resetting = false;
                self.reset_change = true;
                if self.powered && self.connected {
                    self.enabled = true;
                }
            }
        }
        if self.enabled && self.powered {
            if let Some(device) = self.device.as_mut() {
                device.tick();
            }
        }
    }
}

pub struct SimHub {
    address: u8,
    pending_address: Option<u8>,
    configuration: u8,
    pending_configuration: Option<u8>,
    ep0: Ep0Model,
    pub ports: Vec<SimHubPort>,
    /// Class requests seen, for isolation assertions:
    /// (bRequest, wValue, wIndex).
    pub class_requests: Vec<(u8, u16, u16)>,
}

impl SimHub {
    pub fn with_ports(count: usize) -> Self {
        Self {
            address: 0,
            pending_address: None,
            configuration: 0,
            pending_configuration: None,
            ep0: Ep0Model::new(),
            ports: (0..count).map(|_| SimHubPort::new()).collect(),
            class_requests: Vec::new(),
        }
    }

    /// Plugs a device into `port` (1-based).
    pub fn plug(&mut self, port: usize, mut device: Box<dyn EmulatedDevice>) {
        device.reset();
        let slot = &mut self.ports[port - 1];
        slot.device = Some(device);
        slot.connected = true;
        slot.connect_change = true;
        slot.enabled = false;
    }

    pub fn unplug(&mut self, port: usize) {
        let slot = &mut self.ports[port - 1];
        slot.device = None;
        slot.connected = false;
        slot.connect_change = true;
        slot.enabled = false;
    }

    fn device_descriptor(&self) -> Vec<u8> {
        vec![
            0x12, 0x01, 0x10, 0x01, // bLength, DEVICE, bcdUSB 1.10
            0x09, 0x00, 0x00, 0x40, // hub class, mps0 64
            0x09, 0x04, 0x02, 0x00, // vid/pid
            0x00, 0x01, // bcdDevice
            0x00, 0x00, 0x00, 0x01, // no strings, one configuration
        ]
    }

    fn config_descriptor(&self) -> Vec<u8> {
        let mut raw = vec![
            0x09, 0x02, 0, 0, 0x01, 0x01, 0x00, 0xE0, 0, // configuration, self-powered
            0x09, 0x04, 0x00, 0x00, 0x01, 0x09, 0x00, 0x00, 0x00, // hub interface
            0x07, 0x05, 0x81, 0x03, 0x01, 0x00, 0x04, // status-change IN, 4 ms
        ];
        let total = raw.len() as u16;
        raw[2..4].copy_from_slice(&total.to_le_bytes());
        raw
    }

    fn hub_descriptor(&self) -> Vec<u8> {
        vec![
            9,
            0x29,
            self.ports.len() as u8,
            0x11,
            0x00, // per-port power switching
            1,    // bPwrOn2PwrGood: 2 ms
            0x00, // controller current
            0x00, // DeviceRemovable
            0xFF, // PortPwrCtrlMask
        ]
    }

    fn decode(&mut self, setup: SetupPacket) -> SetupAction {
        use picohost::usb::*;

        match (setup.request_type, setup.request) {
            (0x80, REQ_GET_DESCRIPTOR) => match (setup.value >> 8) as u8 {
                DESC_DEVICE => SetupAction::Reply(self.device_descriptor()),
                DESC_CONFIGURATION => SetupAction::Reply(self.config_descriptor()),
                _ => SetupAction::Stall,
            },
            (0x00, REQ_SET_ADDRESS) => {
                self.pending_address = Some((setup.value & 0x7F) as u8);
                SetupAction::Accept
            }
            (0x00, REQ_SET_CONFIGURATION) => {
                self.pending_configuration = Some((setup.value & 0xFF) as u8);
                SetupAction::Accept
            }
            // Class: hub descriptor.
            (0xA0, REQ_GET_DESCRIPTOR) => {
                self.class_requests.push((setup.request, setup.value, setup.index));
                SetupAction::Reply(self.hub_descriptor())
            }
            // Class: port status.
            (0xA3, REQ_GET_STATUS) => {
                self.class_requests.push((setup.request, setup.value, setup.index));
                let Some(port) = self.port(setup.index) else {
                    return SetupAction::Stall;
                };
                let status = port.status().to_le_bytes();
                let change = port.change().to_le_bytes();
                SetupAction::Reply(vec![status[0], status[1], change[0], change[1]])
            }
            // Class: port features.
            (0x23, REQ_SET_FEATURE) => {
                self.class_requests.push((setup.request, setup.value, setup.index));
                let value = setup.value;
                let Some(port) = self.port_mut(setup.index) else {
                    return SetupAction::Stall;
                };
                match value {
                    8 => port.powered = true, // PORT_POWER
                    4 => {
                        // PORT_RESET
                        port.resetting = true;
                        port.reset_countdown = 5;
                        port.enabled = false;
                        if let Some(device) = port.device.as_mut() {
                            device.reset();
                        }
                    }
                    1 => port.enabled = true, // PORT_ENABLE
                    _ => return SetupAction::Stall,
                }
                SetupAction::Accept
            }
            (0x23, REQ_CLEAR_FEATURE) => {
                self.class_requests.push((setup.request, setup.value, setup.index));
                let value = setup.value;
                let Some(port) = self.port_mut(setup.index) else {
                    return SetupAction::Stall;
                };
                match value {
                    1 => {
                        // PORT_ENABLE
                        port.enabled = false;
                        port.enable_change = false;
                    }
                    8 => port.powered = false,         // PORT_POWER
                    16 => port.connect_change = false, // C_PORT_CONNECTION
                    17 => port.enable_change = false,  // C_PORT_ENABLE
                    20 => port.reset_change = false,   // C_PORT_RESET
                    _ => return SetupAction::Stall,
                }
                SetupAction::Accept
            }
            _ => SetupAction::Stall,
        }
    }

    fn port(&self, index: u16) -> Option<&SimHubPort> {
        if index == 0 {
            return None;
        }
        self.ports.get(index as usize - 1)
    }

    fn port_mut(&mut self, index: u16) -> Option<&mut SimHubPort> {
        if index == 0 {
            return None;
        }
        self.ports.get_mut(index as usize - 1)
    }

    fn status_change_bitmap(&self) -> Option<Vec<u8>> {
        let mut any = false;
        let mut bitmap = 0u32;
        for (idx, port) in self.ports.iter().enumerate() {
            if port.has_change() {
                any = true;
                bitmap |= 1 << (idx + 1);
            }
        }
        any.then(|| {
            let len = (self.ports.len() + 1).div_ceil(8);
            bitmap.to_le_bytes()[..len].to_vec()
        })
    }
}

impl EmulatedDevice for SimHub {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn reset(&mut self) {
        self.address = 0;
        self.pending_address = None;
        self.configuration = 0;
        self.pending_configuration = None;
        self.ep0 = Ep0Model::new();
        for port in &mut self.ports {
            port.connected = port.device.is_some();
            port.connect_change = port.connected;
            port.enabled = false;
            port.enable_change = false;
            port.resetting = false;
            port.reset_change = false;
            if let Some(device) = port.device.as_mut() {
                device.reset();
            }
        }
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn handle_setup(&mut self, setup: SetupPacket) -> OutResult {
        let action = self.decode(setup);
        self.ep0.setup(setup, action)
    }

    fn handle_in(&mut self, endpoint: u8, max_len: usize) -> InResult {
        if endpoint == 0 {
            let pending_address = &mut self.pending_address;
            let pending_configuration = &mut self.pending_configuration;
            let address = &mut self.address;
            let configuration = &mut self.configuration;
            return self.ep0.token_in(max_len, || {
                if let Some(a) = pending_address.take() {
                    *address = a;
                }
                if let Some(c) = pending_configuration.take() {
                    *configuration = c;
                }
            });
        }
        if endpoint == 1 {
            if self.configuration == 0 {
                return InResult::Nak;
            }
            return match self.status_change_bitmap() {
                Some(bitmap) => InResult::Data(bitmap),
                None => InResult::Nak,
            };
        }
        InResult::Stall
    }

    fn handle_out(&mut self, endpoint: u8, data: &[u8]) -> OutResult {
        if endpoint != 0 {
            return OutResult::Stall;
        }
        let pending_address = &mut self.pending_address;
        let pending_configuration = &mut self.pending_configuration;
        let address = &mut self.address;
        let configuration = &mut self.configuration;
        self.ep0.token_out(data, || {
            if let Some(a) = pending_address.take() {
                *address = a;
            }
            if let Some(c) = pending_configuration.take() {
                *configuration = c;
            }
        })
    }

    fn tick(&mut self) {
        for port in &mut self.ports {
            port.tick();
        }
    }

    fn route_mut(&mut self, address: u8) -> Option<&mut dyn EmulatedDevice> {
        for port in &mut self.ports {
            if !(port.enabled && port.powered) {
                continue;
            }
            let Some(device) = port.device.as_mut() else {
                continue;
            };
            if device.address() == address {
                return Some(device.as_mut());
            }
            if let Some(found) = device.route_mut(address) {
                return Some(found);
            }
        }
        None
    }
}
