//! Transfer queueing and the per-frame transaction engine.
//!
//! Callers enqueue control or interrupt transfers; the engine turns the head
//! of each queue into bus tokens, one class at a time, with at most one
//! token in flight bus-wide and at most one control transaction per frame.
//! Token outcomes (ACK, NAK, STALL, bus fault) are resolved here into
//! retry-or-complete decisions; every enqueued transfer produces exactly one
//! completion, surfaced through the endpoint's flags and a
//! [`CompletedTransfer`] record.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::client::DriverOwner;
use crate::config::HostConfig;
use crate::device::{DeviceTable, EndpointRecord};
use crate::error::EndpointFault;
use crate::hal::{HostBus, TokenOutcome, TokenRequest};
use crate::usb::{DataToggle, SetupPacket, Token, TransferType, UsbSpeed};

/// Sub-phase of a no-data control transfer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ControlNoDataPhase {
    #[default]
    Setup,
    StatusAck,
    Complete,
    Error,
}

/// Sub-phase of a control transfer with an IN or OUT data stage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ControlDataPhase {
    #[default]
    Setup,
    Data,
    StatusAck,
    Complete,
    Error,
}

/// Sub-phase of an interrupt transfer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InterruptPhase {
    #[default]
    Data,
    Complete,
    Error,
}

/// Sub-phase of a bulk or isochronous transfer. Recognized by the engine but
/// never entered: no public API enqueues these classes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StreamPhase {
    #[default]
    Data,
    Complete,
    Error,
}

/// Transfer state of one endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransferPhase {
    #[default]
    Idle,
    ControlNoData(ControlNoDataPhase),
    ControlRead(ControlDataPhase),
    ControlWrite(ControlDataPhase),
    InterruptIn(InterruptPhase),
    InterruptOut(InterruptPhase),
    BulkIn(StreamPhase),
    BulkOut(StreamPhase),
    IsochronousIn(StreamPhase),
    IsochronousOut(StreamPhase),
}

impl TransferPhase {
    /// Advances to the next sub-phase of the current sequence.
    pub fn advance(&mut self) {
        use TransferPhase::*;
        *self = match *self {
            ControlNoData(p) => ControlNoData(match p {
                ControlNoDataPhase::Setup => ControlNoDataPhase::StatusAck,
                ControlNoDataPhase::StatusAck => ControlNoDataPhase::Complete,
                other => other,
            }),
            ControlRead(p) => ControlRead(Self::advance_data(p)),
            ControlWrite(p) => ControlWrite(Self::advance_data(p)),
            InterruptIn(p) => InterruptIn(Self::advance_interrupt(p)),
            InterruptOut(p) => InterruptOut(Self::advance_interrupt(p)),
            BulkIn(p) => BulkIn(Self::advance_stream(p)),
            BulkOut(p) => BulkOut(Self::advance_stream(p)),
            IsochronousIn(p) => IsochronousIn(Self::advance_stream(p)),
            IsochronousOut(p) => IsochronousOut(Self::advance_stream(p)),
            Idle => Idle,
        };
    }

    fn advance_data(p: ControlDataPhase) -> ControlDataPhase {
        match p {
            ControlDataPhase::Setup => ControlDataPhase::Data,
            ControlDataPhase::Data => ControlDataPhase::StatusAck,
            ControlDataPhase::StatusAck => ControlDataPhase::Complete,
            other => other,
        }
    }

    fn advance_interrupt(p: InterruptPhase) -> InterruptPhase {
        match p {
            InterruptPhase::Data => InterruptPhase::Complete,
            other => other,
        }
    }

    fn advance_stream(p: StreamPhase) -> StreamPhase {
        match p {
            StreamPhase::Data => StreamPhase::Complete,
            other => other,
        }
    }

    /// Jumps the current sequence to its error sub-phase.
    pub fn set_error(&mut self) {
        use TransferPhase::*;
        *self = match *self {
            ControlNoData(_) => ControlNoData(ControlNoDataPhase::Error),
            ControlRead(_) => ControlRead(ControlDataPhase::Error),
            ControlWrite(_) => ControlWrite(ControlDataPhase::Error),
            InterruptIn(_) => InterruptIn(InterruptPhase::Error),
            InterruptOut(_) => InterruptOut(InterruptPhase::Error),
            BulkIn(_) => BulkIn(StreamPhase::Error),
            BulkOut(_) => BulkOut(StreamPhase::Error),
            IsochronousIn(_) => IsochronousIn(StreamPhase::Error),
            IsochronousOut(_) => IsochronousOut(StreamPhase::Error),
            Idle => Idle,
        };
    }
}

/// Identifies the endpoint record a queued transfer belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferRef {
    /// The host-owned endpoint 0 record, targeting `address` (0 while the
    /// device is still in the staging slot).
    Control0 { address: u8 },
    /// An endpoint in the device tree, by full `bEndpointAddress`.
    Endpoint { address: u8, endpoint: u8 },
}

impl TransferRef {
    pub fn address(&self) -> u8 {
        match *self {
            TransferRef::Control0 { address } => address,
            TransferRef::Endpoint { address, .. } => address,
        }
    }
}

/// One finished transfer, routed to the owning driver by the host.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub address: u8,
    /// Full `bEndpointAddress` of the endpoint.
    pub endpoint: u8,
    pub owner: DriverOwner,
    /// Received payload for successful IN transfers, empty otherwise.
    pub data: Vec<u8>,
    /// Bytes moved before the transfer ended.
    pub len: usize,
    pub fault: Option<EndpointFault>,
}

/// Borrowed view of everything the engine mutates while servicing tokens.
pub struct EngineCtx<'a, B: HostBus + ?Sized> {
    pub bus: &'a mut B,
    pub devices: &'a mut DeviceTable,
    pub ep0: &'a mut EndpointRecord,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TransferClass {
    Control,
    Interrupt,
}

/// Retry and NAK budgets copied out of [`HostConfig`] at construction.
#[derive(Clone, Copy, Debug)]
struct EngineLimits {
    transaction_retries: u8,
    interrupt_out_nak_limit: u16,
    bulk_nak_limit: u16,
}

/// The transaction engine. Owns the transfer queues and the per-frame
/// dispatch latches; endpoint records stay in the device tree.
#[derive(Debug)]
pub struct TransferEngine {
    control_queue: VecDeque<TransferRef>,
    interrupt_queue: VecDeque<TransferRef>,
    active_control: Option<TransferRef>,
    active_interrupt: Option<TransferRef>,
    /// Which class wrote the token currently on the wire, if any.
    in_flight: Option<TransferClass>,
    /// Per-frame latch: one control transaction per frame, to honor devices
    /// that cannot take several.
    control_done: bool,
    interrupt_done: bool,
    limits: EngineLimits,
    completions: VecDeque<CompletedTransfer>,
}

impl TransferEngine {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            control_queue: VecDeque::new(),
            interrupt_queue: VecDeque::new(),
            active_control: None,
            active_interrupt: None,
            in_flight: None,
            control_done: false,
            interrupt_done: false,
            limits: EngineLimits {
                transaction_retries: config.transaction_retries,
                interrupt_out_nak_limit: config.interrupt_out_nak_limit,
                bulk_nak_limit: config.bulk_nak_limit,
            },
            completions: VecDeque::new(),
        }
    }

    /// Drops all queued and active transfers, e.g. across a bus reset.
    pub fn reset(&mut self) {
        self.control_queue.clear();
        self.interrupt_queue.clear();
        self.active_control = None;
        self.active_interrupt = None;
        self.in_flight = None;
        self.control_done = false;
        self.interrupt_done = false;
        self.completions.clear();
    }

    pub fn take_completion(&mut self) -> Option<CompletedTransfer> {
        self.completions.pop_front()
    }

    /// Arms `ep` for a control transfer and queues it. The caller has
    /// validated every precondition; `ep.complete` goes false last so the
    /// record is consistent before any interrupt can observe it.
    pub fn start_control(
        &mut self,
        ep: &mut EndpointRecord,
        refr: TransferRef,
        setup: SetupPacket,
        data_out: Option<&[u8]>,
    ) {
        ep.setup = setup.to_bytes();
        ep.stalled = false;
        ep.errored = false;
        ep.reset_for_transfer(setup.length as usize);

        if setup.is_in() {
            ep.phase = TransferPhase::ControlRead(ControlDataPhase::Setup);
            if ep.buffer.len() < ep.budget {
                ep.buffer.resize(ep.budget, 0);
            }
        } else if setup.length == 0 {
            ep.phase = TransferPhase::ControlNoData(ControlNoDataPhase::Setup);
        } else {
            ep.phase = TransferPhase::ControlWrite(ControlDataPhase::Setup);
            ep.buffer.clear();
            ep.buffer.extend_from_slice(data_out.unwrap_or(&[]));
            // Zero-pad a short caller buffer up to wLength.
            if ep.buffer.len() < ep.budget {
                ep.buffer.resize(ep.budget, 0);
            }
        }

        trace!(?refr, request = ep.setup[1], "control transfer queued");
        self.control_queue.push_back(refr);
        ep.complete = false;
    }

    /// Arms `ep` for an interrupt IN transfer of up to `len` bytes.
    pub fn start_interrupt_in(&mut self, ep: &mut EndpointRecord, refr: TransferRef, len: usize) {
        ep.reset_for_transfer(len);
        ep.phase = TransferPhase::InterruptIn(InterruptPhase::Data);
        if ep.buffer.len() < len {
            ep.buffer.resize(len, 0);
        }
        self.interrupt_queue.push_back(refr);
        ep.complete = false;
    }

    /// Arms `ep` for an interrupt OUT transfer of `data`.
    pub fn start_interrupt_out(
        &mut self,
        ep: &mut EndpointRecord,
        refr: TransferRef,
        data: &[u8],
    ) {
        ep.reset_for_transfer(data.len());
        ep.phase = TransferPhase::InterruptOut(InterruptPhase::Data);
        ep.buffer.clear();
        ep.buffer.extend_from_slice(data);
        self.interrupt_queue.push_back(refr);
        ep.complete = false;
    }

    /// Force-terminates any transfer on `refr`: the endpoint is marked
    /// complete with the user-abort flag and the queue entry removed. A
    /// token already on the wire finishes on its own and is discarded.
    pub fn terminate(&mut self, ep: &mut EndpointRecord, refr: TransferRef) {
        self.control_queue.retain(|r| *r != refr);
        self.interrupt_queue.retain(|r| *r != refr);
        if self.active_control == Some(refr) {
            self.active_control = None;
        }
        if self.active_interrupt == Some(refr) {
            self.active_interrupt = None;
        }
        ep.phase = TransferPhase::Idle;
        ep.user_abort = true;
        ep.complete = true;
    }

    /// Frame-boundary service: ticks polling intervals, re-arms the
    /// per-frame latches and dispatches the next token.
    pub fn on_sof<B: HostBus + ?Sized>(&mut self, ctx: &mut EngineCtx<'_, B>) {
        ctx.devices.decrement_intervals();
        ctx.ep0.last_nak = false;
        self.control_done = false;
        self.interrupt_done = false;
        self.dispatch(ctx);
    }

    /// Token-completion service: reads the outcome from the HAL, resolves
    /// it against the in-flight transfer and dispatches the next token.
    /// Also the entry point for the error interrupt; faults arrive as
    /// [`TokenOutcome::Fault`].
    pub fn on_transfer_complete<B: HostBus + ?Sized>(&mut self, ctx: &mut EngineCtx<'_, B>) {
        let outcome = ctx.bus.outcome();
        let Some(class) = self.in_flight.take() else {
            // Completion with nothing in flight: a terminated transfer's
            // last token. Discard it.
            self.dispatch(ctx);
            return;
        };

        let refr = match class {
            TransferClass::Control => self.active_control,
            TransferClass::Interrupt => self.active_interrupt,
        };
        if let Some(refr) = refr {
            let EngineCtx { bus, devices, ep0 } = ctx;
            if let Some(ep) = resolve(devices, ep0, refr) {
                match outcome {
                    TokenOutcome::Ack { bytes } => self.resolve_ack(*bus, ep, bytes),
                    TokenOutcome::Nak => self.resolve_nak(ep),
                    TokenOutcome::Stall => {
                        debug!(?refr, "endpoint stalled");
                        ep.stalled = true;
                        ep.fault = Some(EndpointFault::Stalled);
                        ep.phase.set_error();
                    }
                    TokenOutcome::Fault(fault) => {
                        ep.errors = ep.errors.saturating_add(1);
                        if ep.errors >= self.limits.transaction_retries {
                            debug!(?refr, ?fault, "transaction retry ceiling reached");
                            ep.errored = true;
                            ep.fault = Some(EndpointFault::Bus(fault));
                            ep.phase.set_error();
                        }
                        // Below the ceiling the phase is left untouched and
                        // the same token is retried by the next dispatch.
                    }
                }
            } else {
                // Device vanished while its token was on the wire.
                match class {
                    TransferClass::Control => self.active_control = None,
                    TransferClass::Interrupt => self.active_interrupt = None,
                }
            }
        }

        self.dispatch(ctx);
    }

    fn resolve_ack<B: HostBus + ?Sized>(&mut self, bus: &mut B, ep: &mut EndpointRecord, bytes: usize) {
        use TransferPhase::*;

        let in_setup = matches!(
            ep.phase,
            ControlNoData(ControlNoDataPhase::Setup)
                | ControlRead(ControlDataPhase::Setup)
                | ControlWrite(ControlDataPhase::Setup)
        );
        let in_status = matches!(
            ep.phase,
            ControlNoData(ControlNoDataPhase::StatusAck)
                | ControlRead(ControlDataPhase::StatusAck)
                | ControlWrite(ControlDataPhase::StatusAck)
        );

        ep.naks = 0;
        ep.toggle = !ep.toggle;

        if in_setup {
            // The SETUP stage carries exactly the eight-byte packet.
            if bytes >= ep.setup.len() {
                ep.transferred = 0;
                ep.phase.advance();
                // A zero-length data stage has nothing to move; a read with
                // budget 0 degenerates straight to the status stage.
                if matches!(ep.phase, ControlRead(ControlDataPhase::Data)) && ep.budget == 0 {
                    ep.phase.advance();
                }
            }
            return;
        }

        if in_status {
            ep.successful = true;
            ep.phase.advance();
            return;
        }

        // Data stage (control or interrupt). IN payloads land in the staging
        // buffer at the current offset.
        let receiving = matches!(ep.phase, ControlRead(_) | InterruptIn(_) | BulkIn(_));
        if receiving && bytes > 0 {
            let end = (ep.transferred + bytes).min(ep.buffer.len());
            if end > ep.transferred {
                bus.copy_received(&mut ep.buffer[ep.transferred..end]);
            }
        }
        ep.transferred += bytes;

        if bytes < ep.max_packet_size as usize || ep.transferred >= ep.budget {
            ep.successful = true;
            ep.phase.advance();
        }
        // Otherwise the transfer stays in its data phase and the next
        // packet goes out on a later dispatch.
    }

    fn resolve_nak(&mut self, ep: &mut EndpointRecord) {
        ep.naks = ep.naks.saturating_add(1);
        ep.last_nak = true;

        let budget = match ep.transfer_type {
            TransferType::Control => ep.nak_limit,
            TransferType::Interrupt => {
                if ep.direction_in() {
                    // Interrupt IN retries at its polling interval with no
                    // budget unless one was configured explicitly.
                    ep.nak_limit
                } else {
                    ep.nak_limit.or(Some(self.limits.interrupt_out_nak_limit))
                }
            }
            TransferType::Bulk => ep.nak_limit.or(Some(self.limits.bulk_nak_limit)),
            TransferType::Isochronous => None,
        };

        if let Some(limit) = budget {
            if ep.naks > limit {
                debug!(endpoint = ep.address, naks = ep.naks, "NAK budget exhausted");
                ep.errored = true;
                ep.fault = Some(EndpointFault::NakTimeout);
                ep.phase.set_error();
            }
        }
        // Below the budget the phase is untouched; the token is retried on
        // the next frame (control) or polling interval (interrupt).
    }

    /// Finds and sends the next token: the control queue's head first, then
    /// the interrupt queue, gated by the per-frame latches.
    fn dispatch<B: HostBus + ?Sized>(&mut self, ctx: &mut EngineCtx<'_, B>) {
        if self.in_flight.is_some() {
            return;
        }
        if !self.control_done {
            self.service_control(ctx);
        }
        if self.in_flight.is_some() {
            return;
        }
        if !self.interrupt_done {
            self.service_interrupt(ctx);
        }
    }

    fn service_control<B: HostBus + ?Sized>(&mut self, ctx: &mut EngineCtx<'_, B>) {
        loop {
            if self.active_control.is_none() {
                self.active_control = self.control_queue.pop_front();
            }
            let Some(refr) = self.active_control else {
                self.control_done = true;
                return;
            };

            let speed = target_speed(ctx.devices, refr.address());
            let EngineCtx { bus, devices, ep0 } = ctx;
            let Some(ep) = resolve(devices, ep0, refr) else {
                self.active_control = None;
                continue;
            };

            use TransferPhase::*;
            let action = match ep.phase {
                ControlNoData(ControlNoDataPhase::Setup)
                | ControlRead(ControlDataPhase::Setup)
                | ControlWrite(ControlDataPhase::Setup) => ControlAction::Setup,
                ControlRead(ControlDataPhase::Data) => ControlAction::Data(Token::In),
                ControlWrite(ControlDataPhase::Data) => ControlAction::Data(Token::Out),
                // Status stage direction opposes the data stage.
                ControlRead(ControlDataPhase::StatusAck) => ControlAction::Status(Token::Out),
                ControlNoData(ControlNoDataPhase::StatusAck)
                | ControlWrite(ControlDataPhase::StatusAck) => ControlAction::Status(Token::In),
                ControlNoData(ControlNoDataPhase::Complete)
                | ControlRead(ControlDataPhase::Complete)
                | ControlWrite(ControlDataPhase::Complete) => ControlAction::Finish,
                _ => ControlAction::FinishError,
            };

            match action {
                ControlAction::Setup => {
                    ep.toggle = false;
                    let setup = ep.setup;
                    self.send(*bus, ep, refr, speed, Token::Setup, &setup, setup.len());
                    self.control_done = true;
                    return;
                }
                ControlAction::Data(token) => {
                    let remaining = ep.budget - ep.transferred;
                    let packet = remaining.min(ep.max_packet_size as usize);
                    match token {
                        Token::Out => {
                            let start = ep.transferred;
                            let payload = ep.buffer[start..start + packet].to_vec();
                            self.send(*bus, ep, refr, speed, token, &payload, packet);
                        }
                        _ => self.send(*bus, ep, refr, speed, token, &[], packet),
                    }
                    self.control_done = true;
                    return;
                }
                ControlAction::Status(token) => {
                    // Status stage is always DATA1, regardless of how the
                    // data stage left the toggle.
                    ep.toggle = true;
                    self.send(*bus, ep, refr, speed, token, &[], 0);
                    self.control_done = true;
                    return;
                }
                ControlAction::Finish => {
                    self.finish(ep, refr, TransferClass::Control);
                    self.control_done = true;
                    return;
                }
                ControlAction::FinishError => {
                    if ep.fault.is_none() {
                        ep.fault = Some(EndpointFault::Bus(crate::hal::BusFault::BusTimeout));
                    }
                    self.finish(ep, refr, TransferClass::Control);
                    self.control_done = true;
                    return;
                }
            }
        }
    }

    fn service_interrupt<B: HostBus + ?Sized>(&mut self, ctx: &mut EngineCtx<'_, B>) {
        loop {
            if self.active_interrupt.is_none() {
                // Only claim a transfer whose polling interval has elapsed.
                let ready = self.interrupt_queue.iter().position(|refr| {
                    let EngineCtx { devices, ep0, .. } = ctx;
                    resolve(devices, ep0, *refr)
                        .map(|ep| ep.interval_elapsed)
                        .unwrap_or(true)
                });
                if let Some(idx) = ready {
                    self.active_interrupt = self.interrupt_queue.remove(idx);
                }
            }
            let Some(refr) = self.active_interrupt else {
                self.interrupt_done = true;
                return;
            };

            let speed = target_speed(ctx.devices, refr.address());
            let EngineCtx { bus, devices, ep0 } = ctx;
            let Some(ep) = resolve(devices, ep0, refr) else {
                self.active_interrupt = None;
                continue;
            };

            use TransferPhase::*;
            match ep.phase {
                InterruptIn(InterruptPhase::Data) | InterruptOut(InterruptPhase::Data) => {
                    // Tokens go out only in the frame the polling interval
                    // elapses, and a NAK is not retried within that frame.
                    if !ep.interval_elapsed || ep.last_nak {
                        self.interrupt_done = true;
                        return;
                    }
                    let token = if ep.direction_in() { Token::In } else { Token::Out };
                    let remaining = ep.budget - ep.transferred;
                    let packet = remaining.min(ep.max_packet_size as usize);
                    match token {
                        Token::Out => {
                            let start = ep.transferred;
                            let payload = ep.buffer[start..start + packet].to_vec();
                            self.send(*bus, ep, refr, speed, token, &payload, packet);
                        }
                        _ => self.send(*bus, ep, refr, speed, token, &[], packet),
                    }
                    return;
                }
                InterruptIn(InterruptPhase::Complete) | InterruptOut(InterruptPhase::Complete) => {
                    self.finish(ep, refr, TransferClass::Interrupt);
                }
                _ => {
                    if ep.fault.is_none() {
                        ep.fault = Some(EndpointFault::Bus(crate::hal::BusFault::BusTimeout));
                    }
                    self.finish(ep, refr, TransferClass::Interrupt);
                }
            }
        }
    }

    fn send<B: HostBus + ?Sized>(
        &mut self,
        bus: &mut B,
        ep: &mut EndpointRecord,
        refr: TransferRef,
        speed: UsbSpeed,
        token: Token,
        data: &[u8],
        packet_size: usize,
    ) {
        let toggle = if ep.toggle {
            DataToggle::Data1
        } else {
            DataToggle::Data0
        };
        let req = TokenRequest {
            address: refr.address(),
            speed,
            endpoint: ep.number(),
            token,
            transfer_type: ep.transfer_type,
            toggle,
            toggle_check: ep.toggle_check,
            packet_size,
        };
        trace!(?token, address = req.address, endpoint = req.endpoint, packet_size, "token out");
        bus.submit(&req, data);
        self.in_flight = Some(match ep.transfer_type {
            TransferType::Control => TransferClass::Control,
            _ => TransferClass::Interrupt,
        });
    }

    fn finish(&mut self, ep: &mut EndpointRecord, refr: TransferRef, class: TransferClass) {
        ep.phase = TransferPhase::Idle;
        ep.complete = true;

        let fault = ep.fault;
        // Control transfers live on endpoint 0; their data direction comes
        // from the SETUP packet, not the endpoint address.
        let is_in = match ep.transfer_type {
            TransferType::Control => ep.setup[0] & 0x80 != 0,
            _ => ep.direction_in(),
        };
        let data = if fault.is_none() && is_in {
            let len = ep.transferred.min(ep.buffer.len());
            ep.buffer[..len].to_vec()
        } else {
            Vec::new()
        };
        debug!(?refr, ?fault, len = ep.transferred, "transfer complete");
        self.completions.push_back(CompletedTransfer {
            address: refr.address(),
            endpoint: ep.address,
            owner: ep.owner,
            data,
            len: ep.transferred,
            fault,
        });

        match class {
            TransferClass::Control => self.active_control = None,
            TransferClass::Interrupt => self.active_interrupt = None,
        }
    }
}

enum ControlAction {
    Setup,
    Data(Token),
    Status(Token),
    Finish,
    FinishError,
}

fn target_speed(devices: &DeviceTable, address: u8) -> UsbSpeed {
    if address == 0 {
        devices.staging().speed
    } else {
        devices.get(address).map(|d| d.speed).unwrap_or_default()
    }
}

fn resolve<'r>(
    devices: &'r mut DeviceTable,
    ep0: &'r mut EndpointRecord,
    refr: TransferRef,
) -> Option<&'r mut EndpointRecord> {
    match refr {
        // EP0 transfers keep running even if the target slot vanished; the
        // bus times out on the absent address and the transfer fails through
        // the normal retry ceiling instead of wedging the shared endpoint.
        TransferRef::Control0 { .. } => Some(ep0),
        TransferRef::Endpoint { address, endpoint } => {
            devices.get_mut(address)?.find_endpoint_mut(endpoint)
        }
    }
}
