//! Hardware abstraction boundary.
//!
//! The stack drives the bus through [`HostBus`] and never touches registers
//! directly. A real implementation wraps a full-speed host controller
//! (token register, buffer-descriptor arming, status/error registers); the
//! test suite provides a simulated one backed by emulated devices.

use crate::usb::{DataToggle, Token, TransferType, UsbSpeed};

bitflags::bitflags! {
    /// Interrupt sources the stack asks the HAL to gate.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct IrqSource: u8 {
        const ATTACH   = 1 << 0;
        const DETACH   = 1 << 1;
        const TRANSFER = 1 << 2;
        const SOF      = 1 << 3;
        const ERROR    = 1 << 4;
        const TIMER_1MS = 1 << 5;
    }
}

/// One token the engine wants on the wire next.
#[derive(Clone, Copy, Debug)]
pub struct TokenRequest {
    pub address: u8,
    pub speed: UsbSpeed,
    pub endpoint: u8,
    pub token: Token,
    pub transfer_type: TransferType,
    pub toggle: DataToggle,
    /// Whether the controller should reject packets with the wrong toggle.
    pub toggle_check: bool,
    /// Byte budget for this packet (payload length for OUT/SETUP, maximum
    /// accepted length for IN).
    pub packet_size: usize,
}

/// Low-level fault classes reported by the controller's error register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BusFault {
    Crc,
    BitStuff,
    BusTimeout,
    DataField,
    PidCheck,
    EndOfFrame,
    Dma,
}

/// Result of the last completed transaction, read after the transfer-done
/// (or error) interrupt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenOutcome {
    /// Device handshook an OUT/SETUP, or an IN produced a DATAx packet of
    /// `bytes` payload bytes.
    Ack { bytes: usize },
    Nak,
    Stall,
    Fault(BusFault),
}

/// Everything the stack needs from the USB host peripheral.
pub trait HostBus {
    /// Arms the buffer descriptor and writes the token register. For OUT and
    /// SETUP tokens `data` is the packet payload; for IN it is empty and
    /// `req.packet_size` bounds the reception.
    fn submit(&mut self, req: &TokenRequest, data: &[u8]);

    /// Reads the transaction status after a transfer-done interrupt.
    fn outcome(&mut self) -> TokenOutcome;

    /// Copies the payload of the last completed IN transaction. Returns the
    /// number of bytes written into `buf`.
    fn copy_received(&mut self, buf: &mut [u8]) -> usize;

    /// Drives bus reset signalling.
    fn assert_reset(&mut self, on: bool);

    /// Drives resume signalling out of suspend.
    fn signal_resume(&mut self, on: bool);

    /// Starts or stops start-of-frame generation.
    fn enable_sof(&mut self, on: bool);

    /// Switches VBUS to the root port.
    fn port_power(&mut self, on: bool);

    /// Samples the line state to classify the attached device's speed. Only
    /// meaningful while a device is attached.
    fn attached_speed(&self) -> UsbSpeed;

    /// Enables or disables one interrupt source.
    fn irq_control(&mut self, source: IrqSource, enabled: bool);
}
