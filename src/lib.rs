//! `picohost` is a host-side USB 1.1 protocol stack for embedded full-speed
//! controllers: it enumerates one attached device (directly or through one
//! tier of an external hub), negotiates its configuration, and multiplexes
//! control and interrupt transfers between the hardware and class drivers.
//!
//! The hardware lives behind the [`hal::HostBus`] trait; the application
//! drives the stack with [`host::UsbHost::poll`] from its main loop,
//! [`host::UsbHost::tick_1ms`] from a millisecond tick, and the `isr_*`
//! entry points from the controller's interrupt handler. Class drivers
//! implement [`client::ClientDriver`] and are selected through the targeted
//! peripheral list ([`client::TplEntry`]).

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod hal;
pub mod host;
pub mod hub;
pub mod parse;
pub mod transfer;
pub mod usb;

pub use client::{
    ClientDriver, DefaultHook, DeviceStatus, DriverEntry, DriverEvent, DriverOwner, EventHook,
    HostServices, TplEntry, TplTarget,
};
pub use config::HostConfig;
pub use error::{EndpointFault, HoldReason, RequestError};
pub use hal::{BusFault, HostBus, IrqSource, TokenOutcome, TokenRequest};
pub use host::{HostState, UsbHost};
pub use hub::HubDriver;
pub use usb::{SetupPacket, Token, UsbSpeed};
