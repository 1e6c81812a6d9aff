//! Client-driver interface: the targeted peripheral list, the driver trait
//! and registration table, completion events, and the application policy
//! hook.

use crate::error::{EndpointFault, HoldReason, RequestError};
use crate::usb::{DeviceDescriptor, SetupPacket, UsbSpeed};

/// Who owns a transfer and receives its completion event.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DriverOwner {
    /// The host's own enumeration machinery; completions are consumed by
    /// the state machine, not dispatched.
    #[default]
    Host,
    /// Index into the registered client-driver table.
    Client(u8),
}

/// What a targeted-peripheral-list entry matches on.
#[derive(Clone, Copy, Debug)]
pub enum TplTarget {
    /// Specific device by vendor/product ID. `ignore_pid` widens the match
    /// to every product of the vendor.
    VidPid { vid: u16, pid: u16, ignore_pid: bool },
    /// Global wildcard used for unconditional fallback drivers.
    AnyVidPid,
    /// Class/subclass/protocol triple, any field individually wildcarded.
    Class {
        class: u8,
        subclass: u8,
        protocol: u8,
        ignore_class: bool,
        ignore_subclass: bool,
        ignore_protocol: bool,
    },
}

/// One entry of the targeted peripheral list. Lookup is in table order;
/// first match wins.
#[derive(Clone, Copy, Debug)]
pub struct TplEntry {
    pub target: TplTarget,
    /// Index of the client driver in the registration table.
    pub driver: u8,
    /// Configuration value to force for this device, skipping automatic
    /// selection.
    pub configuration: Option<u8>,
    /// The driver claims endpoint 0 only; interfaces still match class
    /// entries independently.
    pub ep0_only: bool,
}

impl TplEntry {
    pub fn class(class: u8, subclass: u8, protocol: u8, driver: u8) -> Self {
        Self {
            target: TplTarget::Class {
                class,
                subclass,
                protocol,
                ignore_class: false,
                ignore_subclass: false,
                ignore_protocol: false,
            },
            driver,
            configuration: None,
            ep0_only: false,
        }
    }

    pub fn vid_pid(vid: u16, pid: u16, driver: u8) -> Self {
        Self {
            target: TplTarget::VidPid {
                vid,
                pid,
                ignore_pid: false,
            },
            driver,
            configuration: None,
            ep0_only: false,
        }
    }
}

/// Candidate passed to the application's driver-selection override.
#[derive(Clone, Copy, Debug)]
pub struct DriverCandidate {
    pub vid: u16,
    pub pid: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Result of matching a device descriptor against the TPL before
/// addressing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceMatch {
    pub device_driver: Option<u8>,
    pub ep0_driver: Option<u8>,
    pub forced_configuration: Option<u8>,
}

/// Matches an interface's class triple against the TPL. Returns the driver
/// index of the first matching class entry the application does not veto.
pub fn find_class_driver(
    tpl: &[TplEntry],
    desc: &DeviceDescriptor,
    class: u8,
    subclass: u8,
    protocol: u8,
    hook: &mut dyn EventHook,
) -> Option<u8> {
    for entry in tpl {
        let TplTarget::Class {
            class: c,
            subclass: s,
            protocol: p,
            ignore_class,
            ignore_subclass,
            ignore_protocol,
        } = entry.target
        else {
            continue;
        };
        if (ignore_class || c == class)
            && (ignore_subclass || s == subclass)
            && (ignore_protocol || p == protocol)
        {
            let candidate = DriverCandidate {
                vid: desc.vendor_id,
                pid: desc.product_id,
                class,
                subclass,
                protocol,
            };
            if !hook.override_driver_selection(&candidate) {
                return Some(entry.driver);
            }
        }
    }
    None
}

/// Matches the whole device against the TPL once per attach, before
/// addressing. Device-level class matches are exact (no wildcards);
/// VID/PID matches may designate a whole-device driver, an EP0-only
/// driver, or (for the global wildcard) an application-approved fallback.
pub fn find_device_level_driver(
    tpl: &[TplEntry],
    desc: &DeviceDescriptor,
    hook: &mut dyn EventHook,
) -> DeviceMatch {
    let mut matched = DeviceMatch::default();
    for entry in tpl {
        match entry.target {
            TplTarget::Class {
                class,
                subclass,
                protocol,
                ..
            } => {
                if class == desc.device_class
                    && subclass == desc.device_subclass
                    && protocol == desc.device_protocol
                {
                    matched.device_driver = Some(entry.driver);
                }
            }
            TplTarget::VidPid {
                vid,
                pid,
                ignore_pid,
            } => {
                if vid == desc.vendor_id && (ignore_pid || pid == desc.product_id) {
                    if entry.ep0_only {
                        matched.ep0_driver = Some(entry.driver);
                        if entry.configuration.is_some() {
                            matched.forced_configuration = entry.configuration;
                        }
                        continue;
                    }
                    matched.device_driver = Some(entry.driver);
                }
            }
            TplTarget::AnyVidPid => {
                let candidate = DriverCandidate {
                    vid: desc.vendor_id,
                    pid: desc.product_id,
                    class: desc.device_class,
                    subclass: desc.device_subclass,
                    protocol: desc.device_protocol,
                };
                if !hook.override_driver_selection(&candidate) {
                    matched.device_driver = Some(entry.driver);
                }
            }
        }
        if matched.device_driver.is_some() {
            if entry.configuration.is_some() {
                matched.forced_configuration = entry.configuration;
            }
            break;
        }
    }
    matched
}

/// Current state of the host, as reported to drivers and the application.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceStatus {
    Detached,
    Enumerating,
    Running { address: u8 },
    Suspended { address: u8 },
    Holding(HoldReason),
}

/// Events delivered to client drivers.
#[derive(Debug)]
pub enum DriverEvent<'a> {
    /// The device the driver was bound to is gone.
    Detach,
    /// A transfer owned by this driver finished successfully. For IN
    /// transfers `data` is the received payload.
    TransferComplete { endpoint: u8, data: &'a [u8] },
    /// A transfer owned by this driver finished with an error that must be
    /// acknowledged via `clear_endpoint_errors` before the endpoint is
    /// reused.
    BusError { endpoint: u8, fault: EndpointFault },
    /// A downstream device on one of this driver's hub ports failed to
    /// enumerate and has been detached; the port should be disabled.
    PortDeviceFailed { device_address: u8 },
    Suspend,
    Resume,
}

/// Host operations a client driver may invoke re-entrantly from its event
/// handler or poll function.
pub trait HostServices {
    /// Queues a control transfer on endpoint 0 of `address`. For OUT data
    /// stages `data_out` carries the payload; IN data arrives in the
    /// completion event.
    fn issue_control(
        &mut self,
        address: u8,
        setup: SetupPacket,
        data_out: Option<&[u8]>,
        owner: DriverOwner,
    ) -> Result<(), RequestError>;

    /// Queues an interrupt IN transfer of up to `len` bytes.
    fn interrupt_in(&mut self, address: u8, endpoint: u8, len: usize) -> Result<(), RequestError>;

    /// Queues an interrupt OUT transfer of `data`.
    fn interrupt_out(
        &mut self,
        address: u8,
        endpoint: u8,
        data: &[u8],
    ) -> Result<(), RequestError>;

    /// Hands a freshly enabled hub port to the enumeration machine. Returns
    /// false if the host is not in a state that can take a new device.
    fn attach_on_hub(&mut self, hub_address: u8, port: u8, speed: UsbSpeed) -> bool;

    /// Detaches a device that lives behind a hub port: clients are notified,
    /// the address slot is cleared, and the owning hub driver receives
    /// [`DriverEvent::PortDeviceFailed`].
    fn detach_on_hub(&mut self, hub_address: u8, device_address: u8);

    fn device_status(&self) -> DeviceStatus;

    /// Raw selected configuration descriptor of an enumerated device.
    fn configuration_descriptor(&self, address: u8) -> Option<&[u8]>;

    /// Parsed device descriptor of an enumerated device.
    fn device_descriptor(&self, address: u8) -> Option<DeviceDescriptor>;

    /// Whether the device matched the TPL at device level (by VID/PID or
    /// device class), letting class drivers accept nonconforming devices.
    fn device_has_device_level_driver(&self, address: u8) -> bool;

    fn clear_endpoint_errors(&mut self, address: u8, endpoint: u8) -> Result<(), RequestError>;

    fn terminate_transfer(&mut self, address: u8, endpoint: u8) -> Result<(), RequestError>;
}

/// A class or vendor driver layered on the host stack. Implementations are
/// registered in a table; TPL entries select them by index.
pub trait ClientDriver {
    /// Called once the device reaches the configured state. Returning false
    /// fails enumeration with a client-init error.
    fn initialize(
        &mut self,
        services: &mut dyn HostServices,
        address: u8,
        flags: u32,
        driver_id: u8,
    ) -> bool;

    /// Delivers one event. Returns whether the driver handled it.
    fn event(
        &mut self,
        services: &mut dyn HostServices,
        address: u8,
        event: &DriverEvent<'_>,
    ) -> bool;

    /// Cooperative work outside event context, called from the host's poll
    /// loop. Drivers that only react to events keep the default.
    fn poll(&mut self, _services: &mut dyn HostServices) {}

    /// Millisecond tick for driver-internal timers.
    fn tick_1ms(&mut self) {}
}

/// One registered driver plus the flags passed to its initializer.
pub struct DriverEntry {
    pub driver: Box<dyn ClientDriver>,
    pub init_flags: u32,
}

impl DriverEntry {
    pub fn new(driver: Box<dyn ClientDriver>) -> Self {
        Self {
            driver,
            init_flags: 0,
        }
    }
}

/// Application policy hook. The default implementation of every method is
/// the permissive policy: approve power, never override driver selection,
/// never hold configuration.
pub trait EventHook {
    /// Approve or deny a power request (2 mA units) for a port.
    fn request_power(&mut self, _port: u8, _current_2ma: u16) -> bool {
        true
    }

    fn release_power(&mut self, _port: u8) {}

    /// Returning true vetoes the automatic driver selection for this
    /// candidate.
    fn override_driver_selection(&mut self, _candidate: &DriverCandidate) -> bool {
        false
    }

    /// Returning true holds the state machine just before SET_CONFIGURATION
    /// until a later poll returns false.
    fn hold_before_configuration(&mut self, _address: u8) -> bool {
        false
    }

    /// Terminal enumeration failure, reported exactly once per hold.
    fn enumeration_failed(&mut self, _address: u8, _reason: HoldReason) {}
}

/// The always-succeed policy used when the application supplies no hook.
#[derive(Debug, Default)]
pub struct DefaultHook;

impl EventHook for DefaultHook {}
