//! USB 2.0 chapter-9 wire-level types and constants.
//!
//! Everything here is bit-exact per the USB 2.0 specification: SETUP packet
//! layout, standard descriptor layouts, and the standard/hub-class request
//! codes. Higher layers never touch raw descriptor bytes without going
//! through the typed views in this module.

pub const DESC_DEVICE: u8 = 0x01;
pub const DESC_CONFIGURATION: u8 = 0x02;
pub const DESC_STRING: u8 = 0x03;
pub const DESC_INTERFACE: u8 = 0x04;
pub const DESC_ENDPOINT: u8 = 0x05;
pub const DESC_HUB: u8 = 0x29;

pub const REQ_GET_STATUS: u8 = 0x00;
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
pub const REQ_SET_FEATURE: u8 = 0x03;
pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_DESCRIPTOR: u8 = 0x07;
pub const REQ_GET_CONFIGURATION: u8 = 0x08;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
pub const REQ_GET_INTERFACE: u8 = 0x0A;
pub const REQ_SET_INTERFACE: u8 = 0x0B;

pub const FEATURE_ENDPOINT_HALT: u16 = 0x0000;
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 0x0001;

// bmRequestType direction/type/recipient fields (USB 2.0 table 9-2).
pub const SETUP_DEVICE_TO_HOST: u8 = 0x80;
pub const SETUP_HOST_TO_DEVICE: u8 = 0x00;
pub const SETUP_TYPE_STANDARD: u8 = 0x00;
pub const SETUP_TYPE_CLASS: u8 = 0x20;
pub const SETUP_TYPE_VENDOR: u8 = 0x40;
pub const SETUP_RECIPIENT_DEVICE: u8 = 0x00;
pub const SETUP_RECIPIENT_INTERFACE: u8 = 0x01;
pub const SETUP_RECIPIENT_ENDPOINT: u8 = 0x02;
pub const SETUP_RECIPIENT_OTHER: u8 = 0x03;

pub const CLASS_HUB: u8 = 0x09;
pub const CLASS_HID: u8 = 0x03;

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIG_DESCRIPTOR_HEADER_LEN: usize = 9;
pub const INTERFACE_DESCRIPTOR_LEN: usize = 9;
pub const ENDPOINT_DESCRIPTOR_LEN: usize = 7;

/// Default EP0 max packet size assumed until `bMaxPacketSize0` is read.
pub const EP0_DEFAULT_MAX_PACKET: u16 = 64;

/// The eight-byte SETUP stage payload of a control transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction of the data stage, from bit 7 of `bmRequestType`.
    pub fn is_in(&self) -> bool {
        self.request_type & SETUP_DEVICE_TO_HOST != 0
    }

    pub fn get_descriptor(desc_type: u8, desc_index: u8, length: u16) -> Self {
        Self {
            request_type: SETUP_DEVICE_TO_HOST | SETUP_TYPE_STANDARD | SETUP_RECIPIENT_DEVICE,
            request: REQ_GET_DESCRIPTOR,
            value: (u16::from(desc_type) << 8) | u16::from(desc_index),
            index: 0,
            length,
        }
    }

    pub fn set_address(address: u8) -> Self {
        Self {
            request_type: SETUP_HOST_TO_DEVICE | SETUP_TYPE_STANDARD | SETUP_RECIPIENT_DEVICE,
            request: REQ_SET_ADDRESS,
            value: u16::from(address),
            index: 0,
            length: 0,
        }
    }

    pub fn set_configuration(value: u8) -> Self {
        Self {
            request_type: SETUP_HOST_TO_DEVICE | SETUP_TYPE_STANDARD | SETUP_RECIPIENT_DEVICE,
            request: REQ_SET_CONFIGURATION,
            value: u16::from(value),
            index: 0,
            length: 0,
        }
    }

    pub fn get_string_descriptor(string_index: u8, lang_id: u16, length: u16) -> Self {
        Self {
            request_type: SETUP_DEVICE_TO_HOST | SETUP_TYPE_STANDARD | SETUP_RECIPIENT_DEVICE,
            request: REQ_GET_DESCRIPTOR,
            value: (u16::from(DESC_STRING) << 8) | u16::from(string_index),
            index: lang_id,
            length,
        }
    }
}

/// Bus-level token kinds the host can issue. The HAL maps these to the
/// controller's PID encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Token {
    Setup,
    In,
    Out,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UsbSpeed {
    #[default]
    Full,
    Low,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    In,
    Out,
}

/// Endpoint transfer type from `bmAttributes` bits 1..0.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransferType {
    #[default]
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub fn from_attributes(bm_attributes: u8) -> Self {
        match bm_attributes & 0x03 {
            0x00 => TransferType::Control,
            0x01 => TransferType::Isochronous,
            0x02 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Data toggle selector for the next token.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataToggle {
    Data0,
    Data1,
    /// Keep the endpoint's current toggle value.
    Keep,
}

/// Typed view of a complete 18-byte device descriptor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub usb_release: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parses a device descriptor. `bytes` must hold at least the full
    /// 18-byte layout; the first 8 bytes alone are handled by
    /// [`DeviceDescriptor::peek`].
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DEVICE_DESCRIPTOR_LEN || bytes[1] != DESC_DEVICE {
            return None;
        }
        Some(Self {
            length: bytes[0],
            usb_release: u16::from_le_bytes([bytes[2], bytes[3]]),
            device_class: bytes[4],
            device_subclass: bytes[5],
            device_protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: u16::from_le_bytes([bytes[8], bytes[9]]),
            product_id: u16::from_le_bytes([bytes[10], bytes[11]]),
            device_release: u16::from_le_bytes([bytes[12], bytes[13]]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_index: bytes[16],
            num_configurations: bytes[17],
        })
    }

    /// Reads the fields available in the first 8 bytes: `bLength`,
    /// `bDeviceClass` and `bMaxPacketSize0`. This is what the enumeration
    /// machine's initial short read has to work with.
    pub fn peek(bytes: &[u8]) -> Option<(u8, u8, u8)> {
        if bytes.len() < 8 || bytes[1] != DESC_DEVICE {
            return None;
        }
        Some((bytes[0], bytes[4], bytes[7]))
    }
}

/// Typed view of the 9-byte configuration descriptor header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConfigDescriptorHeader {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power_2ma: u8,
}

impl ConfigDescriptorHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CONFIG_DESCRIPTOR_HEADER_LEN || bytes[1] != DESC_CONFIGURATION {
            return None;
        }
        Some(Self {
            total_length: u16::from_le_bytes([bytes[2], bytes[3]]),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            attributes: bytes[7],
            max_power_2ma: bytes[8],
        })
    }
}

/// Typed view of a 9-byte interface descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

impl InterfaceDescriptor {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < INTERFACE_DESCRIPTOR_LEN || bytes[1] != DESC_INTERFACE {
            return None;
        }
        Some(Self {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            interface_class: bytes[5],
            interface_subclass: bytes[6],
            interface_protocol: bytes[7],
        })
    }
}

/// Typed view of a 7-byte endpoint descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ENDPOINT_DESCRIPTOR_LEN || bytes[1] != DESC_ENDPOINT {
            return None;
        }
        Some(Self {
            endpoint_address: bytes[2],
            attributes: bytes[3],
            max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]),
            interval: bytes[6],
        })
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }

    pub fn direction(&self) -> Direction {
        if self.endpoint_address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}
