//! Configuration-descriptor parsing.
//!
//! Walks a fully retrieved configuration blob descriptor-by-descriptor and
//! builds the owned interface/alt-setting/endpoint tree. The walk either
//! produces a complete [`ParsedConfig`] or an error with nothing retained;
//! partially built records never leak into the device slot.

use thiserror::Error;
use tracing::{debug, trace};

use crate::client::{find_class_driver, DriverOwner, EventHook, TplEntry};
use crate::device::{AltSetting, DriverSelection, EndpointRecord, InterfaceRecord};
use crate::usb::{
    ConfigDescriptorHeader, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
    TransferType, DESC_ENDPOINT, DESC_INTERFACE,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ParseError {
    #[error("descriptor walk ran off the blob")]
    Malformed,
    #[error("application denied the configuration's power request")]
    InsufficientPower,
    #[error("interface declared more endpoints than it carries")]
    MissingEndpoints,
    #[error("no interface of the configuration is supported")]
    NoSupportedInterfaces,
}

/// A successfully parsed configuration: the complete interface tree plus
/// the identification the enumeration machine stores on the device slot.
#[derive(Debug)]
pub struct ParsedConfig {
    pub configuration_value: u8,
    pub max_power_2ma: u8,
    pub interfaces: Vec<InterfaceRecord>,
}

/// Parses one raw configuration descriptor against the targeted peripheral
/// list. `selection` carries the device-level driver override resolved
/// before addressing; `device` feeds the application's driver-selection
/// veto.
pub fn parse_configuration(
    raw: &[u8],
    device: &DeviceDescriptor,
    selection: &DriverSelection,
    tpl: &[TplEntry],
    hook: &mut dyn EventHook,
) -> Result<ParsedConfig, ParseError> {
    let header = ConfigDescriptorHeader::parse(raw).ok_or(ParseError::Malformed)?;
    let total = (header.total_length as usize).min(raw.len());

    // The configuration's power draw needs application approval before any
    // record is built.
    if !hook.request_power(0, u16::from(header.max_power_2ma)) {
        return Err(ParseError::InsufficientPower);
    }

    let mut interfaces: Vec<InterfaceRecord> = Vec::new();
    let mut index = raw[0] as usize;

    while index + 2 <= total {
        let len = raw[index] as usize;
        if len == 0 || index + len > total {
            return Err(ParseError::Malformed);
        }
        if raw[index + 1] != DESC_INTERFACE {
            // Class- and vendor-specific descriptors between interfaces are
            // skipped by their self-declared length.
            index += len;
            continue;
        }

        let iface =
            InterfaceDescriptor::parse(&raw[index..total]).ok_or(ParseError::Malformed)?;
        index += len;

        // Resolve the client driver: a whole-device driver claims every
        // interface, otherwise the TPL is searched per interface.
        let driver = match selection.device_driver {
            Some(driver) => Some(driver),
            None => find_class_driver(
                tpl,
                device,
                iface.interface_class,
                iface.interface_subclass,
                iface.interface_protocol,
                hook,
            ),
        };
        let Some(driver) = driver else {
            trace!(
                interface = iface.interface_number,
                class = iface.interface_class,
                "no driver for interface, skipping"
            );
            index = skip_setting(raw, total, index)?;
            continue;
        };

        // Collect this setting's endpoints, stopping at the next interface.
        let mut endpoints = Vec::new();
        while index + 2 <= total && endpoints.len() < iface.num_endpoints as usize {
            let len = raw[index] as usize;
            if len == 0 || index + len > total {
                return Err(ParseError::Malformed);
            }
            match raw[index + 1] {
                DESC_INTERFACE => break,
                DESC_ENDPOINT => {
                    let ed = EndpointDescriptor::parse(&raw[index..index + len])
                        .ok_or(ParseError::Malformed)?;
                    endpoints.push(build_endpoint(&ed, driver));
                }
                _ => {}
            }
            index += len;
        }
        if endpoints.len() < iface.num_endpoints as usize {
            debug!(
                interface = iface.interface_number,
                declared = iface.num_endpoints,
                found = endpoints.len(),
                "endpoint shortfall, configuration unusable"
            );
            return Err(ParseError::MissingEndpoints);
        }

        let setting = AltSetting {
            alternate: iface.alternate_setting,
            endpoints,
        };

        match interfaces
            .iter_mut()
            .find(|i| i.number == iface.interface_number)
        {
            Some(existing) => {
                existing.settings.push(setting);
                if iface.alternate_setting == 0 {
                    existing.current_setting = existing.settings.len() - 1;
                }
            }
            None => {
                interfaces.push(InterfaceRecord {
                    number: iface.interface_number,
                    driver,
                    settings: vec![setting],
                    current_setting: 0,
                });
            }
        }
    }

    if interfaces.is_empty() {
        return Err(ParseError::NoSupportedInterfaces);
    }

    Ok(ParsedConfig {
        configuration_value: header.configuration_value,
        max_power_2ma: header.max_power_2ma,
        interfaces,
    })
}

/// Skips everything belonging to an unsupported interface setting, up to
/// the next interface descriptor.
fn skip_setting(raw: &[u8], total: usize, mut index: usize) -> Result<usize, ParseError> {
    while index + 2 <= total {
        let len = raw[index] as usize;
        if len == 0 || index + len > total {
            return Err(ParseError::Malformed);
        }
        if raw[index + 1] == DESC_INTERFACE {
            break;
        }
        index += len;
    }
    Ok(index)
}

fn build_endpoint(ed: &EndpointDescriptor, driver: u8) -> EndpointRecord {
    let transfer_type = ed.transfer_type();

    // Isochronous intervals are a 1..=16 power-of-two exponent; everything
    // else polls in whole frames.
    let interval = match transfer_type {
        TransferType::Isochronous => {
            let exp = ed.interval.clamp(1, 16);
            1u16 << (exp - 1)
        }
        _ => u16::from(ed.interval),
    };

    let mut ep = EndpointRecord::new(
        ed.endpoint_address,
        transfer_type,
        ed.max_packet_size,
        interval,
        DriverOwner::Client(driver),
    );
    if transfer_type == TransferType::Isochronous {
        ep.toggle_check = false;
    }
    ep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DefaultHook;

    const KEYBOARD_DRIVER: u8 = 1;

    fn hid_keyboard_tpl() -> Vec<TplEntry> {
        vec![TplEntry::class(0x03, 0x01, 0x01, KEYBOARD_DRIVER)]
    }

    /// Config(9) + Interface(9, HID boot keyboard) + HID(9) + Endpoint(7).
    fn hid_keyboard_config() -> Vec<u8> {
        let mut raw = vec![
            0x09, 0x02, 34, 0x00, 0x01, 0x01, 0x00, 0xA0, 50, // configuration
            0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00, // interface
            0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 63, 0x00, // HID class descriptor
            0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A, // interrupt IN endpoint
        ];
        let total = raw.len() as u16;
        raw[2..4].copy_from_slice(&total.to_le_bytes());
        raw
    }

    fn parse(raw: &[u8], tpl: &[TplEntry]) -> Result<ParsedConfig, ParseError> {
        parse_configuration(
            raw,
            &DeviceDescriptor::default(),
            &DriverSelection::default(),
            tpl,
            &mut DefaultHook,
        )
    }

    #[test]
    fn hid_keyboard_config_builds_one_interface_tree() {
        let parsed = parse(&hid_keyboard_config(), &hid_keyboard_tpl()).unwrap();
        assert_eq!(parsed.configuration_value, 1);
        assert_eq!(parsed.interfaces.len(), 1);

        let iface = &parsed.interfaces[0];
        assert_eq!(iface.driver, KEYBOARD_DRIVER);
        assert_eq!(iface.current().endpoints.len(), 1);

        let ep = &iface.current().endpoints[0];
        assert_eq!(ep.address, 0x81);
        assert_eq!(ep.transfer_type, TransferType::Interrupt);
        assert_eq!(ep.max_packet_size, 8);
        assert_eq!(ep.interval, 10);
        assert!(ep.complete, "fresh endpoints start idle/complete");
    }

    #[test]
    fn unmatched_interface_is_skipped_not_fatal() {
        // Vendor interface (no TPL entry) followed by the keyboard.
        let mut raw = vec![
            0x09, 0x02, 0, 0, 0x02, 0x01, 0x00, 0xA0, 50, // configuration
            0x09, 0x04, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00, // vendor interface
            0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00, // its bulk endpoint
            0x09, 0x04, 0x01, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00, // keyboard interface
            0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A, // interrupt IN endpoint
        ];
        let total = raw.len() as u16;
        raw[2..4].copy_from_slice(&total.to_le_bytes());

        let parsed = parse(&raw, &hid_keyboard_tpl()).unwrap();
        assert_eq!(parsed.interfaces.len(), 1);
        assert_eq!(parsed.interfaces[0].number, 1);
    }

    #[test]
    fn endpoint_shortfall_fails_with_nothing_retained() {
        // Interface declares two endpoints, carries one.
        let mut raw = vec![
            0x09, 0x02, 0, 0, 0x01, 0x01, 0x00, 0xA0, 50, // configuration
            0x09, 0x04, 0x00, 0x00, 0x02, 0x03, 0x01, 0x01, 0x00, // interface
            0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A, // only endpoint
        ];
        let total = raw.len() as u16;
        raw[2..4].copy_from_slice(&total.to_le_bytes());

        assert_eq!(
            parse(&raw, &hid_keyboard_tpl()).unwrap_err(),
            ParseError::MissingEndpoints
        );
    }

    #[test]
    fn alternate_settings_collect_under_one_interface() {
        let mut raw = vec![
            0x09, 0x02, 0, 0, 0x01, 0x01, 0x00, 0xA0, 50, // configuration
            0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00, // alt 0
            0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A, // alt 0 endpoint
            0x09, 0x04, 0x00, 0x01, 0x01, 0x03, 0x01, 0x01, 0x00, // alt 1
            0x07, 0x05, 0x81, 0x03, 0x10, 0x00, 0x05, // alt 1 endpoint
        ];
        let total = raw.len() as u16;
        raw[2..4].copy_from_slice(&total.to_le_bytes());

        let parsed = parse(&raw, &hid_keyboard_tpl()).unwrap();
        assert_eq!(parsed.interfaces.len(), 1);
        let iface = &parsed.interfaces[0];
        assert_eq!(iface.settings.len(), 2);
        // Alternate 0 is current regardless of descriptor order.
        assert_eq!(iface.settings[iface.current_setting].alternate, 0);
        assert_eq!(iface.settings[1].endpoints[0].max_packet_size, 16);
    }

    #[test]
    fn isochronous_interval_is_power_of_two_normalized() {
        let mut raw = vec![
            0x09, 0x02, 0, 0, 0x01, 0x01, 0x00, 0xA0, 50, // configuration
            0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00, // interface
            0x07, 0x05, 0x83, 0x01, 0x40, 0x00, 0x04, // isochronous, exponent 4
        ];
        let total = raw.len() as u16;
        raw[2..4].copy_from_slice(&total.to_le_bytes());

        let parsed = parse(&raw, &hid_keyboard_tpl()).unwrap();
        let ep = &parsed.interfaces[0].current().endpoints[0];
        assert_eq!(ep.interval, 8);
        assert!(!ep.toggle_check);
    }

    #[test]
    fn denied_power_request_rejects_the_configuration() {
        struct NoPower;
        impl EventHook for NoPower {
            fn request_power(&mut self, _port: u8, _current: u16) -> bool {
                false
            }
        }
        let err = parse_configuration(
            &hid_keyboard_config(),
            &DeviceDescriptor::default(),
            &DriverSelection::default(),
            &hid_keyboard_tpl(),
            &mut NoPower,
        )
        .unwrap_err();
        assert_eq!(err, ParseError::InsufficientPower);
    }

    #[test]
    fn no_supported_interface_rejects_the_configuration() {
        let mut raw = vec![
            0x09, 0x02, 0, 0, 0x01, 0x01, 0x00, 0xA0, 50, // configuration
            0x09, 0x04, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00, // vendor interface
            0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00, // bulk endpoint
        ];
        let total = raw.len() as u16;
        raw[2..4].copy_from_slice(&total.to_le_bytes());

        assert_eq!(
            parse(&raw, &hid_keyboard_tpl()).unwrap_err(),
            ParseError::NoSupportedInterfaces
        );
    }
}
