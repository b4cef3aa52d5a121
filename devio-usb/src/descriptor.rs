//! Standard USB descriptor parsing.
//!
//! Descriptors arrive as the little-endian byte chains the device
//! reported; the parsers here validate structure and lift them into owned
//! values. Configuration chains are parsed the strict way: interface
//! descriptors must arrive grouped with sequential alternate settings, and
//! every interface must end with exactly the endpoint count it declared.

use devio_dispatch::{Error, Result};

pub(crate) const DT_DEVICE: u8 = 1;
pub(crate) const DT_CONFIG: u8 = 2;
pub(crate) const DT_STRING: u8 = 3;
const DT_INTERFACE: u8 = 4;
const DT_ENDPOINT: u8 = 5;

/// Size of a device descriptor on the wire.
pub const DEVICE_DESCRIPTOR_LENGTH: usize = 18;

fn u16_le(raw: &[u8]) -> u16 {
    u16::from_le_bytes([raw[0], raw[1]])
}

/// The standard device descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Descriptor size in bytes, always 18.
    pub length: u8,
    /// Descriptor type, always 1.
    pub descriptor_type: u8,
    /// USB release in binary-coded decimal.
    pub bcd_usb: u16,
    /// Device class code.
    pub device_class: u8,
    /// Device subclass code.
    pub device_subclass: u8,
    /// Device protocol code.
    pub device_protocol: u8,
    /// Maximum packet size of endpoint zero.
    pub max_packet_size0: u8,
    /// Vendor id.
    pub id_vendor: u16,
    /// Product id.
    pub id_product: u16,
    /// Device release in binary-coded decimal.
    pub bcd_device: u16,
    /// Index of the manufacturer string descriptor.
    pub i_manufacturer: u8,
    /// Index of the product string descriptor.
    pub i_product: u8,
    /// Index of the serial-number string descriptor.
    pub i_serial_number: u8,
    /// Number of configurations.
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse and sanitize a raw 18-byte device descriptor.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < DEVICE_DESCRIPTOR_LENGTH
            || raw[0] as usize != DEVICE_DESCRIPTOR_LENGTH
            || raw[1] != DT_DEVICE
        {
            return Err(Error::Io(std::io::Error::other("bad device descriptor")));
        }
        Ok(Self {
            length: raw[0],
            descriptor_type: raw[1],
            bcd_usb: u16_le(&raw[2..]),
            device_class: raw[4],
            device_subclass: raw[5],
            device_protocol: raw[6],
            max_packet_size0: raw[7],
            id_vendor: u16_le(&raw[8..]),
            id_product: u16_le(&raw[10..]),
            bcd_device: u16_le(&raw[12..]),
            i_manufacturer: raw[14],
            i_product: raw[15],
            i_serial_number: raw[16],
            num_configurations: raw[17],
        })
    }
}

/// An endpoint descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Descriptor size in bytes.
    pub length: u8,
    /// Descriptor type, always 5.
    pub descriptor_type: u8,
    /// Endpoint address including the direction bit.
    pub endpoint_address: u8,
    /// Transfer type and synchronisation attributes.
    pub attributes: u8,
    /// Maximum packet size.
    pub max_packet_size: u16,
    /// Polling interval.
    pub interval: u8,
}

/// One alternate setting of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// Descriptor size in bytes.
    pub length: u8,
    /// Descriptor type, always 4.
    pub descriptor_type: u8,
    /// Zero-based interface number.
    pub interface_number: u8,
    /// Alternate setting number.
    pub alternate_setting: u8,
    /// Interface class code.
    pub interface_class: u8,
    /// Interface subclass code.
    pub interface_subclass: u8,
    /// Interface protocol code.
    pub interface_protocol: u8,
    /// Index of the interface string descriptor.
    pub i_interface: u8,
    /// Endpoints of this alternate setting.
    pub endpoints: Vec<EndpointDescriptor>,
}

/// All alternate settings of one interface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interface {
    /// Alternate settings, indexed by setting number.
    pub alt_settings: Vec<InterfaceDescriptor>,
}

/// A configuration descriptor with its interface chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    /// Descriptor size in bytes, always 9.
    pub length: u8,
    /// Descriptor type, always 2.
    pub descriptor_type: u8,
    /// Total length of the raw descriptor chain.
    pub total_length: u16,
    /// Number of interfaces.
    pub num_interfaces: u8,
    /// Value used to select this configuration.
    pub configuration_value: u8,
    /// Index of the configuration string descriptor.
    pub i_configuration: u8,
    /// Attributes bitmap.
    pub attributes: u8,
    /// Maximum power draw in 2 mA units.
    pub max_power: u8,
    /// Interfaces of this configuration.
    pub interfaces: Vec<Interface>,
}

impl ConfigDescriptor {
    /// Parse a raw configuration descriptor chain.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        fn bad() -> Error {
            Error::Io(std::io::Error::other("bad configuration descriptor"))
        }

        if raw.len() < 9 || raw[0] != 9 || raw[1] != DT_CONFIG {
            return Err(bad());
        }
        let total_length = u16_le(&raw[2..]).min(raw.len() as u16);
        // The chain cannot be shorter than its own header; a device
        // reporting less would make the interface walk start past the end.
        if total_length < 9 {
            return Err(bad());
        }
        let num_interfaces = raw[4];

        let mut res = Self {
            length: raw[0],
            descriptor_type: raw[1],
            total_length,
            num_interfaces,
            configuration_value: raw[5],
            i_configuration: raw[6],
            attributes: raw[7],
            max_power: raw[8],
            interfaces: vec![Interface::default(); num_interfaces as usize],
        };

        let mut rest = &raw[9..total_length as usize];
        // (interface number, declared endpoint count) of the alternate
        // setting currently collecting endpoints.
        let mut current: Option<(usize, usize)> = None;

        while !rest.is_empty() {
            let desc_len = rest[0] as usize;
            if desc_len < 2 || desc_len > rest.len() {
                return Err(bad());
            }

            match rest[1] {
                DT_INTERFACE => {
                    if desc_len != 9 {
                        return Err(bad());
                    }
                    if let Some((intf, declared)) = current {
                        let done = res.interfaces[intf]
                            .alt_settings
                            .last()
                            .map_or(false, |alt| alt.endpoints.len() == declared);
                        if !done {
                            return Err(bad());
                        }
                    }
                    let number = rest[2] as usize;
                    let alt = rest[3];
                    if number >= res.interfaces.len() {
                        return Err(bad());
                    }
                    let intf = &mut res.interfaces[number];
                    if alt as usize != intf.alt_settings.len() {
                        return Err(bad());
                    }
                    intf.alt_settings.push(InterfaceDescriptor {
                        length: rest[0],
                        descriptor_type: rest[1],
                        interface_number: rest[2],
                        alternate_setting: rest[3],
                        interface_class: rest[5],
                        interface_subclass: rest[6],
                        interface_protocol: rest[7],
                        i_interface: rest[8],
                        endpoints: Vec::new(),
                    });
                    current = Some((number, rest[4] as usize));
                }
                DT_ENDPOINT => {
                    if desc_len != 7 {
                        return Err(bad());
                    }
                    let Some((intf, declared)) = current else {
                        return Err(bad());
                    };
                    let alt = res.interfaces[intf]
                        .alt_settings
                        .last_mut()
                        .ok_or_else(bad)?;
                    if alt.endpoints.len() == declared {
                        return Err(bad());
                    }
                    alt.endpoints.push(EndpointDescriptor {
                        length: rest[0],
                        descriptor_type: rest[1],
                        endpoint_address: rest[2],
                        attributes: rest[3],
                        max_packet_size: u16_le(&rest[4..]),
                        interval: rest[6],
                    });
                }
                _ => {}
            }

            rest = &rest[desc_len..];
        }

        if let Some((intf, declared)) = current {
            let done = res.interfaces[intf]
                .alt_settings
                .last()
                .map_or(false, |alt| alt.endpoints.len() == declared);
            if !done {
                return Err(bad());
            }
        }
        if res.interfaces.iter().any(|i| i.alt_settings.is_empty()) {
            return Err(bad());
        }

        Ok(res)
    }
}

/// Decode a string descriptor payload into UTF-8.
pub fn string_descriptor_to_utf8(raw: &[u8]) -> Result<String> {
    fn bad() -> Error {
        Error::Io(std::io::Error::other("bad string descriptor"))
    }

    if raw.len() < 2 || raw[1] != DT_STRING {
        return Err(bad());
    }
    let len = (raw[0] as usize).min(raw.len());
    if len % 2 != 0 {
        return Err(bad());
    }
    let units: Vec<u16> = raw[2..len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    char::decode_utf16(units)
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| bad())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device() -> [u8; 18] {
        [
            18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0x01, 0x00, 1, 2, 3, 1,
        ]
    }

    #[test]
    fn device_descriptor_fields() {
        let desc = DeviceDescriptor::parse(&sample_device()).unwrap();
        assert_eq!(desc.bcd_usb, 0x0200);
        assert_eq!(desc.max_packet_size0, 64);
        assert_eq!(desc.id_vendor, 0x1234);
        assert_eq!(desc.id_product, 0x5678);
        assert_eq!(desc.num_configurations, 1);
    }

    #[test]
    fn device_descriptor_rejects_wrong_length() {
        let mut raw = sample_device();
        raw[0] = 9;
        assert!(DeviceDescriptor::parse(&raw).is_err());
        assert!(DeviceDescriptor::parse(&raw[..17]).is_err());
    }

    fn sample_config() -> Vec<u8> {
        let mut raw = Vec::new();
        // configuration: 1 interface, value 1, bus powered, 100 mA
        raw.extend_from_slice(&[9, 2, 0, 0, 1, 1, 0, 0x80, 50]);
        // interface 0, alt 0, 2 endpoints, vendor class
        raw.extend_from_slice(&[9, 4, 0, 0, 2, 0xff, 0, 0, 0]);
        // bulk IN 0x81, 512 bytes
        raw.extend_from_slice(&[7, 5, 0x81, 2, 0x00, 0x02, 0]);
        // bulk OUT 0x02, 512 bytes
        raw.extend_from_slice(&[7, 5, 0x02, 2, 0x00, 0x02, 0]);
        let total = raw.len() as u16;
        raw[2..4].copy_from_slice(&total.to_le_bytes());
        raw
    }

    #[test]
    fn config_chain_roundtrip() {
        let config = ConfigDescriptor::parse(&sample_config()).unwrap();
        assert_eq!(config.num_interfaces, 1);
        assert_eq!(config.interfaces[0].alt_settings.len(), 1);
        let alt = &config.interfaces[0].alt_settings[0];
        assert_eq!(alt.endpoints.len(), 2);
        assert_eq!(alt.endpoints[0].endpoint_address, 0x81);
        assert_eq!(alt.endpoints[0].max_packet_size, 512);
    }

    #[test]
    fn config_chain_rejects_total_length_below_header() {
        // The buffer is a full header, but the device claims the chain is
        // shorter than the header itself.
        let mut raw = sample_config();
        raw[2..4].copy_from_slice(&4u16.to_le_bytes());
        assert!(ConfigDescriptor::parse(&raw).is_err());
        raw[2..4].copy_from_slice(&0u16.to_le_bytes());
        assert!(ConfigDescriptor::parse(&raw).is_err());
    }

    #[test]
    fn config_chain_rejects_missing_endpoint() {
        let mut raw = sample_config();
        raw.truncate(raw.len() - 7);
        let total = raw.len() as u16;
        raw[2..4].copy_from_slice(&total.to_le_bytes());
        assert!(ConfigDescriptor::parse(&raw).is_err());
    }

    #[test]
    fn config_chain_rejects_out_of_order_alt_setting() {
        let mut raw = sample_config();
        // alternate setting jumps to 1 without a 0
        raw[9 + 3] = 1;
        assert!(ConfigDescriptor::parse(&raw).is_err());
    }

    #[test]
    fn string_descriptor_decodes_utf16() {
        let mut raw = vec![0, DT_STRING];
        for unit in "déviced".encode_utf16() {
            raw.extend_from_slice(&unit.to_le_bytes());
        }
        raw[0] = raw.len() as u8;
        assert_eq!(string_descriptor_to_utf8(&raw).unwrap(), "déviced");
    }

    #[test]
    fn string_descriptor_rejects_lone_surrogate() {
        let raw = [6, DT_STRING, 0x00, 0xd8, 0x41, 0x00];
        assert!(string_descriptor_to_utf8(&raw).is_err());
    }
}
