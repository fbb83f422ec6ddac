//! Vendor specific command group
//!
//! The Android vendor extensions. Controllers advertising these support multiple concurrent
//! advertising instances through the `LE_Multi_Advt` suite well below Bluetooth 5.0, and report
//! what they implement through `LE_Get_Vendor_Capabilities`.

use crate::commands::le::{AdvertisingType, OwnAddressType};
use crate::commands::{check_status, CommandParameter, ReturnParameterError};
use crate::opcodes::{HciCommand, MultiAdvtSubOpcode, VendorSpecific};
use alloc::vec::Vec;
use bluejay_core::{AddressKind, BluetoothDeviceAddress};

/// LE Get Vendor Capabilities command
pub struct LeGetVendorCapabilities;

/// Return parameter of [`LeGetVendorCapabilities`]
///
/// The size of this return parameter has grown across versions of the extension and real
/// Controllers ship every vintage, so everything past the first two fields is optional. Fields
/// this host does not consume are not parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VendorCapabilities {
    /// Maximum number of concurrent advertising instances (zero when unsupported)
    pub max_advt_instances: u8,
    /// Whether offloaded RPA generation is supported
    pub offloaded_resolution_of_private_address: bool,
    /// The version of the vendor specification, when reported
    pub version_supported: Option<u16>,
}

impl CommandParameter for LeGetVendorCapabilities {
    const COMMAND: HciCommand = HciCommand::VendorSpecific(VendorSpecific::LeGetVendorCapabilities);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

impl LeGetVendorCapabilities {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<VendorCapabilities, ReturnParameterError> {
        let raw = check_status(raw)?;

        // the oldest vintage is 8 bytes after the status, the v0.98 layout is 14
        if raw.len() < 8 {
            return Err(ReturnParameterError::Malformed);
        }

        Ok(VendorCapabilities {
            max_advt_instances: raw[0],
            offloaded_resolution_of_private_address: raw[1] != 0,
            version_supported: raw
                .get(8..10)
                .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]])),
        })
    }
}

fn multi_advt_packet(sub_opcode: MultiAdvtSubOpcode, buffer: &mut Vec<u8>) {
    buffer.push(sub_opcode.into_sub_opcode());
}

/// LE Multi Advt, Set Parameters sub command
pub struct MultiAdvtSetParameters {
    pub advertising_instance: u8,
    pub interval_min: u16,
    pub interval_max: u16,
    pub advertising_type: AdvertisingType,
    pub own_address_type: OwnAddressType,
    pub own_address: BluetoothDeviceAddress,
    pub peer_address_kind: AddressKind,
    pub peer_address: BluetoothDeviceAddress,
    pub channel_map: u8,
    pub filter_policy: u8,
    pub tx_power: i8,
}

impl CommandParameter for MultiAdvtSetParameters {
    const COMMAND: HciCommand = HciCommand::VendorSpecific(VendorSpecific::LeMultiAdvt);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        multi_advt_packet(MultiAdvtSubOpcode::SetParameters, buffer);

        buffer.extend_from_slice(&self.interval_min.to_le_bytes());
        buffer.extend_from_slice(&self.interval_max.to_le_bytes());
        buffer.push(self.advertising_type.into_raw());
        buffer.push(self.own_address_type.into_raw());
        buffer.extend_from_slice(&self.own_address.0);
        buffer.push(super::le::raw_peer_address_kind(self.peer_address_kind));
        buffer.extend_from_slice(&self.peer_address.0);
        buffer.push(self.channel_map);
        buffer.push(self.filter_policy);
        buffer.push(self.advertising_instance);
        buffer.push(self.tx_power as u8);
    }
}

/// LE Multi Advt, Set Data sub command
pub struct MultiAdvtSetData {
    pub advertising_instance: u8,
    pub data: Vec<u8>,
}

impl CommandParameter for MultiAdvtSetData {
    const COMMAND: HciCommand = HciCommand::VendorSpecific(VendorSpecific::LeMultiAdvt);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        multi_advt_packet(MultiAdvtSubOpcode::SetData, buffer);

        extend_vendor_advertising_data(buffer, &self.data);

        buffer.push(self.advertising_instance);
    }
}

/// LE Multi Advt, Set Scan Response Data sub command
pub struct MultiAdvtSetScanResponseData {
    pub advertising_instance: u8,
    pub data: Vec<u8>,
}

impl CommandParameter for MultiAdvtSetScanResponseData {
    const COMMAND: HciCommand = HciCommand::VendorSpecific(VendorSpecific::LeMultiAdvt);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        multi_advt_packet(MultiAdvtSubOpcode::SetScanResponseData, buffer);

        extend_vendor_advertising_data(buffer, &self.data);

        buffer.push(self.advertising_instance);
    }
}

/// LE Multi Advt, Enable sub command
pub struct MultiAdvtEnable {
    pub advertising_instance: u8,
    pub enable: bool,
}

impl CommandParameter for MultiAdvtEnable {
    const COMMAND: HciCommand = HciCommand::VendorSpecific(VendorSpecific::LeMultiAdvt);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        multi_advt_packet(MultiAdvtSubOpcode::Enable, buffer);

        buffer.push(self.enable as u8);
        buffer.push(self.advertising_instance);
    }
}

fn extend_vendor_advertising_data(buffer: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= 31);

    buffer.push(data.len() as u8);

    let mut padded = [0u8; 31];

    padded[..data.len()].copy_from_slice(data);

    buffer.extend_from_slice(&padded);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_capabilities_tolerates_short_vintages() {
        // 0.55 era payload: no version field
        let old = [0x00, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

        let capabilities = LeGetVendorCapabilities::try_parse_return_parameter(&old).unwrap();

        assert_eq!(5, capabilities.max_advt_instances);
        assert_eq!(None, capabilities.version_supported);

        // 0.98 era payload with the version field
        let new = [
            0x00, 0x10, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x62, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        let capabilities = LeGetVendorCapabilities::try_parse_return_parameter(&new).unwrap();

        assert_eq!(16, capabilities.max_advt_instances);
        assert_eq!(Some(0x0062), capabilities.version_supported);
    }

    #[test]
    fn multi_advt_enable_sub_opcode_is_first() {
        let packet = MultiAdvtEnable {
            advertising_instance: 2,
            enable: true,
        }
        .into_packet();

        assert_eq!(&[0x05, 0x01, 0x02], packet.get_parameter());
    }
}
