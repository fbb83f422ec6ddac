//! Information parameters command group
//!
//! These commands read fixed values out of the Controller during initialization. Each carries a
//! parser for its Command Complete return parameter.

use crate::commands::{check_status, take, CommandParameter, ReturnParameterError};
use crate::opcodes::{HciCommand, InformationParameters};
use alloc::vec::Vec;
use bluejay_core::BluetoothDeviceAddress;

/// Read Local Version Information command
pub struct ReadLocalVersionInformation;

/// Return parameter of [`ReadLocalVersionInformation`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalVersionInformation {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer_name: u16,
    pub lmp_subversion: u16,
}

impl CommandParameter for ReadLocalVersionInformation {
    const COMMAND: HciCommand =
        HciCommand::InformationParameters(InformationParameters::ReadLocalVersionInformation);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

impl ReadLocalVersionInformation {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<LocalVersionInformation, ReturnParameterError> {
        let raw = check_status(raw)?;

        let bytes: [u8; 8] = take(raw)?;

        Ok(LocalVersionInformation {
            hci_version: bytes[0],
            hci_revision: u16::from_le_bytes([bytes[1], bytes[2]]),
            lmp_version: bytes[3],
            manufacturer_name: u16::from_le_bytes([bytes[4], bytes[5]]),
            lmp_subversion: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}

/// Read Local Supported Commands command
pub struct ReadLocalSupportedCommands;

impl CommandParameter for ReadLocalSupportedCommands {
    const COMMAND: HciCommand =
        HciCommand::InformationParameters(InformationParameters::ReadLocalSupportedCommands);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

impl ReadLocalSupportedCommands {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<[u8; 64], ReturnParameterError> {
        take(check_status(raw)?)
    }
}

/// Read Local Supported Features command
pub struct ReadLocalSupportedFeatures;

impl CommandParameter for ReadLocalSupportedFeatures {
    const COMMAND: HciCommand =
        HciCommand::InformationParameters(InformationParameters::ReadLocalSupportedFeatures);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

impl ReadLocalSupportedFeatures {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<[u8; 8], ReturnParameterError> {
        take(check_status(raw)?)
    }
}

/// Read Local Extended Features command
pub struct ReadLocalExtendedFeatures {
    pub page_number: u8,
}

/// Return parameter of [`ReadLocalExtendedFeatures`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalExtendedFeatures {
    pub page_number: u8,
    pub maximum_page_number: u8,
    pub extended_lmp_features: [u8; 8],
}

impl CommandParameter for ReadLocalExtendedFeatures {
    const COMMAND: HciCommand =
        HciCommand::InformationParameters(InformationParameters::ReadLocalExtendedFeatures);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.page_number);
    }
}

impl ReadLocalExtendedFeatures {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<LocalExtendedFeatures, ReturnParameterError> {
        let raw = check_status(raw)?;

        let bytes: [u8; 10] = take(raw)?;

        Ok(LocalExtendedFeatures {
            page_number: bytes[0],
            maximum_page_number: bytes[1],
            extended_lmp_features: bytes[2..].try_into().unwrap(),
        })
    }
}

/// Read Buffer Size command
pub struct ReadBufferSize;

/// Return parameter of [`ReadBufferSize`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSize {
    pub acl_data_packet_length: u16,
    pub synchronous_data_packet_length: u8,
    pub total_num_acl_data_packets: u16,
    pub total_num_synchronous_data_packets: u16,
}

impl CommandParameter for ReadBufferSize {
    const COMMAND: HciCommand = HciCommand::InformationParameters(InformationParameters::ReadBufferSize);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

impl ReadBufferSize {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<BufferSize, ReturnParameterError> {
        let raw = check_status(raw)?;

        let bytes: [u8; 7] = take(raw)?;

        Ok(BufferSize {
            acl_data_packet_length: u16::from_le_bytes([bytes[0], bytes[1]]),
            synchronous_data_packet_length: bytes[2],
            total_num_acl_data_packets: u16::from_le_bytes([bytes[3], bytes[4]]),
            total_num_synchronous_data_packets: u16::from_le_bytes([bytes[5], bytes[6]]),
        })
    }
}

/// Read BD_ADDR command
pub struct ReadBdAddr;

impl CommandParameter for ReadBdAddr {
    const COMMAND: HciCommand = HciCommand::InformationParameters(InformationParameters::ReadBdAddr);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

impl ReadBdAddr {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<BluetoothDeviceAddress, ReturnParameterError> {
        take(check_status(raw)?).map(BluetoothDeviceAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluejay_core::errors::Error;

    #[test]
    fn buffer_size_parse() {
        let raw = [0x00, 0xFB, 0x00, 0x3C, 0x08, 0x00, 0x08, 0x00];

        let buffer_size = ReadBufferSize::try_parse_return_parameter(&raw).unwrap();

        assert_eq!(251, buffer_size.acl_data_packet_length);
        assert_eq!(60, buffer_size.synchronous_data_packet_length);
        assert_eq!(8, buffer_size.total_num_acl_data_packets);
        assert_eq!(8, buffer_size.total_num_synchronous_data_packets);
    }

    #[test]
    fn status_failure_surfaces() {
        let raw = [0x0C]; // command disallowed

        assert_eq!(
            Err(ReturnParameterError::Status(Error::CommandDisallowed)),
            ReadBdAddr::try_parse_return_parameter(&raw)
        );
    }
}
