//! Link control command group

use crate::commands::CommandParameter;
use crate::events::{IoCapability, Role};
use crate::opcodes::{HciCommand, LinkControl};
use crate::ConnectionHandle;
use alloc::vec::Vec;
use bluejay_core::errors::Error;
use bluejay_core::BluetoothDeviceAddress;

/// The General Inquiry Access Code
pub const GIAC: [u8; 3] = [0x33, 0x8B, 0x9E];

/// Inquiry command
pub struct Inquiry {
    pub lap: [u8; 3],
    /// Inquiry length in units of 1.28 seconds (1 to 0x30)
    pub inquiry_length: u8,
    /// Maximum number of responses, zero for unlimited
    pub num_responses: u8,
}

impl CommandParameter for Inquiry {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::Inquiry);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.lap);
        buffer.push(self.inquiry_length);
        buffer.push(self.num_responses);
    }
}

/// Inquiry Cancel command
pub struct InquiryCancel;

impl CommandParameter for InquiryCancel {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::InquiryCancel);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

/// The default packet types for an outgoing ACL connection (every DM/DH type allowed)
pub const DEFAULT_ACL_PACKET_TYPES: u16 = 0xCC18;

/// Create Connection command
pub struct CreateConnection {
    pub address: BluetoothDeviceAddress,
    pub packet_types: u16,
    pub page_scan_repetition_mode: u8,
    /// Clock offset from an inquiry result, sent with the valid bit set when known
    pub clock_offset: Option<u16>,
    pub allow_role_switch: bool,
}

impl CommandParameter for CreateConnection {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::CreateConnection);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
        buffer.extend_from_slice(&self.packet_types.to_le_bytes());
        buffer.push(self.page_scan_repetition_mode);
        buffer.push(0); // reserved
        buffer.extend_from_slice(
            &self
                .clock_offset
                .map(|offset| offset | 0x8000)
                .unwrap_or(0)
                .to_le_bytes(),
        );
        buffer.push(self.allow_role_switch as u8);
    }
}

/// Disconnect command
pub struct Disconnect {
    pub connection_handle: ConnectionHandle,
    pub reason: Error,
}

impl CommandParameter for Disconnect {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::Disconnect);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
        buffer.push(self.reason.into_raw());
    }
}

/// Create Connection Cancel command
pub struct CreateConnectionCancel {
    pub address: BluetoothDeviceAddress,
}

impl CommandParameter for CreateConnectionCancel {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::CreateConnectionCancel);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
    }
}

/// Accept Connection Request command
pub struct AcceptConnectionRequest {
    pub address: BluetoothDeviceAddress,
    /// The role to request; `Central` asks the Controller to switch roles
    pub role: Role,
}

impl CommandParameter for AcceptConnectionRequest {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::AcceptConnectionRequest);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
        buffer.push(match self.role {
            Role::Central => 0x00,
            Role::Peripheral => 0x01,
        });
    }
}

/// Reject Connection Request command
pub struct RejectConnectionRequest {
    pub address: BluetoothDeviceAddress,
    pub reason: Error,
}

impl CommandParameter for RejectConnectionRequest {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::RejectConnectionRequest);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
        buffer.push(self.reason.into_raw());
    }
}

/// Link Key Request Reply command
pub struct LinkKeyRequestReply {
    pub address: BluetoothDeviceAddress,
    pub link_key: [u8; 16],
}

impl CommandParameter for LinkKeyRequestReply {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::LinkKeyRequestReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
        buffer.extend_from_slice(&self.link_key);
    }
}

/// Link Key Request Negative Reply command
pub struct LinkKeyRequestNegativeReply {
    pub address: BluetoothDeviceAddress,
}

impl CommandParameter for LinkKeyRequestNegativeReply {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::LinkKeyRequestNegativeReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
    }
}

/// PIN Code Request Reply command
pub struct PinCodeRequestReply {
    pub address: BluetoothDeviceAddress,
    /// The PIN code, one to sixteen bytes
    pub pin_code: Vec<u8>,
}

impl CommandParameter for PinCodeRequestReply {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::PinCodeRequestReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        debug_assert!((1..=16).contains(&self.pin_code.len()));

        buffer.extend_from_slice(&self.address.0);
        buffer.push(self.pin_code.len() as u8);

        let mut pin = [0u8; 16];

        pin[..self.pin_code.len()].copy_from_slice(&self.pin_code);

        buffer.extend_from_slice(&pin);
    }
}

/// PIN Code Request Negative Reply command
pub struct PinCodeRequestNegativeReply {
    pub address: BluetoothDeviceAddress,
}

impl CommandParameter for PinCodeRequestNegativeReply {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::PinCodeRequestNegativeReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
    }
}

/// Authentication Requested command
pub struct AuthenticationRequested {
    pub connection_handle: ConnectionHandle,
}

impl CommandParameter for AuthenticationRequested {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::AuthenticationRequested);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
    }
}

/// Set Connection Encryption command
pub struct SetConnectionEncryption {
    pub connection_handle: ConnectionHandle,
    pub encryption_enable: bool,
}

impl CommandParameter for SetConnectionEncryption {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::SetConnectionEncryption);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
        buffer.push(self.encryption_enable as u8);
    }
}

/// Remote Name Request command
pub struct RemoteNameRequest {
    pub address: BluetoothDeviceAddress,
    pub page_scan_repetition_mode: u8,
    pub clock_offset: Option<u16>,
}

impl CommandParameter for RemoteNameRequest {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::RemoteNameRequest);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
        buffer.push(self.page_scan_repetition_mode);
        buffer.push(0); // reserved
        buffer.extend_from_slice(
            &self
                .clock_offset
                .map(|offset| offset | 0x8000)
                .unwrap_or(0)
                .to_le_bytes(),
        );
    }
}

/// Read Remote Supported Features command
pub struct ReadRemoteSupportedFeatures {
    pub connection_handle: ConnectionHandle,
}

impl CommandParameter for ReadRemoteSupportedFeatures {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::ReadRemoteSupportedFeatures);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
    }
}

/// Read Remote Extended Features command
pub struct ReadRemoteExtendedFeatures {
    pub connection_handle: ConnectionHandle,
    pub page_number: u8,
}

impl CommandParameter for ReadRemoteExtendedFeatures {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::ReadRemoteExtendedFeatures);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
        buffer.push(self.page_number);
    }
}

/// Read Remote Version Information command
pub struct ReadRemoteVersionInformation {
    pub connection_handle: ConnectionHandle,
}

impl CommandParameter for ReadRemoteVersionInformation {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::ReadRemoteVersionInformation);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
    }
}

/// Accept Synchronous Connection Request command
///
/// The parameter defaults of [`new_cvsd`](AcceptSynchronousConnectionRequest::new_cvsd) are the
/// ubiquitous CVSD / HV3+EV3 configuration.
pub struct AcceptSynchronousConnectionRequest {
    pub address: BluetoothDeviceAddress,
    pub transmit_bandwidth: u32,
    pub receive_bandwidth: u32,
    pub max_latency: u16,
    pub voice_setting: u16,
    pub retransmission_effort: u8,
    pub packet_types: u16,
}

impl AcceptSynchronousConnectionRequest {
    /// Accept with CVSD air coding and the default eSCO packet types
    pub fn new_cvsd(address: BluetoothDeviceAddress) -> Self {
        AcceptSynchronousConnectionRequest {
            address,
            transmit_bandwidth: 8000,
            receive_bandwidth: 8000,
            max_latency: 0xFFFF,
            voice_setting: 0x0060,
            retransmission_effort: 0xFF,
            packet_types: 0x003F,
        }
    }
}

impl CommandParameter for AcceptSynchronousConnectionRequest {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::AcceptSynchronousConnectionRequest);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
        buffer.extend_from_slice(&self.transmit_bandwidth.to_le_bytes());
        buffer.extend_from_slice(&self.receive_bandwidth.to_le_bytes());
        buffer.extend_from_slice(&self.max_latency.to_le_bytes());
        buffer.extend_from_slice(&self.voice_setting.to_le_bytes());
        buffer.push(self.retransmission_effort);
        buffer.extend_from_slice(&self.packet_types.to_le_bytes());
    }
}

/// Reject Synchronous Connection Request command
pub struct RejectSynchronousConnectionRequest {
    pub address: BluetoothDeviceAddress,
    pub reason: Error,
}

impl CommandParameter for RejectSynchronousConnectionRequest {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::RejectSynchronousConnectionRequest);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
        buffer.push(self.reason.into_raw());
    }
}

/// IO Capability Request Reply command
pub struct IoCapabilityRequestReply {
    pub address: BluetoothDeviceAddress,
    pub io_capability: IoCapability,
    pub oob_data_present: bool,
    pub authentication_requirements: u8,
}

impl CommandParameter for IoCapabilityRequestReply {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::IoCapabilityRequestReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
        buffer.push(self.io_capability.into_raw());
        buffer.push(self.oob_data_present as u8);
        buffer.push(self.authentication_requirements);
    }
}

/// IO Capability Request Negative Reply command
pub struct IoCapabilityRequestNegativeReply {
    pub address: BluetoothDeviceAddress,
    pub reason: Error,
}

impl CommandParameter for IoCapabilityRequestNegativeReply {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::IoCapabilityRequestNegativeReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
        buffer.push(self.reason.into_raw());
    }
}

/// User Confirmation Request Reply command
pub struct UserConfirmationRequestReply {
    pub address: BluetoothDeviceAddress,
}

impl CommandParameter for UserConfirmationRequestReply {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::UserConfirmationRequestReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
    }
}

/// User Confirmation Request Negative Reply command
pub struct UserConfirmationRequestNegativeReply {
    pub address: BluetoothDeviceAddress,
}

impl CommandParameter for UserConfirmationRequestNegativeReply {
    const COMMAND: HciCommand =
        HciCommand::LinkControl(LinkControl::UserConfirmationRequestNegativeReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
    }
}

/// User Passkey Request Reply command
pub struct UserPasskeyRequestReply {
    pub address: BluetoothDeviceAddress,
    pub passkey: u32,
}

impl CommandParameter for UserPasskeyRequestReply {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::UserPasskeyRequestReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        debug_assert!(self.passkey < 1_000_000);

        buffer.extend_from_slice(&self.address.0);
        buffer.extend_from_slice(&self.passkey.to_le_bytes());
    }
}

/// User Passkey Request Negative Reply command
pub struct UserPasskeyRequestNegativeReply {
    pub address: BluetoothDeviceAddress,
}

impl CommandParameter for UserPasskeyRequestNegativeReply {
    const COMMAND: HciCommand = HciCommand::LinkControl(LinkControl::UserPasskeyRequestNegativeReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.address.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_connection_packet() {
        let packet = CreateConnection {
            address: BluetoothDeviceAddress([0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]),
            packet_types: DEFAULT_ACL_PACKET_TYPES,
            page_scan_repetition_mode: 0x01,
            clock_offset: Some(0x1234),
            allow_role_switch: true,
        }
        .into_packet()
        .to_bytes();

        assert_eq!(
            &[
                0x05, 0x04, // opcode 0x0405
                13,   // parameter length
                0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA, // address
                0x18, 0xCC, // packet types
                0x01, // page scan repetition mode
                0x00, // reserved
                0x34, 0x92, // clock offset with valid bit
                0x01, // allow role switch
            ],
            packet.as_slice()
        );
    }
}
