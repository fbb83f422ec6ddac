//! Controller and baseband command group

use crate::commands::CommandParameter;
use crate::opcodes::{ControllerAndBaseband, HciCommand};
use crate::ConnectionHandle;
use alloc::vec::Vec;

/// Set Event Mask command
pub struct SetEventMask {
    pub mask: [u8; 8],
}

impl SetEventMask {
    /// The event mask enabling every event this host handles
    ///
    /// Bits are per Vol 4, Part E Section 7.3.1. The LE meta event bit is set here; which LE sub
    /// events arrive is further filtered by the LE controller's own event mask.
    pub fn host_default() -> Self {
        let mut mask = [0u8; 8];

        let bits: &[u8] = &[
            0,  // Inquiry Complete
            1,  // Inquiry Result
            2,  // Connection Complete
            3,  // Connection Request
            4,  // Disconnection Complete
            5,  // Authentication Complete
            6,  // Remote Name Request Complete
            7,  // Encryption Change
            10, // Read Remote Supported Features Complete
            11, // Read Remote Version Information Complete
            17, // Role Change
            21, // PIN Code Request
            22, // Link Key Request
            23, // Link Key Notification
            33, // Inquiry Result with RSSI
            34, // Read Remote Extended Features Complete
            43, // Synchronous Connection Complete
            46, // Extended Inquiry Result
            48, // IO Capability Request
            49, // IO Capability Response
            50, // User Confirmation Request
            51, // User Passkey Request
            53, // Simple Pairing Complete
            59, // User Passkey Notification
            61, // LE Meta
        ];

        for bit in bits {
            mask[(bit / 8) as usize] |= 1 << (bit % 8);
        }

        SetEventMask { mask }
    }
}

impl CommandParameter for SetEventMask {
    const COMMAND: HciCommand = HciCommand::ControllerAndBaseband(ControllerAndBaseband::SetEventMask);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.mask);
    }
}

/// Reset command
pub struct Reset;

impl CommandParameter for Reset {
    const COMMAND: HciCommand = HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

/// Write Local Name command
pub struct WriteLocalName {
    pub name: Vec<u8>,
}

impl CommandParameter for WriteLocalName {
    const COMMAND: HciCommand = HciCommand::ControllerAndBaseband(ControllerAndBaseband::WriteLocalName);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        let mut name = [0u8; 248];

        let length = self.name.len().min(247);

        name[..length].copy_from_slice(&self.name[..length]);

        buffer.extend_from_slice(&name);
    }
}

/// Write Scan Enable command
pub struct WriteScanEnable {
    pub inquiry_scan: bool,
    pub page_scan: bool,
}

impl CommandParameter for WriteScanEnable {
    const COMMAND: HciCommand = HciCommand::ControllerAndBaseband(ControllerAndBaseband::WriteScanEnable);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push((self.inquiry_scan as u8) | (self.page_scan as u8) << 1);
    }
}

/// Write Automatic Flush Timeout command
pub struct WriteAutomaticFlushTimeout {
    pub connection_handle: ConnectionHandle,
    /// Flush timeout in baseband slots (0.625 ms), zero means no automatic flush
    pub flush_timeout: u16,
}

impl CommandParameter for WriteAutomaticFlushTimeout {
    const COMMAND: HciCommand =
        HciCommand::ControllerAndBaseband(ControllerAndBaseband::WriteAutomaticFlushTimeout);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        debug_assert!(self.flush_timeout <= 0x07FF);

        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
        buffer.extend_from_slice(&self.flush_timeout.to_le_bytes());
    }
}

/// Write Class of Device command
pub struct WriteClassOfDevice {
    pub class_of_device: u32,
}

impl CommandParameter for WriteClassOfDevice {
    const COMMAND: HciCommand =
        HciCommand::ControllerAndBaseband(ControllerAndBaseband::WriteClassOfDevice);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.class_of_device.to_le_bytes()[..3]);
    }
}

/// Write Inquiry Mode command
pub struct WriteInquiryMode {
    /// 0 standard, 1 with RSSI, 2 with RSSI or extended
    pub inquiry_mode: u8,
}

impl CommandParameter for WriteInquiryMode {
    const COMMAND: HciCommand = HciCommand::ControllerAndBaseband(ControllerAndBaseband::WriteInquiryMode);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.inquiry_mode);
    }
}

/// Write Simple Pairing Mode command
pub struct WriteSimplePairingMode {
    pub enable: bool,
}

impl CommandParameter for WriteSimplePairingMode {
    const COMMAND: HciCommand =
        HciCommand::ControllerAndBaseband(ControllerAndBaseband::WriteSimplePairingMode);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.enable as u8);
    }
}

/// Write LE Host Support command
pub struct WriteLeHostSupport {
    pub le_supported_host: bool,
}

impl CommandParameter for WriteLeHostSupport {
    const COMMAND: HciCommand = HciCommand::ControllerAndBaseband(ControllerAndBaseband::WriteLeHostSupport);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.le_supported_host as u8);
        buffer.push(0); // simultaneous LE host, deprecated and always zero
    }
}

/// Write Secure Connections Host Support command
pub struct WriteSecureConnectionsHostSupport {
    pub enable: bool,
}

impl CommandParameter for WriteSecureConnectionsHostSupport {
    const COMMAND: HciCommand =
        HciCommand::ControllerAndBaseband(ControllerAndBaseband::WriteSecureConnectionsHostSupport);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.enable as u8);
    }
}

/// Write Synchronous Flow Control Enable command
pub struct WriteSynchronousFlowControlEnable {
    pub enable: bool,
}

impl CommandParameter for WriteSynchronousFlowControlEnable {
    const COMMAND: HciCommand =
        HciCommand::ControllerAndBaseband(ControllerAndBaseband::WriteSynchronousFlowControlEnable);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.enable as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_event_mask_has_le_meta() {
        let mask = SetEventMask::host_default().mask;

        // bit 61 lives in byte 7
        assert_ne!(0, mask[7] & (1 << 5));
    }

    #[test]
    fn class_of_device_is_three_bytes() {
        let mut buffer = Vec::new();

        WriteClassOfDevice {
            class_of_device: 0x200404,
        }
        .get_parameter(&mut buffer);

        assert_eq!(&[0x04, 0x04, 0x20], buffer.as_slice());
    }
}
