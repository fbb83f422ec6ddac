//! LE controller command group

use crate::commands::{check_status, take, CommandParameter, ReturnParameterError};
use crate::opcodes::{HciCommand, LEController};
use crate::ConnectionHandle;
use alloc::vec::Vec;
use bluejay_core::{AddressKind, BluetoothDeviceAddress};

/// The own address type parameter of advertising, scanning, and initiating commands
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OwnAddressType {
    PublicDeviceAddress,
    RandomDeviceAddress,
    RpaFromLocalIrkOrPublicAddress,
    RpaFromLocalIrkOrRandomAddress,
}

impl OwnAddressType {
    pub fn into_raw(self) -> u8 {
        match self {
            OwnAddressType::PublicDeviceAddress => 0x00,
            OwnAddressType::RandomDeviceAddress => 0x01,
            OwnAddressType::RpaFromLocalIrkOrPublicAddress => 0x02,
            OwnAddressType::RpaFromLocalIrkOrRandomAddress => 0x03,
        }
    }
}

/// Get the raw peer address type for an [`AddressKind`]
///
/// # Panic
/// The kind must be one of the LE kinds with an address.
pub(crate) fn raw_peer_address_kind(kind: AddressKind) -> u8 {
    match kind {
        AddressKind::LePublic => 0x00,
        AddressKind::LeRandom => 0x01,
        _ => panic!("not an addressable LE address kind"),
    }
}

/// LE Set Event Mask command
pub struct SetEventMask {
    pub mask: [u8; 8],
}

impl SetEventMask {
    /// The LE event mask enabling every sub event this host handles
    pub fn host_default() -> Self {
        let mut mask = [0u8; 8];

        let bits: &[u8] = &[
            0,  // Connection Complete
            1,  // Advertising Report
            2,  // Connection Update Complete
            3,  // Read Remote Features Complete
            4,  // Long Term Key Request
            9,  // Enhanced Connection Complete
            12, // Extended Advertising Report
            17, // Advertising Set Terminated
        ];

        for bit in bits {
            mask[(bit / 8) as usize] |= 1 << (bit % 8);
        }

        SetEventMask { mask }
    }
}

impl CommandParameter for SetEventMask {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetEventMask);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.mask);
    }
}

/// LE Read Buffer Size command (v1)
pub struct ReadBufferSize;

/// Return parameter of the LE buffer size commands
///
/// A `le_acl_data_packet_length` of zero means the LE Controller shares the BR/EDR buffers. The
/// ISO fields are only present in the v2 return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeBufferSize {
    pub le_acl_data_packet_length: u16,
    pub total_num_le_acl_data_packets: u8,
    pub iso_data_packet_length: Option<u16>,
    pub total_num_iso_data_packets: Option<u8>,
}

impl CommandParameter for ReadBufferSize {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::ReadBufferSize);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

impl ReadBufferSize {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<LeBufferSize, ReturnParameterError> {
        let bytes: [u8; 3] = take(check_status(raw)?)?;

        Ok(LeBufferSize {
            le_acl_data_packet_length: u16::from_le_bytes([bytes[0], bytes[1]]),
            total_num_le_acl_data_packets: bytes[2],
            iso_data_packet_length: None,
            total_num_iso_data_packets: None,
        })
    }
}

/// LE Read Buffer Size command (v2)
pub struct ReadBufferSizeV2;

impl CommandParameter for ReadBufferSizeV2 {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::ReadBufferSizeV2);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

impl ReadBufferSizeV2 {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<LeBufferSize, ReturnParameterError> {
        let bytes: [u8; 6] = take(check_status(raw)?)?;

        Ok(LeBufferSize {
            le_acl_data_packet_length: u16::from_le_bytes([bytes[0], bytes[1]]),
            total_num_le_acl_data_packets: bytes[2],
            iso_data_packet_length: Some(u16::from_le_bytes([bytes[3], bytes[4]])),
            total_num_iso_data_packets: Some(bytes[5]),
        })
    }
}

/// LE Read Local Supported Features command
pub struct ReadLocalSupportedFeatures;

impl CommandParameter for ReadLocalSupportedFeatures {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::ReadLocalSupportedFeatures);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

impl ReadLocalSupportedFeatures {
    pub fn try_parse_return_parameter(raw: &[u8]) -> Result<[u8; 8], ReturnParameterError> {
        take(check_status(raw)?)
    }
}

/// LE Set Random Address command
pub struct SetRandomAddress {
    pub random_address: BluetoothDeviceAddress,
}

impl CommandParameter for SetRandomAddress {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetRandomAddress);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.random_address.0);
    }
}

/// The advertising type of the legacy Set Advertising Parameters command
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AdvertisingType {
    ConnectableAndScannableUndirected,
    ConnectableHighDutyCycleDirected,
    ScannableUndirected,
    NonConnectableUndirected,
    ConnectableLowDutyCycleDirected,
}

impl AdvertisingType {
    pub fn into_raw(self) -> u8 {
        match self {
            AdvertisingType::ConnectableAndScannableUndirected => 0x00,
            AdvertisingType::ConnectableHighDutyCycleDirected => 0x01,
            AdvertisingType::ScannableUndirected => 0x02,
            AdvertisingType::NonConnectableUndirected => 0x03,
            AdvertisingType::ConnectableLowDutyCycleDirected => 0x04,
        }
    }
}

/// LE Set Advertising Parameters command
pub struct SetAdvertisingParameters {
    /// Advertising interval minimum in units of 0.625 ms
    pub interval_min: u16,
    /// Advertising interval maximum in units of 0.625 ms
    pub interval_max: u16,
    pub advertising_type: AdvertisingType,
    pub own_address_type: OwnAddressType,
    pub peer_address_kind: AddressKind,
    pub peer_address: BluetoothDeviceAddress,
    /// Channel bit map, the lower three bits select channels 37 to 39
    pub channel_map: u8,
    pub filter_policy: u8,
}

impl CommandParameter for SetAdvertisingParameters {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetAdvertisingParameters);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.interval_min.to_le_bytes());
        buffer.extend_from_slice(&self.interval_max.to_le_bytes());
        buffer.push(self.advertising_type.into_raw());
        buffer.push(self.own_address_type.into_raw());
        buffer.push(raw_peer_address_kind(self.peer_address_kind));
        buffer.extend_from_slice(&self.peer_address.0);
        buffer.push(self.channel_map);
        buffer.push(self.filter_policy);
    }
}

fn extend_legacy_advertising_data(buffer: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= 31);

    buffer.push(data.len() as u8);

    let mut padded = [0u8; 31];

    padded[..data.len()].copy_from_slice(data);

    buffer.extend_from_slice(&padded);
}

/// LE Set Advertising Data command
pub struct SetAdvertisingData {
    /// The advertising data, at most 31 bytes
    pub data: Vec<u8>,
}

impl CommandParameter for SetAdvertisingData {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetAdvertisingData);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        extend_legacy_advertising_data(buffer, &self.data);
    }
}

/// LE Set Scan Response Data command
pub struct SetScanResponseData {
    /// The scan response data, at most 31 bytes
    pub data: Vec<u8>,
}

impl CommandParameter for SetScanResponseData {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetScanResponseData);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        extend_legacy_advertising_data(buffer, &self.data);
    }
}

/// LE Set Advertising Enable command
pub struct SetAdvertisingEnable {
    pub enable: bool,
}

impl CommandParameter for SetAdvertisingEnable {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetAdvertisingEnable);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.enable as u8);
    }
}

/// LE Set Scan Parameters command
pub struct SetScanParameters {
    pub active_scanning: bool,
    /// Scan interval in units of 0.625 ms
    pub scan_interval: u16,
    /// Scan window in units of 0.625 ms
    pub scan_window: u16,
    pub own_address_type: OwnAddressType,
    pub filter_policy: u8,
}

impl CommandParameter for SetScanParameters {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetScanParameters);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.active_scanning as u8);
        buffer.extend_from_slice(&self.scan_interval.to_le_bytes());
        buffer.extend_from_slice(&self.scan_window.to_le_bytes());
        buffer.push(self.own_address_type.into_raw());
        buffer.push(self.filter_policy);
    }
}

/// LE Set Scan Enable command
pub struct SetScanEnable {
    pub enable: bool,
    pub filter_duplicates: bool,
}

impl CommandParameter for SetScanEnable {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetScanEnable);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.enable as u8);
        buffer.push(self.filter_duplicates as u8);
    }
}

/// Connection interval and timeout parameters shared by the create connection commands
#[derive(Clone, Copy, Debug)]
pub struct ConnectionIntervalParameters {
    /// Minimum connection interval in units of 1.25 ms
    pub interval_min: u16,
    /// Maximum connection interval in units of 1.25 ms
    pub interval_max: u16,
    pub max_latency: u16,
    /// Supervision timeout in units of 10 ms
    pub supervision_timeout: u16,
    pub min_ce_length: u16,
    pub max_ce_length: u16,
}

impl ConnectionIntervalParameters {
    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.interval_min.to_le_bytes());
        buffer.extend_from_slice(&self.interval_max.to_le_bytes());
        buffer.extend_from_slice(&self.max_latency.to_le_bytes());
        buffer.extend_from_slice(&self.supervision_timeout.to_le_bytes());
        buffer.extend_from_slice(&self.min_ce_length.to_le_bytes());
        buffer.extend_from_slice(&self.max_ce_length.to_le_bytes());
    }
}

/// LE Create Connection command
pub struct CreateConnection {
    /// Scan interval in units of 0.625 ms
    pub scan_interval: u16,
    /// Scan window in units of 0.625 ms
    pub scan_window: u16,
    /// Use the filter accept list instead of `peer_address`
    pub use_filter_accept_list: bool,
    pub peer_address_kind: AddressKind,
    pub peer_address: BluetoothDeviceAddress,
    pub own_address_type: OwnAddressType,
    pub intervals: ConnectionIntervalParameters,
}

impl CommandParameter for CreateConnection {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::CreateConnection);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.scan_interval.to_le_bytes());
        buffer.extend_from_slice(&self.scan_window.to_le_bytes());
        buffer.push(self.use_filter_accept_list as u8);
        buffer.push(raw_peer_address_kind(self.peer_address_kind));
        buffer.extend_from_slice(&self.peer_address.0);
        buffer.push(self.own_address_type.into_raw());
        self.intervals.get_parameter(buffer);
    }
}

/// LE Create Connection Cancel command
pub struct CreateConnectionCancel;

impl CommandParameter for CreateConnectionCancel {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::CreateConnectionCancel);

    fn get_parameter(&self, _: &mut Vec<u8>) {}
}

/// LE Read Remote Features command
pub struct ReadRemoteFeatures {
    pub connection_handle: ConnectionHandle,
}

impl CommandParameter for ReadRemoteFeatures {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::ReadRemoteFeatures);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
    }
}

/// LE Long Term Key Request Reply command
pub struct LongTermKeyRequestReply {
    pub connection_handle: ConnectionHandle,
    pub long_term_key: [u8; 16],
}

impl CommandParameter for LongTermKeyRequestReply {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::LongTermKeyRequestReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
        buffer.extend_from_slice(&self.long_term_key);
    }
}

/// LE Long Term Key Request Negative Reply command
pub struct LongTermKeyRequestNegativeReply {
    pub connection_handle: ConnectionHandle,
}

impl CommandParameter for LongTermKeyRequestNegativeReply {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::LongTermKeyRequestNegativeReply);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.connection_handle.get_raw_handle().to_le_bytes());
    }
}

/// The advertising event properties bit field of extended advertising
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AdvertisingEventProperties(pub u16);

impl AdvertisingEventProperties {
    pub const CONNECTABLE: u16 = 1 << 0;
    pub const SCANNABLE: u16 = 1 << 1;
    pub const DIRECTED: u16 = 1 << 2;
    pub const HIGH_DUTY_CYCLE: u16 = 1 << 3;
    pub const LEGACY_PDU: u16 = 1 << 4;
    pub const ANONYMOUS: u16 = 1 << 5;
    pub const INCLUDE_TX_POWER: u16 = 1 << 6;

    pub fn is_connectable(&self) -> bool {
        self.0 & Self::CONNECTABLE != 0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 & Self::ANONYMOUS != 0
    }
}

/// LE Set Extended Advertising Parameters command
pub struct SetExtendedAdvertisingParameters {
    pub advertising_handle: u8,
    pub properties: AdvertisingEventProperties,
    /// Primary advertising interval minimum in units of 0.625 ms (24 bits)
    pub primary_interval_min: u32,
    /// Primary advertising interval maximum in units of 0.625 ms (24 bits)
    pub primary_interval_max: u32,
    pub primary_channel_map: u8,
    pub own_address_type: OwnAddressType,
    pub peer_address_kind: AddressKind,
    pub peer_address: BluetoothDeviceAddress,
    pub filter_policy: u8,
    /// Advertising TX power in dBm, 0x7F for no preference
    pub tx_power: i8,
    pub primary_phy: u8,
    pub secondary_max_skip: u8,
    pub secondary_phy: u8,
    pub advertising_sid: u8,
    pub scan_request_notification_enable: bool,
}

impl CommandParameter for SetExtendedAdvertisingParameters {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetExtendedAdvertisingParameters);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.advertising_handle);
        buffer.extend_from_slice(&self.properties.0.to_le_bytes());
        buffer.extend_from_slice(&self.primary_interval_min.to_le_bytes()[..3]);
        buffer.extend_from_slice(&self.primary_interval_max.to_le_bytes()[..3]);
        buffer.push(self.primary_channel_map);
        buffer.push(self.own_address_type.into_raw());
        buffer.push(raw_peer_address_kind(self.peer_address_kind));
        buffer.extend_from_slice(&self.peer_address.0);
        buffer.push(self.filter_policy);
        buffer.push(self.tx_power as u8);
        buffer.push(self.primary_phy);
        buffer.push(self.secondary_max_skip);
        buffer.push(self.secondary_phy);
        buffer.push(self.advertising_sid);
        buffer.push(self.scan_request_notification_enable as u8);
    }
}

fn extend_extended_advertising_data(buffer: &mut Vec<u8>, advertising_handle: u8, data: &[u8]) {
    buffer.push(advertising_handle);
    buffer.push(0x03); // operation: complete data
    buffer.push(0x01); // fragment preference: minimize fragmentation
    buffer.push(data.len() as u8);
    buffer.extend_from_slice(data);
}

/// LE Set Extended Advertising Data command
///
/// Only the complete-data operation is built; this host does not fragment advertising data
/// across multiple commands, the data is bounded by what fits one command packet.
pub struct SetExtendedAdvertisingData {
    pub advertising_handle: u8,
    pub data: Vec<u8>,
}

impl CommandParameter for SetExtendedAdvertisingData {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetExtendedAdvertisingData);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        extend_extended_advertising_data(buffer, self.advertising_handle, &self.data);
    }
}

/// LE Set Extended Scan Response Data command
pub struct SetExtendedScanResponseData {
    pub advertising_handle: u8,
    pub data: Vec<u8>,
}

impl CommandParameter for SetExtendedScanResponseData {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetExtendedScanResponseData);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        extend_extended_advertising_data(buffer, self.advertising_handle, &self.data);
    }
}

/// LE Set Extended Advertising Enable command
pub struct SetExtendedAdvertisingEnable {
    pub enable: bool,
    /// The sets to enable or disable as (advertising handle, duration, max events)
    pub sets: Vec<(u8, u16, u8)>,
}

impl CommandParameter for SetExtendedAdvertisingEnable {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetExtendedAdvertisingEnable);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.enable as u8);
        buffer.push(self.sets.len() as u8);

        for (advertising_handle, duration, max_events) in &self.sets {
            buffer.push(*advertising_handle);
            buffer.extend_from_slice(&duration.to_le_bytes());
            buffer.push(*max_events);
        }
    }
}

/// LE Remove Advertising Set command
pub struct RemoveAdvertisingSet {
    pub advertising_handle: u8,
}

impl CommandParameter for RemoveAdvertisingSet {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::RemoveAdvertisingSet);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.advertising_handle);
    }
}

/// The PHY bits of the extended scanning and initiating commands
pub const PHY_1M: u8 = 1 << 0;
pub const PHY_2M: u8 = 1 << 1;
pub const PHY_CODED: u8 = 1 << 2;

/// Per PHY scanning parameters
#[derive(Clone, Copy, Debug)]
pub struct PhyScanParameters {
    pub active_scanning: bool,
    pub scan_interval: u16,
    pub scan_window: u16,
}

/// LE Set Extended Scan Parameters command
pub struct SetExtendedScanParameters {
    pub own_address_type: OwnAddressType,
    pub filter_policy: u8,
    /// Bit mask of the scanned PHYs (1M and Coded are scannable primaries)
    pub scanning_phys: u8,
    /// One entry per set bit of `scanning_phys`, lowest bit first
    pub phy_parameters: Vec<PhyScanParameters>,
}

impl CommandParameter for SetExtendedScanParameters {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetExtendedScanParameters);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        debug_assert_eq!(self.scanning_phys.count_ones() as usize, self.phy_parameters.len());

        buffer.push(self.own_address_type.into_raw());
        buffer.push(self.filter_policy);
        buffer.push(self.scanning_phys);

        for phy in &self.phy_parameters {
            buffer.push(phy.active_scanning as u8);
            buffer.extend_from_slice(&phy.scan_interval.to_le_bytes());
            buffer.extend_from_slice(&phy.scan_window.to_le_bytes());
        }
    }
}

/// LE Set Extended Scan Enable command
pub struct SetExtendedScanEnable {
    pub enable: bool,
    pub filter_duplicates: bool,
    /// Scan duration in units of 10 ms, zero to scan until disabled
    pub duration: u16,
    /// Scan period in units of 1.28 s, zero for continuous
    pub period: u16,
}

impl CommandParameter for SetExtendedScanEnable {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::SetExtendedScanEnable);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.enable as u8);
        buffer.push(self.filter_duplicates as u8);
        buffer.extend_from_slice(&self.duration.to_le_bytes());
        buffer.extend_from_slice(&self.period.to_le_bytes());
    }
}

/// Per PHY initiating parameters of the extended create connection command
#[derive(Clone, Copy, Debug)]
pub struct PhyConnectionParameters {
    pub scan_interval: u16,
    pub scan_window: u16,
    pub intervals: ConnectionIntervalParameters,
}

/// LE Extended Create Connection command
pub struct ExtendedCreateConnection {
    pub use_filter_accept_list: bool,
    pub own_address_type: OwnAddressType,
    pub peer_address_kind: AddressKind,
    pub peer_address: BluetoothDeviceAddress,
    /// Bit mask of the initiating PHYs
    pub initiating_phys: u8,
    /// One entry per set bit of `initiating_phys`, lowest bit first
    pub phy_parameters: Vec<PhyConnectionParameters>,
}

impl CommandParameter for ExtendedCreateConnection {
    const COMMAND: HciCommand = HciCommand::LEController(LEController::ExtendedCreateConnection);

    fn get_parameter(&self, buffer: &mut Vec<u8>) {
        debug_assert_eq!(self.initiating_phys.count_ones() as usize, self.phy_parameters.len());

        buffer.push(self.use_filter_accept_list as u8);
        buffer.push(self.own_address_type.into_raw());
        buffer.push(raw_peer_address_kind(self.peer_address_kind));
        buffer.extend_from_slice(&self.peer_address.0);
        buffer.push(self.initiating_phys);

        for phy in &self.phy_parameters {
            buffer.extend_from_slice(&phy.scan_interval.to_le_bytes());
            buffer.extend_from_slice(&phy.scan_window.to_le_bytes());
            phy.intervals.get_parameter(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertising_data_is_padded_to_31() {
        let mut buffer = Vec::new();

        SetAdvertisingData {
            data: alloc::vec![0x02, 0x01, 0x06],
        }
        .get_parameter(&mut buffer);

        assert_eq!(32, buffer.len());
        assert_eq!(3, buffer[0]);
        assert_eq!(&[0x02, 0x01, 0x06], &buffer[1..4]);
        assert!(buffer[4..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn create_connection_parameter_length() {
        let mut buffer = Vec::new();

        CreateConnection {
            scan_interval: 0x0060,
            scan_window: 0x0030,
            use_filter_accept_list: false,
            peer_address_kind: AddressKind::LeRandom,
            peer_address: BluetoothDeviceAddress([1, 2, 3, 4, 5, 6]),
            own_address_type: OwnAddressType::PublicDeviceAddress,
            intervals: ConnectionIntervalParameters {
                interval_min: 0x0018,
                interval_max: 0x0028,
                max_latency: 0,
                supervision_timeout: 0x002A,
                min_ce_length: 0,
                max_ce_length: 0,
            },
        }
        .get_parameter(&mut buffer);

        assert_eq!(25, buffer.len());
    }
}
