//! HCI event parsing
//!
//! This is the implementation of the events within the Host Controller Interface Specification
//! that this host consumes. A raw event packet (the two byte header followed by the event
//! parameter) converts into an [`EventsData`] carrying the parsed parameter for the event.
//!
//! Event parameter layouts are byte exact per Vol 4, Part E Section 7.7 of the Bluetooth
//! Specification.

use crate::ConnectionHandle;
use alloc::vec::Vec;
use bluejay_core::errors::Error;
use bluejay_core::{AddressKind, BluetoothDeviceAddress};
use core::fmt;

macro_rules! make_u16 {
    ( $packet:ident, $start:expr ) => {
        u16::from_le_bytes([$packet[$start], $packet[$start + 1]])
    };
}

macro_rules! make_baddr {
    ( $packet:ident, $start:expr ) => {{
        let mut address = [0u8; 6];
        address.copy_from_slice(&$packet[$start..($start + 6)]);
        BluetoothDeviceAddress(address)
    }};
}

/// "chews off" bytes from the front of $packet.
///
/// Invoking this with only the packet identifier returns a single u8, with a size a slice of that
/// many bytes is returned.
macro_rules! chew {
    ( $packet:ident, $size:expr ) => {{
        let chewed = &$packet[..($size as usize)];
        $packet = &$packet[($size as usize)..];
        chewed
    }};
    ( $packet:ident ) => {{
        let chewed_byte = $packet[0];
        $packet = &$packet[1..];
        chewed_byte
    }};
}

macro_rules! chew_u16 {
    ($packet:ident) => {{
        let chewed = make_u16!($packet, 0);
        $packet = &$packet[2..];
        chewed
    }};
}

macro_rules! chew_baddr {
    ($packet:ident) => {{
        let chewed = make_baddr!($packet, 0);
        $packet = &$packet[6..];
        chewed
    }};
}

macro_rules! chew_handle {
    ($packet:ident) => {{
        ConnectionHandle::try_from(chew_u16!($packet) & 0xFFF).ok()
    }};
}

macro_rules! chew_status {
    ($packet:ident) => {
        Error::from_raw(chew!($packet))
    };
}

macro_rules! need {
    ($packet:ident, $len:expr) => {
        if $packet.len() < $len {
            return Err(EventError::ParameterTooShort);
        }
    };
}

/// Error from parsing a raw event packet
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventError {
    PacketTooSmall,
    UnknownEventCode(u8),
    UnknownLeMetaSubEvent(u8),
    ParameterTooShort,
    InvalidParameterValue(&'static str),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventError::PacketTooSmall => f.write_str("packet is too small to be an HCI event"),
            EventError::UnknownEventCode(code) => write!(f, "unknown event code ({:#x})", code),
            EventError::UnknownLeMetaSubEvent(code) => {
                write!(f, "unknown LE meta sub event code ({:#x})", code)
            }
            EventError::ParameterTooShort => f.write_str("event parameter is too short"),
            EventError::InvalidParameterValue(what) => {
                write!(f, "invalid event parameter value for {}", what)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EventError {}

/// Enumeration of the events this host consumes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Events {
    InquiryComplete,
    InquiryResult,
    ConnectionComplete,
    ConnectionRequest,
    DisconnectionComplete,
    AuthenticationComplete,
    RemoteNameRequestComplete,
    EncryptionChange,
    ReadRemoteSupportedFeaturesComplete,
    ReadRemoteVersionInformationComplete,
    CommandComplete,
    CommandStatus,
    RoleChange,
    NumberOfCompletedPackets,
    PinCodeRequest,
    LinkKeyRequest,
    LinkKeyNotification,
    InquiryResultWithRssi,
    ReadRemoteExtendedFeaturesComplete,
    SynchronousConnectionComplete,
    ExtendedInquiryResult,
    IoCapabilityRequest,
    IoCapabilityResponse,
    UserConfirmationRequest,
    UserPasskeyRequest,
    SimplePairingComplete,
    UserPasskeyNotification,
    LeMeta(LeMeta),
    VendorDebug,
}

impl Events {
    /// Get the event code
    ///
    /// For a `LeMeta` event this is the code of the meta event (0x3E), not the sub event.
    pub fn get_event_code(&self) -> u8 {
        match self {
            Events::InquiryComplete => 0x01,
            Events::InquiryResult => 0x02,
            Events::ConnectionComplete => 0x03,
            Events::ConnectionRequest => 0x04,
            Events::DisconnectionComplete => 0x05,
            Events::AuthenticationComplete => 0x06,
            Events::RemoteNameRequestComplete => 0x07,
            Events::EncryptionChange => 0x08,
            Events::ReadRemoteSupportedFeaturesComplete => 0x0B,
            Events::ReadRemoteVersionInformationComplete => 0x0C,
            Events::CommandComplete => 0x0E,
            Events::CommandStatus => 0x0F,
            Events::RoleChange => 0x12,
            Events::NumberOfCompletedPackets => 0x13,
            Events::PinCodeRequest => 0x16,
            Events::LinkKeyRequest => 0x17,
            Events::LinkKeyNotification => 0x18,
            Events::InquiryResultWithRssi => 0x22,
            Events::ReadRemoteExtendedFeaturesComplete => 0x23,
            Events::SynchronousConnectionComplete => 0x2C,
            Events::ExtendedInquiryResult => 0x2F,
            Events::IoCapabilityRequest => 0x31,
            Events::IoCapabilityResponse => 0x32,
            Events::UserConfirmationRequest => 0x33,
            Events::UserPasskeyRequest => 0x34,
            Events::SimplePairingComplete => 0x36,
            Events::UserPasskeyNotification => 0x3B,
            Events::LeMeta(_) => 0x3E,
            Events::VendorDebug => 0xFF,
        }
    }
}

impl fmt::Display for Events {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Events::LeMeta(meta) => write!(f, "LE {:?}", meta),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Enumeration of the LE meta sub events this host consumes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum LeMeta {
    ConnectionComplete,
    AdvertisingReport,
    ConnectionUpdateComplete,
    ReadRemoteFeaturesComplete,
    LongTermKeyRequest,
    EnhancedConnectionComplete,
    ExtendedAdvertisingReport,
    AdvertisingSetTerminated,
}

impl LeMeta {
    /// Get the sub event code
    pub fn get_sub_event_code(&self) -> u8 {
        match self {
            LeMeta::ConnectionComplete => 0x01,
            LeMeta::AdvertisingReport => 0x02,
            LeMeta::ConnectionUpdateComplete => 0x03,
            LeMeta::ReadRemoteFeaturesComplete => 0x04,
            LeMeta::LongTermKeyRequest => 0x05,
            LeMeta::EnhancedConnectionComplete => 0x0A,
            LeMeta::ExtendedAdvertisingReport => 0x0D,
            LeMeta::AdvertisingSetTerminated => 0x12,
        }
    }

    fn try_from_sub_event_code(code: u8) -> Result<Self, EventError> {
        match code {
            0x01 => Ok(LeMeta::ConnectionComplete),
            0x02 => Ok(LeMeta::AdvertisingReport),
            0x03 => Ok(LeMeta::ConnectionUpdateComplete),
            0x04 => Ok(LeMeta::ReadRemoteFeaturesComplete),
            0x05 => Ok(LeMeta::LongTermKeyRequest),
            0x0A => Ok(LeMeta::EnhancedConnectionComplete),
            0x0D => Ok(LeMeta::ExtendedAdvertisingReport),
            0x12 => Ok(LeMeta::AdvertisingSetTerminated),
            code => Err(EventError::UnknownLeMetaSubEvent(code)),
        }
    }
}

/// The type of a link named within a connection event
///
/// A value outside the assigned ones still parses, as `Unknown` with the raw byte; a peer may
/// request a link type this host does not do, and the request has to reach the connection
/// manager for it to be rejected.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkType {
    ScoConnection,
    AclConnection,
    EscoConnection,
    Unknown(u8),
}

impl LinkType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => LinkType::ScoConnection,
            0x01 => LinkType::AclConnection,
            0x02 => LinkType::EscoConnection,
            raw => LinkType::Unknown(raw),
        }
    }
}

/// The role of this device on a connection
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Central,
    Peripheral,
}

impl Role {
    fn try_from_raw(raw: u8) -> Result<Self, EventError> {
        match raw {
            0x00 => Ok(Role::Central),
            0x01 => Ok(Role::Peripheral),
            _ => Err(EventError::InvalidParameterValue("role")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Central => f.write_str("central"),
            Role::Peripheral => f.write_str("peripheral"),
        }
    }
}

/// IO capabilities exchanged during Secure Simple Pairing
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
}

impl IoCapability {
    pub fn into_raw(self) -> u8 {
        match self {
            IoCapability::DisplayOnly => 0x00,
            IoCapability::DisplayYesNo => 0x01,
            IoCapability::KeyboardOnly => 0x02,
            IoCapability::NoInputNoOutput => 0x03,
        }
    }

    fn try_from_raw(raw: u8) -> Result<Self, EventError> {
        match raw {
            0x00 => Ok(IoCapability::DisplayOnly),
            0x01 => Ok(IoCapability::DisplayYesNo),
            0x02 => Ok(IoCapability::KeyboardOnly),
            0x03 => Ok(IoCapability::NoInputNoOutput),
            _ => Err(EventError::InvalidParameterValue("IO capability")),
        }
    }
}

/// BR/EDR link key types
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkKeyType {
    Combination,
    DebugCombination,
    UnauthenticatedCombinationP192,
    AuthenticatedCombinationP192,
    ChangedCombination,
    UnauthenticatedCombinationP256,
    AuthenticatedCombinationP256,
    Unknown(u8),
}

impl LinkKeyType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => LinkKeyType::Combination,
            0x03 => LinkKeyType::DebugCombination,
            0x04 => LinkKeyType::UnauthenticatedCombinationP192,
            0x05 => LinkKeyType::AuthenticatedCombinationP192,
            0x06 => LinkKeyType::ChangedCombination,
            0x07 => LinkKeyType::UnauthenticatedCombinationP256,
            0x08 => LinkKeyType::AuthenticatedCombinationP256,
            raw => LinkKeyType::Unknown(raw),
        }
    }

    /// Check if the key was generated with Secure Connections
    pub fn is_secure_connections(&self) -> bool {
        matches!(
            self,
            LinkKeyType::UnauthenticatedCombinationP256 | LinkKeyType::AuthenticatedCombinationP256
        )
    }

    /// Check if the key is authenticated (man in the middle protected)
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self,
            LinkKeyType::AuthenticatedCombinationP192 | LinkKeyType::AuthenticatedCombinationP256
        )
    }
}

fn le_address_kind(raw: u8) -> Result<AddressKind, EventError> {
    match raw {
        0x00 | 0x02 => Ok(AddressKind::LePublic),
        0x01 | 0x03 => Ok(AddressKind::LeRandom),
        0xFF => Ok(AddressKind::LeAnonymous),
        _ => Err(EventError::InvalidParameterValue("address type")),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandCompleteData {
    pub number_of_hci_command_packets: u8,
    /// The opcode of the completed command, `None` for the Controller's spontaneous credit
    /// updates (opcode zero).
    pub command_opcode: Option<u16>,
    /// The return parameter of the command, starting with the status byte for the commands that
    /// have one.
    pub return_parameter: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandStatusData {
    pub status: Error,
    pub number_of_hci_command_packets: u8,
    pub command_opcode: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub address: BluetoothDeviceAddress,
    pub link_type: LinkType,
    pub encryption_enabled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionRequestData {
    pub address: BluetoothDeviceAddress,
    pub class_of_device: u32,
    pub link_type: LinkType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisconnectionCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub reason: Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthenticationCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteNameRequestCompleteData {
    pub status: Error,
    pub address: BluetoothDeviceAddress,
    /// The remote name up to (not including) the first nul byte
    pub remote_name: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncryptionChangeData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub encryption_enabled: EncryptionEnabled,
}

/// The encryption state reported by the encryption change event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionEnabled {
    Off,
    /// E0 for BR/EDR, AES-CCM for LE
    On,
    /// AES-CCM for BR/EDR (Secure Connections)
    OnAesCcmForBrEdr,
}

impl EncryptionEnabled {
    fn try_from_raw(raw: u8) -> Result<Self, EventError> {
        match raw {
            0x00 => Ok(EncryptionEnabled::Off),
            0x01 => Ok(EncryptionEnabled::On),
            0x02 => Ok(EncryptionEnabled::OnAesCcmForBrEdr),
            _ => Err(EventError::InvalidParameterValue("encryption enabled")),
        }
    }

    pub fn is_on(&self) -> bool {
        !matches!(self, EncryptionEnabled::Off)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRemoteSupportedFeaturesCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub lmp_features: [u8; 8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRemoteExtendedFeaturesCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub page_number: u8,
    pub maximum_page_number: u8,
    pub extended_lmp_features: [u8; 8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRemoteVersionInformationCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub version: u8,
    pub manufacturer_name: u16,
    pub subversion: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleChangeData {
    pub status: Error,
    pub address: BluetoothDeviceAddress,
    pub new_role: Role,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NumberOfCompletedPacket {
    pub connection_handle: Option<ConnectionHandle>,
    pub completed_packets: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumberOfCompletedPacketsData {
    pub completed_packets: Vec<NumberOfCompletedPacket>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinCodeRequestData {
    pub address: BluetoothDeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkKeyRequestData {
    pub address: BluetoothDeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkKeyNotificationData {
    pub address: BluetoothDeviceAddress,
    pub link_key: [u8; 16],
    pub key_type: LinkKeyType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InquiryResult {
    pub address: BluetoothDeviceAddress,
    pub page_scan_repetition_mode: u8,
    pub class_of_device: u32,
    pub clock_offset: u16,
    pub rssi: Option<i8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InquiryResultData {
    pub results: Vec<InquiryResult>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedInquiryResultData {
    pub result: InquiryResult,
    pub extended_inquiry_response: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SynchronousConnectionCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub address: BluetoothDeviceAddress,
    pub link_type: LinkType,
    pub transmission_interval: u8,
    pub retransmission_window: u8,
    pub rx_packet_length: u16,
    pub tx_packet_length: u16,
    pub air_mode: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoCapabilityRequestData {
    pub address: BluetoothDeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoCapabilityResponseData {
    pub address: BluetoothDeviceAddress,
    pub io_capability: IoCapability,
    pub oob_data_present: bool,
    /// Raw authentication requirements octet; bit zero of the pairs is "MITM required"
    pub authentication_requirements: u8,
}

impl IoCapabilityResponseData {
    /// Check if the peer requires man in the middle protection
    pub fn mitm_required(&self) -> bool {
        self.authentication_requirements & 0x01 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserConfirmationRequestData {
    pub address: BluetoothDeviceAddress,
    pub numeric_value: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserPasskeyRequestData {
    pub address: BluetoothDeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimplePairingCompleteData {
    pub status: Error,
    pub address: BluetoothDeviceAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserPasskeyNotificationData {
    pub address: BluetoothDeviceAddress,
    pub passkey: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeConnectionCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub role: Role,
    pub peer_address_kind: AddressKind,
    pub peer_address: BluetoothDeviceAddress,
    pub connection_interval: u16,
    pub peripheral_latency: u16,
    pub supervision_timeout: u16,
    pub central_clock_accuracy: u8,
    /// Only present within the enhanced variant of the event
    pub local_resolvable_private_address: Option<BluetoothDeviceAddress>,
    /// Only present within the enhanced variant of the event
    pub peer_resolvable_private_address: Option<BluetoothDeviceAddress>,
}

/// The PDU type of a legacy advertising report
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeAdvertisingEventType {
    ConnectableAndScannableUndirected,
    ConnectableDirected,
    ScannableUndirected,
    NonConnectableUndirected,
    ScanResponse,
}

impl LeAdvertisingEventType {
    fn try_from_raw(raw: u8) -> Result<Self, EventError> {
        match raw {
            0x00 => Ok(LeAdvertisingEventType::ConnectableAndScannableUndirected),
            0x01 => Ok(LeAdvertisingEventType::ConnectableDirected),
            0x02 => Ok(LeAdvertisingEventType::ScannableUndirected),
            0x03 => Ok(LeAdvertisingEventType::NonConnectableUndirected),
            0x04 => Ok(LeAdvertisingEventType::ScanResponse),
            _ => Err(EventError::InvalidParameterValue("advertising event type")),
        }
    }

    pub fn is_connectable(&self) -> bool {
        matches!(
            self,
            LeAdvertisingEventType::ConnectableAndScannableUndirected
                | LeAdvertisingEventType::ConnectableDirected
        )
    }

    pub fn is_directed(&self) -> bool {
        matches!(self, LeAdvertisingEventType::ConnectableDirected)
    }

    pub fn is_scan_response(&self) -> bool {
        matches!(self, LeAdvertisingEventType::ScanResponse)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeAdvertisingReport {
    pub event_type: LeAdvertisingEventType,
    pub address_kind: AddressKind,
    pub address: BluetoothDeviceAddress,
    pub data: Vec<u8>,
    pub rssi: Option<i8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeAdvertisingReportData {
    pub reports: Vec<LeAdvertisingReport>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeConnectionUpdateCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub connection_interval: u16,
    pub peripheral_latency: u16,
    pub supervision_timeout: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeReadRemoteFeaturesCompleteData {
    pub status: Error,
    pub connection_handle: Option<ConnectionHandle>,
    pub le_features: [u8; 8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeLongTermKeyRequestData {
    pub connection_handle: Option<ConnectionHandle>,
    pub random_number: u64,
    pub encrypted_diversifier: u16,
}

/// The event type bit field of an extended advertising report
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeExtendedAdvertisingEventType(pub u16);

impl LeExtendedAdvertisingEventType {
    pub fn is_connectable(&self) -> bool {
        self.0 & (1 << 0) != 0
    }

    pub fn is_scannable(&self) -> bool {
        self.0 & (1 << 1) != 0
    }

    pub fn is_directed(&self) -> bool {
        self.0 & (1 << 2) != 0
    }

    pub fn is_scan_response(&self) -> bool {
        self.0 & (1 << 3) != 0
    }

    pub fn is_legacy(&self) -> bool {
        self.0 & (1 << 4) != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeExtendedAdvertisingReport {
    pub event_type: LeExtendedAdvertisingEventType,
    pub address_kind: AddressKind,
    pub address: BluetoothDeviceAddress,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub advertising_sid: u8,
    pub tx_power: Option<i8>,
    pub rssi: Option<i8>,
    pub periodic_advertising_interval: u16,
    pub direct_address_kind: Option<AddressKind>,
    pub direct_address: Option<BluetoothDeviceAddress>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeExtendedAdvertisingReportData {
    pub reports: Vec<LeExtendedAdvertisingReport>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeAdvertisingSetTerminatedData {
    pub status: Error,
    pub advertising_handle: u8,
    pub connection_handle: Option<ConnectionHandle>,
    pub num_completed_extended_advertising_events: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VendorDebugData {
    pub sub_event_code: u8,
    pub parameter: Vec<u8>,
}

/// A parsed HCI event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventsData {
    InquiryComplete(Error),
    InquiryResult(InquiryResultData),
    ConnectionComplete(ConnectionCompleteData),
    ConnectionRequest(ConnectionRequestData),
    DisconnectionComplete(DisconnectionCompleteData),
    AuthenticationComplete(AuthenticationCompleteData),
    RemoteNameRequestComplete(RemoteNameRequestCompleteData),
    EncryptionChange(EncryptionChangeData),
    ReadRemoteSupportedFeaturesComplete(ReadRemoteSupportedFeaturesCompleteData),
    ReadRemoteVersionInformationComplete(ReadRemoteVersionInformationCompleteData),
    CommandComplete(CommandCompleteData),
    CommandStatus(CommandStatusData),
    RoleChange(RoleChangeData),
    NumberOfCompletedPackets(NumberOfCompletedPacketsData),
    PinCodeRequest(PinCodeRequestData),
    LinkKeyRequest(LinkKeyRequestData),
    LinkKeyNotification(LinkKeyNotificationData),
    InquiryResultWithRssi(InquiryResultData),
    ReadRemoteExtendedFeaturesComplete(ReadRemoteExtendedFeaturesCompleteData),
    SynchronousConnectionComplete(SynchronousConnectionCompleteData),
    ExtendedInquiryResult(ExtendedInquiryResultData),
    IoCapabilityRequest(IoCapabilityRequestData),
    IoCapabilityResponse(IoCapabilityResponseData),
    UserConfirmationRequest(UserConfirmationRequestData),
    UserPasskeyRequest(UserPasskeyRequestData),
    SimplePairingComplete(SimplePairingCompleteData),
    UserPasskeyNotification(UserPasskeyNotificationData),
    LeConnectionComplete(LeConnectionCompleteData),
    LeAdvertisingReport(LeAdvertisingReportData),
    LeConnectionUpdateComplete(LeConnectionUpdateCompleteData),
    LeReadRemoteFeaturesComplete(LeReadRemoteFeaturesCompleteData),
    LeLongTermKeyRequest(LeLongTermKeyRequestData),
    LeExtendedAdvertisingReport(LeExtendedAdvertisingReportData),
    LeAdvertisingSetTerminated(LeAdvertisingSetTerminatedData),
    VendorDebug(VendorDebugData),
}

impl EventsData {
    /// Get the event this data is for
    pub fn get_event(&self) -> Events {
        match self {
            EventsData::InquiryComplete(_) => Events::InquiryComplete,
            EventsData::InquiryResult(_) => Events::InquiryResult,
            EventsData::ConnectionComplete(_) => Events::ConnectionComplete,
            EventsData::ConnectionRequest(_) => Events::ConnectionRequest,
            EventsData::DisconnectionComplete(_) => Events::DisconnectionComplete,
            EventsData::AuthenticationComplete(_) => Events::AuthenticationComplete,
            EventsData::RemoteNameRequestComplete(_) => Events::RemoteNameRequestComplete,
            EventsData::EncryptionChange(_) => Events::EncryptionChange,
            EventsData::ReadRemoteSupportedFeaturesComplete(_) => {
                Events::ReadRemoteSupportedFeaturesComplete
            }
            EventsData::ReadRemoteVersionInformationComplete(_) => {
                Events::ReadRemoteVersionInformationComplete
            }
            EventsData::CommandComplete(_) => Events::CommandComplete,
            EventsData::CommandStatus(_) => Events::CommandStatus,
            EventsData::RoleChange(_) => Events::RoleChange,
            EventsData::NumberOfCompletedPackets(_) => Events::NumberOfCompletedPackets,
            EventsData::PinCodeRequest(_) => Events::PinCodeRequest,
            EventsData::LinkKeyRequest(_) => Events::LinkKeyRequest,
            EventsData::LinkKeyNotification(_) => Events::LinkKeyNotification,
            EventsData::InquiryResultWithRssi(_) => Events::InquiryResultWithRssi,
            EventsData::ReadRemoteExtendedFeaturesComplete(_) => {
                Events::ReadRemoteExtendedFeaturesComplete
            }
            EventsData::SynchronousConnectionComplete(_) => Events::SynchronousConnectionComplete,
            EventsData::ExtendedInquiryResult(_) => Events::ExtendedInquiryResult,
            EventsData::IoCapabilityRequest(_) => Events::IoCapabilityRequest,
            EventsData::IoCapabilityResponse(_) => Events::IoCapabilityResponse,
            EventsData::UserConfirmationRequest(_) => Events::UserConfirmationRequest,
            EventsData::UserPasskeyRequest(_) => Events::UserPasskeyRequest,
            EventsData::SimplePairingComplete(_) => Events::SimplePairingComplete,
            EventsData::UserPasskeyNotification(_) => Events::UserPasskeyNotification,
            EventsData::LeConnectionComplete(_) => Events::LeMeta(LeMeta::ConnectionComplete),
            EventsData::LeAdvertisingReport(_) => Events::LeMeta(LeMeta::AdvertisingReport),
            EventsData::LeConnectionUpdateComplete(_) => {
                Events::LeMeta(LeMeta::ConnectionUpdateComplete)
            }
            EventsData::LeReadRemoteFeaturesComplete(_) => {
                Events::LeMeta(LeMeta::ReadRemoteFeaturesComplete)
            }
            EventsData::LeLongTermKeyRequest(_) => Events::LeMeta(LeMeta::LongTermKeyRequest),
            EventsData::LeExtendedAdvertisingReport(_) => {
                Events::LeMeta(LeMeta::ExtendedAdvertisingReport)
            }
            EventsData::LeAdvertisingSetTerminated(_) => {
                Events::LeMeta(LeMeta::AdvertisingSetTerminated)
            }
            EventsData::VendorDebug(_) => Events::VendorDebug,
        }
    }

    /// Parse a raw event packet (the two byte header followed by the parameter)
    pub fn try_from_packet(packet: &[u8]) -> Result<Self, EventError> {
        if packet.len() < 2 {
            return Err(EventError::PacketTooSmall);
        }

        let event_code = packet[0];
        let length = packet[1] as usize;

        if packet[2..].len() < length {
            return Err(EventError::PacketTooSmall);
        }

        let parameter = &packet[2..2 + length];

        Self::parse_parameter(event_code, parameter)
    }

    fn parse_parameter(event_code: u8, mut p: &[u8]) -> Result<Self, EventError> {
        match event_code {
            0x01 => {
                need!(p, 1);

                Ok(EventsData::InquiryComplete(chew_status!(p)))
            }
            0x02 => parse_inquiry_result(p, false).map(EventsData::InquiryResult),
            0x03 => {
                need!(p, 11);

                Ok(EventsData::ConnectionComplete(ConnectionCompleteData {
                    status: chew_status!(p),
                    connection_handle: chew_handle!(p),
                    address: chew_baddr!(p),
                    link_type: LinkType::from_raw(chew!(p)),
                    encryption_enabled: chew!(p) != 0,
                }))
            }
            0x04 => {
                need!(p, 10);

                Ok(EventsData::ConnectionRequest(ConnectionRequestData {
                    address: chew_baddr!(p),
                    class_of_device: {
                        let raw = chew!(p, 3);

                        (raw[0] as u32) | (raw[1] as u32) << 8 | (raw[2] as u32) << 16
                    },
                    link_type: LinkType::from_raw(chew!(p)),
                }))
            }
            0x05 => {
                need!(p, 4);

                Ok(EventsData::DisconnectionComplete(DisconnectionCompleteData {
                    status: chew_status!(p),
                    connection_handle: chew_handle!(p),
                    reason: chew_status!(p),
                }))
            }
            0x06 => {
                need!(p, 3);

                Ok(EventsData::AuthenticationComplete(AuthenticationCompleteData {
                    status: chew_status!(p),
                    connection_handle: chew_handle!(p),
                }))
            }
            0x07 => {
                need!(p, 7);

                Ok(EventsData::RemoteNameRequestComplete(RemoteNameRequestCompleteData {
                    status: chew_status!(p),
                    address: chew_baddr!(p),
                    remote_name: p.iter().copied().take_while(|byte| *byte != 0).collect(),
                }))
            }
            0x08 => {
                need!(p, 4);

                Ok(EventsData::EncryptionChange(EncryptionChangeData {
                    status: chew_status!(p),
                    connection_handle: chew_handle!(p),
                    encryption_enabled: EncryptionEnabled::try_from_raw(chew!(p))?,
                }))
            }
            0x0B => {
                need!(p, 11);

                Ok(EventsData::ReadRemoteSupportedFeaturesComplete(
                    ReadRemoteSupportedFeaturesCompleteData {
                        status: chew_status!(p),
                        connection_handle: chew_handle!(p),
                        lmp_features: chew!(p, 8).try_into().unwrap(),
                    },
                ))
            }
            0x0C => {
                need!(p, 8);

                Ok(EventsData::ReadRemoteVersionInformationComplete(
                    ReadRemoteVersionInformationCompleteData {
                        status: chew_status!(p),
                        connection_handle: chew_handle!(p),
                        version: chew!(p),
                        manufacturer_name: chew_u16!(p),
                        subversion: chew_u16!(p),
                    },
                ))
            }
            0x0E => {
                need!(p, 3);

                Ok(EventsData::CommandComplete(CommandCompleteData {
                    number_of_hci_command_packets: chew!(p),
                    command_opcode: match chew_u16!(p) {
                        0 => None,
                        opcode => Some(opcode),
                    },
                    return_parameter: p.to_vec(),
                }))
            }
            0x0F => {
                need!(p, 4);

                Ok(EventsData::CommandStatus(CommandStatusData {
                    status: chew_status!(p),
                    number_of_hci_command_packets: chew!(p),
                    command_opcode: match chew_u16!(p) {
                        0 => None,
                        opcode => Some(opcode),
                    },
                }))
            }
            0x12 => {
                need!(p, 8);

                Ok(EventsData::RoleChange(RoleChangeData {
                    status: chew_status!(p),
                    address: chew_baddr!(p),
                    new_role: Role::try_from_raw(chew!(p))?,
                }))
            }
            0x13 => {
                need!(p, 1);

                let count = chew!(p) as usize;

                need!(p, count * 4);

                let completed_packets = (0..count)
                    .map(|_| NumberOfCompletedPacket {
                        connection_handle: chew_handle!(p),
                        completed_packets: chew_u16!(p),
                    })
                    .collect();

                Ok(EventsData::NumberOfCompletedPackets(NumberOfCompletedPacketsData {
                    completed_packets,
                }))
            }
            0x16 => {
                need!(p, 6);

                Ok(EventsData::PinCodeRequest(PinCodeRequestData {
                    address: chew_baddr!(p),
                }))
            }
            0x17 => {
                need!(p, 6);

                Ok(EventsData::LinkKeyRequest(LinkKeyRequestData {
                    address: chew_baddr!(p),
                }))
            }
            0x18 => {
                need!(p, 23);

                Ok(EventsData::LinkKeyNotification(LinkKeyNotificationData {
                    address: chew_baddr!(p),
                    link_key: chew!(p, 16).try_into().unwrap(),
                    key_type: LinkKeyType::from_raw(chew!(p)),
                }))
            }
            0x22 => parse_inquiry_result(p, true).map(EventsData::InquiryResultWithRssi),
            0x23 => {
                need!(p, 13);

                Ok(EventsData::ReadRemoteExtendedFeaturesComplete(
                    ReadRemoteExtendedFeaturesCompleteData {
                        status: chew_status!(p),
                        connection_handle: chew_handle!(p),
                        page_number: chew!(p),
                        maximum_page_number: chew!(p),
                        extended_lmp_features: chew!(p, 8).try_into().unwrap(),
                    },
                ))
            }
            0x2C => {
                need!(p, 17);

                Ok(EventsData::SynchronousConnectionComplete(
                    SynchronousConnectionCompleteData {
                        status: chew_status!(p),
                        connection_handle: chew_handle!(p),
                        address: chew_baddr!(p),
                        link_type: LinkType::from_raw(chew!(p)),
                        transmission_interval: chew!(p),
                        retransmission_window: chew!(p),
                        rx_packet_length: chew_u16!(p),
                        tx_packet_length: chew_u16!(p),
                        air_mode: chew!(p),
                    },
                ))
            }
            0x2F => {
                need!(p, 15);

                let result = InquiryResult {
                    address: chew_baddr!(p),
                    page_scan_repetition_mode: {
                        let mode = chew!(p);

                        // reserved octet between the mode and the class of device
                        let _ = chew!(p);

                        mode
                    },
                    class_of_device: {
                        let raw = chew!(p, 3);

                        (raw[0] as u32) | (raw[1] as u32) << 8 | (raw[2] as u32) << 16
                    },
                    clock_offset: chew_u16!(p),
                    rssi: Some(chew!(p) as i8),
                };

                Ok(EventsData::ExtendedInquiryResult(ExtendedInquiryResultData {
                    result,
                    extended_inquiry_response: p.to_vec(),
                }))
            }
            0x31 => {
                need!(p, 6);

                Ok(EventsData::IoCapabilityRequest(IoCapabilityRequestData {
                    address: chew_baddr!(p),
                }))
            }
            0x32 => {
                need!(p, 9);

                Ok(EventsData::IoCapabilityResponse(IoCapabilityResponseData {
                    address: chew_baddr!(p),
                    io_capability: IoCapability::try_from_raw(chew!(p))?,
                    oob_data_present: chew!(p) != 0,
                    authentication_requirements: chew!(p),
                }))
            }
            0x33 => {
                need!(p, 10);

                Ok(EventsData::UserConfirmationRequest(UserConfirmationRequestData {
                    address: chew_baddr!(p),
                    numeric_value: u32::from_le_bytes(chew!(p, 4).try_into().unwrap()),
                }))
            }
            0x34 => {
                need!(p, 6);

                Ok(EventsData::UserPasskeyRequest(UserPasskeyRequestData {
                    address: chew_baddr!(p),
                }))
            }
            0x36 => {
                need!(p, 7);

                Ok(EventsData::SimplePairingComplete(SimplePairingCompleteData {
                    status: chew_status!(p),
                    address: chew_baddr!(p),
                }))
            }
            0x3B => {
                need!(p, 10);

                Ok(EventsData::UserPasskeyNotification(UserPasskeyNotificationData {
                    address: chew_baddr!(p),
                    passkey: u32::from_le_bytes(chew!(p, 4).try_into().unwrap()),
                }))
            }
            0x3E => {
                need!(p, 1);

                let sub_event_code = chew!(p);

                Self::parse_le_meta(LeMeta::try_from_sub_event_code(sub_event_code)?, p)
            }
            0xFF => {
                need!(p, 1);

                Ok(EventsData::VendorDebug(VendorDebugData {
                    sub_event_code: chew!(p),
                    parameter: p.to_vec(),
                }))
            }
            code => Err(EventError::UnknownEventCode(code)),
        }
    }

    fn parse_le_meta(sub_event: LeMeta, mut p: &[u8]) -> Result<Self, EventError> {
        match sub_event {
            LeMeta::ConnectionComplete => {
                need!(p, 18);

                Ok(EventsData::LeConnectionComplete(LeConnectionCompleteData {
                    status: chew_status!(p),
                    connection_handle: chew_handle!(p),
                    role: Role::try_from_raw(chew!(p))?,
                    peer_address_kind: le_address_kind(chew!(p))?,
                    peer_address: chew_baddr!(p),
                    connection_interval: chew_u16!(p),
                    peripheral_latency: chew_u16!(p),
                    supervision_timeout: chew_u16!(p),
                    central_clock_accuracy: chew!(p),
                    local_resolvable_private_address: None,
                    peer_resolvable_private_address: None,
                }))
            }
            LeMeta::EnhancedConnectionComplete => {
                need!(p, 30);

                Ok(EventsData::LeConnectionComplete(LeConnectionCompleteData {
                    status: chew_status!(p),
                    connection_handle: chew_handle!(p),
                    role: Role::try_from_raw(chew!(p))?,
                    peer_address_kind: le_address_kind(chew!(p))?,
                    peer_address: chew_baddr!(p),
                    local_resolvable_private_address: Some(chew_baddr!(p)),
                    peer_resolvable_private_address: Some(chew_baddr!(p)),
                    connection_interval: chew_u16!(p),
                    peripheral_latency: chew_u16!(p),
                    supervision_timeout: chew_u16!(p),
                    central_clock_accuracy: chew!(p),
                }))
            }
            LeMeta::AdvertisingReport => {
                need!(p, 1);

                let count = chew!(p) as usize;

                let mut reports = Vec::with_capacity(count);

                for _ in 0..count {
                    need!(p, 9);

                    let event_type = LeAdvertisingEventType::try_from_raw(chew!(p))?;
                    let address_kind = le_address_kind(chew!(p))?;
                    let address = chew_baddr!(p);
                    let data_length = chew!(p) as usize;

                    need!(p, data_length + 1);

                    let data = chew!(p, data_length).to_vec();

                    let rssi = match chew!(p) as i8 {
                        127 => None,
                        rssi => Some(rssi),
                    };

                    reports.push(LeAdvertisingReport {
                        event_type,
                        address_kind,
                        address,
                        data,
                        rssi,
                    });
                }

                Ok(EventsData::LeAdvertisingReport(LeAdvertisingReportData { reports }))
            }
            LeMeta::ConnectionUpdateComplete => {
                need!(p, 9);

                Ok(EventsData::LeConnectionUpdateComplete(LeConnectionUpdateCompleteData {
                    status: chew_status!(p),
                    connection_handle: chew_handle!(p),
                    connection_interval: chew_u16!(p),
                    peripheral_latency: chew_u16!(p),
                    supervision_timeout: chew_u16!(p),
                }))
            }
            LeMeta::ReadRemoteFeaturesComplete => {
                need!(p, 11);

                Ok(EventsData::LeReadRemoteFeaturesComplete(LeReadRemoteFeaturesCompleteData {
                    status: chew_status!(p),
                    connection_handle: chew_handle!(p),
                    le_features: chew!(p, 8).try_into().unwrap(),
                }))
            }
            LeMeta::LongTermKeyRequest => {
                need!(p, 12);

                Ok(EventsData::LeLongTermKeyRequest(LeLongTermKeyRequestData {
                    connection_handle: chew_handle!(p),
                    random_number: u64::from_le_bytes(chew!(p, 8).try_into().unwrap()),
                    encrypted_diversifier: chew_u16!(p),
                }))
            }
            LeMeta::ExtendedAdvertisingReport => {
                need!(p, 1);

                let count = chew!(p) as usize;

                let mut reports = Vec::with_capacity(count);

                for _ in 0..count {
                    need!(p, 24);

                    let event_type = LeExtendedAdvertisingEventType(chew_u16!(p));
                    let address_kind = le_address_kind(chew!(p))?;
                    let address = chew_baddr!(p);
                    let primary_phy = chew!(p);
                    let secondary_phy = chew!(p);
                    let advertising_sid = chew!(p);

                    let tx_power = match chew!(p) as i8 {
                        127 => None,
                        power => Some(power),
                    };

                    let rssi = match chew!(p) as i8 {
                        127 => None,
                        rssi => Some(rssi),
                    };

                    let periodic_advertising_interval = chew_u16!(p);

                    let raw_direct_kind = chew!(p);
                    let raw_direct_address = chew_baddr!(p);

                    let data_length = chew!(p) as usize;

                    need!(p, data_length);

                    let data = chew!(p, data_length).to_vec();

                    let (direct_address_kind, direct_address) =
                        if event_type.is_directed() {
                            (Some(le_address_kind(raw_direct_kind)?), Some(raw_direct_address))
                        } else {
                            (None, None)
                        };

                    reports.push(LeExtendedAdvertisingReport {
                        event_type,
                        address_kind,
                        address,
                        primary_phy,
                        secondary_phy,
                        advertising_sid,
                        tx_power,
                        rssi,
                        periodic_advertising_interval,
                        direct_address_kind,
                        direct_address,
                        data,
                    });
                }

                Ok(EventsData::LeExtendedAdvertisingReport(LeExtendedAdvertisingReportData {
                    reports,
                }))
            }
            LeMeta::AdvertisingSetTerminated => {
                need!(p, 5);

                Ok(EventsData::LeAdvertisingSetTerminated(LeAdvertisingSetTerminatedData {
                    status: chew_status!(p),
                    advertising_handle: chew!(p),
                    connection_handle: chew_handle!(p),
                    num_completed_extended_advertising_events: chew!(p),
                }))
            }
        }
    }
}

fn parse_inquiry_result(mut p: &[u8], with_rssi: bool) -> Result<InquiryResultData, EventError> {
    need!(p, 1);

    let count = chew!(p) as usize;

    // the legacy result carries two reserved octets that the RSSI variant replaces with RSSI
    let per_result = if with_rssi { 14 } else { 14 };

    need!(p, count * per_result);

    let mut results = Vec::with_capacity(count);

    for _ in 0..count {
        let address = chew_baddr!(p);
        let page_scan_repetition_mode = chew!(p);

        let _reserved = if with_rssi { chew!(p, 1) } else { chew!(p, 2) };

        let class_of_device = {
            let raw = chew!(p, 3);

            (raw[0] as u32) | (raw[1] as u32) << 8 | (raw[2] as u32) << 16
        };

        let clock_offset = chew_u16!(p);

        let rssi = with_rssi.then(|| chew!(p) as i8);

        results.push(InquiryResult {
            address,
            page_scan_repetition_mode,
            class_of_device,
            clock_offset,
            rssi,
        });
    }

    Ok(InquiryResultData { results })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_complete_parse() {
        // Command Complete for Reset with one command credit and a success status
        let packet = [0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00];

        let data = EventsData::try_from_packet(&packet).unwrap();

        match data {
            EventsData::CommandComplete(complete) => {
                assert_eq!(1, complete.number_of_hci_command_packets);
                assert_eq!(Some(0x0C03), complete.command_opcode);
                assert_eq!(&[0x00], complete.return_parameter.as_slice());
            }
            other => panic!("expected command complete, parsed {:?}", other),
        }
    }

    #[test]
    fn le_connection_complete_parse() {
        let packet = [
            0x3E, 0x13, 0x01, // LE meta, length, connection complete
            0x00, // status
            0x42, 0x00, // handle
            0x00, // role central
            0x01, // peer address type random
            0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // peer address
            0x18, 0x00, // interval
            0x00, 0x00, // latency
            0x2A, 0x00, // supervision timeout
            0x00, // clock accuracy
        ];

        let data = EventsData::try_from_packet(&packet).unwrap();

        match data {
            EventsData::LeConnectionComplete(complete) => {
                assert_eq!(Error::NoError, complete.status);
                assert_eq!(0x42, complete.connection_handle.unwrap().get_raw_handle());
                assert_eq!(Role::Central, complete.role);
                assert_eq!(AddressKind::LeRandom, complete.peer_address_kind);
                assert_eq!(0x0018, complete.connection_interval);
            }
            other => panic!("expected LE connection complete, parsed {:?}", other),
        }
    }

    #[test]
    fn truncated_event_is_an_error() {
        let packet = [0x05, 0x04, 0x00, 0x42]; // disconnection complete cut short

        assert_eq!(Err(EventError::PacketTooSmall), EventsData::try_from_packet(&packet));
    }

    #[test]
    fn unknown_link_type_still_parses() {
        // a connection request naming a link type this host does not know
        let packet = [
            0x04, 0x0A, // connection request, length
            1, 2, 3, 4, 5, 6, // address
            0x04, 0x04, 0x20, // class of device
            0x05, // link type
        ];

        match EventsData::try_from_packet(&packet).unwrap() {
            EventsData::ConnectionRequest(request) => {
                assert_eq!(LinkType::Unknown(0x05), request.link_type);
            }
            other => panic!("expected connection request, parsed {:?}", other),
        }
    }

    #[test]
    fn vendor_debug_demux_byte() {
        let packet = [0xFF, 0x03, 0x57, 0x01, 0x02];

        match EventsData::try_from_packet(&packet).unwrap() {
            EventsData::VendorDebug(vendor) => {
                assert_eq!(0x57, vendor.sub_event_code);
                assert_eq!(&[0x01, 0x02], vendor.parameter.as_slice());
            }
            other => panic!("expected vendor debug, parsed {:?}", other),
        }
    }
}
