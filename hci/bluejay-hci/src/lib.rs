//! The Host side of the Host Controller Interface
//!
//! This crate implements the host's half of the HCI: building and sending commands, correlating
//! the Controller's responses, demultiplexing events, and the flow controlled data channels for
//! ACL, SCO, and ISO traffic.
//!
//! The entry point is [`Transport`]. A `Transport` is created over a [`ControllerDriver`] (the
//! byte pipe to the Controller, out of scope for this crate beyond the [H4] framing helper) and
//! hands out its [`CommandChannel`] and data channels. Everything runs on the one host
//! [`Dispatcher`].
//!
//! ## Commands
//! Commands are organized by their command group in the modules under [`commands`], in the form
//! `commands::`*command group*`::`*command*. Each is a parameter struct implementing
//! [`CommandParameter`].
//!
//! [`Transport`]: transport::Transport
//! [`ControllerDriver`]: transport::ControllerDriver
//! [`CommandChannel`]: command_channel::CommandChannel
//! [`Dispatcher`]: bluejay_core::dispatch::Dispatcher
//! [H4]: h4
//! [`CommandParameter`]: commands::CommandParameter

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate alloc;

pub mod command_channel;
pub mod commands;
pub mod data;
pub mod events;
pub mod h4;
pub mod opcodes;
pub mod runner;
pub mod transport;

use alloc::vec::Vec;
use core::fmt;

/// The connection handle
///
/// A twelve bit identifier the Controller allocates when a connection (ACL, SCO, or CIS) is
/// established. A handle is unique while its link lives; the Controller may reuse the numeric
/// value after the corresponding disconnection complete event has been sent to the host.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct ConnectionHandle {
    handle: u16,
}

impl ConnectionHandle {
    pub const MAX: u16 = 0x0EFF;

    const ERROR: &'static str = "raw connection handle value larger than the maximum (0x0EFF)";

    /// Get the raw handle value
    pub fn get_raw_handle(&self) -> u16 {
        self.handle
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.handle)
    }
}

impl AsRef<u16> for ConnectionHandle {
    fn as_ref(&self) -> &u16 {
        &self.handle
    }
}

impl TryFrom<u16> for ConnectionHandle {
    type Error = &'static str;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        if raw <= ConnectionHandle::MAX {
            Ok(ConnectionHandle { handle: raw })
        } else {
            Err(Self::ERROR)
        }
    }
}

impl TryFrom<[u8; 2]> for ConnectionHandle {
    type Error = &'static str;

    fn try_from(raw: [u8; 2]) -> Result<Self, Self::Error> {
        ConnectionHandle::try_from(<u16>::from_le_bytes(raw))
    }
}

/// The packet boundary flag
///
/// A two bit flag within the HCI ACL data packet header. On the transmit side it tells the
/// Controller whether the payload starts an L2CAP PDU (and whether that PDU is automatically
/// flushable) or continues one; on the receive side it tells the host the same about the peer's
/// data.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AclPacketBoundary {
    FirstNonFlushable,
    ContinuingFragment,
    FirstAutoFlushable,
    CompleteL2capPdu,
}

impl AclPacketBoundary {
    /// Get the value shifted into the location of the packet boundary flag within the first two
    /// bytes of an HCI ACL data packet. The returned value is in host byte order.
    pub fn get_shifted_val(&self) -> u16 {
        (match self {
            AclPacketBoundary::FirstNonFlushable => 0x0,
            AclPacketBoundary::ContinuingFragment => 0x1,
            AclPacketBoundary::FirstAutoFlushable => 0x2,
            AclPacketBoundary::CompleteL2capPdu => 0x3,
        }) << 12
    }

    /// Get the `AclPacketBoundary` from the first 16 bits of an HCI ACL data packet. The input
    /// does not need to be masked down to the flag, but it does need to be in host byte order.
    pub fn from_shifted_val(val: u16) -> Self {
        match (val >> 12) & 3 {
            0x0 => AclPacketBoundary::FirstNonFlushable,
            0x1 => AclPacketBoundary::ContinuingFragment,
            0x2 => AclPacketBoundary::FirstAutoFlushable,
            0x3 => AclPacketBoundary::CompleteL2capPdu,
            _ => unreachable!(),
        }
    }

    /// Check if the flag marks the first fragment of a PDU
    pub fn is_first(&self) -> bool {
        !matches!(self, AclPacketBoundary::ContinuingFragment)
    }
}

/// The broadcast flag
///
/// Indicator of who an ACL data packet is for. `BrEdrBroadcast` is only valid for packets sent by
/// a central to all peripherals of a piconet; everything in this host is `NoBroadcast`
/// (point-to-point).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AclBroadcastFlag {
    /// Point-to-point message
    NoBroadcast,
    /// Broadcast to all active peripherals
    BrEdrBroadcast,
}

impl AclBroadcastFlag {
    /// Get the value shifted into the location of the broadcast flag within the first two bytes
    /// of an HCI ACL data packet. The returned value is in host byte order.
    pub fn get_shifted_val(&self) -> u16 {
        (match self {
            AclBroadcastFlag::NoBroadcast => 0x0,
            AclBroadcastFlag::BrEdrBroadcast => 0x1,
        }) << 14
    }

    /// Get the `AclBroadcastFlag` from the first 16 bits of an HCI ACL data packet.
    pub fn try_from_shifted_val(val: u16) -> Result<Self, ()> {
        match (val >> 14) & 3 {
            0x0 => Ok(AclBroadcastFlag::NoBroadcast),
            0x1 => Ok(AclBroadcastFlag::BrEdrBroadcast),
            _ => Err(()),
        }
    }
}

/// Error from a raw HCI ACL data packet
#[derive(Debug)]
pub enum HciAclPacketError {
    PacketTooSmall,
    InvalidBroadcastFlag,
    InvalidConnectionHandle(&'static str),
    InvalidDataTotalLength,
}

impl fmt::Display for HciAclPacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HciAclPacketError::PacketTooSmall => {
                f.write_str("packet is too small to be a valid HCI ACL data packet")
            }
            HciAclPacketError::InvalidBroadcastFlag => f.write_str("invalid broadcast flag"),
            HciAclPacketError::InvalidConnectionHandle(reason) => {
                write!(f, "invalid connection handle, {}", reason)
            }
            HciAclPacketError::InvalidDataTotalLength => {
                f.write_str("the data total length field does not match the received data")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HciAclPacketError {}

/// The HCI ACL data packet
///
/// ACL data packets are sent between the host and Controller for a specific connection. The four
/// byte header carries the connection handle, the packet boundary flag, the broadcast flag, and
/// the length of the payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HciAclData {
    connection_handle: ConnectionHandle,
    packet_boundary_flag: AclPacketBoundary,
    broadcast_flag: AclBroadcastFlag,
    payload: Vec<u8>,
}

impl HciAclData {
    /// The size of the header of an HCI ACL data packet
    pub const HEADER_SIZE: usize = 4;

    /// The minimum maximum payload size
    ///
    /// Both the host and Controller must accept an HCI ACL data packet with a 27 byte payload.
    /// Larger maximums may be advertised through the buffer size commands.
    pub const MIN_MAX_PAYLOAD_SIZE: usize = 27;

    /// Create a new `HciAclData`
    ///
    /// # Panic
    /// The payload length must fit within a `u16`.
    pub fn new(
        connection_handle: ConnectionHandle,
        packet_boundary_flag: AclPacketBoundary,
        broadcast_flag: AclBroadcastFlag,
        payload: Vec<u8>,
    ) -> Self {
        assert!(payload.len() <= <u16>::MAX.into());

        HciAclData {
            connection_handle,
            packet_boundary_flag,
            broadcast_flag,
            payload,
        }
    }

    pub fn get_handle(&self) -> ConnectionHandle {
        self.connection_handle
    }

    pub fn get_packet_boundary_flag(&self) -> AclPacketBoundary {
        self.packet_boundary_flag
    }

    pub fn get_broadcast_flag(&self) -> AclBroadcastFlag {
        self.broadcast_flag
    }

    pub fn get_payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Convert into the raw HCI ACL data packet
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(Self::HEADER_SIZE + self.payload.len());

        let first_2_bytes = self.connection_handle.get_raw_handle()
            | self.packet_boundary_flag.get_shifted_val()
            | self.broadcast_flag.get_shifted_val();

        packet.extend_from_slice(&first_2_bytes.to_le_bytes());

        packet.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());

        packet.extend_from_slice(&self.payload);

        packet
    }

    /// Parse a raw HCI ACL data packet
    pub fn try_from_packet(packet: &[u8]) -> Result<Self, HciAclPacketError> {
        if packet.len() < Self::HEADER_SIZE {
            return Err(HciAclPacketError::PacketTooSmall);
        }

        let first_2_bytes = <u16>::from_le_bytes([packet[0], packet[1]]);

        let connection_handle = ConnectionHandle::try_from(first_2_bytes & 0xFFF)
            .map_err(HciAclPacketError::InvalidConnectionHandle)?;

        let packet_boundary_flag = AclPacketBoundary::from_shifted_val(first_2_bytes);

        let broadcast_flag = AclBroadcastFlag::try_from_shifted_val(first_2_bytes)
            .map_err(|_| HciAclPacketError::InvalidBroadcastFlag)?;

        let length = <u16>::from_le_bytes([packet[2], packet[3]]) as usize;

        if packet[Self::HEADER_SIZE..].len() != length {
            return Err(HciAclPacketError::InvalidDataTotalLength);
        }

        Ok(HciAclData {
            connection_handle,
            packet_boundary_flag,
            broadcast_flag,
            payload: packet[Self::HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_packet_round_trip() {
        let data = HciAclData::new(
            ConnectionHandle::try_from(0x42u16).unwrap(),
            AclPacketBoundary::FirstNonFlushable,
            AclBroadcastFlag::NoBroadcast,
            alloc::vec![1, 2, 3, 4],
        );

        let packet = data.to_packet();

        assert_eq!(&[0x42, 0x00, 0x04, 0x00, 1, 2, 3, 4], packet.as_slice());

        assert_eq!(data, HciAclData::try_from_packet(&packet).unwrap());
    }

    #[test]
    fn handle_upper_bound() {
        assert!(ConnectionHandle::try_from(0x0EFFu16).is_ok());
        assert!(ConnectionHandle::try_from(0x0F00u16).is_err());
    }
}
