//! HCI fragment to PDU recombination
//!
//! The receive side inverse of the [fragmenter](crate::fragmenter). A recombiner exists per
//! logical link; a start-of-PDU fragment opens an assembly recording the declared PDU length and
//! destination channel from the basic header, and continuing fragments append until the declared
//! length is reached.
//!
//! A continuing fragment with no assembly in progress, a new start fragment arriving mid
//! assembly, or an assembly overrunning its declared length are protocol violations; the caller
//! is expected to close the link.

use crate::pdu::BasicFrame;
use alloc::vec::Vec;
use bluejay_hci::HciAclData;
use core::fmt;

/// Error of [`Recombiner::add_fragment`]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecombineError {
    /// A continuing fragment arrived with no assembly in progress
    ExpectedStartFragment,
    /// A start fragment arrived while an assembly was in progress
    UnexpectedStartFragment,
    /// The assembly exceeded the declared PDU length
    PduLengthExceeded,
    /// A start fragment too small to carry the basic header
    FragmentTooSmall,
    /// The basic header named a channel invalid for the link
    InvalidChannel,
}

impl fmt::Display for RecombineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecombineError::ExpectedStartFragment => {
                f.write_str("continuing fragment without a start fragment")
            }
            RecombineError::UnexpectedStartFragment => {
                f.write_str("start fragment while recombining a PDU")
            }
            RecombineError::PduLengthExceeded => f.write_str("PDU length exceeded"),
            RecombineError::FragmentTooSmall => {
                f.write_str("start fragment too small for the basic L2CAP header")
            }
            RecombineError::InvalidChannel => f.write_str("invalid channel identifier"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RecombineError {}

struct Assembly {
    declared_length: usize,
    /// The raw destination channel from the basic header
    channel: u16,
    payload: Vec<u8>,
}

/// Per link PDU reassembly
pub struct Recombiner {
    in_progress: Option<Assembly>,
}

/// A completed PDU with its raw destination channel
#[derive(Debug, PartialEq, Eq)]
pub struct RecombinedPdu {
    pub channel: u16,
    pub payload: Vec<u8>,
}

impl Recombiner {
    pub fn new() -> Self {
        Recombiner { in_progress: None }
    }

    /// Add a received fragment
    ///
    /// Returns a completed PDU once its declared length is reached. An error means the link has
    /// violated the fragmentation protocol and must be closed.
    pub fn add_fragment(&mut self, fragment: &HciAclData) -> Result<Option<RecombinedPdu>, RecombineError> {
        if fragment.get_packet_boundary_flag().is_first() {
            if self.in_progress.is_some() {
                return Err(RecombineError::UnexpectedStartFragment);
            }

            let payload = fragment.get_payload();

            if payload.len() < BasicFrame::HEADER_SIZE {
                return Err(RecombineError::FragmentTooSmall);
            }

            let declared_length = u16::from_le_bytes([payload[0], payload[1]]) as usize;
            let channel = u16::from_le_bytes([payload[2], payload[3]]);

            let information = &payload[BasicFrame::HEADER_SIZE..];

            if information.len() > declared_length {
                return Err(RecombineError::PduLengthExceeded);
            }

            self.in_progress = Some(Assembly {
                declared_length,
                channel,
                payload: information.to_vec(),
            });
        } else {
            let assembly = self
                .in_progress
                .as_mut()
                .ok_or(RecombineError::ExpectedStartFragment)?;

            if assembly.payload.len() + fragment.get_payload().len() > assembly.declared_length {
                self.in_progress = None;

                return Err(RecombineError::PduLengthExceeded);
            }

            assembly.payload.extend_from_slice(fragment.get_payload());
        }

        let complete = self
            .in_progress
            .as_ref()
            .map(|assembly| assembly.payload.len() == assembly.declared_length)
            .unwrap_or(false);

        if complete {
            let assembly = self.in_progress.take().unwrap();

            Ok(Some(RecombinedPdu {
                channel: assembly.channel,
                payload: assembly.payload,
            }))
        } else {
            Ok(None)
        }
    }

    /// Drop any partial assembly
    pub fn clear(&mut self) {
        self.in_progress = None;
    }
}

impl Default for Recombiner {
    fn default() -> Self {
        Recombiner::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_id::{ChannelIdentifier, DynChannelId};
    use crate::fragmenter::fragment_pdu;
    use bluejay_hci::{AclBroadcastFlag, AclPacketBoundary, ConnectionHandle};

    fn fragment(boundary: AclPacketBoundary, payload: &[u8]) -> HciAclData {
        HciAclData::new(
            ConnectionHandle::try_from(0x0001u16).unwrap(),
            boundary,
            AclBroadcastFlag::NoBroadcast,
            payload.to_vec(),
        )
    }

    #[test]
    fn reassembles_what_the_fragmenter_produces() {
        let payload: Vec<u8> = (0u8..100).collect();

        let channel_id = ChannelIdentifier::Acl(DynChannelId::new_acl(0x0040).unwrap());

        let pdu = crate::pdu::BasicFrame::new(payload.clone(), channel_id).to_bytes();

        let handle = ConnectionHandle::try_from(0x0001u16).unwrap();

        let mut recombiner = Recombiner::new();

        let mut completed = None;

        for piece in fragment_pdu(handle, &pdu, 27, false) {
            assert!(completed.is_none());

            completed = recombiner.add_fragment(&piece).unwrap();
        }

        let completed = completed.unwrap();

        assert_eq!(0x0040, completed.channel);
        assert_eq!(payload, completed.payload);
    }

    #[test]
    fn continuing_without_start_is_a_violation() {
        let mut recombiner = Recombiner::new();

        assert_eq!(
            Err(RecombineError::ExpectedStartFragment),
            recombiner.add_fragment(&fragment(AclPacketBoundary::ContinuingFragment, &[0]))
        );
    }

    #[test]
    fn start_during_assembly_is_a_violation() {
        let mut recombiner = Recombiner::new();

        // declares 10 bytes, delivers 2
        recombiner
            .add_fragment(&fragment(
                AclPacketBoundary::FirstNonFlushable,
                &[0x0A, 0x00, 0x40, 0x00, 1, 2],
            ))
            .unwrap();

        assert_eq!(
            Err(RecombineError::UnexpectedStartFragment),
            recombiner.add_fragment(&fragment(
                AclPacketBoundary::FirstNonFlushable,
                &[0x02, 0x00, 0x40, 0x00, 1, 2],
            ))
        );
    }

    #[test]
    fn overrun_is_a_violation() {
        let mut recombiner = Recombiner::new();

        recombiner
            .add_fragment(&fragment(
                AclPacketBoundary::FirstNonFlushable,
                &[0x02, 0x00, 0x40, 0x00, 1],
            ))
            .unwrap();

        assert_eq!(
            Err(RecombineError::PduLengthExceeded),
            recombiner.add_fragment(&fragment(AclPacketBoundary::ContinuingFragment, &[2, 3]))
        );
    }
}
