//! PDU to HCI fragment conversion
//!
//! An L2CAP PDU rarely fits one HCI ACL data packet. The fragmenter slices a complete PDU (basic
//! header included) into fragments of at most the Controller's maximum ACL payload. The first
//! fragment carries the start-of-PDU packet boundary flag (auto flushable when the channel has a
//! flush timeout); continuations carry the continuing flag.

use bluejay_hci::{AclBroadcastFlag, AclPacketBoundary, ConnectionHandle, HciAclData};
use alloc::vec::Vec;

/// Split `pdu` into HCI ACL data packets
///
/// # Panic
/// `max_acl_payload` must not be zero.
pub fn fragment_pdu(
    handle: ConnectionHandle,
    pdu: &[u8],
    max_acl_payload: usize,
    flushable: bool,
) -> Vec<HciAclData> {
    assert_ne!(0, max_acl_payload);

    let first_boundary = if flushable {
        AclPacketBoundary::FirstAutoFlushable
    } else {
        AclPacketBoundary::FirstNonFlushable
    };

    pdu.chunks(max_acl_payload)
        .enumerate()
        .map(|(index, chunk)| {
            let boundary = if index == 0 {
                first_boundary
            } else {
                AclPacketBoundary::ContinuingFragment
            };

            HciAclData::new(handle, boundary, AclBroadcastFlag::NoBroadcast, chunk.to_vec())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_id::{ChannelIdentifier, DynChannelId};
    use crate::pdu::BasicFrame;

    #[test]
    fn hundred_byte_sdu_at_minimum_payload() {
        let payload: Vec<u8> = (0u8..100).collect();

        let channel_id = ChannelIdentifier::Acl(DynChannelId::new_acl(0x0071).unwrap());

        let pdu = BasicFrame::new(payload, channel_id).to_bytes();

        let handle = ConnectionHandle::try_from(0x0001u16).unwrap();

        let fragments = fragment_pdu(handle, &pdu, 27, false);

        assert_eq!(4, fragments.len());

        // the first fragment is the header plus the first 23 payload bytes
        assert_eq!(27, fragments[0].get_payload().len());
        assert_eq!(&[0x64, 0x00, 0x71, 0x00], &fragments[0].get_payload()[..4]);
        assert_eq!(
            AclPacketBoundary::FirstNonFlushable,
            fragments[0].get_packet_boundary_flag()
        );

        for fragment in &fragments[1..] {
            assert_eq!(
                AclPacketBoundary::ContinuingFragment,
                fragment.get_packet_boundary_flag()
            );
            assert_eq!(AclBroadcastFlag::NoBroadcast, fragment.get_broadcast_flag());
        }

        let sizes: Vec<usize> = fragments
            .iter()
            .map(|fragment| fragment.get_payload().len())
            .collect();

        assert_eq!(&[27, 27, 27, 23], sizes.as_slice());

        // the concatenated fragments are exactly the framed PDU
        let total: usize = sizes.iter().sum();

        assert_eq!(4 + 100, total);

        let reassembled: Vec<u8> = fragments
            .iter()
            .flat_map(|fragment| fragment.get_payload().iter().copied())
            .collect();

        assert_eq!(pdu, reassembled);
    }

    #[test]
    fn flushable_first_fragment() {
        let handle = ConnectionHandle::try_from(0x0001u16).unwrap();

        let fragments = fragment_pdu(handle, &[0, 0, 0, 0], 27, true);

        assert_eq!(
            AclPacketBoundary::FirstAutoFlushable,
            fragments[0].get_packet_boundary_flag()
        );
    }
}
