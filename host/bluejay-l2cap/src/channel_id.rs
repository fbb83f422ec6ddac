//! L2CAP channel identifiers
//!
//! Channel identifiers associate L2CAP data with a given channel. The fixed identifiers name a
//! protocol (the signaling channel, the Security Manager, the Attribute Protocol); dynamic
//! identifiers are allocated through the signaling channel's connection procedure.
//!
//! # Specification Reference
//! See Bluetooth Specification V5 | Vol 3, Part A Section 2.1

use core::cmp::Ordering;
use core::marker::PhantomData;

/// Marker for the ACL-U logical link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AclULink;

/// Marker for the LE-U logical link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeULink;

/// Channel Identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelIdentifier {
    /// ACL-U identifiers
    Acl(AclCid),
    /// LE-U identifiers
    Le(LeCid),
}

impl ChannelIdentifier {
    /// Convert this `ChannelIdentifier` to its numerical value
    pub fn to_val(&self) -> u16 {
        match self {
            ChannelIdentifier::Acl(cid) => cid.to_cid(),
            ChannelIdentifier::Le(cid) => cid.to_cid(),
        }
    }

    /// Try to convert a raw value into an ACL-U channel identifier
    pub fn acl_try_from_raw(val: u16) -> Result<Self, ()> {
        AclCid::try_from_raw(val).map(ChannelIdentifier::Acl)
    }

    /// Try to convert a raw value into a LE-U channel identifier
    pub fn le_try_from_raw(val: u16) -> Result<Self, ()> {
        LeCid::try_from_raw(val).map(ChannelIdentifier::Le)
    }
}

impl core::fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ChannelIdentifier::Acl(id) => write!(f, "ACL-U {}", id),
            ChannelIdentifier::Le(id) => write!(f, "LE-U {}", id),
        }
    }
}

/// Dynamically allocated L2CAP channel identifier
#[derive(Debug)]
pub struct DynChannelId<T> {
    channel_id: u16,
    _p: PhantomData<T>,
}

impl<T> Clone for DynChannelId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DynChannelId<T> {}

impl<T> PartialEq for DynChannelId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.channel_id.eq(&other.channel_id)
    }
}

impl<T> Eq for DynChannelId<T> {}

impl<T> PartialOrd for DynChannelId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DynChannelId<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.channel_id.cmp(&other.channel_id)
    }
}

impl<T> core::hash::Hash for DynChannelId<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.channel_id.hash(state)
    }
}

impl<T> DynChannelId<T> {
    fn new_unchecked(channel_id: u16) -> Self {
        DynChannelId {
            channel_id,
            _p: PhantomData,
        }
    }

    /// Get the value of the dynamic channel identifier
    pub fn get_val(&self) -> u16 {
        self.channel_id
    }
}

impl DynChannelId<AclULink> {
    pub const ACL_BOUNDS: core::ops::RangeInclusive<u16> = 0x0040..=0xFFFF;

    /// Create an [`AclCid`] for a dynamic channel
    ///
    /// This returns an `AclCid` so long as `channel_id` is within [`ACL_BOUNDS`].
    ///
    /// [`ACL_BOUNDS`]: DynChannelId::<AclULink>::ACL_BOUNDS
    pub fn new_acl(channel_id: u16) -> Result<AclCid, u16> {
        if Self::ACL_BOUNDS.contains(&channel_id) {
            Ok(AclCid::DynamicallyAllocated(DynChannelId::new_unchecked(channel_id)))
        } else {
            Err(channel_id)
        }
    }
}

impl DynChannelId<LeULink> {
    pub const LE_BOUNDS: core::ops::RangeInclusive<u16> = 0x0040..=0x007F;

    /// Create a [`LeCid`] for a dynamic channel
    ///
    /// This returns a `LeCid` so long as `channel_id` is within [`LE_BOUNDS`].
    ///
    /// [`LE_BOUNDS`]: DynChannelId::<LeULink>::LE_BOUNDS
    pub fn new_le(channel_id: u16) -> Result<LeCid, u16> {
        if Self::LE_BOUNDS.contains(&channel_id) {
            Ok(LeCid::DynamicallyAllocated(DynChannelId::new_unchecked(channel_id)))
        } else {
            Err(channel_id)
        }
    }
}

impl<T> core::fmt::Display for DynChannelId<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.channel_id, f)
    }
}

/// ACL User (ACL-U) channel identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AclCid {
    SignalingChannel,
    ConnectionlessChannel,
    SecurityManagerChannel,
    DynamicallyAllocated(DynChannelId<AclULink>),
}

impl AclCid {
    pub fn to_cid(&self) -> u16 {
        match self {
            AclCid::SignalingChannel => 0x1,
            AclCid::ConnectionlessChannel => 0x2,
            AclCid::SecurityManagerChannel => 0x7,
            AclCid::DynamicallyAllocated(id) => id.get_val(),
        }
    }

    pub fn try_from_raw(val: u16) -> Result<Self, ()> {
        match val {
            0x1 => Ok(AclCid::SignalingChannel),
            0x2 => Ok(AclCid::ConnectionlessChannel),
            0x7 => Ok(AclCid::SecurityManagerChannel),
            val if DynChannelId::<AclULink>::ACL_BOUNDS.contains(&val) => {
                Ok(AclCid::DynamicallyAllocated(DynChannelId::new_unchecked(val)))
            }
            _ => Err(()),
        }
    }
}

impl core::fmt::Display for AclCid {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            AclCid::SignalingChannel => f.write_str("signaling channel"),
            AclCid::ConnectionlessChannel => f.write_str("connectionless channel"),
            AclCid::SecurityManagerChannel => f.write_str("security manager channel"),
            AclCid::DynamicallyAllocated(id) => write!(f, "dynamically allocated channel ({})", id),
        }
    }
}

/// LE User (LE-U) channel identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeCid {
    /// Channel for the Attribute Protocol
    AttributeProtocol,
    /// LE signaling channel
    LeSignalingChannel,
    /// Security Manager Protocol channel
    SecurityManagerProtocol,
    /// Dynamically allocated channel identifiers
    DynamicallyAllocated(DynChannelId<LeULink>),
}

impl LeCid {
    pub fn to_cid(&self) -> u16 {
        match self {
            LeCid::AttributeProtocol => 0x4,
            LeCid::LeSignalingChannel => 0x5,
            LeCid::SecurityManagerProtocol => 0x6,
            LeCid::DynamicallyAllocated(id) => id.get_val(),
        }
    }

    pub fn try_from_raw(val: u16) -> Result<Self, ()> {
        match val {
            0x4 => Ok(LeCid::AttributeProtocol),
            0x5 => Ok(LeCid::LeSignalingChannel),
            0x6 => Ok(LeCid::SecurityManagerProtocol),
            val if DynChannelId::<LeULink>::LE_BOUNDS.contains(&val) => {
                Ok(LeCid::DynamicallyAllocated(DynChannelId::new_unchecked(val)))
            }
            _ => Err(()),
        }
    }
}

impl core::fmt::Display for LeCid {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            LeCid::AttributeProtocol => f.write_str("attribute protocol"),
            LeCid::LeSignalingChannel => f.write_str("LE L2CAP signaling channel"),
            LeCid::SecurityManagerProtocol => f.write_str("security manager protocol"),
            LeCid::DynamicallyAllocated(id) => write!(f, "dynamically allocated channel ({})", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_channel_values() {
        assert_eq!(0x1, AclCid::SignalingChannel.to_cid());
        assert_eq!(0x5, LeCid::LeSignalingChannel.to_cid());
        assert_eq!(0x6, LeCid::SecurityManagerProtocol.to_cid());
        assert_eq!(0x7, AclCid::SecurityManagerChannel.to_cid());
    }

    #[test]
    fn dynamic_bounds() {
        assert!(DynChannelId::<LeULink>::new_le(0x003F).is_err());
        assert!(DynChannelId::<LeULink>::new_le(0x0040).is_ok());
        assert!(DynChannelId::<LeULink>::new_le(0x0080).is_err());
        assert!(DynChannelId::<AclULink>::new_acl(0xFFFF).is_ok());
    }
}
