//! The L2CAP channel engine
//!
//! L2CAP multiplexes the data of protocols and services over the ACL logical links. This crate
//! implements the host side channel machinery:
//!
//! - fixed channels (signaling, the Attribute Protocol, the Security Manager) created with their
//!   logical link
//! - dynamic channels addressed by PSM, opened through the signaling channel's connection and
//!   configuration procedures
//! - the [fragmenter] and [recombiner] converting between PDUs and HCI ACL fragments
//! - per channel Tx/Rx [engines] for Basic and Enhanced Retransmission modes
//!
//! The entry point is [`ChannelManager`]. The owning layer registers a logical link per ACL
//! connection and gets [`Channel`] endpoints back, either by opening them or by registering a
//! PSM service for inbound channels.
//!
//! [fragmenter]: crate::fragmenter
//! [recombiner]: crate::recombiner
//! [engines]: crate::engines
//! [`ChannelManager`]: crate::channel_manager::ChannelManager
//! [`Channel`]: crate::channel::Channel

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate alloc;

pub mod channel;
pub mod channel_id;
pub mod channel_manager;
pub mod engines;
pub mod fragmenter;
pub mod logical_link;
pub mod pdu;
pub mod recombiner;
pub mod signaling;

use core::fmt;
use core::time::Duration;

pub use channel::Channel;
pub use channel_manager::ChannelManager;

/// The kind of logical link a channel runs over
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkKind {
    /// A BR/EDR ACL-U link
    AclU,
    /// An LE-U link
    LeU,
}

/// A protocol/service multiplexer value
///
/// PSMs address dynamic channels. Odd values in the low byte and an even high byte per the
/// specification; well known values are assigned (SDP is 0x0001, RFCOMM 0x0003, AVDTP 0x0019).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Psm(pub u16);

impl Psm {
    pub const SDP: Psm = Psm(0x0001);
    pub const RFCOMM: Psm = Psm(0x0003);
    pub const AVDTP: Psm = Psm(0x0019);
    pub const AVCTP: Psm = Psm(0x0017);
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// The retransmission mode of a channel
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelMode {
    Basic,
    EnhancedRetransmission,
}

/// The vendor extension ACL priority of a channel's link
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AclPriority {
    Normal,
    /// Prioritize the host to Controller direction
    Source,
    /// Prioritize the Controller to host direction
    Sink,
}

/// Parameters for a channel
#[derive(Clone, Copy, Debug)]
pub struct ChannelParameters {
    pub mode: ChannelMode,
    /// The maximum SDU this side is willing to receive (the MTU it advertises)
    pub max_rx_sdu_size: u16,
    /// BR/EDR automatic flush timeout for the channel's packets
    pub flush_timeout: Option<Duration>,
    /// Bound of the transmit SDU queue
    pub max_tx_queued: usize,
}

impl Default for ChannelParameters {
    fn default() -> Self {
        ChannelParameters {
            mode: ChannelMode::Basic,
            max_rx_sdu_size: DEFAULT_MTU,
            flush_timeout: None,
            max_tx_queued: DEFAULT_MAX_TX_QUEUED,
        }
    }
}

/// The default MTU advertised for a dynamic channel
pub const DEFAULT_MTU: u16 = 672;

/// The minimum MTU of an ACL-U dynamic channel
pub const MIN_ACL_MTU: u16 = 48;

/// The MTU of the LE fixed channels before any higher layer negotiation
pub const LE_MIN_MTU: u16 = 23;

/// The default bound of a channel's transmit SDU queue
pub const DEFAULT_MAX_TX_QUEUED: usize = 1;

/// Errors surfaced by channel operations
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelError {
    /// The channel or its link no longer exists
    ChannelClosed,
    /// `activate` was called more than once
    AlreadyActivated,
    /// The peer refused the channel or its configuration
    Refused,
    /// No response to a signaling request in time
    ResponseTimeout,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChannelError::ChannelClosed => f.write_str("the channel has closed"),
            ChannelError::AlreadyActivated => f.write_str("the channel is already activated"),
            ChannelError::Refused => f.write_str("the peer refused the channel"),
            ChannelError::ResponseTimeout => f.write_str("no response to the signaling request"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ChannelError {}
