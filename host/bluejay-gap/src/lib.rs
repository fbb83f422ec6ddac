//! The Generic Access Profile layer
//!
//! This crate sits between the HCI/L2CAP machinery and the profiles: it owns the durable view of
//! remote devices (the [`PeerCache`]), drives connection establishment for both transports, and
//! orchestrates pairing. The [`Adapter`] at the top composes everything after discovering what
//! the Controller can do.
//!
//! The protocol collaborators this layer drives but does not implement (GATT, SDP, the LE
//! Security Manager's cryptography) are consumed through the narrow traits in [`collaborators`].
//!
//! [`PeerCache`]: peer::PeerCache
//! [`Adapter`]: adapter::Adapter

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate alloc;

pub mod adapter;
pub mod bredr;
pub mod collaborators;
pub mod le;
pub mod peer;

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::fmt;

pub use adapter::{Adapter, AdapterBuilder};
pub use bluejay_hci::events::IoCapability;

/// Identifier of a peer within the [`PeerCache`](peer::PeerCache)
///
/// Locally assigned on first sighting and stable for the life of the cache; never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// The transports a peer has been observed on
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TechnologySet {
    pub low_energy: bool,
    pub bredr: bool,
}

/// Connection state of a peer on one transport
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    /// A link exists and interrogation or pairing is still running
    Initializing,
    Connected,
}

/// Why a connection is being closed
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DisconnectReason {
    /// A client of the host asked for the disconnect
    ApiRequest,
    /// Interrogation of the peer failed
    InterrogationFailed,
    /// Pairing failed badly enough to sever the link
    PairingFailed,
    /// The link failed at the L2CAP or link layer
    LinkError,
}

/// BR/EDR security policy of the adapter
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BrEdrSecurityMode {
    /// Secure Simple Pairing with legacy fallback (mode 4)
    Mode4,
    /// Only authenticated Secure Connections links are acceptable
    SecureConnectionsOnly,
}

/// LE security policy of the adapter
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LeSecurityMode {
    Mode1,
    SecureConnectionsOnly,
}

/// The association model pairing settled on
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AssociationModel {
    JustWorks,
    NumericComparison,
    /// The local device displays the passkey and the peer enters it
    PasskeyEntryDisplay,
    /// The local device enters a passkey shown by the peer
    PasskeyEntryInput,
    OutOfBand,
}

/// User interaction surface for pairing
///
/// The embedder supplies one of these; every method is a question delivered on the host
/// dispatcher, answered through the provided responder. Dropping the responder without calling
/// it counts as rejection.
pub trait PairingDelegate {
    /// Show a passkey the peer will enter
    fn display_passkey(&self, peer: PeerId, passkey: u32);

    /// Confirm that `passkey` matches what the peer displays (numeric comparison), or simply
    /// consent when called with no comparison value
    fn confirm_pairing(&self, peer: PeerId, passkey: Option<u32>, respond: Box<dyn FnOnce(bool)>);

    /// Provide the passkey displayed by the peer
    fn request_passkey(&self, peer: PeerId, respond: Box<dyn FnOnce(Option<u32>)>);

    /// Provide a PIN code for legacy pairing
    fn request_pin_code(&self, peer: PeerId, respond: Box<dyn FnOnce(Option<Vec<u8>>)>);

    /// Pairing for `peer` finished
    fn on_pairing_complete(&self, peer: PeerId, success: bool);
}

/// A delegate rejecting everything, for hosts with no pairing surface
pub struct RejectingPairingDelegate;

impl PairingDelegate for RejectingPairingDelegate {
    fn display_passkey(&self, _: PeerId, _: u32) {}

    fn confirm_pairing(&self, _: PeerId, _: Option<u32>, respond: Box<dyn FnOnce(bool)>) {
        respond(false)
    }

    fn request_passkey(&self, _: PeerId, respond: Box<dyn FnOnce(Option<u32>)>) {
        respond(None)
    }

    fn request_pin_code(&self, _: PeerId, respond: Box<dyn FnOnce(Option<Vec<u8>>)>) {
        respond(None)
    }

    fn on_pairing_complete(&self, _: PeerId, _: bool) {}
}

pub(crate) type SharedDelegate = Rc<dyn PairingDelegate>;

/// Select the Secure Simple Pairing association model
///
/// The standard SSP matrix of Vol 3, Part C Section 5.2.2.6, reduced by the rule that Just
/// Works applies whenever neither side requires man in the middle protection.
pub fn select_association_model(
    local: IoCapability,
    peer: IoCapability,
    local_mitm: bool,
    peer_mitm: bool,
) -> AssociationModel {
    use IoCapability::*;

    if !local_mitm && !peer_mitm {
        return AssociationModel::JustWorks;
    }

    match (local, peer) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => AssociationModel::JustWorks,
        (DisplayYesNo, DisplayYesNo) => AssociationModel::NumericComparison,
        (KeyboardOnly, KeyboardOnly) => AssociationModel::PasskeyEntryInput,
        (KeyboardOnly, _) => AssociationModel::PasskeyEntryInput,
        (_, KeyboardOnly) => AssociationModel::PasskeyEntryDisplay,
        (DisplayOnly, _) | (_, DisplayOnly) => AssociationModel::JustWorks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssp_matrix_corners() {
        use IoCapability::*;

        // no MITM requirement collapses everything to just works
        assert_eq!(
            AssociationModel::JustWorks,
            select_association_model(DisplayYesNo, DisplayYesNo, false, false)
        );

        assert_eq!(
            AssociationModel::NumericComparison,
            select_association_model(DisplayYesNo, DisplayYesNo, true, true)
        );

        assert_eq!(
            AssociationModel::JustWorks,
            select_association_model(DisplayYesNo, NoInputNoOutput, true, false)
        );

        assert_eq!(
            AssociationModel::PasskeyEntryInput,
            select_association_model(KeyboardOnly, DisplayOnly, true, true)
        );

        assert_eq!(
            AssociationModel::PasskeyEntryDisplay,
            select_association_model(DisplayYesNo, KeyboardOnly, true, true)
        );
    }
}
