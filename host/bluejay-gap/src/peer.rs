//! The peer cache
//!
//! A [`Peer`] is the durable record of a remote device: its addresses, which transports it has
//! been seen on, its bond material, and the connection state of each transport. Peers are
//! created on first sighting (an inquiry result, an advertising report, an inbound connection)
//! and are never destroyed while a connection or a bond refers to them.
//!
//! All mutation goes through the owning [`PeerCache`]; everything else holds a `PeerId`.

use crate::{ConnectionState, PeerId, TechnologySet};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use bluejay_core::{AddressKind, BluetoothDeviceAddress, DeviceAddress};
use bluejay_hci::events::LinkKeyType;
use core::cell::RefCell;

/// A stored BR/EDR link key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkKey {
    pub value: [u8; 16],
    pub key_type: LinkKeyType,
}

impl LinkKey {
    /// Check if the key satisfies a Secure Connections only policy
    pub fn is_authenticated_secure_connections(&self) -> bool {
        self.key_type.is_secure_connections() && self.key_type.is_authenticated()
    }
}

/// A stored LE long term key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ltk {
    pub value: [u8; 16],
    pub rand: u64,
    pub ediv: u16,
    pub authenticated: bool,
    pub secure_connections: bool,
}

/// A stored identity resolving key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Irk {
    pub value: [u8; 16],
}

/// The bond material of one peer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BondData {
    pub bredr_link_key: Option<LinkKey>,
    pub le_ltk: Option<Ltk>,
    pub le_irk: Option<Irk>,
}

impl BondData {
    pub fn is_bonded(&self) -> bool {
        self.bredr_link_key.is_some() || self.le_ltk.is_some()
    }
}

/// The durable record of a remote device
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: PeerId,
    /// The BR/EDR address, which is also the LE public identity of a dual mode device
    pub bredr_address: Option<BluetoothDeviceAddress>,
    /// The LE address most recently observed
    pub le_address: Option<DeviceAddress>,
    pub technologies: TechnologySet,
    pub bond: BondData,
    pub name: Option<Vec<u8>>,
    pub class_of_device: Option<u32>,
    /// Page scan repetition mode from the last inquiry result
    pub page_scan_repetition_mode: Option<u8>,
    /// Clock offset from the last inquiry result
    pub clock_offset: Option<u16>,
    /// The most recent advertising data observed
    pub advertising_data: Option<Vec<u8>>,
    pub rssi: Option<i8>,
    pub bredr_state: ConnectionState,
    pub le_state: ConnectionState,
    /// Services seen in extended inquiry or advertising data (16 bit UUIDs)
    pub service_uuids: Vec<u16>,
}

impl Peer {
    fn new(id: PeerId) -> Self {
        Peer {
            id,
            bredr_address: None,
            le_address: None,
            technologies: TechnologySet::default(),
            bond: BondData::default(),
            name: None,
            class_of_device: None,
            page_scan_repetition_mode: None,
            clock_offset: None,
            advertising_data: None,
            rssi: None,
            bredr_state: ConnectionState::NotConnected,
            le_state: ConnectionState::NotConnected,
            service_uuids: Vec::new(),
        }
    }

    pub fn is_bonded(&self) -> bool {
        self.bond.is_bonded()
    }

    /// Check if `address` identifies this peer
    pub fn matches_address(&self, address: &DeviceAddress) -> bool {
        match address.kind {
            AddressKind::BrEdr | AddressKind::LePublic => {
                self.bredr_address == Some(address.address)
                    || self
                        .le_address
                        .map(|le| le.is_same_identity(address))
                        .unwrap_or(false)
            }
            AddressKind::LeRandom => self
                .le_address
                .map(|le| le.is_same_identity(address))
                .unwrap_or(false),
            AddressKind::LeAnonymous => false,
        }
    }
}

type PeerCallback = Box<dyn FnMut(&Peer)>;

struct CacheState {
    peers: BTreeMap<PeerId, Peer>,
    next_id: u64,
    updated_callback: Option<PeerCallback>,
    bonded_callback: Option<PeerCallback>,
}

/// The owning collection of [`Peer`]s
///
/// Cloning produces another handle to the same cache.
#[derive(Clone)]
pub struct PeerCache {
    state: Rc<RefCell<CacheState>>,
}

impl PeerCache {
    pub fn new() -> Self {
        PeerCache {
            state: Rc::new(RefCell::new(CacheState {
                peers: BTreeMap::new(),
                next_id: 1,
                updated_callback: None,
                bonded_callback: None,
            })),
        }
    }

    /// Set the callback observing peer updates
    pub fn set_peer_updated_callback(&self, callback: impl FnMut(&Peer) + 'static) {
        self.state.borrow_mut().updated_callback = Some(Box::new(callback));
    }

    /// Set the callback observing new bonds (the embedder's cue to persist)
    pub fn set_peer_bonded_callback(&self, callback: impl FnMut(&Peer) + 'static) {
        self.state.borrow_mut().bonded_callback = Some(Box::new(callback));
    }

    /// Find a peer by identifier
    pub fn find_by_id(&self, id: PeerId) -> Option<Peer> {
        self.state.borrow().peers.get(&id).cloned()
    }

    /// Find a peer by any of its addresses
    pub fn find_by_address(&self, address: &DeviceAddress) -> Option<Peer> {
        self.state
            .borrow()
            .peers
            .values()
            .find(|peer| peer.matches_address(address))
            .cloned()
    }

    /// Get the peer for `address`, creating it on first sighting
    pub fn update_peer(&self, address: DeviceAddress, update: impl FnOnce(&mut Peer)) -> PeerId {
        let id = {
            let mut state = self.state.borrow_mut();

            let existing = state
                .peers
                .values()
                .find(|peer| peer.matches_address(&address))
                .map(|peer| peer.id);

            let id = existing.unwrap_or_else(|| {
                let id = PeerId(state.next_id);

                state.next_id += 1;

                log::info!("(GAP) new peer {} at {}", id, address);

                state.peers.insert(id, Peer::new(id));

                id
            });

            let peer = state.peers.get_mut(&id).unwrap();

            match address.kind {
                AddressKind::BrEdr => {
                    peer.bredr_address = Some(address.address);
                    peer.technologies.bredr = true;
                }
                AddressKind::LePublic | AddressKind::LeRandom => {
                    peer.le_address = Some(address);
                    peer.technologies.low_energy = true;
                }
                AddressKind::LeAnonymous => {}
            }

            update(peer);

            id
        };

        self.notify_updated(id);

        id
    }

    /// Mutate an existing peer
    pub fn with_peer(&self, id: PeerId, update: impl FnOnce(&mut Peer)) -> bool {
        let found = {
            let mut state = self.state.borrow_mut();

            match state.peers.get_mut(&id) {
                Some(peer) => {
                    update(peer);

                    true
                }
                None => false,
            }
        };

        if found {
            self.notify_updated(id);
        }

        found
    }

    /// Store bond material for a peer and notify the persistence callback
    pub fn store_bond(&self, id: PeerId, update: impl FnOnce(&mut BondData)) -> bool {
        let found = self.with_peer(id, |peer| update(&mut peer.bond));

        if found {
            let (peer, callback) = {
                let mut state = self.state.borrow_mut();

                (state.peers.get(&id).cloned(), state.bonded_callback.take())
            };

            if let (Some(peer), Some(mut callback)) = (peer, callback) {
                callback(&peer);

                let mut state = self.state.borrow_mut();

                if state.bonded_callback.is_none() {
                    state.bonded_callback = Some(callback);
                }
            }
        }

        found
    }

    /// Restore a bonded peer at startup
    ///
    /// The identity address and bond material come from the embedder's storage.
    pub fn add_bonded_peer(&self, address: DeviceAddress, bond: BondData) -> PeerId {
        self.update_peer(address, |peer| peer.bond = bond)
    }

    /// Get the peers that are bonded
    pub fn bonded_peers(&self) -> Vec<Peer> {
        self.state
            .borrow()
            .peers
            .values()
            .filter(|peer| peer.is_bonded())
            .cloned()
            .collect()
    }

    /// Get every cached peer
    pub fn peers(&self) -> Vec<Peer> {
        self.state.borrow().peers.values().cloned().collect()
    }

    fn notify_updated(&self, id: PeerId) {
        let (peer, callback) = {
            let mut state = self.state.borrow_mut();

            (state.peers.get(&id).cloned(), state.updated_callback.take())
        };

        if let (Some(peer), Some(mut callback)) = (peer, callback) {
            callback(&peer);

            let mut state = self.state.borrow_mut();

            if state.updated_callback.is_none() {
                state.updated_callback = Some(callback);
            }
        }
    }
}

impl Default for PeerCache {
    fn default() -> Self {
        PeerCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bredr(address: [u8; 6]) -> DeviceAddress {
        DeviceAddress::bredr(BluetoothDeviceAddress::new(address))
    }

    #[test]
    fn first_sighting_creates_one_peer() {
        let cache = PeerCache::new();

        let first = cache.update_peer(bredr([1, 2, 3, 4, 5, 6]), |_| ());
        let second = cache.update_peer(bredr([1, 2, 3, 4, 5, 6]), |peer| {
            peer.class_of_device = Some(0x200404)
        });

        assert_eq!(first, second);
        assert_eq!(Some(0x200404), cache.find_by_id(first).unwrap().class_of_device);
    }

    #[test]
    fn dual_mode_identity_merges() {
        let cache = PeerCache::new();

        let raw = BluetoothDeviceAddress::new([9, 8, 7, 6, 5, 4]);

        let classic = cache.update_peer(DeviceAddress::bredr(raw), |_| ());
        let low_energy = cache.update_peer(DeviceAddress::le_public(raw), |_| ());

        assert_eq!(classic, low_energy);

        let peer = cache.find_by_id(classic).unwrap();

        assert!(peer.technologies.bredr);
        assert!(peer.technologies.low_energy);
    }

    #[test]
    fn bond_storage_notifies() {
        let cache = PeerCache::new();

        let bonded = Rc::new(RefCell::new(0));

        let bonded_clone = bonded.clone();

        cache.set_peer_bonded_callback(move |peer| {
            assert!(peer.is_bonded());

            *bonded_clone.borrow_mut() += 1;
        });

        let id = cache.update_peer(bredr([1, 1, 1, 1, 1, 1]), |_| ());

        cache.store_bond(id, |bond| {
            bond.bredr_link_key = Some(LinkKey {
                value: [0x55; 16],
                key_type: LinkKeyType::AuthenticatedCombinationP256,
            })
        });

        assert_eq!(1, *bonded.borrow());
        assert_eq!(1, cache.bonded_peers().len());
    }
}
