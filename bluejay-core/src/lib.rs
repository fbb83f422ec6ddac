//! Core types of the bluejay host stack
//!
//! This crate carries the parts of the host that every other crate depends on: the Bluetooth
//! device address types, the HCI status code enumeration, the weak reference primitive used for
//! deferring callbacks across the dispatcher, and the dispatcher itself.
//!
//! # The single host thread
//! The entire host runs on one [`Dispatcher`]. Work that completes later (command completions,
//! timeouts, deferred callbacks) is posted to the dispatcher and runs when the host thread gets
//! to it. Deferred closures capture a [`WeakRef`] to their owner and do nothing when the owner no
//! longer exists, so an object may always be dropped without draining the queue first.
//!
//! [`Dispatcher`]: dispatch::Dispatcher
//! [`WeakRef`]: weak::WeakRef

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate alloc;

pub mod dispatch;
pub mod errors;
pub mod pool;
pub mod security;
pub mod weak;

use core::fmt;

/// A Bluetooth device address
///
/// The raw six byte address of a Bluetooth device, stored in the little endian order used on the
/// wire (the least significant byte first).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BluetoothDeviceAddress(pub [u8; 6]);

impl BluetoothDeviceAddress {
    /// Create a `BluetoothDeviceAddress` from the raw little endian bytes
    pub const fn new(address: [u8; 6]) -> Self {
        BluetoothDeviceAddress(address)
    }

    /// Create an address of all zeros
    pub const fn zeroed() -> Self {
        BluetoothDeviceAddress([0; 6])
    }

    /// Check if this is a static random device address
    ///
    /// A static device address has its two most significant bits set to one.
    pub fn is_static_random(&self) -> bool {
        self.0[5] & 0xC0 == 0xC0
    }

    /// Check if this is a resolvable private address
    ///
    /// A resolvable private address has its most significant bit cleared and the next bit set.
    pub fn is_resolvable_private(&self) -> bool {
        self.0[5] & 0xC0 == 0x40
    }

    /// Check if this is a non-resolvable private address
    pub fn is_non_resolvable_private(&self) -> bool {
        self.0[5] & 0xC0 == 0x00
    }
}

impl fmt::Display for BluetoothDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl From<[u8; 6]> for BluetoothDeviceAddress {
    fn from(address: [u8; 6]) -> Self {
        BluetoothDeviceAddress(address)
    }
}

/// The kind of a device address
///
/// An address on its own is ambiguous. BR/EDR addresses are always public, but a LE address is
/// either the public address or one of the random sub-kinds, and the distinction changes how the
/// address is put into HCI command parameters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressKind {
    /// A BR/EDR public device address
    BrEdr,
    /// A LE public device address
    LePublic,
    /// A LE random device address (static or private)
    LeRandom,
    /// An anonymous advertisement (no address was transmitted)
    LeAnonymous,
}

impl AddressKind {
    /// Check if the kind is one of the LE kinds
    pub fn is_low_energy(&self) -> bool {
        !matches!(self, AddressKind::BrEdr)
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AddressKind::BrEdr => f.write_str("BR/EDR"),
            AddressKind::LePublic => f.write_str("LE public"),
            AddressKind::LeRandom => f.write_str("LE random"),
            AddressKind::LeAnonymous => f.write_str("LE anonymous"),
        }
    }
}

/// A device address together with its kind
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceAddress {
    pub kind: AddressKind,
    pub address: BluetoothDeviceAddress,
}

impl DeviceAddress {
    /// Create a new `DeviceAddress`
    pub const fn new(kind: AddressKind, address: BluetoothDeviceAddress) -> Self {
        DeviceAddress { kind, address }
    }

    /// Create a BR/EDR public address
    pub const fn bredr(address: BluetoothDeviceAddress) -> Self {
        DeviceAddress::new(AddressKind::BrEdr, address)
    }

    /// Create a LE public address
    pub const fn le_public(address: BluetoothDeviceAddress) -> Self {
        DeviceAddress::new(AddressKind::LePublic, address)
    }

    /// Create a LE random address
    pub const fn le_random(address: BluetoothDeviceAddress) -> Self {
        DeviceAddress::new(AddressKind::LeRandom, address)
    }

    /// Check if this address identifies the same device as `other`
    ///
    /// Two addresses refer to the same identity when the raw bytes match and both are public or
    /// both are random. The BR/EDR public and LE public addresses of a dual mode device compare
    /// equal here.
    pub fn is_same_identity(&self, other: &DeviceAddress) -> bool {
        if self.address != other.address {
            return false;
        }

        match (self.kind, other.kind) {
            (AddressKind::LeRandom, AddressKind::LeRandom) => true,
            (AddressKind::LeRandom, _) | (_, AddressKind::LeRandom) => false,
            (AddressKind::LeAnonymous, _) | (_, AddressKind::LeAnonymous) => false,
            _ => true,
        }
    }

    /// Check if this is an address that can be resolved with an identity resolving key
    pub fn is_resolvable(&self) -> bool {
        self.kind == AddressKind::LeRandom && self.address.is_resolvable_private()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_is_big_endian() {
        let address = BluetoothDeviceAddress::new([0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);

        assert_eq!("01:02:03:04:05:06", alloc::format!("{}", address));
    }

    #[test]
    fn random_address_sub_kinds() {
        let static_random = BluetoothDeviceAddress::new([0, 0, 0, 0, 0, 0xC5]);
        let resolvable = BluetoothDeviceAddress::new([0, 0, 0, 0, 0, 0x55]);
        let non_resolvable = BluetoothDeviceAddress::new([0, 0, 0, 0, 0, 0x35]);

        assert!(static_random.is_static_random());
        assert!(resolvable.is_resolvable_private());
        assert!(non_resolvable.is_non_resolvable_private());
    }

    #[test]
    fn public_identities_match_across_transports() {
        let raw = BluetoothDeviceAddress::new([1, 2, 3, 4, 5, 6]);

        assert!(DeviceAddress::bredr(raw).is_same_identity(&DeviceAddress::le_public(raw)));
        assert!(!DeviceAddress::le_random(raw).is_same_identity(&DeviceAddress::le_public(raw)));
    }
}
