//! The LE local address manager
//!
//! Owns which address this adapter puts on the air: the public identity address, or a private
//! random address when privacy is enabled. With privacy on, the random address is regenerated on
//! a fixed rotation period, but only written to the Controller while no scanner, advertiser, or
//! connector has the address checked out (the Controller rejects a random address change while
//! any of them run).
//!
//! Generating a *resolvable* private address requires the identity resolving key cryptography,
//! which lives in the Security Manager collaborator; embedders with one install a generator
//! through [`set_privacy`](LocalAddressManager::set_privacy). The built in generator produces
//! non resolvable private addresses.

use alloc::boxed::Box;
use alloc::rc::Rc;
use bluejay_core::dispatch::Dispatcher;
use bluejay_core::BluetoothDeviceAddress;
use bluejay_hci::command_channel::CommandChannel;
use bluejay_hci::commands::le::{OwnAddressType, SetRandomAddress};
use bluejay_hci::commands::CommandParameter;
use core::cell::RefCell;
use core::time::Duration;

/// How often a private address is regenerated while privacy is enabled
pub const ADDRESS_ROTATION_PERIOD: Duration = Duration::from_secs(15 * 60);

type AddressGenerator = Box<dyn FnMut() -> BluetoothDeviceAddress>;

struct State {
    command_channel: CommandChannel,
    dispatcher: Dispatcher,
    public_address: BluetoothDeviceAddress,
    privacy_enabled: bool,
    random_address: Option<BluetoothDeviceAddress>,
    /// The random address has been written to the Controller
    random_address_written: bool,
    generator: AddressGenerator,
    /// Live checkouts by the scanning/advertising/initiating state machines
    checkouts: usize,
    /// A rotation fell due while the address was checked out
    rotation_due: bool,
}

/// The local address policy
#[derive(Clone)]
pub struct LocalAddressManager {
    state: Rc<RefCell<State>>,
}

/// A non resolvable private address from a simple xorshift stream
fn non_resolvable_generator() -> AddressGenerator {
    let mut seed: u64 = 0x9E3779B97F4A7C15;

    Box::new(move || {
        // xorshift64
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;

        let mut address = [0u8; 6];

        address.copy_from_slice(&seed.to_le_bytes()[..6]);

        // top two bits zero: non resolvable private
        address[5] &= 0x3F;

        BluetoothDeviceAddress(address)
    })
}

impl LocalAddressManager {
    pub fn new(
        command_channel: CommandChannel,
        dispatcher: Dispatcher,
        public_address: BluetoothDeviceAddress,
    ) -> Self {
        let manager = LocalAddressManager {
            state: Rc::new(RefCell::new(State {
                command_channel,
                dispatcher,
                public_address,
                privacy_enabled: false,
                random_address: None,
                random_address_written: false,
                generator: non_resolvable_generator(),
                checkouts: 0,
                rotation_due: false,
            })),
        };

        manager.schedule_rotation();

        manager
    }

    /// Enable or disable privacy
    ///
    /// `generator` overrides how private addresses are produced (a Security Manager collaborator
    /// supplies resolvable ones).
    pub fn set_privacy(
        &self,
        enabled: bool,
        generator: Option<impl FnMut() -> BluetoothDeviceAddress + 'static>,
    ) {
        {
            let mut state = self.state.borrow_mut();

            state.privacy_enabled = enabled;

            if let Some(generator) = generator {
                state.generator = Box::new(generator);
            }

            if enabled {
                state.random_address = None;
                state.random_address_written = false;
            }
        }

        if enabled {
            self.refresh_random_address();
        }
    }

    /// Get the public identity address
    pub fn public_address(&self) -> BluetoothDeviceAddress {
        self.state.borrow().public_address
    }

    /// Get the own address type for a state machine's commands
    ///
    /// `use_identity` forces the identity address (the connector's workaround for peripherals
    /// that cannot resolve private addresses during pairing).
    pub fn own_address_type(&self, use_identity: bool) -> OwnAddressType {
        let state = self.state.borrow();

        if state.privacy_enabled && !use_identity {
            OwnAddressType::RandomDeviceAddress
        } else {
            OwnAddressType::PublicDeviceAddress
        }
    }

    /// Mark an address user (scanner/advertiser/connector) as running
    pub fn checkout(&self) {
        self.state.borrow_mut().checkouts += 1;
    }

    /// Mark an address user as stopped; a deferred rotation may now happen
    pub fn release(&self) {
        let rotate = {
            let mut state = self.state.borrow_mut();

            state.checkouts = state.checkouts.saturating_sub(1);

            state.checkouts == 0 && state.rotation_due
        };

        if rotate {
            self.refresh_random_address();
        }
    }

    /// Make sure the Controller has the address the policy calls for, then continue
    pub fn ensure_local_address(&self, callback: impl FnOnce() + 'static) {
        let write = {
            let state = self.state.borrow();

            state.privacy_enabled && !state.random_address_written
        };

        if !write {
            callback();

            return;
        }

        self.write_random_address(Box::new(callback));
    }

    fn refresh_random_address(&self) {
        let deferred = {
            let mut state = self.state.borrow_mut();

            if state.checkouts != 0 {
                state.rotation_due = true;

                true
            } else {
                state.rotation_due = false;

                let address = (state.generator)();

                state.random_address = Some(address);
                state.random_address_written = false;

                false
            }
        };

        if !deferred {
            self.write_random_address(Box::new(|| ()));
        }
    }

    fn write_random_address(&self, callback: Box<dyn FnOnce()>) {
        let (command_channel, address) = {
            let mut state = self.state.borrow_mut();

            let address = match state.random_address {
                Some(address) => address,
                None => {
                    let address = (state.generator)();

                    state.random_address = Some(address);

                    address
                }
            };

            (state.command_channel.clone(), address)
        };

        let state = Rc::downgrade(&self.state);

        command_channel.send_command(
            SetRandomAddress {
                random_address: address,
            }
            .into_packet(),
            Box::new(move |result| {
                let written = result
                    .map(|response| response.status().is_ok())
                    .unwrap_or(false);

                if let Some(state) = state.upgrade() {
                    state.borrow_mut().random_address_written = written;
                }

                if !written {
                    log::warn!("(GAP) failed to write the random device address");
                }

                callback();
            }),
        );
    }

    fn schedule_rotation(&self) {
        let weak = Rc::downgrade(&self.state);

        let dispatcher = self.state.borrow().dispatcher.clone();

        dispatcher.post_after(ADDRESS_ROTATION_PERIOD, move || {
            let Some(state) = weak.upgrade() else { return };

            let manager = LocalAddressManager { state };

            if manager.state.borrow().privacy_enabled {
                manager.refresh_random_address();
            }

            manager.schedule_rotation();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluejay_hci::transport::testing::RecordingDriver;
    use bluejay_hci::transport::Transport;

    #[test]
    fn identity_override_wins_over_privacy() {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver), dispatcher.clone());

        let manager = LocalAddressManager::new(
            transport.command_channel(),
            dispatcher,
            BluetoothDeviceAddress::new([1, 2, 3, 4, 5, 6]),
        );

        assert_eq!(
            OwnAddressType::PublicDeviceAddress,
            manager.own_address_type(false)
        );

        manager.set_privacy(true, None::<fn() -> BluetoothDeviceAddress>);

        assert_eq!(
            OwnAddressType::RandomDeviceAddress,
            manager.own_address_type(false)
        );

        // initiation with the identity address still uses public
        assert_eq!(
            OwnAddressType::PublicDeviceAddress,
            manager.own_address_type(true)
        );
    }

    #[test]
    fn rotation_defers_while_checked_out() {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher.clone());

        let mut acker = bluejay_hci::transport::testing::CommandAcker::new();

        let manager = LocalAddressManager::new(
            transport.command_channel(),
            dispatcher.clone(),
            BluetoothDeviceAddress::zeroed(),
        );

        manager.set_privacy(true, None::<fn() -> BluetoothDeviceAddress>);

        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);

        let count_writes = |driver: &RecordingDriver| {
            driver
                .sent_command_opcodes()
                .iter()
                .filter(|opcode| **opcode == 0x2005)
                .count()
        };

        let writes_before = count_writes(&driver);

        manager.checkout();

        dispatcher.advance(ADDRESS_ROTATION_PERIOD);
        acker.ack_all(&transport, &driver);

        // checked out: no new Set Random Address
        assert_eq!(writes_before, count_writes(&driver));

        manager.release();

        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);

        assert_eq!(writes_before + 1, count_writes(&driver));
    }
}
