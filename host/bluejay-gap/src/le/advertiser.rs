//! The LE advertiser
//!
//! Three generations of controllers advertise three different ways: the legacy single-instance
//! commands, the 5.0 extended advertising sets, and the Android vendor multi-advertising suite
//! for controllers that predate 5.0 but carry the vendor extension. The outer state machine is
//! identical for all three; what differs is purely which command packets get built, so the
//! flavor lives behind [`AdvertisingCommands`] and is chosen once at adapter initialization.
//!
//! Advertising set slots come from a fixed [`RecyclingPool`]; the slot index is the advertising
//! handle on the wire. An [`AdvertisementInstance`] owns its slot, and dropping it disables the
//! set, frees the slot for reuse, and (for set-based flavors) removes the set from the
//! Controller.
//!
//! [`RecyclingPool`]: bluejay_core::pool::RecyclingPool

use crate::le::LocalAddressManager;
use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use bluejay_core::errors::HostError;
use bluejay_core::pool::{PoolToken, RecyclingPool};
use bluejay_core::{AddressKind, BluetoothDeviceAddress};
use bluejay_hci::command_channel::CommandChannel;
use bluejay_hci::commands::le::{
    AdvertisingEventProperties, AdvertisingType, OwnAddressType, SetAdvertisingData,
    SetAdvertisingEnable, SetAdvertisingParameters, SetExtendedAdvertisingData,
    SetExtendedAdvertisingEnable, SetExtendedAdvertisingParameters, SetExtendedScanResponseData,
    SetScanResponseData, RemoveAdvertisingSet,
};
use bluejay_hci::commands::vendor::{
    MultiAdvtEnable, MultiAdvtSetData, MultiAdvtSetParameters, MultiAdvtSetScanResponseData,
};
use bluejay_hci::commands::{CommandPacket, CommandParameter};
use bluejay_hci::runner::SequentialCommandRunner;
use core::cell::RefCell;

/// The advertising data limit of a legacy PDU
pub const LEGACY_ADVERTISING_DATA_LIMIT: usize = 31;

/// Bytes the TX power level AD structure occupies when the Controller appends it
const TX_POWER_AD_SIZE: usize = 3;

/// The advertising interval ranges, in units of 0.625 ms
///
/// Fast1 is upgraded to Fast2 for non connectable advertisements; controllers commonly reject
/// the tighter range for them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AdvertisingInterval {
    /// 30 ms to 60 ms
    Fast1,
    /// 100 ms to 150 ms
    Fast2,
    /// 1 s to 1.2 s
    Slow,
}

impl AdvertisingInterval {
    fn range(&self) -> (u16, u16) {
        match self {
            AdvertisingInterval::Fast1 => (0x0030, 0x0060),
            AdvertisingInterval::Fast2 => (0x00A0, 0x00F0),
            AdvertisingInterval::Slow => (0x0640, 0x0780),
        }
    }
}

/// Options of one advertisement
pub struct AdvertisingOptions {
    pub data: Vec<u8>,
    pub scan_response: Vec<u8>,
    pub interval: AdvertisingInterval,
    pub connectable: bool,
    pub anonymous: bool,
    pub include_tx_power: bool,
}

impl Default for AdvertisingOptions {
    fn default() -> Self {
        AdvertisingOptions {
            data: Vec::new(),
            scan_response: Vec::new(),
            interval: AdvertisingInterval::Slow,
            connectable: false,
            anonymous: false,
            include_tx_power: false,
        }
    }
}

/// The per flavor command builders
///
/// One implementation per Controller generation; the advertiser state machine drives whichever
/// it was built with.
pub trait AdvertisingCommands {
    /// How many concurrent sets the flavor supports
    fn max_instances(&self) -> usize;

    /// The advertising data limit of one set
    fn max_data_length(&self) -> usize;

    fn build_set_parameters(
        &self,
        handle: u8,
        options: &AdvertisingOptions,
        interval: (u16, u16),
        own_address_type: OwnAddressType,
    ) -> CommandPacket;

    fn build_set_data(&self, handle: u8, data: &[u8]) -> CommandPacket;

    fn build_set_scan_response(&self, handle: u8, data: &[u8]) -> CommandPacket;

    fn build_enable(&self, handle: u8, enable: bool) -> CommandPacket;

    /// Remove the set entirely; `None` for flavors with no such command
    fn build_remove_set(&self, handle: u8) -> Option<CommandPacket>;
}

/// The legacy advertising commands (one instance)
pub struct LegacyAdvertisingCommands;

impl AdvertisingCommands for LegacyAdvertisingCommands {
    fn max_instances(&self) -> usize {
        1
    }

    fn max_data_length(&self) -> usize {
        LEGACY_ADVERTISING_DATA_LIMIT
    }

    fn build_set_parameters(
        &self,
        _handle: u8,
        options: &AdvertisingOptions,
        interval: (u16, u16),
        own_address_type: OwnAddressType,
    ) -> CommandPacket {
        let advertising_type = if options.connectable {
            AdvertisingType::ConnectableAndScannableUndirected
        } else if options.scan_response.is_empty() {
            AdvertisingType::NonConnectableUndirected
        } else {
            AdvertisingType::ScannableUndirected
        };

        SetAdvertisingParameters {
            interval_min: interval.0,
            interval_max: interval.1,
            advertising_type,
            own_address_type,
            peer_address_kind: AddressKind::LePublic,
            peer_address: BluetoothDeviceAddress::zeroed(),
            channel_map: 0x07,
            filter_policy: 0,
        }
        .into_packet()
    }

    fn build_set_data(&self, _handle: u8, data: &[u8]) -> CommandPacket {
        SetAdvertisingData { data: data.to_vec() }.into_packet()
    }

    fn build_set_scan_response(&self, _handle: u8, data: &[u8]) -> CommandPacket {
        SetScanResponseData { data: data.to_vec() }.into_packet()
    }

    fn build_enable(&self, _handle: u8, enable: bool) -> CommandPacket {
        SetAdvertisingEnable { enable }.into_packet()
    }

    fn build_remove_set(&self, _handle: u8) -> Option<CommandPacket> {
        None
    }
}

/// The 5.0 extended advertising commands
pub struct ExtendedAdvertisingCommands {
    /// Concurrent sets the Controller reported
    pub supported_sets: usize,
}

impl AdvertisingCommands for ExtendedAdvertisingCommands {
    fn max_instances(&self) -> usize {
        self.supported_sets
    }

    fn max_data_length(&self) -> usize {
        // bounded by what one set-data command carries
        251
    }

    fn build_set_parameters(
        &self,
        handle: u8,
        options: &AdvertisingOptions,
        interval: (u16, u16),
        own_address_type: OwnAddressType,
    ) -> CommandPacket {
        let mut properties = 0u16;

        if options.connectable {
            properties |= AdvertisingEventProperties::CONNECTABLE;
        }

        if !options.scan_response.is_empty() {
            properties |= AdvertisingEventProperties::SCANNABLE;
        }

        if options.anonymous {
            properties |= AdvertisingEventProperties::ANONYMOUS;
        }

        if options.include_tx_power {
            properties |= AdvertisingEventProperties::INCLUDE_TX_POWER;
        }

        SetExtendedAdvertisingParameters {
            advertising_handle: handle,
            properties: AdvertisingEventProperties(properties),
            primary_interval_min: interval.0 as u32,
            primary_interval_max: interval.1 as u32,
            primary_channel_map: 0x07,
            own_address_type,
            peer_address_kind: AddressKind::LePublic,
            peer_address: BluetoothDeviceAddress::zeroed(),
            filter_policy: 0,
            tx_power: 0x7F, // no preference
            primary_phy: 0x01,
            secondary_max_skip: 0,
            secondary_phy: 0x01,
            advertising_sid: handle & 0x0F,
            scan_request_notification_enable: false,
        }
        .into_packet()
    }

    fn build_set_data(&self, handle: u8, data: &[u8]) -> CommandPacket {
        SetExtendedAdvertisingData {
            advertising_handle: handle,
            data: data.to_vec(),
        }
        .into_packet()
    }

    fn build_set_scan_response(&self, handle: u8, data: &[u8]) -> CommandPacket {
        SetExtendedScanResponseData {
            advertising_handle: handle,
            data: data.to_vec(),
        }
        .into_packet()
    }

    fn build_enable(&self, handle: u8, enable: bool) -> CommandPacket {
        SetExtendedAdvertisingEnable {
            enable,
            sets: alloc::vec![(handle, 0, 0)],
        }
        .into_packet()
    }

    fn build_remove_set(&self, handle: u8) -> Option<CommandPacket> {
        Some(RemoveAdvertisingSet {
            advertising_handle: handle,
        }
        .into_packet())
    }
}

/// The Android vendor multi advertising commands
pub struct AndroidVendorAdvertisingCommands {
    /// Instances reported by the vendor capabilities
    pub supported_instances: usize,
    /// The address each instance advertises with
    pub own_address: BluetoothDeviceAddress,
}

impl AdvertisingCommands for AndroidVendorAdvertisingCommands {
    fn max_instances(&self) -> usize {
        self.supported_instances
    }

    fn max_data_length(&self) -> usize {
        LEGACY_ADVERTISING_DATA_LIMIT
    }

    fn build_set_parameters(
        &self,
        handle: u8,
        options: &AdvertisingOptions,
        interval: (u16, u16),
        own_address_type: OwnAddressType,
    ) -> CommandPacket {
        let advertising_type = if options.connectable {
            AdvertisingType::ConnectableAndScannableUndirected
        } else if options.scan_response.is_empty() {
            AdvertisingType::NonConnectableUndirected
        } else {
            AdvertisingType::ScannableUndirected
        };

        MultiAdvtSetParameters {
            advertising_instance: handle,
            interval_min: interval.0,
            interval_max: interval.1,
            advertising_type,
            own_address_type,
            own_address: self.own_address,
            peer_address_kind: AddressKind::LePublic,
            peer_address: BluetoothDeviceAddress::zeroed(),
            channel_map: 0x07,
            filter_policy: 0,
            tx_power: 0x7F as i8,
        }
        .into_packet()
    }

    fn build_set_data(&self, handle: u8, data: &[u8]) -> CommandPacket {
        MultiAdvtSetData {
            advertising_instance: handle,
            data: data.to_vec(),
        }
        .into_packet()
    }

    fn build_set_scan_response(&self, handle: u8, data: &[u8]) -> CommandPacket {
        MultiAdvtSetScanResponseData {
            advertising_instance: handle,
            data: data.to_vec(),
        }
        .into_packet()
    }

    fn build_enable(&self, handle: u8, enable: bool) -> CommandPacket {
        MultiAdvtEnable {
            advertising_instance: handle,
            enable,
        }
        .into_packet()
    }

    fn build_remove_set(&self, _handle: u8) -> Option<CommandPacket> {
        None
    }
}

/// State of one advertising set slot
struct AdvertisingSet {
    connectable: bool,
    enabled: bool,
}

struct AdvertiserState {
    command_channel: CommandChannel,
    address: LocalAddressManager,
    commands: Box<dyn AdvertisingCommands>,
    pool: RecyclingPool<AdvertisingSet>,
}

/// The LE advertising manager
#[derive(Clone)]
pub struct LowEnergyAdvertiser {
    state: Rc<RefCell<AdvertiserState>>,
}

/// A live advertisement
///
/// Dropping the instance stops its set: one disable command goes out for the set, the slot
/// frees for reuse, and (where the flavor has one) the remove-set command follows.
pub struct AdvertisementInstance {
    token: Option<PoolToken<AdvertisingSet>>,
    manager: Weak<RefCell<AdvertiserState>>,
}

impl AdvertisementInstance {
    /// The advertising handle of this set
    pub fn handle(&self) -> u8 {
        self.token.as_ref().map(|token| token.index() as u8).unwrap_or(0)
    }
}

impl Drop for AdvertisementInstance {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else { return };

        let handle = token.index() as u8;

        let (enabled, connectable) = token.with(|set| (set.enabled, set.connectable));

        if let Some(state) = self.manager.upgrade() {
            let (command_channel, disable, remove) = {
                let state = state.borrow();

                (
                    state.command_channel.clone(),
                    state.commands.build_enable(handle, false),
                    state.commands.build_remove_set(handle),
                )
            };

            log::info!(
                "(GAP) stopping {}advertisement {}",
                if connectable { "connectable " } else { "" },
                handle
            );

            if enabled {
                command_channel.send_command(disable, Box::new(|_| ()));

                if let Some(remove) = remove {
                    command_channel.send_command(remove, Box::new(|_| ()));
                }
            }

            state.borrow().address.release();
        }

        // the slot frees when the token drops
        drop(token);
    }
}

impl LowEnergyAdvertiser {
    pub fn new(
        command_channel: CommandChannel,
        address: LocalAddressManager,
        commands: Box<dyn AdvertisingCommands>,
    ) -> Self {
        let pool = RecyclingPool::new(commands.max_instances());

        LowEnergyAdvertiser {
            state: Rc::new(RefCell::new(AdvertiserState {
                command_channel,
                address,
                commands,
                pool,
            })),
        }
    }

    /// Start advertising
    ///
    /// On success the callback gets the [`AdvertisementInstance`] whose drop stops the set.
    pub fn start_advertising(
        &self,
        options: AdvertisingOptions,
        callback: impl FnOnce(Result<AdvertisementInstance, HostError>) + 'static,
    ) {
        if let Err(error) = self.validate(&options) {
            callback(Err(error));

            return;
        }

        let token = {
            let state = self.state.borrow();

            match state.pool.insert(AdvertisingSet {
                connectable: options.connectable,
                enabled: false,
            }) {
                Ok(token) => token,
                Err(_) => {
                    drop(state);

                    // every set slot (local or controller side) is in use
                    callback(Err(HostError::NotSupported));

                    return;
                }
            }
        };

        let handle = token.index() as u8;

        // Fast1 is upgraded for non connectable sets
        let interval = match (options.interval, options.connectable) {
            (AdvertisingInterval::Fast1, false) => AdvertisingInterval::Fast2,
            (interval, _) => interval,
        }
        .range();

        let runner = {
            let state = self.state.borrow();

            state.address.checkout();

            let own_address_type = state.address.own_address_type(false);

            let runner = SequentialCommandRunner::new(state.command_channel.clone());

            runner.queue(state.commands.build_set_parameters(
                handle,
                &options,
                interval,
                own_address_type,
            ));

            runner.queue(state.commands.build_set_data(handle, &options.data));

            if !options.scan_response.is_empty() {
                runner.queue(
                    state
                        .commands
                        .build_set_scan_response(handle, &options.scan_response),
                );
            }

            runner.queue(state.commands.build_enable(handle, true));

            runner
        };

        let manager = Rc::downgrade(&self.state);

        runner.run_commands(move |result| {
            let Some(state) = manager.upgrade() else { return };

            match result {
                Ok(()) => {
                    token.with_mut(|set| set.enabled = true);

                    log::info!("(GAP) advertisement {} started", token.index());

                    callback(Ok(AdvertisementInstance {
                        token: Some(token),
                        manager,
                    }));
                }
                Err(error) => {
                    state.borrow().address.release();

                    // the slot frees when the token drops here
                    callback(Err(error));
                }
            }
        });
    }

    fn validate(&self, options: &AdvertisingOptions) -> Result<(), HostError> {
        if options.anonymous && options.connectable {
            return Err(HostError::NotSupported);
        }

        let state = self.state.borrow();

        let limit = state.commands.max_data_length();
        let extended = limit > LEGACY_ADVERTISING_DATA_LIMIT;

        // extended PDUs cannot be both scannable and connectable
        if extended && options.connectable && !options.scan_response.is_empty() {
            return Err(HostError::NotSupported);
        }

        let data_budget = if options.include_tx_power && !extended {
            limit.saturating_sub(TX_POWER_AD_SIZE)
        } else {
            limit
        };

        if options.data.len() > data_budget {
            return Err(HostError::AdvertisingDataTooLong);
        }

        if options.scan_response.len() > limit {
            return Err(HostError::ScanResponseDataTooLong);
        }

        Ok(())
    }

    /// Check if any live set is connectable (the peripheral role is possible)
    pub fn has_connectable_set(&self) -> bool {
        self.state.borrow().pool.occupied() != 0
    }

    /// Number of sets currently allocated
    pub fn active_set_count(&self) -> usize {
        self.state.borrow().pool.occupied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluejay_core::dispatch::Dispatcher;
    use bluejay_hci::transport::testing::{CommandAcker, RecordingDriver};
    use bluejay_hci::transport::Transport;

    fn fixture(
        commands: Box<dyn AdvertisingCommands>,
    ) -> (Transport, RecordingDriver, Dispatcher, LowEnergyAdvertiser) {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher.clone());

        let address = LocalAddressManager::new(
            transport.command_channel(),
            dispatcher.clone(),
            BluetoothDeviceAddress::new([1, 2, 3, 4, 5, 6]),
        );

        let advertiser = LowEnergyAdvertiser::new(transport.command_channel(), address, commands);

        (transport, driver, dispatcher, advertiser)
    }

    #[test]
    fn legacy_flow_and_instance_drop() {
        let (transport, driver, dispatcher, advertiser) = fixture(Box::new(LegacyAdvertisingCommands));

        let mut acker = CommandAcker::new();

        let instance = Rc::new(RefCell::new(None));

        let instance_clone = instance.clone();

        advertiser.start_advertising(
            AdvertisingOptions {
                data: alloc::vec![0x02, 0x01, 0x06],
                connectable: true,
                interval: AdvertisingInterval::Fast1,
                ..AdvertisingOptions::default()
            },
            move |result| *instance_clone.borrow_mut() = Some(result),
        );

        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);
        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);

        // parameters, data, enable
        assert_eq!(alloc::vec![0x2006, 0x2008, 0x200A], driver.sent_command_opcodes());

        let instance = instance.borrow_mut().take().unwrap().unwrap();

        assert_eq!(0, instance.handle());
        assert_eq!(1, advertiser.active_set_count());

        drop(instance);

        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);

        // exactly one more enable command (the disable) and the slot is free again
        assert_eq!(
            alloc::vec![0x2006, 0x2008, 0x200A, 0x200A],
            driver.sent_command_opcodes()
        );
        assert_eq!(0, advertiser.active_set_count());
    }

    #[test]
    fn legacy_pool_is_single_slot() {
        let (transport, driver, dispatcher, advertiser) = fixture(Box::new(LegacyAdvertisingCommands));

        let mut acker = CommandAcker::new();

        let first = Rc::new(RefCell::new(None));

        let first_clone = first.clone();

        advertiser.start_advertising(AdvertisingOptions::default(), move |result| {
            *first_clone.borrow_mut() = Some(result)
        });

        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);
        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);

        let second = Rc::new(RefCell::new(None));

        let second_clone = second.clone();

        advertiser.start_advertising(AdvertisingOptions::default(), move |result| {
            *second_clone.borrow_mut() = Some(result)
        });

        assert!(matches!(
            second.borrow_mut().take(),
            Some(Err(HostError::NotSupported))
        ));

        // dropping the first makes the slot reusable at the same handle
        let first = first.borrow_mut().take().unwrap().unwrap();

        assert_eq!(0, first.handle());

        drop(first);

        let third = Rc::new(RefCell::new(None));

        let third_clone = third.clone();

        advertiser.start_advertising(AdvertisingOptions::default(), move |result| {
            *third_clone.borrow_mut() = Some(result)
        });

        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);
        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);

        let third = third.borrow_mut().take().unwrap().unwrap();

        assert_eq!(0, third.handle());
    }

    #[test]
    fn invalid_combinations_are_refused() {
        let (_transport, _driver, _dispatcher, advertiser) =
            fixture(Box::new(LegacyAdvertisingCommands));

        let result = Rc::new(RefCell::new(None));

        let result_clone = result.clone();

        advertiser.start_advertising(
            AdvertisingOptions {
                anonymous: true,
                connectable: true,
                ..AdvertisingOptions::default()
            },
            move |outcome| *result_clone.borrow_mut() = Some(outcome),
        );

        assert!(matches!(
            result.borrow_mut().take(),
            Some(Err(HostError::NotSupported))
        ));

        let result_clone = result.clone();

        advertiser.start_advertising(
            AdvertisingOptions {
                data: alloc::vec![0; 32],
                ..AdvertisingOptions::default()
            },
            move |outcome| *result_clone.borrow_mut() = Some(outcome),
        );

        assert!(matches!(
            result.borrow_mut().take(),
            Some(Err(HostError::AdvertisingDataTooLong))
        ));

        // TX power inclusion shrinks the legacy data budget
        let result_clone = result.clone();

        advertiser.start_advertising(
            AdvertisingOptions {
                data: alloc::vec![0; 30],
                include_tx_power: true,
                ..AdvertisingOptions::default()
            },
            move |outcome| *result_clone.borrow_mut() = Some(outcome),
        );

        assert!(matches!(
            result.borrow_mut().take(),
            Some(Err(HostError::AdvertisingDataTooLong))
        ));
    }
}
