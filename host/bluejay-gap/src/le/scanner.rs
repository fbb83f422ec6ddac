//! The LE scanner and discovery sessions
//!
//! Discovery is session based: the scanner runs while at least one [`DiscoverySession`] is alive
//! (or a connector is watching for its target) and stops when the last goes away. Whether the
//! scan is passive or active is the OR of what the sessions asked for. Every report updates the
//! [`PeerCache`]; directed connectable advertisements from bonded peers route to the
//! auto-connect hook.
//!
//! Legacy and extended scanning differ only in the commands and the report events; the scanner
//! picks at construction based on what the Controller supports.
//!
//! [`PeerCache`]: crate::peer::PeerCache

use crate::le::LocalAddressManager;
use crate::peer::{Peer, PeerCache};
use crate::PeerId;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use bluejay_core::{AddressKind, BluetoothDeviceAddress, DeviceAddress};
use bluejay_hci::command_channel::{CommandChannel, HandlerAction};
use bluejay_hci::commands::le::{
    PhyScanParameters, SetExtendedScanEnable, SetExtendedScanParameters, SetScanEnable,
    SetScanParameters, PHY_1M, PHY_CODED,
};
use bluejay_hci::commands::CommandParameter;
use bluejay_hci::events::{Events, EventsData, LeMeta};
use core::cell::RefCell;

/// Scan interval in units of 0.625 ms (60 ms)
const SCAN_INTERVAL: u16 = 0x0060;

/// Scan window in units of 0.625 ms (30 ms)
const SCAN_WINDOW: u16 = 0x0030;

type ResultCallback = Box<dyn FnMut(&Peer)>;
type WatchCallback = Box<dyn FnOnce()>;
type DirectedHandler = Box<dyn FnMut(PeerId)>;

struct Session {
    active: bool,
    callback: ResultCallback,
}

struct Watcher {
    target: DeviceAddress,
    callback: Option<WatchCallback>,
}

struct State {
    command_channel: CommandChannel,
    cache: PeerCache,
    address: LocalAddressManager,
    extended: bool,
    sessions: BTreeMap<u64, Session>,
    watchers: BTreeMap<u64, Watcher>,
    next_token: u64,
    scanning: bool,
    scanning_actively: bool,
    directed_handler: Option<DirectedHandler>,
}

impl State {
    fn wants_scan(&self) -> bool {
        !self.sessions.is_empty() || !self.watchers.is_empty()
    }

    fn wants_active(&self) -> bool {
        self.sessions.values().any(|session| session.active)
    }
}

/// The LE scanner
#[derive(Clone)]
pub struct LowEnergyScanner {
    state: Rc<RefCell<State>>,
}

/// A live discovery session
///
/// Dropping the session removes it from the scanner; the scan stops when nothing else needs it.
pub struct DiscoverySession {
    scanner: Weak<RefCell<State>>,
    token: u64,
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        if let Some(state) = self.scanner.upgrade() {
            state.borrow_mut().sessions.remove(&self.token);

            LowEnergyScanner { state }.reconcile();
        }
    }
}

/// Token of a connector's target watch
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct WatchToken(u64);

impl LowEnergyScanner {
    pub fn new(
        command_channel: CommandChannel,
        cache: PeerCache,
        address: LocalAddressManager,
        extended: bool,
    ) -> Self {
        let scanner = LowEnergyScanner {
            state: Rc::new(RefCell::new(State {
                command_channel: command_channel.clone(),
                cache,
                address,
                extended,
                sessions: BTreeMap::new(),
                watchers: BTreeMap::new(),
                next_token: 1,
                scanning: false,
                scanning_actively: false,
                directed_handler: None,
            })),
        };

        // the handlers unregister themselves once the scanner is gone
        for event in [
            Events::LeMeta(LeMeta::AdvertisingReport),
            Events::LeMeta(LeMeta::ExtendedAdvertisingReport),
        ] {
            let weak = Rc::downgrade(&scanner.state);

            command_channel.add_event_handler(event, move |data| match weak.upgrade() {
                Some(state) => {
                    on_report(&LowEnergyScanner { state }, data);

                    HandlerAction::Continue
                }
                None => HandlerAction::Remove,
            });
        }

        scanner
    }

    /// Start a discovery session
    ///
    /// `active` requests scan responses; the scanner runs actively while any session wants it.
    pub fn start_discovery(&self, active: bool, callback: impl FnMut(&Peer) + 'static) -> DiscoverySession {
        let token = {
            let mut state = self.state.borrow_mut();

            let token = state.next_token;

            state.next_token += 1;

            state.sessions.insert(
                token,
                Session {
                    active,
                    callback: Box::new(callback),
                },
            );

            token
        };

        self.reconcile();

        DiscoverySession {
            scanner: Rc::downgrade(&self.state),
            token,
        }
    }

    /// Watch for one sighting of `target`
    ///
    /// For the connector's pre-connection scan; fires at most once.
    pub(crate) fn watch_for_peer(&self, target: DeviceAddress, callback: WatchCallback) -> WatchToken {
        let token = {
            let mut state = self.state.borrow_mut();

            let token = state.next_token;

            state.next_token += 1;

            state.watchers.insert(
                token,
                Watcher {
                    target,
                    callback: Some(callback),
                },
            );

            token
        };

        self.reconcile();

        WatchToken(token)
    }

    /// Remove a target watch
    pub(crate) fn cancel_watch(&self, token: WatchToken) {
        self.state.borrow_mut().watchers.remove(&token.0);

        self.reconcile();
    }

    /// Install the hook for directed connectable advertisements from bonded peers
    pub fn set_directed_handler(&self, handler: impl FnMut(PeerId) + 'static) {
        self.state.borrow_mut().directed_handler = Some(Box::new(handler));
    }

    /// Bring the Controller's scan state in line with the sessions and watchers
    fn reconcile(&self) {
        let plan = {
            let state = self.state.borrow();

            let want = state.wants_scan();
            let want_active = state.wants_active();

            if want == state.scanning && (!want || want_active == state.scanning_actively) {
                None
            } else {
                Some((want, want_active, state.extended, state.command_channel.clone()))
            }
        };

        let Some((want, want_active, extended, command_channel)) = plan else { return };

        let address = self.state.borrow().address.clone();

        let was_scanning = {
            let mut state = self.state.borrow_mut();

            let was_scanning = state.scanning;

            state.scanning = want;
            state.scanning_actively = want && want_active;

            was_scanning
        };

        if want && !was_scanning {
            address.checkout();
        } else if !want && was_scanning {
            address.release();
        }

        let own_address_type = address.own_address_type(false);

        if want {
            log::info!(
                "(GAP) starting {} LE scan",
                if want_active { "active" } else { "passive" }
            );

            if extended {
                command_channel.send_command(
                    SetExtendedScanParameters {
                        own_address_type,
                        filter_policy: 0,
                        scanning_phys: PHY_1M | PHY_CODED,
                        phy_parameters: alloc::vec![
                            PhyScanParameters {
                                active_scanning: want_active,
                                scan_interval: SCAN_INTERVAL,
                                scan_window: SCAN_WINDOW,
                            },
                            PhyScanParameters {
                                active_scanning: want_active,
                                scan_interval: SCAN_INTERVAL,
                                scan_window: SCAN_WINDOW,
                            },
                        ],
                    }
                    .into_packet(),
                    Box::new(|_| ()),
                );

                command_channel.send_command(
                    SetExtendedScanEnable {
                        enable: true,
                        filter_duplicates: false,
                        duration: 0,
                        period: 0,
                    }
                    .into_packet(),
                    Box::new(|_| ()),
                );
            } else {
                command_channel.send_command(
                    SetScanParameters {
                        active_scanning: want_active,
                        scan_interval: SCAN_INTERVAL,
                        scan_window: SCAN_WINDOW,
                        own_address_type,
                        filter_policy: 0,
                    }
                    .into_packet(),
                    Box::new(|_| ()),
                );

                command_channel.send_command(
                    SetScanEnable {
                        enable: true,
                        filter_duplicates: false,
                    }
                    .into_packet(),
                    Box::new(|_| ()),
                );
            }
        } else {
            log::info!("(GAP) stopping LE scan");

            if extended {
                command_channel.send_command(
                    SetExtendedScanEnable {
                        enable: false,
                        filter_duplicates: false,
                        duration: 0,
                        period: 0,
                    }
                    .into_packet(),
                    Box::new(|_| ()),
                );
            } else {
                command_channel.send_command(
                    SetScanEnable {
                        enable: false,
                        filter_duplicates: false,
                    }
                    .into_packet(),
                    Box::new(|_| ()),
                );
            }
        }
    }
}

struct Sighting {
    address_kind: AddressKind,
    address: BluetoothDeviceAddress,
    rssi: Option<i8>,
    data: Vec<u8>,
    connectable: bool,
    directed: bool,
    scan_response: bool,
}

fn on_report(scanner: &LowEnergyScanner, data: &EventsData) {
    let sightings: Vec<Sighting> = match data {
        EventsData::LeAdvertisingReport(report) => report
            .reports
            .iter()
            .map(|report| Sighting {
                address_kind: report.address_kind,
                address: report.address,
                rssi: report.rssi,
                data: report.data.clone(),
                connectable: report.event_type.is_connectable(),
                directed: report.event_type.is_directed(),
                scan_response: report.event_type.is_scan_response(),
            })
            .collect(),
        EventsData::LeExtendedAdvertisingReport(report) => report
            .reports
            .iter()
            .map(|report| Sighting {
                address_kind: report.address_kind,
                address: report.address,
                rssi: report.rssi,
                data: report.data.clone(),
                connectable: report.event_type.is_connectable(),
                directed: report.event_type.is_directed(),
                scan_response: report.event_type.is_scan_response(),
            })
            .collect(),
        _ => return,
    };

    for sighting in sightings {
        process_sighting(scanner, sighting);
    }
}

fn process_sighting(scanner: &LowEnergyScanner, sighting: Sighting) {
    if sighting.address_kind == AddressKind::LeAnonymous {
        return;
    }

    let address = DeviceAddress::new(sighting.address_kind, sighting.address);

    let cache = scanner.state.borrow().cache.clone();

    let peer_id = cache.update_peer(address, |peer| {
        peer.rssi = sighting.rssi;

        if !sighting.data.is_empty() {
            if sighting.scan_response {
                // scan response data appends to the advertising data of the set
                if let Some(existing) = peer.advertising_data.as_mut() {
                    existing.extend_from_slice(&sighting.data);
                } else {
                    peer.advertising_data = Some(sighting.data.clone());
                }
            } else {
                peer.advertising_data = Some(sighting.data.clone());
            }
        }
    });

    // one-shot target watchers
    let fired: Vec<WatchCallback> = {
        let mut state = scanner.state.borrow_mut();

        let matching: Vec<u64> = state
            .watchers
            .iter()
            .filter(|(_, watcher)| watcher.target.is_same_identity(&address))
            .map(|(token, _)| *token)
            .collect();

        matching
            .into_iter()
            .filter_map(|token| {
                state
                    .watchers
                    .remove(&token)
                    .and_then(|watcher| watcher.callback)
            })
            .collect()
    };

    let watchers_fired = !fired.is_empty();

    for callback in fired {
        callback();
    }

    if watchers_fired {
        scanner.reconcile();
    }

    // session fan out: callbacks run with no scanner borrow held
    let session_tokens: Vec<u64> = scanner.state.borrow().sessions.keys().copied().collect();

    if let Some(peer) = cache.find_by_id(peer_id) {
        for token in session_tokens {
            let callback = {
                let mut state = scanner.state.borrow_mut();

                state
                    .sessions
                    .get_mut(&token)
                    .map(|session| core::mem::replace(&mut session.callback, Box::new(|_| ())))
            };

            if let Some(mut callback) = callback {
                callback(&peer);

                let mut state = scanner.state.borrow_mut();

                if let Some(session) = state.sessions.get_mut(&token) {
                    session.callback = callback;
                }
            }
        }

        // a bonded peer paging us with a directed advertisement is an auto-connect cue
        if sighting.directed && sighting.connectable && peer.is_bonded() {
            let handler = scanner.state.borrow_mut().directed_handler.take();

            if let Some(mut handler) = handler {
                handler(peer_id);

                let mut state = scanner.state.borrow_mut();

                if state.directed_handler.is_none() {
                    state.directed_handler = Some(handler);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluejay_core::dispatch::Dispatcher;
    use bluejay_hci::transport::testing::RecordingDriver;
    use bluejay_hci::transport::{HciPacketType, Transport};

    fn fixture() -> (Transport, RecordingDriver, Dispatcher, LowEnergyScanner) {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher.clone());

        let cache = PeerCache::new();

        let address = LocalAddressManager::new(
            transport.command_channel(),
            dispatcher.clone(),
            BluetoothDeviceAddress::zeroed(),
        );

        let scanner = LowEnergyScanner::new(transport.command_channel(), cache, address, false);

        (transport, driver, dispatcher, scanner)
    }

    fn advertising_report(address: [u8; 6], data: &[u8]) -> Vec<u8> {
        let mut packet = alloc::vec![
            0x3E,
            (11 + data.len() + 1) as u8,
            0x02, // advertising report
            0x01, // one report
            0x00, // ADV_IND
            0x01, // random address
        ];

        packet.extend_from_slice(&address);
        packet.push(data.len() as u8);
        packet.extend_from_slice(data);
        packet.push(0xC8u8); // RSSI -56

        packet
    }

    #[test]
    fn scan_runs_while_sessions_live() {
        let (transport, driver, dispatcher, scanner) = fixture();

        let mut acker = bluejay_hci::transport::testing::CommandAcker::new();

        let session = scanner.start_discovery(false, |_| ());

        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);

        // scan parameters then scan enable
        assert_eq!(alloc::vec![0x200B, 0x200C], driver.sent_command_opcodes());

        drop(session);

        dispatcher.run_until_idle();
        acker.ack_all(&transport, &driver);

        // one more scan enable (disable)
        assert_eq!(alloc::vec![0x200B, 0x200C, 0x200C], driver.sent_command_opcodes());
    }

    #[test]
    fn reports_reach_sessions_and_the_cache() {
        let (transport, _driver, dispatcher, scanner) = fixture();

        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen_clone = seen.clone();

        let _session = scanner.start_discovery(false, move |peer| {
            seen_clone.borrow_mut().push(peer.id);
        });

        transport.on_received_packet(
            HciPacketType::Event,
            &advertising_report([6, 5, 4, 3, 2, 1], &[0x02, 0x01, 0x06]),
        );

        dispatcher.run_until_idle();

        assert_eq!(1, seen.borrow().len());
    }
}
