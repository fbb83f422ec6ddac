//! End to end scenarios against the scripted controller

use bluejay_core::errors::{Error, HostError};
use bluejay_core::security::SecurityLevel;
use bluejay_core::{BluetoothDeviceAddress, DeviceAddress};
use bluejay_gap::le::{AdvertisingInterval, AdvertisingOptions, ConnectionOptions};
use bluejay_gap::{BrEdrSecurityMode, ConnectionState};
use bluejay_host_tests::{events, initialized_host, initialized_host_with, AcceptingDelegate, HostFixture};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// `01:02:03:04:05:06` in wire order
const LE_PEER: [u8; 6] = [0x06, 0x05, 0x04, 0x03, 0x02, 0x01];

/// `AA:BB:CC:DD:EE:FF` in wire order
const CLASSIC_PEER: [u8; 6] = [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA];

/// A second classic peer for the request-queueing scenarios
const CLASSIC_PEER_B: [u8; 6] = [0x66, 0x55, 0x44, 0x33, 0x22, 0x11];

fn le_peer_address() -> DeviceAddress {
    DeviceAddress::le_random(BluetoothDeviceAddress::new(LE_PEER))
}

fn bredr_peer_address() -> DeviceAddress {
    DeviceAddress::bredr(BluetoothDeviceAddress::new(CLASSIC_PEER))
}

fn script_le_interrogation(fixture: &HostFixture, handle: u16) {
    fixture.controller.on_command(
        0x2016,
        vec![
            events::command_status(0x2016, 0x00),
            events::le_read_remote_features_complete(handle, [0x20, 0, 0, 0, 0, 0, 0, 0]),
        ],
    );

    fixture.controller.on_command(
        0x041D,
        vec![
            events::command_status(0x041D, 0x00),
            events::read_remote_version_complete(handle, 0x0B, 0x000F, 0x0001),
        ],
    );
}

#[test]
fn le_connect_success() {
    let fixture = initialized_host();

    let cache = fixture.adapter.peer_cache();

    let peer_id = cache.update_peer(le_peer_address(), |_| ());

    fixture.controller.on_command(
        0x200D,
        vec![
            events::command_status(0x200D, 0x00),
            events::le_connection_complete(0x00, 0x0042, 0x00, LE_PEER),
        ],
    );

    script_le_interrogation(&fixture, 0x0042);

    let result = Rc::new(RefCell::new(Vec::new()));

    let sink = result.clone();

    fixture.adapter.le().connect(peer_id, ConnectionOptions::default(), move |outcome| {
        sink.borrow_mut().push(outcome);
    });

    fixture.dispatcher.run_until_idle();

    // the connector confirms the peer is advertising before it pages
    fixture
        .controller
        .inject_event(events::le_advertising_report(LE_PEER, 0x00, &[0x02, 0x01, 0x06]));

    fixture.dispatcher.run_until_idle();

    // exactly one callback, with the controller's handle
    let outcomes = result.borrow();

    assert_eq!(1, outcomes.len());
    assert_eq!(0x0042, outcomes[0].as_ref().unwrap().get_raw_handle());

    // the cache agrees once interrogation finished
    let peer = cache.find_by_id(peer_id).unwrap();

    assert_eq!(ConnectionState::Connected, peer.le_state);
}

#[test]
fn le_connect_retries_establishment_failures() {
    let fixture = initialized_host();

    let cache = fixture.adapter.peer_cache();

    let peer_id = cache.update_peer(le_peer_address(), |_| ());

    // first attempt dies with 0x3E; the second succeeds
    fixture.controller.on_command(
        0x200D,
        vec![
            events::command_status(0x200D, 0x00),
            events::le_connection_complete(0x3E, 0x0000, 0x00, LE_PEER),
        ],
    );

    fixture.controller.on_command(
        0x200D,
        vec![
            events::command_status(0x200D, 0x00),
            events::le_connection_complete(0x00, 0x0043, 0x00, LE_PEER),
        ],
    );

    script_le_interrogation(&fixture, 0x0043);

    let result = Rc::new(RefCell::new(Vec::new()));

    let sink = result.clone();

    fixture.adapter.le().connect(peer_id, ConnectionOptions::default(), move |outcome| {
        sink.borrow_mut().push(outcome);
    });

    fixture.dispatcher.run_until_idle();

    fixture
        .controller
        .inject_event(events::le_advertising_report(LE_PEER, 0x00, &[]));

    fixture.dispatcher.run_until_idle();

    // the pause between attempts, then the connector scans again
    fixture.dispatcher.advance(Duration::from_secs(2));

    fixture
        .controller
        .inject_event(events::le_advertising_report(LE_PEER, 0x00, &[]));

    fixture.dispatcher.run_until_idle();

    assert_eq!(2, fixture.controller.count_of(0x200D));

    let outcomes = result.borrow();

    assert_eq!(1, outcomes.len());
    assert_eq!(0x0043, outcomes[0].as_ref().unwrap().get_raw_handle());
}

fn script_bredr_interrogation(fixture: &HostFixture, handle: u16) {
    fixture.controller.on_command(
        0x041D,
        vec![
            events::command_status(0x041D, 0x00),
            events::read_remote_version_complete(handle, 0x09, 0x000F, 0x0001),
        ],
    );

    let mut features = [0u8; 8];

    features[7] = 0x80; // extended features exist

    fixture.controller.on_command(
        0x041B,
        vec![
            events::command_status(0x041B, 0x00),
            events::read_remote_supported_features_complete(handle, features),
        ],
    );

    fixture.controller.on_command(
        0x041C,
        vec![
            events::command_status(0x041C, 0x00),
            events::read_remote_extended_features_complete(handle, 1, 1, [0x01, 0, 0, 0, 0, 0, 0, 0]),
        ],
    );
}

/// Accept an inbound BR/EDR connection whose role change beats the connection complete event
fn accept_inbound_classic(fixture: &HostFixture, handle: u16) -> bluejay_gap::PeerId {
    fixture
        .controller
        .on_command(0x0409, vec![events::command_status(0x0409, 0x00)]);

    script_bredr_interrogation(fixture, handle);

    fixture
        .controller
        .inject_event(events::connection_request(CLASSIC_PEER, 0x200404, 0x01));

    fixture.dispatcher.run_until_idle();

    assert_eq!(1, fixture.controller.count_of(0x0409));

    // the role change arrives before the connection complete; both orderings must work
    fixture
        .controller
        .inject_event(events::role_change(CLASSIC_PEER, 0x00));

    fixture
        .controller
        .inject_event(events::connection_complete(0x00, handle, CLASSIC_PEER));

    fixture.dispatcher.run_until_idle();

    fixture
        .adapter
        .peer_cache()
        .find_by_address(&bredr_peer_address())
        .unwrap()
        .id
}

#[test]
fn classic_connect_retries_establishment_failures() {
    let fixture = initialized_host();

    let cache = fixture.adapter.peer_cache();

    let peer_id = cache.update_peer(bredr_peer_address(), |_| ());

    // the first page dies with 0x3E; the retry succeeds
    fixture.controller.on_command(
        0x0405,
        vec![
            events::command_status(0x0405, 0x00),
            events::connection_complete(0x3E, 0x0000, CLASSIC_PEER),
        ],
    );

    fixture.controller.on_command(
        0x0405,
        vec![
            events::command_status(0x0405, 0x00),
            events::connection_complete(0x00, 0x0011, CLASSIC_PEER),
        ],
    );

    script_bredr_interrogation(&fixture, 0x0011);

    let result = Rc::new(RefCell::new(Vec::new()));

    let sink = result.clone();

    fixture.adapter.bredr().connect(peer_id, move |outcome| {
        sink.borrow_mut().push(outcome);
    });

    fixture.dispatcher.run_until_idle();

    // a second Create Connection went out for the same peer
    assert_eq!(2, fixture.controller.count_of(0x0405));

    let manager = fixture.adapter.bredr().manager();

    assert_eq!(1, manager.connection_retry_count());

    // exactly one callback, after interrogation of the retried link
    let outcomes = result.borrow();

    assert_eq!(1, outcomes.len());
    assert_eq!(0x0011, outcomes[0].as_ref().unwrap().get_raw_handle());

    let peer = cache.find_by_id(peer_id).unwrap();

    assert_eq!(ConnectionState::Connected, peer.bredr_state);
}

#[test]
fn classic_retry_skipped_when_another_request_queues() {
    let fixture = initialized_host();

    let cache = fixture.adapter.peer_cache();

    let peer_a = cache.update_peer(bredr_peer_address(), |_| ());
    let peer_b = cache.update_peer(
        DeviceAddress::bredr(BluetoothDeviceAddress::new(CLASSIC_PEER_B)),
        |_| (),
    );

    fixture.controller.on_command(
        0x0405,
        vec![
            events::command_status(0x0405, 0x00),
            events::connection_complete(0x3E, 0x0000, CLASSIC_PEER),
        ],
    );

    fixture.controller.on_command(
        0x0405,
        vec![
            events::command_status(0x0405, 0x00),
            events::connection_complete(0x00, 0x0012, CLASSIC_PEER_B),
        ],
    );

    script_bredr_interrogation(&fixture, 0x0012);

    let result_a = Rc::new(RefCell::new(None));
    let result_b = Rc::new(RefCell::new(None));

    let sink = result_a.clone();

    fixture.adapter.bredr().connect(peer_a, move |outcome| {
        *sink.borrow_mut() = Some(outcome);
    });

    // a second request queues behind the page in flight
    let sink = result_b.clone();

    fixture.adapter.bredr().connect(peer_b, move |outcome| {
        *sink.borrow_mut() = Some(outcome);
    });

    fixture.dispatcher.run_until_idle();

    // 0x3E is not retried while another request waits; the failure surfaces and the
    // queued request takes the Controller
    assert!(matches!(
        *result_a.borrow(),
        Some(Err(HostError::Protocol(Error::ConnectionFailedToBeEstablished)))
    ));

    let manager = fixture.adapter.bredr().manager();

    assert_eq!(0, manager.connection_retry_count());

    // both Create Connection commands: one per peer, none for a retry
    assert_eq!(2, fixture.controller.count_of(0x0405));

    assert_eq!(
        0x0012,
        result_b
            .borrow()
            .as_ref()
            .unwrap()
            .as_ref()
            .unwrap()
            .get_raw_handle()
    );
}

#[test]
fn unknown_link_type_requests_are_rejected() {
    let fixture = initialized_host();

    fixture
        .controller
        .on_command(0x040A, vec![events::command_status(0x040A, 0x00)]);

    // a connection request naming a link type this host does not do
    fixture
        .controller
        .inject_event(events::connection_request(CLASSIC_PEER, 0x200404, 0x05));

    fixture.dispatcher.run_until_idle();

    // rejected, never accepted
    assert_eq!(1, fixture.controller.count_of(0x040A));
    assert_eq!(0, fixture.controller.count_of(0x0409));
}

#[test]
fn inbound_classic_connection_with_early_role_change() {
    let fixture = initialized_host();

    let peer_id = accept_inbound_classic(&fixture, 0x0010);

    let peer = fixture.adapter.peer_cache().find_by_id(peer_id).unwrap();

    assert_eq!(ConnectionState::Connected, peer.bredr_state);

    let manager = fixture.adapter.bredr().manager();

    // the pre-recorded role change was consumed when the link came up
    assert_eq!(
        Some(bluejay_hci::events::Role::Central),
        manager.connection_role(peer_id)
    );

    assert_eq!(
        Some(0x0010),
        manager.find_connection(peer_id).map(|handle| handle.get_raw_handle())
    );
}

#[test]
fn ssp_pairing_then_secure_connections_only_demotion() {
    let fixture = initialized_host_with(|builder| {
        builder
            .io_capability(bluejay_gap::IoCapability::DisplayYesNo)
            .pairing_delegate(Rc::new(AcceptingDelegate))
    });

    let peer_id = accept_inbound_classic(&fixture, 0x0010);

    fixture
        .controller
        .on_command(0x0411, vec![events::command_status(0x0411, 0x00)]);

    fixture
        .controller
        .on_command(0x0413, vec![events::command_status(0x0413, 0x00)]);

    let result = Rc::new(RefCell::new(None));

    let sink = result.clone();

    fixture
        .adapter
        .bredr()
        .pair(peer_id, move |outcome| *sink.borrow_mut() = Some(outcome));

    fixture.dispatcher.run_until_idle();

    // the SSP exchange, driven by the controller
    fixture
        .controller
        .inject_event(events::io_capability_request(CLASSIC_PEER));

    fixture
        .controller
        .inject_event(events::io_capability_response(CLASSIC_PEER, 0x01, true));

    fixture.dispatcher.run_until_idle();

    fixture
        .controller
        .inject_event(events::user_confirmation_request(CLASSIC_PEER, 852396));

    fixture.dispatcher.run_until_idle();

    // the accepting delegate confirmed the comparison
    assert_eq!(1, fixture.controller.count_of(0x042C));

    fixture
        .controller
        .inject_event(events::simple_pairing_complete(CLASSIC_PEER, 0x00));

    // an authenticated P-192 key: good under mode 4, not good enough for SC only
    fixture
        .controller
        .inject_event(events::link_key_notification(CLASSIC_PEER, [0x11; 16], 0x05));

    fixture
        .controller
        .inject_event(events::authentication_complete(0x0010, 0x00));

    fixture.dispatcher.run_until_idle();

    fixture
        .controller
        .inject_event(events::encryption_change(0x0010, 0x01));

    fixture.dispatcher.run_until_idle();

    assert_eq!(Some(Ok(())), *result.borrow());

    let manager = fixture.adapter.bredr().manager();

    assert_eq!(Some(SecurityLevel::Authenticated), manager.security_level(peer_id));

    // the new key was stored for the peer
    let peer = fixture.adapter.peer_cache().find_by_id(peer_id).unwrap();

    assert!(peer.bond.bredr_link_key.is_some());

    // entering secure connections only demotes the link
    fixture.controller.on_command(
        0x0406,
        vec![
            events::command_status(0x0406, 0x00),
            events::disconnection_complete(0x0010, 0x16),
        ],
    );

    fixture
        .adapter
        .bredr()
        .set_security_mode(BrEdrSecurityMode::SecureConnectionsOnly);

    fixture.dispatcher.run_until_idle();

    assert_eq!(1, fixture.controller.count_of(0x0406));
    assert_eq!(None, manager.find_connection(peer_id));
}

#[test]
fn api_disconnect_starts_the_cooldown() {
    let fixture = initialized_host();

    let peer_id = accept_inbound_classic(&fixture, 0x0010);

    fixture.controller.on_command(
        0x0406,
        vec![
            events::command_status(0x0406, 0x00),
            events::disconnection_complete(0x0010, 0x16),
        ],
    );

    fixture.adapter.bredr().disconnect(peer_id);

    fixture.dispatcher.run_until_idle();

    // an inbound request during the cooldown is rejected
    fixture
        .controller
        .on_command(0x040A, vec![events::command_status(0x040A, 0x00)]);

    fixture
        .controller
        .inject_event(events::connection_request(CLASSIC_PEER, 0x200404, 0x01));

    fixture.dispatcher.run_until_idle();

    assert_eq!(1, fixture.controller.count_of(0x040A));

    // after the cooldown the same peer is accepted again
    fixture.dispatcher.advance(Duration::from_secs(30));

    fixture
        .controller
        .on_command(0x0409, vec![events::command_status(0x0409, 0x00)]);

    fixture
        .controller
        .inject_event(events::connection_request(CLASSIC_PEER, 0x200404, 0x01));

    fixture.dispatcher.run_until_idle();

    assert_eq!(2, fixture.controller.count_of(0x0409));
}

#[test]
fn advertising_instance_lifetime() {
    let fixture = initialized_host();

    let result = Rc::new(RefCell::new(None));

    let sink = result.clone();

    fixture.adapter.le().start_advertising(
        AdvertisingOptions {
            data: vec![0x02, 0x01, 0x06],
            interval: AdvertisingInterval::Fast2,
            connectable: true,
            ..AdvertisingOptions::default()
        },
        move |outcome| *sink.borrow_mut() = Some(outcome),
    );

    fixture.dispatcher.run_until_idle();

    let instance = result.borrow_mut().take().unwrap().unwrap();

    // parameters, data, one enable
    assert_eq!(1, fixture.controller.count_of(0x2006));
    assert_eq!(1, fixture.controller.count_of(0x2008));
    assert_eq!(1, fixture.controller.count_of(0x200A));

    drop(instance);

    fixture.dispatcher.run_until_idle();

    // exactly one disable for the set
    assert_eq!(2, fixture.controller.count_of(0x200A));

    // and the handle is free for the next set
    let again = Rc::new(RefCell::new(None));

    let sink = again.clone();

    fixture
        .adapter
        .le()
        .start_advertising(AdvertisingOptions::default(), move |outcome| {
            *sink.borrow_mut() = Some(outcome)
        });

    fixture.dispatcher.run_until_idle();

    let second = again.borrow_mut().take().unwrap().unwrap();

    assert_eq!(0, second.handle());
}

#[test]
fn discovery_updates_the_cache() {
    let fixture = initialized_host();

    let seen = Rc::new(RefCell::new(Vec::new()));

    let sink = seen.clone();

    let session = fixture
        .adapter
        .le()
        .start_discovery(false, move |peer| sink.borrow_mut().push(peer.id));

    fixture.dispatcher.run_until_idle();

    fixture
        .controller
        .inject_event(events::le_advertising_report(LE_PEER, 0x00, &[0x02, 0x01, 0x06]));

    fixture.dispatcher.run_until_idle();

    assert_eq!(1, seen.borrow().len());

    let peer = fixture
        .adapter
        .peer_cache()
        .find_by_address(&le_peer_address())
        .unwrap();

    assert_eq!(Some(vec![0x02, 0x01, 0x06]), peer.advertising_data);

    drop(session);
}
