//! The BR/EDR connection manager
//!
//! Owns every classic ACL connection: outbound paging (serialized, since the Controller runs at
//! most one Create Connection), inbound accept/reject policy, interrogation, the pairing state
//! of each link, and the disconnect cooldown.
//!
//! A connection moves through `Connecting → Interrogating → Connected → Disconnecting`; client
//! callbacks for a peer complete when interrogation finishes, and every queued request for that
//! peer gets the same aggregated result.

use crate::bredr::interrogation::Interrogator;
use crate::bredr::pairing::PairingStateManager;
use crate::collaborators::{SdpServer, ServiceRecord, ServiceRecordHandle};
use crate::peer::PeerCache;
use crate::{
    BrEdrSecurityMode, ConnectionState, DisconnectReason, IoCapability, PeerId, SharedDelegate,
};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::rc::Rc;
use alloc::vec::Vec;
use bluejay_core::dispatch::{Dispatcher, TaskId};
use bluejay_core::errors::{Error, HostError};
use bluejay_core::security::SecurityLevel;
use bluejay_core::weak::{Owner, WeakRef};
use bluejay_core::{BluetoothDeviceAddress, DeviceAddress};
use bluejay_hci::command_channel::{CommandChannel, HandlerAction, HandlerId};
use bluejay_hci::commands::link_control::{
    AcceptConnectionRequest, AcceptSynchronousConnectionRequest, CreateConnection,
    CreateConnectionCancel, Disconnect, RejectConnectionRequest,
    RejectSynchronousConnectionRequest, DEFAULT_ACL_PACKET_TYPES,
};
use bluejay_hci::commands::CommandParameter;
use bluejay_hci::data::ScoDataChannel;
use bluejay_hci::events::{Events, EventsData, LinkType, Role};
use bluejay_hci::ConnectionHandle;
use bluejay_l2cap::logical_link::LinkHooks;
use bluejay_l2cap::{Channel, ChannelManager, ChannelParameters, Psm};
use core::cell::RefCell;
use core::time::Duration;

/// Window during which inbound requests from an explicitly disconnected peer are rejected
pub const LOCAL_DISCONNECT_COOLDOWN: Duration = Duration::from_secs(30);

/// Time budget of one outbound connection attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Total attempts when the Controller reports 0x3E
const MAX_CONNECTION_ATTEMPTS: u8 = 3;

type ConnectCallback = Box<dyn FnOnce(Result<ConnectionHandle, HostError>)>;

/// Settings fixed at manager construction
pub struct BrEdrConnectionManagerSettings {
    pub local_iocap: IoCapability,
    pub security_mode: BrEdrSecurityMode,
    pub delegate: SharedDelegate,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnState {
    Interrogating,
    Connected,
    Disconnecting,
}

struct Connection {
    handle: ConnectionHandle,
    address: BluetoothDeviceAddress,
    peer_id: PeerId,
    role: Role,
    state: ConnState,
    security_level: SecurityLevel,
    pairing: Rc<RefCell<PairingStateManager>>,
    interrogator: Option<Interrogator>,
    /// Client callbacks completing when interrogation finishes
    waiters: Vec<ConnectCallback>,
    sco_handle: Option<ConnectionHandle>,
}

struct OutboundRequest {
    peer_id: PeerId,
    address: BluetoothDeviceAddress,
    attempts: u8,
    callbacks: Vec<ConnectCallback>,
    timeout: TaskId,
    timed_out: bool,
}

struct QueuedRequest {
    peer_id: PeerId,
    address: BluetoothDeviceAddress,
    callbacks: Vec<ConnectCallback>,
}

#[derive(Default)]
struct Counters {
    outgoing_connection_requests: u64,
    connection_retries: u64,
}

struct ManagerState {
    command_channel: CommandChannel,
    l2cap: ChannelManager,
    sco: ScoDataChannel,
    cache: PeerCache,
    dispatcher: Dispatcher,
    settings: BrEdrConnectionManagerSettings,
    sdp: Rc<dyn SdpServer>,
    connections: BTreeMap<u16, Connection>,
    pending: Option<OutboundRequest>,
    queued: VecDeque<QueuedRequest>,
    /// Addresses with an inbound request mid-accept
    inbound: BTreeSet<BluetoothDeviceAddress>,
    /// Addresses rejected until their cooldown expires
    cooldown: BTreeSet<BluetoothDeviceAddress>,
    /// Role changes that arrived before their connection complete event
    early_role_changes: BTreeMap<BluetoothDeviceAddress, Role>,
    /// Legacy pairing that started before its connection complete event
    preconnect_legacy: BTreeSet<BluetoothDeviceAddress>,
    counters: Counters,
    weak: WeakRef<ManagerState>,
}

impl ManagerState {
    fn connection_by_address(&mut self, address: &BluetoothDeviceAddress) -> Option<&mut Connection> {
        self.connections
            .values_mut()
            .find(|connection| connection.address == *address)
    }

    fn connection_by_peer(&self, peer_id: PeerId) -> Option<&Connection> {
        self.connections
            .values()
            .find(|connection| connection.peer_id == peer_id)
    }
}

/// The BR/EDR connection manager
pub struct BrEdrConnectionManager {
    state: Owner<ManagerState>,
    command_channel: CommandChannel,
    handlers: Vec<HandlerId>,
}

impl BrEdrConnectionManager {
    pub fn new(
        command_channel: CommandChannel,
        l2cap: ChannelManager,
        sco: ScoDataChannel,
        cache: PeerCache,
        dispatcher: Dispatcher,
        settings: BrEdrConnectionManagerSettings,
        sdp: Rc<dyn SdpServer>,
    ) -> Self {
        let state = Owner::new(ManagerState {
            command_channel: command_channel.clone(),
            l2cap,
            sco,
            cache,
            dispatcher,
            settings,
            sdp,
            connections: BTreeMap::new(),
            pending: None,
            queued: VecDeque::new(),
            inbound: BTreeSet::new(),
            cooldown: BTreeSet::new(),
            early_role_changes: BTreeMap::new(),
            preconnect_legacy: BTreeSet::new(),
            counters: Counters::default(),
            weak: WeakRef::new_dead(),
        });

        let weak = state.downgrade();

        state.with_mut(|manager| manager.weak = weak.clone());

        let mut manager = BrEdrConnectionManager {
            state,
            command_channel: command_channel.clone(),
            handlers: Vec::new(),
        };

        manager.register_handlers();

        manager
    }

    fn register_handlers(&mut self) {
        let events = [
            Events::ConnectionRequest,
            Events::ConnectionComplete,
            Events::DisconnectionComplete,
            Events::RoleChange,
            Events::IoCapabilityRequest,
            Events::IoCapabilityResponse,
            Events::UserConfirmationRequest,
            Events::UserPasskeyRequest,
            Events::UserPasskeyNotification,
            Events::LinkKeyRequest,
            Events::LinkKeyNotification,
            Events::PinCodeRequest,
            Events::SimplePairingComplete,
            Events::AuthenticationComplete,
            Events::EncryptionChange,
            Events::SynchronousConnectionComplete,
        ];

        for event in events {
            let weak = self.state.downgrade();

            let id = self.command_channel.add_event_handler(event, move |data| {
                if weak.is_alive() {
                    on_event(&weak, data);

                    HandlerAction::Continue
                } else {
                    HandlerAction::Remove
                }
            });

            self.handlers.push(id);
        }
    }

    /// Connect to a peer's BR/EDR transport
    ///
    /// Completes once the link exists and interrogation has finished. Requests made while a
    /// connection attempt to any peer is outstanding are queued.
    pub fn connect(
        &self,
        peer_id: PeerId,
        callback: impl FnOnce(Result<ConnectionHandle, HostError>) + 'static,
    ) {
        // attempts are counted before anything can bail out
        self.state
            .with_mut(|state| state.counters.outgoing_connection_requests += 1);

        let callback: ConnectCallback = Box::new(callback);

        let address = match self
            .state
            .with(|state| state.cache.find_by_id(peer_id))
            .and_then(|peer| peer.bredr_address)
        {
            Some(address) => address,
            None => {
                callback(Err(HostError::NotFound));

                return;
            }
        };

        let immediate = self.state.with_mut(move |state| {
            if let Some(connection) = state.connection_by_address(&address) {
                return match connection.state {
                    ConnState::Connected => Some((callback, connection.handle)),
                    _ => {
                        connection.waiters.push(callback);

                        None
                    }
                };
            }

            if let Some(pending) = state.pending.as_mut().filter(|pending| pending.peer_id == peer_id) {
                pending.callbacks.push(callback);
            } else if let Some(queued) = state
                .queued
                .iter_mut()
                .find(|queued| queued.peer_id == peer_id)
            {
                queued.callbacks.push(callback);
            } else {
                state.queued.push_back(QueuedRequest {
                    peer_id,
                    address,
                    callbacks: alloc::vec![callback],
                });
            }

            None
        });

        if let Some((callback, handle)) = immediate {
            callback(Ok(handle));

            return;
        }

        let weak = self.state.downgrade();

        start_next_request(&weak);
    }

    /// Disconnect a peer
    ///
    /// An `ApiRequest` disconnect puts the address on the cooldown denylist.
    pub fn disconnect(&self, peer_id: PeerId, reason: DisconnectReason) {
        let weak = self.state.downgrade();

        let handle = self
            .state
            .with(|state| state.connection_by_peer(peer_id).map(|connection| connection.handle));

        if let Some(handle) = handle {
            disconnect_handle(&weak, handle, reason);
        }
    }

    /// Start pairing with a connected peer
    pub fn pair(&self, peer_id: PeerId, callback: impl FnOnce(Result<(), HostError>) + 'static) {
        let pairing = self.state.with(|state| {
            state
                .connection_by_peer(peer_id)
                .map(|connection| connection.pairing.clone())
        });

        match pairing {
            Some(pairing) => pairing.borrow_mut().initiate(Box::new(callback)),
            None => callback(Err(HostError::NotFound)),
        }
    }

    /// Open an L2CAP channel to a connected peer
    ///
    /// `security` is raised on the link first when it is above the link's current level.
    pub fn open_l2cap_channel(
        &self,
        peer_id: PeerId,
        psm: Psm,
        security: SecurityLevel,
        params: ChannelParameters,
        callback: impl FnOnce(Result<Channel, HostError>) + 'static,
    ) {
        let connection = self.state.with(|state| {
            state
                .connection_by_peer(peer_id)
                .map(|connection| (connection.handle, connection.security_level, connection.pairing.clone()))
        });

        let Some((handle, current_level, pairing)) = connection else {
            callback(Err(HostError::NotFound));

            return;
        };

        let l2cap = self.state.with(|state| state.l2cap.clone());

        let callback: Box<dyn FnOnce(Result<Channel, HostError>)> = Box::new(callback);

        if current_level.satisfies(security) || security == SecurityLevel::NoSecurity {
            open_channel_now(l2cap, handle, psm, params, callback);
        } else {
            pairing.borrow_mut().initiate(Box::new(move |result| match result {
                Ok(()) => open_channel_now(l2cap, handle, psm, params, callback),
                Err(error) => callback(Err(error)),
            }));
        }
    }

    /// Register a service: its SDP records plus the PSM for inbound channels
    pub fn register_service(
        &self,
        psm: Psm,
        params: ChannelParameters,
        records: Vec<ServiceRecord>,
        channel_callback: impl Fn(Channel) + 'static,
    ) -> Option<ServiceRecordHandle> {
        let (l2cap, sdp) = self
            .state
            .with(|state| (state.l2cap.clone(), state.sdp.clone()));

        if !l2cap.register_service(psm, params, channel_callback) {
            return None;
        }

        sdp.register_service(records)
    }

    /// Change the security mode
    ///
    /// Entering `SecureConnectionsOnly` disconnects every connection below
    /// `AuthenticatedSecureConnections`.
    pub fn set_security_mode(&self, mode: BrEdrSecurityMode) {
        let weak = self.state.downgrade();

        let to_disconnect: Vec<ConnectionHandle> = self.state.with_mut(|state| {
            state.settings.security_mode = mode;

            if mode != BrEdrSecurityMode::SecureConnectionsOnly {
                return Vec::new();
            }

            state
                .connections
                .values()
                .filter(|connection| {
                    !connection
                        .security_level
                        .satisfies(SecurityLevel::AuthenticatedSecureConnections)
                })
                .map(|connection| connection.handle)
                .collect()
        });

        for handle in to_disconnect {
            log::info!(
                "(GAP) disconnecting handle {} below the secure connections only level",
                handle
            );

            disconnect_handle(&weak, handle, DisconnectReason::PairingFailed);
        }
    }

    /// Get the handle of a connected peer
    pub fn find_connection(&self, peer_id: PeerId) -> Option<ConnectionHandle> {
        self.state.with(|state| {
            state
                .connection_by_peer(peer_id)
                .filter(|connection| connection.state == ConnState::Connected)
                .map(|connection| connection.handle)
        })
    }

    /// Get the role of a peer's connection
    pub fn connection_role(&self, peer_id: PeerId) -> Option<Role> {
        self.state.with(|state| {
            state
                .connection_by_peer(peer_id)
                .map(|connection| connection.role)
        })
    }

    /// Get the security level of a peer's connection
    pub fn security_level(&self, peer_id: PeerId) -> Option<SecurityLevel> {
        self.state.with(|state| {
            state
                .connection_by_peer(peer_id)
                .map(|connection| connection.security_level)
        })
    }

    /// Count of outgoing connection requests accepted by [`connect`](Self::connect)
    pub fn outgoing_connection_request_count(&self) -> u64 {
        self.state
            .with(|state| state.counters.outgoing_connection_requests)
    }

    /// Count of retries taken after 0x3E failures
    pub fn connection_retry_count(&self) -> u64 {
        self.state.with(|state| state.counters.connection_retries)
    }

    /// Check if an address is on the cooldown denylist
    pub fn is_on_cooldown(&self, address: BluetoothDeviceAddress) -> bool {
        self.state.with(|state| state.cooldown.contains(&address))
    }
}

impl Drop for BrEdrConnectionManager {
    fn drop(&mut self) {
        for id in self.handlers.drain(..) {
            self.command_channel.remove_event_handler(id);
        }
    }
}

fn open_channel_now(
    l2cap: ChannelManager,
    handle: ConnectionHandle,
    psm: Psm,
    params: ChannelParameters,
    callback: Box<dyn FnOnce(Result<Channel, HostError>)>,
) {
    l2cap.open_channel(handle, psm, params, move |result| {
        callback(result.map_err(|error| match error {
            bluejay_l2cap::ChannelError::ResponseTimeout => HostError::Timeout,
            bluejay_l2cap::ChannelError::Refused => HostError::NotSupported,
            _ => HostError::NotFound,
        }));
    });
}

/// Issue the next queued Create Connection when none is in flight
fn start_next_request(weak: &WeakRef<ManagerState>) {
    let command = weak.with_mut(|state| {
        if state.pending.is_some() {
            return None;
        }

        let request = state.queued.pop_front()?;

        let peer = state.cache.find_by_id(request.peer_id);

        let (page_scan_repetition_mode, clock_offset) = peer
            .map(|peer| (peer.page_scan_repetition_mode.unwrap_or(0x01), peer.clock_offset))
            .unwrap_or((0x01, None));

        let address = request.address;

        let manager = state.weak.clone();

        let timeout = state.dispatcher.post_after(CONNECT_TIMEOUT, move || {
            on_connect_timeout(&manager, address);
        });

        state.pending = Some(OutboundRequest {
            peer_id: request.peer_id,
            address,
            attempts: 1,
            callbacks: request.callbacks,
            timeout,
            timed_out: false,
        });

        log::info!("(GAP) creating connection to {}", address);

        Some(
            CreateConnection {
                address,
                packet_types: DEFAULT_ACL_PACKET_TYPES,
                page_scan_repetition_mode,
                clock_offset,
                allow_role_switch: true,
            }
            .into_packet(),
        )
    });

    let Some(Some(command)) = command else { return };

    let (command_channel, manager) = match weak.with(|state| (state.command_channel.clone(), state.weak.clone())) {
        Some(pair) => pair,
        None => return,
    };

    command_channel.send_command_expect_status(
        command,
        Box::new(move |result| {
            if let Err(error) = result {
                fail_pending(&manager, error);
            }
        }),
    );
}

fn on_connect_timeout(weak: &WeakRef<ManagerState>, address: BluetoothDeviceAddress) {
    let cancel = weak.with_mut(|state| match state.pending.as_mut() {
        Some(pending) if pending.address == address => {
            pending.timed_out = true;

            Some(state.command_channel.clone())
        }
        _ => None,
    });

    if let Some(Some(command_channel)) = cancel {
        log::warn!("(GAP) connection attempt to {} timed out", address);

        // the synthetic connection complete that follows carries the failure
        command_channel.send_command(
            CreateConnectionCancel { address }.into_packet(),
            Box::new(|_| ()),
        );
    }
}

/// Fail every callback of the pending request and move on
fn fail_pending(weak: &WeakRef<ManagerState>, error: HostError) {
    let callbacks = weak.with_mut(|state| {
        state.pending.take().map(|pending| {
            state.dispatcher.cancel(pending.timeout);

            pending.callbacks
        })
    });

    if let Some(Some(callbacks)) = callbacks {
        for callback in callbacks {
            callback(Err(error));
        }
    }

    start_next_request(weak);
}

fn on_event(weak: &WeakRef<ManagerState>, data: &EventsData) {
    match data {
        EventsData::ConnectionRequest(request) => match request.link_type {
            LinkType::AclConnection => on_acl_connection_request(weak, request.address),
            LinkType::ScoConnection | LinkType::EscoConnection => {
                on_sco_connection_request(weak, request.address)
            }
            LinkType::Unknown(raw) => {
                on_unknown_connection_request(weak, request.address, raw)
            }
        },
        EventsData::ConnectionComplete(complete) => on_connection_complete(weak, complete),
        EventsData::DisconnectionComplete(complete) => on_disconnection_complete(weak, complete),
        EventsData::RoleChange(change) => on_role_change(weak, change),
        EventsData::SynchronousConnectionComplete(complete) => {
            on_synchronous_connection_complete(weak, complete)
        }
        EventsData::PinCodeRequest(request) => on_pin_code_request(weak, request.address),
        other => route_pairing_event(weak, other),
    }
}

fn on_acl_connection_request(weak: &WeakRef<ManagerState>, address: BluetoothDeviceAddress) {
    enum Verdict {
        Reject(Error),
        Accept,
    }

    let decision = weak.with_mut(|state| {
        if state.cooldown.contains(&address) {
            log::info!("(GAP) rejecting {} during its disconnect cooldown", address);

            return Verdict::Reject(Error::ConnectionRejectedUnacceptableBdAddr);
        }

        if state.connection_by_address(&address).is_some() {
            return Verdict::Reject(Error::ConnectionAlreadyExists);
        }

        if !state.inbound.insert(address) {
            return Verdict::Reject(Error::ConnectionRejectedLimitedResources);
        }

        Verdict::Accept
    });

    let Some(decision) = decision else { return };

    let Some(command_channel) = weak.with(|state| state.command_channel.clone()) else { return };

    match decision {
        Verdict::Accept => {
            // prefer becoming central
            command_channel.send_command_expect_status(
                AcceptConnectionRequest {
                    address,
                    role: Role::Central,
                }
                .into_packet(),
                Box::new(|_| ()),
            );
        }
        Verdict::Reject(reason) => {
            command_channel.send_command_expect_status(
                RejectConnectionRequest { address, reason }.into_packet(),
                Box::new(|_| ()),
            );
        }
    }
}

/// Reject a request for a link type this host does not do
fn on_unknown_connection_request(
    weak: &WeakRef<ManagerState>,
    address: BluetoothDeviceAddress,
    raw_link_type: u8,
) {
    log::warn!(
        "(GAP) rejecting connection request from {} with unknown link type {:#04x}",
        address,
        raw_link_type
    );

    let Some(command_channel) = weak.with(|state| state.command_channel.clone()) else { return };

    command_channel.send_command_expect_status(
        RejectConnectionRequest {
            address,
            reason: Error::UnsupportedFeatureOrParameter,
        }
        .into_packet(),
        Box::new(|_| ()),
    );
}

fn on_sco_connection_request(weak: &WeakRef<ManagerState>, address: BluetoothDeviceAddress) {
    let connected = weak
        .with_mut(|state| state.connection_by_address(&address).is_some())
        .unwrap_or(false);

    let Some(command_channel) = weak.with(|state| state.command_channel.clone()) else { return };

    if connected {
        command_channel.send_command_expect_status(
            AcceptSynchronousConnectionRequest::new_cvsd(address).into_packet(),
            Box::new(|_| ()),
        );
    } else {
        command_channel.send_command_expect_status(
            RejectSynchronousConnectionRequest {
                address,
                reason: Error::ConnectionRejectedUnacceptableBdAddr,
            }
            .into_packet(),
            Box::new(|_| ()),
        );
    }
}

fn on_role_change(weak: &WeakRef<ManagerState>, change: &bluejay_hci::events::RoleChangeData) {
    if change.status.into_result().is_err() {
        return;
    }

    weak.with_mut(|state| {
        // the role change may precede the connection complete event
        match state.connection_by_address(&change.address) {
            Some(connection) => connection.role = change.new_role,
            None => {
                state.early_role_changes.insert(change.address, change.new_role);
            }
        }
    });
}

fn on_connection_complete(
    weak: &WeakRef<ManagerState>,
    complete: &bluejay_hci::events::ConnectionCompleteData,
) {
    if complete.link_type != LinkType::AclConnection {
        return;
    }

    let address = complete.address;

    match complete.status.into_result() {
        Err(failure) => on_connection_failed(weak, address, failure),
        Ok(()) => {
            let Some(handle) = complete.connection_handle else { return };

            establish_connection(weak, address, handle);
        }
    }
}

fn on_connection_failed(weak: &WeakRef<ManagerState>, address: BluetoothDeviceAddress, failure: Error) {
    enum Next {
        Retry(bluejay_hci::commands::CommandPacket),
        Fail(HostError),
        NotOurs,
    }

    let next = weak.with_mut(|state| {
        state.inbound.remove(&address);

        let Some(pending) = state.pending.as_mut() else { return Next::NotOurs };

        if pending.address != address {
            return Next::NotOurs;
        }

        let only_request = state.queued.is_empty();

        if failure == Error::ConnectionFailedToBeEstablished
            && only_request
            && !pending.timed_out
            && pending.attempts < MAX_CONNECTION_ATTEMPTS
        {
            pending.attempts += 1;

            state.counters.connection_retries += 1;

            log::info!(
                "(GAP) connection to {} failed to be established, attempt {} of {}",
                address,
                pending.attempts,
                MAX_CONNECTION_ATTEMPTS
            );

            let peer = state.cache.find_by_address(&DeviceAddress::bredr(address));

            let (page_scan_repetition_mode, clock_offset) = peer
                .map(|peer| (peer.page_scan_repetition_mode.unwrap_or(0x01), peer.clock_offset))
                .unwrap_or((0x01, None));

            return Next::Retry(
                CreateConnection {
                    address,
                    packet_types: DEFAULT_ACL_PACKET_TYPES,
                    page_scan_repetition_mode,
                    clock_offset,
                    allow_role_switch: true,
                }
                .into_packet(),
            );
        }

        let error = if pending.timed_out {
            HostError::Timeout
        } else {
            HostError::Protocol(failure)
        };

        Next::Fail(error)
    });

    let Some(next) = next else { return };

    match next {
        Next::NotOurs => {
            log::info!("(GAP) inbound connection from {} failed: {}", address, failure);
        }
        Next::Retry(command) => {
            let manager = weak.clone();

            if let Some(command_channel) = weak.with(|state| state.command_channel.clone()) {
                command_channel.send_command_expect_status(
                    command,
                    Box::new(move |result| {
                        if let Err(error) = result {
                            fail_pending(&manager, error);
                        }
                    }),
                );
            }
        }
        Next::Fail(error) => fail_pending(weak, error),
    }
}

fn establish_connection(
    weak: &WeakRef<ManagerState>,
    address: BluetoothDeviceAddress,
    handle: ConnectionHandle,
) {
    let setup = weak.with_mut(|state| {
        state.inbound.remove(&address);

        let from_pending = state
            .pending
            .as_ref()
            .map(|pending| pending.address == address)
            .unwrap_or(false);

        let (callbacks, role_default) = if from_pending {
            let pending = state.pending.take().unwrap();

            state.dispatcher.cancel(pending.timeout);

            (pending.callbacks, Role::Central)
        } else {
            (Vec::new(), Role::Peripheral)
        };

        // consume a role change that beat the connection complete event
        let role = state.early_role_changes.remove(&address).unwrap_or(role_default);

        let peer_id = state.cache.update_peer(DeviceAddress::bredr(address), |peer| {
            peer.bredr_state = ConnectionState::Initializing;
        });

        let legacy_in_progress = state.preconnect_legacy.remove(&address);

        let manager = state.weak.clone();

        let timeout_handler: Rc<dyn Fn()> = Rc::new(move || {
            log::warn!("(GAP) pairing with {} timed out", address);

            if let Some(Some(handle)) = manager.with_mut(|state| {
                state
                    .connection_by_address(&address)
                    .map(|connection| connection.handle)
            }) {
                disconnect_handle(&manager, handle, DisconnectReason::PairingFailed);
            }
        });

        let pairing = Rc::new(RefCell::new(PairingStateManager::new(
            state.command_channel.clone(),
            state.dispatcher.clone(),
            state.cache.clone(),
            state.settings.delegate.clone(),
            peer_id,
            address,
            handle,
            state.settings.local_iocap,
            state.settings.security_mode,
            legacy_in_progress,
            timeout_handler,
        )));

        // pairing outcomes feed the connection's security level
        let manager = state.weak.clone();

        pairing
            .borrow_mut()
            .set_completion_listener(Box::new(move |result| {
                manager.with_mut(|state| {
                    if let Some(connection) = state.connection_by_address(&address) {
                        connection.security_level = match result {
                            Ok((_key, level)) => level,
                            Err(_) => SecurityLevel::NoSecurity,
                        };
                    }
                });
            }));

        state.connections.insert(
            handle.get_raw_handle(),
            Connection {
                handle,
                address,
                peer_id,
                role,
                state: ConnState::Interrogating,
                security_level: SecurityLevel::NoSecurity,
                pairing,
                interrogator: None,
                waiters: callbacks,
                sco_handle: None,
            },
        );

        Some(role)
    });

    let Some(Some(role)) = setup else { return };

    log::info!(
        "(GAP) ACL connection to {} on handle {} as {}",
        address,
        handle,
        role
    );

    // install the link into L2CAP with hooks back into this manager
    let (l2cap, command_channel) = match weak.with(|state| (state.l2cap.clone(), state.command_channel.clone()))
    {
        Some(pair) => pair,
        None => return,
    };

    let error_manager = weak.clone();
    let security_manager = weak.clone();

    l2cap.register_link(
        handle,
        bluejay_l2cap::LinkKind::AclU,
        LinkHooks {
            error: Box::new(move || {
                disconnect_handle(&error_manager, handle, DisconnectReason::LinkError);
            }),
            security: Box::new(move |level, callback| {
                upgrade_link_security(&security_manager, handle, level, callback);
            }),
            acl_priority: None,
        },
    );

    // interrogate before anything completes
    let interrogation_manager = weak.clone();

    let interrogator = Interrogator::start(
        command_channel,
        handle,
        Box::new(move |result| {
            on_interrogation_complete(&interrogation_manager, handle, result);
        }),
    );

    weak.with_mut(|state| {
        if let Some(connection) = state.connections.get_mut(&handle.get_raw_handle()) {
            connection.interrogator = Some(interrogator);
        }
    });

    // a new Create Connection may start now that the Controller is done with this one
    start_next_request(weak);
}

fn on_interrogation_complete(
    weak: &WeakRef<ManagerState>,
    handle: ConnectionHandle,
    result: Result<crate::bredr::InterrogationResult, HostError>,
) {
    match result {
        Ok(interrogation) => {
            let waiters = weak.with_mut(|state| {
                let connection = state.connections.get_mut(&handle.get_raw_handle())?;

                connection.state = ConnState::Connected;
                connection.interrogator = None;

                let peer_id = connection.peer_id;
                let waiters = core::mem::take(&mut connection.waiters);

                state.cache.with_peer(peer_id, |peer| {
                    peer.bredr_state = ConnectionState::Connected;
                });

                log::info!(
                    "(GAP) interrogation of handle {} complete (LMP version {})",
                    handle,
                    interrogation.lmp_version
                );

                Some(waiters)
            });

            if let Some(Some(waiters)) = waiters {
                for waiter in waiters {
                    waiter(Ok(handle));
                }
            }
        }
        Err(error) => {
            log::warn!("(GAP) interrogation of handle {} failed: {}", handle, error);

            let waiters = weak.with_mut(|state| {
                state
                    .connections
                    .get_mut(&handle.get_raw_handle())
                    .map(|connection| core::mem::take(&mut connection.waiters))
            });

            if let Some(Some(waiters)) = waiters {
                for waiter in waiters {
                    waiter(Err(error));
                }
            }

            disconnect_handle(weak, handle, DisconnectReason::InterrogationFailed);
        }
    }
}

fn disconnect_handle(weak: &WeakRef<ManagerState>, handle: ConnectionHandle, reason: DisconnectReason) {
    let command = weak.with_mut(|state| {
        let connection = state.connections.get_mut(&handle.get_raw_handle())?;

        if connection.state == ConnState::Disconnecting {
            return None;
        }

        connection.state = ConnState::Disconnecting;

        // a dying link has no use for the rest of its interrogation
        if let Some(interrogator) = connection.interrogator.take() {
            interrogator.cancel();
        }

        if reason == DisconnectReason::ApiRequest {
            let address = connection.address;

            state.cooldown.insert(address);

            let manager = state.weak.clone();

            state.dispatcher.post_after(LOCAL_DISCONNECT_COOLDOWN, move || {
                manager.with_mut(|state| state.cooldown.remove(&address));
            });
        }

        log::info!("(GAP) disconnecting handle {} ({:?})", handle, reason);

        Some(
            Disconnect {
                connection_handle: handle,
                reason: Error::RemoteUserTerminatedConnection,
            }
            .into_packet(),
        )
    });

    if let Some(Some(command)) = command {
        if let Some(command_channel) = weak.with(|state| state.command_channel.clone()) {
            command_channel.send_command_expect_status(command, Box::new(|_| ()));
        }
    }
}

fn on_disconnection_complete(
    weak: &WeakRef<ManagerState>,
    complete: &bluejay_hci::events::DisconnectionCompleteData,
) {
    let Some(handle) = complete.connection_handle else { return };

    let cleanup = weak.with_mut(|state| {
        let connection = state.connections.remove(&handle.get_raw_handle())?;

        Some((
            connection.peer_id,
            connection.address,
            connection.waiters,
            connection.sco_handle,
            state.l2cap.clone(),
            state.sco.clone(),
        ))
    });

    let Some(Some((peer_id, address, waiters, sco_handle, l2cap, sco))) = cleanup else {
        return;
    };

    log::info!(
        "(GAP) handle {} to {} disconnected ({})",
        handle,
        address,
        complete.reason
    );

    l2cap.remove_link(handle);

    if let Some(sco_handle) = sco_handle {
        sco.unregister_link(sco_handle);
    }

    weak.with_mut(|state| {
        state.cache.with_peer(peer_id, |peer| {
            peer.bredr_state = ConnectionState::NotConnected;
        });
    });

    for waiter in waiters {
        waiter(Err(HostError::LinkError));
    }
}

fn on_synchronous_connection_complete(
    weak: &WeakRef<ManagerState>,
    complete: &bluejay_hci::events::SynchronousConnectionCompleteData,
) {
    if complete.status.into_result().is_err() {
        return;
    }

    let Some(sco_handle) = complete.connection_handle else { return };

    let address = complete.address;

    let sco = weak.with_mut(|state| {
        let connection = state.connection_by_address(&address)?;

        connection.sco_handle = Some(sco_handle);

        Some(state.sco.clone())
    });

    if let Some(Some(sco)) = sco {
        log::info!("(GAP) SCO link {} up with {}", sco_handle, address);

        sco.register_link(
            sco_handle,
            Box::new(move |packet| {
                log::trace!("(GAP) SCO data, {} bytes", packet.len());
            }),
        );
    }
}

fn on_pin_code_request(weak: &WeakRef<ManagerState>, address: BluetoothDeviceAddress) {
    // legacy pairing may start before the connection complete event; keep pre-connection state
    let pairing = weak.with_mut(|state| match state.connection_by_address(&address) {
        Some(connection) => Some(connection.pairing.clone()),
        None => {
            state.preconnect_legacy.insert(address);

            None
        }
    });

    match pairing {
        Some(Some(pairing)) => pairing.borrow_mut().on_pin_code_request(),
        Some(None) => {
            // no connection yet: answer the PIN through the delegate directly
            let resources = weak.with(|state| {
                (
                    state.settings.delegate.clone(),
                    state.command_channel.clone(),
                    state
                        .cache
                        .update_peer(DeviceAddress::bredr(address), |_| ()),
                )
            });

            let Some((delegate, command_channel, peer_id)) = resources else { return };

            delegate.request_pin_code(
                peer_id,
                Box::new(move |pin| match pin {
                    Some(pin_code) if (1..=16).contains(&pin_code.len()) => command_channel
                        .send_command(
                            bluejay_hci::commands::link_control::PinCodeRequestReply {
                                address,
                                pin_code,
                            }
                            .into_packet(),
                            Box::new(|_| ()),
                        ),
                    _ => command_channel.send_command(
                        bluejay_hci::commands::link_control::PinCodeRequestNegativeReply { address }
                            .into_packet(),
                        Box::new(|_| ()),
                    ),
                }),
            );
        }
        None => {}
    }
}

fn route_pairing_event(weak: &WeakRef<ManagerState>, data: &EventsData) {
    let address = match data {
        EventsData::IoCapabilityRequest(event) => event.address,
        EventsData::IoCapabilityResponse(event) => event.address,
        EventsData::UserConfirmationRequest(event) => event.address,
        EventsData::UserPasskeyRequest(event) => event.address,
        EventsData::UserPasskeyNotification(event) => event.address,
        EventsData::LinkKeyRequest(event) => event.address,
        EventsData::LinkKeyNotification(event) => event.address,
        EventsData::SimplePairingComplete(event) => event.address,
        EventsData::AuthenticationComplete(event) => {
            let handle = event.connection_handle;

            let routed = weak.with(|state| {
                handle.and_then(|handle| {
                    state
                        .connections
                        .get(&handle.get_raw_handle())
                        .map(|connection| connection.pairing.clone())
                })
            });

            if let Some(Some(pairing)) = routed {
                pairing.borrow_mut().on_authentication_complete(event.status);
            }

            return;
        }
        EventsData::EncryptionChange(event) => {
            let handle = event.connection_handle;

            let routed = weak.with(|state| {
                handle.and_then(|handle| {
                    state
                        .connections
                        .get(&handle.get_raw_handle())
                        .map(|connection| connection.pairing.clone())
                })
            });

            if let Some(Some(pairing)) = routed {
                pairing
                    .borrow_mut()
                    .on_encryption_change(event.status, event.encryption_enabled);
            }

            return;
        }
        _ => return,
    };

    let pairing = weak.with_mut(|state| {
        state
            .connection_by_address(&address)
            .map(|connection| connection.pairing.clone())
    });

    let Some(Some(pairing)) = pairing else { return };

    let mut pairing = pairing.borrow_mut();

    match data {
        EventsData::IoCapabilityRequest(_) => pairing.on_io_capability_request(),
        EventsData::IoCapabilityResponse(event) => pairing.on_io_capability_response(event),
        EventsData::UserConfirmationRequest(event) => {
            pairing.on_user_confirmation_request(event.numeric_value)
        }
        EventsData::UserPasskeyRequest(_) => pairing.on_user_passkey_request(),
        EventsData::UserPasskeyNotification(event) => {
            pairing.on_user_passkey_notification(event.passkey)
        }
        EventsData::LinkKeyRequest(_) => pairing.on_link_key_request(),
        EventsData::LinkKeyNotification(event) => {
            pairing.on_link_key_notification(event.link_key, event.key_type)
        }
        EventsData::SimplePairingComplete(event) => {
            pairing.on_simple_pairing_complete(event.status)
        }
        _ => {}
    }
}

/// Raise the security of a link on behalf of an L2CAP channel
fn upgrade_link_security(
    weak: &WeakRef<ManagerState>,
    handle: ConnectionHandle,
    level: SecurityLevel,
    callback: Box<dyn FnOnce(Result<(), HostError>)>,
) {
    let current = weak.with(|state| {
        state
            .connections
            .get(&handle.get_raw_handle())
            .map(|connection| (connection.security_level, connection.pairing.clone()))
    });

    match current {
        Some(Some((current_level, pairing))) => {
            if current_level.satisfies(level) {
                callback(Ok(()));
            } else {
                pairing.borrow_mut().initiate(callback);
            }
        }
        _ => callback(Err(HostError::NotFound)),
    }
}
