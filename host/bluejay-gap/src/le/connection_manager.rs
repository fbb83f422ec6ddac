//! The LE connection manager
//!
//! Runs the scan→connect→interrogate→pair pipeline for outbound connections, registers the
//! connections that arrive while advertising, and orchestrates the Security Manager
//! collaborator per link. One connector runs at a time; requests for other peers queue behind
//! it.

use crate::collaborators::{Gatt, SecurityManagerContext, SecurityManagerFactory, SecurityManager};
use crate::le::connector::LowEnergyConnector;
use crate::le::{LocalAddressManager, LowEnergyScanner};
use crate::peer::PeerCache;
use crate::{ConnectionState, DisconnectReason, IoCapability, LeSecurityMode, PeerId};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::vec::Vec;
use bluejay_core::dispatch::Dispatcher;
use bluejay_core::errors::{Error, HostError};
use bluejay_core::security::SecurityLevel;
use bluejay_core::weak::{Owner, WeakRef};
use bluejay_core::DeviceAddress;
use bluejay_hci::command_channel::{CommandChannel, HandlerAction, HandlerId};
use bluejay_hci::commands::le::{
    LongTermKeyRequestNegativeReply, LongTermKeyRequestReply, ReadRemoteFeatures,
};
use bluejay_hci::commands::link_control::{Disconnect, ReadRemoteVersionInformation};
use bluejay_hci::commands::CommandParameter;
use bluejay_hci::events::{Events, EventsData, LeMeta, Role};
use bluejay_hci::ConnectionHandle;
use bluejay_l2cap::logical_link::LinkHooks;
use bluejay_l2cap::{ChannelManager, LinkKind};
use core::cell::RefCell;
use core::time::Duration;

/// Inactivity budget of an LE pairing procedure
pub const LE_PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Total connector sequences before a drop during interrogation is surfaced
const MAX_ESTABLISHMENT_ATTEMPTS: u8 = 3;

type ConnectCallback = Box<dyn FnOnce(Result<ConnectionHandle, HostError>)>;

/// Options of one connection request
#[derive(Clone, Copy, Debug)]
pub struct ConnectionOptions {
    pub bondable: bool,
    /// Background connection: indefinite scan, no request timeout
    pub auto_connect: bool,
    /// Initiate with the identity address even when privacy is on
    pub use_identity_address: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            bondable: true,
            auto_connect: false,
            use_identity_address: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnState {
    Interrogating,
    Connected,
    Disconnecting,
}

struct LeConnection {
    handle: ConnectionHandle,
    peer_id: PeerId,
    address: DeviceAddress,
    role: Role,
    state: ConnState,
    security_manager: Rc<dyn SecurityManager>,
    /// Interrogation progress
    have_features: bool,
    have_version: bool,
    waiters: Vec<ConnectCallback>,
    /// Establishment attempts consumed, for the drop-during-interrogation retry
    attempts: u8,
    options: ConnectionOptions,
}

struct PendingRequest {
    peer_id: PeerId,
    address: DeviceAddress,
    options: ConnectionOptions,
    connector: LowEnergyConnector,
    callbacks: Vec<ConnectCallback>,
    attempts: u8,
}

struct QueuedRequest {
    peer_id: PeerId,
    address: DeviceAddress,
    options: ConnectionOptions,
    callbacks: Vec<ConnectCallback>,
}

struct ManagerState {
    command_channel: CommandChannel,
    l2cap: ChannelManager,
    cache: PeerCache,
    dispatcher: Dispatcher,
    scanner: LowEnergyScanner,
    address: LocalAddressManager,
    sm_factory: Rc<dyn SecurityManagerFactory>,
    gatt: Rc<dyn Gatt>,
    local_iocap: IoCapability,
    security_mode: LeSecurityMode,
    use_extended_commands: bool,
    connections: BTreeMap<u16, LeConnection>,
    pending: Option<PendingRequest>,
    queued: VecDeque<QueuedRequest>,
    weak: WeakRef<ManagerState>,
}

impl ManagerState {
    fn connection_by_peer(&self, peer_id: PeerId) -> Option<&LeConnection> {
        self.connections
            .values()
            .find(|connection| connection.peer_id == peer_id)
    }
}

/// The LE connection manager
pub struct LowEnergyConnectionManager {
    state: Owner<ManagerState>,
    command_channel: CommandChannel,
    handlers: Vec<HandlerId>,
}

impl LowEnergyConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command_channel: CommandChannel,
        l2cap: ChannelManager,
        cache: PeerCache,
        dispatcher: Dispatcher,
        scanner: LowEnergyScanner,
        address: LocalAddressManager,
        sm_factory: Rc<dyn SecurityManagerFactory>,
        gatt: Rc<dyn Gatt>,
        local_iocap: IoCapability,
        security_mode: LeSecurityMode,
        use_extended_commands: bool,
    ) -> Self {
        let state = Owner::new(ManagerState {
            command_channel: command_channel.clone(),
            l2cap,
            cache,
            dispatcher,
            scanner: scanner.clone(),
            address,
            sm_factory,
            gatt,
            local_iocap,
            security_mode,
            use_extended_commands,
            connections: BTreeMap::new(),
            pending: None,
            queued: VecDeque::new(),
            weak: WeakRef::new_dead(),
        });

        let weak = state.downgrade();

        state.with_mut(|manager| manager.weak = weak.clone());

        let mut manager = LowEnergyConnectionManager {
            state,
            command_channel: command_channel.clone(),
            handlers: Vec::new(),
        };

        manager.register_handlers();

        // directed connectable advertisements from bonded peers auto-connect
        let auto = manager.state.downgrade();

        scanner.set_directed_handler(move |peer_id| {
            auto.with(|state| {
                log::info!("(GAP) auto-connect to bonded peer {}", peer_id);
            });

            connect_inner(
                &auto,
                peer_id,
                ConnectionOptions {
                    auto_connect: true,
                    ..ConnectionOptions::default()
                },
                Box::new(move |result| {
                    if let Err(error) = result {
                        log::warn!("(GAP) auto-connect to {} failed: {}", peer_id, error);
                    }
                }),
            );
        });

        manager
    }

    fn register_handlers(&mut self) {
        let events = [
            Events::LeMeta(LeMeta::ConnectionComplete),
            Events::LeMeta(LeMeta::EnhancedConnectionComplete),
            Events::LeMeta(LeMeta::ReadRemoteFeaturesComplete),
            Events::LeMeta(LeMeta::LongTermKeyRequest),
            Events::ReadRemoteVersionInformationComplete,
            Events::DisconnectionComplete,
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

    /// Connect to a peer's LE transport
    pub fn connect(
        &self,
        peer_id: PeerId,
        options: ConnectionOptions,
        callback: impl FnOnce(Result<ConnectionHandle, HostError>) + 'static,
    ) {
        connect_inner(&self.state.downgrade(), peer_id, options, Box::new(callback));
    }

    /// Disconnect a peer
    pub fn disconnect(&self, peer_id: PeerId, reason: DisconnectReason) {
        let weak = self.state.downgrade();

        let handle = self
            .state
            .with(|state| state.connection_by_peer(peer_id).map(|connection| connection.handle));

        if let Some(handle) = handle {
            disconnect_handle(&weak, handle, reason);
        }
    }

    /// Cancel the connection attempt to a peer
    pub fn cancel_connect(&self, peer_id: PeerId) {
        enum Cancellation {
            InFlight(LowEnergyConnector),
            Queued(Vec<ConnectCallback>),
            None,
        }

        let cancellation = self.state.with_mut(|state| {
            if let Some(pending) = state.pending.as_ref() {
                if pending.peer_id == peer_id {
                    return Cancellation::InFlight(pending.connector.clone());
                }
            }

            if let Some(position) = state.queued.iter().position(|queued| queued.peer_id == peer_id) {
                let queued = state.queued.remove(position).unwrap();

                return Cancellation::Queued(queued.callbacks);
            }

            Cancellation::None
        });

        match cancellation {
            Cancellation::InFlight(connector) => connector.cancel(),
            Cancellation::Queued(callbacks) => {
                for callback in callbacks {
                    callback(Err(HostError::Canceled));
                }
            }
            Cancellation::None => {}
        }
    }

    /// Raise the security of a peer's link
    pub fn pair(
        &self,
        peer_id: PeerId,
        level: SecurityLevel,
        callback: impl FnOnce(Result<(), HostError>) + 'static,
    ) {
        let security_manager = self.state.with(|state| {
            state
                .connection_by_peer(peer_id)
                .map(|connection| (connection.handle, connection.security_manager.clone()))
        });

        let Some((handle, security_manager)) = security_manager else {
            callback(Err(HostError::NotFound));

            return;
        };

        // a pairing phase that stalls past its budget severs the link
        let guard = self.state.with(|state| {
            let manager = state.weak.clone();

            state.dispatcher.post_after(LE_PAIRING_TIMEOUT, move || {
                let live = manager
                    .with(|state| {
                        state
                            .connections
                            .get(&handle.get_raw_handle())
                            .map(|connection| connection.state == ConnState::Connected)
                            .unwrap_or(false)
                    })
                    .unwrap_or(false);

                if live {
                    log::warn!("(GAP) pairing on handle {} timed out", handle);

                    disconnect_handle(&manager, handle, DisconnectReason::PairingFailed);
                }
            })
        });

        let dispatcher = self.state.with(|state| state.dispatcher.clone());

        security_manager.upgrade_security(
            level,
            Box::new(move |result| {
                dispatcher.cancel(guard);

                callback(result.map(|_| ()));
            }),
        );
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
}

impl Drop for LowEnergyConnectionManager {
    fn drop(&mut self) {
        for id in self.handlers.drain(..) {
            self.command_channel.remove_event_handler(id);
        }
    }
}

fn connect_inner(
    weak: &WeakRef<ManagerState>,
    peer_id: PeerId,
    options: ConnectionOptions,
    callback: ConnectCallback,
) {
    let address = weak
        .with(|state| state.cache.find_by_id(peer_id))
        .flatten()
        .and_then(|peer| peer.le_address);

    let Some(address) = address else {
        callback(Err(HostError::NotFound));

        return;
    };

    let immediate = weak.with_mut(move |state| {
        if let Some(connection) = state
            .connections
            .values_mut()
            .find(|connection| connection.peer_id == peer_id)
        {
            return match connection.state {
                ConnState::Connected => Some((callback, connection.handle)),
                _ => {
                    connection.waiters.push(callback);

                    None
                }
            };
        }

        if let Some(pending) = state
            .pending
            .as_mut()
            .filter(|pending| pending.peer_id == peer_id)
        {
            pending.callbacks.push(callback);
        } else if let Some(queued) = state.queued.iter_mut().find(|queued| queued.peer_id == peer_id) {
            queued.callbacks.push(callback);
        } else {
            state.queued.push_back(QueuedRequest {
                peer_id,
                address,
                options,
                callbacks: alloc::vec![callback],
            });
        }

        None
    });

    if let Some(Some((callback, handle))) = immediate {
        callback(Ok(handle));

        return;
    }

    start_next_request(weak);
}

fn start_next_request(weak: &WeakRef<ManagerState>) {
    let started = weak.with_mut(|state| {
        if state.pending.is_some() {
            return false;
        }

        let Some(request) = state.queued.pop_front() else { return false };

        let manager = state.weak.clone();
        let peer_id = request.peer_id;

        let connector = LowEnergyConnector::start(
            state.command_channel.clone(),
            state.dispatcher.clone(),
            state.scanner.clone(),
            state.address.clone(),
            request.address,
            state.use_extended_commands,
            request.options.use_identity_address,
            request.options.auto_connect,
            Box::new(move |result| on_connector_done(&manager, peer_id, result)),
        );

        state.cache.with_peer(peer_id, |peer| {
            peer.le_state = ConnectionState::Initializing;
        });

        state.pending = Some(PendingRequest {
            peer_id,
            address: request.address,
            options: request.options,
            connector,
            callbacks: request.callbacks,
            attempts: 1,
        });

        true
    });

    if let Some(true) = started {
        log::trace!("(GAP) LE connector started");
    }
}

fn on_connector_done(
    weak: &WeakRef<ManagerState>,
    peer_id: PeerId,
    result: Result<ConnectionHandle, HostError>,
) {
    match result {
        Ok(handle) => establish_connection(weak, peer_id, handle),
        Err(error) => {
            let callbacks = weak.with_mut(|state| {
                let pending = state.pending.take()?;

                state.cache.with_peer(peer_id, |peer| {
                    peer.le_state = ConnectionState::NotConnected;
                });

                Some(pending.callbacks)
            });

            if let Some(Some(callbacks)) = callbacks {
                log::info!("(GAP) LE connection to {} failed: {}", peer_id, error);

                for callback in callbacks {
                    callback(Err(error));
                }
            }

            start_next_request(weak);
        }
    }
}

fn establish_connection(weak: &WeakRef<ManagerState>, peer_id: PeerId, handle: ConnectionHandle) {
    let setup = weak.with_mut(|state| {
        let pending = state.pending.take()?;

        let attempts = pending.connector.attempts().max(pending.attempts);

        Some((pending.address, pending.options, pending.callbacks, attempts))
    });

    let Some(Some((address, options, callbacks, attempts))) = setup else {
        // a connection with no pending request is an incoming (peripheral) connection and is
        // registered by the connection complete handler instead
        return;
    };

    register_connection(
        weak,
        peer_id,
        address,
        handle,
        Role::Central,
        options,
        callbacks,
        attempts,
    );

    start_next_request(weak);
}

#[allow(clippy::too_many_arguments)]
fn register_connection(
    weak: &WeakRef<ManagerState>,
    peer_id: PeerId,
    address: DeviceAddress,
    handle: ConnectionHandle,
    role: Role,
    options: ConnectionOptions,
    callbacks: Vec<ConnectCallback>,
    attempts: u8,
) {
    let resources = weak.with(|state| {
        (
            state.l2cap.clone(),
            state.command_channel.clone(),
            state.sm_factory.clone(),
            state.local_iocap,
            state.security_mode,
        )
    });

    let Some((l2cap, command_channel, sm_factory, local_iocap, security_mode)) = resources else {
        return;
    };

    log::info!(
        "(GAP) LE connection to peer {} on handle {} as {:?}",
        peer_id,
        handle,
        role
    );

    // the logical link and its fixed channels come first
    let error_manager = weak.clone();
    let security_weak = weak.clone();

    l2cap.register_link(
        handle,
        LinkKind::LeU,
        LinkHooks {
            error: Box::new(move || {
                disconnect_handle(&error_manager, handle, DisconnectReason::LinkError);
            }),
            security: Box::new(move |level, callback| {
                let security_manager = security_weak.with(|state| {
                    state
                        .connections
                        .get(&handle.get_raw_handle())
                        .map(|connection| connection.security_manager.clone())
                });

                match security_manager {
                    Some(Some(security_manager)) => security_manager
                        .upgrade_security(level, Box::new(move |result| callback(result.map(|_| ())))),
                    _ => callback(Err(HostError::NotFound)),
                }
            }),
            acl_priority: None,
        },
    );

    // the link registration above created the fixed channels
    let Some(smp_channel) = l2cap.open_le_smp_channel(handle) else {
        log::error!("(GAP) no security manager channel for handle {}", handle);

        disconnect_handle(weak, handle, DisconnectReason::LinkError);

        return;
    };

    let security_manager = sm_factory.create(SecurityManagerContext {
        peer: peer_id,
        smp_channel,
        io_capability: local_iocap,
        bondable: options.bondable,
        security_mode,
    });

    // distributed keys land in the peer cache
    {
        let cache = weak.with(|state| state.cache.clone());

        if let Some(cache) = cache {
            security_manager.set_new_ltk_callback(Box::new(move |ltk| {
                cache.store_bond(peer_id, |bond| bond.le_ltk = Some(ltk));
            }));
        }
    }

    weak.with_mut(|state| {
        state.connections.insert(
            handle.get_raw_handle(),
            LeConnection {
                handle,
                peer_id,
                address,
                role,
                state: ConnState::Interrogating,
                security_manager,
                have_features: false,
                have_version: false,
                waiters: callbacks,
                attempts,
                options,
            },
        );
    });

    // interrogation: remote LE features, then the version
    command_channel.send_command_expect_status(
        ReadRemoteFeatures {
            connection_handle: handle,
        }
        .into_packet(),
        Box::new(|_| ()),
    );

    command_channel.send_command_expect_status(
        ReadRemoteVersionInformation {
            connection_handle: handle,
        }
        .into_packet(),
        Box::new(|_| ()),
    );
}

fn on_event(weak: &WeakRef<ManagerState>, data: &EventsData) {
    match data {
        EventsData::LeConnectionComplete(complete) => on_connection_complete(weak, complete),
        EventsData::LeReadRemoteFeaturesComplete(complete) => {
            if let Some(handle) = complete.connection_handle {
                if complete.status.into_result().is_ok() {
                    interrogation_step(weak, handle, |connection| {
                        connection.have_features = true;
                    });
                } else {
                    interrogation_failed(weak, handle);
                }
            }
        }
        EventsData::ReadRemoteVersionInformationComplete(complete) => {
            if let Some(handle) = complete.connection_handle {
                // this event is shared with BR/EDR; only react to LE handles
                let ours = weak
                    .with(|state| state.connections.contains_key(&handle.get_raw_handle()))
                    .unwrap_or(false);

                if !ours {
                    return;
                }

                if complete.status.into_result().is_ok() {
                    interrogation_step(weak, handle, |connection| {
                        connection.have_version = true;
                    });
                } else {
                    interrogation_failed(weak, handle);
                }
            }
        }
        EventsData::LeLongTermKeyRequest(request) => on_long_term_key_request(weak, request),
        EventsData::DisconnectionComplete(complete) => on_disconnection_complete(weak, complete),
        _ => {}
    }
}

fn on_connection_complete(
    weak: &WeakRef<ManagerState>,
    complete: &bluejay_hci::events::LeConnectionCompleteData,
) {
    // the in-flight connector consumes its own completion (including failures); its callback
    // re-enters this manager, so the handle comes out of the borrow first
    let connector = weak
        .with(|state| state.pending.as_ref().map(|pending| pending.connector.clone()))
        .flatten();

    let consumed = connector
        .map(|connector| connector.on_connection_complete(complete))
        .unwrap_or(false);

    if consumed {
        return;
    }

    if complete.status.into_result().is_err() {
        return;
    }

    let Some(handle) = complete.connection_handle else { return };

    if complete.role != Role::Peripheral {
        return;
    }

    // an incoming connection through the advertiser
    let address = DeviceAddress::new(complete.peer_address_kind, complete.peer_address);

    let peer_id = match weak.with(|state| {
        state.cache.update_peer(address, |peer| {
            peer.le_state = ConnectionState::Initializing;
        })
    }) {
        Some(peer_id) => peer_id,
        None => return,
    };

    register_connection(
        weak,
        peer_id,
        address,
        handle,
        Role::Peripheral,
        ConnectionOptions::default(),
        Vec::new(),
        1,
    );
}

fn interrogation_step(
    weak: &WeakRef<ManagerState>,
    handle: ConnectionHandle,
    mark: impl FnOnce(&mut LeConnection),
) {
    let done = weak.with_mut(|state| {
        let connection = state.connections.get_mut(&handle.get_raw_handle())?;

        mark(connection);

        if connection.have_features && connection.have_version && connection.state == ConnState::Interrogating
        {
            connection.state = ConnState::Connected;

            let peer_id = connection.peer_id;

            state.cache.with_peer(peer_id, |peer| {
                peer.le_state = ConnectionState::Connected;
            });

            Some(core::mem::take(&mut state.connections.get_mut(&handle.get_raw_handle()).unwrap().waiters))
        } else {
            None
        }
    });

    if let Some(Some(waiters)) = done {
        log::info!("(GAP) LE interrogation of handle {} complete", handle);

        // GATT learns about the connection once it is fully up
        let gatt = weak.with(|state| {
            (
                state.gatt.clone(),
                state.l2cap.clone(),
                state
                    .connections
                    .get(&handle.get_raw_handle())
                    .map(|connection| connection.peer_id),
            )
        });

        if let Some((gatt, l2cap, Some(peer_id))) = gatt {
            if let Some(att_channel) = l2cap.open_att_channel(handle) {
                gatt.add_connection(peer_id, att_channel);
            }
        }

        for waiter in waiters {
            waiter(Ok(handle));
        }
    }
}

fn interrogation_failed(weak: &WeakRef<ManagerState>, handle: ConnectionHandle) {
    let ours = weak
        .with(|state| state.connections.contains_key(&handle.get_raw_handle()))
        .unwrap_or(false);

    if !ours {
        return;
    }

    log::warn!("(GAP) LE interrogation of handle {} failed", handle);

    disconnect_handle(weak, handle, DisconnectReason::InterrogationFailed);
}

fn on_long_term_key_request(
    weak: &WeakRef<ManagerState>,
    request: &bluejay_hci::events::LeLongTermKeyRequestData,
) {
    let Some(handle) = request.connection_handle else { return };

    let reply = weak.with(|state| {
        let connection = state.connections.get(&handle.get_raw_handle())?;

        let bond = state
            .cache
            .find_by_id(connection.peer_id)
            .map(|peer| peer.bond)?;

        // the stored key must match the rand/ediv of the request
        bond.le_ltk.filter(|ltk| {
            ltk.rand == request.random_number && ltk.ediv == request.encrypted_diversifier
        })
    });

    let Some(command_channel) = weak.with(|state| state.command_channel.clone()) else { return };

    match reply {
        Some(Some(ltk)) => {
            command_channel.send_command(
                LongTermKeyRequestReply {
                    connection_handle: handle,
                    long_term_key: ltk.value,
                }
                .into_packet(),
                Box::new(|_| ()),
            );
        }
        _ => {
            command_channel.send_command(
                LongTermKeyRequestNegativeReply {
                    connection_handle: handle,
                }
                .into_packet(),
                Box::new(|_| ()),
            );
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

        log::info!("(GAP) disconnecting LE handle {} ({:?})", handle, reason);

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

    let removed = weak.with_mut(|state| state.connections.remove(&handle.get_raw_handle()));

    let Some(Some(connection)) = removed else { return };

    log::info!(
        "(GAP) LE handle {} to peer {} ({:?} role) disconnected ({})",
        handle,
        connection.peer_id,
        connection.role,
        complete.reason
    );

    let resources = weak.with(|state| (state.l2cap.clone(), state.gatt.clone(), state.cache.clone()));

    let Some((l2cap, gatt, cache)) = resources else { return };

    l2cap.remove_link(handle);

    gatt.remove_connection(connection.peer_id);

    cache.with_peer(connection.peer_id, |peer| {
        peer.le_state = ConnectionState::NotConnected;
    });

    // a drop mid-interrogation retries the whole establishment sequence
    let establishment_race = connection.state == ConnState::Interrogating
        && matches!(
            complete.reason,
            Error::ConnectionFailedToBeEstablished | Error::ConnectionTimeout
        );

    if establishment_race && connection.attempts < MAX_ESTABLISHMENT_ATTEMPTS {
        log::info!(
            "(GAP) handle {} dropped during interrogation; retrying (attempt {})",
            handle,
            connection.attempts + 1
        );

        weak.with_mut(|state| {
            state.queued.push_front(QueuedRequest {
                peer_id: connection.peer_id,
                address: connection.address,
                options: connection.options,
                callbacks: connection.waiters,
            });
        });

        // bump the attempt count when the request starts again
        let peer_id = connection.peer_id;
        let attempts = connection.attempts + 1;

        start_next_request(weak);

        weak.with_mut(|state| {
            if let Some(pending) = state.pending.as_mut().filter(|pending| pending.peer_id == peer_id) {
                pending.attempts = attempts;
            }
        });

        return;
    }

    for waiter in connection.waiters {
        waiter(Err(HostError::LinkError));
    }
}
