//! The logical link
//!
//! A logical link binds one ACL connection handle to its set of channels and its signaling
//! channel. It owns the receive side recombiner, routes completed PDUs to channels by their
//! identifier, and drains the channels' transmit queues into the ACL data channel whenever the
//! scheduler reports room.

use crate::channel::{self, ChannelState};
use crate::channel_id::{AclCid, ChannelIdentifier, LeCid};
use crate::fragmenter::fragment_pdu;
use crate::pdu::BasicFrame;
use crate::recombiner::Recombiner;
use crate::signaling::{self, ConnectionParameterUpdate, SignalingState};
use crate::{AclPriority, ChannelMode, ChannelParameters, LinkKind, DEFAULT_MAX_TX_QUEUED, LE_MIN_MTU};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use bluejay_core::dispatch::Dispatcher;
use bluejay_core::errors::HostError;
use bluejay_core::security::SecurityLevel;
use bluejay_hci::command_channel::CommandChannel;
use bluejay_hci::commands::controller_baseband::WriteAutomaticFlushTimeout;
use bluejay_hci::commands::CommandParameter;
use bluejay_hci::data::AclDataChannel;
use bluejay_hci::{ConnectionHandle, HciAclData};
use core::cell::RefCell;
use core::time::Duration;

/// Callbacks a logical link makes into its owner
pub struct LinkHooks {
    /// The link is unusable; the owner is expected to disconnect it
    pub error: Box<dyn FnMut()>,
    /// Forwarded from [`Channel::upgrade_security`](crate::Channel::upgrade_security)
    pub security: Box<dyn FnMut(SecurityLevel, Box<dyn FnOnce(Result<(), HostError>)>)>,
    /// Forwarded from [`Channel::request_acl_priority`](crate::Channel::request_acl_priority);
    /// `None` when the Controller has no such vendor extension
    pub acl_priority: Option<Box<dyn FnMut(AclPriority, Box<dyn FnOnce(Result<(), HostError>)>)>>,
}

pub(crate) struct LinkState {
    pub(crate) handle: ConnectionHandle,
    pub(crate) kind: LinkKind,
    pub(crate) max_acl_payload: usize,
    pub(crate) acl: AclDataChannel,
    pub(crate) command_channel: CommandChannel,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) channels: BTreeMap<u16, Rc<RefCell<ChannelState>>>,
    tx_rotation: VecDeque<u16>,
    recombiner: Recombiner,
    pub(crate) signaling: SignalingState,
    pub(crate) next_dynamic_cid: u16,
    pub(crate) hooks: LinkHooks,
    pub(crate) closed: bool,
    /// Looks up the parameters of a registered PSM service (installed by the channel manager)
    pub(crate) service_query: Option<Rc<dyn Fn(u16) -> Option<ChannelParameters>>>,
    /// Hands an accepted inbound channel to its PSM service
    pub(crate) service_dispatch: Option<Rc<dyn Fn(u16, crate::Channel)>>,
    /// Decides LE connection parameter update requests from the peripheral
    pub(crate) parameter_update_handler: Option<Box<dyn FnMut(ConnectionParameterUpdate) -> bool>>,
}

impl LinkState {
    /// The signaling channel identifier of this link's kind
    pub(crate) fn signaling_cid(&self) -> u16 {
        match self.kind {
            LinkKind::AclU => AclCid::SignalingChannel.to_cid(),
            LinkKind::LeU => LeCid::LeSignalingChannel.to_cid(),
        }
    }

    /// Allocate an unused dynamic channel identifier
    pub(crate) fn allocate_dynamic_cid(&mut self) -> Option<u16> {
        let bounds = match self.kind {
            LinkKind::AclU => 0x0040..=0xFFFF,
            LinkKind::LeU => 0x0040..=0x007F,
        };

        for _ in 0..=(bounds.end() - bounds.start()) {
            let candidate = self.next_dynamic_cid;

            self.next_dynamic_cid = if candidate >= *bounds.end() {
                *bounds.start()
            } else {
                candidate + 1
            };

            if !self.channels.contains_key(&candidate) {
                return Some(candidate);
            }
        }

        None
    }
}

/// Create a logical link and its fixed channels
///
/// The fixed channels of the link kind exist from creation: the Attribute Protocol and Security
/// Manager channels on LE-U, the BR/EDR Security Manager channel on ACL-U. The signaling channel
/// is internal to the link.
pub(crate) fn new_link(
    handle: ConnectionHandle,
    kind: LinkKind,
    max_acl_payload: usize,
    acl: AclDataChannel,
    command_channel: CommandChannel,
    dispatcher: Dispatcher,
    hooks: LinkHooks,
) -> Rc<RefCell<LinkState>> {
    let link = Rc::new(RefCell::new(LinkState {
        handle,
        kind,
        max_acl_payload,
        acl,
        command_channel,
        dispatcher: dispatcher.clone(),
        channels: BTreeMap::new(),
        tx_rotation: VecDeque::new(),
        recombiner: Recombiner::new(),
        signaling: SignalingState::new(),
        next_dynamic_cid: 0x0040,
        hooks,
        closed: false,
        service_query: None,
        service_dispatch: None,
        parameter_update_handler: None,
    }));

    let fixed: &[(u16, u16)] = match kind {
        // (local cid, remote cid); fixed channels use the same value on both ends
        LinkKind::LeU => &[
            (LeCid::AttributeProtocol.to_cid(), LeCid::AttributeProtocol.to_cid()),
            (
                LeCid::SecurityManagerProtocol.to_cid(),
                LeCid::SecurityManagerProtocol.to_cid(),
            ),
        ],
        LinkKind::AclU => &[(
            AclCid::SecurityManagerChannel.to_cid(),
            AclCid::SecurityManagerChannel.to_cid(),
        )],
    };

    for (local_cid, remote_cid) in fixed {
        let mtu = match kind {
            LinkKind::LeU => LE_MIN_MTU,
            LinkKind::AclU => crate::DEFAULT_MTU,
        };

        let state = Rc::new(RefCell::new(ChannelState::new(
            *local_cid,
            *remote_cid,
            None,
            ChannelMode::Basic,
            mtu,
            mtu,
            DEFAULT_MAX_TX_QUEUED,
            None,
            dispatcher.clone(),
            Rc::downgrade(&link),
        )));

        add_channel(&link, state);
    }

    link
}

/// Install a channel into the link
pub(crate) fn add_channel(link: &Rc<RefCell<LinkState>>, state: Rc<RefCell<ChannelState>>) {
    let mut borrowed = link.borrow_mut();

    let local_cid = state.borrow().local_cid;

    borrowed.channels.insert(local_cid, state);
    borrowed.tx_rotation.push_back(local_cid);
}

/// Remove a channel from the link without touching the peer
pub(crate) fn take_channel(
    link: &Rc<RefCell<LinkState>>,
    local_cid: u16,
) -> Option<Rc<RefCell<ChannelState>>> {
    let mut borrowed = link.borrow_mut();

    borrowed.tx_rotation.retain(|cid| *cid != local_cid);

    borrowed.channels.remove(&local_cid)
}

/// Remove a channel from the link
///
/// A dynamic channel still connected is disconnected from the peer first.
pub(crate) fn remove_channel(link: &Rc<RefCell<LinkState>>, local_cid: u16) {
    let removed = take_channel(link, local_cid);

    if let Some(state) = removed {
        let (is_dynamic, remote_cid) = {
            let state = state.borrow();

            (state.psm.is_some(), state.remote_cid)
        };

        if is_dynamic && remote_cid != 0 && !link.borrow().closed {
            signaling::start_disconnect(link, local_cid, remote_cid);
        }

        channel::close(&state);
    }
}

/// Process one HCI ACL fragment received for this link
pub(crate) fn on_rx_fragment(link: &Rc<RefCell<LinkState>>, fragment: HciAclData) {
    let recombined = link.borrow_mut().recombiner.add_fragment(&fragment);

    match recombined {
        Ok(Some(pdu)) => route_pdu(link, pdu.channel, pdu.payload),
        Ok(None) => {}
        Err(error) => {
            log::warn!(
                "(L2CAP) link {}: {}",
                link.borrow().handle,
                error
            );

            on_link_error(link);
        }
    }
}

fn route_pdu(link: &Rc<RefCell<LinkState>>, raw_cid: u16, payload: Vec<u8>) {
    let (signaling_cid, kind) = {
        let state = link.borrow();

        (state.signaling_cid(), state.kind)
    };

    if raw_cid == signaling_cid {
        signaling::on_signaling_pdu(link, payload);

        return;
    }

    let valid = match kind {
        LinkKind::AclU => ChannelIdentifier::acl_try_from_raw(raw_cid).is_ok(),
        LinkKind::LeU => ChannelIdentifier::le_try_from_raw(raw_cid).is_ok(),
    };

    if !valid {
        log::warn!("(L2CAP) dropping PDU for invalid channel {:#06x}", raw_cid);

        return;
    }

    let channel = link.borrow().channels.get(&raw_cid).cloned();

    match channel {
        Some(channel) => channel::on_pdu(&channel, payload),
        None => log::warn!("(L2CAP) dropping PDU for unknown channel {:#06x}", raw_cid),
    }
}

/// Frame and fragment a PDU payload onto the wire
pub(crate) fn send_pdu(link: &Rc<RefCell<LinkState>>, remote_cid: u16, payload: Vec<u8>, flushable: bool) {
    let (handle, kind, max_acl_payload, acl, closed) = {
        let state = link.borrow();

        (
            state.handle,
            state.kind,
            state.max_acl_payload,
            state.acl.clone(),
            state.closed,
        )
    };

    if closed {
        return;
    }

    let channel_id = match kind {
        LinkKind::AclU => ChannelIdentifier::acl_try_from_raw(remote_cid),
        LinkKind::LeU => ChannelIdentifier::le_try_from_raw(remote_cid),
    };

    let Ok(channel_id) = channel_id else {
        log::warn!("(L2CAP) not sending PDU to invalid channel {:#06x}", remote_cid);

        return;
    };

    let pdu = BasicFrame::new(payload, channel_id).to_bytes();

    // flushable only applies to BR/EDR
    let flushable = flushable && kind == LinkKind::AclU;

    for fragment in fragment_pdu(handle, &pdu, max_acl_payload, flushable) {
        acl.send(fragment);
    }
}

/// Drain queued SDUs into the scheduler
///
/// Basic mode channels hand over one framed SDU whenever the scheduler has room for a PDU,
/// round robin across the link's channels. Enhanced Retransmission channels move SDUs into
/// their engine as the transmit window allows; the window bounds what reaches the scheduler.
pub(crate) fn flush(link: &Rc<RefCell<LinkState>>) {
    // ERTM first: the engines pace themselves with their window
    let ertm_channels: Vec<Rc<RefCell<ChannelState>>> = link
        .borrow()
        .channels
        .values()
        .filter(|channel| channel.borrow().mode == ChannelMode::EnhancedRetransmission)
        .cloned()
        .collect();

    for channel in ertm_channels {
        loop {
            let sdu = {
                let mut state = channel.borrow_mut();

                let engine_has_room = state
                    .engine
                    .as_ref()
                    .map(|engine| !engine.has_pending_segments())
                    .unwrap_or(false);

                if engine_has_room {
                    state.tx_queue.pop_front()
                } else {
                    None
                }
            };

            let Some(sdu) = sdu else { break };

            let actions = channel
                .borrow_mut()
                .engine
                .as_mut()
                .map(|engine| engine.queue_sdu(sdu))
                .unwrap_or_default();

            channel::run_ertm_actions(&channel, actions);
        }
    }

    // Basic mode: one PDU per scheduler slot, round robin
    loop {
        let (acl, handle) = {
            let state = link.borrow();

            (state.acl.clone(), state.handle)
        };

        if !acl.is_link_ready(handle) {
            break;
        }

        let next = {
            let mut state = link.borrow_mut();

            let mut found = None;

            for _ in 0..state.tx_rotation.len() {
                let cid = state.tx_rotation.pop_front().unwrap();

                state.tx_rotation.push_back(cid);

                let Some(channel) = state.channels.get(&cid) else { continue };

                let mut channel_state = channel.borrow_mut();

                if channel_state.mode != ChannelMode::Basic {
                    continue;
                }

                if let Some(sdu) = channel_state.tx_queue.pop_front() {
                    found = Some((
                        channel_state.remote_cid,
                        sdu,
                        channel_state.flush_timeout.is_some(),
                    ));

                    break;
                }
            }

            found
        };

        match next {
            Some((remote_cid, sdu, flushable)) => send_pdu(link, remote_cid, sdu, flushable),
            None => break,
        }
    }
}

/// Close the link without involving the owner
///
/// For links whose ACL connection is already gone; channels close quietly.
pub(crate) fn close_link(link: &Rc<RefCell<LinkState>>) {
    let channels = {
        let mut state = link.borrow_mut();

        if state.closed {
            return;
        }

        state.closed = true;

        state.recombiner.clear();

        core::mem::take(&mut state.channels)
    };

    for channel in channels.values() {
        channel::close(channel);
    }
}

/// Escalate a link failure
///
/// Closes every channel and asks the owner to disconnect the link.
pub(crate) fn on_link_error(link: &Rc<RefCell<LinkState>>) {
    let channels = {
        let mut state = link.borrow_mut();

        if state.closed {
            return;
        }

        state.closed = true;

        state.recombiner.clear();

        core::mem::take(&mut state.channels)
    };

    for channel in channels.values() {
        channel::close(channel);
    }

    let error = {
        let mut state = link.borrow_mut();

        core::mem::replace(&mut state.hooks.error, Box::new(|| ()))
    };

    let mut error = error;

    error();

    link.borrow_mut().hooks.error = error;
}

/// Forward a security upgrade request to the owner
pub(crate) fn request_security_upgrade(
    link: &Rc<RefCell<LinkState>>,
    level: SecurityLevel,
    callback: Box<dyn FnOnce(Result<(), HostError>)>,
) {
    let mut security = {
        let mut state = link.borrow_mut();

        core::mem::replace(&mut state.hooks.security, Box::new(|_, callback| {
            callback(Err(HostError::NotSupported))
        }))
    };

    security(level, callback);

    link.borrow_mut().hooks.security = security;
}

/// Forward an ACL priority request to the owner's vendor hook
pub(crate) fn request_acl_priority(
    link: &Rc<RefCell<LinkState>>,
    priority: AclPriority,
    callback: Box<dyn FnOnce(Result<(), HostError>)>,
) {
    let hook = link.borrow_mut().hooks.acl_priority.take();

    match hook {
        Some(mut hook) => {
            hook(priority, callback);

            let mut state = link.borrow_mut();

            if state.hooks.acl_priority.is_none() {
                state.hooks.acl_priority = Some(hook);
            }
        }
        None => callback(Err(HostError::NotSupported)),
    }
}

/// Write the automatic flush timeout of a BR/EDR link
pub(crate) fn write_flush_timeout(
    link: &Rc<RefCell<LinkState>>,
    channel: &Rc<RefCell<ChannelState>>,
    timeout: Duration,
    callback: Box<dyn FnOnce(Result<(), HostError>)>,
) {
    let (kind, handle, command_channel) = {
        let state = link.borrow();

        (state.kind, state.handle, state.command_channel.clone())
    };

    if kind != LinkKind::AclU {
        callback(Err(HostError::NotSupported));

        return;
    }

    // flush timeout is in baseband slots of 0.625 ms
    let slots = (timeout.as_millis() as u64 * 8 / 5).clamp(1, 0x07FF) as u16;

    let weak = Rc::downgrade(channel);

    command_channel.send_command(
        WriteAutomaticFlushTimeout {
            connection_handle: handle,
            flush_timeout: slots,
        }
        .into_packet(),
        Box::new(move |result| {
            let result = result.and_then(|response| {
                response.status().into_result().map_err(HostError::Protocol)
            });

            if result.is_ok() {
                if let Some(channel) = weak.upgrade() {
                    channel.borrow_mut().flush_timeout = Some(timeout);
                }
            }

            callback(result);
        }),
    );
}

/// Open a new channel handle for a fixed channel of the link
pub(crate) fn fixed_channel(link: &Rc<RefCell<LinkState>>, cid: u16) -> Option<crate::Channel> {
    link.borrow()
        .channels
        .get(&cid)
        .map(crate::channel::Channel::new)
}
