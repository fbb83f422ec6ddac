//! The L2CAP signaling channel
//!
//! Signaling commands ride the fixed channel 0x0001 of an ACL-U link and 0x0005 of an LE-U
//! link. This module implements the procedures this host takes part in: the dynamic channel
//! connection and configuration exchange, disconnection, echo, the information request, LE
//! connection parameter updates, and Command Reject for everything else.
//!
//! Every request carries a command identifier; a response with an identifier matching no
//! outstanding request is dropped with a warning. Outstanding requests are guarded by a
//! response timeout.
//!
//! # Specification Reference
//! See Bluetooth Specification V5 | Vol 3, Part A Section 4

use crate::channel::{self, Channel, ChannelState};
use crate::engines::{ErtmConfig, ErtmEngine, ERTM_MAX_TRANSMISSIONS, ERTM_TX_WINDOW};
use crate::logical_link::{self, LinkState};
use crate::{ChannelError, ChannelMode, ChannelParameters, LinkKind, Psm};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use bluejay_core::dispatch::TaskId;
use core::cell::RefCell;
use core::time::Duration;

/// Time allowed for the peer to answer a signaling request
pub const SIGNALING_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Codes of the signaling commands this host understands
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum SignalCode {
    CommandReject,
    ConnectionRequest,
    ConnectionResponse,
    ConfigurationRequest,
    ConfigurationResponse,
    DisconnectionRequest,
    DisconnectionResponse,
    EchoRequest,
    EchoResponse,
    InformationRequest,
    InformationResponse,
    ConnectionParameterUpdateRequest,
    ConnectionParameterUpdateResponse,
}

impl SignalCode {
    /// Get the raw code value of the signal
    pub fn into_code(self) -> u8 {
        match self {
            SignalCode::CommandReject => 0x01,
            SignalCode::ConnectionRequest => 0x02,
            SignalCode::ConnectionResponse => 0x03,
            SignalCode::ConfigurationRequest => 0x04,
            SignalCode::ConfigurationResponse => 0x05,
            SignalCode::DisconnectionRequest => 0x06,
            SignalCode::DisconnectionResponse => 0x07,
            SignalCode::EchoRequest => 0x08,
            SignalCode::EchoResponse => 0x09,
            SignalCode::InformationRequest => 0x0A,
            SignalCode::InformationResponse => 0x0B,
            SignalCode::ConnectionParameterUpdateRequest => 0x12,
            SignalCode::ConnectionParameterUpdateResponse => 0x13,
        }
    }

    fn try_from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(SignalCode::CommandReject),
            0x02 => Some(SignalCode::ConnectionRequest),
            0x03 => Some(SignalCode::ConnectionResponse),
            0x04 => Some(SignalCode::ConfigurationRequest),
            0x05 => Some(SignalCode::ConfigurationResponse),
            0x06 => Some(SignalCode::DisconnectionRequest),
            0x07 => Some(SignalCode::DisconnectionResponse),
            0x08 => Some(SignalCode::EchoRequest),
            0x09 => Some(SignalCode::EchoResponse),
            0x0A => Some(SignalCode::InformationRequest),
            0x0B => Some(SignalCode::InformationResponse),
            0x12 => Some(SignalCode::ConnectionParameterUpdateRequest),
            0x13 => Some(SignalCode::ConnectionParameterUpdateResponse),
            _ => None,
        }
    }
}

/// Connection response results
const RESULT_SUCCESS: u16 = 0x0000;
const RESULT_PENDING: u16 = 0x0001;
const RESULT_PSM_NOT_SUPPORTED: u16 = 0x0002;
const RESULT_NO_RESOURCES: u16 = 0x0004;

/// Configuration response results
const CONFIG_SUCCESS: u16 = 0x0000;
const CONFIG_UNACCEPTABLE_PARAMETERS: u16 = 0x0001;
const CONFIG_UNKNOWN_OPTIONS: u16 = 0x0003;

/// Command reject reasons
const REJECT_COMMAND_NOT_UNDERSTOOD: u16 = 0x0000;

/// Configuration option types
const OPTION_MTU: u8 = 0x01;
const OPTION_RETRANSMISSION_AND_FLOW_CONTROL: u8 = 0x04;

/// Modes within the retransmission and flow control option
const RFC_MODE_BASIC: u8 = 0x00;
const RFC_MODE_ENHANCED_RETRANSMISSION: u8 = 0x03;

/// Parameters of an LE connection parameter update request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionParameterUpdate {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

pub(crate) type ConnectCallback = Box<dyn FnOnce(Result<Channel, ChannelError>)>;
pub(crate) type ParameterUpdateCallback = Box<dyn FnOnce(bool)>;

enum Pending {
    Connect { local_cid: u16, timeout: TaskId },
    Configure { local_cid: u16, timeout: TaskId },
    Disconnect { timeout: TaskId },
    ParameterUpdate { callback: ParameterUpdateCallback, timeout: TaskId },
}

struct DynSetup {
    psm: u16,
    params: ChannelParameters,
    /// `None` for an inbound channel; inbound completion goes to the PSM service
    callback: Option<ConnectCallback>,
    local_config_done: bool,
    remote_config_done: bool,
    /// The peer's retransmission and flow control option, when it sent one
    peer_rfc: Option<RfcOption>,
}

#[derive(Clone, Copy, Debug)]
struct RfcOption {
    mode: u8,
    tx_window: u8,
    max_transmit: u8,
    mps: u16,
}

/// Per link signaling state
pub(crate) struct SignalingState {
    next_identifier: u8,
    pending: BTreeMap<u8, Pending>,
    setups: BTreeMap<u16, DynSetup>,
}

impl SignalingState {
    pub(crate) fn new() -> Self {
        SignalingState {
            next_identifier: 1,
            pending: BTreeMap::new(),
            setups: BTreeMap::new(),
        }
    }

    fn allocate_identifier(&mut self) -> u8 {
        loop {
            let identifier = self.next_identifier;

            self.next_identifier = self.next_identifier.checked_add(1).unwrap_or(1);

            if !self.pending.contains_key(&identifier) {
                return identifier;
            }
        }
    }
}

fn build_signal(code: SignalCode, identifier: u8, data: &[u8]) -> Vec<u8> {
    let mut signal = Vec::with_capacity(4 + data.len());

    signal.push(code.into_code());
    signal.push(identifier);
    signal.extend_from_slice(&(data.len() as u16).to_le_bytes());
    signal.extend_from_slice(data);

    signal
}

fn send_signal(link: &Rc<RefCell<LinkState>>, signal: Vec<u8>) {
    let signaling_cid = link.borrow().signaling_cid();

    logical_link::send_pdu(link, signaling_cid, signal, false);
}

/// Build our configuration request for a channel being set up
fn build_configuration_request_data(remote_cid: u16, params: &ChannelParameters) -> Vec<u8> {
    let mut data = Vec::new();

    data.extend_from_slice(&remote_cid.to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes()); // flags: no continuation

    data.push(OPTION_MTU);
    data.push(2);
    data.extend_from_slice(&params.max_rx_sdu_size.to_le_bytes());

    if params.mode == ChannelMode::EnhancedRetransmission {
        data.push(OPTION_RETRANSMISSION_AND_FLOW_CONTROL);
        data.push(9);
        data.push(RFC_MODE_ENHANCED_RETRANSMISSION);
        data.push(ERTM_TX_WINDOW);
        data.push(ERTM_MAX_TRANSMISSIONS);
        data.extend_from_slice(&2000u16.to_le_bytes()); // retransmission timeout in ms
        data.extend_from_slice(&12000u16.to_le_bytes()); // monitor timeout in ms
        data.extend_from_slice(&1010u16.to_le_bytes()); // MPS
    }

    data
}

/// Start opening a dynamic channel
pub(crate) fn open_channel(
    link: &Rc<RefCell<LinkState>>,
    psm: Psm,
    params: ChannelParameters,
    callback: ConnectCallback,
) {
    if link.borrow().kind != LinkKind::AclU {
        callback(Err(ChannelError::Refused));

        return;
    }

    let (local_cid, identifier) = {
        let mut state = link.borrow_mut();

        let Some(local_cid) = state.allocate_dynamic_cid() else {
            drop(state);

            callback(Err(ChannelError::Refused));

            return;
        };

        let identifier = state.signaling.allocate_identifier();

        (local_cid, identifier)
    };

    let channel_state = Rc::new(RefCell::new(ChannelState::new(
        local_cid,
        0,
        Some(psm.0),
        params.mode,
        crate::MIN_ACL_MTU,
        params.max_rx_sdu_size,
        params.max_tx_queued,
        None,
        link.borrow().dispatcher.clone(),
        Rc::downgrade(link),
    )));

    logical_link::add_channel(link, channel_state);

    let timeout = arm_response_timeout(link, identifier);

    {
        let mut state = link.borrow_mut();

        state
            .signaling
            .pending
            .insert(identifier, Pending::Connect { local_cid, timeout });

        state.signaling.setups.insert(
            local_cid,
            DynSetup {
                psm: psm.0,
                params,
                callback: Some(callback),
                local_config_done: false,
                remote_config_done: false,
                peer_rfc: None,
            },
        );
    }

    let mut data = Vec::new();

    data.extend_from_slice(&psm.0.to_le_bytes());
    data.extend_from_slice(&local_cid.to_le_bytes());

    log::info!("(L2CAP) requesting channel for PSM {} (source cid {:#06x})", psm, local_cid);

    send_signal(link, build_signal(SignalCode::ConnectionRequest, identifier, &data));
}

/// Start disconnecting a dynamic channel we are done with
pub(crate) fn start_disconnect(link: &Rc<RefCell<LinkState>>, local_cid: u16, remote_cid: u16) {
    let identifier = link.borrow_mut().signaling.allocate_identifier();

    let timeout = arm_response_timeout(link, identifier);

    link.borrow_mut()
        .signaling
        .pending
        .insert(identifier, Pending::Disconnect { timeout });

    let mut data = Vec::new();

    data.extend_from_slice(&remote_cid.to_le_bytes());
    data.extend_from_slice(&local_cid.to_le_bytes());

    send_signal(link, build_signal(SignalCode::DisconnectionRequest, identifier, &data));
}

/// Send an LE connection parameter update request (peripheral role)
pub(crate) fn request_connection_parameter_update(
    link: &Rc<RefCell<LinkState>>,
    parameters: ConnectionParameterUpdate,
    callback: ParameterUpdateCallback,
) {
    let identifier = link.borrow_mut().signaling.allocate_identifier();

    let timeout = arm_response_timeout(link, identifier);

    link.borrow_mut()
        .signaling
        .pending
        .insert(identifier, Pending::ParameterUpdate { callback, timeout });

    let mut data = Vec::new();

    data.extend_from_slice(&parameters.interval_min.to_le_bytes());
    data.extend_from_slice(&parameters.interval_max.to_le_bytes());
    data.extend_from_slice(&parameters.latency.to_le_bytes());
    data.extend_from_slice(&parameters.supervision_timeout.to_le_bytes());

    send_signal(
        link,
        build_signal(SignalCode::ConnectionParameterUpdateRequest, identifier, &data),
    );
}

fn arm_response_timeout(link: &Rc<RefCell<LinkState>>, identifier: u8) -> TaskId {
    let weak = Rc::downgrade(link);

    link.borrow().dispatcher.post_after(SIGNALING_RESPONSE_TIMEOUT, move || {
        let Some(link) = weak.upgrade() else { return };

        let pending = link.borrow_mut().signaling.pending.remove(&identifier);

        let Some(pending) = pending else { return };

        log::warn!("(L2CAP) signaling request {} timed out", identifier);

        match pending {
            Pending::Connect { local_cid, .. } | Pending::Configure { local_cid, .. } => {
                fail_setup(&link, local_cid, ChannelError::ResponseTimeout);
            }
            Pending::Disconnect { .. } => {}
            Pending::ParameterUpdate { callback, .. } => callback(false),
        }
    })
}

/// Tear down a channel whose setup failed
fn fail_setup(link: &Rc<RefCell<LinkState>>, local_cid: u16, error: ChannelError) {
    let setup = link.borrow_mut().signaling.setups.remove(&local_cid);

    if let Some(state) = logical_link::take_channel(link, local_cid) {
        channel::close(&state);
    }

    if let Some(DynSetup {
        callback: Some(callback),
        ..
    }) = setup
    {
        callback(Err(error));
    }
}

/// Process a signaling C-frame
pub(crate) fn on_signaling_pdu(link: &Rc<RefCell<LinkState>>, payload: Vec<u8>) {
    let mut rest = payload.as_slice();

    // a C-frame may carry multiple commands
    while rest.len() >= 4 {
        let code = rest[0];
        let identifier = rest[1];
        let length = u16::from_le_bytes([rest[2], rest[3]]) as usize;

        if rest[4..].len() < length {
            log::warn!("(L2CAP) truncated signaling command");

            return;
        }

        let data = &rest[4..4 + length];

        rest = &rest[4 + length..];

        match SignalCode::try_from_code(code) {
            Some(signal) => on_signal(link, signal, identifier, data),
            None => {
                log::warn!("(L2CAP) rejecting unknown signaling code {:#04x}", code);

                send_signal(
                    link,
                    build_signal(
                        SignalCode::CommandReject,
                        identifier,
                        &REJECT_COMMAND_NOT_UNDERSTOOD.to_le_bytes(),
                    ),
                );
            }
        }
    }
}

fn on_signal(link: &Rc<RefCell<LinkState>>, signal: SignalCode, identifier: u8, data: &[u8]) {
    match signal {
        SignalCode::ConnectionRequest if data.len() >= 4 => {
            let psm = u16::from_le_bytes([data[0], data[1]]);
            let remote_cid = u16::from_le_bytes([data[2], data[3]]);

            on_connection_request(link, identifier, psm, remote_cid);
        }
        SignalCode::ConnectionResponse if data.len() >= 8 => {
            let remote_cid = u16::from_le_bytes([data[0], data[1]]);
            let result = u16::from_le_bytes([data[4], data[5]]);

            on_connection_response(link, identifier, remote_cid, result);
        }
        SignalCode::ConfigurationRequest if data.len() >= 4 => {
            let local_cid = u16::from_le_bytes([data[0], data[1]]);

            on_configuration_request(link, identifier, local_cid, &data[4..]);
        }
        SignalCode::ConfigurationResponse if data.len() >= 6 => {
            let result = u16::from_le_bytes([data[4], data[5]]);

            on_configuration_response(link, identifier, result, &data[6..]);
        }
        SignalCode::DisconnectionRequest if data.len() >= 4 => {
            let local_cid = u16::from_le_bytes([data[0], data[1]]);
            let remote_cid = u16::from_le_bytes([data[2], data[3]]);

            on_disconnection_request(link, identifier, local_cid, remote_cid);
        }
        SignalCode::DisconnectionResponse => {
            if let Some(Pending::Disconnect { timeout }) =
                link.borrow_mut().signaling.pending.remove(&identifier)
            {
                link.borrow().dispatcher.cancel(timeout);
            }
        }
        SignalCode::EchoRequest => {
            send_signal(link, build_signal(SignalCode::EchoResponse, identifier, data));
        }
        SignalCode::EchoResponse => {}
        SignalCode::InformationRequest if data.len() >= 2 => {
            let info_type = u16::from_le_bytes([data[0], data[1]]);

            on_information_request(link, identifier, info_type);
        }
        SignalCode::InformationResponse => {}
        SignalCode::ConnectionParameterUpdateRequest if data.len() >= 8 => {
            let parameters = ConnectionParameterUpdate {
                interval_min: u16::from_le_bytes([data[0], data[1]]),
                interval_max: u16::from_le_bytes([data[2], data[3]]),
                latency: u16::from_le_bytes([data[4], data[5]]),
                supervision_timeout: u16::from_le_bytes([data[6], data[7]]),
            };

            on_parameter_update_request(link, identifier, parameters);
        }
        SignalCode::ConnectionParameterUpdateResponse if data.len() >= 2 => {
            let accepted = u16::from_le_bytes([data[0], data[1]]) == 0;

            if let Some(Pending::ParameterUpdate { callback, timeout }) =
                link.borrow_mut().signaling.pending.remove(&identifier)
            {
                link.borrow().dispatcher.cancel(timeout);

                callback(accepted);
            }
        }
        SignalCode::CommandReject => {
            on_command_reject(link, identifier);
        }
        _ => log::warn!("(L2CAP) malformed {:?} command", signal),
    }
}

fn on_connection_request(link: &Rc<RefCell<LinkState>>, identifier: u8, psm: u16, remote_cid: u16) {
    let respond = |link: &Rc<RefCell<LinkState>>, dcid: u16, result: u16| {
        let mut data = Vec::new();

        data.extend_from_slice(&dcid.to_le_bytes());
        data.extend_from_slice(&remote_cid.to_le_bytes());
        data.extend_from_slice(&result.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // status: no further information

        send_signal(link, build_signal(SignalCode::ConnectionResponse, identifier, &data));
    };

    if link.borrow().kind != LinkKind::AclU {
        respond(link, 0, RESULT_PSM_NOT_SUPPORTED);

        return;
    }

    let service = {
        let state = link.borrow();

        state.service_query.as_ref().and_then(|query| query(psm))
    };

    let Some(params) = service else {
        log::info!("(L2CAP) rejecting channel for unregistered PSM {:#06x}", psm);

        respond(link, 0, RESULT_PSM_NOT_SUPPORTED);

        return;
    };

    let Some(local_cid) = link.borrow_mut().allocate_dynamic_cid() else {
        respond(link, 0, RESULT_NO_RESOURCES);

        return;
    };

    let channel_state = Rc::new(RefCell::new(ChannelState::new(
        local_cid,
        remote_cid,
        Some(psm),
        params.mode,
        crate::MIN_ACL_MTU,
        params.max_rx_sdu_size,
        params.max_tx_queued,
        None,
        link.borrow().dispatcher.clone(),
        Rc::downgrade(link),
    )));

    logical_link::add_channel(link, channel_state);

    link.borrow_mut().signaling.setups.insert(
        local_cid,
        DynSetup {
            psm,
            params,
            callback: None,
            local_config_done: false,
            remote_config_done: false,
            peer_rfc: None,
        },
    );

    respond(link, local_cid, RESULT_SUCCESS);

    send_configuration_request(link, local_cid);
}

fn on_connection_response(link: &Rc<RefCell<LinkState>>, identifier: u8, remote_cid: u16, result: u16) {
    let local_cid = {
        let mut state = link.borrow_mut();

        match state.signaling.pending.get(&identifier) {
            Some(Pending::Connect { local_cid, .. }) => *local_cid,
            _ => {
                log::warn!("(L2CAP) connection response with unknown identifier {}", identifier);

                return;
            }
        }
    };

    match result {
        RESULT_PENDING => {
            // the peer needs more time; leave the request outstanding
        }
        RESULT_SUCCESS => {
            let pending = link.borrow_mut().signaling.pending.remove(&identifier);

            if let Some(Pending::Connect { timeout, .. }) = pending {
                link.borrow().dispatcher.cancel(timeout);
            }

            if let Some(channel) = link.borrow().channels.get(&local_cid).cloned() {
                channel.borrow_mut().remote_cid = remote_cid;
            }

            send_configuration_request(link, local_cid);
        }
        _ => {
            let pending = link.borrow_mut().signaling.pending.remove(&identifier);

            if let Some(Pending::Connect { timeout, .. }) = pending {
                link.borrow().dispatcher.cancel(timeout);
            }

            fail_setup(link, local_cid, ChannelError::Refused);
        }
    }
}

fn send_configuration_request(link: &Rc<RefCell<LinkState>>, local_cid: u16) {
    let (remote_cid, params) = {
        let state = link.borrow();

        let Some(channel) = state.channels.get(&local_cid) else { return };

        let Some(setup) = state.signaling.setups.get(&local_cid) else { return };

        let result = (channel.borrow().remote_cid, setup.params);
        result
    };

    let identifier = link.borrow_mut().signaling.allocate_identifier();

    let timeout = arm_response_timeout(link, identifier);

    link.borrow_mut()
        .signaling
        .pending
        .insert(identifier, Pending::Configure { local_cid, timeout });

    let data = build_configuration_request_data(remote_cid, &params);

    send_signal(link, build_signal(SignalCode::ConfigurationRequest, identifier, &data));
}

/// Parse the options of a configuration request or response
fn parse_options(mut options: &[u8]) -> Result<(Option<u16>, Option<RfcOption>), Vec<u8>> {
    let mut mtu = None;
    let mut rfc = None;
    let mut unknown = Vec::new();

    while options.len() >= 2 {
        let option_type = options[0];
        let length = options[1] as usize;

        if options[2..].len() < length {
            break;
        }

        let value = &options[2..2 + length];

        options = &options[2 + length..];

        match option_type & 0x7F {
            OPTION_MTU if length == 2 => {
                mtu = Some(u16::from_le_bytes([value[0], value[1]]));
            }
            OPTION_RETRANSMISSION_AND_FLOW_CONTROL if length == 9 => {
                rfc = Some(RfcOption {
                    mode: value[0],
                    tx_window: value[1],
                    max_transmit: value[2],
                    mps: u16::from_le_bytes([value[7], value[8]]),
                });
            }
            _ => {
                // options with the hint bit set are skippable, the rest are not
                if option_type & 0x80 == 0 {
                    unknown.push(option_type);
                }
            }
        }
    }

    if unknown.is_empty() {
        Ok((mtu, rfc))
    } else {
        Err(unknown)
    }
}

fn on_configuration_request(link: &Rc<RefCell<LinkState>>, identifier: u8, local_cid: u16, options: &[u8]) {
    let respond = |link: &Rc<RefCell<LinkState>>, remote_cid: u16, result: u16, options: &[u8]| {
        let mut data = Vec::new();

        data.extend_from_slice(&remote_cid.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // flags
        data.extend_from_slice(&result.to_le_bytes());
        data.extend_from_slice(options);

        send_signal(link, build_signal(SignalCode::ConfigurationResponse, identifier, &data));
    };

    let channel = link.borrow().channels.get(&local_cid).cloned();

    let Some(channel) = channel else {
        log::warn!("(L2CAP) configuration request for unknown channel {:#06x}", local_cid);

        return;
    };

    let remote_cid = channel.borrow().remote_cid;

    let parsed = match parse_options(options) {
        Ok(parsed) => parsed,
        Err(unknown) => {
            respond(link, remote_cid, CONFIG_UNKNOWN_OPTIONS, &unknown);

            return;
        }
    };

    let (mtu, rfc) = parsed;

    let our_mode = link
        .borrow()
        .signaling
        .setups
        .get(&local_cid)
        .map(|setup| setup.params.mode)
        .unwrap_or(ChannelMode::Basic);

    let their_mode = match rfc.map(|rfc| rfc.mode) {
        None | Some(RFC_MODE_BASIC) => ChannelMode::Basic,
        Some(RFC_MODE_ENHANCED_RETRANSMISSION) => ChannelMode::EnhancedRetransmission,
        Some(_) => {
            // a mode this host does not do; counter with ours
            respond(
                link,
                remote_cid,
                CONFIG_UNACCEPTABLE_PARAMETERS,
                &counter_rfc_option(our_mode),
            );

            return;
        }
    };

    if their_mode != our_mode {
        respond(
            link,
            remote_cid,
            CONFIG_UNACCEPTABLE_PARAMETERS,
            &counter_rfc_option(our_mode),
        );

        return;
    }

    {
        let mut state = channel.borrow_mut();

        if let Some(mtu) = mtu {
            state.tx_mtu = mtu;
        }
    }

    {
        let mut state = link.borrow_mut();

        if let Some(setup) = state.signaling.setups.get_mut(&local_cid) {
            setup.remote_config_done = true;
            setup.peer_rfc = rfc;
        }
    }

    respond(link, remote_cid, CONFIG_SUCCESS, options);

    check_setup_complete(link, local_cid);
}

fn counter_rfc_option(mode: ChannelMode) -> Vec<u8> {
    let mut option = Vec::with_capacity(11);

    option.push(OPTION_RETRANSMISSION_AND_FLOW_CONTROL);
    option.push(9);
    option.push(match mode {
        ChannelMode::Basic => RFC_MODE_BASIC,
        ChannelMode::EnhancedRetransmission => RFC_MODE_ENHANCED_RETRANSMISSION,
    });
    option.extend_from_slice(&[ERTM_TX_WINDOW, ERTM_MAX_TRANSMISSIONS]);
    option.extend_from_slice(&2000u16.to_le_bytes());
    option.extend_from_slice(&12000u16.to_le_bytes());
    option.extend_from_slice(&1010u16.to_le_bytes());

    option
}

fn on_configuration_response(link: &Rc<RefCell<LinkState>>, identifier: u8, result: u16, options: &[u8]) {
    let local_cid = {
        let mut state = link.borrow_mut();

        match state.signaling.pending.remove(&identifier) {
            Some(Pending::Configure { local_cid, timeout }) => {
                state.dispatcher.cancel(timeout);

                local_cid
            }
            Some(other) => {
                state.signaling.pending.insert(identifier, other);

                log::warn!("(L2CAP) configuration response for a different request");

                return;
            }
            None => {
                log::warn!("(L2CAP) configuration response with unknown identifier {}", identifier);

                return;
            }
        }
    };

    if result != CONFIG_SUCCESS {
        // a mode counter-offer we cannot take means the channel cannot open
        log::info!(
            "(L2CAP) peer rejected our configuration of channel {:#06x} (result {:#06x})",
            local_cid,
            result
        );

        let _ = parse_options(options);

        fail_setup(link, local_cid, ChannelError::Refused);

        return;
    }

    {
        let mut state = link.borrow_mut();

        if let Some(setup) = state.signaling.setups.get_mut(&local_cid) {
            setup.local_config_done = true;
        }
    }

    check_setup_complete(link, local_cid);
}

/// Finish setting up a dynamic channel once both directions are configured
fn check_setup_complete(link: &Rc<RefCell<LinkState>>, local_cid: u16) {
    let complete = {
        let state = link.borrow();

        state
            .signaling
            .setups
            .get(&local_cid)
            .map(|setup| setup.local_config_done && setup.remote_config_done)
            .unwrap_or(false)
    };

    if !complete {
        return;
    }

    let setup = link.borrow_mut().signaling.setups.remove(&local_cid).unwrap();

    let channel = link.borrow().channels.get(&local_cid).cloned();

    let Some(channel) = channel else { return };

    if setup.params.mode == ChannelMode::EnhancedRetransmission {
        let config = ErtmConfig {
            tx_window: setup.peer_rfc.map(|rfc| rfc.tx_window).unwrap_or(ERTM_TX_WINDOW),
            max_transmissions: setup
                .peer_rfc
                .map(|rfc| rfc.max_transmit)
                .unwrap_or(ERTM_MAX_TRANSMISSIONS),
            mps: setup.peer_rfc.map(|rfc| rfc.mps).unwrap_or(1010),
        };

        channel.borrow_mut().engine = Some(ErtmEngine::new(config));
    }

    log::info!(
        "(L2CAP) channel {:#06x} open for PSM {:#06x}",
        local_cid,
        setup.psm
    );

    let handle = Channel::new(&channel);

    match setup.callback {
        Some(callback) => callback(Ok(handle)),
        None => {
            // inbound: hand the channel to the PSM's service
            let service = {
                let state = link.borrow();

                state.service_dispatch.as_ref().map(Rc::clone)
            };

            if let Some(dispatch) = service {
                dispatch(setup.psm, handle);
            }
        }
    }
}

fn on_disconnection_request(link: &Rc<RefCell<LinkState>>, identifier: u8, local_cid: u16, remote_cid: u16) {
    if let Some(state) = logical_link::take_channel(link, local_cid) {
        link.borrow_mut().signaling.setups.remove(&local_cid);

        channel::close(&state);
    }

    let mut data = Vec::new();

    data.extend_from_slice(&local_cid.to_le_bytes());
    data.extend_from_slice(&remote_cid.to_le_bytes());

    send_signal(link, build_signal(SignalCode::DisconnectionResponse, identifier, &data));
}

fn on_information_request(link: &Rc<RefCell<LinkState>>, identifier: u8, info_type: u16) {
    let mut data = Vec::new();

    data.extend_from_slice(&info_type.to_le_bytes());

    match info_type {
        // extended features: enhanced retransmission, FCS option, fixed channels
        0x0002 => {
            data.extend_from_slice(&0u16.to_le_bytes()); // success
            data.extend_from_slice(&0x000000A8u32.to_le_bytes());
        }
        // fixed channels supported: signaling and the BR/EDR security manager
        0x0003 => {
            data.extend_from_slice(&0u16.to_le_bytes()); // success
            data.extend_from_slice(&[0b1000_0010, 0, 0, 0, 0, 0, 0, 0]);
        }
        _ => {
            data.extend_from_slice(&1u16.to_le_bytes()); // not supported
        }
    }

    send_signal(link, build_signal(SignalCode::InformationResponse, identifier, &data));
}

fn on_parameter_update_request(
    link: &Rc<RefCell<LinkState>>,
    identifier: u8,
    parameters: ConnectionParameterUpdate,
) {
    if link.borrow().kind != LinkKind::LeU {
        send_signal(
            link,
            build_signal(
                SignalCode::CommandReject,
                identifier,
                &REJECT_COMMAND_NOT_UNDERSTOOD.to_le_bytes(),
            ),
        );

        return;
    }

    let handler = link.borrow_mut().parameter_update_handler.take();

    let accepted = match handler {
        Some(mut handler) => {
            let accepted = handler(parameters);

            let mut state = link.borrow_mut();

            if state.parameter_update_handler.is_none() {
                state.parameter_update_handler = Some(handler);
            }

            accepted
        }
        None => false,
    };

    let result: u16 = if accepted { 0x0000 } else { 0x0001 };

    send_signal(
        link,
        build_signal(
            SignalCode::ConnectionParameterUpdateResponse,
            identifier,
            &result.to_le_bytes(),
        ),
    );
}

fn on_command_reject(link: &Rc<RefCell<LinkState>>, identifier: u8) {
    let pending = link.borrow_mut().signaling.pending.remove(&identifier);

    let Some(pending) = pending else { return };

    log::warn!("(L2CAP) peer rejected signaling request {}", identifier);

    match pending {
        Pending::Connect { local_cid, timeout } | Pending::Configure { local_cid, timeout } => {
            link.borrow().dispatcher.cancel(timeout);

            fail_setup(link, local_cid, ChannelError::Refused);
        }
        Pending::Disconnect { timeout } => {
            link.borrow().dispatcher.cancel(timeout);
        }
        Pending::ParameterUpdate { callback, timeout } => {
            link.borrow().dispatcher.cancel(timeout);

            callback(false);
        }
    }
}
