//! The L2CAP channel endpoint
//!
//! A [`Channel`] is one end of a logical data stream over an ACL or LE link. Data entering
//! through [`send`] is queued, framed by the channel's mode engine, and handed to the link's
//! scheduler; data leaving the recombiner is unwrapped by the mode engine and delivered through
//! the activated receive callback.
//!
//! The transmit queue is bounded. On overflow the oldest SDU is dropped and a counter is
//! incremented; newest data is presumed the most relevant.
//!
//! [`send`]: Channel::send

use crate::engines::{ErtmAction, ErtmEngine, ERTM_MONITOR_TIMEOUT, ERTM_RETRANSMISSION_TIMEOUT};
use crate::logical_link::{self, LinkState};
use crate::pdu::frame_check_sequence;
use crate::{AclPriority, ChannelError, ChannelMode};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use bluejay_core::dispatch::{Dispatcher, TaskId};
use bluejay_core::errors::HostError;
use bluejay_core::security::SecurityLevel;
use core::cell::RefCell;
use core::fmt;
use core::time::Duration;

/// Bound of the SDUs buffered for a channel that has not been activated yet
const PRE_ACTIVATION_RX_LIMIT: usize = 64;

/// Dropped SDUs are logged once per this many drops
const DROP_LOG_INTERVAL: u64 = 100;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ActivationState {
    Inactive,
    Active,
    Closed,
}

pub(crate) struct ChannelState {
    pub(crate) local_cid: u16,
    pub(crate) remote_cid: u16,
    pub(crate) psm: Option<u16>,
    pub(crate) mode: ChannelMode,
    pub(crate) state: ActivationState,
    /// The maximum SDU the peer accepts
    pub(crate) tx_mtu: u16,
    /// The maximum SDU this side accepts
    pub(crate) rx_mtu: u16,
    pub(crate) flush_timeout: Option<Duration>,
    pub(crate) max_tx_queued: usize,
    pub(crate) tx_queue: VecDeque<Vec<u8>>,
    pub(crate) dropped_sdus: u64,
    pending_rx: VecDeque<Vec<u8>>,
    rx_callback: Option<Box<dyn FnMut(Vec<u8>)>>,
    closed_callback: Option<Box<dyn FnOnce()>>,
    pub(crate) engine: Option<ErtmEngine>,
    retransmission_timer: Option<TaskId>,
    monitor_timer: Option<TaskId>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) link: Weak<RefCell<LinkState>>,
}

impl ChannelState {
    pub(crate) fn new(
        local_cid: u16,
        remote_cid: u16,
        psm: Option<u16>,
        mode: ChannelMode,
        tx_mtu: u16,
        rx_mtu: u16,
        max_tx_queued: usize,
        engine: Option<ErtmEngine>,
        dispatcher: Dispatcher,
        link: Weak<RefCell<LinkState>>,
    ) -> Self {
        ChannelState {
            local_cid,
            remote_cid,
            psm,
            mode,
            state: ActivationState::Inactive,
            tx_mtu,
            rx_mtu,
            flush_timeout: None,
            max_tx_queued,
            tx_queue: VecDeque::new(),
            dropped_sdus: 0,
            pending_rx: VecDeque::new(),
            rx_callback: None,
            closed_callback: None,
            engine,
            retransmission_timer: None,
            monitor_timer: None,
            dispatcher,
            link,
        }
    }
}

/// Queue an SDU, dropping the oldest on overflow
pub(crate) fn queue_sdu(channel: &Rc<RefCell<ChannelState>>, sdu: Vec<u8>) {
    let mut state = channel.borrow_mut();

    state.tx_queue.push_back(sdu);

    if state.tx_queue.len() > state.max_tx_queued {
        state.tx_queue.pop_front();

        state.dropped_sdus += 1;

        if state.dropped_sdus % DROP_LOG_INTERVAL == 1 {
            log::warn!(
                "(L2CAP) channel {:#06x} dropped {} SDU(s) from its transmit queue",
                state.local_cid,
                state.dropped_sdus
            );
        }
    }
}

/// Deliver an inbound SDU to the channel's callback or pre-activation buffer
pub(crate) fn deliver_sdu(channel: &Rc<RefCell<ChannelState>>, sdu: Vec<u8>) {
    let callback = {
        let mut state = channel.borrow_mut();

        match state.state {
            ActivationState::Active => state.rx_callback.take(),
            ActivationState::Inactive => {
                state.pending_rx.push_back(sdu);

                if state.pending_rx.len() > PRE_ACTIVATION_RX_LIMIT {
                    state.pending_rx.pop_front();

                    log::warn!(
                        "(L2CAP) channel {:#06x} dropped a buffered SDU before activation",
                        state.local_cid
                    );
                }

                return;
            }
            ActivationState::Closed => return,
        }
    };

    if let Some(mut callback) = callback {
        callback(sdu);

        let mut state = channel.borrow_mut();

        if state.rx_callback.is_none() {
            state.rx_callback = Some(callback);
        }
    }
    // a deactivated channel drops the SDU
}

/// Process an inbound PDU payload for the channel
pub(crate) fn on_pdu(channel: &Rc<RefCell<ChannelState>>, payload: Vec<u8>) {
    let mode = channel.borrow().mode;

    match mode {
        ChannelMode::Basic => deliver_sdu(channel, payload),
        ChannelMode::EnhancedRetransmission => {
            // the last two bytes are the frame check sequence
            if payload.len() < 4 {
                log::warn!("(L2CAP) dropping runt ERTM frame");

                return;
            }

            let (frame, fcs_bytes) = payload.split_at(payload.len() - 2);

            let received_fcs = u16::from_le_bytes([fcs_bytes[0], fcs_bytes[1]]);

            if frame_check_sequence(frame) != received_fcs {
                log::warn!("(L2CAP) dropping ERTM frame with a bad frame check sequence");

                return;
            }

            let actions = channel
                .borrow_mut()
                .engine
                .as_mut()
                .map(|engine| engine.on_pdu(frame))
                .unwrap_or_default();

            run_ertm_actions(channel, actions);
        }
    }
}

/// Carry out the instructions returned by the ERTM engine
pub(crate) fn run_ertm_actions(channel: &Rc<RefCell<ChannelState>>, actions: Vec<ErtmAction>) {
    for action in actions {
        match action {
            ErtmAction::SendFrame(mut frame) => {
                let fcs = frame_check_sequence(&frame);

                frame.extend_from_slice(&fcs.to_le_bytes());

                let (link, remote_cid, flushable) = {
                    let state = channel.borrow();

                    (state.link.clone(), state.remote_cid, state.flush_timeout.is_some())
                };

                if let Some(link) = link.upgrade() {
                    logical_link::send_pdu(&link, remote_cid, frame, flushable);
                }
            }
            ErtmAction::DeliverSdu(sdu) => deliver_sdu(channel, sdu),
            ErtmAction::StartRetransmissionTimer => {
                let weak = Rc::downgrade(channel);

                let mut state = channel.borrow_mut();

                if let Some(task) = state.retransmission_timer.take() {
                    state.dispatcher.cancel(task);
                }

                let task = state.dispatcher.post_after(ERTM_RETRANSMISSION_TIMEOUT, move || {
                    on_retransmission_timeout(weak)
                });

                state.retransmission_timer = Some(task);
            }
            ErtmAction::StopRetransmissionTimer => {
                let mut state = channel.borrow_mut();

                if let Some(task) = state.retransmission_timer.take() {
                    state.dispatcher.cancel(task);
                }
            }
            ErtmAction::StartMonitorTimer => {
                let weak = Rc::downgrade(channel);

                let mut state = channel.borrow_mut();

                if let Some(task) = state.monitor_timer.take() {
                    state.dispatcher.cancel(task);
                }

                let task = state
                    .dispatcher
                    .post_after(ERTM_MONITOR_TIMEOUT, move || on_monitor_timeout(weak));

                state.monitor_timer = Some(task);
            }
            ErtmAction::StopMonitorTimer => {
                let mut state = channel.borrow_mut();

                if let Some(task) = state.monitor_timer.take() {
                    state.dispatcher.cancel(task);
                }
            }
            ErtmAction::LinkFailure => {
                log::warn!(
                    "(L2CAP) channel {:#06x} retransmission failure",
                    channel.borrow().local_cid
                );

                if let Some(link) = channel.borrow().link.upgrade() {
                    logical_link::on_link_error(&link);
                }

                return;
            }
        }
    }
}

fn on_retransmission_timeout(weak: Weak<RefCell<ChannelState>>) {
    let Some(channel) = weak.upgrade() else { return };

    channel.borrow_mut().retransmission_timer = None;

    let actions = channel
        .borrow_mut()
        .engine
        .as_mut()
        .map(|engine| engine.on_retransmission_timeout())
        .unwrap_or_default();

    run_ertm_actions(&channel, actions);
}

fn on_monitor_timeout(weak: Weak<RefCell<ChannelState>>) {
    let Some(channel) = weak.upgrade() else { return };

    channel.borrow_mut().monitor_timer = None;

    let actions = channel
        .borrow_mut()
        .engine
        .as_mut()
        .map(|engine| engine.on_monitor_timeout())
        .unwrap_or_default();

    run_ertm_actions(&channel, actions);
}

/// Mark the channel closed and fire its closed callback
pub(crate) fn close(channel: &Rc<RefCell<ChannelState>>) {
    let closed_callback = {
        let mut state = channel.borrow_mut();

        if state.state == ActivationState::Closed {
            return;
        }

        state.state = ActivationState::Closed;
        state.rx_callback = None;
        state.tx_queue.clear();
        state.pending_rx.clear();

        if let Some(task) = state.retransmission_timer.take() {
            state.dispatcher.cancel(task);
        }

        if let Some(task) = state.monitor_timer.take() {
            state.dispatcher.cancel(task);
        }

        state.closed_callback.take()
    };

    if let Some(callback) = closed_callback {
        callback();
    }
}

/// An endpoint of an L2CAP data stream
///
/// `Channel` is a handle; the state it refers to is owned by the logical link. Operations on a
/// channel whose link has gone away fail with [`ChannelError::ChannelClosed`] or do nothing,
/// matching the deferred-callback discipline of the host.
pub struct Channel {
    pub(crate) state: Weak<RefCell<ChannelState>>,
}

impl Channel {
    pub(crate) fn new(state: &Rc<RefCell<ChannelState>>) -> Self {
        Channel {
            state: Rc::downgrade(state),
        }
    }

    /// Get the local channel identifier
    pub fn local_cid(&self) -> Option<u16> {
        self.state.upgrade().map(|state| state.borrow().local_cid)
    }

    /// Get the remote channel identifier
    pub fn remote_cid(&self) -> Option<u16> {
        self.state.upgrade().map(|state| state.borrow().remote_cid)
    }

    /// Get the largest SDU the peer accepts
    pub fn max_tx_sdu_size(&self) -> Option<u16> {
        self.state.upgrade().map(|state| state.borrow().tx_mtu)
    }

    /// Get the largest SDU this side advertised it accepts
    pub fn max_rx_sdu_size(&self) -> Option<u16> {
        self.state.upgrade().map(|state| state.borrow().rx_mtu)
    }

    /// Activate the channel
    ///
    /// May only be called once. SDUs that arrived before activation are delivered to `rx` in
    /// order during this call.
    pub fn activate(
        &self,
        rx: impl FnMut(Vec<u8>) + 'static,
        closed: impl FnOnce() + 'static,
    ) -> Result<(), ChannelError> {
        let state = self.state.upgrade().ok_or(ChannelError::ChannelClosed)?;

        let buffered = {
            let mut borrowed = state.borrow_mut();

            match borrowed.state {
                ActivationState::Inactive => {}
                ActivationState::Active => return Err(ChannelError::AlreadyActivated),
                ActivationState::Closed => return Err(ChannelError::ChannelClosed),
            }

            borrowed.state = ActivationState::Active;
            borrowed.rx_callback = Some(Box::new(rx));
            borrowed.closed_callback = Some(Box::new(closed));

            core::mem::take(&mut borrowed.pending_rx)
        };

        for sdu in buffered {
            deliver_sdu(&state, sdu);
        }

        Ok(())
    }

    /// Deactivate the channel
    ///
    /// Detaches the callbacks and removes the channel from its link; a dynamic channel is also
    /// disconnected from the peer. Idempotent.
    pub fn deactivate(&self) {
        let Some(state) = self.state.upgrade() else { return };

        let (link, local_cid) = {
            let mut borrowed = state.borrow_mut();

            borrowed.rx_callback = None;
            borrowed.closed_callback = None;

            (borrowed.link.clone(), borrowed.local_cid)
        };

        close(&state);

        if let Some(link) = link.upgrade() {
            logical_link::remove_channel(&link, local_cid);
        }
    }

    /// Queue an SDU for transmission
    ///
    /// On queue overflow the oldest queued SDU is dropped.
    pub fn send(&self, sdu: Vec<u8>) {
        let Some(state) = self.state.upgrade() else { return };

        if state.borrow().state == ActivationState::Closed {
            return;
        }

        queue_sdu(&state, sdu);

        let link = state.borrow().link.upgrade();

        if let Some(link) = link {
            logical_link::flush(&link);
        }
    }

    /// Set the bound of the transmit SDU queue
    ///
    /// The default bound is [`DEFAULT_MAX_TX_QUEUED`](crate::DEFAULT_MAX_TX_QUEUED).
    ///
    /// # Panic
    /// The bound must not be zero.
    pub fn set_max_tx_queued(&self, bound: usize) {
        assert_ne!(0, bound);

        if let Some(state) = self.state.upgrade() {
            state.borrow_mut().max_tx_queued = bound;
        }
    }

    /// Get the count of SDUs dropped from the transmit queue
    pub fn dropped_sdus(&self) -> u64 {
        self.state
            .upgrade()
            .map(|state| state.borrow().dropped_sdus)
            .unwrap_or(0)
    }

    /// Get the count of SDUs waiting in the transmit queue
    pub fn queued_sdus(&self) -> usize {
        self.state
            .upgrade()
            .map(|state| state.borrow().tx_queue.len())
            .unwrap_or(0)
    }

    /// Escalate a protocol error on this channel to its link
    ///
    /// The link closes every channel and asks its owner to disconnect.
    pub fn signal_link_error(&self) {
        let Some(state) = self.state.upgrade() else { return };

        let link = state.borrow().link.clone();

        if let Some(link) = link.upgrade() {
            logical_link::on_link_error(&link);
        }
    }

    /// Request a security upgrade of the channel's link
    pub fn upgrade_security(
        &self,
        level: SecurityLevel,
        callback: impl FnOnce(Result<(), HostError>) + 'static,
    ) {
        let Some(state) = self.state.upgrade() else {
            callback(Err(HostError::NotFound));

            return;
        };

        let link = state.borrow().link.clone();

        match link.upgrade() {
            Some(link) => logical_link::request_security_upgrade(&link, level, Box::new(callback)),
            None => callback(Err(HostError::NotFound)),
        }
    }

    /// Request a vendor extension ACL priority for the channel's link
    ///
    /// On failure the priority remains `Normal`.
    pub fn request_acl_priority(
        &self,
        priority: AclPriority,
        callback: impl FnOnce(Result<(), HostError>) + 'static,
    ) {
        let Some(state) = self.state.upgrade() else {
            callback(Err(HostError::NotFound));

            return;
        };

        let link = state.borrow().link.clone();

        match link.upgrade() {
            Some(link) => logical_link::request_acl_priority(&link, priority, Box::new(callback)),
            None => callback(Err(HostError::NotFound)),
        }
    }

    /// Set the automatic flush timeout of the channel's BR/EDR link
    ///
    /// Only valid on ACL-U links. On success the channel's outbound packets carry the
    /// automatically flushable packet boundary flag.
    pub fn set_bredr_automatic_flush_timeout(
        &self,
        timeout: Duration,
        callback: impl FnOnce(Result<(), HostError>) + 'static,
    ) {
        let Some(state) = self.state.upgrade() else {
            callback(Err(HostError::NotFound));

            return;
        };

        let link = state.borrow().link.clone();

        match link.upgrade() {
            Some(link) => {
                logical_link::write_flush_timeout(&link, &state, timeout, Box::new(callback))
            }
            None => callback(Err(HostError::NotFound)),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.state.upgrade() {
            Some(state) => {
                let state = state.borrow();

                write!(
                    f,
                    "Channel {{ local: {:#06x}, remote: {:#06x} }}",
                    state.local_cid, state.remote_cid
                )
            }
            None => f.write_str("Channel { closed }"),
        }
    }
}
