//! The HCI data channels
//!
//! One data channel exists per buffer pool in the Controller: ACL (with a separate LE pool when
//! the Controller has one), SCO, and ISO. Each channel tracks the shared pool of
//! `max_num_packets` packet buffers and schedules outbound packets round robin across the links
//! that have both queued data and available credit.
//!
//! Credits return through the Number Of Completed Packets event. Inbound packets dispatch by
//! connection handle to the sink registered for the link; packets for a handle with no link yet
//! are held briefly, in case the connection complete event is still being processed, then dropped
//! with a warning.

use crate::events::NumberOfCompletedPacketsData;
use crate::transport::{HciPacketType, TransportShared};
use crate::{ConnectionHandle, HciAclData};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::time::Duration;

/// How long an inbound packet for an unknown handle is held before being dropped
const UNKNOWN_HANDLE_HOLD: Duration = Duration::from_secs(1);

/// Sizing of one Controller buffer pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    /// The maximum payload of one HCI data packet
    pub max_data_length: usize,
    /// The number of packets the pool holds
    pub num_packets: usize,
}

/// Which buffer pool an ACL link draws from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AclBufferPool {
    BrEdr,
    LowEnergy,
}

/// Sink for the inbound ACL packets of one link
pub type AclDataSink = Box<dyn FnMut(HciAclData)>;

struct Pool {
    info: BufferInfo,
    in_use: usize,
}

impl Pool {
    fn available(&self) -> usize {
        self.info.num_packets.saturating_sub(self.in_use)
    }
}

struct AclLink {
    pool: AclBufferPool,
    queue: VecDeque<HciAclData>,
    sink: AclDataSink,
    /// Packets sent to the Controller and not yet reported completed
    outstanding: usize,
    /// Invoked when the link's queue has drained and credit is available
    ready_callback: Option<Box<dyn FnMut()>>,
}

struct AclState {
    bredr: Option<Pool>,
    /// `None` means LE links share the BR/EDR pool
    le: Option<Pool>,
    links: BTreeMap<u16, AclLink>,
    /// Round robin order of the link handles
    rotation: VecDeque<u16>,
    /// Inbound packets held for handles with no registered link
    held: BTreeMap<u16, Vec<HciAclData>>,
    /// Re-entrancy guard for the scheduler
    scheduling: bool,
}

impl AclState {
    fn pool_of(&mut self, pool: AclBufferPool) -> Option<&mut Pool> {
        match pool {
            AclBufferPool::BrEdr => self.bredr.as_mut(),
            AclBufferPool::LowEnergy => {
                if self.le.is_some() {
                    self.le.as_mut()
                } else {
                    self.bredr.as_mut()
                }
            }
        }
    }
}

/// The ACL data channel
#[derive(Clone)]
pub struct AclDataChannel {
    shared: Rc<TransportShared>,
    state: Rc<RefCell<AclState>>,
}

impl AclDataChannel {
    pub(crate) fn new(shared: Rc<TransportShared>) -> Self {
        AclDataChannel {
            shared,
            state: Rc::new(RefCell::new(AclState {
                bredr: None,
                le: None,
                links: BTreeMap::new(),
                rotation: VecDeque::new(),
                held: BTreeMap::new(),
                scheduling: false,
            })),
        }
    }

    /// Configure the buffer pools
    ///
    /// `le` is `None` when the LE Controller shares the BR/EDR buffers (a zero LE buffer size).
    pub fn set_buffer_info(&self, bredr: BufferInfo, le: Option<BufferInfo>) {
        let mut state = self.state.borrow_mut();

        state.bredr = Some(Pool {
            info: bredr,
            in_use: 0,
        });

        state.le = le.map(|info| Pool { info, in_use: 0 });
    }

    /// Get the maximum HCI payload for links of `pool`
    pub fn max_packet_payload(&self, pool: AclBufferPool) -> usize {
        self.state
            .borrow_mut()
            .pool_of(pool)
            .map(|pool| pool.info.max_data_length)
            .unwrap_or(HciAclData::MIN_MAX_PAYLOAD_SIZE)
    }

    /// Register the link for `handle`
    ///
    /// Inbound packets held for the handle are delivered to `sink` immediately.
    pub fn register_link(&self, handle: ConnectionHandle, pool: AclBufferPool, sink: AclDataSink) {
        let held = {
            let mut state = self.state.borrow_mut();

            let raw = handle.get_raw_handle();

            state.links.insert(
                raw,
                AclLink {
                    pool,
                    queue: VecDeque::new(),
                    sink,
                    outstanding: 0,
                    ready_callback: None,
                },
            );

            state.rotation.push_back(raw);

            state.held.remove(&raw).unwrap_or_default()
        };

        for packet in held {
            self.deliver(packet);
        }
    }

    /// Remove the link for `handle`
    ///
    /// Queued outbound packets are dropped and the pool credits of packets still outstanding are
    /// reclaimed (the Controller flushes them on disconnection and reports no completion).
    pub fn unregister_link(&self, handle: ConnectionHandle) {
        let mut state = self.state.borrow_mut();

        let raw = handle.get_raw_handle();

        if let Some(link) = state.links.remove(&raw) {
            let outstanding = link.outstanding;
            let pool = link.pool;

            if let Some(pool) = state.pool_of(pool) {
                pool.in_use = pool.in_use.saturating_sub(outstanding);
            }
        }

        state.rotation.retain(|rotation| *rotation != raw);
    }

    /// Queue an outbound packet
    ///
    /// Packets for one link transmit in submission order, so the fragments of one PDU are never
    /// interleaved with another PDU on the same link.
    pub fn send(&self, data: HciAclData) {
        {
            let mut state = self.state.borrow_mut();

            let raw = data.get_handle().get_raw_handle();

            let Some(link) = state.links.get_mut(&raw) else {
                log::warn!("(HCI) dropping ACL packet for unregistered handle {}", data.get_handle());

                return;
            };

            link.queue.push_back(data);
        }

        self.schedule();
    }

    /// Check if `handle` can take a new PDU right now
    ///
    /// Ready means registered, nothing queued, and at least one credit free in the link's pool.
    pub fn is_link_ready(&self, handle: ConnectionHandle) -> bool {
        let mut state = self.state.borrow_mut();

        let raw = handle.get_raw_handle();

        let Some(link) = state.links.get(&raw) else { return false };

        if !link.queue.is_empty() {
            return false;
        }

        let pool_id = link.pool;

        state
            .pool_of(pool_id)
            .map(|pool| pool.available() > 0)
            .unwrap_or(false)
    }

    /// Set the callback invoked when `handle` becomes [ready](AclDataChannel::is_link_ready)
    ///
    /// The upper layer uses this as its cue to hand the scheduler the next PDU.
    pub fn set_ready_callback(&self, handle: ConnectionHandle, callback: Box<dyn FnMut()>) {
        let raw = handle.get_raw_handle();

        if let Some(link) = self.state.borrow_mut().links.get_mut(&raw) {
            link.ready_callback = Some(callback);
        }
    }

    /// Emit queued packets round robin while credits remain
    fn schedule(&self) {
        {
            let mut state = self.state.borrow_mut();

            if state.scheduling {
                return;
            }

            state.scheduling = true;
        }

        self.emit_all();

        // links that drained get one chance to refill before the pass ends
        let ready: Vec<u16> = {
            let mut state = self.state.borrow_mut();

            let handles: Vec<u16> = state.links.keys().copied().collect();

            handles
                .into_iter()
                .filter(|raw| {
                    let link = &state.links[raw];

                    let pool_id = link.pool;

                    link.queue.is_empty()
                        && link.ready_callback.is_some()
                        && state
                            .pool_of(pool_id)
                            .map(|pool| pool.available() > 0)
                            .unwrap_or(false)
                })
                .collect()
        };

        for raw in ready {
            let callback = self
                .state
                .borrow_mut()
                .links
                .get_mut(&raw)
                .and_then(|link| link.ready_callback.take());

            if let Some(mut callback) = callback {
                callback();

                if let Some(link) = self.state.borrow_mut().links.get_mut(&raw) {
                    if link.ready_callback.is_none() {
                        link.ready_callback = Some(callback);
                    }
                }
            }
        }

        self.emit_all();

        self.state.borrow_mut().scheduling = false;
    }

    fn emit_all(&self) {
        loop {
            let next = {
                let mut state = self.state.borrow_mut();

                let mut next = None;

                // one full rotation looking for a link with queued data and a free credit
                for _ in 0..state.rotation.len() {
                    let raw = state.rotation.pop_front().unwrap();

                    state.rotation.push_back(raw);

                    let link = state.links.get_mut(&raw).unwrap();

                    if link.queue.is_empty() {
                        continue;
                    }

                    let pool_id = link.pool;

                    let Some(pool) = state.pool_of(pool_id) else { continue };

                    if pool.available() == 0 {
                        continue;
                    }

                    pool.in_use += 1;

                    let link = state.links.get_mut(&raw).unwrap();

                    link.outstanding += 1;

                    next = link.queue.pop_front();

                    break;
                }

                next
            };

            match next {
                Some(packet) => self.shared.send(HciPacketType::AclData, &packet.to_packet()),
                None => break,
            }
        }
    }

    pub(crate) fn on_number_of_completed_packets(&self, data: &NumberOfCompletedPacketsData) {
        {
            let mut state = self.state.borrow_mut();

            for completed in &data.completed_packets {
                let Some(handle) = completed.connection_handle else { continue };

                let raw = handle.get_raw_handle();

                let Some(link) = state.links.get_mut(&raw) else { continue };

                let returned = (completed.completed_packets as usize).min(link.outstanding);

                link.outstanding -= returned;

                let pool_id = link.pool;

                if let Some(pool) = state.pool_of(pool_id) {
                    pool.in_use = pool.in_use.saturating_sub(returned);
                }
            }
        }

        self.schedule();
    }

    pub(crate) fn on_inbound(&self, data: HciAclData) {
        let raw = data.get_handle().get_raw_handle();

        let known = self.state.borrow().links.contains_key(&raw);

        if known {
            self.deliver(data);

            return;
        }

        // hold briefly in case the connection complete has not been processed yet
        let mut state = self.state.borrow_mut();

        let newly_held = !state.held.contains_key(&raw);

        state.held.entry(raw).or_default().push(data);

        if newly_held {
            let weak = Rc::downgrade(&self.state);

            self.shared.dispatcher().post_after(UNKNOWN_HANDLE_HOLD, move || {
                expire_held(weak, raw)
            });
        }
    }

    fn deliver(&self, data: HciAclData) {
        let raw = data.get_handle().get_raw_handle();

        // the sink is taken out for the call so it may use the channel re-entrantly
        let sink = self.state.borrow_mut().links.get_mut(&raw).map(|link| {
            core::mem::replace(&mut link.sink, Box::new(|_| ()))
        });

        if let Some(mut sink) = sink {
            sink(data);

            if let Some(link) = self.state.borrow_mut().links.get_mut(&raw) {
                link.sink = sink;
            }
        }
    }
}

fn expire_held(state: Weak<RefCell<AclState>>, raw: u16) {
    let Some(state) = state.upgrade() else { return };

    if let Some(held) = state.borrow_mut().held.remove(&raw) {
        if !held.is_empty() {
            log::warn!(
                "(HCI) dropping {} ACL packet(s) for unknown connection handle {:#06x}",
                held.len(),
                raw
            );
        }
    };
}

/// Sink for the inbound packets of one synchronous or isochronous link
pub type RawDataSink = Box<dyn FnMut(&[u8])>;

struct SimpleLink {
    queue: VecDeque<Vec<u8>>,
    sink: RawDataSink,
    outstanding: usize,
}

struct SimpleState {
    pool: Option<Pool>,
    links: BTreeMap<u16, SimpleLink>,
    rotation: VecDeque<u16>,
    packet_type: HciPacketType,
}

/// Shared mechanics of the SCO and ISO data channels
///
/// Both carry raw packets (the host does not reframe voice or isochronous data), both use the
/// same packet based credit accounting as ACL, with one pool and no split.
#[derive(Clone)]
struct SimpleDataChannel {
    shared: Rc<TransportShared>,
    state: Rc<RefCell<SimpleState>>,
}

impl SimpleDataChannel {
    fn new(shared: Rc<TransportShared>, packet_type: HciPacketType) -> Self {
        SimpleDataChannel {
            shared,
            state: Rc::new(RefCell::new(SimpleState {
                pool: None,
                links: BTreeMap::new(),
                rotation: VecDeque::new(),
                packet_type,
            })),
        }
    }

    fn set_buffer_info(&self, info: BufferInfo) {
        self.state.borrow_mut().pool = Some(Pool { info, in_use: 0 });
    }

    fn register_link(&self, handle: ConnectionHandle, sink: RawDataSink) {
        let mut state = self.state.borrow_mut();

        let raw = handle.get_raw_handle();

        state.links.insert(
            raw,
            SimpleLink {
                queue: VecDeque::new(),
                sink,
                outstanding: 0,
            },
        );

        state.rotation.push_back(raw);
    }

    fn unregister_link(&self, handle: ConnectionHandle) {
        let mut state = self.state.borrow_mut();

        let raw = handle.get_raw_handle();

        if let Some(link) = state.links.remove(&raw) {
            if let Some(pool) = state.pool.as_mut() {
                pool.in_use = pool.in_use.saturating_sub(link.outstanding);
            }
        }

        state.rotation.retain(|rotation| *rotation != raw);
    }

    fn send(&self, handle: ConnectionHandle, packet: Vec<u8>) {
        {
            let mut state = self.state.borrow_mut();

            let raw = handle.get_raw_handle();

            let Some(link) = state.links.get_mut(&raw) else {
                log::warn!("(HCI) dropping data packet for unregistered handle {}", handle);

                return;
            };

            link.queue.push_back(packet);
        }

        self.schedule();
    }

    fn schedule(&self) {
        loop {
            let next = {
                let mut state = self.state.borrow_mut();

                let mut next = None;

                for _ in 0..state.rotation.len() {
                    let raw = state.rotation.pop_front().unwrap();

                    state.rotation.push_back(raw);

                    let available = state.pool.as_ref().map(Pool::available).unwrap_or(0);

                    if available == 0 {
                        break;
                    }

                    let link = state.links.get_mut(&raw).unwrap();

                    if link.queue.is_empty() {
                        continue;
                    }

                    link.outstanding += 1;

                    next = link.queue.pop_front();

                    state.pool.as_mut().unwrap().in_use += 1;

                    break;
                }

                next
            };

            match next {
                Some(packet) => {
                    let packet_type = self.state.borrow().packet_type;

                    self.shared.send(packet_type, &packet)
                }
                None => break,
            }
        }
    }

    fn on_number_of_completed_packets(&self, data: &NumberOfCompletedPacketsData) {
        {
            let mut state = self.state.borrow_mut();

            for completed in &data.completed_packets {
                let Some(handle) = completed.connection_handle else { continue };

                let raw = handle.get_raw_handle();

                let Some(link) = state.links.get_mut(&raw) else { continue };

                let returned = (completed.completed_packets as usize).min(link.outstanding);

                link.outstanding -= returned;

                if let Some(pool) = state.pool.as_mut() {
                    pool.in_use = pool.in_use.saturating_sub(returned);
                }
            }
        }

        self.schedule();
    }

    fn on_inbound(&self, packet: &[u8]) {
        if packet.len() < 3 {
            log::warn!("(HCI) dropping undersized data packet");

            return;
        }

        let raw = u16::from_le_bytes([packet[0], packet[1]]) & 0xFFF;

        let sink = self.state.borrow_mut().links.get_mut(&raw).map(|link| {
            core::mem::replace(&mut link.sink, Box::new(|_| ()))
        });

        match sink {
            Some(mut sink) => {
                sink(packet);

                if let Some(link) = self.state.borrow_mut().links.get_mut(&raw) {
                    link.sink = sink;
                }
            }
            None => {
                log::warn!("(HCI) dropping data packet for unknown handle {:#06x}", raw);
            }
        }
    }
}

/// The SCO data channel
#[derive(Clone)]
pub struct ScoDataChannel {
    inner: SimpleDataChannel,
}

impl ScoDataChannel {
    pub(crate) fn new(shared: Rc<TransportShared>) -> Self {
        ScoDataChannel {
            inner: SimpleDataChannel::new(shared, HciPacketType::ScoData),
        }
    }

    pub fn set_buffer_info(&self, info: BufferInfo) {
        self.inner.set_buffer_info(info)
    }

    pub fn register_link(&self, handle: ConnectionHandle, sink: RawDataSink) {
        self.inner.register_link(handle, sink)
    }

    pub fn unregister_link(&self, handle: ConnectionHandle) {
        self.inner.unregister_link(handle)
    }

    /// Queue a complete SCO data packet (header included)
    pub fn send(&self, handle: ConnectionHandle, packet: Vec<u8>) {
        self.inner.send(handle, packet)
    }

    pub(crate) fn on_number_of_completed_packets(&self, data: &NumberOfCompletedPacketsData) {
        self.inner.on_number_of_completed_packets(data)
    }

    pub(crate) fn on_inbound(&self, packet: &[u8]) {
        self.inner.on_inbound(packet)
    }
}

/// The ISO data channel
#[derive(Clone)]
pub struct IsoDataChannel {
    inner: SimpleDataChannel,
}

impl IsoDataChannel {
    pub(crate) fn new(shared: Rc<TransportShared>) -> Self {
        IsoDataChannel {
            inner: SimpleDataChannel::new(shared, HciPacketType::IsoData),
        }
    }

    pub fn set_buffer_info(&self, info: BufferInfo) {
        self.inner.set_buffer_info(info)
    }

    pub fn register_link(&self, handle: ConnectionHandle, sink: RawDataSink) {
        self.inner.register_link(handle, sink)
    }

    pub fn unregister_link(&self, handle: ConnectionHandle) {
        self.inner.unregister_link(handle)
    }

    /// Queue a complete ISO data packet (header included)
    pub fn send(&self, handle: ConnectionHandle, packet: Vec<u8>) {
        self.inner.send(handle, packet)
    }

    pub(crate) fn on_number_of_completed_packets(&self, data: &NumberOfCompletedPacketsData) {
        self.inner.on_number_of_completed_packets(data)
    }

    pub(crate) fn on_inbound(&self, packet: &[u8]) {
        self.inner.on_inbound(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingDriver;
    use crate::transport::Transport;
    use crate::{AclBroadcastFlag, AclPacketBoundary};
    use bluejay_core::dispatch::Dispatcher;

    fn acl(handle: u16, payload: &[u8]) -> HciAclData {
        HciAclData::new(
            ConnectionHandle::try_from(handle).unwrap(),
            AclPacketBoundary::FirstNonFlushable,
            AclBroadcastFlag::NoBroadcast,
            payload.to_vec(),
        )
    }

    fn nocp(handle: u16, count: u16) -> NumberOfCompletedPacketsData {
        NumberOfCompletedPacketsData {
            completed_packets: alloc::vec![crate::events::NumberOfCompletedPacket {
                connection_handle: ConnectionHandle::try_from(handle).ok(),
                completed_packets: count,
            }],
        }
    }

    fn new_channel() -> (AclDataChannel, RecordingDriver, Dispatcher) {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher.clone());

        let channel = transport.acl_data_channel();

        channel.set_buffer_info(
            BufferInfo {
                max_data_length: 27,
                num_packets: 2,
            },
            None,
        );

        (channel, driver, dispatcher)
    }

    #[test]
    fn credits_bound_outstanding_packets() {
        let (channel, driver, dispatcher) = new_channel();

        channel.register_link(
            ConnectionHandle::try_from(0x01u16).unwrap(),
            AclBufferPool::BrEdr,
            Box::new(|_| ()),
        );

        for index in 0..4 {
            channel.send(acl(0x01, &[index]));
        }

        dispatcher.run_until_idle();

        assert_eq!(2, driver.sent.borrow().len());

        channel.on_number_of_completed_packets(&nocp(0x01, 1));

        assert_eq!(3, driver.sent.borrow().len());

        channel.on_number_of_completed_packets(&nocp(0x01, 2));

        assert_eq!(4, driver.sent.borrow().len());
    }

    #[test]
    fn round_robin_across_links() {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher);

        let channel = transport.acl_data_channel();

        // a single credit forces the scheduler to pick one link per completion
        channel.set_buffer_info(
            BufferInfo {
                max_data_length: 27,
                num_packets: 1,
            },
            None,
        );

        channel.register_link(
            ConnectionHandle::try_from(0x01u16).unwrap(),
            AclBufferPool::BrEdr,
            Box::new(|_| ()),
        );

        channel.register_link(
            ConnectionHandle::try_from(0x02u16).unwrap(),
            AclBufferPool::BrEdr,
            Box::new(|_| ()),
        );

        channel.send(acl(0x01, &[1]));
        channel.send(acl(0x01, &[2]));
        channel.send(acl(0x02, &[3]));

        channel.on_number_of_completed_packets(&nocp(0x01, 1));
        channel.on_number_of_completed_packets(&nocp(0x02, 1));

        let handles: Vec<u16> = driver
            .sent
            .borrow()
            .iter()
            .map(|(_, packet)| u16::from_le_bytes([packet[0], packet[1]]) & 0xFFF)
            .collect();

        // the second link got its turn before the first link's second packet
        assert_eq!(&[0x01, 0x02, 0x01], handles.as_slice());
    }

    #[test]
    fn unknown_handle_packets_flush_to_a_late_link() {
        let (channel, _driver, dispatcher) = new_channel();

        let received = Rc::new(RefCell::new(Vec::new()));

        channel.on_inbound(acl(0x42, &[0xAA]));

        let received_clone = received.clone();

        channel.register_link(
            ConnectionHandle::try_from(0x42u16).unwrap(),
            AclBufferPool::BrEdr,
            Box::new(move |data| received_clone.borrow_mut().push(data)),
        );

        dispatcher.run_until_idle();

        assert_eq!(1, received.borrow().len());
        assert_eq!(&[0xAA], received.borrow()[0].get_payload());
    }

    #[test]
    fn unknown_handle_packets_expire() {
        let (channel, _driver, dispatcher) = new_channel();

        channel.on_inbound(acl(0x42, &[0xAA]));

        dispatcher.advance(UNKNOWN_HANDLE_HOLD);

        let received = Rc::new(RefCell::new(Vec::new()));

        let received_clone = received.clone();

        channel.register_link(
            ConnectionHandle::try_from(0x42u16).unwrap(),
            AclBufferPool::BrEdr,
            Box::new(move |data| received_clone.borrow_mut().push(data)),
        );

        dispatcher.run_until_idle();

        assert!(received.borrow().is_empty());
    }
}
