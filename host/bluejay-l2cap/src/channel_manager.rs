//! The channel manager
//!
//! One `ChannelManager` exists per adapter. The connection managers register a logical link for
//! each ACL connection they establish; services register PSMs for inbound channels; everything
//! else is channel plumbing handled per link.

use crate::channel::Channel;
use crate::channel_id::{AclCid, LeCid};
use crate::logical_link::{self, LinkHooks, LinkState};
use crate::signaling::{self, ConnectionParameterUpdate};
use crate::{ChannelError, ChannelParameters, LinkKind, Psm};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use bluejay_core::dispatch::Dispatcher;
use bluejay_hci::command_channel::CommandChannel;
use bluejay_hci::data::{AclBufferPool, AclDataChannel};
use bluejay_hci::ConnectionHandle;
use core::cell::RefCell;

struct ServiceEntry {
    params: ChannelParameters,
    callback: Rc<dyn Fn(Channel)>,
}

struct ManagerState {
    dispatcher: Dispatcher,
    acl: AclDataChannel,
    command_channel: CommandChannel,
    links: BTreeMap<u16, Rc<RefCell<LinkState>>>,
    services: Rc<RefCell<BTreeMap<u16, ServiceEntry>>>,
}

/// The L2CAP channel manager
#[derive(Clone)]
pub struct ChannelManager {
    state: Rc<RefCell<ManagerState>>,
}

impl ChannelManager {
    /// Create a new `ChannelManager` over the ACL data channel
    pub fn new(acl: AclDataChannel, command_channel: CommandChannel, dispatcher: Dispatcher) -> Self {
        ChannelManager {
            state: Rc::new(RefCell::new(ManagerState {
                dispatcher,
                acl,
                command_channel,
                links: BTreeMap::new(),
                services: Rc::new(RefCell::new(BTreeMap::new())),
            })),
        }
    }

    /// Register the logical link for a new ACL connection
    ///
    /// The link's fixed channels exist from this point and inbound data for the handle routes
    /// into the recombiner.
    pub fn register_link(&self, handle: ConnectionHandle, kind: LinkKind, hooks: LinkHooks) {
        let (acl, command_channel, dispatcher, services) = {
            let state = self.state.borrow();

            (
                state.acl.clone(),
                state.command_channel.clone(),
                state.dispatcher.clone(),
                state.services.clone(),
            )
        };

        let pool = match kind {
            LinkKind::AclU => AclBufferPool::BrEdr,
            LinkKind::LeU => AclBufferPool::LowEnergy,
        };

        let max_acl_payload = acl.max_packet_payload(pool);

        let link = logical_link::new_link(
            handle,
            kind,
            max_acl_payload,
            acl.clone(),
            command_channel,
            dispatcher,
            hooks,
        );

        {
            let mut state = link.borrow_mut();

            let query_services = services.clone();

            state.service_query = Some(Rc::new(move |psm| {
                query_services.borrow().get(&psm).map(|entry| entry.params)
            }));

            let dispatch_services = services;

            state.service_dispatch = Some(Rc::new(move |psm, channel| {
                let callback = dispatch_services
                    .borrow()
                    .get(&psm)
                    .map(|entry| entry.callback.clone());

                match callback {
                    Some(callback) => callback(channel),
                    None => channel.deactivate(),
                }
            }));
        }

        let weak = Rc::downgrade(&link);

        acl.register_link(
            handle,
            pool,
            Box::new(move |fragment| {
                if let Some(link) = weak.upgrade() {
                    logical_link::on_rx_fragment(&link, fragment);
                }
            }),
        );

        // the scheduler's cue to drain more queued SDUs, installed once the link is registered
        let ready = Rc::downgrade(&link);

        acl.set_ready_callback(
            handle,
            Box::new(move || {
                if let Some(link) = ready.upgrade() {
                    logical_link::flush(&link);
                }
            }),
        );

        self.state.borrow_mut().links.insert(handle.get_raw_handle(), link);

        log::info!("(L2CAP) registered {:?} link for handle {}", kind, handle);
    }

    /// Remove the logical link of a disconnected handle
    ///
    /// Channels close without signaling the (gone) peer.
    pub fn remove_link(&self, handle: ConnectionHandle) {
        let link = {
            let mut state = self.state.borrow_mut();

            state.links.remove(&handle.get_raw_handle())
        };

        if let Some(link) = link {
            logical_link::close_link(&link);

            self.state.borrow().acl.unregister_link(handle);
        }
    }

    /// Check if a link is registered for `handle`
    pub fn has_link(&self, handle: ConnectionHandle) -> bool {
        self.state.borrow().links.contains_key(&handle.get_raw_handle())
    }

    /// Get a handle to a fixed channel of a link
    pub fn open_fixed_channel(&self, handle: ConnectionHandle, cid: u16) -> Option<Channel> {
        let link = self.state.borrow().links.get(&handle.get_raw_handle()).cloned()?;

        logical_link::fixed_channel(&link, cid)
    }

    /// Get the Attribute Protocol fixed channel of an LE link
    pub fn open_att_channel(&self, handle: ConnectionHandle) -> Option<Channel> {
        self.open_fixed_channel(handle, LeCid::AttributeProtocol.to_cid())
    }

    /// Get the Security Manager fixed channel of an LE link
    pub fn open_le_smp_channel(&self, handle: ConnectionHandle) -> Option<Channel> {
        self.open_fixed_channel(handle, LeCid::SecurityManagerProtocol.to_cid())
    }

    /// Get the Security Manager fixed channel of a BR/EDR link
    pub fn open_bredr_smp_channel(&self, handle: ConnectionHandle) -> Option<Channel> {
        self.open_fixed_channel(handle, AclCid::SecurityManagerChannel.to_cid())
    }

    /// Open a dynamic (PSM addressed) channel
    pub fn open_channel(
        &self,
        handle: ConnectionHandle,
        psm: Psm,
        params: ChannelParameters,
        callback: impl FnOnce(Result<Channel, ChannelError>) + 'static,
    ) {
        let link = self.state.borrow().links.get(&handle.get_raw_handle()).cloned();

        match link {
            Some(link) => signaling::open_channel(&link, psm, params, Box::new(callback)),
            None => callback(Err(ChannelError::ChannelClosed)),
        }
    }

    /// Register a service for inbound channels to `psm`
    ///
    /// Returns false when the PSM already has a service.
    pub fn register_service(
        &self,
        psm: Psm,
        params: ChannelParameters,
        callback: impl Fn(Channel) + 'static,
    ) -> bool {
        let state = self.state.borrow();
        let mut services = state.services.borrow_mut();

        if services.contains_key(&psm.0) {
            return false;
        }

        services.insert(
            psm.0,
            ServiceEntry {
                params,
                callback: Rc::new(callback),
            },
        );

        true
    }

    /// Remove the service of `psm`
    pub fn unregister_service(&self, psm: Psm) {
        let state = self.state.borrow();

        state.services.borrow_mut().remove(&psm.0);
    }

    /// Install the handler for LE connection parameter update requests on `handle`
    pub fn set_parameter_update_handler(
        &self,
        handle: ConnectionHandle,
        handler: impl FnMut(ConnectionParameterUpdate) -> bool + 'static,
    ) {
        if let Some(link) = self.state.borrow().links.get(&handle.get_raw_handle()) {
            link.borrow_mut().parameter_update_handler = Some(Box::new(handler));
        }
    }

    /// Send an LE connection parameter update request (peripheral role)
    pub fn request_connection_parameter_update(
        &self,
        handle: ConnectionHandle,
        parameters: ConnectionParameterUpdate,
        callback: impl FnOnce(bool) + 'static,
    ) {
        let link = self.state.borrow().links.get(&handle.get_raw_handle()).cloned();

        match link {
            Some(link) =>

                signaling::request_connection_parameter_update(&link, parameters, Box::new(callback)),
            None => callback(false),
        }
    }

    /// Get the registered link handles
    pub fn link_handles(&self) -> Vec<u16> {
        self.state.borrow().links.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluejay_core::errors::HostError;
    use bluejay_core::security::SecurityLevel;
    use bluejay_hci::data::BufferInfo;
    use bluejay_hci::transport::testing::RecordingDriver;
    use bluejay_hci::transport::{HciPacketType, Transport};

    fn hooks() -> LinkHooks {
        LinkHooks {
            error: Box::new(|| ()),
            security: Box::new(|_: SecurityLevel, callback: Box<dyn FnOnce(Result<(), HostError>)>| {
                callback(Ok(()))
            }),
            acl_priority: None,
        }
    }

    struct Fixture {
        transport: Transport,
        driver: RecordingDriver,
        dispatcher: Dispatcher,
        manager: ChannelManager,
    }

    fn fixture(num_packets: usize) -> Fixture {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher.clone());

        transport.acl_data_channel().set_buffer_info(
            BufferInfo {
                max_data_length: 27,
                num_packets,
            },
            None,
        );

        let manager = ChannelManager::new(
            transport.acl_data_channel(),
            transport.command_channel(),
            dispatcher.clone(),
        );

        Fixture {
            transport,
            driver,
            dispatcher,
            manager,
        }
    }

    fn handle() -> ConnectionHandle {
        ConnectionHandle::try_from(0x0010u16).unwrap()
    }

    /// Wrap an L2CAP payload for `cid` into a complete inbound HCI ACL packet
    fn inbound(cid: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();

        packet.extend_from_slice(&0x0010u16.to_le_bytes()); // handle, PB first non flush
        packet.extend_from_slice(&((payload.len() + 4) as u16).to_le_bytes());
        packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        packet.extend_from_slice(&cid.to_le_bytes());
        packet.extend_from_slice(payload);

        packet
    }

    /// Extract the L2CAP payloads of the outbound ACL packets for `cid`
    fn sent_pdus(driver: &RecordingDriver, cid: u16) -> Vec<Vec<u8>> {
        let mut pdus = Vec::new();

        for (packet_type, packet) in driver.sent.borrow().iter() {
            if *packet_type != HciPacketType::AclData {
                continue;
            }

            // tests keep PDUs within one fragment
            let destination = u16::from_le_bytes([packet[6], packet[7]]);

            if destination == cid {
                pdus.push(packet[8..].to_vec());
            }
        }

        pdus
    }

    #[test]
    fn tx_queue_overflow_drops_oldest() {
        let fixture = fixture(0); // no credits: nothing leaves the queues

        fixture.manager.register_link(handle(), LinkKind::LeU, hooks());

        let channel = fixture.manager.open_att_channel(handle()).unwrap();

        channel.activate(|_| (), || ()).unwrap();
        channel.set_max_tx_queued(3);

        for index in 0u8..5 {
            channel.send(alloc::vec![index]);
        }

        // hold the newest data; the first two submissions fell off
        assert_eq!(2, channel.dropped_sdus());
        assert_eq!(3, channel.queued_sdus());
    }

    #[test]
    fn fixed_channel_round_trip() {
        let fixture = fixture(4);

        fixture.manager.register_link(handle(), LinkKind::LeU, hooks());

        let channel = fixture.manager.open_att_channel(handle()).unwrap();

        let received = Rc::new(RefCell::new(Vec::new()));

        let received_clone = received.clone();

        channel
            .activate(move |sdu| received_clone.borrow_mut().push(sdu), || ())
            .unwrap();

        channel.send(alloc::vec![0x02, 0x01, 0x00]);

        fixture.dispatcher.run_until_idle();

        let pdus = sent_pdus(&fixture.driver, 0x0004);

        assert_eq!(1, pdus.len());
        assert_eq!(&[0x02, 0x01, 0x00], pdus[0].as_slice());

        // and inbound
        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0004, &[0x03, 0x00, 0x17]));

        fixture.dispatcher.run_until_idle();

        assert_eq!(1, received.borrow().len());
        assert_eq!(&[0x03, 0x00, 0x17], received.borrow()[0].as_slice());
    }

    #[test]
    fn pre_activation_rx_is_buffered_in_order() {
        let fixture = fixture(4);

        fixture.manager.register_link(handle(), LinkKind::LeU, hooks());

        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0004, &[1]));
        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0004, &[2]));

        let channel = fixture.manager.open_att_channel(handle()).unwrap();

        let received = Rc::new(RefCell::new(Vec::new()));

        let received_clone = received.clone();

        channel
            .activate(move |sdu| received_clone.borrow_mut().push(sdu), || ())
            .unwrap();

        assert_eq!(2, received.borrow().len());
        assert_eq!(&[1u8], received.borrow()[0].as_slice());
        assert_eq!(&[2u8], received.borrow()[1].as_slice());

        // activation is once only
        assert!(channel.activate(|_| (), || ()).is_err());
    }

    #[test]
    fn dynamic_channel_connect_and_configure() {
        let fixture = fixture(8);

        fixture.manager.register_link(handle(), LinkKind::AclU, hooks());

        let opened = Rc::new(RefCell::new(None));

        let opened_clone = opened.clone();

        fixture.manager.open_channel(
            handle(),
            Psm::RFCOMM,
            ChannelParameters::default(),
            move |result| *opened_clone.borrow_mut() = Some(result),
        );

        fixture.dispatcher.run_until_idle();

        // the connection request went out on the signaling channel
        let signals = sent_pdus(&fixture.driver, 0x0001);

        assert_eq!(1, signals.len());
        assert_eq!(0x02, signals[0][0]); // connection request
        let identifier = signals[0][1];
        assert_eq!(&[0x03, 0x00], &signals[0][4..6]); // PSM
        let source_cid = u16::from_le_bytes([signals[0][6], signals[0][7]]);

        // peer accepts with its cid 0x0071
        let mut response = alloc::vec![0x03, identifier, 0x08, 0x00];

        response.extend_from_slice(&0x0071u16.to_le_bytes());
        response.extend_from_slice(&source_cid.to_le_bytes());
        response.extend_from_slice(&0u16.to_le_bytes());
        response.extend_from_slice(&0u16.to_le_bytes());

        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0001, &response));

        fixture.dispatcher.run_until_idle();

        // our configuration request followed
        let signals = sent_pdus(&fixture.driver, 0x0001);

        assert_eq!(2, signals.len());
        assert_eq!(0x04, signals[1][0]);

        let config_identifier = signals[1][1];

        // peer configures its direction
        let mut peer_config = alloc::vec![0x04, 0x07, 0x08, 0x00];

        peer_config.extend_from_slice(&source_cid.to_le_bytes());
        peer_config.extend_from_slice(&0u16.to_le_bytes());
        peer_config.extend_from_slice(&[0x01, 0x02, 0x00, 0x04]); // MTU 1024

        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0001, &peer_config));

        fixture.dispatcher.run_until_idle();

        // we answered with a configuration response, success
        let signals = sent_pdus(&fixture.driver, 0x0001);

        assert_eq!(3, signals.len());
        assert_eq!(0x05, signals[2][0]);
        assert_eq!(&[0x00, 0x00], &signals[2][8..10]);

        // not open yet: our configuration response is still outstanding
        assert!(opened.borrow().is_none());

        // peer accepts our configuration
        let mut config_response = alloc::vec![0x05, config_identifier, 0x06, 0x00];

        config_response.extend_from_slice(&source_cid.to_le_bytes());
        config_response.extend_from_slice(&0u16.to_le_bytes());
        config_response.extend_from_slice(&0u16.to_le_bytes());

        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0001, &config_response));

        fixture.dispatcher.run_until_idle();

        let opened = opened.borrow_mut().take().unwrap().unwrap();

        assert_eq!(Some(source_cid), opened.local_cid());
        assert_eq!(Some(0x0071), opened.remote_cid());
        assert_eq!(Some(1024), opened.max_tx_sdu_size());
    }

    #[test]
    fn unknown_psm_is_refused() {
        let fixture = fixture(8);

        fixture.manager.register_link(handle(), LinkKind::AclU, hooks());

        // inbound connection request for a PSM nothing registered
        let mut request = alloc::vec![0x02, 0x09, 0x04, 0x00];

        request.extend_from_slice(&0x0019u16.to_le_bytes());
        request.extend_from_slice(&0x0050u16.to_le_bytes());

        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0001, &request));

        fixture.dispatcher.run_until_idle();

        let signals = sent_pdus(&fixture.driver, 0x0001);

        assert_eq!(1, signals.len());
        assert_eq!(0x03, signals[0][0]);
        // result: PSM not supported
        assert_eq!(&[0x02, 0x00], &signals[0][8..10]);
    }

    #[test]
    fn inbound_channel_dispatches_to_the_service() {
        let fixture = fixture(8);

        fixture.manager.register_link(handle(), LinkKind::AclU, hooks());

        let accepted = Rc::new(RefCell::new(None));

        let accepted_clone = accepted.clone();

        assert!(fixture.manager.register_service(
            Psm::AVDTP,
            ChannelParameters::default(),
            move |channel| *accepted_clone.borrow_mut() = Some(channel),
        ));

        // peer opens a channel to the PSM
        let mut request = alloc::vec![0x02, 0x05, 0x04, 0x00];

        request.extend_from_slice(&Psm::AVDTP.0.to_le_bytes());
        request.extend_from_slice(&0x0060u16.to_le_bytes());

        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0001, &request));

        fixture.dispatcher.run_until_idle();

        let signals = sent_pdus(&fixture.driver, 0x0001);

        // connection response (success) and our configuration request
        assert_eq!(2, signals.len());
        assert_eq!(0x03, signals[0][0]);
        assert_eq!(&[0x00, 0x00], &signals[0][8..10]);
        assert_eq!(0x04, signals[1][0]);

        let local_cid = u16::from_le_bytes([signals[0][4], signals[0][5]]);
        let config_identifier = signals[1][1];

        // peer configures us and accepts our configuration
        let mut peer_config = alloc::vec![0x04, 0x0A, 0x04, 0x00];

        peer_config.extend_from_slice(&local_cid.to_le_bytes());
        peer_config.extend_from_slice(&0u16.to_le_bytes());

        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0001, &peer_config));

        let mut config_response = alloc::vec![0x05, config_identifier, 0x06, 0x00];

        config_response.extend_from_slice(&local_cid.to_le_bytes());
        config_response.extend_from_slice(&0u16.to_le_bytes());
        config_response.extend_from_slice(&0u16.to_le_bytes());

        fixture
            .transport
            .on_received_packet(HciPacketType::AclData, &inbound(0x0001, &config_response));

        fixture.dispatcher.run_until_idle();

        assert!(accepted.borrow().is_some());
    }
}
