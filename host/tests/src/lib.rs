//! Test support for the assembled host
//!
//! The centerpiece is the [`FakeController`]: a [`ControllerDriver`] scripted per opcode. When
//! the host sends a command, the fake looks up the scripted reply packets and injects them back
//! through the transport on the next dispatcher turn (never synchronously, matching how a real
//! Controller interleaves with the host). Commands with no script get a generic success Command
//! Complete, which is right for every write-style command.
//!
//! The [`events`] module builds the event packets the scripts are made of.
//!
//! [`ControllerDriver`]: bluejay_hci::transport::ControllerDriver

use bluejay_core::dispatch::Dispatcher;
use bluejay_hci::transport::{ControllerDriver, DriverFeatures, HciPacketType, Transport};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

struct FakeInner {
    dispatcher: Dispatcher,
    transport: Option<Transport>,
    /// Scripted replies per opcode, consumed front first; each entry is the packets of one send
    scripts: BTreeMap<u16, VecDeque<Vec<Vec<u8>>>>,
    sent: Vec<(HciPacketType, Vec<u8>)>,
    auto_ack: bool,
}

/// A scripted in-process Controller
#[derive(Clone)]
pub struct FakeController {
    inner: Rc<RefCell<FakeInner>>,
    features: DriverFeatures,
}

impl FakeController {
    pub fn new(dispatcher: Dispatcher) -> Self {
        FakeController {
            inner: Rc::new(RefCell::new(FakeInner {
                dispatcher,
                transport: None,
                scripts: BTreeMap::new(),
                sent: Vec::new(),
                auto_ack: true,
            })),
            features: DriverFeatures::default(),
        }
    }

    pub fn with_features(mut self, features: DriverFeatures) -> Self {
        self.features = features;

        self
    }

    /// Attach the transport the fake injects inbound packets through
    pub fn attach(&self, transport: Transport) {
        self.inner.borrow_mut().transport = Some(transport);
    }

    /// Script the reply packets for the next send of `opcode`
    pub fn on_command(&self, opcode: u16, reply_packets: Vec<Vec<u8>>) {
        self.inner
            .borrow_mut()
            .scripts
            .entry(opcode)
            .or_default()
            .push_back(reply_packets);
    }

    /// Inject an unsolicited event
    pub fn inject_event(&self, packet: Vec<u8>) {
        let (transport, dispatcher) = {
            let inner = self.inner.borrow();

            (inner.transport.clone(), inner.dispatcher.clone())
        };

        let transport = transport.expect("no transport attached to the fake controller");

        dispatcher.post(move || transport.on_received_packet(HciPacketType::Event, &packet));
    }

    /// Inject an inbound ACL data packet
    pub fn inject_acl(&self, packet: Vec<u8>) {
        let (transport, dispatcher) = {
            let inner = self.inner.borrow();

            (inner.transport.clone(), inner.dispatcher.clone())
        };

        let transport = transport.expect("no transport attached to the fake controller");

        dispatcher.post(move || transport.on_received_packet(HciPacketType::AclData, &packet));
    }

    /// The opcodes of every command the host sent, in order
    pub fn sent_command_opcodes(&self) -> Vec<u16> {
        self.inner
            .borrow()
            .sent
            .iter()
            .filter(|(packet_type, _)| *packet_type == HciPacketType::Command)
            .map(|(_, packet)| u16::from_le_bytes([packet[0], packet[1]]))
            .collect()
    }

    /// Count of sends of one opcode
    pub fn count_of(&self, opcode: u16) -> usize {
        self.sent_command_opcodes()
            .iter()
            .filter(|sent| **sent == opcode)
            .count()
    }

    /// The outbound ACL packets the host sent
    pub fn sent_acl_packets(&self) -> Vec<Vec<u8>> {
        self.inner
            .borrow()
            .sent
            .iter()
            .filter(|(packet_type, _)| *packet_type == HciPacketType::AclData)
            .map(|(_, packet)| packet.clone())
            .collect()
    }
}

impl ControllerDriver for FakeController {
    fn send_packet(&mut self, packet_type: HciPacketType, packet: &[u8]) {
        let replies = {
            let mut inner = self.inner.borrow_mut();

            inner.sent.push((packet_type, packet.to_vec()));

            if packet_type != HciPacketType::Command {
                return;
            }

            let opcode = u16::from_le_bytes([packet[0], packet[1]]);

            let scripted = inner
                .scripts
                .get_mut(&opcode)
                .and_then(|queue| queue.pop_front());

            match scripted {
                Some(replies) => replies,
                None if inner.auto_ack => vec![events::command_complete(opcode, &[0x00])],
                None => Vec::new(),
            }
        };

        let (transport, dispatcher) = {
            let inner = self.inner.borrow();

            (inner.transport.clone(), inner.dispatcher.clone())
        };

        let Some(transport) = transport else { return };

        for reply in replies {
            let transport = transport.clone();

            dispatcher.post(move || transport.on_received_packet(HciPacketType::Event, &reply));
        }
    }

    fn get_features(&self) -> DriverFeatures {
        self.features
    }
}

/// Builders of the event packets scripts are made of
pub mod events {
    /// Command Complete with one command credit
    pub fn command_complete(opcode: u16, return_parameter: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x0E, (3 + return_parameter.len()) as u8, 0x01];

        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.extend_from_slice(return_parameter);

        packet
    }

    /// Command Status with one command credit
    pub fn command_status(opcode: u16, status: u8) -> Vec<u8> {
        let mut packet = vec![0x0F, 0x04, status, 0x01];

        packet.extend_from_slice(&opcode.to_le_bytes());

        packet
    }

    pub fn connection_request(address: [u8; 6], class_of_device: u32, link_type: u8) -> Vec<u8> {
        let mut packet = vec![0x04, 0x0A];

        packet.extend_from_slice(&address);
        packet.extend_from_slice(&class_of_device.to_le_bytes()[..3]);
        packet.push(link_type);

        packet
    }

    pub fn connection_complete(status: u8, handle: u16, address: [u8; 6]) -> Vec<u8> {
        let mut packet = vec![0x03, 0x0B, status];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.extend_from_slice(&address);
        packet.push(0x01); // ACL
        packet.push(0x00); // encryption off

        packet
    }

    pub fn disconnection_complete(handle: u16, reason: u8) -> Vec<u8> {
        let mut packet = vec![0x05, 0x04, 0x00];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.push(reason);

        packet
    }

    pub fn role_change(address: [u8; 6], new_role: u8) -> Vec<u8> {
        let mut packet = vec![0x12, 0x08, 0x00];

        packet.extend_from_slice(&address);
        packet.push(new_role);

        packet
    }

    pub fn le_connection_complete(status: u8, handle: u16, role: u8, peer_address: [u8; 6]) -> Vec<u8> {
        let mut packet = vec![0x3E, 0x13, 0x01, status];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.push(role);
        packet.push(0x01); // peer address type random
        packet.extend_from_slice(&peer_address);
        packet.extend_from_slice(&0x0018u16.to_le_bytes()); // interval
        packet.extend_from_slice(&0x0000u16.to_le_bytes()); // latency
        packet.extend_from_slice(&0x002Au16.to_le_bytes()); // supervision timeout
        packet.push(0x00); // clock accuracy

        packet
    }

    pub fn le_advertising_report(address: [u8; 6], event_type: u8, data: &[u8]) -> Vec<u8> {
        let mut packet = vec![
            0x3E,
            (11 + data.len() + 1) as u8,
            0x02,
            0x01,
            event_type,
            0x01, // random address
        ];

        packet.extend_from_slice(&address);
        packet.push(data.len() as u8);
        packet.extend_from_slice(data);
        packet.push(0xC8);

        packet
    }

    pub fn le_read_remote_features_complete(handle: u16, features: [u8; 8]) -> Vec<u8> {
        let mut packet = vec![0x3E, 0x0C, 0x04, 0x00];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.extend_from_slice(&features);

        packet
    }

    pub fn read_remote_version_complete(handle: u16, version: u8, company: u16, subversion: u16) -> Vec<u8> {
        let mut packet = vec![0x0C, 0x08, 0x00];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.push(version);
        packet.extend_from_slice(&company.to_le_bytes());
        packet.extend_from_slice(&subversion.to_le_bytes());

        packet
    }

    pub fn read_remote_supported_features_complete(handle: u16, features: [u8; 8]) -> Vec<u8> {
        let mut packet = vec![0x0B, 0x0B, 0x00];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.extend_from_slice(&features);

        packet
    }

    pub fn read_remote_extended_features_complete(
        handle: u16,
        page: u8,
        max_page: u8,
        features: [u8; 8],
    ) -> Vec<u8> {
        let mut packet = vec![0x23, 0x0D, 0x00];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.push(page);
        packet.push(max_page);
        packet.extend_from_slice(&features);

        packet
    }

    pub fn io_capability_request(address: [u8; 6]) -> Vec<u8> {
        let mut packet = vec![0x31, 0x06];

        packet.extend_from_slice(&address);

        packet
    }

    pub fn io_capability_response(address: [u8; 6], io_capability: u8, mitm: bool) -> Vec<u8> {
        let mut packet = vec![0x32, 0x09];

        packet.extend_from_slice(&address);
        packet.push(io_capability);
        packet.push(0x00); // no OOB data
        packet.push(if mitm { 0x05 } else { 0x04 });

        packet
    }

    pub fn user_confirmation_request(address: [u8; 6], value: u32) -> Vec<u8> {
        let mut packet = vec![0x33, 0x0A];

        packet.extend_from_slice(&address);
        packet.extend_from_slice(&value.to_le_bytes());

        packet
    }

    pub fn simple_pairing_complete(address: [u8; 6], status: u8) -> Vec<u8> {
        let mut packet = vec![0x36, 0x07, status];

        packet.extend_from_slice(&address);

        packet
    }

    pub fn link_key_notification(address: [u8; 6], key: [u8; 16], key_type: u8) -> Vec<u8> {
        let mut packet = vec![0x18, 0x17];

        packet.extend_from_slice(&address);
        packet.extend_from_slice(&key);
        packet.push(key_type);

        packet
    }

    pub fn encryption_change(handle: u16, enabled: u8) -> Vec<u8> {
        let mut packet = vec![0x08, 0x04, 0x00];

        packet.extend_from_slice(&handle.to_le_bytes());
        packet.push(enabled);

        packet
    }

    pub fn authentication_complete(handle: u16, status: u8) -> Vec<u8> {
        let mut packet = vec![0x06, 0x03, status];

        packet.extend_from_slice(&handle.to_le_bytes());

        packet
    }
}

/// A pairing delegate that consents to everything
pub struct AcceptingDelegate;

impl bluejay_gap::PairingDelegate for AcceptingDelegate {
    fn display_passkey(&self, _: bluejay_gap::PeerId, _: u32) {}

    fn confirm_pairing(
        &self,
        _: bluejay_gap::PeerId,
        _: Option<u32>,
        respond: Box<dyn FnOnce(bool)>,
    ) {
        respond(true)
    }

    fn request_passkey(&self, _: bluejay_gap::PeerId, respond: Box<dyn FnOnce(Option<u32>)>) {
        respond(Some(0))
    }

    fn request_pin_code(&self, _: bluejay_gap::PeerId, respond: Box<dyn FnOnce(Option<Vec<u8>>)>) {
        respond(Some(vec![0x30, 0x30, 0x30, 0x30]))
    }

    fn on_pairing_complete(&self, _: bluejay_gap::PeerId, _: bool) {}
}

/// A fully initialized adapter over a scripted controller
pub struct HostFixture {
    pub dispatcher: Dispatcher,
    pub controller: FakeController,
    pub transport: Transport,
    pub adapter: bluejay_gap::Adapter,
}

/// LMP feature page 0 with LE, BR/EDR, and Secure Simple Pairing
pub fn dual_mode_lmp_features() -> [u8; 8] {
    let mut features = [0u8; 8];

    features[4] |= 1 << 6; // bit 38: LE supported
    features[6] |= 1 << 3; // bit 51: secure simple pairing

    features
}

/// Script every command of the four step boot sequence
pub fn script_initialization(controller: &FakeController) {
    use events::command_complete;

    // local version: HCI 11 (5.2)
    controller.on_command(
        0x1001,
        vec![command_complete(
            0x1001,
            &[0x00, 0x0B, 0x00, 0x00, 0x0B, 0x0F, 0x00, 0x01, 0x00],
        )],
    );

    // supported commands: all zero keeps the v1 LE buffer read and no optional extras
    let mut commands_return = vec![0x00];

    commands_return.extend_from_slice(&[0u8; 64]);

    controller.on_command(0x1002, vec![command_complete(0x1002, &commands_return)]);

    let mut features_return = vec![0x00];

    features_return.extend_from_slice(&dual_mode_lmp_features());

    controller.on_command(0x1003, vec![command_complete(0x1003, &features_return)]);

    controller.on_command(
        0x1009,
        vec![command_complete(0x1009, &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66])],
    );

    // ACL 251 x 8, SCO 60 x 8
    controller.on_command(
        0x1005,
        vec![command_complete(
            0x1005,
            &[0x00, 0xFB, 0x00, 0x3C, 0x08, 0x00, 0x08, 0x00],
        )],
    );

    // LE buffer v1: 27 x 8
    controller.on_command(0x2002, vec![command_complete(0x2002, &[0x00, 0x1B, 0x00, 0x08])]);

    // LE features: legacy advertising only
    let mut le_features_return = vec![0x00];

    le_features_return.extend_from_slice(&[0u8; 8]);

    controller.on_command(0x2003, vec![command_complete(0x2003, &le_features_return)]);

    // extended LMP page 1, maximum page 1
    controller.on_command(
        0x1004,
        vec![command_complete(
            0x1004,
            &[0x00, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        )],
    );
}

/// Bring up an adapter against a scripted controller
pub fn initialized_host() -> HostFixture {
    initialized_host_with(|builder| builder)
}

/// Bring up an adapter, with a hand on the builder first
pub fn initialized_host_with(
    configure: impl FnOnce(bluejay_gap::AdapterBuilder) -> bluejay_gap::AdapterBuilder,
) -> HostFixture {
    let dispatcher = Dispatcher::new();

    let controller = FakeController::new(dispatcher.clone());

    let transport = Transport::new(Box::new(controller.clone()), dispatcher.clone());

    controller.attach(transport.clone());

    script_initialization(&controller);

    let adapter = configure(bluejay_gap::AdapterBuilder::new().local_name("host under test"))
        .build(transport.clone());

    let initialized = Rc::new(RefCell::new(None));

    let sink = initialized.clone();

    adapter.initialize(move |result| *sink.borrow_mut() = Some(result));

    dispatcher.run_until_idle();

    assert_eq!(
        Some(Ok(())),
        *initialized.borrow(),
        "adapter initialization did not complete"
    );

    HostFixture {
        dispatcher,
        controller,
        transport,
        adapter,
    }
}
