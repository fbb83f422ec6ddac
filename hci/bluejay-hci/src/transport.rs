//! The HCI transport
//!
//! [`Transport`] ties the pieces of the HCI together: it owns the [`ControllerDriver`] (the byte
//! pipe to the Controller), the [`CommandChannel`], and the three data channels. Inbound packets
//! from the driver enter through [`Transport::on_received_packet`] and are demultiplexed from
//! there; outbound packets from the channels funnel through the shared driver.
//!
//! A fatal transport condition (a command timeout, an invalid packet from the driver) marks the
//! transport down, stops all further traffic, and fires the error callback exactly once. A down
//! transport is unrecoverable; the owner is expected to tear everything down.

use crate::command_channel::CommandChannel;
use crate::data::{AclDataChannel, IsoDataChannel, ScoDataChannel};
use crate::events::EventsData;
use crate::HciAclData;
use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::{Cell, RefCell};
use core::fmt;

use bluejay_core::dispatch::Dispatcher;

/// The HCI packet types
///
/// Every packet crossing the transport is one of these. The numeric values are the H4 packet
/// indicators (see [`h4`](crate::h4)).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HciPacketType {
    Command,
    AclData,
    ScoData,
    Event,
    IsoData,
}

impl HciPacketType {
    /// Get the H4 packet indicator
    pub fn get_indicator(&self) -> u8 {
        match self {
            HciPacketType::Command => 0x01,
            HciPacketType::AclData => 0x02,
            HciPacketType::ScoData => 0x03,
            HciPacketType::Event => 0x04,
            HciPacketType::IsoData => 0x05,
        }
    }

    /// Get the `HciPacketType` for an H4 packet indicator
    pub fn try_from_indicator(indicator: u8) -> Result<Self, u8> {
        match indicator {
            0x01 => Ok(HciPacketType::Command),
            0x02 => Ok(HciPacketType::AclData),
            0x03 => Ok(HciPacketType::ScoData),
            0x04 => Ok(HciPacketType::Event),
            0x05 => Ok(HciPacketType::IsoData),
            other => Err(other),
        }
    }
}

impl fmt::Display for HciPacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HciPacketType::Command => f.write_str("command"),
            HciPacketType::AclData => f.write_str("ACL data"),
            HciPacketType::ScoData => f.write_str("SCO data"),
            HciPacketType::Event => f.write_str("event"),
            HciPacketType::IsoData => f.write_str("ISO data"),
        }
    }
}

/// Features of the Controller reported by the driver
///
/// These are properties the driver knows out of band (from the vendor encapsulation), not
/// properties discovered through HCI commands.
#[derive(Clone, Copy, Debug, Default)]
pub struct DriverFeatures {
    /// The Controller implements the Android vendor extensions
    pub android_vendor_extensions: bool,
}

/// The driver below the HCI transport
///
/// Implementations move complete HCI packets to the Controller. How the packets get there (UART,
/// USB, an in-process fake) is the implementation's concern; the [`h4`](crate::h4) module has the
/// framing helper for byte pipes. Inbound packets are pushed into the transport by whatever task
/// reads the Controller side, via [`Transport::on_received_packet`].
pub trait ControllerDriver {
    /// Send a complete HCI packet to the Controller
    fn send_packet(&mut self, packet_type: HciPacketType, packet: &[u8]);

    /// Get the out of band features of the Controller
    fn get_features(&self) -> DriverFeatures {
        DriverFeatures::default()
    }
}

/// A fatal transport error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// A command received no response within the command timeout
    CommandTimeout,
    /// The driver delivered a packet that does not parse
    InvalidPacket,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::CommandTimeout => f.write_str("HCI command timed out"),
            TransportError::InvalidPacket => f.write_str("invalid packet from the controller"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransportError {}

pub(crate) struct TransportShared {
    dispatcher: Dispatcher,
    driver: RefCell<Box<dyn ControllerDriver>>,
    features: DriverFeatures,
    error_callback: RefCell<Option<Box<dyn FnOnce(TransportError)>>>,
    down: Cell<bool>,
}

impl TransportShared {
    pub(crate) fn send(&self, packet_type: HciPacketType, packet: &[u8]) {
        if self.down.get() {
            log::trace!("(HCI) transport is down, dropping outbound {} packet", packet_type);

            return;
        }

        self.driver.borrow_mut().send_packet(packet_type, packet)
    }

    pub(crate) fn is_down(&self) -> bool {
        self.down.get()
    }

    /// Mark the transport down and fire the error callback once
    pub(crate) fn signal_error(&self, error: TransportError) {
        if self.down.replace(true) {
            return;
        }

        log::error!("(HCI) fatal transport error: {}", error);

        if let Some(callback) = self.error_callback.borrow_mut().take() {
            self.dispatcher.post(move || callback(error));
        }
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// The assembled HCI transport
///
/// Cloning produces another handle to the same transport.
#[derive(Clone)]
pub struct Transport {
    shared: Rc<TransportShared>,
    command_channel: CommandChannel,
    acl_data_channel: AclDataChannel,
    sco_data_channel: ScoDataChannel,
    iso_data_channel: IsoDataChannel,
}

impl Transport {
    /// Create a new `Transport` over `driver`
    ///
    /// The data channels start with no buffer information; they cannot carry traffic until
    /// their `set_buffer_info` methods are called with the sizes discovered during
    /// initialization.
    pub fn new(driver: Box<dyn ControllerDriver>, dispatcher: Dispatcher) -> Self {
        let features = driver.get_features();

        let shared = Rc::new(TransportShared {
            dispatcher,
            driver: RefCell::new(driver),
            features,
            error_callback: RefCell::new(None),
            down: Cell::new(false),
        });

        let command_channel = CommandChannel::new(shared.clone());
        let acl_data_channel = AclDataChannel::new(shared.clone());
        let sco_data_channel = ScoDataChannel::new(shared.clone());
        let iso_data_channel = IsoDataChannel::new(shared.clone());

        Transport {
            shared,
            command_channel,
            acl_data_channel,
            sco_data_channel,
            iso_data_channel,
        }
    }

    /// Get the command channel
    pub fn command_channel(&self) -> CommandChannel {
        self.command_channel.clone()
    }

    /// Get the ACL data channel
    pub fn acl_data_channel(&self) -> AclDataChannel {
        self.acl_data_channel.clone()
    }

    /// Get the SCO data channel
    pub fn sco_data_channel(&self) -> ScoDataChannel {
        self.sco_data_channel.clone()
    }

    /// Get the ISO data channel
    pub fn iso_data_channel(&self) -> IsoDataChannel {
        self.iso_data_channel.clone()
    }

    /// Get the dispatcher the transport runs on
    pub fn dispatcher(&self) -> Dispatcher {
        self.shared.dispatcher.clone()
    }

    /// Get the out of band features of the Controller
    pub fn get_driver_features(&self) -> DriverFeatures {
        self.shared.features
    }

    /// Set the callback fired on a fatal transport error
    ///
    /// The callback fires at most once, on the dispatcher.
    pub fn set_error_callback(&self, callback: impl FnOnce(TransportError) + 'static) {
        *self.shared.error_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Check if the transport has observed a fatal error
    pub fn is_down(&self) -> bool {
        self.shared.is_down()
    }

    /// Push a packet received from the Controller into the transport
    ///
    /// This is called by the driver glue with each complete inbound packet. Events route to the
    /// command channel's correlation and handler tables, data packets to their data channels.
    pub fn on_received_packet(&self, packet_type: HciPacketType, packet: &[u8]) {
        if self.shared.is_down() {
            return;
        }

        match packet_type {
            HciPacketType::Event => match EventsData::try_from_packet(packet) {
                Ok(EventsData::NumberOfCompletedPackets(completed)) => {
                    self.acl_data_channel.on_number_of_completed_packets(&completed);
                    self.sco_data_channel.on_number_of_completed_packets(&completed);
                    self.iso_data_channel.on_number_of_completed_packets(&completed);
                }
                Ok(data) => self.command_channel.on_event(&data),
                Err(error) => {
                    log::warn!("(HCI) dropping unparseable event: {}", error);
                }
            },
            HciPacketType::AclData => match HciAclData::try_from_packet(packet) {
                Ok(data) => self.acl_data_channel.on_inbound(data),
                Err(error) => {
                    log::warn!("(HCI) dropping unparseable ACL packet: {}", error);
                }
            },
            HciPacketType::ScoData => self.sco_data_channel.on_inbound(packet),
            HciPacketType::IsoData => self.iso_data_channel.on_inbound(packet),
            HciPacketType::Command => {
                log::warn!("(HCI) the controller sent a command packet to the host");

                self.shared.signal_error(TransportError::InvalidPacket);
            }
        }
    }
}

/// Test support
///
/// A [`ControllerDriver`] that records every outbound packet, for driving the transport from
/// tests without a Controller.
#[doc(hidden)]
pub mod testing {
    use super::{ControllerDriver, DriverFeatures, HciPacketType};
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    #[derive(Clone, Default)]
    pub struct RecordingDriver {
        pub sent: Rc<RefCell<Vec<(HciPacketType, Vec<u8>)>>>,
        pub features: DriverFeatures,
    }

    impl RecordingDriver {
        pub fn new() -> Self {
            Self::default()
        }

        /// Get the recorded command opcodes, in send order
        pub fn sent_command_opcodes(&self) -> Vec<u16> {
            self.sent
                .borrow()
                .iter()
                .filter(|(packet_type, _)| *packet_type == HciPacketType::Command)
                .map(|(_, packet)| u16::from_le_bytes([packet[0], packet[1]]))
                .collect()
        }
    }

    impl ControllerDriver for RecordingDriver {
        fn send_packet(&mut self, packet_type: HciPacketType, packet: &[u8]) {
            self.sent.borrow_mut().push((packet_type, packet.to_vec()));
        }

        fn get_features(&self) -> DriverFeatures {
            self.features
        }
    }

    /// Injects a generic success Command Complete for every recorded command
    ///
    /// Useful for tests that only care about what was sent; commands whose return parameter is
    /// actually parsed need a scripted controller instead.
    #[derive(Default)]
    pub struct CommandAcker {
        acked: usize,
    }

    impl CommandAcker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ack_all(&mut self, transport: &super::Transport, driver: &RecordingDriver) {
            loop {
                let opcode = driver
                    .sent
                    .borrow()
                    .iter()
                    .filter(|(packet_type, _)| *packet_type == HciPacketType::Command)
                    .nth(self.acked)
                    .map(|(_, packet)| u16::from_le_bytes([packet[0], packet[1]]));

                match opcode {
                    Some(opcode) => {
                        self.acked += 1;

                        let mut packet = alloc::vec![0x0E, 0x04, 0x01];

                        packet.extend_from_slice(&opcode.to_le_bytes());
                        packet.push(0x00);

                        transport.on_received_packet(HciPacketType::Event, &packet);
                    }
                    None => break,
                }
            }
        }
    }
}
