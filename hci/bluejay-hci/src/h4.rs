//! H4 (UART) transport framing
//!
//! UART is one of the transports within the Bluetooth Specification. HCI packets are transferred
//! over it with a one byte packet indicator prepended to each packet, since the packets
//! themselves carry no type information. [`encode`] frames an outbound packet;
//! [`PacketDecoder`] incrementally parses the inbound byte stream, tolerating arbitrary read
//! boundaries.
//!
//! An invalid packet indicator means the byte stream has lost synchronization, which is
//! unrecoverable for this transport.

use crate::transport::HciPacketType;
use alloc::vec::Vec;
use core::fmt;

/// Error for an invalid packet indicator byte
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InvalidPacketIndicator(pub u8);

impl fmt::Debug for InvalidPacketIndicator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid packet indicator {}", self.0)
    }
}

impl fmt::Display for InvalidPacketIndicator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid packet indicator {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InvalidPacketIndicator {}

/// Frame an outbound packet with its indicator
pub fn encode(packet_type: HciPacketType, packet: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(1 + packet.len());

    framed.push(packet_type.get_indicator());

    framed.extend_from_slice(packet);

    framed
}

/// Get the header size and the payload length for a buffered header
///
/// Returns `None` until enough of the header has been buffered to know the payload length.
fn payload_length(packet_type: HciPacketType, header: &[u8]) -> Option<(usize, usize)> {
    match packet_type {
        HciPacketType::Command => (header.len() >= 3).then(|| (3, header[2] as usize)),
        HciPacketType::AclData => {
            (header.len() >= 4).then(|| (4, u16::from_le_bytes([header[2], header[3]]) as usize))
        }
        HciPacketType::ScoData => (header.len() >= 3).then(|| (3, header[2] as usize)),
        HciPacketType::Event => (header.len() >= 2).then(|| (2, header[1] as usize)),
        HciPacketType::IsoData => (header.len() >= 4).then(|| {
            (4, (u16::from_le_bytes([header[2], header[3]]) & 0x3FFF) as usize)
        }),
    }
}

enum DecodeState {
    Indicator,
    Packet {
        packet_type: HciPacketType,
        /// Total packet size once the header is complete
        known_size: Option<usize>,
    },
}

/// Incremental H4 packet decoder
pub struct PacketDecoder {
    state: DecodeState,
    buffer: Vec<u8>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        PacketDecoder {
            state: DecodeState::Indicator,
            buffer: Vec::new(),
        }
    }

    /// Feed received bytes to the decoder
    ///
    /// `deliver` is invoked once per completed packet with the packet type and the packet bytes
    /// (indicator stripped).
    pub fn decode(
        &mut self,
        mut bytes: &[u8],
        mut deliver: impl FnMut(HciPacketType, &[u8]),
    ) -> Result<(), InvalidPacketIndicator> {
        while !bytes.is_empty() {
            match self.state {
                DecodeState::Indicator => {
                    let indicator = bytes[0];

                    bytes = &bytes[1..];

                    let packet_type = HciPacketType::try_from_indicator(indicator)
                        .map_err(InvalidPacketIndicator)?;

                    self.state = DecodeState::Packet {
                        packet_type,
                        known_size: None,
                    };

                    self.buffer.clear();
                }
                DecodeState::Packet {
                    packet_type,
                    ref mut known_size,
                } => {
                    if known_size.is_none() {
                        // buffer byte by byte until the header reveals the payload length
                        self.buffer.push(bytes[0]);

                        bytes = &bytes[1..];

                        *known_size = payload_length(packet_type, &self.buffer)
                            .map(|(header_size, payload)| header_size + payload);
                    } else {
                        let size = known_size.unwrap();

                        let wanted = size - self.buffer.len();
                        let taking = wanted.min(bytes.len());

                        self.buffer.extend_from_slice(&bytes[..taking]);

                        bytes = &bytes[taking..];
                    }

                    if Some(self.buffer.len()) == *known_size {
                        deliver(packet_type, &self.buffer);

                        self.state = DecodeState::Indicator;
                    }
                }
            }
        }

        Ok(())
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        PacketDecoder::new()
    }
}

/// The tokio bound H4 driver
///
/// [`H4Driver`] is the [`ControllerDriver`] half handed to the [`Transport`]; [`H4DriverPump`]
/// is the async task moving bytes between the driver and an `AsyncRead + AsyncWrite` stream.
/// Both sides must run on the same thread as the dispatcher (a current thread runtime with a
/// `LocalSet`).
///
/// [`ControllerDriver`]: crate::transport::ControllerDriver
/// [`Transport`]: crate::transport::Transport
#[cfg(feature = "tokio")]
pub mod driver {
    use super::{encode, PacketDecoder};
    use crate::transport::{ControllerDriver, DriverFeatures, HciPacketType, Transport};
    use alloc::vec::Vec;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Create the driver pair
    pub fn new_h4_driver(features: DriverFeatures) -> (H4Driver, H4DriverPump) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        (H4Driver { tx, features }, H4DriverPump { rx })
    }

    /// The sending half registered with the transport
    pub struct H4Driver {
        tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
        features: DriverFeatures,
    }

    impl ControllerDriver for H4Driver {
        fn send_packet(&mut self, packet_type: HciPacketType, packet: &[u8]) {
            // a closed pump is equivalent to a dead controller; the command timeout reports it
            let _ = self.tx.send(encode(packet_type, packet));
        }

        fn get_features(&self) -> DriverFeatures {
            self.features
        }
    }

    /// The async task binding the driver to the byte stream
    pub struct H4DriverPump {
        rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    }

    impl H4DriverPump {
        /// Run until the stream closes or the frame synchronization is lost
        pub async fn run<T>(mut self, io: T, transport: &Transport) -> std::io::Result<()>
        where
            T: AsyncRead + AsyncWrite + Unpin,
        {
            let (mut reader, mut writer) = tokio::io::split(io);

            let mut decoder = PacketDecoder::new();
            let mut read_buffer = [0u8; 1024];

            loop {
                tokio::select! {
                    outbound = self.rx.recv() => match outbound {
                        Some(bytes) => writer.write_all(&bytes).await?,
                        None => return Ok(()),
                    },
                    read = reader.read(&mut read_buffer) => {
                        let amount = read?;

                        if amount == 0 {
                            return Ok(());
                        }

                        decoder
                            .decode(&read_buffer[..amount], |packet_type, packet| {
                                transport.on_received_packet(packet_type, packet)
                            })
                            .map_err(|error| {
                                std::io::Error::new(std::io::ErrorKind::InvalidData, error)
                            })?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_across_arbitrary_boundaries() {
        // an event packet followed by an ACL packet
        let mut stream = encode(HciPacketType::Event, &[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);

        stream.extend_from_slice(&encode(
            HciPacketType::AclData,
            &[0x42, 0x00, 0x02, 0x00, 0xAA, 0xBB],
        ));

        // feed one byte at a time
        let mut decoder = PacketDecoder::new();
        let mut packets = Vec::new();

        for byte in &stream {
            decoder
                .decode(core::slice::from_ref(byte), |packet_type, packet| {
                    packets.push((packet_type, packet.to_vec()))
                })
                .unwrap();
        }

        assert_eq!(2, packets.len());
        assert_eq!(HciPacketType::Event, packets[0].0);
        assert_eq!(6, packets[0].1.len());
        assert_eq!(HciPacketType::AclData, packets[1].0);
        assert_eq!(6, packets[1].1.len());

        // and all at once
        let mut decoder = PacketDecoder::new();
        let mut all_at_once = Vec::new();

        decoder
            .decode(&stream, |packet_type, packet| {
                all_at_once.push((packet_type, packet.to_vec()))
            })
            .unwrap();

        assert_eq!(packets, all_at_once);
    }

    #[test]
    fn invalid_indicator_is_fatal() {
        let mut decoder = PacketDecoder::new();

        assert_eq!(
            Err(InvalidPacketIndicator(0x09)),
            decoder.decode(&[0x09], |_, _| ())
        );
    }

    #[test]
    fn zero_length_event_parameter() {
        let mut decoder = PacketDecoder::new();
        let mut delivered = 0;

        decoder
            .decode(&encode(HciPacketType::Event, &[0x13, 0x00]), |_, packet| {
                assert_eq!(2, packet.len());

                delivered += 1;
            })
            .unwrap();

        assert_eq!(1, delivered);
    }
}
