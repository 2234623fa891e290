//! Wire framing: fixed header, big-endian codec, and the per-command payloads.

pub mod header;
pub mod packet;
pub mod serializer;

pub use header::{Command, Header, HEADER_SIZE, MAGIC};
pub use packet::Packet;
pub use serializer::{Reader, ReaderError, Serializer, Writer};

/// Frame a fully-built packet as `{header}{payload}` ready to write to a channel.
pub fn encode(packet: &Packet) -> bytes::BytesMut {
    let payload_len = packet.encoded_len();
    let header = Header::new(packet.command(), payload_len as u16);
    let mut writer = Writer::new();
    header.write(&mut writer);
    packet.write_payload(&mut writer);
    writer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::packet::{Barrier, BarrierAck, HandShake};

    #[test]
    fn handshake_is_exactly_80_bytes() {
        let hs = HandShake::new(1, 3, 0xdead_beef, 0);
        assert_eq!(hs.encoded_len(), 80);
    }

    #[test]
    fn barrier_ack_round_trips_through_a_frame() {
        let packet = Packet::BarrierAck(BarrierAck {
            epoch: 7,
            set_size: 42,
        });
        let framed = encode(&packet);
        let header = Header::read(&mut Reader::new(&framed[..HEADER_SIZE])).unwrap();
        assert_eq!(header.command, Command::BarrierAck);
        let decoded = Packet::decode(header.command, &framed[HEADER_SIZE..]).unwrap();
        match decoded {
            Packet::BarrierAck(ack) => {
                assert_eq!(ack.epoch, 7);
                assert_eq!(ack.set_size, 42);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn barrier_round_trips() {
        let original = Barrier { epoch: 99 };
        let bytes = original.to_bytes();
        let decoded = Barrier::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.epoch, 99);
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(Command::from_u16(255).is_err());
    }
}
