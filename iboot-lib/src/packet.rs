//! Wire format of the firmware transfer protocol.
//!
//! Every packet opens with the proprietary command code and a type tag.
//! Types other than START carry a 16-bit little-endian sequence number;
//! DATA packets additionally carry up to 32 payload bytes and a trailing
//! little-endian XMODEM CRC-16 over everything before it.

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::constants::{COMMAND_FIRMWARE_TRANSFER, DATA_CHUNK_SIZE};
use crate::crc::crc16;
use crate::error::UpdateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Start = 0,
    Data = 2,
    DataRequest = 3,
    Done = 6,
    CrcError = 7,

    #[num_enum(catch_all)]
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Start,
    Data { seq: u16, payload: Bytes },
    DataRequest { seq: u16 },
    Done { seq: u16 },
    CrcError { seq: u16 },
    /// A well-framed packet whose type we do not understand.
    Unknown { packet_type: u8, seq: u16 },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Start => PacketType::Start,
            Packet::Data { .. } => PacketType::Data,
            Packet::DataRequest { .. } => PacketType::DataRequest,
            Packet::Done { .. } => PacketType::Done,
            Packet::CrcError { .. } => PacketType::CrcError,
            Packet::Unknown { packet_type, .. } => PacketType::from_primitive(*packet_type),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + DATA_CHUNK_SIZE + 2);
        buf.put_u8(COMMAND_FIRMWARE_TRANSFER);
        match self {
            Packet::Start => buf.put_u8(PacketType::Start.into()),
            Packet::Data { seq, payload } => {
                debug_assert!(!payload.is_empty() && payload.len() <= DATA_CHUNK_SIZE);
                buf.put_u8(PacketType::Data.into());
                buf.put_u16_le(*seq);
                buf.put_slice(payload);
                let crc = crc16(&buf);
                buf.put_u16_le(crc);
            }
            Packet::DataRequest { seq } => {
                buf.put_u8(PacketType::DataRequest.into());
                buf.put_u16_le(*seq);
            }
            Packet::Done { seq } => {
                buf.put_u8(PacketType::Done.into());
                buf.put_u16_le(*seq);
            }
            Packet::CrcError { seq } => {
                buf.put_u8(PacketType::CrcError.into());
                buf.put_u16_le(*seq);
            }
            Packet::Unknown { packet_type, seq } => {
                buf.put_u8(*packet_type);
                buf.put_u16_le(*seq);
            }
        }
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, UpdateError> {
        if bytes.len() < 2 {
            return Err(UpdateError::Framing(format!(
                "packet of {} bytes is too short",
                bytes.len()
            )));
        }
        if bytes[0] != COMMAND_FIRMWARE_TRANSFER {
            return Err(UpdateError::Framing(format!(
                "unexpected command byte 0x{:02X}",
                bytes[0]
            )));
        }

        let packet_type = PacketType::from_primitive(bytes[1]);
        if packet_type == PacketType::Start {
            return Ok(Packet::Start);
        }

        if bytes.len() < 4 {
            return Err(UpdateError::Framing(format!(
                "{packet_type:?} packet of {} bytes is too short",
                bytes.len()
            )));
        }
        let seq = u16::from_le_bytes([bytes[2], bytes[3]]);

        match packet_type {
            PacketType::Data => {
                if bytes.len() < 6 {
                    return Err(UpdateError::Framing("DATA packet has no checksum".into()));
                }
                let payload = &bytes[4..bytes.len() - 2];
                if payload.len() > DATA_CHUNK_SIZE {
                    return Err(UpdateError::Framing(format!(
                        "DATA payload of {} bytes exceeds the {DATA_CHUNK_SIZE}-byte window",
                        payload.len()
                    )));
                }
                let trailer =
                    u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
                let computed = crc16(&bytes[..bytes.len() - 2]);
                if trailer != computed {
                    return Err(UpdateError::Framing(format!(
                        "DATA checksum mismatch: packet carries 0x{trailer:04X}, computed 0x{computed:04X}"
                    )));
                }
                Ok(Packet::Data {
                    seq,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            PacketType::DataRequest => Ok(Packet::DataRequest { seq }),
            PacketType::Done => Ok(Packet::Done { seq }),
            PacketType::CrcError => Ok(Packet::CrcError { seq }),
            PacketType::Start => unreachable!("handled above"),
            PacketType::Unknown(tag) => Ok(Packet::Unknown {
                packet_type: tag,
                seq,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_two_bytes() {
        assert_eq!(&Packet::Start.encode()[..], &[42, 0]);
    }

    #[test]
    fn data_packet_layout_and_crc() {
        let payload = Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let encoded = Packet::Data {
            seq: 0x0102,
            payload: payload.clone(),
        }
        .encode();

        assert_eq!(&encoded[..4], &[42, 2, 0x02, 0x01]);
        assert_eq!(&encoded[4..8], &payload[..]);
        let trailer = u16::from_le_bytes([encoded[8], encoded[9]]);
        assert_eq!(trailer, crc16(&encoded[..8]));

        match Packet::decode(&encoded).unwrap() {
            Packet::Data { seq, payload: p } => {
                assert_eq!(seq, 0x0102);
                assert_eq!(p, payload);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn data_packet_with_corrupt_crc_is_rejected() {
        let mut encoded = Packet::Data {
            seq: 7,
            payload: Bytes::from_static(&[1, 2, 3]),
        }
        .encode()
        .to_vec();
        encoded[5] ^= 0x40;
        assert!(matches!(
            Packet::decode(&encoded),
            Err(UpdateError::Framing(_))
        ));
    }

    #[test]
    fn control_packets_round_trip() {
        for packet in [
            Packet::DataRequest { seq: 0 },
            Packet::DataRequest { seq: 3711 },
            Packet::Done { seq: 3712 },
            Packet::CrcError { seq: 17 },
        ] {
            assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn foreign_and_short_replies_are_rejected() {
        assert!(Packet::decode(&[]).is_err());
        assert!(Packet::decode(&[42]).is_err());
        assert!(Packet::decode(&[41, 3, 0, 0]).is_err());
        assert!(Packet::decode(&[42, 3, 0]).is_err());
    }

    #[test]
    fn unknown_type_with_valid_framing_decodes() {
        match Packet::decode(&[42, 9, 0x34, 0x12]).unwrap() {
            Packet::Unknown { packet_type, seq } => {
                assert_eq!(packet_type, 9);
                assert_eq!(seq, 0x1234);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
