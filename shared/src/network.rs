/*!
Network packet codec.

Every packet is a fixed 26-byte little-endian header followed by at most
`max_payload` bytes:

| offset | size | field |
|---|---|---|
| 0 | 4 | magic `0x4E514341` ("ACQN") |
| 4 | 2 | flags (FIRST, LAST, DROP) |
| 6 | 4 | frame number |
| 10 | 4 | fragment index |
| 14 | 2 | payload length |
| 16 | 8 | timestamp, ns |
| 24 | 2 | CRC-16 over header (this field zeroed) and payload |
*/

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crc::Crc16;
use crate::error::{ProtocolError, Result};

pub const NET_MAGIC: u32 = 0x4E51_4341;

pub const HEADER_LEN: usize = 26;

/// Offset of the CRC field inside the header
pub const CRC_OFFSET: usize = 24;

pub const DEFAULT_MAX_PAYLOAD: usize = 8192;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u16 {
        const FIRST = 1 << 0;
        const LAST = 1 << 1;
        /// Sender abandoned this frame
        const DROP = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkHeader {
    pub flags: PacketFlags,
    pub frame_number: u32,
    pub fragment_index: u32,
    pub payload_len: u16,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPacket {
    pub header: NetworkHeader,
    pub payload: Bytes,
}

impl NetworkPacket {
    /// A data fragment; FIRST is derived from the index, LAST is the caller's call
    pub fn data(frame_number: u32, fragment_index: u32, last: bool, payload: Bytes, timestamp_ns: u64) -> Self {
        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::FIRST, fragment_index == 0);
        flags.set(PacketFlags::LAST, last);
        Self {
            header: NetworkHeader {
                flags,
                frame_number,
                fragment_index,
                payload_len: payload.len() as u16,
                timestamp_ns,
            },
            payload,
        }
    }

    /// Zero-payload notice that the sender abandoned `frame_number`
    pub fn drop_notice(frame_number: u32, timestamp_ns: u64) -> Self {
        Self {
            header: NetworkHeader {
                flags: PacketFlags::FIRST | PacketFlags::LAST | PacketFlags::DROP,
                frame_number,
                fragment_index: 0,
                payload_len: 0,
                timestamp_ns,
            },
            payload: Bytes::new(),
        }
    }

    pub fn is_drop(&self) -> bool {
        self.header.flags.contains(PacketFlags::DROP)
    }

    pub fn is_last(&self) -> bool {
        self.header.flags.contains(PacketFlags::LAST)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32_le(NET_MAGIC);
        buf.put_u16_le(self.header.flags.bits());
        buf.put_u32_le(self.header.frame_number);
        buf.put_u32_le(self.header.fragment_index);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u64_le(self.header.timestamp_ns);
        buf.put_u16_le(0);
        buf.extend_from_slice(&self.payload);

        let crc = packet_crc(&buf[..CRC_OFFSET], &buf[HEADER_LEN..]);
        buf[CRC_OFFSET..HEADER_LEN].copy_from_slice(&crc.to_le_bytes());
        buf.freeze()
    }

    /// Parse and validate a datagram
    pub fn decode(mut datagram: Bytes, max_payload: usize) -> Result<Self> {
        if datagram.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                got: datagram.len(),
            });
        }

        let computed = packet_crc(&datagram[..CRC_OFFSET], &datagram[HEADER_LEN..]);

        let magic = datagram.get_u32_le();
        if magic != NET_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let raw_flags = datagram.get_u16_le();
        let frame_number = datagram.get_u32_le();
        let fragment_index = datagram.get_u32_le();
        let payload_len = datagram.get_u16_le();
        let timestamp_ns = datagram.get_u64_le();
        let expected = datagram.get_u16_le();

        if payload_len as usize > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload_len as usize,
                max: max_payload,
            });
        }
        if datagram.len() != payload_len as usize {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN + payload_len as usize,
                got: HEADER_LEN + datagram.len(),
            });
        }
        if computed != expected {
            return Err(ProtocolError::CrcMismatch { expected, computed });
        }

        let flags = PacketFlags::from_bits(raw_flags)
            .ok_or_else(|| ProtocolError::malformed(format!("unknown flag bits 0x{:04X}", raw_flags)))?;
        if flags.contains(PacketFlags::FIRST) != (fragment_index == 0) {
            return Err(ProtocolError::malformed("FIRST flag disagrees with fragment index"));
        }
        if flags.contains(PacketFlags::DROP) && payload_len != 0 {
            return Err(ProtocolError::malformed("drop notice carries a payload"));
        }

        Ok(Self {
            header: NetworkHeader {
                flags,
                frame_number,
                fragment_index,
                payload_len,
                timestamp_ns,
            },
            payload: datagram,
        })
    }
}

/// CRC over the header prefix, a zeroed CRC field, and the payload
fn packet_crc(header_prefix: &[u8], payload: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(header_prefix);
    crc.update(&[0, 0]);
    crc.update(payload);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16_ccitt;

    fn sample() -> NetworkPacket {
        NetworkPacket::data(0x0A0B0C0D, 3, true, Bytes::from_static(&[1, 2, 3, 4, 5]), 123_456_789)
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().encode();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        assert_eq!(&bytes[0..4], b"ACQN");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), PacketFlags::LAST.bits());
        assert_eq!(&bytes[6..10], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&bytes[10..14], &[3, 0, 0, 0]);
        assert_eq!(&bytes[14..16], &[5, 0]);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 123_456_789);

        let mut zeroed = bytes.to_vec();
        zeroed[24] = 0;
        zeroed[25] = 0;
        let crc = crc16_ccitt(&zeroed);
        assert_eq!(&bytes[24..26], &crc.to_le_bytes());
    }

    #[test]
    fn test_decode_accepts_valid_packet() {
        let packet = sample();
        let decoded = NetworkPacket::decode(packet.encode(), DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.is_last());
    }

    #[test]
    fn test_corruption_rejected() {
        let mut raw = sample().encode().to_vec();
        raw[HEADER_LEN + 2] ^= 0x80;
        let err = NetworkPacket::decode(Bytes::from(raw), DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, ProtocolError::CrcMismatch { .. }));
    }

    #[test]
    fn test_truncated_and_oversized_rejected() {
        let raw = sample().encode();
        assert!(matches!(
            NetworkPacket::decode(raw.slice(..10), DEFAULT_MAX_PAYLOAD),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(
            NetworkPacket::decode(raw.slice(..raw.len() - 1), DEFAULT_MAX_PAYLOAD),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(
            NetworkPacket::decode(raw, 4),
            Err(ProtocolError::PayloadTooLarge { len: 5, max: 4 })
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut raw = sample().encode().to_vec();
        raw[0] = b'X';
        assert!(matches!(
            NetworkPacket::decode(Bytes::from(raw), DEFAULT_MAX_PAYLOAD),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn test_drop_notice() {
        let notice = NetworkPacket::drop_notice(77, 0);
        let decoded = NetworkPacket::decode(notice.encode(), DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(decoded.is_drop());
        assert!(decoded.is_last());
        assert_eq!(decoded.header.frame_number, 77);
        assert!(decoded.payload.is_empty());
    }
}
