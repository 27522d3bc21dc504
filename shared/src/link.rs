/*!
Sensor-link packet codec.

Per frame the acquisition engine emits one Frame-Start marker, one Line
packet per row in increasing row order and one Frame-End marker:

```text
Frame-Start  BC 01 <frame u32 LE>
Line         BC 02 <row u16 LE> <cols x u16 LE pixels> <crc16 LE over pixels>
Frame-End    BC 03 <frame u32 LE>
```

Encoding is pure: the same row always yields the same bytes, so a software
trace can be compared byte-for-byte with a hardware capture.
*/

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::debug;

use crate::crc::crc16_ccitt;

/// First byte of every link packet
pub const LINK_SYNC: u8 = 0xBC;

/// Length of a Frame-Start / Frame-End marker
pub const MARKER_LEN: usize = 6;

/// Sync + kind + row index
pub const LINE_HEADER_LEN: usize = 4;

pub const CRC_LEN: usize = 2;

/// Packet kind byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkKind {
    FrameStart = 0x01,
    Line = 0x02,
    FrameEnd = 0x03,
}

impl LinkKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::FrameStart),
            0x02 => Some(Self::Line),
            0x03 => Some(Self::FrameEnd),
            _ => None,
        }
    }

    /// Total encoded length for this kind given the row payload size
    pub fn encoded_len(self, row_bytes: usize) -> usize {
        match self {
            Self::FrameStart | Self::FrameEnd => MARKER_LEN,
            Self::Line => LINE_HEADER_LEN + row_bytes + CRC_LEN,
        }
    }
}

/// One packet on the sensor link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPacket {
    FrameStart { frame_number: u32 },
    Line { row: u16, payload: Bytes, crc: u16 },
    FrameEnd { frame_number: u32 },
}

impl LinkPacket {
    /// Build a line packet from a row of pixels (zero-extended to 16 bits)
    pub fn line(row: u16, pixels: &[u16]) -> Self {
        let mut payload = BytesMut::with_capacity(pixels.len() * 2);
        for &pixel in pixels {
            payload.put_u16_le(pixel);
        }
        let payload = payload.freeze();
        let crc = crc16_ccitt(&payload);
        LinkPacket::Line { row, payload, crc }
    }

    pub fn kind(&self) -> LinkKind {
        match self {
            LinkPacket::FrameStart { .. } => LinkKind::FrameStart,
            LinkPacket::Line { .. } => LinkKind::Line,
            LinkPacket::FrameEnd { .. } => LinkKind::FrameEnd,
        }
    }

    /// Whether the trailing CRC matches the payload; markers always pass
    pub fn crc_ok(&self) -> bool {
        match self {
            LinkPacket::Line { payload, crc, .. } => crc16_ccitt(payload) == *crc,
            _ => true,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            LinkPacket::FrameStart { frame_number } | LinkPacket::FrameEnd { frame_number } => {
                let mut buf = BytesMut::with_capacity(MARKER_LEN);
                buf.put_u8(LINK_SYNC);
                buf.put_u8(self.kind() as u8);
                buf.put_u32_le(*frame_number);
                buf.freeze()
            }
            LinkPacket::Line { row, payload, crc } => {
                let mut buf = BytesMut::with_capacity(LINE_HEADER_LEN + payload.len() + CRC_LEN);
                buf.put_u8(LINK_SYNC);
                buf.put_u8(LinkKind::Line as u8);
                buf.put_u16_le(*row);
                buf.extend_from_slice(payload);
                buf.put_u16_le(*crc);
                buf.freeze()
            }
        }
    }
}

/// Link receiver statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub packets: u64,
    pub lines: u64,
    pub sync_errors: u64,
    pub crc_errors: u64,
}

/// Streaming decoder for the link byte stream
///
/// Bytes are appended as they arrive; complete packets are cut off the
/// front. Garbage before a sync byte is skipped and counted.
#[derive(Debug)]
pub struct LinkDecoder {
    buffer: BytesMut,
    row_bytes: usize,
    stats: LinkStats,
}

impl LinkDecoder {
    pub fn new(row_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(LinkKind::Line.encoded_len(row_bytes) * 2),
            row_bytes,
            stats: LinkStats::default(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Discard any partially received packet
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Cut the next complete packet off the buffer
    ///
    /// Line packets with a bad CRC are still returned; check
    /// [`LinkPacket::crc_ok`].
    pub fn next_packet(&mut self) -> Option<LinkPacket> {
        loop {
            let skip = self
                .buffer
                .iter()
                .position(|&b| b == LINK_SYNC)
                .unwrap_or(self.buffer.len());
            if skip > 0 {
                debug!("link resync: skipped {} bytes", skip);
                self.buffer.advance(skip);
                self.stats.sync_errors += 1;
            }

            if self.buffer.len() < 2 {
                return None;
            }

            let Some(kind) = LinkKind::from_u8(self.buffer[1]) else {
                // stray sync byte; the hunt that follows counts the error
                self.buffer.advance(1);
                continue;
            };

            let len = kind.encoded_len(self.row_bytes);
            if self.buffer.len() < len {
                return None;
            }

            let mut raw = self.buffer.split_to(len).freeze();
            raw.advance(2);
            self.stats.packets += 1;

            let packet = match kind {
                LinkKind::FrameStart => LinkPacket::FrameStart {
                    frame_number: raw.get_u32_le(),
                },
                LinkKind::FrameEnd => LinkPacket::FrameEnd {
                    frame_number: raw.get_u32_le(),
                },
                LinkKind::Line => {
                    let row = raw.get_u16_le();
                    let payload = raw.split_to(self.row_bytes);
                    let crc = raw.get_u16_le();
                    self.stats.lines += 1;
                    LinkPacket::Line { row, payload, crc }
                }
            };

            if !packet.crc_ok() {
                self.stats.crc_errors += 1;
            }
            return Some(packet);
        }
    }
}
